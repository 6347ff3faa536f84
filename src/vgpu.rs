use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    labels::{self, Labels},
    pci::{PciDevice, PciError, PciProvider, capability::find_vendor_capability},
};

// Offset of the first vGPU sub-record inside the vendor capability
pub const VGPU_CAPABILITY_RECORD_START: usize = 5;

// Fixed width of the NUL padded host driver fields
pub const HOST_DRIVER_VERSION_LENGTH: usize = 10;
pub const HOST_DRIVER_BRANCH_LENGTH: usize = 10;

// Sub-record type holding the host driver version and branch
const HOST_DRIVER_RECORD: u8 = 0;

// Signature bytes of a vGPU vendor capability ("VF")
const VGPU_SIGNATURE_OFFSET: usize = 3;
const VGPU_SIGNATURE: [u8; 2] = [0x56, 0x46];

#[derive(Debug, Error)]
pub enum VgpuError {
    #[error("cannot find driver version record in vendor specific capability")]
    DriverInfoNotFound,
    #[error("vGPU device {address} has no host driver info")]
    MissingDriverInfo { address: String },
    #[error(transparent)]
    Pci(#[from] PciError),
}

// Driver of the vGPU manager running on the hypervisor host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDriverInfo {
    pub version: String,
    pub branch: String,
}

// Check the vGPU signature of a vendor specific capability
pub fn is_vgpu(capability: &[u8]) -> bool {
    if capability.len() < VGPU_SIGNATURE_OFFSET + VGPU_SIGNATURE.len() {
        return false;
    }

    capability[VGPU_SIGNATURE_OFFSET..VGPU_SIGNATURE_OFFSET + VGPU_SIGNATURE.len()]
        == VGPU_SIGNATURE
}

/// Extract the host driver version and branch from a vGPU capability.
///
/// The capability embeds its own chain of `{type, length, data}` sub-records
/// starting at [`VGPU_CAPABILITY_RECORD_START`]. The walk stops at the first
/// record of type 0, whose data holds two NUL padded fixed width fields.
pub fn parse_host_driver_info(capability: &[u8]) -> Result<HostDriverInfo, VgpuError> {
    let mut pos = VGPU_CAPABILITY_RECORD_START;

    loop {
        let Some(&record) = capability.get(pos) else {
            return Err(VgpuError::DriverInfoNotFound);
        };

        if record == HOST_DRIVER_RECORD {
            break;
        }

        // A zero length would never move the cursor
        match capability.get(pos + 1) {
            Some(&length) if length != 0 => pos += length as usize,
            _ => return Err(VgpuError::DriverInfoNotFound),
        }
    }

    let version_start = pos + 2;
    let branch_start = version_start + HOST_DRIVER_VERSION_LENGTH;
    let branch_end = branch_start + HOST_DRIVER_BRANCH_LENGTH;

    if branch_end > capability.len() {
        return Err(VgpuError::DriverInfoNotFound);
    }

    Ok(HostDriverInfo {
        version: trim_nul(&capability[version_start..branch_start]),
        branch: trim_nul(&capability[branch_start..branch_end]),
    })
}

fn trim_nul(field: &[u8]) -> String {
    let end = field
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);

    String::from_utf8_lossy(&field[..end]).to_string()
}

// A PCI device whose vendor capability carries the vGPU signature
#[derive(Debug, Clone)]
pub struct VgpuDevice {
    pub pci: PciDevice,
    pub capability: Vec<u8>,
}

impl VgpuDevice {
    pub fn host_driver_info(&self) -> Result<HostDriverInfo, VgpuError> {
        parse_host_driver_info(&self.capability).map_err(|_| VgpuError::MissingDriverInfo {
            address: self.pci.address.clone(),
        })
    }
}

// Produce the vgpu.* labels from the PCI devices of a provider
pub struct VgpuLabeler<P: PciProvider> {
    pci: P,
}

impl<P: PciProvider> VgpuLabeler<P> {
    pub fn new(pci: P) -> Self {
        Self { pci }
    }

    // Read and classify a single PCI device
    fn classify(&self, device: &PciDevice) -> Result<Option<VgpuDevice>, VgpuError> {
        let config = self.pci.read_config(device)?;

        let Some(capability) = find_vendor_capability(&config)? else {
            debug!("No vendor capability on {}", device.address);
            return Ok(None);
        };

        if !is_vgpu(capability.data) {
            return Ok(None);
        }

        info!("Found vGPU device {}", device.address);

        Ok(Some(VgpuDevice {
            pci: device.clone(),
            capability: capability.data.to_vec(),
        }))
    }

    /// Enumerate the vGPU devices attached to the guest.
    ///
    /// Failing to enumerate the bus is an error. A device that cannot be
    /// read or whose capability chain is corrupt is logged and skipped.
    pub fn devices(&self) -> Result<Vec<VgpuDevice>, VgpuError> {
        let mut vgpus = Vec::new();

        for device in self.pci.nvidia_devices()? {
            match self.classify(&device) {
                Ok(Some(vgpu)) => vgpus.push(vgpu),
                Ok(None) => {}
                Err(e) => warn!("Unable to classify PCI device {}: {e}", device.address),
            }
        }

        Ok(vgpus)
    }

    /// Produce the vGPU labels.
    ///
    /// A vGPU device always carries its host driver info, so a device
    /// without a readable driver record fails the whole vGPU source.
    pub fn labels(&self) -> Result<Labels, VgpuError> {
        let devices = self.devices()?;
        let mut labels = Labels::new();

        if devices.is_empty() {
            return Ok(labels);
        }

        info!("Found {} vGPU devices", devices.len());
        labels.insert(labels::key("vgpu.present"), true);

        for device in devices.iter() {
            let driver = device.host_driver_info()?;

            debug!(
                "Host driver version {} and branch {} for {}",
                driver.version, driver.branch, device.pci.address
            );
            labels.insert(labels::key("vgpu.host-driver-version"), driver.version);
            labels.insert(labels::key("vgpu.host-driver-branch"), driver.branch);
        }

        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use test_log::test;

    use super::*;
    use crate::pci::{
        NVIDIA_VENDOR_ID, SysfsPci,
        capability::{PCI_CAPABILITY_ID_VENDOR, tests::config_space},
        tests::add_device,
    };

    fn padded(value: &str, width: usize) -> Vec<u8> {
        let mut field = value.as_bytes().to_vec();
        field.resize(width, 0);
        field
    }

    // Body of a vendor capability (after id, next and length)
    // with the vGPU signature and a list of extra sub-records
    // placed before the driver info record
    fn vgpu_body(extra: &[(u8, Vec<u8>)], version: &str, branch: &str) -> Vec<u8> {
        let mut body = b"VF".to_vec();

        for (kind, data) in extra {
            body.push(*kind);
            body.push((data.len() + 2) as u8);
            body.extend_from_slice(data);
        }

        body.push(HOST_DRIVER_RECORD);
        body.push((2 + HOST_DRIVER_VERSION_LENGTH + HOST_DRIVER_BRANCH_LENGTH) as u8);
        body.extend(padded(version, HOST_DRIVER_VERSION_LENGTH));
        body.extend(padded(branch, HOST_DRIVER_BRANCH_LENGTH));
        body
    }

    // Whole capability record, header included
    fn capability(body: Vec<u8>) -> Vec<u8> {
        let mut record = vec![PCI_CAPABILITY_ID_VENDOR, 0, (body.len() + 3) as u8];
        record.extend(body);
        record
    }

    #[test]
    fn signature_check() {
        assert!(is_vgpu(b"\x09\x00\x05VF"));
        assert!(!is_vgpu(b"\x09\x00\x05VX"));
        assert!(!is_vgpu(b"\x09\x00\x05FV"));
        assert!(!is_vgpu(b"\x09\x00\x05V"));
        assert!(!is_vgpu(&[]));
    }

    #[test]
    fn parses_nul_padded_driver_info() {
        let cap = capability(vgpu_body(&[], "460.16", "r460_00"));

        let info = parse_host_driver_info(&cap).unwrap();

        assert_eq!(info.version, "460.16");
        assert_eq!(info.branch, "r460_00");
    }

    #[test]
    fn skips_sub_records_before_driver_info() {
        let cap = capability(vgpu_body(
            &[(0x01, vec![0xaa; 4]), (0x02, vec![])],
            "470.42.01",
            "r470_14",
        ));

        let info = parse_host_driver_info(&cap).unwrap();

        assert_eq!(
            info,
            HostDriverInfo {
                version: "470.42.01".to_string(),
                branch: "r470_14".to_string(),
            }
        );
    }

    #[test]
    fn truncated_driver_info_is_an_error() {
        let mut cap = capability(vgpu_body(&[], "460.16", "r460_00"));
        cap.truncate(cap.len() - 1);

        assert!(matches!(
            parse_host_driver_info(&cap),
            Err(VgpuError::DriverInfoNotFound)
        ));
    }

    #[test]
    fn missing_driver_record_is_an_error() {
        // Only a type 1 sub-record that runs to the end of the buffer
        let mut cap = capability(b"VF".to_vec());
        cap.extend([0x01, 0x04, 0xaa, 0xbb]);

        assert!(matches!(
            parse_host_driver_info(&cap),
            Err(VgpuError::DriverInfoNotFound)
        ));
    }

    #[test]
    fn zero_length_sub_record_terminates() {
        let mut cap = capability(b"VF".to_vec());
        cap.extend([0x01, 0x00, 0x00, 0x00]);

        assert!(matches!(
            parse_host_driver_info(&cap),
            Err(VgpuError::DriverInfoNotFound)
        ));
    }

    fn fake_sysfs(devices: &[(&str, Option<Vec<u8>>)]) -> TempDir {
        let root = TempDir::new().unwrap();

        for (address, body) in devices {
            let config = match body {
                Some(body) => config_space(&[
                    (0x40, 0x01, 0x68, vec![0; 5]),
                    (0x68, PCI_CAPABILITY_ID_VENDOR, 0x00, body.clone()),
                ]),
                None => config_space(&[(0x40, 0x01, 0x00, vec![0; 5])]),
            };
            add_device(root.path(), address, NVIDIA_VENDOR_ID, Some(config.as_slice()));
        }

        root
    }

    #[test]
    fn labels_from_vgpu_device() {
        let root = fake_sysfs(&[
            ("0000:00:04.0", None),
            ("0000:00:05.0", Some(vgpu_body(&[], "460.16", "r460_00"))),
        ]);

        let labeler = VgpuLabeler::new(SysfsPci::new(root.path()));

        let devices = labeler.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].pci.address, "0000:00:05.0");

        let labels = labeler.labels().unwrap();
        assert_eq!(labels.get("nvidia.com/vgpu.present"), Some("true"));
        assert_eq!(labels.get("nvidia.com/vgpu.host-driver-version"), Some("460.16"));
        assert_eq!(labels.get("nvidia.com/vgpu.host-driver-branch"), Some("r460_00"));
    }

    #[test]
    fn no_vgpu_device_yields_no_labels() {
        let root = fake_sysfs(&[("0000:00:04.0", None), ("0000:00:05.0", Some(b"XX".to_vec()))]);

        let labeler = VgpuLabeler::new(SysfsPci::new(root.path()));

        assert!(labeler.labels().unwrap().is_empty());
    }

    #[test]
    fn unreadable_device_is_skipped() {
        let root = fake_sysfs(&[("0000:00:05.0", Some(vgpu_body(&[], "460.16", "r460_00")))]);

        // A device with a truncated configuration space
        add_device(root.path(), "0000:00:03.0", NVIDIA_VENDOR_ID, Some(&[0u8; 64][..]));

        let labeler = VgpuLabeler::new(SysfsPci::new(root.path()));

        let devices = labeler.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].pci.address, "0000:00:05.0");
    }

    #[test]
    fn vgpu_without_driver_info_fails() {
        let root = fake_sysfs(&[
            ("0000:00:04.0", Some(vgpu_body(&[], "460.16", "r460_00"))),
            ("0000:00:05.0", Some(b"VF".to_vec())),
        ]);

        let labeler = VgpuLabeler::new(SysfsPci::new(root.path()));

        // Both devices are still classified
        assert_eq!(labeler.devices().unwrap().len(), 2);

        let err = labeler.labels().unwrap_err();
        assert!(matches!(
            err,
            VgpuError::MissingDriverInfo { ref address } if address == "0000:00:05.0"
        ));
        assert_eq!(err.to_string(), "vGPU device 0000:00:05.0 has no host driver info");
    }

    #[test]
    fn missing_pci_bus_fails() {
        let root = TempDir::new().unwrap();
        let labeler = VgpuLabeler::new(SysfsPci::new(&root.path().join("missing")));

        assert!(matches!(labeler.labels(), Err(VgpuError::Pci(_))));
    }
}
