use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, trace};

pub mod capability;

// Base path of all the PCI devices under sysfs
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

// PCI vendor id of NVIDIA, as written in the sysfs "vendor" file
pub const NVIDIA_VENDOR_ID: &str = "0x10de";

#[derive(Debug, Error)]
pub enum PciError {
    #[error(
        "PCI configuration space is only {len} bytes long, run with enough \
         privileges to read the complete configuration data"
    )]
    ConfigTooShort { len: usize },
    #[error("corrupt capability record at offset {offset:#04x} (length {length})")]
    CorruptCapabilityRecord { offset: u8, length: u8 },
    #[error("unable to read {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    // Bus address, e.g. "0000:0b:00.0"
    pub address: String,
    pub path: PathBuf,
}

// Source of NVIDIA PCI devices and of their raw configuration space
pub trait PciProvider {
    // Enumerate the PCI devices with the NVIDIA vendor id
    fn nvidia_devices(&self) -> Result<Vec<PciDevice>, PciError>;

    // Read the configuration space of the given device
    fn read_config(&self, device: &PciDevice) -> Result<Vec<u8>, PciError>;
}

// PCI provider backed by the sysfs PCI tree
#[derive(Debug, Clone)]
pub struct SysfsPci {
    root: PathBuf,
}

impl SysfsPci {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn read_attribute(path: &Path, attr: &str) -> Result<String, PciError> {
        let path = path.join(attr);

        fs::read_to_string(&path)
            .map(|value| value.trim().to_string())
            .map_err(|source| PciError::Io { path, source })
    }
}

impl Default for SysfsPci {
    fn default() -> Self {
        Self::new(Path::new(SYSFS_PCI_DEVICES))
    }
}

impl PciProvider for SysfsPci {
    fn nvidia_devices(&self) -> Result<Vec<PciDevice>, PciError> {
        let entries = fs::read_dir(&self.root).map_err(|source| PciError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut devices = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|source| PciError::Io {
                path: self.root.clone(),
                source,
            })?;

            let path = entry.path();
            let address = entry.file_name().to_string_lossy().to_string();

            let vendor = Self::read_attribute(&path, "vendor")?;

            trace!("PCI device {address}, vendor {vendor}");

            // Ignore PCI devices other than NVIDIA ones
            if vendor != NVIDIA_VENDOR_ID {
                continue;
            }

            devices.push(PciDevice { address, path });
        }

        // Sort by address so the enumeration order is stable
        devices.sort_by(|a, b| a.address.cmp(&b.address));

        debug!("Found {} NVIDIA PCI devices", devices.len());

        Ok(devices)
    }

    fn read_config(&self, device: &PciDevice) -> Result<Vec<u8>, PciError> {
        let path = device.path.join("config");

        fs::read(&path).map_err(|source| PciError::Io { path, source })
    }
}
