use tracing::debug;

use crate::gpu_device::{DeviceError, GpuDevice, GpuLibrary, MigAttributes, MigDevice};

// Canonical name of a MIG profile, e.g. "3g.20gb".
// Memory is rounded up to the next GiB.
pub fn mig_profile_name(attributes: &MigAttributes) -> String {
    format!(
        "{}g.{}gb",
        attributes.gpu_instance_slice_count,
        attributes.memory_size_mb.div_ceil(1024)
    )
}

// Devices of a node split on their MIG mode.
// Every device belongs to exactly one of the two sets.
#[derive(Debug)]
pub struct Partition<D> {
    pub enabled: Vec<D>,
    pub disabled: Vec<D>,
}

impl<D: GpuDevice> Partition<D> {
    pub fn from_devices(devices: Vec<D>) -> Result<Self, DeviceError> {
        let mut partition = Partition {
            enabled: Vec::new(),
            disabled: Vec::new(),
        };

        for device in devices {
            if device.is_mig_enabled()? {
                partition.enabled.push(device);
            } else {
                partition.disabled.push(device);
            }
        }

        debug!(
            "MIG enabled devices: {}, MIG disabled devices: {}",
            partition.enabled.len(),
            partition.disabled.len()
        );

        Ok(partition)
    }
}

/// MIG view of the devices of a node for one label generation pass.
///
/// The partition is queried on first use and then kept for the lifetime of
/// the index. MIG modes can change between passes, so a new index must be
/// built for every pass.
pub struct MigDeviceIndex<'a, L: GpuLibrary + 'a> {
    library: &'a L,
    partition: Option<Partition<L::Device<'a>>>,
}

impl<'a, L: GpuLibrary + 'a> MigDeviceIndex<'a, L> {
    pub fn new(library: &'a L) -> Self {
        Self {
            library,
            partition: None,
        }
    }

    pub fn partition(&mut self) -> Result<&Partition<L::Device<'a>>, DeviceError> {
        let library = self.library;

        let partition = match self.partition.take() {
            Some(partition) => partition,
            None => Partition::from_devices(library.devices()?)?,
        };

        Ok(self.partition.insert(partition))
    }

    pub fn enabled_devices(&mut self) -> Result<&[L::Device<'a>], DeviceError> {
        Ok(&self.partition()?.enabled)
    }

    pub fn disabled_devices(&mut self) -> Result<&[L::Device<'a>], DeviceError> {
        Ok(&self.partition()?.disabled)
    }

    /// Return true if there is no MIG enabled device, or if one of them has
    /// no MIG sub-device configured.
    ///
    /// The first case holds vacuously; callers that need to tell the two
    /// apart must check [`Self::enabled_devices`] first.
    pub fn any_enabled_device_is_empty(&mut self) -> Result<bool, DeviceError> {
        let enabled = self.enabled_devices()?;

        if enabled.is_empty() {
            return Ok(true);
        }

        for device in enabled {
            if device.mig_devices()?.is_empty() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    // All MIG sub-devices of the node, in device order
    // then in sub-device order within each device
    pub fn all_mig_devices(&mut self) -> Result<Vec<MigDevice>, DeviceError> {
        let mut devices = Vec::new();

        for device in self.enabled_devices()? {
            devices.extend(device.mig_devices()?);
        }

        Ok(devices)
    }
}
