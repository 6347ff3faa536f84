use nvml_wrapper::error::NvmlError;
use thiserror::Error;

pub mod nvidia_device;

#[cfg(test)]
pub mod mock;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device query failed: {0}")]
    Nvml(#[from] NvmlError),
    #[error("device query failed: {0}")]
    Query(String),
}

// Fixed attributes of a MIG sub-device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigAttributes {
    pub memory_size_mb: u64,
    pub multiprocessor_count: u32,
    pub gpu_instance_slice_count: u32,
    pub compute_instance_slice_count: u32,
    pub shared_copy_engine_count: u32,
    pub shared_decoder_count: u32,
    pub shared_encoder_count: u32,
    pub shared_jpeg_count: u32,
    pub shared_ofa_count: u32,
}

/// Snapshot of a MIG sub-device taken while its parent was queried.
///
/// Only the fixed attributes are kept, labels never need the compute
/// capability of a sub-device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigDevice {
    // Index of the sub-device inside its parent
    pub index: u32,
    pub attributes: MigAttributes,
}

// A physical GPU as seen by the label generation pass
pub trait GpuDevice {
    // Return the device product name
    fn name(&self) -> Result<String, DeviceError>;

    // Return the total device memory in bytes
    fn total_memory(&self) -> Result<u64, DeviceError>;

    // Return the (major, minor) CUDA compute capability
    fn cuda_compute_capability(&self) -> Result<(i32, i32), DeviceError>;

    // Return true if MIG mode is currently enabled on the device
    fn is_mig_enabled(&self) -> Result<bool, DeviceError>;

    // Return the MIG sub-devices configured on the device,
    // in the order the driver enumerates them
    fn mig_devices(&self) -> Result<Vec<MigDevice>, DeviceError>;
}

// The hardware query library
pub trait GpuLibrary {
    type Device<'a>: GpuDevice
    where
        Self: 'a;

    fn device_count(&self) -> Result<u32, DeviceError>;

    fn device_by_index(&self, index: u32) -> Result<Self::Device<'_>, DeviceError>;

    // Return the system driver version, e.g. "470.57.02"
    fn driver_version(&self) -> Result<String, DeviceError>;

    // Return the CUDA driver version as an integer, e.g. 11040
    fn cuda_driver_version(&self) -> Result<i32, DeviceError>;

    // Return every device of the node in enumeration order
    fn devices(&self) -> Result<Vec<Self::Device<'_>>, DeviceError> {
        (0..self.device_count()?)
            .map(|index| self.device_by_index(index))
            .collect()
    }
}
