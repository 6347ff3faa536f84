// In-memory GPU library used by the tests

use crate::gpu_device::{DeviceError, GpuDevice, GpuLibrary, MigAttributes, MigDevice};

#[derive(Debug, Clone)]
pub struct MockDevice {
    pub name: String,
    pub total_memory: u64,
    pub compute_capability: (i32, i32),
    pub mig_enabled: bool,
    pub mig_devices: Vec<MigAttributes>,
    // Make every query on the device fail
    pub fail: bool,
}

impl MockDevice {
    pub fn new(name: &str, total_memory: u64) -> Self {
        Self {
            name: name.to_string(),
            total_memory,
            compute_capability: (8, 0),
            mig_enabled: false,
            mig_devices: Vec::new(),
            fail: false,
        }
    }

    // A100 with 40 GiB of memory
    pub fn a100() -> Self {
        Self::new("NVIDIA A100-SXM4-40GB", 40 * 1024 * 1024 * 1024)
    }

    pub fn with_compute_capability(mut self, major: i32, minor: i32) -> Self {
        self.compute_capability = (major, minor);
        self
    }

    // Enable MIG with the given sub-devices
    pub fn with_mig(mut self, devices: &[MigAttributes]) -> Self {
        self.mig_enabled = true;
        self.mig_devices = devices.to_vec();
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.fail {
            return Err(DeviceError::Query(format!("{} is unreachable", self.name)));
        }

        Ok(())
    }
}

impl GpuDevice for MockDevice {
    fn name(&self) -> Result<String, DeviceError> {
        self.check()?;
        Ok(self.name.clone())
    }

    fn total_memory(&self) -> Result<u64, DeviceError> {
        self.check()?;
        Ok(self.total_memory)
    }

    fn cuda_compute_capability(&self) -> Result<(i32, i32), DeviceError> {
        self.check()?;
        Ok(self.compute_capability)
    }

    fn is_mig_enabled(&self) -> Result<bool, DeviceError> {
        self.check()?;
        Ok(self.mig_enabled)
    }

    fn mig_devices(&self) -> Result<Vec<MigDevice>, DeviceError> {
        self.check()?;

        Ok(self
            .mig_devices
            .iter()
            .enumerate()
            .map(|(index, attributes)| MigDevice {
                index: index as u32,
                attributes: *attributes,
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct MockLibrary {
    pub devices: Vec<MockDevice>,
    pub driver_version: String,
    pub cuda_driver_version: i32,
}

impl MockLibrary {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            driver_version: "470.57.02".to_string(),
            cuda_driver_version: 11040,
        }
    }
}

impl GpuLibrary for MockLibrary {
    type Device<'a> = MockDevice;

    fn device_count(&self) -> Result<u32, DeviceError> {
        Ok(self.devices.len() as u32)
    }

    fn device_by_index(&self, index: u32) -> Result<MockDevice, DeviceError> {
        self.devices
            .get(index as usize)
            .cloned()
            .ok_or_else(|| DeviceError::Query(format!("no device at index {index}")))
    }

    fn driver_version(&self) -> Result<String, DeviceError> {
        Ok(self.driver_version.clone())
    }

    fn cuda_driver_version(&self) -> Result<i32, DeviceError> {
        Ok(self.cuda_driver_version)
    }
}

// Attributes of a MIG sub-device with the given GPU instance
// slice count and memory, the other fields derived from them
pub fn mig_attributes(gi: u32, memory_size_mb: u64) -> MigAttributes {
    MigAttributes {
        memory_size_mb,
        multiprocessor_count: gi * 14,
        gpu_instance_slice_count: gi,
        compute_instance_slice_count: gi,
        shared_copy_engine_count: gi,
        shared_decoder_count: gi / 2,
        shared_encoder_count: 0,
        shared_jpeg_count: gi / 7,
        shared_ofa_count: gi / 7,
    }
}
