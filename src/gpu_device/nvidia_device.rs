use std::{os::raw::c_uint, ptr, sync::Arc};

use nvml_wrapper::{
    Device, Nvml,
    error::{NvmlError, nvml_sym, nvml_try},
    struct_wrappers::device::DeviceAttributes,
};
use nvml_wrapper_sys::bindings::{NvmlLib, nvmlDevice_t};
use tracing::{debug, trace};

use crate::gpu_device::{DeviceError, GpuDevice, GpuLibrary, MigAttributes, MigDevice};

// Shared object Nvml::init loads on Linux
const NVML_LIB_PATH: &str = "libnvidia-ml.so.1";

// Value of the current MIG mode when MIG is enabled
const NVML_DEVICE_MIG_ENABLE: u32 = 1;

impl From<DeviceAttributes> for MigAttributes {
    fn from(attributes: DeviceAttributes) -> Self {
        Self {
            memory_size_mb: attributes.memory_size_mb,
            multiprocessor_count: attributes.multiprocessor_count,
            gpu_instance_slice_count: attributes.gpu_instance_slice_count,
            compute_instance_slice_count: attributes.compute_instance_slice_count,
            shared_copy_engine_count: attributes.shared_copy_engine_count,
            shared_decoder_count: attributes.shared_decoder_count,
            shared_encoder_count: attributes.shared_encoder_count,
            shared_jpeg_count: attributes.shared_jpeg_count,
            shared_ofa_count: attributes.shared_ofa_count,
        }
    }
}

// GPU library backed by NVML
pub struct NvmlLibrary {
    // NVML is thread-safe so it is shared with no Mutex
    nvml: Arc<Nvml>,

    // Raw bindings for the MIG entry points nvml-wrapper has no safe
    // method for. Loading the library again hands back the object
    // NVML was initialized from, so both share the same state.
    lib: NvmlLib,
}

impl NvmlLibrary {
    pub fn new(nvml: Arc<Nvml>) -> Result<Self, DeviceError> {
        // SAFETY: this is the library nvml-wrapper already loaded and
        // initialized, its symbols have the bindings' signatures
        let lib = unsafe { NvmlLib::new(NVML_LIB_PATH) }
            .map_err(|e| DeviceError::Query(format!("unable to load {NVML_LIB_PATH}: {e}")))?;

        Ok(Self { nvml, lib })
    }

    // Initialize NVML and load the raw bindings
    pub fn init() -> Result<Self, DeviceError> {
        let nvml = Nvml::init()?;
        debug!("NVML initialized");

        Self::new(Arc::new(nvml))
    }
}

impl GpuLibrary for NvmlLibrary {
    type Device<'a> = NvidiaDevice<'a>;

    fn device_count(&self) -> Result<u32, DeviceError> {
        Ok(self.nvml.device_count()?)
    }

    fn device_by_index(&self, index: u32) -> Result<NvidiaDevice<'_>, DeviceError> {
        let device = self.nvml.device_by_index(index)?;

        Ok(NvidiaDevice {
            device,
            lib: &self.lib,
        })
    }

    fn driver_version(&self) -> Result<String, DeviceError> {
        Ok(self.nvml.sys_driver_version()?)
    }

    fn cuda_driver_version(&self) -> Result<i32, DeviceError> {
        Ok(self.nvml.sys_cuda_driver_version()?)
    }
}

// A physical NVIDIA GPU
pub struct NvidiaDevice<'a> {
    device: Device<'a>,
    lib: &'a NvmlLib,
}

impl GpuDevice for NvidiaDevice<'_> {
    fn name(&self) -> Result<String, DeviceError> {
        Ok(self.device.name()?)
    }

    fn total_memory(&self) -> Result<u64, DeviceError> {
        Ok(self.device.memory_info()?.total)
    }

    fn cuda_compute_capability(&self) -> Result<(i32, i32), DeviceError> {
        let capability = self.device.cuda_compute_capability()?;

        Ok((capability.major, capability.minor))
    }

    fn is_mig_enabled(&self) -> Result<bool, DeviceError> {
        match self.device.mig_mode() {
            Ok(mode) => Ok(mode.current == NVML_DEVICE_MIG_ENABLE),
            // Devices without MIG support are reported as disabled
            Err(NvmlError::NotSupported) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn mig_devices(&self) -> Result<Vec<MigDevice>, DeviceError> {
        let max_count = nvml_sym(self.lib.nvmlDeviceGetMaxMigDeviceCount.as_ref())?;
        let by_index = nvml_sym(self.lib.nvmlDeviceGetMigDeviceHandleByIndex.as_ref())?;

        // SAFETY: the parent handle comes from a live `Device` of the same
        // NVML instance and the out pointer points to a local
        let max = unsafe {
            let mut count: c_uint = 0;

            match nvml_try(max_count(self.device.handle(), &mut count)) {
                Ok(()) => count,
                // Devices without MIG support have no MIG table
                Err(NvmlError::NotSupported) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
        };

        let mut devices = Vec::new();

        for index in 0..max {
            let mut handle: nvmlDevice_t = ptr::null_mut();

            // SAFETY: same parent handle as above, `handle` is only used
            // once NVML reported success
            let mig = unsafe {
                match nvml_try(by_index(self.device.handle(), index, &mut handle)) {
                    Ok(()) => Device::new(handle, self.device.nvml()),
                    // Unused slots of the MIG table are not found
                    Err(NvmlError::NotFound) => continue,
                    Err(e) => return Err(e.into()),
                }
            };

            let attributes = MigAttributes::from(mig.attributes()?);
            trace!("MIG device {index}: {attributes:?}");

            devices.push(MigDevice { index, attributes });
        }

        Ok(devices)
    }
}
