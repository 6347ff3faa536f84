use thiserror::Error;

use crate::{
    common_labels::CommonLabelsError, config_manager::ConfigError, gpu_device::DeviceError,
    labels::LabelsError, mig_strategy::MigStrategyError, pci::PciError, vgpu::VgpuError,
};

// The main daemon error type
#[derive(Debug, Error)]
pub enum GfdError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Labels(#[from] LabelsError),
    #[error(transparent)]
    Pci(#[from] PciError),
    #[error(transparent)]
    Vgpu(#[from] VgpuError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    MigStrategy(#[from] MigStrategyError),
    #[error(transparent)]
    CommonLabels(#[from] CommonLabelsError),
}
