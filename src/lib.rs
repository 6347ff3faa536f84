pub mod arg_parser;
pub mod common_labels;
pub mod config_manager;
pub mod errors;
pub mod gpu_device;
pub mod label_manager;
pub mod labels;
pub mod logger;
pub mod mig;
pub mod mig_strategy;
pub mod pci;
pub mod vgpu;
