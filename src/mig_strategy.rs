use std::{collections::BTreeMap, fmt, str::FromStr};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    gpu_device::{DeviceError, GpuDevice, GpuLibrary, MigAttributes},
    labels::{Labels, key},
    mig::{MigDeviceIndex, mig_profile_name},
};

#[derive(Debug, Error)]
pub enum MigStrategyError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// How the MIG layout of a node is summarized into labels.
///
/// - `None` ignores MIG and describes the first physical GPU.
/// - `Single` requires every GPU to be partitioned with one MIG profile and
///   describes that profile as if it was the node GPU type.
/// - `Mixed` adds a label block per MIG profile found on the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MigStrategy {
    #[default]
    None,
    Single,
    Mixed,
}

impl FromStr for MigStrategy {
    type Err = MigStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(MigStrategy::None),
            "single" => Ok(MigStrategy::Single),
            "mixed" => Ok(MigStrategy::Mixed),
            other => Err(MigStrategyError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for MigStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigStrategy::None => "none",
            MigStrategy::Single => "single",
            MigStrategy::Mixed => "mixed",
        };

        write!(f, "{name}")
    }
}

impl MigStrategy {
    // Build the GPU labels of the node. A new MIG device index is
    // used for every call so MIG mode changes are always observed.
    pub fn generate_labels<L: GpuLibrary>(&self, library: &L) -> Result<Labels, MigStrategyError> {
        let mut index = MigDeviceIndex::new(library);

        let labels = match self {
            MigStrategy::None => base_labels(library)?,
            MigStrategy::Single => single_labels(library, &mut index)?,
            MigStrategy::Mixed => mixed_labels(library, &mut index)?,
        };

        Ok(labels)
    }
}

// Count, product and memory of the node. Only the first device is
// described, nodes mixing GPU models are not reconciled.
fn base_labels<L: GpuLibrary>(library: &L) -> Result<Labels, DeviceError> {
    let count = library.device_count()?;
    let device = library.device_by_index(0)?;

    let model = device.name()?;
    let total_memory = device.total_memory()?;

    let mut labels = Labels::new();
    labels.insert(key("gpu.count"), count);

    if !model.is_empty() {
        labels.insert(key("gpu.product"), model.replace(' ', "-"));
    }

    // Total memory as reported by the device, in bytes
    if total_memory != 0 {
        labels.insert(key("gpu.memory"), total_memory);
    }

    Ok(labels)
}

fn single_labels<L: GpuLibrary>(
    library: &L,
    index: &mut MigDeviceIndex<'_, L>,
) -> Result<Labels, DeviceError> {
    let mut labels = base_labels(library)?;
    labels.insert(key("mig.strategy"), MigStrategy::Single);

    // Without MIG enabled devices this is the same as the none strategy
    if index.enabled_devices()?.is_empty() {
        return Ok(labels);
    }

    if index.any_enabled_device_is_empty()? {
        set_invalid_labels(&mut labels, "at least one MIG device is enabled but empty");
        return Ok(labels);
    }

    if !index.disabled_devices()?.is_empty() {
        set_invalid_labels(&mut labels, "devices with MIG enabled and disabled detected");
        return Ok(labels);
    }

    let migs = index.all_mig_devices()?;

    let mut counts = BTreeMap::new();
    for mig in migs.iter() {
        *counts.entry(mig_profile_name(&mig.attributes)).or_insert(0usize) += 1;
    }

    let (Some(first), 1) = (migs.first(), counts.len()) else {
        set_invalid_labels(&mut labels, "more than one MIG device type present on node");
        return Ok(labels);
    };

    // All the MIG devices share the same profile,
    // the first one describes all of them
    let name = mig_profile_name(&first.attributes);
    let count = counts.get(&name).copied().unwrap_or_default();

    debug!("Node partitioned in {count} {name} MIG devices");

    let product = labels.get(&key("gpu.product")).unwrap_or_default().to_string();

    labels.insert(key("gpu.count"), count);
    labels.insert(key("gpu.product"), format!("{product}-MIG-{name}"));
    insert_attribute_labels(&mut labels, "gpu", &first.attributes);

    Ok(labels)
}

// Flag the node as invalid for the single strategy,
// the pass itself still succeeds
fn set_invalid_labels(labels: &mut Labels, reason: &str) {
    warn!("Invalid configuration detected for mig-strategy=single: {reason}");

    let product = labels.get(&key("gpu.product")).unwrap_or_default().to_string();

    labels.insert(key("gpu.count"), 0);
    labels.insert(key("gpu.memory"), 0);
    labels.insert(key("gpu.product"), format!("{product}-MIG-INVALID"));
}

fn mixed_labels<L: GpuLibrary>(
    library: &L,
    index: &mut MigDeviceIndex<'_, L>,
) -> Result<Labels, DeviceError> {
    let mut labels = base_labels(library)?;
    labels.insert(key("mig.strategy"), MigStrategy::Mixed);

    // MIG enabled devices without sub-devices add nothing here
    let migs = index.all_mig_devices()?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for mig in migs.iter() {
        let name = mig_profile_name(&mig.attributes);

        // The first device of each profile describes the profile
        if !counts.contains_key(&name) {
            debug!("MIG device {} describes profile {name}", mig.index);
            insert_attribute_labels(&mut labels, &format!("mig-{name}"), &mig.attributes);
        }

        *counts.entry(name).or_default() += 1;
    }

    for (name, count) in counts {
        labels.insert(key(&format!("mig-{name}.count")), count);
    }

    Ok(labels)
}

// Memory, multiprocessor, slice and engine labels of a MIG profile
fn insert_attribute_labels(labels: &mut Labels, prefix: &str, attributes: &MigAttributes) {
    let label = |name: &str| key(&format!("{prefix}.{name}"));

    labels.insert(label("memory"), attributes.memory_size_mb);
    labels.insert(label("multiprocessors"), attributes.multiprocessor_count);
    labels.insert(label("slices.gi"), attributes.gpu_instance_slice_count);
    labels.insert(label("slices.ci"), attributes.compute_instance_slice_count);
    labels.insert(label("engines.copy"), attributes.shared_copy_engine_count);
    labels.insert(label("engines.decoder"), attributes.shared_decoder_count);
    labels.insert(label("engines.encoder"), attributes.shared_encoder_count);
    labels.insert(label("engines.jpeg"), attributes.shared_jpeg_count);
    labels.insert(label("engines.ofa"), attributes.shared_ofa_count);
}
