use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

use crate::{
    gpu_device::{DeviceError, GpuDevice, GpuLibrary},
    labels::{Labels, key},
};

// Default source of the machine type label
pub const MACHINE_TYPE_FILE: &str = "/sys/class/dmi/id/product_name";

const UNKNOWN_MACHINE_TYPE: &str = "unknown";

#[derive(Debug, Error)]
pub enum CommonLabelsError {
    #[error("driver version \"{0}\" does not match format \"X.Y[.Z]\"")]
    InvalidDriverVersion(String),
    #[error("error reading machine type from {path:?}: {source}")]
    MachineType { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

// Architecture family of a CUDA compute capability
pub fn arch_family(major: i32, minor: i32) -> &'static str {
    match major {
        1 => "tesla",
        2 => "fermi",
        3 => "kepler",
        5 => "maxwell",
        6 => "pascal",
        7 if minor < 5 => "volta",
        7 => "turing",
        8 => "ampere",
        _ => "undefined",
    }
}

// Read the machine type, a missing file is not an error
pub fn machine_type(path: &Path) -> Result<String, CommonLabelsError> {
    match fs::read_to_string(path) {
        Ok(data) => Ok(data.trim().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Machine type file {path:?} not found");
            Ok(UNKNOWN_MACHINE_TYPE.to_string())
        }
        Err(source) => Err(CommonLabelsError::MachineType {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// Split a driver version in its major, minor and revision parts
fn split_driver_version(version: &str) -> Result<(&str, &str, &str), CommonLabelsError> {
    let parts: Vec<&str> = version.split('.').collect();

    match parts.as_slice() {
        [major, minor] => Ok((*major, *minor, "")),
        [major, minor, rev] => Ok((*major, *minor, *rev)),
        _ => Err(CommonLabelsError::InvalidDriverVersion(version.to_string())),
    }
}

/// Driver, CUDA, compute capability and machine labels of the node.
///
/// The compute capability comes from the first device. The family and
/// compute labels are left out when the major version is 0.
pub fn generate_common_labels<L: GpuLibrary>(
    library: &L,
    machine_type_file: &Path,
) -> Result<Labels, CommonLabelsError> {
    let driver_version = library.driver_version()?;
    let (driver_major, driver_minor, driver_rev) = split_driver_version(&driver_version)?;

    let cuda_version = library.cuda_driver_version()?;
    let machine = machine_type(machine_type_file)?;

    let device = library.device_by_index(0)?;
    let (compute_major, compute_minor) = device.cuda_compute_capability()?;

    let mut labels = Labels::new();
    labels.insert(key("cuda.driver.major"), driver_major);
    labels.insert(key("cuda.driver.minor"), driver_minor);
    labels.insert(key("cuda.driver.rev"), driver_rev);
    labels.insert(key("cuda.runtime.major"), cuda_version / 1000);
    labels.insert(key("cuda.runtime.minor"), (cuda_version % 1000) / 10);
    labels.insert(key("gpu.machine"), machine.replace(' ', "-"));

    if compute_major != 0 {
        labels.insert(key("gpu.family"), arch_family(compute_major, compute_minor));
        labels.insert(key("gpu.compute.major"), compute_major);
        labels.insert(key("gpu.compute.minor"), compute_minor);
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::{NamedTempFile, TempDir};

    use super::*;
    use crate::gpu_device::mock::{MockDevice, MockLibrary};

    fn machine_file(content: &str) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), content).unwrap();
        file
    }

    #[test]
    fn family_mapping() {
        assert_eq!(arch_family(1, 3), "tesla");
        assert_eq!(arch_family(2, 1), "fermi");
        assert_eq!(arch_family(3, 7), "kepler");
        assert_eq!(arch_family(5, 2), "maxwell");
        assert_eq!(arch_family(6, 1), "pascal");
        assert_eq!(arch_family(7, 0), "volta");
        assert_eq!(arch_family(7, 2), "volta");
        assert_eq!(arch_family(7, 5), "turing");
        assert_eq!(arch_family(8, 6), "ampere");
        assert_eq!(arch_family(4, 0), "undefined");
        assert_eq!(arch_family(9, 0), "undefined");
    }

    #[test]
    fn driver_version_formats() {
        assert_eq!(split_driver_version("470.57.02").unwrap(), ("470", "57", "02"));
        assert_eq!(split_driver_version("460.16").unwrap(), ("460", "16", ""));

        for invalid in ["470", "1.2.3.4", ""] {
            assert!(matches!(
                split_driver_version(invalid),
                Err(CommonLabelsError::InvalidDriverVersion(_))
            ));
        }
    }

    #[test]
    fn machine_type_is_trimmed() {
        let file = machine_file("  PowerEdge R740xd \n");

        assert_eq!(machine_type(file.path()).unwrap(), "PowerEdge R740xd");
    }

    #[test]
    fn missing_machine_type_is_unknown() {
        let dir = TempDir::new().unwrap();

        assert_eq!(machine_type(&dir.path().join("product_name")).unwrap(), "unknown");
    }

    #[test]
    fn unreadable_machine_type_fails() {
        // Reading a directory is an error other than "not found"
        let dir = TempDir::new().unwrap();

        assert!(matches!(
            machine_type(dir.path()),
            Err(CommonLabelsError::MachineType { .. })
        ));
    }

    #[test]
    fn common_labels() {
        let file = machine_file("DGX A100\n");
        let library = MockLibrary::new(vec![MockDevice::a100()]);

        let labels = generate_common_labels(&library, file.path()).unwrap();

        let expected: Labels = [
            ("cuda.driver.major", "470"),
            ("cuda.driver.minor", "57"),
            ("cuda.driver.rev", "02"),
            ("cuda.runtime.major", "11"),
            ("cuda.runtime.minor", "4"),
            ("gpu.machine", "DGX-A100"),
            ("gpu.family", "ampere"),
            ("gpu.compute.major", "8"),
            ("gpu.compute.minor", "0"),
        ]
        .into_iter()
        .map(|(name, value)| (key(name), value))
        .collect();

        assert_eq!(labels, expected);
    }

    #[test]
    fn zero_compute_capability_has_no_family() {
        let file = machine_file("node");
        let library =
            MockLibrary::new(vec![MockDevice::a100().with_compute_capability(0, 0)]);

        let labels = generate_common_labels(&library, file.path()).unwrap();

        assert!(!labels.contains_key(&key("gpu.family")));
        assert!(!labels.contains_key(&key("gpu.compute.major")));
        assert_eq!(labels.len(), 6);
    }

    #[test]
    fn invalid_driver_version_fails() {
        let file = machine_file("node");
        let mut library = MockLibrary::new(vec![MockDevice::a100()]);
        library.driver_version = "470".to_string();

        assert!(matches!(
            generate_common_labels(&library, file.path()),
            Err(CommonLabelsError::InvalidDriverVersion(_))
        ));
    }
}
