use std::{
    env,
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{common_labels::MACHINE_TYPE_FILE, pci::SYSFS_PCI_DEVICES};

pub const DEFAULT_OUTPUT_FILE: &str = "/etc/kubernetes/node-feature-discovery/features.d/gfd";
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(60);

// Environment variable pointing to the JSON configuration file
pub const CONFIG_FILE_ENV: &str = "GFD_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open configuration file {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to parse configuration file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value \"{value}\" for {name}")]
    InvalidValue { name: String, value: String },
    #[error("invalid sleep interval \"{0}\", expected <n>, <n>s, <n>m or <n>h")]
    InvalidInterval(String),
}

// Effective daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub mig_strategy: String,
    pub fail_on_init_error: bool,
    pub oneshot: bool,
    pub no_timestamp: bool,
    #[serde(serialize_with = "serialize_interval")]
    pub sleep_interval: Duration,
    pub output_file: PathBuf,
    pub machine_type_file: PathBuf,
    pub sysfs_pci_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mig_strategy: "none".to_string(),
            fail_on_init_error: true,
            oneshot: false,
            no_timestamp: false,
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            output_file: PathBuf::from(DEFAULT_OUTPUT_FILE),
            machine_type_file: PathBuf::from(MACHINE_TYPE_FILE),
            sysfs_pci_root: PathBuf::from(SYSFS_PCI_DEVICES),
        }
    }
}

fn serialize_interval<S: Serializer>(interval: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{}s", interval.as_secs()))
}

/// Parse a sleep interval.
///
/// A bare number is a count of seconds, the `s`, `m` and `h` suffixes
/// select seconds, minutes and hours. Zero is rejected.
pub fn parse_interval(value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidInterval(value.to_string());

    let value = value.trim();
    let (number, unit) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&value[..i], &value[i..]),
        _ => (value, "s"),
    };

    let number: u64 = number.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "s" => Some(number),
        "m" => number.checked_mul(60),
        "h" => number.checked_mul(60 * 60),
        _ => None,
    }
    .ok_or_else(invalid)?;

    if secs == 0 {
        return Err(invalid());
    }

    Ok(Duration::from_secs(secs))
}

/// Partial configuration coming from one source.
///
/// Sources are layered over the defaults from the lowest to the highest
/// priority: configuration file, environment, command line.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub mig_strategy: Option<String>,
    pub fail_on_init_error: Option<bool>,
    pub oneshot: Option<bool>,
    pub no_timestamp: Option<bool>,
    pub sleep_interval: Option<String>,
    pub output_file: Option<PathBuf>,
    pub machine_type_file: Option<PathBuf>,
    pub sysfs_pci_root: Option<PathBuf>,
}

impl ConfigOverrides {
    // Read the GFD_* environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            mig_strategy: lookup("GFD_MIG_STRATEGY"),
            fail_on_init_error: parse_var(&lookup, "GFD_FAIL_ON_INIT_ERROR")?,
            oneshot: parse_var(&lookup, "GFD_ONESHOT")?,
            no_timestamp: parse_var(&lookup, "GFD_NO_TIMESTAMP")?,
            sleep_interval: lookup("GFD_SLEEP_INTERVAL"),
            output_file: lookup("GFD_OUTPUT_FILE").map(PathBuf::from),
            machine_type_file: lookup("GFD_MACHINE_TYPE_FILE").map(PathBuf::from),
            sysfs_pci_root: None,
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(name)
        .map(|value| {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value,
            })
        })
        .transpose()
}

impl Config {
    // Overwrite the fields set in the overrides
    pub fn apply(&mut self, overrides: ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(mig_strategy) = overrides.mig_strategy {
            self.mig_strategy = mig_strategy;
        }
        if let Some(fail_on_init_error) = overrides.fail_on_init_error {
            self.fail_on_init_error = fail_on_init_error;
        }
        if let Some(oneshot) = overrides.oneshot {
            self.oneshot = oneshot;
        }
        if let Some(no_timestamp) = overrides.no_timestamp {
            self.no_timestamp = no_timestamp;
        }
        if let Some(sleep_interval) = overrides.sleep_interval {
            self.sleep_interval = parse_interval(&sleep_interval)?;
        }
        if let Some(output_file) = overrides.output_file {
            self.output_file = output_file;
        }
        if let Some(machine_type_file) = overrides.machine_type_file {
            self.machine_type_file = machine_type_file;
        }
        if let Some(sysfs_pci_root) = overrides.sysfs_pci_root {
            self.sysfs_pci_root = sysfs_pci_root;
        }

        Ok(())
    }
}

// Build the daemon configuration from its sources
pub struct ConfigManager {
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config_path: Option<&Path>) -> Self {
        Self {
            config_path: config_path.map(Path::to_path_buf),
        }
    }

    // Parse the JSON configuration file, if any
    pub fn parse_config_file(&self) -> Result<ConfigOverrides, ConfigError> {
        let Some(path) = &self.config_path else {
            return Ok(ConfigOverrides::default());
        };

        debug!("Parsing config file at: {:?}", path);

        let file = File::open(path).map_err(|source| ConfigError::Open {
            path: path.clone(),
            source,
        })?;

        let buf = BufReader::new(file);

        serde_json::from_reader(buf).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }

    // Layer the configuration file, environment and
    // command line overrides over the defaults
    pub fn load(&self, env: ConfigOverrides, args: ConfigOverrides) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        let file = self.parse_config_file()?;
        trace!("Config file overrides: {file:?}");
        trace!("Environment overrides: {env:?}");
        trace!("Command line overrides: {args:?}");

        config.apply(file)?;
        config.apply(env)?;
        config.apply(args)?;

        Ok(config)
    }
}
