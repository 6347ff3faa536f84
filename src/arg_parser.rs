use std::{
    env,
    io::{self, Write},
    path::PathBuf,
    process,
};

use argparse::{ArgumentParser, Print, StoreConst, StoreOption};

use crate::config_manager::ConfigOverrides;

// Command line options, every unset option keeps
// the value from the lower priority sources
#[derive(Debug, Default, PartialEq)]
pub struct ArgsOptions {
    pub config_file_path: Option<PathBuf>,

    pub mig_strategy: Option<String>,
    pub fail_on_init_error: Option<bool>,
    pub oneshot: Option<bool>,
    pub no_timestamp: Option<bool>,
    pub sleep_interval: Option<String>,
    pub output_file: Option<PathBuf>,
    pub machine_type_file: Option<PathBuf>,
}

impl ArgsOptions {
    // Parse the process arguments, exit on error or on --help/--version
    pub fn parse() -> Self {
        let args = env::args().collect();

        match Self::parse_from(args, &mut io::stdout(), &mut io::stderr()) {
            Ok(options) => options,
            Err(code) => process::exit(code),
        }
    }

    pub fn parse_from(
        args: Vec<String>,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<Self, i32> {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();
            parser.set_description("Generate labels describing the GPUs of the node");

            // Configuration file path
            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config", "--config-file"],
                StoreOption,
                "The file path of the JSON configuration file",
            );

            parser.refer(&mut options.mig_strategy).add_option(
                &["--mig-strategy"],
                StoreOption,
                "The strategy used to label MIG devices: none, single or mixed",
            );

            parser.refer(&mut options.fail_on_init_error).add_option(
                &["--fail-on-init-error"],
                StoreOption,
                "Fail if NVML cannot be initialized (true or false)",
            );

            parser.refer(&mut options.oneshot).add_option(
                &["--oneshot"],
                StoreConst(Some(true)),
                "Label once and exit",
            );

            parser.refer(&mut options.no_timestamp).add_option(
                &["--no-timestamp"],
                StoreConst(Some(true)),
                "Do not add the timestamp label",
            );

            parser.refer(&mut options.sleep_interval).add_option(
                &["--sleep-interval"],
                StoreOption,
                "Time to sleep between labeling passes, e.g. 60s",
            );

            parser.refer(&mut options.output_file).add_option(
                &["-o", "--output", "--output-file"],
                StoreOption,
                "Path of the output file, empty for stdout",
            );

            parser.refer(&mut options.machine_type_file).add_option(
                &["--machine-type-file"],
                StoreOption,
                "File holding the machine type",
            );

            // Show daemon version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the daemon version",
            );

            parser.parse(args, stdout, stderr)?;
        }

        Ok(options)
    }

    // Split the options into the configuration file
    // path and the configuration overrides
    pub fn into_overrides(self) -> (Option<PathBuf>, ConfigOverrides) {
        let overrides = ConfigOverrides {
            mig_strategy: self.mig_strategy,
            fail_on_init_error: self.fail_on_init_error,
            oneshot: self.oneshot,
            no_timestamp: self.no_timestamp,
            sleep_interval: self.sleep_interval,
            output_file: self.output_file,
            machine_type_file: self.machine_type_file,
            sysfs_pci_root: None,
        };

        (self.config_file_path, overrides)
    }
}
