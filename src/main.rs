use std::{env, path::PathBuf};

use anyhow::{Context, Result, bail};
use gfd::{
    arg_parser::ArgsOptions,
    config_manager::{CONFIG_FILE_ENV, ConfigManager, ConfigOverrides},
    gpu_device::nvidia_device::NvmlLibrary,
    label_manager::LabelManager,
    logger,
    pci::SysfsPci,
};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

// Resolve once any of SIGINT, SIGTERM or SIGQUIT is received
async fn shutdown_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let mut sigquit = signal(SignalKind::quit()).context("Failed to listen for SIGQUIT")?;

    let name = select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };

    info!("Received signal \"{name}\", shutting down");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logging();

    // Parse the command line arguments
    let (args_config_path, args_overrides) = ArgsOptions::parse().into_overrides();

    // The command line path has priority over the environment one
    let config_path = args_config_path.or_else(|| env::var_os(CONFIG_FILE_ENV).map(PathBuf::from));

    let env_overrides =
        ConfigOverrides::from_env().with_context(|| "Failed to read environment configuration")?;

    let config = ConfigManager::new(config_path.as_deref())
        .load(env_overrides, args_overrides)
        .with_context(|| "Failed to load configuration")?;

    info!(
        "Running with config:\n{}",
        serde_json::to_string_pretty(&config).with_context(|| "Failed to serialize configuration")?
    );

    let library = match NvmlLibrary::init() {
        Ok(library) => Some(library),
        Err(err) if config.fail_on_init_error => {
            return Err(err).with_context(|| "Failed to initialize NVML");
        }
        Err(err) => {
            warn!("Failed to initialize NVML, NVML labels are disabled: {err}");
            None
        }
    };

    let pci = SysfsPci::new(&config.sysfs_pci_root);
    let mut label_manager = LabelManager::new(config, library, pci)?;

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Use this channel to move errors to the main task
    let (tx_err, mut rx_err) = mpsc::channel(16);

    // Start the label manager
    {
        let token = token.clone();

        tracker.spawn(async move {
            label_manager.run(token, tx_err).await;
        });
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut failed = false;

    loop {
        select! {
            result = &mut shutdown => {
                result?;
                break;
            },
            err_msg = rx_err.recv() => {
                match err_msg {
                    Some(err) => {
                        failed = true;

                        for e in err.chain() {
                            error!("{e}");
                        }
                    },
                    // Every sender is gone, the label manager is done
                    None => break,
                }
            }
        }
    }

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();

    // Wait for the tasks to finish
    tracker.close();
    tracker.wait().await;

    if failed {
        bail!("Label manager stopped on error");
    }

    Ok(())
}
