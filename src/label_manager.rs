use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::{select, sync::mpsc::Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    common_labels::generate_common_labels,
    config_manager::Config,
    errors::GfdError,
    gpu_device::GpuLibrary,
    labels::{self, Labels, key},
    mig_strategy::MigStrategy,
    pci::PciProvider,
    vgpu::VgpuLabeler,
};

// Produce the node labels and keep the output file up to date
pub struct LabelManager<L: GpuLibrary, P: PciProvider> {
    config: Config,
    mig_strategy: MigStrategy,

    // None when NVML failed to initialize and
    // the daemon was told to carry on without it
    library: Option<L>,
    vgpu: VgpuLabeler<P>,

    // Set once at start up, lowest priority label source
    timestamp: Option<Labels>,
}

impl<L: GpuLibrary, P: PciProvider> LabelManager<L, P> {
    pub fn new(config: Config, library: Option<L>, pci: P) -> Result<Self, GfdError> {
        let mig_strategy = config.mig_strategy.parse::<MigStrategy>()?;

        let timestamp = (!config.no_timestamp).then(|| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();

            Labels::from_iter([(key("gfd.timestamp"), now)])
        });

        Ok(Self {
            config,
            mig_strategy,
            library,
            vgpu: VgpuLabeler::new(pci),
            timestamp,
        })
    }

    // Labels from the GPU library, empty without devices
    fn nvml_labels(&self) -> Result<Labels, GfdError> {
        let Some(library) = &self.library else {
            debug!("NVML is not available, skipping NVML labels");
            return Ok(Labels::new());
        };

        if library.device_count()? == 0 {
            debug!("No GPU found, skipping NVML labels");
            return Ok(Labels::new());
        }

        let common = generate_common_labels(library, &self.config.machine_type_file)?;
        let mig = self.mig_strategy.generate_labels(library)?;

        Ok(Labels::merge([Some(&common), Some(&mig)]))
    }

    /// Run one label generation pass.
    ///
    /// Sources are merged from the lowest to the highest priority:
    /// timestamp, vGPU, then NVML (common labels then MIG strategy labels).
    pub fn generate_labels(&self) -> Result<Labels> {
        let vgpu = self
            .vgpu
            .labels()
            .with_context(|| "Failed to generate vGPU labels")?;

        let nvml = self
            .nvml_labels()
            .with_context(|| "Failed to generate NVML labels")?;

        if vgpu.is_empty() && nvml.is_empty() {
            warn!("No labels generated from any source");
        }

        Ok(Labels::merge([self.timestamp.as_ref(), Some(&vgpu), Some(&nvml)]))
    }

    // Generate the labels and write them to the output file
    fn label_pass(&self) -> Result<()> {
        let labels = self.generate_labels()?;

        trace!("Generated labels: {labels:?}");

        labels
            .write_to_file(&self.config.output_file)
            .with_context(|| format!("Failed to write labels to {:?}", self.config.output_file))?;

        debug!("Wrote {} labels", labels.len());

        Ok(())
    }

    // Run the label manager
    pub async fn run(&mut self, run_token: CancellationToken, tx_err: Sender<anyhow::Error>) {
        info!("Label manager: Running");

        loop {
            // A failed pass stops the daemon
            if let Err(err) = self.label_pass() {
                tx_err.send(err).await.unwrap_or_else(|err| {
                    error!("Failed to send error over channel: {err}");
                });

                break;
            }

            if self.config.oneshot {
                info!("Label manager: Oneshot pass done");
                break;
            }

            trace!("Sleeping for {:?}", self.config.sleep_interval);

            select! {
                _ = run_token.cancelled() => {
                    info!("Label manager: Quiting");

                    break;
                },
                _ = tokio::time::sleep(self.config.sleep_interval) => {}
            }
        }

        // The output file only lives as long as the daemon
        if !self.config.oneshot {
            if let Err(err) = labels::remove_output_file(&self.config.output_file) {
                warn!("Error removing output file: {err}");
            }
        }
    }
}
