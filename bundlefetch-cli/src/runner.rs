//! Shared command setup: configuration, logging and the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::info;

use bundlefetch::config::{ConfigFile, DownloadConfig};
use bundlefetch::logging::{init_logging, LoggingGuard};
use bundlefetch::orchestrator::{ChannelListener, DownloadEvent, DownloadOrchestrator};

use crate::error::CliError;

/// Global options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    pub work_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub verbose: bool,
}

/// Resolved configuration plus the logging guard for one CLI invocation.
pub struct CliRunner {
    config: DownloadConfig,
    _logging: Option<LoggingGuard>,
}

impl CliRunner {
    /// Load configuration (file, then CLI overrides) and install logging.
    pub fn new(args: &GlobalArgs) -> Result<Self, CliError> {
        let config = resolve_config(args)?;
        let logging = init_logging(&config.log_dir(), args.verbose).ok();
        Ok(Self {
            config,
            _logging: logging,
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Log the start of a command.
    pub fn log_startup(&self, command: &str) {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command,
            work_dir = %self.config.work_dir.display(),
            "bundlefetch starting"
        );
    }

    /// Build the multi-threaded runtime commands run on.
    pub fn runtime(&self) -> Result<Runtime, CliError> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?)
    }

    /// Launch the orchestrator with a channel listener for progress display.
    pub async fn launch(
        &self,
    ) -> Result<(DownloadOrchestrator, mpsc::UnboundedReceiver<DownloadEvent>), CliError> {
        let (listener, events) = ChannelListener::new();
        let orchestrator = DownloadOrchestrator::builder(self.config.clone())
            .listener(Arc::new(listener))
            .launch()
            .await?;
        Ok((orchestrator, events))
    }
}

/// Read the config file and apply CLI overrides.
pub fn resolve_config(args: &GlobalArgs) -> Result<DownloadConfig, CliError> {
    let file = match &args.config {
        Some(path) => ConfigFile::new(path),
        None => match ConfigFile::default_path() {
            Some(path) => ConfigFile::new(path),
            None => return apply_overrides(DownloadConfig::default(), args),
        },
    };
    apply_overrides(file.load()?, args)
}

fn apply_overrides(mut config: DownloadConfig, args: &GlobalArgs) -> Result<DownloadConfig, CliError> {
    if let Some(work_dir) = &args.work_dir {
        // Keep an explicitly configured output directory
        if config.output_dir == config.work_dir.join("content") {
            config.output_dir = work_dir.join("content");
        }
        config.work_dir = work_dir.clone();
    }
    config
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;
    Ok(config)
}
