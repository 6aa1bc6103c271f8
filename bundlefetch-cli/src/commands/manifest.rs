//! Manifest command - download a module described by a content manifest.

use std::path::PathBuf;

use bundlefetch::manifest::{Manifest, ManifestModule, CORE_MODULE};

use super::common::{interrupt_signal, watch, PriorityArg, ProgressBoard};
use crate::error::CliError;
use crate::runner::{CliRunner, GlobalArgs};

/// Arguments for the manifest command.
pub struct ManifestArgs {
    pub file: PathBuf,
    pub module: Option<String>,
    pub dest: Option<PathBuf>,
    pub priority: Option<PriorityArg>,
    pub list: bool,
}

/// Run the manifest command.
pub fn run(global: &GlobalArgs, args: ManifestArgs) -> Result<(), CliError> {
    let manifest = Manifest::from_file(&args.file)?;

    if args.list {
        print_modules(&manifest);
        return Ok(());
    }

    let runner = CliRunner::new(global)?;
    runner.log_startup("manifest");

    let (name, module) = manifest.select(args.module.as_deref())?;
    let dest = args
        .dest
        .clone()
        .unwrap_or_else(|| runner.config().output_dir.clone());
    let (content_type, default_priority) = ManifestModule::defaults_for(name);
    let priority = args.priority.map(Into::into).unwrap_or(default_priority);
    let request = module.to_request(name, &dest, content_type, priority)?;

    let interrupt = interrupt_signal()?;
    runner.runtime()?.block_on(async {
        let (orchestrator, mut events) = runner.launch().await?;
        let task_id = orchestrator.start(request).await?;

        let mut board = ProgressBoard::new();
        if let Some(task) = orchestrator
            .list_tasks()
            .await?
            .into_iter()
            .find(|t| t.id == task_id)
        {
            println!(
                "Module '{}' ({}): {} chunk(s) -> {}",
                name,
                content_type,
                task.total_chunks(),
                task.destination.display()
            );
            board.add(&task);
        }

        let summary = watch(&orchestrator, &mut events, &board, &interrupt).await?;
        orchestrator.shutdown().await?;
        summary.into_result()
    })
}

fn print_modules(manifest: &Manifest) {
    if let Some(version) = &manifest.version {
        println!("Manifest version {}", version);
    }
    let core = manifest.core.iter().map(|m| (CORE_MODULE, m));
    let modules = manifest
        .modules
        .iter()
        .map(|(name, m)| (name.as_str(), m));
    for (name, module) in core.chain(modules) {
        let size = module
            .size
            .map(|s| indicatif::HumanBytes(s).to_string())
            .unwrap_or_else(|| "unknown size".to_string());
        println!("  {:<20} {:>12}  {}", name, size, module.file_name(name));
    }
}
