//! Storage command - report capacity of the work directory's filesystem.

use indicatif::HumanBytes;

use bundlefetch::storage::{FsStorageAdvisor, StorageAdvisor};

use crate::error::CliError;
use crate::runner::{resolve_config, GlobalArgs};

/// Run the storage command.
pub fn run(global: &GlobalArgs) -> Result<(), CliError> {
    let config = resolve_config(global)?;
    let advisor = FsStorageAdvisor::new(&config.work_dir, config.safety_margin_bytes);
    let info = advisor.info()?;

    println!("Work directory: {}", config.work_dir.display());
    println!("  Total:          {}", HumanBytes(info.total));
    println!("  Available:      {}", HumanBytes(info.available));
    println!("  Used by tasks:  {}", HumanBytes(info.used_by_app));
    println!("  Safety margin:  {}", HumanBytes(advisor.safety_margin()));
    println!(
        "  Admissible:     {}",
        HumanBytes(info.available.saturating_sub(advisor.safety_margin()))
    );
    Ok(())
}
