//! Status command - list persisted tasks without starting any transfers.

use console::style;
use indicatif::HumanBytes;

use bundlefetch::store::{JsonTaskStore, TaskStore};
use bundlefetch::{DownloadError, DownloadTask, TaskStatus};

use super::common::{short_id, task_label};
use crate::error::CliError;
use crate::runner::{resolve_config, GlobalArgs};

/// Run the status command.
pub fn run(global: &GlobalArgs) -> Result<(), CliError> {
    let config = resolve_config(global)?;
    let store = match JsonTaskStore::open(config.store_path()) {
        Ok(store) => store,
        Err(DownloadError::StoreLocked { path }) => {
            println!(
                "Task store {} is in use by a running bundlefetch process",
                path.display()
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut tasks = store.load()?;
    if tasks.is_empty() {
        println!("No tasks");
        return Ok(());
    }
    tasks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });

    println!(
        "{:<10} {:<20} {:<12} {:<9} {:>8} {:>12}  {}",
        "ID", "NAME", "STATUS", "PRIORITY", "CHUNKS", "SIZE", "PROGRESS"
    );
    for task in &tasks {
        println!("{}", format_row(task));
        if let Some(error) = &task.error {
            println!("{:<10} {}", "", style(error).red());
        }
    }
    Ok(())
}

fn format_row(task: &DownloadTask) -> String {
    let status = format!("{:<12}", task.status.to_string());
    let status = match task.status {
        TaskStatus::Completed => style(status).green(),
        TaskStatus::Failed => style(status).red(),
        TaskStatus::Paused => style(status).yellow(),
        TaskStatus::Downloading | TaskStatus::Pending => style(status).cyan(),
    };
    format!(
        "{:<10} {:<20} {} {:<9} {:>8} {:>12}  {:.1}%",
        short_id(&task.id),
        task_label(task),
        status,
        task.priority.to_string(),
        format!("{}/{}", task.completed_chunks(), task.total_chunks()),
        HumanBytes(task.total_size).to_string(),
        task.progress_percent()
    )
}
