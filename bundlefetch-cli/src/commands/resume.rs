//! Resume command - continue interrupted, paused and (optionally) failed tasks.

use bundlefetch::TaskStatus;

use super::common::{interrupt_signal, short_id, task_label, watch, ProgressBoard};
use crate::error::CliError;
use crate::runner::{CliRunner, GlobalArgs};

/// Arguments for the resume command.
pub struct ResumeArgs {
    /// Also start a fresh retry round for failed tasks.
    pub retry_failed: bool,
}

/// Run the resume command.
///
/// Tasks that were downloading when the previous process stopped resume on
/// their own once the orchestrator recovers them; paused tasks are resumed
/// explicitly.
pub fn run(global: &GlobalArgs, args: ResumeArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(global)?;
    runner.log_startup("resume");
    let interrupt = interrupt_signal()?;

    runner.runtime()?.block_on(async {
        let (orchestrator, mut events) = runner.launch().await?;

        for task in orchestrator.list_tasks().await? {
            let wanted = match task.status {
                TaskStatus::Paused => true,
                TaskStatus::Failed => args.retry_failed,
                _ => false,
            };
            if wanted {
                println!("Resuming {} ({})", task_label(&task), task.status);
                orchestrator.resume(&task.id).await?;
            }
        }

        let mut board = ProgressBoard::new();
        for task in orchestrator.list_tasks().await? {
            match task.status {
                TaskStatus::Downloading | TaskStatus::Pending => board.add(&task),
                TaskStatus::Failed => println!(
                    "Skipping failed task {} ({}); use --retry-failed",
                    short_id(&task.id),
                    task.error.as_deref().unwrap_or("unknown error")
                ),
                _ => {}
            }
        }

        if board.is_empty() {
            println!("Nothing to resume");
            orchestrator.shutdown().await?;
            return Ok(());
        }

        let summary = watch(&orchestrator, &mut events, &board, &interrupt).await?;
        orchestrator.shutdown().await?;
        summary.into_result()
    })
}
