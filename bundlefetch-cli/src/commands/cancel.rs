//! Cancel command - drop a task and its staged data.

use bundlefetch::TaskId;

use crate::error::CliError;
use crate::runner::{CliRunner, GlobalArgs};

/// Run the cancel command. `id` may be a unique prefix of the task id.
pub fn run(global: &GlobalArgs, id: &str) -> Result<(), CliError> {
    let runner = CliRunner::new(global)?;
    runner.log_startup("cancel");

    runner.runtime()?.block_on(async {
        let (orchestrator, _events) = runner.launch().await?;
        let tasks = orchestrator.list_tasks().await?;

        let result = match resolve_id(tasks.iter().map(|t| &t.id), id) {
            Ok(task_id) => match orchestrator.cancel(&task_id).await {
                Ok(()) => {
                    println!("Cancelled {}", task_id);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };

        orchestrator.shutdown().await?;
        result
    })
}

fn resolve_id<'a>(ids: impl Iterator<Item = &'a TaskId>, prefix: &str) -> Result<TaskId, CliError> {
    let matches: Vec<&TaskId> = ids.filter(|id| id.as_str().starts_with(prefix)).collect();
    match matches.as_slice() {
        [id] => Ok((*id).clone()),
        [] => Err(CliError::Argument(format!("no task matches '{}'", prefix))),
        _ => Err(CliError::Argument(format!(
            "'{}' matches {} tasks; use a longer prefix",
            prefix,
            matches.len()
        ))),
    }
}
