//! Fetch command - download a single artifact.

use std::path::PathBuf;

use bundlefetch::transfer::HttpTransfer;
use bundlefetch::DownloadRequest;

use super::common::{
    interrupt_signal, short_id, watch, ContentTypeArg, PriorityArg, ProgressBoard,
};
use crate::error::CliError;
use crate::runner::{CliRunner, GlobalArgs};

/// Arguments for the fetch command.
pub struct FetchArgs {
    pub url: Option<String>,
    pub chunk_urls: Vec<String>,
    pub size: Option<u64>,
    pub chunk_size: Option<u64>,
    pub sha256: Option<String>,
    pub chunk_sha256: Vec<String>,
    pub output: Option<PathBuf>,
    pub priority: PriorityArg,
    pub content_type: ContentTypeArg,
}

/// Run the fetch command.
pub fn run(global: &GlobalArgs, args: FetchArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(global)?;
    runner.log_startup("fetch");
    let interrupt = interrupt_signal()?;

    runner.runtime()?.block_on(async {
        let request = build_request(&runner, args).await?;
        let (orchestrator, mut events) = runner.launch().await?;

        let task_id = orchestrator.start(request).await?;
        let tasks = orchestrator.list_tasks().await?;
        let mut board = ProgressBoard::new();
        if let Some(task) = tasks.iter().find(|t| t.id == task_id) {
            println!(
                "Task {}: {} chunk(s) -> {}",
                short_id(&task.id),
                task.total_chunks(),
                task.destination.display()
            );
            board.add(task);
        }

        let summary = watch(&orchestrator, &mut events, &board, &interrupt).await?;
        orchestrator.shutdown().await?;
        summary.into_result()
    })
}

async fn build_request(runner: &CliRunner, args: FetchArgs) -> Result<DownloadRequest, CliError> {
    let config = runner.config();

    let mut request = match (args.url, args.chunk_urls.is_empty()) {
        (Some(_), false) => {
            return Err(CliError::Argument(
                "use either --url or --chunk-url, not both".to_string(),
            ))
        }
        (None, true) => {
            return Err(CliError::Argument(
                "a source is required: --url or --chunk-url".to_string(),
            ))
        }
        (None, false) => {
            let size = args.size.ok_or_else(|| {
                CliError::Argument("--chunk-url requires --size".to_string())
            })?;
            let chunk_size = args.chunk_size.ok_or_else(|| {
                CliError::Argument("--chunk-url requires --chunk-size".to_string())
            })?;
            DownloadRequest::per_chunk(args.chunk_urls, chunk_size, size)
        }
        (Some(url), true) => {
            let probe = |reason: String| CliError::Probe {
                url: url.clone(),
                reason,
            };
            match args.size {
                Some(size) => {
                    let request = DownloadRequest::ranged(url.clone(), size);
                    match args.chunk_size {
                        Some(chunk_size) => request.with_chunk_size(chunk_size),
                        None => request,
                    }
                }
                None => {
                    let transfer = HttpTransfer::with_timeout(config.request_timeout)?;
                    let info = transfer
                        .probe(&url)
                        .await
                        .map_err(|e| probe(e.to_string()))?;
                    let size = info.size.ok_or_else(|| {
                        probe("server did not report a size; pass --size".to_string())
                    })?;
                    if info.supports_ranges {
                        let request = DownloadRequest::ranged(info.final_url, size);
                        match args.chunk_size {
                            Some(chunk_size) => request.with_chunk_size(chunk_size),
                            None => request,
                        }
                    } else {
                        println!("Server does not support range requests; fetching as one chunk");
                        DownloadRequest::per_chunk(vec![info.final_url], size, size)
                    }
                }
            }
        }
    };

    if !args.chunk_sha256.is_empty() {
        request = request.with_chunk_digests(args.chunk_sha256);
    }
    if let Some(digest) = args.sha256 {
        request = request.with_artifact_digest(digest);
    }
    if let Some(output) = args.output {
        request = request.with_destination(output);
    }

    Ok(request
        .with_priority(args.priority.into())
        .with_content_type(args.content_type.into()))
}
