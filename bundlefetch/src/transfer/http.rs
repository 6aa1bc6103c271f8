//! reqwest-backed chunk transfer.
//!
//! Ranged chunks are fetched with `Range: bytes=a-b` and must be answered with
//! `206 Partial Content`; a server that ignores the header and replies `200`
//! would hand back the whole artifact, so that is treated as a failure.
//! Whole-resource chunks (one URL per chunk) accept any `2xx`.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    BoxFuture, ChunkTransfer, ProgressFn, TransferError, TransferReceipt, TransferRequest,
};
use crate::error::{DownloadError, DownloadResult};

/// Default timeout for connecting and for each body read.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Buffer size for writing chunk bodies (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// What a `HEAD` request reveals about a remote artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Content length, if the server reported one.
    pub size: Option<u64>,
    /// Whether the server advertises `Accept-Ranges: bytes`.
    pub supports_ranges: bool,
    /// URL after following redirects.
    pub final_url: String,
}

/// HTTP chunk transfer over a shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: Client,
    timeout: Duration,
}

impl HttpTransfer {
    /// Create a transfer with the default timeout.
    pub fn new() -> DownloadResult<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a transfer with a custom timeout.
    ///
    /// The timeout bounds connection setup and every individual body read,
    /// not the whole chunk, so slow but steady links are not cut off.
    pub fn with_timeout(timeout: Duration) -> DownloadResult<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("bundlefetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Query size and range support of a remote artifact via `HEAD`.
    pub async fn probe(&self, url: &str) -> Result<RemoteInfo, TransferError> {
        let response = tokio::time::timeout(self.timeout, self.client.head(url).send())
            .await
            .map_err(|_| TransferError::Timeout)?
            .map_err(classify)?;

        if !response.status().is_success() {
            return Err(TransferError::Http {
                status: response.status().as_u16(),
            });
        }

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let supports_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(RemoteInfo {
            size,
            supports_ranges,
            final_url: response.url().to_string(),
        })
    }

    async fn stream_to_file(
        &self,
        request: &TransferRequest,
        progress: &ProgressFn,
    ) -> Result<TransferReceipt, TransferError> {
        if let Some(parent) = request.temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut builder = self.client.get(&request.url);
        if let Some(range) = request.range_header() {
            builder = builder.header(RANGE, range);
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| TransferError::Timeout)?
            .map_err(classify)?;

        check_status(response.status(), request.range.is_some())?;

        if let Some(len) = response.content_length() {
            if len != request.expected_len {
                return Err(TransferError::LengthMismatch {
                    expected: request.expected_len,
                    actual: len,
                });
            }
        }

        let file = File::create(&request.temp_path).await?;
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(next) = tokio::time::timeout(self.timeout, stream.next())
            .await
            .map_err(|_| TransferError::Timeout)?
        {
            let bytes = next.map_err(classify)?;
            written += bytes.len() as u64;
            if written > request.expected_len {
                return Err(TransferError::LengthMismatch {
                    expected: request.expected_len,
                    actual: written,
                });
            }
            writer.write_all(&bytes).await?;
            progress(written);
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        if written != request.expected_len {
            return Err(TransferError::LengthMismatch {
                expected: request.expected_len,
                actual: written,
            });
        }

        trace!(url = %request.url, bytes = written, "Chunk body written");
        Ok(TransferReceipt {
            path: request.temp_path.clone(),
            bytes: written,
        })
    }
}

impl ChunkTransfer for HttpTransfer {
    fn fetch(
        &self,
        request: TransferRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<TransferReceipt, TransferError>> {
        Box::pin(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                result = self.stream_to_file(&request, &progress) => result,
            };

            if let Err(e) = &result {
                debug!(url = %request.url, error = %e, "Chunk transfer failed");
                remove_temp(&request.temp_path).await;
            }
            result
        })
    }
}

fn check_status(status: StatusCode, ranged: bool) -> Result<(), TransferError> {
    let ok = if ranged {
        status == StatusCode::PARTIAL_CONTENT
    } else {
        status.is_success()
    };

    if ok {
        Ok(())
    } else {
        Err(TransferError::Http {
            status: status.as_u16(),
        })
    }
}

fn classify(error: reqwest::Error) -> TransferError {
    if error.is_timeout() {
        TransferError::Timeout
    } else if let Some(status) = error.status() {
        TransferError::Http {
            status: status.as_u16(),
        }
    } else {
        TransferError::Connection(error.to_string())
    }
}

async fn remove_temp(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Failed to remove temp file"),
    }
}
