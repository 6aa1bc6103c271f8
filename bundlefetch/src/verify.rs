//! SHA-256 integrity verification for chunks and assembled artifacts.
//!
//! A missing expected digest is not a pass: the result is
//! [`Verification::Provisional`], carrying the computed digest so the caller
//! can record it and rely on whole-artifact verification later.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{DownloadError, DownloadResult};

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of comparing a file against an (optional) expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Computed digest equals the expected digest.
    Verified { digest: String },
    /// No expected digest was known; the bytes are accepted pending a later check.
    Provisional { digest: String },
    /// Computed digest differs from the expected digest.
    Mismatch { expected: String, actual: String },
}

impl Verification {
    /// Compare a computed digest with an optional expectation.
    pub fn compare(actual: String, expected: Option<&str>) -> Self {
        match expected {
            Some(expected) if digests_match(expected, &actual) => Self::Verified { digest: actual },
            Some(expected) => Self::Mismatch {
                expected: expected.to_string(),
                actual,
            },
            None => Self::Provisional { digest: actual },
        }
    }

    /// Whether the bytes matched an expected digest.
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    /// The computed digest.
    pub fn digest(&self) -> &str {
        match self {
            Self::Verified { digest } | Self::Provisional { digest } => digest,
            Self::Mismatch { actual, .. } => actual,
        }
    }

    /// Convert a mismatch into an [`DownloadError::IntegrityMismatch`].
    pub fn into_result(self, subject: impl Into<String>) -> DownloadResult<Self> {
        match self {
            Self::Mismatch { expected, actual } => Err(DownloadError::IntegrityMismatch {
                subject: subject.into(),
                expected,
                actual,
            }),
            other => Ok(other),
        }
    }
}

/// Case-insensitive comparison of two hex digests.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Calculate SHA-256 checksum of a file.
///
/// # Returns
///
/// The lowercase hexadecimal SHA-256 hash of the file contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn calculate_file_checksum(path: &Path) -> DownloadResult<String> {
    let mut file = File::open(path).map_err(|e| DownloadError::io(path, e))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| DownloadError::io(path, e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify a transferred chunk against its expected digest.
pub fn verify_chunk(path: &Path, expected: Option<&str>) -> DownloadResult<Verification> {
    let actual = calculate_file_checksum(path)?;
    Ok(Verification::compare(actual, expected))
}

/// Verify an assembled artifact against its expected digest.
pub fn verify_artifact(path: &Path, expected: Option<&str>) -> DownloadResult<Verification> {
    let actual = calculate_file_checksum(path)?;
    Ok(Verification::compare(actual, expected))
}

/// Run [`verify_chunk`] on the blocking pool.
pub async fn verify_chunk_blocking(
    path: PathBuf,
    expected: Option<String>,
) -> DownloadResult<Verification> {
    tokio::task::spawn_blocking(move || verify_chunk(&path, expected.as_deref()))
        .await
        .map_err(|e| DownloadError::Store(format!("digest task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_calculate_file_checksum() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "test.txt", b"hello world");

        assert_eq!(calculate_file_checksum(&path).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn test_calculate_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "empty.txt", b"");

        // SHA-256 of empty string
        assert_eq!(
            calculate_file_checksum(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_calculate_nonexistent_file() {
        let result = calculate_file_checksum(Path::new("/nonexistent/file.txt"));
        assert!(matches!(result, Err(DownloadError::Io { .. })));
    }

    #[test]
    fn test_verify_chunk_match_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "chunk.part", b"hello world");

        let result = verify_chunk(&path, Some(&HELLO_WORLD.to_uppercase())).unwrap();
        assert!(result.is_verified());
        assert_eq!(result.digest(), HELLO_WORLD);
    }

    #[test]
    fn test_verify_chunk_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "chunk.part", b"hello world");

        let result = verify_chunk(&path, Some("wrong_checksum")).unwrap();
        assert!(matches!(result, Verification::Mismatch { .. }));
        assert_eq!(result.digest(), HELLO_WORLD);

        match result.into_result("chunk 0") {
            Err(DownloadError::IntegrityMismatch {
                subject, actual, ..
            }) => {
                assert_eq!(subject, "chunk 0");
                assert_eq!(actual, HELLO_WORLD);
            }
            other => panic!("Expected IntegrityMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_without_digest_is_provisional() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "artifact.bin", b"hello world");

        let result = verify_artifact(&path, None).unwrap();
        assert_eq!(
            result,
            Verification::Provisional {
                digest: HELLO_WORLD.to_string()
            }
        );
        assert!(!result.is_verified());
        assert!(result.into_result("artifact").is_ok());
    }

    #[test]
    fn test_large_file_checksum() {
        let temp = TempDir::new().unwrap();
        // Larger than the read buffer
        let path = write_file(&temp, "large.bin", &vec![0xABu8; 100_000]);

        let checksum = calculate_file_checksum(&path).unwrap();
        let checksum2 = calculate_file_checksum(&path).unwrap();
        assert_eq!(checksum, checksum2);
    }

    #[tokio::test]
    async fn test_verify_chunk_blocking() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "chunk.part", b"hello world");

        let result = verify_chunk_blocking(path, Some(HELLO_WORLD.to_string()))
            .await
            .unwrap();
        assert!(result.is_verified());
    }
}
