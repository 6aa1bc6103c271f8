//! Final artifact assembly.
//!
//! Promoted chunk files are concatenated in index order into a staging file
//! while hashing. The engine decides afterwards whether the staged file may
//! be renamed into place.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use super::layout::{partial_path, WorkLayout};
use super::machine::AssemblyPlan;
use crate::error::{DownloadError, DownloadResult};
use crate::verify::Verification;

const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// A staged artifact awaiting commit.
#[derive(Debug)]
pub(crate) struct StagedArtifact {
    pub partial: PathBuf,
    pub size: u64,
    pub verification: Verification,
}

/// Concatenate a task's chunks into `<destination>.partial`.
///
/// Every chunk file must hold exactly its planned size. Blocking; run it on
/// the blocking pool.
pub(crate) fn assemble(layout: &WorkLayout, plan: &AssemblyPlan) -> DownloadResult<StagedArtifact> {
    let partial = partial_path(&plan.destination);
    if let Some(parent) = partial.parent() {
        fs::create_dir_all(parent).map_err(|e| DownloadError::io(parent, e))?;
    }

    let result = write_partial(layout, plan, &partial);
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    let (size, digest) = result?;

    debug!(
        task_id = %plan.task_id,
        bytes = size,
        path = %partial.display(),
        "Staged assembled artifact"
    );

    Ok(StagedArtifact {
        partial,
        size,
        verification: Verification::compare(digest, plan.expected_digest.as_deref()),
    })
}

fn write_partial(
    layout: &WorkLayout,
    plan: &AssemblyPlan,
    partial: &Path,
) -> DownloadResult<(u64, String)> {
    let file = File::create(partial).map_err(|e| DownloadError::io(partial, e))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    for (index, size) in &plan.chunks {
        let path = layout.chunk_path(&plan.task_id, *index);
        let mut chunk = File::open(&path).map_err(|e| DownloadError::io(&path, e))?;
        let mut copied = 0u64;

        loop {
            let n = chunk
                .read(&mut buffer)
                .map_err(|e| DownloadError::io(&path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            writer
                .write_all(&buffer[..n])
                .map_err(|e| DownloadError::io(partial, e))?;
            copied += n as u64;
        }

        if copied != *size {
            return Err(DownloadError::IntegrityMismatch {
                subject: format!("chunk {} of task {}", index, plan.task_id),
                expected: format!("{} bytes", size),
                actual: format!("{} bytes", copied),
            });
        }
        total += copied;
    }

    let file = writer
        .into_inner()
        .map_err(|e| DownloadError::io(partial, e.into_error()))?;
    file.sync_all().map_err(|e| DownloadError::io(partial, e))?;

    Ok((total, format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskId;
    use crate::verify::calculate_file_checksum;
    use tempfile::TempDir;

    fn setup(chunks: &[&[u8]]) -> (TempDir, WorkLayout, TaskId) {
        let temp = TempDir::new().unwrap();
        let layout = WorkLayout::new(temp.path().join("tasks"));
        let id = TaskId::from("t1");
        fs::create_dir_all(layout.chunks_dir(&id)).unwrap();
        for (i, data) in chunks.iter().enumerate() {
            fs::write(layout.chunk_path(&id, i as u32), data).unwrap();
        }
        (temp, layout, id)
    }

    fn plan(temp: &TempDir, id: &TaskId, sizes: &[u64], digest: Option<&str>) -> AssemblyPlan {
        AssemblyPlan {
            task_id: id.clone(),
            chunks: sizes.iter().enumerate().map(|(i, s)| (i as u32, *s)).collect(),
            destination: temp.path().join("out").join("artifact.bin"),
            expected_digest: digest.map(String::from),
        }
    }

    #[test]
    fn test_assemble_in_index_order() {
        let (temp, layout, id) = setup(&[b"hello ", b"wor", b"ld"]);
        let expected = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

        let staged = assemble(&layout, &plan(&temp, &id, &[6, 3, 2], Some(expected))).unwrap();

        assert_eq!(staged.size, 11);
        assert!(staged.verification.is_verified());
        assert_eq!(fs::read(&staged.partial).unwrap(), b"hello world");
        assert_eq!(calculate_file_checksum(&staged.partial).unwrap(), expected);
        assert!(staged.partial.to_string_lossy().ends_with("artifact.bin.partial"));
    }

    #[test]
    fn test_assemble_without_digest_is_provisional() {
        let (temp, layout, id) = setup(&[b"abc"]);
        let staged = assemble(&layout, &plan(&temp, &id, &[3], None)).unwrap();
        assert!(matches!(staged.verification, Verification::Provisional { .. }));
    }

    #[test]
    fn test_assemble_reports_mismatch() {
        let (temp, layout, id) = setup(&[b"abc"]);
        let staged = assemble(&layout, &plan(&temp, &id, &[3], Some("00ff"))).unwrap();
        assert!(matches!(staged.verification, Verification::Mismatch { .. }));
    }

    #[test]
    fn test_assemble_rejects_short_chunk() {
        let (temp, layout, id) = setup(&[b"abc", b"d"]);
        let plan = plan(&temp, &id, &[3, 3], None);

        let err = assemble(&layout, &plan).unwrap_err();
        assert!(matches!(err, DownloadError::IntegrityMismatch { .. }));
        assert!(!partial_path(&plan.destination).exists());
    }

    #[test]
    fn test_assemble_missing_chunk() {
        let (temp, layout, id) = setup(&[b"abc"]);
        let err = assemble(&layout, &plan(&temp, &id, &[3, 3], None)).unwrap_err();
        assert!(matches!(err, DownloadError::Io { .. }));
    }
}
