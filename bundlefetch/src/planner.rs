//! Chunk planning.
//!
//! Splits a declared artifact size into fixed-size byte ranges. The plan is a
//! pure function of its inputs: re-planning a resumed task reproduces the
//! exact boundaries its persisted chunk state refers to.

use crate::error::{DownloadError, DownloadResult};

/// One planned byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
}

/// Partition `total_size` bytes into chunks of `chunk_size`.
///
/// Every chunk is `chunk_size` bytes except the last, which holds
/// `total_size % chunk_size` bytes when that is nonzero.
///
/// # Errors
///
/// Returns `InvalidRequest` if either size is zero or the plan would need
/// more than `u32::MAX` chunks.
pub fn plan(total_size: u64, chunk_size: u64) -> DownloadResult<Vec<ChunkSpan>> {
    if total_size == 0 {
        return Err(DownloadError::InvalidRequest(
            "artifact size must be greater than zero".to_string(),
        ));
    }
    if chunk_size == 0 {
        return Err(DownloadError::InvalidRequest(
            "chunk size must be greater than zero".to_string(),
        ));
    }

    let count = total_size.div_ceil(chunk_size);
    if count > u32::MAX as u64 {
        return Err(DownloadError::InvalidRequest(format!(
            "{} bytes in {}-byte chunks needs {} chunks",
            total_size, chunk_size, count
        )));
    }

    let spans = (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            ChunkSpan {
                index: i as u32,
                offset,
                size: chunk_size.min(total_size - offset),
            }
        })
        .collect();

    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_with_remainder() {
        let spans = plan(250 * MB, 100 * MB).unwrap();
        let sizes: Vec<u64> = spans.iter().map(|s| s.size).collect();
        assert_eq!(sizes, vec![100 * MB, 100 * MB, 50 * MB]);
        assert_eq!(spans[2].offset, 200 * MB);
    }

    #[test]
    fn test_plan_exact_multiple() {
        let spans = plan(300, 100).unwrap();
        assert_eq!(spans.len(), 3);
        assert!(spans.iter().all(|s| s.size == 100));
    }

    #[test]
    fn test_plan_smaller_than_chunk() {
        let spans = plan(10, 100).unwrap();
        assert_eq!(
            spans,
            vec![ChunkSpan {
                index: 0,
                offset: 0,
                size: 10
            }]
        );
    }

    #[test]
    fn test_plan_rejects_zero_sizes() {
        assert!(plan(0, 100).is_err());
        assert!(plan(100, 0).is_err());
    }

    #[test]
    fn test_plan_is_deterministic() {
        assert_eq!(plan(12_345, 1_000).unwrap(), plan(12_345, 1_000).unwrap());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_plan_covers_total(
                total in 1u64..2_000_000,
                chunk in 64u64..1_000_000
            ) {
                let spans = plan(total, chunk)?;

                let sum: u64 = spans.iter().map(|s| s.size).sum();
                prop_assert_eq!(sum, total);
                prop_assert!(spans.iter().all(|s| s.size > 0), "zero-size chunk");

                let short = spans.iter().filter(|s| s.size < chunk).count();
                if total % chunk == 0 {
                    prop_assert_eq!(short, 0);
                } else {
                    prop_assert_eq!(short, 1);
                    prop_assert_eq!(spans.last().unwrap().size, total % chunk);
                }
            }

            #[test]
            fn test_plan_is_contiguous(
                total in 1u64..2_000_000,
                chunk in 64u64..1_000_000
            ) {
                let spans = plan(total, chunk)?;
                let mut expected = 0u64;
                for (i, span) in spans.iter().enumerate() {
                    prop_assert_eq!(span.index as usize, i);
                    prop_assert_eq!(span.offset, expected);
                    expected += span.size;
                }
            }
        }
    }
}
