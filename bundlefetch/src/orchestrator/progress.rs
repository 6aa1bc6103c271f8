//! Progress snapshots and throughput measurement.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::model::{ChunkStatus, DownloadTask, TaskId, TaskStatus};

/// Default sliding window for instantaneous speed.
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Maximum samples to keep (prevents unbounded memory).
const MAX_SAMPLES: usize = 1024;

/// Derived, read-only view of a task's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Declared artifact size.
    pub total_bytes: u64,
    /// Completed chunk bytes plus in-flight progress.
    pub downloaded_bytes: u64,
    pub chunks_completed: usize,
    pub chunks_total: usize,
    /// Mean fractional progress of chunks currently in flight (0.0 to 1.0).
    pub current_chunk_progress: f64,
    /// Bytes per second over the recent window.
    pub speed_bytes_per_sec: f64,
    /// Bytes per second since the task started transferring in this session.
    pub average_bytes_per_sec: f64,
    /// Estimated time to completion at the average speed.
    pub eta: Option<Duration>,
}

impl DownloadProgress {
    /// Build a snapshot of `task`, with rates from `meter` when available.
    pub fn from_task(task: &DownloadTask, meter: Option<&ThroughputMeter>, now: Instant) -> Self {
        let downloaded_bytes = task.downloaded_bytes();
        let in_flight: Vec<f64> = task
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Downloading)
            .map(|c| c.fraction())
            .collect();
        let current_chunk_progress = if in_flight.is_empty() {
            0.0
        } else {
            in_flight.iter().sum::<f64>() / in_flight.len() as f64
        };

        let (speed, average, eta) = match meter {
            Some(meter) if task.status == TaskStatus::Downloading => {
                let remaining = task.total_size.saturating_sub(downloaded_bytes);
                (
                    meter.instantaneous_speed(),
                    meter.average_speed_at(now),
                    meter.eta_at(remaining, now),
                )
            }
            _ => (0.0, 0.0, None),
        };

        Self {
            task_id: task.id.clone(),
            status: task.status,
            total_bytes: task.total_size,
            downloaded_bytes,
            chunks_completed: task.completed_chunks(),
            chunks_total: task.total_chunks(),
            current_chunk_progress,
            speed_bytes_per_sec: speed,
            average_bytes_per_sec: average,
            eta,
        }
    }

    /// Progress as a percentage of declared bytes.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.downloaded_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Sliding-window throughput meter over a cumulative byte counter.
///
/// The counter may move backwards (a failed chunk drops its in-flight bytes);
/// the window restarts from that point rather than reporting negative speed.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    samples: VecDeque<Sample>,
    window: Duration,
    started: Sample,
}

impl ThroughputMeter {
    /// Start measuring at `now` from `bytes` already present.
    pub fn new(window: Duration, bytes: u64, now: Instant) -> Self {
        let start = Sample { at: now, bytes };
        let mut samples = VecDeque::with_capacity(64);
        samples.push_back(start);
        Self {
            samples,
            window,
            started: start,
        }
    }

    /// Record the cumulative byte count at `now`.
    pub fn record_at(&mut self, bytes: u64, now: Instant) {
        if let Some(last) = self.samples.back() {
            if bytes < last.bytes {
                self.samples.clear();
                self.started.bytes = self.started.bytes.min(bytes);
            }
        }

        self.samples.push_back(Sample { at: now, bytes });
        if self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.prune(now);
    }

    /// Bytes per second between the oldest and newest sample in the window.
    pub fn instantaneous_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        last.bytes.saturating_sub(first.bytes) as f64 / elapsed
    }

    /// Bytes per second since the meter started.
    pub fn average_speed_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started.at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let latest = self.samples.back().map(|s| s.bytes).unwrap_or(0);
        latest.saturating_sub(self.started.bytes) as f64 / elapsed
    }

    /// Time to transfer `remaining` bytes at the average speed.
    pub fn eta_at(&self, remaining: u64, now: Instant) -> Option<Duration> {
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let speed = self.average_speed_at(now);
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    // Keeps at least two samples so a stalled link still reports a rate.
    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(front) if front.at < cutoff => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkLocator, ContentType, DownloadChunk, Priority};
    use chrono::Utc;
    use std::path::PathBuf;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_meter_speed_and_average() {
        let t0 = Instant::now();
        let mut meter = ThroughputMeter::new(secs(5), 0, t0);

        meter.record_at(1_000, t0 + secs(1));
        meter.record_at(2_000, t0 + secs(2));

        assert_eq!(meter.instantaneous_speed(), 1_000.0);
        assert_eq!(meter.average_speed_at(t0 + secs(2)), 1_000.0);
        assert_eq!(meter.eta_at(4_000, t0 + secs(2)), Some(secs(4)));
    }

    #[test]
    fn test_meter_window_drops_old_samples() {
        let t0 = Instant::now();
        let mut meter = ThroughputMeter::new(secs(2), 0, t0);

        // Fast start, then slow
        meter.record_at(10_000, t0 + secs(1));
        meter.record_at(10_100, t0 + secs(10));
        meter.record_at(10_200, t0 + secs(11));

        assert_eq!(meter.instantaneous_speed(), 100.0);
        assert!(meter.average_speed_at(t0 + secs(11)) > 900.0);
    }

    #[test]
    fn test_meter_handles_counter_going_backwards() {
        let t0 = Instant::now();
        let mut meter = ThroughputMeter::new(secs(5), 0, t0);

        meter.record_at(5_000, t0 + secs(1));
        meter.record_at(1_000, t0 + secs(2));

        assert_eq!(meter.instantaneous_speed(), 0.0);
        assert!(meter.average_speed_at(t0 + secs(2)) >= 0.0);
    }

    #[test]
    fn test_meter_without_progress_has_no_eta() {
        let t0 = Instant::now();
        let meter = ThroughputMeter::new(secs(5), 0, t0);
        assert_eq!(meter.eta_at(100, t0 + secs(3)), None);
        assert_eq!(meter.eta_at(0, t0 + secs(3)), Some(Duration::ZERO));
    }

    #[test]
    fn test_progress_snapshot() {
        let id = TaskId::from("t1");
        let mut chunks = vec![
            DownloadChunk::new(&id, 0, 0, 100, ChunkLocator::ranged("http://a"), None),
            DownloadChunk::new(&id, 1, 100, 100, ChunkLocator::ranged("http://a"), None),
            DownloadChunk::new(&id, 2, 200, 50, ChunkLocator::ranged("http://a"), None),
        ];
        chunks[0].begin().unwrap();
        chunks[0].complete("d".into(), true).unwrap();
        chunks[1].begin().unwrap();
        chunks[1].record_progress(50);

        let now = Utc::now();
        let task = DownloadTask {
            id,
            content_type: ContentType::OptionalModule,
            priority: Priority::Medium,
            total_size: 250,
            chunk_size: 100,
            chunks,
            status: TaskStatus::Paused,
            destination: PathBuf::from("/tmp/x"),
            artifact_digest: None,
            label: None,
            retry_rounds: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        };

        let progress = DownloadProgress::from_task(&task, None, Instant::now());
        assert_eq!(progress.downloaded_bytes, 150);
        assert_eq!(progress.chunks_completed, 1);
        assert_eq!(progress.chunks_total, 3);
        assert_eq!(progress.current_chunk_progress, 0.5);
        assert!((progress.percent() - 60.0).abs() < 1e-9);
        assert_eq!(progress.eta, None);
    }
}
