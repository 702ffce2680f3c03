//! Frame timing statistics and throughput estimates.
//!
//! Timing works on [`FrameStamp`]s (sequence number plus capture timestamp)
//! so a frame-rate measurement never has to keep pixel buffers alive.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::FrameSample;
use crate::metrics::RunningStats;

/// Sequence number and timestamp of one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStamp {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp on the device's monotonic clock.
    pub timestamp: Duration,
}

impl From<&FrameSample> for FrameStamp {
    fn from(frame: &FrameSample) -> Self {
        Self {
            sequence: frame.sequence(),
            timestamp: frame.timestamp(),
        }
    }
}

/// Summary of a captured sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameTiming {
    /// Frames captured.
    pub frame_count: usize,
    /// Time between the first and last frame.
    pub elapsed: Duration,
    /// Frame periods per second over the elapsed span.
    pub fps: f64,
    /// Mean inter-frame interval, milliseconds.
    pub mean_interval_ms: f64,
    /// Standard deviation of the interval, milliseconds.
    pub jitter_ms: f64,
    /// Median interval, milliseconds.
    pub p50_ms: f64,
    /// 95th percentile interval, milliseconds.
    pub p95_ms: f64,
    /// 99th percentile interval, milliseconds.
    pub p99_ms: f64,
    /// Frames missing from the sequence numbering.
    pub dropped_frames: u64,
}

/// Compute timing statistics for a captured sequence.
///
/// `fps` is `(frames - 1) / (t_last - t_first)`: the number of frame periods
/// covered by the elapsed span. Returns `None` for fewer than two frames or
/// a zero elapsed time.
pub fn frame_timing(stamps: &[FrameStamp]) -> Option<FrameTiming> {
    let (first, last) = (stamps.first()?, stamps.last()?);
    let elapsed = last.timestamp.saturating_sub(first.timestamp);
    if stamps.len() < 2 || elapsed.is_zero() {
        return None;
    }

    let mut intervals: Vec<f64> = stamps
        .windows(2)
        .filter_map(|pair| match pair {
            [a, b] => Some(b.timestamp.saturating_sub(a.timestamp).as_secs_f64() * 1000.0),
            _ => None,
        })
        .collect();
    let mut stats = RunningStats::default();
    for &interval in &intervals {
        stats.push(interval);
    }
    intervals.sort_by(f64::total_cmp);

    #[allow(clippy::cast_precision_loss)]
    let periods = (stamps.len() - 1) as f64;

    Some(FrameTiming {
        frame_count: stamps.len(),
        elapsed,
        fps: periods / elapsed.as_secs_f64(),
        mean_interval_ms: stats.mean(),
        jitter_ms: stats.std_dev(),
        p50_ms: percentile(&intervals, 50.0),
        p95_ms: percentile(&intervals, 95.0),
        p99_ms: percentile(&intervals, 99.0),
        dropped_frames: dropped_frames(stamps),
    })
}

/// Nearest-rank percentile of an ascending slice. Zero for an empty slice.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let rank = (pct.clamp(0.0, 100.0) * sorted.len() as f64 / 100.0).ceil() as usize;
    sorted
        .get(rank.clamp(1, sorted.len()) - 1)
        .copied()
        .unwrap_or_default()
}

/// Count gaps in sequence numbering.
///
/// A jump from `n` to `n + k` counts `k - 1` dropped frames; repeats and
/// backwards jumps count nothing.
pub fn dropped_frames(stamps: &[FrameStamp]) -> u64 {
    stamps
        .windows(2)
        .map(|pair| match pair {
            [a, b] if b.sequence > a.sequence => u64::from(b.sequence - a.sequence - 1),
            _ => 0,
        })
        .sum()
}

/// Interface throughput in bytes per second.
pub fn throughput(bytes_per_frame: usize, fps: f64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let bytes = bytes_per_frame as f64;
    bytes * fps
}

/// Whether `actual` is within `tolerance` (relative) of `nominal`.
pub fn within_tolerance(actual: f64, nominal: f64, tolerance: f64) -> bool {
    (actual - nominal).abs() <= nominal.abs() * tolerance
}
