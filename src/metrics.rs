//! Stateless image metrics.
//!
//! Every function here is pure and deterministic for identical buffers.
//! Inputs are [`FrameSample`]s or their [`LumaPlane`] reductions, so the
//! geometry invariant already holds when these run.

use serde::{Deserialize, Serialize};

use crate::frame::{FrameSample, LumaPlane};

/// SNR reported for a perfectly flat frame, where the ratio is unbounded.
pub const SNR_CAP_DB: f64 = 100.0;

/// Streaming mean/variance (Welford).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub(crate) fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 = delta.mul_add(value - self.mean, self.m2);
    }

    pub(crate) const fn count(&self) -> u64 {
        self.count
    }

    pub(crate) const fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance.
    pub(crate) fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        (self.m2 / n).max(0.0)
    }

    pub(crate) fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub(crate) const fn min(&self) -> f64 {
        self.min
    }

    pub(crate) const fn max(&self) -> f64 {
        self.max
    }
}

/// Variance of the 3×3 discrete Laplacian over the frame's luma.
///
/// Higher is sharper. Only interior pixels are convolved.
pub fn sharpness(frame: &FrameSample) -> f64 {
    laplacian_variance(&frame.luma())
}

/// Variance of the 4-neighbour Laplacian `[0 1 0; 1 -4 1; 0 1 0]`.
///
/// Planes smaller than 3×3 have no interior and score 0.
pub fn laplacian_variance(plane: &LumaPlane) -> f64 {
    let width = plane.width();
    if width < 3 || plane.height() < 3 {
        return 0.0;
    }
    let rows: Vec<&[f32]> = plane.values().chunks_exact(width).collect();
    let mut stats = RunningStats::default();
    for triple in rows.windows(3) {
        let [above, row, below] = triple else {
            continue;
        };
        let neighbours = above.iter().skip(1).zip(below.iter().skip(1));
        for (window, (up, down)) in row.windows(3).zip(neighbours) {
            if let [left, centre, right] = window {
                let response = 4.0f32.mul_add(-*centre, up + down + left + right);
                stats.push(f64::from(response));
            }
        }
    }
    stats.variance()
}

/// Mean luma on an 8-bit scale.
pub fn brightness(frame: &FrameSample) -> f64 {
    mean_luma(&frame.luma())
}

/// Mean of a luma plane.
pub fn mean_luma(plane: &LumaPlane) -> f64 {
    let mut stats = RunningStats::default();
    for &value in plane.values() {
        stats.push(f64::from(value));
    }
    stats.mean()
}

/// Rectangle of the frame, in fractions of width and height, that is
/// expected to show a flat target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Left edge, 0..1.
    pub x: f64,
    /// Top edge, 0..1.
    pub y: f64,
    /// Width, 0..1.
    pub width: f64,
    /// Height, 0..1.
    pub height: f64,
}

impl Default for Region {
    /// Central half of the frame.
    fn default() -> Self {
        Self {
            x: 0.25,
            y: 0.25,
            width: 0.5,
            height: 0.5,
        }
    }
}

impl Region {
    /// Pixel bounds `(x0, y0, x1, y1)` clamped to a `width`×`height` plane.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn to_pixels(&self, width: usize, height: usize) -> (usize, usize, usize, usize) {
        let scale = |fraction: f64, extent: usize| -> usize {
            ((fraction.clamp(0.0, 1.0) * extent as f64).round() as usize).min(extent)
        };
        let x0 = scale(self.x, width);
        let y0 = scale(self.y, height);
        let x1 = scale(self.x + self.width, width).max(x0);
        let y1 = scale(self.y + self.height, height).max(y0);
        (x0, y0, x1, y1)
    }
}

/// Mean per-patch standard deviation over `region` (lower is better).
///
/// The region is tiled with `patch`×`patch` squares; partial patches at the
/// edges are ignored. Returns `None` when not even one patch fits.
pub fn noise(frame: &FrameSample, region: &Region, patch: usize) -> Option<f64> {
    let plane = frame.luma();
    patch_noise(&plane, region, patch)
}

/// [`noise`] on an existing luma plane.
pub fn patch_noise(plane: &LumaPlane, region: &Region, patch: usize) -> Option<f64> {
    if patch == 0 {
        return None;
    }
    let (x0, y0, x1, y1) = region.to_pixels(plane.width(), plane.height());
    let mut patches = RunningStats::default();

    for py in (y0..y1).step_by(patch).filter(|py| py + patch <= y1) {
        for px in (x0..x1).step_by(patch).filter(|px| px + patch <= x1) {
            let mut stats = RunningStats::default();
            for y in py..py + patch {
                let row = plane.row(y)?.get(px..px + patch)?;
                for &value in row {
                    stats.push(f64::from(value));
                }
            }
            patches.push(stats.std_dev());
        }
    }

    (patches.count() > 0).then(|| patches.mean())
}

/// Mean value of each RGB channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelMeans {
    /// Red mean.
    pub red: f64,
    /// Green mean.
    pub green: f64,
    /// Blue mean.
    pub blue: f64,
}

impl ChannelMeans {
    /// Largest pairwise difference between channel means.
    ///
    /// Zero for a perfectly neutral target.
    pub fn balance_score(&self) -> f64 {
        let rg = (self.red - self.green).abs();
        let rb = (self.red - self.blue).abs();
        let gb = (self.green - self.blue).abs();
        rg.max(rb).max(gb)
    }
}

/// Per-channel means of a frame.
pub fn channel_means(frame: &FrameSample) -> ChannelMeans {
    let mut sums = [0.0f64; 3];
    let pixels = frame.rgb();
    for [r, g, b] in &pixels {
        sums[0] += f64::from(*r);
        sums[1] += f64::from(*g);
        sums[2] += f64::from(*b);
    }
    #[allow(clippy::cast_precision_loss)]
    let n = pixels.len().max(1) as f64;
    let [red, green, blue] = sums;
    ChannelMeans {
        red: red / n,
        green: green / n,
        blue: blue / n,
    }
}

/// Global luma statistics used for image quality reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageStats {
    /// Mean luma.
    pub brightness: f64,
    /// Luma standard deviation.
    pub contrast: f64,
    /// Max minus min luma.
    pub dynamic_range: f64,
    /// `10·log10(mean² / std²)`, capped at [`SNR_CAP_DB`].
    pub snr_db: f64,
}

/// Luma statistics of a plane.
pub fn image_stats(plane: &LumaPlane) -> ImageStats {
    let mut stats = RunningStats::default();
    for &value in plane.values() {
        stats.push(f64::from(value));
    }
    let mean = stats.mean();
    let variance = stats.variance();
    let snr_db = if variance > 0.0 && mean > 0.0 {
        (10.0 * (mean * mean / variance).log10()).min(SNR_CAP_DB)
    } else if mean > 0.0 {
        SNR_CAP_DB
    } else {
        0.0
    };
    ImageStats {
        brightness: mean,
        contrast: stats.std_dev(),
        dynamic_range: stats.max() - stats.min(),
        snr_db,
    }
}
