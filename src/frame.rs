//! Validated frame samples and their luma/RGB reductions.
//!
//! A [`FrameSample`] can only be built through [`FrameSample::new`] or
//! [`FrameSample::from_raw`], both of which check the buffer length against
//! the negotiated geometry. Metric code therefore never sees a malformed
//! buffer.

use std::time::Duration;

use crate::error::FrameError;
use crate::traits::{Format, FourCC, RawFrame, Resolution};

/// One captured frame with an owned pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSample {
    data: Vec<u8>,
    width: u32,
    height: u32,
    fourcc: FourCC,
    timestamp: Duration,
    sequence: u32,
}

impl FrameSample {
    /// Build a frame sample, rejecting buffers whose length does not match
    /// `width * height * bytes_per_pixel`.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        fourcc: FourCC,
        timestamp: Duration,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyFrame);
        }
        let expected = Format::new(width, height, fourcc)
            .packed_len()
            .ok_or(FrameError::UnsupportedFormat(fourcc))?;
        if data.len() != expected {
            return Err(FrameError::GeometryMismatch {
                width,
                height,
                fourcc,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            fourcc,
            timestamp,
            sequence,
        })
    }

    /// Copy a backend frame out of its buffer and validate it against `format`.
    pub fn from_raw(raw: &RawFrame<'_>, format: &Format) -> Result<Self, FrameError> {
        Self::new(
            raw.data.to_vec(),
            format.width,
            format.height,
            format.fourcc,
            raw.metadata.timestamp,
            raw.metadata.sequence,
        )
    }

    /// Raw pixel bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Frame width in pixels.
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Frame geometry.
    pub const fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Pixel format.
    pub const fn fourcc(&self) -> FourCC {
        self.fourcc
    }

    /// Capture timestamp on the device's monotonic clock.
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Frame sequence number.
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Size of the pixel buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Get RGB values for a pixel at the specified coordinates.
    ///
    /// Returns `None` when the coordinates fall outside the frame.
    ///
    /// # Notes
    ///
    /// For YUYV, odd x coordinates use the Y value of the second pixel of
    /// the pair with the shared U/V values.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = (y as usize) * (self.width as usize) + x as usize;
        match &self.fourcc.0 {
            b"YUYV" => {
                // YUYV format: [Y0 U Y1 V] repeats
                let pair = index & !1;
                let offset = pair * 2;
                let y_val = if index % 2 == 0 {
                    *self.data.get(offset)?
                } else {
                    *self.data.get(offset + 2)?
                };
                let u = *self.data.get(offset + 1)?;
                let v = *self.data.get(offset + 3)?;
                Some(yuv_to_rgb(y_val, u, v))
            }
            b"RGB3" => {
                let offset = index * 3;
                let px = self.data.get(offset..offset + 3)?;
                Some((*px.first()?, *px.get(1)?, *px.get(2)?))
            }
            _ => {
                let value = *self.data.get(index)?;
                Some((value, value, value))
            }
        }
    }

    /// Reduce the frame to a single-channel luma plane.
    ///
    /// YUYV takes the Y samples directly; RGB uses Rec. 601 weights.
    pub fn luma(&self) -> LumaPlane {
        let values: Vec<f32> = match &self.fourcc.0 {
            b"YUYV" => self.data.iter().step_by(2).map(|&y| f32::from(y)).collect(),
            b"RGB3" => self
                .data
                .chunks_exact(3)
                .map(|px| match px {
                    [r, g, b] => rec601_luma(*r, *g, *b),
                    _ => 0.0,
                })
                .collect(),
            _ => self.data.iter().map(|&y| f32::from(y)).collect(),
        };
        LumaPlane {
            width: self.width as usize,
            height: self.height as usize,
            values,
        }
    }

    /// Decode every pixel to RGB.
    pub fn rgb(&self) -> Vec<[u8; 3]> {
        match &self.fourcc.0 {
            b"YUYV" => self
                .data
                .chunks_exact(4)
                .flat_map(|chunk| match chunk {
                    [y0, u, y1, v] => {
                        let (r0, g0, b0) = yuv_to_rgb(*y0, *u, *v);
                        let (r1, g1, b1) = yuv_to_rgb(*y1, *u, *v);
                        [[r0, g0, b0], [r1, g1, b1]]
                    }
                    _ => [[0; 3]; 2],
                })
                .collect(),
            b"RGB3" => self
                .data
                .chunks_exact(3)
                .map(|px| match px {
                    [r, g, b] => [*r, *g, *b],
                    _ => [0; 3],
                })
                .collect(),
            _ => self.data.iter().map(|&v| [v, v, v]).collect(),
        }
    }
}

/// Grayscale reduction of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LumaPlane {
    width: usize,
    height: usize,
    values: Vec<f32>,
}

impl LumaPlane {
    /// Build a plane from row-major values. Returns `None` if the length is wrong.
    pub fn from_values(width: usize, height: usize, values: Vec<f32>) -> Option<Self> {
        (width.checked_mul(height)? == values.len()).then_some(Self {
            width,
            height,
            values,
        })
    }

    /// Plane width.
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Plane height.
    pub const fn height(&self) -> usize {
        self.height
    }

    /// All values in row-major order.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// One row of the plane.
    pub fn row(&self, y: usize) -> Option<&[f32]> {
        let start = y.checked_mul(self.width)?;
        self.values.get(start..start + self.width)
    }

    /// Value at `(x, y)`.
    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x >= self.width {
            return None;
        }
        self.values.get(y * self.width + x).copied()
    }
}

/// Rec. 601 luma from RGB.
fn rec601_luma(r: u8, g: u8, b: u8) -> f32 {
    0.114f32.mul_add(
        f32::from(b),
        0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
    )
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
///
/// # Arguments
///
/// * `y` - Luminance value (16-235 for studio range)
/// * `u` - Blue-difference chroma value (16-240)
/// * `v` - Red-difference chroma value (16-240)
///
/// # Returns
///
/// RGB tuple with values clamped to 0-255 range.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    // ITU-R BT.601 conversion
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    let clamp = |val: f32| -> u8 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            val.clamp(0.0, 255.0) as u8
        }
    };

    (clamp(r), clamp(g), clamp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn yuyv_solid(width: u32, height: u32, y: u8) -> FrameSample {
        let data = [y, 128, y, 128].repeat((width * height / 2) as usize);
        FrameSample::new(data, width, height, FourCC::YUYV, Duration::ZERO, 0)
            .expect("valid frame")
    }

    #[test]
    fn test_rejects_short_buffer() {
        let result = FrameSample::new(vec![0; 15], 4, 2, FourCC::YUYV, Duration::ZERO, 0);
        assert!(matches!(
            result,
            Err(FrameError::GeometryMismatch {
                expected: 16,
                actual: 15,
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_compressed_and_empty() {
        let mjpg = FrameSample::new(vec![0; 64], 4, 4, FourCC::MJPG, Duration::ZERO, 0);
        assert_eq!(mjpg, Err(FrameError::UnsupportedFormat(FourCC::MJPG)));

        let empty = FrameSample::new(Vec::new(), 0, 4, FourCC::GREY, Duration::ZERO, 0);
        assert_eq!(empty, Err(FrameError::EmptyFrame));
    }

    #[test]
    fn test_luma_yuyv_takes_y_samples() {
        let frame = yuyv_solid(8, 2, 90);
        let luma = frame.luma();
        assert_eq!(luma.width(), 8);
        assert_eq!(luma.height(), 2);
        assert!(luma.values().iter().all(|&v| (v - 90.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_rgb_gray_is_neutral() {
        let frame = yuyv_solid(4, 2, 128);
        for px in frame.rgb() {
            assert_eq!(px, [128, 128, 128]);
        }
        assert_eq!(frame.pixel_at(1, 1), Some((128, 128, 128)));
        assert_eq!(frame.pixel_at(4, 0), None);
    }

    #[test]
    fn test_rgb3_pixel_access() {
        let data = vec![10, 20, 30, 40, 50, 60];
        let frame = FrameSample::new(data, 2, 1, FourCC::RGB3, Duration::ZERO, 7)
            .expect("valid frame");
        assert_eq!(frame.pixel_at(1, 0), Some((40, 50, 60)));
        assert_eq!(frame.sequence(), 7);
        let luma = frame.luma();
        assert!((luma.get(0, 0).expect("pixel") - rec601_luma(10, 20, 30)).abs() < 1e-4);
    }

    #[test]
    fn test_yuv_to_rgb_clamps() {
        assert_eq!(yuv_to_rgb(255, 255, 255).0, 255);
        assert_eq!(yuv_to_rgb(0, 0, 0).0, 0);
    }

    proptest! {
        #[test]
        fn prop_only_exact_lengths_accepted(
            width in 1u32..32,
            height in 1u32..32,
            delta in -8i64..8,
        ) {
            let expected = i64::from(width) * i64::from(height) * 2;
            let len = (expected + delta).max(0);
            let data = vec![0u8; usize::try_from(len).unwrap_or_default()];
            let result = FrameSample::new(data, width, height, FourCC::YUYV, Duration::ZERO, 0);
            prop_assert_eq!(result.is_ok(), len == expected);
        }
    }
}
