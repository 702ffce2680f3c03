//! Synthetic capture port for testing without hardware.
//!
//! A [`MockCamera`] describes one fake device: the pattern it renders, the
//! interval of its virtual monotonic clock, an optional autofocus script and
//! faults injected at given read indices. Frames are produced instantly with
//! synthetic timestamps unless a real read delay is configured.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CameraError, Result};
use crate::frame::yuv_to_rgb;
use crate::traits::{
    CameraDevice, CapturePort, Control, DeviceDescriptor, DeviceId, Format, FourCC, FrameMetadata,
    RawFrame, Resolution,
};

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
    /// Neutral checkerboard with `cell`-pixel squares at `128 ± contrast/2`.
    Checkerboard {
        /// Square size in pixels.
        cell: u32,
        /// Peak-to-peak luma difference.
        contrast: u8,
    },
    /// Neutral gray whose luma ramps linearly from `from` to `to` over
    /// `over` of virtual time, then holds.
    BrightnessRamp {
        /// Starting luma.
        from: u8,
        /// Final luma.
        to: u8,
        /// Ramp duration.
        over: Duration,
    },
}

/// Faults injected at a given read index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// The read times out without producing a frame.
    Timeout,
    /// The read returns a truncated buffer.
    Corrupt,
    /// The device disappears; this and every later read fails.
    Disconnect,
    /// The next frame skips this many sequence numbers.
    DropFrames(u32),
}

/// Configuration of one synthetic device.
#[derive(Debug, Clone)]
pub struct MockCamera {
    descriptor: DeviceDescriptor,
    format: Format,
    pattern: TestPattern,
    interval: Duration,
    read_delay: Duration,
    faults: BTreeMap<u64, MockFault>,
    focus_script: Vec<u8>,
    focus_lens: Option<i64>,
    manual_luma: Option<u8>,
}

impl MockCamera {
    /// Create a mock camera with default settings: 640x480 YUYV color bars at 30 fps.
    #[must_use]
    pub fn new<I: Into<DeviceId>>(id: I) -> Self {
        let mut descriptor = DeviceDescriptor::new(id, "Mock Camera");
        descriptor.driver = "mock".to_owned();
        descriptor.bus_info = "mock:usb".to_owned();
        descriptor.resolutions = vec![Resolution::new(640, 480), Resolution::new(1280, 720)];
        descriptor.formats = vec![FourCC::YUYV, FourCC::RGB3, FourCC::GREY];
        descriptor.nominal_fps = Some(30.0);

        Self {
            descriptor,
            format: Format::new(640, 480, FourCC::YUYV),
            pattern: TestPattern::ColorBars,
            interval: Duration::from_nanos(33_333_333),
            read_delay: Duration::ZERO,
            faults: BTreeMap::new(),
            focus_script: Vec::new(),
            focus_lens: None,
            manual_luma: None,
        }
    }

    /// Set the initial format for this mock device.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        if !self.descriptor.resolutions.contains(&format.resolution()) {
            self.descriptor.resolutions.push(format.resolution());
        }
        self.format = format;
        self
    }

    /// Replace the advertised resolutions.
    #[must_use]
    pub fn with_resolutions(mut self, resolutions: Vec<Resolution>) -> Self {
        self.descriptor.resolutions = resolutions;
        self
    }

    /// Set the rendered pattern.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Set the virtual frame interval; the advertised fps follows it.
    #[must_use]
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self.descriptor.nominal_fps = (!interval.is_zero()).then(|| 1.0 / interval.as_secs_f64());
        self
    }

    /// Override the advertised fps without touching the actual interval.
    #[must_use]
    pub const fn with_nominal_fps(mut self, fps: Option<f64>) -> Self {
        self.descriptor.nominal_fps = fps;
        self
    }

    /// Block each read for this long in real time.
    #[must_use]
    pub const fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Inject a fault at the zero-based read index.
    #[must_use]
    pub fn with_fault(mut self, read_index: u64, fault: MockFault) -> Self {
        self.faults.insert(read_index, fault);
        self
    }

    /// Render a checkerboard whose contrast follows `script`, advancing one
    /// entry per autofocus trigger. Also advertises autofocus control.
    #[must_use]
    pub fn with_focus_script(mut self, script: Vec<u8>) -> Self {
        self.focus_script = script;
        for control in [Control::AutofocusTrigger, Control::ContinuousAutofocus] {
            if !self.descriptor.supports(control) {
                self.descriptor.controls.push(control);
            }
        }
        self
    }

    /// Fit a manually driven lens that is sharpest at `best`. Checkerboard
    /// contrast falls off by one step per position away from it. The lens
    /// starts at position 0 with continuous autofocus on, and refuses
    /// absolute positions until continuous autofocus is switched off.
    #[must_use]
    pub fn with_focus_lens(mut self, best: i64) -> Self {
        self.focus_lens = Some(best);
        self.with_controls(&[Control::FocusAbsolute, Control::ContinuousAutofocus])
    }

    /// Advertise an auto-exposure switch. With auto exposure off the sensor
    /// renders flat gray at `luma`; with it on, the configured pattern.
    #[must_use]
    pub fn with_manual_exposure(mut self, luma: u8) -> Self {
        self.manual_luma = Some(luma);
        self.with_controls(&[Control::AutoExposure])
    }

    /// Advertise additional controls.
    #[must_use]
    pub fn with_controls(mut self, controls: &[Control]) -> Self {
        for control in controls {
            if !self.descriptor.supports(*control) {
                self.descriptor.controls.push(*control);
            }
        }
        self
    }

    /// Descriptor this camera reports.
    pub const fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Capture port serving a fixed set of [`MockCamera`]s.
#[derive(Debug, Default)]
pub struct MockPort {
    cameras: Mutex<BTreeMap<DeviceId, MockCamera>>,
    counters: Arc<Counters>,
}

impl MockPort {
    /// Port with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device.
    #[must_use]
    pub fn with_camera(self, camera: MockCamera) -> Self {
        self.cameras
            .lock()
            .insert(camera.descriptor.id.clone(), camera);
        self
    }

    /// Unplug a device: it vanishes from enumeration and cannot be opened.
    pub fn unplug(&self, id: &DeviceId) {
        self.cameras.lock().remove(id);
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Number of closes.
    pub fn close_count(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }
}

impl CapturePort for MockPort {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .cameras
            .lock()
            .values()
            .map(|camera| camera.descriptor.clone())
            .collect())
    }

    fn open(&self, id: &DeviceId) -> Result<Box<dyn CameraDevice>> {
        let camera = self
            .cameras
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CameraError::NotFound(id.clone()))?;
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDevice {
            format: camera.format.clone(),
            camera,
            reads: 0,
            frame_count: 0,
            focus_step: 0,
            focus_position: 0,
            continuous_af: true,
            auto_exposure: true,
            disconnected: false,
            closed: false,
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// Open handle on a [`MockCamera`].
pub struct MockDevice {
    camera: MockCamera,
    format: Format,
    reads: u64,
    frame_count: u32,
    focus_step: usize,
    focus_position: i64,
    continuous_af: bool,
    auto_exposure: bool,
    disconnected: bool,
    closed: bool,
    counters: Arc<Counters>,
}

impl MockDevice {
    fn pattern(&self) -> TestPattern {
        if let (false, Some(luma)) = (self.auto_exposure, self.camera.manual_luma) {
            return TestPattern::Solid(luma, 128, 128);
        }
        if let Some(best) = self.camera.focus_lens {
            let contrast = 160_u64.saturating_sub(self.focus_position.abs_diff(best));
            return TestPattern::Checkerboard {
                cell: 4,
                contrast: u8::try_from(contrast).unwrap_or(u8::MAX),
            };
        }
        if self.camera.focus_script.is_empty() {
            return self.camera.pattern;
        }
        let last = self.camera.focus_script.len() - 1;
        let contrast = self
            .camera
            .focus_script
            .get(self.focus_step.min(last))
            .copied()
            .unwrap_or_default();
        TestPattern::Checkerboard { cell: 4, contrast }
    }
}

impl CameraDevice for MockDevice {
    fn format(&self) -> Result<Format> {
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        if !self.camera.descriptor.formats.contains(&format.fourcc) {
            return Err(CameraError::FormatNotSupported(format.clone()));
        }
        // Like real drivers, snap unknown geometries to a supported mode.
        let resolution = if self
            .camera
            .descriptor
            .resolutions
            .contains(&format.resolution())
        {
            format.resolution()
        } else {
            self.camera
                .descriptor
                .resolutions
                .first()
                .copied()
                .unwrap_or_else(|| self.format.resolution())
        };
        self.format = Format::new(resolution.width, resolution.height, format.fourcc);
        Ok(self.format.clone())
    }

    fn read(&mut self, timeout: Duration) -> Result<RawFrame<'_>> {
        if self.closed {
            return Err(CameraError::Stream("device closed".to_owned()));
        }
        if self.disconnected {
            return Err(CameraError::Disconnected);
        }

        let index = self.reads;
        self.reads += 1;
        let fault = self.camera.faults.get(&index).copied();

        match fault {
            Some(MockFault::Timeout) => {
                std::thread::sleep(self.camera.read_delay.min(timeout));
                return Err(CameraError::Timeout);
            }
            Some(MockFault::Disconnect) => {
                self.disconnected = true;
                return Err(CameraError::Disconnected);
            }
            Some(MockFault::DropFrames(count)) => {
                self.frame_count = self.frame_count.saturating_add(count);
            }
            Some(MockFault::Corrupt) | None => {}
        }

        if !self.camera.read_delay.is_zero() {
            if self.camera.read_delay > timeout {
                std::thread::sleep(timeout);
                return Err(CameraError::Timeout);
            }
            std::thread::sleep(self.camera.read_delay);
        }

        let seq = self.frame_count;
        self.frame_count += 1;
        let timestamp = self.camera.interval * seq;
        let mut data = generate_test_frame(&self.format, self.pattern(), timestamp);
        if fault == Some(MockFault::Corrupt) {
            data.truncate(data.len() / 2);
        }

        #[allow(clippy::cast_possible_truncation)]
        let bytes_used = data.len() as u32;
        Ok(RawFrame {
            data: Cow::Owned(data),
            metadata: FrameMetadata {
                sequence: seq,
                timestamp,
                bytes_used,
            },
        })
    }

    fn set_control(&mut self, control: Control, value: i64) -> Result<()> {
        if self.disconnected {
            return Err(CameraError::Disconnected);
        }
        if !self.camera.descriptor.supports(control) {
            return Err(CameraError::ControlNotSupported(control));
        }
        match control {
            Control::AutofocusTrigger => self.focus_step += 1,
            Control::ContinuousAutofocus => self.continuous_af = value != 0,
            Control::AutoExposure => self.auto_exposure = value != 0,
            // Drivers reject manual focus while continuous autofocus owns the lens.
            Control::FocusAbsolute if self.continuous_af => {
                return Err(CameraError::ControlNotSupported(control));
            }
            Control::FocusAbsolute => self.focus_position = value,
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Generate test frame data based on pattern, in the requested pixel format.
fn generate_test_frame(format: &Format, pattern: TestPattern, at: Duration) -> Vec<u8> {
    let pixels = (format.width * format.height) as usize;
    let mut yuyv = vec![0u8; pixels * 2];

    match pattern {
        TestPattern::ColorBars => generate_color_bars(&mut yuyv, format.width),
        TestPattern::Gradient => generate_gradient(&mut yuyv, format.width),
        TestPattern::Solid(y, u, v) => generate_solid(&mut yuyv, y, u, v),
        TestPattern::Checkerboard { cell, contrast } => {
            generate_checkerboard(&mut yuyv, format.width, cell.max(1), contrast);
        }
        TestPattern::BrightnessRamp { from, to, over } => {
            generate_solid(&mut yuyv, ramp_value(from, to, over, at), 128, 128);
        }
    }

    match &format.fourcc.0 {
        b"RGB3" => yuyv
            .chunks_exact(4)
            .flat_map(|chunk| match chunk {
                [y0, u, y1, v] => {
                    let (r0, g0, b0) = yuv_to_rgb(*y0, *u, *v);
                    let (r1, g1, b1) = yuv_to_rgb(*y1, *u, *v);
                    [r0, g0, b0, r1, g1, b1]
                }
                _ => [0; 6],
            })
            .collect(),
        b"GREY" => yuyv.iter().step_by(2).copied().collect(),
        _ => yuyv,
    }
}

/// Luma of a linear ramp at virtual time `at`.
fn ramp_value(from: u8, to: u8, over: Duration, at: Duration) -> u8 {
    if over.is_zero() || at >= over {
        return to;
    }
    let progress = at.as_secs_f64() / over.as_secs_f64();
    let value = (f64::from(to) - f64::from(from)).mul_add(progress, f64::from(from));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        value.round().clamp(0.0, 255.0) as u8
    }
}

/// Write Y0/Y1 per pixel pair with a shared chroma, using `luma(x, y)`.
fn fill_pairs<F>(data: &mut [u8], width: u32, mut luma: F, u: u8, v: u8)
where
    F: FnMut(u32, u32) -> u8,
{
    let width = width.max(1);
    for (pair, chunk) in (0u32..).zip(data.chunks_exact_mut(4)) {
        let pixel = pair * 2;
        let (x, y) = (pixel % width, pixel / width);
        let next = pixel + 1;
        let y0 = luma(x, y);
        let y1 = luma(next % width, next / width);
        chunk.copy_from_slice(&[y0, u, y1, v]);
    }
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128), // White
        (210, 16, 146),  // Yellow
        (170, 166, 16),  // Cyan
        (145, 54, 34),   // Green
        (106, 202, 222), // Magenta
        (81, 90, 240),   // Red
        (41, 240, 110),  // Blue
        (16, 128, 128),  // Black
    ];

    let bar_width = (width / 8).max(1);
    let width = width.max(1);
    for (pair, chunk) in (0u32..).zip(data.chunks_exact_mut(4)) {
        let x = (pair * 2) % width;
        let bar_idx = (x / bar_width).min(7) as usize;
        let (y_val, u_val, v_val) = bars.get(bar_idx).copied().unwrap_or((16, 128, 128));
        chunk.copy_from_slice(&[y_val, u_val, y_val, v_val]);
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32) {
    #[allow(clippy::cast_possible_truncation)]
    fill_pairs(
        data,
        width,
        |x, _| ((x * 255) / width.max(1)) as u8,
        128,
        128,
    );
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for chunk in data.chunks_exact_mut(4) {
        chunk.copy_from_slice(&[y, u, y, v]);
    }
}

/// Generate a neutral YUYV checkerboard.
fn generate_checkerboard(data: &mut [u8], width: u32, cell: u32, contrast: u8) {
    let half = contrast / 2;
    let (low, high) = (128 - half.min(128), 128u8.saturating_add(half));
    fill_pairs(
        data,
        width,
        |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                high
            } else {
                low
            }
        },
        128,
        128,
    );
}
