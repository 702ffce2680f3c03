//! V4L2 capture port using the v4l crate.
//!
//! Devices are addressed by their `/dev/videoN` index. Streaming uses mmap
//! buffers created lazily on the first read and torn down whenever the
//! format changes.

use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::control::{Control as V4lControl, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CameraError, Result};
use crate::traits::{
    CameraDevice, CapturePort, Control, DeviceDescriptor, DeviceId, Format, FourCC, FrameMetadata,
    RawFrame, Resolution,
};

const MAX_DEVICES: u32 = 64;

const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const ENXIO: i32 = 6;

const CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;
const CID_EXPOSURE_AUTO: u32 = CID_CAMERA_CLASS_BASE + 1;
const CID_FOCUS_ABSOLUTE: u32 = CID_CAMERA_CLASS_BASE + 10;
const CID_FOCUS_AUTO: u32 = CID_CAMERA_CLASS_BASE + 12;
const CID_AUTO_FOCUS_START: u32 = CID_CAMERA_CLASS_BASE + 28;

const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

const fn control_id(control: Control) -> u32 {
    match control {
        Control::AutofocusTrigger => CID_AUTO_FOCUS_START,
        Control::ContinuousAutofocus => CID_FOCUS_AUTO,
        Control::AutoExposure => CID_EXPOSURE_AUTO,
        Control::FocusAbsolute => CID_FOCUS_ABSOLUTE,
    }
}

fn io_error(err: io::Error) -> CameraError {
    if err.kind() == io::ErrorKind::TimedOut {
        return CameraError::Timeout;
    }
    match err.raw_os_error() {
        Some(ENODEV | ENXIO) => CameraError::Disconnected,
        _ => CameraError::Io(err),
    }
}

fn parse_index(id: &DeviceId) -> Result<u32> {
    id.as_str()
        .trim_start_matches("/dev/video")
        .parse()
        .map_err(|_| CameraError::NotFound(id.clone()))
}

fn format_from(fmt: &v4l::Format) -> Format {
    Format {
        width: fmt.width,
        height: fmt.height,
        fourcc: FourCC::from(fmt.fourcc),
        stride: fmt.stride,
        size: fmt.size,
    }
}

/// Read a hex USB id from the sysfs node of `/dev/video{index}`.
fn usb_id(index: u32, file: &str) -> Option<u16> {
    let path = format!("/sys/class/video4linux/video{index}/device/../{file}");
    let text = fs::read_to_string(path).ok()?;
    u16::from_str_radix(text.trim(), 16).ok()
}

/// Capture port over `/dev/video*`.
#[derive(Debug, Clone)]
pub struct V4L2Port {
    buffer_count: u32,
}

impl V4L2Port {
    /// Port that requests `buffer_count` mmap buffers per stream.
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(2),
        }
    }

    fn describe(index: u32, device: &Device) -> io::Result<Option<DeviceDescriptor>> {
        let caps = device.query_caps()?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Ok(None);
        }

        let mut descriptor = DeviceDescriptor::new(index, &caps.card);
        descriptor.driver = caps.driver;
        descriptor.bus_info = caps.bus;
        descriptor.vendor_id = usb_id(index, "idVendor");
        descriptor.product_id = usb_id(index, "idProduct");

        for description in device.enum_formats()? {
            let fourcc = FourCC::from(description.fourcc);
            descriptor.formats.push(fourcc);
            if !fourcc.is_measurable() {
                continue;
            }
            for size in device.enum_framesizes(description.fourcc)? {
                if let FrameSizeEnum::Discrete(discrete) = size.size {
                    let resolution = Resolution::new(discrete.width, discrete.height);
                    if !descriptor.resolutions.contains(&resolution) {
                        descriptor.resolutions.push(resolution);
                    }
                }
            }
        }

        let current = device.format()?;
        descriptor.nominal_fps = device
            .enum_frameintervals(current.fourcc, current.width, current.height)
            .ok()
            .and_then(|intervals| {
                intervals.into_iter().find_map(|interval| match interval.interval {
                    FrameIntervalEnum::Discrete(fraction) if fraction.numerator > 0 => {
                        Some(f64::from(fraction.denominator) / f64::from(fraction.numerator))
                    }
                    _ => None,
                })
            });

        if let Ok(controls) = device.query_controls() {
            for control in [
                Control::AutofocusTrigger,
                Control::ContinuousAutofocus,
                Control::AutoExposure,
                Control::FocusAbsolute,
            ] {
                if controls.iter().any(|c| c.id == control_id(control)) {
                    descriptor.controls.push(control);
                }
            }
        }

        Ok(Some(descriptor))
    }
}

impl Default for V4L2Port {
    fn default() -> Self {
        Self::new(4)
    }
}

impl CapturePort for V4L2Port {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();
        for index in 0..MAX_DEVICES {
            if !Path::new(&format!("/dev/video{index}")).exists() {
                continue;
            }
            let device = match Device::new(index as usize) {
                Ok(device) => device,
                Err(err) => {
                    debug!(index, error = %err, "skipping unopenable node");
                    continue;
                }
            };
            match Self::describe(index, &device) {
                Ok(Some(descriptor)) => devices.push(descriptor),
                Ok(None) => debug!(index, "skipping non-capture node"),
                Err(err) => warn!(index, error = %err, "failed to query device"),
            }
        }
        Ok(devices)
    }

    fn open(&self, id: &DeviceId) -> Result<Box<dyn CameraDevice>> {
        let index = parse_index(id)?;
        if !Path::new(&format!("/dev/video{index}")).exists() {
            return Err(CameraError::NotFound(id.clone()));
        }
        let device = Device::new(index as usize).map_err(|err| match err.raw_os_error() {
            Some(EBUSY) => CameraError::Busy(id.clone()),
            Some(ENODEV | ENXIO) => CameraError::NotFound(id.clone()),
            _ => CameraError::OpenFailed(err.to_string()),
        })?;
        let format = device
            .format()
            .map_err(|err| CameraError::OpenFailed(err.to_string()))?;

        Ok(Box::new(V4L2Device {
            id: id.clone(),
            device: Some(device),
            format: format_from(&format),
            stream: None,
            buffer_count: self.buffer_count,
        }))
    }
}

/// Open V4L2 device with a lazily started mmap stream.
pub struct V4L2Device {
    id: DeviceId,
    device: Option<Device>,
    format: Format,
    stream: Option<Stream<'static>>,
    buffer_count: u32,
}

impl V4L2Device {
    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| CameraError::Stream("device closed".to_owned()))
    }

    fn stream(&mut self, timeout: Duration) -> Result<&mut Stream<'static>> {
        if self.stream.is_none() {
            let stream = Stream::with_buffers(self.device()?, Type::VideoCapture, self.buffer_count)
                .map_err(|err| match err.raw_os_error() {
                    Some(EBUSY) => CameraError::Busy(self.id.clone()),
                    _ => io_error(err),
                })?;
            debug!(device = %self.id, buffers = self.buffer_count, "stream started");
            self.stream = Some(stream);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::Stream("stream unavailable".to_owned()))?;
        stream.set_timeout(timeout);
        Ok(stream)
    }
}

/// Copy rows out of a padded buffer so the result is tightly packed.
fn repack(data: &[u8], format: &Format) -> Option<Vec<u8>> {
    let row = (format.width * format.fourcc.bytes_per_pixel()?) as usize;
    let stride = format.stride as usize;
    if stride <= row {
        return None;
    }
    Some(
        data.chunks(stride)
            .take(format.height as usize)
            .flat_map(|line| line.get(..row).unwrap_or(line))
            .copied()
            .collect(),
    )
}

impl CameraDevice for V4L2Device {
    fn format(&self) -> Result<Format> {
        let fmt = self.device()?.format().map_err(io_error)?;
        Ok(format_from(&fmt))
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        // Buffers are sized for the old format.
        self.stream = None;

        let device = self.device()?;
        let mut fmt = device.format().map_err(io_error)?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = device.set_format(&fmt).map_err(|err| match err.raw_os_error() {
            Some(ENODEV | ENXIO) => CameraError::Disconnected,
            _ => CameraError::FormatNotSupported(format.clone()),
        })?;
        self.format = format_from(&fmt);
        Ok(self.format.clone())
    }

    fn read(&mut self, timeout: Duration) -> Result<RawFrame<'_>> {
        let format = self.format.clone();
        let (buf, meta) = self.stream(timeout)?.next().map_err(io_error)?;

        // V4L2 timestamps are never negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);
        let metadata = FrameMetadata {
            sequence: meta.sequence,
            timestamp: Duration::new(secs, nanos),
            bytes_used: meta.bytesused,
        };

        let used = buf.get(..meta.bytesused as usize).unwrap_or(buf);
        let data = repack(used, &format).map_or(Cow::Borrowed(used), Cow::Owned);
        Ok(RawFrame { data, metadata })
    }

    fn set_control(&mut self, control: Control, value: i64) -> Result<()> {
        let value = match control {
            Control::ContinuousAutofocus => Value::Boolean(value != 0),
            Control::AutoExposure if value != 0 => Value::Integer(EXPOSURE_APERTURE_PRIORITY),
            Control::AutoExposure => Value::Integer(EXPOSURE_MANUAL),
            Control::AutofocusTrigger | Control::FocusAbsolute => Value::Integer(value),
        };
        self.device()?
            .set_control(V4lControl {
                id: control_id(control),
                value,
            })
            .map_err(|err| match err.raw_os_error() {
                Some(ENODEV | ENXIO) => CameraError::Disconnected,
                _ => CameraError::ControlNotSupported(control),
            })
    }

    fn close(&mut self) {
        self.stream = None;
        if self.device.take().is_some() {
            debug!(device = %self.id, "device closed");
        }
    }
}
