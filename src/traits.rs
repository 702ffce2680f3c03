//! Frame capture port: the traits and plain types every capture backend speaks.
//!
//! A [`CapturePort`] enumerates and opens devices; an opened device is a
//! [`CameraDevice`] that negotiates a [`Format`], hands out raw frames and
//! accepts control writes. The engine never touches a backend directly, it
//! goes through a [`Session`](crate::session::Session).

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// GREY pixel format (8-bit luma only).
    pub const GREY: Self = Self::new(b"GREY");

    /// Bytes per pixel for uncompressed formats, `None` for compressed ones.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" => Some(2),
            b"RGB3" => Some(3),
            b"GREY" => Some(1),
            _ => None,
        }
    }

    /// Whether the engine can compute metrics on this format.
    #[must_use]
    pub const fn is_measurable(self) -> bool {
        self.bytes_per_pixel().is_some()
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

impl std::str::FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("FourCC must be exactly 4 bytes, got {s:?}"))?;
        Ok(Self(bytes))
    }
}

impl Serialize for FourCC {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FourCC {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Frame geometry in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a resolution.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a tightly packed format specification.
    ///
    /// Compressed formats get a zero stride and size; the driver fills those in.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = match fourcc.bytes_per_pixel() {
            Some(bpp) => width * bpp,
            None => 0,
        };
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }

    /// The geometry part of this format.
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Length of a tightly packed frame buffer, if the format has fixed geometry.
    #[must_use]
    pub fn packed_len(&self) -> Option<usize> {
        let bpp = self.fourcc.bytes_per_pixel()?;
        let len = u64::from(self.width) * u64::from(self.height) * u64::from(bpp);
        usize::try_from(len).ok()
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.fourcc)
    }
}

/// Platform handle identifying one camera (e.g. `"0"` for `/dev/video0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<u32> for DeviceId {
    fn from(index: u32) -> Self {
        Self(index.to_string())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware controls the engine may drive through a device's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// One-shot autofocus step.
    AutofocusTrigger,
    /// Continuous autofocus on/off.
    ContinuousAutofocus,
    /// Auto exposure on/off.
    AutoExposure,
    /// Absolute focus position.
    FocusAbsolute,
}

/// A candidate camera as reported by the capture port. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Platform handle id.
    pub id: DeviceId,
    /// Card/device name.
    pub name: String,
    /// Driver name.
    pub driver: String,
    /// Bus information.
    pub bus_info: String,
    /// USB vendor id, when the platform exposes it.
    pub vendor_id: Option<u16>,
    /// USB product id, when the platform exposes it.
    pub product_id: Option<u16>,
    /// Advertised resolutions.
    pub resolutions: Vec<Resolution>,
    /// Advertised pixel formats.
    pub formats: Vec<FourCC>,
    /// Advertised nominal frame rate.
    pub nominal_fps: Option<f64>,
    /// Controls reachable through the control channel.
    pub controls: Vec<Control>,
}

impl DeviceDescriptor {
    /// Create a descriptor with no advertised capabilities.
    #[must_use]
    pub fn new<I: Into<DeviceId>>(id: I, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_owned(),
            driver: String::new(),
            bus_info: String::new(),
            vendor_id: None,
            product_id: None,
            resolutions: Vec::new(),
            formats: Vec::new(),
            nominal_fps: None,
            controls: Vec::new(),
        }
    }

    /// Whether the device advertises a control.
    #[must_use]
    pub fn supports(&self, control: Control) -> bool {
        self.controls.contains(&control)
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp on the device's monotonic clock.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A frame as handed out by a backend.
///
/// The data may borrow the backend's internal buffer; the session copies it
/// out before the next read.
#[derive(Debug, Clone)]
pub struct RawFrame<'a> {
    /// Raw frame data.
    pub data: Cow<'a, [u8]>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Enumerates and opens camera devices.
pub trait CapturePort: Send + Sync {
    /// List every device this port can see.
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open a device for exclusive use.
    fn open(&self, id: &DeviceId) -> Result<Box<dyn CameraDevice>>;
}

/// Abstraction over an open camera device.
pub trait CameraDevice: Send {
    /// Get current format.
    fn format(&self) -> Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Capture the next frame, waiting at most `timeout`.
    fn read(&mut self, timeout: Duration) -> Result<RawFrame<'_>>;

    /// Write a control value.
    fn set_control(&mut self, control: Control, value: i64) -> Result<()>;

    /// Stop streaming and release the device. Must be safe to call twice.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_new_packs_stride() {
        let yuyv = Format::new(640, 480, FourCC::YUYV);
        assert_eq!(yuyv.stride, 1280);
        assert_eq!(yuyv.packed_len(), Some(640 * 480 * 2));

        let rgb = Format::new(4, 2, FourCC::RGB3);
        assert_eq!(rgb.stride, 12);
        assert_eq!(rgb.size, 24);

        let mjpg = Format::new(1920, 1080, FourCC::MJPG);
        assert_eq!(mjpg.packed_len(), None);
        assert!(!FourCC::MJPG.is_measurable());
    }

    #[test]
    fn test_fourcc_display_and_parse() {
        assert_eq!(FourCC::YUYV.to_string(), "YUYV");
        let parsed: FourCC = "RGB3".parse().expect("parse failed");
        assert_eq!(parsed, FourCC::RGB3);
        assert!("RGB".parse::<FourCC>().is_err());
    }

    #[test]
    fn test_fourcc_serde_as_string() {
        let json = serde_json::to_string(&FourCC::GREY).expect("serialize failed");
        assert_eq!(json, "\"GREY\"");
        let back: FourCC = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(back, FourCC::GREY);
    }

    #[test]
    fn test_descriptor_supports_control() {
        let mut descriptor = DeviceDescriptor::new("3", "Bench Camera");
        assert!(!descriptor.supports(Control::AutofocusTrigger));
        descriptor.controls.push(Control::AutofocusTrigger);
        assert!(descriptor.supports(Control::AutofocusTrigger));
        assert_eq!(descriptor.id.as_str(), "3");
    }
}
