//! Error taxonomy for the capture port, the session layer and the engine API.
//!
//! Errors are layered the same way the hardware is:
//!
//! - [`CameraError`] is what a capture port reports (V4L2 ioctl failures,
//!   poll timeouts, unplugged devices).
//! - [`FrameError`] describes why a raw buffer was refused as a frame sample.
//! - [`SessionError`] is the typed fault surface of a [`Session`](crate::session::Session).
//!   The orchestrator classifies these as transient (retried) or fatal.
//! - [`MeasureError`] is how a measurement procedure stops early; the
//!   orchestrator turns it into an ERROR result.
//! - [`EngineError`] covers the external API: worker threads, subscriptions
//!   and configuration loading.

use std::time::Duration;

use thiserror::Error;

use crate::result::TestStatus;
use crate::traits::{Control, DeviceId, Format, FourCC, Resolution};

/// Error type for capture port operations.
#[derive(Error, Debug)]
pub enum CameraError {
    /// No device with the given identifier exists.
    #[error("device {0} not found")]
    NotFound(DeviceId),
    /// The device is held by another process.
    #[error("device {0} is busy")]
    Busy(DeviceId),
    /// Failed to open device.
    #[error("failed to open device: {0}")]
    OpenFailed(String),
    /// Requested format is not supported.
    #[error("format not supported: {0}")]
    FormatNotSupported(Format),
    /// A read did not produce a frame before its timeout.
    #[error("read timed out")]
    Timeout,
    /// The device went away while it was open.
    #[error("device disconnected")]
    Disconnected,
    /// The device has no such control or the platform cannot reach it.
    #[error("control {0:?} not supported")]
    ControlNotSupported(Control),
    /// Error during streaming operation.
    #[error("stream error: {0}")]
    Stream(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for capture port operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Reasons a raw buffer is refused before it can become a frame sample.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer length disagrees with `width * height * bytes_per_pixel`.
    #[error("geometry mismatch: {width}x{height} {fourcc} needs {expected} bytes, got {actual}")]
    GeometryMismatch {
        /// Negotiated width.
        width: u32,
        /// Negotiated height.
        height: u32,
        /// Negotiated pixel format.
        fourcc: FourCC,
        /// Expected buffer length.
        expected: usize,
        /// Actual buffer length.
        actual: usize,
    },
    /// The pixel format has no fixed bytes-per-pixel (compressed streams).
    #[error("pixel format {0} has no fixed geometry")]
    UnsupportedFormat(FourCC),
    /// Zero width or height.
    #[error("frame has zero area")]
    EmptyFrame,
}

/// Typed failures surfaced by the session manager.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A session for this device is already live.
    #[error("device {0} is busy")]
    DeviceBusy(DeviceId),
    /// The device is not present.
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
    /// The device refused or altered the requested geometry.
    #[error("resolution {requested} unsupported (device negotiated {negotiated})")]
    UnsupportedResolution {
        /// What was asked for.
        requested: Resolution,
        /// What the driver settled on.
        negotiated: Resolution,
    },
    /// The requested pixel format cannot be measured.
    #[error("pixel format {0} unsupported")]
    UnsupportedFormat(FourCC),
    /// No frame arrived within the capture timeout.
    #[error("no frame within {0:?}")]
    FrameTimeout(Duration),
    /// A frame arrived but its buffer was malformed.
    #[error("corrupt frame: {0}")]
    FrameCorrupt(#[from] FrameError),
    /// The device disappeared mid-session.
    #[error("device disconnected")]
    DeviceDisconnected,
    /// The session was already released.
    #[error("session is closed")]
    SessionClosed,
    /// The device has no control channel for this operation.
    #[error("control {0:?} unsupported on this device")]
    ControlUnsupported(Control),
    /// Any other port failure.
    #[error("capture port error: {0}")]
    Port(CameraError),
}

impl SessionError {
    /// Whether the orchestrator may retry the operation that produced this error.
    ///
    /// Timeouts and corrupt frames are transient; everything else is fatal for
    /// the test case that hit it.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::FrameTimeout(_) | Self::FrameCorrupt(_))
    }

    /// Whether the device is gone and further measurement is meaningless.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::DeviceDisconnected)
    }
}

/// Why a measurement procedure stopped without producing metrics.
#[derive(Error, Debug)]
pub enum MeasureError {
    /// Session fault that survived the retry policy, or a fatal one.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The cancellation flag was raised.
    #[error("cancelled")]
    Cancelled,
    /// The test case exceeded its wall-clock budget.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// Frames arrived but the metric could not be computed from them.
    #[error("{0}")]
    Unmeasurable(String),
}

/// Misuse of a test result or the aggregator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResultError {
    /// A status change that the lifecycle does not allow.
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        /// Current status.
        from: TestStatus,
        /// Requested status.
        to: TestStatus,
    },
    /// The result names a test case the aggregator was not built with.
    #[error("unknown test case {0}")]
    UnknownTest(String),
    /// A result for this test case was already recorded.
    #[error("result for {0} already recorded")]
    DuplicateResult(String),
    /// Only terminal results can be recorded.
    #[error("result for {0} is not terminal")]
    NotTerminal(String),
}

/// Errors from the external engine API.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Session layer failure (connect, busy device).
    #[error(transparent)]
    Session(#[from] SessionError),
    /// A suite run is already executing against this device.
    #[error("a suite run is already in progress on device {0}")]
    RunInProgress(DeviceId),
    /// Two test cases in one suite share an id.
    #[error("duplicate test case id {0}")]
    DuplicateTestId(String),
    /// The event stream of a run handle was already taken.
    #[error("suite run events already subscribed")]
    AlreadySubscribed,
    /// The worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
    /// The worker thread died without producing a suite run.
    #[error("suite run worker panicked")]
    WorkerPanicked,
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
    /// A log filter directive could not be parsed.
    #[error("invalid log filter: {0}")]
    LogFilter(#[from] tracing_subscriber::filter::ParseError),
}
