//! Session manager: exclusive ownership of one open camera at a time.
//!
//! Lifecycle is acquire → configure → capture (repeatedly) → release. A
//! second acquire for a device that already has a live session fails with
//! [`SessionError::DeviceBusy`] instead of queueing. Every frame returned by
//! [`Session::capture`] has passed the geometry check in
//! [`FrameSample::from_raw`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{CameraError, SessionError};
use crate::frame::FrameSample;
use crate::traits::{
    CameraDevice, CapturePort, Control, DeviceDescriptor, DeviceId, Format, FourCC, Resolution,
};

type LiveSet = Arc<Mutex<HashSet<DeviceId>>>;

/// Owns the capture port and the registry of live sessions.
pub struct SessionManager {
    port: Arc<dyn CapturePort>,
    live: LiveSet,
}

impl SessionManager {
    /// Create a manager over a capture port.
    pub fn new(port: Arc<dyn CapturePort>) -> Self {
        Self {
            port,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Enumerate devices visible to the port.
    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>, SessionError> {
        self.port.list_devices().map_err(SessionError::Port)
    }

    /// Look up the descriptor for one device.
    pub fn find(&self, id: &DeviceId) -> Result<DeviceDescriptor, SessionError> {
        self.devices()?
            .into_iter()
            .find(|descriptor| &descriptor.id == id)
            .ok_or_else(|| SessionError::DeviceNotFound(id.clone()))
    }

    /// Whether a session for `id` is currently live.
    pub fn is_live(&self, id: &DeviceId) -> bool {
        self.live.lock().contains(id)
    }

    /// Open `descriptor` for exclusive use.
    #[instrument(skip_all, fields(device = %descriptor.id))]
    pub fn acquire(&self, descriptor: &DeviceDescriptor) -> Result<Session, SessionError> {
        let mut live = self.live.lock();
        if live.contains(&descriptor.id) {
            warn!("device already has a live session");
            return Err(SessionError::DeviceBusy(descriptor.id.clone()));
        }

        let device = self.port.open(&descriptor.id).map_err(|err| match err {
            CameraError::NotFound(id) => SessionError::DeviceNotFound(id),
            CameraError::Busy(id) => SessionError::DeviceBusy(id),
            other => SessionError::Port(other),
        })?;
        let format = device.format().map_err(SessionError::Port)?;

        live.insert(descriptor.id.clone());
        info!(%format, "session acquired");

        Ok(Session {
            descriptor: descriptor.clone(),
            device,
            format,
            state: SessionState::Open,
            live: Arc::clone(&self.live),
        })
    }

    /// Release a session. Idempotent.
    pub fn release(&self, session: &mut Session) {
        session.release();
    }
}

/// Open/closed state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Streaming is possible.
    Open,
    /// The device disappeared; only release is meaningful.
    Disconnected,
    /// Released.
    Closed,
}

/// Runtime binding to one open device.
pub struct Session {
    descriptor: DeviceDescriptor,
    device: Box<dyn CameraDevice>,
    format: Format,
    state: SessionState,
    live: LiveSet,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.descriptor.id)
            .field("format", &self.format)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Descriptor of the bound device.
    pub const fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Negotiated format.
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether frames can still be captured.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Disconnected => Err(SessionError::DeviceDisconnected),
            SessionState::Closed => Err(SessionError::SessionClosed),
        }
    }

    fn port_error(&mut self, err: CameraError, timeout: Duration) -> SessionError {
        match err {
            CameraError::Timeout => SessionError::FrameTimeout(timeout),
            CameraError::Disconnected => {
                self.state = SessionState::Disconnected;
                SessionError::DeviceDisconnected
            }
            CameraError::ControlNotSupported(control) => SessionError::ControlUnsupported(control),
            other => SessionError::Port(other),
        }
    }

    /// Negotiate a resolution and pixel format.
    ///
    /// Drivers adjust unsupported requests to the nearest mode they have;
    /// any adjustment is reported as [`SessionError::UnsupportedResolution`].
    #[instrument(skip(self), fields(device = %self.descriptor.id))]
    pub fn configure(
        &mut self,
        resolution: Resolution,
        fourcc: FourCC,
    ) -> Result<&Format, SessionError> {
        self.ensure_open()?;
        if !fourcc.is_measurable() {
            return Err(SessionError::UnsupportedFormat(fourcc));
        }

        let requested = Format::new(resolution.width, resolution.height, fourcc);
        let actual = match self.device.set_format(&requested) {
            Ok(actual) => actual,
            Err(CameraError::FormatNotSupported(_)) => {
                return Err(SessionError::UnsupportedResolution {
                    requested: resolution,
                    negotiated: self.format.resolution(),
                });
            }
            Err(err) => return Err(self.port_error(err, Duration::ZERO)),
        };
        self.format = actual;

        if self.format.fourcc != fourcc {
            return Err(SessionError::UnsupportedFormat(fourcc));
        }
        if self.format.resolution() != resolution {
            debug!(negotiated = %self.format, "driver adjusted requested resolution");
            return Err(SessionError::UnsupportedResolution {
                requested: resolution,
                negotiated: self.format.resolution(),
            });
        }
        debug!(format = %self.format, "configured");
        Ok(&self.format)
    }

    /// Capture one frame, waiting at most `timeout`.
    ///
    /// The buffer is copied out of the port and checked against the
    /// negotiated geometry before it is returned.
    pub fn capture(&mut self, timeout: Duration) -> Result<FrameSample, SessionError> {
        self.ensure_open()?;
        let outcome = match self.device.read(timeout) {
            Ok(raw) => Ok(FrameSample::from_raw(&raw, &self.format)),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(frame_err)) => {
                warn!(error = %frame_err, "rejected malformed frame");
                Err(SessionError::FrameCorrupt(frame_err))
            }
            Err(port_err) => Err(self.port_error(port_err, timeout)),
        }
    }

    /// Write a control value through the device's control channel.
    pub fn set_control(&mut self, control: Control, value: i64) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.descriptor.supports(control) {
            return Err(SessionError::ControlUnsupported(control));
        }
        match self.device.set_control(control, value) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.port_error(err, Duration::ZERO)),
        }
    }

    /// Close the device and drop it from the live registry.
    ///
    /// Safe to call repeatedly and after a disconnect.
    pub fn release(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.device.close();
        self.state = SessionState::Closed;
        self.live.lock().remove(&self.descriptor.id);
        info!(device = %self.descriptor.id, "session released");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}
