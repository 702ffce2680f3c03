//! USB camera qualification engine.
//!
//! Owns an exclusive camera session, runs an ordered battery of test cases
//! against live frames, computes image and timing metrics, applies
//! pass/fail thresholds and aggregates a suite run report. The capture port
//! is a trait: V4L2 on Linux in production, a synthetic port in tests.
//!
//! ```no_run
//! use std::sync::Arc;
//! use usb_cam_qa::{default_battery, DeviceId, Engine, EngineConfig, SystemProbe, V4L2Port};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load(None)?;
//! let engine = Engine::new(
//!     Arc::new(V4L2Port::new(config.capture.buffer_count)),
//!     Arc::new(SystemProbe),
//!     &config,
//! );
//! let session = engine.connect(&DeviceId::from(0_u32))?;
//! let run = engine
//!     .run_suite(session, default_battery(&config.suite))?
//!     .wait()?;
//! println!("{}", run.to_json()?);
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod config;
pub mod convergence;
pub mod device;
pub mod engine;
pub mod error;
pub mod frame;
pub mod logging;
pub mod measure;
pub mod metrics;
pub mod mock;
pub mod orchestrator;
pub mod result;
pub mod session;
pub mod testcase;
pub mod timing;
pub mod traits;

pub use capability::{Capability, CapabilityProbe, CapabilitySet, StaticProbe, SystemProbe};
pub use config::EngineConfig;
pub use device::V4L2Port;
pub use engine::{Engine, RunEvent, SuiteRunHandle};
pub use error::{CameraError, EngineError, SessionError};
pub use frame::FrameSample;
pub use orchestrator::{CancelToken, Orchestrator, ProgressEvent, RetryPolicy};
pub use result::{SuiteRun, TestResult, TestStatus, Verdict};
pub use session::{Session, SessionManager};
pub use testcase::{default_battery, Procedure, SuiteConfig, TestCase, Threshold};
pub use traits::{
    CameraDevice, CapturePort, Control, DeviceDescriptor, DeviceId, Format, FourCC, Resolution,
};
