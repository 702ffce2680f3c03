//! Layered engine configuration.
//!
//! Sources are merged in this order, later ones winning:
//!
//! 1. built-in defaults,
//! 2. an optional TOML file,
//! 3. environment variables prefixed `USB_CAM_QA_`, with `__` separating
//!    nested keys (`USB_CAM_QA_RETRY__ATTEMPTS=5`).
//!
//! ```toml
//! [capture]
//! timeout = "2s"
//! buffer_count = 4
//!
//! [retry]
//! attempts = 3
//! backoff = "100ms"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [suite]
//! sharpness_min = 1500.0
//! fps_tolerance = 0.05
//! ```

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format as _, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::logging::LoggingConfig;
use crate::orchestrator::RetryPolicy;
use crate::testcase::SuiteConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "USB_CAM_QA_";

/// Capture port settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Per-call capture timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Streaming buffers requested from the driver.
    pub buffer_count: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            buffer_count: 4,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capture port settings.
    pub capture: CaptureConfig,
    /// Retry policy for transient capture faults.
    pub retry: RetryPolicy,
    /// Log output.
    pub logging: LoggingConfig,
    /// Thresholds and parameters of the default battery.
    pub suite: SuiteConfig,
}

impl EngineConfig {
    /// Layered provider: defaults, then `path` if given, then environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from all layers.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        Self::figment(path)
            .extract()
            .map_err(|err| EngineError::Config(Box::new(err)))
    }
}
