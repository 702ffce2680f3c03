//! Declarative test case definitions and the default battery.
//!
//! A [`TestCase`] says what to measure ([`Procedure`]), under which capture
//! format, what platform features it needs, how long it may take and which
//! [`Threshold`] its primary metric must meet. Numbers come from
//! [`SuiteConfig`]; procedures never hard-code them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::convergence::FocusCriteria;
use crate::metrics::Region;
use crate::traits::{FourCC, Resolution};

/// Pass condition applied to a procedure's primary metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Threshold {
    /// `value >= min`.
    AtLeast {
        /// Lower bound.
        min: f64,
    },
    /// `value <= max`.
    AtMost {
        /// Upper bound.
        max: f64,
    },
    /// `min <= value <= max`.
    Within {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// `|value - nominal| <= nominal * tolerance`. Without an explicit
    /// nominal, the device's advertised value is used.
    RelativeToNominal {
        /// Explicit nominal value.
        nominal: Option<f64>,
        /// Relative tolerance (0.10 = ±10%).
        tolerance: f64,
    },
}

/// Result of applying a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOutcome {
    /// The metric meets the threshold.
    Pass,
    /// The metric misses the threshold.
    Fail,
    /// No nominal value was available to compare against.
    NoReference,
}

impl Threshold {
    /// Apply the threshold. `advertised` is the device's own claim, used by
    /// [`Threshold::RelativeToNominal`] when no explicit nominal is set.
    pub fn evaluate(&self, value: f64, advertised: Option<f64>) -> ThresholdOutcome {
        let pass = match *self {
            Self::AtLeast { min } => value >= min,
            Self::AtMost { max } => value <= max,
            Self::Within { min, max } => (min..=max).contains(&value),
            Self::RelativeToNominal { nominal, tolerance } => {
                let Some(nominal) = nominal.or(advertised) else {
                    return ThresholdOutcome::NoReference;
                };
                crate::timing::within_tolerance(value, nominal, tolerance)
            }
        };
        if value.is_finite() && pass {
            ThresholdOutcome::Pass
        } else {
            ThresholdOutcome::Fail
        }
    }

    /// Human-readable form of the condition.
    pub fn describe(&self, advertised: Option<f64>) -> String {
        match *self {
            Self::AtLeast { min } => format!(">= {min}"),
            Self::AtMost { max } => format!("<= {max}"),
            Self::Within { min, max } => format!("within [{min}, {max}]"),
            Self::RelativeToNominal { nominal, tolerance } => match nominal.or(advertised) {
                Some(nominal) => format!("{nominal:.2} ±{:.0}%", tolerance * 100.0),
                None => format!("nominal ±{:.0}%", tolerance * 100.0),
            },
        }
    }
}

/// Format a test case captures in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureTarget {
    /// Requested geometry.
    pub resolution: Resolution,
    /// Requested pixel format.
    pub fourcc: FourCC,
}

/// What a test case measures, with its measurement parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "procedure", rename_all = "snake_case")]
pub enum Procedure {
    /// Capture one frame and report its geometry.
    Detection,
    /// Try each candidate resolution.
    Resolution {
        /// Resolutions to try, in order.
        candidates: Vec<Resolution>,
    },
    /// Capture a sequence and measure its frame rate.
    FrameRate {
        /// Frames to capture.
        frames: u32,
    },
    /// Watch mean brightness until it settles inside the threshold band.
    Exposure {
        /// Frame budget before declaring non-convergence.
        max_frames: u32,
        /// Consecutive in-band samples required.
        required_consecutive: u32,
    },
    /// Step autofocus and track sharpness until it plateaus.
    Focus {
        /// Plateau and hunting criteria.
        criteria: FocusCriteria,
        /// Autofocus step budget.
        max_steps: u32,
    },
    /// Drive the lens through absolute focus positions with autofocus off
    /// and measure how much sharpness responds.
    FocusSweep {
        /// Focus positions, in the device's control units.
        positions: Vec<i64>,
        /// Frames captured at each position; only the last is scored.
        settle_frames: u32,
    },
    /// Laplacian-variance sharpness averaged over a few frames.
    Sharpness {
        /// Frames to average.
        frames: u32,
    },
    /// Mean patch standard deviation over a flat region.
    Noise {
        /// Flat region of the frame.
        region: Region,
        /// Patch edge length in pixels.
        patch_size: u32,
        /// Frames to average.
        frames: u32,
    },
    /// Largest pairwise difference between channel means on a neutral target.
    ColorBalance {
        /// Frames to average.
        frames: u32,
    },
    /// Sustained capture rate over the interface, with throughput estimate.
    Interface {
        /// Frames to capture.
        frames: u32,
    },
}

impl Procedure {
    /// Name of the metric the threshold applies to.
    pub const fn primary_metric(&self) -> &'static str {
        match self {
            Self::Detection => "frames_received",
            Self::Resolution { .. } => "supported_count",
            Self::FrameRate { .. } | Self::Interface { .. } => "fps",
            Self::Exposure { .. } => "brightness",
            Self::Focus { .. } | Self::Sharpness { .. } => "sharpness",
            Self::FocusSweep { .. } => "focus_response",
            Self::Noise { .. } => "noise",
            Self::ColorBalance { .. } => "color_balance",
        }
    }
}

/// Static definition of one measurable characteristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Stable identifier used in reports.
    pub id: String,
    /// Human name.
    pub name: String,
    /// Capabilities that must be present, otherwise the case is skipped.
    #[serde(default)]
    pub requires: Vec<Capability>,
    /// Format to configure before measuring; `None` keeps the current one.
    #[serde(default)]
    pub target: Option<CaptureTarget>,
    /// Wall-clock budget for the whole case.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// What to measure.
    pub procedure: Procedure,
    /// Pass condition on the primary metric.
    pub threshold: Threshold,
}

impl TestCase {
    /// Create a test case with a 30 second timeout and no requirements.
    pub fn new(id: &str, name: &str, procedure: Procedure, threshold: Threshold) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            requires: Vec::new(),
            target: None,
            timeout: Duration::from_secs(30),
            procedure,
            threshold,
        }
    }

    /// Require a capability.
    #[must_use]
    pub fn requires(mut self, capability: Capability) -> Self {
        if !self.requires.contains(&capability) {
            self.requires.push(capability);
        }
        self
    }

    /// Capture in a specific format.
    #[must_use]
    pub const fn with_target(mut self, resolution: Resolution, fourcc: FourCC) -> Self {
        self.target = Some(CaptureTarget { resolution, fourcc });
        self
    }

    /// Set the wall-clock budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// First id that appears more than once in `cases`.
pub fn duplicate_id(cases: &[TestCase]) -> Option<&str> {
    cases.iter().enumerate().find_map(|(index, case)| {
        cases
            .get(..index)
            .is_some_and(|earlier| earlier.iter().any(|other| other.id == case.id))
            .then_some(case.id.as_str())
    })
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Thresholds and parameters for the default battery.
///
/// Reference values were tuned on one sensor; treat them as a starting point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Capture geometry for every measurement.
    pub resolution: Resolution,
    /// Capture pixel format for every measurement.
    pub pixel_format: FourCC,
    /// Wall-clock budget per test case.
    #[serde(with = "humantime_serde")]
    pub test_timeout: Duration,
    /// Resolutions probed by the resolution test.
    pub resolution_candidates: Vec<Resolution>,
    /// Supported resolutions needed to pass.
    pub min_supported_resolutions: u32,
    /// Frames captured for the frame-rate test.
    pub frame_rate_frames: u32,
    /// Explicit nominal fps; `None` uses the advertised rate.
    pub nominal_fps: Option<f64>,
    /// Relative fps tolerance.
    pub fps_tolerance: f64,
    /// Lower edge of the exposure band.
    pub brightness_min: f64,
    /// Upper edge of the exposure band.
    pub brightness_max: f64,
    /// Consecutive in-band samples for exposure convergence.
    pub exposure_consecutive: u32,
    /// Frame budget for exposure convergence.
    pub exposure_max_frames: u32,
    /// Autofocus plateau and hunting criteria.
    pub focus: FocusCriteria,
    /// Autofocus step budget.
    pub focus_max_steps: u32,
    /// Sharpness a converged focus must reach.
    pub focus_min_sharpness: f64,
    /// Lens positions visited by the focus sweep.
    pub focus_sweep_positions: Vec<i64>,
    /// Frames captured per sweep position.
    pub focus_sweep_settle_frames: u32,
    /// Minimum relative sharpness swing across the sweep.
    pub focus_sweep_min_response: f64,
    /// Minimum Laplacian variance.
    pub sharpness_min: f64,
    /// Frames averaged for sharpness, noise and colour.
    pub sample_frames: u32,
    /// Flat region for the noise measurement.
    pub noise_region: Region,
    /// Noise patch size in pixels.
    pub noise_patch_size: u32,
    /// Maximum noise score.
    pub noise_max: f64,
    /// Maximum colour channel imbalance on an 8-bit scale.
    pub color_balance_max: f64,
    /// Frames captured for the interface test.
    pub interface_frames: u32,
    /// Minimum sustained fps over the interface.
    pub interface_min_fps: f64,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(640, 480),
            pixel_format: FourCC::YUYV,
            test_timeout: Duration::from_secs(30),
            resolution_candidates: vec![
                Resolution::new(640, 480),
                Resolution::new(1280, 720),
                Resolution::new(1920, 1080),
            ],
            min_supported_resolutions: 1,
            frame_rate_frames: 60,
            nominal_fps: None,
            fps_tolerance: 0.10,
            brightness_min: 80.0,
            brightness_max: 180.0,
            exposure_consecutive: 5,
            exposure_max_frames: 90,
            focus: FocusCriteria::default(),
            focus_max_steps: 30,
            focus_min_sharpness: 2000.0,
            focus_sweep_positions: vec![0, 32, 64, 96, 128, 160, 192, 224, 255],
            focus_sweep_settle_frames: 2,
            focus_sweep_min_response: 0.2,
            sharpness_min: 2000.0,
            sample_frames: 3,
            noise_region: Region::default(),
            noise_patch_size: 16,
            noise_max: 6.0,
            color_balance_max: 12.0,
            interface_frames: 30,
            interface_min_fps: 5.0,
        }
    }
}

/// Identifiers of the default battery, in declaration order.
pub const DEFAULT_TEST_IDS: [&str; 10] = [
    "camera_detection",
    "resolution",
    "frame_rate",
    "exposure",
    "autofocus",
    "focus_sweep",
    "sharpness",
    "noise",
    "color_balance",
    "usb_interface",
];

/// Build the standard battery from `config`.
pub fn default_battery(config: &SuiteConfig) -> Vec<TestCase> {
    let target = |case: TestCase| {
        case.with_target(config.resolution, config.pixel_format)
            .with_timeout(config.test_timeout)
    };
    let count = |value: u32| f64::from(value);

    vec![
        target(TestCase::new(
            "camera_detection",
            "Camera Detection",
            Procedure::Detection,
            Threshold::AtLeast { min: 1.0 },
        )),
        TestCase::new(
            "resolution",
            "Resolution Test",
            Procedure::Resolution {
                candidates: config.resolution_candidates.clone(),
            },
            Threshold::AtLeast {
                min: count(config.min_supported_resolutions),
            },
        )
        .with_timeout(config.test_timeout),
        target(TestCase::new(
            "frame_rate",
            "Frame Rate Test",
            Procedure::FrameRate {
                frames: config.frame_rate_frames,
            },
            Threshold::RelativeToNominal {
                nominal: config.nominal_fps,
                tolerance: config.fps_tolerance,
            },
        )),
        target(TestCase::new(
            "exposure",
            "Exposure Control",
            Procedure::Exposure {
                max_frames: config.exposure_max_frames,
                required_consecutive: config.exposure_consecutive,
            },
            Threshold::Within {
                min: config.brightness_min,
                max: config.brightness_max,
            },
        )),
        target(
            TestCase::new(
                "autofocus",
                "Autofocus Convergence",
                Procedure::Focus {
                    criteria: config.focus,
                    max_steps: config.focus_max_steps,
                },
                Threshold::AtLeast {
                    min: config.focus_min_sharpness,
                },
            )
            .requires(Capability::ControlChannel)
            .requires(Capability::Autofocus),
        ),
        target(
            TestCase::new(
                "focus_sweep",
                "Manual Focus Sweep",
                Procedure::FocusSweep {
                    positions: config.focus_sweep_positions.clone(),
                    settle_frames: config.focus_sweep_settle_frames,
                },
                Threshold::AtLeast {
                    min: config.focus_sweep_min_response,
                },
            )
            .requires(Capability::ControlChannel)
            .requires(Capability::ManualFocus),
        ),
        target(TestCase::new(
            "sharpness",
            "Image Sharpness",
            Procedure::Sharpness {
                frames: config.sample_frames,
            },
            Threshold::AtLeast {
                min: config.sharpness_min,
            },
        )),
        target(TestCase::new(
            "noise",
            "Noise Level",
            Procedure::Noise {
                region: config.noise_region,
                patch_size: config.noise_patch_size,
                frames: config.sample_frames,
            },
            Threshold::AtMost {
                max: config.noise_max,
            },
        )),
        target(TestCase::new(
            "color_balance",
            "White Balance",
            Procedure::ColorBalance {
                frames: config.sample_frames,
            },
            Threshold::AtMost {
                max: config.color_balance_max,
            },
        )),
        target(TestCase::new(
            "usb_interface",
            "USB Interface",
            Procedure::Interface {
                frames: config.interface_frames,
            },
            Threshold::AtLeast {
                min: config.interface_min_fps,
            },
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_battery_order_and_ids() {
        let battery = default_battery(&SuiteConfig::default());
        let ids: Vec<&str> = battery.iter().map(|case| case.id.as_str()).collect();
        assert_eq!(ids, DEFAULT_TEST_IDS);

        let focus = battery
            .iter()
            .find(|case| case.id == "autofocus")
            .expect("autofocus case");
        assert!(focus.requires.contains(&Capability::Autofocus));

        let sweep = battery
            .iter()
            .find(|case| case.id == "focus_sweep")
            .expect("focus_sweep case");
        assert!(sweep.requires.contains(&Capability::ManualFocus));
        assert_eq!(sweep.procedure.primary_metric(), "focus_response");
        assert_eq!(duplicate_id(&battery), None);

        let resolution = battery
            .iter()
            .find(|case| case.id == "resolution")
            .expect("resolution case");
        assert_eq!(resolution.target, None);
    }

    #[test]
    fn test_duplicate_id_reports_second_occurrence() {
        let case = |id: &str| {
            TestCase::new(id, id, Procedure::Detection, Threshold::AtLeast { min: 1.0 })
        };
        assert_eq!(duplicate_id(&[case("a"), case("b"), case("a")]), Some("a"));
        assert_eq!(duplicate_id(&[case("a"), case("b")]), None);
        assert_eq!(duplicate_id(&[]), None);
    }

    #[test]
    fn test_thresholds_follow_config() {
        let config = SuiteConfig {
            sharpness_min: 150.0,
            ..SuiteConfig::default()
        };
        let battery = default_battery(&config);
        let sharpness = battery
            .iter()
            .find(|case| case.id == "sharpness")
            .expect("sharpness case");
        assert_eq!(sharpness.threshold, Threshold::AtLeast { min: 150.0 });
    }

    #[test]
    fn test_threshold_evaluate() {
        let at_least = Threshold::AtLeast { min: 2000.0 };
        assert_eq!(at_least.evaluate(2500.0, None), ThresholdOutcome::Pass);
        assert_eq!(at_least.evaluate(1999.0, None), ThresholdOutcome::Fail);
        assert_eq!(at_least.evaluate(f64::NAN, None), ThresholdOutcome::Fail);

        let band = Threshold::Within {
            min: 80.0,
            max: 180.0,
        };
        assert_eq!(band.evaluate(80.0, None), ThresholdOutcome::Pass);
        assert_eq!(band.evaluate(181.0, None), ThresholdOutcome::Fail);

        let fps = Threshold::RelativeToNominal {
            nominal: None,
            tolerance: 0.10,
        };
        assert_eq!(fps.evaluate(8.0, Some(8.0)), ThresholdOutcome::Pass);
        assert_eq!(fps.evaluate(7.0, Some(8.0)), ThresholdOutcome::Fail);
        assert_eq!(fps.evaluate(8.0, None), ThresholdOutcome::NoReference);
        assert_eq!(fps.describe(Some(8.0)), "8.00 ±10%");
    }

    #[test]
    fn test_case_deserializes_from_toml_shape() {
        let json = r#"{
            "id": "sharp",
            "name": "Sharp",
            "timeout": "5s",
            "procedure": { "procedure": "sharpness", "frames": 2 },
            "threshold": { "kind": "at_least", "min": 10.0 }
        }"#;
        let case: TestCase = serde_json::from_str(json).expect("deserialize failed");
        assert_eq!(case.timeout, Duration::from_secs(5));
        assert_eq!(case.procedure, Procedure::Sharpness { frames: 2 });
        assert!(case.requires.is_empty());
        assert_eq!(case.procedure.primary_metric(), "sharpness");
    }
}
