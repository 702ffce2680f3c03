//! Suite orchestration: runs an ordered battery of test cases against one
//! session and turns every outcome into a terminal [`TestResult`].
//!
//! The orchestrator never panics out of a run. Capture faults are retried
//! by [`CaptureContext`](crate::measure::CaptureContext) up to the
//! [`RetryPolicy`] bound; whatever survives becomes an ERROR result. A
//! disconnect or a cancellation marks the in-flight case ERROR and every
//! remaining case SKIPPED.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};

use crate::capability::CapabilitySet;
use crate::error::MeasureError;
use crate::measure::{self, CaptureContext, Measurement};
use crate::result::{ResultAggregator, SuiteRun, TestResult, TestStatus};
use crate::session::Session;
use crate::testcase::{TestCase, ThresholdOutcome};

/// Bounded retry for transient capture faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total capture attempts per frame, including the first.
    pub attempts: u32,
    /// Delay before the first retry; doubles for each further retry.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(6);
        self.backoff.saturating_mul(1 << shift)
    }
}

/// Shared cancellation flag for one suite run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag was raised.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Status change or partial metrics of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Test case identifier.
    pub test_id: String,
    /// Status at the time of the event.
    pub status: TestStatus,
    /// Metrics known so far.
    pub metrics: BTreeMap<String, f64>,
}

/// Receiver of progress events. Must not block.
pub type ProgressFn = Box<dyn Fn(ProgressEvent) + Send>;

/// Sequences test cases against one session.
pub struct Orchestrator {
    capture_timeout: Duration,
    retry: RetryPolicy,
    capabilities: CapabilitySet,
    cancel: CancelToken,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("capture_timeout", &self.capture_timeout)
            .field("retry", &self.retry)
            .field("capabilities", &self.capabilities)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Why the remaining cases of a run are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Cancelled,
    Disconnected,
}

impl Abort {
    const fn message(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Disconnected => "device disconnected",
        }
    }
}

impl Orchestrator {
    /// Orchestrator for a device with `capabilities`, using default timing.
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self {
            capture_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            capabilities,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    /// Per-call capture timeout.
    #[must_use]
    pub const fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    /// Retry policy for transient faults.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Use an existing cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deliver progress events to `progress`.
    #[must_use]
    pub fn on_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Token that cancels this orchestrator's runs.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn emit(&self, test_id: &str, status: TestStatus, metrics: BTreeMap<String, f64>) {
        if let Some(progress) = &self.progress {
            progress(ProgressEvent {
                test_id: test_id.to_owned(),
                status,
                metrics,
            });
        }
    }

    fn skip(&self, aggregator: &mut ResultAggregator, case: &TestCase, message: &str) {
        debug!(test = %case.id, message, "skipping test case");
        self.emit(&case.id, TestStatus::Skipped, BTreeMap::new());
        record(aggregator, TestResult::skipped(&case.id, message));
    }

    /// Run `cases` in order and return the frozen suite run.
    ///
    /// Always completes: faults become ERROR results, never panics or early
    /// returns.
    pub fn run(&self, session: &mut Session, cases: &[TestCase]) -> SuiteRun {
        let span = info_span!("suite", device = %session.descriptor().id, cases = cases.len());
        let _guard = span.enter();
        info!("suite run started");

        let mut aggregator = ResultAggregator::new(cases);
        let mut abort: Option<Abort> = None;

        for case in cases {
            if abort.is_none() && self.cancel.is_cancelled() {
                abort = Some(Abort::Cancelled);
            }
            if let Some(reason) = abort {
                self.skip(&mut aggregator, case, reason.message());
                continue;
            }
            if let Some(missing) = self.capabilities.first_missing(&case.requires) {
                self.skip(&mut aggregator, case, &format!("requires {missing}"));
                continue;
            }

            let (result, fatal) = self.execute(session, case);
            self.emit(case.id.as_str(), result.status(), result.metrics().clone());
            record(&mut aggregator, result);
            abort = fatal;
        }

        let run = aggregator.finalize();
        let summary = run.summary();
        info!(
            overall = %run.overall(),
            passed = summary.passed,
            failed = summary.failed,
            errors = summary.errors,
            skipped = summary.skipped,
            "suite run finished"
        );
        run
    }

    fn execute(&self, session: &mut Session, case: &TestCase) -> (TestResult, Option<Abort>) {
        let span = info_span!("test_case", test = %case.id);
        let _guard = span.enter();

        let mut result = TestResult::pending(&case.id);
        if let Err(err) = result.start() {
            error!(error = %err, "could not start test case");
        }
        self.emit(&case.id, TestStatus::Running, BTreeMap::new());
        info!(name = %case.name, timeout = ?case.timeout, "test case started");

        let advertised_fps = session.descriptor().nominal_fps;
        let report = |name: &str, value: f64| {
            self.emit(&case.id, TestStatus::Running, BTreeMap::from([(name.to_owned(), value)]));
        };
        let mut ctx = CaptureContext::new(
            session,
            &self.retry,
            self.capture_timeout,
            case.timeout,
            &self.cancel,
            &self.capabilities,
            &report,
        );
        let outcome = measure::run_procedure(case, &mut ctx);
        let retries = ctx.retries();

        let (status, message, fatal) = match outcome {
            Ok(measurement) => {
                for (name, value) in measurement.metrics() {
                    set_metric(&mut result, name, *value);
                }
                let (status, message) = judge(case, &measurement, advertised_fps);
                (status, message, None)
            }
            Err(MeasureError::Cancelled) => {
                warn!("test case cancelled");
                (TestStatus::Error, "cancelled".to_owned(), Some(Abort::Cancelled))
            }
            Err(MeasureError::TimedOut(limit)) => {
                warn!(?limit, "test case timed out");
                (TestStatus::Error, format!("timed out after {limit:?}"), None)
            }
            Err(MeasureError::Session(err)) if err.is_disconnect() => {
                error!("device disconnected, aborting suite");
                (TestStatus::Error, err.to_string(), Some(Abort::Disconnected))
            }
            Err(MeasureError::Session(err)) if err.is_retryable() => {
                warn!(error = %err, attempts = self.retry.attempts, "capture retries exhausted");
                (
                    TestStatus::Error,
                    format!("capture failed after {} attempts: {err}", self.retry.attempts),
                    None,
                )
            }
            Err(err) => {
                warn!(error = %err, "test case errored");
                (TestStatus::Error, err.to_string(), None)
            }
        };

        if retries > 0 {
            set_metric(&mut result, "capture_retries", f64::from(retries));
        }
        if let Err(err) = result.finish(status, &message) {
            error!(error = %err, "could not finish test case");
        }
        info!(status = %result.status(), message = result.message(), "test case finished");
        (result, fatal)
    }
}

/// Apply the case's threshold to a completed measurement.
fn judge(
    case: &TestCase,
    measurement: &Measurement,
    advertised: Option<f64>,
) -> (TestStatus, String) {
    if let Some(reason) = measurement.rejection() {
        return (TestStatus::Fail, reason.to_owned());
    }
    let metric = case.procedure.primary_metric();
    let Some(value) = measurement.metric(metric) else {
        return (TestStatus::Error, format!("metric {metric} was not produced"));
    };
    let expected = case.threshold.describe(advertised);
    match case.threshold.evaluate(value, advertised) {
        ThresholdOutcome::Pass => (TestStatus::Pass, format!("{metric} {value:.2} ({expected})")),
        ThresholdOutcome::Fail => (
            TestStatus::Fail,
            format!("{metric} {value:.2}, expected {expected}"),
        ),
        ThresholdOutcome::NoReference => (
            TestStatus::Fail,
            format!("{metric} {value:.2}, device advertises no nominal value"),
        ),
    }
}

fn set_metric(result: &mut TestResult, name: &str, value: f64) {
    if let Err(err) = result.set_metric(name, value) {
        error!(error = %err, metric = name, "metric dropped");
    }
}

fn record(aggregator: &mut ResultAggregator, result: TestResult) {
    if let Err(err) = aggregator.record(result) {
        error!(error = %err, "result dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::mock::{MockCamera, MockFault, MockPort, TestPattern};
    use crate::session::SessionManager;
    use crate::testcase::{Procedure, Threshold};
    use crate::traits::{DeviceId, FourCC, Resolution};
    use parking_lot::Mutex;

    fn session_for(camera: MockCamera) -> Session {
        let id = camera.descriptor().id.clone();
        let manager = SessionManager::new(Arc::new(MockPort::new().with_camera(camera)));
        let descriptor = manager.find(&id).expect("find failed");
        manager.acquire(&descriptor).expect("acquire failed")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn detection(id: &str) -> TestCase {
        TestCase::new(id, id, Procedure::Detection, Threshold::AtLeast { min: 1.0 })
    }

    fn statuses(run: &SuiteRun) -> Vec<TestStatus> {
        run.results().iter().map(TestResult::status).collect()
    }

    #[test]
    fn test_retry_recovers_transient_faults() {
        let mut session = session_for(
            MockCamera::new("0")
                .with_fault(0, MockFault::Timeout)
                .with_fault(1, MockFault::Corrupt),
        );
        let run = Orchestrator::new(CapabilitySet::new())
            .with_retry(fast_retry())
            .run(&mut session, &[detection("a")]);
        let result = run.result("a").expect("result");
        assert_eq!(result.status(), TestStatus::Pass);
        assert_eq!(result.metric("capture_retries"), Some(2.0));
    }

    #[test]
    fn test_retry_exhaustion_is_error() {
        let camera = (0..3).fold(MockCamera::new("0"), |camera, index| {
            camera.with_fault(index, MockFault::Timeout)
        });
        let mut session = session_for(camera);
        let run = Orchestrator::new(CapabilitySet::new())
            .with_retry(fast_retry())
            .run(&mut session, &[detection("a"), detection("b")]);
        assert_eq!(statuses(&run), [TestStatus::Error, TestStatus::Pass]);
        assert!(run.results()[0].message().contains("3 attempts"));
    }

    #[test]
    fn test_missing_capability_skips() {
        let mut session = session_for(MockCamera::new("0"));
        let cases = [detection("a").requires(Capability::Autofocus), detection("b")];
        let run = Orchestrator::new(CapabilitySet::new()).run(&mut session, &cases);
        assert_eq!(statuses(&run), [TestStatus::Skipped, TestStatus::Pass]);
        assert!(run.results()[0].message().contains("autofocus"));
    }

    #[test]
    fn test_disconnect_aborts_remaining_cases() {
        let mut session = session_for(MockCamera::new("0").with_fault(1, MockFault::Disconnect));
        let cases = [detection("a"), detection("b"), detection("c")];
        let run = Orchestrator::new(CapabilitySet::new())
            .with_retry(fast_retry())
            .run(&mut session, &cases);
        assert_eq!(
            statuses(&run),
            [TestStatus::Pass, TestStatus::Error, TestStatus::Skipped]
        );
        assert_eq!(run.overall(), crate::result::Verdict::Fail);
        assert!(!session.is_open());
    }

    #[test]
    fn test_cancel_before_start_skips_everything() {
        let mut session = session_for(MockCamera::new("0"));
        let orchestrator = Orchestrator::new(CapabilitySet::new());
        orchestrator.cancel_token().cancel();
        let run = orchestrator.run(&mut session, &[detection("a"), detection("b")]);
        assert_eq!(statuses(&run), [TestStatus::Skipped, TestStatus::Skipped]);
        assert_eq!(run.overall(), crate::result::Verdict::Pass);
    }

    #[test]
    fn test_wall_clock_timeout_is_error() {
        let mut session = session_for(MockCamera::new("0").with_read_delay(Duration::from_millis(40)));
        let case = TestCase::new(
            "slow",
            "slow",
            Procedure::FrameRate { frames: 100 },
            Threshold::AtLeast { min: 1.0 },
        )
        .with_timeout(Duration::from_millis(150));
        let run = Orchestrator::new(CapabilitySet::new())
            .with_retry(fast_retry())
            .run(&mut session, &[case]);
        let result = run.result("slow").expect("result");
        assert_eq!(result.status(), TestStatus::Error);
        assert!(result.message().contains("timed out"));
    }

    #[test]
    fn test_unbounded_timeout_completes() {
        let mut session = session_for(MockCamera::new("0"));
        let case = detection("a").with_timeout(Duration::MAX);
        let run = Orchestrator::new(CapabilitySet::new()).run(&mut session, &[case]);
        assert_eq!(statuses(&run), [TestStatus::Pass]);
    }

    #[test]
    fn test_repeated_case_ids_keep_every_result() {
        let mut session = session_for(MockCamera::new("0"));
        let sharp = |min| {
            TestCase::new(
                "sharp",
                "sharp",
                Procedure::Sharpness { frames: 1 },
                Threshold::AtLeast { min },
            )
        };
        let run = Orchestrator::new(CapabilitySet::new()).run(&mut session, &[sharp(0.0), sharp(1e12)]);
        assert_eq!(statuses(&run), [TestStatus::Pass, TestStatus::Fail]);
        assert_eq!(run.overall(), crate::result::Verdict::Fail);
    }

    #[test]
    fn test_unsupported_target_resolution_is_fail() {
        let mut session = session_for(MockCamera::new("0"));
        let case = detection("a").with_target(Resolution::new(1920, 1080), FourCC::YUYV);
        let run = Orchestrator::new(CapabilitySet::new()).run(&mut session, &[case]);
        assert_eq!(statuses(&run), [TestStatus::Fail]);
    }

    #[test]
    fn test_progress_events_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut session = session_for(
            MockCamera::new(DeviceId::from("0")).with_pattern(TestPattern::Solid(120, 128, 128)),
        );
        let orchestrator = Orchestrator::new(CapabilitySet::new())
            .on_progress(Box::new(move |event| sink.lock().push(event)));
        orchestrator.run(&mut session, &[detection("a"), detection("b")]);

        let seen: Vec<(String, TestStatus)> = events
            .lock()
            .iter()
            .map(|event| (event.test_id.clone(), event.status))
            .collect();
        assert_eq!(
            seen,
            [
                ("a".to_owned(), TestStatus::Running),
                ("a".to_owned(), TestStatus::Pass),
                ("b".to_owned(), TestStatus::Running),
                ("b".to_owned(), TestStatus::Pass),
            ]
        );
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    }
}
