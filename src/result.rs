//! Test results, their lifecycle, and the suite-level verdict.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ResultError;
use crate::testcase::TestCase;

/// Lifecycle status of one test result.
///
/// `Pending -> Running -> {Pass, Fail, Error}`, or `Pending -> Skipped`.
/// Terminal statuses never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    /// Not started.
    Pending,
    /// Measurement in progress.
    Running,
    /// Metric met its threshold.
    Pass,
    /// Metric missed its threshold, or did not converge.
    Fail,
    /// The measurement could not be completed.
    Error,
    /// Never attempted.
    Skipped,
}

impl TestStatus {
    /// Whether the status is final.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Pass | Self::Fail | Self::Error | Self::Skipped)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Pass | Self::Fail | Self::Error)
        )
    }

    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    test_id: String,
    status: TestStatus,
    metrics: BTreeMap<String, f64>,
    message: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl TestResult {
    /// A pending result for `test_id`.
    pub fn pending(test_id: &str) -> Self {
        Self {
            test_id: test_id.to_owned(),
            status: TestStatus::Pending,
            metrics: BTreeMap::new(),
            message: String::new(),
            started_at: None,
            ended_at: None,
        }
    }

    /// A result that was never attempted.
    pub fn skipped(test_id: &str, message: &str) -> Self {
        let now = Utc::now();
        Self {
            test_id: test_id.to_owned(),
            status: TestStatus::Skipped,
            metrics: BTreeMap::new(),
            message: message.to_owned(),
            started_at: Some(now),
            ended_at: Some(now),
        }
    }

    fn transition(&mut self, next: TestStatus) -> Result<(), ResultError> {
        if !self.status.can_transition_to(next) {
            return Err(ResultError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark the measurement as started.
    pub fn start(&mut self) -> Result<(), ResultError> {
        self.transition(TestStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record a metric on a result that is still running.
    pub fn set_metric(&mut self, name: &str, value: f64) -> Result<(), ResultError> {
        if self.status.is_terminal() {
            return Err(ResultError::IllegalTransition {
                from: self.status,
                to: self.status,
            });
        }
        self.metrics.insert(name.to_owned(), value);
        Ok(())
    }

    /// Move to a terminal status with a message. Frozen afterwards.
    pub fn finish(&mut self, status: TestStatus, message: &str) -> Result<(), ResultError> {
        self.transition(status)?;
        self.message = message.to_owned();
        self.ended_at = Some(Utc::now());
        if self.started_at.is_none() {
            self.started_at = self.ended_at;
        }
        Ok(())
    }

    /// Test case identifier.
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Current status.
    pub const fn status(&self) -> TestStatus {
        self.status
    }

    /// Named numeric measurements.
    pub const fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// One metric by name.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Explanation of the status.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// When measurement started.
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the result became terminal.
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }
}

/// Overall verdict of a suite run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// No result failed or errored.
    Pass,
    /// At least one result failed or errored.
    Fail,
}

impl Verdict {
    /// PASS iff no result is FAIL or ERROR. Skipped results do not count.
    pub fn from_results(results: &[TestResult]) -> Self {
        if results
            .iter()
            .any(|r| matches!(r.status(), TestStatus::Fail | TestStatus::Error))
        {
            Self::Fail
        } else {
            Self::Pass
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Fail => f.write_str("FAIL"),
        }
    }
}

/// Per-status counts of a suite run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Results in the run.
    pub total: usize,
    /// PASS results.
    pub passed: usize,
    /// FAIL results.
    pub failed: usize,
    /// ERROR results.
    pub errors: usize,
    /// SKIPPED results.
    pub skipped: usize,
}

/// Immutable snapshot of a completed suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteRun {
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    overall: Verdict,
    results: Vec<TestResult>,
}

impl SuiteRun {
    /// When the run started.
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the run finished.
    pub const fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    /// Overall verdict.
    pub const fn overall(&self) -> Verdict {
        self.overall
    }

    /// Results in test case declaration order.
    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    /// Result for one test case.
    pub fn result(&self, test_id: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.test_id() == test_id)
    }

    /// Count results per status.
    pub fn summary(&self) -> Summary {
        self.results.iter().fold(
            Summary {
                total: self.results.len(),
                ..Summary::default()
            },
            |mut acc, result| {
                match result.status() {
                    TestStatus::Pass => acc.passed += 1,
                    TestStatus::Fail => acc.failed += 1,
                    TestStatus::Error => acc.errors += 1,
                    TestStatus::Skipped => acc.skipped += 1,
                    TestStatus::Pending | TestStatus::Running => {}
                }
                acc
            },
        )
    }

    /// Pretty JSON document of the run.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Collects terminal results and freezes them into a [`SuiteRun`].
#[derive(Debug)]
pub struct ResultAggregator {
    started_at: DateTime<Utc>,
    slots: Vec<(String, Option<TestResult>)>,
}

impl ResultAggregator {
    /// Aggregator for `cases`, in declaration order.
    pub fn new(cases: &[TestCase]) -> Self {
        Self {
            started_at: Utc::now(),
            slots: cases.iter().map(|case| (case.id.clone(), None)).collect(),
        }
    }

    /// Record one terminal result.
    ///
    /// Cases sharing an id fill their slots in suite order.
    pub fn record(&mut self, result: TestResult) -> Result<(), ResultError> {
        if !result.status().is_terminal() {
            return Err(ResultError::NotTerminal(result.test_id().to_owned()));
        }
        let id = result.test_id();
        if !self.slots.iter().any(|(slot_id, _)| slot_id == id) {
            return Err(ResultError::UnknownTest(id.to_owned()));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|(slot_id, recorded)| slot_id == id && recorded.is_none())
            .ok_or_else(|| ResultError::DuplicateResult(id.to_owned()))?;
        slot.1 = Some(result);
        Ok(())
    }

    /// Whether a result for `test_id` was recorded.
    pub fn is_recorded(&self, test_id: &str) -> bool {
        self.slots
            .iter()
            .any(|(id, result)| id == test_id && result.is_some())
    }

    /// Freeze into a snapshot. Unrecorded cases become SKIPPED.
    pub fn finalize(self) -> SuiteRun {
        let results: Vec<TestResult> = self
            .slots
            .into_iter()
            .map(|(id, result)| result.unwrap_or_else(|| TestResult::skipped(&id, "not run")))
            .collect();
        SuiteRun {
            started_at: self.started_at,
            ended_at: Utc::now(),
            overall: Verdict::from_results(&results),
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::{Procedure, Threshold};

    fn case(id: &str) -> TestCase {
        TestCase::new(id, id, Procedure::Detection, Threshold::AtLeast { min: 1.0 })
    }

    fn finished(id: &str, status: TestStatus) -> TestResult {
        let mut result = TestResult::pending(id);
        result.start().expect("start failed");
        result.finish(status, "done").expect("finish failed");
        result
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut result = TestResult::pending("a");
        assert!(result.finish(TestStatus::Pass, "").is_err());
        result.start().expect("start failed");
        result.set_metric("fps", 8.0).expect("metric failed");
        result.finish(TestStatus::Pass, "ok").expect("finish failed");
        assert!(result.set_metric("fps", 1.0).is_err());
        assert!(result.finish(TestStatus::Fail, "").is_err());
        assert_eq!(result.status(), TestStatus::Pass);
        assert_eq!(result.metric("fps"), Some(8.0));
        assert!(result.started_at() <= result.ended_at());
    }

    #[test]
    fn test_skipped_is_terminal() {
        let mut result = TestResult::skipped("a", "missing capability");
        assert_eq!(result.status(), TestStatus::Skipped);
        assert!(result.start().is_err());
    }

    #[test]
    fn test_aggregator_order_and_verdict() {
        let cases = [case("a"), case("b"), case("c")];
        let mut aggregator = ResultAggregator::new(&cases);
        aggregator
            .record(finished("c", TestStatus::Pass))
            .expect("record failed");
        aggregator
            .record(finished("a", TestStatus::Pass))
            .expect("record failed");
        let run = aggregator.finalize();

        let ids: Vec<&str> = run.results().iter().map(TestResult::test_id).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(
            run.result("b").map(TestResult::status),
            Some(TestStatus::Skipped)
        );
        assert_eq!(run.overall(), Verdict::Pass);
        assert_eq!(run.summary().skipped, 1);
    }

    #[test]
    fn test_aggregator_rejects_misuse() {
        let cases = [case("a")];
        let mut aggregator = ResultAggregator::new(&cases);
        assert_eq!(
            aggregator.record(TestResult::pending("a")),
            Err(ResultError::NotTerminal("a".into()))
        );
        assert_eq!(
            aggregator.record(finished("z", TestStatus::Pass)),
            Err(ResultError::UnknownTest("z".into()))
        );
        aggregator
            .record(finished("a", TestStatus::Error))
            .expect("record failed");
        assert!(aggregator.is_recorded("a"));
        assert_eq!(
            aggregator.record(finished("a", TestStatus::Pass)),
            Err(ResultError::DuplicateResult("a".into()))
        );
        assert_eq!(aggregator.finalize().overall(), Verdict::Fail);
    }

    #[test]
    fn test_aggregator_fills_repeated_ids_in_order() {
        let cases = [case("a"), case("b"), case("a")];
        let mut aggregator = ResultAggregator::new(&cases);
        aggregator
            .record(finished("a", TestStatus::Pass))
            .expect("record failed");
        aggregator
            .record(finished("a", TestStatus::Fail))
            .expect("record failed");
        assert_eq!(
            aggregator.record(finished("a", TestStatus::Pass)),
            Err(ResultError::DuplicateResult("a".into()))
        );
        let run = aggregator.finalize();

        let statuses: Vec<TestStatus> = run.results().iter().map(TestResult::status).collect();
        assert_eq!(
            statuses,
            [TestStatus::Pass, TestStatus::Skipped, TestStatus::Fail]
        );
        assert_eq!(run.overall(), Verdict::Fail);
    }

    #[test]
    fn test_json_field_names() {
        let cases = [case("a")];
        let mut aggregator = ResultAggregator::new(&cases);
        aggregator
            .record(finished("a", TestStatus::Fail))
            .expect("record failed");
        let json = aggregator.finalize().to_json().expect("serialize failed");
        for field in ["\"testId\"", "\"startedAt\"", "\"endedAt\"", "\"FAIL\"", "\"overall\""] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }
}
