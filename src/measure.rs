//! Measurement procedures.
//!
//! Each [`Procedure`] variant has one body here. Bodies pull frames through a
//! [`CaptureContext`], which owns the bounded retry, the cancellation checks
//! and the test case deadline, so no body carries its own retry loop or sleep.
//! A body returns a [`Measurement`]; applying the threshold is left to the
//! orchestrator.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::capability::{Capability, CapabilitySet};
use crate::convergence::{ExposureState, ExposureTracker, FocusCriteria, FocusState, FocusTracker};
use crate::error::{MeasureError, SessionError};
use crate::frame::FrameSample;
use crate::metrics::{self, Region};
use crate::orchestrator::{CancelToken, RetryPolicy};
use crate::session::Session;
use crate::testcase::{CaptureTarget, Procedure, TestCase, Threshold};
use crate::timing::{self, FrameStamp, FrameTiming};
use crate::traits::{Control, FourCC, Resolution};

const PAUSE_SLICE: Duration = Duration::from_millis(10);

/// Frame source for one test case: a session plus the retry, cancellation
/// and deadline rules of the running suite.
pub struct CaptureContext<'a> {
    session: &'a mut Session,
    retry: &'a RetryPolicy,
    capture_timeout: Duration,
    timeout: Duration,
    deadline: Option<Instant>,
    cancel: &'a CancelToken,
    capabilities: &'a CapabilitySet,
    report: &'a dyn Fn(&str, f64),
    retries: u32,
}

impl<'a> CaptureContext<'a> {
    /// Bind a context to `session` for at most `timeout` from now.
    ///
    /// A timeout too large to represent as an instant runs without a deadline.
    pub fn new(
        session: &'a mut Session,
        retry: &'a RetryPolicy,
        capture_timeout: Duration,
        timeout: Duration,
        cancel: &'a CancelToken,
        capabilities: &'a CapabilitySet,
        report: &'a dyn Fn(&str, f64),
    ) -> Self {
        Self {
            session,
            retry,
            capture_timeout,
            timeout,
            deadline: Instant::now().checked_add(timeout),
            cancel,
            capabilities,
            report,
            retries: 0,
        }
    }

    /// Retries spent so far.
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// The bound session.
    pub fn session(&mut self) -> &mut Session {
        &mut *self.session
    }

    /// Capabilities of the device under test.
    pub const fn capabilities(&self) -> &CapabilitySet {
        self.capabilities
    }

    /// Publish a partial metric.
    pub fn report(&self, name: &str, value: f64) {
        (self.report)(name, value);
    }

    /// Fail fast on cancellation or an expired deadline.
    pub fn check(&self) -> Result<(), MeasureError> {
        if self.cancel.is_cancelled() {
            return Err(MeasureError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(MeasureError::TimedOut(self.timeout));
        }
        Ok(())
    }

    fn remaining(&self) -> Duration {
        self.deadline
            .map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn pause(&self, delay: Duration) -> Result<(), MeasureError> {
        let until = Instant::now().checked_add(delay);
        loop {
            self.check()?;
            let left = until.map_or(Duration::MAX, |until| {
                until.saturating_duration_since(Instant::now())
            });
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(left.min(PAUSE_SLICE).min(self.remaining()));
        }
    }

    /// Capture the next frame.
    ///
    /// Timeouts and corrupt frames are retried up to the policy bound with
    /// backoff. Each call waits at most the capture timeout, clipped to the
    /// time left before the deadline.
    pub fn next_frame(&mut self) -> Result<FrameSample, MeasureError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            self.check()?;
            let timeout = self.capture_timeout.min(self.remaining());
            let err = match self.session.capture(timeout) {
                Ok(frame) => return Ok(frame),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err.into());
            }
            self.check()?;
            if attempt >= attempts {
                return Err(err.into());
            }
            warn!(error = %err, attempt, attempts, "transient capture fault, retrying");
            self.retries += 1;
            self.pause(self.retry.delay_for(attempt))?;
            attempt += 1;
        }
    }

    /// Capture `count` frames and keep only their stamps and the last frame.
    fn capture_sequence(
        &mut self,
        count: u32,
    ) -> Result<(Vec<FrameStamp>, Option<FrameSample>), MeasureError> {
        let mut stamps = Vec::with_capacity(count as usize);
        let mut last = None;
        for index in 1..=count {
            let frame = self.next_frame()?;
            stamps.push(FrameStamp::from(&frame));
            last = Some(frame);
            if index % 10 == 0 {
                self.report("frames_captured", f64::from(index));
            }
        }
        Ok((stamps, last))
    }

    /// Write one control value.
    pub fn set_control(&mut self, control: Control, value: i64) -> Result<(), MeasureError> {
        self.check()?;
        self.session
            .set_control(control, value)
            .map_err(MeasureError::from)
    }

    /// Run one autofocus step.
    pub fn trigger_autofocus(&mut self) -> Result<(), MeasureError> {
        self.set_control(Control::AutofocusTrigger, 1)
    }

    fn supports(&self, control: Control) -> bool {
        self.session.descriptor().supports(control)
    }

    /// Put the device back the way a procedure found it. Losing the device
    /// is fatal; any other refusal only leaves it misconfigured.
    fn restore<F>(&mut self, what: &str, apply: F) -> Result<(), MeasureError>
    where
        F: FnOnce(&mut Session) -> Result<(), SessionError>,
    {
        match apply(self.session()) {
            Ok(()) => Ok(()),
            Err(err) if err.is_disconnect() => Err(err.into()),
            Err(err) => {
                warn!(error = %err, what, "could not restore device state");
                Ok(())
            }
        }
    }
}

/// Metrics of one completed procedure, plus an optional measured failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    metrics: BTreeMap<String, f64>,
    rejection: Option<String>,
}

impl Measurement {
    /// Empty measurement.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a metric. Non-finite values are dropped.
    pub fn set(&mut self, name: &str, value: f64) -> &mut Self {
        if value.is_finite() {
            self.metrics.insert(name.to_owned(), value);
        } else {
            warn!(metric = name, value, "dropping non-finite metric");
        }
        self
    }

    /// Mark the measurement as failed regardless of its threshold.
    pub fn reject(&mut self, reason: String) -> &mut Self {
        self.rejection = Some(reason);
        self
    }

    /// Recorded metrics.
    pub const fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// One metric by name.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Failure reason, if the hardware was measured and found wanting.
    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }
}

/// Configure the case's capture target, then run its procedure.
pub fn run_procedure(
    case: &TestCase,
    ctx: &mut CaptureContext<'_>,
) -> Result<Measurement, MeasureError> {
    if let Some(target) = case.target {
        if let Some(rejected) = configure(ctx, target)? {
            return Ok(rejected);
        }
    }

    match &case.procedure {
        Procedure::Detection => detection(ctx),
        Procedure::Resolution { candidates } => resolutions(ctx, candidates),
        Procedure::FrameRate { frames } => frame_rate(ctx, *frames),
        Procedure::Exposure {
            max_frames,
            required_consecutive,
        } => exposure(ctx, &case.threshold, *max_frames, *required_consecutive),
        Procedure::Focus {
            criteria,
            max_steps,
        } => focus(ctx, *criteria, *max_steps),
        Procedure::FocusSweep {
            positions,
            settle_frames,
        } => focus_sweep(ctx, positions, *settle_frames),
        Procedure::Sharpness { frames } => sharpness(ctx, *frames),
        Procedure::Noise {
            region,
            patch_size,
            frames,
        } => noise(ctx, region, *patch_size, *frames),
        Procedure::ColorBalance { frames } => color_balance(ctx, *frames),
        Procedure::Interface { frames } => interface(ctx, *frames),
    }
}

/// Negotiate `target`. A refused geometry or format is a measured failure.
fn configure(
    ctx: &mut CaptureContext<'_>,
    target: CaptureTarget,
) -> Result<Option<Measurement>, MeasureError> {
    ctx.check()?;
    match ctx.session().configure(target.resolution, target.fourcc) {
        Ok(_) => Ok(None),
        Err(err @ (SessionError::UnsupportedResolution { .. } | SessionError::UnsupportedFormat(_))) => {
            let mut measurement = Measurement::new();
            measurement.reject(err.to_string());
            Ok(Some(measurement))
        }
        Err(err) => Err(err.into()),
    }
}

fn frame_geometry(measurement: &mut Measurement, frame: &FrameSample) {
    #[allow(clippy::cast_precision_loss)]
    let bytes = frame.byte_len() as f64;
    measurement
        .set("width", f64::from(frame.width()))
        .set("height", f64::from(frame.height()))
        .set("bytes_per_frame", bytes);
}

fn detection(ctx: &mut CaptureContext<'_>) -> Result<Measurement, MeasureError> {
    let frame = ctx.next_frame()?;
    let mut measurement = Measurement::new();
    measurement.set("frames_received", 1.0);
    frame_geometry(&mut measurement, &frame);
    Ok(measurement)
}

fn resolutions(
    ctx: &mut CaptureContext<'_>,
    candidates: &[Resolution],
) -> Result<Measurement, MeasureError> {
    let original = ctx.session().format().clone();
    let outcome = sweep_resolutions(ctx, candidates, original.fourcc);
    ctx.restore("original format", |session| {
        session
            .configure(original.resolution(), original.fourcc)
            .map(|_| ())
    })?;
    outcome
}

fn sweep_resolutions(
    ctx: &mut CaptureContext<'_>,
    candidates: &[Resolution],
    fourcc: FourCC,
) -> Result<Measurement, MeasureError> {
    let mut measurement = Measurement::new();
    let mut supported = 0_u32;

    for &candidate in candidates {
        ctx.check()?;
        let ok = match ctx.session().configure(candidate, fourcc) {
            Ok(_) => ctx.next_frame()?.resolution() == candidate,
            Err(SessionError::UnsupportedResolution { negotiated, .. }) => {
                debug!(%candidate, %negotiated, "resolution not supported");
                false
            }
            Err(SessionError::UnsupportedFormat(fourcc)) => {
                debug!(%candidate, %fourcc, "format not measurable at this resolution");
                false
            }
            Err(err) => return Err(err.into()),
        };
        supported += u32::from(ok);
        measurement.set(&format!("supported_{candidate}"), f64::from(u8::from(ok)));
        ctx.report("supported_count", f64::from(supported));
    }
    measurement.set("supported_count", f64::from(supported));
    Ok(measurement)
}

fn timing_metrics(measurement: &mut Measurement, timing: &FrameTiming) {
    #[allow(clippy::cast_precision_loss)]
    let (frames, dropped) = (timing.frame_count as f64, timing.dropped_frames as f64);
    measurement
        .set("fps", timing.fps)
        .set("frame_count", frames)
        .set("elapsed_ms", timing.elapsed.as_secs_f64() * 1000.0)
        .set("mean_interval_ms", timing.mean_interval_ms)
        .set("jitter_ms", timing.jitter_ms)
        .set("p50_interval_ms", timing.p50_ms)
        .set("p95_interval_ms", timing.p95_ms)
        .set("p99_interval_ms", timing.p99_ms)
        .set("dropped_frames", dropped);
}

fn timed_sequence(
    ctx: &mut CaptureContext<'_>,
    frames: u32,
) -> Result<(FrameTiming, Option<FrameSample>), MeasureError> {
    let (stamps, last) = ctx.capture_sequence(frames.max(2))?;
    let timing = timing::frame_timing(&stamps).ok_or_else(|| {
        MeasureError::Unmeasurable("frame timestamps did not advance".to_owned())
    })?;
    Ok((timing, last))
}

fn frame_rate(ctx: &mut CaptureContext<'_>, frames: u32) -> Result<Measurement, MeasureError> {
    let (timing, _) = timed_sequence(ctx, frames)?;
    let mut measurement = Measurement::new();
    timing_metrics(&mut measurement, &timing);
    if let Some(nominal) = ctx.session().descriptor().nominal_fps {
        measurement.set("nominal_fps", nominal);
    }
    Ok(measurement)
}

fn exposure(
    ctx: &mut CaptureContext<'_>,
    threshold: &Threshold,
    max_frames: u32,
    required: u32,
) -> Result<Measurement, MeasureError> {
    let (min, max) = match *threshold {
        Threshold::Within { min, max } => (min, max),
        Threshold::AtLeast { min } => (min, f64::INFINITY),
        Threshold::AtMost { max } => (f64::NEG_INFINITY, max),
        Threshold::RelativeToNominal { .. } => {
            return Err(MeasureError::Unmeasurable(
                "exposure needs an absolute brightness band".to_owned(),
            ));
        }
    };
    let mut tracker = ExposureTracker::new(min, max, required);
    let mut measurement = Measurement::new();
    let mut last = 0.0;

    // With a usable control channel, start from a manual exposure so the
    // auto-exposure loop has something to correct.
    let drive = ctx.capabilities().contains(Capability::ExposureControl)
        && ctx.supports(Control::AutoExposure);
    let manual = drive.then(|| manual_brightness(ctx)).transpose()?;
    if let Some(manual) = manual {
        measurement.set("manual_brightness", manual);
    }

    while tracker.samples() < max_frames {
        let frame = ctx.next_frame()?;
        last = metrics::brightness(&frame);
        ctx.report("brightness", last);
        if tracker.push(last) == ExposureState::Converged {
            break;
        }
    }

    measurement
        .set("brightness", last)
        .set("frames_observed", f64::from(tracker.samples()))
        .set("auto_exposure", f64::from(u8::from(drive)));
    if let Some(manual) = manual {
        measurement.set("exposure_response", (last - manual).abs());
    }
    match tracker.converged_at() {
        Some(at) => {
            measurement.set("frames_to_converge", f64::from(at));
        }
        None => {
            measurement.reject(format!(
                "exposure did not converge within {max_frames} frames (last brightness {last:.1})"
            ));
        }
    }
    Ok(measurement)
}

/// Brightness of one frame under manual exposure, then hand exposure back
/// to the camera.
fn manual_brightness(ctx: &mut CaptureContext<'_>) -> Result<f64, MeasureError> {
    ctx.set_control(Control::AutoExposure, 0)?;
    let brightness = metrics::brightness(&ctx.next_frame()?);
    ctx.set_control(Control::AutoExposure, 1)?;
    Ok(brightness)
}

fn focus(
    ctx: &mut CaptureContext<'_>,
    criteria: FocusCriteria,
    max_steps: u32,
) -> Result<Measurement, MeasureError> {
    let mut tracker = FocusTracker::new(criteria);
    let mut state = FocusState::Tracking;

    while state == FocusState::Tracking && tracker.samples() < max_steps {
        ctx.trigger_autofocus()?;
        let frame = ctx.next_frame()?;
        let score = metrics::sharpness(&frame);
        ctx.report("sharpness", score);
        state = tracker.push(score);
    }

    let mut measurement = Measurement::new();
    measurement
        .set("sharpness", tracker.last().unwrap_or_default())
        .set("peak_sharpness", tracker.peak())
        .set("focus_steps", f64::from(tracker.samples()))
        .set("reversals", f64::from(tracker.reversals()));
    match state {
        FocusState::Converged => {}
        FocusState::Hunting => {
            measurement.reject(format!(
                "autofocus hunting: {} direction reversals",
                tracker.reversals()
            ));
        }
        FocusState::Tracking => {
            measurement.reject(format!("autofocus did not converge within {max_steps} steps"));
        }
    }
    Ok(measurement)
}

fn focus_sweep(
    ctx: &mut CaptureContext<'_>,
    positions: &[i64],
    settle_frames: u32,
) -> Result<Measurement, MeasureError> {
    if positions.is_empty() {
        return Err(MeasureError::Unmeasurable(
            "focus sweep has no lens positions".to_owned(),
        ));
    }
    let autofocus = ctx.supports(Control::ContinuousAutofocus);
    if autofocus {
        ctx.set_control(Control::ContinuousAutofocus, 0)?;
    }
    let outcome = sweep_focus(ctx, positions, settle_frames);
    if autofocus {
        ctx.restore("continuous autofocus", |session| {
            session.set_control(Control::ContinuousAutofocus, 1)
        })?;
    }
    outcome
}

fn sweep_focus(
    ctx: &mut CaptureContext<'_>,
    positions: &[i64],
    settle_frames: u32,
) -> Result<Measurement, MeasureError> {
    let mut measurement = Measurement::new();
    let mut scores = metrics::RunningStats::default();
    let mut peak_position = None;

    for &position in positions {
        ctx.set_control(Control::FocusAbsolute, position)?;
        let mut last = None;
        for _ in 0..settle_frames.max(1) {
            last = Some(ctx.next_frame()?);
        }
        let score = last.as_ref().map_or(0.0, metrics::sharpness);
        ctx.report("sharpness", score);
        measurement.set(&format!("sharpness_at_{position}"), score);
        if score > scores.max() || peak_position.is_none() {
            peak_position = Some(position);
        }
        scores.push(score);
    }

    let (peak, min) = (scores.max(), scores.min());
    let response = if peak > 0.0 { (peak - min) / peak } else { 0.0 };
    #[allow(clippy::cast_precision_loss)]
    let (peak_at, count) = (
        peak_position.unwrap_or_default() as f64,
        positions.len() as f64,
    );
    measurement
        .set("peak_sharpness", peak)
        .set("min_sharpness", min)
        .set("peak_position", peak_at)
        .set("positions", count)
        .set("focus_response", response);
    Ok(measurement)
}

fn sharpness(ctx: &mut CaptureContext<'_>, frames: u32) -> Result<Measurement, MeasureError> {
    let mut scores = metrics::RunningStats::default();
    let mut last = None;
    for _ in 0..frames.max(1) {
        let frame = ctx.next_frame()?;
        scores.push(metrics::sharpness(&frame));
        last = Some(frame);
    }

    let mut measurement = Measurement::new();
    measurement.set("sharpness", scores.mean());
    if let Some(frame) = last {
        let stats = metrics::image_stats(&frame.luma());
        measurement
            .set("brightness", stats.brightness)
            .set("contrast", stats.contrast)
            .set("dynamic_range", stats.dynamic_range)
            .set("snr_db", stats.snr_db);
    }
    Ok(measurement)
}

fn noise(
    ctx: &mut CaptureContext<'_>,
    region: &Region,
    patch_size: u32,
    frames: u32,
) -> Result<Measurement, MeasureError> {
    let mut scores = metrics::RunningStats::default();
    for _ in 0..frames.max(1) {
        let frame = ctx.next_frame()?;
        let score = metrics::noise(&frame, region, patch_size as usize).ok_or_else(|| {
            MeasureError::Unmeasurable(format!(
                "noise region holds no complete {patch_size}x{patch_size} patch"
            ))
        })?;
        scores.push(score);
    }

    let mut measurement = Measurement::new();
    measurement
        .set("noise", scores.mean())
        .set("noise_max_frame", scores.max());
    Ok(measurement)
}

fn color_balance(ctx: &mut CaptureContext<'_>, frames: u32) -> Result<Measurement, MeasureError> {
    let (mut red, mut green, mut blue) = (
        metrics::RunningStats::default(),
        metrics::RunningStats::default(),
        metrics::RunningStats::default(),
    );
    for _ in 0..frames.max(1) {
        let frame = ctx.next_frame()?;
        let means = metrics::channel_means(&frame);
        red.push(means.red);
        green.push(means.green);
        blue.push(means.blue);
    }

    let means = metrics::ChannelMeans {
        red: red.mean(),
        green: green.mean(),
        blue: blue.mean(),
    };
    let mut measurement = Measurement::new();
    measurement
        .set("red_mean", means.red)
        .set("green_mean", means.green)
        .set("blue_mean", means.blue)
        .set("color_balance", means.balance_score());
    Ok(measurement)
}

fn interface(ctx: &mut CaptureContext<'_>, frames: u32) -> Result<Measurement, MeasureError> {
    let (timing, last) = timed_sequence(ctx, frames)?;
    #[allow(clippy::cast_precision_loss)]
    let dropped = timing.dropped_frames as f64;
    let mut measurement = Measurement::new();
    measurement
        .set("fps", timing.fps)
        .set("frame_count", f64::from(frames.max(2)))
        .set("dropped_frames", dropped);
    if let Some(frame) = last {
        frame_geometry(&mut measurement, &frame);
        measurement.set(
            "throughput_mbps",
            timing::throughput(frame.byte_len(), timing.fps) * 8.0 / 1_000_000.0,
        );
    }
    Ok(measurement)
}
