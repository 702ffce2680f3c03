//! Suite-level behaviour against the synthetic capture port.

use std::sync::Arc;
use std::time::{Duration, Instant};

use usb_cam_qa::engine::RunEvent;
use usb_cam_qa::mock::{MockCamera, MockFault, MockPort, TestPattern};
use usb_cam_qa::testcase::{Procedure, SuiteConfig, Threshold};
use usb_cam_qa::{
    default_battery, Capability, CapabilitySet, DeviceId, Engine, EngineConfig, FourCC, Resolution,
    StaticProbe, SuiteRun, TestCase, TestStatus, Verdict,
};

fn engine_for(camera: MockCamera, capabilities: CapabilitySet) -> Engine {
    let mut config = EngineConfig::default();
    config.retry.backoff = Duration::from_millis(5);
    Engine::new(
        Arc::new(MockPort::new().with_camera(camera)),
        Arc::new(StaticProbe(capabilities)),
        &config,
    )
}

fn run_cases(camera: MockCamera, cases: Vec<TestCase>) -> SuiteRun {
    let id = camera.descriptor().id.clone();
    let engine = engine_for(camera, CapabilitySet::new());
    let session = engine.connect(&id).expect("connect failed");
    engine
        .run_suite(session, cases)
        .expect("run_suite failed")
        .wait()
        .expect("wait failed")
}

fn only(id: &str) -> Vec<TestCase> {
    default_battery(&SuiteConfig::default())
        .into_iter()
        .filter(|case| case.id == id)
        .collect()
}

fn statuses(run: &SuiteRun) -> Vec<TestStatus> {
    run.results().iter().map(|r| r.status()).collect()
}

#[test]
fn test_fixed_125ms_interval_measures_8_fps() {
    let camera = MockCamera::new("0").with_frame_interval(Duration::from_millis(125));
    let run = run_cases(camera, only("frame_rate"));
    let result = run.result("frame_rate").expect("frame_rate result");

    let fps = result.metric("fps").expect("fps metric");
    assert!((fps - 8.0).abs() <= 0.1, "fps {fps}");
    assert_eq!(result.status(), TestStatus::Pass, "{}", result.message());
}

#[test]
fn test_frame_rate_against_explicit_nominal() {
    let camera = MockCamera::new("0")
        .with_frame_interval(Duration::from_millis(125))
        .with_nominal_fps(None);
    let cases = vec![TestCase::new(
        "frame_rate",
        "Frame Rate",
        Procedure::FrameRate { frames: 20 },
        Threshold::RelativeToNominal {
            nominal: Some(30.0),
            tolerance: 0.10,
        },
    )];
    let run = run_cases(camera, cases);
    assert_eq!(statuses(&run), [TestStatus::Fail]);
}

#[test]
fn test_uniform_gray_has_zero_noise() {
    let camera = MockCamera::new("0").with_pattern(TestPattern::Solid(128, 128, 128));
    let run = run_cases(camera, only("noise"));
    let result = run.result("noise").expect("noise result");
    assert!(result.metric("noise").expect("noise metric") < 1e-6);
    assert_eq!(result.status(), TestStatus::Pass);
}

#[test]
fn test_exposure_ramp_converges() {
    let camera = MockCamera::new("0")
        .with_frame_interval(Duration::from_millis(125))
        .with_pattern(TestPattern::BrightnessRamp {
            from: 40,
            to: 130,
            over: Duration::from_secs(2),
        });
    let run = run_cases(camera, only("exposure"));
    let result = run.result("exposure").expect("exposure result");
    assert_eq!(result.status(), TestStatus::Pass, "{}", result.message());

    let brightness = result.metric("brightness").expect("brightness metric");
    assert!((80.0..=180.0).contains(&brightness));
    // The ramp enters the band at 1.0 s (frame 9); five in-band frames follow.
    assert_eq!(result.metric("frames_to_converge"), Some(13.0));
}

#[test]
fn test_exposure_that_never_settles_fails() {
    let camera = MockCamera::new("0").with_pattern(TestPattern::Solid(20, 128, 128));
    let run = run_cases(camera, only("exposure"));
    let result = run.result("exposure").expect("exposure result");
    assert_eq!(result.status(), TestStatus::Fail);
    assert!(result.message().contains("did not converge"));
}

#[test]
fn test_cancel_mid_run_errors_in_flight_case() {
    let camera = MockCamera::new("0").with_read_delay(Duration::from_millis(50));
    let engine = engine_for(camera, CapabilitySet::new());
    let session = engine.connect(&DeviceId::from("0")).expect("connect failed");
    let cases = vec![
        TestCase::new(
            "long",
            "Long capture",
            Procedure::FrameRate { frames: 500 },
            Threshold::AtLeast { min: 1.0 },
        ),
        TestCase::new(
            "next",
            "Next",
            Procedure::Detection,
            Threshold::AtLeast { min: 1.0 },
        ),
        TestCase::new(
            "last",
            "Last",
            Procedure::Detection,
            Threshold::AtLeast { min: 1.0 },
        ),
    ];
    let mut handle = engine.run_suite(session, cases).expect("run_suite failed");
    let mut events = handle.events().expect("events failed");

    while let Some(event) = events.blocking_recv() {
        if let RunEvent::Progress(progress) = event {
            if progress.test_id == "long" && progress.status == TestStatus::Running {
                break;
            }
        }
    }
    let cancelled_at = Instant::now();
    engine.cancel(&handle);
    let run = handle.wait().expect("wait failed");

    assert!(cancelled_at.elapsed() < EngineConfig::default().capture.timeout);
    assert_eq!(
        statuses(&run),
        [TestStatus::Error, TestStatus::Skipped, TestStatus::Skipped]
    );
    assert_eq!(run.results()[0].message(), "cancelled");
    assert_eq!(run.overall(), Verdict::Fail);
}

#[test]
fn test_replay_is_deterministic() {
    let camera = || {
        MockCamera::new("0")
            .with_frame_interval(Duration::from_millis(40))
            .with_pattern(TestPattern::Checkerboard {
                cell: 8,
                contrast: 120,
            })
    };
    let battery = default_battery(&SuiteConfig::default());
    let first = run_cases(camera(), battery.clone());
    let second = run_cases(camera(), battery);

    assert_eq!(statuses(&first), statuses(&second));
    for (a, b) in first.results().iter().zip(second.results()) {
        assert_eq!(a.test_id(), b.test_id());
        assert_eq!(
            a.metrics().keys().collect::<Vec<_>>(),
            b.metrics().keys().collect::<Vec<_>>()
        );
        for (name, value) in a.metrics() {
            let other = b.metric(name).expect("metric missing on replay");
            assert!((value - other).abs() < 1e-9, "{name}: {value} vs {other}");
        }
    }
}

#[test]
fn test_disconnect_mid_suite_errors_once_and_skips_rest() {
    // Reads 0..=2 serve detection and resolution; frame_rate starts at read 3.
    let camera = MockCamera::new("0").with_fault(10, MockFault::Disconnect);
    let run = run_cases(camera, default_battery(&SuiteConfig::default()));

    let statuses = statuses(&run);
    let errors: Vec<usize> = statuses
        .iter()
        .enumerate()
        .filter(|(_, status)| **status == TestStatus::Error)
        .map(|(index, _)| index)
        .collect();
    assert_eq!(errors, [2], "{statuses:?}");
    assert!(statuses[3..].iter().all(|s| *s == TestStatus::Skipped));
    assert_eq!(run.overall(), Verdict::Fail);
    assert!(run.results()[2].metric("capture_retries").is_none());
}

#[test]
fn test_corrupt_frames_never_reach_metrics() {
    let camera = (0..3).fold(MockCamera::new("0"), |camera, index| {
        camera.with_fault(index, MockFault::Corrupt)
    });
    let run = run_cases(camera, only("sharpness"));
    let result = run.result("sharpness").expect("sharpness result");
    assert_eq!(result.status(), TestStatus::Error);
    assert!(result.message().contains("corrupt"));
    assert!(result.metric("sharpness").is_none());
}

#[test]
fn test_missing_capability_is_skipped_not_failed() {
    let camera = MockCamera::new("0");
    let id = camera.descriptor().id.clone();
    let engine = engine_for(camera, [Capability::Linux].into_iter().collect());
    let session = engine.connect(&id).expect("connect failed");
    let run = engine
        .run_suite(session, only("autofocus"))
        .expect("run_suite failed")
        .wait()
        .expect("wait failed");
    assert_eq!(statuses(&run), [TestStatus::Skipped]);
    assert_eq!(run.overall(), Verdict::Pass);
}

#[test]
fn test_autofocus_converges_on_scripted_lens() {
    let camera = MockCamera::new("0").with_focus_script(vec![10, 40, 90, 140, 160, 160, 160, 160]);
    let id = camera.descriptor().id.clone();
    let engine = engine_for(
        camera,
        [Capability::ControlChannel, Capability::Autofocus]
            .into_iter()
            .collect(),
    );
    let session = engine.connect(&id).expect("connect failed");
    let run = engine
        .run_suite(session, only("autofocus"))
        .expect("run_suite failed")
        .wait()
        .expect("wait failed");
    let result = run.result("autofocus").expect("autofocus result");
    assert_eq!(result.status(), TestStatus::Pass, "{}", result.message());
    assert_eq!(result.metric("reversals"), Some(0.0));
}

#[test]
fn test_resolution_sweep_counts_supported_modes() {
    let camera = MockCamera::new("0").with_format(usb_cam_qa::Format::new(640, 480, FourCC::YUYV));
    let run = run_cases(camera, only("resolution"));
    let result = run.result("resolution").expect("resolution result");
    assert_eq!(result.status(), TestStatus::Pass);
    assert_eq!(result.metric("supported_count"), Some(2.0));
    assert_eq!(
        result.metric(&format!("supported_{}", Resolution::new(1920, 1080))),
        Some(0.0)
    );
}

#[test]
fn test_focus_sweep_gated_on_manual_focus() {
    let camera = MockCamera::new("0").with_focus_lens(128);
    let id = camera.descriptor().id.clone();
    let capabilities: CapabilitySet = [Capability::ControlChannel, Capability::ManualFocus]
        .into_iter()
        .collect();
    let engine = engine_for(camera.clone(), capabilities);
    let session = engine.connect(&id).expect("connect failed");
    let run = engine
        .run_suite(session, only("focus_sweep"))
        .expect("run_suite failed")
        .wait()
        .expect("wait failed");
    let result = run.result("focus_sweep").expect("focus_sweep result");
    assert_eq!(result.status(), TestStatus::Pass, "{}", result.message());
    assert_eq!(result.metric("peak_position"), Some(128.0));

    let run = run_cases(camera, only("focus_sweep"));
    let result = run.result("focus_sweep").expect("focus_sweep result");
    assert_eq!(result.status(), TestStatus::Skipped);
    assert!(result.message().contains("requires"));
}
