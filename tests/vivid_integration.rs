//! Integration tests using vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded (`modprobe vivid n_devs=2 vid_cap_pattern=20,1`)
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Expected vivid configuration:
//! - Device 1: Gray Ramp pattern (gradient)
//! - Device 2: 100% Colorbar pattern
//! - Format: 640x480 YUYV
//!
//! Tests will fail if vivid is not available or not configured correctly.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use usb_cam_qa::metrics::{brightness, mean_luma};
use usb_cam_qa::session::SessionManager;
use usb_cam_qa::timing::{frame_timing, FrameStamp};
use usb_cam_qa::{
    default_battery, CapturePort, DeviceId, Engine, EngineConfig, FourCC, Resolution, SystemProbe,
    TestStatus, V4L2Port,
};

const TIMEOUT: Duration = Duration::from_secs(2);

/// Find all available vivid virtual camera devices.
///
/// Uses sysfs to check the driver name before opening, avoiding
/// unnecessary opens on real cameras.
fn find_vivid_devices() -> Vec<DeviceId> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let port = V4L2Port::default();
    let mut devices = Vec::new();
    for index in 0..10u32 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };
        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        let id = DeviceId::from(index);
        if port.open(&id).is_ok() {
            devices.push(id);
        }
    }
    devices
}

/// Fail the test if vivid is not available; integration runs must not skip silently.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices().into_iter().next() {
            Some(id) => id,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: modprobe vivid n_devs=2 vid_cap_pattern=20,1\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

/// Returns (gradient device, colorbar device).
macro_rules! require_vivid_pair {
    () => {{
        let devices = find_vivid_devices();
        if devices.len() < 2 {
            panic!(
                "Two vivid devices required but found {}.\n\
                 Load vivid with: modprobe vivid n_devs=2 vid_cap_pattern=20,1",
                devices.len()
            );
        }
        (devices[0].clone(), devices[1].clone())
    }};
}

fn manager() -> SessionManager {
    SessionManager::new(Arc::new(V4L2Port::default()))
}

#[test]
#[serial]
fn test_vivid_descriptor() {
    let id = require_vivid!();
    let descriptor = manager().find(&id).expect("find failed");

    assert!(descriptor.driver.contains("vivid"), "Expected vivid driver");
    assert!(!descriptor.resolutions.is_empty());
    assert!(descriptor.formats.contains(&FourCC::YUYV));
    println!("{descriptor:#?}");
}

#[test]
#[serial]
fn test_vivid_second_session_is_busy() {
    let id = require_vivid!();
    let manager = manager();
    let descriptor = manager.find(&id).expect("find failed");

    let _session = manager.acquire(&descriptor).expect("acquire failed");
    assert!(manager.acquire(&descriptor).is_err());
}

#[test]
#[serial]
fn test_vivid_configure_and_capture() {
    let id = require_vivid!();
    let manager = manager();
    let descriptor = manager.find(&id).expect("find failed");
    let mut session = manager.acquire(&descriptor).expect("acquire failed");

    session
        .configure(Resolution::new(640, 480), FourCC::YUYV)
        .expect("configure failed");
    let frame = session.capture(TIMEOUT).expect("capture failed");

    assert_eq!(frame.byte_len(), 640 * 480 * 2);
    assert!(frame.pixel_at(320, 240).is_some());
}

#[test]
#[serial]
fn test_vivid_sequence_timing() {
    let id = require_vivid!();
    let manager = manager();
    let descriptor = manager.find(&id).expect("find failed");
    let mut session = manager.acquire(&descriptor).expect("acquire failed");
    session
        .configure(Resolution::new(640, 480), FourCC::YUYV)
        .expect("configure failed");

    let stamps: Vec<FrameStamp> = (0..20)
        .map(|_| {
            let frame = session.capture(TIMEOUT).expect("capture failed");
            FrameStamp::from(&frame)
        })
        .collect();
    let timing = frame_timing(&stamps).expect("timing failed");

    println!("{timing:?}");
    assert!(timing.fps > 1.0);
    assert_eq!(timing.dropped_frames, 0);
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let (gradient, _) = require_vivid_pair!();
    let manager = manager();
    let descriptor = manager.find(&gradient).expect("find failed");
    let mut session = manager.acquire(&descriptor).expect("acquire failed");
    session
        .configure(Resolution::new(640, 480), FourCC::YUYV)
        .expect("configure failed");
    let frame = session.capture(TIMEOUT).expect("capture failed");

    let plane = frame.luma();
    let row = plane.row(240).expect("row 240");
    let left: f32 = row.iter().take(64).sum();
    let right: f32 = row.iter().rev().take(64).sum();
    assert!(right > left, "gray ramp should brighten left to right");
    assert!((20.0..=235.0).contains(&mean_luma(&plane)));
}

#[test]
#[serial]
fn test_vivid_colorbar_pattern() {
    let (_, colorbar) = require_vivid_pair!();
    let manager = manager();
    let descriptor = manager.find(&colorbar).expect("find failed");
    let mut session = manager.acquire(&descriptor).expect("acquire failed");
    session
        .configure(Resolution::new(640, 480), FourCC::YUYV)
        .expect("configure failed");
    let frame = session.capture(TIMEOUT).expect("capture failed");

    let (r, g, b) = frame.pixel_at(20, 240).expect("first bar pixel");
    assert!(r > 200 && g > 200 && b > 200, "first bar should be white");
    let (r, g, b) = frame.pixel_at(620, 240).expect("last bar pixel");
    assert!(r < 50 && g < 50 && b < 50, "last bar should be black");
    assert!(brightness(&frame) > 50.0);
}

#[test]
#[serial]
fn test_vivid_engine_battery() {
    let id = require_vivid!();
    let mut config = EngineConfig::default();
    config.suite.frame_rate_frames = 30;
    let engine = Engine::new(Arc::new(V4L2Port::default()), Arc::new(SystemProbe), &config);

    let cases = default_battery(&config.suite)
        .into_iter()
        .filter(|case| ["camera_detection", "resolution", "frame_rate"].contains(&case.id.as_str()))
        .collect();
    let session = engine.connect(&id).expect("connect failed");
    let run = engine
        .run_suite(session, cases)
        .expect("run_suite failed")
        .wait()
        .expect("wait failed");

    println!("{}", run.to_json().expect("to_json failed"));
    let detection = run.result("camera_detection").expect("detection result");
    assert_eq!(detection.status(), TestStatus::Pass, "{}", detection.message());
    let frame_rate = run.result("frame_rate").expect("frame_rate result");
    assert!(frame_rate.metric("fps").is_some());
}
