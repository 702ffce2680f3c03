//! Headless qualification runner.
//!
//! ```bash
//! usb-cam-qa list
//! usb-cam-qa run --device 0 --output report.json
//! usb-cam-qa run --device 0 --only frame_rate --only sharpness
//! usb-cam-qa run --mock --device mock0
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use usb_cam_qa::mock::{MockCamera, MockPort};
use usb_cam_qa::{
    default_battery, logging, CapturePort, DeviceId, Engine, EngineConfig, SuiteRun, SystemProbe,
    TestStatus, V4L2Port, Verdict,
};

#[derive(Parser)]
#[command(name = "usb-cam-qa")]
#[command(about = "USB camera hardware qualification", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List capture devices
    List {
        /// Use the synthetic capture port
        #[arg(long)]
        mock: bool,
    },

    /// Run the test battery against one device
    Run {
        /// Device id (`0` for /dev/video0)
        #[arg(long, default_value = "0")]
        device: String,

        /// Write the suite run JSON here
        #[arg(long)]
        output: Option<PathBuf>,

        /// Run only these test ids (repeatable)
        #[arg(long)]
        only: Vec<String>,

        /// Use the synthetic capture port
        #[arg(long)]
        mock: bool,
    },
}

fn port(mock: bool, device: &str, config: &EngineConfig) -> Arc<dyn CapturePort> {
    if mock {
        let camera = MockCamera::new(device)
            .with_frame_interval(Duration::from_millis(33))
            .with_focus_script(vec![10, 40, 90, 140, 160, 160, 160, 160]);
        Arc::new(MockPort::new().with_camera(camera))
    } else {
        Arc::new(V4L2Port::new(config.capture.buffer_count))
    }
}

fn list(engine: &Engine) -> Result<()> {
    let devices = engine.devices().context("failed to enumerate devices")?;
    if devices.is_empty() {
        println!("no capture devices found");
    }
    for device in devices {
        let usb = match (device.vendor_id, device.product_id) {
            (Some(vendor), Some(product)) => format!(" [{vendor:04x}:{product:04x}]"),
            _ => String::new(),
        };
        println!("{}: {} ({}){usb}", device.id, device.name, device.driver);
        let resolutions: Vec<String> = device.resolutions.iter().map(ToString::to_string).collect();
        println!("    resolutions: {}", resolutions.join(", "));
        if let Some(fps) = device.nominal_fps {
            println!("    nominal fps: {fps:.2}");
        }
    }
    Ok(())
}

fn print_summary(run: &SuiteRun) {
    for result in run.results() {
        println!("{:<8} {:<16} {}", result.status(), result.test_id(), result.message());
    }
    let summary = run.summary();
    let attempted = summary.total - summary.skipped;
    #[allow(clippy::cast_precision_loss)]
    let rate = if attempted == 0 {
        0.0
    } else {
        summary.passed as f64 * 100.0 / attempted as f64
    };
    println!();
    println!(
        "total {}  passed {}  failed {}  errors {}  skipped {}  success rate {rate:.1}%",
        summary.total, summary.passed, summary.failed, summary.errors, summary.skipped
    );
    println!("overall: {}", run.overall());
}

fn run(
    engine: &Engine,
    config: &EngineConfig,
    device: &str,
    only: &[String],
    output: Option<PathBuf>,
) -> Result<Verdict> {
    let mut cases = default_battery(&config.suite);
    if !only.is_empty() {
        if let Some(unknown) = only.iter().find(|id| !cases.iter().any(|c| &c.id == *id)) {
            bail!("unknown test id {unknown}");
        }
        cases.retain(|case| only.contains(&case.id));
    }

    let session = engine
        .connect(&DeviceId::from(device))
        .with_context(|| format!("failed to connect to device {device}"))?;
    info!(device, cases = cases.len(), "running suite");

    let mut handle = engine.run_suite(session, cases)?;
    handle.subscribe(
        |event| {
            if event.status != TestStatus::Running {
                eprintln!("{} {}", event.test_id, event.status);
            }
        },
        |_| {},
    )?;
    let run = handle.wait()?;

    print_summary(&run);
    if let Some(path) = output {
        std::fs::write(&path, run.to_json()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("report written to {}", path.display());
    }
    Ok(run.overall())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    logging::init(&config.logging)?;

    let (mock, device) = match &cli.command {
        Commands::List { mock } => (*mock, "mock0"),
        Commands::Run { mock, device, .. } => (*mock, device.as_str()),
    };
    let engine = Engine::new(port(mock, device, &config), Arc::new(SystemProbe), &config);

    match cli.command {
        Commands::List { .. } => list(&engine),
        Commands::Run {
            device,
            output,
            only,
            ..
        } => {
            if run(&engine, &config, &device, &only, output)? == Verdict::Fail {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
