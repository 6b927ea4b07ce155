//! `basler_daq` command line tool
//!
//! Lists Basler cameras, grabs averaged snapshots to Arrow IPC files and
//! streams frames through the viewer actor.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use kameo::Actor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use basler_daq::actors::{
    BaslerViewer, GetSettings, GrabData, IniDetector, SetSetting, Stop, Subscribe,
};
use basler_daq::config::{AppConfig, ApplicationConfig, DEFAULT_CONFIG_PATH};
use basler_daq::export::{snapshot_path, write_frames};
use basler_daq::hardware::{default_adapter, BaslerCamera, PylonAdapter};
use basler_daq::traits::{CameraSensor, FrameAccumulator, Roi};
use basler_daq::viewer::ViewerEvent;

/// Basler camera viewer and acquisition tool.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated cameras even when built with Pylon support
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List connected cameras
    List,
    /// Print information about the configured camera
    Info,
    /// Grab one frame, averaged over several acquisitions
    Snap {
        /// Frames to average (defaults to `camera.naverage`)
        #[arg(long)]
        average: Option<u32>,
        /// Arrow IPC file to write
        #[arg(long)]
        output: Option<PathBuf>,
        /// Write to a timestamped file in `export.output_dir`
        #[arg(long, conflicts_with = "output")]
        save: bool,
    },
    /// Stream frames through the viewer and report the frame rate
    Live {
        /// Number of frames to receive
        #[arg(long, default_value_t = 100)]
        frames: u32,
    },
    /// Show the effective configuration
    Config {
        /// Print it as TOML
        #[arg(long)]
        dump: bool,
    },
}

fn init_tracing(app: &ApplicationConfig) {
    // RUST_LOG wins over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&app.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if app.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    init_tracing(&config.application);
    info!("Starting {}", config.application.name);

    let mock = cli.mock || !cfg!(feature = "pylon_hardware");
    let adapter = default_adapter(mock)?;

    match cli.command {
        Command::List => list(adapter.as_ref()),
        Command::Info => info_cmd(adapter, &config),
        Command::Snap {
            average,
            output,
            save,
        } => {
            let output = if save {
                Some(snapshot_path(&config.export.output_dir, chrono::Utc::now()))
            } else {
                output
            };
            snap(
                adapter,
                &config,
                average.unwrap_or(config.camera.naverage),
                output,
            )
        }
        Command::Live { frames } => live(adapter, &config, frames).await,
        Command::Config { dump } => {
            if dump {
                print!("{}", config.to_toml()?);
            } else {
                println!("{config:#?}");
            }
            Ok(())
        }
    }
}

fn list(adapter: &dyn PylonAdapter) -> Result<()> {
    let devices = BaslerCamera::list_cameras(adapter)?;
    if devices.is_empty() {
        println!("No cameras found");
    }
    for device in devices {
        println!("{}\t{}", device.friendly_name, device.full_name);
    }
    Ok(())
}

/// Open the configured camera, or the first one found.
fn open_camera(adapter: Arc<dyn PylonAdapter>, config: &AppConfig) -> Result<BaslerCamera> {
    let name = match &config.camera.friendly_name {
        Some(name) => name.clone(),
        None => BaslerCamera::list_cameras(adapter.as_ref())?
            .into_iter()
            .next()
            .map(|d| d.friendly_name)
            .context("No camera found")?,
    };
    let mut camera = BaslerCamera::open_by_friendly_name(adapter, &name)?
        .with_grab_timeout(Duration::from_millis(config.camera.grab_timeout_ms));
    camera.set_exposure(config.camera.exposure_ms / 1000.0)?;
    let binning = config.camera.binning;
    if binning != 1 {
        let roi = camera.get_roi()?;
        camera.set_roi(Roi {
            hbin: binning,
            vbin: binning,
            ..roi
        })?;
    }
    Ok(camera)
}

fn info_cmd(adapter: Arc<dyn PylonAdapter>, config: &AppConfig) -> Result<()> {
    let mut camera = open_camera(adapter, config)?;
    let info = camera.get_device_info()?;
    let (width, height) = camera.get_detector_size()?;

    println!("Camera:        {}", info.friendly_name);
    println!("Model:         {}", info.model_name);
    println!("Serial:        {}", info.serial_number);
    println!("Device class:  {}", info.device_class);
    println!("Detector:      {width} x {height}");
    println!("ROI:           {}", camera.get_roi()?);
    println!("Exposure:      {:.3} ms", camera.get_exposure()? * 1000.0);
    match camera.gain() {
        Ok(gain) if camera.raw_gain() => println!("Gain:          {gain} (raw)"),
        Ok(gain) => println!("Gain:          {gain:.2} dB"),
        Err(e) => println!("Gain:          unavailable ({e})"),
    }
    match camera.auto_exposure() {
        Ok(on) => println!("Auto exposure: {}", if on { "on" } else { "off" }),
        Err(e) => println!("Auto exposure: unavailable ({e})"),
    }
    match camera.pixel_length() {
        Some(length) => println!("Pixel size:    {length} um"),
        None => println!("Pixel size:    unknown"),
    }
    camera.close()?;
    Ok(())
}

fn snap(
    adapter: Arc<dyn PylonAdapter>,
    config: &AppConfig,
    naverage: u32,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut camera = open_camera(adapter, config)?;
    let mut acc = FrameAccumulator::default();
    for _ in 0..naverage.max(1) {
        if let Some(frame) = camera.read_newest_image()? {
            acc.add(frame)?;
        }
    }
    let averaged = acc.count();
    let frame = acc.finish().context("No frame acquired")?;

    let pixels = frame.pixels();
    let max = pixels.iter().copied().max().unwrap_or(0);
    let mean = pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / pixels.len().max(1) as f64;
    println!(
        "{} x {} {} frame, {} averaged, mean {:.1}, max {}",
        frame.width,
        frame.height,
        frame.pixel_format.as_str(),
        averaged,
        mean,
        max
    );

    if let Some(path) = output {
        write_frames(&path, std::slice::from_ref(&frame))?;
        println!("Written to {}", path.display());
    }
    camera.close()?;
    Ok(())
}

async fn live(adapter: Arc<dyn PylonAdapter>, config: &AppConfig, frames: u32) -> Result<()> {
    let viewer = BaslerViewer::spawn(BaslerViewer::new("cli", adapter, config));
    let mut events = viewer
        .ask(Subscribe)
        .await
        .map_err(|e| anyhow!("failed to subscribe to viewer events: {}", e))?;

    let (status, _) = viewer
        .ask(IniDetector)
        .await
        .map_err(|e| anyhow!("failed to initialize camera: {}", e))?;
    println!("{status}");
    if config.camera.binning != 1 {
        viewer
            .ask(SetSetting {
                name: "binning".to_string(),
                value: serde_json::json!(config.camera.binning),
            })
            .await
            .map_err(|e| anyhow!("failed to apply binning: {}", e))?;
    }
    viewer
        .ask(GrabData {
            naverage: 1,
            live: true,
        })
        .await
        .map_err(|e| anyhow!("failed to start grabbing: {}", e))?;

    let started = Instant::now();
    let idle_timeout = Duration::from_millis(config.camera.grab_timeout_ms * 5);
    let mut received = 0;
    while received < frames {
        match tokio::time::timeout(idle_timeout, events.recv()).await {
            Ok(Ok(ViewerEvent::Data(export))) => {
                received += 1;
                if let Some(image) = export.data.first() {
                    tracing::debug!(frame = received, shape = ?image.shape, "Frame received");
                }
            }
            Ok(Ok(ViewerEvent::Status { message, .. })) => println!("{message}"),
            Ok(Ok(_)) => {}
            Ok(Err(RecvError::Lagged(skipped))) => warn!("{skipped} viewer events lagged"),
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {
                warn!("No frame within {:?}", idle_timeout);
                break;
            }
        }
    }

    viewer
        .ask(Stop)
        .await
        .map_err(|e| anyhow!("failed to stop grabbing: {}", e))?;
    let settings = viewer
        .ask(GetSettings)
        .await
        .map_err(|e| anyhow!("failed to read settings: {}", e))?;
    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "{received} frames in {elapsed:.2} s ({:.1} fps measured, {} fps displayed)",
        f64::from(received) / elapsed.max(f64::EPSILON),
        settings["timing_opts/fps"]["value"]
    );

    viewer.kill();
    viewer.wait_for_shutdown().await;
    Ok(())
}
