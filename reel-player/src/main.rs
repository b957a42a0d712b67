//! # Reel Player
//!
//! Headless front-end: hands a surface to the media worker, plays one
//! source and prints every worker notification as a JSON line.

use anyhow::{bail, Context, Result};
use clap::Parser;
use reel_core::config::{DetectionConfig, PlayerConfig};
use reel_core::{SharedSurface, WorkerCommand, WorkerEvent, WorkerHandle};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reel")]
#[command(about = "Stream an MP4 file and render it through the media worker")]
struct Args {
    /// http(s) URL, file:// URL or local path of an MP4 file
    source: String,

    /// JSON player configuration
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Stop playback after this many seconds
    #[arg(short = 's', long = "seconds")]
    seconds: Option<f64>,

    /// Save the last painted frame as PNG
    #[arg(long = "snapshot")]
    snapshot: Option<PathBuf>,

    /// Object-detection endpoint receiving painted frames
    #[arg(long = "detect-url")]
    detect_url: Option<String>,

    /// Render ticks per second
    #[arg(long = "refresh-rate")]
    refresh_rate: Option<u32>,

    /// Decoded frames kept ahead of the playhead
    #[arg(long = "frame-buffer")]
    frame_buffer: Option<usize>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reel_core=info,reel_player=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(args: &Args) -> Result<PlayerConfig> {
    let mut config = match &args.config {
        Some(path) => PlayerConfig::from_file(path)?,
        None => PlayerConfig::default(),
    };

    if let Some(hz) = args.refresh_rate {
        config.refresh_rate_hz = hz;
    }
    if let Some(frames) = args.frame_buffer {
        config.frame_buffer_target = frames;
    }
    if let Some(url) = &args.detect_url {
        config.detection = Some(match config.detection.take() {
            Some(mut detection) => {
                detection.endpoint = url.clone();
                detection
            }
            None => DetectionConfig::new(url.clone()),
        });
    }

    config.validate()?;
    Ok(config)
}

fn print_event(event: &WorkerEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn expect_event(worker: &mut WorkerHandle) -> Result<WorkerEvent> {
    let event = worker.next_event().await.context("media worker exited")?;
    print_event(&event)?;
    Ok(event)
}

/// Pump events until playback finishes or `deadline` passes
async fn play(worker: &mut WorkerHandle, deadline: Option<Instant>) -> Result<Option<String>> {
    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, expect_event(worker)).await {
                Ok(event) => event?,
                Err(_) => {
                    info!("time limit reached, stopping");
                    worker.send(WorkerCommand::Stop)?;
                    loop {
                        match expect_event(worker).await? {
                            WorkerEvent::Stopped | WorkerEvent::Ended => return Ok(None),
                            WorkerEvent::Error { message } => return Ok(Some(message)),
                            _ => {}
                        }
                    }
                }
            },
            None => expect_event(worker).await?,
        };

        match next {
            WorkerEvent::Ended | WorkerEvent::Stopped => return Ok(None),
            WorkerEvent::Error { message } => return Ok(Some(message)),
            WorkerEvent::Playing { codec, width, height } => info!("playing {} {}x{}", codec, width, height),
            WorkerEvent::InitializeDone => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = load_config(&args)?;
    info!("reel {} starting", reel_core::VERSION);

    let surface = SharedSurface::new(0, 0);
    let mut worker = reel_core::spawn(config)?;

    worker.send(WorkerCommand::Initialize { surface: surface.clone() })?;
    match expect_event(&mut worker).await? {
        WorkerEvent::InitializeDone => {}
        other => bail!("unexpected worker response to initialize: {:?}", other),
    }

    let deadline = args
        .seconds
        .filter(|s| *s > 0.0)
        .map(|s| Instant::now() + Duration::from_secs_f64(s));
    worker.send(WorkerCommand::Play { source: args.source.clone() })?;
    let failure = play(&mut worker, deadline).await?;

    tokio::task::spawn_blocking(move || worker.shutdown()).await?;

    if let Some(path) = &args.snapshot {
        if surface.frames_drawn() == 0 {
            warn!("no frame was painted, snapshot not written");
        } else {
            surface
                .save_png(path)
                .with_context(|| format!("failed to write snapshot {}", path.display()))?;
            info!("snapshot saved to {}", path.display());
        }
    }

    if let Some(message) = failure {
        bail!("playback failed: {}", message);
    }
    Ok(())
}
