//! Media worker
//!
//! Demuxing, decoding and painting run on a dedicated thread with its own
//! single-threaded runtime. The controlling side talks to it only through
//! [`WorkerCommand`] and [`WorkerEvent`] messages, so it never blocks on the
//! pipeline.

use crate::config::PlayerConfig;
use crate::decode::{create_decoder, DecodeError, DecoderConfig, VideoDecoder};
use crate::demuxer::{DemuxError, PullDemuxer};
use crate::protocol::{LocatorError, SourceLocator, WorkerCommand, WorkerEvent};
use crate::render::SharedSurface;
use crate::sample_source::SampleSource;
use crate::source::{open_source, SourceError};
use crate::sync::PlaybackClock;
use crate::video_renderer::{RenderError, RenderOutcome, VideoRenderer};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to start media worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Media worker is gone")]
    Disconnected,
    #[error("Play requested before a surface was initialized")]
    NotInitialized,
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Builds the decoder for a session
pub type DecoderFactory =
    Arc<dyn Fn(&DecoderConfig, usize) -> Result<Box<dyn VideoDecoder>, DecodeError> + Send + Sync>;

/// Controller side of the worker
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    thread: std::thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn send(&self, command: WorkerCommand) -> Result<(), WorkerError> {
        self.commands.send(command).map_err(|_| WorkerError::Disconnected)
    }

    /// Next notification, `None` once the worker has exited
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Close the command channel and wait for the worker thread to exit
    pub fn shutdown(self) {
        let Self { commands, events, thread } = self;
        drop(commands);
        drop(events);
        if thread.join().is_err() {
            error!("media worker thread panicked");
        }
    }
}

/// Start a media worker using the default decoder selection
pub fn spawn(config: PlayerConfig) -> Result<WorkerHandle, WorkerError> {
    spawn_with_decoders(config, Arc::new(create_decoder))
}

pub fn spawn_with_decoders(config: PlayerConfig, decoders: DecoderFactory) -> Result<WorkerHandle, WorkerError> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let thread = std::thread::Builder::new()
        .name("reel-media-worker".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("media worker runtime failed: {}", e);
                    let _ = event_tx.send(WorkerEvent::Error {
                        message: format!("Failed to create runtime: {}", e),
                    });
                    return;
                }
            };
            let worker = Worker {
                config,
                decoders,
                client: reqwest::Client::new(),
                events: Events(event_tx),
                surface: None,
                session: None,
            };
            runtime.block_on(worker.run(command_rx));
        })
        .map_err(WorkerError::Spawn)?;

    Ok(WorkerHandle {
        commands: command_tx,
        events: event_rx,
        thread,
    })
}

#[derive(Clone)]
struct Events(mpsc::UnboundedSender<WorkerEvent>);

impl Events {
    fn emit(&self, event: WorkerEvent) {
        debug!("worker event: {:?}", event);
        // The controller may already be gone during teardown
        let _ = self.0.send(event);
    }
}

// ============================================================================
// Command loop
// ============================================================================

struct Worker {
    config: PlayerConfig,
    decoders: DecoderFactory,
    client: reqwest::Client,
    events: Events,
    surface: Option<SharedSurface>,
    session: Option<SessionHandle>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        info!("media worker started");
        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::Initialize { surface } => {
                    debug!("surface handed over: {:?}", surface);
                    self.surface = Some(surface);
                    self.events.emit(WorkerEvent::InitializeDone);
                }
                WorkerCommand::Play { source } => self.play(source).await,
                WorkerCommand::Stop => {
                    let was_running = match self.session.take() {
                        Some(session) => session.stop().await,
                        None => false,
                    };
                    // A running session acknowledges the stop itself
                    if !was_running {
                        self.events.emit(WorkerEvent::Stopped);
                    }
                }
            }
        }

        if let Some(session) = self.session.take() {
            session.stop().await;
        }
        info!("media worker exiting");
    }

    async fn play(&mut self, source: String) {
        if let Some(previous) = self.session.take() {
            previous.stop().await;
        }
        let Some(surface) = self.surface.clone() else {
            warn!("play({}) before initialize", source);
            self.events.emit(WorkerEvent::Error {
                message: WorkerError::NotInitialized.to_string(),
            });
            return;
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            source,
            surface,
            self.config.clone(),
            self.decoders.clone(),
            self.client.clone(),
            self.events.clone(),
            stop_rx,
        ));
        self.session = Some(SessionHandle { stop: stop_tx, task });
    }
}

struct SessionHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Returns false if the session had already finished on its own
    async fn stop(self) -> bool {
        let was_running = self.stop.send(()).is_ok();
        if let Err(e) = self.task.await {
            error!("playback session ended abnormally: {}", e);
        }
        was_running
    }
}

// ============================================================================
// Playback session
// ============================================================================

enum SessionEnd {
    Ended,
    Stopped,
    Failed(String),
}

/// Everything one `play` owns; dropped on stop
struct PlaybackSession {
    renderer: VideoRenderer<SharedSurface>,
    clock: PlaybackClock,
}

impl PlaybackSession {
    async fn start(
        source: &str,
        surface: SharedSurface,
        config: &PlayerConfig,
        decoders: &DecoderFactory,
        client: &reqwest::Client,
    ) -> Result<(Self, WorkerEvent), WorkerError> {
        let locator: SourceLocator = source.parse()?;
        info!("opening {}", locator);

        let bytes = open_source(&locator, client).await?;
        let samples = SampleSource::open_mp4(bytes, config.fetch_queue_depth);
        let demuxer = PullDemuxer::initialize(samples, config).await?;

        let decoder_config = demuxer.decoder_config()?;
        let decoder = decoders(&decoder_config, config.frame_pool_size)?;
        let renderer = VideoRenderer::initialize(demuxer, decoder, surface, config).await?;

        let playing = WorkerEvent::Playing {
            codec: decoder_config.codec,
            width: decoder_config.display_width,
            height: decoder_config.display_height,
        };
        let session = Self {
            renderer,
            clock: PlaybackClock::start(),
        };
        Ok((session, playing))
    }

    /// Render tick loop; runs until the stream ends, fails, or stop arrives
    async fn run(&mut self, stop: &mut oneshot::Receiver<()>, config: &PlayerConfig) -> SessionEnd {
        let mut ticks = tokio::time::interval(config.tick_interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut *stop => return SessionEnd::Stopped,
                _ = ticks.tick() => {
                    let media_time_us = self.clock.tick();
                    match self.renderer.render(media_time_us) {
                        Ok(RenderOutcome::Ended) => return SessionEnd::Ended,
                        Ok(_) => {}
                        Err(e) => return SessionEnd::Failed(e.to_string()),
                    }
                }
            }
        }
    }
}

async fn run_session(
    source: String,
    surface: SharedSurface,
    config: PlayerConfig,
    decoders: DecoderFactory,
    client: reqwest::Client,
    events: Events,
    mut stop: oneshot::Receiver<()>,
) {
    let started = tokio::select! {
        _ = &mut stop => {
            info!("stopped while opening {}", source);
            events.emit(WorkerEvent::Stopped);
            return;
        }
        started = PlaybackSession::start(&source, surface, &config, &decoders, &client) => started,
    };

    let mut session = match started {
        Ok((session, playing)) => {
            events.emit(playing);
            session
        }
        Err(e) => {
            error!("cannot play {}: {}", source, e);
            events.emit(WorkerEvent::Error { message: e.to_string() });
            return;
        }
    };

    let end = session.run(&mut stop, &config).await;
    let ticks = session.clock.ticks();
    let media_time_us = session.clock.last_tick_us();
    let stats = session.renderer.close().await;
    info!(
        "session for {} finished after {} ticks at {}us: {:?}",
        source, ticks, media_time_us, stats
    );

    events.emit(match end {
        SessionEnd::Ended => WorkerEvent::Ended,
        SessionEnd::Stopped => WorkerEvent::Stopped,
        SessionEnd::Failed(message) => WorkerEvent::Error { message },
    });
}
