//! Video renderer: keeps a few decoded frames ahead of the playhead
//!
//! ```text
//!  PullDemuxer ──next_chunk──► fill task ──decode──► VideoDecoder
//!                                 ▲                      │ on_frame / on_dequeue
//!                                 │ wake (Notify)        ▼
//!  render tick ──────────────────┴──── choose ◄──── FrameBuffer
//! ```
//!
//! The fill task is the only caller of the demuxer and the decoder, so a
//! single fill pass runs at a time. Wake-ups arriving during a pass collapse
//! into one follow-up pass.

use crate::config::PlayerConfig;
use crate::decode::{DecodeError, DecoderOutput, VideoDecoder};
use crate::demuxer::{DemuxError, PullDemuxer};
use crate::detection::DetectionOverlay;
use crate::frame_queue::{FrameBuffer, VideoFrame};
use crate::render::{Surface, SurfaceError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Decoder does not support {codec}")]
    UnsupportedConfig { codec: String },
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("Playback pipeline failed: {0}")]
    Pipeline(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RendererState {
    #[default]
    Uninitialized,
    Filling,
    Steady,
    Ended,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Painted { timestamp_us: i64 },
    NoFrame,
    Ended,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RendererStats {
    pub frames_decoded: u64,
    pub frames_painted: u64,
    pub stale_dropped: u64,
    pub chunks_submitted: u64,
    pub empty_ticks: u64,
}

// ============================================================================
// State shared with the fill task and the decoder callbacks
// ============================================================================

struct Shared {
    frames: Mutex<FrameBuffer>,
    wake: Notify,
    target: usize,
    fill_in_progress: AtomicBool,
    end_of_stream: AtomicBool,
    frames_decoded: AtomicU64,
    chunks_submitted: AtomicU64,
    failure: Mutex<Option<String>>,
    ready: Mutex<Option<oneshot::Sender<Result<(), RenderError>>>>,
}

impl Shared {
    fn signal_ready(&self) {
        if let Some(tx) = self.ready.lock().take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Record a fatal error; rejects initialization if it is still pending
    fn fail(&self, err: RenderError) {
        error!("playback pipeline failed: {}", err);
        self.failure.lock().get_or_insert_with(|| err.to_string());
        if let Some(tx) = self.ready.lock().take() {
            let _ = tx.send(Err(err));
        }
        self.wake.notify_one();
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    fn push_frame(&self, frame: VideoFrame) {
        trace!("decoded frame pts={}us", frame.timestamp_us());
        let buffered = {
            let mut frames = self.frames.lock();
            frames.push(frame);
            frames.len()
        };
        self.frames_decoded.fetch_add(1, Ordering::AcqRel);
        if buffered >= self.target {
            self.signal_ready();
        }
        self.wake.notify_one();
    }
}

fn decoder_output(shared: &Arc<Shared>) -> DecoderOutput {
    let on_frame = Arc::clone(shared);
    let on_dequeue = Arc::clone(shared);
    let on_error = Arc::clone(shared);
    DecoderOutput {
        on_frame: Arc::new(move |frame| on_frame.push_frame(frame)),
        on_dequeue: Arc::new(move || on_dequeue.wake.notify_one()),
        on_error: Arc::new(move |err| on_error.fail(RenderError::Decode(err))),
    }
}

// ============================================================================
// Fill task
// ============================================================================

struct FillTask<D: VideoDecoder> {
    demuxer: PullDemuxer,
    decoder: D,
    shared: Arc<Shared>,
}

impl<D: VideoDecoder> FillTask<D> {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let result = tokio::select! {
            _ = &mut shutdown => Ok(()),
            result = self.fill_loop() => result,
        };
        if let Err(e) = result {
            self.shared.fail(e);
        }

        let dropped = self.decoder.decode_queue_size();
        self.decoder.close();
        debug!("fill task finished, {} undecoded chunk(s) dropped", dropped);
    }

    async fn fill_loop(&mut self) -> Result<(), RenderError> {
        loop {
            self.shared.wake.notified().await;
            if self.shared.failure().is_some() {
                return Ok(());
            }

            self.shared.fill_in_progress.store(true, Ordering::Release);
            let exhausted = self.fill_pass().await;
            self.shared.fill_in_progress.store(false, Ordering::Release);

            if exhausted? {
                return self.finish().await;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Submit chunks while both the frame buffer and the decoder queue are
    /// below target. Returns true once the demuxer is exhausted.
    async fn fill_pass(&mut self) -> Result<bool, RenderError> {
        let target = self.shared.target;
        loop {
            let buffered = self.shared.frames.lock().len();
            if buffered >= target || self.decoder.decode_queue_size() >= target {
                return Ok(false);
            }

            let Some(chunk) = self.demuxer.next_chunk().await? else {
                return Ok(true);
            };
            trace!("submitting {:?} chunk pts={}us", chunk.kind, chunk.timestamp_us);
            self.decoder.decode(chunk)?;
            self.shared.chunks_submitted.fetch_add(1, Ordering::AcqRel);
        }
    }

    async fn finish(&mut self) -> Result<(), RenderError> {
        info!(
            "end of stream after {} chunks, flushing {}",
            self.shared.chunks_submitted.load(Ordering::Acquire),
            self.decoder.name()
        );
        self.decoder.flush().await?;
        self.shared.end_of_stream.store(true, Ordering::Release);
        self.shared.signal_ready();
        Ok(())
    }
}

// ============================================================================
// Renderer
// ============================================================================

pub struct VideoRenderer<S: Surface> {
    surface: S,
    shared: Arc<Shared>,
    state: RendererState,
    overlay: Option<DetectionOverlay>,
    shutdown: Option<oneshot::Sender<()>>,
    fill_task: Option<JoinHandle<()>>,
    frames_painted: u64,
    empty_ticks: u64,
}

impl<S: Surface> VideoRenderer<S> {
    /// Configure the decoder and wait until the first frames are buffered.
    ///
    /// Resolves once the frame buffer reaches its target, or at end of stream
    /// with whatever was decoded. Fails on an unsupported decoder
    /// configuration or any pipeline error before that point.
    pub async fn initialize<D>(
        demuxer: PullDemuxer,
        mut decoder: D,
        mut surface: S,
        config: &PlayerConfig,
    ) -> Result<Self, RenderError>
    where
        D: VideoDecoder + 'static,
    {
        let decoder_config = demuxer.decoder_config()?;
        surface.resize(decoder_config.display_width, decoder_config.display_height);

        if !decoder.is_config_supported(&decoder_config).await {
            error!("{} cannot decode {}", decoder.name(), decoder_config.codec);
            return Err(RenderError::UnsupportedConfig {
                codec: decoder_config.codec,
            });
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            frames: Mutex::new(FrameBuffer::new()),
            wake: Notify::new(),
            target: config.frame_buffer_target.max(1),
            fill_in_progress: AtomicBool::new(false),
            end_of_stream: AtomicBool::new(false),
            frames_decoded: AtomicU64::new(0),
            chunks_submitted: AtomicU64::new(0),
            failure: Mutex::new(None),
            ready: Mutex::new(Some(ready_tx)),
        });
        decoder.configure(&decoder_config, decoder_output(&shared))?;
        info!(
            "renderer configured: {} {}x{} via {}",
            decoder_config.codec,
            decoder_config.display_width,
            decoder_config.display_height,
            decoder.name()
        );

        let overlay = config.detection.as_ref().and_then(|detection| {
            DetectionOverlay::new(detection)
                .map_err(|e| warn!("detection overlay disabled: {}", e))
                .ok()
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = FillTask {
            demuxer,
            decoder,
            shared: Arc::clone(&shared),
        };
        let fill_task = tokio::spawn(task.run(shutdown_rx));

        let mut renderer = Self {
            surface,
            shared,
            state: RendererState::Uninitialized,
            overlay,
            shutdown: Some(shutdown_tx),
            fill_task: Some(fill_task),
            frames_painted: 0,
            empty_ticks: 0,
        };
        renderer.set_state(RendererState::Filling);
        renderer.fill_frame_buffer();

        match ready_rx.await {
            Ok(Ok(())) => {
                renderer.set_state(RendererState::Steady);
                Ok(renderer)
            }
            Ok(Err(e)) => {
                renderer.set_state(RendererState::Failed);
                Err(e)
            }
            Err(_) => Err(RenderError::Pipeline("fill task ended before the first frames".into())),
        }
    }

    pub fn state(&self) -> RendererState {
        self.state
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn buffered_frames(&self) -> usize {
        self.shared.frames.lock().len()
    }

    pub fn is_fill_in_progress(&self) -> bool {
        self.shared.fill_in_progress.load(Ordering::Acquire)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.shared.end_of_stream.load(Ordering::Acquire)
    }

    /// Wake the fill task; a no-op while a wake-up is already pending
    pub fn fill_frame_buffer(&self) {
        self.shared.wake.notify_one();
    }

    /// Paint the frame nearest to `timestamp_us`, evicting older frames
    pub fn render(&mut self, timestamp_us: i64) -> Result<RenderOutcome, RenderError> {
        if let Some(message) = self.shared.failure() {
            self.set_state(RendererState::Failed);
            return Err(RenderError::Pipeline(message));
        }
        if self.state == RendererState::Ended {
            return Ok(RenderOutcome::Ended);
        }

        let end_of_stream = self.shared.end_of_stream.load(Ordering::Acquire);
        // Paint outside the lock so decoder callbacks never wait on a paint
        let (chosen, remaining) = {
            let mut frames = self.shared.frames.lock();
            frames.choose_frame(timestamp_us);
            let chosen = frames.pop_front();
            (chosen, frames.len())
        };

        let outcome = match chosen {
            Some(frame) => {
                let end = frame.timestamp_us() + frame.duration_us();
                let outcome = if end_of_stream && remaining == 0 && timestamp_us >= end {
                    Ok(RenderOutcome::Ended)
                } else {
                    self.paint(&frame).map(|()| RenderOutcome::Painted {
                        timestamp_us: frame.timestamp_us(),
                    })
                };
                self.shared.frames.lock().push(frame);
                outcome?
            }
            None if end_of_stream => RenderOutcome::Ended,
            None => {
                warn!("no decoded frame available at {}us", timestamp_us);
                self.empty_ticks += 1;
                RenderOutcome::NoFrame
            }
        };

        if outcome == RenderOutcome::Ended {
            info!("playback ended at {}us", timestamp_us);
            self.set_state(RendererState::Ended);
        } else {
            self.fill_frame_buffer();
        }
        Ok(outcome)
    }

    fn paint(&mut self, frame: &VideoFrame) -> Result<(), RenderError> {
        self.surface.draw_frame(frame)?;
        if let Some(overlay) = &self.overlay {
            if !overlay.is_busy() {
                overlay.submit(self.surface.snapshot());
            }
            overlay.draw(&mut self.surface);
        }
        self.frames_painted += 1;
        trace!("painted frame pts={}us", frame.timestamp_us());
        Ok(())
    }

    pub fn stats(&self) -> RendererStats {
        RendererStats {
            frames_decoded: self.shared.frames_decoded.load(Ordering::Acquire),
            frames_painted: self.frames_painted,
            stale_dropped: self.shared.frames.lock().stale_dropped(),
            chunks_submitted: self.shared.chunks_submitted.load(Ordering::Acquire),
            empty_ticks: self.empty_ticks,
        }
    }

    /// Stop the fill task, close the decoder and release buffered frames
    pub async fn close(mut self) -> RendererStats {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.fill_task.take() {
            if let Err(e) = task.await {
                warn!("fill task ended abnormally: {}", e);
            }
        }
        let released = self.shared.frames.lock().clear();
        let stats = self.stats();
        info!("renderer closed, {} buffered frame(s) released: {:?}", released, stats);
        stats
    }

    fn set_state(&mut self, state: RendererState) {
        if self.state != state {
            debug!("renderer {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

impl<S: Surface> Drop for VideoRenderer<S> {
    fn drop(&mut self) {
        if let Some(task) = self.fill_task.take() {
            task.abort();
        }
        self.shared.frames.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RgbaSurface;
    use crate::sample_source::SampleSource;
    use crate::source::MemoryByteSource;
    use crate::test_support::{Mp4Fixture, ScriptedDecoder};
    use std::time::Duration;

    const CODEC: &str = "avc1.64001f";

    async fn demuxer_for(fixture: &Mp4Fixture) -> PullDemuxer {
        let source = SampleSource::open_mp4(MemoryByteSource::chunked(fixture.build(), 512), 4);
        PullDemuxer::initialize(source, &PlayerConfig::default()).await.unwrap()
    }

    async fn renderer_for(fixture: &Mp4Fixture, decoder: ScriptedDecoder) -> Result<VideoRenderer<RgbaSurface>, RenderError> {
        let demuxer = demuxer_for(fixture).await;
        VideoRenderer::initialize(demuxer, decoder, RgbaSurface::new(0, 0), &PlayerConfig::default()).await
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    fn steady_fixture(samples: u64) -> Mp4Fixture {
        let cts: Vec<u64> = (0..samples).map(|i| i * 40).collect();
        Mp4Fixture::avc(1000, &cts)
    }

    #[tokio::test]
    async fn test_fill_submits_exactly_target_chunks() {
        let decoder = ScriptedDecoder::manual(&[CODEC]);
        let script = decoder.clone();
        let demuxer = demuxer_for(&steady_fixture(20)).await;
        let init = tokio::spawn(async move {
            VideoRenderer::initialize(demuxer, decoder, RgbaSurface::new(0, 0), &PlayerConfig::default()).await
        });

        wait_until(|| script.queued() == 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(script.queued(), 3);
        assert!(!init.is_finished());

        script.drain(3);
        let renderer = init.await.unwrap().unwrap();
        assert_eq!(renderer.state(), RendererState::Steady);
        assert_eq!(renderer.buffered_frames(), 3);
        assert_eq!(renderer.stats().chunks_submitted, 3);
        let decoded: Vec<i64> = script.decoded().iter().map(|chunk| chunk.timestamp_us).collect();
        assert_eq!(decoded, vec![0, 40_000, 80_000]);
    }

    #[tokio::test]
    async fn test_fill_wakeups_coalesce() {
        let decoder = ScriptedDecoder::manual(&[CODEC]);
        let script = decoder.clone();
        let demuxer = demuxer_for(&steady_fixture(20)).await;
        let init = tokio::spawn(async move {
            VideoRenderer::initialize(demuxer, decoder, RgbaSurface::new(0, 0), &PlayerConfig::default()).await
        });
        wait_until(|| script.queued() == 3).await;
        script.drain(3);
        let renderer = init.await.unwrap().unwrap();

        for _ in 0..10 {
            renderer.fill_frame_buffer();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(renderer.stats().chunks_submitted, 3);
        assert_eq!(script.queued(), 0);
        assert!(!renderer.is_fill_in_progress());
    }

    #[tokio::test]
    async fn test_render_picks_nearest_and_evicts_older() {
        let fixture = Mp4Fixture::avc(1000, &[0, 33, 66, 100]);
        let mut renderer = renderer_for(&fixture, ScriptedDecoder::automatic(&[CODEC])).await.unwrap();
        assert_eq!(renderer.surface().size(), (320, 240));

        let outcome = renderer.render(45_000).unwrap();
        assert_eq!(outcome, RenderOutcome::Painted { timestamp_us: 33_000 });
        assert_eq!(renderer.surface().last_timestamp_us(), Some(33_000));
        assert_eq!(renderer.stats().stale_dropped, 1);
        assert_eq!(renderer.stats().frames_painted, 1);
    }

    #[tokio::test]
    async fn test_render_wakes_fill_after_eviction() {
        let mut renderer = renderer_for(&steady_fixture(20), ScriptedDecoder::automatic(&[CODEC]))
            .await
            .unwrap();
        assert_eq!(renderer.stats().chunks_submitted, 3);

        // Evicts the frames at 0 and 40ms
        renderer.render(80_000).unwrap();
        wait_until(|| renderer.buffered_frames() == 3).await;
        assert_eq!(renderer.stats().chunks_submitted, 5);
    }

    /// Records whether the frame buffer was unlocked during each paint
    struct LockCheckingSurface {
        inner: RgbaSurface,
        shared: Arc<Mutex<Option<Arc<Shared>>>>,
        unlocked: Arc<Mutex<Vec<bool>>>,
    }

    impl Surface for LockCheckingSurface {
        fn resize(&mut self, width: u32, height: u32) {
            self.inner.resize(width, height)
        }

        fn size(&self) -> (u32, u32) {
            self.inner.size()
        }

        fn draw_frame(&mut self, frame: &VideoFrame) -> Result<(), crate::render::SurfaceError> {
            if let Some(shared) = self.shared.lock().as_ref() {
                self.unlocked.lock().push(shared.frames.try_lock().is_some());
            }
            self.inner.draw_frame(frame)
        }

        fn stroke_rect(&mut self, rect: crate::render::Rect, color: [u8; 4], thickness: u32) {
            self.inner.stroke_rect(rect, color, thickness)
        }

        fn fill_rect(&mut self, rect: crate::render::Rect, color: [u8; 4]) {
            self.inner.fill_rect(rect, color)
        }

        fn snapshot(&self) -> image::RgbaImage {
            self.inner.snapshot()
        }
    }

    #[tokio::test]
    async fn test_paint_runs_without_frame_buffer_lock() {
        let shared_slot = Arc::new(Mutex::new(None));
        let unlocked = Arc::new(Mutex::new(Vec::new()));
        let surface = LockCheckingSurface {
            inner: RgbaSurface::new(0, 0),
            shared: Arc::clone(&shared_slot),
            unlocked: Arc::clone(&unlocked),
        };
        let demuxer = demuxer_for(&steady_fixture(20)).await;
        let mut renderer = VideoRenderer::initialize(
            demuxer,
            ScriptedDecoder::automatic(&[CODEC]),
            surface,
            &PlayerConfig::default(),
        )
        .await
        .unwrap();
        *shared_slot.lock() = Some(Arc::clone(&renderer.shared));

        assert_eq!(renderer.render(0).unwrap(), RenderOutcome::Painted { timestamp_us: 0 });
        assert_eq!(renderer.render(40_000).unwrap(), RenderOutcome::Painted { timestamp_us: 40_000 });
        assert_eq!(*unlocked.lock(), vec![true, true]);
        // The painted frame goes back into the buffer
        assert_eq!(renderer.shared.frames.lock().front().map(|f| f.timestamp_us()), Some(40_000));
    }

    #[tokio::test]
    async fn test_empty_buffer_skips_paint() {
        let mut renderer = renderer_for(&steady_fixture(8), ScriptedDecoder::automatic(&[CODEC]))
            .await
            .unwrap();
        renderer.shared.frames.lock().clear();

        assert_eq!(renderer.render(0).unwrap(), RenderOutcome::NoFrame);
        assert_eq!(renderer.surface().frames_drawn(), 0);
        assert_eq!(renderer.stats().empty_ticks, 1);
    }

    #[tokio::test]
    async fn test_short_stream_ready_at_end_and_ends() {
        let decoder = ScriptedDecoder::automatic(&[CODEC]);
        let script = decoder.clone();
        let fixture = Mp4Fixture::avc(1000, &[0, 33]);
        let mut renderer = renderer_for(&fixture, decoder).await.unwrap();

        assert!(renderer.is_end_of_stream());
        assert_eq!(script.flushes(), 1);
        assert_eq!(renderer.render(0).unwrap(), RenderOutcome::Painted { timestamp_us: 0 });
        assert_eq!(renderer.render(40_000).unwrap(), RenderOutcome::Painted { timestamp_us: 33_000 });
        assert_eq!(renderer.render(70_000).unwrap(), RenderOutcome::Ended);
        assert_eq!(renderer.state(), RendererState::Ended);
        assert_eq!(renderer.render(80_000).unwrap(), RenderOutcome::Ended);

        let stats = renderer.close().await;
        assert_eq!(stats.frames_decoded, 2);
        assert_eq!(stats.frames_painted, 2);
        assert!(script.is_closed());
    }

    #[tokio::test]
    async fn test_unsupported_config_rejected() {
        let result = renderer_for(&steady_fixture(4), ScriptedDecoder::automatic(&["vp8"])).await;
        assert!(matches!(result, Err(RenderError::UnsupportedConfig { codec }) if codec == CODEC));
    }

    #[tokio::test]
    async fn test_decode_failure_rejects_initialize() {
        let mut fixture = steady_fixture(4);
        fixture.samples[0].is_sync = false;
        let result = renderer_for(&fixture, ScriptedDecoder::automatic(&[CODEC])).await;
        assert!(matches!(result, Err(RenderError::Decode(DecodeError::KeyFrameRequired))));
    }

    #[tokio::test]
    async fn test_failure_surfaces_on_render() {
        let mut renderer = renderer_for(&steady_fixture(8), ScriptedDecoder::automatic(&[CODEC]))
            .await
            .unwrap();
        renderer.shared.fail(RenderError::Pipeline("decoder lost".into()));

        assert!(matches!(renderer.render(0), Err(RenderError::Pipeline(_))));
        assert_eq!(renderer.state(), RendererState::Failed);
    }

    #[tokio::test]
    async fn test_close_releases_frames_and_decoder() {
        let decoder = ScriptedDecoder::manual(&[CODEC]);
        let script = decoder.clone();
        let demuxer = demuxer_for(&steady_fixture(20)).await;
        let init = tokio::spawn(async move {
            VideoRenderer::initialize(demuxer, decoder, RgbaSurface::new(0, 0), &PlayerConfig::default()).await
        });
        wait_until(|| script.queued() == 3).await;
        script.drain(3);
        let renderer = init.await.unwrap().unwrap();

        let stats = renderer.close().await;
        assert_eq!(stats.frames_decoded, 3);
        assert!(script.is_closed());
        assert_eq!(script.pool().stats().total_released, 3);
    }
}
