//! # Video Decode Module
//!
//! Asynchronous decoder interface. Chunks are submitted without blocking;
//! frames come back through the output callbacks, possibly from another
//! thread.
//!
//! ## Backends:
//! - OpenH264 (software H.264) - `software-decode` feature

use crate::demuxer::EncodedChunk;
use crate::frame_queue::{FramePool, VideoFrame};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("No decoder available for {codec} (tried: {tried:?})")]
    NoDecoder { codec: String, tried: Vec<String> },
    #[error("Invalid decoder description: {0}")]
    InvalidDescription(String),
    #[error("Decoder initialization failed: {0}")]
    Init(String),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("A key frame is required after configure")]
    KeyFrameRequired,
    #[error("Decoder is not configured")]
    NotConfigured,
    #[error("Decoder is closed")]
    Closed,
}

/// Video codec families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
}

impl Codec {
    /// Family of a codec string such as `avc1.64001f` or `vp8`
    pub fn from_codec_string(codec: &str) -> Option<Self> {
        let fourcc = codec.split('.').next().unwrap_or(codec);
        match fourcc {
            "avc1" | "avc3" => Some(Codec::H264),
            "hvc1" | "hev1" => Some(Codec::H265),
            "vp8" | "vp08" => Some(Codec::Vp8),
            "vp09" => Some(Codec::Vp9),
            "av01" => Some(Codec::Av1),
            _ => None,
        }
    }
}

/// Decoder configuration derived from the selected track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub codec: String,
    pub display_width: u32,
    pub display_height: u32,
    /// Codec configuration record (avcC/hvcC/vpcC/av1C body)
    pub description: Option<Bytes>,
}

/// Callbacks a configured decoder reports through
#[derive(Clone)]
pub struct DecoderOutput {
    /// A frame finished decoding
    pub on_frame: Arc<dyn Fn(VideoFrame) + Send + Sync>,
    /// A chunk left the decode queue
    pub on_dequeue: Arc<dyn Fn() + Send + Sync>,
    /// Decoding failed; the decoder is unusable afterwards
    pub on_error: Arc<dyn Fn(DecodeError) + Send + Sync>,
}

/// Decoder trait - implemented by all decoder backends
#[async_trait]
pub trait VideoDecoder: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    async fn is_config_supported(&self, config: &DecoderConfig) -> bool;

    fn configure(&mut self, config: &DecoderConfig, output: DecoderOutput) -> Result<(), DecodeError>;

    /// Queue a chunk; the first chunk after configure must be a key chunk
    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), DecodeError>;

    /// Chunks submitted but not yet decoded
    fn decode_queue_size(&self) -> usize;

    /// Resolves once every queued chunk has been decoded
    async fn flush(&mut self) -> Result<(), DecodeError>;

    /// Abort pending work; queued chunks are discarded
    fn close(&mut self);
}

#[async_trait]
impl VideoDecoder for Box<dyn VideoDecoder> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn is_config_supported(&self, config: &DecoderConfig) -> bool {
        (**self).is_config_supported(config).await
    }

    fn configure(&mut self, config: &DecoderConfig, output: DecoderOutput) -> Result<(), DecodeError> {
        (**self).configure(config, output)
    }

    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), DecodeError> {
        (**self).decode(chunk)
    }

    fn decode_queue_size(&self) -> usize {
        (**self).decode_queue_size()
    }

    async fn flush(&mut self) -> Result<(), DecodeError> {
        (**self).flush().await
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Create the best available decoder for a configuration
pub fn create_decoder(config: &DecoderConfig, frame_pool_size: usize) -> Result<Box<dyn VideoDecoder>, DecodeError> {
    let mut tried: Vec<String> = Vec::new();

    if let Some(Codec::H264) = Codec::from_codec_string(&config.codec) {
        tried.push("OpenH264".into());
        #[cfg(feature = "software-decode")]
        {
            return Ok(Box::new(OpenH264Decoder::new(FramePool::new(frame_pool_size))));
        }
    }

    let _ = frame_pool_size;
    Err(DecodeError::NoDecoder {
        codec: config.codec.clone(),
        tried,
    })
}

/// Copy a strided I420 image into a tightly packed pool buffer
pub fn pack_i420(
    pool: &FramePool,
    (width, height): (usize, usize),
    (y_stride, u_stride, v_stride): (usize, usize, usize),
    (y, u, v): (&[u8], &[u8], &[u8]),
) -> Vec<u8> {
    let uv_width = width.div_ceil(2);
    let uv_height = height.div_ceil(2);
    let mut data = pool.acquire();
    data.reserve(width * height + 2 * uv_width * uv_height);

    for row in 0..height {
        let start = row * y_stride;
        if let Some(line) = y.get(start..start + width) {
            data.extend_from_slice(line);
        }
    }
    for (plane, stride) in [(u, u_stride), (v, v_stride)] {
        for row in 0..uv_height {
            let start = row * stride;
            if let Some(line) = plane.get(start..start + uv_width) {
                data.extend_from_slice(line);
            }
        }
    }
    data
}

// ============================================================================
// OpenH264 Software Decoder
// ============================================================================

#[cfg(feature = "software-decode")]
pub use self::openh264_backend::OpenH264Decoder;

#[cfg(feature = "software-decode")]
mod openh264_backend {
    use super::*;
    use crate::h264_utils::{parse_avcc, sample_to_annexb, AvcDecoderSetup};
    use openh264::decoder::DecodedYUV;
    use openh264::formats::YUVSource;
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread::JoinHandle;
    use tokio::sync::oneshot;

    enum Job {
        Chunk(EncodedChunk),
        Flush(oneshot::Sender<()>),
    }

    /// OpenH264 running on its own thread
    pub struct OpenH264Decoder {
        pool: FramePool,
        jobs: Option<mpsc::Sender<Job>>,
        thread: Option<JoinHandle<()>>,
        queued: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        awaiting_key: bool,
    }

    impl OpenH264Decoder {
        pub fn new(pool: FramePool) -> Self {
            Self {
                pool,
                jobs: None,
                thread: None,
                queued: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
                awaiting_key: true,
            }
        }

        fn setup_for(config: &DecoderConfig) -> Result<AvcDecoderSetup, DecodeError> {
            if Codec::from_codec_string(&config.codec) != Some(Codec::H264) {
                return Err(DecodeError::UnsupportedCodec(config.codec.clone()));
            }
            match &config.description {
                Some(description) => parse_avcc(description)
                    .ok_or_else(|| DecodeError::InvalidDescription("malformed avcC record".into())),
                // avc3 carries parameter sets in-band
                None => Ok(AvcDecoderSetup {
                    parameter_sets: Vec::new(),
                    nal_length_size: 4,
                    profile: 0,
                    level: 0,
                }),
            }
        }
    }

    #[async_trait]
    impl VideoDecoder for OpenH264Decoder {
        fn name(&self) -> &'static str {
            "OpenH264"
        }

        async fn is_config_supported(&self, config: &DecoderConfig) -> bool {
            Self::setup_for(config).is_ok()
        }

        fn configure(&mut self, config: &DecoderConfig, output: DecoderOutput) -> Result<(), DecodeError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(DecodeError::Closed);
            }
            if self.jobs.is_some() {
                return Err(DecodeError::Init("decoder already configured".into()));
            }
            let setup = Self::setup_for(config)?;
            let nal_length_size = config.description.as_ref().map(|_| setup.nal_length_size);
            tracing::info!(
                "OpenH264: configuring {} ({}x{}, profile {} level {})",
                config.codec,
                config.display_width,
                config.display_height,
                setup.profile,
                setup.level
            );

            let (tx, rx) = mpsc::channel();
            let worker = DecodeThread {
                setup,
                nal_length_size,
                pool: self.pool.clone(),
                output,
                queued: self.queued.clone(),
                closed: self.closed.clone(),
                pending_pts: BinaryHeap::new(),
            };
            let thread = std::thread::Builder::new()
                .name("reel-h264".into())
                .spawn(move || worker.run(rx))
                .map_err(|e| DecodeError::Init(e.to_string()))?;

            self.jobs = Some(tx);
            self.thread = Some(thread);
            self.awaiting_key = true;
            Ok(())
        }

        fn decode(&mut self, chunk: EncodedChunk) -> Result<(), DecodeError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(DecodeError::Closed);
            }
            let jobs = self.jobs.as_ref().ok_or(DecodeError::NotConfigured)?;
            if self.awaiting_key {
                if !chunk.is_key() {
                    return Err(DecodeError::KeyFrameRequired);
                }
                self.awaiting_key = false;
            }

            self.queued.fetch_add(1, Ordering::SeqCst);
            if jobs.send(Job::Chunk(chunk)).is_err() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                return Err(DecodeError::Closed);
            }
            Ok(())
        }

        fn decode_queue_size(&self) -> usize {
            self.queued.load(Ordering::SeqCst)
        }

        async fn flush(&mut self) -> Result<(), DecodeError> {
            let jobs = self.jobs.as_ref().ok_or(DecodeError::NotConfigured)?;
            let (done_tx, done_rx) = oneshot::channel();
            jobs.send(Job::Flush(done_tx)).map_err(|_| DecodeError::Closed)?;
            done_rx.await.map_err(|_| DecodeError::Closed)
        }

        fn close(&mut self) {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            // The thread drains the channel without decoding and exits
            self.jobs = None;
            if let Some(thread) = self.thread.take() {
                tracing::debug!("OpenH264: closing {:?}", thread.thread().name());
            }
        }
    }

    impl Drop for OpenH264Decoder {
        fn drop(&mut self) {
            self.close();
        }
    }

    struct DecodeThread {
        setup: AvcDecoderSetup,
        /// Length prefix size when samples are AVCC framed (avcC present)
        nal_length_size: Option<usize>,
        pool: FramePool,
        output: DecoderOutput,
        queued: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        /// Timestamps of submitted chunks not yet matched to a frame
        pending_pts: BinaryHeap<Reverse<(i64, i64)>>,
    }

    impl DecodeThread {
        fn run(mut self, jobs: mpsc::Receiver<Job>) {
            let mut decoder = match openh264::decoder::Decoder::new() {
                Ok(decoder) => decoder,
                Err(e) => {
                    (self.output.on_error)(DecodeError::Init(e.to_string()));
                    return;
                }
            };

            if !self.setup.parameter_sets.is_empty() {
                if let Err(e) = decoder.decode(&self.setup.parameter_sets) {
                    (self.output.on_error)(DecodeError::InvalidDescription(e.to_string()));
                    return;
                }
            }

            let mut failed = false;
            while let Ok(job) = jobs.recv() {
                match job {
                    Job::Chunk(chunk) => {
                        if !failed && !self.closed.load(Ordering::SeqCst) {
                            failed = !self.decode_one(&mut decoder, chunk);
                        }
                        self.queued.fetch_sub(1, Ordering::SeqCst);
                        (self.output.on_dequeue)();
                    }
                    Job::Flush(done) => {
                        if !failed && !self.closed.load(Ordering::SeqCst) {
                            failed = !self.drain(&mut decoder);
                        }
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("OpenH264 thread exiting");
        }

        /// Returns false once the decoder has failed
        fn decode_one(&mut self, decoder: &mut openh264::decoder::Decoder, chunk: EncodedChunk) -> bool {
            self.pending_pts.push(Reverse((chunk.timestamp_us, chunk.duration_us)));

            let annexb = sample_to_annexb(&chunk.data, self.nal_length_size);

            match decoder.decode(&annexb) {
                Ok(Some(yuv)) => {
                    self.emit(&yuv);
                    true
                }
                Ok(None) => true,
                Err(e) => {
                    tracing::error!("OpenH264 decode failed at pts={}us: {}", chunk.timestamp_us, e);
                    (self.output.on_error)(DecodeError::DecodeFailed(e.to_string()));
                    false
                }
            }
        }

        /// Emit the frames held back for reordering; returns false on failure
        fn drain(&mut self, decoder: &mut openh264::decoder::Decoder) -> bool {
            match decoder.flush_remaining() {
                Ok(frames) => {
                    tracing::debug!("OpenH264 flush: {} delayed frame(s)", frames.len());
                    for yuv in &frames {
                        self.emit(yuv);
                    }
                    self.pending_pts.clear();
                    true
                }
                Err(e) => {
                    tracing::error!("OpenH264 flush failed: {}", e);
                    (self.output.on_error)(DecodeError::DecodeFailed(e.to_string()));
                    false
                }
            }
        }

        fn emit(&mut self, yuv: &DecodedYUV<'_>) {
            // Output is in presentation order: the earliest pending timestamp is this frame
            let Some(Reverse((timestamp_us, duration_us))) = self.pending_pts.pop() else {
                return;
            };
            let (width, height) = yuv.dimensions();
            let data = pack_i420(&self.pool, (width, height), yuv.strides(), (yuv.y(), yuv.u(), yuv.v()));
            let frame = VideoFrame::new(
                timestamp_us,
                duration_us,
                width as u32,
                height as u32,
                data,
                Some(self.pool.clone()),
            );
            tracing::trace!("decoded frame pts={}us {}x{}", timestamp_us, width, height);
            (self.output.on_frame)(frame);
        }
    }
}
