//! Pull demuxer: one encoded chunk per await, in decode order.
//!
//! The extraction task pushes samples in batches into a FIFO readahead queue
//! while the consumer is busy elsewhere; extraction pauses once the queue
//! reaches its high-water mark and resumes on the next pull that finds it
//! empty. Only one pull can be outstanding at a time because
//! [`PullDemuxer::next_chunk`] borrows the demuxer mutably:
//!
//! ```compile_fail
//! # async fn pull_twice(mut demuxer: reel_core::demuxer::PullDemuxer) {
//! let first = demuxer.next_chunk();
//! let second = demuxer.next_chunk();
//! drop((first, second));
//! # }
//! ```

use crate::config::PlayerConfig;
use crate::decode::DecoderConfig;
use crate::mp4_demux::{ContainerParser, ParseError, Sample, TrackInfo};
use crate::sample_source::{Delivery, Extraction, SampleCallback, SampleSource, TrackSampleSource};
use crate::source::SourceError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Container parse failed: {0}")]
    Parse(#[from] ParseError),
    #[error("Stream ended before the movie header")]
    MissingMetadata,
    #[error("No video track")]
    NoVideoTrack,
    #[error("Video track ({codec}) has no decoder configuration box")]
    MissingDescription { codec: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Key,
    Delta,
}

/// Compressed access unit in microseconds, ready for a decoder
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub kind: ChunkType,
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub data: Bytes,
}

impl EncodedChunk {
    pub fn from_sample(sample: &Sample) -> Self {
        Self {
            kind: if sample.is_sync { ChunkType::Key } else { ChunkType::Delta },
            timestamp_us: to_micros(sample.cts, sample.timescale),
            duration_us: to_micros(sample.duration as i64, sample.timescale),
            data: sample.data.clone(),
        }
    }

    pub fn is_key(&self) -> bool {
        self.kind == ChunkType::Key
    }
}

/// Container units to microseconds, truncating toward zero
pub fn to_micros(value: i64, timescale: u32) -> i64 {
    (value as i128 * 1_000_000 / timescale.max(1) as i128) as i64
}

/// Microseconds to container units, truncating toward zero
pub fn from_micros(us: i64, timescale: u32) -> i64 {
    (us as i128 * timescale as i128 / 1_000_000) as i64
}

#[derive(Default)]
struct ReadaheadState {
    samples: VecDeque<Sample>,
    finished: bool,
    failure: Option<DemuxError>,
}

/// Readahead queue shared with the extraction task
struct Readahead {
    state: Mutex<ReadaheadState>,
    arrived: Notify,
    high_water: usize,
}

impl Readahead {
    fn receive(&self, delivery: Delivery) -> Extraction {
        let mut state = self.state.lock();
        let answer = match delivery {
            Delivery::Samples(batch) => {
                state.samples.extend(batch);
                if state.samples.len() >= self.high_water {
                    tracing::trace!("readahead full ({} samples)", state.samples.len());
                    Extraction::Stop
                } else {
                    Extraction::Continue
                }
            }
            Delivery::Finished => {
                tracing::debug!("demuxer exhausted");
                state.finished = true;
                Extraction::Stop
            }
            Delivery::Failed(e) => {
                state.failure = Some(e);
                state.finished = true;
                Extraction::Stop
            }
        };
        drop(state);
        self.arrived.notify_one();
        answer
    }
}

pub struct PullDemuxer {
    source: TrackSampleSource,
    track: TrackInfo,
    readahead: Arc<Readahead>,
    on_samples: SampleCallback,
}

impl PullDemuxer {
    /// Resolve metadata and select the first video track
    pub async fn initialize<P: ContainerParser + 'static>(
        mut source: SampleSource<P>,
        config: &PlayerConfig,
    ) -> Result<Self, DemuxError> {
        let info = source.track_info().await?;
        let track = info.video_tracks().next().cloned().ok_or_else(|| {
            tracing::error!("{}: no video track among {} track(s)", source.origin(), info.tracks.len());
            DemuxError::NoVideoTrack
        })?;
        tracing::info!(
            "{}: movie duration {:.3}s",
            source.origin(),
            info.duration_us() as f64 / 1e6
        );

        let source = source.select_track(&track, config.samples_per_batch)?;
        let readahead = Arc::new(Readahead {
            state: Mutex::new(ReadaheadState::default()),
            arrived: Notify::new(),
            high_water: config.sample_buffer_target.max(1),
        });
        let on_samples: SampleCallback = {
            let readahead = Arc::clone(&readahead);
            Arc::new(move |delivery: Delivery| readahead.receive(delivery))
        };
        Ok(Self {
            source,
            track,
            readahead,
            on_samples,
        })
    }

    pub fn track(&self) -> &TrackInfo {
        &self.track
    }

    pub fn readahead_len(&self) -> usize {
        self.readahead.state.lock().samples.len()
    }

    pub fn is_extracting(&self) -> bool {
        self.source.is_started()
    }

    /// True once the last chunk has been handed out
    pub fn is_exhausted(&self) -> bool {
        let state = self.readahead.state.lock();
        state.finished && state.samples.is_empty()
    }

    pub fn decoder_config(&self) -> Result<DecoderConfig, DemuxError> {
        let codec = if self.track.codec.starts_with("vp08") {
            "vp8".to_string()
        } else {
            self.track.codec.clone()
        };

        let description = self
            .track
            .description
            .as_ref()
            .map(|d| d.payload())
            .ok_or_else(|| DemuxError::MissingDescription { codec: codec.clone() })?;

        Ok(DecoderConfig {
            codec,
            display_width: self.track.width,
            display_height: self.track.height,
            description: Some(description),
        })
    }

    /// Next chunk in decode order, `None` at end of stream
    pub async fn next_chunk(&mut self) -> Result<Option<EncodedChunk>, DemuxError> {
        loop {
            {
                let mut state = self.readahead.state.lock();
                if let Some(sample) = state.samples.pop_front() {
                    drop(state);
                    let chunk = EncodedChunk::from_sample(&sample);
                    tracing::trace!(
                        "chunk #{} {:?} pts={}us dur={}us size={}",
                        sample.number,
                        chunk.kind,
                        chunk.timestamp_us,
                        chunk.duration_us,
                        chunk.data.len()
                    );
                    return Ok(Some(chunk));
                }
                if let Some(e) = state.failure.take() {
                    return Err(e);
                }
                if state.finished {
                    return Ok(None);
                }
            }
            if !self.source.is_started() {
                self.source.start(Arc::clone(&self.on_samples));
            }
            self.readahead.arrived.notified().await;
        }
    }
}
