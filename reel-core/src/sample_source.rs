//! Sample source: byte stream + container parser
//!
//! The fetch task streams bytes into a bounded channel. Until a track is
//! selected the parser is fed on demand by whoever awaits metadata; after
//! selection an extraction task owns the parser and pushes sample batches to
//! the consumer's callback while extraction is started.

use crate::demuxer::DemuxError;
use crate::mp4_demux::{ContainerParser, MovieInfo, Mp4Parser, ParserEvent, Sample, TrackInfo};
use crate::source::{ByteSource, SourceError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What the extraction task hands to the consumer
#[derive(Debug)]
pub enum Delivery {
    /// Non-empty ordered batch
    Samples(Vec<Sample>),
    /// Every sample of the track has been delivered
    Finished,
    /// Transport or parse failure; nothing follows
    Failed(DemuxError),
}

/// Consumer's answer to a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    Continue,
    Stop,
}

/// Receives deliveries on the extraction task
pub type SampleCallback = Arc<dyn Fn(Delivery) -> Extraction + Send + Sync>;

/// Byte stream and parser before a track has been selected
pub struct SampleSource<P: ContainerParser = Mp4Parser> {
    parser: P,
    chunks: mpsc::Receiver<Result<Bytes, SourceError>>,
    fetch_task: JoinHandle<()>,
    origin: String,
    /// Offset of the next byte handed to the parser
    offset: u64,
    input_done: bool,
    info: Option<MovieInfo>,
}

impl SampleSource<Mp4Parser> {
    pub fn open_mp4<S: ByteSource + 'static>(source: S, fetch_queue_depth: usize) -> Self {
        Self::open(source, Mp4Parser::new(), fetch_queue_depth)
    }
}

impl<P: ContainerParser + 'static> SampleSource<P> {
    /// Start fetching immediately; bytes are parsed as they are awaited
    pub fn open<S: ByteSource + 'static>(source: S, parser: P, fetch_queue_depth: usize) -> Self {
        let origin = source.describe();
        let (tx, chunks) = mpsc::channel(fetch_queue_depth.max(1));

        let fetch_task = tokio::spawn(async move {
            let mut source = source;
            loop {
                match source.next_chunk().await {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        tracing::info!("fetching {}", origin);
        Self {
            parser,
            chunks,
            fetch_task,
            origin,
            offset: 0,
            input_done: false,
            info: None,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Movie metadata, parsing as many bytes as needed
    pub async fn track_info(&mut self) -> Result<MovieInfo, DemuxError> {
        loop {
            if let Some(info) = &self.info {
                return Ok(info.clone());
            }
            if self.input_done {
                return Err(DemuxError::MissingMetadata);
            }
            let chunk = self.chunks.recv().await;
            let events = self.consume(chunk)?;
            for event in events {
                if let ParserEvent::Ready(info) = event {
                    self.info.get_or_insert(info);
                }
            }
        }
    }

    /// Extract `track` only; consumes the unselected source.
    ///
    /// Extraction starts suspended, see [`TrackSampleSource::start`].
    pub fn select_track(
        mut self,
        track: &TrackInfo,
        samples_per_batch: usize,
    ) -> Result<TrackSampleSource, DemuxError> {
        self.parser.set_extraction_options(track.id, samples_per_batch)?;
        tracing::info!(
            "selected track {} ({}, {}x{}, {} samples)",
            track.id,
            track.codec,
            track.width,
            track.height,
            track.sample_count
        );

        let (control, _) = watch::channel::<Option<SampleCallback>>(None);
        let control = Arc::new(control);
        let extract_task = tokio::spawn(extract(self, Arc::clone(&control)));
        Ok(TrackSampleSource {
            track: track.clone(),
            control,
            extract_task,
        })
    }

    /// Feed one network chunk (or the end of stream) to the parser
    fn consume(&mut self, chunk: Option<Result<Bytes, SourceError>>) -> Result<Vec<ParserEvent>, DemuxError> {
        match chunk {
            Some(Ok(chunk)) => {
                let events = self.parser.append(self.offset, &chunk).map_err(|e| {
                    tracing::error!("{}: parse error at byte {}: {}", self.origin, self.offset, e);
                    e
                })?;
                self.offset += chunk.len() as u64;
                Ok(events)
            }
            Some(Err(e)) => {
                tracing::error!("{}: fetch failed: {}", self.origin, e);
                Err(e.into())
            }
            None if self.input_done => Ok(Vec::new()),
            None => {
                tracing::debug!("{}: end of stream after {} bytes", self.origin, self.offset);
                self.input_done = true;
                Ok(self.parser.flush().map_err(|e| {
                    tracing::error!("{}: parse error at end of stream: {}", self.origin, e);
                    e
                })?)
            }
        }
    }
}

impl<P: ContainerParser> Drop for SampleSource<P> {
    fn drop(&mut self) {
        self.fetch_task.abort();
    }
}

fn sample_batches(events: Vec<ParserEvent>) -> impl Iterator<Item = Vec<Sample>> {
    events.into_iter().filter_map(|event| match event {
        ParserEvent::Samples { samples, .. } if !samples.is_empty() => Some(samples),
        _ => None,
    })
}

/// Extraction task: parses fetched bytes while a callback is installed.
///
/// Batches the parser produced after the consumer said stop are held back
/// and delivered first on the next start. Delivery and the resulting stop
/// happen without an await in between.
async fn extract<P: ContainerParser + 'static>(
    mut source: SampleSource<P>,
    control: Arc<watch::Sender<Option<SampleCallback>>>,
) {
    let mut requests = control.subscribe();
    let mut held: VecDeque<Vec<Sample>> = VecDeque::new();
    let mut parser_started = false;
    let mut delivered = 0u64;

    loop {
        let current = requests.borrow_and_update().clone();
        let Some(on_samples) = current else {
            if parser_started {
                source.parser.stop();
                parser_started = false;
                tracing::trace!("extraction suspended after {} samples", delivered);
            }
            if requests.changed().await.is_err() {
                return;
            }
            continue;
        };

        if !parser_started {
            parser_started = true;
            held.extend(sample_batches(source.parser.start()));
        }

        if let Some(batch) = held.pop_front() {
            delivered += batch.len() as u64;
            tracing::trace!("batch of {} samples ({} delivered)", batch.len(), delivered);
            if on_samples(Delivery::Samples(batch)) == Extraction::Stop {
                control.send_replace(None);
            }
            continue;
        }

        if source.parser.is_exhausted() || source.input_done {
            tracing::debug!("{}: extraction finished, {} samples", source.origin, delivered);
            on_samples(Delivery::Finished);
            control.send_replace(None);
            return;
        }

        tokio::select! {
            biased;
            changed = requests.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            chunk = source.chunks.recv() => match source.consume(chunk) {
                Ok(events) => held.extend(sample_batches(events)),
                Err(e) => {
                    on_samples(Delivery::Failed(e));
                    control.send_replace(None);
                    return;
                }
            },
        }
    }
}

/// Sample delivery for the one selected track
pub struct TrackSampleSource {
    track: TrackInfo,
    control: Arc<watch::Sender<Option<SampleCallback>>>,
    extract_task: JoinHandle<()>,
}

impl TrackSampleSource {
    pub fn track(&self) -> &TrackInfo {
        &self.track
    }

    pub fn is_started(&self) -> bool {
        self.control.borrow().is_some()
    }

    /// Resume delivery of sample batches to `on_samples`
    pub fn start(&mut self, on_samples: SampleCallback) {
        if self.is_started() {
            return;
        }
        self.control.send_replace(Some(on_samples));
    }

    /// Suspend delivery; samples parsed meanwhile are held for the next start
    pub fn stop(&mut self) {
        if self.is_started() {
            self.control.send_replace(None);
        }
    }
}

impl Drop for TrackSampleSource {
    fn drop(&mut self) {
        self.extract_task.abort();
    }
}
