//! Test helpers: a minimal progressive MP4 writer and a scripted decoder

use crate::decode::{DecodeError, DecoderConfig, DecoderOutput, VideoDecoder};
use crate::demuxer::{ChunkType, EncodedChunk};
use crate::frame_queue::{FramePool, VideoFrame};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// MP4 writer
// ============================================================================

/// avcC for High profile level 3.1 with one SPS and one PPS
pub const AVCC_HIGH_31: &[u8] = &[
    0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00, 0x02, 0x68, 0xEE,
];

pub struct FixtureSample {
    pub duration: u32,
    pub cts_offset: i32,
    pub is_sync: bool,
    pub data: Vec<u8>,
}

pub struct Mp4Fixture {
    pub timescale: u32,
    pub width: u16,
    pub height: u16,
    pub format: [u8; 4],
    pub config: Option<([u8; 4], Vec<u8>)>,
    pub handler: [u8; 4],
    pub samples: Vec<FixtureSample>,
    pub moov_first: bool,
    /// Prepend an empty audio track so the video track is not the first one
    pub audio_track: bool,
}

impl Mp4Fixture {
    /// H.264 track whose samples are presented at `cts` (decode order = presentation order)
    pub fn avc(timescale: u32, cts: &[u64]) -> Self {
        let fallback = (timescale / 30).max(1);
        let samples = cts
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let duration = match cts.get(i + 1) {
                    Some(&next) => (next - t) as u32,
                    None if i > 0 => (t - cts[i - 1]) as u32,
                    None => fallback,
                };
                FixtureSample {
                    duration,
                    cts_offset: 0,
                    is_sync: i % 4 == 0,
                    data: (0..16 + i).map(|b| (i * 7 + b) as u8).collect(),
                }
            })
            .collect();

        Self {
            timescale,
            width: 320,
            height: 240,
            format: *b"avc1",
            config: Some((*b"avcC", AVCC_HIGH_31.to_vec())),
            handler: *b"vide",
            samples,
            moov_first: true,
            audio_track: false,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut brands = Vec::new();
        brands.extend_from_slice(b"isom");
        brands.extend_from_slice(&0x200u32.to_be_bytes());
        brands.extend_from_slice(b"isomiso2avc1mp41");
        let ftyp = atom(b"ftyp", &brands);

        let payload: Vec<u8> = self.samples.iter().flat_map(|s| s.data.iter().copied()).collect();
        let mdat = atom(b"mdat", &payload);

        if self.moov_first {
            // stco entries are fixed size, so a sizing pass gives the final moov length
            let sizing = self.moov(0);
            let data_start = (ftyp.len() + sizing.len() + 8) as u64;
            [ftyp, self.moov(data_start), mdat].concat()
        } else {
            let data_start = (ftyp.len() + 8) as u64;
            [ftyp, mdat, self.moov(data_start)].concat()
        }
    }

    fn duration(&self) -> u32 {
        self.samples.iter().map(|s| s.duration).sum()
    }

    fn moov(&self, data_start: u64) -> Vec<u8> {
        let mut mvhd = Vec::new();
        mvhd.extend_from_slice(&[0u8; 8]); // creation, modification
        mvhd.extend_from_slice(&self.timescale.to_be_bytes());
        mvhd.extend_from_slice(&self.duration().to_be_bytes());
        mvhd.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate
        mvhd.extend_from_slice(&0x0100u16.to_be_bytes()); // volume
        mvhd.extend_from_slice(&[0u8; 10]);
        mvhd.extend_from_slice(&identity_matrix());
        mvhd.extend_from_slice(&[0u8; 24]);
        mvhd.extend_from_slice(&3u32.to_be_bytes());

        let mut body = full_atom(b"mvhd", 0, 0, &mvhd);
        let video_id = if self.audio_track {
            body.extend(self.audio_trak(1));
            2
        } else {
            1
        };
        body.extend(self.video_trak(video_id, data_start));
        atom(b"moov", &body)
    }

    fn video_trak(&self, id: u32, data_start: u64) -> Vec<u8> {
        let mut entry = Vec::new();
        entry.extend_from_slice(&[0u8; 6]);
        entry.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
        entry.extend_from_slice(&[0u8; 16]);
        entry.extend_from_slice(&self.width.to_be_bytes());
        entry.extend_from_slice(&self.height.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&[0u8; 4]);
        entry.extend_from_slice(&1u16.to_be_bytes()); // frame_count
        entry.extend_from_slice(&[0u8; 32]); // compressorname
        entry.extend_from_slice(&0x0018u16.to_be_bytes());
        entry.extend_from_slice(&0xFFFFu16.to_be_bytes());
        if let Some((kind, config)) = &self.config {
            entry.extend(atom(kind, config));
        }
        let entry = atom(&self.format, &entry);

        let n = self.samples.len();

        let mut stts_runs: Vec<(u32, u32)> = Vec::new();
        for sample in &self.samples {
            match stts_runs.last_mut() {
                Some((count, delta)) if *delta == sample.duration => *count += 1,
                _ => stts_runs.push((1, sample.duration)),
            }
        }

        let full_chunks = n / 2;
        let mut stsc = Vec::new();
        if full_chunks > 0 {
            stsc.push((1u32, 2u32));
        }
        if n % 2 == 1 {
            stsc.push((full_chunks as u32 + 1, 1));
        }

        let mut chunk_offsets = Vec::new();
        let mut offset = data_start;
        for (i, sample) in self.samples.iter().enumerate() {
            if i % 2 == 0 {
                chunk_offsets.push(offset as u32);
            }
            offset += sample.data.len() as u64;
        }

        let mut stbl = atom(b"stsd", &[&[0u8; 4][..], &1u32.to_be_bytes()[..], &entry[..]].concat());
        stbl.extend(table(b"stts", stts_runs.iter().flat_map(|&(c, d)| [c, d])));
        if self.samples.iter().any(|s| s.cts_offset != 0) {
            stbl.extend(table(
                b"ctts",
                self.samples.iter().flat_map(|s| [1, s.cts_offset as u32]),
            ));
        }
        stbl.extend(table(b"stsc", stsc.iter().flat_map(|&(first, per)| [first, per, 1])));

        let mut stsz = vec![0u8; 4];
        stsz.extend_from_slice(&0u32.to_be_bytes());
        stsz.extend_from_slice(&(n as u32).to_be_bytes());
        for sample in &self.samples {
            stsz.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
        }
        stbl.extend(atom(b"stsz", &stsz));
        stbl.extend(table(b"stco", chunk_offsets.into_iter()));

        if !self.samples.iter().all(|s| s.is_sync) {
            let sync = self
                .samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_sync)
                .map(|(i, _)| i as u32 + 1);
            stbl.extend(table(b"stss", sync));
        }

        self.trak(id, self.handler, self.width, self.height, stbl)
    }

    fn audio_trak(&self, id: u32) -> Vec<u8> {
        let entry = atom(b"mp4a", &[0u8; 28]);
        let mut stbl = atom(b"stsd", &[&[0u8; 4][..], &1u32.to_be_bytes()[..], &entry[..]].concat());
        stbl.extend(table(b"stts", std::iter::empty()));
        stbl.extend(table(b"stsc", std::iter::empty()));
        stbl.extend(atom(b"stsz", &[0u8; 12]));
        stbl.extend(table(b"stco", std::iter::empty()));
        self.trak(id, *b"soun", 0, 0, stbl)
    }

    fn trak(&self, id: u32, handler: [u8; 4], width: u16, height: u16, stbl: Vec<u8>) -> Vec<u8> {
        let mut tkhd = Vec::new();
        tkhd.extend_from_slice(&[0u8; 8]);
        tkhd.extend_from_slice(&id.to_be_bytes());
        tkhd.extend_from_slice(&[0u8; 4]);
        tkhd.extend_from_slice(&self.duration().to_be_bytes());
        tkhd.extend_from_slice(&[0u8; 16]); // reserved, layer, alternate_group, volume, reserved
        tkhd.extend_from_slice(&identity_matrix());
        tkhd.extend_from_slice(&((width as u32) << 16).to_be_bytes());
        tkhd.extend_from_slice(&((height as u32) << 16).to_be_bytes());

        let mut mdhd = Vec::new();
        mdhd.extend_from_slice(&[0u8; 8]);
        mdhd.extend_from_slice(&self.timescale.to_be_bytes());
        mdhd.extend_from_slice(&self.duration().to_be_bytes());
        mdhd.extend_from_slice(&0x55C4u16.to_be_bytes()); // "und"
        mdhd.extend_from_slice(&[0u8; 2]);

        let mut hdlr = vec![0u8; 4];
        hdlr.extend_from_slice(&handler);
        hdlr.extend_from_slice(&[0u8; 12]);
        hdlr.extend_from_slice(b"ReelHandler\0");

        let minf = atom(b"minf", &atom(b"stbl", &stbl));
        let mdia = [
            full_atom(b"mdhd", 0, 0, &mdhd),
            full_atom(b"hdlr", 0, 0, &hdlr),
            minf,
        ]
        .concat();

        let trak = [full_atom(b"tkhd", 0, 3, &tkhd), atom(b"mdia", &mdia)].concat();
        atom(b"trak", &trak)
    }
}

fn atom(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

fn full_atom(kind: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![version];
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    atom(kind, &body)
}

/// Full box holding an entry count followed by u32 words; `words` is flattened entries
fn table(kind: &[u8; 4], words: impl Iterator<Item = u32>) -> Vec<u8> {
    let words: Vec<u32> = words.collect();
    let per_entry = match kind {
        b"stts" | b"ctts" => 2,
        b"stsc" => 3,
        _ => 1,
    };
    let mut body = Vec::new();
    body.extend_from_slice(&((words.len() / per_entry) as u32).to_be_bytes());
    for word in words {
        body.extend_from_slice(&word.to_be_bytes());
    }
    full_atom(kind, 0, 0, &body)
}

fn identity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}

// ============================================================================
// Scripted decoder
// ============================================================================

#[derive(Default)]
struct ScriptState {
    output: Option<DecoderOutput>,
    queued: VecDeque<EncodedChunk>,
    decoded: Vec<EncodedChunk>,
    flushes: usize,
}

/// Decoder that turns every chunk into a 2x2 frame carrying the chunk's timestamp.
///
/// In manual mode chunks sit in the queue until [`ScriptedDecoder::drain`].
#[derive(Clone)]
pub struct ScriptedDecoder {
    state: Arc<Mutex<ScriptState>>,
    supported: Arc<HashSet<String>>,
    manual: bool,
    closed: Arc<AtomicBool>,
    pool: FramePool,
}

impl ScriptedDecoder {
    pub fn automatic(codecs: &[&str]) -> Self {
        Self::build(codecs, false)
    }

    pub fn manual(codecs: &[&str]) -> Self {
        Self::build(codecs, true)
    }

    fn build(codecs: &[&str], manual: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
            supported: Arc::new(codecs.iter().map(|c| c.to_string()).collect()),
            manual,
            closed: Arc::new(AtomicBool::new(false)),
            pool: FramePool::new(4),
        }
    }

    /// Emit frames for up to `n` queued chunks
    pub fn drain(&self, n: usize) -> usize {
        let mut emitted = 0;
        while emitted < n {
            let (chunk, output) = {
                let mut state = self.state.lock();
                let Some(chunk) = state.queued.pop_front() else {
                    break;
                };
                let Some(output) = state.output.clone() else {
                    break;
                };
                state.decoded.push(chunk.clone());
                (chunk, output)
            };
            self.emit(&chunk, &output);
            emitted += 1;
        }
        emitted
    }

    fn emit(&self, chunk: &EncodedChunk, output: &DecoderOutput) {
        let mut data = self.pool.acquire();
        data.resize(2 * 2 * 3 / 2, 128);
        let frame = VideoFrame::new(chunk.timestamp_us, chunk.duration_us, 2, 2, data, Some(self.pool.clone()));
        (output.on_frame)(frame);
        (output.on_dequeue)();
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Chunks turned into frames so far, in submission order
    pub fn decoded(&self) -> Vec<EncodedChunk> {
        self.state.lock().decoded.clone()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }
}

#[async_trait]
impl VideoDecoder for ScriptedDecoder {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn is_config_supported(&self, config: &DecoderConfig) -> bool {
        self.supported.contains(&config.codec)
    }

    fn configure(&mut self, _config: &DecoderConfig, output: DecoderOutput) -> Result<(), DecodeError> {
        self.state.lock().output = Some(output);
        Ok(())
    }

    fn decode(&mut self, chunk: EncodedChunk) -> Result<(), DecodeError> {
        if self.is_closed() {
            return Err(DecodeError::Closed);
        }
        if self.state.lock().output.is_none() {
            return Err(DecodeError::NotConfigured);
        }
        if self.state.lock().decoded.is_empty() && self.state.lock().queued.is_empty() && chunk.kind != ChunkType::Key {
            return Err(DecodeError::KeyFrameRequired);
        }
        self.state.lock().queued.push_back(chunk);
        if !self.manual {
            self.drain(usize::MAX);
        }
        Ok(())
    }

    fn decode_queue_size(&self) -> usize {
        self.queued()
    }

    async fn flush(&mut self) -> Result<(), DecodeError> {
        self.state.lock().flushes += 1;
        if !self.manual {
            self.drain(usize::MAX);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().output = None;
    }
}
