// INCREMENTAL MP4 PARSER
//
// Bytes arrive from the network in arbitrary chunks. The parser keeps the
// unconsumed tail of the stream, walks top-level boxes as soon as their
// headers are available and parses `moov` once the whole box is buffered.
// After a track is selected and extraction is started, every sample whose
// byte range is fully buffered is cut out and handed over in decode order.
//
// ════════════════════════════════════════════════════════════════════════════
// Supported: progressive (non-fragmented) ISO-BMFF / MP4 / MOV, `moov` before
// or after `mdat`, 32/64-bit box sizes, stco/co64 chunk offsets, ctts v0/v1.
// Not supported: fragmented files (moof), edit lists, stz2.
// ════════════════════════════════════════════════════════════════════════════

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Buffered bytes released in one go once consumed
const RELEASE_THRESHOLD: usize = 256 * 1024;

/// Size of a visual sample entry body before its child boxes
const VISUAL_SAMPLE_ENTRY_LEN: usize = 78;

// Top-level and container boxes
const MOOV: u32 = 0x6D6F6F76; // moov
const MOOF: u32 = 0x6D6F6F66; // moof
const MVHD: u32 = 0x6D766864; // mvhd
const TRAK: u32 = 0x7472616B; // trak
const TKHD: u32 = 0x746B6864; // tkhd
const MDIA: u32 = 0x6D646961; // mdia
const MDHD: u32 = 0x6D646864; // mdhd
const HDLR: u32 = 0x68646C72; // hdlr
const MINF: u32 = 0x6D696E66; // minf
const STBL: u32 = 0x7374626C; // stbl

// Sample table
const STSD: u32 = 0x73747364; // stsd
const STTS: u32 = 0x73747473; // stts
const CTTS: u32 = 0x63747473; // ctts (composition offsets)
const STSC: u32 = 0x73747363; // stsc
const STSZ: u32 = 0x7374737A; // stsz
const STCO: u32 = 0x7374636F; // stco
const CO64: u32 = 0x636F3634; // co64
const STSS: u32 = 0x73747373; // stss (sync samples)

// Video sample entries
const AVC1: u32 = 0x61766331; // avc1 (H.264)
const AVC3: u32 = 0x61766333; // avc3 (H.264, in-band parameter sets)
const HVC1: u32 = 0x68766331; // hvc1 (HEVC)
const HEV1: u32 = 0x68657631; // hev1 (HEVC)
const VP08: u32 = 0x76703038; // vp08
const VP09: u32 = 0x76703039; // vp09
const AV01: u32 = 0x61763031; // av01

// Decoder configuration records
const AVCC: u32 = 0x61766343; // avcC
const HVCC: u32 = 0x68766343; // hvcC
const VPCC: u32 = 0x76706343; // vpcC
const AV1C: u32 = 0x61763143; // av1C

// Handlers
const HANDLER_VIDEO: u32 = 0x76696465; // vide
const HANDLER_SOUND: u32 = 0x736F756E; // soun
const HANDLER_TEXT: u32 = 0x74657874; // text
const HANDLER_SUBTITLE: u32 = 0x73756274; // subt

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Append at offset {got} but the stream is at {expected}")]
    NonContiguous { expected: u64, got: u64 },
    #[error("Truncated '{0}' box")]
    Truncated(String),
    #[error("Invalid size {size} for '{fourcc}' box")]
    InvalidBoxSize { fourcc: String, size: u64 },
    #[error("Invalid sample table in track {track_id}: {reason}")]
    InvalidSampleTable { track_id: u32, reason: String },
    #[error("Track {0} has a zero timescale")]
    ZeroTimescale(u32),
    #[error("Unknown track {0}")]
    UnknownTrack(u32),
    #[error("Unsupported container feature: {0}")]
    Unsupported(String),
}

pub fn fourcc_to_string(code: u32) -> String {
    code.to_be_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

// ============================================================================
// Public metadata
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

/// Raw decoder configuration box (avcC, hvcC, vpcC or av1C), header included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionBox {
    pub kind: u32,
    pub data: Bytes,
}

impl DescriptionBox {
    fn header_len(&self) -> usize {
        if self.data.len() >= 4 && self.data[..4] == [0, 0, 0, 1] {
            16
        } else {
            8
        }
    }

    /// Box body without the size/type header
    pub fn payload(&self) -> Bytes {
        let start = self.header_len().min(self.data.len());
        self.data.slice(start..)
    }
}

#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: u32,
    pub kind: TrackKind,
    /// Codec string, e.g. `avc1.64001f` or `vp09.00.41.08`
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
    pub duration: u64,
    pub sample_count: u32,
    pub language: Option<String>,
    pub description: Option<DescriptionBox>,
}

#[derive(Debug, Clone)]
pub struct MovieInfo {
    pub timescale: u32,
    pub duration: u64,
    pub tracks: Vec<TrackInfo>,
}

impl MovieInfo {
    pub fn video_tracks(&self) -> impl Iterator<Item = &TrackInfo> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }

    /// Movie duration in microseconds
    pub fn duration_us(&self) -> i64 {
        if self.timescale == 0 {
            return 0;
        }
        (self.duration as i128 * 1_000_000 / self.timescale as i128) as i64
    }
}

/// One compressed access unit, in container time units
#[derive(Debug, Clone)]
pub struct Sample {
    pub track_id: u32,
    /// Position in decode order, starting at 0
    pub number: u32,
    pub is_sync: bool,
    pub dts: u64,
    pub cts: i64,
    pub duration: u32,
    pub timescale: u32,
    pub data: Bytes,
}

#[derive(Debug)]
pub enum ParserEvent {
    /// Movie header parsed; emitted exactly once
    Ready(MovieInfo),
    /// Non-empty batch of samples for the extracted track, in decode order
    Samples { track_id: u32, samples: Vec<Sample> },
}

/// Push-style container parser
pub trait ContainerParser: Send {
    /// Append the next byte range; `offset` must continue the previous append
    fn append(&mut self, offset: u64, data: &[u8]) -> Result<Vec<ParserEvent>, ParseError>;

    /// No more bytes will arrive
    fn flush(&mut self) -> Result<Vec<ParserEvent>, ParseError>;

    /// Extract only `track_id`, in batches of at most `samples_per_batch`
    fn set_extraction_options(&mut self, track_id: u32, samples_per_batch: usize) -> Result<(), ParseError>;

    /// Resume sample delivery; already buffered samples are returned at once
    fn start(&mut self) -> Vec<ParserEvent>;

    /// Suspend sample delivery
    fn stop(&mut self);

    /// True once no further samples can be produced
    fn is_exhausted(&self) -> bool;
}

// ============================================================================
// Box walking over in-memory slices
// ============================================================================

struct BoxHeader {
    kind: u32,
    /// 0 means the box extends to the end of the file
    size: u64,
    header_len: usize,
}

/// Read a box header from the start of `data`; `None` if more bytes are needed
fn peek_header(data: &[u8]) -> Result<Option<BoxHeader>, ParseError> {
    if data.len() < 8 {
        return Ok(None);
    }
    let size32 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let kind = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    let (size, header_len) = match size32 {
        1 => {
            if data.len() < 16 {
                return Ok(None);
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[8..16]);
            (u64::from_be_bytes(buf), 16)
        }
        0 => (0, 8),
        n => (n as u64, 8),
    };

    if size != 0 && size < header_len as u64 {
        return Err(ParseError::InvalidBoxSize {
            fourcc: fourcc_to_string(kind),
            size,
        });
    }

    Ok(Some(BoxHeader { kind, size, header_len }))
}

/// A fully buffered child box
struct Atom<'a> {
    kind: u32,
    header_len: usize,
    bytes: &'a [u8],
}

impl<'a> Atom<'a> {
    fn payload(&self) -> &'a [u8] {
        &self.bytes[self.header_len..]
    }
}

fn parse_atoms(data: &[u8]) -> Result<Vec<Atom<'_>>, ParseError> {
    let mut atoms = Vec::new();
    let mut pos = 0usize;

    while let Some(header) = peek_header(&data[pos..])? {
        let remaining = (data.len() - pos) as u64;
        let size = if header.size == 0 { remaining } else { header.size };
        if size > remaining {
            return Err(ParseError::Truncated(fourcc_to_string(header.kind)));
        }

        let size = size as usize;
        atoms.push(Atom {
            kind: header.kind,
            header_len: header.header_len,
            bytes: &data[pos..pos + size],
        });
        pos += size;
    }

    Ok(atoms)
}

/// Big-endian field reader for box payloads
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    kind: u32,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], kind: u32) -> Self {
        Self { data, pos: 0, kind }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.pos + n > self.data.len() {
            return Err(ParseError::Truncated(fourcc_to_string(self.kind)));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        self.take(n).map(|_| ())
    }

    fn read_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, ParseError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    /// Number of `entry_len` sized entries that can still follow
    fn capacity_for(&self, entry_len: usize) -> usize {
        (self.data.len() - self.pos) / entry_len.max(1)
    }
}

// ============================================================================
// moov parsing
// ============================================================================

#[derive(Debug, Clone, Default)]
struct SampleTable {
    sample_sizes: Vec<u32>,
    chunk_offsets: Vec<u64>,
    sample_to_chunk: Vec<(u32, u32, u32)>, // first_chunk, samples_per_chunk, sample_desc_index
    time_to_sample: Vec<(u32, u32)>,       // sample_count, sample_delta
    sync_samples: Vec<u32>,                // 1-based sample numbers
    composition_offsets: Vec<(u32, i32)>,  // sample_count, offset
}

/// Resolved location and timing of one sample
#[derive(Debug, Clone, Copy)]
struct SampleEntry {
    offset: u64,
    size: u32,
    dts: u64,
    cts: i64,
    duration: u32,
    is_sync: bool,
}

#[derive(Debug)]
struct TrackBuilder {
    id: u32,
    handler: u32,
    format: u32,
    tkhd_width: u32,
    tkhd_height: u32,
    entry_width: u32,
    entry_height: u32,
    timescale: u32,
    duration: u64,
    language: Option<String>,
    description: Option<DescriptionBox>,
    table: SampleTable,
}

impl TrackBuilder {
    fn new() -> Self {
        Self {
            id: 0,
            handler: 0,
            format: 0,
            tkhd_width: 0,
            tkhd_height: 0,
            entry_width: 0,
            entry_height: 0,
            timescale: 0,
            duration: 0,
            language: None,
            description: None,
            table: SampleTable::default(),
        }
    }
}

#[derive(Debug)]
struct ParsedTrack {
    info: TrackInfo,
    entries: Vec<SampleEntry>,
}

#[derive(Debug)]
struct Movie {
    timescale: u32,
    duration: u64,
    tracks: Vec<ParsedTrack>,
}

impl Movie {
    fn info(&self) -> MovieInfo {
        MovieInfo {
            timescale: self.timescale,
            duration: self.duration,
            tracks: self.tracks.iter().map(|t| t.info.clone()).collect(),
        }
    }
}

fn parse_moov(payload: &[u8]) -> Result<Movie, ParseError> {
    let mut movie = Movie {
        timescale: 1000,
        duration: 0,
        tracks: Vec::new(),
    };

    for atom in parse_atoms(payload)? {
        match atom.kind {
            MVHD => parse_mvhd(&mut movie, atom.payload())?,
            TRAK => movie.tracks.push(parse_trak(atom.payload())?),
            _ => {}
        }
    }

    Ok(movie)
}

fn parse_mvhd(movie: &mut Movie, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, MVHD);
    let version = c.read_u8()?;
    c.skip(3)?; // flags

    if version == 1 {
        c.skip(16)?; // creation_time, modification_time
        movie.timescale = c.read_u32()?;
        movie.duration = c.read_u64()?;
    } else {
        c.skip(8)?;
        movie.timescale = c.read_u32()?;
        movie.duration = c.read_u32()? as u64;
    }
    Ok(())
}

fn parse_trak(payload: &[u8]) -> Result<ParsedTrack, ParseError> {
    let mut track = TrackBuilder::new();

    for atom in parse_atoms(payload)? {
        match atom.kind {
            TKHD => parse_tkhd(&mut track, atom.payload())?,
            MDIA => parse_mdia(&mut track, atom.payload())?,
            _ => {}
        }
    }

    if track.timescale == 0 {
        return Err(ParseError::ZeroTimescale(track.id));
    }

    let entries = build_sample_entries(track.id, &track.table)?;
    let kind = match track.handler {
        HANDLER_VIDEO => TrackKind::Video,
        HANDLER_SOUND => TrackKind::Audio,
        HANDLER_TEXT | HANDLER_SUBTITLE => TrackKind::Subtitle,
        _ => TrackKind::Other,
    };

    let (width, height) = if track.tkhd_width > 0 && track.tkhd_height > 0 {
        (track.tkhd_width, track.tkhd_height)
    } else {
        (track.entry_width, track.entry_height)
    };

    let info = TrackInfo {
        id: track.id,
        kind,
        codec: codec_string(track.format, track.description.as_ref()),
        width,
        height,
        timescale: track.timescale,
        duration: track.duration,
        sample_count: entries.len() as u32,
        language: track.language,
        description: track.description,
    };

    Ok(ParsedTrack { info, entries })
}

fn parse_tkhd(track: &mut TrackBuilder, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, TKHD);
    let version = c.read_u8()?;
    c.skip(3)?;

    if version == 1 {
        c.skip(16)?; // creation_time, modification_time
        track.id = c.read_u32()?;
        c.skip(4)?; // reserved
        c.skip(8)?; // duration (movie timescale)
    } else {
        c.skip(8)?;
        track.id = c.read_u32()?;
        c.skip(4)?;
        c.skip(4)?;
    }

    // reserved(8) layer(2) alternate_group(2) volume(2) reserved(2) matrix(36)
    c.skip(52)?;
    track.tkhd_width = c.read_u32()? >> 16;
    track.tkhd_height = c.read_u32()? >> 16;
    Ok(())
}

fn parse_mdia(track: &mut TrackBuilder, payload: &[u8]) -> Result<(), ParseError> {
    for atom in parse_atoms(payload)? {
        match atom.kind {
            MDHD => parse_mdhd(track, atom.payload())?,
            HDLR => parse_hdlr(track, atom.payload())?,
            MINF => {
                for child in parse_atoms(atom.payload())? {
                    if child.kind == STBL {
                        parse_stbl(track, child.payload())?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_mdhd(track: &mut TrackBuilder, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, MDHD);
    let version = c.read_u8()?;
    c.skip(3)?;

    if version == 1 {
        c.skip(16)?;
        track.timescale = c.read_u32()?;
        track.duration = c.read_u64()?;
    } else {
        c.skip(8)?;
        track.timescale = c.read_u32()?;
        track.duration = c.read_u32()? as u64;
    }

    // Language (packed ISO-639-2)
    let lang = c.read_u16()?;
    if lang != 0 {
        let c1 = ((lang >> 10) & 0x1F) as u8 + 0x60;
        let c2 = ((lang >> 5) & 0x1F) as u8 + 0x60;
        let c3 = (lang & 0x1F) as u8 + 0x60;
        track.language = Some(format!("{}{}{}", c1 as char, c2 as char, c3 as char));
    }
    Ok(())
}

fn parse_hdlr(track: &mut TrackBuilder, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, HDLR);
    c.skip(4)?; // version + flags
    c.skip(4)?; // pre_defined
    track.handler = c.read_u32()?;
    Ok(())
}

fn parse_stbl(track: &mut TrackBuilder, payload: &[u8]) -> Result<(), ParseError> {
    for atom in parse_atoms(payload)? {
        let body = atom.payload();
        match atom.kind {
            STSD => parse_stsd(track, body)?,
            STTS => parse_stts(&mut track.table, body)?,
            CTTS => parse_ctts(&mut track.table, body)?,
            STSC => parse_stsc(&mut track.table, body)?,
            STSZ => parse_stsz(&mut track.table, body)?,
            STCO => parse_stco(&mut track.table, body)?,
            CO64 => parse_co64(&mut track.table, body)?,
            STSS => parse_stss(&mut track.table, body)?,
            _ => {}
        }
    }
    Ok(())
}

fn is_visual_format(format: u32) -> bool {
    matches!(format, AVC1 | AVC3 | HVC1 | HEV1 | VP08 | VP09 | AV01)
}

fn parse_stsd(track: &mut TrackBuilder, payload: &[u8]) -> Result<(), ParseError> {
    if payload.len() < 8 {
        return Err(ParseError::Truncated(fourcc_to_string(STSD)));
    }

    // version + flags, entry_count; only the first entry is used
    let entries = parse_atoms(&payload[8..])?;
    let Some(entry) = entries.first() else {
        return Ok(());
    };
    track.format = entry.kind;

    let body = entry.payload();
    if !(is_visual_format(entry.kind) || track.handler == HANDLER_VIDEO) || body.len() < VISUAL_SAMPLE_ENTRY_LEN {
        return Ok(());
    }

    let mut c = Cursor::new(body, entry.kind);
    c.skip(6)?; // reserved
    c.skip(2)?; // data_reference_index
    c.skip(16)?; // pre_defined, reserved
    track.entry_width = c.read_u16()? as u32;
    track.entry_height = c.read_u16()? as u32;

    for child in parse_atoms(&body[VISUAL_SAMPLE_ENTRY_LEN..])? {
        if matches!(child.kind, AVCC | HVCC | VPCC | AV1C) {
            track.description = Some(DescriptionBox {
                kind: child.kind,
                data: Bytes::copy_from_slice(child.bytes),
            });
            break;
        }
    }
    Ok(())
}

fn parse_stts(table: &mut SampleTable, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, STTS);
    c.skip(4)?;
    let entry_count = c.read_u32()? as usize;
    table.time_to_sample.reserve(entry_count.min(c.capacity_for(8)));

    for _ in 0..entry_count {
        let sample_count = c.read_u32()?;
        let sample_delta = c.read_u32()?;
        table.time_to_sample.push((sample_count, sample_delta));
    }
    Ok(())
}

fn parse_ctts(table: &mut SampleTable, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, CTTS);
    c.skip(4)?; // v0 offsets are unsigned but never exceed i32 in practice
    let entry_count = c.read_u32()? as usize;
    table.composition_offsets.reserve(entry_count.min(c.capacity_for(8)));

    for _ in 0..entry_count {
        let sample_count = c.read_u32()?;
        let offset = c.read_u32()? as i32;
        table.composition_offsets.push((sample_count, offset));
    }
    Ok(())
}

fn parse_stsc(table: &mut SampleTable, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, STSC);
    c.skip(4)?;
    let entry_count = c.read_u32()? as usize;
    table.sample_to_chunk.reserve(entry_count.min(c.capacity_for(12)));

    for _ in 0..entry_count {
        let first_chunk = c.read_u32()?;
        let samples_per_chunk = c.read_u32()?;
        let sample_desc_index = c.read_u32()?;
        table.sample_to_chunk.push((first_chunk, samples_per_chunk, sample_desc_index));
    }
    Ok(())
}

fn parse_stsz(table: &mut SampleTable, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, STSZ);
    c.skip(4)?;
    let sample_size = c.read_u32()?;
    let sample_count = c.read_u32()? as usize;

    if sample_size == 0 {
        table.sample_sizes.reserve(sample_count.min(c.capacity_for(4)));
        for _ in 0..sample_count {
            table.sample_sizes.push(c.read_u32()?);
        }
    } else {
        table.sample_sizes = vec![sample_size; sample_count];
    }
    Ok(())
}

fn parse_stco(table: &mut SampleTable, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, STCO);
    c.skip(4)?;
    let entry_count = c.read_u32()? as usize;
    table.chunk_offsets.reserve(entry_count.min(c.capacity_for(4)));

    for _ in 0..entry_count {
        table.chunk_offsets.push(c.read_u32()? as u64);
    }
    Ok(())
}

fn parse_co64(table: &mut SampleTable, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, CO64);
    c.skip(4)?;
    let entry_count = c.read_u32()? as usize;
    table.chunk_offsets.reserve(entry_count.min(c.capacity_for(8)));

    for _ in 0..entry_count {
        table.chunk_offsets.push(c.read_u64()?);
    }
    Ok(())
}

fn parse_stss(table: &mut SampleTable, payload: &[u8]) -> Result<(), ParseError> {
    let mut c = Cursor::new(payload, STSS);
    c.skip(4)?;
    let entry_count = c.read_u32()? as usize;
    table.sync_samples.reserve(entry_count.min(c.capacity_for(4)));

    for _ in 0..entry_count {
        table.sync_samples.push(c.read_u32()?);
    }
    Ok(())
}

/// Expand the run-length tables into one entry per sample
fn build_sample_entries(track_id: u32, table: &SampleTable) -> Result<Vec<SampleEntry>, ParseError> {
    let n = table.sample_sizes.len();
    let invalid = |reason: String| ParseError::InvalidSampleTable { track_id, reason };

    let mut durations = Vec::with_capacity(n);
    'stts: for &(count, delta) in &table.time_to_sample {
        for _ in 0..count {
            if durations.len() == n {
                break 'stts;
            }
            durations.push(delta);
        }
    }
    if durations.len() < n {
        return Err(invalid(format!("stts covers {} of {} samples", durations.len(), n)));
    }

    let mut cts_offsets = vec![0i32; n];
    let mut index = 0usize;
    'ctts: for &(count, offset) in &table.composition_offsets {
        for _ in 0..count {
            if index == n {
                break 'ctts;
            }
            cts_offsets[index] = offset;
            index += 1;
        }
    }

    let stsc = &table.sample_to_chunk;
    let stco = &table.chunk_offsets;
    let mut offsets = Vec::with_capacity(n);

    for (i, &(first_chunk, samples_per_chunk, _)) in stsc.iter().enumerate() {
        if offsets.len() == n {
            break;
        }
        let first = first_chunk
            .checked_sub(1)
            .ok_or_else(|| invalid("stsc chunk numbers start at 1".into()))? as usize;
        let next_first = match stsc.get(i + 1) {
            Some(&(next, _, _)) => next.saturating_sub(1) as usize,
            None => stco.len(),
        };
        if next_first < first || next_first > stco.len() {
            return Err(invalid(format!("stsc run {}..{} outside {} chunks", first, next_first, stco.len())));
        }

        for &chunk_offset in &stco[first..next_first] {
            let mut offset = chunk_offset;
            for _ in 0..samples_per_chunk {
                if offsets.len() == n {
                    break;
                }
                offsets.push(offset);
                offset += table.sample_sizes[offsets.len() - 1] as u64;
            }
        }
    }
    if offsets.len() < n {
        return Err(invalid(format!("chunks hold {} of {} samples", offsets.len(), n)));
    }

    // No sync table means every sample is a sync sample
    let mut sync = vec![table.sync_samples.is_empty(); n];
    for &number in &table.sync_samples {
        if number >= 1 && (number as usize) <= n {
            sync[number as usize - 1] = true;
        }
    }

    let mut entries = Vec::with_capacity(n);
    let mut dts = 0u64;
    for i in 0..n {
        entries.push(SampleEntry {
            offset: offsets[i],
            size: table.sample_sizes[i],
            dts,
            cts: dts as i64 + cts_offsets[i] as i64,
            duration: durations[i],
            is_sync: sync[i],
        });
        dts += durations[i] as u64;
    }

    Ok(entries)
}

/// Codec string in the form decoders expect (RFC 6381 style)
fn codec_string(format: u32, description: Option<&DescriptionBox>) -> String {
    let fourcc = fourcc_to_string(format);
    let Some(description) = description else {
        return fourcc;
    };
    let p = description.payload();

    match format {
        AVC1 | AVC3 if p.len() >= 4 => {
            format!("{}.{:02x}{:02x}{:02x}", fourcc, p[1], p[2], p[3])
        }
        VP08 | VP09 if p.len() >= 7 => {
            // FullBox header, then profile, level, bitDepth(4) | chroma(3) | range(1)
            format!("{}.{:02}.{:02}.{:02}", fourcc, p[4], p[5], p[6] >> 4)
        }
        AV01 if p.len() >= 3 => {
            let profile = p[1] >> 5;
            let level = p[1] & 0x1F;
            let tier = if p[2] & 0x80 != 0 { 'H' } else { 'M' };
            let depth = match (p[2] & 0x40 != 0, p[2] & 0x20 != 0) {
                (true, true) => 12,
                (true, false) => 10,
                _ => 8,
            };
            format!("{}.{}.{:02}{}.{:02}", fourcc, profile, level, tier, depth)
        }
        HVC1 | HEV1 if p.len() >= 13 => {
            let space = ["", "A", "B", "C"][(p[1] >> 6) as usize];
            let tier = if (p[1] >> 5) & 1 == 1 { 'H' } else { 'L' };
            let profile = p[1] & 0x1F;
            let compat = u32::from_be_bytes([p[2], p[3], p[4], p[5]]).reverse_bits();
            let mut codec = format!("{}.{}{}.{:x}.{}{}", fourcc, space, profile, compat, tier, p[12]);

            let constraints = &p[6..12];
            let used = constraints.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            for b in &constraints[..used] {
                codec.push_str(&format!(".{:x}", b));
            }
            codec
        }
        _ => fourcc,
    }
}

// ============================================================================
// Incremental parser
// ============================================================================

#[derive(Debug)]
struct Extraction {
    track_index: usize,
    track_id: u32,
    samples_per_batch: usize,
    next: usize,
    /// Lowest byte offset still needed by samples `i..`
    min_offset_from: Vec<u64>,
}

#[derive(Debug, Default)]
pub struct Mp4Parser {
    buffer: Vec<u8>,
    /// File offset of `buffer[0]`
    buffer_start: u64,
    /// Offset the next append must start at
    next_append: u64,
    /// File offset of the next top-level box header
    parse_pos: u64,
    /// Last top-level box runs to the end of the file
    open_ended: bool,
    movie: Option<Movie>,
    extraction: Option<Extraction>,
    started: bool,
    flushed: bool,
}

impl Mp4Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_ready(&self) -> bool {
        self.movie.is_some()
    }

    fn parse_top_level(&mut self, events: &mut Vec<ParserEvent>) -> Result<(), ParseError> {
        while !self.open_ended {
            let rel = (self.parse_pos - self.buffer_start) as usize;
            if rel >= self.buffer.len() {
                break;
            }
            let available = &self.buffer[rel..];
            let Some(header) = peek_header(available)? else {
                break;
            };

            if header.kind == MOOF {
                return Err(ParseError::Unsupported("fragmented MP4 (moof)".into()));
            }

            if header.size == 0 {
                if header.kind == MOOV {
                    return Err(ParseError::Unsupported("open-ended moov box".into()));
                }
                self.open_ended = true;
                break;
            }

            if header.kind == MOOV {
                if (available.len() as u64) < header.size {
                    break;
                }
                if self.movie.is_none() {
                    let movie = parse_moov(&available[header.header_len..header.size as usize])?;
                    tracing::debug!(
                        "moov parsed: {} track(s), timescale {}",
                        movie.tracks.len(),
                        movie.timescale
                    );
                    events.push(ParserEvent::Ready(movie.info()));
                    self.movie = Some(movie);
                }
            }

            self.parse_pos += header.size;
        }
        Ok(())
    }

    fn extract(&mut self, events: &mut Vec<ParserEvent>) {
        if !self.started {
            return;
        }
        let (Some(movie), Some(extraction)) = (&self.movie, &mut self.extraction) else {
            return;
        };

        let track = &movie.tracks[extraction.track_index];
        let buffer_end = self.buffer_start + self.buffer.len() as u64;
        let mut batch = Vec::new();

        while let Some(entry) = track.entries.get(extraction.next) {
            let end = entry.offset + entry.size as u64;
            if entry.offset < self.buffer_start || end > buffer_end {
                break;
            }
            let start = (entry.offset - self.buffer_start) as usize;

            batch.push(Sample {
                track_id: extraction.track_id,
                number: extraction.next as u32,
                is_sync: entry.is_sync,
                dts: entry.dts,
                cts: entry.cts,
                duration: entry.duration,
                timescale: track.info.timescale,
                data: Bytes::copy_from_slice(&self.buffer[start..start + entry.size as usize]),
            });
            extraction.next += 1;

            if batch.len() >= extraction.samples_per_batch {
                events.push(ParserEvent::Samples {
                    track_id: extraction.track_id,
                    samples: std::mem::take(&mut batch),
                });
            }
        }

        if !batch.is_empty() {
            events.push(ParserEvent::Samples {
                track_id: extraction.track_id,
                samples: batch,
            });
        }
    }

    /// Drop buffered bytes no pending sample or box header needs anymore
    fn release_consumed(&mut self) {
        let Some(extraction) = &self.extraction else {
            return;
        };
        let needed = extraction
            .min_offset_from
            .get(extraction.next)
            .copied()
            .unwrap_or(u64::MAX);
        let keep_from = needed.min(self.parse_pos);
        let droppable = keep_from
            .saturating_sub(self.buffer_start)
            .min(self.buffer.len() as u64) as usize;

        if droppable >= RELEASE_THRESHOLD || (droppable > 0 && droppable == self.buffer.len()) {
            self.buffer.drain(..droppable);
            self.buffer_start += droppable as u64;
        }
    }
}

impl ContainerParser for Mp4Parser {
    fn append(&mut self, offset: u64, data: &[u8]) -> Result<Vec<ParserEvent>, ParseError> {
        if offset != self.next_append {
            return Err(ParseError::NonContiguous {
                expected: self.next_append,
                got: offset,
            });
        }
        self.buffer.extend_from_slice(data);
        self.next_append += data.len() as u64;

        let mut events = Vec::new();
        self.parse_top_level(&mut events)?;
        self.extract(&mut events);
        self.release_consumed();
        Ok(events)
    }

    fn flush(&mut self) -> Result<Vec<ParserEvent>, ParseError> {
        self.flushed = true;
        let mut events = Vec::new();
        self.extract(&mut events);
        self.release_consumed();
        Ok(events)
    }

    fn set_extraction_options(&mut self, track_id: u32, samples_per_batch: usize) -> Result<(), ParseError> {
        let movie = self.movie.as_ref().ok_or(ParseError::UnknownTrack(track_id))?;
        let track_index = movie
            .tracks
            .iter()
            .position(|t| t.info.id == track_id)
            .ok_or(ParseError::UnknownTrack(track_id))?;

        let entries = &movie.tracks[track_index].entries;
        let mut min_offset_from = vec![u64::MAX; entries.len() + 1];
        for i in (0..entries.len()).rev() {
            min_offset_from[i] = entries[i].offset.min(min_offset_from[i + 1]);
        }

        tracing::debug!("extracting track {} ({} samples)", track_id, entries.len());
        self.extraction = Some(Extraction {
            track_index,
            track_id,
            samples_per_batch: samples_per_batch.max(1),
            next: 0,
            min_offset_from,
        });
        Ok(())
    }

    fn start(&mut self) -> Vec<ParserEvent> {
        self.started = true;
        let mut events = Vec::new();
        self.extract(&mut events);
        self.release_consumed();
        events
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn is_exhausted(&self) -> bool {
        match (&self.movie, &self.extraction) {
            (Some(movie), Some(extraction)) => {
                let entries = &movie.tracks[extraction.track_index].entries;
                match entries.get(extraction.next) {
                    None => true,
                    Some(entry) => {
                        self.flushed && entry.offset + entry.size as u64 > self.next_append
                    }
                }
            }
            _ => self.flushed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Mp4Fixture;

    fn collect_samples(events: Vec<ParserEvent>, out: &mut Vec<Sample>) -> Option<MovieInfo> {
        let mut info = None;
        for event in events {
            match event {
                ParserEvent::Ready(movie) => info = Some(movie),
                ParserEvent::Samples { samples, .. } => out.extend(samples),
            }
        }
        info
    }

    #[test]
    fn test_parses_movie_info() {
        let file = Mp4Fixture::avc(1000, &[0, 33, 66, 100]).build();
        let mut parser = Mp4Parser::new();
        let events = parser.append(0, &file).unwrap();

        let info = match events.into_iter().next() {
            Some(ParserEvent::Ready(info)) => info,
            other => panic!("Expected Ready, got {:?}", other),
        };
        assert_eq!(info.tracks.len(), 1);
        let track = &info.tracks[0];
        assert_eq!(track.kind, TrackKind::Video);
        assert_eq!(track.codec, "avc1.64001f");
        assert_eq!((track.width, track.height), (320, 240));
        assert_eq!(track.timescale, 1000);
        assert_eq!(track.sample_count, 4);
        assert_eq!(track.language.as_deref(), Some("und"));
        assert_eq!(track.description.as_ref().unwrap().kind, AVCC);

        let description = track.description.as_ref().unwrap();
        assert_eq!(&description.data[4..8], b"avcC");
        assert_eq!(description.payload().as_ref(), crate::test_support::AVCC_HIGH_31);
    }

    #[test]
    fn test_samples_match_table_byte_by_byte() {
        let fixture = Mp4Fixture::avc(1000, &[0, 33, 66, 100, 133]);
        let file = fixture.build();

        for chunk_size in [1usize, 7, 64, file.len()] {
            let mut parser = Mp4Parser::new();
            let mut samples = Vec::new();
            let mut offset = 0u64;
            let mut selected = false;

            for chunk in file.chunks(chunk_size) {
                let events = parser.append(offset, chunk).unwrap();
                offset += chunk.len() as u64;
                if let Some(info) = collect_samples(events, &mut samples) {
                    parser.set_extraction_options(info.tracks[0].id, 2).unwrap();
                    collect_samples(parser.start(), &mut samples);
                    selected = true;
                }
            }
            collect_samples(parser.flush().unwrap(), &mut samples);

            assert!(selected);
            assert!(parser.is_exhausted());
            assert_eq!(samples.len(), 5, "chunk size {}", chunk_size);
            for (i, sample) in samples.iter().enumerate() {
                assert_eq!(sample.number as usize, i);
                assert_eq!(sample.data.as_ref(), fixture.samples[i].data.as_slice());
                assert_eq!(sample.is_sync, fixture.samples[i].is_sync);
            }
            let cts: Vec<i64> = samples.iter().map(|s| s.cts).collect();
            assert_eq!(cts, vec![0, 33, 66, 100, 133]);
        }
    }

    #[test]
    fn test_moov_after_mdat() {
        let mut fixture = Mp4Fixture::avc(90_000, &[0, 3000, 6000]);
        fixture.moov_first = false;
        let file = fixture.build();

        let mut parser = Mp4Parser::new();
        let half = file.len() / 2;
        // mdat comes first, so nothing is known after the first half
        assert!(parser.append(0, &file[..half]).unwrap().is_empty());

        let mut samples = Vec::new();
        let info = collect_samples(parser.append(half as u64, &file[half..]).unwrap(), &mut samples).unwrap();
        parser.set_extraction_options(info.tracks[0].id, 100).unwrap();
        collect_samples(parser.start(), &mut samples);

        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2].cts, 6000);
    }

    #[test]
    fn test_stop_suspends_delivery() {
        let fixture = Mp4Fixture::avc(1000, &[0, 33, 66, 100]);
        let file = fixture.build();
        let mut parser = Mp4Parser::new();

        let mut samples = Vec::new();
        let info = collect_samples(parser.append(0, &file).unwrap(), &mut samples).unwrap();
        parser.set_extraction_options(info.tracks[0].id, 1).unwrap();
        parser.stop();
        assert!(parser.flush().unwrap().is_empty());
        assert!(!parser.is_exhausted());

        let events = parser.start();
        assert_eq!(events.len(), 4, "one event per sample with a batch size of 1");
        assert!(parser.is_exhausted());
    }

    #[test]
    fn test_consumed_bytes_are_released() {
        let mut fixture = Mp4Fixture::avc(1000, &[0, 33, 66, 100]);
        for sample in &mut fixture.samples {
            sample.data = vec![0xAB; 200_000];
        }
        let file = fixture.build();

        let mut parser = Mp4Parser::new();
        let mut samples = Vec::new();
        let mut offset = 0u64;
        for chunk in file.chunks(50_000) {
            let events = parser.append(offset, chunk).unwrap();
            offset += chunk.len() as u64;
            if let Some(info) = collect_samples(events, &mut samples) {
                parser.set_extraction_options(info.tracks[0].id, 10).unwrap();
                collect_samples(parser.start(), &mut samples);
            }
        }

        assert_eq!(samples.len(), 4);
        assert!(parser.buffered_bytes() < file.len() / 2);
    }

    #[test]
    fn test_selects_requested_track_only() {
        let mut fixture = Mp4Fixture::avc(1000, &[0, 33]);
        fixture.audio_track = true;
        let file = fixture.build();

        let mut parser = Mp4Parser::new();
        let mut samples = Vec::new();
        let info = collect_samples(parser.append(0, &file).unwrap(), &mut samples).unwrap();
        assert_eq!(info.tracks.len(), 2);
        assert_eq!(info.tracks[0].kind, TrackKind::Audio);

        let video = info.video_tracks().next().unwrap();
        parser.set_extraction_options(video.id, 10).unwrap();
        collect_samples(parser.start(), &mut samples);
        assert!(samples.iter().all(|s| s.track_id == video.id));
        assert_eq!(samples.len(), 2);

        assert!(matches!(
            parser.set_extraction_options(99, 10),
            Err(ParseError::UnknownTrack(99))
        ));
    }

    #[test]
    fn test_non_contiguous_append_rejected() {
        let file = Mp4Fixture::avc(1000, &[0]).build();
        let mut parser = Mp4Parser::new();
        parser.append(0, &file[..10]).unwrap();
        assert!(matches!(
            parser.append(20, &file[20..]),
            Err(ParseError::NonContiguous { expected: 10, got: 20 })
        ));
    }

    #[test]
    fn test_fragmented_file_rejected() {
        let mut moof = Vec::new();
        moof.extend_from_slice(&16u32.to_be_bytes());
        moof.extend_from_slice(b"moof");
        moof.extend_from_slice(&[0u8; 8]);

        let mut parser = Mp4Parser::new();
        assert!(matches!(parser.append(0, &moof), Err(ParseError::Unsupported(_))));
    }

    #[test]
    fn test_codec_strings() {
        let vpcc = DescriptionBox {
            kind: VPCC,
            data: Bytes::from_static(&[0, 0, 0, 20, b'v', b'p', b'c', b'C', 1, 0, 0, 0, 0, 41, 0x80, 1, 1, 1, 0, 0]),
        };
        assert_eq!(codec_string(VP09, Some(&vpcc)), "vp09.00.41.08");
        assert_eq!(codec_string(VP08, Some(&vpcc)), "vp08.00.41.08");

        let av1c = DescriptionBox {
            kind: AV1C,
            data: Bytes::from_static(&[0, 0, 0, 12, b'a', b'v', b'1', b'C', 0x81, 0x08, 0x0C, 0x00]),
        };
        assert_eq!(codec_string(AV01, Some(&av1c)), "av01.0.08M.08");

        assert_eq!(codec_string(HEV1, None), "hev1");
    }

    #[test]
    fn test_description_payload_strips_header() {
        let description = DescriptionBox {
            kind: AVCC,
            data: Bytes::from_static(&[0, 0, 0, 11, b'a', b'v', b'c', b'C', 1, 0x64, 0x00]),
        };
        assert_eq!(description.payload().as_ref(), &[1, 0x64, 0x00]);
    }
}
