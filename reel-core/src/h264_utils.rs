//! H.264 NAL unit utilities
//!
//! MP4 samples carry length-prefixed NAL units (AVCC); OpenH264 consumes
//! start-code delimited streams (Annex B).

/// Annex B start code (4-byte version)
const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Decoder setup extracted from an avcC record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcDecoderSetup {
    /// SPS and PPS NAL units with start codes
    pub parameter_sets: Vec<u8>,
    /// Size of the length prefix in front of every NAL unit (1, 2 or 4)
    pub nal_length_size: usize,
    pub profile: u8,
    pub level: u8,
}

/// Convert AVCC format NAL units to Annex B format
///
/// AVCC: [N-byte length][NAL][N-byte length][NAL]...
/// Annex B: [0x00 0x00 0x00 0x01][NAL][0x00 0x00 0x00 0x01][NAL]...
///
/// Conversion stops at the first truncated or zero-length unit.
pub fn avcc_to_annexb(data: &[u8], nal_length_size: usize) -> Vec<u8> {
    if data.is_empty() || nal_length_size == 0 || nal_length_size > 4 {
        return data.to_vec();
    }

    let mut result = Vec::with_capacity(data.len() + 16);
    let mut offset = 0;

    while offset + nal_length_size <= data.len() {
        let nal_len = read_be_uint(&data[offset..offset + nal_length_size]);
        offset += nal_length_size;

        if nal_len == 0 || offset + nal_len > data.len() {
            break;
        }

        result.extend_from_slice(&ANNEX_B_START_CODE);
        result.extend_from_slice(&data[offset..offset + nal_len]);
        offset += nal_len;
    }

    result
}

/// Parse an avcC record (box payload, no box header)
pub fn parse_avcc(record: &[u8]) -> Option<AvcDecoderSetup> {
    // [0] version (1)  [1] profile  [2] compat  [3] level
    // [4] 0xFC | (nal_length_size - 1)  [5] 0xE0 | num_sps
    // SPS entries, num_pps, PPS entries
    if record.len() < 7 || record[0] != 1 {
        return None;
    }

    let nal_length_size = ((record[4] & 0x03) + 1) as usize;
    if nal_length_size == 3 {
        return None;
    }

    let mut parameter_sets = Vec::with_capacity(record.len() + 16);
    let mut offset = 6;

    let num_sps = (record[5] & 0x1F) as usize;
    offset = copy_parameter_sets(record, offset, num_sps, &mut parameter_sets)?;

    if offset < record.len() {
        let num_pps = record[offset] as usize;
        copy_parameter_sets(record, offset + 1, num_pps, &mut parameter_sets)?;
    }

    Some(AvcDecoderSetup {
        parameter_sets,
        nal_length_size,
        profile: record[1],
        level: record[3],
    })
}

/// Copy `count` u16-length-prefixed NAL units starting at `offset`; returns the end offset
fn copy_parameter_sets(record: &[u8], mut offset: usize, count: usize, out: &mut Vec<u8>) -> Option<usize> {
    for _ in 0..count {
        let len_bytes = record.get(offset..offset + 2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        offset += 2;

        let nal = record.get(offset..offset + len)?;
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(nal);
        offset += len;
    }
    Some(offset)
}

/// Check if data already has Annex B start codes
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 0, 1]) || data.starts_with(&[0, 0, 1])
}

/// Convert one sample to Annex B.
///
/// With an avcC record (`Some(nal_length_size)`) every sample is
/// length-prefixed, even when a prefix reads like a start code. Only in-band
/// (avc3) streams without a record are sniffed for start codes.
pub fn sample_to_annexb(data: &[u8], nal_length_size: Option<usize>) -> Vec<u8> {
    match nal_length_size {
        Some(size) => avcc_to_annexb(data, size),
        None if is_annexb(data) => data.to_vec(),
        None => avcc_to_annexb(data, 4),
    }
}

fn read_be_uint(bytes: &[u8]) -> usize {
    bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
}
