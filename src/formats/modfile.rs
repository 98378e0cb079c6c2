//! The ProTracker-family module loader (spec §4.2): turns a raw byte buffer
//! into a [`song::Module`]. Layout is fixed by the format, not configurable:
//!
//! ```text
//! 0..20      title
//! 20..950    31 sample headers, 30 bytes each
//! 950        song length
//! 951        restart byte (ignored)
//! 952..1080  128-entry order table
//! 1080..1084 format tag
//! 1084..     pattern bank, then sample data
//! ```

use crate::bytereader::ByteReader;
use crate::error::ModError;
use crate::song::{self, Module, Pattern, Sample, ROWS_PER_PATTERN};
use crate::tracker::TableKind;

const SAMPLE_HEADER_COUNT: usize = 31;
const SAMPLE_HEADER_SIZE: usize = 30;
const TITLE_SIZE: usize = 20;
const ORDER_SIZE: usize = 128;
const HEADER_SIZE: usize = TITLE_SIZE + SAMPLE_HEADER_COUNT * SAMPLE_HEADER_SIZE + 2 + ORDER_SIZE + 4;

/// Recognized format tag, decoded to a channel count, the period table it
/// selects, and a human-readable tracker family name for `--play-mode info`.
fn parse_tag(tag: &[u8; 4]) -> Option<(u8, TableKind, &'static str)> {
    match tag {
        b"M.K." | b"M!K!" | b"FLT4" => {
            Some((4, TableKind::Legacy, "ProTracker (or generic module tracker)"))
        }
        [a, b'C', b'H', b'N'] if a.is_ascii_digit() && *a != b'0' => {
            Some((a - b'0', TableKind::Extended, "Generic module tracker"))
        }
        [a, b, b'C', b'H'] if a.is_ascii_digit() && b.is_ascii_digit() => {
            let count = (a - b'0') * 10 + (b - b'0');
            if count == 0 {
                None
            } else {
                Some((count, TableKind::Extended, "Generic module tracker"))
            }
        }
        [b'T', b'D', b'Z', x] if x.is_ascii_digit() && *x != b'0' => {
            Some((x - b'0', TableKind::Extended, "TakeTracker"))
        }
        _ => None,
    }
}

/// Parses a raw module file. `bytes` is consumed and becomes `Module::bytes`,
/// since sample offsets are recorded relative to it.
pub fn load(bytes: Vec<u8>) -> Result<Module, ModError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ModError::invalid_module(format!(
            "file too short to hold a module header: {} bytes",
            bytes.len()
        )));
    }

    let mut r = ByteReader::new(&bytes);
    let title = r.read_padded_str(TITLE_SIZE)?;

    let mut samples = Vec::with_capacity(SAMPLE_HEADER_COUNT + 1);
    for _ in 0..SAMPLE_HEADER_COUNT {
        samples.push(read_sample_header(&mut r)?);
    }

    let song_length = r.read_u8()?;
    if song_length == 0 || song_length as usize > ORDER_SIZE {
        return Err(ModError::invalid_module(format!(
            "song length {} out of range 1..=128",
            song_length
        )));
    }
    let _restart_byte = r.read_u8()?;

    let mut order = [0u8; ORDER_SIZE];
    for slot in order.iter_mut() {
        *slot = r.read_u8()?;
    }

    let tag = r.read_tag()?;
    let (channel_count, table_kind, format_name) = parse_tag(&tag).ok_or_else(|| {
        ModError::invalid_module(format!(
            "unrecognized format tag {:?}",
            String::from_utf8_lossy(&tag)
        ))
    })?;

    let pattern_count = 1 + order[..song_length as usize]
        .iter()
        .map(|&p| p as usize)
        .max()
        .unwrap_or(0);

    let mut patterns = Vec::with_capacity(pattern_count);
    for _ in 0..pattern_count {
        patterns.push(read_pattern(&mut r, channel_count as usize)?);
    }

    let mut offset = r.position();
    for sample in samples.iter_mut() {
        sample.offset = offset;
        offset += sample.length as usize;
    }
    song::Module::push_empty_sample(&mut samples);

    Ok(Module {
        title,
        samples,
        song_length,
        order,
        patterns,
        channel_count,
        table_kind,
        format_name,
        bytes,
    })
}

fn read_sample_header(r: &mut ByteReader) -> Result<Sample, ModError> {
    let name = r.read_padded_str(22)?;
    let length = r.read_u16()? as u32 * 2;
    let finetune = r.read_u8()? & 0x0f;
    let volume = r.read_u8()?.min(64);
    let loop_start = r.read_u16()? as u32 * 2;
    let loop_length = r.read_u16()? as u32 * 2;
    Ok(Sample {
        name,
        length,
        finetune,
        volume,
        loop_start,
        loop_length,
        offset: 0,
    })
}

fn read_pattern(r: &mut ByteReader, channel_count: usize) -> Result<Pattern, ModError> {
    let mut rows = Vec::with_capacity(ROWS_PER_PATTERN);
    for _ in 0..ROWS_PER_PATTERN {
        let mut cells = Vec::with_capacity(channel_count);
        for _ in 0..channel_count {
            let raw = r.read_bytes(4)?;
            cells.push(song::Cell::decode([raw[0], raw[1], raw[2], raw[3]]));
        }
        rows.push(cells);
    }
    Ok(Pattern { rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_bytes(tag: &[u8; 4], channel_count: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[950] = 1; // song length
        bytes[952] = 0; // order[0] -> pattern 0
        bytes[1080..1084].copy_from_slice(tag);
        bytes.extend(std::iter::repeat(0u8).take(ROWS_PER_PATTERN * channel_count * 4));
        bytes
    }

    #[test]
    fn loads_four_channel_mk_tag() {
        let bytes = minimal_bytes(b"M.K.", 4);
        let module = load(bytes).unwrap();
        assert_eq!(module.channel_count, 4);
        assert_eq!(module.table_kind, TableKind::Legacy);
        assert_eq!(module.patterns.len(), 1);
        assert_eq!(module.samples.len(), SAMPLE_HEADER_COUNT + 1);
    }

    #[test]
    fn loads_extended_xchn_tag() {
        let bytes = minimal_bytes(b"8CHN", 8);
        let module = load(bytes).unwrap();
        assert_eq!(module.channel_count, 8);
        assert_eq!(module.table_kind, TableKind::Extended);
    }

    #[test]
    fn loads_two_digit_xxch_tag() {
        let bytes = minimal_bytes(b"12CH", 12);
        let module = load(bytes).unwrap();
        assert_eq!(module.channel_count, 12);
    }

    #[test]
    fn rejects_unknown_tag() {
        let bytes = minimal_bytes(b"XXXX", 4);
        assert!(matches!(load(bytes), Err(ModError::InvalidModule(_))));
    }

    #[test]
    fn rejects_truncated_file() {
        let bytes = vec![0u8; 100];
        assert!(matches!(load(bytes), Err(ModError::InvalidModule(_))));
    }

    #[test]
    fn pattern_count_follows_highest_order_entry() {
        let mut bytes = minimal_bytes(b"M.K.", 4);
        bytes[950] = 2;
        bytes[952] = 0;
        bytes[953] = 3;
        // need patterns 0..=3 present
        bytes.truncate(HEADER_SIZE);
        bytes.extend(std::iter::repeat(0u8).take(ROWS_PER_PATTERN * 4 * 4 * 4));
        let module = load(bytes).unwrap();
        assert_eq!(module.patterns.len(), 4);
    }
}
