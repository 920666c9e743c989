// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment files and record framing.
//!
//! A segment is a file named `{base_offset:020}.journal` holding back-to-back records:
//!
//! ```text
//! ┌───────────┬───────────┬────────────┬────────────┬──────┬─────────┐
//! │ len (u32) │ crc (u32) │ offset u64 │ id_len u32 │  id  │ payload │
//! └───────────┴───────────┴────────────┴────────────┴──────┴─────────┘
//! ```
//!
//! `len` counts every byte after the checksum and the CRC32 covers exactly those bytes.
//! All integers are little-endian.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};

pub(crate) const SEGMENT_SUFFIX: &str = "journal";
pub(crate) const FRAME_HEADER_LEN: usize = 8;
const BODY_FIXED_LEN: usize = 12;

/// Position of one record inside its segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub offset: u64,
    pub position: u64,
    pub frame_len: u32,
}

#[derive(Debug)]
pub(crate) struct Segment {
    pub base_offset: u64,
    pub path: PathBuf,
    pub size: u64,
    pub index: Vec<IndexEntry>,
}

impl Segment {
    pub fn new(directory: &Path, base_offset: u64) -> Self {
        Self {
            base_offset,
            path: segment_path(directory, base_offset),
            size: 0,
            index: Vec::new(),
        }
    }

    pub fn last_offset(&self) -> Option<u64> {
        self.index.last().map(|e| e.offset)
    }

    /// Index entries at or after `offset`
    pub fn entries_from(&self, offset: u64) -> &[IndexEntry] {
        let start = self.index.partition_point(|e| e.offset < offset);
        &self.index[start..]
    }
}

pub(crate) fn segment_path(directory: &Path, base_offset: u64) -> PathBuf {
    directory.join(format!("{base_offset:020}.{SEGMENT_SUFFIX}"))
}

/// Parses a segment base offset out of a file name like `00000000000000000042.journal`
pub(crate) fn parse_segment_name(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != SEGMENT_SUFFIX {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

pub(crate) fn framed_len(id_len: usize, payload_len: usize) -> usize {
    FRAME_HEADER_LEN + BODY_FIXED_LEN + id_len + payload_len
}

/// Appends one framed record to `buf` and returns the frame length
pub(crate) fn encode_frame(buf: &mut BytesMut, offset: u64, id: &[u8], payload: &[u8]) -> u32 {
    let body_len = BODY_FIXED_LEN + id.len() + payload.len();
    let start = buf.len();
    buf.reserve(FRAME_HEADER_LEN + body_len);
    buf.put_u32_le(body_len as u32);
    buf.put_u32_le(0);
    buf.put_u64_le(offset);
    buf.put_u32_le(id.len() as u32);
    buf.put_slice(id);
    buf.put_slice(payload);

    let crc = crc32fast::hash(&buf[start + FRAME_HEADER_LEN..]);
    buf[start + 4..start + 8].copy_from_slice(&crc.to_le_bytes());
    (FRAME_HEADER_LEN + body_len) as u32
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Record {
        offset: u64,
        id: std::ops::Range<usize>,
        payload: std::ops::Range<usize>,
        frame_len: usize,
    },
    /// Length looked sane but the checksum or inner layout did not match
    Corrupt { frame_len: usize },
    /// Not enough bytes, or a length that cannot be right
    Torn,
}

/// Parses the frame starting at `buf[pos..]`. Ranges are relative to `buf`.
pub(crate) fn parse_frame(buf: &[u8], pos: usize, max_body_len: usize) -> Frame {
    let rest = &buf[pos.min(buf.len())..];
    if rest.len() < FRAME_HEADER_LEN {
        return Frame::Torn;
    }

    let body_len = read_u32(&rest[0..4]) as usize;
    if body_len < BODY_FIXED_LEN || body_len > max_body_len {
        return Frame::Torn;
    }
    let frame_len = FRAME_HEADER_LEN + body_len;
    if rest.len() < frame_len {
        return Frame::Torn;
    }

    let expected = read_u32(&rest[4..8]);
    let body = &rest[FRAME_HEADER_LEN..frame_len];
    if crc32fast::hash(body) != expected {
        return Frame::Corrupt { frame_len };
    }

    let offset = read_u64(&body[0..8]);
    let id_len = read_u32(&body[8..12]) as usize;
    if id_len > body_len - BODY_FIXED_LEN {
        return Frame::Corrupt { frame_len };
    }

    let id_start = pos + FRAME_HEADER_LEN + BODY_FIXED_LEN;
    Frame::Record {
        offset,
        id: id_start..id_start + id_len,
        payload: id_start + id_len..pos + frame_len,
        frame_len,
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Outcome of scanning a segment file during recovery
#[derive(Debug, Default)]
pub(crate) struct ScanResult {
    pub index: Vec<IndexEntry>,
    /// Byte length of the valid prefix; anything past it is a torn tail
    pub valid_len: u64,
    pub corrupt: u64,
    pub torn: bool,
}

/// Rebuilds the offset index of a segment from its bytes.
///
/// Records must carry strictly increasing offsets at or above `base_offset`; any
/// that do not are treated like checksum failures.
pub(crate) fn scan(data: &[u8], base_offset: u64, max_body_len: usize) -> ScanResult {
    let mut result = ScanResult::default();
    let mut pos = 0usize;
    let mut next_min = base_offset;

    while pos < data.len() {
        match parse_frame(data, pos, max_body_len) {
            Frame::Record {
                offset, frame_len, ..
            } => {
                if offset < next_min {
                    result.corrupt += 1;
                } else {
                    result.index.push(IndexEntry {
                        offset,
                        position: pos as u64,
                        frame_len: frame_len as u32,
                    });
                    next_min = offset + 1;
                }
                pos += frame_len;
            }
            Frame::Corrupt { frame_len } => {
                result.corrupt += 1;
                pos += frame_len;
            }
            Frame::Torn => {
                result.torn = true;
                break;
            }
        }
    }

    result.valid_len = pos as u64;
    result
}

/// Splits a frozen read buffer into zero-copy id and payload slices
pub(crate) fn slice_record(
    buf: &Bytes,
    id: std::ops::Range<usize>,
    payload: std::ops::Range<usize>,
) -> (Bytes, Bytes) {
    (buf.slice(id), buf.slice(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    const MAX: usize = 1024 * 1024;

    fn frames(records: &[(u64, &str, &str)]) -> BytesMut {
        let mut buf = BytesMut::new();
        for (offset, id, payload) in records {
            encode_frame(&mut buf, *offset, id.as_bytes(), payload.as_bytes());
        }
        buf
    }

    #[test]
    fn test_segment_file_names() {
        let dir = Path::new("/tmp/j");
        let path = segment_path(dir, 42);
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("00000000000000000042.journal")
        );
        assert_eq!(parse_segment_name(&path), Some(42));
        assert_eq!(parse_segment_name(Path::new("/tmp/j/committed-offset")), None);
        assert_eq!(parse_segment_name(Path::new("/tmp/j/abc.journal")), None);
    }

    #[test]
    fn test_parse_frame() {
        let buf = frames(&[(5, "id-a", "hello")]);
        assert_eq!(buf.len(), framed_len(4, 5));

        match parse_frame(&buf, 0, MAX) {
            Frame::Record {
                offset, id, payload, ..
            } => {
                assert_eq!(offset, 5);
                assert_eq!(&buf[id], b"id-a");
                assert_eq!(&buf[payload], b"hello");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let mut buf = frames(&[(0, "a", "payload")]);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(parse_frame(&buf, 0, MAX), Frame::Corrupt { .. }));
    }

    #[test]
    fn test_scan_skips_corrupt_and_stops_at_torn_tail() {
        let mut buf = frames(&[(0, "a", "one"), (1, "b", "two"), (2, "c", "three")]);
        let second = framed_len(1, 3);
        // flip a payload byte of the second record
        buf[second + FRAME_HEADER_LEN + BODY_FIXED_LEN + 2] ^= 0x01;
        let full = buf.len();
        // half-written fourth record
        let mut tail = frames(&[(3, "d", "four")]);
        tail.truncate(10);
        buf.extend_from_slice(&tail);

        let result = scan(&buf, 0, MAX);
        let offsets: Vec<u64> = result.index.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 2]);
        assert_eq!(result.corrupt, 1);
        assert!(result.torn);
        assert_eq!(result.valid_len, full as u64);
    }

    #[test]
    fn test_scan_rejects_non_increasing_offsets() {
        let buf = frames(&[(10, "a", "x"), (10, "b", "y"), (11, "c", "z")]);
        let result = scan(&buf, 10, MAX);
        let offsets: Vec<u64> = result.index.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![10, 11]);
        assert_eq!(result.corrupt, 1);
        assert!(!result.torn);
    }

    #[test]
    fn test_insane_length_is_torn() {
        let mut buf = frames(&[(0, "a", "x")]);
        buf[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(parse_frame(&buf, 0, MAX), Frame::Torn);
    }

    fn records() -> impl Strategy<Value = Vec<(Vec<u8>, Vec<u8>)>> {
        vec((vec(any::<u8>(), 0..32), vec(any::<u8>(), 0..256)), 1..40)
    }

    proptest! {
        #[test]
        fn test_scan_recovers_every_encoded_record(
            base in 0u64..1_000_000,
            records in records(),
        ) {
            let mut buf = BytesMut::new();
            let mut positions = Vec::new();
            for (i, (id, payload)) in records.iter().enumerate() {
                positions.push(buf.len());
                let frame_len = encode_frame(&mut buf, base + i as u64, id, payload);
                prop_assert_eq!(frame_len as usize, framed_len(id.len(), payload.len()));
            }

            let result = scan(&buf, base, MAX);
            prop_assert!(!result.torn);
            prop_assert_eq!(result.corrupt, 0);
            prop_assert_eq!(result.valid_len, buf.len() as u64);
            prop_assert_eq!(result.index.len(), records.len());

            for (i, (entry, (id, payload))) in result.index.iter().zip(&records).enumerate() {
                prop_assert_eq!(entry.offset, base + i as u64);
                prop_assert_eq!(entry.position, positions[i] as u64);
                match parse_frame(&buf, positions[i], MAX) {
                    Frame::Record { offset, id: id_range, payload: payload_range, .. } => {
                        prop_assert_eq!(offset, base + i as u64);
                        prop_assert_eq!(&buf[id_range], &id[..]);
                        prop_assert_eq!(&buf[payload_range], &payload[..]);
                    }
                    other => prop_assert!(false, "unexpected frame {:?}", other),
                }
            }
        }

        #[test]
        fn test_scan_cuts_a_partial_last_record(
            records in records(),
            cut in any::<prop::sample::Index>(),
        ) {
            let mut buf = BytesMut::new();
            let mut last_start = 0;
            for (i, (id, payload)) in records.iter().enumerate() {
                last_start = buf.len();
                encode_frame(&mut buf, i as u64, id, payload);
            }
            let last_len = buf.len() - last_start;
            // keep somewhere between none and all but one byte of the last record
            buf.truncate(last_start + cut.index(last_len));

            let result = scan(&buf, 0, MAX);
            prop_assert_eq!(result.torn, buf.len() > last_start);
            prop_assert_eq!(result.valid_len, last_start as u64);
            prop_assert_eq!(result.index.len(), records.len() - 1);
            prop_assert_eq!(result.corrupt, 0);
        }
    }
}
