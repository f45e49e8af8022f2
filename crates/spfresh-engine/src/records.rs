//! Posting-list record codec (§3 "Posting list"): a sequence of
//! `(Vid, version, vector-bytes)` tuples, concatenated with no separator
//! beyond the fixed-width header — dim and value type are constant for
//! the whole collection and known to every caller.

use byteorder::{ByteOrder, LittleEndian};
use spfresh_core::ids::{Vid, Version};
use spfresh_core::ValueType;

#[derive(Debug, Clone, PartialEq)]
pub struct PostingRecord {
    pub vid: Vid,
    pub version: Version,
    pub vector: Vec<f32>,
}

const HEADER_LEN: usize = 4 + 1; // vid(u32) + version(u8)

pub fn record_len(dim: usize, value_type: ValueType) -> usize {
    HEADER_LEN + dim * value_type.element_size()
}

pub fn encode(records: &[PostingRecord], value_type: ValueType) -> Vec<u8> {
    let mut out = Vec::new();
    for r in records {
        let mut header = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut header[0..4], r.vid.0);
        header[4] = r.version.0;
        out.extend_from_slice(&header);
        out.extend_from_slice(&value_type.encode(&r.vector));
    }
    out
}

pub fn decode(bytes: &[u8], dim: usize, value_type: ValueType) -> Vec<PostingRecord> {
    let stride = record_len(dim, value_type);
    if stride == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(bytes.len() / stride);
    let mut offset = 0;
    while offset + stride <= bytes.len() {
        let vid = LittleEndian::read_u32(&bytes[offset..offset + 4]);
        let version = bytes[offset + 4];
        let vec_bytes = &bytes[offset + HEADER_LEN..offset + stride];
        out.push(PostingRecord {
            vid: Vid(vid),
            version: Version(version),
            vector: value_type.decode(vec_bytes, dim),
        });
        offset += stride;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let records = vec![
            PostingRecord {
                vid: Vid(1),
                version: Version(3),
                vector: vec![1.0, 2.0, 3.0],
            },
            PostingRecord {
                vid: Vid(2),
                version: Version(0),
                vector: vec![4.0, 5.0, 6.0],
            },
        ];
        let bytes = encode(&records, ValueType::Float);
        let back = decode(&bytes, 3, ValueType::Float);
        assert_eq!(records, back);
    }

    #[test]
    fn decode_ignores_trailing_partial_record() {
        let records = vec![PostingRecord {
            vid: Vid(1),
            version: Version(0),
            vector: vec![1.0, 2.0],
        }];
        let mut bytes = encode(&records, ValueType::Float);
        bytes.push(0); // Stray trailing byte, shorter than one record.
        let back = decode(&bytes, 2, ValueType::Float);
        assert_eq!(back, records);
    }
}
