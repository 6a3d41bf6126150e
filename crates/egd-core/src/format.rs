//! On-disk persistence format for the entropy pool image.
//!
//! ```text
//! Header (32 B): magic "EGD\0" (4) | version u32 (=1) | max_entropy i64 |
//!                chunk_capacity i32 | chunk_count u32 | created_at i64 (ns since epoch)
//! Per chunk:     chunk_id i64 | chunk_size u32 | bytes (chunk_size B)
//! Footer (32 B): total_bytes i64 | checksum u64 (CRC-64-ISO over header+chunks) |
//!                magic "EGD\0" (4) | 12 B zero reserved
//! ```
//!
//! The checksum uses the `CRC_64_GO_ISO` table — the variant matching this
//! daemon's "CRC-64-ISO" naming and lineage.

use crc::{Crc, CRC_64_GO_ISO};

use crate::error::{EgdError, ErrorCategory};

pub const MAGIC: [u8; 4] = *b"EGD\0";
pub const VERSION: u32 = 1;
pub const HEADER_LEN: usize = 32;
pub const FOOTER_LEN: usize = 32;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// An in-memory representation of a persistable pool image.
pub struct PoolImage {
    pub max_entropy: i64,
    pub chunk_capacity: i32,
    pub created_at_ns: i64,
    /// `(chunk_id, bytes)` pairs, in insertion order.
    pub chunks: Vec<(i64, Vec<u8>)>,
}

impl PoolImage {
    pub fn total_bytes(&self) -> i64 {
        self.chunks.iter().map(|(_, b)| b.len() as i64).sum()
    }
}

/// Serializes `image` into the on-disk byte layout.
pub fn encode(image: &PoolImage) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&image.max_entropy.to_le_bytes());
    out.extend_from_slice(&image.chunk_capacity.to_le_bytes());
    out.extend_from_slice(&(image.chunks.len() as u32).to_le_bytes());
    out.extend_from_slice(&image.created_at_ns.to_le_bytes());
    debug_assert_eq!(out.len(), HEADER_LEN);

    for (id, bytes) in &image.chunks {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }

    let checksum = CRC64.checksum(&out);
    let total_bytes = image.total_bytes();

    out.extend_from_slice(&total_bytes.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&[0u8; 12]);

    out
}

/// Parses and validates a persisted image, rejecting any magic/version/
/// checksum/size mismatch with a typed `STORAGE_CORRUPTED` error.
pub fn decode(bytes: &[u8]) -> Result<PoolImage, EgdError> {
    fn corrupt(msg: impl Into<String>) -> EgdError {
        EgdError::new(ErrorCategory::Fatal, "pool_format", "STORAGE_CORRUPTED", msg)
    }

    if bytes.len() < HEADER_LEN + FOOTER_LEN {
        return Err(corrupt("file shorter than header+footer"));
    }

    if bytes[0..4] != MAGIC {
        return Err(corrupt("bad header magic"));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }
    let max_entropy = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let chunk_capacity = i32::from_le_bytes(bytes[16..20].try_into().unwrap());
    let chunk_count = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
    let created_at_ns = i64::from_le_bytes(bytes[24..32].try_into().unwrap());

    let footer_start = bytes.len() - FOOTER_LEN;
    let body = &bytes[HEADER_LEN..footer_start];

    let mut chunks = Vec::with_capacity(chunk_count as usize);
    let mut cursor = 0usize;
    for _ in 0..chunk_count {
        if cursor + 12 > body.len() {
            return Err(corrupt("truncated chunk record"));
        }
        let id = i64::from_le_bytes(body[cursor..cursor + 8].try_into().unwrap());
        let size = u32::from_le_bytes(body[cursor + 8..cursor + 12].try_into().unwrap()) as usize;
        cursor += 12;
        if cursor + size > body.len() {
            return Err(corrupt("chunk size exceeds remaining body"));
        }
        chunks.push((id, body[cursor..cursor + size].to_vec()));
        cursor += size;
    }
    if cursor != body.len() {
        return Err(corrupt("trailing bytes after last chunk"));
    }

    let footer = &bytes[footer_start..];
    let total_bytes = i64::from_le_bytes(footer[0..8].try_into().unwrap());
    let checksum = u64::from_le_bytes(footer[8..16].try_into().unwrap());
    if footer[16..20] != MAGIC {
        return Err(corrupt("bad footer magic"));
    }

    let expected_checksum = CRC64.checksum(&bytes[..footer_start]);
    if checksum != expected_checksum {
        return Err(corrupt("checksum mismatch"));
    }

    let computed_total: i64 = chunks.iter().map(|(_, b)| b.len() as i64).sum();
    if computed_total != total_bytes {
        return Err(corrupt("total_bytes does not match sum of chunk sizes"));
    }

    Ok(PoolImage {
        max_entropy,
        chunk_capacity,
        created_at_ns,
        chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> PoolImage {
        PoolImage {
            max_entropy: 1000,
            chunk_capacity: 64,
            created_at_ns: 123_456_789,
            chunks: vec![(0, vec![1, 2, 3]), (1, vec![4; 64])],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let image = sample_image();
        let bytes = encode(&image);
        let decoded = decode(&bytes).expect("valid image decodes");
        assert_eq!(decoded.max_entropy, image.max_entropy);
        assert_eq!(decoded.chunk_capacity, image.chunk_capacity);
        assert_eq!(decoded.chunks, image.chunks);
    }

    #[test]
    fn single_bit_flip_in_checksum_region_is_rejected() {
        let image = sample_image();
        let mut bytes = encode(&image);
        let idx = HEADER_LEN + 1;
        bytes[idx] ^= 0x01;
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.code, "STORAGE_CORRUPTED");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let image = sample_image();
        let mut bytes = encode(&image);
        bytes[0] = b'X';
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn bad_version_is_rejected() {
        let image = sample_image();
        let mut bytes = encode(&image);
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(decode(&bytes).is_err());
    }
}
