//! Optional lossless compression stage, applied before stirring unless a
//! source is marked `no_compress`. LZ4 via `lz4_flex` (pure Rust, no C
//! toolchain dependency). `decompress(compress(x)) == x` is guaranteed;
//! the reverse is not, and decompression is not used on the deposit path —
//! it exists only for diagnostic tooling.

use lz4_flex::block::{compress_prepend_size, decompress_size_prepended, DecompressError};

use crate::error::{EgdError, ErrorCategory};

pub fn compress(data: &[u8]) -> Vec<u8> {
    compress_prepend_size(data)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, EgdError> {
    decompress_size_prepended(data).map_err(|e: DecompressError| {
        EgdError::new(
            ErrorCategory::Permanent,
            "compressor",
            "LZ4_DECOMPRESS_FAILED",
            e.to_string(),
        )
    })
}
