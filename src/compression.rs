//! Transparent compression for large cached payloads.
//!
//! Uses zstd compression with magic-bytes detection so decompression can
//! accept both compressed and plain data. Compression is an internal
//! representation detail of the cache; callers only ever see the original
//! bytes back (`decompress(compress(x)) == x` is a correctness invariant,
//! not merely a size optimization).

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Failed to compress data
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// Failed to decompress data
    #[error("decompression failed: {0}")]
    DecompressFailed(String),
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Compress bytes with the default level.
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    compress_bytes_with_level(data, DEFAULT_COMPRESSION_LEVEL)
}

/// Compress bytes with a custom level (1-22).
///
/// Higher levels = better compression but slower.
pub fn compress_bytes_with_level(data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
    zstd::encode_all(data, level).map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

/// Decompress bytes.
///
/// Returns the original bytes unchanged if they are not compressed, so
/// callers never need to track the representation themselves.
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if is_compressed(data) {
        zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    } else {
        Ok(data.to_vec())
    }
}
