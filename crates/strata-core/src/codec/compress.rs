use std::io::Read;

use crate::error::{Result, StrataError};

const TAG_RAW: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Maximum decompressed output size. Volume blocks are far smaller than
/// this; the cap exists to stop decompression bombs.
const MAX_DECOMPRESS_SIZE: u64 = 64 * 1024 * 1024;

/// Block compression codec. Selected at runtime by registry name; each
/// encoded payload carries a 1-byte tag so decode needs no out-of-band
/// information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Raw,
    Lz4,
    Zstd { level: i32 },
}

/// Compress data and prepend the codec tag.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::Raw => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_RAW);
            out.extend_from_slice(data);
            Ok(out)
        }
        Compression::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        Compression::Zstd { level } => {
            let compressed = zstd::bulk::compress(data, level)
                .map_err(|e| StrataError::Other(format!("zstd compress: {e}")))?;
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Decompress a tagged payload.
///
/// `expected_size` is a capacity hint; it never bypasses the bomb guard.
pub fn decompress(data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(StrataError::Decompression("empty data".into()));
    }
    let tag = data[0];
    let payload = &data[1..];
    match tag {
        TAG_RAW => Ok(payload.to_vec()),
        TAG_LZ4 => {
            if payload.len() < 4 {
                return Err(StrataError::Decompression("lz4: payload too short".into()));
            }
            let uncompressed_size =
                u32::from_le_bytes(payload[..4].try_into().expect("4-byte slice")) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(StrataError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| StrataError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| StrataError::Decompression(format!("zstd init: {e}")))?;
            let hinted = expected_size.unwrap_or(0).min(MAX_DECOMPRESS_SIZE as usize);
            let mut output = Vec::with_capacity(hinted);
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| StrataError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(StrataError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        _ => Err(StrataError::UnknownCompressionTag(tag)),
    }
}
