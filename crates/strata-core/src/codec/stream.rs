use std::io::{Read, Write};

use super::crypto::CryptoEngine;
use crate::error::{Result, StrataError};

/// Plaintext bytes per encryption frame.
const FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound on an encrypted frame: plaintext + nonce + tag. Anything
/// larger in the input is corruption, not a big frame.
const MAX_FRAME_CIPHERTEXT: u32 = (FRAME_SIZE + 12 + 16 + 1024) as u32;

/// Encrypt a stream frame by frame.
///
/// Wire format per frame: `[4-byte ciphertext len LE][nonce||ciphertext||tag]`.
/// The frame counter is the AAD, so frames cannot be reordered or dropped
/// without failing the MAC chain. Returns the ciphertext byte count.
pub fn encrypt_stream(
    engine: &dyn CryptoEngine,
    src: &mut dyn Read,
    dst: &mut dyn Write,
) -> Result<u64> {
    let mut frame = vec![0u8; FRAME_SIZE];
    let mut frame_index: u64 = 0;
    let mut written: u64 = 0;

    loop {
        let n = read_up_to(src, &mut frame)?;
        if n == 0 {
            break;
        }
        let ciphertext = engine.encrypt(&frame[..n], &frame_index.to_le_bytes())?;
        dst.write_all(&(ciphertext.len() as u32).to_le_bytes())?;
        dst.write_all(&ciphertext)?;
        written += 4 + ciphertext.len() as u64;
        frame_index += 1;
        if n < frame.len() {
            break;
        }
    }
    Ok(written)
}

/// Decrypt a stream produced by [`encrypt_stream`]. Returns the plaintext
/// byte count. A failed MAC on any frame surfaces as `DecryptionFailed`.
pub fn decrypt_stream(
    engine: &dyn CryptoEngine,
    src: &mut dyn Read,
    dst: &mut dyn Write,
) -> Result<u64> {
    let mut frame_index: u64 = 0;
    let mut written: u64 = 0;
    let mut len_buf = [0u8; 4];

    loop {
        if !read_exact_or_eof(src, &mut len_buf)? {
            break; // clean EOF at a frame boundary
        }
        let ct_len = u32::from_le_bytes(len_buf);
        if ct_len == 0 || ct_len > MAX_FRAME_CIPHERTEXT {
            return Err(StrataError::InvalidFormat(format!(
                "encrypted frame length {ct_len} out of range"
            )));
        }
        let mut ciphertext = vec![0u8; ct_len as usize];
        src.read_exact(&mut ciphertext)?;
        let plaintext = engine.decrypt(&ciphertext, &frame_index.to_le_bytes())?;
        dst.write_all(&plaintext)?;
        written += plaintext.len() as u64;
        frame_index += 1;
    }
    Ok(written)
}

/// Fill as much of `buf` as the reader yields; 0 only at EOF.
fn read_up_to(src: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// `read_exact` that distinguishes clean EOF (nothing read) from truncation.
fn read_exact_or_eof(src: &mut dyn Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(StrataError::InvalidFormat(
                    "truncated encrypted frame header".into(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crypto::{ChaCha20Poly1305Engine, PlaintextEngine};

    fn roundtrip(engine: &dyn CryptoEngine, data: &[u8]) -> Vec<u8> {
        let mut encrypted = Vec::new();
        encrypt_stream(engine, &mut &data[..], &mut encrypted).unwrap();
        let mut decrypted = Vec::new();
        let n = decrypt_stream(engine, &mut &encrypted[..], &mut decrypted).unwrap();
        assert_eq!(n, data.len() as u64);
        decrypted
    }

    #[test]
    fn empty_stream_roundtrip() {
        let engine = ChaCha20Poly1305Engine::new(&[0x11; 32]);
        assert!(roundtrip(&engine, b"").is_empty());
    }

    #[test]
    fn small_stream_roundtrip() {
        let engine = ChaCha20Poly1305Engine::new(&[0x11; 32]);
        assert_eq!(roundtrip(&engine, b"short payload"), b"short payload");
    }

    #[test]
    fn multi_frame_roundtrip() {
        let engine = ChaCha20Poly1305Engine::new(&[0x11; 32]);
        let data: Vec<u8> = (0..FRAME_SIZE * 2 + 12345).map(|i| i as u8).collect();
        assert_eq!(roundtrip(&engine, &data), data);
    }

    #[test]
    fn plaintext_engine_stream() {
        let engine = PlaintextEngine;
        assert_eq!(roundtrip(&engine, b"clear"), b"clear");
    }

    #[test]
    fn reordered_frames_fail_mac() {
        let engine = ChaCha20Poly1305Engine::new(&[0x11; 32]);
        // Two frames, swapped on the wire.
        let data: Vec<u8> = (0..FRAME_SIZE + 10).map(|i| i as u8).collect();
        let mut encrypted = Vec::new();
        encrypt_stream(&engine, &mut &data[..], &mut encrypted).unwrap();

        let first_len = u32::from_le_bytes(encrypted[..4].try_into().unwrap()) as usize;
        let first = encrypted[..4 + first_len].to_vec();
        let second = encrypted[4 + first_len..].to_vec();
        let mut swapped = second;
        swapped.extend_from_slice(&first);

        let mut out = Vec::new();
        assert!(decrypt_stream(&engine, &mut &swapped[..], &mut out).is_err());
    }

    #[test]
    fn truncated_frame_rejected() {
        let engine = ChaCha20Poly1305Engine::new(&[0x11; 32]);
        let mut encrypted = Vec::new();
        encrypt_stream(&engine, &mut &b"payload"[..], &mut encrypted).unwrap();
        encrypted.truncate(encrypted.len() - 3);
        let mut out = Vec::new();
        assert!(decrypt_stream(&engine, &mut &encrypted[..], &mut out).is_err());
    }
}
