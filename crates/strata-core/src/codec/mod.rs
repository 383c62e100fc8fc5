pub mod compress;
pub mod crypto;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, StrataError};

pub use compress::{compress, decompress, Compression};
pub use crypto::{AesGcmEngine, ChaCha20Poly1305Engine, CryptoEngine, PlaintextEngine};
pub use stream::{decrypt_stream, encrypt_stream};

type CipherFactory = fn(&[u8; 32]) -> Arc<dyn CryptoEngine>;

/// Runtime codec selection by name.
///
/// Volume filenames carry codec names as extensions; config carries them as
/// strings. Everything downstream resolves through this registry, so the
/// restore core never references a concrete codec.
pub struct CodecRegistry {
    compressions: HashMap<String, Compression>,
    ciphers: HashMap<String, CipherFactory>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            compressions: HashMap::new(),
            ciphers: HashMap::new(),
        }
    }

    /// Registry with the stock codecs: `raw`/`lz4`/`zst` compression and
    /// `chacha`/`aesgcm` ciphers.
    pub fn with_defaults(zstd_level: i32) -> Self {
        let mut reg = Self::empty();
        reg.register_compression("raw", Compression::Raw);
        reg.register_compression("lz4", Compression::Lz4);
        reg.register_compression("zst", Compression::Zstd { level: zstd_level });
        reg.register_cipher("chacha", |key| Arc::new(ChaCha20Poly1305Engine::new(key)));
        reg.register_cipher("aesgcm", |key| Arc::new(AesGcmEngine::new(key)));
        reg
    }

    pub fn register_compression(&mut self, name: &str, codec: Compression) {
        self.compressions.insert(name.to_string(), codec);
    }

    pub fn register_cipher(&mut self, name: &str, factory: CipherFactory) {
        self.ciphers.insert(name.to_string(), factory);
    }

    pub fn compression(&self, name: &str) -> Result<Compression> {
        self.compressions
            .get(name)
            .copied()
            .ok_or_else(|| StrataError::UnknownCodec(name.to_string()))
    }

    /// Instantiate a cipher engine by name.
    pub fn cipher(&self, name: &str, key: &[u8; 32]) -> Result<Arc<dyn CryptoEngine>> {
        let factory = self
            .ciphers
            .get(name)
            .ok_or_else(|| StrataError::UnknownCodec(name.to_string()))?;
        Ok(factory(key))
    }
}
