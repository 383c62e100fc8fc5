use strata_types::BlockId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("catalog corrupt: {0}")]
    CatalogCorrupt(String),

    #[error("catalog query error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("block not found in catalog: {0}")]
    MissingBlock(BlockId),

    #[error("volume '{volume}' unavailable: {reason}")]
    VolumeUnavailable { volume: String, reason: String },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("decryption failed: wrong key or corrupted volume")]
    DecryptionFailed,

    #[error("hash mismatch for '{path}': expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("write error on '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("restore cancelled")]
    Cancelled,

    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("storage I/O error: {0}")]
    Storage(#[source] Box<ureq::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("unknown codec: '{0}'")]
    UnknownCodec(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("invalid volume format: {0}")]
    InvalidFormat(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ureq::Error> for StrataError {
    fn from(value: ureq::Error) -> Self {
        StrataError::Storage(Box::new(value))
    }
}

impl StrataError {
    /// Whether a retry with backoff might succeed.
    ///
    /// Transient network and I/O conditions qualify; anything that already
    /// passed the wire (bad hashes, failed MACs, catalog problems) does not.
    pub fn is_transient(&self) -> bool {
        match self {
            StrataError::Storage(e) => crate::storage::retry::is_retryable_http(e),
            StrataError::Io(e) => crate::storage::retry::is_retryable_io(e),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_is_not_transient() {
        assert!(!StrataError::Integrity("hash mismatch".into()).is_transient());
        assert!(!StrataError::DecryptionFailed.is_transient());
    }

    #[test]
    fn transient_io_kinds_are_transient() {
        let err = StrataError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.is_transient());

        let err = StrataError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_transient());
    }
}
