mod defaults;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use defaults::*;

/// Top-level configuration, normally loaded from `strata.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    pub catalog: CatalogConfig,
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Directory for downloaded and decrypted volume temp files.
    /// Default: the OS temp dir.
    #[serde(default)]
    pub tempdir: Option<String>,
    #[serde(default)]
    pub limits: RestoreLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Path to the local catalog database.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Remote store URL: bare path, `file://`, or `http(s)://`.
    pub url: String,
    /// Volume filename prefix.
    #[serde(default = "default_volume_prefix")]
    pub prefix: String,
    /// Bearer token for REST backends.
    pub rest_token: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Cipher name registered in the codec registry ("none" disables).
    #[serde(default = "default_cipher")]
    pub cipher: String,
    /// Hex-encoded 32-byte key. `STRATA_KEY` overrides.
    pub key_hex: Option<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            cipher: default_cipher(),
            key_hex: None,
        }
    }
}

impl EncryptionConfig {
    /// Resolve the decryption key: env var first, then config.
    /// Returns `None` when the repository is unencrypted.
    pub fn resolve_key(&self) -> Result<Option<[u8; 32]>> {
        if self.cipher == "none" {
            return Ok(None);
        }
        let hex_key = match std::env::var("STRATA_KEY") {
            Ok(v) if !v.is_empty() => v,
            _ => self.key_hex.clone().ok_or_else(|| {
                StrataError::Config(
                    "encryption enabled but no key found (set encryption.key_hex or STRATA_KEY)"
                        .into(),
                )
            })?,
        };
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| StrataError::Config(format!("invalid encryption key: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| StrataError::Config("encryption key must be 32 bytes".into()))?;
        Ok(Some(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_compression")]
    pub algorithm: String,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_compression(),
            zstd_level: default_zstd_level(),
        }
    }
}

/// Worker counts, cache bounds, and per-stage time budgets for restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreLimits {
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// 0 means one worker per CPU.
    #[serde(default)]
    pub decompress_workers: usize,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    #[serde(default = "default_reorder_buffer_blocks")]
    pub reorder_buffer_blocks: usize,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_decrypt_timeout_secs")]
    pub decrypt_timeout_secs: u64,
    #[serde(default = "default_decompress_timeout_secs")]
    pub decompress_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for RestoreLimits {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            decompress_workers: 0,
            cache_max_entries: default_cache_max_entries(),
            cache_max_bytes: default_cache_max_bytes(),
            reorder_buffer_blocks: default_reorder_buffer_blocks(),
            download_timeout_secs: default_download_timeout_secs(),
            decrypt_timeout_secs: default_decrypt_timeout_secs(),
            decompress_timeout_secs: default_decompress_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl RestoreLimits {
    pub fn resolved_decompress_workers(&self) -> usize {
        if self.decompress_workers > 0 {
            return self.decompress_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Load a config file.
pub fn load(path: &Path) -> Result<StrataConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        StrataError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    serde_yaml::from_str(&raw)
        .map_err(|e| StrataError::Config(format!("invalid config '{}': {e}", path.display())))
}

/// Resolve the config file path: explicit flag, `STRATA_CONFIG`, `./strata.yaml`,
/// then `~/.config/strata/config.yaml`.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(PathBuf::from(p));
    }
    if let Ok(p) = std::env::var("STRATA_CONFIG") {
        if !p.is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    let local = PathBuf::from("strata.yaml");
    if local.exists() {
        return Some(local);
    }
    if let Ok(home) = std::env::var("HOME") {
        let user = PathBuf::from(home).join(".config/strata/config.yaml");
        if user.exists() {
            return Some(user);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let yaml = "
catalog:
  path: /var/lib/strata/catalog.db
repository:
  url: /backups/strata
";
        let cfg: StrataConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.repository.prefix, "strata");
        assert_eq!(cfg.encryption.cipher, "chacha");
        assert_eq!(cfg.limits.max_concurrent_files, 8);
        assert_eq!(cfg.limits.max_concurrent_downloads, 4);
        assert_eq!(cfg.limits.cache_max_entries, 4);
        assert_eq!(cfg.limits.cache_max_bytes, 512 * 1024 * 1024);
        assert_eq!(cfg.repository.retry.max_retries, 5);
        assert_eq!(cfg.repository.retry.retry_delay_ms, 1000);
        assert_eq!(cfg.repository.retry.retry_max_delay_ms, 60_000);
    }

    #[test]
    fn key_resolution_rejects_short_keys() {
        let cfg = EncryptionConfig {
            cipher: "chacha".into(),
            key_hex: Some("abcd".into()),
        };
        assert!(cfg.resolve_key().is_err());
    }

    #[test]
    fn key_resolution_none_cipher() {
        let cfg = EncryptionConfig {
            cipher: "none".into(),
            key_hex: None,
        };
        assert!(cfg.resolve_key().unwrap().is_none());
    }

    #[test]
    fn key_resolution_accepts_hex_key() {
        let cfg = EncryptionConfig {
            cipher: "chacha".into(),
            key_hex: Some("aa".repeat(32)),
        };
        let key = cfg.resolve_key().unwrap().unwrap();
        assert_eq!(key, [0xAA; 32]);
    }
}
