pub(super) fn default_volume_prefix() -> String {
    "strata".to_string()
}

pub(super) fn default_cipher() -> String {
    "chacha".to_string()
}

pub(super) fn default_compression() -> String {
    "zst".to_string()
}

pub(super) fn default_zstd_level() -> i32 {
    3
}

pub(super) fn default_max_concurrent_files() -> usize {
    8
}

pub(super) fn default_max_concurrent_downloads() -> usize {
    4
}

pub(super) fn default_cache_max_entries() -> usize {
    4
}

pub(super) fn default_cache_max_bytes() -> u64 {
    512 * 1024 * 1024
}

pub(super) fn default_reorder_buffer_blocks() -> usize {
    64
}

pub(super) fn default_download_timeout_secs() -> u64 {
    600
}

pub(super) fn default_decrypt_timeout_secs() -> u64 {
    300
}

pub(super) fn default_decompress_timeout_secs() -> u64 {
    60
}

pub(super) fn default_write_timeout_secs() -> u64 {
    30
}

pub(super) fn default_max_retries() -> u32 {
    5
}

pub(super) fn default_retry_delay_ms() -> u64 {
    1000
}

pub(super) fn default_retry_max_delay_ms() -> u64 {
    60_000
}
