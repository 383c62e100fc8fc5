use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use super::messages::{DownloadJob, EncryptedVolume, MgrMsg, RestoreContext};
use crate::catalog::RemoteVolume;
use crate::error::{Result, StrataError};
use crate::storage::retry::retry_transient;
use crate::volume::VolumeName;

/// Download worker: fetch a volume blob into a temp file, verify size and
/// content hash against the catalog, then hand it to the decryptor.
/// Transient fetch failures retry with backoff; integrity failures do not.
pub(crate) fn run_downloader(
    ctx: RestoreContext,
    rx: Receiver<DownloadJob>,
    dec_tx: Sender<EncryptedVolume>,
    mgr_tx: Sender<MgrMsg>,
) {
    for job in rx.iter() {
        if ctx.cancelled() {
            break;
        }
        let volume_id = job.volume.id;
        let name = job.volume.name.clone();
        match fetch_volume(&ctx, &job.volume) {
            Ok(blob) => {
                if dec_tx
                    .send(EncryptedVolume {
                        volume_id,
                        name,
                        blob,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(StrataError::Cancelled) => break,
            Err(e) => {
                let _ = mgr_tx.send(MgrMsg::VolumeFailed {
                    volume_id,
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Counts bytes and hashes everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn fetch_volume(ctx: &RestoreContext, volume: &RemoteVolume) -> Result<TempPath> {
    // The filename's kind letter must agree with the catalog before any
    // bytes move.
    let parsed = VolumeName::parse(&volume.name)?;
    if parsed.kind != volume.kind {
        return Err(StrataError::Integrity(format!(
            "volume '{}' filename kind disagrees with catalog ({:?})",
            volume.name, volume.kind
        )));
    }

    let started = Instant::now();
    let budget = Duration::from_secs(ctx.limits.download_timeout_secs);

    let result = retry_transient(
        &ctx.retry,
        "volume download",
        || ctx.cancelled() || started.elapsed() > budget,
        || fetch_once(ctx, volume),
    );

    match result {
        Err(StrataError::Cancelled) if !ctx.cancelled() => Err(StrataError::Timeout {
            stage: "download",
            secs: ctx.limits.download_timeout_secs,
        }),
        other => other,
    }
}

fn fetch_once(ctx: &RestoreContext, volume: &RemoteVolume) -> Result<TempPath> {
    let file = NamedTempFile::new_in(&ctx.tempdir)?;
    let mut tee = HashingWriter {
        inner: file.as_file(),
        hasher: Sha256::new(),
        count: 0,
    };

    let found = ctx.backend.get(&volume.name, &mut tee)?;
    if found.is_none() {
        return Err(StrataError::VolumeUnavailable {
            volume: volume.name.clone(),
            reason: "not found in remote store".into(),
        });
    }
    tee.flush()?;
    ctx.downloads.fetch_add(1, Ordering::Relaxed);

    if tee.count != volume.size {
        return Err(StrataError::Integrity(format!(
            "volume '{}': got {} bytes, catalog says {}",
            volume.name, tee.count, volume.size
        )));
    }
    let digest = hex::encode(tee.hasher.finalize());
    if digest != volume.content_hash {
        return Err(StrataError::Integrity(format!(
            "volume '{}': content hash mismatch",
            volume.name
        )));
    }

    debug!(volume = %volume.name, bytes = volume.size, "volume downloaded and verified");
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::Arc;

    use crate::catalog::{VolumeKind, VolumeState};
    use crate::codec::CodecRegistry;
    use crate::config::{RestoreLimits, RetryConfig};
    use crate::testutil::MemoryBackend;

    fn fast_ctx(backend: Arc<MemoryBackend>, dir: &std::path::Path) -> RestoreContext {
        RestoreContext {
            backend,
            registry: Arc::new(CodecRegistry::with_defaults(3)),
            cipher_key: None,
            tempdir: dir.to_path_buf(),
            limits: RestoreLimits::default(),
            retry: RetryConfig {
                max_retries: 1,
                retry_delay_ms: 1,
                retry_max_delay_ms: 2,
            },
            cancel: Arc::new(AtomicBool::new(false)),
            volumes: Arc::new(HashMap::new()),
            downloads: Arc::new(AtomicU64::new(0)),
        }
    }

    fn volume_named(name: &str, data: &[u8]) -> RemoteVolume {
        RemoteVolume {
            id: 1,
            name: name.to_string(),
            size: data.len() as u64,
            content_hash: hex::encode(sha2::Sha256::digest(data)),
            kind: VolumeKind::Blocks,
            state: VolumeState::Uploaded,
            verification_count: 0,
        }
    }

    fn stock_name() -> String {
        format!("strata-b-{}-20260101T000000Z.raw", "ab".repeat(16))
    }

    #[test]
    fn fetch_verifies_size_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let name = stock_name();
        backend.insert(&name, b"volume-bytes".to_vec());

        let ctx = fast_ctx(backend, dir.path());
        let vol = volume_named(&name, b"volume-bytes");
        let blob = fetch_volume(&ctx, &vol).unwrap();
        assert_eq!(std::fs::read(&blob).unwrap(), b"volume-bytes");
        assert_eq!(ctx.downloads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tampered_volume_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let name = stock_name();
        backend.insert(&name, b"tampered!!!!".to_vec());

        let ctx = fast_ctx(backend, dir.path());
        // Catalog describes the original bytes.
        let vol = volume_named(&name, b"volume-bytes");
        match fetch_volume(&ctx, &vol) {
            Err(StrataError::Integrity(msg)) => assert!(msg.contains("hash mismatch")),
            other => panic!("expected Integrity, got {other:?}"),
        }
    }

    #[test]
    fn missing_volume_is_unavailable_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let ctx = fast_ctx(backend.clone(), dir.path());
        let vol = volume_named(&stock_name(), b"whatever");
        match fetch_volume(&ctx, &vol) {
            Err(StrataError::VolumeUnavailable { .. }) => {}
            other => panic!("expected VolumeUnavailable, got {other:?}"),
        }
        assert_eq!(backend.get_count(&vol.name), 1, "no retry for a 404");
    }

    #[test]
    fn kind_letter_mismatch_is_rejected_before_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let name = format!("strata-i-{}-20260101T000000Z.raw", "ab".repeat(16));
        backend.insert(&name, b"x".to_vec());
        let ctx = fast_ctx(backend.clone(), dir.path());
        let vol = volume_named(&name, b"x"); // catalog says Blocks, name says index
        assert!(fetch_volume(&ctx, &vol).is_err());
        assert_eq!(backend.get_count(&name), 0);
    }
}
