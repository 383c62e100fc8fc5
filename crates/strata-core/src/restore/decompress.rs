use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use strata_types::BlockId;

use super::messages::{DecompressedBlock, DecompressJob, MgrMsg, ResMsg, RestoreContext};
use crate::codec;
use crate::error::{Result, StrataError};

/// Decompress worker: extract a named block from its volume, decode it, and
/// verify the plaintext hashes back to the requested block id. The cheap
/// integrity check is always on.
pub(crate) fn run_decompressor(
    ctx: RestoreContext,
    rx: Receiver<DecompressJob>,
    res_tx: Sender<ResMsg>,
    mgr_tx: Sender<MgrMsg>,
) {
    for job in rx.iter() {
        if ctx.cancelled() {
            break;
        }
        let outcome = decode_block(&ctx, &job);
        let request = job.request;

        // Release the cache refcount before delivering; the reader is no
        // longer needed even if the result send has to wait.
        let _ = mgr_tx.send(MgrMsg::BlockDone {
            volume_id: request.volume_id,
        });

        let msg = match outcome {
            Ok(bytes) => ResMsg::Block(DecompressedBlock {
                file_id: request.file_id,
                stream: request.stream,
                file_offset: request.file_offset,
                bytes,
            }),
            Err(e) => ResMsg::BlockFailed {
                file_id: request.file_id,
                stream: request.stream,
                file_offset: request.file_offset,
                reason: e.to_string(),
            },
        };
        if res_tx.send(msg).is_err() {
            break;
        }
    }
}

fn decode_block(ctx: &RestoreContext, job: &DecompressJob) -> Result<Vec<u8>> {
    let started = Instant::now();
    let request = &job.request;

    let raw = job.reader.read_entry(&request.block_hash.to_hex())?;
    let bytes = codec::decompress(&raw, Some(request.block_size as usize))?;

    if bytes.len() != request.block_size as usize {
        return Err(StrataError::Integrity(format!(
            "block {} decoded to {} bytes, expected {}",
            request.block_hash,
            bytes.len(),
            request.block_size
        )));
    }
    if BlockId::compute(&bytes) != request.block_hash {
        return Err(StrataError::Integrity(format!(
            "block {} content does not match its hash",
            request.block_hash
        )));
    }
    if started.elapsed().as_secs() > ctx.limits.decompress_timeout_secs {
        return Err(StrataError::Timeout {
            stage: "decompress",
            secs: ctx.limits.decompress_timeout_secs,
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::Arc;

    use super::super::messages::Stream;
    use crate::codec::{compress, CodecRegistry, Compression};
    use crate::config::{RestoreLimits, RetryConfig};
    use crate::testutil::MemoryBackend;
    use crate::volume::{VolumeManifest, VolumeReader, VolumeWriter};

    fn ctx(dir: &std::path::Path) -> RestoreContext {
        RestoreContext {
            backend: Arc::new(MemoryBackend::new()),
            registry: Arc::new(CodecRegistry::with_defaults(3)),
            cipher_key: None,
            tempdir: dir.to_path_buf(),
            limits: RestoreLimits::default(),
            retry: RetryConfig::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            volumes: Arc::new(HashMap::new()),
            downloads: Arc::new(AtomicU64::new(0)),
        }
    }

    fn volume_with_block(
        dir: &std::path::Path,
        payload: &[u8],
        entry_name: &str,
    ) -> Arc<VolumeReader> {
        let path = dir.join("vol");
        let mut w = VolumeWriter::create(&path, &VolumeManifest::new(1024)).unwrap();
        let encoded = compress(Compression::Lz4, payload).unwrap();
        w.add_entry(entry_name, &encoded).unwrap();
        w.finish().unwrap();
        Arc::new(VolumeReader::open(&path).unwrap())
    }

    fn request_for(payload: &[u8]) -> super::super::messages::BlockRequest {
        super::super::messages::BlockRequest {
            volume_id: 1,
            block_id: 1,
            block_hash: BlockId::compute(payload),
            block_size: payload.len() as u32,
            file_id: 7,
            stream: Stream::Content,
            file_offset: 0,
            evict_hint: false,
        }
    }

    #[test]
    fn decodes_and_verifies_a_block() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"the block payload";
        let hash = BlockId::compute(payload);
        let reader = volume_with_block(dir.path(), payload, &hash.to_hex());

        let job = DecompressJob {
            request: request_for(payload),
            reader,
        };
        let bytes = decode_block(&ctx(dir.path()), &job).unwrap();
        assert_eq!(bytes, payload);
    }

    #[test]
    fn size_mismatch_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"the block payload";
        let hash = BlockId::compute(payload);
        let reader = volume_with_block(dir.path(), payload, &hash.to_hex());

        let mut request = request_for(payload);
        request.block_size += 1;
        let job = DecompressJob { request, reader };
        assert!(matches!(
            decode_block(&ctx(dir.path()), &job),
            Err(StrataError::Integrity(_))
        ));
    }

    #[test]
    fn corrupted_entry_fails_hash_check() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"the block payload";
        let hash = BlockId::compute(payload);
        // Entry holds different bytes than the hash promises.
        let reader = volume_with_block(dir.path(), b"the block pAyload", &hash.to_hex());

        let mut request = request_for(payload);
        request.block_hash = hash;
        let job = DecompressJob { request, reader };
        assert!(matches!(
            decode_block(&ctx(dir.path()), &job),
            Err(StrataError::Integrity(_))
        ));
    }

    #[test]
    fn missing_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"present";
        let reader = volume_with_block(dir.path(), payload, "someone-else");
        let job = DecompressJob {
            request: request_for(payload),
            reader,
        };
        assert!(decode_block(&ctx(dir.path()), &job).is_err());
    }
}
