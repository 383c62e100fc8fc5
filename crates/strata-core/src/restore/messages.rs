use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_types::BlockId;
use tempfile::TempPath;

use crate::catalog::RemoteVolume;
use crate::codec::CodecRegistry;
use crate::config::{RestoreLimits, RetryConfig};
use crate::storage::Backend;
use crate::volume::VolumeReader;

/// Which of a file's two data streams a block belongs to: the file content
/// itself, or the (tiny) metadata blob restored through the same pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Stream {
    Content,
    Metadata,
}

/// One block the restore needs, with everything required to fetch, decode,
/// verify, and place it.
#[derive(Debug, Clone)]
pub(crate) struct BlockRequest {
    pub volume_id: i64,
    #[allow(dead_code)]
    pub block_id: i64,
    pub block_hash: BlockId,
    pub block_size: u32,
    pub file_id: i64,
    pub stream: Stream,
    pub file_offset: u64,
    /// Set on the last planned request touching `volume_id`; permits the
    /// cache to drop the volume as soon as the block is decoded.
    pub evict_hint: bool,
}

/// What kind of filesystem object a plan describes.
#[derive(Debug, Clone)]
pub(crate) enum PlanKind {
    /// Regular file content written to `dest` via a `.part` sibling.
    File { dest: PathBuf, resume_len: u64 },
    /// Metadata blob assembled in memory.
    Metadata,
    Folder {
        dest: PathBuf,
    },
    Symlink {
        dest: PathBuf,
    },
    /// Later member of a hardlink group; linked to the master once the
    /// master's bytes are on disk.
    Hardlink {
        dest: PathBuf,
        master_file_id: i64,
        master_dest: PathBuf,
        /// Master already existed on disk (pre-scan skip), so the link can
        /// be created without waiting.
        master_ready: bool,
    },
}

/// Announcement of one restore job, sent before any of its block requests.
#[derive(Debug, Clone)]
pub(crate) struct FilePlan {
    pub file_id: i64,
    pub stream: Stream,
    pub rel_path: String,
    pub kind: PlanKind,
    pub expected_len: u64,
    pub expected_hash: Option<BlockId>,
    /// Number of `BlockRequest`s that will follow for this job.
    pub block_count: u64,
    /// Content-side: a metadata-stream plan for the same file follows.
    pub has_metadata: bool,
    /// Other files hardlink to this one; its completion must be tracked.
    pub is_hardlink_master: bool,
}

/// Block source output.
#[derive(Debug)]
pub(crate) enum SrcMsg {
    Plan(FilePlan),
    Request(BlockRequest),
    /// Pre-scan found the destination already matches the catalog.
    Skipped { rel_path: String },
    /// Planner-level per-file failure (missing block, destination conflict).
    FileFailed { rel_path: String, reason: String },
}

/// A decoded, verified block ready to be applied at its offset.
#[derive(Debug)]
pub(crate) struct DecompressedBlock {
    pub file_id: i64,
    pub stream: Stream,
    pub file_offset: u64,
    pub bytes: Vec<u8>,
}

/// Results flowing back into the assembler.
#[derive(Debug)]
pub(crate) enum ResMsg {
    Block(DecompressedBlock),
    BlockFailed {
        file_id: i64,
        stream: Stream,
        #[allow(dead_code)]
        file_offset: u64,
        reason: String,
    },
}

/// Volume manager input: the union of every producer that talks to it.
pub(crate) enum MgrMsg {
    Request(BlockRequest),
    VolumeReady {
        volume_id: i64,
        blob: TempPath,
        reader: Arc<VolumeReader>,
    },
    VolumeFailed {
        volume_id: i64,
        reason: String,
    },
    /// A decompression finished with the volume's reader; releases one
    /// cache refcount.
    BlockDone {
        volume_id: i64,
    },
    /// All jobs are settled; tear the cache down and stop.
    Shutdown,
}

pub(crate) struct DownloadJob {
    pub volume: RemoteVolume,
}

/// A fetched, integrity-checked, still-encrypted volume blob.
pub(crate) struct EncryptedVolume {
    pub volume_id: i64,
    pub name: String,
    pub blob: TempPath,
}

pub(crate) struct DecompressJob {
    pub request: BlockRequest,
    pub reader: Arc<VolumeReader>,
}

/// File attributes as serialized into a metadata blockset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ns: Option<i64>,
    pub link_target: Option<String>,
    pub xattrs: Option<BTreeMap<String, Vec<u8>>>,
}

/// Entry kinds the metadata stage applies attributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    File,
    Folder,
    Symlink,
}

/// Work for the metadata/link stage.
#[derive(Debug)]
pub(crate) enum MetaMsg {
    Apply {
        rel_path: String,
        path: PathBuf,
        entry: EntryKind,
        attrs: Option<FileAttrs>,
    },
    Hardlink {
        rel_path: String,
        path: PathBuf,
        master_path: PathBuf,
        attrs: Option<FileAttrs>,
        overwrite: bool,
    },
}

/// Everything a pipeline worker needs, threaded in at construction.
/// No process-wide mutable state anywhere in the restore core.
#[derive(Clone)]
pub(crate) struct RestoreContext {
    pub backend: Arc<dyn Backend>,
    pub registry: Arc<CodecRegistry>,
    pub cipher_key: Option<[u8; 32]>,
    pub tempdir: PathBuf,
    pub limits: RestoreLimits,
    pub retry: RetryConfig,
    pub cancel: Arc<AtomicBool>,
    /// Restorable volumes by id, preloaded from the catalog.
    pub volumes: Arc<HashMap<i64, RemoteVolume>>,
    /// Backend fetches performed, for the summary and the
    /// at-most-one-download property.
    pub downloads: Arc<AtomicU64>,
}

impl RestoreContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(std::sync::atomic::Ordering::Relaxed)
    }
}
