use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crossbeam_channel::Sender;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use strata_types::BlockId;
use tracing::{debug, warn};

use super::assembler::part_path_for;
use super::messages::{BlockRequest, FilePlan, PlanKind, RestoreContext, SrcMsg, Stream};
use super::RestoreOptions;
use crate::catalog::{Catalog, PlanBlock, PlanRow, FOLDER_BLOCKSET, SYMLINK_BLOCKSET};
use crate::error::{Result, StrataError};

/// Block source: stream the catalog's restore plan into `FilePlan` and
/// `BlockRequest` messages.
///
/// The scan runs twice over the same streaming query. The survey pass
/// decides every file's disposition (restore, skip, resume, fail), counts
/// the requests each job will emit, and totals how many requests touch
/// each volume. The emit pass replays the identical walk and sends the
/// messages, counting each volume's total down and flagging `evict_hint`
/// when it reaches zero. Nothing but per-file and per-volume summaries is
/// held in memory.
pub(crate) fn run_planner(
    catalog: Catalog,
    fileset_id: i64,
    dup_volumes: HashMap<i64, i64>,
    opts: &RestoreOptions,
    ctx: RestoreContext,
    src_tx: Sender<SrcMsg>,
) -> Result<()> {
    let filter = build_filter(&opts.paths)?;
    let mut planner = Planner {
        ctx: &ctx,
        opts,
        filter,
        dup_volumes,
        dispositions: HashMap::new(),
        emit_counts: HashMap::new(),
        volume_refs: HashMap::new(),
        hardlink_masters: HashMap::new(),
        master_file_ids: HashSet::new(),
    };

    planner.scan(&catalog, fileset_id, Pass::Survey, &src_tx)?;
    planner.scan(&catalog, fileset_id, Pass::Emit, &src_tx)?;
    debug!(files = planner.dispositions.len(), "plan emission complete");
    Ok(())
}

fn build_filter(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| StrataError::Config(format!("invalid pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    Ok(Some(builder.build().map_err(|e| {
        StrataError::Config(format!("invalid patterns: {e}"))
    })?))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    Survey,
    Emit,
}

#[derive(Clone)]
enum Disposition {
    /// Restore content; the first `resume_len` bytes survive from a
    /// previous run's `.part` file.
    Restore { resume_len: u64 },
    /// Destination already matches the catalog.
    Skip,
    /// Per-file failure decided at plan time.
    Fail(String),
    /// Not selected by the path filter.
    Excluded,
    Folder,
    Symlink,
    Link {
        master_file_id: i64,
        master_dest: PathBuf,
        master_ready: bool,
        master_failed: bool,
    },
}

struct MasterInfo {
    file_id: i64,
    dest: PathBuf,
}

struct Planner<'a> {
    ctx: &'a RestoreContext,
    opts: &'a RestoreOptions,
    filter: Option<GlobSet>,
    /// block_id -> lowest restorable duplicate volume id.
    dup_volumes: HashMap<i64, i64>,
    dispositions: HashMap<i64, Disposition>,
    emit_counts: HashMap<(i64, Stream), u64>,
    /// volume id -> requests not yet emitted that will touch it. Filled by
    /// the survey, drained by the emit pass; zero marks the last use.
    volume_refs: HashMap<i64, u64>,
    /// hardlink id -> first file carrying it.
    hardlink_masters: HashMap<i64, MasterInfo>,
    master_file_ids: HashSet<i64>,
}

/// Per-file accumulator while its rows stream by.
struct FileCtx {
    file_id: i64,
    rel_path: String,
    dest: PathBuf,
    metadata_id: Option<i64>,
    expected_len: u64,
    expected_hash: Option<BlockId>,
    disposition: Disposition,
    next_index: i64,
    cum_offset: u64,
    part_len: u64,
    resume_len: u64,
    resume_open: bool,
    /// Volumes this file's survey-counted requests reference; unwound if
    /// the file is demoted mid-survey.
    counted_volumes: Vec<i64>,
}

impl<'a> Planner<'a> {
    fn scan(
        &mut self,
        catalog: &Catalog,
        fileset_id: i64,
        pass: Pass,
        src_tx: &Sender<SrcMsg>,
    ) -> Result<()> {
        let mut current: Option<FileCtx> = None;

        let mut on_row = |planner: &mut Self, row: PlanRow| -> Result<()> {
            if planner.ctx.cancelled() {
                return Err(StrataError::Cancelled);
            }
            if current.as_ref().is_some_and(|c| c.file_id != row.file_id) {
                let done = current.take().expect("checked above");
                planner.finish_file(catalog, done, pass, src_tx)?;
            }
            if current.is_none() {
                current = Some(planner.start_file(&row, pass, src_tx)?);
            }
            if let Some(block) = row.block {
                let file = current.as_mut().expect("set above");
                planner.on_block(file, &block, pass, src_tx)?;
            }
            Ok(())
        };

        catalog.scan_fileset(fileset_id, |row| on_row(self, row))?;
        if let Some(done) = current.take() {
            self.finish_file(catalog, done, pass, src_tx)?;
        }
        Ok(())
    }

    fn start_file(&mut self, row: &PlanRow, pass: Pass, src_tx: &Sender<SrcMsg>) -> Result<FileCtx> {
        let mut file = FileCtx {
            file_id: row.file_id,
            rel_path: row.path.clone(),
            dest: PathBuf::new(),
            metadata_id: row.metadata_id,
            expected_len: row.length.unwrap_or(0),
            expected_hash: None,
            disposition: Disposition::Excluded,
            next_index: 0,
            cum_offset: 0,
            part_len: 0,
            resume_len: 0,
            resume_open: true,
            counted_volumes: Vec::new(),
        };

        if pass == Pass::Survey {
            file.disposition = self.decide_file(row, &mut file)?;
            self.dispositions.insert(row.file_id, file.disposition.clone());
        } else {
            file.disposition = self
                .dispositions
                .get(&row.file_id)
                .cloned()
                .unwrap_or(Disposition::Excluded);
            if let Some(rel) = sanitize_rel_path(&row.path).ok().flatten() {
                file.dest = self.opts.dest.join(rel);
            }
            if let Some(hash) = row.fullhash.as_deref() {
                file.expected_hash = BlockId::from_hex(hash);
            }
            if let Disposition::Restore { resume_len } = file.disposition {
                file.resume_len = resume_len;
                file.part_len = resume_len;
            }
            self.emit_file_start(&file, src_tx)?;
        }
        Ok(file)
    }

    /// Survey-pass decision for one file. Order matters: sanitation, then
    /// filter, then entry type, then destination state.
    fn decide_file(&mut self, row: &PlanRow, file: &mut FileCtx) -> Result<Disposition> {
        let rel = match sanitize_rel_path(&row.path) {
            Ok(Some(rel)) => rel,
            Ok(None) | Err(_) => {
                return Ok(Disposition::Fail(format!(
                    "unsafe path in catalog: '{}'",
                    row.path
                )))
            }
        };
        file.dest = self.opts.dest.join(&rel);

        if let Some(ref filter) = self.filter {
            if !filter.is_match(&row.path) {
                return Ok(Disposition::Excluded);
            }
        }

        if row.blockset_id == FOLDER_BLOCKSET {
            return Ok(Disposition::Folder);
        }
        if row.blockset_id == SYMLINK_BLOCKSET {
            return Ok(Disposition::Symlink);
        }

        // Regular file. Validate the catalog's whole-file hash up front.
        let Some(fullhash) = row.fullhash.as_deref() else {
            return Err(StrataError::CatalogCorrupt(format!(
                "file id {} has no blockset row",
                row.file_id
            )));
        };
        let Some(expected_hash) = BlockId::from_hex(fullhash) else {
            return Err(StrataError::CatalogCorrupt(format!(
                "file id {} has malformed fullhash '{fullhash}'",
                row.file_id
            )));
        };
        file.expected_hash = Some(expected_hash);

        // Hardlink members defer to their master.
        if let Some(hid) = row.hardlink_id {
            if let Some(master) = self.hardlink_masters.get(&hid) {
                let master_disp = self.dispositions.get(&master.file_id);
                return Ok(Disposition::Link {
                    master_file_id: master.file_id,
                    master_dest: master.dest.clone(),
                    master_ready: matches!(master_disp, Some(Disposition::Skip)),
                    master_failed: matches!(master_disp, Some(Disposition::Fail(_))),
                });
            }
            self.hardlink_masters.insert(
                hid,
                MasterInfo {
                    file_id: row.file_id,
                    dest: file.dest.clone(),
                },
            );
            self.master_file_ids.insert(row.file_id);
        }

        // Idempotence pre-scan: a destination that already matches the
        // catalog produces no plan, no downloads, no writes.
        match std::fs::metadata(&file.dest) {
            Ok(meta) if meta.is_file() && meta.len() == file.expected_len => {
                if file_hash_matches(&file.dest, &expected_hash) {
                    return Ok(Disposition::Skip);
                }
                if !self.opts.overwrite {
                    return Ok(Disposition::Fail(
                        "destination exists with different content (use --overwrite)".into(),
                    ));
                }
            }
            Ok(meta) if meta.is_dir() => {
                return Ok(Disposition::Fail("destination is a directory".into()));
            }
            Ok(_) if !self.opts.overwrite => {
                return Ok(Disposition::Fail(
                    "destination exists with different content (use --overwrite)".into(),
                ));
            }
            _ => {}
        }

        // A `.part` survivor from a cancelled run: whole blocks inside its
        // length are kept (sizes only; the finalize hash still verifies).
        file.part_len = std::fs::metadata(part_path_for(&file.dest))
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(Disposition::Restore { resume_len: 0 })
    }

    /// Emit-pass plan messages that precede a file's block requests.
    fn emit_file_start(&mut self, file: &FileCtx, src_tx: &Sender<SrcMsg>) -> Result<()> {
        let has_metadata = self
            .emit_counts
            .contains_key(&(file.file_id, Stream::Metadata));
        let send = |msg: SrcMsg| {
            src_tx
                .send(msg)
                .map_err(|_| StrataError::Cancelled)
        };

        match &file.disposition {
            Disposition::Excluded => {}
            Disposition::Skip => send(SrcMsg::Skipped {
                rel_path: file.rel_path.clone(),
            })?,
            Disposition::Fail(reason) => send(SrcMsg::FileFailed {
                rel_path: file.rel_path.clone(),
                reason: reason.clone(),
            })?,
            Disposition::Restore { resume_len } => {
                let block_count = self
                    .emit_counts
                    .get(&(file.file_id, Stream::Content))
                    .copied()
                    .unwrap_or(0);
                send(SrcMsg::Plan(FilePlan {
                    file_id: file.file_id,
                    stream: Stream::Content,
                    rel_path: file.rel_path.clone(),
                    kind: PlanKind::File {
                        dest: file.dest.clone(),
                        resume_len: *resume_len,
                    },
                    expected_len: file.expected_len,
                    expected_hash: file.expected_hash,
                    block_count,
                    has_metadata,
                    is_hardlink_master: self.master_file_ids.contains(&file.file_id),
                }))?;
            }
            Disposition::Folder => send(SrcMsg::Plan(FilePlan {
                file_id: file.file_id,
                stream: Stream::Content,
                rel_path: file.rel_path.clone(),
                kind: PlanKind::Folder {
                    dest: file.dest.clone(),
                },
                expected_len: 0,
                expected_hash: None,
                block_count: 0,
                has_metadata,
                is_hardlink_master: false,
            }))?,
            Disposition::Symlink => send(SrcMsg::Plan(FilePlan {
                file_id: file.file_id,
                stream: Stream::Content,
                rel_path: file.rel_path.clone(),
                kind: PlanKind::Symlink {
                    dest: file.dest.clone(),
                },
                expected_len: 0,
                expected_hash: None,
                block_count: 0,
                has_metadata,
                is_hardlink_master: false,
            }))?,
            Disposition::Link {
                master_file_id,
                master_dest,
                master_ready,
                master_failed,
            } => {
                if *master_failed {
                    send(SrcMsg::FileFailed {
                        rel_path: file.rel_path.clone(),
                        reason: "hardlink master could not be restored".into(),
                    })?;
                } else {
                    send(SrcMsg::Plan(FilePlan {
                        file_id: file.file_id,
                        stream: Stream::Content,
                        rel_path: file.rel_path.clone(),
                        kind: PlanKind::Hardlink {
                            dest: file.dest.clone(),
                            master_file_id: *master_file_id,
                            master_dest: master_dest.clone(),
                            master_ready: *master_ready,
                        },
                        expected_len: 0,
                        expected_hash: None,
                        block_count: 0,
                        has_metadata: false,
                        is_hardlink_master: false,
                    }))?;
                }
            }
        }
        Ok(())
    }

    fn on_block(
        &mut self,
        file: &mut FileCtx,
        block: &PlanBlock,
        pass: Pass,
        src_tx: &Sender<SrcMsg>,
    ) -> Result<()> {
        if block.index != file.next_index {
            return Err(StrataError::CatalogCorrupt(format!(
                "blockset for file id {} skips from index {} to {}",
                file.file_id, file.next_index, block.index
            )));
        }
        file.next_index += 1;
        let offset = file.cum_offset;
        file.cum_offset += block.size as u64;

        let restoring = matches!(file.disposition, Disposition::Restore { .. });
        if !restoring {
            return Ok(());
        }

        // Blocks wholly inside the surviving `.part` prefix are not
        // re-requested.
        if file.resume_open && file.cum_offset <= file.part_len {
            file.resume_len = file.cum_offset;
            return Ok(());
        }
        file.resume_open = false;

        let volume_id = match self.resolve_volume(block) {
            Ok(vid) => vid,
            Err(e) => {
                if pass == Pass::Survey {
                    // Demote the file and unwind the requests already
                    // counted for it.
                    self.emit_counts.remove(&(file.file_id, Stream::Content));
                    for vid in file.counted_volumes.drain(..) {
                        if let Some(n) = self.volume_refs.get_mut(&vid) {
                            *n = n.saturating_sub(1);
                        }
                    }
                    file.disposition = Disposition::Fail(e.to_string());
                    self.dispositions
                        .insert(file.file_id, file.disposition.clone());
                    return Ok(());
                }
                // The emit pass replays survey-validated decisions; a
                // disagreement means the catalog changed under us.
                return Err(StrataError::CatalogCorrupt(format!(
                    "block resolution diverged between passes: {e}"
                )));
            }
        };

        match pass {
            Pass::Survey => {
                *self
                    .emit_counts
                    .entry((file.file_id, Stream::Content))
                    .or_insert(0) += 1;
                *self.volume_refs.entry(volume_id).or_insert(0) += 1;
                file.counted_volumes.push(volume_id);
            }
            Pass::Emit => {
                let Some(block_hash) = BlockId::from_hex(&block.hash) else {
                    return Err(StrataError::CatalogCorrupt(format!(
                        "block id {} has malformed hash",
                        block.block_id
                    )));
                };
                let request = BlockRequest {
                    volume_id,
                    block_id: block.block_id,
                    block_hash,
                    block_size: block.size,
                    file_id: file.file_id,
                    stream: Stream::Content,
                    file_offset: offset,
                    evict_hint: self.take_volume_ref(volume_id),
                };
                src_tx
                    .send(SrcMsg::Request(request))
                    .map_err(|_| StrataError::Cancelled)?;
            }
        }
        Ok(())
    }

    /// Emit-pass bookkeeping: count one pending use of `volume_id` down and
    /// report whether it was the last.
    fn take_volume_ref(&mut self, volume_id: i64) -> bool {
        match self.volume_refs.get_mut(&volume_id) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        }
    }

    fn finish_file(
        &mut self,
        catalog: &Catalog,
        file: FileCtx,
        pass: Pass,
        src_tx: &Sender<SrcMsg>,
    ) -> Result<()> {
        let content_like = matches!(
            file.disposition,
            Disposition::Restore { .. } | Disposition::Skip | Disposition::Link { .. }
        );
        if content_like && file.cum_offset != file.expected_len {
            return Err(StrataError::CatalogCorrupt(format!(
                "file id {}: blockset sums to {} bytes but declares {}",
                file.file_id, file.cum_offset, file.expected_len
            )));
        }

        if pass == Pass::Survey {
            if let Disposition::Restore { .. } = file.disposition {
                self.dispositions.insert(
                    file.file_id,
                    Disposition::Restore {
                        resume_len: file.resume_len,
                    },
                );
            }
        }

        let wants_metadata = matches!(
            file.disposition,
            Disposition::Restore { .. } | Disposition::Folder | Disposition::Symlink
        );
        if let (true, Some(metadata_id)) = (wants_metadata, file.metadata_id) {
            self.plan_metadata(catalog, &file, metadata_id, pass, src_tx)?;
        }
        Ok(())
    }

    /// Metadata blobs ride the same pipeline as content, into an in-memory
    /// sink. An unrestorable metadata block degrades the file to
    /// "no attributes" instead of failing it.
    fn plan_metadata(
        &mut self,
        catalog: &Catalog,
        file: &FileCtx,
        metadata_id: i64,
        pass: Pass,
        src_tx: &Sender<SrcMsg>,
    ) -> Result<()> {
        let (length, fullhash, blocks) = catalog.metadata_blocks(metadata_id)?;
        if blocks.is_empty() {
            return Ok(());
        }
        let sum: u64 = blocks.iter().map(|b| b.size as u64).sum();
        if sum != length {
            return Err(StrataError::CatalogCorrupt(format!(
                "metadataset id {metadata_id}: blocks sum to {sum} bytes but declare {length}"
            )));
        }

        let mut resolved = Vec::with_capacity(blocks.len());
        for block in &blocks {
            match self.resolve_volume(block) {
                Ok(vid) => resolved.push((block, vid)),
                Err(e) => {
                    if pass == Pass::Survey {
                        warn!(
                            path = %file.rel_path,
                            error = %e,
                            "metadata blob unrestorable, attributes will be lost"
                        );
                    }
                    return Ok(());
                }
            }
        }

        if pass == Pass::Emit {
            src_tx
                .send(SrcMsg::Plan(FilePlan {
                    file_id: file.file_id,
                    stream: Stream::Metadata,
                    rel_path: file.rel_path.clone(),
                    kind: PlanKind::Metadata,
                    expected_len: length,
                    expected_hash: BlockId::from_hex(&fullhash),
                    block_count: resolved.len() as u64,
                    has_metadata: false,
                    is_hardlink_master: false,
                }))
                .map_err(|_| StrataError::Cancelled)?;
        }

        let mut offset = 0u64;
        for (block, volume_id) in resolved {
            match pass {
                Pass::Survey => {
                    *self
                        .emit_counts
                        .entry((file.file_id, Stream::Metadata))
                        .or_insert(0) += 1;
                    *self.volume_refs.entry(volume_id).or_insert(0) += 1;
                }
                Pass::Emit => {
                    let Some(block_hash) = BlockId::from_hex(&block.hash) else {
                        return Err(StrataError::CatalogCorrupt(format!(
                            "block id {} has malformed hash",
                            block.block_id
                        )));
                    };
                    let evict_hint = self.take_volume_ref(volume_id);
                    src_tx
                        .send(SrcMsg::Request(BlockRequest {
                            volume_id,
                            block_id: block.block_id,
                            block_hash,
                            block_size: block.size,
                            file_id: file.file_id,
                            stream: Stream::Metadata,
                            file_offset: offset,
                            evict_hint,
                        }))
                        .map_err(|_| StrataError::Cancelled)?;
                }
            }
            offset += block.size as u64;
        }
        Ok(())
    }

    /// Pick the volume serving a block: the lowest restorable id among the
    /// block's home volume and its cataloged duplicates.
    fn resolve_volume(&self, block: &PlanBlock) -> Result<i64> {
        let primary_ok = block
            .volume_state
            .map(|s| s.is_restorable())
            .unwrap_or(false);
        let duplicate = self.dup_volumes.get(&block.block_id).copied();
        match (primary_ok, duplicate) {
            (true, Some(dup)) => Ok(block.volume_id.min(dup)),
            (true, None) => Ok(block.volume_id),
            (false, Some(dup)) => Ok(dup),
            (false, None) => {
                let Some(hash) = BlockId::from_hex(&block.hash) else {
                    return Err(StrataError::CatalogCorrupt(format!(
                        "block id {} has malformed hash",
                        block.block_id
                    )));
                };
                Err(StrataError::MissingBlock(hash))
            }
        }
    }
}

/// Reject absolute paths and traversal; returns the cleaned relative path.
fn sanitize_rel_path(raw: &str) -> Result<Option<PathBuf>> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Ok(None);
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Ok(None);
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(out))
}

/// Whole-file SHA-256 comparison for the idempotence pre-scan. Any read
/// problem counts as "does not match".
fn file_hash_matches(path: &Path, expected: &BlockId) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(_) => return false,
        }
    }
    BlockId::from_digest(hasher.finalize().into()) == *expected
}
