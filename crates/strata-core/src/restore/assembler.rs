use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender};
use sha2::{Digest, Sha256};
use strata_types::BlockId;
use tracing::{debug, warn};

use super::messages::{
    DecompressedBlock, EntryKind, FileAttrs, FilePlan, MetaMsg, MgrMsg, PlanKind, ResMsg,
    RestoreContext, SrcMsg, Stream,
};
use crate::error::StrataError;

#[derive(Debug, Default)]
pub(crate) struct AsmStats {
    pub restored: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes_written: u64,
    pub warnings: u64,
    /// First per-file failure, kept for `--strict` escalation.
    pub first_error: Option<StrataError>,
}

/// Where a job's bytes land.
enum Sink {
    Disk {
        file: File,
        part_path: PathBuf,
        dest: PathBuf,
    },
    Memory(Vec<u8>),
    /// Opening the output failed; arriving blocks are dropped.
    Discard,
}

/// Per-job assembly state: one per content file and one per metadata blob.
struct FileJob {
    rel_path: String,
    sink: Sink,
    hasher: Sha256,
    expected_len: u64,
    expected_hash: Option<BlockId>,
    /// Contiguous prefix already written and hashed.
    write_pos: u64,
    /// Out-of-order blocks parked until the gap before them fills.
    pending: BTreeMap<u64, Vec<u8>>,
    /// Requests not yet resolved (applied or failed).
    outstanding: u64,
    failed: Option<String>,
}

/// What a file is waiting on before its metadata can be applied.
enum StateKind {
    File {
        dest: PathBuf,
    },
    Folder {
        dest: PathBuf,
    },
    Symlink {
        dest: PathBuf,
    },
    Hardlink {
        dest: PathBuf,
        master_dest: PathBuf,
    },
}

/// Coordination record joining a file's content outcome with its decoded
/// attributes; emitted downstream exactly once when both are settled.
struct FileState {
    rel_path: String,
    kind: StateKind,
    expects_attrs: bool,
    attrs: Option<FileAttrs>,
    attrs_done: bool,
    content_done: bool,
    content_ok: bool,
    is_master: bool,
    sent: bool,
}

pub(crate) struct Assembler {
    ctx: RestoreContext,
    strict: bool,
    overwrite: bool,
    mgr_tx: Sender<MgrMsg>,
    meta_tx: Sender<MetaMsg>,
    jobs: HashMap<(i64, Stream), FileJob>,
    states: HashMap<i64, FileState>,
    /// Hardlink masters that finished successfully, by file id.
    masters_done: HashMap<i64, PathBuf>,
    masters_failed: std::collections::HashSet<i64>,
    /// Members waiting for their master, keyed by master file id.
    pending_links: HashMap<i64, Vec<i64>>,
    active_content: usize,
    /// Requests announced by plans but not yet routed to the manager.
    open_requests: u64,
    stats: AsmStats,
}

impl Assembler {
    pub fn new(
        ctx: RestoreContext,
        strict: bool,
        overwrite: bool,
        mgr_tx: Sender<MgrMsg>,
        meta_tx: Sender<MetaMsg>,
    ) -> Self {
        Self {
            ctx,
            strict,
            overwrite,
            mgr_tx,
            meta_tx,
            jobs: HashMap::new(),
            states: HashMap::new(),
            masters_done: HashMap::new(),
            masters_failed: std::collections::HashSet::new(),
            pending_links: HashMap::new(),
            active_content: 0,
            open_requests: 0,
            stats: AsmStats::default(),
        }
    }

    /// Main loop. The source is only drained while a file is mid-stream or
    /// the concurrent-file cap has room, which is what throttles the
    /// planner; results are always drained, which is what keeps the rest of
    /// the pipeline from ever wedging on a full channel.
    pub fn run(mut self, src_rx: Receiver<SrcMsg>, res_rx: Receiver<ResMsg>) -> AsmStats {
        let max_files = self.ctx.limits.max_concurrent_files.max(1);
        let mut source_open = true;
        let mut res_open = true;

        loop {
            if self.ctx.cancelled() {
                break;
            }
            let want_source =
                source_open && (self.open_requests > 0 || self.active_content < max_files);

            if want_source && res_open {
                select! {
                    recv(src_rx) -> msg => match msg {
                        Ok(m) => self.on_source(m),
                        Err(_) => source_open = false,
                    },
                    recv(res_rx) -> msg => match msg {
                        Ok(m) => self.on_result(m),
                        Err(_) => res_open = false,
                    },
                    default(Duration::from_millis(200)) => {}
                }
            } else if res_open {
                match res_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(m) => self.on_result(m),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => res_open = false,
                }
            } else if source_open {
                match src_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(m) => self.on_source(m),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => source_open = false,
                }
            } else {
                break;
            }

            if !source_open && self.jobs.is_empty() {
                break;
            }
        }

        let _ = self.mgr_tx.send(MgrMsg::Shutdown);
        self.stats
    }

    fn on_source(&mut self, msg: SrcMsg) {
        match msg {
            SrcMsg::Plan(plan) => self.on_plan(plan),
            SrcMsg::Request(request) => {
                self.open_requests = self.open_requests.saturating_sub(1);
                let _ = self.mgr_tx.send(MgrMsg::Request(request));
            }
            SrcMsg::Skipped { rel_path } => {
                debug!(path = %rel_path, "already restored, skipping");
                self.stats.skipped += 1;
            }
            SrcMsg::FileFailed { rel_path, reason } => {
                warn!(path = %rel_path, reason, "file cannot be restored");
                self.note_failure(&rel_path, &reason);
            }
        }
    }

    fn on_plan(&mut self, plan: FilePlan) {
        self.open_requests += plan.block_count;
        match plan.stream {
            Stream::Metadata => {
                let job = FileJob {
                    rel_path: plan.rel_path,
                    sink: Sink::Memory(Vec::with_capacity(plan.expected_len as usize)),
                    hasher: Sha256::new(),
                    expected_len: plan.expected_len,
                    expected_hash: plan.expected_hash,
                    write_pos: 0,
                    pending: BTreeMap::new(),
                    outstanding: plan.block_count,
                    failed: None,
                };
                let key = (plan.file_id, Stream::Metadata);
                self.jobs.insert(key, job);
                self.try_finalize(key);
            }
            Stream::Content => self.on_content_plan(plan),
        }
    }

    fn on_content_plan(&mut self, plan: FilePlan) {
        let file_id = plan.file_id;
        let mut state = FileState {
            rel_path: plan.rel_path.clone(),
            kind: StateKind::File {
                dest: PathBuf::new(),
            },
            expects_attrs: plan.has_metadata,
            attrs: None,
            attrs_done: false,
            content_done: false,
            content_ok: false,
            is_master: plan.is_hardlink_master,
            sent: false,
        };

        match plan.kind {
            PlanKind::File { ref dest, resume_len } => {
                state.kind = StateKind::File { dest: dest.clone() };
                self.states.insert(file_id, state);
                self.active_content += 1;

                let job = match open_disk_job(&plan, &dest, resume_len) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(path = %plan.rel_path, error = %e, "cannot open output file");
                        FileJob {
                            rel_path: plan.rel_path.clone(),
                            sink: Sink::Discard,
                            hasher: Sha256::new(),
                            expected_len: plan.expected_len,
                            expected_hash: plan.expected_hash,
                            write_pos: 0,
                            pending: BTreeMap::new(),
                            outstanding: plan.block_count,
                            failed: Some(e.to_string()),
                        }
                    }
                };
                let key = (file_id, Stream::Content);
                self.jobs.insert(key, job);
                self.try_finalize(key);
            }
            PlanKind::Folder { dest } => {
                state.kind = StateKind::Folder { dest };
                state.content_done = true;
                state.content_ok = true;
                self.states.insert(file_id, state);
                self.maybe_emit(file_id);
            }
            PlanKind::Symlink { dest } => {
                state.kind = StateKind::Symlink { dest };
                state.content_done = true;
                state.content_ok = true;
                self.states.insert(file_id, state);
                self.maybe_emit(file_id);
            }
            PlanKind::Hardlink {
                dest,
                master_file_id,
                master_dest,
                master_ready,
            } => {
                state.kind = StateKind::Hardlink {
                    dest,
                    master_dest: master_dest.clone(),
                };
                if master_ready || self.masters_done.contains_key(&master_file_id) {
                    state.content_done = true;
                    state.content_ok = true;
                } else if self.masters_failed.contains(&master_file_id) {
                    state.content_done = true;
                    state.content_ok = false;
                } else {
                    self.pending_links
                        .entry(master_file_id)
                        .or_default()
                        .push(file_id);
                }
                self.states.insert(file_id, state);
                self.maybe_emit(file_id);
            }
            PlanKind::Metadata => {
                // Metadata plans carry Stream::Metadata; this arm is
                // unreachable by construction.
            }
        }
    }

    fn on_result(&mut self, msg: ResMsg) {
        match msg {
            ResMsg::Block(block) => self.on_block(block),
            ResMsg::BlockFailed {
                file_id,
                stream,
                reason,
                ..
            } => {
                let key = (file_id, stream);
                if let Some(job) = self.jobs.get_mut(&key) {
                    if job.failed.is_none() {
                        job.failed = Some(reason);
                    }
                    job.outstanding = job.outstanding.saturating_sub(1);
                    self.try_finalize(key);
                }
            }
        }
    }

    fn on_block(&mut self, block: DecompressedBlock) {
        let key = (block.file_id, block.stream);
        let Some(job) = self.jobs.get_mut(&key) else {
            // Job already aborted; remaining blocks are dropped on arrival.
            return;
        };
        job.outstanding = job.outstanding.saturating_sub(1);

        if job.failed.is_none() {
            job.pending.insert(block.file_offset, block.bytes);
            if let Err(e) = drain_contiguous(job, &self.ctx) {
                job.failed = Some(e.to_string());
            }
        }
        self.try_finalize(key);
    }

    /// Finalize a job once every request is resolved and nothing is parked.
    fn try_finalize(&mut self, key: (i64, Stream)) {
        let ready = match self.jobs.get(&key) {
            Some(job) => job.outstanding == 0 && (job.pending.is_empty() || job.failed.is_some()),
            None => return,
        };
        if !ready {
            return;
        }
        let job = self.jobs.remove(&key).expect("job checked above");
        match key.1 {
            Stream::Content => self.finalize_content(key.0, job),
            Stream::Metadata => self.finalize_metadata(key.0, job),
        }
    }

    fn finalize_content(&mut self, file_id: i64, job: FileJob) {
        self.active_content = self.active_content.saturating_sub(1);
        let rel_path = job.rel_path.clone();
        match finish_disk_job(job) {
            Ok(bytes) => {
                self.stats.restored += 1;
                self.stats.bytes_written += bytes;
                self.set_content_outcome(file_id, true);
            }
            Err(e) => {
                warn!(path = %rel_path, error = %e, "file restore failed");
                self.stats.first_error.get_or_insert(e);
                self.stats.failed += 1;
                if self.strict {
                    self.ctx.cancel.store(true, Ordering::Relaxed);
                }
                self.set_content_outcome(file_id, false);
            }
        }
    }

    fn finalize_metadata(&mut self, file_id: i64, job: FileJob) {
        let attrs = decode_attrs(job);
        if attrs.is_none() {
            self.stats.warnings += 1;
        }
        if let Some(state) = self.states.get_mut(&file_id) {
            state.attrs = attrs;
            state.attrs_done = true;
        }
        self.maybe_emit(file_id);
    }

    fn set_content_outcome(&mut self, file_id: i64, ok: bool) {
        if let Some(state) = self.states.get_mut(&file_id) {
            state.content_done = true;
            state.content_ok = ok;
        }
        self.maybe_emit(file_id);
    }

    /// Emit the downstream metadata/link message once content and attrs are
    /// both settled. Also resolves hardlink members blocked on this file.
    fn maybe_emit(&mut self, file_id: i64) {
        let Some(state) = self.states.get_mut(&file_id) else {
            return;
        };
        if state.sent || !state.content_done || (state.expects_attrs && !state.attrs_done) {
            return;
        }
        state.sent = true;

        let rel_path = state.rel_path.clone();
        let attrs = state.attrs.take();
        let content_ok = state.content_ok;
        let is_master = state.is_master;

        let (msg, master_outcome_path) = match &state.kind {
            StateKind::File { dest } => (
                content_ok.then(|| MetaMsg::Apply {
                    rel_path: rel_path.clone(),
                    path: dest.clone(),
                    entry: EntryKind::File,
                    attrs,
                }),
                Some(dest.clone()),
            ),
            StateKind::Folder { dest } => (
                Some(MetaMsg::Apply {
                    rel_path: rel_path.clone(),
                    path: dest.clone(),
                    entry: EntryKind::Folder,
                    attrs,
                }),
                None,
            ),
            StateKind::Symlink { dest } => (
                Some(MetaMsg::Apply {
                    rel_path: rel_path.clone(),
                    path: dest.clone(),
                    entry: EntryKind::Symlink,
                    attrs,
                }),
                None,
            ),
            StateKind::Hardlink { dest, master_dest } => {
                if content_ok {
                    (
                        Some(MetaMsg::Hardlink {
                            rel_path: rel_path.clone(),
                            path: dest.clone(),
                            master_path: master_dest.clone(),
                            attrs,
                            overwrite: self.overwrite,
                        }),
                        None,
                    )
                } else {
                    self.stats.failed += 1;
                    (None, None)
                }
            }
        };
        self.states.remove(&file_id);

        if let Some(msg) = msg {
            let _ = self.meta_tx.send(msg);
        }

        if is_master {
            if content_ok {
                if let Some(dest) = master_outcome_path {
                    self.masters_done.insert(file_id, dest);
                }
            } else {
                self.masters_failed.insert(file_id);
            }
            if let Some(members) = self.pending_links.remove(&file_id) {
                for member in members {
                    if let Some(m) = self.states.get_mut(&member) {
                        m.content_done = true;
                        m.content_ok = content_ok;
                    }
                    self.maybe_emit(member);
                }
            }
        }
    }

    fn note_failure(&mut self, rel_path: &str, reason: &str) {
        self.stats.failed += 1;
        self.stats
            .first_error
            .get_or_insert_with(|| StrataError::Other(format!("{rel_path}: {reason}")));
        if self.strict {
            self.ctx.cancel.store(true, Ordering::Relaxed);
        }
    }
}

/// Open (or resume) a `.part` output file. The kept prefix is re-hashed so
/// the finalize-time whole-file check still covers it.
fn open_disk_job(plan: &FilePlan, dest: &std::path::Path, resume_len: u64) -> crate::error::Result<FileJob> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let part_path = part_path_for(dest);
    let mut hasher = Sha256::new();

    let file = if resume_len > 0 {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part_path)?;
        let mut remaining = resume_len;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                return Err(StrataError::Write {
                    path: part_path.display().to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "partial file shrank during resume",
                    ),
                });
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        // Drop any trailing bytes past the last whole block.
        file.set_len(resume_len)?;
        file
    } else {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part_path)?
    };

    Ok(FileJob {
        rel_path: plan.rel_path.clone(),
        sink: Sink::Disk {
            file,
            part_path,
            dest: dest.to_path_buf(),
        },
        hasher,
        expected_len: plan.expected_len,
        expected_hash: plan.expected_hash,
        write_pos: resume_len,
        pending: BTreeMap::new(),
        outstanding: plan.block_count,
        failed: None,
    })
}

pub(crate) fn part_path_for(dest: &std::path::Path) -> PathBuf {
    let mut os = dest.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}

/// Flush the contiguous prefix of parked blocks into the sink and hasher.
fn drain_contiguous(job: &mut FileJob, ctx: &RestoreContext) -> crate::error::Result<()> {
    while let Some(bytes) = job.pending.remove(&job.write_pos) {
        let offset = job.write_pos;
        let started = Instant::now();
        match &mut job.sink {
            Sink::Disk { file, part_path, .. } => {
                write_at(file, offset, &bytes).map_err(|e| StrataError::Write {
                    path: part_path.display().to_string(),
                    source: e,
                })?;
                if started.elapsed().as_secs() > ctx.limits.write_timeout_secs {
                    return Err(StrataError::Timeout {
                        stage: "block write",
                        secs: ctx.limits.write_timeout_secs,
                    });
                }
            }
            Sink::Memory(buf) => buf.extend_from_slice(&bytes),
            Sink::Discard => {}
        }
        job.hasher.update(&bytes);
        job.write_pos += bytes.len() as u64;
    }
    Ok(())
}

fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(bytes, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Seek, SeekFrom, Write};
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)
    }
}

/// Close out a content job: verify length and whole-file hash, fsync, and
/// promote `.part` to the destination. Returns bytes written by this run.
fn finish_disk_job(job: FileJob) -> crate::error::Result<u64> {
    let FileJob {
        rel_path,
        sink,
        hasher,
        expected_len,
        expected_hash,
        write_pos,
        failed,
        ..
    } = job;

    let (file, part_path, dest) = match sink {
        Sink::Disk {
            file,
            part_path,
            dest,
        } => (file, part_path, dest),
        Sink::Memory(_) | Sink::Discard => {
            return Err(StrataError::Other(
                failed.unwrap_or_else(|| format!("{rel_path}: output was never opened")),
            ))
        }
    };

    if let Some(reason) = failed {
        drop(file);
        let _ = std::fs::remove_file(&part_path);
        return Err(StrataError::Other(format!("{rel_path}: {reason}")));
    }

    if write_pos != expected_len {
        drop(file);
        let _ = std::fs::remove_file(&part_path);
        return Err(StrataError::Integrity(format!(
            "{rel_path}: assembled {write_pos} bytes, expected {expected_len}"
        )));
    }

    let digest = BlockId::from_digest(hasher.finalize().into());
    if let Some(expected) = expected_hash {
        if digest != expected {
            drop(file);
            let _ = std::fs::remove_file(&part_path);
            return Err(StrataError::HashMismatch {
                path: rel_path,
                expected: expected.to_hex(),
                actual: digest.to_hex(),
            });
        }
    }

    file.sync_all()?;
    drop(file);
    if dest.exists() {
        let _ = std::fs::remove_file(&dest);
    }
    std::fs::rename(&part_path, &dest).map_err(|e| StrataError::Write {
        path: dest.display().to_string(),
        source: e,
    })?;
    debug!(path = %rel_path, bytes = expected_len, "file restored and verified");
    Ok(expected_len)
}

/// Decode a finished metadata job into attributes. Any problem degrades to
/// "no attributes" with a warning; content is unaffected.
fn decode_attrs(job: FileJob) -> Option<FileAttrs> {
    if let Some(reason) = &job.failed {
        warn!(path = %job.rel_path, reason, "metadata blob unavailable");
        return None;
    }
    let Sink::Memory(buf) = job.sink else {
        return None;
    };
    if let Some(expected) = job.expected_hash {
        let digest = BlockId::compute(&buf);
        if digest != expected {
            warn!(path = %job.rel_path, "metadata blob failed its hash check");
            return None;
        }
    }
    match rmp_serde::from_slice::<FileAttrs>(&buf) {
        Ok(attrs) => Some(attrs),
        Err(e) => {
            warn!(path = %job.rel_path, error = %e, "metadata blob did not decode");
            None
        }
    }
}
