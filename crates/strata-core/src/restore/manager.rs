use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tempfile::TempPath;
use tracing::debug;

use super::messages::{
    BlockRequest, DecompressJob, DownloadJob, MgrMsg, ResMsg, RestoreContext,
};
use crate::volume::VolumeReader;

/// A cached, decrypted volume. Dropping the entry deletes the plaintext
/// temp file, so an entry may only be dropped at refcount zero.
struct CacheEntry {
    #[allow(dead_code)]
    blob: TempPath,
    reader: Arc<VolumeReader>,
    /// Outstanding decompressions using `reader`.
    refcount: usize,
    last_use: u64,
    /// An evict hint arrived; drop the entry as soon as refcount hits zero.
    pending_evict: bool,
    bytes: u64,
}

/// Requests parked while their volume downloads. Waiters wake in FIFO order.
struct InFlight {
    waiters: VecDeque<BlockRequest>,
    evict_hint: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ManagerStats {
    pub cache_hits: u64,
    pub downloads_started: u64,
    pub evictions: u64,
}

/// Central dispatcher between block consumers and volume producers.
///
/// All state lives on the manager's own thread; the input channel is the
/// only way in, so no locking is needed. Sends into the download and
/// decompress channels may block, which is safe because those consumers
/// never block on sending back to the manager (its channel is unbounded).
pub(crate) struct VolumeManager {
    ctx: RestoreContext,
    dl_tx: Sender<DownloadJob>,
    dx_tx: Sender<DecompressJob>,
    res_tx: Sender<ResMsg>,
    cache: HashMap<i64, CacheEntry>,
    in_flight: HashMap<i64, InFlight>,
    tick: u64,
    cache_bytes: u64,
    stats: ManagerStats,
}

impl VolumeManager {
    pub fn new(
        ctx: RestoreContext,
        dl_tx: Sender<DownloadJob>,
        dx_tx: Sender<DecompressJob>,
        res_tx: Sender<ResMsg>,
    ) -> Self {
        Self {
            ctx,
            dl_tx,
            dx_tx,
            res_tx,
            cache: HashMap::new(),
            in_flight: HashMap::new(),
            tick: 0,
            cache_bytes: 0,
            stats: ManagerStats::default(),
        }
    }

    pub fn run(mut self, rx: Receiver<MgrMsg>) -> ManagerStats {
        loop {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(MgrMsg::Shutdown) => break,
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.ctx.cancelled() {
                break;
            }
        }
        if !self.in_flight.is_empty() && !self.ctx.cancelled() {
            debug!(
                volumes = self.in_flight.len(),
                "manager stopped with unresolved in-flight volumes"
            );
        }
        // Dropping the cache deletes the plaintext temp files.
        self.stats
    }

    fn handle(&mut self, msg: MgrMsg) {
        match msg {
            MgrMsg::Request(r) => self.on_request(r),
            MgrMsg::VolumeReady {
                volume_id,
                blob,
                reader,
            } => self.on_volume_ready(volume_id, blob, reader),
            MgrMsg::VolumeFailed { volume_id, reason } => self.on_volume_failed(volume_id, &reason),
            MgrMsg::BlockDone { volume_id } => self.on_block_done(volume_id),
            MgrMsg::Shutdown => {}
        }
    }

    /// Cache hit, in-flight append, or new download: exactly one of the
    /// three, so a volume is never downloaded twice concurrently.
    fn on_request(&mut self, r: BlockRequest) {
        let vid = r.volume_id;

        if let Some(entry) = self.cache.get_mut(&vid) {
            if r.evict_hint {
                entry.pending_evict = true;
            }
            self.tick += 1;
            entry.last_use = self.tick;
            entry.refcount += 1;
            let reader = Arc::clone(&entry.reader);
            self.stats.cache_hits += 1;
            self.forward(r, reader);
            return;
        }

        if let Some(inf) = self.in_flight.get_mut(&vid) {
            inf.evict_hint |= r.evict_hint;
            inf.waiters.push_back(r);
            return;
        }

        let Some(volume) = self.ctx.volumes.get(&vid).cloned() else {
            self.fail_request(&r, &format!("volume id {vid} is not restorable"));
            return;
        };
        let evict_hint = r.evict_hint;
        self.in_flight.insert(
            vid,
            InFlight {
                waiters: VecDeque::from([r]),
                evict_hint,
            },
        );
        self.stats.downloads_started += 1;
        debug!(volume = %volume.name, "requesting volume download");
        if self.dl_tx.send(DownloadJob { volume }).is_err() {
            self.on_volume_failed(vid, "downloader stopped");
        }
    }

    fn on_volume_ready(&mut self, vid: i64, blob: TempPath, reader: Arc<VolumeReader>) {
        self.tick += 1;
        let mut entry = CacheEntry {
            bytes: reader.plaintext_size(),
            blob,
            reader,
            refcount: 0,
            last_use: self.tick,
            pending_evict: false,
        };

        if let Some(inf) = self.in_flight.remove(&vid) {
            entry.pending_evict = inf.evict_hint;
            for waiter in inf.waiters {
                entry.refcount += 1;
                self.forward(waiter, Arc::clone(&entry.reader));
            }
        }

        self.cache_bytes += entry.bytes;
        self.cache.insert(vid, entry);
        self.enforce_capacity();
    }

    fn on_volume_failed(&mut self, vid: i64, reason: &str) {
        let Some(inf) = self.in_flight.remove(&vid) else {
            return;
        };
        debug!(volume_id = vid, reason, "failing volume waiters");
        for waiter in inf.waiters {
            self.fail_request(&waiter, reason);
        }
    }

    fn on_block_done(&mut self, vid: i64) {
        if let Some(entry) = self.cache.get_mut(&vid) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 && entry.pending_evict {
                self.evict(vid);
            } else {
                self.enforce_capacity();
            }
        }
    }

    /// Evict least-recently-used unpinned entries until both bounds hold.
    /// When everything is pinned the cache may run over temporarily; it
    /// shrinks again as decompressions complete.
    fn enforce_capacity(&mut self) {
        while self.cache.len() > self.ctx.limits.cache_max_entries
            || self.cache_bytes > self.ctx.limits.cache_max_bytes
        {
            let victim = self
                .cache
                .iter()
                .filter(|(_, e)| e.refcount == 0)
                .min_by_key(|(_, e)| e.last_use)
                .map(|(vid, _)| *vid);
            match victim {
                Some(vid) => self.evict(vid),
                None => break,
            }
        }
    }

    fn evict(&mut self, vid: i64) {
        if let Some(entry) = self.cache.remove(&vid) {
            self.cache_bytes -= entry.bytes;
            self.stats.evictions += 1;
            debug!(volume_id = vid, "evicting cached volume");
        }
    }

    fn forward(&mut self, request: BlockRequest, reader: Arc<VolumeReader>) {
        let vid = request.volume_id;
        if self.dx_tx.send(DecompressJob { request, reader }).is_err() {
            // Decompressors only stop on cancellation; undo the refcount so
            // teardown invariants hold.
            if let Some(entry) = self.cache.get_mut(&vid) {
                entry.refcount = entry.refcount.saturating_sub(1);
            }
        }
    }

    fn fail_request(&mut self, r: &BlockRequest, reason: &str) {
        let _ = self.res_tx.send(ResMsg::BlockFailed {
            file_id: r.file_id,
            stream: r.stream,
            file_offset: r.file_offset,
            reason: reason.to_string(),
        });
    }
}
