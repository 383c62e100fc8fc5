mod assembler;
mod decompress;
mod decrypt;
mod download;
mod manager;
mod messages;
mod metadata;
mod plan;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded};
use tracing::{debug, info};

use crate::catalog::{Catalog, FilesetSelector};
use crate::codec::CodecRegistry;
use crate::config::StrataConfig;
use crate::error::{Result, StrataError};
use crate::storage::Backend;

use assembler::Assembler;
use manager::VolumeManager;
use messages::RestoreContext;

pub use messages::FileAttrs;

/// What to restore and how.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub fileset: FilesetSelector,
    /// Glob patterns over catalog paths; empty selects everything.
    pub paths: Vec<String>,
    /// Destination root directory.
    pub dest: PathBuf,
    /// Replace existing files whose content differs from the catalog.
    pub overwrite: bool,
    /// Escalate the first per-file failure into a global failure.
    pub strict: bool,
}

/// Aggregate outcome of one restore run.
#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub restored: u64,
    pub failed: u64,
    pub skipped: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    pub warnings: u64,
    pub bytes_written: u64,
    /// Volume fetches performed against the backend.
    pub downloads: u64,
}

impl RestoreSummary {
    /// Process exit code: 0 full success, 2 partial, 3 total failure.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else if self.restored + self.skipped + self.hardlinks > 0 {
            2
        } else {
            3
        }
    }
}

/// Run a restore: wire the worker stages together with bounded channels,
/// wait for the pipeline to drain, and aggregate the result.
///
/// Stage graph (arrows are channels):
///
/// ```text
/// planner ──src──▶ assembler ──▶ manager ──▶ downloaders ──▶ decryptor
///                     ▲   │         ▲ ▲            │              │
///                     │   └─meta──▶ │ └────────────┴──(failed)────┘
///                  results          └──(ready/done)
///                     ▲
///               decompressors ◀── manager
/// ```
///
/// The manager's input is the one unbounded channel; every worker that
/// reports back to it therefore never blocks doing so, which breaks the
/// only send cycle in the graph.
pub fn run(
    config: &StrataConfig,
    catalog: Catalog,
    backend: Arc<dyn Backend>,
    opts: &RestoreOptions,
    cancel: Arc<AtomicBool>,
) -> Result<RestoreSummary> {
    let fileset = catalog.resolve_fileset(&opts.fileset)?;
    info!(
        fileset = fileset.id,
        timestamp = fileset.timestamp,
        dest = %opts.dest.display(),
        "starting restore"
    );

    let volumes = Arc::new(catalog.restorable_volumes()?);
    let dup_volumes = catalog.duplicate_volume_map()?;
    let cipher_key = config.encryption.resolve_key()?;
    let registry = Arc::new(CodecRegistry::with_defaults(config.compression.zstd_level));

    let tempdir = match config.tempdir.as_deref() {
        Some(dir) => tempfile::Builder::new()
            .prefix("strata-restore-")
            .tempdir_in(dir)?,
        None => tempfile::Builder::new()
            .prefix("strata-restore-")
            .tempdir()?,
    };
    std::fs::create_dir_all(&opts.dest)?;

    let ctx = RestoreContext {
        backend,
        registry,
        cipher_key,
        tempdir: tempdir.path().to_path_buf(),
        limits: config.limits.clone(),
        retry: config.repository.retry.clone(),
        cancel: Arc::clone(&cancel),
        volumes,
        downloads: Arc::new(AtomicU64::new(0)),
    };

    let limits = &ctx.limits;
    let dx_workers = limits.resolved_decompress_workers();
    let dl_workers = limits.max_concurrent_downloads.max(1);

    let (src_tx, src_rx) = bounded(64);
    let (res_tx, res_rx) = bounded(limits.reorder_buffer_blocks.max(1));
    // The manager's inbox must never exert backpressure on its reporters;
    // see the module comment above.
    let (mgr_tx, mgr_rx) = unbounded();
    let (dl_tx, dl_rx) = bounded(dl_workers);
    let (dec_tx, dec_rx) = bounded(2);
    let (dx_tx, dx_rx) = bounded(dx_workers * 2);
    let (meta_tx, meta_rx) = bounded(64);

    let (planner_res, mut asm_stats, mgr_stats, meta_stats) = {
        let ctx = &ctx;
        std::thread::scope(|s| -> Result<_> {
            let planner = {
                let ctx = ctx.clone();
                let opts_ref = opts;
                s.spawn(move || {
                    let out = plan::run_planner(
                        catalog,
                        fileset.id,
                        dup_volumes,
                        opts_ref,
                        ctx.clone(),
                        src_tx,
                    );
                    if let Err(ref e) = out {
                        if !matches!(e, StrataError::Cancelled) {
                            ctx.cancel.store(true, Ordering::Relaxed);
                        }
                    }
                    out
                })
            };

            let assembler = {
                let asm = Assembler::new(
                    ctx.clone(),
                    opts.strict,
                    opts.overwrite,
                    mgr_tx.clone(),
                    meta_tx,
                );
                s.spawn(move || asm.run(src_rx, res_rx))
            };

            let manager = {
                let mgr = VolumeManager::new(ctx.clone(), dl_tx, dx_tx, res_tx.clone());
                s.spawn(move || mgr.run(mgr_rx))
            };

            for _ in 0..dl_workers {
                let ctx = ctx.clone();
                let rx = dl_rx.clone();
                let dec_tx = dec_tx.clone();
                let mgr_tx = mgr_tx.clone();
                s.spawn(move || download::run_downloader(ctx, rx, dec_tx, mgr_tx));
            }

            {
                let ctx = ctx.clone();
                let mgr_tx = mgr_tx.clone();
                s.spawn(move || decrypt::run_decryptor(ctx, dec_rx, mgr_tx));
            }

            for _ in 0..dx_workers {
                let ctx = ctx.clone();
                let rx = dx_rx.clone();
                let res_tx = res_tx.clone();
                let mgr_tx = mgr_tx.clone();
                s.spawn(move || decompress::run_decompressor(ctx, rx, res_tx, mgr_tx));
            }

            let metadata = {
                let ctx = ctx.clone();
                s.spawn(move || metadata::run_metadata(ctx, meta_rx))
            };

            // The scope's own copies must go away or the workers' loops
            // would never see their channels close.
            drop(mgr_tx);
            drop(res_tx);
            drop(dl_rx);
            drop(dec_tx);
            drop(dx_rx);

            let planner_res = planner.join().map_err(worker_panic)?;
            let asm_stats = assembler.join().map_err(worker_panic)?;
            let mgr_stats = manager.join().map_err(worker_panic)?;
            let meta_stats = metadata.join().map_err(worker_panic)?;
            Ok((planner_res, asm_stats, mgr_stats, meta_stats))
        })?
    };

    debug!(
        cache_hits = mgr_stats.cache_hits,
        downloads = mgr_stats.downloads_started,
        evictions = mgr_stats.evictions,
        "volume manager finished"
    );

    if let Err(e) = planner_res {
        if !matches!(e, StrataError::Cancelled) {
            return Err(e);
        }
    }

    if opts.strict {
        if let Some(e) = asm_stats.first_error.take() {
            return Err(e);
        }
    }
    if cancel.load(Ordering::Relaxed) {
        return Err(StrataError::Cancelled);
    }

    let summary = RestoreSummary {
        restored: asm_stats.restored,
        failed: asm_stats.failed + meta_stats.failed,
        skipped: asm_stats.skipped,
        dirs: meta_stats.dirs,
        symlinks: meta_stats.symlinks,
        hardlinks: meta_stats.hardlinks,
        warnings: asm_stats.warnings + meta_stats.warnings,
        bytes_written: asm_stats.bytes_written,
        downloads: ctx.downloads.load(Ordering::Relaxed),
    };
    info!(
        restored = summary.restored,
        failed = summary.failed,
        skipped = summary.skipped,
        bytes = summary.bytes_written,
        downloads = summary.downloads,
        "restore finished"
    );
    Ok(summary)
}

fn worker_panic(_: Box<dyn std::any::Any + Send>) -> StrataError {
    StrataError::Other("restore worker panicked".into())
}
