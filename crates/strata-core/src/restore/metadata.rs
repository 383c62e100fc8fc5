use std::path::Path;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use super::messages::{EntryKind, FileAttrs, MetaMsg, RestoreContext};
use crate::platform::fs;

#[derive(Debug, Default)]
pub(crate) struct MetaStats {
    pub dirs: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    pub warnings: u64,
    pub failed: u64,
}

/// Metadata stage: applies mtime/permissions/xattrs after content is in
/// place, creates directories and symlinks, and fans hardlink groups out
/// from their master. Attribute failures are warnings; failing to create
/// the entry itself is a failure.
pub(crate) fn run_metadata(ctx: RestoreContext, rx: Receiver<MetaMsg>) -> MetaStats {
    let mut stats = MetaStats::default();
    loop {
        let msg = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => {
                if ctx.cancelled() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if ctx.cancelled() {
            break;
        }
        match msg {
            MetaMsg::Apply {
                rel_path,
                path,
                entry,
                attrs,
            } => apply_entry(&mut stats, &rel_path, &path, entry, attrs.as_ref()),
            MetaMsg::Hardlink {
                rel_path,
                path,
                master_path,
                attrs,
                overwrite,
            } => apply_hardlink(
                &mut stats,
                &rel_path,
                &path,
                &master_path,
                attrs.as_ref(),
                overwrite,
            ),
        }
    }
    stats
}

fn apply_entry(
    stats: &mut MetaStats,
    rel_path: &str,
    path: &Path,
    entry: EntryKind,
    attrs: Option<&FileAttrs>,
) {
    match entry {
        EntryKind::Folder => {
            if let Err(e) = std::fs::create_dir_all(path) {
                warn!(path = rel_path, error = %e, "failed to create directory");
                stats.failed += 1;
                return;
            }
            stats.dirs += 1;
        }
        EntryKind::Symlink => {
            let Some(target) = attrs.and_then(|a| a.link_target.as_deref()) else {
                warn!(path = rel_path, "symlink has no recorded target");
                stats.failed += 1;
                return;
            };
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            // Replace whatever a previous run left behind.
            let _ = std::fs::remove_file(path);
            if let Err(e) = fs::create_symlink(Path::new(target), path) {
                warn!(path = rel_path, error = %e, "failed to create symlink");
                stats.failed += 1;
                return;
            }
            stats.symlinks += 1;
            // Symlink attributes: only xattrs are applicable; mode and
            // mtime affect the target.
            if let Some(xattrs) = attrs.and_then(|a| a.xattrs.as_ref()) {
                stats.warnings += fs::apply_xattrs(path, xattrs);
            }
            return;
        }
        EntryKind::File => {}
    }

    let Some(attrs) = attrs else {
        return;
    };
    if let Some(mode) = attrs.mode {
        if let Err(e) = fs::apply_mode(path, mode) {
            warn!(path = rel_path, error = %e, "failed to set permissions");
            stats.warnings += 1;
        }
    }
    if let Some(xattrs) = attrs.xattrs.as_ref() {
        stats.warnings += fs::apply_xattrs(path, xattrs);
    }
    // mtime last so the attribute writes above don't disturb it.
    if let Some(mtime_ns) = attrs.mtime_ns {
        let (secs, nanos) = fs::split_unix_nanos(mtime_ns);
        if let Err(e) = fs::set_file_mtime(path, secs, nanos) {
            warn!(path = rel_path, error = %e, "failed to set mtime");
            stats.warnings += 1;
        }
    }
    debug!(path = rel_path, "metadata applied");
}

fn apply_hardlink(
    stats: &mut MetaStats,
    rel_path: &str,
    path: &Path,
    master_path: &Path,
    _attrs: Option<&FileAttrs>,
    overwrite: bool,
) {
    match fs::same_inode(path, master_path) {
        Ok(true) => {
            // Already linked by an earlier run.
            stats.hardlinks += 1;
            return;
        }
        Ok(false) | Err(_) => {}
    }
    if path.exists() {
        if !overwrite {
            warn!(path = rel_path, "destination exists and is not the hardlink");
            stats.failed += 1;
            return;
        }
        let _ = std::fs::remove_file(path);
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = fs::create_hardlink(master_path, path) {
        warn!(path = rel_path, error = %e, "failed to create hardlink");
        stats.failed += 1;
        return;
    }
    // Ownership of mode/mtime lives with the shared inode the master
    // already configured.
    stats.hardlinks += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn folder_creation_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = MetaStats::default();
        let target = dir.path().join("a/b/c");
        apply_entry(&mut stats, "a/b/c", &target, EntryKind::Folder, None);
        assert!(target.is_dir());
        assert_eq!(stats.dirs, 1);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    #[cfg(unix)]
    fn file_mode_and_mtime_applied() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f");
        std::fs::write(&target, b"content").unwrap();

        let attrs = FileAttrs {
            mode: Some(0o640),
            mtime_ns: Some(1_600_000_000_000_000_000),
            ..FileAttrs::default()
        };
        let mut stats = MetaStats::default();
        apply_entry(&mut stats, "f", &target, EntryKind::File, Some(&attrs));

        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o640);
        assert_eq!(meta.mtime(), 1_600_000_000);
        assert_eq!(stats.warnings, 0);
    }

    #[test]
    #[cfg(unix)]
    fn symlink_created_from_attrs() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("link");
        let attrs = FileAttrs {
            link_target: Some("some/where".into()),
            ..FileAttrs::default()
        };
        let mut stats = MetaStats::default();
        apply_entry(&mut stats, "link", &target, EntryKind::Symlink, Some(&attrs));
        assert_eq!(
            std::fs::read_link(&target).unwrap(),
            Path::new("some/where")
        );
        assert_eq!(stats.symlinks, 1);
    }

    #[test]
    fn symlink_without_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = MetaStats::default();
        apply_entry(
            &mut stats,
            "link",
            &dir.path().join("link"),
            EntryKind::Symlink,
            Some(&FileAttrs::default()),
        );
        assert_eq!(stats.failed, 1);
    }

    #[test]
    #[cfg(unix)]
    fn hardlink_created_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let master = dir.path().join("master");
        std::fs::write(&master, b"shared bytes").unwrap();
        let link = dir.path().join("link");

        let mut stats = MetaStats::default();
        apply_hardlink(&mut stats, "link", &link, &master, None, false);
        assert!(fs::same_inode(&link, &master).unwrap());
        assert_eq!(stats.hardlinks, 1);

        // Second application recognizes the existing link.
        apply_hardlink(&mut stats, "link", &link, &master, None, false);
        assert_eq!(stats.hardlinks, 2);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn hardlink_respects_overwrite_flag() {
        let dir = tempfile::tempdir().unwrap();
        let master = dir.path().join("master");
        std::fs::write(&master, b"shared").unwrap();
        let link = dir.path().join("link");
        std::fs::write(&link, b"other contents").unwrap();

        let mut stats = MetaStats::default();
        apply_hardlink(&mut stats, "link", &link, &master, None, false);
        assert_eq!(stats.failed, 1);

        apply_hardlink(&mut stats, "link", &link, &master, None, true);
        assert_eq!(stats.hardlinks, 1);
    }

    #[test]
    #[cfg(unix)]
    fn bad_xattrs_are_warnings_only() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f");
        std::fs::write(&target, b"x").unwrap();

        let mut xattrs = BTreeMap::new();
        // Unwritable namespace on regular files for unprivileged users.
        xattrs.insert("trusted.strata_test".to_string(), vec![1u8]);
        let attrs = FileAttrs {
            xattrs: Some(xattrs),
            ..FileAttrs::default()
        };
        let mut stats = MetaStats::default();
        apply_entry(&mut stats, "f", &target, EntryKind::File, Some(&attrs));
        assert_eq!(stats.failed, 0);
    }
}
