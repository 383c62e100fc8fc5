use std::collections::BTreeMap;
use std::path::Path;

pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    #[cfg(windows)]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly((mode & 0o200) == 0);
        std::fs::set_permissions(path, perms)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

pub fn create_symlink(link_target: &Path, target: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(link_target, target)
    }

    #[cfg(windows)]
    {
        let file_err = std::os::windows::fs::symlink_file(link_target, target).err();
        if file_err.is_none() {
            return Ok(());
        }
        match std::os::windows::fs::symlink_dir(link_target, target) {
            Ok(()) => Ok(()),
            Err(dir_err) => Err(std::io::Error::new(
                dir_err.kind(),
                format!(
                    "failed to create symlink as file ({}) and directory ({})",
                    file_err.unwrap(),
                    dir_err
                ),
            )),
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (link_target, target);
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlink creation is not supported on this platform",
        ))
    }
}

pub fn create_hardlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::fs::hard_link(original, link)
}

/// Whether two paths point at the same inode. Used to recognize hardlinks
/// that already exist from a previous run.
pub fn same_inode(a: &Path, b: &Path) -> std::io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let ma = std::fs::metadata(a)?;
        let mb = std::fs::metadata(b)?;
        Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
    }

    #[cfg(not(unix))]
    {
        let _ = (a, b);
        Ok(false)
    }
}

pub fn set_file_mtime(path: &Path, secs: i64, nanos: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null")
        })?;
        let times = [
            libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            libc::timespec {
                tv_sec: secs as _,
                tv_nsec: nanos as _,
            },
        ];
        if unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        use std::fs::FileTimes;
        use std::time::{Duration, SystemTime};

        let time = if secs >= 0 {
            SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nanos)
        } else {
            SystemTime::UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::new(0, nanos)
        };
        let file = std::fs::File::options().write(true).open(path)?;
        file.set_times(FileTimes::new().set_modified(time))
    }
}

/// Apply extended attributes, warning (not failing) per attribute.
/// Returns the number of attributes that could not be set.
pub fn apply_xattrs(target: &Path, xattrs: &BTreeMap<String, Vec<u8>>) -> u64 {
    let mut failures = 0;
    for (name, value) in xattrs {
        #[cfg(unix)]
        if let Err(e) = xattr::set(target, name, value) {
            tracing::warn!(
                path = %target.display(),
                attr = %name,
                error = %e,
                "failed to restore extended attribute"
            );
            failures += 1;
        }
        #[cfg(not(unix))]
        {
            let _ = (name, value);
            failures += 1;
        }
    }
    failures
}

pub fn split_unix_nanos(total_nanos: i64) -> (i64, u32) {
    let secs = total_nanos.div_euclid(1_000_000_000);
    let nanos = total_nanos.rem_euclid(1_000_000_000) as u32;
    (secs, nanos)
}
