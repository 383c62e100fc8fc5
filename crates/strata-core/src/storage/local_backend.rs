use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::Backend;
use crate::error::{Result, StrataError};

/// Filesystem-backed object store. Objects are plain files directly under
/// the root directory; volume names never contain path separators.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: &str) -> Result<Self> {
        let root = PathBuf::from(root);
        if !root.exists() {
            return Err(StrataError::Config(format!(
                "repository not found: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Create the root directory if needed (fixtures, tests).
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(StrataError::Config(format!("invalid object name: '{name}'")));
        }
        Ok(self.root.join(name))
    }
}

impl Backend for LocalBackend {
    fn list(&self) -> Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                out.push((entry.file_name().to_string_lossy().into_owned(), meta.len()));
            }
        }
        out.sort();
        Ok(out)
    }

    fn get(&self, name: &str, out: &mut dyn Write) -> Result<Option<u64>> {
        let path = self.object_path(name)?;
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let n = std::io::copy(&mut file, out)?;
        Ok(Some(n))
    }

    fn put(&self, name: &str, data: &mut dyn Read) -> Result<u64> {
        let path = self.object_path(name)?;
        let tmp = path.with_extension("tmp-upload");
        let mut file = File::create(&tmp)?;
        let n = std::io::copy(data, &mut file)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(n)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_path = self.object_path(old)?;
        let new_path = self.object_path(new)?;
        fs::rename(&old_path, &new_path)?;
        Ok(())
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        let path = self.object_path(name)?;
        match fs::metadata(&path) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
