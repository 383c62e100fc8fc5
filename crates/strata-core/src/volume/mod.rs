mod name;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

pub use name::VolumeName;

/// Magic bytes at the start of every volume container.
pub const VOLUME_MAGIC: &[u8; 6] = b"STRVOL";
/// Container format version.
pub const VOLUME_VERSION: u8 = 1;
const HEADER_SIZE: u64 = 7;

/// Name of the special manifest entry.
pub const MANIFEST_ENTRY: &str = "manifest";
/// Hash algorithm this implementation writes and accepts.
pub const HASH_ALGO: &str = "sha256";

/// The manifest carried by every volume. Checked for compatibility before
/// any block is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeManifest {
    pub version: u32,
    /// Target block size the backup was created with.
    pub blocksize: u32,
    /// Block hash algorithm name.
    pub blockhash: String,
    /// Whole-file hash algorithm name.
    pub filehash: String,
}

impl VolumeManifest {
    pub fn new(blocksize: u32) -> Self {
        Self {
            version: 1,
            blocksize,
            blockhash: HASH_ALGO.to_string(),
            filehash: HASH_ALGO.to_string(),
        }
    }

    fn check_compatible(&self) -> Result<()> {
        if self.version != 1 {
            return Err(StrataError::InvalidFormat(format!(
                "unsupported volume manifest version {}",
                self.version
            )));
        }
        if self.blockhash != HASH_ALGO || self.filehash != HASH_ALGO {
            return Err(StrataError::InvalidFormat(format!(
                "unsupported hash algorithms ({}/{})",
                self.blockhash, self.filehash
            )));
        }
        Ok(())
    }
}

/// One record of the trailing index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    name: String,
    offset: u64,
    length: u32,
}

/// Sequential container writer. Layout:
///
/// ```text
/// [6B magic][1B version]
/// per entry: [2B name_len LE][name][4B data_len LE][data]
/// [rmp index][4B index_len LE]
/// ```
///
/// Used by the backup path and by fixtures; the restore path only reads.
pub struct VolumeWriter {
    out: BufWriter<File>,
    pos: u64,
    entries: Vec<IndexEntry>,
}

impl VolumeWriter {
    pub fn create(path: &Path, manifest: &VolumeManifest) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = Self {
            out: BufWriter::new(file),
            pos: 0,
            entries: Vec::new(),
        };
        writer.out.write_all(VOLUME_MAGIC)?;
        writer.out.write_all(&[VOLUME_VERSION])?;
        writer.pos = HEADER_SIZE;
        writer.add_entry(MANIFEST_ENTRY, &rmp_serde::to_vec(manifest)?)?;
        Ok(writer)
    }

    /// Append a named entry. The recorded offset points at the data itself.
    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if name.len() > u16::MAX as usize {
            return Err(StrataError::InvalidFormat(format!(
                "entry name too long ({} bytes)",
                name.len()
            )));
        }
        if data.len() > u32::MAX as usize {
            return Err(StrataError::InvalidFormat(format!(
                "entry '{name}' too large ({} bytes)",
                data.len()
            )));
        }
        self.out.write_all(&(name.len() as u16).to_le_bytes())?;
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&(data.len() as u32).to_le_bytes())?;
        self.out.write_all(data)?;

        let data_offset = self.pos + 2 + name.len() as u64 + 4;
        self.entries.push(IndexEntry {
            name: name.to_string(),
            offset: data_offset,
            length: data.len() as u32,
        });
        self.pos = data_offset + data.len() as u64;
        Ok(())
    }

    /// Write the trailing index and flush everything to disk.
    pub fn finish(mut self) -> Result<()> {
        let index = rmp_serde::to_vec(&self.entries)?;
        self.out.write_all(&index)?;
        self.out.write_all(&(index.len() as u32).to_le_bytes())?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }
}

/// Random-access reader over a plaintext volume container.
///
/// The reader holds its own file handle; the temp file it reads from is
/// owned by the volume cache entry and outlives all outstanding reads.
#[derive(Debug)]
pub struct VolumeReader {
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: std::sync::Mutex<File>,
    index: HashMap<String, (u64, u32)>,
    manifest: VolumeManifest,
    size: u64,
}

impl VolumeReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < HEADER_SIZE + 4 {
            return Err(StrataError::InvalidFormat("volume too short".into()));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[..6] != VOLUME_MAGIC {
            return Err(StrataError::InvalidFormat("bad volume magic".into()));
        }
        if header[6] != VOLUME_VERSION {
            return Err(StrataError::InvalidFormat(format!(
                "unsupported volume version {}",
                header[6]
            )));
        }

        file.seek(SeekFrom::End(-4))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let index_len = u32::from_le_bytes(len_buf) as u64;
        if index_len == 0 || index_len > size - HEADER_SIZE - 4 {
            return Err(StrataError::InvalidFormat("bad volume index length".into()));
        }

        file.seek(SeekFrom::End(-4 - index_len as i64))?;
        let mut index_buf = vec![0u8; index_len as usize];
        file.read_exact(&mut index_buf)?;
        let entries: Vec<IndexEntry> = rmp_serde::from_slice(&index_buf)?;

        let data_end = size - 4 - index_len;
        let mut index = HashMap::with_capacity(entries.len());
        for e in entries {
            if e.offset < HEADER_SIZE || e.offset + e.length as u64 > data_end {
                return Err(StrataError::InvalidFormat(format!(
                    "entry '{}' out of bounds",
                    e.name
                )));
            }
            index.insert(e.name, (e.offset, e.length));
        }

        #[cfg(not(unix))]
        let file = std::sync::Mutex::new(file);

        let mut reader = Self {
            file,
            index,
            manifest: VolumeManifest::new(0),
            size,
        };
        let manifest_bytes = reader.read_entry(MANIFEST_ENTRY).map_err(|_| {
            StrataError::InvalidFormat("volume is missing its manifest".into())
        })?;
        reader.manifest = rmp_serde::from_slice(&manifest_bytes)?;
        reader.manifest.check_compatible()?;
        Ok(reader)
    }

    pub fn manifest(&self) -> &VolumeManifest {
        &self.manifest
    }

    /// On-disk size of the plaintext container, used for cache accounting.
    pub fn plaintext_size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Read a whole named entry.
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let (offset, length) = *self
            .index
            .get(name)
            .ok_or_else(|| StrataError::InvalidFormat(format!("no entry '{name}' in volume")))?;
        let mut buf = vec![0u8; length as usize];

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(&mut buf, offset)?;
        }
        #[cfg(not(unix))]
        {
            let mut file = self.file.lock().expect("volume reader lock poisoned");
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_volume(path: &Path, entries: &[(&str, &[u8])]) {
        let mut w = VolumeWriter::create(path, &VolumeManifest::new(1024)).unwrap();
        for (name, data) in entries {
            w.add_entry(name, data).unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn write_open_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol");
        write_volume(&path, &[("aa", b"first"), ("bb", b"second entry")]);

        let reader = VolumeReader::open(&path).unwrap();
        assert_eq!(reader.manifest().blocksize, 1024);
        assert_eq!(reader.manifest().blockhash, "sha256");
        assert!(reader.contains("aa"));
        assert_eq!(reader.read_entry("aa").unwrap(), b"first");
        assert_eq!(reader.read_entry("bb").unwrap(), b"second entry");
    }

    #[test]
    fn missing_entry_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol");
        write_volume(&path, &[("aa", b"x")]);
        let reader = VolumeReader::open(&path).unwrap();
        assert!(reader.read_entry("zz").is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol");
        std::fs::write(&path, b"NOTAVOLUME__________").unwrap();
        assert!(VolumeReader::open(&path).is_err());
    }

    #[test]
    fn rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol");
        write_volume(&path, &[("aa", b"data")]);
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 6]).unwrap();
        assert!(VolumeReader::open(&path).is_err());
    }

    #[test]
    fn rejects_incompatible_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol");
        let manifest = VolumeManifest {
            version: 1,
            blocksize: 1024,
            blockhash: "md5".into(),
            filehash: "sha256".into(),
        };
        let w = VolumeWriter::create(&path, &manifest).unwrap();
        w.finish().unwrap();
        let err = VolumeReader::open(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported hash algorithms"));
    }

    #[test]
    fn empty_volume_has_only_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol");
        write_volume(&path, &[]);
        let reader = VolumeReader::open(&path).unwrap();
        assert_eq!(reader.entry_names().count(), 1);
    }
}
