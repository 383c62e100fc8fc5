//! Shared fixtures: a catalog + remote store built from declarative file
//! maps, and instrumented backends for download-count assertions.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use strata_core::catalog::{self, Catalog, FilesetSelector, VolumeKind};
use strata_core::codec::{compress, encrypt_stream, CodecRegistry};
use strata_core::config::{
    CatalogConfig, CompressionConfig, EncryptionConfig, RepositoryConfig, RestoreLimits,
    RetryConfig, StrataConfig,
};
use strata_core::error::Result;
use strata_core::restore::{self, FileAttrs, RestoreOptions, RestoreSummary};
use strata_core::storage::{local_backend::LocalBackend, Backend};
use strata_core::volume::{VolumeManifest, VolumeName, VolumeWriter};
use strata_types::BlockId;

pub const TEST_KEY: [u8; 32] = [0x5A; 32];

pub struct Fixture {
    pub dir: TempDir,
    pub conn: Connection,
    pub remote: PathBuf,
    pub dest: PathBuf,
    pub tmp: PathBuf,
    pub limits: RestoreLimits,
    pub encrypted: bool,
    next_block: i64,
    next_blockset: i64,
    next_file: i64,
    next_volume: i64,
    next_meta: i64,
}

impl Fixture {
    pub fn new() -> Fixture {
        let dir = TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        let dest = dir.path().join("dest");
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::create_dir_all(&tmp).unwrap();

        let catalog_path = dir.path().join("catalog.db");
        let conn = Connection::open(&catalog_path).unwrap();
        conn.execute_batch(catalog::SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO fileset (id, timestamp, volume_id) VALUES (1, 1000, NULL)",
            [],
        )
        .unwrap();

        Fixture {
            dir,
            conn,
            remote,
            dest,
            tmp,
            limits: RestoreLimits::default(),
            encrypted: false,
            next_block: 1,
            next_blockset: 1,
            next_file: 1,
            next_volume: 1,
            next_meta: 1,
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.dir.path().join("catalog.db")
    }

    /// Build a volume containing `payloads` as blocks, upload it to the
    /// remote dir, and catalog it. Returns `(volume_id, block_ids)`.
    pub fn add_volume(
        &mut self,
        payloads: &[&[u8]],
        compression: &str,
        cipher: Option<&str>,
    ) -> (i64, Vec<i64>) {
        let volume_id = self.next_volume;
        self.next_volume += 1;

        let stamp = NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let name = VolumeName::generate("strata", VolumeKind::Blocks, stamp, compression, cipher)
            .unwrap()
            .format();

        let registry = CodecRegistry::with_defaults(3);
        let codec = registry.compression(compression).unwrap();

        let container_path = self.dir.path().join(format!("build-{volume_id}"));
        let mut writer = VolumeWriter::create(&container_path, &VolumeManifest::new(1024)).unwrap();
        let mut block_ids = Vec::new();
        let mut block_rows = Vec::new();
        for payload in payloads {
            let hash = BlockId::compute(payload);
            writer
                .add_entry(&hash.to_hex(), &compress(codec, payload).unwrap())
                .unwrap();

            let block_id = self.next_block;
            self.next_block += 1;
            block_rows.push((block_id, hash.to_hex(), payload.len() as i64));
            block_ids.push(block_id);
        }
        writer.finish().unwrap();

        let blob = match cipher {
            Some(cipher_name) => {
                self.encrypted = true;
                let engine = registry.cipher(cipher_name, &TEST_KEY).unwrap();
                let mut src = std::fs::File::open(&container_path).unwrap();
                let mut out = Vec::new();
                encrypt_stream(engine.as_ref(), &mut src, &mut out).unwrap();
                out
            }
            None => std::fs::read(&container_path).unwrap(),
        };
        std::fs::remove_file(&container_path).unwrap();
        std::fs::write(self.remote.join(&name), &blob).unwrap();

        self.conn
            .execute(
                "INSERT INTO remote_volume (id, name, size, hash, kind, state) \
                 VALUES (?1, ?2, ?3, ?4, 'Blocks', 'Verified')",
                params![
                    volume_id,
                    name,
                    blob.len() as i64,
                    hex::encode(Sha256::digest(&blob))
                ],
            )
            .unwrap();
        for (block_id, hash, size) in block_rows {
            self.conn
                .execute(
                    "INSERT INTO block (id, hash, size, volume_id) VALUES (?1, ?2, ?3, ?4)",
                    params![block_id, hash, size, volume_id],
                )
                .unwrap();
        }
        (volume_id, block_ids)
    }

    /// Name of a cataloged volume, for download-count assertions.
    pub fn volume_name(&self, volume_id: i64) -> String {
        self.conn
            .query_row(
                "SELECT name FROM remote_volume WHERE id = ?1",
                params![volume_id],
                |r| r.get(0),
            )
            .unwrap()
    }

    pub fn set_volume_state(&mut self, volume_id: i64, state: &str) {
        self.conn
            .execute(
                "UPDATE remote_volume SET state = ?1 WHERE id = ?2",
                params![state, volume_id],
            )
            .unwrap();
    }

    pub fn add_duplicate(&mut self, block_id: i64, volume_id: i64) {
        self.conn
            .execute(
                "INSERT INTO duplicate_block (block_id, volume_id) VALUES (?1, ?2)",
                params![block_id, volume_id],
            )
            .unwrap();
    }

    fn add_blockset(&mut self, block_ids: &[i64], payloads: &[&[u8]]) -> i64 {
        assert_eq!(block_ids.len(), payloads.len());
        let blockset_id = self.next_blockset;
        self.next_blockset += 1;

        let mut hasher = Sha256::new();
        let mut length = 0i64;
        for payload in payloads {
            hasher.update(payload);
            length += payload.len() as i64;
        }
        self.conn
            .execute(
                "INSERT INTO blockset (id, length, fullhash) VALUES (?1, ?2, ?3)",
                params![blockset_id, length, hex::encode(hasher.finalize())],
            )
            .unwrap();
        for (idx, block_id) in block_ids.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO blockset_entry (blockset_id, idx, block_id) VALUES (?1, ?2, ?3)",
                    params![blockset_id, idx as i64, block_id],
                )
                .unwrap();
        }
        blockset_id
    }

    /// Catalog a regular file whose content is the given blocks in order.
    pub fn add_file(&mut self, path: &str, block_ids: &[i64], payloads: &[&[u8]]) -> i64 {
        let blockset_id = self.add_blockset(block_ids, payloads);
        self.insert_file(path, blockset_id)
    }

    pub fn add_folder(&mut self, path: &str) -> i64 {
        self.insert_file(path, catalog::FOLDER_BLOCKSET)
    }

    pub fn add_symlink(&mut self, path: &str) -> i64 {
        self.insert_file(path, catalog::SYMLINK_BLOCKSET)
    }

    fn insert_file(&mut self, path: &str, blockset_id: i64) -> i64 {
        let file_id = self.next_file;
        self.next_file += 1;
        self.conn
            .execute(
                "INSERT INTO file (id, path, blockset_id) VALUES (?1, ?2, ?3)",
                params![file_id, path, blockset_id],
            )
            .unwrap();
        self.conn
            .execute(
                "INSERT INTO fileset_entry (fileset_id, file_id) VALUES (1, ?1)",
                params![file_id],
            )
            .unwrap();
        file_id
    }

    /// Serialize attributes the way the backup path would.
    pub fn attrs_blob(attrs: &FileAttrs) -> Vec<u8> {
        rmp_serde::to_vec(attrs).unwrap()
    }

    /// Catalog a metadata blob as a metadataset over existing blocks.
    pub fn add_metadataset(&mut self, block_ids: &[i64], payloads: &[&[u8]]) -> i64 {
        let blockset_id = self.add_blockset(block_ids, payloads);
        let meta_id = self.next_meta;
        self.next_meta += 1;
        self.conn
            .execute(
                "INSERT INTO metadataset (id, blockset_id) VALUES (?1, ?2)",
                params![meta_id, blockset_id],
            )
            .unwrap();
        meta_id
    }

    pub fn set_file_metadata(&mut self, file_id: i64, metadata_id: i64) {
        self.conn
            .execute(
                "UPDATE file SET metadata_id = ?1 WHERE id = ?2",
                params![metadata_id, file_id],
            )
            .unwrap();
    }

    pub fn set_hardlink(&mut self, file_id: i64, hardlink_id: i64) {
        self.conn
            .execute(
                "UPDATE file SET hardlink_id = ?1 WHERE id = ?2",
                params![hardlink_id, file_id],
            )
            .unwrap();
    }

    pub fn config(&self) -> StrataConfig {
        StrataConfig {
            catalog: CatalogConfig {
                path: self.catalog_path().display().to_string(),
            },
            repository: RepositoryConfig {
                url: self.remote.display().to_string(),
                prefix: "strata".into(),
                rest_token: None,
                retry: RetryConfig {
                    max_retries: 1,
                    retry_delay_ms: 1,
                    retry_max_delay_ms: 2,
                },
            },
            encryption: EncryptionConfig {
                cipher: if self.encrypted { "chacha".into() } else { "none".into() },
                key_hex: self.encrypted.then(|| hex::encode(TEST_KEY)),
            },
            compression: CompressionConfig::default(),
            tempdir: Some(self.tmp.display().to_string()),
            limits: self.limits.clone(),
        }
    }

    pub fn counting_backend(&self) -> Arc<CountingBackend> {
        Arc::new(CountingBackend::new(
            LocalBackend::create(&self.remote).unwrap(),
        ))
    }

    pub fn options(&self) -> RestoreOptions {
        RestoreOptions {
            fileset: FilesetSelector::Latest,
            paths: Vec::new(),
            dest: self.dest.clone(),
            overwrite: false,
            strict: false,
        }
    }

    pub fn run(&self, backend: Arc<dyn Backend>, opts: RestoreOptions) -> Result<RestoreSummary> {
        self.run_with_cancel(backend, opts, Arc::new(AtomicBool::new(false)))
    }

    pub fn run_with_cancel(
        &self,
        backend: Arc<dyn Backend>,
        opts: RestoreOptions,
        cancel: Arc<AtomicBool>,
    ) -> Result<RestoreSummary> {
        let catalog = Catalog::open(&self.catalog_path())?;
        restore::run(&self.config(), catalog, backend, &opts, cancel)
    }
}

/// Backend wrapper counting `get` calls per object.
pub struct CountingBackend {
    inner: LocalBackend,
    gets: Mutex<HashMap<String, u64>>,
}

impl CountingBackend {
    pub fn new(inner: LocalBackend) -> Self {
        Self {
            inner,
            gets: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_count(&self, name: &str) -> u64 {
        self.gets.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_gets(&self) -> u64 {
        self.gets.lock().unwrap().values().sum()
    }
}

impl Backend for CountingBackend {
    fn list(&self) -> Result<Vec<(String, u64)>> {
        self.inner.list()
    }

    fn get(&self, name: &str, out: &mut dyn Write) -> Result<Option<u64>> {
        *self
            .gets
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
        self.inner.get(name, out)
    }

    fn put(&self, name: &str, data: &mut dyn Read) -> Result<u64> {
        self.inner.put(name, data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name)
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.inner.rename(old, new)
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        self.inner.size(name)
    }
}

/// Backend wrapper that sleeps inside every `get`, giving cancellation
/// tests a window to fire mid-download.
pub struct SlowBackend {
    inner: Arc<CountingBackend>,
    delay: Duration,
}

impl SlowBackend {
    pub fn new(inner: Arc<CountingBackend>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl Backend for SlowBackend {
    fn list(&self) -> Result<Vec<(String, u64)>> {
        self.inner.list()
    }

    fn get(&self, name: &str, out: &mut dyn Write) -> Result<Option<u64>> {
        std::thread::sleep(self.delay);
        self.inner.get(name, out)
    }

    fn put(&self, name: &str, data: &mut dyn Read) -> Result<u64> {
        self.inner.put(name, data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name)
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.inner.rename(old, new)
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        self.inner.size(name)
    }
}
