mod model;

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::{Result, StrataError};

pub use model::{Fileset, FilesetSelector, RemoteVolume, VolumeKind, VolumeState};

/// Catalog schema version stored in `PRAGMA user_version`.
pub const CATALOG_VERSION: i64 = 1;

/// Sentinel `blockset_id` marking a directory entry.
pub const FOLDER_BLOCKSET: i64 = -100;
/// Sentinel `blockset_id` marking a symlink entry.
pub const SYMLINK_BLOCKSET: i64 = -200;

/// Catalog schema. The restore path only reads it; the backup path (out of
/// scope here) and test fixtures create it.
pub const SCHEMA: &str = "
PRAGMA user_version=1;
CREATE TABLE remote_volume (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  size INTEGER NOT NULL,
  hash TEXT NOT NULL,
  kind TEXT NOT NULL,
  state TEXT NOT NULL,
  verification_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE block (
  id INTEGER PRIMARY KEY,
  hash TEXT NOT NULL,
  size INTEGER NOT NULL,
  volume_id INTEGER NOT NULL REFERENCES remote_volume(id)
);
CREATE INDEX block_hash_size ON block(hash, size);
CREATE TABLE blockset (
  id INTEGER PRIMARY KEY,
  length INTEGER NOT NULL,
  fullhash TEXT NOT NULL
);
CREATE TABLE blockset_entry (
  blockset_id INTEGER NOT NULL,
  idx INTEGER NOT NULL,
  block_id INTEGER NOT NULL REFERENCES block(id),
  PRIMARY KEY (blockset_id, idx)
);
CREATE TABLE file (
  id INTEGER PRIMARY KEY,
  path TEXT NOT NULL,
  blockset_id INTEGER NOT NULL,
  metadata_id INTEGER,
  hardlink_id INTEGER
);
CREATE TABLE fileset (
  id INTEGER PRIMARY KEY,
  timestamp INTEGER NOT NULL,
  volume_id INTEGER
);
CREATE TABLE fileset_entry (
  fileset_id INTEGER NOT NULL,
  file_id INTEGER NOT NULL REFERENCES file(id),
  PRIMARY KEY (fileset_id, file_id)
);
CREATE TABLE metadataset (
  id INTEGER PRIMARY KEY,
  blockset_id INTEGER NOT NULL
);
CREATE TABLE index_block_link (
  index_volume_id INTEGER NOT NULL,
  block_volume_id INTEGER NOT NULL
);
CREATE TABLE deleted_block (
  id INTEGER PRIMARY KEY,
  hash TEXT NOT NULL,
  size INTEGER NOT NULL,
  volume_id INTEGER NOT NULL
);
CREATE TABLE duplicate_block (
  block_id INTEGER NOT NULL REFERENCES block(id),
  volume_id INTEGER NOT NULL REFERENCES remote_volume(id)
);
";

/// One row of the streaming restore-plan query: file columns always present,
/// block columns present for content-bearing files.
#[derive(Debug, Clone)]
pub struct PlanRow {
    pub file_id: i64,
    pub path: String,
    pub blockset_id: i64,
    pub metadata_id: Option<i64>,
    pub hardlink_id: Option<i64>,
    /// Blockset length; `None` for folder/symlink sentinels.
    pub length: Option<u64>,
    /// Hex SHA-256 of the whole file.
    pub fullhash: Option<String>,
    pub block: Option<PlanBlock>,
}

#[derive(Debug, Clone)]
pub struct PlanBlock {
    pub index: i64,
    pub block_id: i64,
    /// Hex SHA-256 of the plaintext block.
    pub hash: String,
    pub size: u32,
    pub volume_id: i64,
    /// `None` when the referenced volume row is missing.
    pub volume_state: Option<VolumeState>,
}

/// Read-only view of the local catalog database.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open an existing catalog. Refuses missing files and version mismatches.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StrataError::Config(format!(
                "catalog not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version != CATALOG_VERSION {
            return Err(StrataError::CatalogCorrupt(format!(
                "unsupported catalog version {version} (expected {CATALOG_VERSION})"
            )));
        }
        Ok(Self { conn })
    }

    /// Wrap an already-open connection (fixtures, in-memory tests).
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Resolve a fileset selector against the catalog.
    pub fn resolve_fileset(&self, selector: &FilesetSelector) -> Result<Fileset> {
        let row_map = |r: &rusqlite::Row<'_>| {
            Ok(Fileset {
                id: r.get(0)?,
                timestamp: r.get(1)?,
                volume_id: r.get(2)?,
            })
        };
        let found = match selector {
            FilesetSelector::Id(id) => self
                .conn
                .query_row(
                    "SELECT id, timestamp, volume_id FROM fileset WHERE id = ?1",
                    params![id],
                    row_map,
                )
                .optional()?,
            FilesetSelector::Latest => self
                .conn
                .query_row(
                    "SELECT id, timestamp, volume_id FROM fileset \
                     ORDER BY timestamp DESC, id DESC LIMIT 1",
                    [],
                    row_map,
                )
                .optional()?,
            FilesetSelector::Version(n) => self
                .conn
                .query_row(
                    "SELECT id, timestamp, volume_id FROM fileset \
                     ORDER BY timestamp DESC, id DESC LIMIT 1 OFFSET ?1",
                    params![*n as i64],
                    row_map,
                )
                .optional()?,
            FilesetSelector::Time(ts) => self
                .conn
                .query_row(
                    "SELECT id, timestamp, volume_id FROM fileset \
                     WHERE timestamp <= ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
                    params![ts],
                    row_map,
                )
                .optional()?,
        };
        found.ok_or_else(|| StrataError::Config(format!("no fileset matches {selector:?}")))
    }

    /// All volumes a restore may read from, keyed by id.
    pub fn restorable_volumes(&self) -> Result<HashMap<i64, RemoteVolume>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, size, hash, kind, state, verification_count \
             FROM remote_volume WHERE state IN ('Uploaded', 'Verified')",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = HashMap::new();
        while let Some(row) = rows.next()? {
            let size: i64 = row.get(2)?;
            if size < 0 {
                return Err(StrataError::CatalogCorrupt(format!(
                    "negative size for volume id {}",
                    row.get::<_, i64>(0)?
                )));
            }
            let vol = RemoteVolume {
                id: row.get(0)?,
                name: row.get(1)?,
                size: size as u64,
                content_hash: row.get(3)?,
                kind: VolumeKind::parse(&row.get::<_, String>(4)?)?,
                state: VolumeState::parse(&row.get::<_, String>(5)?)?,
                verification_count: row.get(6)?,
            };
            out.insert(vol.id, vol);
        }
        Ok(out)
    }

    /// Minimum restorable volume id per duplicated block. Consulted when a
    /// block's home volume is not restorable, and to honor the lowest-id
    /// tie-break when a block exists in several volumes.
    pub fn duplicate_volume_map(&self) -> Result<HashMap<i64, i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT db.block_id, MIN(db.volume_id) FROM duplicate_block db \
             JOIN remote_volume v ON v.id = db.volume_id \
             WHERE v.state IN ('Uploaded', 'Verified') \
             GROUP BY db.block_id",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = HashMap::new();
        while let Some(row) = rows.next()? {
            out.insert(row.get::<_, i64>(0)?, row.get::<_, i64>(1)?);
        }
        Ok(out)
    }

    /// Stream the restore plan for one fileset: every file (folders and
    /// symlinks included) with its blocks in `(file_id, block_index)` order.
    /// Zero-block files surface as a single row with `block = None`.
    ///
    /// This is the one big join of the restore path; rows are handed to the
    /// callback as they come off the cursor, nothing is materialized here.
    pub fn scan_fileset(
        &self,
        fileset_id: i64,
        mut on_row: impl FnMut(PlanRow) -> Result<()>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT f.id, f.path, f.blockset_id, f.metadata_id, f.hardlink_id, \
                    bs.length, bs.fullhash, \
                    be.idx, b.id, b.hash, b.size, b.volume_id, rv.state \
             FROM fileset_entry fe \
             JOIN file f ON f.id = fe.file_id \
             LEFT JOIN blockset bs ON bs.id = f.blockset_id \
             LEFT JOIN blockset_entry be ON be.blockset_id = bs.id \
             LEFT JOIN block b ON b.id = be.block_id \
             LEFT JOIN remote_volume rv ON rv.id = b.volume_id \
             WHERE fe.fileset_id = ?1 \
             ORDER BY f.id, be.idx",
        )?;
        let mut rows = stmt.query(params![fileset_id])?;
        while let Some(row) = rows.next()? {
            on_row(Self::plan_row(row)?)?;
        }
        Ok(())
    }

    /// Blocks of a file's metadata blob, with the blockset's length and hash.
    /// Metadata blobs are tiny (usually one block) so this materializes.
    pub fn metadata_blocks(&self, metadata_id: i64) -> Result<(u64, String, Vec<PlanBlock>)> {
        let (length, fullhash): (i64, String) = self
            .conn
            .query_row(
                "SELECT bs.length, bs.fullhash FROM metadataset ms \
                 JOIN blockset bs ON bs.id = ms.blockset_id WHERE ms.id = ?1",
                params![metadata_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| {
                StrataError::CatalogCorrupt(format!("dangling metadataset id {metadata_id}"))
            })?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT be.idx, b.id, b.hash, b.size, b.volume_id, rv.state \
             FROM metadataset ms \
             JOIN blockset_entry be ON be.blockset_id = ms.blockset_id \
             JOIN block b ON b.id = be.block_id \
             LEFT JOIN remote_volume rv ON rv.id = b.volume_id \
             WHERE ms.id = ?1 ORDER BY be.idx",
        )?;
        let mut rows = stmt.query(params![metadata_id])?;
        let mut blocks = Vec::new();
        while let Some(row) = rows.next()? {
            blocks.push(Self::block_cols(row, 0)?);
        }
        Ok((length as u64, fullhash, blocks))
    }

    fn plan_row(row: &rusqlite::Row<'_>) -> Result<PlanRow> {
        let length: Option<i64> = row.get(5)?;
        let block = if row.get::<_, Option<i64>>(8)?.is_some() {
            Some(Self::block_cols(row, 7)?)
        } else {
            None
        };
        Ok(PlanRow {
            file_id: row.get(0)?,
            path: row.get(1)?,
            blockset_id: row.get(2)?,
            metadata_id: row.get(3)?,
            hardlink_id: row.get(4)?,
            length: length.map(|l| l as u64),
            fullhash: row.get(6)?,
            block,
        })
    }

    /// Decode `(idx, block_id, hash, size, volume_id, state)` starting at
    /// column `base`.
    fn block_cols(row: &rusqlite::Row<'_>, base: usize) -> Result<PlanBlock> {
        let size: i64 = row.get(base + 3)?;
        if !(0..=u32::MAX as i64).contains(&size) {
            return Err(StrataError::CatalogCorrupt(format!(
                "block id {} has invalid size {size}",
                row.get::<_, i64>(base + 1)?
            )));
        }
        let state: Option<String> = row.get(base + 5)?;
        Ok(PlanBlock {
            index: row.get(base)?,
            block_id: row.get(base + 1)?,
            hash: row.get(base + 2)?,
            size: size as u32,
            volume_id: row.get(base + 4)?,
            volume_state: state.as_deref().map(VolumeState::parse).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_catalog() -> Catalog {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        Catalog::from_connection(conn)
    }

    fn insert_fileset(cat: &Catalog, id: i64, ts: i64) {
        cat.conn
            .execute(
                "INSERT INTO fileset (id, timestamp, volume_id) VALUES (?1, ?2, NULL)",
                params![id, ts],
            )
            .unwrap();
    }

    #[test]
    fn resolve_latest_prefers_newest_timestamp() {
        let cat = memory_catalog();
        insert_fileset(&cat, 1, 100);
        insert_fileset(&cat, 2, 300);
        insert_fileset(&cat, 3, 200);

        let fs = cat.resolve_fileset(&FilesetSelector::Latest).unwrap();
        assert_eq!(fs.id, 2);
    }

    #[test]
    fn resolve_version_counts_from_newest() {
        let cat = memory_catalog();
        insert_fileset(&cat, 1, 100);
        insert_fileset(&cat, 2, 300);
        insert_fileset(&cat, 3, 200);

        assert_eq!(
            cat.resolve_fileset(&FilesetSelector::Version(0)).unwrap().id,
            2
        );
        assert_eq!(
            cat.resolve_fileset(&FilesetSelector::Version(1)).unwrap().id,
            3
        );
        assert_eq!(
            cat.resolve_fileset(&FilesetSelector::Version(2)).unwrap().id,
            1
        );
        assert!(cat.resolve_fileset(&FilesetSelector::Version(3)).is_err());
    }

    #[test]
    fn resolve_time_picks_at_or_before() {
        let cat = memory_catalog();
        insert_fileset(&cat, 1, 100);
        insert_fileset(&cat, 2, 300);

        assert_eq!(
            cat.resolve_fileset(&FilesetSelector::Time(250)).unwrap().id,
            1
        );
        assert_eq!(
            cat.resolve_fileset(&FilesetSelector::Time(300)).unwrap().id,
            2
        );
        assert!(cat.resolve_fileset(&FilesetSelector::Time(50)).is_err());
    }

    #[test]
    fn restorable_volumes_filters_states() {
        let cat = memory_catalog();
        for (id, state) in [
            (1, "Uploaded"),
            (2, "Verified"),
            (3, "Temporary"),
            (4, "Deleting"),
        ] {
            cat.conn
                .execute(
                    "INSERT INTO remote_volume (id, name, size, hash, kind, state) \
                     VALUES (?1, ?2, 10, 'aa', 'Blocks', ?3)",
                    params![id, format!("vol-{id}"), state],
                )
                .unwrap();
        }
        let vols = cat.restorable_volumes().unwrap();
        assert_eq!(vols.len(), 2);
        assert!(vols.contains_key(&1) && vols.contains_key(&2));
    }

    #[test]
    fn scan_emits_zero_block_files() {
        let cat = memory_catalog();
        insert_fileset(&cat, 1, 100);
        cat.conn
            .execute(
                "INSERT INTO blockset (id, length, fullhash) VALUES (7, 0, ?1)",
                params![strata_types::BlockId::compute(b"").to_hex()],
            )
            .unwrap();
        cat.conn
            .execute(
                "INSERT INTO file (id, path, blockset_id) VALUES (1, 'empty.txt', 7)",
                [],
            )
            .unwrap();
        cat.conn
            .execute(
                "INSERT INTO fileset_entry (fileset_id, file_id) VALUES (1, 1)",
                [],
            )
            .unwrap();

        let mut rows = Vec::new();
        cat.scan_fileset(1, |r| {
            rows.push(r);
            Ok(())
        })
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].block.is_none());
        assert_eq!(rows[0].length, Some(0));
    }

    #[test]
    fn duplicate_volume_map_picks_lowest_restorable() {
        let cat = memory_catalog();
        for (id, state) in [(1, "Deleted"), (2, "Uploaded"), (3, "Verified")] {
            cat.conn
                .execute(
                    "INSERT INTO remote_volume (id, name, size, hash, kind, state) \
                     VALUES (?1, ?2, 10, 'aa', 'Blocks', ?3)",
                    params![id, format!("vol-{id}"), state],
                )
                .unwrap();
        }
        cat.conn
            .execute(
                "INSERT INTO block (id, hash, size, volume_id) VALUES (9, 'bb', 4, 1)",
                [],
            )
            .unwrap();
        for vid in [1, 2, 3] {
            cat.conn
                .execute(
                    "INSERT INTO duplicate_block (block_id, volume_id) VALUES (9, ?1)",
                    params![vid],
                )
                .unwrap();
        }
        let map = cat.duplicate_volume_map().unwrap();
        // Volume 1 is Deleted, so the lowest restorable candidate is 2.
        assert_eq!(map.get(&9), Some(&2));
    }
}
