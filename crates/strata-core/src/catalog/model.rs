use std::fmt;

use crate::error::{Result, StrataError};

/// What a remote volume contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Blocks,
    Index,
    Files,
}

impl VolumeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeKind::Blocks => "Blocks",
            VolumeKind::Index => "Index",
            VolumeKind::Files => "Files",
        }
    }

    /// The single-letter form used in volume filenames.
    pub fn letter(self) -> char {
        match self {
            VolumeKind::Blocks => 'b',
            VolumeKind::Index => 'i',
            VolumeKind::Files => 'f',
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Blocks" => Ok(VolumeKind::Blocks),
            "Index" => Ok(VolumeKind::Index),
            "Files" => Ok(VolumeKind::Files),
            other => Err(StrataError::CatalogCorrupt(format!(
                "unknown volume kind '{other}'"
            ))),
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            'b' => Some(VolumeKind::Blocks),
            'i' => Some(VolumeKind::Index),
            'f' => Some(VolumeKind::Files),
            _ => None,
        }
    }
}

/// Remote volume lifecycle state. The catalog stores the canonical spellings;
/// anything else is treated as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Temporary,
    Uploading,
    Uploaded,
    Verified,
    Deleting,
    Deleted,
}

impl VolumeState {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeState::Temporary => "Temporary",
            VolumeState::Uploading => "Uploading",
            VolumeState::Uploaded => "Uploaded",
            VolumeState::Verified => "Verified",
            VolumeState::Deleting => "Deleting",
            VolumeState::Deleted => "Deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Temporary" => Ok(VolumeState::Temporary),
            "Uploading" => Ok(VolumeState::Uploading),
            "Uploaded" => Ok(VolumeState::Uploaded),
            "Verified" => Ok(VolumeState::Verified),
            "Deleting" => Ok(VolumeState::Deleting),
            "Deleted" => Ok(VolumeState::Deleted),
            other => Err(StrataError::CatalogCorrupt(format!(
                "unknown volume state '{other}'"
            ))),
        }
    }

    /// Only fully-uploaded volumes may serve a restore.
    pub fn is_restorable(self) -> bool {
        matches!(self, VolumeState::Uploaded | VolumeState::Verified)
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote volume as cataloged locally. `name` is immutable; name plus
/// content hash are the volume's identity.
#[derive(Debug, Clone)]
pub struct RemoteVolume {
    pub id: i64,
    pub name: String,
    pub size: u64,
    /// Hex SHA-256 of the stored (encrypted) blob.
    pub content_hash: String,
    pub kind: VolumeKind,
    pub state: VolumeState,
    /// Bumped by verification sampling; not consulted on restore.
    pub verification_count: i64,
}

/// A point-in-time snapshot row.
#[derive(Debug, Clone)]
pub struct Fileset {
    pub id: i64,
    /// Unix seconds.
    pub timestamp: i64,
    pub volume_id: Option<i64>,
}

/// How the caller names the fileset to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilesetSelector {
    Latest,
    /// Explicit fileset id.
    Id(i64),
    /// Nth newest, 0 = latest.
    Version(usize),
    /// Most recent fileset at or before the given unix time.
    Time(i64),
}
