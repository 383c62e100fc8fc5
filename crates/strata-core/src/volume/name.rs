use chrono::NaiveDateTime;
use rand::RngCore;

use crate::catalog::VolumeKind;
use crate::error::{Result, StrataError};

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Parsed remote volume filename:
/// `<prefix>-<b|i|f>-<guid>-<iso8601>.<compression>[.<encryption>]`.
///
/// The name is immutable once the volume is uploaded; together with the
/// content hash it is the volume's identity. The codec extensions tell the
/// restore path how to open the blob without consulting anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    pub prefix: String,
    pub kind: VolumeKind,
    /// 32 lowercase hex chars.
    pub guid: String,
    /// UTC, second resolution.
    pub timestamp: NaiveDateTime,
    pub compression: String,
    pub encryption: Option<String>,
}

impl VolumeName {
    /// Mint a fresh name with a random guid and the current time.
    pub fn generate(
        prefix: &str,
        kind: VolumeKind,
        timestamp: NaiveDateTime,
        compression: &str,
        encryption: Option<&str>,
    ) -> Result<Self> {
        if prefix.is_empty() || prefix.contains('.') || prefix.contains('/') {
            return Err(StrataError::Config(format!(
                "volume prefix '{prefix}' must be non-empty and contain no '.' or '/'"
            )));
        }
        let mut guid_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut guid_bytes);
        Ok(Self {
            prefix: prefix.to_string(),
            kind,
            guid: hex::encode(guid_bytes),
            timestamp,
            compression: compression.to_string(),
            encryption: encryption.map(|e| e.to_string()),
        })
    }

    pub fn format(&self) -> String {
        let stamp = self.timestamp.format(STAMP_FORMAT);
        let mut name = format!(
            "{}-{}-{}-{}.{}",
            self.prefix,
            self.kind.letter(),
            self.guid,
            stamp,
            self.compression
        );
        if let Some(ref enc) = self.encryption {
            name.push('.');
            name.push_str(enc);
        }
        name
    }

    /// Parse a volume filename. The prefix may itself contain dashes, so the
    /// fixed fields are taken from the right.
    pub fn parse(name: &str) -> Result<Self> {
        let bad = |why: &str| StrataError::InvalidFormat(format!("volume name '{name}': {why}"));

        let mut dot_parts = name.split('.');
        let base = dot_parts.next().ok_or_else(|| bad("empty"))?;
        let compression = dot_parts.next().ok_or_else(|| bad("missing compression extension"))?;
        let encryption = dot_parts.next();
        if dot_parts.next().is_some() {
            return Err(bad("too many extensions"));
        }

        let mut dash_parts = base.rsplitn(4, '-');
        let stamp = dash_parts.next().ok_or_else(|| bad("missing timestamp"))?;
        let guid = dash_parts.next().ok_or_else(|| bad("missing guid"))?;
        let letter = dash_parts.next().ok_or_else(|| bad("missing kind"))?;
        let prefix = dash_parts.next().ok_or_else(|| bad("missing prefix"))?;

        if prefix.is_empty() {
            return Err(bad("empty prefix"));
        }
        let kind = match letter.chars().collect::<Vec<_>>()[..] {
            [c] => VolumeKind::from_letter(c).ok_or_else(|| bad("unknown kind letter"))?,
            _ => return Err(bad("kind must be a single letter")),
        };
        if guid.len() != 32 || !guid.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad("guid must be 32 hex chars"));
        }
        let timestamp = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
            .map_err(|_| bad("bad timestamp"))?;
        if compression.is_empty() {
            return Err(bad("empty compression extension"));
        }
        if encryption.is_some_and(str::is_empty) {
            return Err(bad("empty encryption extension"));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            kind,
            guid: guid.to_lowercase(),
            timestamp,
            compression: compression.to_string(),
            encryption: encryption.map(|e| e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn stamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(9, 26, 53)
            .unwrap()
    }

    #[test]
    fn format_parse_roundtrip() {
        let name = VolumeName::generate("strata", VolumeKind::Blocks, stamp(), "zst", Some("chacha"))
            .unwrap();
        let formatted = name.format();
        assert!(formatted.starts_with("strata-b-"));
        assert!(formatted.ends_with(".zst.chacha"));
        assert_eq!(VolumeName::parse(&formatted).unwrap(), name);
    }

    #[test]
    fn unencrypted_name_has_no_cipher_extension() {
        let name =
            VolumeName::generate("strata", VolumeKind::Index, stamp(), "lz4", None).unwrap();
        let formatted = name.format();
        assert!(formatted.contains("-i-"));
        assert!(formatted.ends_with(".lz4"));
        let parsed = VolumeName::parse(&formatted).unwrap();
        assert_eq!(parsed.encryption, None);
    }

    #[test]
    fn prefix_may_contain_dashes() {
        let raw = format!("my-backup-set-f-{}-20260314T092653Z.zst", "ab".repeat(16));
        let parsed = VolumeName::parse(&raw).unwrap();
        assert_eq!(parsed.prefix, "my-backup-set");
        assert_eq!(parsed.kind, VolumeKind::Files);
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(VolumeName::parse("noextension").is_err());
        assert!(VolumeName::parse("p-x-00-20260314T092653Z.zst").is_err()); // bad kind + guid
        assert!(VolumeName::parse(&format!("p-b-{}-notatime.zst", "00".repeat(16))).is_err());
        assert!(VolumeName::parse(&format!(
            "p-b-{}-20260314T092653Z.zst.chacha.extra",
            "00".repeat(16)
        ))
        .is_err());
    }

    #[test]
    fn generate_rejects_dotted_prefix() {
        assert!(
            VolumeName::generate("bad.prefix", VolumeKind::Blocks, stamp(), "zst", None).is_err()
        );
    }
}
