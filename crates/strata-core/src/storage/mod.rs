pub mod local_backend;
pub mod rest_backend;
pub mod retry;

use std::io::{Read, Write};

use url::Url;

use crate::config::RepositoryConfig;
use crate::error::{Result, StrataError};

/// Abstract object store holding remote volumes keyed by filename.
///
/// Implementations are selected by URL scheme and must be usable from
/// multiple pipeline workers at once.
pub trait Backend: Send + Sync {
    /// Enumerate `(name, size)` of all stored objects.
    fn list(&self) -> Result<Vec<(String, u64)>>;

    /// Stream an object into `out`. Returns the byte count, or `None` if the
    /// object does not exist.
    fn get(&self, name: &str, out: &mut dyn Write) -> Result<Option<u64>>;

    /// Store an object from a reader. Overwrites. Returns the byte count.
    fn put(&self, name: &str, data: &mut dyn Read) -> Result<u64>;

    /// Remove an object. Removing a missing object is not an error.
    fn delete(&self, name: &str) -> Result<()>;

    /// Rename an object.
    fn rename(&self, old: &str, new: &str) -> Result<()>;

    /// Size of an object without fetching it, or `None` if missing.
    fn size(&self, name: &str) -> Result<Option<u64>>;
}

/// Parsed repository URL.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedUrl {
    /// Local filesystem directory.
    Local { path: String },
    /// REST object store (HTTP/HTTPS).
    Rest { url: String },
}

/// Parse a repository URL into its components.
///
/// Supported formats:
/// - Bare path (`/backups/repo`, `./relative`, `relative`) -> `Local`
/// - `file:///backups/repo` -> `Local`
/// - `http(s)://...` -> `Rest`
pub fn parse_backend_url(raw: &str) -> Result<ParsedUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StrataError::Config("repository URL must not be empty".into()));
    }

    // Bare paths are local.
    if !trimmed.contains("://") {
        return Ok(ParsedUrl::Local {
            path: trimmed.to_string(),
        });
    }

    let url = Url::parse(trimmed)
        .map_err(|e| StrataError::Config(format!("invalid repository URL '{trimmed}': {e}")))?;

    match url.scheme() {
        "file" => {
            let path = url.path().to_string();
            if path.is_empty() {
                return Err(StrataError::Config("file:// URL has empty path".into()));
            }
            Ok(ParsedUrl::Local { path })
        }
        "http" | "https" => Ok(ParsedUrl::Rest {
            url: trimmed.to_string(),
        }),
        other => Err(StrataError::UnsupportedBackend(format!(
            "unsupported URL scheme: '{other}'"
        ))),
    }
}

/// Build a storage backend from the repository configuration.
pub fn backend_from_config(cfg: &RepositoryConfig) -> Result<Box<dyn Backend>> {
    match parse_backend_url(&cfg.url)? {
        ParsedUrl::Local { path } => Ok(Box::new(local_backend::LocalBackend::new(&path)?)),
        ParsedUrl::Rest { url } => Ok(Box::new(rest_backend::RestBackend::new(
            &url,
            cfg.rest_token.as_deref(),
            cfg.retry.clone(),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_absolute_path_is_local() {
        assert_eq!(
            parse_backend_url("/backups/repo").unwrap(),
            ParsedUrl::Local {
                path: "/backups/repo".into()
            }
        );
    }

    #[test]
    fn bare_relative_path_is_local() {
        assert_eq!(
            parse_backend_url("my-repo").unwrap(),
            ParsedUrl::Local {
                path: "my-repo".into()
            }
        );
    }

    #[test]
    fn file_url_is_local() {
        assert_eq!(
            parse_backend_url("file:///backups/repo").unwrap(),
            ParsedUrl::Local {
                path: "/backups/repo".into()
            }
        );
    }

    #[test]
    fn https_is_rest() {
        assert_eq!(
            parse_backend_url("https://backup.example.com/repo").unwrap(),
            ParsedUrl::Rest {
                url: "https://backup.example.com/repo".into()
            }
        );
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let err = parse_backend_url("ftp://host/path").unwrap_err();
        assert!(err.to_string().contains("unsupported URL scheme"));
    }

    #[test]
    fn empty_url_rejected() {
        let err = parse_backend_url("   ").unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }
}
