mod signal;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use strata_core::catalog::{Catalog, FilesetSelector};
use strata_core::config::{self, StrataConfig};
use strata_core::error::StrataError;
use strata_core::restore::{self, RestoreOptions, RestoreSummary};
use strata_core::storage;

const EXIT_FAILURE: i32 = 3;
const EXIT_USAGE: i32 = 4;
const EXIT_CATALOG: i32 = 5;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "strata", version, about = "Deduplicated, encrypted backup restore",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $STRATA_CONFIG              (environment variable)
  3. ./strata.yaml               (project)
  4. ~/.config/strata/config.yaml (user)

Environment variables:
  STRATA_CONFIG     Path to configuration file (overrides default search)
  STRATA_KEY        Hex-encoded 32-byte repository key")]
struct Cli {
    /// Path to configuration file (overrides STRATA_CONFIG and default search)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore files from a backup
    Restore {
        /// Fileset to restore: a numeric fileset id, or "latest"
        backup_id: String,

        /// Only restore paths matching this glob (repeatable)
        #[arg(long = "path")]
        paths: Vec<String>,

        /// Restore the Nth newest fileset (0 = latest)
        #[arg(long)]
        version: Option<usize>,

        /// Restore the newest fileset at or before this RFC 3339 time
        #[arg(long)]
        time: Option<String>,

        /// Destination directory
        #[arg(long = "to", default_value = ".")]
        to: String,

        /// Replace existing files whose content differs
        #[arg(long)]
        overwrite: bool,

        /// Treat the first per-file failure as fatal
        #[arg(long)]
        strict: bool,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(EXIT_USAGE);
        }
        Err(e) => {
            // Help and version output.
            let _ = e.print();
            return;
        }
    };

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    signal::install_signal_handlers();

    let source = match config::resolve_config_path(cli.config.as_deref()) {
        Some(s) => s,
        None => {
            eprintln!("Error: no configuration file found.");
            eprintln!("Create ./strata.yaml or pass --config <path>.");
            std::process::exit(EXIT_USAGE);
        }
    };
    let cfg = match config::load(&source) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(EXIT_USAGE);
        }
    };
    tracing::info!("Using config: {}", source.display());

    let code = match cli.command {
        Commands::Restore {
            backup_id,
            paths,
            version,
            time,
            to,
            overwrite,
            strict,
        } => run_restore(&cfg, backup_id, paths, version, time, to, overwrite, strict),
    };
    std::process::exit(code);
}

#[allow(clippy::too_many_arguments)]
fn run_restore(
    cfg: &StrataConfig,
    backup_id: String,
    paths: Vec<String>,
    version: Option<usize>,
    time: Option<String>,
    to: String,
    overwrite: bool,
    strict: bool,
) -> i32 {
    let fileset = match build_selector(&backup_id, version, time.as_deref()) {
        Ok(sel) => sel,
        Err(msg) => {
            eprintln!("Error: {msg}");
            return EXIT_USAGE;
        }
    };

    let catalog = match Catalog::open(std::path::Path::new(&cfg.catalog.path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return exit_code_for(&e);
        }
    };
    let backend = match storage::backend_from_config(&cfg.repository) {
        Ok(b) => Arc::from(b),
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_USAGE;
        }
    };

    let opts = RestoreOptions {
        fileset,
        paths,
        dest: PathBuf::from(to),
        overwrite,
        strict,
    };

    // Bridge the signal flag into the pipeline's cancellation token.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        std::thread::spawn(move || loop {
            if signal::SHUTDOWN.load(Ordering::SeqCst) {
                cancel.store(true, Ordering::Relaxed);
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        });
    }

    match restore::run(cfg, catalog, backend, &opts, cancel) {
        Ok(summary) => {
            print_summary(&summary);
            summary.exit_code()
        }
        Err(e) => {
            eprintln!("Error: {e}");
            exit_code_for(&e)
        }
    }
}

fn build_selector(
    backup_id: &str,
    version: Option<usize>,
    time: Option<&str>,
) -> Result<FilesetSelector, String> {
    if version.is_some() && time.is_some() {
        return Err("--version and --time are mutually exclusive".into());
    }
    if backup_id == "latest" {
        if let Some(n) = version {
            return Ok(FilesetSelector::Version(n));
        }
        if let Some(ts) = time {
            return Ok(FilesetSelector::Time(parse_time(ts)?));
        }
        return Ok(FilesetSelector::Latest);
    }
    match backup_id.parse::<i64>() {
        Ok(id) => {
            if version.is_some() || time.is_some() {
                Err("--version/--time cannot be combined with an explicit fileset id".into())
            } else {
                Ok(FilesetSelector::Id(id))
            }
        }
        Err(_) => Err(format!(
            "invalid backup id '{backup_id}' (expected a fileset id or \"latest\")"
        )),
    }
}

fn parse_time(raw: &str) -> Result<i64, String> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp());
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc().timestamp());
    }
    Err(format!(
        "invalid time '{raw}' (expected RFC 3339, e.g. 2026-03-14T09:26:53Z)"
    ))
}

fn exit_code_for(e: &StrataError) -> i32 {
    match e {
        StrataError::CatalogCorrupt(_) | StrataError::Sql(_) => EXIT_CATALOG,
        StrataError::Config(_) | StrataError::UnsupportedBackend(_) => EXIT_USAGE,
        StrataError::Cancelled => EXIT_CANCELLED,
        _ => EXIT_FAILURE,
    }
}

fn print_summary(summary: &RestoreSummary) {
    println!(
        "Restored {} files, {} dirs, {} symlinks, {} hardlinks ({})",
        summary.restored,
        summary.dirs,
        summary.symlinks,
        summary.hardlinks,
        format_bytes(summary.bytes_written),
    );
    if summary.skipped > 0 {
        println!("  {} files already up to date", summary.skipped);
    }
    if summary.downloads > 0 {
        println!("  {} volumes downloaded", summary.downloads);
    }
    if summary.warnings > 0 {
        println!("  {} metadata warnings", summary.warnings);
    }
    if summary.failed > 0 {
        println!("  {} files FAILED", summary.failed);
    }
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_latest_and_refinements() {
        assert_eq!(
            build_selector("latest", None, None).unwrap(),
            FilesetSelector::Latest
        );
        assert_eq!(
            build_selector("latest", Some(2), None).unwrap(),
            FilesetSelector::Version(2)
        );
        assert!(matches!(
            build_selector("latest", None, Some("2026-03-14T09:26:53Z")).unwrap(),
            FilesetSelector::Time(_)
        ));
    }

    #[test]
    fn selector_numeric_id_rejects_refinements() {
        assert_eq!(
            build_selector("42", None, None).unwrap(),
            FilesetSelector::Id(42)
        );
        assert!(build_selector("42", Some(1), None).is_err());
        assert!(build_selector("42", None, Some("2026-01-01T00:00:00Z")).is_err());
        assert!(build_selector("latest", Some(1), Some("2026-01-01T00:00:00Z")).is_err());
        assert!(build_selector("not-a-thing", None, None).is_err());
    }

    #[test]
    fn time_parsing_accepts_rfc3339_and_naive() {
        assert_eq!(parse_time("1970-01-01T00:00:00Z").unwrap(), 0);
        assert_eq!(parse_time("1970-01-01T00:01:00").unwrap(), 60);
        assert!(parse_time("yesterday").is_err());
    }
}
