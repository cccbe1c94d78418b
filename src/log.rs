//! Logging setup.
//!
//! Everything in the crate logs through `tracing`. The binary installs a
//! `fmt` subscriber that writes to `~/.conductor/conductor.log`, truncated on
//! startup, or to stderr when the file cannot be opened.
//!
//! Levels:
//! - ERROR: the coordinator's own bookkeeping failed
//! - WARN: a task failed, a message could not be delivered, a peer misbehaved
//! - INFO: requests accepted, trees finished, actors starting and stopping
//! - DEBUG: per-task transitions and assignments
//! - TRACE: every envelope sent and received
//!
//! Debug mode can be enabled with the `--debug` flag or `CONDUCTOR_DEBUG=1`.
//! `RUST_LOG` overrides both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Initialize logging at INFO.
pub fn init() -> bool {
    init_with_debug(false)
}

/// Initialize logging, at DEBUG when `debug` is set or the env var asks
/// for it.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_with_debug(debug: bool) -> bool {
    let level = if debug || debug_from_env() {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("conductor={}", level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, ansi) = match open_log_file() {
        Some(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}

fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Path of the log file, if a home directory is known.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".conductor").join("conductor.log"))
}

fn open_log_file() -> Option<File> {
    let path = log_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok()?;
    }
    File::create(path).ok()
}
