//! Append-only operation log.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::SecondsFormat;

/// Fixed location of the operation log.
const LOG_PATH: &str = "/usr/lib/HackerOS/hammer/logs/hammer-core.log";

/// Set to true once a log write failure has been reported.
static EMITTED_LOG_ERROR: AtomicBool = AtomicBool::new(false);

/// Append one timestamped record. Failures are reported to stderr once
/// per process and then swallowed; logging can never fail an operation.
pub(crate) fn append(msg: &str) {
    if let Err(e) = try_append(msg) {
        if !EMITTED_LOG_ERROR.swap(true, Ordering::SeqCst) {
            eprintln!("failed to write to {LOG_PATH}: {e}");
        }
    }
}

fn try_append(msg: &str) -> std::io::Result<()> {
    let path = std::path::Path::new(LOG_PATH);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let now = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    writeln!(f, "{now}  {msg}")
}
