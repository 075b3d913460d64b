// src/logging.rs
//
// Timestamped stderr logging with an optional log file mirror.
// Every component logs through `tlog!` with a `[component]` prefix:
//
//   14:02:11.347 [tcp] Connected to tcp://radio.local:8001

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Name of the symlink that always points at the newest log file.
const LATEST_LOG_NAME: &str = "serial-link.log";

/// Suffix shared by every timestamped log file in a log directory.
const LOG_SUFFIX: &str = "-serial-link.log";

/// Timestamped logs kept per directory; older ones are removed on init.
const KEEP_LOGS: usize = 10;

struct FileSink {
    file: File,
    path: PathBuf,
}

static SINK: Mutex<Option<FileSink>> = Mutex::new(None);

/// Local wall-clock time as `HH:MM:SS.mmm`.
#[doc(hidden)]
pub fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Write one already formatted line to stderr and, if enabled, the log file.
#[doc(hidden)]
pub fn emit(line: &str) {
    eprintln!("{}", line);
    if let Ok(mut guard) = SINK.lock() {
        if let Some(sink) = guard.as_mut() {
            let _ = writeln!(sink.file, "{}", line);
        }
    }
}

/// Timestamped logging macro.
/// Prepends `HH:MM:SS.mmm` local time to every message written to stderr.
/// Also writes to the log file when file logging is enabled.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(&format!(
            "{} {}",
            $crate::logging::timestamp(),
            format_args!($($arg)*)
        ))
    };
}

/// Start mirroring log output into a new timestamped file in `log_dir`,
/// pointing the `serial-link.log` symlink at it (Unix only).
/// Returns the path of the new log file.
pub fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir).map_err(|e| format!("Failed to create log dir: {}", e))?;

    let filename = format!(
        "{}{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S%.3f"),
        LOG_SUFFIX
    );
    let path = log_dir.join(&filename);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("Failed to create log file: {}", e))?;

    let link = log_dir.join(LATEST_LOG_NAME);
    let _ = std::fs::remove_file(&link);
    if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
        tlog!("[logging] Failed to create {} symlink: {}", LATEST_LOG_NAME, e);
    }

    prune_old_logs(log_dir, KEEP_LOGS);

    if let Ok(mut guard) = SINK.lock() {
        *guard = Some(FileSink {
            file,
            path: path.clone(),
        });
    }
    tlog!("[logging] File logging started: {}", path.display());

    Ok(path)
}

/// Stop file logging and close the log file.
pub fn stop_file_logging() {
    let stopped = SINK.lock().ok().and_then(|mut guard| guard.take());
    if let Some(sink) = stopped {
        drop(sink.file);
        tlog!("[logging] File logging stopped: {}", sink.path.display());
    }
}

/// Path of the file currently receiving log output, if any.
pub fn current_log_path() -> Option<PathBuf> {
    SINK.lock()
        .ok()
        .and_then(|guard| guard.as_ref().map(|sink| sink.path.clone()))
}

/// Remove all but the newest `keep` timestamped logs in `dir`.
/// File names sort chronologically.
fn prune_old_logs(dir: &Path, keep: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut logs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(LOG_SUFFIX) && n != LATEST_LOG_NAME)
        })
        .collect();
    logs.sort();

    let excess = logs.len().saturating_sub(keep);
    for old in &logs[..excess] {
        if let Err(e) = std::fs::remove_file(old) {
            tlog!("[logging] Failed to remove old log {}: {}", old.display(), e);
        }
    }
}
