//! Logging setup for the loopwatch binary.
//!
//! Human-facing output goes to stdout, so diagnostics go to stderr and to a
//! daily rolling file under `~/.loopwatch/logs`.

use std::env;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "LOOPWATCH_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "loopwatch.log";

/// Installs the global subscriber. Keep the returned guard alive for the
/// process lifetime or buffered file output is lost.
pub fn init() -> Option<WorkerGuard> {
    let filter = if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let Some(dir) = log_dir().filter(|dir| fs_ready(dir)) else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    };

    let (subscriber, guard) = file_subscriber(filter, &dir);
    subscriber.init();
    Some(guard)
}

/// Stderr keeps colour; the file layer never writes escape codes.
fn file_subscriber(
    filter: EnvFilter,
    dir: &Path,
) -> (impl tracing::Subscriber + Send + Sync + 'static, WorkerGuard) {
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer));
    (subscriber, guard)
}

fn debug_enabled() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".loopwatch").join("logs"))
}

fn fs_ready(dir: &Path) -> bool {
    fs_err::create_dir_all(dir).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_layer_writes_plain_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (subscriber, guard) = file_subscriber(EnvFilter::new("info"), dir.path());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(run_id = "r-1", "Stream gave up");
        });
        drop(guard);

        let mut contents = String::new();
        for entry in fs_err::read_dir(dir.path()).expect("read log dir") {
            let path = entry.expect("dir entry").path();
            contents.push_str(&fs_err::read_to_string(&path).expect("read log file"));
        }
        assert!(contents.contains("Stream gave up"), "log file: {contents:?}");
        assert!(contents.contains("r-1"));
        assert!(!contents.contains('\u{1b}'), "escape codes in log file");
    }
}
