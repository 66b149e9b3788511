//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level:
//!
//! ```bash
//! RUST_LOG=etude_core=debug etude
//! ```
//!
//! Events are handed to a background writer thread so the reactor never
//! blocks on the sink. With `log_file` set, output goes to a daily-rotated
//! file (`<log_file>.YYYY-MM-DD`) without ANSI colours. With
//! `log_enabled = false` no subscriber is installed and every event is
//! discarded.

use crate::config::Config;
use crate::error::{EtudeError, EtudeResult};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber described by `cfg`.
///
/// Returns `Ok(None)` when logging is disabled. The returned guard flushes
/// buffered lines when dropped, so keep it alive for the life of the process.
/// Fails if the log file cannot be created or a global subscriber is
/// already set.
pub fn init_logging(cfg: &Config) -> EtudeResult<Option<WorkerGuard>> {
    if !cfg.log_enabled {
        return Ok(None);
    }
    let filter = env_filter(&cfg.log_level);
    let registry = tracing_subscriber::registry().with(filter);

    let (result, guard) = match &cfg.log_file {
        Some(path) => {
            let appender = daily_appender(path)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let result = registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_thread_names(true)
                        .with_writer(writer),
                )
                .try_init();
            (result, guard)
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            let result = registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_thread_names(true)
                        .with_writer(writer),
                )
                .try_init();
            (result, guard)
        }
    };
    result.map_err(|e| EtudeError::Config(format!("logging already initialised: {}", e)))?;
    Ok(Some(guard))
}

fn daily_appender(path: &Path) -> EtudeResult<RollingFileAppender> {
    let prefix = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EtudeError::Config(format!("invalid log file {}", path.display())))?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .build(dir)
        .map_err(|e| EtudeError::Config(format!("cannot open log file {}: {}", path.display(), e)))
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn disabled_logging_installs_nothing() {
        let cfg = Config {
            log_enabled: false,
            ..Config::default()
        };
        assert!(init_logging(&cfg).unwrap().is_none());
    }

    #[test]
    fn unopenable_log_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the log directory should be
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let cfg = Config {
            log_file: Some(blocker.join("etude.log")),
            ..Config::default()
        };
        assert!(matches!(init_logging(&cfg), Err(EtudeError::Config(_))));
    }

    #[test]
    fn rolling_file_lands_next_to_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let appender = daily_appender(&dir.path().join("etude.log")).unwrap();
        drop(appender);
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("etude.log")), "{:?}", names);
    }

    #[test]
    fn bad_level_falls_back() {
        // must not panic on a malformed directive
        let _ = env_filter("not=a=level");
    }
}
