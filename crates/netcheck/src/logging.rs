// Tracing setup: stderr by default, a non-blocking file writer when
// `log_file` is configured.

use std::path::Path;

use netcheck_config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::DaemonError;

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
const CRATES: [&str; 4] = ["netcheck", "netcheck_core", "netcheck_nm", "netcheck_config"];

/// The configured level raised by one step per `-v`.
fn effective_level(configured: &str, verbose: u8) -> &'static str {
    let base = LEVELS.iter().position(|l| *l == configured).unwrap_or(2);
    let raised = base.saturating_add(usize::from(verbose)).min(LEVELS.len() - 1);
    LEVELS.get(raised).copied().unwrap_or("trace")
}

/// Our crates at `level`, everything else (zbus in particular) at warn.
fn default_filter(level: &str) -> String {
    let mut directives = vec!["warn".to_owned()];
    directives.extend(CRATES.iter().map(|krate| format!("{krate}={level}")));
    directives.join(",")
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process.
pub fn init(config: &LoggingConfig, verbose: u8) -> Result<Option<WorkerGuard>, DaemonError> {
    let level = effective_level(&config.level, verbose);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let Some(path) = config.file.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
        return Ok(None);
    };

    let (dir, name) = split_log_path(path)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
        .map_err(|e| DaemonError::Logging {
            message: format!("{}: {e}", path.display()),
        })?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
        .init();

    Ok(Some(guard))
}

fn split_log_path(path: &Path) -> Result<(&Path, &str), DaemonError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DaemonError::Logging {
            message: format!("{} is not a file path", path.display()),
        })?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_configured_level() {
        assert_eq!(effective_level("info", 0), "info");
        assert_eq!(effective_level("info", 1), "debug");
        assert_eq!(effective_level("warn", 5), "trace");
        assert_eq!(effective_level("nonsense", 0), "info");
    }

    #[test]
    fn default_filter_keeps_dependencies_quiet() {
        let filter = default_filter("debug");
        assert!(filter.starts_with("warn,"));
        assert!(filter.contains("netcheck_nm=debug"));
    }

    #[test]
    fn log_path_splits_into_dir_and_name() {
        let (dir, name) = split_log_path(Path::new("/var/log/netcheck.log")).expect("file path");
        assert_eq!(dir, Path::new("/var/log"));
        assert_eq!(name, "netcheck.log");

        let (dir, _) = split_log_path(Path::new("netcheck.log")).expect("file path");
        assert_eq!(dir, Path::new("."));

        assert!(split_log_path(Path::new("/")).is_err());
    }
}
