//! Logging setup.
//!
//! Two modes, picked by `server.production`:
//! - **Production**: JSON lines to a daily-rolling file plus plain compact
//!   stdout for the service manager.
//! - **Development**: pretty stdout with span open/close events.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from
//! `ROLLCALL_LOG_LEVEL` (default `info`).

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Writer guards; dropping them loses buffered lines.
static GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

const LOG_FILE_PREFIX: &str = "rollcall";

/// Output flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// File plus journal-friendly stdout.
    Production,
    /// Human-friendly stdout.
    Development,
}

impl LogMode {
    /// Mode for the `server.production` flag.
    #[must_use]
    pub const fn from_production_flag(production: bool) -> Self {
        if production {
            Self::Production
        } else {
            Self::Development
        }
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or the log
/// directory cannot be created.
pub fn init(mode: LogMode) -> anyhow::Result<()> {
    let filter = env_filter()?;
    match mode {
        LogMode::Production => init_production(filter),
        LogMode::Development => {
            init_development(filter);
            Ok(())
        }
    }
}

fn env_filter() -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = std::env::var("ROLLCALL_LOG_LEVEL").ok();
    Ok(EnvFilter::try_new(default_directive(level.as_deref()))?)
}

/// Filter directive for a bare level, keeping HTTP internals one step quieter.
fn default_directive(level: Option<&str>) -> String {
    let level = level.filter(|l| !l.trim().is_empty()).unwrap_or("info");
    format!("{level},hyper=warn,tower_http=info")
}

fn init_production(filter: EnvFilter) -> anyhow::Result<()> {
    let dir = log_directory();
    std::fs::create_dir_all(&dir)?;

    let appender = RollingFileAppender::new(Rotation::DAILY, &dir, LOG_FILE_PREFIX);
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_writer(file_writer)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = GUARDS.set(vec![file_guard, stdout_guard]);
    tracing::info!(dir = %dir.display(), "File logging enabled");
    Ok(())
}

fn init_development(filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .init();
}

/// `ROLLCALL_LOG_DIR`, else the platform default.
fn log_directory() -> PathBuf {
    if let Some(dir) = std::env::var_os("ROLLCALL_LOG_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/rollcall")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "rollcall")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(None), "info,hyper=warn,tower_http=info");
        assert!(default_directive(Some("debug")).starts_with("debug,"));
        assert!(default_directive(Some("  ")).starts_with("info,"));
        assert!(EnvFilter::try_new(default_directive(Some("trace"))).is_ok());
    }

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(LogMode::from_production_flag(true), LogMode::Production);
        assert_eq!(LogMode::from_production_flag(false), LogMode::Development);
    }

    #[test]
    fn test_log_directory_is_not_empty() {
        assert!(!log_directory().as_os_str().is_empty());
    }
}
