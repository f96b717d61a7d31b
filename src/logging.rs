//! Process-wide `tracing` setup for the scene pipeline.
//!
//! Events go to stdout and to a daily-rotated file named by
//! [`LoggingConfig::file_name`]. The filter comes from `RUST_LOG` when set,
//! otherwise from [`LoggingConfig::level`].

use std::path::PathBuf;
use std::sync::{Once, OnceLock};

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

static INIT_LOGGING: Once = Once::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn log_dir(cfg: &LoggingConfig) -> PathBuf {
    match &cfg.dir {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("broxeen")
            .join("logs"),
    }
}

fn filter_directive(cfg: &LoggingConfig, rust_log: Option<String>) -> String {
    match rust_log {
        Some(directive) if !directive.trim().is_empty() => directive,
        _ => cfg.level.clone(),
    }
}

fn build_filter(cfg: &LoggingConfig) -> EnvFilter {
    let directive = filter_directive(cfg, std::env::var("RUST_LOG").ok());
    EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("[scene][WARN] Bad log filter {:?} ({}), using info", directive, err);
        EnvFilter::new("info")
    })
}

fn build_file_appender(cfg: &LoggingConfig) -> Option<(RollingFileAppender, PathBuf)> {
    let dir = log_dir(cfg);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("[scene][WARN] Failed to create log directory {}: {}", dir.display(), err);
        return None;
    }
    let file = dir.join(&cfg.file_name);
    Some((RollingFileAppender::new(Rotation::DAILY, &dir, &cfg.file_name), file))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(cfg: &LoggingConfig) {
    INIT_LOGGING.call_once(|| {
        let (file_layer, file_path) = match build_file_appender(cfg) {
            Some((appender, path)) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                LOG_GUARD.set(guard).ok();
                let layer = fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(writer);
                (Some(layer), Some(path))
            }
            None => (None, None),
        };

        let stdout_layer = fmt::layer().with_target(true).with_timer(UtcTime::rfc_3339());

        tracing_subscriber::registry()
            .with(build_filter(cfg))
            .with(stdout_layer)
            .with(file_layer)
            .init();

        match file_path {
            Some(path) => info!("Scene logging to stdout and {} (rotated daily)", path.display()),
            None => warn!("Scene logging to stdout only"),
        }
    });
}
