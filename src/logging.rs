//! Logging and telemetry output.
//!
//! One stdout layer (plain or JSON per config) plus an optional rolling
//! file layer behind a non-blocking writer. The file layer doubles as the
//! durable sink for `target: "telemetry"` events, so enabling file logging
//! is what makes telemetry survive a restart.

use std::io;
use std::sync::OnceLock;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Keeps the background file writer flushing until process exit.
static FILE_FLUSH_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Filter precedence: `logging.level` from
/// config, then `RUST_LOG`, then info. Calling twice is a no-op.
pub fn init_with_config(cfg: &LoggingConfig) {
    let filter = match cfg.level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    };

    let json = cfg.format == LogFormat::Json;
    let file_writer = if cfg.enable_file_logging {
        rolling_writer(cfg)
    } else {
        None
    };

    // Every combination is expressed as an optional layer; absent ones
    // vanish from the stack instead of branching the whole init.
    let console_plain = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(io::stdout));
    let console_json = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(io::stdout)
    });
    let file_plain = file_writer.clone().filter(|_| !json).map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
    });
    let file_json = file_writer.filter(|_| json).map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(writer)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_plain)
        .with(console_json)
        .with(file_plain)
        .with(file_json)
        .try_init();
}

/// Open the rolling log file behind a non-blocking writer. Any problem is
/// reported on stderr and file logging stays off; the server keeps running
/// on stdout logs alone.
fn rolling_writer(cfg: &LoggingConfig) -> Option<tracing_appender::non_blocking::NonBlocking> {
    if let Err(err) = std::fs::create_dir_all(&cfg.dir) {
        eprintln!(
            "log directory '{}' is unusable ({err}); file logging disabled",
            cfg.dir
        );
        return None;
    }

    let appender = match cfg.rotation.trim().to_ascii_lowercase().as_str() {
        "daily" => tracing_appender::rolling::daily(&cfg.dir, &cfg.filename),
        "hourly" => tracing_appender::rolling::hourly(&cfg.dir, &cfg.filename),
        "never" => tracing_appender::rolling::never(&cfg.dir, &cfg.filename),
        other => {
            eprintln!("unknown log rotation '{other}', rotating daily");
            tracing_appender::rolling::daily(&cfg.dir, &cfg.filename)
        }
    };

    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_FLUSH_GUARD.set(guard);
    Some(writer)
}
