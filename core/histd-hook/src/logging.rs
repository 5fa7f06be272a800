//! File logging for the hook.
//!
//! The hook runs inside the user's interactive shell, so nothing may reach the
//! terminal. Output goes to a daily rolling file under `~/.histd/logs`.

use std::env;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::EnvFilter;

const LOG_DIR_ENV: &str = "HISTD_HOOK_LOG_DIR";

/// Installs the subscriber. The returned guard must live until exit or
/// buffered lines are lost.
pub fn init() -> Option<WorkerGuard> {
    let log_dir = match env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()?.join(".histd").join("logs"),
    };
    fs_err::create_dir_all(&log_dir).ok()?;

    let appender = rolling::daily(&log_dir, "hook.log");
    let (writer, guard) = non_blocking(appender);

    let filter =
        EnvFilter::try_from_env("HISTD_HOOK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(writer)
        .try_init()
        .ok()?;

    Some(guard)
}
