use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::Level;

const LOG_FILE_NAME: &str = "launcher.log";

pub fn log_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(LOG_FILE_NAME)
}

/// Opens `<logs_dir>/launcher.log` for append and routes `tracing` output to
/// it. A subscriber that is already installed is left in place.
pub fn init(logs_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(logs_dir).with_context(|| format!("create {}", logs_dir.display()))?;
    let path = log_path(logs_dir);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level_from_env())
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(path)
}

fn level_from_env() -> Level {
    parse_level(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
}

fn parse_level(raw: &str) -> Level {
    match raw.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
