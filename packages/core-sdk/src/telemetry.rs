use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const LOG_FILE: &str = "sparks.log";

struct TelemetryState {
    enabled: bool,
    log_dir: PathBuf,
}

static TELEMETRY: Lazy<std::sync::RwLock<TelemetryState>> = Lazy::new(|| {
    std::sync::RwLock::new(TelemetryState {
        enabled: false,
        log_dir: PathBuf::from("logs"),
    })
});

/**
 * \brief Turn the diagnostic log on or off.
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY.write() {
        guard.enabled = enabled;
    }
}

pub fn is_enabled() -> bool {
    TELEMETRY.read().map(|g| g.enabled).unwrap_or(false)
}

/**
 * \brief Directory that receives `sparks.log`; created on first write.
 */
pub fn set_log_dir(dir: impl Into<PathBuf>) {
    if let Ok(mut guard) = TELEMETRY.write() {
        guard.log_dir = dir.into();
    }
}

/**
 * \brief Apply the telemetry part of the process configuration.
 */
pub fn configure(config: &crate::config::Config) {
    set_log_dir(config.log_dir.clone());
    set_enabled(config.telemetry_enabled);
}

pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

/**
 * \brief Record a failure. Echoed to stderr when the log file is off.
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        eprintln!("[ERROR] {} - {}", category, message);
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn current_log_dir() -> PathBuf {
    TELEMETRY
        .read()
        .map(|g| g.log_dir.clone())
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = current_log_dir();
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}
