use std::fs;
use std::path::{Path, PathBuf};

use colored::Colorize;
use log::LevelFilter;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("A global logger is already installed: {0}")]
    SetLogger(#[from] log::SetLoggerError),
}

/// Maps a level name to a filter. Unknown names fall back to `Info`.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn colored_level(level: log::Level) -> colored::ColoredString {
    let name = level.to_string();
    match level {
        log::Level::Error => name.red().bold(),
        log::Level::Warn => name.yellow(),
        log::Level::Info => name.green(),
        log::Level::Debug => name.blue(),
        log::Level::Trace => name.dimmed(),
    }
}

/// Installs the global logger: colored stdout, plus `<app_name>_<timestamp>.log`
/// in `log_dir` when given. Older log files of the same app are removed.
/// Returns the path of the new log file.
pub fn setup_logging(app_name: &str, log_dir: Option<&Path>, level: LevelFilter) -> Result<Option<PathBuf>, LoggerError> {
    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                colored_level(record.level()),
                message
            ))
        })
        .chain(std::io::stdout());

    let mut dispatch = fern::Dispatch::new()
        .level(level)
        // The WebSocket stack is very chatty below warn.
        .level_for("tungstenite", LevelFilter::Warn)
        .level_for("tokio_tungstenite", LevelFilter::Warn)
        .chain(console);

    let mut log_path = None;
    if let Some(dir) = log_dir {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        cleanup_old_logs(dir, app_name, 0)?;

        let file_name = format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
        let path = dir.join(file_name);
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}[{}][{}] {}",
                    chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                    record.target(),
                    record.level(),
                    message
                ))
            })
            .chain(fern::log_file(&path)?);
        dispatch = dispatch.chain(file);
        log_path = Some(path);
    }

    dispatch.apply()?;
    Ok(log_path)
}

/// Deletes `<app_name>_*.log` files in `log_dir`, keeping the `keep` newest.
/// Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str, keep: usize) -> Result<usize, LoggerError> {
    let prefix = format!("{}_", app_name);
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}
