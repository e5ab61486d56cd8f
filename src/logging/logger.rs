use crate::config::HostConfig;
use chrono::{DateTime, Local};
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

// ── Constants ───────────────────────────────────────────────────────────────

/// Number of buffered entries before an automatic flush.
const FLUSH_THRESHOLD: usize = 50;

/// Maximum log file size in bytes (20 MB) before rotation.
const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// Fraction of lines to drop during rotation (oldest 25%).
const ROTATION_DROP_FRACTION: f64 = 0.25;

const LOG_FILE_NAME: &str = "whist-host.log";

// ── Logger ──────────────────────────────────────────────────────────────────

struct LoggerInner {
    buffer: VecDeque<String>,
    log_path: PathBuf,
}

/// Buffered file logger. Session events arrive in bursts (a peer reconnects,
/// a round ends) so lines are batched and written together; errors flush
/// immediately so a crash leaves the cause on disk.
pub struct WhistLogger {
    inner: Mutex<LoggerInner>,
    level: LevelFilter,
}

impl WhistLogger {
    fn new(log_path: PathBuf, level: LevelFilter) -> Self {
        Self {
            inner: Mutex::new(LoggerInner {
                buffer: VecDeque::with_capacity(FLUSH_THRESHOLD),
                log_path,
            }),
            level,
        }
    }

    /// Queue one formatted line. Returns the batch to write when the buffer
    /// is full or `urgent` is set; the caller writes it outside the lock.
    fn push(&self, line: String, urgent: bool) -> Option<(PathBuf, Vec<String>)> {
        let mut inner = self.inner.lock();
        inner.buffer.push_back(line);
        if urgent || inner.buffer.len() >= FLUSH_THRESHOLD {
            Some((inner.log_path.clone(), inner.buffer.drain(..).collect()))
        } else {
            None
        }
    }

    fn drain(&self) -> (PathBuf, Vec<String>) {
        let mut inner = self.inner.lock();
        (inner.log_path.clone(), inner.buffer.drain(..).collect())
    }

    fn flush_to_disk(log_path: &Path, entries: Vec<String>) {
        if entries.is_empty() {
            return;
        }

        Self::maybe_rotate(log_path, MAX_FILE_SIZE);

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
            for line in &entries {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    /// If the log file exceeds `max_size`, drop the oldest lines.
    fn maybe_rotate(log_path: &Path, max_size: u64) {
        let too_big = fs::metadata(log_path).is_ok_and(|m| m.len() > max_size);
        if !too_big {
            return;
        }

        let Ok(file) = File::open(log_path) else {
            return;
        };
        let lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
        let drop_count = (lines.len() as f64 * ROTATION_DROP_FRACTION) as usize;

        if let Ok(mut file) = File::create(log_path) {
            for line in &lines[drop_count..] {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

/// `[YYYY-MM-DD HH:MM:SS.mmm] [LEVEL] [module] message`
fn format_line(at: DateTime<Local>, level: Level, module: &str, message: &str) -> String {
    format!(
        "[{}] [{}] [{}] {}",
        at.format("%Y-%m-%d %H:%M:%S%.3f"),
        level,
        module,
        message
    )
}

impl Log for WhistLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format_line(
            Local::now(),
            record.level(),
            record.module_path().unwrap_or("unknown"),
            &record.args().to_string(),
        );

        if let Some((path, entries)) = self.push(line, record.level() == Level::Error) {
            Self::flush_to_disk(&path, entries);
        }
    }

    fn flush(&self) {
        let (path, entries) = self.drain();
        Self::flush_to_disk(&path, entries);
    }
}

// ── Public init ─────────────────────────────────────────────────────────────

/// Install the file logger as the global `log` logger, writing to
/// `<log_dir>/whist-host.log` at the configured level.
pub fn init_logger(config: &HostConfig) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(&config.log_dir)?;

    let logger = WhistLogger::new(config.log_dir.join(LOG_FILE_NAME), config.log_level);
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(config.log_level);

    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
