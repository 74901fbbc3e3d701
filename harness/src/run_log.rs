use crate::error::{self, Result};
use chrono::{DateTime, Utc};
use env_logger::{Builder, Target};
use log::{info, Level, LevelFilter};
use snafu::ResultExt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Log targets that render as markers instead of leveled lines.
pub const SECTION: &str = "e2e_harness::section";
pub const TEST: &str = "e2e_harness::test";
pub const PASS: &str = "e2e_harness::pass";
pub const FAIL: &str = "e2e_harness::fail";

/// The crates whose records are shown at the requested level.
const CRATES: [&str; 3] = ["e2e_harness", "e2e_model", "kapparmor_e2e"];

const SEPARATOR_WIDTH: usize = 42;

pub fn section(title: &str) {
    info!(target: SECTION, "{}", title);
}

pub fn test(message: &str) {
    info!(target: TEST, "{}", message);
}

pub fn pass(message: &str) {
    info!(target: PASS, "{}", message);
}

pub fn fail(message: &str) {
    info!(target: FAIL, "{}", message);
}

/// `output/e2e_test_<YYYYmmdd_HHMMSS>.log` below `dir`.
pub fn default_log_path(dir: &Path, now: DateTime<Utc>) -> PathBuf {
    dir.join(format!("e2e_test_{}.log", now.format("%Y%m%d_%H%M%S")))
}

/// Renders one record the way it appears on the console and in the run log.
pub fn render(target: &str, level: Level, message: &str) -> String {
    match target {
        SECTION => {
            let separator = "=".repeat(SEPARATOR_WIDTH);
            format!("\n{0}\n[SECTION] {1}\n{0}\n", separator, message)
        }
        TEST => format!("[TEST] {}", message),
        PASS => format!("[PASS] ✓ {}", message),
        FAIL => format!("[FAIL] ✗ {}", message),
        _ => format!("[{}] {}", level, message),
    }
}

/// Writes everything to both stdout and the run log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()?;
        self.file.flush()
    }
}

/// Initializes the logger. If `RUST_LOG` is set it decides what is logged, otherwise records of
/// this workspace are shown at `level` and everything else only on errors. Records go to stdout
/// and to a new file at `log_file`.
pub fn init(level: LevelFilter, log_file: &Path) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent).context(error::LogFileSnafu { path: log_file })?;
    }
    let file = File::create(log_file).context(error::LogFileSnafu { path: log_file })?;

    let mut builder = match std::env::var(env_logger::DEFAULT_FILTER_ENV).ok() {
        // RUST_LOG exists; env_logger will use it.
        Some(_) => Builder::from_default_env(),
        None => {
            let mut builder = Builder::new();
            builder.filter_level(LevelFilter::Error);
            for name in CRATES {
                builder.filter(Some(name), level);
            }
            builder
        }
    };
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}",
                render(record.target(), record.level(), &record.args().to_string())
            )
        })
        .target(Target::Pipe(Box::new(Tee { file })))
        .try_init()
        .context(error::LoggerSnafu)
}
