//! Append-only diagnostics under `.sable/observe.log`.

use anyhow::Result;
use chrono::Utc;
use sable_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Observer {
    log_path: PathBuf,
    verbose: AtomicBool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: AtomicBool::new(false),
        })
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Structured event line, e.g. hook executions and turn summaries.
    pub fn record_event(&self, kind: &str, detail: &str) -> Result<()> {
        self.append_log_line(&format!("{} EVENT {kind} {detail}", Utc::now().to_rfc3339()))
    }

    /// Stderr line behind the verbose flag.
    pub fn verbose_log(&self, msg: &str) {
        if self.is_verbose() {
            eprintln!("[sable] {msg}");
        }
    }

    /// Warnings always reach stderr and the log file.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[sable WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
