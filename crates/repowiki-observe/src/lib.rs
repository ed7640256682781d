use anyhow::Result;
use chrono::Utc;
use repowiki_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only run log plus optional verbose mirroring to stderr.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(repo_root: &Path) -> Result<Self> {
        let dir = runtime_dir(repo_root);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log a message to stderr with `[repowiki]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[repowiki] {msg}");
        }
    }

    /// Log a warning — always written to the log file and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[repowiki WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    /// Record a run milestone in the log file.
    pub fn record(&self, msg: &str) -> Result<()> {
        self.append_log_line(&format!("{} {msg}", Utc::now().to_rfc3339()))
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
