use anyhow::Result;
use chrono::Utc;
use cohere_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only activity log under the workspace runtime directory, plus
/// optional verbose mirroring to stderr.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("agent.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Record one structured line: `<rfc3339> <KIND> <detail>`.
    pub fn record(&self, kind: &str, detail: &str) -> Result<()> {
        self.append_log_line(&format!("{} {kind} {detail}", Utc::now().to_rfc3339()))
    }

    /// Log a message to stderr with `[cohere]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[cohere] {msg}");
        }
    }

    /// Log a warning to stderr and append it to the log file.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[cohere WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
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
