//! Append-mode line sinks for the session's component logs.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// A mutex-guarded, append-only log file. Write failures are demoted to
/// tracing warnings: losing a diagnostic line must never stall a worker.
#[derive(Debug)]
pub struct LogSink {
    path: String,
    file: Mutex<File>,
}

impl LogSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            path: path.display().to_string(),
            file: Mutex::new(file),
        })
    }

    pub fn line(&self, message: impl AsRef<str>) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(error) = writeln!(file, "{}", message.as_ref()) {
            tracing::warn!(path = %self.path, %error, "dropping log line");
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}
