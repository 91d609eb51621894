//! Exception-file persistence.
//!
//! Unexpected connection failures are appended to disk so operators can
//! inspect them after the fact. The supervisor deduplicates by
//! `(category, message)` before calling [`ExceptionLog::write`], so a flood
//! of identical failures produces a single file per distinct message.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

/// Writes one plain-text file per reported exception.
#[derive(Clone, Debug)]
pub struct ExceptionLog {
    dir: PathBuf,
}

impl ExceptionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one exception report. `category` tags the failure family
    /// (e.g. `connection_failed`, `connection_lost`).
    pub fn write(&self, category: &str, message: &str, detail: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self
            .dir
            .join(format!("{category}_{stamp}_{}.txt", Uuid::new_v4()));
        let mut file = fs::File::create(&path)?;
        writeln!(file, "time: {}", Utc::now().to_rfc3339())?;
        writeln!(file, "category: {category}")?;
        writeln!(file, "message: {message}")?;
        writeln!(file, "detail: {detail}")?;
        Ok(path)
    }
}
