use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{info, warn};

use crate::app::adb::paths::sanitize_file_component;

/// Append-only raw dump file for one device or process. The file is dropped once it grows past
/// `max_bytes` and starts over on the next append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpLog {
    path: PathBuf,
    max_bytes: u64,
}

impl DumpLog {
    pub fn new(path: PathBuf, max_bytes: u64) -> Self {
        Self { path, max_bytes }
    }

    /// `top_cpuinfo_<serial>.txt`
    pub fn cpu(dir: &Path, serial: &str, max_bytes: u64) -> Self {
        let name = format!("top_cpuinfo_{}.txt", sanitize_file_component(serial));
        Self::new(dir.join(name), max_bytes)
    }

    /// `dumpsys_meminfo_<process>.txt`
    pub fn memory(dir: &Path, process: &str, max_bytes: u64) -> Self {
        let name = format!("dumpsys_meminfo_{}.txt", sanitize_file_component(process));
        Self::new(dir.join(name), max_bytes)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, label: &str, body: &str, taken_at: DateTime<Local>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {label}:", taken_at.format("%Y-%m-%d %H-%M-%S"))?;
        writeln!(file, "{body}")?;
        writeln!(file)?;
        drop(file);

        let size = fs::metadata(&self.path)?.len();
        if size > self.max_bytes {
            fs::remove_file(&self.path)?;
            info!(path = %self.path.display(), size, "dump log rotated");
        }
        Ok(())
    }

    /// Dump logs are diagnostic only; a write failure never fails the sample.
    pub fn append_best_effort(&self, label: &str, body: &str, taken_at: DateTime<Local>) {
        if let Err(err) = self.append(label, body, taken_at) {
            warn!(path = %self.path.display(), error = %err, "failed to append dump log");
        }
    }
}
