//! Raw host readers over procfs and statvfs.

pub mod cpu;
pub mod disk;
pub mod memory;

pub use cpu::CpuSampler;
pub use disk::FilesystemUsage;
pub use memory::MemoryMetrics;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// procfs mount of the host when the exporter runs in a container
pub const HOST_PROC: &str = "/host/proc";
/// procfs of the current namespace
pub const DEFAULT_PROC: &str = "/proc";

/// Handle on a procfs mount point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Prefer the host's procfs when it is mounted at `/host/proc`
    pub fn detect() -> Self {
        if Path::new(HOST_PROC).join("stat").exists() {
            Self::new(HOST_PROC)
        } else {
            Self::new(DEFAULT_PROC)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Read a file below the procfs root
    pub fn read(&self, relative: impl AsRef<Path>) -> Result<String> {
        let path = self.path(relative);
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let procfs = ProcFs::new(dir.path());
        fs::write(dir.path().join("loadavg"), "0.10 0.20 0.30 1/100 42\n").unwrap();

        assert!(procfs.read("loadavg").unwrap().starts_with("0.10"));

        let err = procfs.read("stat").unwrap_err();
        assert!(format!("{err:#}").contains("stat"));
    }
}
