//! Filesystem usage for mounted block devices.

use super::ProcFs;
use anyhow::{Context, Result};
use std::path::Path;

/// Mountpoints under these prefixes are pseudo filesystems and never reported
const EXCLUDED_PREFIXES: &[&str] = &["/proc", "/sys", "/dev", "/run"];

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
}

/// Space usage of one filesystem, sizes in bytes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilesystemUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub used_percent: f64,
}

/// List device-backed mounts worth reporting
pub fn read_mounts(procfs: &ProcFs) -> Result<Vec<MountEntry>> {
    let mounts = procfs.read("mounts")?;
    Ok(parse_mounts(&mounts))
}

pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    let mut entries: Vec<MountEntry> = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }

        // Only filesystems backed by a device node
        if !parts[0].starts_with('/') {
            continue;
        }

        let mountpoint = unescape_mount_path(parts[1]);
        if is_excluded(&mountpoint) {
            continue;
        }

        // Bind mounts of the same device show up repeatedly; keep the first
        if entries.iter().any(|e| e.mountpoint == mountpoint) {
            continue;
        }

        entries.push(MountEntry {
            device: parts[0].to_string(),
            mountpoint,
            fstype: parts[2].to_string(),
        });
    }

    entries
}

fn is_excluded(mountpoint: &str) -> bool {
    EXCLUDED_PREFIXES.iter().any(|prefix| {
        mountpoint == *prefix
            || mountpoint
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// The mount table escapes space, tab, newline and backslash as `\ooo`
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(byte) = digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Query space usage of the filesystem holding `path`
pub fn filesystem_usage(path: &Path) -> Result<FilesystemUsage> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path.to_string_lossy().as_bytes())
        .with_context(|| format!("Invalid path {}", path.display()))?;
    let mut statvfs = MaybeUninit::<libc::statvfs>::uninit();

    let result = unsafe { libc::statvfs(c_path.as_ptr(), statvfs.as_mut_ptr()) };
    if result != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs failed for {}", path.display()));
    }

    let statvfs = unsafe { statvfs.assume_init() };
    let block_size = statvfs.f_frsize as u64;
    let total = (statvfs.f_blocks as u64).saturating_mul(block_size);
    let free = (statvfs.f_bfree as u64).saturating_mul(block_size);
    let available = (statvfs.f_bavail as u64).saturating_mul(block_size);
    let used = total.saturating_sub(free);

    // Same convention as df: percentage of the space usable by unprivileged users
    let usable = used.saturating_add(available);
    let used_percent = if usable > 0 {
        100.0 * used as f64 / usable as f64
    } else {
        0.0
    };

    Ok(FilesystemUsage {
        total,
        used,
        available,
        used_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 0
tmpfs /run tmpfs rw,nosuid,nodev 0 0
/dev/sdb1 /mnt/my\\040data xfs rw,relatime 0 0
/dev/sda2 /run/media ext4 rw 0 0
/dev/sda3 /sysroot ext4 rw 0 0
overlay /var/lib/docker/overlay2/x/merged overlay rw 0 0
";

    #[test]
    fn test_parse_mounts_filters_pseudo_filesystems() {
        let mounts = parse_mounts(MOUNTS);
        let points: Vec<&str> = mounts.iter().map(|m| m.mountpoint.as_str()).collect();
        assert_eq!(points, vec!["/", "/mnt/my data", "/sysroot"]);
        assert_eq!(mounts[1].device, "/dev/sdb1");
        assert_eq!(mounts[1].fstype, "xfs");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape_mount_path("/a\\040b"), "/a b");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
        assert_eq!(unescape_mount_path("/trailing\\"), "/trailing\\");
    }

    #[test]
    fn test_usage_of_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let usage = filesystem_usage(dir.path()).unwrap();
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
        assert!((0.0..=100.0).contains(&usage.used_percent));
    }

    #[test]
    fn test_usage_of_missing_path_fails() {
        assert!(filesystem_usage(Path::new("/definitely/not/here")).is_err());
    }
}
