//! Memory usage from cgroup accounting.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::updater::MemoryProbe;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

// cgroup v1 reports "no limit" as a page-aligned i64::MAX
const V1_UNLIMITED: u64 = 1 << 62;

/// A [MemoryProbe] that reads the memory usage and limit of the cgroup this
/// process runs in.
///
/// Both cgroup v2 (`memory.current` and `memory.max`) and cgroup v1
/// (`memory/memory.usage_in_bytes` and `memory/memory.limit_in_bytes`) are
/// supported. Usage is reported as 0% when there's no limit or the cgroup
/// files can't be read.
#[derive(Debug, Clone)]
pub struct CgroupMemory {
    root: PathBuf,
}

impl Default for CgroupMemory {
    fn default() -> Self {
        Self::with_root(CGROUP_ROOT)
    }
}

impl CgroupMemory {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Current usage and limit in bytes, if there is a limit.
    pub fn usage_and_limit(&self) -> Option<(u64, u64)> {
        self.read_v2().or_else(|| self.read_v1())
    }

    fn read_v2(&self) -> Option<(u64, u64)> {
        let limit = read_trimmed(&self.root.join("memory.max"))?;
        if limit == "max" {
            return None;
        }
        let limit = limit.parse().ok()?;
        let usage = read_trimmed(&self.root.join("memory.current"))?.parse().ok()?;
        Some((usage, limit))
    }

    fn read_v1(&self) -> Option<(u64, u64)> {
        let dir = self.root.join("memory");
        let limit: u64 = read_trimmed(&dir.join("memory.limit_in_bytes"))?
            .parse()
            .ok()?;
        if limit >= V1_UNLIMITED {
            return None;
        }
        let usage = read_trimmed(&dir.join("memory.usage_in_bytes"))?
            .parse()
            .ok()?;
        Some((usage, limit))
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) => {
            debug!(path = %path.display(), "failed to read cgroup memory: {e}");
            None
        }
    }
}

impl MemoryProbe for CgroupMemory {
    fn usage_percent(&self) -> u8 {
        match self.usage_and_limit() {
            Some((_, 0)) | None => 0,
            Some((usage, limit)) => {
                let percent = (u128::from(usage) * 100) / u128::from(limit);
                percent.min(100) as u8
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn write(root: &Path, name: &str, contents: &str) {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_cgroup_v2() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "memory.max", "1000\n");
        write(dir.path(), "memory.current", "510\n");

        let probe = CgroupMemory::with_root(dir.path());
        assert_eq!(probe.usage_and_limit(), Some((510, 1000)));
        assert_eq!(probe.usage_percent(), 51);
    }

    #[test]
    fn test_cgroup_v2_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "memory.max", "max\n");
        write(dir.path(), "memory.current", "510\n");

        let probe = CgroupMemory::with_root(dir.path());
        assert_eq!(probe.usage_percent(), 0);
    }

    #[test]
    fn test_cgroup_v1() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "memory/memory.limit_in_bytes", "2048");
        write(dir.path(), "memory/memory.usage_in_bytes", "2048");

        let probe = CgroupMemory::with_root(dir.path());
        assert_eq!(probe.usage_percent(), 100);
    }

    #[test]
    fn test_cgroup_v1_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "memory/memory.limit_in_bytes", "9223372036854771712");
        write(dir.path(), "memory/memory.usage_in_bytes", "2048");

        let probe = CgroupMemory::with_root(dir.path());
        assert_eq!(probe.usage_and_limit(), None);
        assert_eq!(probe.usage_percent(), 0);
    }

    #[test]
    fn test_no_cgroup() {
        let dir = tempfile::tempdir().unwrap();
        let probe = CgroupMemory::with_root(dir.path().join("nope"));
        assert_eq!(probe.usage_percent(), 0);
    }

    #[test]
    fn test_usage_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "memory.max", "100");
        write(dir.path(), "memory.current", "250");

        assert_eq!(CgroupMemory::with_root(dir.path()).usage_percent(), 100);
    }
}
