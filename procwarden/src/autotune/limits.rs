use fs::file::reader::FileReader;
use fs::LocalFile;
use std::path::PathBuf;
use sysinfo::System;
use tracing::debug;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Container resource limits as reported by the cgroup hierarchy, falling
/// back to the host figures when the container is unconfined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Number of CPUs worth of quota; fractional quotas are possible.
    pub cpu_quota: f64,
}

/// Reads cgroup v2 first, then cgroup v1, then the host.
pub struct LimitsDetector<F = LocalFile> {
    file_reader: F,
    cgroup_root: PathBuf,
}

impl Default for LimitsDetector {
    fn default() -> Self {
        Self {
            file_reader: LocalFile,
            cgroup_root: PathBuf::from(CGROUP_ROOT),
        }
    }
}

impl<F: FileReader> LimitsDetector<F> {
    pub fn with_file_reader(file_reader: F) -> Self
    where
        F: FileReader,
    {
        Self {
            file_reader,
            cgroup_root: PathBuf::from(CGROUP_ROOT),
        }
    }

    /// Points the detector at an alternative cgroup mount.
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    pub fn detect(&self) -> ResourceLimits {
        let host_memory = host_memory_bytes();
        let host_cpus = host_cpu_count();

        let memory_bytes = self
            .cgroup_memory_limit()
            .filter(|limit| *limit > 0 && *limit < host_memory)
            .unwrap_or(host_memory);

        let cpu_quota = self
            .cgroup_cpu_quota()
            .filter(|quota| *quota > 0.0)
            .unwrap_or(host_cpus)
            .min(host_cpus);

        debug!(memory_bytes, cpu_quota, "detected resource limits");
        ResourceLimits {
            memory_bytes,
            cpu_quota,
        }
    }

    /// cgroup v2 `memory.max` ("max" means unconfined), else v1
    /// `memory.limit_in_bytes`.
    fn cgroup_memory_limit(&self) -> Option<u64> {
        if let Ok(raw) = self.file_reader.read(&self.cgroup_root.join("memory.max")) {
            return parse_memory_limit(&raw);
        }
        let raw = self
            .file_reader
            .read(&self.cgroup_root.join("memory/memory.limit_in_bytes"))
            .ok()?;
        parse_memory_limit(&raw)
    }

    /// cgroup v2 `cpu.max` ("$quota $period" or "max $period"), else v1
    /// `cpu.cfs_quota_us` / `cpu.cfs_period_us` (-1 means unconfined).
    fn cgroup_cpu_quota(&self) -> Option<f64> {
        if let Ok(raw) = self.file_reader.read(&self.cgroup_root.join("cpu.max")) {
            let mut parts = raw.split_whitespace();
            let quota = parts.next()?;
            let period: f64 = parts.next()?.parse().ok()?;
            if quota == "max" || period <= 0.0 {
                return None;
            }
            let quota: f64 = quota.parse().ok()?;
            return Some(quota / period);
        }

        let quota: f64 = self
            .file_reader
            .read(&self.cgroup_root.join("cpu/cpu.cfs_quota_us"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let period: f64 = self
            .file_reader
            .read(&self.cgroup_root.join("cpu/cpu.cfs_period_us"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if quota < 0.0 || period <= 0.0 {
            return None;
        }
        Some(quota / period)
    }
}

fn parse_memory_limit(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed == "max" {
        return None;
    }
    trimmed.parse().ok()
}

fn host_memory_bytes() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

fn host_cpu_count() -> f64 {
    let mut system = System::new();
    system.refresh_cpu_list(sysinfo::CpuRefreshKind::nothing());
    system.cpus().len().max(1) as f64
}
