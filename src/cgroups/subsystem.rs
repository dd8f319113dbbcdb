//! Legacy (v1) controllers
//!
//! Each controller knows its name, how to push [`Resources`] into its own
//! kernel files, and how to read stats back. The manager only sequences
//! calls through [`LEGACY_SUBSYSTEMS`].

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use nix::unistd::Pid;

use super::{read_file, read_u64, write_cgroup_proc, write_file, Stats};
use crate::config::{FreezerState, Resources};
use crate::error::{CgroupError, Result};

const FREEZER_POLL_INTERVAL: Duration = Duration::from_millis(1);
const FREEZER_POLL_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Cpuset,
    Devices,
    Memory,
    Cpu,
    Cpuacct,
    Pids,
    Blkio,
    Hugetlb,
    PerfEvent,
    Freezer,
    NetPrio,
    NetCls,
    /// The `name=systemd` hierarchy, owned by systemd itself
    NameSystemd,
}

/// Join order used by the legacy manager
pub const LEGACY_SUBSYSTEMS: [Subsystem; 13] = [
    Subsystem::Cpuset,
    Subsystem::Devices,
    Subsystem::Memory,
    Subsystem::Cpu,
    Subsystem::Cpuacct,
    Subsystem::Pids,
    Subsystem::Blkio,
    Subsystem::Hugetlb,
    Subsystem::PerfEvent,
    Subsystem::Freezer,
    Subsystem::NetPrio,
    Subsystem::NetCls,
    Subsystem::NameSystemd,
];

impl Subsystem {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpuset => "cpuset",
            Self::Devices => "devices",
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Pids => "pids",
            Self::Blkio => "blkio",
            Self::Hugetlb => "hugetlb",
            Self::PerfEvent => "perf_event",
            Self::Freezer => "freezer",
            Self::NetPrio => "net_prio",
            Self::NetCls => "net_cls",
            Self::NameSystemd => "name=systemd",
        }
    }

    pub fn by_name(name: &str) -> Result<Self> {
        LEGACY_SUBSYSTEMS
            .iter()
            .copied()
            .find(|s| s.name() == name)
            .ok_or_else(|| CgroupError::NoSuchSubsystem(name.to_string()))
    }

    /// Write the limits this controller owns into the cgroup at `path`.
    /// The freezer also waits for the kernel to reach the requested state.
    pub async fn set(&self, path: &Path, resources: &Resources) -> Result<()> {
        match self {
            Self::Freezer => set_freezer_state(path, resources.freezer).await,
            _ => self.write_limits(path, resources),
        }
    }

    fn write_limits(&self, path: &Path, resources: &Resources) -> Result<()> {
        match self {
            Self::Cpuset => {
                if !resources.cpuset_cpus.is_empty() {
                    write_file(path, "cpuset.cpus", &resources.cpuset_cpus)?;
                }
                if !resources.cpuset_mems.is_empty() {
                    write_file(path, "cpuset.mems", &resources.cpuset_mems)?;
                }
            }
            Self::Memory => {
                if resources.memory != 0 {
                    write_file(path, "memory.limit_in_bytes", resources.memory.to_string())?;
                }
                if resources.kernel_memory != 0 {
                    write_file(
                        path,
                        "memory.kmem.limit_in_bytes",
                        resources.kernel_memory.to_string(),
                    )?;
                }
            }
            Self::Cpu => {
                if resources.cpu_shares != 0 {
                    write_file(path, "cpu.shares", resources.cpu_shares.to_string())?;
                }
                if resources.cpu_period != 0 {
                    write_file(path, "cpu.cfs_period_us", resources.cpu_period.to_string())?;
                }
                if resources.cpu_quota != 0 {
                    write_file(path, "cpu.cfs_quota_us", resources.cpu_quota.to_string())?;
                }
            }
            Self::Pids => {
                if resources.pids_limit > 0 {
                    write_file(path, "pids.max", resources.pids_limit.to_string())?;
                } else if resources.pids_limit < 0 {
                    write_file(path, "pids.max", "max")?;
                }
            }
            Self::Blkio => {
                if resources.blkio_weight != 0 {
                    write_file(path, "blkio.weight", resources.blkio_weight.to_string())?;
                }
            }
            Self::Devices
            | Self::Cpuacct
            | Self::Hugetlb
            | Self::PerfEvent
            | Self::NetPrio
            | Self::NetCls
            | Self::Freezer
            | Self::NameSystemd => {}
        }
        Ok(())
    }

    /// Add this controller's counters to `stats`
    pub fn get_stats(&self, path: &Path, stats: &mut Stats) -> Result<()> {
        match self {
            Self::Memory => {
                stats.memory.usage = read_u64_or_zero(path, "memory.usage_in_bytes")?;
                stats.memory.max_usage = read_u64_or_zero(path, "memory.max_usage_in_bytes")?;
                stats.memory.failcnt = read_u64_or_zero(path, "memory.failcnt")?;
                stats.memory.limit = read_u64_or_zero(path, "memory.limit_in_bytes")?;
            }
            Self::Cpu => {
                let content = read_or_empty(path, "cpu.stat")?;
                for line in content.lines() {
                    let Some((key, value)) = line.split_once(' ') else {
                        continue;
                    };
                    let value = value.trim().parse().unwrap_or(0);
                    match key {
                        "nr_periods" => stats.cpu.nr_periods = value,
                        "nr_throttled" => stats.cpu.nr_throttled = value,
                        "throttled_time" => stats.cpu.throttled_time = value,
                        _ => {}
                    }
                }
            }
            Self::Cpuacct => {
                stats.cpu.usage_total = read_u64_or_zero(path, "cpuacct.usage")?;
            }
            Self::Pids => {
                stats.pids.current = read_u64_or_zero(path, "pids.current")?;
                let limit = read_u64_or_zero(path, "pids.max")?;
                stats.pids.limit = if limit == u64::MAX { 0 } else { limit };
            }
            _ => {}
        }
        Ok(())
    }

    /// Create a cpuset cgroup and attach `pid`.
    ///
    /// A fresh cpuset directory starts with empty `cpuset.cpus`/`cpuset.mems`
    /// and refuses tasks, so every missing level between `root` and `dir`
    /// inherits the values of its parent first.
    pub fn apply_cpuset_dir(
        root: &Path,
        dir: &Path,
        resources: &Resources,
        pid: Option<Pid>,
    ) -> Result<()> {
        if let Some(parent) = dir.parent() {
            ensure_cpuset_parent(root, parent)?;
        }
        fs::create_dir_all(dir).map_err(|e| CgroupError::io(dir, e))?;
        Self::Cpuset.write_limits(dir, resources)?;
        if let Some(parent) = dir.parent() {
            copy_cpuset_if_needed(parent, dir)?;
        }
        write_cgroup_proc(dir, pid)
    }
}

/// Make sure the share value the kernel holds is what was requested
pub fn check_cpu_shares(path: &Path, requested: u64) -> Result<()> {
    if requested == 0 {
        return Ok(());
    }
    let actual = read_u64(path, "cpu.shares")?;
    if requested > actual {
        return Err(CgroupError::Invalid(format!(
            "the maximum allowed cpu-shares is {}",
            actual
        )));
    }
    if requested < actual {
        return Err(CgroupError::Invalid(format!(
            "the minimum allowed cpu-shares is {}",
            actual
        )));
    }
    Ok(())
}

/// Turn on kernel memory accounting. Only possible while the cgroup has no
/// tasks; the limit itself is written later by [`Subsystem::Memory`].
pub fn enable_kernel_memory_accounting(path: &Path) -> Result<()> {
    write_file(path, "memory.kmem.limit_in_bytes", "1")?;
    write_file(path, "memory.kmem.limit_in_bytes", "-1")
}

async fn set_freezer_state(path: &Path, target: FreezerState) -> Result<()> {
    let Some(state) = target.as_kernel_str() else {
        return Ok(());
    };
    write_file(path, "freezer.state", state)?;
    for _ in 0..FREEZER_POLL_LIMIT {
        if read_file(path, "freezer.state")? == state {
            return Ok(());
        }
        tokio::time::sleep(FREEZER_POLL_INTERVAL).await;
    }
    Err(CgroupError::Invalid(format!(
        "{}: freezer did not reach {}",
        path.display(),
        state
    )))
}

fn ensure_cpuset_parent(root: &Path, current: &Path) -> Result<()> {
    if current == root || !current.starts_with(root) {
        return Ok(());
    }
    let Some(parent) = current.parent() else {
        return Ok(());
    };
    ensure_cpuset_parent(root, parent)?;
    fs::create_dir_all(current).map_err(|e| CgroupError::io(current, e))?;
    copy_cpuset_if_needed(parent, current)
}

fn copy_cpuset_if_needed(parent: &Path, current: &Path) -> Result<()> {
    for file in ["cpuset.cpus", "cpuset.mems"] {
        if !read_or_empty(current, file)?.is_empty() {
            continue;
        }
        let inherited = read_or_empty(parent, file)?;
        if !inherited.is_empty() {
            write_file(current, file, inherited)?;
        }
    }
    Ok(())
}

fn read_or_empty(dir: &Path, file: &str) -> Result<String> {
    match read_file(dir, file) {
        Err(CgroupError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            Ok(String::new())
        }
        other => other,
    }
}

fn read_u64_or_zero(dir: &Path, file: &str) -> Result<u64> {
    if !dir.join(file).exists() {
        return Ok(0);
    }
    read_u64(dir, file)
}
