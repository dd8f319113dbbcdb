//! Cgroup v1 filesystem access
//!
//! Every controller has its own hierarchy:
//!
//! /sys/fs/cgroup/
//! ├── memory/
//! │   └── system.slice/
//! │       └── runc-web.scope/     # cgroup.procs, memory.limit_in_bytes, ...
//! ├── cpu,cpuacct/
//! │   └── system.slice/
//! │       └── runc-web.scope/
//! └── systemd/                    # name=systemd, owned by systemd
//!
//! This module only knows how to place processes in a directory and read
//! them back. Mountpoints come from [`Hierarchy`], per-controller files from
//! [`Subsystem`].

mod mountinfo;
mod stats;
mod subsystem;

pub use mountinfo::Hierarchy;
pub use stats::{CpuStats, MemoryStats, PidsStats, Stats};
pub use subsystem::{
    check_cpu_shares, enable_kernel_memory_accounting, Subsystem, LEGACY_SUBSYSTEMS,
};

use std::fs;
use std::path::Path;

use nix::unistd::Pid;

use crate::error::{CgroupError, Result};

pub const CGROUP_PROCS: &str = "cgroup.procs";

/// Move a process into a cgroup. `None` is a no-op.
pub fn write_cgroup_proc(cgroup_path: &Path, pid: Option<Pid>) -> Result<()> {
    let Some(pid) = pid else {
        return Ok(());
    };
    let procs_file = cgroup_path.join(CGROUP_PROCS);
    fs::write(&procs_file, pid.as_raw().to_string()).map_err(|e| CgroupError::io(&procs_file, e))?;
    log::debug!("Moved PID {} to {}", pid, cgroup_path.display());
    Ok(())
}

/// Create the cgroup directory (and parents) and move `pid` into it
pub fn join(cgroup_path: &Path, pid: Option<Pid>) -> Result<()> {
    fs::create_dir_all(cgroup_path).map_err(|e| CgroupError::io(cgroup_path, e))?;
    write_cgroup_proc(cgroup_path, pid)
}

/// PIDs directly in a cgroup
pub fn get_pids(cgroup_path: &Path) -> Result<Vec<Pid>> {
    let procs_file = cgroup_path.join(CGROUP_PROCS);
    let content = fs::read_to_string(&procs_file).map_err(|e| CgroupError::io(&procs_file, e))?;
    Ok(parse_pids(&content))
}

/// PIDs in a cgroup and all of its descendants
pub fn get_all_pids(cgroup_path: &Path) -> Result<Vec<Pid>> {
    let mut pids = get_pids(cgroup_path)?;
    let entries = fs::read_dir(cgroup_path).map_err(|e| CgroupError::io(cgroup_path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CgroupError::io(cgroup_path, e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| CgroupError::io(entry.path(), e))?
            .is_dir();
        if is_dir {
            pids.extend(get_all_pids(&entry.path())?);
        }
    }
    Ok(pids)
}

pub fn path_exists(path: &Path) -> bool {
    path.exists()
}

fn parse_pids(content: &str) -> Vec<Pid> {
    content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .map(Pid::from_raw)
        .collect()
}

/// Read a single-line cgroup file, trimmed
pub(crate) fn read_file(dir: &Path, file: &str) -> Result<String> {
    let path = dir.join(file);
    fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| CgroupError::io(&path, e))
}

pub(crate) fn write_file(dir: &Path, file: &str, value: impl AsRef<[u8]>) -> Result<()> {
    let path = dir.join(file);
    fs::write(&path, value).map_err(|e| CgroupError::io(&path, e))
}

/// Read a cgroup file holding one unsigned number ("max" reads as u64::MAX)
pub(crate) fn read_u64(dir: &Path, file: &str) -> Result<u64> {
    let value = read_file(dir, file)?;
    if value == "max" {
        return Ok(u64::MAX);
    }
    value.parse().map_err(|_| {
        CgroupError::Invalid(format!(
            "{}: invalid number {:?}",
            dir.join(file).display(),
            value
        ))
    })
}
