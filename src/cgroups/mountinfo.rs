//! Host cgroup v1 layout: where each controller is mounted and where the
//! init process sits inside it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CgroupError, Result};

const MOUNTINFO: &str = "/proc/self/mountinfo";
const INIT_CGROUP: &str = "/proc/1/cgroup";

#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    /// controller -> mountpoint
    mounts: HashMap<String, PathBuf>,
    /// controller -> cgroup of pid 1
    init_paths: HashMap<String, String>,
}

impl Hierarchy {
    /// Read the layout of the running host
    pub fn detect() -> Result<Self> {
        let mountinfo = fs::read_to_string(MOUNTINFO).map_err(|e| CgroupError::io(MOUNTINFO, e))?;
        let init = fs::read_to_string(INIT_CGROUP).map_err(|e| CgroupError::io(INIT_CGROUP, e))?;
        Ok(Self {
            mounts: parse_mountinfo(&mountinfo),
            init_paths: parse_proc_cgroup(&init),
        })
    }

    /// Build a layout from known mountpoints; init paths default to "/"
    pub fn from_mounts<I, S, P>(mounts: I) -> Self
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            mounts: mounts
                .into_iter()
                .map(|(s, p)| (s.into(), p.into()))
                .collect(),
            init_paths: HashMap::new(),
        }
    }

    pub fn with_init_path(mut self, subsystem: &str, path: &str) -> Self {
        self.init_paths.insert(subsystem.to_string(), path.to_string());
        self
    }

    pub fn mountpoint(&self, subsystem: &str) -> Result<&Path> {
        self.mounts
            .get(subsystem)
            .map(PathBuf::as_path)
            .ok_or_else(|| CgroupError::NotFound {
                subsystem: subsystem.to_string(),
            })
    }

    /// Mountpoint joined with the init process's cgroup. When pid 1 is
    /// systemd >= 226 it lives in init.scope rather than the root.
    pub fn subsystem_root(&self, subsystem: &str) -> Result<PathBuf> {
        let mountpoint = self.mountpoint(subsystem)?;
        let init_path = self
            .init_paths
            .get(subsystem)
            .map(String::as_str)
            .unwrap_or("/");
        let trimmed = init_path.trim_end_matches('/');
        let trimmed = trimmed.strip_suffix("init.scope").unwrap_or(trimmed);
        Ok(mountpoint.join(trimmed.trim_start_matches('/')))
    }
}

/// Map every v1 controller (and `name=` hierarchy) to its mountpoint
fn parse_mountinfo(content: &str) -> HashMap<String, PathBuf> {
    let mut mounts = HashMap::new();
    for line in content.lines() {
        // 36 25 0:31 / /sys/fs/cgroup/memory rw,nosuid - cgroup cgroup rw,memory
        let Some((pre, post)) = line.split_once(" - ") else {
            continue;
        };
        let pre: Vec<&str> = pre.split_whitespace().collect();
        let post: Vec<&str> = post.split_whitespace().collect();
        if pre.len() < 5 || post.len() < 3 || post[0] != "cgroup" {
            continue;
        }
        let mountpoint = PathBuf::from(unescape_octal(pre[4]));
        for opt in post[2].split(',') {
            if opt == "rw" || opt == "ro" || opt.is_empty() {
                continue;
            }
            mounts.entry(opt.to_string()).or_insert_with(|| mountpoint.clone());
        }
    }
    mounts
}

/// Parse /proc/<pid>/cgroup: `hierarchy-id:controller,list:path`
fn parse_proc_cgroup(content: &str) -> HashMap<String, String> {
    let mut paths = HashMap::new();
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(_), Some(controllers), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        for controller in controllers.split(',').filter(|c| !c.is_empty()) {
            paths.insert(controller.to_string(), path.to_string());
        }
    }
    paths
}

/// mountinfo escapes space, tab, newline and backslash as \ooo
fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(b) = u8::from_str_radix(oct, 8) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
