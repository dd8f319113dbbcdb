//! Cgroup configuration
//!
//! What the caller asks for: where the group lives (name, parent slice,
//! scope prefix, or explicit per-controller paths) and which limits apply.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dbus::Property;

/// Target state of the freezer controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FreezerState {
    /// Leave the freezer alone
    #[default]
    Undefined,
    Frozen,
    Thawed,
}

impl FreezerState {
    /// Value written to `freezer.state`, if any
    pub fn as_kernel_str(&self) -> Option<&'static str> {
        match self {
            Self::Undefined => None,
            Self::Frozen => Some("FROZEN"),
            Self::Thawed => Some("THAWED"),
        }
    }
}

/// Resource limits. Zero (or empty) means "not set".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// Memory ceiling in bytes
    pub memory: i64,
    /// Kernel memory limit in bytes
    pub kernel_memory: i64,
    pub cpu_shares: u64,
    /// CFS quota in microseconds per period, <= 0 means unbounded
    pub cpu_quota: i64,
    /// CFS period in microseconds
    pub cpu_period: u64,
    /// Allowed CPUs, e.g. "0-3,7"
    pub cpuset_cpus: String,
    /// Allowed memory nodes, e.g. "0"
    pub cpuset_mems: String,
    /// Maximum number of tasks, <= 0 means unlimited
    pub pids_limit: i64,
    pub blkio_weight: u16,
    pub freezer: FreezerState,
}

/// A cgroup to create (or join) for one process tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Group name; a name ending in ".slice" asks for a slice unit
    pub name: String,
    /// Parent slice, "system.slice" when empty
    pub parent: String,
    /// Prefix of the scope unit name
    pub scope_prefix: String,
    /// Explicit controller -> path overrides; bypasses systemd entirely
    pub paths: Option<HashMap<String, PathBuf>>,
    pub resources: Resources,
    /// Raw unit properties, appended after the computed ones
    pub systemd_props: Vec<Property>,
}

impl CgroupConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parent slice the unit is placed under
    pub fn slice(&self) -> &str {
        if self.parent.is_empty() {
            crate::manager::DEFAULT_SLICE
        } else {
            &self.parent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_slice() {
        let mut config = CgroupConfig::new("web");
        assert_eq!(config.slice(), "system.slice");

        config.parent = "machine.slice".into();
        assert_eq!(config.slice(), "machine.slice");
    }

    #[test]
    fn test_freezer_kernel_values() {
        assert_eq!(FreezerState::Frozen.as_kernel_str(), Some("FROZEN"));
        assert_eq!(FreezerState::Thawed.as_kernel_str(), Some("THAWED"));
        assert_eq!(FreezerState::Undefined.as_kernel_str(), None);
    }
}
