//! Accumulated controller statistics

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuStats {
    /// Total CPU time consumed, in nanoseconds (cpuacct.usage)
    pub usage_total: u64,
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub throttled_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub usage: u64,
    pub max_usage: u64,
    pub failcnt: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PidsStats {
    pub current: u64,
    /// 0 when unlimited
    pub limit: u64,
}

/// Stats gathered from every controller the manager knows a path for
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub pids: PidsStats,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }
}
