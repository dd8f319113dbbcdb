//! Resources -> systemd unit properties

use crate::config::Resources;
use crate::dbus::{Property, PropertyValue};
use crate::error::{CgroupError, Result};

/// Kernel default CFS period, 100ms
pub const DEFAULT_CPU_QUOTA_PERIOD: u64 = 100_000;

/// systemd's USEC_INFINITY: no quota
pub const USEC_INFINITY: u64 = u64::MAX;

/// systemd stores CPUQuota as a whole percent of one CPU, i.e. 10ms per second
const QUOTA_GRANULARITY_USEC: u64 = 10_000;

/// First systemd with CPUQuotaPeriodUSec
const MIN_VERSION_QUOTA_PERIOD: i32 = 242;
/// First systemd with AllowedCPUs / AllowedMemoryNodes
const MIN_VERSION_ALLOWED_CPUS: i32 = 244;

/// Largest CPU or memory node index accepted in a cpuset range
const MAX_CPUSET_INDEX: u32 = 1 << 16;

/// Unit properties for `resources`, in the order systemd should apply them.
/// Limits left at zero produce nothing.
pub fn resource_properties(resources: &Resources, systemd_version: i32) -> Result<Vec<Property>> {
    let mut properties = Vec::new();

    if resources.memory != 0 {
        properties.push(Property::u64("MemoryLimit", resources.memory as u64));
    }

    if resources.cpu_shares != 0 {
        properties.push(Property::u64("CPUShares", resources.cpu_shares));
    }

    add_cpu_quota(
        &mut properties,
        resources.cpu_quota,
        resources.cpu_period,
        systemd_version,
    )?;

    if resources.blkio_weight != 0 {
        properties.push(Property::u64("BlockIOWeight", u64::from(resources.blkio_weight)));
    }

    if resources.pids_limit > 0 {
        properties.push(Property::bool("TasksAccounting", true));
        properties.push(Property::u64("TasksMax", resources.pids_limit as u64));
    }

    add_cpuset(
        &mut properties,
        &resources.cpuset_cpus,
        &resources.cpuset_mems,
        systemd_version,
    )?;

    Ok(properties)
}

fn add_cpu_quota(
    properties: &mut Vec<Property>,
    quota: i64,
    period: u64,
    systemd_version: i32,
) -> Result<()> {
    if period != 0 {
        if systemd_version >= MIN_VERSION_QUOTA_PERIOD {
            properties.push(Property::u64("CPUQuotaPeriodUSec", period));
        } else {
            log::debug!(
                "systemd v{} lacks CPUQuotaPeriodSec, only cgroupfs gets the period",
                systemd_version
            );
        }
    }
    if let Some(per_sec) = cpu_quota_per_sec_usec(quota, period)? {
        properties.push(Property::u64("CPUQuotaPerSecUSec", per_sec));
    }
    Ok(())
}

/// Convert a CFS quota/period pair to systemd's CPUQuotaPerSecUSec.
///
/// `None` when neither is set; [`USEC_INFINITY`] when the quota is
/// unbounded. Otherwise the value is rounded up to whole percents so that a
/// nested cgroup can still be given the exact quota it asked for.
pub fn cpu_quota_per_sec_usec(quota: i64, period: u64) -> Result<Option<u64>> {
    if quota == 0 && period == 0 {
        return Ok(None);
    }
    if quota <= 0 {
        return Ok(Some(USEC_INFINITY));
    }
    let period = if period == 0 {
        DEFAULT_CPU_QUOTA_PERIOD
    } else {
        period
    };
    let overflow = || CgroupError::Translation {
        input: format!("cpu quota {} / period {}", quota, period),
        reason: "value out of range".to_string(),
    };

    let per_sec = (quota as u64).checked_mul(1_000_000).ok_or_else(overflow)? / period;
    if per_sec % QUOTA_GRANULARITY_USEC == 0 {
        return Ok(Some(per_sec));
    }
    let rounded = (per_sec / QUOTA_GRANULARITY_USEC + 1)
        .checked_mul(QUOTA_GRANULARITY_USEC)
        .ok_or_else(overflow)?;
    Ok(Some(rounded))
}

fn add_cpuset(
    properties: &mut Vec<Property>,
    cpus: &str,
    mems: &str,
    systemd_version: i32,
) -> Result<()> {
    if cpus.is_empty() && mems.is_empty() {
        return Ok(());
    }
    if systemd_version < MIN_VERSION_ALLOWED_CPUS {
        log::debug!(
            "systemd v{} lacks AllowedCPUs/AllowedMemoryNodes, only cgroupfs gets them",
            systemd_version
        );
        return Ok(());
    }
    if !cpus.is_empty() {
        properties.push(Property::new("AllowedCPUs", PropertyValue::Bytes(range_to_bits(cpus)?)));
    }
    if !mems.is_empty() {
        properties.push(Property::new(
            "AllowedMemoryNodes",
            PropertyValue::Bytes(range_to_bits(mems)?),
        ));
    }
    Ok(())
}

/// Encode a cpuset list such as "0-3,7" as the byte array systemd takes
/// for AllowedCPUs: bit `n % 8` of byte `n / 8` is set for every index `n`.
pub fn range_to_bits(ranges: &str) -> Result<Vec<u8>> {
    let invalid = |reason: String| CgroupError::Translation {
        input: ranges.to_string(),
        reason,
    };
    let parse = |s: &str| -> Result<u32> {
        let index: u32 = s
            .trim()
            .parse()
            .map_err(|_| invalid(format!("invalid number {:?}", s)))?;
        if index > MAX_CPUSET_INDEX {
            return Err(invalid(format!("index {} too large", index)));
        }
        Ok(index)
    };

    let mut indices = Vec::new();
    for part in ranges.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid("empty element".to_string()));
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(invalid(format!("invalid range: {}", part)));
                }
                indices.push((start, end));
            }
            None => {
                let index = parse(part)?;
                indices.push((index, index));
            }
        }
    }

    let max = indices.iter().map(|&(_, end)| end).max().unwrap_or(0);
    let mut bits = vec![0u8; max as usize / 8 + 1];
    for (start, end) in indices {
        for i in start..=end {
            bits[i as usize / 8] |= 1 << (i % 8);
        }
    }
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(props: &'a [Property], name: &str) -> Option<&'a PropertyValue> {
        props.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    #[test]
    fn test_empty_resources() {
        assert!(resource_properties(&Resources::default(), 250).unwrap().is_empty());
    }

    #[test]
    fn test_memory_shares_blkio_pids() {
        let resources = Resources {
            memory: 1 << 30,
            cpu_shares: 1024,
            blkio_weight: 500,
            pids_limit: 64,
            ..Resources::default()
        };
        let props = resource_properties(&resources, 250).unwrap();
        let names: Vec<&str> = props.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            ["MemoryLimit", "CPUShares", "BlockIOWeight", "TasksAccounting", "TasksMax"]
        );
        assert_eq!(find(&props, "MemoryLimit"), Some(&PropertyValue::U64(1 << 30)));
        assert_eq!(find(&props, "TasksAccounting"), Some(&PropertyValue::Bool(true)));
        assert_eq!(find(&props, "TasksMax"), Some(&PropertyValue::U64(64)));
    }

    #[test]
    fn test_unlimited_pids_not_sent() {
        let resources = Resources {
            pids_limit: -1,
            ..Resources::default()
        };
        assert!(resource_properties(&resources, 250).unwrap().is_empty());
    }

    #[test]
    fn test_cpu_quota_conversion() {
        // 50% of a CPU
        assert_eq!(cpu_quota_per_sec_usec(50_000, 100_000).unwrap(), Some(500_000));
        // 12.345% rounds up to 13%
        assert_eq!(cpu_quota_per_sec_usec(12_345, 100_000).unwrap(), Some(130_000));
        // period defaults to 100ms
        assert_eq!(cpu_quota_per_sec_usec(25_000, 0).unwrap(), Some(250_000));
        assert_eq!(cpu_quota_per_sec_usec(0, 0).unwrap(), None);
        assert_eq!(cpu_quota_per_sec_usec(-1, 100_000).unwrap(), Some(USEC_INFINITY));
        assert_eq!(cpu_quota_per_sec_usec(0, 100_000).unwrap(), Some(USEC_INFINITY));
    }

    #[test]
    fn test_cpu_quota_rounding_bounds() {
        for (quota, period) in [
            (1, 3),
            (7_777, 50_000),
            (33_333, 100_000),
            (150_000, 1_000_000),
            (1, 1),
        ] {
            let per_sec = cpu_quota_per_sec_usec(quota, period).unwrap().unwrap();
            assert_eq!(per_sec % 10_000, 0, "quota={} period={}", quota, period);
            assert!(per_sec as u128 * period as u128 >= quota as u128 * 1_000_000);
        }
    }

    #[test]
    fn test_cpu_quota_overflow() {
        assert!(matches!(
            cpu_quota_per_sec_usec(i64::MAX, 100_000),
            Err(CgroupError::Translation { .. })
        ));
    }

    #[test]
    fn test_quota_period_needs_systemd_242() {
        let resources = Resources {
            cpu_quota: 50_000,
            cpu_period: 100_000,
            ..Resources::default()
        };
        let new = resource_properties(&resources, 242).unwrap();
        assert_eq!(find(&new, "CPUQuotaPeriodUSec"), Some(&PropertyValue::U64(100_000)));
        assert_eq!(find(&new, "CPUQuotaPerSecUSec"), Some(&PropertyValue::U64(500_000)));

        let old = resource_properties(&resources, 241).unwrap();
        assert!(find(&old, "CPUQuotaPeriodUSec").is_none());
        assert!(find(&old, "CPUQuotaPerSecUSec").is_some());
    }

    #[test]
    fn test_cpuset_needs_systemd_244() {
        let resources = Resources {
            cpuset_cpus: "0-3".into(),
            cpuset_mems: "0".into(),
            ..Resources::default()
        };
        let props = resource_properties(&resources, 244).unwrap();
        assert_eq!(find(&props, "AllowedCPUs"), Some(&PropertyValue::Bytes(vec![0x0f])));
        assert_eq!(find(&props, "AllowedMemoryNodes"), Some(&PropertyValue::Bytes(vec![0x01])));

        assert!(resource_properties(&resources, 243).unwrap().is_empty());
        // Unknown version is treated as too old
        assert!(resource_properties(&resources, -1).unwrap().is_empty());
    }

    #[test]
    fn test_range_to_bits() {
        assert_eq!(range_to_bits("0-3").unwrap(), vec![0b0000_1111]);
        assert_eq!(range_to_bits("0,2,4").unwrap(), vec![0b0001_0101]);
        assert_eq!(range_to_bits("7").unwrap(), vec![0b1000_0000]);
        assert_eq!(range_to_bits("8").unwrap(), vec![0, 1]);
        assert_eq!(range_to_bits(" 1 , 9-10 ").unwrap(), vec![0b0000_0010, 0b0000_0110]);
        assert_eq!(range_to_bits("3-3").unwrap(), vec![0b0000_1000]);
    }

    #[test]
    fn test_range_to_bits_invalid() {
        for bad in ["a-b", "3-1", "", ",", "1,,2", "-1", "1-", "x", "99999999"] {
            let err = range_to_bits(bad).unwrap_err();
            assert!(
                matches!(&err, CgroupError::Translation { input, .. } if input == bad),
                "{:?} gave {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_bad_cpuset_fails_translation() {
        let resources = Resources {
            cpuset_cpus: "3-1".into(),
            ..Resources::default()
        };
        assert!(resource_properties(&resources, 250).is_err());
    }
}
