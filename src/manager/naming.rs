//! Unit names and slice paths
//!
//! systemd encodes slice nesting in the name with `-`:
//! test-a-b.slice lives at /test.slice/test-a.slice/test-a-b.slice.

use crate::config::CgroupConfig;
use crate::error::{CgroupError, Result};

pub const SLICE_SUFFIX: &str = ".slice";
pub const SCOPE_SUFFIX: &str = ".scope";
const ROOT_SLICE: &str = "-.slice";

/// Unit for a cgroup config: a scope unless the name asks for a slice.
///
/// Must stay the same for start, stop and lookup of one config.
pub fn unit_name(config: &CgroupConfig) -> String {
    if config.name.ends_with(SLICE_SUFFIX) {
        return config.name.clone();
    }
    if config.scope_prefix.is_empty() {
        format!("{}{}", config.name, SCOPE_SUFFIX)
    } else {
        format!("{}-{}{}", config.scope_prefix, config.name, SCOPE_SUFFIX)
    }
}

/// D-Bus interface suffix for a unit name (org.freedesktop.systemd1.<type>)
pub fn unit_type(unit: &str) -> &'static str {
    if unit.ends_with(SLICE_SUFFIX) {
        "Slice"
    } else {
        "Scope"
    }
}

pub fn is_slice(unit: &str) -> bool {
    unit.ends_with(SLICE_SUFFIX)
}

/// Expand a slice name into its cgroup path relative to the hierarchy root
pub fn expand_slice(slice: &str) -> Result<String> {
    let invalid = || CgroupError::InvalidSlice(slice.to_string());

    let name = slice.strip_suffix(SLICE_SUFFIX).ok_or_else(invalid)?;
    if slice.contains('/') {
        return Err(invalid());
    }
    if slice == ROOT_SLICE {
        return Ok("/".to_string());
    }

    let mut path = String::new();
    let mut prefix = String::new();
    for component in name.split('-') {
        // Rejects "", "-test", "test-" and "test--a"
        if component.is_empty() {
            return Err(invalid());
        }
        path.push('/');
        path.push_str(&prefix);
        path.push_str(component);
        path.push_str(SLICE_SUFFIX);

        prefix.push_str(component);
        prefix.push('-');
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_slice() {
        assert_eq!(expand_slice("system.slice").unwrap(), "/system.slice");
        assert_eq!(
            expand_slice("test-a-b.slice").unwrap(),
            "/test.slice/test-a.slice/test-a-b.slice"
        );
        assert_eq!(
            expand_slice("a-b-c.slice").unwrap(),
            "/a.slice/a-b.slice/a-b-c.slice"
        );
        assert_eq!(expand_slice("-.slice").unwrap(), "/");
    }

    #[test]
    fn test_expand_slice_nesting() {
        let path = expand_slice("user-1000-app.slice").unwrap();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        assert_eq!(segments.len(), 3);
        for pair in segments.windows(2) {
            let parent = pair[0].trim_end_matches(SLICE_SUFFIX);
            assert!(pair[1].starts_with(&format!("{}-", parent)));
        }
    }

    #[test]
    fn test_expand_slice_invalid() {
        for bad in [
            "test--a.slice",
            "-test.slice",
            "test-.slice",
            ".slice",
            "--.slice",
            "a/b.slice",
            "system.scope",
            "system",
        ] {
            assert!(
                matches!(expand_slice(bad), Err(CgroupError::InvalidSlice(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_unit_name() {
        let mut config = CgroupConfig::new("web");
        config.scope_prefix = "runc".into();
        assert_eq!(unit_name(&config), "runc-web.scope");
        assert_eq!(unit_name(&config), unit_name(&config.clone()));

        config.scope_prefix.clear();
        assert_eq!(unit_name(&config), "web.scope");

        config.name = "machine-web.slice".into();
        assert_eq!(unit_name(&config), "machine-web.slice");
    }

    #[test]
    fn test_unit_type() {
        assert_eq!(unit_type("runc-web.scope"), "Scope");
        assert_eq!(unit_type("machine-web.slice"), "Slice");
        assert!(is_slice("machine.slice"));
        assert!(!is_slice("runc-web.scope"));
    }
}
