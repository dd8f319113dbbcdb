//! Legacy (cgroup v1) manager driven by systemd
//!
//! ```text
//!     ┌───────┐  apply   ┌─────────┐  destroy  ┌─────────┐
//!     │ Empty ├─────────►│ Applied ├──────────►│ Retired │
//!     └───────┘          └────┬────┘           └─────────┘
//!                             │ set / freeze / stats / pids
//!                             └──────► (paths unchanged)
//! ```
//!
//! In systemd mode the scope (or slice) is created through the service
//! manager, then every v1 controller systemd does not take care of is
//! joined directly through the filesystem. In explicit-path mode systemd is
//! never contacted: the given paths are joined as they are.

mod naming;
mod properties;

pub use naming::{expand_slice, is_slice, unit_name, unit_type, SCOPE_SUFFIX, SLICE_SUFFIX};
pub use properties::{
    cpu_quota_per_sec_usec, range_to_bits, resource_properties, DEFAULT_CPU_QUOTA_PERIOD,
    USEC_INFINITY,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use nix::unistd::Pid;
use tokio::sync::Mutex;

use crate::cgroups::{
    self, check_cpu_shares, enable_kernel_memory_accounting, Hierarchy, Stats, Subsystem,
    LEGACY_SUBSYSTEMS,
};
use crate::config::{CgroupConfig, FreezerState, Resources};
use crate::dbus::{unit, Connector, DbusConnManager, Property, PropertyValue, ZbusConnector};
use crate::error::{CgroupError, Result};

pub const DEFAULT_SLICE: &str = "system.slice";

/// How this manager places processes, fixed at construction
#[derive(Debug, Clone)]
enum Mode {
    /// Join the given controller -> path map, nothing else
    Paths(HashMap<String, PathBuf>),
    /// Create a transient unit through systemd
    Systemd,
}

struct State {
    config: CgroupConfig,
    /// controller -> cgroup directory, filled by apply
    paths: HashMap<String, PathBuf>,
    retired: bool,
}

/// Outcome of [`LegacyManager::freeze`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezerTransition {
    pub previous: FreezerState,
    pub target: FreezerState,
}

pub struct LegacyManager<C: Connector = ZbusConnector> {
    dbus: Arc<DbusConnManager<C>>,
    hierarchy: Hierarchy,
    mode: Mode,
    state: Mutex<State>,
}

impl<C: Connector> LegacyManager<C> {
    pub fn new(config: CgroupConfig, hierarchy: Hierarchy, dbus: Arc<DbusConnManager<C>>) -> Self {
        let mode = match &config.paths {
            Some(paths) => Mode::Paths(paths.clone()),
            None => Mode::Systemd,
        };
        Self {
            dbus,
            hierarchy,
            mode,
            state: Mutex::new(State {
                config,
                paths: HashMap::new(),
                retired: false,
            }),
        }
    }

    /// Create the cgroup and move `pid` into it. `None` creates the unit
    /// without attaching anything (e.g. a bare slice).
    pub async fn apply(&self, pid: Option<Pid>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.retired {
            return Err(CgroupError::Invalid(
                "cgroup manager already destroyed".to_string(),
            ));
        }

        if let Mode::Paths(overrides) = &self.mode {
            let mut paths = HashMap::new();
            for (name, path) in overrides {
                match self.hierarchy.mountpoint(name) {
                    Ok(_) => {
                        paths.insert(name.clone(), path.clone());
                    }
                    Err(e) if e.is_not_found() => {
                        log::debug!("Skipping {}: hierarchy not mounted", name);
                    }
                    Err(e) => return Err(e),
                }
            }
            // Overrides that were never created are recorded but not entered
            for path in paths.values().filter(|p| cgroups::path_exists(p)) {
                cgroups::write_cgroup_proc(path, pid)?;
            }
            state.paths = paths;
            return Ok(());
        }

        let config = state.config.clone();
        let unit_name = unit_name(&config);
        let properties = self.unit_properties(&config, &unit_name, pid).await?;

        match unit::start_unit(&self.dbus, &unit_name, &properties).await {
            Ok(()) => {}
            Err(e) if e.is_unit_exists() => {
                log::debug!("Unit {} already exists, reusing it", unit_name);
            }
            Err(e) => return Err(e),
        }

        self.join_cgroups(&config, pid)?;

        let mut paths = HashMap::new();
        for subsystem in LEGACY_SUBSYSTEMS {
            match self.systemd_path(&config, subsystem.name()) {
                Ok(path) => {
                    paths.insert(subsystem.name().to_string(), path);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        log::info!("Applied {} with {} controllers", unit_name, paths.len());
        state.paths = paths;
        Ok(())
    }

    /// Push new limits to systemd and to every controller
    pub async fn set(&self, resources: &Resources) -> Result<()> {
        let mut state = self.state.lock().await;
        // Explicit paths are only joined, never configured
        if let Mode::Paths(_) = self.mode {
            return Ok(());
        }

        let mut config = state.config.clone();
        config.resources = resources.clone();
        let unit_name = unit_name(&config);

        if resources.kernel_memory != 0 {
            self.set_kernel_memory(&config)?;
        }
        let version = self.dbus.systemd_version().await;
        let properties = resource_properties(resources, version)?;
        unit::set_unit_properties(&self.dbus, &unit_name, &properties).await?;

        for subsystem in LEGACY_SUBSYSTEMS {
            match self.systemd_path(&config, subsystem.name()) {
                Ok(path) => subsystem.set(&path, resources).await?,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        if let Some(cpu) = state.paths.get(Subsystem::Cpu.name()) {
            check_cpu_shares(cpu, resources.cpu_shares)?;
        }

        state.config.resources = resources.clone();
        Ok(())
    }

    /// Stats of every controller the cgroup was placed in. Controllers
    /// whose directory is gone are skipped.
    pub async fn get_stats(&self) -> Result<Stats> {
        let state = self.state.lock().await;
        let mut stats = Stats::new();
        for (name, path) in &state.paths {
            let Ok(subsystem) = Subsystem::by_name(name) else {
                continue;
            };
            if !cgroups::path_exists(path) {
                continue;
            }
            subsystem.get_stats(path, &mut stats)?;
        }
        Ok(stats)
    }

    /// Freeze or thaw every process in the cgroup.
    ///
    /// The stored freezer state only changes once the kernel accepted the
    /// new one.
    pub async fn freeze(&self, target: FreezerState) -> Result<FreezerTransition> {
        let mut state = self.state.lock().await;
        let path = self.subsystem_path(&state.config, Subsystem::Freezer.name())?;
        let transition = FreezerTransition {
            previous: state.config.resources.freezer,
            target,
        };

        let mut candidate = state.config.resources.clone();
        candidate.freezer = transition.target;
        Subsystem::Freezer.set(&path, &candidate).await?;

        state.config.resources.freezer = transition.target;
        log::debug!(
            "Freezer {:?} -> {:?} at {}",
            transition.previous,
            transition.target,
            path.display()
        );
        Ok(transition)
    }

    /// Stop the unit. The manager cannot be applied again afterwards.
    pub async fn destroy(&self) -> Result<()> {
        if let Mode::Paths(_) = self.mode {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let unit_name = unit_name(&state.config);
        unit::stop_unit(&self.dbus, &unit_name).await?;
        state.paths.clear();
        state.retired = true;
        Ok(())
    }

    pub async fn get_paths(&self) -> HashMap<String, PathBuf> {
        self.state.lock().await.paths.clone()
    }

    pub async fn get_pids(&self) -> Result<Vec<Pid>> {
        let path = self.devices_path().await?;
        cgroups::get_pids(&path)
    }

    /// PIDs of the cgroup and all of its children
    pub async fn get_all_pids(&self) -> Result<Vec<Pid>> {
        let path = self.devices_path().await?;
        cgroups::get_all_pids(&path)
    }

    pub async fn get_cgroups(&self) -> CgroupConfig {
        self.state.lock().await.config.clone()
    }

    pub fn get_unified_path(&self) -> Result<PathBuf> {
        Err(CgroupError::Unsupported("unified path"))
    }

    pub async fn unit_name(&self) -> String {
        unit_name(&self.state.lock().await.config)
    }

    /// Read a property of the unit from its Scope or Slice interface,
    /// e.g. "ControlGroup"
    pub async fn unit_property(&self, property: &str) -> Result<PropertyValue> {
        if let Mode::Paths(_) = self.mode {
            return Err(CgroupError::Unsupported("unit properties with explicit paths"));
        }
        let unit_name = self.unit_name().await;
        unit::unit_type_property(&self.dbus, &unit_name, unit_type(&unit_name), property).await
    }

    async fn devices_path(&self) -> Result<PathBuf> {
        let state = self.state.lock().await;
        self.subsystem_path(&state.config, Subsystem::Devices.name())
    }

    /// Properties for StartTransientUnit. Raw properties from the config go
    /// last so they override the computed ones.
    async fn unit_properties(
        &self,
        config: &CgroupConfig,
        unit_name: &str,
        pid: Option<Pid>,
    ) -> Result<Vec<Property>> {
        let slice = config.slice();
        let mut properties = vec![Property::str(
            "Description",
            format!("container {}", config.name),
        )];

        // A slice is ordered after its parent with Wants=, a scope is placed
        // in it with Slice=
        if is_slice(unit_name) {
            properties.push(Property::new(
                "Wants",
                PropertyValue::StrArray(vec![slice.to_string()]),
            ));
        } else {
            properties.push(Property::str("Slice", slice));
        }

        if let Some(pid) = pid {
            properties.push(Property::new(
                "PIDs",
                PropertyValue::U32Array(vec![pid.as_raw() as u32]),
            ));
        }

        if !is_slice(unit_name) {
            properties.push(Property::bool("Delegate", true));
        }

        // Accounting is always on; the kernel does not cope well with
        // joining the memory cgroup later
        properties.push(Property::bool("MemoryAccounting", true));
        properties.push(Property::bool("CPUAccounting", true));
        properties.push(Property::bool("BlockIOAccounting", true));
        properties.push(Property::bool("DefaultDependencies", false));

        // systemd cannot change the kernel memory limit once tasks joined
        if config.resources.kernel_memory != 0 {
            self.set_kernel_memory(config)?;
        }

        let version = self.dbus.systemd_version().await;
        properties.extend(resource_properties(&config.resources, version)?);
        properties.extend(config.systemd_props.iter().cloned());
        Ok(properties)
    }

    /// Join every controller systemd leaves to us
    fn join_cgroups(&self, config: &CgroupConfig, pid: Option<Pid>) -> Result<()> {
        for subsystem in LEGACY_SUBSYSTEMS {
            let name = subsystem.name();
            match subsystem {
                Subsystem::NameSystemd => {}
                Subsystem::Cpuset => {
                    let path = match self.systemd_path(config, name) {
                        Ok(path) => path,
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    };
                    let root = self.hierarchy.mountpoint(name)?;
                    Subsystem::apply_cpuset_dir(root, &path, &config.resources, pid)?;
                }
                _ => {
                    let joined = self
                        .systemd_path(config, name)
                        .and_then(|path| cgroups::join(&path, pid));
                    if let Err(e) = joined {
                        // Device isolation is required; other controllers
                        // may simply not be mounted here
                        if subsystem == Subsystem::Devices || !e.is_not_found() {
                            return Err(e);
                        }
                        log::debug!("Skipping {}: {}", name, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Enable kernel memory accounting while the memory cgroup is still
    /// empty
    fn set_kernel_memory(&self, config: &CgroupConfig) -> Result<()> {
        let path = match self.systemd_path(config, Subsystem::Memory.name()) {
            Ok(path) => path,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        std::fs::create_dir_all(&path).map_err(|e| CgroupError::io(&path, e))?;
        let tasks = path.join("tasks");
        let content = std::fs::read(&tasks).map_err(|e| CgroupError::io(&tasks, e))?;
        if !content.is_empty() {
            log::debug!("{} already has tasks, not enabling kmem accounting", path.display());
            return Ok(());
        }
        enable_kernel_memory_accounting(&path)
    }

    fn subsystem_path(&self, config: &CgroupConfig, subsystem: &str) -> Result<PathBuf> {
        match &self.mode {
            Mode::Paths(paths) => paths.get(subsystem).cloned().ok_or_else(|| {
                CgroupError::NotFound {
                    subsystem: subsystem.to_string(),
                }
            }),
            Mode::Systemd => self.systemd_path(config, subsystem),
        }
    }

    /// <mountpoint>/<init cgroup>/<expanded slice>/<unit>
    fn systemd_path(&self, config: &CgroupConfig, subsystem: &str) -> Result<PathBuf> {
        let root = self.hierarchy.subsystem_root(subsystem)?;
        let slice = expand_slice(config.slice())?;
        Ok(root
            .join(slice.trim_start_matches('/'))
            .join(unit_name(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::testutil::unique_test_dir;
    use crate::dbus::{BusError, JobResult, SystemdConn};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Recorded {
        started: Vec<(String, Vec<Property>)>,
    }

    struct RecordingConn(Arc<StdMutex<Recorded>>);

    fn done() -> JobResult {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send("done".to_string());
        rx
    }

    impl SystemdConn for RecordingConn {
        async fn start_transient_unit(
            &self,
            name: &str,
            _: &str,
            props: &[Property],
        ) -> std::result::Result<JobResult, BusError> {
            self.0.lock().unwrap().started.push((name.to_string(), props.to_vec()));
            Ok(done())
        }

        async fn stop_unit(&self, _: &str, _: &str) -> std::result::Result<JobResult, BusError> {
            Ok(done())
        }

        async fn reset_failed_unit(&self, _: &str) -> std::result::Result<(), BusError> {
            Ok(())
        }

        async fn set_unit_properties(
            &self,
            _: &str,
            _: bool,
            _: &[Property],
        ) -> std::result::Result<(), BusError> {
            Ok(())
        }

        async fn manager_property(&self, _: &str) -> std::result::Result<String, BusError> {
            Ok("250".into())
        }

        async fn unit_type_property(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> std::result::Result<PropertyValue, BusError> {
            Ok(PropertyValue::Bool(true))
        }
    }

    struct Recording(Arc<StdMutex<Recorded>>);

    impl Connector for Recording {
        type Conn = RecordingConn;

        async fn connect(&self) -> std::result::Result<RecordingConn, BusError> {
            Ok(RecordingConn(Arc::clone(&self.0)))
        }
    }

    fn setup(config: CgroupConfig) -> (LegacyManager<Recording>, Arc<StdMutex<Recorded>>, PathBuf) {
        let root = unique_test_dir();
        let hierarchy = Hierarchy::from_mounts(
            ["devices", "memory", "cpu", "freezer"].map(|s| (s, root.join(s))),
        );
        let recorded = Arc::new(StdMutex::new(Recorded::default()));
        let dbus = Arc::new(DbusConnManager::new(Recording(Arc::clone(&recorded))));
        (LegacyManager::new(config, hierarchy, dbus), recorded, root)
    }

    fn value<'a>(props: &'a [Property], name: &str) -> Option<&'a PropertyValue> {
        props.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    #[tokio::test]
    async fn test_scope_properties() {
        let mut config = CgroupConfig::new("web");
        config.scope_prefix = "runc".into();
        config.resources.memory = 1 << 20;
        config.systemd_props = vec![Property::u64("MemoryLimit", 2 << 20)];
        let (manager, recorded, _) = setup(config);

        manager.apply(Some(Pid::from_raw(77))).await.unwrap();

        let recorded = recorded.lock().unwrap();
        let (name, props) = &recorded.started[0];
        assert_eq!(name, "runc-web.scope");
        assert_eq!(value(props, "Slice"), Some(&PropertyValue::Str("system.slice".into())));
        assert_eq!(value(props, "PIDs"), Some(&PropertyValue::U32Array(vec![77])));
        assert_eq!(value(props, "Delegate"), Some(&PropertyValue::Bool(true)));
        assert_eq!(value(props, "DefaultDependencies"), Some(&PropertyValue::Bool(false)));
        // Raw properties come after the computed MemoryLimit
        let limits: Vec<_> = props.iter().filter(|p| p.name == "MemoryLimit").collect();
        assert_eq!(limits.len(), 2);
        assert_eq!(props.last().unwrap().value, PropertyValue::U64(2 << 20));
    }

    #[tokio::test]
    async fn test_slice_properties() {
        let mut config = CgroupConfig::new("machine-web.slice");
        config.parent = "machine.slice".into();
        let (manager, recorded, root) = setup(config);

        manager.apply(None).await.unwrap();

        let recorded = recorded.lock().unwrap();
        let (name, props) = &recorded.started[0];
        assert_eq!(name, "machine-web.slice");
        assert_eq!(
            value(props, "Wants"),
            Some(&PropertyValue::StrArray(vec!["machine.slice".into()]))
        );
        assert!(value(props, "Slice").is_none());
        assert!(value(props, "Delegate").is_none());
        assert!(value(props, "PIDs").is_none());
        assert!(root.join("memory/machine.slice/machine-web.slice").is_dir());
    }

    #[tokio::test]
    async fn test_devices_hierarchy_is_required() {
        let root = unique_test_dir();
        let hierarchy = Hierarchy::from_mounts([("memory", root.join("memory"))]);
        let recorded = Arc::new(StdMutex::new(Recorded::default()));
        let dbus = Arc::new(DbusConnManager::new(Recording(recorded)));
        let manager = LegacyManager::new(CgroupConfig::new("web"), hierarchy, dbus);

        let err = manager.apply(Some(Pid::from_raw(5))).await.unwrap_err();
        assert!(matches!(err, CgroupError::NotFound { ref subsystem } if subsystem == "devices"));
        assert!(manager.get_paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_kernel_memory_skipped_for_busy_cgroup() {
        let mut config = CgroupConfig::new("web");
        config.resources.kernel_memory = 1 << 20;
        let (manager, _, root) = setup(config);

        let memory = root.join("memory/system.slice/web.scope");
        std::fs::create_dir_all(&memory).unwrap();
        std::fs::write(memory.join("tasks"), "1\n").unwrap();

        manager.apply(None).await.unwrap();
        assert!(!memory.join("memory.kmem.limit_in_bytes").exists());
    }

    #[tokio::test]
    async fn test_kernel_memory_enabled_for_empty_cgroup() {
        let mut config = CgroupConfig::new("web");
        config.resources.kernel_memory = 1 << 20;
        let (manager, _, root) = setup(config);

        let memory = root.join("memory/system.slice/web.scope");
        std::fs::create_dir_all(&memory).unwrap();
        std::fs::write(memory.join("tasks"), "").unwrap();

        manager.apply(None).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(memory.join("memory.kmem.limit_in_bytes")).unwrap(),
            "-1"
        );
    }

    #[tokio::test]
    async fn test_unified_path_unsupported() {
        let (manager, _, _) = setup(CgroupConfig::new("web"));
        assert!(matches!(manager.get_unified_path(), Err(CgroupError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_unit_property_through_unit_type() {
        let (manager, _, _) = setup(CgroupConfig::new("web"));
        assert_eq!(manager.unit_property("Delegate").await.unwrap(), PropertyValue::Bool(true));
    }
}
