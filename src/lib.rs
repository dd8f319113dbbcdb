//! sysd-cgroup - cgroup v1 manager driven by systemd
//!
//! Places a process in a transient systemd scope (or slice), then joins the
//! v1 controllers systemd does not manage on its own and keeps limits in
//! sync on both sides.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  LegacyManager                   │
//! │   apply │ set │ freeze │ stats │ pids │ destroy  │
//! ├────────────────────────┬────────────────────────┤
//! │   Property translator  │    Controller joins    │
//! ├────────────────────────┼────────────────────────┤
//! │  DbusConnManager (D-Bus│  /sys/fs/cgroup/<ctl>/ │
//! │  systemd1, retry once) │  (Hierarchy, Subsystem)│
//! └────────────────────────┴────────────────────────┘
//! ```

pub mod cgroups;
pub mod config;
pub mod dbus;
pub mod error;
pub mod manager;

pub use cgroups::{Hierarchy, Stats, Subsystem};
pub use config::{CgroupConfig, FreezerState, Resources};
pub use dbus::{
    is_running_systemd, BusScope, DbusConnManager, Property, PropertyValue, ZbusConnector,
};
pub use error::{CgroupError, Result};
pub use manager::{expand_slice, FreezerTransition, LegacyManager};
