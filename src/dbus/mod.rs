//! Client side of systemd's D-Bus API
//!
//! The legacy manager talks to org.freedesktop.systemd1 for:
//! - StartTransientUnit / StopUnit: create and remove the scope or slice
//! - SetUnitProperties: push new limits to a running unit
//! - ResetFailedUnit: clean up after a failed job
//! - the Manager `Version` property, to gate newer unit properties
//!
//! The bus itself sits behind [`SystemdConn`] so the manager can be driven
//! by something other than a live systemd.

mod proxy;
pub mod unit;

pub use proxy::{BusScope, ZbusConn, ZbusConnector};

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, OnceCell};

/// How long to wait for systemd to finish a start/stop job
pub const JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives the job result ("done", "failed", "timeout", ...) once systemd
/// reports the job as removed
pub type JobResult = oneshot::Receiver<String>;

/// Value of a unit property, in the D-Bus types systemd expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    Str(String),
    Bool(bool),
    U64(u64),
    /// `au`, e.g. PIDs
    U32Array(Vec<u32>),
    /// `ay`, e.g. AllowedCPUs
    Bytes(Vec<u8>),
    /// `as`, e.g. Wants
    StrArray(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

impl Property {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn str(name: &str, value: impl Into<String>) -> Self {
        Self::new(name, PropertyValue::Str(value.into()))
    }

    pub fn bool(name: &str, value: bool) -> Self {
        Self::new(name, PropertyValue::Bool(value))
    }

    pub fn u64(name: &str, value: u64) -> Self {
        Self::new(name, PropertyValue::U64(value))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("D-Bus connection closed")]
    Disconnected,

    #[error("unit already exists: {0}")]
    UnitExists(String),

    #[error("no such unit: {0}")]
    NoSuchUnit(String),

    #[error("{name}: {message}")]
    Method { name: String, message: String },

    #[error("D-Bus error: {0}")]
    Other(String),
}

impl BusError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    pub fn is_unit_exists(&self) -> bool {
        matches!(self, Self::UnitExists(_))
    }

    /// Classify a D-Bus error reply by name
    pub fn from_method_error(name: &str, message: String) -> Self {
        match name {
            "org.freedesktop.systemd1.UnitExists" => Self::UnitExists(message),
            "org.freedesktop.systemd1.NoSuchUnit" => Self::NoSuchUnit(message),
            "org.freedesktop.DBus.Error.Disconnected" => Self::Disconnected,
            _ => Self::Method {
                name: name.to_string(),
                message,
            },
        }
    }
}

/// One live connection to systemd's manager object
#[allow(async_fn_in_trait)]
pub trait SystemdConn {
    /// StartTransientUnit; the job result arrives on the returned channel
    async fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[Property],
    ) -> Result<JobResult, BusError>;

    /// StopUnit; the job result arrives on the returned channel
    async fn stop_unit(&self, name: &str, mode: &str) -> Result<JobResult, BusError>;

    async fn reset_failed_unit(&self, name: &str) -> Result<(), BusError>;

    async fn set_unit_properties(
        &self,
        name: &str,
        runtime: bool,
        properties: &[Property],
    ) -> Result<(), BusError>;

    /// A property of org.freedesktop.systemd1.Manager, as a string
    async fn manager_property(&self, name: &str) -> Result<String, BusError>;

    /// A property of the unit's type interface, e.g. `Scope` or `Slice`
    async fn unit_type_property(
        &self,
        unit: &str,
        unit_type: &str,
        property: &str,
    ) -> Result<PropertyValue, BusError>;
}

/// Opens new connections when the current one is gone
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Conn: SystemdConn;

    async fn connect(&self) -> Result<Self::Conn, BusError>;
}

/// Shared handle to systemd: a lazily opened connection that is replaced
/// after a disconnect, plus the cached systemd version.
///
/// One of these is meant to be shared (via `Arc`) by every manager in the
/// process.
pub struct DbusConnManager<C: Connector> {
    connector: C,
    conn: Mutex<Option<Arc<C::Conn>>>,
    version: OnceCell<i32>,
    job_timeout: Duration,
}

impl<C: Connector> DbusConnManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            conn: Mutex::new(None),
            version: OnceCell::new(),
            job_timeout: JOB_TIMEOUT,
        }
    }

    /// Override how long start/stop jobs may take
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Current connection, opening one if needed
    pub async fn connection(&self) -> Result<Arc<C::Conn>, BusError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(Arc::clone(conn));
        }
        let conn = Arc::new(self.connector.connect().await?);
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Drop `failed` if it is still the current connection. Another caller
    /// may already have replaced it.
    async fn reset_connection(&self, failed: &Arc<C::Conn>) {
        let mut guard = self.conn.lock().await;
        if guard.as_ref().is_some_and(|c| Arc::ptr_eq(c, failed)) {
            *guard = None;
        }
    }

    /// Run `op` against a live connection. If the connection turns out to
    /// be closed, reconnect and run it exactly once more.
    pub async fn retry_on_disconnect<T, F, Fut>(&self, op: F) -> Result<T, BusError>
    where
        F: Fn(Arc<C::Conn>) -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let conn = self.connection().await?;
        match op(Arc::clone(&conn)).await {
            Err(e) if e.is_disconnect() => {
                log::warn!("D-Bus connection lost, reconnecting");
                self.reset_connection(&conn).await;
                let conn = self.connection().await?;
                op(conn).await
            }
            other => other,
        }
    }

    /// systemd's major version, asked once and cached. -1 if it could not
    /// be determined.
    pub async fn systemd_version(&self) -> i32 {
        *self
            .version
            .get_or_init(|| async {
                let version = unit::manager_property(self, "Version")
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|v| parse_systemd_version(&v));
                match version {
                    Ok(v) => v,
                    Err(e) => {
                        log::error!("unable to get systemd version: {}", e);
                        -1
                    }
                }
            })
            .await
    }
}

/// Extract the major version from strings like "v245.4-1.fc32", "245" or
/// "245-1.fc32"
pub fn parse_systemd_version(version: &str) -> Result<i32, String> {
    let unquoted = version.trim().trim_matches('"');
    let digits: String = unquoted
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Err(format!("can't parse version {}", version));
    }
    digits
        .parse()
        .map_err(|e| format!("can't parse version {}: {}", version, e))
}

/// Whether the host was booted with systemd (like sd_booted(3))
pub fn is_running_systemd() -> bool {
    static RUNNING: OnceLock<bool> = OnceLock::new();
    *RUNNING.get_or_init(|| {
        Path::new("/run/systemd/system")
            .symlink_metadata()
            .map(|m| m.is_dir())
            .unwrap_or(false)
    })
}
