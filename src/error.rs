//! Error types shared by the manager and the cgroup helpers

use std::io;
use std::path::PathBuf;

use crate::dbus::BusError;

pub type Result<T> = std::result::Result<T, CgroupError>;

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    /// The controller's hierarchy is not mounted on this host
    #[error("cgroup subsystem {subsystem} not found")]
    NotFound { subsystem: String },

    #[error("cgroup: subsystem does not exist: {0}")]
    NoSuchSubsystem(String),

    #[error("invalid slice name: {0}")]
    InvalidSlice(String),

    #[error("cannot convert {input:?}: {reason}")]
    Translation { input: String, reason: String },

    #[error("{op} {unit}: {source}")]
    Bus {
        op: &'static str,
        unit: String,
        #[source]
        source: BusError,
    },

    #[error("error creating systemd unit `{unit}`: got `{result}`")]
    JobFailed { unit: String, result: String },

    #[error("timed out waiting for systemd job on {unit}")]
    JobTimeout { unit: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("{0} is not supported by the legacy cgroup manager")]
    Unsupported(&'static str),
}

impl CgroupError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when systemd refused to create a unit because it already exists
    pub fn is_unit_exists(&self) -> bool {
        matches!(self, Self::Bus { source, .. } if source.is_unit_exists())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn bus(op: &'static str, unit: &str, source: BusError) -> Self {
        Self::Bus {
            op,
            unit: unit.to_string(),
            source,
        }
    }
}
