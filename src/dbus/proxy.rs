//! zbus-backed [`SystemdConn`]

use std::future::Future;

use futures_lite::{Stream, StreamExt};
use tokio::sync::oneshot;
use zbus::fdo::PropertiesProxy;
use zbus::names::InterfaceName;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};
use zbus::{proxy, Connection, DBusError};

use super::{BusError, Connector, JobResult, Property, PropertyValue, SystemdConn};

const SYSTEMD_SERVICE: &str = "org.freedesktop.systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[(&str, Value<'_>)],
        aux: &[(&str, &[(&str, Value<'_>)])],
    ) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn reset_failed_unit(&self, name: &str) -> zbus::Result<()>;

    fn set_unit_properties(
        &self,
        name: &str,
        runtime: bool,
        properties: &[(&str, Value<'_>)],
    ) -> zbus::Result<()>;

    fn get_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    fn subscribe(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn job_removed(
        &self,
        id: u32,
        job: ObjectPath<'_>,
        unit: &str,
        result: &str,
    ) -> zbus::Result<()>;
}

/// Which bus systemd is reached on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusScope {
    /// The system instance
    #[default]
    System,
    /// The calling user's instance (rootless)
    Session,
}

#[derive(Debug, Clone, Default)]
pub struct ZbusConnector {
    pub scope: BusScope,
}

impl ZbusConnector {
    pub fn new(scope: BusScope) -> Self {
        Self { scope }
    }
}

impl Connector for ZbusConnector {
    type Conn = ZbusConn;

    async fn connect(&self) -> Result<ZbusConn, BusError> {
        let connection = match self.scope {
            BusScope::System => Connection::system().await?,
            BusScope::Session => Connection::session().await?,
        };
        let manager = SystemdManagerProxy::new(&connection).await?;
        // JobRemoved is only broadcast to subscribed clients
        manager.subscribe().await?;
        log::debug!("Connected to systemd on the {:?} bus", self.scope);
        Ok(ZbusConn {
            connection,
            manager,
        })
    }
}

pub struct ZbusConn {
    connection: Connection,
    manager: SystemdManagerProxy<'static>,
}

impl ZbusConn {
    async fn properties_at<'a>(
        &'a self,
        path: ObjectPath<'a>,
    ) -> Result<PropertiesProxy<'a>, BusError> {
        Ok(PropertiesProxy::builder(&self.connection)
            .destination(SYSTEMD_SERVICE)?
            .path(path)?
            .build()
            .await?)
    }
}

impl SystemdConn for ZbusConn {
    async fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[Property],
    ) -> Result<JobResult, BusError> {
        // Subscribe before the call so a fast job cannot be missed
        let removed = self.manager.receive_job_removed().await?;
        let props = to_dbus_properties(properties);
        let job = self
            .manager
            .start_transient_unit(name, mode, &props, &[])
            .await?;
        Ok(watch_job(removed, job))
    }

    async fn stop_unit(&self, name: &str, mode: &str) -> Result<JobResult, BusError> {
        let removed = self.manager.receive_job_removed().await?;
        let job = self.manager.stop_unit(name, mode).await?;
        Ok(watch_job(removed, job))
    }

    async fn reset_failed_unit(&self, name: &str) -> Result<(), BusError> {
        Ok(self.manager.reset_failed_unit(name).await?)
    }

    async fn set_unit_properties(
        &self,
        name: &str,
        runtime: bool,
        properties: &[Property],
    ) -> Result<(), BusError> {
        let props = to_dbus_properties(properties);
        Ok(self.manager.set_unit_properties(name, runtime, &props).await?)
    }

    async fn manager_property(&self, name: &str) -> Result<String, BusError> {
        let properties = self.properties_at(self.manager.inner().path().clone()).await?;
        let interface = InterfaceName::try_from(MANAGER_INTERFACE)
            .map_err(|e| BusError::Other(e.to_string()))?;
        let value = properties
            .get(interface, name)
            .await
            .map_err(|e| BusError::from(zbus::Error::from(e)))?;
        String::try_from(value).map_err(|e| BusError::Other(e.to_string()))
    }

    async fn unit_type_property(
        &self,
        unit: &str,
        unit_type: &str,
        property: &str,
    ) -> Result<PropertyValue, BusError> {
        let path = self.manager.get_unit(unit).await?;
        let properties = self.properties_at(path.into_inner()).await?;
        let interface = InterfaceName::try_from(format!("org.freedesktop.systemd1.{}", unit_type))
            .map_err(|e| BusError::Other(e.to_string()))?;
        let value = properties
            .get(interface, property)
            .await
            .map_err(|e| BusError::from(zbus::Error::from(e)))?;
        from_dbus_value(&value).ok_or_else(|| {
            BusError::Other(format!(
                "{}.{} has unsupported type {}",
                unit_type,
                property,
                value.value_signature()
            ))
        })
    }
}

/// Forward the result of `job` from the JobRemoved signal stream
fn watch_job<S>(removed: S, job: OwnedObjectPath) -> JobResult
where
    S: Stream<Item = JobRemoved> + Send + 'static,
{
    forward_result(async move {
        let mut removed = Box::pin(removed);
        job_result(&mut removed, &job).await
    })
}

/// Run `lookup` in the background and send what it finds. The task (and
/// the signal match rule it holds) goes away once nobody waits for the
/// result.
fn forward_result<F>(lookup: F) -> JobResult
where
    F: Future<Output = Option<String>> + Send + 'static,
{
    let (mut tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = tx.closed() => None,
            result = lookup => result,
        };
        if let Some(result) = result {
            let _ = tx.send(result);
        }
    });
    rx
}

async fn job_result<S>(removed: &mut S, job: &OwnedObjectPath) -> Option<String>
where
    S: Stream<Item = JobRemoved> + Unpin,
{
    while let Some(signal) = removed.next().await {
        let Ok(args) = signal.args() else {
            continue;
        };
        if args.job().as_str() == job.as_str() {
            return Some(args.result().to_string());
        }
    }
    None
}

fn to_dbus_properties(properties: &[Property]) -> Vec<(&str, Value<'_>)> {
    properties
        .iter()
        .map(|p| (p.name.as_str(), to_dbus_value(&p.value)))
        .collect()
}

fn to_dbus_value(value: &PropertyValue) -> Value<'_> {
    match value {
        PropertyValue::Str(s) => Value::from(s.as_str()),
        PropertyValue::Bool(b) => Value::from(*b),
        PropertyValue::U64(n) => Value::from(*n),
        PropertyValue::U32Array(v) => Value::from(v.clone()),
        PropertyValue::Bytes(v) => Value::from(v.clone()),
        PropertyValue::StrArray(v) => Value::from(v.clone()),
    }
}

fn from_dbus_value(value: &Value<'_>) -> Option<PropertyValue> {
    match value {
        Value::Str(s) => Some(PropertyValue::Str(s.to_string())),
        Value::ObjectPath(p) => Some(PropertyValue::Str(p.to_string())),
        Value::Bool(b) => Some(PropertyValue::Bool(*b)),
        Value::U64(n) => Some(PropertyValue::U64(*n)),
        Value::U32(n) => Some(PropertyValue::U64(u64::from(*n))),
        _ => None,
    }
}

impl From<zbus::Error> for BusError {
    fn from(e: zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(name, message, _) => {
                BusError::from_method_error(name.as_str(), message.unwrap_or_default())
            }
            zbus::Error::FDO(fdo) => BusError::from_method_error(
                fdo.name().as_str(),
                fdo.description().unwrap_or_default().to_string(),
            ),
            zbus::Error::InputOutput(_) => BusError::Disconnected,
            other => BusError::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_property_signatures() {
        let cpus_val = PropertyValue::Bytes(vec![0x0f]);
        let cpus = to_dbus_value(&cpus_val);
        assert_eq!(cpus.value_signature().to_string(), "ay");

        let pids_val = PropertyValue::U32Array(vec![42]);
        let pids = to_dbus_value(&pids_val);
        assert_eq!(pids.value_signature().to_string(), "au");

        let wants_val = PropertyValue::StrArray(vec!["system.slice".into()]);
        let wants = to_dbus_value(&wants_val);
        assert_eq!(wants.value_signature().to_string(), "as");

        assert_eq!(to_dbus_value(&PropertyValue::U64(1)).value_signature().to_string(), "t");
    }

    #[test]
    fn test_from_dbus_value() {
        assert_eq!(
            from_dbus_value(&Value::from("/system.slice/runc-web.scope")),
            Some(PropertyValue::Str("/system.slice/runc-web.scope".into()))
        );
        assert_eq!(from_dbus_value(&Value::from(7u32)), Some(PropertyValue::U64(7)));
        assert_eq!(from_dbus_value(&Value::from(vec![1u8])), None);
    }

    #[tokio::test]
    async fn test_forward_result() {
        let rx = forward_result(async { Some("done".to_string()) });
        assert_eq!(rx.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_watcher_stops_when_receiver_dropped() {
        let alive = Arc::new(());
        let held = Arc::clone(&alive);
        let rx = forward_result(async move {
            let _held = held;
            std::future::pending::<Option<String>>().await
        });
        drop(rx);

        for _ in 0..100 {
            if Arc::strong_count(&alive) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(&alive), 1);
    }

    #[test]
    fn test_io_error_is_disconnect() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        let err = BusError::from(zbus::Error::from(io));
        assert!(err.is_disconnect());
    }
}
