//! Transient unit lifecycle on top of [`DbusConnManager`]
//!
//! Every call goes through `retry_on_disconnect`, so a bus that dropped
//! since the last call is reopened once before anything is reported.

use super::{BusError, Connector, DbusConnManager, JobResult, Property, PropertyValue, SystemdConn};
use crate::error::{CgroupError, Result};

const JOB_MODE: &str = "replace";

enum JobOutcome {
    Done,
    Result(String),
    TimedOut,
}

async fn wait_job(job: JobResult, timeout: std::time::Duration) -> JobOutcome {
    match tokio::time::timeout(timeout, job).await {
        Ok(Ok(result)) if result == "done" => JobOutcome::Done,
        Ok(Ok(result)) => JobOutcome::Result(result),
        // Sender gone without a JobRemoved signal
        Ok(Err(_)) => JobOutcome::Result("canceled".to_string()),
        Err(_) => JobOutcome::TimedOut,
    }
}

/// Create a transient unit and wait for its start job.
///
/// "Unit already exists" comes back as an error; callers that can live with
/// an existing unit check [`CgroupError::is_unit_exists`].
pub async fn start_unit<C: Connector>(
    cm: &DbusConnManager<C>,
    unit: &str,
    properties: &[Property],
) -> Result<()> {
    let job = cm
        .retry_on_disconnect(|c| async move {
            c.start_transient_unit(unit, JOB_MODE, properties).await
        })
        .await
        .map_err(|e| CgroupError::bus("StartTransientUnit", unit, e))?;

    match wait_job(job, cm.job_timeout()).await {
        JobOutcome::Done => {
            log::info!("Started transient unit {}", unit);
            Ok(())
        }
        JobOutcome::Result(result) => {
            reset_failed_unit(cm, unit).await;
            Err(CgroupError::JobFailed {
                unit: unit.to_string(),
                result,
            })
        }
        JobOutcome::TimedOut => {
            reset_failed_unit(cm, unit).await;
            Err(CgroupError::JobTimeout {
                unit: unit.to_string(),
            })
        }
    }
}

/// Stop a unit. An unexpected job result is only logged since the unit may
/// already be gone; running out of time is an error.
pub async fn stop_unit<C: Connector>(cm: &DbusConnManager<C>, unit: &str) -> Result<()> {
    let job = match cm
        .retry_on_disconnect(|c| async move { c.stop_unit(unit, JOB_MODE).await })
        .await
    {
        Ok(job) => job,
        Err(e) => {
            log::debug!("StopUnit {} not issued: {}", unit, e);
            return Ok(());
        }
    };

    match wait_job(job, cm.job_timeout()).await {
        JobOutcome::Done => {
            log::info!("Stopped unit {}", unit);
            Ok(())
        }
        JobOutcome::Result(result) => {
            log::warn!("error removing unit `{}`: got `{}`. Continuing...", unit, result);
            Ok(())
        }
        JobOutcome::TimedOut => Err(CgroupError::JobTimeout {
            unit: unit.to_string(),
        }),
    }
}

/// Best effort; failures are logged
pub async fn reset_failed_unit<C: Connector>(cm: &DbusConnManager<C>, unit: &str) {
    let result = cm
        .retry_on_disconnect(|c| async move { c.reset_failed_unit(unit).await })
        .await;
    if let Err(e) = result {
        log::warn!("unable to reset failed unit {}: {}", unit, e);
    }
}

pub async fn set_unit_properties<C: Connector>(
    cm: &DbusConnManager<C>,
    unit: &str,
    properties: &[Property],
) -> Result<()> {
    cm.retry_on_disconnect(|c| async move { c.set_unit_properties(unit, true, properties).await })
        .await
        .map_err(|e| CgroupError::bus("SetUnitProperties", unit, e))
}

pub async fn unit_type_property<C: Connector>(
    cm: &DbusConnManager<C>,
    unit: &str,
    unit_type: &str,
    property: &str,
) -> Result<PropertyValue> {
    cm.retry_on_disconnect(|c| async move { c.unit_type_property(unit, unit_type, property).await })
        .await
        .map_err(|e| CgroupError::bus("GetUnitTypeProperty", unit, e))
}

pub async fn manager_property<C: Connector>(
    cm: &DbusConnManager<C>,
    name: &str,
) -> std::result::Result<String, BusError> {
    let value = cm
        .retry_on_disconnect(|c| async move { c.manager_property(name).await })
        .await?;
    Ok(value.trim_matches('"').to_string())
}
