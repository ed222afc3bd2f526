//! Process-wide event bus
//!
//! Most services run one bus per process. Install it once at startup and reach
//! it from anywhere with [`bus`]. Initialization is explicit: nothing is
//! created until [`install`] or [`get_or_init`] is called, and [`close`]
//! tears the connection down again.

use parking_lot::RwLock;

use crate::bus::EventBus;
use crate::envelope::Routable;
use crate::error::{BusError, ConfigurationError};

static GLOBAL_BUS: RwLock<Option<EventBus>> = parking_lot::const_rwlock(None);

/// Install `bus` as the process-wide bus, returning the one it replaces.
pub fn install(bus: EventBus) -> Option<EventBus> {
    GLOBAL_BUS.write().replace(bus)
}

/// The process-wide bus.
pub fn bus() -> Result<EventBus, ConfigurationError> {
    GLOBAL_BUS.read().clone().ok_or(ConfigurationError::NotInstalled)
}

/// The process-wide bus, installing the one built by `init` on first use.
pub fn get_or_init<F>(init: F) -> Result<EventBus, ConfigurationError>
where
    F: FnOnce() -> Result<EventBus, ConfigurationError>,
{
    if let Some(bus) = GLOBAL_BUS.read().clone() {
        return Ok(bus);
    }

    let mut global = GLOBAL_BUS.write();
    // Another caller may have installed one between the two locks
    if let Some(bus) = global.as_ref() {
        return Ok(bus.clone());
    }
    let bus = init()?;
    *global = Some(bus.clone());
    Ok(bus)
}

pub fn is_installed() -> bool {
    GLOBAL_BUS.read().is_some()
}

/// Remove the process-wide bus without closing it.
pub fn reset() -> Option<EventBus> {
    GLOBAL_BUS.write().take()
}

/// Remove the process-wide bus and close its connection if it is connected.
pub async fn close() -> Result<(), BusError> {
    let Some(bus) = reset() else {
        return Err(ConfigurationError::NotInstalled.into());
    };
    if bus.connected() {
        bus.close().await?;
    }
    tracing::debug!("Process-wide event bus closed");
    Ok(())
}

/// Publish through the process-wide bus.
pub async fn publish<R>(event: &R) -> Result<(), BusError>
where
    R: Routable + Sync + ?Sized,
{
    bus()?.publish(event).await
}
