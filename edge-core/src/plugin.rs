//! Pluggable transports for `ConnectType::Custom`.
//!
//! A transport is registered under a name (the "library path" a custom
//! handle is created with) and instantiated per handle.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::debug;

use crate::data::EdgeData;
use crate::error::{EdgeError, Result};
use crate::event::EventCallback;

/// Operations a custom transport provides. Called without the handle lock held.
pub trait CustomTransport: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn connect(&self, host: &str, port: u16) -> Result<()>;
    /// Called after `connect` on handles with the RECEIVE role.
    /// `NotSupported` means data arrives without a subscription.
    fn subscribe(&self) -> Result<()> {
        Err(EdgeError::NotSupported("subscribe".into()))
    }
    fn is_connected(&self) -> bool;
    /// Events the transport raises go to `callback`.
    fn set_event_callback(&self, callback: Option<EventCallback>) -> Result<()>;
    fn send(&self, data: &EdgeData) -> Result<()>;
    fn set_info(&self, key: &str, value: &str) -> Result<()>;
    /// An error defers to the handle's own configuration.
    fn get_info(&self, key: &str) -> Result<String>;
    /// Last call on the instance; release everything it holds.
    fn close(&self) {}
}

pub type TransportFactory = Arc<dyn Fn() -> Result<Box<dyn CustomTransport>> + Send + Sync>;

fn registry() -> &'static RwLock<HashMap<String, TransportFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, TransportFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Make a transport available under `path`, replacing any earlier registration.
pub fn register_transport(path: &str, factory: TransportFactory) -> Result<()> {
    if path.is_empty() {
        return Err(EdgeError::invalid("transport path is empty"));
    }
    debug!(path, "registering custom transport");
    registry().write().insert(path.to_string(), factory);
    Ok(())
}

pub fn unregister_transport(path: &str) -> bool {
    registry().write().remove(path).is_some()
}

/// Instantiate the transport registered under `path`.
pub fn load_transport(path: &str) -> Result<Box<dyn CustomTransport>> {
    let factory = registry()
        .read()
        .get(path)
        .cloned()
        .ok_or_else(|| EdgeError::NotSupported(format!("no custom transport at {path:?}")))?;
    factory()
}
