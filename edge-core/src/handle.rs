//! The edge handle: configuration, lifecycle and the public send/receive surface.
//!
//! Configuration and lifecycle transitions happen under one handle lock.
//! Blocking socket work (handshakes, sends, joins) runs with that lock
//! released, so event callbacks may call back into the handle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::broker::{
    device_topic, topic_filter, BrokerConnector, BrokerLink, MessageListener, DEFAULT_BROKER_PORT,
};
use crate::command::{split_host_port, Command};
use crate::config::{HandleConfig, InfoKey};
use crate::connection::ConnectionTable;
use crate::data::EdgeData;
use crate::error::{EdgeError, Result};
use crate::event::{EdgeEvent, EventCallback, EventKind};
use crate::identity::ClientId;
use crate::listener::{self, Listener};
use crate::plugin::{load_transport, CustomTransport};
use crate::protocol::{ConnectType, Roles, CLIENT_ID_KEY};

/// How long a hybrid client waits for a server address on the broker.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct HandleState {
    pub(crate) config: HandleConfig,
    released: bool,
    listener: Option<Listener>,
    connector: Option<Arc<dyn BrokerConnector>>,
    broker: Option<Arc<dyn BrokerLink>>,
    custom: Option<Arc<dyn CustomTransport>>,
}

/// What the network threads need from the configuration, copied out of the lock.
#[derive(Debug, Clone)]
pub(crate) struct NodeInfo {
    pub(crate) is_server: bool,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) caps: String,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<HandleState>,
    pub(crate) table: ConnectionTable,
    callback: RwLock<Option<EventCallback>>,
}

impl Shared {
    fn live(&self) -> Result<parking_lot::MutexGuard<'_, HandleState>> {
        let state = self.state.lock();
        if state.released {
            return Err(EdgeError::invalid("handle already released"));
        }
        Ok(state)
    }

    pub(crate) fn node_info(&self) -> Result<NodeInfo> {
        let state = self.live()?;
        let c = &state.config;
        Ok(NodeInfo {
            is_server: c.is_server(),
            host: c.host.clone(),
            port: c.port,
            caps: c.caps.clone(),
        })
    }

    /// Returns the id it replaces.
    pub(crate) fn set_client_id(&self, id: Option<ClientId>) -> Option<ClientId> {
        std::mem::replace(&mut self.state.lock().config.client_id, id)
    }

    /// Run the callback. Without a callback every event is accepted.
    pub(crate) fn emit(&self, event: &EdgeEvent) -> Result<()> {
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => callback(event),
            None => Ok(()),
        }
    }

    /// Fire a notification whose outcome does not matter.
    pub(crate) fn notify(&self, kind: EventKind, text: &str) {
        let result = EdgeEvent::with_text(kind, text).and_then(|event| self.emit(&event));
        if let Err(e) = result {
            debug!(?kind, "event callback returned {e}");
        }
    }
}

/// A node in the edge network. Cheap to share by reference across threads.
pub struct EdgeHandle {
    shared: Arc<Shared>,
}

impl EdgeHandle {
    pub fn create(id: &str, connect_type: ConnectType, roles: Roles, topic: &str) -> Result<Self> {
        if connect_type == ConnectType::Custom {
            return Err(EdgeError::invalid(
                "custom handles are created with create_custom",
            ));
        }
        let config = HandleConfig::new(id, connect_type, roles, topic)?;
        Ok(Self::from_state(config, None))
    }

    /// Handle backed by the transport registered under `path`.
    pub fn create_custom(id: &str, path: &str, roles: Roles, topic: &str) -> Result<Self> {
        let config = HandleConfig::new(id, ConnectType::Custom, roles, topic)?;
        let transport: Arc<dyn CustomTransport> = Arc::from(load_transport(path)?);
        Ok(Self::from_state(config, Some(transport)))
    }

    fn from_state(config: HandleConfig, custom: Option<Arc<dyn CustomTransport>>) -> Self {
        debug!(id = %config.id, connect_type = %config.connect_type, roles = ?config.roles, "handle created");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(HandleState {
                    config,
                    released: false,
                    listener: None,
                    connector: None,
                    broker: None,
                    custom,
                }),
                table: ConnectionTable::new(),
                callback: RwLock::new(None),
            }),
        }
    }

    /// Broker used by HYBRID and BROKER_PUBSUB handles.
    pub fn set_broker(&self, connector: Arc<dyn BrokerConnector>) -> Result<()> {
        self.shared.live()?.connector = Some(connector);
        Ok(())
    }

    /// Replace or clear the callback. The outgoing callback first sees CALLBACK_RELEASED.
    pub fn set_event_callback(&self, callback: Option<EventCallback>) -> Result<()> {
        let custom = {
            let state = self.shared.live()?;
            state.custom.clone()
        };
        let old = std::mem::replace(&mut *self.shared.callback.write(), callback.clone());
        if let Some(old) = old {
            release_callback(&old);
        }
        if let Some(custom) = custom {
            custom.set_event_callback(callback)?;
        }
        Ok(())
    }

    pub fn set_info(&self, key: &str, value: &str) -> Result<()> {
        let (custom, broker) = {
            let mut state = self.shared.live()?;
            state.config.set(key, value)?;
            (state.custom.clone(), state.broker.clone())
        };
        if let (Some(broker), InfoKey::QueueSize) = (broker, InfoKey::parse(key)) {
            broker.set_queue_limit(value.parse()?);
        }
        if let Some(custom) = custom {
            custom.set_info(key, value)?;
        }
        Ok(())
    }

    /// Read a value. A custom transport answers first for every key except
    /// `ID` and `TOPIC`; the handle's own configuration is the fallback.
    pub fn get_info(&self, key: &str) -> Result<String> {
        let custom = {
            let state = self.shared.live()?;
            match (&state.custom, InfoKey::parse(key)) {
                (_, InfoKey::Id | InfoKey::Topic) | (None, _) => return state.config.get(key),
                (Some(custom), _) => custom.clone(),
            }
        };
        match custom.get_info(key) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(key, "custom transport has no value: {e}");
                self.shared.live()?.config.get(key)
            }
        }
    }

    pub fn id(&self) -> Result<String> {
        Ok(self.shared.live()?.config.id.clone())
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .state
            .lock()
            .listener
            .as_ref()
            .map(Listener::local_addr)
    }

    /// Client ids with a live connection record.
    pub fn connections(&self) -> Vec<ClientId> {
        self.shared.table.ids()
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.live()?;
        match state.config.connect_type {
            ConnectType::Custom => {
                let custom = custom_of(&state)?;
                drop(state);
                custom.start()
            }
            ConnectType::BrokerPubsub => {
                if state.broker.is_some() {
                    return Ok(());
                }
                let link = open_link(&state, &device_topic(&state.config.id, &state.config.topic))?;
                state.broker = Some(link);
                Ok(())
            }
            ConnectType::Tcp | ConnectType::Hybrid => {
                if state.listener.is_some() {
                    return Ok(());
                }
                let listener =
                    Listener::spawn(&self.shared, &state.config.host, state.config.port)?;
                let port = listener.local_addr().port();

                if state.config.connect_type == ConnectType::Hybrid && state.config.is_server() {
                    match publish_address(&state, port) {
                        Ok(link) => state.broker = Some(link),
                        Err(e) => {
                            // The accept thread takes the handle lock; join without it.
                            drop(state);
                            listener.stop();
                            return Err(e);
                        }
                    }
                }
                state.config.port = port;
                info!(id = %state.config.id, addr = %listener.local_addr(), "listening");
                state.listener = Some(listener);
                Ok(())
            }
        }
    }

    /// Stop accepting connections and drop the broker link. Established
    /// connections stay up until `disconnect` or `release`.
    pub fn stop(&self) -> Result<()> {
        let (listener, broker, custom) = {
            let mut state = self.shared.live()?;
            (state.listener.take(), state.broker.take(), state.custom.clone())
        };
        if let Some(listener) = listener {
            listener.stop();
        }
        if let Some(broker) = broker {
            broker.close();
        }
        if let Some(custom) = custom {
            custom.stop()?;
        }
        Ok(())
    }

    /// Connect to a peer. For TCP, `host:port` is the peer's listener; for
    /// HYBRID and BROKER_PUBSUB it is the broker.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        if host.is_empty() || port == 0 {
            return Err(EdgeError::invalid("connect needs a host and a non-zero port"));
        }
        let connect_type = {
            let mut state = self.shared.live()?;
            let connect_type = state.config.connect_type;
            if matches!(connect_type, ConnectType::Hybrid | ConnectType::BrokerPubsub) {
                state.config.dest_host = host.to_string();
                state.config.dest_port = port;
            }
            if matches!(connect_type, ConnectType::Tcp | ConnectType::Hybrid)
                && state.listener.is_none()
            {
                return Err(EdgeError::invalid("start the handle before connecting"));
            }
            connect_type
        };
        match connect_type {
            ConnectType::Tcp => listener::connect_peer(&self.shared, host, port).map(|_| ()),
            ConnectType::Hybrid => self.connect_hybrid(),
            ConnectType::BrokerPubsub => self.connect_broker(),
            ConnectType::Custom => {
                let (custom, receives) = {
                    let state = self.shared.live()?;
                    (custom_of(&state)?, state.config.roles.contains(Roles::RECEIVE))
                };
                custom.connect(host, port)?;
                if !receives {
                    return Ok(());
                }
                match custom.subscribe() {
                    Err(EdgeError::NotSupported(_)) => {
                        debug!("custom transport delivers without a subscription");
                        Ok(())
                    }
                    other => other,
                }
            }
        }
    }

    /// Discover a server on the broker and connect to it. The discovery link
    /// lives only for the duration of the call.
    fn connect_hybrid(&self) -> Result<()> {
        let (link, filter) = {
            let state = self.shared.live()?;
            let own = device_topic(&state.config.id, &state.config.topic);
            (open_link(&state, &own)?, topic_filter(&state.config.topic))
        };
        link.subscribe(&filter)?;
        let deadline = Instant::now() + DISCOVERY_TIMEOUT;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(EdgeError::ConnectionFailed(format!(
                    "no server address published under {filter}"
                )));
            }
            let message = match link.get_message(remaining) {
                Ok(message) => message,
                Err(EdgeError::TimedOut) => continue,
                Err(e) => break Err(e),
            };
            let address = String::from_utf8_lossy(&message).into_owned();
            let Some((host, port)) = split_host_port(&address) else {
                warn!(%address, "ignoring malformed server address");
                continue;
            };
            self.shared.notify(EventKind::DeviceFound, &address);
            match listener::connect_peer(&self.shared, &host, port) {
                Ok(_) => break Ok(()),
                Err(e) => warn!(%address, "connecting to discovered server failed: {e}"),
            }
        };
        link.close();
        result
    }

    fn connect_broker(&self) -> Result<()> {
        let (link, filter, receives) = {
            let mut state = self.shared.live()?;
            let link = match state.broker.clone() {
                Some(link) => link,
                None => {
                    let topic = device_topic(&state.config.id, &state.config.topic);
                    let link = open_link(&state, &topic)?;
                    state.broker = Some(link.clone());
                    link
                }
            };
            let receives = state.config.roles.contains(Roles::RECEIVE);
            (link, topic_filter(&state.config.topic), receives)
        };
        if receives {
            let shared = Arc::downgrade(&self.shared);
            let deliver: MessageListener = Arc::new(move |message: &[u8]| {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                match EdgeData::deserialize(message) {
                    Ok(data) => {
                        if let Err(e) = shared.emit(&EdgeEvent::with_data(data)) {
                            debug!("data callback returned {e}");
                        }
                    }
                    Err(e) => warn!("dropping malformed broker message: {e}"),
                }
            });
            link.set_listener(Some(deliver));
            link.subscribe(&filter)?;
        }
        Ok(())
    }

    /// Close every connection record. May be called from the event callback;
    /// message threads are then left to exit on their own instead of joined.
    pub fn disconnect(&self) -> Result<()> {
        drop(self.shared.live()?);
        for id in self.shared.table.ids() {
            if self.shared.table.remove(id) {
                self.shared.notify(EventKind::ConnectionClosed, &id.to_string());
            }
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        let (connect_type, broker, custom) = {
            let state = self.shared.state.lock();
            if state.released {
                return false;
            }
            (state.config.connect_type, state.broker.clone(), state.custom.clone())
        };
        match connect_type {
            ConnectType::Custom => custom.is_some_and(|c| c.is_connected()),
            ConnectType::BrokerPubsub => broker.is_some_and(|b| b.is_connected()),
            ConnectType::Tcp | ConnectType::Hybrid => !self.shared.table.sinks().is_empty(),
        }
    }

    /// Send to the peer named by the data's `client_id`, or to every peer when it has none.
    pub fn send(&self, data: &EdgeData) -> Result<()> {
        if data.count() == 0 {
            return Err(EdgeError::invalid("data has no buffers"));
        }
        let (connect_type, broker, custom) = {
            let state = self.shared.live()?;
            let roles = state.config.roles;
            if !roles.contains(Roles::SEND) && !roles.contains(Roles::SERVER) {
                return Err(EdgeError::invalid("handle has no SEND or SERVER role"));
            }
            (state.config.connect_type, state.broker.clone(), state.custom.clone())
        };
        match connect_type {
            ConnectType::Custom => custom
                .ok_or_else(|| EdgeError::invalid("custom transport missing"))?
                .send(data),
            ConnectType::BrokerPubsub => broker
                .ok_or_else(|| EdgeError::ConnectionFailed("broker link not connected".into()))?
                .publish(&data.serialize()),
            ConnectType::Tcp | ConnectType::Hybrid => match data.get_info(CLIENT_ID_KEY) {
                Some(id) => self.send_to(id.parse::<ClientId>()?, data),
                None => self.broadcast(data),
            },
        }
    }

    fn send_to(&self, id: ClientId, data: &EdgeData) -> Result<()> {
        let sink = self
            .shared
            .table
            .sink(id)
            .ok_or_else(|| EdgeError::ConnectionFailed(format!("no connection for client {id}")))?;
        if let Err(e) = sink.send(&Command::transfer(id.as_raw(), data)) {
            warn!(client = %id, peer = %sink.peer(), "send failed: {e}");
            if self.shared.table.remove(id) {
                self.shared.notify(EventKind::ConnectionClosed, &id.to_string());
            }
            return Err(e);
        }
        Ok(())
    }

    fn broadcast(&self, data: &EdgeData) -> Result<()> {
        let sinks = self.shared.table.sinks();
        if sinks.is_empty() {
            return Err(EdgeError::ConnectionFailed("no connected peers".into()));
        }
        let mut delivered = 0usize;
        let mut last_error = None;
        for (id, _) in sinks {
            match self.send_to(id, data) {
                Ok(()) => delivered += 1,
                Err(e) => last_error = Some(e),
            }
        }
        match (delivered, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Tear down listener, connections, broker link and transport. Idempotent.
    pub fn release(&self) -> Result<()> {
        let (listener, broker, custom, callback) = {
            let mut state = self.shared.state.lock();
            if state.released {
                return Ok(());
            }
            state.released = true;
            (
                state.listener.take(),
                state.broker.take(),
                state.custom.take(),
                self.shared.callback.write().take(),
            )
        };
        if let Some(listener) = listener {
            listener.stop();
        }
        if let Some(broker) = broker {
            broker.close();
        }
        self.shared.table.clear();
        if let Some(custom) = custom {
            if let Err(e) = custom.stop() {
                debug!("custom transport stop: {e}");
            }
            custom.close();
        }
        if let Some(callback) = callback {
            release_callback(&callback);
        }
        debug!("handle released");
        Ok(())
    }
}

impl Drop for EdgeHandle {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn release_callback(callback: &EventCallback) {
    match EdgeEvent::new(EventKind::CallbackReleased) {
        Ok(event) => {
            let _ = callback(&event);
        }
        Err(e) => warn!("cannot build release event: {e}"),
    }
}

fn custom_of(state: &HandleState) -> Result<Arc<dyn CustomTransport>> {
    state
        .custom
        .clone()
        .ok_or_else(|| EdgeError::invalid("custom transport missing"))
}

/// Announce `host:port` on the device topic for hybrid clients.
fn publish_address(state: &HandleState, port: u16) -> Result<Arc<dyn BrokerLink>> {
    let topic = device_topic(&state.config.id, &state.config.topic);
    let link = open_link(state, &topic)?;
    let address = format!("{}:{}", state.config.host, port);
    if let Err(e) = link.publish(address.as_bytes()) {
        link.close();
        return Err(e);
    }
    debug!(%topic, %address, "published server address");
    Ok(link)
}

fn open_link(state: &HandleState, topic: &str) -> Result<Arc<dyn BrokerLink>> {
    let connector = state
        .connector
        .clone()
        .ok_or_else(|| EdgeError::NotSupported("no broker configured for this handle".into()))?;
    if state.config.topic.is_empty() {
        return Err(EdgeError::invalid("TOPIC is required in broker modes"));
    }
    let port = match state.config.dest_port {
        0 => DEFAULT_BROKER_PORT,
        port => port,
    };
    let link = connector.connect(&state.config.id, topic, &state.config.dest_host, port)?;
    link.set_queue_limit(state.config.queue);
    Ok(Arc::from(link))
}
