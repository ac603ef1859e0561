//! Events delivered synchronously to the handle's callback.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::data::{Buffer, EdgeData};
use crate::error::{EdgeError, Result};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum EventKind {
    Unknown,
    /// The callback is being replaced or cleared; release anything tied to it.
    CallbackReleased,
    /// Payload: the capability string of the peer; return an error to reject it.
    Capability,
    /// Payload: the received data.
    NewDataReceived,
    /// Payload: the client id string of the new connection.
    ConnectionCompleted,
    /// Payload: the client id string of the removed connection.
    ConnectionClosed,
    /// Payload: `host:port` advertised by a server through the broker.
    DeviceFound,
}

enum Payload {
    Raw(Buffer),
    Data(Box<EdgeData>),
}

/// One notification. Lives only for the duration of the callback.
pub struct EdgeEvent {
    kind: EventKind,
    payload: Mutex<Option<Payload>>,
}

/// Registered event handler. An `Err` return rejects a capability.
pub type EventCallback = Arc<dyn Fn(&EdgeEvent) -> Result<()> + Send + Sync>;

impl EdgeEvent {
    pub fn new(kind: EventKind) -> Result<Self> {
        if kind == EventKind::Unknown {
            return Err(EdgeError::invalid("event kind UNKNOWN"));
        }
        Ok(Self {
            kind,
            payload: Mutex::new(None),
        })
    }

    pub(crate) fn with_text(kind: EventKind, text: &str) -> Result<Self> {
        let event = Self::new(kind)?;
        event.set_payload(Buffer::new(text.as_bytes().to_vec()));
        Ok(event)
    }

    pub(crate) fn with_data(data: EdgeData) -> Self {
        Self {
            kind: EventKind::NewDataReceived,
            payload: Mutex::new(Some(Payload::Data(Box::new(data)))),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Replace the payload; the previous one (and its release callback) is dropped.
    pub fn set_payload(&self, payload: Buffer) {
        *self.payload.lock() = Some(Payload::Raw(payload));
    }

    /// Raw payload bytes, if the payload is raw.
    pub fn payload(&self) -> Option<bytes::Bytes> {
        match &*self.payload.lock() {
            Some(Payload::Raw(b)) => Some(b.bytes().clone()),
            _ => None,
        }
    }

    /// Deep copy of the received data; the copy outlives the event.
    pub fn parse_new_data(&self) -> Result<EdgeData> {
        if self.kind != EventKind::NewDataReceived {
            return Err(EdgeError::invalid(format!(
                "{:?} event carries no data",
                self.kind
            )));
        }
        match &*self.payload.lock() {
            Some(Payload::Data(data)) => data.copy(),
            _ => Err(EdgeError::invalid("event has no data payload")),
        }
    }

    pub fn parse_capability(&self) -> Result<String> {
        if self.kind != EventKind::Capability {
            return Err(EdgeError::invalid(format!(
                "{:?} event carries no capability",
                self.kind
            )));
        }
        Ok(self.text().unwrap_or_default())
    }

    /// Raw payload decoded as UTF-8 (lossy).
    pub fn text(&self) -> Option<String> {
        self.payload()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }
}

impl fmt::Debug for EdgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = match &*self.payload.lock() {
            None => "none".to_string(),
            Some(Payload::Raw(b)) => format!("{} bytes", b.len()),
            Some(Payload::Data(d)) => format!("data with {} buffers", d.count()),
        };
        f.debug_struct("EdgeEvent")
            .field("kind", &self.kind)
            .field("payload", &payload)
            .finish()
    }
}
