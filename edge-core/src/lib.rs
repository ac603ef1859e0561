//! Peer-to-peer data transport between edge devices.
//! A handle listens, connects, exchanges capabilities and moves multi-buffer
//! data objects over framed TCP, optionally bootstrapped through a broker.

pub mod broker;
pub mod command;
pub mod config;
pub mod connection;
pub mod data;
pub mod error;
pub mod event;
pub mod ffi;
pub mod handle;
pub mod identity;
mod listener;
pub mod metadata;
pub mod plugin;
pub mod protocol;
pub mod queue;

pub use broker::{BrokerConnector, BrokerLink, LocalBroker};
pub use data::{Buffer, EdgeData};
pub use error::{EdgeError, Result};
pub use event::{EdgeEvent, EventCallback, EventKind};
pub use handle::EdgeHandle;
pub use identity::ClientId;
pub use metadata::Metadata;
pub use plugin::{register_transport, CustomTransport, TransportFactory};
pub use protocol::{ConnectType, Roles, CLIENT_ID_KEY, MAX_BUFFERS};
pub use queue::{DropPolicy, EdgeQueue, QueueLimit};
