//! Edge wire protocol: command kinds, connection types, roles and limits.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EdgeError;

/// Validity tag at the start of every command header.
pub const COMMAND_TAG: u32 = 0xfeed_feed;

/// Maximum number of buffers in one data object or command.
pub const MAX_BUFFERS: usize = 256;

/// Metadata key carrying the peer's client id on received data, and selecting the target on send.
pub const CLIENT_ID_KEY: &str = "client_id";

/// Kind of a framed command. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum CommandKind {
    Error = 0,
    TransferData = 1,
    HostInfo = 2,
    Capability = 3,
}

impl CommandKind {
    pub fn from_wire(v: u32) -> Option<CommandKind> {
        match v {
            0 => Some(CommandKind::Error),
            1 => Some(CommandKind::TransferData),
            2 => Some(CommandKind::HostInfo),
            3 => Some(CommandKind::Capability),
            _ => None,
        }
    }
}

/// How a handle reaches its peers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectType {
    /// Direct TCP with the capability handshake.
    Tcp,
    /// Payload travels through a pub/sub broker.
    BrokerPubsub,
    /// Broker only exchanges the server address; payload goes over TCP.
    Hybrid,
    /// Delegated to a registered custom transport.
    Custom,
}

impl fmt::Display for ConnectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectType::Tcp => "TCP",
            ConnectType::BrokerPubsub => "BROKER_PUBSUB",
            ConnectType::Hybrid => "HYBRID",
            ConnectType::Custom => "CUSTOM",
        };
        f.write_str(s)
    }
}

impl FromStr for ConnectType {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self, EdgeError> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(ConnectType::Tcp),
            "BROKER_PUBSUB" | "MQTT" => Ok(ConnectType::BrokerPubsub),
            "HYBRID" => Ok(ConnectType::Hybrid),
            "CUSTOM" => Ok(ConnectType::Custom),
            _ => Err(EdgeError::invalid(format!("unknown connect type {s:?}"))),
        }
    }
}

/// Role flags of a handle. At least one must be set.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roles(u8);

impl Roles {
    pub const NONE: Roles = Roles(0);
    pub const RECEIVE: Roles = Roles(1);
    pub const SEND: Roles = Roles(1 << 1);
    pub const SERVER: Roles = Roles(1 << 2);

    pub fn contains(self, other: Roles) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 & (Roles::RECEIVE.0 | Roles::SEND.0 | Roles::SERVER.0) == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Roles {
        Roles(bits)
    }
}

impl BitOr for Roles {
    type Output = Roles;

    fn bitor(self, rhs: Roles) -> Roles {
        Roles(self.0 | rhs.0)
    }
}

impl FromStr for Roles {
    type Err = EdgeError;

    /// Parses `"server|receive"` style lists.
    fn from_str(s: &str) -> Result<Self, EdgeError> {
        let mut roles = Roles::NONE;
        for part in s.split(['|', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            roles = roles
                | match part.to_ascii_uppercase().as_str() {
                    "RECEIVE" | "RECV" => Roles::RECEIVE,
                    "SEND" => Roles::SEND,
                    "SERVER" => Roles::SERVER,
                    _ => return Err(EdgeError::invalid(format!("unknown role {part:?}"))),
                };
        }
        Ok(roles)
    }
}
