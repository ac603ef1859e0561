//! Handle configuration and the key/value surface behind `set_info`/`get_info`.

use crate::error::{EdgeError, Result};
use crate::identity::ClientId;
use crate::metadata::Metadata;
use crate::protocol::{ConnectType, Roles};
use crate::queue::QueueLimit;

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "localhost";

/// Recognised configuration keys; anything else is free-form metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoKey {
    Host,
    Port,
    DestHost,
    DestPort,
    Topic,
    Caps,
    Id,
    ClientId,
    QueueSize,
    Other(String),
}

impl InfoKey {
    pub fn parse(key: &str) -> Self {
        match key.to_ascii_uppercase().as_str() {
            "HOST" | "IP" => InfoKey::Host,
            "PORT" => InfoKey::Port,
            "DEST_HOST" | "DEST_IP" => InfoKey::DestHost,
            "DEST_PORT" => InfoKey::DestPort,
            "TOPIC" => InfoKey::Topic,
            "CAPS" | "CAPABILITY" => InfoKey::Caps,
            "ID" => InfoKey::Id,
            "CLIENT_ID" => InfoKey::ClientId,
            "QUEUE_SIZE" => InfoKey::QueueSize,
            _ => InfoKey::Other(key.to_string()),
        }
    }
}

/// Parse a port in 1..=65535.
pub fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| EdgeError::invalid(format!("invalid port {value:?}")))
}

#[derive(Debug, Clone)]
pub struct HandleConfig {
    pub id: String,
    pub connect_type: ConnectType,
    pub roles: Roles,
    pub host: String,
    /// 0 until configured or allocated by `start`.
    pub port: u16,
    pub dest_host: String,
    pub dest_port: u16,
    pub topic: String,
    pub caps: String,
    /// Assigned by the server during the handshake; servers never have one.
    pub client_id: Option<ClientId>,
    pub queue: QueueLimit,
    pub metadata: Metadata,
}

impl HandleConfig {
    pub fn new(id: &str, connect_type: ConnectType, roles: Roles, topic: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(EdgeError::invalid("handle id is empty"));
        }
        if roles.is_empty() {
            return Err(EdgeError::invalid(
                "roles must include RECEIVE, SEND or SERVER",
            ));
        }
        Ok(Self {
            id: id.to_string(),
            connect_type,
            roles,
            host: DEFAULT_HOST.to_string(),
            port: 0,
            dest_host: DEFAULT_HOST.to_string(),
            dest_port: 0,
            topic: topic.to_string(),
            caps: String::new(),
            client_id: None,
            queue: QueueLimit::default(),
            metadata: Metadata::new(),
        })
    }

    pub fn is_server(&self) -> bool {
        self.roles.contains(Roles::SERVER)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(EdgeError::invalid("empty key"));
        }
        match InfoKey::parse(key) {
            InfoKey::Host => self.host = non_empty(key, value)?,
            InfoKey::Port => self.port = parse_port(value)?,
            InfoKey::DestHost => self.dest_host = non_empty(key, value)?,
            InfoKey::DestPort => self.dest_port = parse_port(value)?,
            InfoKey::Topic => self.topic = non_empty(key, value)?,
            InfoKey::Caps => self.caps = value.to_string(),
            InfoKey::Id | InfoKey::ClientId => {
                return Err(EdgeError::invalid(format!("{key} is read-only")))
            }
            InfoKey::QueueSize => self.queue = value.parse()?,
            InfoKey::Other(k) => self.metadata.set(&k, value)?,
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<String> {
        let value = match InfoKey::parse(key) {
            InfoKey::Host => self.host.clone(),
            InfoKey::Port => self.port.to_string(),
            InfoKey::DestHost => self.dest_host.clone(),
            InfoKey::DestPort => self.dest_port.to_string(),
            InfoKey::Topic => self.topic.clone(),
            InfoKey::Caps => self.caps.clone(),
            InfoKey::Id => self.id.clone(),
            InfoKey::ClientId => {
                if self.is_server() {
                    return Err(EdgeError::invalid("a server has no client id"));
                }
                self.client_id
                    .map(|id| id.to_string())
                    .ok_or_else(|| EdgeError::invalid("client id not assigned yet"))?
            }
            InfoKey::QueueSize => self.queue.to_string(),
            InfoKey::Other(k) => self
                .metadata
                .get(&k)
                .ok_or_else(|| EdgeError::invalid(format!("no value for {k:?}")))?,
        };
        Ok(value)
    }
}

fn non_empty(key: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        return Err(EdgeError::invalid(format!("{key} must not be empty")));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DropPolicy;

    fn client() -> HandleConfig {
        HandleConfig::new("node-1", ConnectType::Tcp, Roles::SEND | Roles::RECEIVE, "t").unwrap()
    }

    #[test]
    fn creation_validates() {
        assert!(HandleConfig::new("", ConnectType::Tcp, Roles::SEND, "").is_err());
        assert!(HandleConfig::new("a", ConnectType::Tcp, Roles::NONE, "").is_err());
    }

    #[test]
    fn keys_are_case_insensitive_with_aliases() {
        let mut c = client();
        c.set("ip", "10.0.0.1").unwrap();
        c.set("Port", "3000").unwrap();
        c.set("dest_ip", "10.0.0.2").unwrap();
        c.set("CAPABILITY", "caps-B").unwrap();
        assert_eq!(c.get("HOST").unwrap(), "10.0.0.1");
        assert_eq!(c.get("port").unwrap(), "3000");
        assert_eq!(c.get("DEST_HOST").unwrap(), "10.0.0.2");
        assert_eq!(c.get("caps").unwrap(), "caps-B");
        assert_eq!(c.get("id").unwrap(), "node-1");
    }

    #[test]
    fn port_range_checked() {
        let mut c = client();
        for bad in ["0", "65536", "-1", "http", ""] {
            assert!(c.set("PORT", bad).is_err(), "{bad} accepted");
            assert!(c.set("DEST_PORT", bad).is_err(), "{bad} accepted");
        }
        c.set("DEST_PORT", "65535").unwrap();
        assert_eq!(c.dest_port, 65535);
        assert_eq!(c.port, 0);
    }

    #[test]
    fn read_only_keys() {
        let mut c = client();
        assert!(c.set("ID", "other").is_err());
        assert!(c.set("client_id", "5").is_err());
        assert!(c.get("CLIENT_ID").is_err());
        c.client_id = Some(ClientId::from_raw(5));
        assert_eq!(c.get("CLIENT_ID").unwrap(), "5");

        let server = HandleConfig::new("srv", ConnectType::Tcp, Roles::SERVER, "").unwrap();
        assert!(server.get("CLIENT_ID").is_err());
    }

    #[test]
    fn queue_size_and_free_form_keys() {
        let mut c = client();
        c.set("QUEUE_SIZE", "16:OLD").unwrap();
        assert_eq!(c.queue.max_len, 16);
        assert_eq!(c.queue.policy, DropPolicy::Old);
        assert!(c.set("QUEUE_SIZE", "many").is_err());

        c.set("model", "mobilenet").unwrap();
        assert_eq!(c.get("MODEL").unwrap(), "mobilenet");
        assert!(c.get("missing").is_err());
    }
}
