//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Node configuration. File: ~/.config/edge-node/config.toml or /etc/edge-node/config.toml.
/// Env overrides: EDGE_NODE_ID, EDGE_NODE_HOST, EDGE_NODE_PORT, EDGE_NODE_TOPIC,
/// EDGE_NODE_CAPS, EDGE_NODE_QUEUE_SIZE.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Handle id; a random one is generated when unset.
    #[serde(default)]
    pub id: Option<String>,
    /// Listen address (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port for `serve` (default 3000). 0 lets the OS pick.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Capability string offered during the handshake.
    #[serde(default)]
    pub caps: String,
    /// `N`, `N:NEW` or `N:OLD`.
    #[serde(default)]
    pub queue_size: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_topic() -> String {
    "edge".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            host: default_host(),
            port: default_port(),
            topic: default_topic(),
            caps: String::new(),
            queue_size: None,
        }
    }
}

/// Load config: explicit file, else the first standard file present, else defaults; then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/edge-node/config.toml"));
    }
    out.push(PathBuf::from("/etc/edge-node/config.toml"));
    out
}

pub fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    toml::from_str::<Config>(&s).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
}

/// Apply `EDGE_NODE_*` overrides. Unparsable ports are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("EDGE_NODE_ID") {
        c.id = Some(s);
    }
    if let Some(s) = var("EDGE_NODE_HOST") {
        c.host = s;
    }
    if let Some(s) = var("EDGE_NODE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("EDGE_NODE_TOPIC") {
        c.topic = s;
    }
    if let Some(s) = var("EDGE_NODE_CAPS") {
        c.caps = s;
    }
    if let Some(s) = var("EDGE_NODE_QUEUE_SIZE") {
        c.queue_size = Some(s);
    }
}
