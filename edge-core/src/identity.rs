//! Client ids: 64-bit connection identifiers assigned by the server side of a handshake.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::EdgeError;

/// Identifies one client connection pair; key of the connection table.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ClientId(i64);

static LAST_ID: AtomicI64 = AtomicI64::new(0);

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

impl ClientId {
    /// Fresh id from the monotonic clock (microseconds). Strictly increasing within the process.
    pub fn generate() -> Self {
        let now = epoch().elapsed().as_micros() as i64 + 1;
        let mut last = LAST_ID.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match LAST_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return ClientId(next),
                Err(seen) => last = seen,
            }
        }
    }

    pub fn from_raw(raw: i64) -> Self {
        ClientId(raw)
    }

    pub fn as_raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self, EdgeError> {
        s.trim()
            .parse::<i64>()
            .map(ClientId)
            .map_err(|_| EdgeError::invalid(format!("bad client id {s:?}")))
    }
}
