//! Connections and the per-peer connection table.
//!
//! A record holds up to two sockets for one client id: the outbound `sink`
//! used by `send`, and the inbound `src` drained by a message thread. The
//! table has its own synchronization, so message threads can remove their
//! record while the listener inserts new ones.

use std::cell::Cell;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::command::{write_command, Command};
use crate::error::Result;
use crate::identity::ClientId;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static MESSAGE_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Mark the calling thread as a message thread. Connections closed from a
/// message thread are not joined, so two of them can never wait on each other.
pub(crate) fn mark_message_thread() {
    MESSAGE_THREAD.with(|m| m.set(true));
}

fn on_message_thread() -> bool {
    MESSAGE_THREAD.with(Cell::get)
}

/// One direction of a socket.
pub struct Connection {
    serial: u64,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap a connected socket. Nagle is disabled; frames go out as written.
    pub(crate) fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let control = stream.try_clone()?;
        Ok(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            peer,
            writer: Mutex::new(stream),
            control,
            running: Arc::new(AtomicBool::new(true)),
            receiver: Mutex::new(None),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Distinguishes this socket from a later one registered under the same client id.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Independent handle to the socket for a reader thread.
    pub(crate) fn reader(&self) -> Result<TcpStream> {
        Ok(self.control.try_clone()?)
    }

    pub(crate) fn attach_receiver(&self, handle: JoinHandle<()>) {
        *self.receiver.lock() = Some(handle);
    }

    pub(crate) fn send(&self, cmd: &Command) -> Result<()> {
        let mut stream = self.writer.lock();
        write_command(&mut *stream, cmd)?;
        Ok(())
    }

    /// Stop the receiver: clear the flag, shut the socket to unblock it, then join.
    /// Never joins from a message thread; the receiver is detached instead.
    pub(crate) fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!(peer = %self.peer, serial = self.serial, "closing connection");
        }
        let _ = self.control.shutdown(Shutdown::Both);
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() || on_message_thread() {
                return;
            }
            if handle.join().is_err() {
                warn!(peer = %self.peer, "message thread panicked");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Both directions for one client id.
#[derive(Default)]
pub struct ConnectionRecord {
    pub src: Option<Arc<Connection>>,
    pub sink: Option<Arc<Connection>>,
}

impl ConnectionRecord {
    fn close(self) {
        if let Some(src) = self.src {
            src.close();
        }
        if let Some(sink) = self.sink {
            sink.close();
        }
    }
}

#[derive(Default)]
pub struct ConnectionTable {
    records: DashMap<ClientId, ConnectionRecord>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.records.iter().map(|r| *r.key()).collect()
    }

    /// Register the outbound socket for `id`, closing any previous one.
    pub(crate) fn set_sink(&self, id: ClientId, conn: Connection) {
        let old = self
            .records
            .entry(id)
            .or_default()
            .sink
            .replace(Arc::new(conn));
        if let Some(old) = old {
            old.close();
        }
    }

    /// Register the inbound socket for `id`, closing any previous one.
    pub(crate) fn set_src(&self, id: ClientId, conn: Arc<Connection>) {
        let old = self.records.entry(id).or_default().src.replace(conn);
        if let Some(old) = old {
            old.close();
        }
    }

    pub fn has_src(&self, id: ClientId) -> bool {
        self.records.get(&id).is_some_and(|r| r.src.is_some())
    }

    pub fn sink(&self, id: ClientId) -> Option<Arc<Connection>> {
        self.records.get(&id).and_then(|r| r.sink.clone())
    }

    /// Every outbound socket, for broadcast.
    pub fn sinks(&self) -> Vec<(ClientId, Arc<Connection>)> {
        self.records
            .iter()
            .filter_map(|r| r.sink.clone().map(|s| (*r.key(), s)))
            .collect()
    }

    /// Remove the record and close both directions. Returns whether it existed.
    pub(crate) fn remove(&self, id: ClientId) -> bool {
        match self.records.remove(&id) {
            Some((_, record)) => {
                record.close();
                true
            }
            None => false,
        }
    }

    /// Remove the record only while `serial` is still its inbound socket.
    pub(crate) fn remove_if_src(&self, id: ClientId, serial: u64) -> bool {
        let removed = self.records.remove_if(&id, |_, r| {
            r.src.as_ref().is_some_and(|s| s.serial() == serial)
        });
        match removed {
            Some((_, record)) => {
                record.close();
                true
            }
            None => false,
        }
    }

    /// Remove every record.
    pub(crate) fn clear(&self) {
        for id in self.ids() {
            self.remove(id);
        }
    }
}
