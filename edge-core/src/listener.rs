//! Accept loop, connection handshake and per-connection receive threads.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::command::{read_command, write_command, Command};
use crate::connection::{self, Connection};
use crate::data::EdgeData;
use crate::error::{EdgeError, Result};
use crate::event::{EdgeEvent, EventKind};
use crate::handle::{NodeInfo, Shared};
use crate::identity::ClientId;
use crate::metadata::Metadata;
use crate::protocol::{CommandKind, CLIENT_ID_KEY};

/// Accept poll period; bounds how long a stop request waits.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound for each handshake read.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A running accept loop.
pub(crate) struct Listener {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    pub(crate) fn spawn(shared: &Arc<Shared>, host: &str, port: u16) -> Result<Self> {
        let socket = TcpListener::bind((host, port))?;
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let weak = Arc::downgrade(shared);
        let thread = thread::Builder::new()
            .name("edge-listener".to_string())
            .spawn(move || accept_loop(weak, socket, flag))?;
        Ok(Self {
            addr,
            running,
            thread: Some(thread),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                error!(addr = %self.addr, "listener thread panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(shared: Weak<Shared>, socket: TcpListener, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match socket.accept() {
            Ok((stream, addr)) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                debug!(%addr, "accepted connection");
                if let Err(e) = accept_peer(&shared, stream) {
                    warn!(%addr, "handshake failed: {e}");
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                error!("accept failed: {e}");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    debug!("listener exiting");
}

/// Listener side of the handshake, then hand the socket to a receive thread.
fn accept_peer(shared: &Arc<Shared>, mut stream: TcpStream) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let node = shared.node_info()?;

    let id = if node.is_server {
        let id = ClientId::generate();
        write_command(&mut stream, &Command::capability(id.as_raw(), &node.caps))?;
        let reply = read_command(&mut stream)?;
        match reply.kind {
            CommandKind::HostInfo => {}
            CommandKind::Error => {
                return Err(EdgeError::Rejected("peer rejected our capability".into()))
            }
            other => {
                return Err(EdgeError::Malformed(format!(
                    "expected HOST_INFO, got {other:?}"
                )))
            }
        }
        let (host, port, caps) = reply
            .parse_host_info()
            .ok_or_else(|| EdgeError::Malformed("bad HOST_INFO address".into()))?;
        if let Err(e) = check_capability(shared, &caps) {
            let _ = write_command(&mut stream, &Command::error(id.as_raw()));
            return Err(e);
        }

        let mut back = open_stream(&host, port)?;
        let advertised = advertised_host(&node, &back);
        write_command(
            &mut back,
            &Command::host_info(id.as_raw(), &advertised, node.port, &node.caps),
        )?;
        shared.table.set_sink(id, Connection::new(back)?);
        id
    } else {
        let first = read_command(&mut stream)?;
        if first.kind != CommandKind::HostInfo {
            return Err(EdgeError::Malformed(format!(
                "expected HOST_INFO, got {:?}",
                first.kind
            )));
        }
        ClientId::from_raw(first.client_id)
    };

    stream.set_read_timeout(None)?;
    let conn = Arc::new(Connection::new(stream)?);
    shared.table.set_src(id, conn.clone());
    start_receiver(shared, id, &conn)?;
    info!(client = %id, peer = %conn.peer(), "connection established");
    shared.notify(EventKind::ConnectionCompleted, &id.to_string());
    Ok(())
}

/// Connecting side of the handshake. Registers the socket as the record's sink.
///
/// A non-SERVER caller returns only once the server has connected back, so a
/// capability rejected by the server fails here.
pub(crate) fn connect_peer(shared: &Arc<Shared>, host: &str, port: u16) -> Result<ClientId> {
    let node = shared.node_info()?;
    let mut stream = open_stream(host, port)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let advertised = advertised_host(&node, &stream);

    if node.is_server {
        let id = ClientId::generate();
        write_command(
            &mut stream,
            &Command::host_info(id.as_raw(), &advertised, node.port, &node.caps),
        )?;
        stream.set_read_timeout(None)?;
        shared.table.set_sink(id, Connection::new(stream)?);
        info!(client = %id, %host, port, "connected");
        shared.notify(EventKind::ConnectionCompleted, &id.to_string());
        return Ok(id);
    }

    let cmd = read_command(&mut stream)?;
    if cmd.kind != CommandKind::Capability {
        return Err(EdgeError::ConnectionFailed(format!(
            "expected CAPABILITY, got {:?}",
            cmd.kind
        )));
    }
    let id = ClientId::from_raw(cmd.client_id);
    if let Err(e) = check_capability(shared, &cmd.caps()) {
        let _ = write_command(&mut stream, &Command::error(id.as_raw()));
        return Err(EdgeError::ConnectionFailed(format!(
            "capability rejected: {e}"
        )));
    }
    write_command(
        &mut stream,
        &Command::host_info(id.as_raw(), &advertised, node.port, &node.caps),
    )?;

    // The sink goes in first so the record is complete when the connect-back
    // raises CONNECTION_COMPLETED.
    let watch = stream.try_clone()?;
    let previous = shared.set_client_id(Some(id));
    shared.table.set_sink(id, Connection::new(stream)?);
    if let Err(e) = await_connect_back(shared, id, &watch) {
        shared.table.remove(id);
        shared.set_client_id(previous);
        return Err(e);
    }
    watch.set_read_timeout(None)?;
    info!(client = %id, %host, port, "connected");
    Ok(id)
}

/// Wait until the server's return connection registers `id`, or the server
/// answers with ERROR or closes.
fn await_connect_back(shared: &Shared, id: ClientId, watch: &TcpStream) -> Result<()> {
    watch.set_read_timeout(Some(POLL_INTERVAL))?;
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut probe = [0u8; 1];
    loop {
        if shared.table.has_src(id) {
            return Ok(());
        }
        match watch.peek(&mut probe) {
            Ok(0) => {
                return Err(EdgeError::ConnectionFailed(
                    "server closed the connection during the handshake".into(),
                ))
            }
            Ok(_) => {
                watch.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
                let mut reader = watch;
                let cmd = read_command(&mut reader)
                    .map_err(|e| EdgeError::ConnectionFailed(e.to_string()))?;
                return Err(EdgeError::ConnectionFailed(match cmd.kind {
                    CommandKind::Error => "server rejected our capability".to_string(),
                    other => format!("unexpected {other:?} during the handshake"),
                }));
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(EdgeError::ConnectionFailed(e.to_string())),
        }
        if Instant::now() >= deadline {
            return Err(EdgeError::ConnectionFailed(
                "server did not connect back".into(),
            ));
        }
    }
}

fn check_capability(shared: &Shared, caps: &str) -> Result<()> {
    let event = EdgeEvent::with_text(EventKind::Capability, caps)?;
    shared
        .emit(&event)
        .map_err(|e| EdgeError::Rejected(e.to_string()))
}

fn open_stream(host: &str, port: u16) -> Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| EdgeError::ConnectionFailed(format!("cannot resolve {host}:{port}: {e}")))?;
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(EdgeError::ConnectionFailed(match last {
        Some(e) => format!("cannot connect to {host}:{port}: {e}"),
        None => format!("{host}:{port} resolved to no address"),
    }))
}

/// Host to announce in HOST_INFO. A wildcard bind address is replaced by the
/// address this socket actually uses.
fn advertised_host(node: &NodeInfo, stream: &TcpStream) -> String {
    match node.host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => stream
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| node.host.clone()),
        _ => node.host.clone(),
    }
}

fn start_receiver(shared: &Arc<Shared>, id: ClientId, conn: &Arc<Connection>) -> Result<()> {
    let reader = conn.reader()?;
    let running = conn.running_flag();
    let serial = conn.serial();
    let weak = Arc::downgrade(shared);
    let handle = thread::Builder::new()
        .name(format!("edge-recv-{id}"))
        .spawn(move || receive_loop(weak, id, serial, reader, running))?;
    conn.attach_receiver(handle);
    Ok(())
}

fn receive_loop(
    shared: Weak<Shared>,
    id: ClientId,
    serial: u64,
    mut reader: TcpStream,
    running: Arc<AtomicBool>,
) {
    connection::mark_message_thread();
    while running.load(Ordering::Acquire) {
        let cmd = match read_command(&mut reader) {
            Ok(cmd) => cmd,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    debug!(client = %id, "receive failed: {e}");
                }
                break;
            }
        };
        match cmd.kind {
            CommandKind::TransferData => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if let Err(e) = deliver(&shared, id, cmd) {
                    warn!(client = %id, "dropping received data: {e}");
                }
            }
            CommandKind::Error => {
                info!(client = %id, "peer closed the connection");
                break;
            }
            other => debug!(client = %id, ?other, "ignoring command"),
        }
    }
    if let Some(shared) = shared.upgrade() {
        if shared.table.remove_if_src(id, serial) {
            shared.notify(EventKind::ConnectionClosed, &id.to_string());
        }
    }
}

fn deliver(shared: &Shared, id: ClientId, cmd: Command) -> Result<()> {
    let mut metadata = Metadata::new();
    if !cmd.metadata.is_empty() {
        metadata.deserialize(&cmd.metadata)?;
    }
    metadata.set(CLIENT_ID_KEY, &id.to_string())?;
    let data = EdgeData::from_parts(cmd.buffers, metadata)?;
    shared.emit(&EdgeEvent::with_data(data))
}
