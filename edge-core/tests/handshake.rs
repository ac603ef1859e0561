//! Integration tests: edge handles talking over loopback TCP.

use std::io::Write;
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use edge_core::command::HEADER_LEN;
use edge_core::protocol::COMMAND_TAG;
use edge_core::{
    ConnectType, EdgeData, EdgeError, EdgeEvent, EdgeHandle, EventCallback, EventKind, Roles,
    CLIENT_ID_KEY,
};
use parking_lot::Mutex;
use rand::RngCore;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Seen {
    Caps(String),
    Data(EdgeData),
    Completed(String),
    Closed(String),
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

/// Callback forwarding events to a channel. Capabilities are accepted when `accept`.
fn recorder(accept: bool) -> (EventCallback, Receiver<Seen>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let callback: EventCallback = Arc::new(move |event: &EdgeEvent| -> edge_core::Result<()> {
        let seen = match event.kind() {
            EventKind::Capability => Seen::Caps(event.parse_capability()?),
            EventKind::NewDataReceived => Seen::Data(event.parse_new_data()?),
            EventKind::ConnectionCompleted => Seen::Completed(event.text().unwrap_or_default()),
            EventKind::ConnectionClosed => Seen::Closed(event.text().unwrap_or_default()),
            _ => return Ok(()),
        };
        let is_caps = matches!(seen, Seen::Caps(_));
        let _ = tx.lock().send(seen);
        if is_caps && !accept {
            return Err(EdgeError::Rejected("capability not wanted".into()));
        }
        Ok(())
    });
    (callback, rx)
}

/// Next event matching `pick`, skipping the others.
fn wait_for<T>(rx: &Receiver<Seen>, mut pick: impl FnMut(Seen) -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let seen = rx.recv_timeout(remaining).expect("event timed out");
        if let Some(v) = pick(seen) {
            return v;
        }
    }
}

fn next_data(rx: &Receiver<Seen>) -> EdgeData {
    wait_for(rx, |s| match s {
        Seen::Data(d) => Some(d),
        _ => None,
    })
}

fn node(prefix: &str, roles: Roles, caps: &str) -> EdgeHandle {
    let id = format!("{prefix}-{}", uuid::Uuid::new_v4());
    let h = EdgeHandle::create(&id, ConnectType::Tcp, roles, "").unwrap();
    h.set_info("HOST", "127.0.0.1").unwrap();
    h.set_info("CAPS", caps).unwrap();
    h
}

fn server_port(h: &EdgeHandle) -> u16 {
    h.get_info("PORT").unwrap().parse().unwrap()
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[test]
fn capabilities_exchanged_and_data_tagged_with_client_id() {
    init_tracing();
    let server = node("srv", Roles::SERVER | Roles::RECEIVE, "caps-A");
    let (server_cb, server_rx) = recorder(true);
    server.set_event_callback(Some(server_cb)).unwrap();
    server.start().unwrap();

    let client = node("cli", Roles::SEND | Roles::RECEIVE, "caps-B");
    let (client_cb, client_rx) = recorder(true);
    client.set_event_callback(Some(client_cb)).unwrap();
    client.start().unwrap();
    client.connect("127.0.0.1", server_port(&server)).unwrap();

    let client_saw = wait_for(&client_rx, |s| match s {
        Seen::Caps(c) => Some(c),
        _ => None,
    });
    assert_eq!(client_saw, "caps-A");
    let server_saw = wait_for(&server_rx, |s| match s {
        Seen::Caps(c) => Some(c),
        _ => None,
    });
    assert_eq!(server_saw, "caps-B");

    let client_id = client.get_info("CLIENT_ID").unwrap();
    assert!(server.get_info("CLIENT_ID").is_err());

    let payload = random_payload(40);
    let data = EdgeData::new();
    data.add(payload.clone()).unwrap();
    data.set_info(CLIENT_ID_KEY, &client_id).unwrap();
    data.set_info("frame", "7").unwrap();
    client.send(&data).unwrap();

    let received = next_data(&server_rx);
    assert_eq!(received.count(), 1);
    assert_eq!(&received.get(0).unwrap()[..], &payload[..]);
    assert_eq!(received.get_info(CLIENT_ID_KEY).unwrap(), client_id);
    assert_eq!(received.get_info("frame").unwrap(), "7");

    // Reply travels over the server's return connection.
    let reply = EdgeData::new();
    reply.add(b"result".to_vec()).unwrap();
    reply.set_info(CLIENT_ID_KEY, &client_id).unwrap();
    server.send(&reply).unwrap();
    let answer = next_data(&client_rx);
    assert_eq!(&answer.get(0).unwrap()[..], b"result");
    assert_eq!(answer.get_info(CLIENT_ID_KEY).unwrap(), client_id);

    assert!(client.is_connected());
    assert!(server.is_connected());
    client.release().unwrap();
    server.release().unwrap();
}

#[test]
fn send_without_client_id_reaches_every_client() {
    init_tracing();
    let server = node("srv", Roles::SERVER, "caps-A");
    let (server_cb, server_rx) = recorder(true);
    server.set_event_callback(Some(server_cb)).unwrap();
    server.start().unwrap();

    let mut clients = Vec::new();
    for _ in 0..2 {
        let client = node("cli", Roles::RECEIVE, "caps-B");
        let (cb, rx) = recorder(true);
        client.set_event_callback(Some(cb)).unwrap();
        client.start().unwrap();
        client.connect("127.0.0.1", server_port(&server)).unwrap();
        clients.push((client, rx));
    }
    for _ in 0..2 {
        wait_for(&server_rx, |s| match s {
            Seen::Completed(id) => Some(id),
            _ => None,
        });
    }
    assert_eq!(server.connections().len(), 2);

    let data = EdgeData::new();
    data.add(vec![1u8, 2, 3]).unwrap();
    server.send(&data).unwrap();

    for (client, rx) in &clients {
        let got = next_data(rx);
        assert_eq!(&got.get(0).unwrap()[..], &[1u8, 2, 3]);
        assert_eq!(
            got.get_info(CLIENT_ID_KEY).unwrap(),
            client.get_info("CLIENT_ID").unwrap()
        );
    }
}

#[test]
fn client_rejecting_capability_fails_connect() {
    init_tracing();
    let server = node("srv", Roles::SERVER, "caps-A");
    let (server_cb, server_rx) = recorder(true);
    server.set_event_callback(Some(server_cb)).unwrap();
    server.start().unwrap();

    let client = node("cli", Roles::SEND | Roles::RECEIVE, "caps-B");
    let (cb, _rx) = recorder(false);
    client.set_event_callback(Some(cb)).unwrap();
    client.start().unwrap();

    let err = client
        .connect("127.0.0.1", server_port(&server))
        .unwrap_err();
    assert!(matches!(err, EdgeError::ConnectionFailed(_)), "{err:?}");
    assert_eq!(err.code(), edge_core::error::ERROR_CONNECTION_FAILURE);
    assert!(!client.is_connected());
    assert!(client.get_info("CLIENT_ID").is_err());

    thread::sleep(Duration::from_millis(200));
    assert!(server.connections().is_empty());
    assert!(server_rx.try_recv().is_err());
}

#[test]
fn server_rejecting_capability_leaves_no_record() {
    init_tracing();
    let server = node("srv", Roles::SERVER, "caps-A");
    let (server_cb, server_rx) = recorder(false);
    server.set_event_callback(Some(server_cb)).unwrap();
    server.start().unwrap();

    let client = node("cli", Roles::SEND | Roles::RECEIVE, "caps-B");
    client.start().unwrap();
    let err = client
        .connect("127.0.0.1", server_port(&server))
        .unwrap_err();
    assert!(matches!(err, EdgeError::ConnectionFailed(_)), "{err:?}");
    assert!(!client.is_connected());
    assert!(client.connections().is_empty());
    assert!(client.get_info("CLIENT_ID").is_err());

    let caps = wait_for(&server_rx, |s| match s {
        Seen::Caps(c) => Some(c),
        _ => None,
    });
    assert_eq!(caps, "caps-B");
    thread::sleep(Duration::from_millis(200));
    assert!(server.connections().is_empty());
}

#[test]
fn connect_returns_after_return_connection_is_registered() {
    init_tracing();
    let server = node("srv", Roles::SERVER, "caps-A");
    server.start().unwrap();

    let client = node("cli", Roles::SEND | Roles::RECEIVE, "caps-B");
    let (cb, rx) = recorder(true);
    client.set_event_callback(Some(cb)).unwrap();
    client.start().unwrap();
    client.connect("127.0.0.1", server_port(&server)).unwrap();

    // Completion was raised by the return connection before connect returned.
    let completed = wait_for(&rx, |s| match s {
        Seen::Completed(id) => Some(id),
        _ => None,
    });
    assert_eq!(completed, client.get_info("CLIENT_ID").unwrap());
    assert_eq!(client.connections().len(), 1);
    assert!(client.is_connected());
}

#[test]
fn disconnect_is_seen_by_peer() {
    init_tracing();
    let server = node("srv", Roles::SERVER, "caps-A");
    let (server_cb, server_rx) = recorder(true);
    server.set_event_callback(Some(server_cb)).unwrap();
    server.start().unwrap();

    let client = node("cli", Roles::SEND | Roles::RECEIVE, "caps-B");
    client.start().unwrap();
    client.connect("127.0.0.1", server_port(&server)).unwrap();
    let opened = wait_for(&server_rx, |s| match s {
        Seen::Completed(id) => Some(id),
        _ => None,
    });

    client.disconnect().unwrap();
    assert!(!client.is_connected());
    let closed = wait_for(&server_rx, |s| match s {
        Seen::Closed(id) => Some(id),
        _ => None,
    });
    assert_eq!(opened, closed);

    let deadline = Instant::now() + WAIT;
    while !server.connections().is_empty() {
        assert!(Instant::now() < deadline, "record not removed");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn oversized_buffer_count_rejected_without_connection() {
    init_tracing();
    let client = node("cli", Roles::RECEIVE, "caps-B");
    client.start().unwrap();

    let mut header = vec![0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&COMMAND_TAG.to_ne_bytes());
    header[4..8].copy_from_slice(&2u32.to_ne_bytes());
    header[8..16].copy_from_slice(&9i64.to_ne_bytes());
    header[16..20].copy_from_slice(&300u32.to_ne_bytes());
    let mut raw = TcpStream::connect(client.local_addr().unwrap()).unwrap();
    raw.write_all(&header).unwrap();

    thread::sleep(Duration::from_millis(200));
    assert!(client.connections().is_empty());
}

#[test]
fn disconnect_from_data_callbacks_does_not_deadlock() {
    init_tracing();
    let server = Arc::new(node("srv", Roles::SERVER | Roles::RECEIVE, "caps-A"));
    let (done_tx, done_rx) = mpsc::channel();
    let done_tx = Mutex::new(done_tx);
    let weak = Arc::downgrade(&server);
    let callback: EventCallback = Arc::new(move |event: &EdgeEvent| -> edge_core::Result<()> {
        if event.kind() == EventKind::NewDataReceived {
            if let Some(server) = weak.upgrade() {
                server.disconnect()?;
            }
            let _ = done_tx.lock().send(());
        }
        Ok(())
    });
    server.set_event_callback(Some(callback)).unwrap();
    server.start().unwrap();

    let clients: Vec<EdgeHandle> = (0..2)
        .map(|_| {
            let client = node("cli", Roles::SEND, "caps-B");
            client.start().unwrap();
            client.connect("127.0.0.1", server_port(&server)).unwrap();
            client
        })
        .collect();

    let data = EdgeData::new();
    data.add(b"bye".to_vec()).unwrap();
    let senders: Vec<_> = clients
        .iter()
        .map(|client| {
            let data = data.copy().unwrap();
            data.set_info(CLIENT_ID_KEY, &client.get_info("CLIENT_ID").unwrap())
                .unwrap();
            data
        })
        .collect();
    thread::scope(|s| {
        for (client, data) in clients.iter().zip(&senders) {
            s.spawn(move || {
                let _ = client.send(data);
            });
        }
    });

    done_rx.recv_timeout(WAIT).expect("callback stuck in disconnect");
    let deadline = Instant::now() + WAIT;
    while !server.connections().is_empty() {
        assert!(Instant::now() < deadline, "records not removed");
        thread::sleep(Duration::from_millis(10));
    }
}
