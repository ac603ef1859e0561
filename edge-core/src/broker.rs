//! Pub/sub broker interface used for hybrid bootstrap and broker transport,
//! plus `LocalBroker`, an in-process implementation.
//!
//! Topics follow MQTT conventions: `/`-separated levels, `+` matches one
//! level and `#` matches the rest in subscription filters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{EdgeError, Result};
use crate::queue::{EdgeQueue, QueueLimit};

/// Broker port used when `DEST_PORT` is unset.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// Direct delivery of a received message, called on the broker's thread.
pub type MessageListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Creates broker links. Implemented by broker client bindings.
pub trait BrokerConnector: Send + Sync {
    /// Connect as `client_id` to the broker at `host:port`; `topic` is where `publish` goes.
    fn connect(&self, client_id: &str, topic: &str, host: &str, port: u16)
        -> Result<Box<dyn BrokerLink>>;
}

/// One client connection to a broker.
pub trait BrokerLink: Send + Sync {
    /// Publish to the link's topic. The broker retains the last message per topic.
    fn publish(&self, payload: &[u8]) -> Result<()>;
    /// Subscribe to a topic filter; messages go to the listener or the internal queue.
    fn subscribe(&self, filter: &str) -> Result<()>;
    fn is_connected(&self) -> bool;
    /// Pop the next queued message. `Duration::ZERO` waits forever.
    fn get_message(&self, timeout: Duration) -> Result<Vec<u8>>;
    /// Deliver messages directly instead of queueing them. `None` reverts to queueing.
    fn set_listener(&self, listener: Option<MessageListener>);
    fn set_queue_limit(&self, limit: QueueLimit);
    fn close(&self);
}

/// Whether `topic` matches subscription `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Topic a node publishes under: derived from its id and topic name.
pub fn device_topic(id: &str, topic: &str) -> String {
    format!("edge/inference/device-{id}/{topic}/")
}

/// Filter matching every device publishing under `topic`.
pub fn topic_filter(topic: &str) -> String {
    format!("edge/inference/+/{topic}/#")
}

#[derive(Default)]
struct Hub {
    links: Mutex<Vec<Weak<LinkShared>>>,
    retained: Mutex<HashMap<String, Vec<u8>>>,
}

impl Hub {
    fn route(&self, topic: &str, payload: &[u8]) {
        self.retained
            .lock()
            .insert(topic.to_string(), payload.to_vec());
        let links: Vec<Arc<LinkShared>> = {
            let mut links = self.links.lock();
            links.retain(|l| l.strong_count() > 0);
            links.iter().filter_map(Weak::upgrade).collect()
        };
        for link in links {
            if link.wants(topic) {
                link.deliver(payload);
            }
        }
    }
}

/// In-process broker. Every connector clone shares one hub.
#[derive(Clone, Default)]
pub struct LocalBroker {
    hub: Arc<Hub>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retained message for an exact topic, if any.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.hub.retained.lock().get(topic).cloned()
    }

    /// Links that are still open.
    pub fn open_links(&self) -> usize {
        self.hub
            .links
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|l| l.connected.load(Ordering::Acquire))
            .count()
    }
}

impl BrokerConnector for LocalBroker {
    fn connect(
        &self,
        client_id: &str,
        topic: &str,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn BrokerLink>> {
        if client_id.is_empty() || topic.is_empty() {
            return Err(EdgeError::invalid("broker client id and topic are required"));
        }
        debug!(client_id, topic, host, port, "local broker link connected");
        let shared = Arc::new(LinkShared {
            filters: Mutex::new(Vec::new()),
            queue: EdgeQueue::new(),
            connected: AtomicBool::new(true),
        });
        self.hub.links.lock().push(Arc::downgrade(&shared));
        Ok(Box::new(LocalLink {
            hub: self.hub.clone(),
            topic: topic.to_string(),
            shared,
            dispatcher: Mutex::new(None),
            dispatching: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct LinkShared {
    filters: Mutex<Vec<String>>,
    queue: EdgeQueue<Vec<u8>>,
    connected: AtomicBool,
}

impl LinkShared {
    fn wants(&self, topic: &str) -> bool {
        self.connected.load(Ordering::Acquire)
            && self.filters.lock().iter().any(|f| topic_matches(f, topic))
    }

    fn deliver(&self, payload: &[u8]) {
        self.queue.push(payload.to_vec());
    }
}

struct LocalLink {
    hub: Arc<Hub>,
    topic: String,
    shared: Arc<LinkShared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatching: Arc<AtomicBool>,
}

impl LocalLink {
    fn stop_dispatcher(&self) {
        self.dispatching.store(false, Ordering::Release);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("broker dispatcher panicked");
            }
        }
    }
}

impl BrokerLink for LocalLink {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(EdgeError::ConnectionFailed("broker link closed".into()));
        }
        self.hub.route(&self.topic, payload);
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(EdgeError::ConnectionFailed("broker link closed".into()));
        }
        self.shared.filters.lock().push(filter.to_string());
        let retained: Vec<Vec<u8>> = self
            .hub
            .retained
            .lock()
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(_, payload)| payload.clone())
            .collect();
        for payload in retained {
            self.shared.deliver(&payload);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn get_message(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.shared.queue.wait_pop(timeout)
    }

    fn set_listener(&self, listener: Option<MessageListener>) {
        self.stop_dispatcher();
        let Some(listener) = listener else {
            return;
        };
        self.dispatching.store(true, Ordering::Release);
        let running = self.dispatching.clone();
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("edge-broker-dispatch".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    if let Ok(msg) = shared.queue.wait_pop(DISPATCH_POLL) {
                        listener(&msg);
                    }
                }
            });
        match spawned {
            Ok(handle) => *self.dispatcher.lock() = Some(handle),
            Err(e) => warn!("failed to start broker dispatcher: {e}"),
        }
    }

    fn set_queue_limit(&self, limit: QueueLimit) {
        self.shared.queue.set_limit(limit);
    }

    fn close(&self) {
        self.shared.connected.store(false, Ordering::Release);
        self.stop_dispatcher();
        self.shared.queue.clear();
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn filter_matching() {
        let topic = device_topic("srv", "tensor");
        assert_eq!(topic, "edge/inference/device-srv/tensor/");
        assert!(topic_matches(&topic_filter("tensor"), &topic));
        assert!(!topic_matches(&topic_filter("audio"), &topic));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
    }

    #[test]
    fn retained_message_reaches_late_subscriber() {
        let broker = LocalBroker::new();
        let server = broker
            .connect("srv", &device_topic("srv", "t"), "localhost", 1883)
            .unwrap();
        server.publish(b"127.0.0.1:3000").unwrap();

        let client = broker.connect("cli", "unused", "localhost", 1883).unwrap();
        client.subscribe(&topic_filter("t")).unwrap();
        assert_eq!(
            client.get_message(Duration::from_secs(1)).unwrap(),
            b"127.0.0.1:3000"
        );
        assert!(matches!(
            client.get_message(Duration::from_millis(10)),
            Err(EdgeError::TimedOut)
        ));
    }

    #[test]
    fn listener_receives_on_dispatch_thread() {
        let broker = LocalBroker::new();
        let sub = broker.connect("sub", "x", "localhost", 1883).unwrap();
        sub.subscribe("data/#").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        sub.set_listener(Some(Arc::new(move |msg: &[u8]| {
            let _ = tx.lock().send((msg.to_vec(), thread::current().name().map(String::from)));
        })));

        let publisher = broker.connect("pub", "data/1", "localhost", 1883).unwrap();
        publisher.publish(b"hello").unwrap();
        let (msg, thread_name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg, b"hello");
        assert_eq!(thread_name.as_deref(), Some("edge-broker-dispatch"));
        sub.close();
        assert!(!sub.is_connected());
    }

    #[test]
    fn closed_link_rejects_publish() {
        let broker = LocalBroker::new();
        let link = broker.connect("a", "t", "localhost", 1883).unwrap();
        assert_eq!(broker.open_links(), 1);
        link.close();
        assert_eq!(broker.open_links(), 0);
        assert!(matches!(
            link.publish(b"x"),
            Err(EdgeError::ConnectionFailed(_))
        ));
    }
}
