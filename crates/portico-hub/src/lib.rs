// In-process subscription registry for the portico hub.
// Ports live in mutex-guarded shards selected by `port_id % shard_count`;
// everything outside this crate talks to `Hub`, never to a shard directly.
use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

/// Integer pub/sub room address. Unrelated to TCP ports.
pub type PortId = u32;

/// A message fanned out to subscribers of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub port: PortId,
    pub body: Bytes,
}

// Process-unique subscriber identities; equality and hashing use only this.
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Reference to one connected client's outgoing pipeline.
///
/// Bundles the bounded queue its writer drains and a "done" observation that
/// becomes permanently true once the client's reader has terminated. Clones
/// share identity; a handle compares equal only to clones of itself.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: u64,
    outgoing: mpsc::Sender<Message>,
    done: watch::Receiver<bool>,
}

impl PartialEq for SubscriberHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubscriberHandle {}

impl Hash for SubscriberHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl SubscriberHandle {
    pub fn new(outgoing: mpsc::Sender<Message>, done: watch::Receiver<bool>) -> Self {
        Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            outgoing,
            done,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // Deliver one message to this subscriber. Fast path is a synchronous
    // try_send so publish order is preserved; on overflow a short-lived task
    // races the blocking send against the done observation, so a stuck or
    // vanished consumer never holds up the caller. Deliveries to a
    // disconnected subscriber are dropped silently.
    fn deliver(&self, message: Message) {
        if *self.done.borrow() {
            metrics::counter!("portico_deliveries_dropped_total", "reason" => "disconnected")
                .increment(1);
            return;
        }
        match self.outgoing.try_send(message) {
            Ok(()) => {
                metrics::counter!("portico_deliveries_total").increment(1);
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                metrics::counter!("portico_delivery_slow_path_total").increment(1);
                let outgoing = self.outgoing.clone();
                let mut done = self.done.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        result = outgoing.send(message) => {
                            if result.is_ok() {
                                metrics::counter!("portico_deliveries_total").increment(1);
                            } else {
                                metrics::counter!(
                                    "portico_deliveries_dropped_total",
                                    "reason" => "closed"
                                )
                                .increment(1);
                            }
                        }
                        // Fires both when done flips true and when its sender
                        // is dropped; either means the subscriber is gone.
                        _ = done.wait_for(|disconnected| *disconnected) => {
                            metrics::counter!(
                                "portico_deliveries_dropped_total",
                                "reason" => "disconnected"
                            )
                            .increment(1);
                        }
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::counter!("portico_deliveries_dropped_total", "reason" => "closed")
                    .increment(1);
            }
        }
    }
}

// Set of subscribers of one port, keyed by handle identity.
#[derive(Debug, Default)]
struct Port {
    subscribers: HashMap<u64, SubscriberHandle>,
}

impl Port {
    fn enter(&mut self, handle: SubscriberHandle) {
        // Re-entering is idempotent.
        self.subscribers.insert(handle.id(), handle);
    }

    fn exit(&mut self, id: u64) {
        self.subscribers.remove(&id);
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn broadcast(&self, message: &Message) {
        for handle in self.subscribers.values() {
            handle.deliver(message.clone());
        }
    }
}

// One mutex-guarded partition of the hub. Every stored port has at least one
// subscriber; the lock is only held for map lookups and the enqueue loop.
#[derive(Debug, Default)]
struct Shard {
    ports: Mutex<HashMap<PortId, Port>>,
}

impl Shard {
    fn enter(&self, port_id: PortId, handle: SubscriberHandle) {
        let mut ports = self.ports.lock().expect("shard lock");
        ports.entry(port_id).or_default().enter(handle);
    }

    fn exit(&self, port_id: PortId, id: u64) {
        let mut ports = self.ports.lock().expect("shard lock");
        if let Some(port) = ports.get_mut(&port_id) {
            port.exit(id);
            if port.is_empty() {
                ports.remove(&port_id);
            }
        }
    }

    fn broadcast(&self, port_id: PortId, message: &Message) -> bool {
        let ports = self.ports.lock().expect("shard lock");
        match ports.get(&port_id) {
            Some(port) => {
                port.broadcast(message);
                true
            }
            None => false,
        }
    }

    fn contains(&self, port_id: PortId) -> bool {
        self.ports.lock().expect("shard lock").contains_key(&port_id)
    }
}

/// Process-wide sharded registry of ports.
///
/// ```
/// use bytes::Bytes;
/// use portico_hub::{Hub, Message, SubscriberHandle};
/// use tokio::sync::{mpsc, watch};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let hub = Hub::new(4);
///     let (outgoing, mut incoming) = mpsc::channel(8);
///     let (_done_tx, done_rx) = watch::channel(false);
///     let handle = SubscriberHandle::new(outgoing, done_rx);
///     hub.enter(7, handle.clone());
///     let delivered = hub.broadcast(
///         7,
///         Message {
///             port: 7,
///             body: Bytes::from_static(b"hello"),
///         },
///     );
///     assert!(delivered);
///     let message = incoming.recv().await.expect("recv");
///     assert_eq!(message.body, Bytes::from_static(b"hello"));
/// });
/// ```
#[derive(Debug)]
pub struct Hub {
    shards: Vec<Shard>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(default_shard_count())
    }
}

/// Shard count used by [`Hub::default`]: one per logical CPU.
pub fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
}

impl Hub {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard::default());
        }
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    // Pure function of the port id, so all operations on one port serialize
    // through one lock.
    fn shard(&self, port_id: PortId) -> &Shard {
        &self.shards[port_id as usize % self.shards.len()]
    }

    /// Subscribe `handle` to `port_id`. Idempotent per handle identity.
    pub fn enter(&self, port_id: PortId, handle: SubscriberHandle) {
        metrics::counter!("portico_enter_total").increment(1);
        self.shard(port_id).enter(port_id, handle);
    }

    /// Unsubscribe `handle` from `port_id`; destroys the port if it empties.
    /// No-op when the handle is not a member.
    pub fn exit(&self, port_id: PortId, handle: &SubscriberHandle) {
        metrics::counter!("portico_exit_total").increment(1);
        self.shard(port_id).exit(port_id, handle.id());
    }

    /// Fan `message` out to every current subscriber of `port_id`.
    ///
    /// Returns `true` iff the port had at least one subscriber at the moment
    /// of the call; that is a presence claim, not a delivery promise.
    pub fn broadcast(&self, port_id: PortId, message: Message) -> bool {
        let delivered = self.shard(port_id).broadcast(port_id, &message);
        let result = if delivered { "delivered" } else { "no_subscribers" };
        metrics::counter!("portico_broadcasts_total", "result" => result).increment(1);
        delivered
    }

    /// Whether any subscriber is currently entered into `port_id`.
    pub fn contains_port(&self, port_id: PortId) -> bool {
        self.shard(port_id).contains(port_id)
    }
}
