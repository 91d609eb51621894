//! `commlink-store` – the streaming message store capability.
//!
//! The microservice talks to the store through the [`Store`] trait:
//!
//! - [`Store::receive_commands`] – the command worker's blocking consume of
//!   everything routed to one interface, with a per-message reply channel.
//! - [`Store::write_topic`] – publish an opaque [`MsgMap`] to a named topic.
//! - [`Store::set_interface`] – register/refresh interface state.
//!
//! [`MemoryStore`] implements the trait in-process on tokio channels so the
//! CLI and the test suites run without external services. Topic naming
//! helpers live in [`topics`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

use commlink_types::{CommError, InterfaceInfo, MsgMap};

pub mod topics;

/// Default fan-out capacity (buffered messages before slow subscribers drop).
const DEFAULT_CAPACITY: usize = 256;

/// Queue depth of each interface's routed-command channel.
const COMMAND_QUEUE_DEPTH: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Capability trait
// ─────────────────────────────────────────────────────────────────────────────

/// One message routed to an interface's command worker. The consumer must
/// send exactly one reply string; the store routes it back to the requester.
#[derive(Debug)]
pub struct RoutedCommand {
    pub topic: String,
    pub msg: MsgMap,
    pub reply: oneshot::Sender<String>,
}

/// Receiving half of an interface's command route. `recv` returns `None`
/// when the store shuts the route down.
pub struct CommandSub {
    rx: mpsc::Receiver<RoutedCommand>,
}

impl CommandSub {
    /// Wrap the receiving half of a routed-command channel. Store
    /// implementations use this to hand the consumer its sequence.
    pub fn new(rx: mpsc::Receiver<RoutedCommand>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<RoutedCommand> {
        self.rx.recv().await
    }
}

/// The store capability.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open the lazy command sequence for `interface_name` in `scope`.
    async fn receive_commands(
        &self,
        interface_name: &str,
        scope: &str,
    ) -> Result<CommandSub, CommError>;

    /// Publish `msg` to `topic`.
    async fn write_topic(&self, topic: &str, msg: MsgMap) -> Result<(), CommError>;

    /// Register or refresh the interface-state registry entry.
    async fn set_interface(
        &self,
        interface: &InterfaceInfo,
        scope: &str,
        initialize: bool,
    ) -> Result<(), CommError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process implementation
// ─────────────────────────────────────────────────────────────────────────────

/// A published topic write, as seen by fan-out subscribers.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub topic: String,
    pub msg: MsgMap,
}

struct StoreInner {
    /// `scope__interface` → routed-command producer.
    command_routes: BTreeMap<String, mpsc::Sender<RoutedCommand>>,
    /// `scope__interface` → latest registered descriptor.
    interfaces: BTreeMap<String, InterfaceInfo>,
}

/// In-process [`Store`] built on a tokio broadcast channel for published
/// topics plus per-interface mpsc routes for commands. Clone it cheaply –
/// all clones share the same broker state.
#[derive(Clone)]
pub struct MemoryStore {
    publications: broadcast::Sender<TopicEvent>,
    inner: std::sync::Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let (publications, _) = broadcast::channel(capacity);
        Self {
            publications,
            inner: std::sync::Arc::new(Mutex::new(StoreInner {
                command_routes: BTreeMap::new(),
                interfaces: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store lock poisoned")
    }

    fn route_key(scope: &str, interface_name: &str) -> String {
        format!("{scope}__{interface_name}")
    }

    /// Subscribe to every published topic write.
    pub fn subscribe(&self) -> broadcast::Receiver<TopicEvent> {
        self.publications.subscribe()
    }

    /// Subscribe filtered to topics starting with `prefix`.
    pub fn subscribe_topic(&self, prefix: impl Into<String>) -> TopicSubscriber {
        TopicSubscriber {
            prefix: prefix.into(),
            receiver: self.publications.subscribe(),
        }
    }

    /// Route a command or lifecycle message to an interface and wait for the
    /// consumer's reply string. This is the requester side of
    /// [`Store::receive_commands`].
    pub async fn route_command(
        &self,
        scope: &str,
        interface_name: &str,
        topic: impl Into<String>,
        msg: MsgMap,
    ) -> Result<String, CommError> {
        let sender = self
            .lock()
            .command_routes
            .get(&Self::route_key(scope, interface_name))
            .cloned()
            .ok_or_else(|| {
                CommError::Store(format!("no command consumer for {interface_name} in {scope}"))
            })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(RoutedCommand {
                topic: topic.into(),
                msg,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CommError::Store("command route closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| CommError::Store("command consumer dropped the reply".to_string()))
    }

    /// Latest registered descriptor for an interface.
    pub fn interface(&self, scope: &str, interface_name: &str) -> Option<InterfaceInfo> {
        self.lock()
            .interfaces
            .get(&Self::route_key(scope, interface_name))
            .cloned()
    }

    /// Close every command route. Consumers observe end-of-sequence and
    /// their workers terminate; part of process shutdown.
    pub fn shutdown(&self) {
        self.lock().command_routes.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn receive_commands(
        &self,
        interface_name: &str,
        scope: &str,
    ) -> Result<CommandSub, CommError> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        self.lock()
            .command_routes
            .insert(Self::route_key(scope, interface_name), tx);
        Ok(CommandSub::new(rx))
    }

    async fn write_topic(&self, topic: &str, msg: MsgMap) -> Result<(), CommError> {
        // Publishing with no live subscribers is not an error; telemetry
        // flows whether or not anyone is currently listening.
        let _ = self.publications.send(TopicEvent {
            topic: topic.to_string(),
            msg,
        });
        Ok(())
    }

    async fn set_interface(
        &self,
        interface: &InterfaceInfo,
        scope: &str,
        _initialize: bool,
    ) -> Result<(), CommError> {
        self.lock()
            .interfaces
            .insert(Self::route_key(scope, &interface.name), interface.clone());
        Ok(())
    }
}

/// A subscriber that only delivers events whose topic starts with the given
/// prefix.
pub struct TopicSubscriber {
    prefix: String,
    receiver: broadcast::Receiver<TopicEvent>,
}

impl TopicSubscriber {
    /// Wait for the next matching event; `None` when the store is gone.
    pub async fn recv(&mut self) -> Option<TopicEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.topic.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(prefix = %self.prefix, lagged_by = n, "topic subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
