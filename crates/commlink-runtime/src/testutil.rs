//! Shared test doubles for the runtime test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify};

use commlink_dict::MemoryDictionary;
use commlink_link::Link;
use commlink_store::{CommandSub, RoutedCommand, Store};
use commlink_types::{
    CommError, InterfaceInfo, InterfaceState, LinkError, MsgMap, Packet, PacketItem,
};

/// Dictionary fixture shared by the handler/worker/supervisor tests:
/// telemetry `INST HEALTH` (id 0x0001) plus commands `INST ABORT`
/// (non-hazardous) and `INST CLEAR` (hazardous).
pub(crate) fn sample_dictionary() -> MemoryDictionary {
    let dict = MemoryDictionary::new();
    dict.add_telemetry(Packet::template(
        "INST",
        "HEALTH",
        6,
        vec![
            PacketItem::new("PKTID", 0, 2).with_id_value(0x0001),
            PacketItem::new("TEMP", 2, 2),
            PacketItem::new("COUNT", 4, 2),
        ],
    ));
    dict.add_command(
        Packet::template(
            "INST",
            "ABORT",
            3,
            vec![
                PacketItem::new("CCSDSVER", 0, 1),
                PacketItem::new("PKTID", 1, 2).with_format("0x%X"),
            ],
        ),
        None,
    );
    dict.add_command(
        Packet::template("INST", "CLEAR", 2, vec![PacketItem::new("OPCODE", 0, 2)]),
        Some("Clears the stored event log".to_string()),
    );
    dict
}

/// Baseline interface descriptor for the fixtures.
pub(crate) fn sample_interface() -> InterfaceInfo {
    let mut info = InterfaceInfo::new("SERIAL_INT");
    info.target_names.push("INST".to_string());
    info.reconnect_delay = std::time::Duration::from_millis(50);
    info
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordingStore
// ─────────────────────────────────────────────────────────────────────────────

/// [`Store`] double that records every topic write and every state refresh
/// in order, and exposes a single routed-command producer.
pub(crate) struct RecordingStore {
    topics: Mutex<Vec<(String, MsgMap)>>,
    states: Mutex<Vec<InterfaceState>>,
    route_tx: Mutex<Option<mpsc::Sender<RoutedCommand>>>,
}

impl RecordingStore {
    pub(crate) fn new() -> Self {
        Self {
            topics: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            route_tx: Mutex::new(None),
        }
    }

    pub(crate) fn topic_writes(&self) -> Vec<(String, MsgMap)> {
        self.topics.lock().unwrap().clone()
    }

    pub(crate) fn state_refreshes(&self) -> Vec<InterfaceState> {
        self.states.lock().unwrap().clone()
    }

    /// State transitions with consecutive duplicates collapsed (the
    /// handler refreshes current state on every packet).
    pub(crate) fn state_transitions(&self) -> Vec<InterfaceState> {
        let mut out: Vec<InterfaceState> = Vec::new();
        for state in self.states.lock().unwrap().iter() {
            if out.last() != Some(state) {
                out.push(*state);
            }
        }
        out
    }

    /// Send one message into the registered command route and await the
    /// consumer's reply.
    pub(crate) async fn route(&self, topic: &str, msg: MsgMap) -> String {
        let tx = self
            .route_tx
            .lock()
            .unwrap()
            .clone()
            .expect("receive_commands not called yet");
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(RoutedCommand {
            topic: topic.to_string(),
            msg,
            reply: reply_tx,
        })
        .await
        .expect("command route closed");
        reply_rx.await.expect("no reply")
    }

    /// Drop the producer; the consumer's sequence ends.
    pub(crate) fn close_routes(&self) {
        self.route_tx.lock().unwrap().take();
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn receive_commands(
        &self,
        _interface_name: &str,
        _scope: &str,
    ) -> Result<CommandSub, CommError> {
        let (tx, rx) = mpsc::channel(16);
        *self.route_tx.lock().unwrap() = Some(tx);
        Ok(CommandSub::new(rx))
    }

    async fn write_topic(&self, topic: &str, msg: MsgMap) -> Result<(), CommError> {
        self.topics.lock().unwrap().push((topic.to_string(), msg));
        Ok(())
    }

    async fn set_interface(
        &self,
        interface: &InterfaceInfo,
        _scope: &str,
        _initialize: bool,
    ) -> Result<(), CommError> {
        self.states.lock().unwrap().push(interface.state);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MockLink
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) enum ReadStep {
    /// A framed packet with this buffer.
    Frame(Vec<u8>),
    /// Clean disconnect (`Ok(None)`).
    Clean,
    /// Unclean disconnect.
    Fail(LinkError),
}

/// Scripted [`Link`]. Reads consume the script in order; an exhausted
/// script blocks like a real socket until the link is torn down, at which
/// point the pending read resolves as a clean close.
#[derive(Default)]
pub(crate) struct MockLink {
    connected: AtomicBool,
    connect_calls: AtomicUsize,
    connect_failures: Mutex<VecDeque<LinkError>>,
    reads: Mutex<VecDeque<ReadStep>>,
    writes: Mutex<Vec<Vec<u8>>>,
    write_failure: Mutex<Option<LinkError>>,
    teardown: Notify,
}

impl MockLink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script_reads(&self, steps: Vec<ReadStep>) {
        self.reads.lock().unwrap().extend(steps);
    }

    pub(crate) fn script_connect_failures(&self, failures: Vec<LinkError>) {
        self.connect_failures.lock().unwrap().extend(failures);
    }

    pub(crate) fn script_write_failure(&self, failure: LinkError) {
        *self.write_failure.lock().unwrap() = Some(failure);
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Link for MockLink {
    async fn connect(&self) -> Result<(), LinkError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.connected.store(false, Ordering::SeqCst);
        self.teardown.notify_waiters();
        Ok(())
    }

    async fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self) -> Result<Option<Packet>, LinkError> {
        let step = self.reads.lock().unwrap().pop_front();
        match step {
            Some(ReadStep::Frame(buffer)) => Ok(Some(Packet::from_buffer(buffer))),
            Some(ReadStep::Clean) => Ok(None),
            Some(ReadStep::Fail(err)) => Err(err),
            None => {
                // Block like a real socket; a teardown resolves the read as
                // a clean close.
                let notified = self.teardown.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.connected.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                notified.await;
                Ok(None)
            }
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if let Some(err) = self.write_failure.lock().unwrap().take() {
            return Err(err);
        }
        self.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }
}
