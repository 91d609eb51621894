//! The interface supervisor: connection state machine and inbound read loop.
//!
//! The supervisor owns all state transitions of its interface and
//! serializes them against concurrent commanders. One tokio mutex guards
//! the critical section `{cancel, idle, Link::connect, Link::disconnect}`;
//! the latched flags themselves are atomics so the loop can check them
//! without taking the lock. [`Supervisor::stop`] latches `cancel`, cancels
//! the shared [`Sleeper`], and tears the link down under the mutex: any
//! concurrent connect attempt either already held the lock (and its fresh
//! connection is torn down right after) or observes `cancel` and skips the
//! `Link::connect` call entirely.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use commlink_dict::Dictionary;
use commlink_link::Link;
use commlink_store::Store;
use commlink_types::{
    message::msg_text, CommError, InterfaceState, ItemValueType, LinkError, MsgMap,
    SharedInterface,
};

use crate::exceptions::ExceptionLog;
use crate::packet_handler::PacketHandler;
use crate::sleeper::Sleeper;

/// Wait between loop passes while idle, and between liveness probes on
/// write-only interfaces.
const TICK: Duration = Duration::from_secs(1);

/// Which failure family a connection error belongs to, for logging and
/// exception-file dedup.
#[derive(Clone, Copy)]
enum FailureKind {
    Failed,
    Lost,
}

impl FailureKind {
    fn label(self) -> &'static str {
        match self {
            FailureKind::Failed => "connection_failed",
            FailureKind::Lost => "connection_lost",
        }
    }
}

/// Outcome of one guarded connect attempt by the read loop.
enum Attempt {
    Connected,
    Skipped,
    Failed(LinkError),
}

#[derive(Default)]
struct Dedup {
    failed_msgs: HashSet<String>,
    lost_msgs: HashSet<String>,
}

pub struct Supervisor {
    interface: SharedInterface,
    link: Arc<dyn Link>,
    dictionary: Arc<dyn Dictionary>,
    store: Arc<dyn Store>,
    scope: String,
    handler: PacketHandler,
    cancel: AtomicBool,
    idle: AtomicBool,
    /// Serializes `{cancel, idle, Link::connect, Link::disconnect}` and the
    /// exception dedup sets.
    lifecycle: Mutex<Dedup>,
    sleeper: Sleeper,
    exceptions: ExceptionLog,
}

impl Supervisor {
    pub fn new(
        interface: SharedInterface,
        link: Arc<dyn Link>,
        dictionary: Arc<dyn Dictionary>,
        store: Arc<dyn Store>,
        scope: impl Into<String>,
        exceptions: ExceptionLog,
    ) -> Self {
        let scope = scope.into();
        let handler = PacketHandler::new(
            interface.clone(),
            Arc::clone(&dictionary),
            Arc::clone(&store),
            scope.clone(),
        );
        Self {
            interface,
            link,
            dictionary,
            store,
            scope,
            handler,
            cancel: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            lifecycle: Mutex::new(Dedup::default()),
            sleeper: Sleeper::new(),
            exceptions,
        }
    }

    pub fn interface(&self) -> &SharedInterface {
        &self.interface
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    /// Emergency latch used by the task wrapper when the loop dies on an
    /// unexpected error. `stop` is the orderly path.
    pub fn latch_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.sleeper.cancel();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read / maintenance loop
    // ─────────────────────────────────────────────────────────────────────

    /// Run the connection/read loop until cancelled.
    ///
    /// Link failures are classified and absorbed; anything else (store or
    /// dictionary failures) propagates and is fatal to the loop.
    pub async fn run(&self) -> Result<(), CommError> {
        info!(interface = %self.interface.name(), "interface supervisor starting");
        while !self.cancelled() {
            if self.idle() {
                self.sleeper.sleep(TICK).await;
                continue;
            }

            if !self.link.connected().await {
                self.set_state_and_publish(InterfaceState::Attempting).await?;
                match self.guarded_connect().await {
                    Attempt::Connected => {
                        self.set_state_and_publish(InterfaceState::Connected).await?;
                        info!(interface = %self.interface.name(), "connected");
                    }
                    Attempt::Skipped => continue,
                    Attempt::Failed(e) => self.handle_connection_failed(&e).await,
                }
            } else if self.interface.read_allowed() {
                match self.link.read().await {
                    Ok(Some(packet)) => self.handler.handle(packet).await?,
                    Ok(None) => self.handle_connection_lost(None).await,
                    Err(e) => self.handle_connection_lost(Some(&e)).await,
                }
            } else {
                // Connection maintenance only: probe liveness once a tick.
                self.sleeper.sleep(TICK).await;
                if !self.link.connected().await {
                    self.handle_connection_lost(None).await;
                }
            }
        }
        info!(interface = %self.interface.name(), "interface supervisor stopped");
        Ok(())
    }

    /// The read loop's connect attempt. The pre-entry check runs inside the
    /// critical section: a `stop` or commanded disconnect that won the lock
    /// first makes this a no-op.
    async fn guarded_connect(&self) -> Attempt {
        let _guard = self.lifecycle.lock().await;
        if self.cancelled() || self.idle() {
            return Attempt::Skipped;
        }
        match self.link.connect().await {
            Ok(()) => {
                self.idle.store(false, Ordering::SeqCst);
                Attempt::Connected
            }
            Err(e) => Attempt::Failed(e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle operations (called by commanders)
    // ─────────────────────────────────────────────────────────────────────

    /// Commanded connect: wakes an idle interface and connects immediately.
    /// A no-op after `stop`.
    pub async fn connect(&self) -> Result<(), CommError> {
        {
            let _guard = self.lifecycle.lock().await;
            if self.cancelled() {
                return Ok(());
            }
            self.idle.store(false, Ordering::SeqCst);
            self.link.connect().await.map_err(CommError::Link)?;
        }
        self.set_state_and_publish(InterfaceState::Connected).await?;
        info!(interface = %self.interface.name(), "connected by command");
        Ok(())
    }

    /// Disconnect the link. `commanded` disconnects (and any disconnect
    /// with auto-reconnect off) park the interface idle; otherwise the
    /// reconnect delay is slept here, outside the mutex, before the loop's
    /// next attempt.
    pub async fn disconnect(&self, commanded: bool) {
        {
            let _guard = self.lifecycle.lock().await;
            if commanded || !self.interface.auto_reconnect() {
                self.idle.store(true, Ordering::SeqCst);
            }
            if let Err(e) = self.link.disconnect().await {
                warn!(interface = %self.interface.name(), error = %e, "link disconnect failed");
            }
        }
        if let Err(e) = self.set_state_and_publish(InterfaceState::Disconnected).await {
            warn!(interface = %self.interface.name(), error = %e, "state publication failed");
        }
        if self.interface.auto_reconnect() && !self.cancelled() {
            self.sleeper.sleep(self.interface.reconnect_delay()).await;
        }
    }

    /// Shut the supervisor down. After this returns no further
    /// `Link::connect` can be issued; the caller joins the read task.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.cancel.store(true, Ordering::SeqCst);
        self.sleeper.cancel();
        if let Err(e) = self.link.disconnect().await {
            warn!(interface = %self.interface.name(), error = %e, "link disconnect failed during stop");
        }
    }

    /// Inject a telemetry packet as if the link had read it: clone the
    /// dictionary template, apply the item writes, and hand it to the
    /// packet handler.
    pub async fn inject_tlm(&self, msg: &MsgMap) -> Result<(), CommError> {
        let target = msg_text(msg, "target_name").ok_or_else(|| CommError::BadValue {
            item: "target_name".to_string(),
            reason: "missing from inject_tlm message".to_string(),
        })?;
        let name = msg_text(msg, "packet_name").ok_or_else(|| CommError::BadValue {
            item: "packet_name".to_string(),
            reason: "missing from inject_tlm message".to_string(),
        })?;
        let value_type = msg_text(msg, "value_type")
            .and_then(ItemValueType::from_text)
            .unwrap_or(ItemValueType::Converted);

        let mut packet = self.dictionary.packet(target, name).await?;
        if let Some(hash) = msg_text(msg, "item_hash") {
            let items: serde_json::Map<String, Value> =
                serde_json::from_str(hash).map_err(|e| CommError::BadValue {
                    item: "item_hash".to_string(),
                    reason: e.to_string(),
                })?;
            for (item_name, value) in &items {
                packet.write_item(item_name, value, value_type)?;
            }
        }
        self.handler.handle(packet).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Failure classification
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_connection_failed(&self, err: &LinkError) {
        self.report_failure(FailureKind::Failed, err).await;
        self.disconnect(false).await;
    }

    async fn handle_connection_lost(&self, err: Option<&LinkError>) {
        match err {
            Some(e) => self.report_failure(FailureKind::Lost, e).await,
            None => info!(interface = %self.interface.name(), "connection lost"),
        }
        self.disconnect(false).await;
    }

    async fn report_failure(&self, kind: FailureKind, err: &LinkError) {
        match err {
            LinkError::Interrupted => {
                info!(
                    interface = %self.interface.name(),
                    "interrupt during connection, shutting down"
                );
                self.cancel.store(true, Ordering::SeqCst);
                self.sleeper.cancel();
            }
            e if is_transient(e) => {
                warn!(
                    interface = %self.interface.name(),
                    category = kind.label(),
                    error = %e,
                    "transient connection failure"
                );
            }
            e => {
                error!(
                    interface = %self.interface.name(),
                    category = kind.label(),
                    error = %e,
                    detail = ?e,
                    "unexpected connection failure"
                );
                let message = e.to_string();
                let first_occurrence = {
                    let mut dedup = self.lifecycle.lock().await;
                    match kind {
                        FailureKind::Failed => dedup.failed_msgs.insert(message.clone()),
                        FailureKind::Lost => dedup.lost_msgs.insert(message.clone()),
                    }
                };
                if first_occurrence {
                    if let Err(write_err) =
                        self.exceptions.write(kind.label(), &message, &format!("{e:?}"))
                    {
                        warn!(error = %write_err, "exception file write failed");
                    }
                }
            }
        }
    }

    async fn set_state_and_publish(&self, state: InterfaceState) -> Result<(), CommError> {
        self.interface.set_state(state);
        self.store
            .set_interface(&self.interface.snapshot(), &self.scope, false)
            .await
    }
}

/// Common transient transport failures: logged in summary, never persisted
/// to exception files.
fn is_transient(err: &LinkError) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    if msg.contains("canceled") || msg.contains("timeout") {
        return true;
    }
    match err {
        LinkError::NotConnected => true,
        LinkError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::AddrNotAvailable
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_dictionary, sample_interface, MockLink, ReadStep, RecordingStore};
    use commlink_types::InterfaceInfo;
    use std::io;

    struct Fixture {
        supervisor: Arc<Supervisor>,
        link: Arc<MockLink>,
        store: Arc<RecordingStore>,
        _tmp: tempfile::TempDir,
    }

    fn make_fixture(info: InterfaceInfo) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let link = Arc::new(MockLink::new());
        let store = Arc::new(RecordingStore::new());
        let supervisor = Arc::new(Supervisor::new(
            SharedInterface::new(info),
            Arc::clone(&link) as Arc<dyn Link>,
            Arc::new(sample_dictionary()),
            Arc::clone(&store) as Arc<dyn Store>,
            "DEFAULT",
            ExceptionLog::new(tmp.path().join("exceptions")),
        ));
        Fixture {
            supervisor,
            link,
            store,
            _tmp: tmp,
        }
    }

    fn spawn_run(supervisor: &Arc<Supervisor>) -> tokio::task::JoinHandle<()> {
        let sup = Arc::clone(supervisor);
        tokio::spawn(async move {
            sup.run().await.expect("run must not fail in tests");
        })
    }

    fn exception_files(fixture: &Fixture) -> usize {
        std::fs::read_dir(fixture._tmp.path().join("exceptions"))
            .map(|d| d.count())
            .unwrap_or(0)
    }

    fn health_buffer() -> Vec<u8> {
        vec![0x00, 0x01, 0x00, 0x64, 0x00, 0x07]
    }

    #[tokio::test]
    async fn connect_publishes_attempting_then_connected() {
        let fixture = make_fixture(sample_interface());
        let task = spawn_run(&fixture.supervisor);
        tokio::time::sleep(Duration::from_millis(50)).await;

        fixture.supervisor.stop().await;
        task.await.unwrap();

        let transitions = fixture.store.state_transitions();
        assert_eq!(
            &transitions[..2],
            &[InterfaceState::Attempting, InterfaceState::Connected]
        );
    }

    #[tokio::test]
    async fn clean_disconnect_reconnects_after_delay() {
        // S5: one clean close, then a packet on the re-established link.
        let fixture = make_fixture(sample_interface());
        fixture
            .link
            .script_reads(vec![ReadStep::Clean, ReadStep::Frame(health_buffer())]);

        let task = spawn_run(&fixture.supervisor);
        tokio::time::sleep(Duration::from_millis(300)).await;
        fixture.supervisor.stop().await;
        task.await.unwrap();

        assert_eq!(fixture.link.connect_calls(), 2);
        let telemetry: Vec<_> = fixture
            .store
            .topic_writes()
            .into_iter()
            .filter(|(topic, _)| topic.contains("TELEMETRY"))
            .collect();
        assert_eq!(telemetry.len(), 1);
        assert_eq!(telemetry[0].0, "DEFAULT__TELEMETRY__INST__HEALTH");

        let transitions = fixture.store.state_transitions();
        assert_eq!(
            &transitions[..5],
            &[
                InterfaceState::Attempting,
                InterfaceState::Connected,
                InterfaceState::Disconnected,
                InterfaceState::Attempting,
                InterfaceState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn lost_connection_without_auto_reconnect_goes_idle() {
        let mut info = sample_interface();
        info.auto_reconnect = false;
        let fixture = make_fixture(info);
        fixture.link.script_reads(vec![ReadStep::Clean]);

        let task = spawn_run(&fixture.supervisor);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(fixture.supervisor.idle());
        assert_eq!(fixture.link.connect_calls(), 1);

        fixture.supervisor.stop().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn no_connect_after_stop() {
        let fixture = make_fixture(sample_interface());
        fixture.supervisor.stop().await;

        let task = spawn_run(&fixture.supervisor);
        task.await.unwrap();
        assert_eq!(fixture.link.connect_calls(), 0);
    }

    #[tokio::test]
    async fn stop_races_connect_without_reviving_the_link() {
        // S6: stop immediately after the loop starts; whichever side wins
        // the mutex, no connect may begin after stop returns.
        let fixture = make_fixture(sample_interface());
        let task = spawn_run(&fixture.supervisor);
        fixture.supervisor.stop().await;

        let calls_after_stop = fixture.link.connect_calls();
        assert!(calls_after_stop <= 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fixture.link.connect_calls(), calls_after_stop);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn commanded_disconnect_parks_idle_until_commanded_connect() {
        let fixture = make_fixture(sample_interface());
        let task = spawn_run(&fixture.supervisor);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fixture.link.connect_calls(), 1);

        fixture.supervisor.disconnect(true).await;
        assert!(fixture.supervisor.idle());
        tokio::time::sleep(Duration::from_millis(150)).await;
        // The loop must not reconnect on its own while idle.
        assert_eq!(fixture.link.connect_calls(), 1);

        fixture.supervisor.connect().await.unwrap();
        assert!(!fixture.supervisor.idle());
        assert_eq!(fixture.link.connect_calls(), 2);
        assert_eq!(
            fixture.supervisor.interface().state(),
            InterfaceState::Connected
        );

        fixture.supervisor.stop().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn transient_connect_failures_write_no_exception_files() {
        let fixture = make_fixture(sample_interface());
        fixture.link.script_connect_failures(vec![
            LinkError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            LinkError::Io(io::Error::new(io::ErrorKind::TimedOut, "timed out")),
        ]);

        let task = spawn_run(&fixture.supervisor);
        tokio::time::sleep(Duration::from_millis(250)).await;
        fixture.supervisor.stop().await;
        task.await.unwrap();

        assert_eq!(exception_files(&fixture), 0);
        // The loop kept attempting past the failures.
        assert!(fixture.link.connect_calls() >= 3);
    }

    #[tokio::test]
    async fn unexpected_failures_are_deduplicated() {
        // Property 3: the same message raised twice yields one file.
        let fixture = make_fixture(sample_interface());
        fixture.link.script_connect_failures(vec![
            LinkError::Protocol("frame desync".to_string()),
            LinkError::Protocol("frame desync".to_string()),
        ]);

        let task = spawn_run(&fixture.supervisor);
        tokio::time::sleep(Duration::from_millis(250)).await;
        fixture.supervisor.stop().await;
        task.await.unwrap();

        assert_eq!(exception_files(&fixture), 1);
    }

    #[tokio::test]
    async fn distinct_unexpected_failures_each_get_a_file() {
        let fixture = make_fixture(sample_interface());
        fixture.link.script_connect_failures(vec![
            LinkError::Protocol("frame desync".to_string()),
            LinkError::Protocol("bad magic".to_string()),
        ]);

        let task = spawn_run(&fixture.supervisor);
        tokio::time::sleep(Duration::from_millis(250)).await;
        fixture.supervisor.stop().await;
        task.await.unwrap();

        assert_eq!(exception_files(&fixture), 2);
    }

    #[tokio::test]
    async fn interrupt_latches_cancel_and_exits() {
        let fixture = make_fixture(sample_interface());
        fixture
            .link
            .script_connect_failures(vec![LinkError::Interrupted]);

        let task = spawn_run(&fixture.supervisor);
        task.await.unwrap();
        assert!(fixture.supervisor.cancelled());
        assert_eq!(exception_files(&fixture), 0);
    }

    #[tokio::test]
    async fn unclean_read_failure_reconnects() {
        let fixture = make_fixture(sample_interface());
        fixture.link.script_reads(vec![ReadStep::Fail(LinkError::Io(
            io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"),
        ))]);

        let task = spawn_run(&fixture.supervisor);
        tokio::time::sleep(Duration::from_millis(200)).await;
        fixture.supervisor.stop().await;
        task.await.unwrap();

        assert!(fixture.link.connect_calls() >= 2);
        assert_eq!(exception_files(&fixture), 0);
    }

    #[tokio::test]
    async fn write_only_interface_skips_the_read_loop() {
        let mut info = sample_interface();
        info.read_allowed = false;
        let fixture = make_fixture(info);
        // A scripted frame that must never be consumed.
        fixture.link.script_reads(vec![ReadStep::Frame(health_buffer())]);

        let task = spawn_run(&fixture.supervisor);
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.supervisor.stop().await;
        task.await.unwrap();

        let telemetry = fixture
            .store
            .topic_writes()
            .into_iter()
            .filter(|(topic, _)| topic.contains("TELEMETRY"))
            .count();
        assert_eq!(telemetry, 0);
    }

    #[tokio::test]
    async fn inject_tlm_feeds_the_packet_handler() {
        let fixture = make_fixture(sample_interface());

        let mut msg = MsgMap::new();
        msg.insert("target_name".to_string(), "INST".into());
        msg.insert("packet_name".to_string(), "HEALTH".into());
        msg.insert("item_hash".to_string(), r#"{"TEMP": 33}"#.into());
        msg.insert("value_type".to_string(), "RAW".into());
        fixture.supervisor.inject_tlm(&msg).await.unwrap();

        let writes = fixture.store.topic_writes();
        assert_eq!(writes.len(), 1);
        let (topic, published) = &writes[0];
        assert_eq!(topic, "DEFAULT__TELEMETRY__INST__HEALTH");
        let buffer = published.get("buffer").and_then(|v| v.as_bytes()).unwrap();
        // TEMP occupies bytes 2..4 big-endian.
        assert_eq!(&buffer[2..4], &[0x00, 33]);
    }

    #[tokio::test]
    async fn inject_tlm_unknown_packet_is_an_error() {
        let fixture = make_fixture(sample_interface());
        let mut msg = MsgMap::new();
        msg.insert("target_name".to_string(), "INST".into());
        msg.insert("packet_name".to_string(), "GHOST".into());
        let err = fixture.supervisor.inject_tlm(&msg).await.unwrap_err();
        assert!(matches!(err, CommError::UnknownPacket { .. }));
    }

    #[test]
    fn transient_classification_covers_common_network_failures() {
        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::TimedOut,
            io::ErrorKind::NotConnected,
            io::ErrorKind::BrokenPipe,
        ] {
            assert!(is_transient(&LinkError::Io(io::Error::new(kind, "x"))));
        }
        assert!(is_transient(&LinkError::NotConnected));
        assert!(is_transient(&LinkError::Protocol(
            "request canceled".to_string()
        )));
        assert!(is_transient(&LinkError::Protocol(
            "handshake timeout".to_string()
        )));
        assert!(!is_transient(&LinkError::Protocol("frame desync".to_string())));
    }
}
