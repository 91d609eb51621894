//! Assembly of one interface microservice instance.
//!
//! [`InterfaceMicroservice`] parses its identity
//! (`<scope>__<kind>__<interface_name>`), builds the shared interface
//! descriptor, and runs the two worker tasks: the supervisor's
//! read/maintenance loop and the command worker's message loop.
//!
//! Shutdown is a two-step handshake: the store collaborator ends the
//! routed-command sequence (for [`MemoryStore`] that is
//! [`MemoryStore::shutdown`]), and [`InterfaceMicroservice::stop`] stops the
//! supervisor and joins both tasks.
//!
//! [`MemoryStore`]: commlink_store::MemoryStore
//! [`MemoryStore::shutdown`]: commlink_store::MemoryStore::shutdown

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use commlink_dict::Dictionary;
use commlink_link::Link;
use commlink_store::{topics, Store};
use commlink_types::{CommError, InterfaceInfo, SharedInterface};

use crate::cmd_worker::CmdWorker;
use crate::exceptions::ExceptionLog;
use crate::supervisor::Supervisor;

/// How long `stop` waits for the command worker before aborting it. The
/// store is expected to end the routed-command sequence on shutdown; the
/// timeout only guards against a store that never does.
const CMD_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Construction-time options for the interface descriptor.
#[derive(Clone, Debug)]
pub struct InterfaceOptions {
    pub targets: Vec<String>,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub read_allowed: bool,
    /// Directory for deduplicated exception files.
    pub exception_dir: PathBuf,
}

impl Default for InterfaceOptions {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            read_allowed: true,
            exception_dir: PathBuf::from("exceptions"),
        }
    }
}

pub struct InterfaceMicroservice {
    name: String,
    scope: String,
    interface: SharedInterface,
    store: Arc<dyn Store>,
    supervisor: Arc<Supervisor>,
    worker: Option<CmdWorker>,
    read_task: Option<JoinHandle<()>>,
    cmd_task: Option<JoinHandle<()>>,
}

impl InterfaceMicroservice {
    /// Build an instance from its microservice identity. The interface name
    /// is component `[2]` of the `__`-separated identity.
    pub fn new(
        microservice_name: &str,
        options: InterfaceOptions,
        link: Arc<dyn Link>,
        dictionary: Arc<dyn Dictionary>,
        store: Arc<dyn Store>,
    ) -> Result<Self, CommError> {
        let scope = topics::scope_from(microservice_name)?.to_string();
        let interface_name = topics::interface_name_from(microservice_name)?.to_string();

        let mut info = InterfaceInfo::new(interface_name);
        info.target_names = options.targets;
        info.auto_reconnect = options.auto_reconnect;
        info.reconnect_delay = options.reconnect_delay;
        info.read_allowed = options.read_allowed;
        let interface = SharedInterface::new(info);

        let supervisor = Arc::new(Supervisor::new(
            interface.clone(),
            Arc::clone(&link),
            Arc::clone(&dictionary),
            Arc::clone(&store),
            scope.clone(),
            ExceptionLog::new(options.exception_dir),
        ));
        let worker = CmdWorker::new(
            Arc::clone(&supervisor),
            link,
            dictionary,
            Arc::clone(&store),
            scope.clone(),
        );

        Ok(Self {
            name: microservice_name.to_string(),
            scope,
            interface,
            store,
            supervisor,
            worker: Some(worker),
            read_task: None,
            cmd_task: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn interface(&self) -> &SharedInterface {
        &self.interface
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Register the interface and spawn the two worker tasks.
    pub async fn start(&mut self) -> Result<(), CommError> {
        self.store
            .set_interface(&self.interface.snapshot(), &self.scope, true)
            .await?;

        let supervisor = Arc::clone(&self.supervisor);
        let read_name = self.interface.name();
        self.read_task = Some(tokio::spawn(async move {
            if let Err(e) = supervisor.run().await {
                // Unexpected loop errors are fatal to the instance.
                error!(interface = %read_name, error = %e, "interface loop died");
                supervisor.latch_cancel();
            }
        }));

        let worker = self
            .worker
            .take()
            .ok_or_else(|| CommError::Store("microservice already started".to_string()))?;
        let cmd_name = self.interface.name();
        self.cmd_task = Some(tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!(interface = %cmd_name, error = %e, "command worker died");
            }
        }));

        info!(microservice = %self.name, "interface microservice started");
        Ok(())
    }

    /// Stop the supervisor and join both tasks. Call after the store has
    /// ended the routed-command sequence.
    pub async fn stop(&mut self) {
        self.supervisor.stop().await;
        if let Some(task) = self.read_task.take() {
            if let Err(e) = task.await {
                warn!(microservice = %self.name, error = %e, "read task join failed");
            }
        }
        if let Some(task) = self.cmd_task.take() {
            let abort = task.abort_handle();
            match tokio::time::timeout(CMD_JOIN_TIMEOUT, task).await {
                Ok(Err(e)) => {
                    warn!(microservice = %self.name, error = %e, "command task join failed")
                }
                Err(_) => {
                    warn!(
                        microservice = %self.name,
                        "command task did not end; store never closed the sequence"
                    );
                    abort.abort();
                }
                Ok(Ok(())) => {}
            }
        }
        info!(microservice = %self.name, "interface microservice stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_dictionary, MockLink};
    use commlink_store::MemoryStore;
    use commlink_types::{InterfaceState, MsgMap};

    fn make_microservice() -> (InterfaceMicroservice, Arc<MockLink>, Arc<MemoryStore>) {
        let tmp = std::env::temp_dir().join(format!("commlink-test-{}", uuid::Uuid::new_v4()));
        let link = Arc::new(MockLink::new());
        let store = Arc::new(MemoryStore::default());
        let options = InterfaceOptions {
            targets: vec!["INST".to_string()],
            reconnect_delay: Duration::from_millis(50),
            exception_dir: tmp,
            ..InterfaceOptions::default()
        };
        let ms = InterfaceMicroservice::new(
            "DEFAULT__INTERFACE__SERIAL_INT",
            options,
            Arc::clone(&link) as Arc<dyn Link>,
            Arc::new(sample_dictionary()) as Arc<dyn Dictionary>,
            Arc::clone(&store) as Arc<dyn Store>,
        )
        .unwrap();
        (ms, link, store)
    }

    #[test]
    fn identity_parses_scope_and_interface_name() {
        let (ms, _, _) = make_microservice();
        assert_eq!(ms.scope(), "DEFAULT");
        assert_eq!(ms.interface().name(), "SERIAL_INT");
    }

    #[test]
    fn malformed_identity_is_rejected() {
        let result = InterfaceMicroservice::new(
            "JUSTANAME",
            InterfaceOptions::default(),
            Arc::new(MockLink::new()) as Arc<dyn Link>,
            Arc::new(sample_dictionary()) as Arc<dyn Dictionary>,
            Arc::new(MemoryStore::default()) as Arc<dyn Store>,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_registers_connects_and_serves_commands() {
        let (mut ms, link, store) = make_microservice();
        ms.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The supervisor connected and registered CONNECTED state.
        assert_eq!(link.connect_calls(), 1);
        assert_eq!(
            store.interface("DEFAULT", "SERIAL_INT").unwrap().state,
            InterfaceState::Connected
        );

        // A structured command flows end to end.
        let mut msg = MsgMap::new();
        msg.insert("target_name".to_string(), "INST".into());
        msg.insert("cmd_name".to_string(), "ABORT".into());
        msg.insert("cmd_params".to_string(), "{}".into());
        let mut echoes = store.subscribe_topic("DEFAULT__COMMAND__");
        let reply = store
            .route_command("DEFAULT", "SERIAL_INT", "DEFAULT__CMD", msg)
            .await
            .unwrap();
        assert_eq!(reply, "SUCCESS");
        assert_eq!(link.writes().len(), 1);
        assert_eq!(
            echoes.recv().await.unwrap().topic,
            "DEFAULT__COMMAND__INST__ABORT"
        );

        store.shutdown();
        ms.stop().await;
        assert!(ms.supervisor().cancelled());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_joins_cleanly() {
        let (mut ms, _link, store) = make_microservice();
        ms.start().await.unwrap();
        // Let the worker register its command route before closing it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.shutdown();
        ms.stop().await;
        // A second stop has nothing left to join.
        ms.stop().await;
    }
}
