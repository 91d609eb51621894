//! The command worker: consumes every message routed to this interface.
//!
//! Two message families arrive on the routed-command sequence:
//!
//! * **Lifecycle** – topics carrying the `CMDINTERFACE` discriminator:
//!   `connect`, `disconnect`, `raw`, and `inject_tlm` directives that
//!   short-circuit into the supervisor and the link.
//! * **Structured commands** – built through the dictionary, optionally
//!   vetoed as hazardous, written to the link, and echoed to the
//!   `COMMAND`/`DECOMCMD` topics.
//!
//! Every message produces exactly one reply string (`"SUCCESS"`,
//! `"HazardousError"`, or the failure's message text); the store routes the
//! reply back to the requester. A processing failure never kills the loop.

use std::sync::Arc;

use tracing::{error, warn};

use commlink_dict::{CmdParams, Dictionary};
use commlink_link::Link;
use commlink_store::{topics, Store};
use commlink_types::{
    bool_from_text, epoch_nanos, message::msg_text, now_nanos, CommError, ItemValueType, MsgMap,
    Packet, SharedInterface,
};

use crate::supervisor::Supervisor;

const SUCCESS: &str = "SUCCESS";
const HAZARDOUS_ERROR: &str = "HazardousError";

pub struct CmdWorker {
    interface: SharedInterface,
    supervisor: Arc<Supervisor>,
    link: Arc<dyn Link>,
    dictionary: Arc<dyn Dictionary>,
    store: Arc<dyn Store>,
    scope: String,
}

impl CmdWorker {
    pub fn new(
        supervisor: Arc<Supervisor>,
        link: Arc<dyn Link>,
        dictionary: Arc<dyn Dictionary>,
        store: Arc<dyn Store>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            interface: supervisor.interface().clone(),
            supervisor,
            link,
            dictionary,
            store,
            scope: scope.into(),
        }
    }

    /// Consume the routed-command sequence until the store ends it.
    pub async fn run(&self) -> Result<(), CommError> {
        let mut sub = self
            .store
            .receive_commands(&self.interface.name(), &self.scope)
            .await?;
        while let Some(routed) = sub.recv().await {
            let reply = match self.process(&routed.topic, &routed.msg).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(
                        interface = %self.interface.name(),
                        topic = %routed.topic,
                        error = %e,
                        "command processing failed"
                    );
                    e.to_string()
                }
            };
            if routed.reply.send(reply).is_err() {
                warn!(
                    interface = %self.interface.name(),
                    topic = %routed.topic,
                    "requester gone before the reply"
                );
            }
        }
        Ok(())
    }

    async fn process(&self, topic: &str, msg: &MsgMap) -> Result<String, CommError> {
        if topic.contains(topics::CMD_INTERFACE) {
            self.process_lifecycle(msg).await
        } else {
            self.process_command(msg).await
        }
    }

    async fn process_lifecycle(&self, msg: &MsgMap) -> Result<String, CommError> {
        if msg.contains_key("connect") {
            self.supervisor.connect().await?;
        } else if msg.contains_key("disconnect") {
            self.supervisor.disconnect(true).await;
        } else if let Some(raw) = msg.get("raw") {
            let bytes = raw.as_bytes().ok_or_else(|| CommError::BadValue {
                item: "raw".to_string(),
                reason: "raw lifecycle write requires a byte payload".to_string(),
            })?;
            self.link.write(bytes).await.map_err(CommError::Link)?;
        } else if msg.contains_key("inject_tlm") {
            self.supervisor.inject_tlm(msg).await?;
        } else {
            return Err(CommError::BadValue {
                item: "lifecycle".to_string(),
                reason: format!(
                    "unrecognized lifecycle message for {}",
                    self.interface.name()
                ),
            });
        }
        Ok(SUCCESS.to_string())
    }

    async fn process_command(&self, msg: &MsgMap) -> Result<String, CommError> {
        let target = msg_text(msg, "target_name").unwrap_or_default().to_string();
        let cmd_name = msg_text(msg, "cmd_name").unwrap_or_default().to_string();
        let range_check = bool_from_text(msg_text(msg, "range_check"));
        let raw = bool_from_text(msg_text(msg, "raw"));
        let hazardous_check = bool_from_text(msg_text(msg, "hazardous_check"));

        // Build. Parse and build failures are reported verbatim to the
        // requester; they are not fatal.
        let params: CmdParams = match serde_json::from_str(msg_text(msg, "cmd_params").unwrap_or("{}"))
        {
            Ok(params) => params,
            Err(e) => {
                error!(
                    interface = %self.interface.name(),
                    target = %target,
                    command = %cmd_name,
                    error = %e,
                    "command parameter parse failed"
                );
                return Ok(e.to_string());
            }
        };
        let cmd = match self
            .dictionary
            .build_cmd(&target, &cmd_name, &params, range_check, raw)
            .await
        {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(
                    interface = %self.interface.name(),
                    target = %target,
                    command = %cmd_name,
                    error = %e,
                    "command build failed"
                );
                return Ok(e.to_string());
            }
        };

        // Hazardous veto.
        if hazardous_check {
            let (hazardous, description) = self.dictionary.cmd_pkt_hazardous(&cmd).await?;
            if hazardous {
                warn!(
                    interface = %self.interface.name(),
                    target = %target,
                    command = %cmd_name,
                    description = description.as_deref().unwrap_or(""),
                    "hazardous command vetoed"
                );
                return Ok(HAZARDOUS_ERROR.to_string());
            }
        }

        // Write to the link.
        if let Err(e) = self.link.write(&cmd.buffer).await {
            error!(
                interface = %self.interface.name(),
                target = %target,
                command = %cmd_name,
                error = %e,
                "command write failed"
            );
            return Ok(e.to_string());
        }

        let target_name = cmd.target_name.clone().unwrap_or(target);
        let packet_name = cmd.packet_name.clone().unwrap_or(cmd_name);
        let time = cmd.received_time.map(epoch_nanos).unwrap_or_else(now_nanos);

        // Raw command echo.
        let mut raw_msg = MsgMap::new();
        raw_msg.insert("time".to_string(), time.into());
        raw_msg.insert("target_name".to_string(), target_name.clone().into());
        raw_msg.insert("packet_name".to_string(), packet_name.clone().into());
        raw_msg.insert("received_count".to_string(), cmd.received_count.into());
        raw_msg.insert("buffer".to_string(), cmd.buffer.clone().into());
        self.store
            .write_topic(
                &topics::command(&self.scope, &target_name, &packet_name),
                raw_msg,
            )
            .await?;

        // Decommutated echo: same message minus the buffer, plus json_data.
        let json_hash = build_json_hash(&cmd)?;
        let mut decom_msg = MsgMap::new();
        decom_msg.insert("time".to_string(), time.into());
        decom_msg.insert("target_name".to_string(), target_name.clone().into());
        decom_msg.insert("packet_name".to_string(), packet_name.clone().into());
        decom_msg.insert("received_count".to_string(), cmd.received_count.into());
        decom_msg.insert(
            "json_data".to_string(),
            serde_json::to_string(&json_hash)
                .map_err(|e| CommError::Store(e.to_string()))?
                .into(),
        );
        self.store
            .write_topic(
                &topics::decom_command(&self.scope, &target_name, &packet_name),
                decom_msg,
            )
            .await?;

        self.store
            .set_interface(&self.interface.snapshot(), &self.scope, false)
            .await?;
        Ok(SUCCESS.to_string())
    }
}

/// Decommutated view of a built command, keyed over its ordered items:
/// always `name → RAW`; `name__C` when the item has states or a write
/// conversion; `name__F` when it has a format string; `name__U` when it has
/// units.
fn build_json_hash(cmd: &Packet) -> Result<serde_json::Map<String, serde_json::Value>, CommError> {
    let mut hash = serde_json::Map::new();
    for item in &cmd.items {
        hash.insert(
            item.name.clone(),
            cmd.read_item(&item.name, ItemValueType::Raw)?.to_json(),
        );
        if item.states.is_some() || item.write_conversion.is_some() {
            hash.insert(
                format!("{}__C", item.name),
                cmd.read_item(&item.name, ItemValueType::Converted)?.to_json(),
            );
        }
        if item.format_string.is_some() {
            hash.insert(
                format!("{}__F", item.name),
                cmd.read_item(&item.name, ItemValueType::Formatted)?.to_json(),
            );
        }
        if item.units.is_some() {
            hash.insert(
                format!("{}__U", item.name),
                cmd.read_item(&item.name, ItemValueType::WithUnits)?.to_json(),
            );
        }
    }
    Ok(hash)
}
