//! Inbound packet identification and telemetry publication.
//!
//! Every packet returned by the link flows through [`PacketHandler::handle`]
//! exactly once and leaves on exactly one `TELEMETRY__<target>__<packet>`
//! topic, downgraded to `UNKNOWN`/`UNKNOWN` when no dictionary entry
//! matches.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, warn};

use commlink_dict::Dictionary;
use commlink_store::{topics, Store};
use commlink_types::{epoch_nanos, CommError, MsgMap, Packet, SharedInterface, UNKNOWN};

pub struct PacketHandler {
    interface: SharedInterface,
    dictionary: Arc<dyn Dictionary>,
    store: Arc<dyn Store>,
    scope: String,
}

impl PacketHandler {
    pub fn new(
        interface: SharedInterface,
        dictionary: Arc<dyn Dictionary>,
        store: Arc<dyn Store>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            interface,
            dictionary,
            store,
            scope: scope.into(),
        }
    }

    /// Identify, decorate, and publish one inbound packet.
    ///
    /// Dictionary failures other than the not-found signal propagate upward
    /// and are fatal to the read loop.
    pub async fn handle(&self, mut packet: Packet) -> Result<(), CommError> {
        self.store
            .set_interface(&self.interface.snapshot(), &self.scope, false)
            .await?;

        if packet.received_time.is_none() {
            packet.received_time = Some(Utc::now());
        }

        let targets = self.interface.target_names();
        let identified = if packet.stored {
            // Historical replay: identified and defined, but never written
            // into the current-value table.
            self.dictionary
                .identify_and_define_packet(&packet, &targets)
                .await?
        } else if packet.identified() {
            let target = packet.target_name.clone().unwrap_or_default();
            let name = packet.packet_name.clone().unwrap_or_default();
            match self.dictionary.update(&target, &name, &packet.buffer).await {
                Ok(defined) => Some(defined),
                Err(CommError::UnknownPacket { .. }) => {
                    warn!(
                        interface = %self.interface.name(),
                        target = %target,
                        packet = %name,
                        "preidentified packet not in dictionary, re-identifying"
                    );
                    packet.clear_identification();
                    self.dictionary.identify(&packet.buffer, &targets).await?
                }
                Err(e) => return Err(e),
            }
        } else {
            self.dictionary.identify(&packet.buffer, &targets).await?
        };

        let mut adopted = match identified {
            Some(found) => found,
            None => {
                let preview_len = packet.buffer.len().min(16);
                let prefix: String = packet.buffer[..preview_len]
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect();
                error!(
                    interface = %self.interface.name(),
                    length = packet.buffer.len(),
                    prefix = %prefix,
                    "unknown packet"
                );
                if packet.stored {
                    // Stored packets bypass the CVT even when unknown.
                    let mut unknown = self.dictionary.packet(UNKNOWN, UNKNOWN).await?;
                    unknown.buffer = packet.buffer.clone();
                    unknown
                } else {
                    self.dictionary.update(UNKNOWN, UNKNOWN, &packet.buffer).await?
                }
            }
        };

        adopted.received_time = packet.received_time;
        adopted.stored = packet.stored;
        adopted.extra = packet.extra.clone();

        if let Some(target) = adopted.target_name.clone() {
            self.dictionary.increment_tlm_count(&target).await;
        }
        adopted.received_count += 1;

        self.publish(&adopted).await
    }

    async fn publish(&self, packet: &Packet) -> Result<(), CommError> {
        let target = packet.target_name.as_deref().unwrap_or(UNKNOWN);
        let name = packet.packet_name.as_deref().unwrap_or(UNKNOWN);
        let time = packet
            .received_time
            .map(epoch_nanos)
            .unwrap_or_else(commlink_types::now_nanos);

        let mut msg = MsgMap::new();
        msg.insert("time".to_string(), time.into());
        msg.insert("stored".to_string(), packet.stored.into());
        msg.insert("target_name".to_string(), target.into());
        msg.insert("packet_name".to_string(), name.into());
        msg.insert("received_count".to_string(), packet.received_count.into());
        msg.insert("buffer".to_string(), packet.buffer.clone().into());

        self.store
            .write_topic(&topics::telemetry(&self.scope, target, name), msg)
            .await
    }
}
