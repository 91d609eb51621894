//! `commlink-dict` – the telemetry/command dictionary capability.
//!
//! The runtime never parses packet definitions itself; it talks to anything
//! implementing [`Dictionary`]:
//!
//! - build and validate commands from `name + params`,
//! - answer hazardous-command queries,
//! - identify inbound telemetry buffers against the known targets,
//! - maintain the current-value table (CVT) and per-target telemetry
//!   counters.
//!
//! [`MemoryDictionary`] is the in-process reference implementation used by
//! the CLI and the test suites. Production deployments put a dictionary
//! service behind the same trait.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use commlink_types::{CommError, ItemValueType, Packet, UNKNOWN};

/// JSON parameter map of a structured command (`cmd_params` decoded).
pub type CmdParams = Map<String, Value>;

/// The dictionary capability. All operations are cheap lookups; the async
/// seam exists so remote dictionary services can satisfy it.
#[async_trait]
pub trait Dictionary: Send + Sync {
    /// Build a command packet with fully resolved field values.
    ///
    /// With `raw` set, parameter values are written as raw counts; otherwise
    /// state names and write conversions apply. With `range_check` set,
    /// resulting raw values must fall inside each item's declared range.
    async fn build_cmd(
        &self,
        target: &str,
        name: &str,
        params: &CmdParams,
        range_check: bool,
        raw: bool,
    ) -> Result<Packet, CommError>;

    /// Whether `cmd` is flagged hazardous, with the optional description.
    async fn cmd_pkt_hazardous(&self, cmd: &Packet) -> Result<(bool, Option<String>), CommError>;

    /// Identify `buffer` against the given targets. A successful match also
    /// refreshes the CVT for the matched packet.
    ///
    /// The returned packet carries the receive count as stored *before* this
    /// reception; the caller performs the increment it publishes.
    async fn identify(&self, buffer: &[u8], targets: &[String]) -> Result<Option<Packet>, CommError>;

    /// Identify and define a packet (stored-telemetry path; no CVT write).
    async fn identify_and_define_packet(
        &self,
        packet: &Packet,
        targets: &[String],
    ) -> Result<Option<Packet>, CommError>;

    /// Update the CVT for a known packet and return the defined packet.
    ///
    /// Fails with [`CommError::UnknownPacket`] when the dictionary does not
    /// know `target`/`packet`; that is the caller's signal to retry
    /// identification.
    async fn update(&self, target: &str, packet: &str, buffer: &[u8]) -> Result<Packet, CommError>;

    /// Telemetry template for `target`/`packet`, used by telemetry injection.
    async fn packet(&self, target: &str, packet: &str) -> Result<Packet, CommError>;

    /// Bump and return the target's telemetry counter; `None` for unknown
    /// targets.
    async fn increment_tlm_count(&self, target: &str) -> Option<u64>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

struct CommandDef {
    template: Packet,
    hazardous: Option<String>,
    build_count: u64,
}

#[derive(Default)]
struct Inner {
    /// target name → telemetry counter
    targets: BTreeMap<String, u64>,
    /// (target, packet) → telemetry template
    telemetry: BTreeMap<(String, String), Packet>,
    /// (target, packet) → latest defined packet
    cvt: BTreeMap<(String, String), Packet>,
    commands: BTreeMap<(String, String), CommandDef>,
}

/// In-process [`Dictionary`] backed by registered packet templates.
///
/// Always knows the `UNKNOWN` target with an item-less `UNKNOWN` packet so
/// unidentified telemetry can be downgraded rather than dropped.
pub struct MemoryDictionary {
    inner: Mutex<Inner>,
}

impl MemoryDictionary {
    pub fn new() -> Self {
        let dict = Self {
            inner: Mutex::new(Inner::default()),
        };
        dict.add_telemetry(Packet::template(UNKNOWN, UNKNOWN, 0, Vec::new()));
        dict
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("dictionary lock poisoned")
    }

    pub fn add_target(&self, name: impl Into<String>) {
        self.lock().targets.entry(name.into()).or_insert(0);
    }

    /// Register a telemetry template. The template's own identification
    /// names the target and packet; the target is created when absent.
    pub fn add_telemetry(&self, template: Packet) {
        let target = template.target_name.clone().expect("template target");
        let packet = template.packet_name.clone().expect("template packet");
        let mut inner = self.lock();
        inner.targets.entry(target.clone()).or_insert(0);
        inner.telemetry.insert((target, packet), template);
    }

    /// Register a command template, optionally flagged hazardous.
    pub fn add_command(&self, template: Packet, hazardous: Option<String>) {
        let target = template.target_name.clone().expect("template target");
        let packet = template.packet_name.clone().expect("template packet");
        let mut inner = self.lock();
        inner.targets.entry(target.clone()).or_insert(0);
        inner.commands.insert(
            (target, packet),
            CommandDef {
                template,
                hazardous,
                build_count: 0,
            },
        );
    }

    /// Latest CVT entry for `target`/`packet` (test and tooling accessor).
    pub fn cvt(&self, target: &str, packet: &str) -> Option<Packet> {
        self.lock()
            .cvt
            .get(&(target.to_string(), packet.to_string()))
            .cloned()
    }

    /// Current telemetry counter for a target.
    pub fn tlm_count(&self, target: &str) -> Option<u64> {
        self.lock().targets.get(target).copied()
    }

    /// Key of the first registered template whose identification items all
    /// match `buffer`, honoring the target priority order given.
    fn find_match(inner: &Inner, buffer: &[u8], targets: &[String]) -> Option<(String, String)> {
        for target in targets {
            for (key, template) in inner.telemetry.range(
                (target.clone(), String::new())..=(target.clone(), "\u{10FFFF}".to_string()),
            ) {
                if template_matches(template, buffer) {
                    return Some(key.clone());
                }
            }
        }
        None
    }

    /// Shared CVT write: bumps the template's persistent receive count,
    /// stores the defined packet as the current value, and returns the
    /// defined packet carrying the pre-reception count.
    fn define_and_store(inner: &mut Inner, key: (String, String), buffer: &[u8]) -> Packet {
        let template = inner
            .telemetry
            .get_mut(&key)
            .expect("define_and_store called with a resolved key");
        let prior = template.received_count;
        template.received_count += 1;

        let mut defined = template.clone();
        defined.buffer = buffer.to_vec();
        defined.received_count = prior;

        let mut current = defined.clone();
        current.received_count = prior + 1;
        inner.cvt.insert(key, current);
        defined
    }
}

impl Default for MemoryDictionary {
    fn default() -> Self {
        Self::new()
    }
}

/// All identification items must be present and match.
fn template_matches(template: &Packet, buffer: &[u8]) -> bool {
    let mut id_items = 0;
    for item in &template.items {
        let Some(expected) = item.id_value else {
            continue;
        };
        id_items += 1;
        let end = item.byte_offset + item.byte_size;
        if end > buffer.len() {
            return false;
        }
        let actual = buffer[item.byte_offset..end]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        if actual != expected {
            return false;
        }
    }
    id_items > 0
}

#[async_trait]
impl Dictionary for MemoryDictionary {
    async fn build_cmd(
        &self,
        target: &str,
        name: &str,
        params: &CmdParams,
        range_check: bool,
        raw: bool,
    ) -> Result<Packet, CommError> {
        let mut inner = self.lock();
        let def = inner
            .commands
            .get_mut(&(target.to_string(), name.to_string()))
            .ok_or_else(|| CommError::UnknownCommand {
                target: target.to_string(),
                packet: name.to_string(),
            })?;

        let mut cmd = def.template.clone();
        let value_type = if raw {
            ItemValueType::Raw
        } else {
            ItemValueType::Converted
        };
        for (item_name, value) in params {
            cmd.write_item(item_name, value, value_type)?;
            if range_check {
                let item = cmd.item(item_name)?.clone();
                if let Some((min, max)) = item.range {
                    let written = cmd.read_raw(item_name)?;
                    if written < min || written > max {
                        return Err(CommError::OutOfRange {
                            item: item.name,
                            value: written,
                            min,
                            max,
                        });
                    }
                }
            }
        }

        def.build_count += 1;
        cmd.received_count = def.build_count;
        cmd.received_time = Some(Utc::now());
        Ok(cmd)
    }

    async fn cmd_pkt_hazardous(&self, cmd: &Packet) -> Result<(bool, Option<String>), CommError> {
        let target = cmd.target_name.as_deref().unwrap_or(UNKNOWN);
        let packet = cmd.packet_name.as_deref().unwrap_or(UNKNOWN);
        let inner = self.lock();
        let def = inner
            .commands
            .get(&(target.to_string(), packet.to_string()))
            .ok_or_else(|| CommError::UnknownCommand {
                target: target.to_string(),
                packet: packet.to_string(),
            })?;
        Ok((def.hazardous.is_some(), def.hazardous.clone()))
    }

    async fn identify(&self, buffer: &[u8], targets: &[String]) -> Result<Option<Packet>, CommError> {
        let mut inner = self.lock();
        let Some(key) = Self::find_match(&inner, buffer, targets) else {
            return Ok(None);
        };
        Ok(Some(Self::define_and_store(&mut inner, key, buffer)))
    }

    async fn identify_and_define_packet(
        &self,
        packet: &Packet,
        targets: &[String],
    ) -> Result<Option<Packet>, CommError> {
        let inner = self.lock();
        let key = if let (Some(target), Some(name)) = (&packet.target_name, &packet.packet_name) {
            if !inner.telemetry.contains_key(&(target.clone(), name.clone())) {
                return Ok(None);
            }
            (target.clone(), name.clone())
        } else {
            match Self::find_match(&inner, &packet.buffer, targets) {
                Some(key) => key,
                None => return Ok(None),
            }
        };
        // No CVT write and no count bump on this path (stored telemetry).
        let mut defined = inner.telemetry[&key].clone();
        defined.buffer = packet.buffer.clone();
        Ok(Some(defined))
    }

    async fn update(&self, target: &str, packet: &str, buffer: &[u8]) -> Result<Packet, CommError> {
        let key = (target.to_string(), packet.to_string());
        let mut inner = self.lock();
        if !inner.telemetry.contains_key(&key) {
            return Err(CommError::UnknownPacket {
                target: target.to_string(),
                packet: packet.to_string(),
            });
        }
        Ok(Self::define_and_store(&mut inner, key, buffer))
    }

    async fn packet(&self, target: &str, packet: &str) -> Result<Packet, CommError> {
        self.lock()
            .telemetry
            .get(&(target.to_string(), packet.to_string()))
            .cloned()
            .ok_or_else(|| CommError::UnknownPacket {
                target: target.to_string(),
                packet: packet.to_string(),
            })
    }

    async fn increment_tlm_count(&self, target: &str) -> Option<u64> {
        let mut inner = self.lock();
        let count = inner.targets.get_mut(target)?;
        *count += 1;
        Some(*count)
    }
}
