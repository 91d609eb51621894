//! Packets and their item schema.
//!
//! A [`Packet`] is a framed unit of binary data: telemetry when inbound,
//! a command when outbound. Identification (`target_name` / `packet_name`)
//! is optional until a dictionary claims the packet. The item schema is an
//! ordered list of [`PacketItem`] definitions over the buffer, and every
//! item can be read at four value levels:
//!
//! | [`ItemValueType`] | Meaning |
//! |---|---|
//! | `RAW` | Big-endian unsigned integer straight from the buffer |
//! | `CONVERTED` | State name or engineering-unit conversion applied |
//! | `FORMATTED` | Format string applied (falls back to converted) |
//! | `WITH_UNITS` | Formatted value with the units label appended |

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CommError;

// ─────────────────────────────────────────────────────────────────────────────
// Value levels
// ─────────────────────────────────────────────────────────────────────────────

/// The four read levels of a packet item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemValueType {
    Raw,
    Converted,
    Formatted,
    WithUnits,
}

impl ItemValueType {
    /// Parse the textual form carried in lifecycle messages
    /// (`"RAW"`, `"CONVERTED"`, `"FORMATTED"`, `"WITH_UNITS"`).
    pub fn from_text(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "RAW" => Some(Self::Raw),
            "CONVERTED" => Some(Self::Converted),
            "FORMATTED" => Some(Self::Formatted),
            "WITH_UNITS" => Some(Self::WithUnits),
            _ => None,
        }
    }
}

/// A value read from a packet item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemValue {
    Uint(u64),
    Float(f64),
    Text(String),
}

impl ItemValue {
    /// JSON representation used when building `json_data` payloads.
    pub fn to_json(&self) -> Value {
        match self {
            ItemValue::Uint(v) => Value::from(*v),
            ItemValue::Float(v) => Value::from(*v),
            ItemValue::Text(v) => Value::from(v.clone()),
        }
    }
}

impl fmt::Display for ItemValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemValue::Uint(v) => write!(f, "{v}"),
            ItemValue::Float(v) => write!(f, "{v}"),
            ItemValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Linear engineering-unit conversion (`eng = raw * scale + offset`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearConversion {
    pub scale: f64,
    pub offset: f64,
}

impl LinearConversion {
    pub fn apply(&self, raw: u64) -> f64 {
        raw as f64 * self.scale + self.offset
    }

    /// Invert the conversion for item writes. Rounds to the nearest raw count.
    pub fn invert(&self, eng: f64) -> u64 {
        ((eng - self.offset) / self.scale).round().max(0.0) as u64
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Item schema
// ─────────────────────────────────────────────────────────────────────────────

/// One entry of a packet's ordered item schema. Items are byte-aligned
/// big-endian unsigned fields of 1, 2, 4, or 8 bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketItem {
    pub name: String,
    pub byte_offset: usize,
    pub byte_size: usize,
    /// Expected raw value when this item participates in identification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_value: Option<u64>,
    /// State name → raw value mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_conversion: Option<LinearConversion>,
    /// printf-style format applied at the `FORMATTED` level, e.g. `"0x%X"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Inclusive raw-value range enforced on command builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(u64, u64)>,
}

impl PacketItem {
    pub fn new(name: impl Into<String>, byte_offset: usize, byte_size: usize) -> Self {
        Self {
            name: name.into(),
            byte_offset,
            byte_size,
            id_value: None,
            states: None,
            write_conversion: None,
            format_string: None,
            units: None,
            range: None,
        }
    }

    pub fn with_id_value(mut self, value: u64) -> Self {
        self.id_value = Some(value);
        self
    }

    pub fn with_states(mut self, states: BTreeMap<String, u64>) -> Self {
        self.states = Some(states);
        self
    }

    pub fn with_conversion(mut self, scale: f64, offset: f64) -> Self {
        self.write_conversion = Some(LinearConversion { scale, offset });
        self
    }

    pub fn with_format(mut self, format_string: impl Into<String>) -> Self {
        self.format_string = Some(format_string.into());
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_range(mut self, min: u64, max: u64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Reverse state lookup: the name mapped to `raw`, if any.
    fn state_name(&self, raw: u64) -> Option<&str> {
        self.states
            .as_ref()
            .and_then(|s| s.iter().find(|(_, v)| **v == raw))
            .map(|(k, _)| k.as_str())
    }

    /// Forward state lookup for item writes.
    fn state_value(&self, name: &str) -> Option<u64> {
        self.states.as_ref().and_then(|s| s.get(name)).copied()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet
// ─────────────────────────────────────────────────────────────────────────────

/// A time-stamped byte buffer with optional identification and an ordered
/// item schema. Commands are packets whose schema came from the command
/// dictionary with all field values resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub received_count: u64,
    /// Historical replay marker: stored packets bypass current-value updates.
    #[serde(default)]
    pub stored: bool,
    /// Opaque metadata propagated with the packet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(with = "serde_bytes_vec")]
    pub buffer: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<PacketItem>,
}

// Plain Vec<u8> serde passthrough kept as a named module so the buffer field
// reads as intentionally binary.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        v.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

impl Packet {
    /// An unidentified packet around a raw buffer, as produced by a link read.
    pub fn from_buffer(buffer: Vec<u8>) -> Self {
        Self {
            target_name: None,
            packet_name: None,
            received_time: None,
            received_count: 0,
            stored: false,
            extra: None,
            buffer,
            items: Vec::new(),
        }
    }

    /// An identified template with a zeroed buffer, as held by a dictionary.
    pub fn template(
        target_name: impl Into<String>,
        packet_name: impl Into<String>,
        buffer_len: usize,
        items: Vec<PacketItem>,
    ) -> Self {
        Self {
            target_name: Some(target_name.into()),
            packet_name: Some(packet_name.into()),
            received_time: None,
            received_count: 0,
            stored: false,
            extra: None,
            buffer: vec![0; buffer_len],
            items,
        }
    }

    pub fn identified(&self) -> bool {
        self.target_name.is_some() && self.packet_name.is_some()
    }

    pub fn clear_identification(&mut self) {
        self.target_name = None;
        self.packet_name = None;
    }

    /// Look up an item by name.
    pub fn item(&self, name: &str) -> Result<&PacketItem, CommError> {
        self.items
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| CommError::UnknownItem(name.to_string()))
    }

    fn field_bytes(&self, item: &PacketItem) -> Result<&[u8], CommError> {
        let end = item.byte_offset + item.byte_size;
        if end > self.buffer.len() {
            return Err(CommError::BadValue {
                item: item.name.clone(),
                reason: format!(
                    "item extends to byte {end} but buffer is {} bytes",
                    self.buffer.len()
                ),
            });
        }
        Ok(&self.buffer[item.byte_offset..end])
    }

    /// Raw big-endian unsigned read of a single item.
    pub fn read_raw(&self, name: &str) -> Result<u64, CommError> {
        let item = self.item(name)?.clone();
        let bytes = self.field_bytes(&item)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Raw big-endian unsigned write of a single item.
    pub fn write_raw(&mut self, name: &str, value: u64) -> Result<(), CommError> {
        let item = self.item(name)?.clone();
        // Bounds check via the read path before mutating.
        self.field_bytes(&item)?;
        let end = item.byte_offset + item.byte_size;
        for (i, slot) in self.buffer[item.byte_offset..end].iter_mut().enumerate() {
            let shift = 8 * (item.byte_size - 1 - i);
            *slot = ((value >> shift) & 0xFF) as u8;
        }
        Ok(())
    }

    /// Read an item at the requested value level.
    pub fn read_item(&self, name: &str, value_type: ItemValueType) -> Result<ItemValue, CommError> {
        let raw = self.read_raw(name)?;
        let item = self.item(name)?;
        Ok(match value_type {
            ItemValueType::Raw => ItemValue::Uint(raw),
            ItemValueType::Converted => converted_value(item, raw),
            ItemValueType::Formatted => ItemValue::Text(formatted_value(item, raw)),
            ItemValueType::WithUnits => {
                let formatted = formatted_value(item, raw);
                match &item.units {
                    Some(units) => ItemValue::Text(format!("{formatted} {units}")),
                    None => ItemValue::Text(formatted),
                }
            }
        })
    }

    /// Write an item from a JSON value at the given level. Only `RAW` and
    /// `CONVERTED` writes are meaningful; the display levels are rejected.
    pub fn write_item(
        &mut self,
        name: &str,
        value: &Value,
        value_type: ItemValueType,
    ) -> Result<(), CommError> {
        let item = self.item(name)?.clone();
        let raw = match value_type {
            ItemValueType::Raw => json_to_raw(&item, value)?,
            ItemValueType::Converted => match value.as_str() {
                Some(state) => item.state_value(state).ok_or_else(|| CommError::UnknownState {
                    item: item.name.clone(),
                    state: state.to_string(),
                })?,
                None => match item.write_conversion {
                    Some(conv) => {
                        let eng = value.as_f64().ok_or_else(|| CommError::BadValue {
                            item: item.name.clone(),
                            reason: format!("expected a number, got {value}"),
                        })?;
                        conv.invert(eng)
                    }
                    None => json_to_raw(&item, value)?,
                },
            },
            ItemValueType::Formatted | ItemValueType::WithUnits => {
                return Err(CommError::BadValue {
                    item: item.name.clone(),
                    reason: "display value types cannot be written".to_string(),
                })
            }
        };
        self.write_raw(name, raw)
    }
}

fn json_to_raw(item: &PacketItem, value: &Value) -> Result<u64, CommError> {
    if let Some(v) = value.as_u64() {
        return Ok(v);
    }
    if let Some(v) = value.as_f64() {
        if v >= 0.0 {
            return Ok(v.round() as u64);
        }
    }
    Err(CommError::BadValue {
        item: item.name.clone(),
        reason: format!("expected an unsigned number, got {value}"),
    })
}

fn converted_value(item: &PacketItem, raw: u64) -> ItemValue {
    if let Some(state) = item.state_name(raw) {
        return ItemValue::Text(state.to_string());
    }
    if let Some(conv) = item.write_conversion {
        return ItemValue::Float(conv.apply(raw));
    }
    ItemValue::Uint(raw)
}

fn formatted_value(item: &PacketItem, raw: u64) -> String {
    match &item.format_string {
        Some(fmt) => format_raw(fmt, raw),
        None => converted_value(item, raw).to_string(),
    }
}

/// Minimal printf-style formatter over a raw unsigned value. Supports the
/// conversions the dictionaries actually use: `%d`, `%u`, `%x`, `%X`, `%o`,
/// `%s`, `%f`, each with an optional zero-padded width (e.g. `%08X`).
fn format_raw(fmt: &str, raw: u64) -> String {
    let mut out = String::with_capacity(fmt.len() + 8);
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
                continue;
            }
            None => {
                out.push('%');
                break;
            }
            _ => {}
        }
        let mut zero_pad = false;
        let mut width = 0usize;
        while let Some(&d) = chars.peek() {
            if d == '0' && width == 0 {
                zero_pad = true;
                chars.next();
            } else if d.is_ascii_digit() {
                width = width * 10 + d.to_digit(10).unwrap() as usize;
                chars.next();
            } else {
                break;
            }
        }
        let rendered = match chars.next() {
            Some('d') | Some('u') | Some('s') => format!("{raw}"),
            Some('x') => format!("{raw:x}"),
            Some('X') => format!("{raw:X}"),
            Some('o') => format!("{raw:o}"),
            Some('f') => format!("{:.6}", raw as f64),
            Some(other) => format!("%{other}"),
            None => "%".to_string(),
        };
        if rendered.len() < width {
            let pad = if zero_pad { '0' } else { ' ' };
            for _ in 0..(width - rendered.len()) {
                out.push(pad);
            }
        }
        out.push_str(&rendered);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_packet() -> Packet {
        let mut states = BTreeMap::new();
        states.insert("OFF".to_string(), 0);
        states.insert("ON".to_string(), 1);
        Packet::template(
            "INST",
            "HEALTH",
            8,
            vec![
                PacketItem::new("VERSION", 0, 1).with_id_value(3),
                PacketItem::new("MODE", 1, 1).with_states(states),
                PacketItem::new("PKTID", 2, 2).with_format("0x%X"),
                PacketItem::new("TEMP", 4, 2)
                    .with_conversion(0.5, -10.0)
                    .with_units("C"),
            ],
        )
    }

    #[test]
    fn raw_roundtrip_big_endian() {
        let mut pkt = sample_packet();
        pkt.write_raw("PKTID", 0xABCD).unwrap();
        assert_eq!(pkt.buffer[2], 0xAB);
        assert_eq!(pkt.buffer[3], 0xCD);
        assert_eq!(pkt.read_raw("PKTID").unwrap(), 0xABCD);
    }

    #[test]
    fn converted_uses_state_names() {
        let mut pkt = sample_packet();
        pkt.write_raw("MODE", 1).unwrap();
        assert_eq!(
            pkt.read_item("MODE", ItemValueType::Converted).unwrap(),
            ItemValue::Text("ON".to_string())
        );
    }

    #[test]
    fn converted_applies_linear_conversion() {
        let mut pkt = sample_packet();
        pkt.write_raw("TEMP", 100).unwrap();
        assert_eq!(
            pkt.read_item("TEMP", ItemValueType::Converted).unwrap(),
            ItemValue::Float(40.0)
        );
    }

    #[test]
    fn formatted_applies_format_string() {
        let mut pkt = sample_packet();
        pkt.write_raw("PKTID", 0x1A).unwrap();
        assert_eq!(
            pkt.read_item("PKTID", ItemValueType::Formatted).unwrap(),
            ItemValue::Text("0x1A".to_string())
        );
    }

    #[test]
    fn with_units_appends_units_label() {
        let mut pkt = sample_packet();
        pkt.write_raw("TEMP", 20).unwrap();
        assert_eq!(
            pkt.read_item("TEMP", ItemValueType::WithUnits).unwrap(),
            ItemValue::Text("0 C".to_string())
        );
    }

    #[test]
    fn write_converted_maps_state_name() {
        let mut pkt = sample_packet();
        pkt.write_item("MODE", &Value::from("ON"), ItemValueType::Converted)
            .unwrap();
        assert_eq!(pkt.read_raw("MODE").unwrap(), 1);
    }

    #[test]
    fn write_converted_inverts_conversion() {
        let mut pkt = sample_packet();
        pkt.write_item("TEMP", &Value::from(40.0), ItemValueType::Converted)
            .unwrap();
        assert_eq!(pkt.read_raw("TEMP").unwrap(), 100);
    }

    #[test]
    fn write_unknown_state_is_rejected() {
        let mut pkt = sample_packet();
        let err = pkt
            .write_item("MODE", &Value::from("MAYBE"), ItemValueType::Converted)
            .unwrap_err();
        assert!(matches!(err, CommError::UnknownState { .. }));
    }

    #[test]
    fn unknown_item_is_rejected() {
        let pkt = sample_packet();
        assert!(matches!(
            pkt.read_raw("GHOST"),
            Err(CommError::UnknownItem(_))
        ));
    }

    #[test]
    fn out_of_bounds_item_is_rejected() {
        let mut pkt = sample_packet();
        pkt.items.push(PacketItem::new("PAST_END", 7, 4));
        assert!(matches!(
            pkt.read_raw("PAST_END"),
            Err(CommError::BadValue { .. })
        ));
    }

    #[test]
    fn value_type_parses_wire_forms() {
        assert_eq!(ItemValueType::from_text("RAW"), Some(ItemValueType::Raw));
        assert_eq!(
            ItemValueType::from_text("with_units"),
            Some(ItemValueType::WithUnits)
        );
        assert_eq!(ItemValueType::from_text("BOGUS"), None);
    }

    #[test]
    fn format_raw_pads_and_escapes() {
        assert_eq!(format_raw("%04X", 0xAB), "00AB");
        assert_eq!(format_raw("100%%", 0), "100%");
        assert_eq!(format_raw("count=%d", 42), "count=42");
    }

    #[test]
    fn packet_json_roundtrip() {
        let mut pkt = sample_packet();
        pkt.write_raw("PKTID", 7).unwrap();
        pkt.received_time = Some(Utc::now());
        let json = serde_json::to_string(&pkt).unwrap();
        let back: Packet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target_name.as_deref(), Some("INST"));
        assert_eq!(back.read_raw("PKTID").unwrap(), 7);
    }
}
