//! Opaque field maps carried on store topics.
//!
//! Topic messages are flat `name → value` maps. The store routes them
//! without caring about their meaning; producers and consumers agree on the
//! field names per topic family (`TELEMETRY`, `COMMAND`, `DECOMCMD`,
//! `CMDINTERFACE`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single field of a topic message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

/// An ordered field map, the message unit of every store topic.
pub type MsgMap = BTreeMap<String, FieldValue>;

/// Fetch a text field, treating missing and non-text values as absent.
pub fn msg_text<'a>(msg: &'a MsgMap, key: &str) -> Option<&'a str> {
    msg.get(key).and_then(FieldValue::as_text)
}
