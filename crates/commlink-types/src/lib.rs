//! `commlink-types` – shared data model for the commlink interface
//! microservice.
//!
//! Everything that crosses a seam between the runtime, the dictionary, the
//! link drivers, and the message store lives here:
//!
//! - [`Packet`] / [`PacketItem`] – framed binary units with typed item
//!   accessors (raw, converted, formatted, with-units).
//! - [`InterfaceInfo`] / [`SharedInterface`] – the interface descriptor and
//!   its shared handle.
//! - [`FieldValue`] / [`MsgMap`] – the opaque field map carried on store
//!   topics.
//! - [`CommError`] / [`LinkError`] – the error types spanning all of the
//!   above.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod interface;
pub mod message;
pub mod packet;

pub use interface::{InterfaceInfo, InterfaceState, SharedInterface};
pub use message::{FieldValue, MsgMap};
pub use packet::{ItemValue, ItemValueType, LinearConversion, Packet, PacketItem};

/// Target/packet name adopted for telemetry that no dictionary entry matches.
pub const UNKNOWN: &str = "UNKNOWN";

/// Error raised by a link driver. The supervisor classifies these into
/// transient transport failures, shutdown interrupts, and everything else.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Link is not connected")]
    NotConnected,

    #[error("Interrupted by shutdown signal")]
    Interrupted,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Global error type spanning packet access, dictionary lookups, link
/// failures, and store publication.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("Unknown item: {0}")]
    UnknownItem(String),

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// The dictionary's not-found signal for telemetry updates.
    #[error("Packet not found: {target} {packet}")]
    UnknownPacket { target: String, packet: String },

    #[error("Unknown command: {target} {packet}")]
    UnknownCommand { target: String, packet: String },

    #[error("Value for {item} out of range: {value} not in {min}..={max}")]
    OutOfRange {
        item: String,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Unknown state '{state}' for {item}")]
    UnknownState { item: String, state: String },

    #[error("Invalid value for {item}: {reason}")]
    BadValue { item: String, reason: String },

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Store error: {0}")]
    Store(String),
}

/// Coerce a textual boolean the way lifecycle and command messages carry
/// them. Accepts `true`/`false`, `yes`/`no`, `1`/`0` case-insensitively;
/// anything else (including absent/empty) is `false`.
pub fn bool_from_text(text: Option<&str>) -> bool {
    match text {
        Some(t) => matches!(t.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        None => false,
    }
}

/// Nanoseconds since the Unix epoch for `t`, the on-the-wire time format.
pub fn epoch_nanos(t: DateTime<Utc>) -> i64 {
    // Saturates for dates outside the i64-nanosecond range (~year 2262).
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Nanoseconds since the Unix epoch for the current wall clock.
pub fn now_nanos() -> i64 {
    epoch_nanos(Utc::now())
}
