//! `commlink-link` – bidirectional framed packet transports.
//!
//! The supervisor never speaks a concrete wire protocol. It drives anything
//! implementing [`Link`]: explicit connect/disconnect, framed reads that
//! distinguish clean closes (`Ok(None)`) from transport failures (`Err`),
//! and framed writes. Reconnect policy, read permission, and target lists
//! are properties of the interface descriptor, not of the driver.
//!
//! [`TcpLink`] is the built-in driver: length-prefixed frames over a TCP
//! stream.

use async_trait::async_trait;

use commlink_types::{LinkError, Packet};

pub mod tcp;

pub use tcp::TcpLink;

/// A bidirectional framed packet transport.
///
/// Methods take `&self`; implementations carry their own interior state so
/// reads and writes can proceed concurrently. All blocking calls may fail,
/// and the supervisor classifies those failures.
#[async_trait]
pub trait Link: Send + Sync {
    /// Establish the connection. Fails when the remote end is unreachable.
    async fn connect(&self) -> Result<(), LinkError>;

    /// Tear the connection down. Safe to call when already disconnected.
    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Whether the transport currently considers itself connected.
    async fn connected(&self) -> bool;

    /// Read the next framed packet.
    ///
    /// `Ok(None)` is a clean disconnect (the peer closed the stream);
    /// `Err` is an unclean one.
    async fn read(&self) -> Result<Option<Packet>, LinkError>;

    /// Write one framed payload (a raw buffer or a built command's bytes).
    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError>;
}
