//! `commlink-runtime` – the interface microservice core.
//!
//! One instance of [`InterfaceMicroservice`] supervises one bidirectional
//! interface and bridges it to the streaming message store:
//!
//! - [`Supervisor`] – connection state machine, inbound read loop, failure
//!   classification, and the lifecycle operations that race with it.
//! - [`CmdWorker`] – consumes routed command/lifecycle messages, builds and
//!   writes commands, and fans confirmations back out to the store.
//! - [`PacketHandler`] – identifies inbound packets, maintains the
//!   current-value table through the dictionary, and publishes telemetry.
//!
//! Exactly two worker tasks run per instance (the supervisor loop and the
//! command loop); a shutdown caller is the third context and goes through
//! [`Supervisor::stop`].

pub mod cmd_worker;
pub mod exceptions;
pub mod microservice;
pub mod packet_handler;
pub mod sleeper;
pub mod supervisor;

pub use cmd_worker::CmdWorker;
pub use microservice::{InterfaceMicroservice, InterfaceOptions};
pub use packet_handler::PacketHandler;
pub use sleeper::Sleeper;
pub use supervisor::Supervisor;

#[cfg(test)]
pub(crate) mod testutil;
