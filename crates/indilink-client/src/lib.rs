//! indilink client - one INDI server connection over tokio
//!
//! [`Client`] owns the socket, the inbound parser and the device registry.
//! It performs the protocol handshake on connect, turns read readiness into
//! registry updates, and writes outbound commands.

pub mod client;
pub mod connection;

pub use client::{Client, ClientConfig, ReadStatus};
pub use connection::{ConnectionError, ReadOutcome, Session, READ_CHUNK};
