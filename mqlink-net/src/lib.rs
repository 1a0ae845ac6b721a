#![deny(unsafe_code)]

//! Transport layer for a single MQTT client connection.
//!
//! Owns the raw network connection, negotiates TLS when requested and turns
//! the byte stream into framed control packets (and back). The connection is
//! advanced exclusively by an externally driven [`Connection::poll`] call;
//! there is no internal I/O thread, and every operation either completes
//! within the call or leaves a continuation for the next poll.

mod connection;
mod error;
mod settings;
mod sink;
mod transport;

#[cfg(feature = "tls")]
mod tls;
#[cfg(feature = "ws")]
mod ws;

pub use connection::{Connection, ConnectionState};
pub use error::TransportError;
pub use settings::{ConnectionSettings, TransportProtocol};
pub use sink::EventSink;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
