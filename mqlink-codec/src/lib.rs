#![deny(unsafe_code)]

//! MQTT control packet framing
//!
//! Reassembles complete MQTT control packets from an arbitrarily chunked byte
//! stream. Packets are treated as opaque: the codec decodes the fixed header
//! (type/flags byte plus the base-128 remaining-length field), waits until the
//! whole packet is buffered and hands it upward as raw bytes. Interpreting the
//! payload is the job of the layer above.
//!
//! The decoder is resumable: `Ok(None)` means "feed me more bytes", and no
//! byte is consumed from the input buffer before the frame it belongs to is
//! complete.

#[macro_use]
mod utils;

/// Error types for framing operations
pub mod error;

/// Fixed header representation and protocol constants
pub mod types;

mod frame;

pub use frame::FrameCodec;
pub use utils::{decode_variable_length, encode_variable_length, encoded_variable_length_size};
