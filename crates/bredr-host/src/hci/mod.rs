//! Bluetooth HCI (Host Controller Interface) command and event surface
//!
//! This module models the BR/EDR commands the core sends and the events it
//! consumes, bit-exact and little-endian.

pub mod constants;
pub mod events;
pub mod packet;
pub mod transport;


pub use events::{Event, HciEvent};
pub use packet::{CodingFormat, HciCommand, SynchronousConnectionParameters};
pub use transport::HciTransport;

/// A 16-bit ACL/SCO connection handle.
pub type ConnectionHandle = u16;
