//! bredr-host - BR/EDR (classic Bluetooth) connection and pairing core
//!
//! This library implements the connection-management heart of a classic
//! Bluetooth host stack: accepting and creating ACL links, interrogating
//! newly connected peers, running the Secure Simple Pairing and Legacy
//! Pairing state machines, arbitrating synchronous (SCO/eSCO) audio
//! connections, and multiplexing user requests against one controller.
//!
//! The HCI transport, L2CAP channel runtime, SDP client, LE Security
//! Manager, and pairing UI are external collaborators reached through the
//! traits in [`hci`], [`l2cap`], [`sdp`], and [`pairing`].

pub mod error;
pub mod gap;
pub mod hci;
pub mod l2cap;
pub mod pairing;
pub mod sco;
pub mod sdp;

// Re-export common types for convenience
pub use error::{Error, HciStatus, Result};
pub use gap::{BdAddr, BrEdrConnectionManager, BrEdrConnectionManagerConfig, PeerId};
pub use hci::{Event, HciCommand, HciEvent, HciTransport};
pub use l2cap::{ChannelConfiguration, ChannelParameters, Psm};
pub use pairing::{
    IoCapability, PairingDelegate, SecurityMode, SecurityProperties, SecurityRequirements,
};
pub use sco::{ScoConnection, ScoConnectionManager};
