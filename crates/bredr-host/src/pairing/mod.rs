//! BR/EDR pairing: Secure Simple Pairing and Legacy Pairing
//!
//! One `PairingStateMachine` exists per live ACL link. It owns the link's
//! security properties and a queue of pairing requests, drives the HCI
//! authentication/encryption sequence, and consults the `PairingDelegate`
//! for user decisions.

pub mod actions;
pub mod delegate;
pub mod state;
pub mod types;

pub use actions::PairingAction;
pub use delegate::{DisplayMethod, PairingDelegate};
pub use state::{Actions, PairingContext, PairingSignal, PairingState, PairingStateMachine};
pub use types::{
    AuthenticationRequirements, EncryptionStatus, IoCapability, LinkKey, LinkKeyType,
    SecurityMode, SecurityProperties, SecurityRequirements,
};

use crate::gap::types::PeerId;

/// Cross-transport key derivation boundary. Implemented by the LE Security
/// Manager; completion is reported back through
/// `PairingStateMachine::on_cross_transport_key_derivation_complete`.
pub trait SecurityManager {
    /// Derive LE keys from the BR/EDR link key for `peer_id`.
    fn start_cross_transport_key_derivation(&mut self, peer_id: PeerId);
}
