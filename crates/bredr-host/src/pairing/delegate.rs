//! User-facing pairing authorization surface
//!
//! The delegate is installed by the embedder and consulted for every
//! user-interactive step of pairing. Without a delegate, interactive
//! pairing requests are rejected (but the link is not torn down for it).

use crate::gap::types::PeerId;

/// How a passkey handed to `display_passkey` should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMethod {
    /// Show the value with a yes/no choice; the peer shows the same value.
    Comparison,
    /// Show the value for the user to type on the peer.
    PeerEntry,
}

/// Decisions are returned synchronously; the caller turns them into the
/// positive or negative HCI reply.
pub trait PairingDelegate {
    /// Ask the user to consent to pairing with `peer_id`.
    fn confirm_pairing(&mut self, peer_id: PeerId) -> bool;

    /// Ask the user whether `passkey` matches the value shown by the peer.
    fn confirm_passkey(&mut self, peer_id: PeerId, passkey: u32) -> bool;

    /// Show `passkey` to the user. No decision is required.
    fn display_passkey(&mut self, peer_id: PeerId, passkey: u32, method: DisplayMethod);

    /// Ask the user for the passkey shown by the peer. `None` rejects.
    fn request_passkey(&mut self, peer_id: PeerId) -> Option<u32>;
}
