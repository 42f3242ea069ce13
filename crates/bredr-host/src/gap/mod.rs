//! BR/EDR GAP layer: peers, interrogation, and the connection manager

pub mod connection;
pub mod connection_manager;
pub mod interrogator;
pub mod peer_cache;
pub mod types;


pub use connection::Connection;
pub use connection_manager::{
    AclDataChannel, BrEdrConnectionManager, BrEdrConnectionManagerConfig, DisconnectReason,
    SearchId,
};
pub use interrogator::Interrogator;
pub use peer_cache::PeerCache;
pub use types::{BdAddr, ConnectionRole, PeerId, PeerRecord, TechnologyType};
