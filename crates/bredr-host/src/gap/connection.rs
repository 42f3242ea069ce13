//! Per-handle ACL connection record
//!
//! Owns the link-scoped state machines by value. Destroying the record
//! (on Disconnection Complete) releases everything that belongs to the
//! link.

use crate::error::{Error, Result};
use crate::gap::interrogator::Interrogator;
use crate::gap::types::{BdAddr, ConnectionRole, PeerId};
use crate::hci::ConnectionHandle;
use crate::l2cap::L2capChannel;
use crate::pairing::types::EncryptionStatus;
use crate::pairing::PairingStateMachine;
use crate::sco::ScoConnectionManager;

/// Callback completing one `connect` call.
pub type ConnectCallback = Box<dyn FnOnce(Result<ConnectionHandle>)>;

pub struct Connection {
    pub handle: ConnectionHandle,
    pub peer_id: PeerId,
    pub address: BdAddr,
    pub role: ConnectionRole,
    pub encryption_status: EncryptionStatus,
    pub interrogator: Interrogator,
    pub pairing: PairingStateMachine,
    pub sco: Option<ScoConnectionManager>,
    pub channels: Vec<L2capChannel>,
    /// Connect callbacks waiting for interrogation to finish.
    pub pending_connect_callbacks: Vec<ConnectCallback>,
}

impl Connection {
    pub fn new(
        handle: ConnectionHandle,
        peer_id: PeerId,
        address: BdAddr,
        role: ConnectionRole,
        pairing: PairingStateMachine,
    ) -> Self {
        Self {
            handle,
            peer_id,
            address,
            role,
            encryption_status: EncryptionStatus::default(),
            interrogator: Interrogator::new(peer_id, handle, address),
            pairing,
            sco: None,
            channels: Vec::new(),
            pending_connect_callbacks: Vec::new(),
        }
    }

    /// The SCO manager is created on first use and lives as long as the
    /// ACL link.
    pub fn sco_manager(&mut self) -> &mut ScoConnectionManager {
        let (peer_id, handle, address) = (self.peer_id, self.handle, self.address);
        self.sco
            .get_or_insert_with(|| ScoConnectionManager::new(peer_id, handle, address))
    }

    /// Release link-scoped resources; callbacks still waiting are failed.
    pub fn teardown(&mut self) {
        self.interrogator.cancel();
        self.pairing.fail_requests(Error::Canceled);
        if let Some(sco) = self.sco.as_mut() {
            sco.fail_all();
        }
        for callback in self.pending_connect_callbacks.drain(..) {
            callback(Err(Error::Canceled));
        }
        self.channels.clear();
    }
}
