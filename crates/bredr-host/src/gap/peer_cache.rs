//! Keyed store of peer records
//!
//! Peers are addressed by stable `PeerId`; an address index supports the
//! event paths that only carry a BD_ADDR. A classic observation of an
//! address that already has an LE record merges into a dual-mode record.

use crate::gap::types::{BdAddr, PeerId, PeerRecord, TechnologyType};
use log::debug;
use std::collections::HashMap;

#[derive(Default)]
pub struct PeerCache {
    peers: HashMap<PeerId, PeerRecord>,
    address_index: HashMap<BdAddr, PeerId>,
    next_id: u64,
}

impl PeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&id)
    }

    pub fn peer_id_for_address(&self, address: BdAddr) -> Option<PeerId> {
        self.address_index.get(&address).copied()
    }

    pub fn get_by_address_mut(&mut self, address: BdAddr) -> Option<&mut PeerRecord> {
        let id = self.peer_id_for_address(address)?;
        self.peers.get_mut(&id)
    }

    /// Insert a new peer observed on `technology`, or update the existing
    /// record at the same address. An existing LE record observed over
    /// classic (or vice versa) becomes dual-mode.
    pub fn insert_or_update(&mut self, address: BdAddr, technology: TechnologyType) -> PeerId {
        if let Some(id) = self.peer_id_for_address(address) {
            let peer = self.peers.get_mut(&id).unwrap();
            if peer.technology != technology && peer.technology != TechnologyType::DualMode {
                debug!("peer {} is now dual-mode", id);
                peer.technology = TechnologyType::DualMode;
            }
            return id;
        }

        self.next_id += 1;
        let id = PeerId(self.next_id);
        self.peers.insert(id, PeerRecord::new(id, address, technology));
        self.address_index.insert(address, id);
        id
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: BdAddr = BdAddr {
        bytes: [1, 2, 3, 4, 5, 6],
    };

    #[test]
    fn test_insert_and_lookup() {
        let mut cache = PeerCache::new();
        let id = cache.insert_or_update(ADDR, TechnologyType::Classic);

        assert_eq!(cache.peer_id_for_address(ADDR), Some(id));
        assert_eq!(cache.get(id).unwrap().address, ADDR);

        // Re-inserting the same address returns the same id.
        assert_eq!(cache.insert_or_update(ADDR, TechnologyType::Classic), id);
    }

    #[test]
    fn test_le_peer_becomes_dual_mode_when_seen_on_classic() {
        let mut cache = PeerCache::new();
        let id = cache.insert_or_update(ADDR, TechnologyType::LowEnergy);
        assert_eq!(cache.get(id).unwrap().technology, TechnologyType::LowEnergy);

        let same = cache.insert_or_update(ADDR, TechnologyType::Classic);
        assert_eq!(same, id);
        assert_eq!(cache.get(id).unwrap().technology, TechnologyType::DualMode);
    }

    #[test]
    fn test_distinct_addresses_get_distinct_ids() {
        let mut cache = PeerCache::new();
        let first = cache.insert_or_update(ADDR, TechnologyType::Classic);
        let second = cache.insert_or_update(
            BdAddr::new([9, 9, 9, 9, 9, 9]),
            TechnologyType::Classic,
        );
        assert_ne!(first, second);
    }
}
