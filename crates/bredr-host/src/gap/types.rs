//! Core GAP types: addresses, peer identifiers, and the peer record
use crate::hci::constants::*;
use crate::pairing::types::LinkKey;
use crate::sdp::{ServiceRecord, Uuid};
use std::collections::HashMap;
use std::fmt;

/// A 48-bit Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// Stable identifier assigned to a peer by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Transports a peer has been observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TechnologyType {
    Classic,
    LowEnergy,
    DualMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerBondingState {
    #[default]
    Unbonded,
    Initializing,
    Bonded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerConnectionState {
    #[default]
    NotConnected,
    Initializing,
    Connected,
}

/// ACL connection role, mutable through Role Change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Central,
    Peripheral,
}

impl ConnectionRole {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            ROLE_CENTRAL => Some(ConnectionRole::Central),
            ROLE_PERIPHERAL => Some(ConnectionRole::Peripheral),
            _ => None,
        }
    }
}

/// Remote version information from Read Remote Version Info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerVersion {
    pub version: u8,
    pub company_identifier: u16,
    pub subversion: u16,
}

/// LMP feature pages 0 through 2. The controller may advertise more pages
/// but they are never requested, so the last page number is capped at 2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeaturePages {
    pages: [Option<u64>; 3],
    last_page_number: u8,
}

pub const MAX_FEATURE_PAGE: u8 = 2;

impl FeaturePages {
    pub fn has_page(&self, page: u8) -> bool {
        self.page(page).is_some()
    }

    pub fn page(&self, page: u8) -> Option<u64> {
        self.pages.get(page as usize).copied().flatten()
    }

    pub fn set_page(&mut self, page: u8, features: u64) {
        if let Some(slot) = self.pages.get_mut(page as usize) {
            *slot = Some(features);
        }
    }

    pub fn has_bit(&self, page: u8, mask: u64) -> bool {
        self.page(page).map_or(false, |bits| bits & mask != 0)
    }

    pub fn last_page_number(&self) -> u8 {
        self.last_page_number
    }

    pub fn set_last_page_number(&mut self, page: u8) {
        self.last_page_number = page.min(MAX_FEATURE_PAGE);
    }
}

/// Everything the host knows about a peer, keyed by `PeerId` in the cache.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub address: BdAddr,
    pub technology: TechnologyType,
    pub bonding_state: PeerBondingState,
    pub connection_state: PeerConnectionState,
    pub name: Option<String>,
    pub version: Option<PeerVersion>,
    pub features: FeaturePages,
    pub link_key: Option<LinkKey>,
    pub page_scan_repetition_mode: Option<u8>,
    pub clock_offset: Option<u16>,
    pub services: HashMap<Uuid, Vec<ServiceRecord>>,
}

impl PeerRecord {
    pub fn new(id: PeerId, address: BdAddr, technology: TechnologyType) -> Self {
        Self {
            id,
            address,
            technology,
            bonding_state: PeerBondingState::default(),
            connection_state: PeerConnectionState::default(),
            name: None,
            version: None,
            features: FeaturePages::default(),
            link_key: None,
            page_scan_repetition_mode: None,
            clock_offset: None,
            services: HashMap::new(),
        }
    }

    /// Whether the peer supports Secure Simple Pairing on both host and
    /// controller. `None` until interrogation has produced page 0.
    pub fn supports_secure_simple_pairing(&self) -> Option<bool> {
        if !self.features.has_page(0) {
            return None;
        }
        let controller = self
            .features
            .has_bit(0, LMP_FEATURE_SECURE_SIMPLE_PAIRING_CONTROLLER);
        let host = self.features.has_bit(1, LMP_FEATURE_SECURE_SIMPLE_PAIRING_HOST);
        Some(controller && host)
    }

    /// Whether the peer supports Secure Connections on both host and
    /// controller.
    pub fn supports_secure_connections(&self) -> bool {
        self.features.has_bit(1, LMP_FEATURE_SECURE_CONNECTIONS_HOST)
            && self
                .features
                .has_bit(2, LMP_FEATURE_SECURE_CONNECTIONS_CONTROLLER)
    }

    pub fn set_link_key(&mut self, key: LinkKey) {
        self.link_key = Some(key);
    }

    /// Merge freshly discovered services for `uuid` into the service set.
    /// Empty results never erase previously cached services.
    pub fn merge_services(&mut self, uuid: Uuid, records: Vec<ServiceRecord>) {
        if records.is_empty() {
            return;
        }
        let entry = self.services.entry(uuid).or_default();
        for record in records {
            if !entry.iter().any(|existing| existing.handle == record.handle) {
                entry.push(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bd_addr_display() {
        let addr = BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(addr.to_string(), "06:05:04:03:02:01");
    }

    #[test]
    fn test_feature_pages_clamped() {
        let mut features = FeaturePages::default();
        features.set_last_page_number(5);
        assert_eq!(features.last_page_number(), 2);

        features.set_page(0, 0xFF);
        features.set_page(3, 0xAA); // out of range, ignored
        assert!(features.has_page(0));
        assert!(!features.has_page(3));
    }

    #[test]
    fn test_ssp_support_unknown_before_interrogation() {
        let peer = PeerRecord::new(
            PeerId(1),
            BdAddr::new([0; 6]),
            TechnologyType::Classic,
        );
        assert_eq!(peer.supports_secure_simple_pairing(), None);
    }

    #[test]
    fn test_ssp_support_requires_host_and_controller() {
        let mut peer = PeerRecord::new(
            PeerId(1),
            BdAddr::new([0; 6]),
            TechnologyType::Classic,
        );
        peer.features
            .set_page(0, LMP_FEATURE_SECURE_SIMPLE_PAIRING_CONTROLLER);
        assert_eq!(peer.supports_secure_simple_pairing(), Some(false));

        peer.features.set_page(1, LMP_FEATURE_SECURE_SIMPLE_PAIRING_HOST);
        assert_eq!(peer.supports_secure_simple_pairing(), Some(true));
    }

    #[test]
    fn test_merge_services_keeps_existing_on_empty() {
        let mut peer = PeerRecord::new(
            PeerId(1),
            BdAddr::new([0; 6]),
            TechnologyType::Classic,
        );
        let uuid = Uuid::Uuid16(0x110B);
        peer.merge_services(
            uuid,
            vec![ServiceRecord {
                handle: 0x10000,
                service_class_id_list: vec![uuid],
                attributes: Vec::new(),
            }],
        );
        assert_eq!(peer.services[&uuid].len(), 1);

        // Empty result set leaves the cache untouched.
        peer.merge_services(uuid, Vec::new());
        assert_eq!(peer.services[&uuid].len(), 1);

        // Duplicate handles are not duplicated.
        peer.merge_services(
            uuid,
            vec![ServiceRecord {
                handle: 0x10000,
                service_class_id_list: vec![uuid],
                attributes: Vec::new(),
            }],
        );
        assert_eq!(peer.services[&uuid].len(), 1);
    }
}
