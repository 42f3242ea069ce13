//! Post-connection peer interrogation
//!
//! One-shot sequencer run against every freshly established ACL link. Only
//! commands whose corresponding peer attribute is missing are issued; the
//! extended feature pages are walked up to the peer's max page, capped at
//! page 2. Any command error fails the whole interrogation. There are no
//! retries.

use crate::error::{Error, HciStatus, Result};
use crate::gap::types::{BdAddr, PeerId, PeerRecord, PeerVersion, MAX_FEATURE_PAGE};
use crate::hci::constants::*;
use crate::hci::events::{
    ReadRemoteExtendedFeaturesCompleteParams, ReadRemoteSupportedFeaturesCompleteParams,
    ReadRemoteVersionInfoCompleteParams, RemoteNameRequestCompleteParams,
};
use crate::hci::{ConnectionHandle, HciCommand};
use log::{debug, info, warn};

/// Commands to send plus the completion, when interrogation finished.
#[derive(Default)]
pub struct InterrogatorOutput {
    pub commands: Vec<HciCommand>,
    pub completed: Option<Result<()>>,
}

impl InterrogatorOutput {
    fn commands(commands: Vec<HciCommand>) -> Self {
        Self {
            commands,
            completed: None,
        }
    }
}

pub struct Interrogator {
    peer_id: PeerId,
    handle: ConnectionHandle,
    address: BdAddr,
    awaiting_name: bool,
    awaiting_version: bool,
    awaiting_features: bool,
    awaiting_extended_page: Option<u8>,
    started: bool,
    finished: bool,
    canceled: bool,
}

impl Interrogator {
    pub fn new(peer_id: PeerId, handle: ConnectionHandle, address: BdAddr) -> Self {
        Self {
            peer_id,
            handle,
            address,
            awaiting_name: false,
            awaiting_version: false,
            awaiting_features: false,
            awaiting_extended_page: None,
            started: false,
            finished: false,
            canceled: false,
        }
    }

    /// Queue the commands for every attribute the peer record is missing.
    /// Completes immediately when nothing is missing.
    pub fn start(&mut self, peer: &PeerRecord) -> InterrogatorOutput {
        self.started = true;
        let mut commands = Vec::new();

        if peer.name.is_none() {
            self.awaiting_name = true;
            commands.push(HciCommand::RemoteNameRequest {
                bd_addr: self.address.bytes,
                page_scan_repetition_mode: peer
                    .page_scan_repetition_mode
                    .unwrap_or(PAGE_SCAN_REPETITION_R0),
                clock_offset: peer.clock_offset.unwrap_or(0),
            });
        }

        if peer.version.is_none() {
            self.awaiting_version = true;
            commands.push(HciCommand::ReadRemoteVersionInfo {
                handle: self.handle,
            });
        }

        if !peer.features.has_page(0) {
            self.awaiting_features = true;
            commands.push(HciCommand::ReadRemoteSupportedFeatures {
                handle: self.handle,
            });
        } else if peer.features.has_bit(0, LMP_FEATURE_EXTENDED_FEATURES) {
            self.awaiting_extended_page = Some(1);
            commands.push(HciCommand::ReadRemoteExtendedFeatures {
                handle: self.handle,
                page: 1,
            });
        }

        if commands.is_empty() {
            debug!("peer {} fully known, interrogation is a no-op", self.peer_id);
            self.finished = true;
            return InterrogatorOutput {
                commands,
                completed: Some(Ok(())),
            };
        }

        info!("interrogating peer {}", self.peer_id);
        InterrogatorOutput::commands(commands)
    }

    /// Abort without emitting a completion.
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn active(&self) -> bool {
        self.started && !self.finished && !self.canceled
    }

    fn fail(&mut self, status: HciStatus) -> InterrogatorOutput {
        warn!(
            "interrogation failed (peer: {}, status: {:#04x})",
            self.peer_id,
            status.to_u8()
        );
        self.finished = true;
        InterrogatorOutput {
            commands: Vec::new(),
            completed: Some(Err(Error::from(status))),
        }
    }

    fn maybe_complete(&mut self) -> InterrogatorOutput {
        if self.awaiting_name
            || self.awaiting_version
            || self.awaiting_features
            || self.awaiting_extended_page.is_some()
        {
            return InterrogatorOutput::default();
        }
        info!("interrogation complete (peer: {})", self.peer_id);
        self.finished = true;
        InterrogatorOutput {
            commands: Vec::new(),
            completed: Some(Ok(())),
        }
    }

    pub fn on_remote_name_complete(
        &mut self,
        params: &RemoteNameRequestCompleteParams,
        peer: &mut PeerRecord,
    ) -> InterrogatorOutput {
        if !self.active() || !self.awaiting_name {
            return InterrogatorOutput::default();
        }
        let status = HciStatus::from_u8(params.status);
        if !status.is_success() {
            return self.fail(status);
        }

        peer.name = Some(params.name());
        self.awaiting_name = false;
        self.maybe_complete()
    }

    pub fn on_remote_version_complete(
        &mut self,
        params: &ReadRemoteVersionInfoCompleteParams,
        peer: &mut PeerRecord,
    ) -> InterrogatorOutput {
        if !self.active() || !self.awaiting_version {
            return InterrogatorOutput::default();
        }
        let status = HciStatus::from_u8(params.status);
        if !status.is_success() {
            return self.fail(status);
        }

        peer.version = Some(PeerVersion {
            version: params.version,
            company_identifier: params.company_identifier,
            subversion: params.subversion,
        });
        self.awaiting_version = false;
        self.maybe_complete()
    }

    pub fn on_remote_features_complete(
        &mut self,
        params: &ReadRemoteSupportedFeaturesCompleteParams,
        peer: &mut PeerRecord,
    ) -> InterrogatorOutput {
        if !self.active() || !self.awaiting_features {
            return InterrogatorOutput::default();
        }
        let status = HciStatus::from_u8(params.status);
        if !status.is_success() {
            return self.fail(status);
        }

        peer.features.set_page(0, params.lmp_features);
        self.awaiting_features = false;

        if peer.features.has_bit(0, LMP_FEATURE_EXTENDED_FEATURES) {
            peer.features.set_last_page_number(1);
            self.awaiting_extended_page = Some(1);
            return InterrogatorOutput::commands(vec![HciCommand::ReadRemoteExtendedFeatures {
                handle: self.handle,
                page: 1,
            }]);
        }

        self.maybe_complete()
    }

    pub fn on_remote_extended_features_complete(
        &mut self,
        params: &ReadRemoteExtendedFeaturesCompleteParams,
        peer: &mut PeerRecord,
    ) -> InterrogatorOutput {
        let expected_page = match self.awaiting_extended_page {
            Some(page) if self.active() => page,
            _ => return InterrogatorOutput::default(),
        };
        let status = HciStatus::from_u8(params.status);
        if !status.is_success() {
            return self.fail(status);
        }

        peer.features
            .set_page(params.page_number, params.lmp_features);

        if params.page_number != expected_page {
            // The controller answered for a different page; stop walking.
            warn!(
                "requested feature page {} but got page {} (peer: {})",
                expected_page, params.page_number, self.peer_id
            );
            peer.features.set_last_page_number(0);
            self.awaiting_extended_page = None;
            return self.maybe_complete();
        }

        // Pages past MAX_FEATURE_PAGE are never requested.
        peer.features.set_last_page_number(params.max_page_number);

        if expected_page < peer.features.last_page_number() && expected_page < MAX_FEATURE_PAGE {
            let next_page = expected_page + 1;
            self.awaiting_extended_page = Some(next_page);
            return InterrogatorOutput::commands(vec![HciCommand::ReadRemoteExtendedFeatures {
                handle: self.handle,
                page: next_page,
            }]);
        }

        self.awaiting_extended_page = None;
        self.maybe_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::types::TechnologyType;

    const ADDR: [u8; 6] = [1, 2, 3, 4, 5, 6];
    const HANDLE: u16 = 0x0BAA;

    fn peer() -> PeerRecord {
        PeerRecord::new(PeerId(1), BdAddr::new(ADDR), TechnologyType::Classic)
    }

    fn name_complete(status: u8) -> RemoteNameRequestCompleteParams {
        RemoteNameRequestCompleteParams {
            status,
            bd_addr: ADDR,
            remote_name: b"Fuchsia\xF0\x9F\x92\x96\x00\x14\x15".to_vec(),
        }
    }

    fn version_complete() -> ReadRemoteVersionInfoCompleteParams {
        ReadRemoteVersionInfoCompleteParams {
            status: 0,
            handle: HANDLE,
            version: 0x08,
            company_identifier: 0x00E0,
            subversion: 0xDEAD,
        }
    }

    fn features_complete(features: u64) -> ReadRemoteSupportedFeaturesCompleteParams {
        ReadRemoteSupportedFeaturesCompleteParams {
            status: 0,
            handle: HANDLE,
            lmp_features: features,
        }
    }

    fn extended_complete(
        page: u8,
        max_page: u8,
        features: u64,
    ) -> ReadRemoteExtendedFeaturesCompleteParams {
        ReadRemoteExtendedFeaturesCompleteParams {
            status: 0,
            handle: HANDLE,
            page_number: page,
            max_page_number: max_page,
            lmp_features: features,
        }
    }

    /// Full interrogation of an unknown peer: name, version, features, and
    /// extended pages 1 and 2, in order.
    #[test]
    fn test_full_interrogation_sequence() {
        let mut peer = peer();
        let mut interrogator = Interrogator::new(peer.id, HANDLE, peer.address);

        let output = interrogator.start(&peer);
        assert_eq!(output.commands.len(), 3);
        assert!(matches!(
            output.commands[0],
            HciCommand::RemoteNameRequest { .. }
        ));
        assert!(matches!(
            output.commands[1],
            HciCommand::ReadRemoteVersionInfo { handle: HANDLE }
        ));
        assert!(matches!(
            output.commands[2],
            HciCommand::ReadRemoteSupportedFeatures { handle: HANDLE }
        ));

        let output = interrogator.on_remote_name_complete(&name_complete(0), &mut peer);
        assert!(output.completed.is_none());
        assert_eq!(peer.name.as_deref(), Some("Fuchsia\u{1F496}"));

        let output = interrogator.on_remote_version_complete(&version_complete(), &mut peer);
        assert!(output.completed.is_none());

        // Page 0 reports extended features: page 1 is requested.
        let output = interrogator
            .on_remote_features_complete(&features_complete(LMP_FEATURE_EXTENDED_FEATURES), &mut peer);
        assert_eq!(
            output.commands,
            vec![HciCommand::ReadRemoteExtendedFeatures {
                handle: HANDLE,
                page: 1,
            }]
        );

        // Page 1 reports max page 2: page 2 is requested.
        let output =
            interrogator.on_remote_extended_features_complete(&extended_complete(1, 2, 0), &mut peer);
        assert_eq!(
            output.commands,
            vec![HciCommand::ReadRemoteExtendedFeatures {
                handle: HANDLE,
                page: 2,
            }]
        );

        let output =
            interrogator.on_remote_extended_features_complete(&extended_complete(2, 2, 0), &mut peer);
        assert_eq!(output.completed, Some(Ok(())));
        assert!(interrogator.is_finished());
    }

    /// Pages above 2 are never requested even when the peer reports more.
    #[test]
    fn test_extended_pages_capped_at_two() {
        let mut peer = peer();
        peer.name = Some("known".into());
        peer.version = Some(PeerVersion {
            version: 8,
            company_identifier: 0,
            subversion: 0,
        });
        let mut interrogator = Interrogator::new(peer.id, HANDLE, peer.address);

        interrogator.start(&peer);
        interrogator.on_remote_features_complete(
            &features_complete(LMP_FEATURE_EXTENDED_FEATURES),
            &mut peer,
        );
        interrogator.on_remote_extended_features_complete(&extended_complete(1, 5, 0), &mut peer);
        assert_eq!(peer.features.last_page_number(), 2);

        let output =
            interrogator.on_remote_extended_features_complete(&extended_complete(2, 5, 0), &mut peer);
        // No page-3 request; interrogation is done.
        assert!(output.commands.is_empty());
        assert_eq!(output.completed, Some(Ok(())));
    }

    /// Attributes already cached are not requested again.
    #[test]
    fn test_known_attributes_skipped() {
        let mut peer = peer();
        peer.name = Some("cached".into());
        peer.version = Some(PeerVersion {
            version: 8,
            company_identifier: 0,
            subversion: 0,
        });
        peer.features.set_page(0, 0); // no extended features bit

        let mut interrogator = Interrogator::new(peer.id, HANDLE, peer.address);
        let output = interrogator.start(&peer);
        assert!(output.commands.is_empty());
        assert_eq!(output.completed, Some(Ok(())));
    }

    /// A command error fails the whole interrogation.
    #[test]
    fn test_command_error_fails_interrogation() {
        let mut peer = peer();
        let mut interrogator = Interrogator::new(peer.id, HANDLE, peer.address);

        interrogator.start(&peer);
        let output = interrogator.on_remote_name_complete(&name_complete(0x04), &mut peer);
        assert_eq!(output.completed, Some(Err(Error::PageTimeout)));
        assert!(interrogator.is_finished());
    }

    /// Cancel aborts without emitting a completion.
    #[test]
    fn test_cancel_suppresses_completion() {
        let mut peer = peer();
        let mut interrogator = Interrogator::new(peer.id, HANDLE, peer.address);

        interrogator.start(&peer);
        interrogator.cancel();

        let output = interrogator.on_remote_name_complete(&name_complete(0), &mut peer);
        assert!(output.completed.is_none());
        assert!(output.commands.is_empty());
    }

    /// A completion for an unexpected page resets the page walk.
    #[test]
    fn test_wrong_page_stops_walk() {
        let mut peer = peer();
        peer.name = Some("known".into());
        peer.version = Some(PeerVersion {
            version: 8,
            company_identifier: 0,
            subversion: 0,
        });
        let mut interrogator = Interrogator::new(peer.id, HANDLE, peer.address);

        interrogator.start(&peer);
        interrogator.on_remote_features_complete(
            &features_complete(LMP_FEATURE_EXTENDED_FEATURES),
            &mut peer,
        );

        let output =
            interrogator.on_remote_extended_features_complete(&extended_complete(2, 2, 0), &mut peer);
        assert_eq!(peer.features.last_page_number(), 0);
        assert_eq!(output.completed, Some(Ok(())));
    }
}
