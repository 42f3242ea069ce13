//! SCO/eSCO connection management for one ACL link
//!
//! Each ACL connection owns at most one `ScoConnectionManager`. The manager
//! holds one in-progress synchronous connection request plus at most one
//! queued request; queuing a new request pre-empts the previously queued
//! one. Initiator requests use their first parameter candidate only;
//! responder requests walk the candidate list forward looking for one that
//! supports the transport of each inbound request and re-arm on failure
//! while candidates remain.

use crate::error::{Error, Result};
use crate::gap::types::{BdAddr, PeerId};
use crate::hci::constants::*;
use crate::hci::events::{ConnectionRequestParams, SynchronousConnectionCompleteParams};
use crate::hci::{ConnectionHandle, HciCommand, SynchronousConnectionParameters};
use log::{debug, info, warn};

/// Identifies one queued or in-progress request for cancellation.
pub type ScoRequestId = u64;

/// An established synchronous connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoConnection {
    pub handle: ConnectionHandle,
    pub parameters: SynchronousConnectionParameters,
}

/// Completion callback: the connection and the index of the parameter
/// candidate that produced it.
pub type ScoCallback = Box<dyn FnOnce(Result<(ScoConnection, usize)>)>;

struct ConnectionRequest {
    id: ScoRequestId,
    initiator: bool,
    /// True once an inbound Connection Request event has been accepted for
    /// this request; cancellation is deferred past that point.
    received_request: bool,
    parameters: Vec<SynchronousConnectionParameters>,
    current_param_index: usize,
    callback: ScoCallback,
}

pub struct ScoConnectionManager {
    peer_id: PeerId,
    acl_handle: ConnectionHandle,
    peer_address: BdAddr,
    next_request_id: ScoRequestId,
    in_progress: Option<ConnectionRequest>,
    queued: Option<ConnectionRequest>,
}

impl ScoConnectionManager {
    pub fn new(peer_id: PeerId, acl_handle: ConnectionHandle, peer_address: BdAddr) -> Self {
        Self {
            peer_id,
            acl_handle,
            peer_address,
            next_request_id: 0,
            in_progress: None,
            queued: None,
        }
    }

    /// Initiate a synchronous connection with a single parameter set.
    pub fn open_connection(
        &mut self,
        parameters: SynchronousConnectionParameters,
        callback: ScoCallback,
    ) -> (ScoRequestId, Vec<HciCommand>) {
        self.queue_request(true, vec![parameters], callback)
    }

    /// Wait for an inbound synchronous connection and accept it with the
    /// first candidate that supports the requested transport.
    pub fn accept_connection(
        &mut self,
        parameters: Vec<SynchronousConnectionParameters>,
        callback: ScoCallback,
    ) -> (ScoRequestId, Vec<HciCommand>) {
        self.queue_request(false, parameters, callback)
    }

    fn queue_request(
        &mut self,
        initiator: bool,
        parameters: Vec<SynchronousConnectionParameters>,
        callback: ScoCallback,
    ) -> (ScoRequestId, Vec<HciCommand>) {
        let id = self.next_request_id;
        self.next_request_id += 1;

        if parameters.is_empty() {
            callback(Err(Error::InvalidParameters));
            return (id, Vec::new());
        }

        // A newer request pre-empts whatever was queued before it.
        if let Some(queued) = self.queued.take() {
            info!("canceling queued SCO request (id: {})", queued.id);
            (queued.callback)(Err(Error::Canceled));
        }

        self.queued = Some(ConnectionRequest {
            id,
            initiator,
            received_request: false,
            parameters,
            current_param_index: 0,
            callback,
        });

        (id, self.try_create_next_connection())
    }

    /// Cancel the request with `id`. A queued request is canceled outright;
    /// an in-progress responder request is canceled only while no inbound
    /// connection request has been observed for it.
    pub fn cancel(&mut self, id: ScoRequestId) -> Vec<HciCommand> {
        if self.queued.as_ref().map(|request| request.id) == Some(id) {
            let queued = self.queued.take().unwrap();
            info!("canceling queued SCO request (id: {})", id);
            (queued.callback)(Err(Error::Canceled));
            return Vec::new();
        }

        let cancelable = self
            .in_progress
            .as_ref()
            .map(|request| request.id == id && !request.initiator && !request.received_request)
            .unwrap_or(false);
        if cancelable {
            info!("canceling in-progress SCO request (id: {})", id);
            return self.complete_request(Err(Error::Canceled));
        }

        Vec::new()
    }

    /// Tear down outstanding requests when the ACL link goes away.
    pub fn fail_all(&mut self) {
        if let Some(queued) = self.queued.take() {
            (queued.callback)(Err(Error::Canceled));
        }
        if let Some(in_progress) = self.in_progress.take() {
            (in_progress.callback)(Err(Error::Canceled));
        }
    }

    /// Inbound Connection Request with a SCO or eSCO link type.
    pub fn on_connection_request(&mut self, params: &ConnectionRequestParams) -> Vec<HciCommand> {
        if params.link_type != LINK_TYPE_SCO && params.link_type != LINK_TYPE_ESCO {
            return Vec::new();
        }
        if params.bd_addr != self.peer_address.bytes {
            return Vec::new();
        }

        let in_progress = match self.in_progress.as_mut() {
            Some(request) if !request.initiator => request,
            _ => {
                info!(
                    "rejecting unexpected synchronous connection request (peer: {})",
                    self.peer_id
                );
                return vec![Self::reject_command(
                    params.bd_addr,
                    HCI_REJECT_BAD_BD_ADDR,
                )];
            }
        };

        // Advance to a candidate that supports the requested transport; the
        // controller rejects parameters without matching packet types.
        let found = loop {
            match in_progress.parameters.get(in_progress.current_param_index) {
                None => break false,
                Some(candidate) => {
                    let supported = if params.link_type == LINK_TYPE_SCO {
                        candidate.supports_sco()
                    } else {
                        candidate.supports_esco()
                    };
                    if supported {
                        break true;
                    }
                    in_progress.current_param_index += 1;
                }
            }
        };

        if !found {
            debug!(
                "no remaining candidate supports the requested transport (peer: {})",
                self.peer_id
            );
            // The controller follows up with a failed Synchronous
            // Connection Complete, which completes the request.
            return vec![Self::reject_command(
                params.bd_addr,
                HCI_REJECT_LIMITED_RESOURCES,
            )];
        }

        info!(
            "accepting inbound synchronous connection (peer: {}, candidate: {})",
            self.peer_id, in_progress.current_param_index
        );
        in_progress.received_request = true;
        vec![HciCommand::EnhancedAcceptSynchronousConnectionRequest {
            bd_addr: params.bd_addr,
            parameters: in_progress.parameters[in_progress.current_param_index],
        }]
    }

    /// Synchronous Connection Complete for this peer.
    pub fn on_synchronous_connection_complete(
        &mut self,
        params: &SynchronousConnectionCompleteParams,
    ) -> Vec<HciCommand> {
        if params.bd_addr != self.peer_address.bytes {
            return Vec::new();
        }

        if params.status != 0 {
            info!(
                "synchronous connection failed, trying next candidate if any (peer: {})",
                self.peer_id
            );
            return self.complete_request_or_try_next_parameters(Err(Error::Failed));
        }

        if params.link_type != LINK_TYPE_SCO && params.link_type != LINK_TYPE_ESCO {
            warn!("synchronous connection complete with invalid link type");
            return Vec::new();
        }

        let (handle, index, parameters) = match self.in_progress.as_ref() {
            Some(request) => (
                params.handle,
                request.current_param_index,
                request.parameters[request.current_param_index],
            ),
            None => {
                warn!(
                    "unexpected synchronous connection complete (peer: {})",
                    self.peer_id
                );
                return Vec::new();
            }
        };

        let connection = ScoConnection { handle, parameters };
        self.complete_request_or_try_next_parameters(Ok((connection, index)))
    }

    fn try_create_next_connection(&mut self) -> Vec<HciCommand> {
        // An in-progress responder request that has not seen an inbound
        // connection request yet yields to newly queued work.
        let mut commands = Vec::new();
        if let Some(id) = self.in_progress.as_ref().map(|request| request.id) {
            commands.extend(self.cancel(id));
        }

        if self.in_progress.is_some() || self.queued.is_none() {
            return commands;
        }

        self.in_progress = self.queued.take();
        let in_progress = self.in_progress.as_ref().unwrap();

        if in_progress.initiator {
            debug!("initiating synchronous connection (peer: {})", self.peer_id);
            commands.push(HciCommand::EnhancedSetupSynchronousConnection {
                handle: self.acl_handle,
                parameters: in_progress.parameters[in_progress.current_param_index],
            });
        }

        commands
    }

    fn complete_request_or_try_next_parameters(
        &mut self,
        result: Result<(ScoConnection, usize)>,
    ) -> Vec<HciCommand> {
        let in_progress = match self.in_progress.as_mut() {
            Some(request) => request,
            None => return Vec::new(),
        };

        // Initiator requests never iterate candidates.
        if result.is_ok() || in_progress.initiator {
            return self.complete_request(result);
        }

        if in_progress.current_param_index + 1 >= in_progress.parameters.len() {
            debug!("all accept candidates exhausted (peer: {})", self.peer_id);
            return self.complete_request(Err(Error::ParametersRejected));
        }

        // A request queued after the inbound connection request blocked
        // cancellation; honor it now.
        if self.queued.is_some() {
            return self.complete_request(Err(Error::Canceled));
        }

        // Re-arm for the next inbound request with the next candidate.
        in_progress.received_request = false;
        in_progress.current_param_index += 1;
        Vec::new()
    }

    fn complete_request(&mut self, result: Result<(ScoConnection, usize)>) -> Vec<HciCommand> {
        // Clear before invoking the callback so a re-entrant cancel from
        // the callback cannot complete the request twice.
        let request = match self.in_progress.take() {
            Some(request) => request,
            None => return Vec::new(),
        };
        info!(
            "completing synchronous connection request (peer: {}, initiator: {}, success: {})",
            self.peer_id,
            request.initiator,
            result.is_ok()
        );
        (request.callback)(result);
        self.try_create_next_connection()
    }

    fn reject_command(bd_addr: [u8; 6], reason: u8) -> HciCommand {
        // The controller accepts only this narrow set of reject reasons.
        assert!(
            reason == HCI_REJECT_LIMITED_RESOURCES
                || reason == HCI_REJECT_SECURITY
                || reason == HCI_REJECT_BAD_BD_ADDR,
            "invalid synchronous connection reject reason: {:#04x}",
            reason
        );
        HciCommand::RejectSynchronousConnectionRequest { bd_addr, reason }
    }
}

/// Reject reasons permitted by Reject Synchronous Connection Request.
pub const HCI_REJECT_LIMITED_RESOURCES: u8 = 0x0D;
pub const HCI_REJECT_SECURITY: u8 = 0x0E;
pub const HCI_REJECT_BAD_BD_ADDR: u8 = 0x0F;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const PEER_ADDR: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
    const ACL_HANDLE: u16 = 0x0001;

    fn manager() -> ScoConnectionManager {
        ScoConnectionManager::new(PeerId(7), ACL_HANDLE, BdAddr::new(PEER_ADDR))
    }

    fn recorder() -> (
        Rc<RefCell<Vec<Result<(ScoConnection, usize)>>>>,
        ScoCallback,
    ) {
        let results = Rc::new(RefCell::new(Vec::new()));
        let results_clone = results.clone();
        let callback: ScoCallback =
            Box::new(move |result| results_clone.borrow_mut().push(result));
        (results, callback)
    }

    fn params_with(packet_types: u16) -> SynchronousConnectionParameters {
        SynchronousConnectionParameters {
            packet_types,
            ..Default::default()
        }
    }

    fn inbound_request(link_type: u8) -> ConnectionRequestParams {
        ConnectionRequestParams {
            bd_addr: PEER_ADDR,
            class_of_device: [0; 3],
            link_type,
        }
    }

    fn complete(status: u8, handle: u16, link_type: u8) -> SynchronousConnectionCompleteParams {
        SynchronousConnectionCompleteParams {
            status,
            handle,
            bd_addr: PEER_ADDR,
            link_type,
            transmission_interval: 0,
            retransmission_window: 0,
            rx_packet_length: 60,
            tx_packet_length: 60,
            air_mode: 0x02,
        }
    }

    #[test]
    fn test_empty_parameter_list_fails_immediately() {
        let mut manager = manager();
        let (results, callback) = recorder();

        let (_, commands) = manager.accept_connection(Vec::new(), callback);
        assert!(commands.is_empty());
        assert_eq!(results.borrow().len(), 1);
        assert!(matches!(results.borrow()[0], Err(Error::InvalidParameters)));
    }

    #[test]
    fn test_initiator_sends_setup_and_completes() {
        let mut manager = manager();
        let (results, callback) = recorder();

        let (_, commands) = manager.open_connection(params_with(SCO_PACKET_EV3), callback);
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            commands[0],
            HciCommand::EnhancedSetupSynchronousConnection { handle: ACL_HANDLE, .. }
        ));

        manager.on_synchronous_connection_complete(&complete(0x00, 0x0041, LINK_TYPE_ESCO));
        assert_eq!(results.borrow().len(), 1);
        let (connection, index) = results.borrow()[0].clone().unwrap();
        assert_eq!(connection.handle, 0x0041);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_initiator_failure_does_not_iterate() {
        let mut manager = manager();
        let (results, callback) = recorder();

        manager.open_connection(params_with(SCO_PACKET_EV3), callback);
        let commands =
            manager.on_synchronous_connection_complete(&complete(0x10, 0x0000, LINK_TYPE_ESCO));
        assert!(commands.is_empty());
        assert!(matches!(results.borrow()[0], Err(Error::Failed)));
    }

    /// Accept list [SCO-only, eSCO-only]: an eSCO inbound request skips
    /// candidate 0 and is accepted with candidate 1.
    #[test]
    fn test_responder_skips_to_supporting_candidate() {
        let mut manager = manager();
        let (results, callback) = recorder();

        let (_, commands) = manager.accept_connection(
            vec![params_with(SCO_PACKET_HV3), params_with(SCO_PACKET_EV3)],
            callback,
        );
        // Responder requests send nothing until the inbound request.
        assert!(commands.is_empty());

        let commands = manager.on_connection_request(&inbound_request(LINK_TYPE_ESCO));
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            HciCommand::EnhancedAcceptSynchronousConnectionRequest { bd_addr, parameters } => {
                assert_eq!(*bd_addr, PEER_ADDR);
                assert_eq!(parameters.packet_types, SCO_PACKET_EV3);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        manager.on_synchronous_connection_complete(&complete(0x00, 0x41, LINK_TYPE_ESCO));
        let (connection, index) = results.borrow()[0].clone().unwrap();
        assert_eq!(connection.handle, 0x41);
        assert_eq!(index, 1);
    }

    /// No candidate supports the transport: reject with limited resources
    /// and complete with ParametersRejected once the controller reports the
    /// failed connection.
    #[test]
    fn test_responder_rejects_when_no_candidate_supports_transport() {
        let mut manager = manager();
        let (results, callback) = recorder();

        manager.accept_connection(vec![params_with(SCO_PACKET_HV3)], callback);

        let commands = manager.on_connection_request(&inbound_request(LINK_TYPE_ESCO));
        assert_eq!(
            commands,
            vec![HciCommand::RejectSynchronousConnectionRequest {
                bd_addr: PEER_ADDR,
                reason: HCI_REJECT_LIMITED_RESOURCES,
            }]
        );
        assert!(results.borrow().is_empty());

        manager.on_synchronous_connection_complete(&complete(0x0D, 0x0000, LINK_TYPE_ESCO));
        assert!(matches!(
            results.borrow()[0],
            Err(Error::ParametersRejected)
        ));
    }

    /// A failed completion with candidates remaining re-arms the responder
    /// without completing the caller.
    #[test]
    fn test_responder_fallback_rearms_on_failure() {
        let mut manager = manager();
        let (results, callback) = recorder();

        manager.accept_connection(
            vec![params_with(SCO_PACKET_EV3), params_with(SCO_PACKET_EV5)],
            callback,
        );

        manager.on_connection_request(&inbound_request(LINK_TYPE_ESCO));
        // Candidate 0 fails; the request stays alive on candidate 1.
        let commands =
            manager.on_synchronous_connection_complete(&complete(0x10, 0x0000, LINK_TYPE_ESCO));
        assert!(commands.is_empty());
        assert!(results.borrow().is_empty());

        // The next inbound request is accepted with candidate 1.
        let commands = manager.on_connection_request(&inbound_request(LINK_TYPE_ESCO));
        match &commands[0] {
            HciCommand::EnhancedAcceptSynchronousConnectionRequest { parameters, .. } => {
                assert_eq!(parameters.packet_types, SCO_PACKET_EV5);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        manager.on_synchronous_connection_complete(&complete(0x00, 0x42, LINK_TYPE_ESCO));
        let (_, index) = results.borrow()[0].clone().unwrap();
        assert_eq!(index, 1);
    }

    /// Queuing a new request cancels the queued one with Canceled.
    #[test]
    fn test_queued_request_preempted() {
        let mut manager = manager();
        let (first_results, first_callback) = recorder();
        let (second_results, second_callback) = recorder();
        let (third_results, third_callback) = recorder();

        // First request becomes in-progress (initiator).
        manager.open_connection(params_with(SCO_PACKET_EV3), first_callback);
        // Second queues behind it.
        manager.open_connection(params_with(SCO_PACKET_EV3), second_callback);
        // Third pre-empts the second.
        manager.open_connection(params_with(SCO_PACKET_EV3), third_callback);

        assert!(first_results.borrow().is_empty());
        assert_eq!(second_results.borrow().len(), 1);
        assert!(matches!(second_results.borrow()[0], Err(Error::Canceled)));
        assert!(third_results.borrow().is_empty());
    }

    /// An unexpected inbound request (initiator in progress) is rejected
    /// with the bad-address reason.
    #[test]
    fn test_unexpected_inbound_request_rejected() {
        let mut manager = manager();
        let (_, callback) = recorder();

        manager.open_connection(params_with(SCO_PACKET_EV3), callback);
        let commands = manager.on_connection_request(&inbound_request(LINK_TYPE_ESCO));
        assert_eq!(
            commands,
            vec![HciCommand::RejectSynchronousConnectionRequest {
                bd_addr: PEER_ADDR,
                reason: HCI_REJECT_BAD_BD_ADDR,
            }]
        );
    }

    #[test]
    fn test_cancel_queued_by_id() {
        let mut manager = manager();
        let (_, first_callback) = recorder();
        let (queued_results, queued_callback) = recorder();

        manager.open_connection(params_with(SCO_PACKET_EV3), first_callback);
        let (queued_id, _) = manager.open_connection(params_with(SCO_PACKET_EV3), queued_callback);

        manager.cancel(queued_id);
        assert_eq!(queued_results.borrow().len(), 1);
        assert!(matches!(queued_results.borrow()[0], Err(Error::Canceled)));
    }

    /// An in-progress responder request cancels by id only before an
    /// inbound request has been observed.
    #[test]
    fn test_cancel_in_progress_responder() {
        let mut manager = manager();
        let (results, callback) = recorder();

        let (id, _) = manager.accept_connection(vec![params_with(SCO_PACKET_EV3)], callback);
        manager.cancel(id);
        assert!(matches!(results.borrow()[0], Err(Error::Canceled)));

        // After the inbound request was accepted, cancel is deferred.
        let (results, callback) = recorder();
        let (id, _) = manager.accept_connection(vec![params_with(SCO_PACKET_EV3)], callback);
        manager.on_connection_request(&inbound_request(LINK_TYPE_ESCO));
        manager.cancel(id);
        assert!(results.borrow().is_empty());
    }

    /// Events for other peers are ignored entirely.
    #[test]
    fn test_other_peer_events_ignored() {
        let mut manager = manager();
        let (results, callback) = recorder();

        manager.open_connection(params_with(SCO_PACKET_EV3), callback);

        let mut params = complete(0x00, 0x41, LINK_TYPE_ESCO);
        params.bd_addr = [0xFF; 6];
        let commands = manager.on_synchronous_connection_complete(&params);
        assert!(commands.is_empty());
        assert!(results.borrow().is_empty());
    }
}
