//! BR/EDR connection manager
//!
//! Top-level dispatcher for the classic transport. Routes HCI events to the
//! per-link interrogator, pairing machine, and SCO manager, arbitrates the
//! single outbound Create Connection slot, enforces the post-disconnect
//! cooldown and the page-timeout retry window, and carries the scan policy
//! and registered service searches.

use crate::error::{Error, HciStatus, Result};
use crate::gap::connection::{ConnectCallback, Connection};
use crate::gap::interrogator::InterrogatorOutput;
use crate::gap::peer_cache::PeerCache;
use crate::gap::types::*;
use crate::hci::constants::*;
use crate::hci::events::*;
use crate::hci::{ConnectionHandle, HciCommand, HciTransport, SynchronousConnectionParameters};
use crate::l2cap::{ChannelCallback, ChannelFactory, ChannelParameters, Psm};
use crate::pairing::state::{Actions, PairingContext, PairingSignal, StatusCallback};
use crate::pairing::types::{SecurityMode, SecurityRequirements};
use crate::pairing::{PairingDelegate, PairingStateMachine, SecurityManager};
use crate::sco::{ScoCallback, ScoRequestId};
use crate::sdp::{ServiceDiscoverer, ServiceRecord, Uuid};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Window after a local API-requested disconnect during which inbound
/// connections from the same peer are rejected.
pub const LOCAL_DISCONNECT_COOLDOWN: Duration = Duration::from_secs(2);

/// Window from the first Create Connection attempt within which a
/// page-timeout completion is silently retried.
pub const PAGE_TIMEOUT_RETRY_WINDOW: Duration = Duration::from_secs(30);

/// Why a link is being torn down. Only an API request arms the cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ApiRequest,
    PairingFailed,
    InterrogationFailed,
    SecurityPolicy,
}

impl DisconnectReason {
    fn reason_code(self) -> u8 {
        match self {
            DisconnectReason::PairingFailed => 0x05, // authentication failure
            _ => 0x13,                               // remote user terminated
        }
    }
}

/// Identifier of a registered service search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchId(pub u64);

/// Long-lived service-search callback, invoked once per peer per non-empty
/// result set.
pub type ServiceSearchCallback = Box<dyn FnMut(PeerId, Vec<ServiceRecord>)>;

/// ACL data-channel surface consumed on link teardown. The per-handle
/// packet counts must stay allocated until Disconnection Complete so that
/// packets still in the controller do not starve other links.
pub trait AclDataChannel {
    fn clear_controller_packet_count(&mut self, handle: ConnectionHandle);
}

pub struct BrEdrConnectionManagerConfig {
    pub local_io_capability: crate::pairing::IoCapability,
    pub legacy_pairing_enabled: bool,
    pub secure_connections_supported: bool,
    pub interlaced_page_scan: bool,
    pub create_connection_timeout: Duration,
}

impl Default for BrEdrConnectionManagerConfig {
    fn default() -> Self {
        Self {
            local_io_capability: crate::pairing::IoCapability::NoInputNoOutput,
            legacy_pairing_enabled: false,
            secure_connections_supported: false,
            interlaced_page_scan: true,
            create_connection_timeout: Duration::from_secs(20),
        }
    }
}

struct OutboundRequest {
    address: BdAddr,
    callbacks: Vec<ConnectCallback>,
    first_attempt: Instant,
    deadline: Instant,
    cancel_sent: bool,
}

struct ServiceSearch {
    uuid: Uuid,
    attribute_ids: Vec<u16>,
    callback: ServiceSearchCallback,
}

/// Work that must run after the current borrow of per-link state ends.
enum Deferred {
    ChannelOpenAfterPairing {
        handle: ConnectionHandle,
        psm: Psm,
        parameters: ChannelParameters,
        callback: ChannelCallback,
        result: Result<()>,
    },
    SdpChannelOpened {
        peer_id: PeerId,
        channel: Option<crate::l2cap::L2capChannel>,
    },
    SearchResults {
        peer_id: PeerId,
        search_id: SearchId,
        uuid: Uuid,
        records: Vec<ServiceRecord>,
    },
    CtkdUnavailable {
        handle: ConnectionHandle,
    },
}

pub struct BrEdrConnectionManager<T: HciTransport> {
    transport: T,
    config: BrEdrConnectionManagerConfig,
    peer_cache: PeerCache,
    connections: HashMap<ConnectionHandle, Connection>,
    security_mode: SecurityMode,
    connectable: bool,
    pairing_delegate: Option<Box<dyn PairingDelegate>>,
    channel_factory: Box<dyn ChannelFactory>,
    service_discoverer: Box<dyn ServiceDiscoverer>,
    security_manager: Option<Box<dyn SecurityManager>>,
    acl_data_channel: Option<Box<dyn AclDataChannel>>,

    // Outbound connection arbitration: one Create Connection at a time.
    connection_requests: HashMap<PeerId, OutboundRequest>,
    request_order: VecDeque<PeerId>,
    active_request: Option<PeerId>,

    // Inbound accepts between Accept Connection Request and Connection
    // Complete, keyed by address.
    incoming_accepts: HashSet<BdAddr>,

    // Role Change events that raced ahead of Connection Complete.
    pending_role_changes: HashMap<BdAddr, ConnectionRole>,

    // Post-local-disconnect cooldowns: address -> expiry.
    cooldowns: HashMap<BdAddr, Instant>,

    // Scan-enable read-modify-write bookkeeping.
    pending_scan_changes: VecDeque<(bool, Option<Box<dyn FnOnce(Result<()>)>>)>,
    awaiting_scan_writes: VecDeque<(bool, Option<Box<dyn FnOnce(Result<()>)>>)>,

    searches: Vec<(SearchId, ServiceSearch)>,
    next_search_id: u64,

    deferred: Rc<RefCell<VecDeque<Deferred>>>,
}

impl<T: HciTransport> BrEdrConnectionManager<T> {
    pub fn new(
        transport: T,
        config: BrEdrConnectionManagerConfig,
        channel_factory: Box<dyn ChannelFactory>,
        service_discoverer: Box<dyn ServiceDiscoverer>,
    ) -> Self {
        let mut manager = Self {
            transport,
            config,
            peer_cache: PeerCache::new(),
            connections: HashMap::new(),
            security_mode: SecurityMode::default(),
            connectable: false,
            pairing_delegate: None,
            channel_factory,
            service_discoverer,
            security_manager: None,
            acl_data_channel: None,
            connection_requests: HashMap::new(),
            request_order: VecDeque::new(),
            active_request: None,
            incoming_accepts: HashSet::new(),
            pending_role_changes: HashMap::new(),
            cooldowns: HashMap::new(),
            pending_scan_changes: VecDeque::new(),
            awaiting_scan_writes: VecDeque::new(),
            searches: Vec::new(),
            next_search_id: 0,
            deferred: Rc::new(RefCell::new(VecDeque::new())),
        };

        // Controller defaults written once at startup.
        manager.send(HciCommand::WritePageTimeout {
            timeout: DEFAULT_PAGE_TIMEOUT,
        });
        manager.send(HciCommand::WritePinType {
            pin_type: PIN_TYPE_VARIABLE,
        });

        manager
    }

    pub fn peer_cache(&self) -> &PeerCache {
        &self.peer_cache
    }

    pub fn peer_cache_mut(&mut self) -> &mut PeerCache {
        &mut self.peer_cache
    }

    pub fn connectable(&self) -> bool {
        self.connectable
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    pub fn set_pairing_delegate(&mut self, delegate: Option<Box<dyn PairingDelegate>>) {
        self.pairing_delegate = delegate;
    }

    pub fn set_security_manager(&mut self, security_manager: Box<dyn SecurityManager>) {
        self.security_manager = Some(security_manager);
    }

    pub fn set_acl_data_channel(&mut self, acl_data_channel: Box<dyn AclDataChannel>) {
        self.acl_data_channel = Some(acl_data_channel);
    }

    pub fn is_connected(&self, peer_id: PeerId) -> bool {
        self.peer_cache
            .get(peer_id)
            .map_or(false, |peer| peer.connection_state != PeerConnectionState::NotConnected)
    }

    fn send(&mut self, command: HciCommand) {
        if let Err(error) = self.transport.send_command(command) {
            warn!("failed to send HCI command: {}", error);
        }
    }

    fn connection_by_peer_mut(&mut self, peer_id: PeerId) -> Option<&mut Connection> {
        self.connections
            .values_mut()
            .find(|connection| connection.peer_id == peer_id)
    }

    fn handle_for_peer(&self, peer_id: PeerId) -> Option<ConnectionHandle> {
        self.connections
            .values()
            .find(|connection| connection.peer_id == peer_id)
            .map(|connection| connection.handle)
    }

    fn handle_for_address(&self, address: BdAddr) -> Option<ConnectionHandle> {
        self.connections
            .values()
            .find(|connection| connection.address == address)
            .map(|connection| connection.handle)
    }

    // ------------------------------------------------------------------
    // Scan / connectable policy
    // ------------------------------------------------------------------

    /// Enable or disable page scanning. Disabling never touches the
    /// inquiry-scan bit.
    pub fn set_connectable(
        &mut self,
        enabled: bool,
        callback: Option<Box<dyn FnOnce(Result<()>)>>,
    ) {
        info!("setting connectable: {}", enabled);
        if enabled {
            self.send(HciCommand::WritePageScanActivity {
                interval: PAGE_SCAN_INTERVAL,
                window: PAGE_SCAN_WINDOW,
            });
            let scan_type = if self.config.interlaced_page_scan {
                PAGE_SCAN_TYPE_INTERLACED
            } else {
                PAGE_SCAN_TYPE_STANDARD
            };
            self.send(HciCommand::WritePageScanType { scan_type });
        }
        self.send(HciCommand::ReadScanEnable);
        self.pending_scan_changes.push_back((enabled, callback));
    }

    /// Strip the page-scan bit on the way out, regardless of current state.
    pub fn shutdown(&mut self) {
        self.send(HciCommand::ReadScanEnable);
        self.pending_scan_changes.push_back((false, None));
    }

    // ------------------------------------------------------------------
    // Outbound connections
    // ------------------------------------------------------------------

    pub fn connect(&mut self, peer_id: PeerId, callback: ConnectCallback) -> Result<()> {
        self.connect_at(peer_id, callback, Instant::now())
    }

    pub fn connect_at(
        &mut self,
        peer_id: PeerId,
        callback: ConnectCallback,
        now: Instant,
    ) -> Result<()> {
        let peer = self.peer_cache.get(peer_id).ok_or(Error::NotFound)?;
        if peer.technology == TechnologyType::LowEnergy {
            return Err(Error::NotSupported);
        }
        let address = peer.address;

        if let Some(connection) = self.connection_by_peer_mut(peer_id) {
            if connection.interrogator.is_finished() {
                let handle = connection.handle;
                callback(Ok(handle));
            } else {
                // Deferred until interrogation completes.
                connection.pending_connect_callbacks.push(callback);
            }
            return Ok(());
        }

        // An outbound attempt lifts any standing cooldown for this peer.
        self.cooldowns.remove(&address);

        if let Some(request) = self.connection_requests.get_mut(&peer_id) {
            request.callbacks.push(callback);
            return Ok(());
        }

        self.connection_requests.insert(
            peer_id,
            OutboundRequest {
                address,
                callbacks: vec![callback],
                first_attempt: now,
                deadline: now + self.config.create_connection_timeout,
                cancel_sent: false,
            },
        );
        self.request_order.push_back(peer_id);
        self.try_create_next_connection(now);
        Ok(())
    }

    fn try_create_next_connection(&mut self, now: Instant) {
        if self.active_request.is_some() {
            return;
        }

        let peer_id = loop {
            match self.request_order.pop_front() {
                None => return,
                Some(id) if self.connection_requests.contains_key(&id) => break id,
                Some(_) => continue,
            }
        };

        let (address, page_scan_repetition_mode, clock_offset) = {
            let request = self.connection_requests.get_mut(&peer_id).unwrap();
            request.deadline = now + self.config.create_connection_timeout;
            let peer = self.peer_cache.get(peer_id);
            (
                request.address,
                peer.and_then(|p| p.page_scan_repetition_mode)
                    .unwrap_or(PAGE_SCAN_REPETITION_R0),
                peer.and_then(|p| p.clock_offset).unwrap_or(0),
            )
        };

        info!("creating connection to {}", address);
        self.active_request = Some(peer_id);
        self.send(HciCommand::CreateConnection {
            bd_addr: address.bytes,
            packet_type: ACL_PACKET_TYPES,
            page_scan_repetition_mode,
            clock_offset,
            allow_role_switch: true,
        });
    }

    fn complete_connection_request(&mut self, peer_id: PeerId, result: Result<ConnectionHandle>) {
        if let Some(request) = self.connection_requests.remove(&peer_id) {
            for callback in request.callbacks {
                callback(result.clone());
            }
        }
        if self.active_request == Some(peer_id) {
            self.active_request = None;
        }
    }

    // ------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------

    pub fn disconnect(&mut self, peer_id: PeerId, reason: DisconnectReason) {
        self.disconnect_at(peer_id, reason, Instant::now())
    }

    /// Idempotent: unknown or already-disconnected peers succeed silently.
    /// The peer is marked not-connected before the controller confirms.
    pub fn disconnect_at(&mut self, peer_id: PeerId, reason: DisconnectReason, now: Instant) {
        let address = match self.peer_cache.get_mut(peer_id) {
            Some(peer) => {
                peer.connection_state = PeerConnectionState::NotConnected;
                peer.address
            }
            None => return,
        };

        if reason == DisconnectReason::ApiRequest {
            self.cooldowns
                .insert(address, now + LOCAL_DISCONNECT_COOLDOWN);
        } else {
            self.cooldowns.remove(&address);
        }

        let handle = match self.handle_for_peer(peer_id) {
            Some(handle) => handle,
            None => return,
        };

        info!("disconnecting peer {} ({:?})", peer_id, reason);
        self.send(HciCommand::Disconnect {
            handle,
            reason: reason.reason_code(),
        });
    }

    // ------------------------------------------------------------------
    // Pairing and channels
    // ------------------------------------------------------------------

    pub fn pair(
        &mut self,
        peer_id: PeerId,
        requirements: SecurityRequirements,
        callback: StatusCallback,
    ) {
        let handle = match self.handle_for_peer(peer_id) {
            Some(handle) => handle,
            None => {
                callback(Err(Error::NotFound));
                return;
            }
        };
        self.dispatch_pairing(handle, move |pairing, ctx| {
            pairing.initiate_pairing(requirements, callback, ctx)
        });
        self.process_deferred();
    }

    /// Open an L2CAP channel once the link satisfies `requirements`,
    /// pairing first if necessary. Failure delivers `None` without tearing
    /// the link down (unless the pairing failure itself demanded it).
    pub fn open_l2cap_channel(
        &mut self,
        peer_id: PeerId,
        psm: Psm,
        requirements: SecurityRequirements,
        parameters: ChannelParameters,
        callback: ChannelCallback,
    ) {
        let handle = match self.handle_for_peer(peer_id) {
            Some(handle) => handle,
            None => {
                callback(None);
                return;
            }
        };

        let deferred = self.deferred.clone();
        let pairing_callback: StatusCallback = Box::new(move |result| {
            deferred.borrow_mut().push_back(Deferred::ChannelOpenAfterPairing {
                handle,
                psm,
                parameters,
                callback,
                result,
            });
        });

        self.dispatch_pairing(handle, move |pairing, ctx| {
            pairing.initiate_pairing(requirements, pairing_callback, ctx)
        });
        self.process_deferred();
    }

    // ------------------------------------------------------------------
    // Service search
    // ------------------------------------------------------------------

    /// Register a long-lived search, run against every fresh connection
    /// after interrogation and again on reconnection.
    pub fn add_service_search(
        &mut self,
        uuid: Uuid,
        attribute_ids: Vec<u16>,
        callback: ServiceSearchCallback,
    ) -> SearchId {
        self.next_search_id += 1;
        let id = SearchId(self.next_search_id);
        self.searches.push((
            id,
            ServiceSearch {
                uuid,
                attribute_ids,
                callback,
            },
        ));
        id
    }

    pub fn remove_service_search(&mut self, id: SearchId) {
        self.searches.retain(|(search_id, _)| *search_id != id);
    }

    // ------------------------------------------------------------------
    // SCO
    // ------------------------------------------------------------------

    pub fn open_sco_connection(
        &mut self,
        peer_id: PeerId,
        parameters: SynchronousConnectionParameters,
        callback: ScoCallback,
    ) -> Result<ScoRequestId> {
        let connection = self.connection_by_peer_mut(peer_id).ok_or(Error::NotFound)?;
        let (id, commands) = connection.sco_manager().open_connection(parameters, callback);
        for command in commands {
            self.send(command);
        }
        Ok(id)
    }

    pub fn accept_sco_connection(
        &mut self,
        peer_id: PeerId,
        parameters: Vec<SynchronousConnectionParameters>,
        callback: ScoCallback,
    ) -> Result<ScoRequestId> {
        let connection = self.connection_by_peer_mut(peer_id).ok_or(Error::NotFound)?;
        let (id, commands) = connection.sco_manager().accept_connection(parameters, callback);
        for command in commands {
            self.send(command);
        }
        Ok(id)
    }

    pub fn cancel_sco_request(&mut self, peer_id: PeerId, id: ScoRequestId) {
        let commands = match self.connection_by_peer_mut(peer_id) {
            Some(connection) => match connection.sco.as_mut() {
                Some(sco) => sco.cancel(id),
                None => return,
            },
            None => return,
        };
        for command in commands {
            self.send(command);
        }
    }

    // ------------------------------------------------------------------
    // Security mode
    // ------------------------------------------------------------------

    /// Switching into Secure-Connections-Only disconnects every link whose
    /// key fails the mode; compliant links are untouched.
    pub fn set_security_mode(&mut self, mode: SecurityMode) {
        self.security_mode = mode;
        for connection in self.connections.values_mut() {
            connection.pairing.set_security_mode(mode);
        }

        if mode != SecurityMode::SecureConnectionsOnly {
            return;
        }

        let noncompliant: Vec<PeerId> = self
            .connections
            .values()
            .filter_map(|connection| {
                let key = self.peer_cache.get(connection.peer_id)?.link_key?;
                if !mode.allows_key_type(key.key_type) {
                    Some(connection.peer_id)
                } else {
                    None
                }
            })
            .collect();

        for peer_id in noncompliant {
            info!(
                "disconnecting peer {} not compliant with Secure Connections Only",
                peer_id
            );
            self.disconnect(peer_id, DisconnectReason::SecurityPolicy);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn process_timeouts(&mut self) {
        self.process_timeouts_at(Instant::now())
    }

    pub fn process_timeouts_at(&mut self, now: Instant) {
        if let Some(peer_id) = self.active_request {
            let (expired, address) = match self.connection_requests.get_mut(&peer_id) {
                Some(request) if now >= request.deadline && !request.cancel_sent => {
                    request.cancel_sent = true;
                    (true, request.address)
                }
                _ => (false, BdAddr::new([0; 6])),
            };
            if expired {
                info!("create connection timed out, canceling ({})", address);
                self.send(HciCommand::CreateConnectionCancel {
                    bd_addr: address.bytes,
                });
            }
        }

        self.cooldowns.retain(|_, expiry| now < *expiry);
        self.process_deferred();
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    /// Parse and dispatch a raw HCI event packet.
    pub fn handle_packet(&mut self, packet: &[u8]) {
        let raw = match HciEvent::parse(packet) {
            Some(raw) => raw,
            None => {
                warn!("dropping malformed HCI packet");
                return;
            }
        };
        match Event::parse(&raw) {
            Some(event) => self.handle_event(event),
            None => warn!(
                "dropping malformed HCI event (code: {:#04x})",
                raw.event_code
            ),
        }
    }

    pub fn handle_event(&mut self, event: Event) {
        self.handle_event_at(event, Instant::now())
    }

    pub fn handle_event_at(&mut self, event: Event, now: Instant) {
        match event {
            Event::ConnectionRequest(params) => self.on_connection_request(params, now),
            Event::ConnectionComplete(params) => self.on_connection_complete(params, now),
            Event::DisconnectionComplete(params) => self.on_disconnection_complete(params),
            Event::CommandStatus(params) => self.on_command_status(params, now),
            Event::CommandComplete(params) => self.on_command_complete(params),
            Event::RoleChange(params) => self.on_role_change(params),
            Event::RemoteNameRequestComplete(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_interrogation(handle, |interrogator, peer| {
                        interrogator.on_remote_name_complete(&params, peer)
                    });
                }
            }
            Event::ReadRemoteVersionInfoComplete(params) => {
                self.dispatch_interrogation(params.handle, |interrogator, peer| {
                    interrogator.on_remote_version_complete(&params, peer)
                });
            }
            Event::ReadRemoteSupportedFeaturesComplete(params) => {
                self.dispatch_interrogation(params.handle, |interrogator, peer| {
                    interrogator.on_remote_features_complete(&params, peer)
                });
            }
            Event::ReadRemoteExtendedFeaturesComplete(params) => {
                self.dispatch_interrogation(params.handle, |interrogator, peer| {
                    interrogator.on_remote_extended_features_complete(&params, peer)
                });
            }
            Event::AuthenticationComplete(params) => {
                self.dispatch_pairing(params.handle, |pairing, _| {
                    pairing.on_authentication_complete(params.status)
                });
            }
            Event::EncryptionChange(params) => {
                self.dispatch_pairing(params.handle, |pairing, _| {
                    pairing.on_encryption_change(params.status, params.encryption_enabled)
                });
            }
            Event::LinkKeyRequest(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_pairing(handle, |pairing, ctx| pairing.on_link_key_request(ctx));
                } else {
                    // No live link: nothing to authenticate against.
                    self.send(HciCommand::LinkKeyRequestNegativeReply {
                        bd_addr: params.bd_addr,
                    });
                }
            }
            Event::LinkKeyNotification(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_pairing(handle, |pairing, ctx| {
                        pairing.on_link_key_notification(params.link_key, params.key_type, ctx)
                    });
                }
            }
            Event::IoCapabilityRequest(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_pairing(handle, |pairing, ctx| {
                        pairing.on_io_capability_request(ctx)
                    });
                } else {
                    // No live link to pair on.
                    self.send(HciCommand::IoCapabilityRequestNegativeReply {
                        bd_addr: params.bd_addr,
                        reason: HciStatus::PairingNotAllowed.to_u8(),
                    });
                }
            }
            Event::IoCapabilityResponse(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_pairing(handle, |pairing, _| {
                        pairing.on_io_capability_response(params.io_capability)
                    });
                }
            }
            Event::UserConfirmationRequest(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_pairing(handle, |pairing, ctx| {
                        pairing.on_user_confirmation_request(params.numeric_value, ctx)
                    });
                }
            }
            Event::UserPasskeyRequest(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_pairing(handle, |pairing, ctx| {
                        pairing.on_user_passkey_request(ctx)
                    });
                }
            }
            Event::UserPasskeyNotification(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_pairing(handle, |pairing, ctx| {
                        pairing.on_user_passkey_notification(params.passkey, ctx)
                    });
                }
            }
            Event::SimplePairingComplete(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_pairing(handle, |pairing, _| {
                        pairing.on_simple_pairing_complete(params.status)
                    });
                }
            }
            Event::PinCodeRequest(params) => {
                if let Some(handle) = self.handle_for_address(BdAddr::new(params.bd_addr)) {
                    self.dispatch_pairing(handle, |pairing, ctx| pairing.on_pin_code_request(ctx));
                } else {
                    self.send(HciCommand::PinCodeRequestNegativeReply {
                        bd_addr: params.bd_addr,
                    });
                }
            }
            Event::SynchronousConnectionComplete(params) => {
                let commands = match self
                    .handle_for_address(BdAddr::new(params.bd_addr))
                    .and_then(|handle| self.connections.get_mut(&handle))
                {
                    Some(connection) => match connection.sco.as_mut() {
                        Some(sco) => sco.on_synchronous_connection_complete(&params),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                };
                for command in commands {
                    self.send(command);
                }
            }
            Event::Unhandled(code) => {
                debug!("ignoring event {:#04x}", code);
            }
        }
        self.process_deferred();
    }

    // ------------------------------------------------------------------
    // Inbound connections
    // ------------------------------------------------------------------

    fn on_connection_request(&mut self, params: ConnectionRequestParams, now: Instant) {
        let address = BdAddr::new(params.bd_addr);

        if params.link_type != LINK_TYPE_ACL {
            // Synchronous connection requests belong to the link's SCO
            // manager; without one there is nothing to accept.
            let commands = match self
                .handle_for_address(address)
                .and_then(|handle| self.connections.get_mut(&handle))
            {
                Some(connection) => match connection.sco.as_mut() {
                    Some(sco) => sco.on_connection_request(&params),
                    None => vec![HciCommand::RejectSynchronousConnectionRequest {
                        bd_addr: params.bd_addr,
                        reason: HciStatus::ConnectionRejectedBadBdAddr.to_u8(),
                    }],
                },
                None => vec![HciCommand::RejectSynchronousConnectionRequest {
                    bd_addr: params.bd_addr,
                    reason: HciStatus::ConnectionRejectedBadBdAddr.to_u8(),
                }],
            };
            for command in commands {
                self.send(command);
            }
            return;
        }

        let in_cooldown = self
            .cooldowns
            .get(&address)
            .map_or(false, |expiry| now < *expiry);
        let outbound_intent = self
            .peer_cache
            .peer_id_for_address(address)
            .map_or(false, |id| self.connection_requests.contains_key(&id));

        if in_cooldown && !outbound_intent {
            info!("rejecting connection from {} during cooldown", address);
            self.send(HciCommand::RejectConnectionRequest {
                bd_addr: params.bd_addr,
                reason: HciStatus::ConnectionRejectedBadBdAddr.to_u8(),
            });
            return;
        }

        if self.incoming_accepts.contains(&address) {
            info!("rejecting duplicate connection request from {}", address);
            self.send(HciCommand::RejectConnectionRequest {
                bd_addr: params.bd_addr,
                reason: HciStatus::ConnectionRejectedLimitedResources.to_u8(),
            });
            return;
        }

        info!("accepting incoming connection from {}", address);
        self.incoming_accepts.insert(address);
        self.peer_cache
            .insert_or_update(address, TechnologyType::Classic);
        self.send(HciCommand::AcceptConnectionRequest {
            bd_addr: params.bd_addr,
            role: ROLE_PERIPHERAL,
        });
    }

    fn on_connection_complete(&mut self, params: ConnectionCompleteParams, now: Instant) {
        if params.link_type != LINK_TYPE_ACL {
            debug!("ignoring non-ACL connection complete");
            return;
        }

        let address = BdAddr::new(params.bd_addr);
        let was_incoming = self.incoming_accepts.remove(&address);
        let status = HciStatus::from_u8(params.status);
        let peer_id = self.peer_cache.peer_id_for_address(address);

        if !status.is_success() {
            self.on_connection_complete_failure(address, peer_id, status, now);
            return;
        }

        let peer_id = self
            .peer_cache
            .insert_or_update(address, TechnologyType::Classic);

        let role = match self.pending_role_changes.remove(&address) {
            Some(role) => role,
            None if was_incoming => ConnectionRole::Peripheral,
            None => ConnectionRole::Central,
        };

        info!(
            "connection established (peer: {}, handle: {:#06x}, role: {:?})",
            peer_id, params.handle, role
        );

        let outgoing = !was_incoming;
        let pairing = PairingStateMachine::new(
            peer_id,
            params.handle,
            address,
            role,
            outgoing,
            self.config.local_io_capability,
            self.config.legacy_pairing_enabled,
            self.config.secure_connections_supported,
            self.security_mode,
        );
        let mut connection = Connection::new(params.handle, peer_id, address, role, pairing);

        // An outbound request for this peer is satisfied by this link,
        // whichever path produced it; its callbacks wait on interrogation.
        if let Some(request) = self.connection_requests.remove(&peer_id) {
            connection
                .pending_connect_callbacks
                .extend(request.callbacks);
        }
        if self.active_request == Some(peer_id) {
            self.active_request = None;
        }

        let peer = self.peer_cache.get_mut(peer_id).unwrap();
        peer.connection_state = PeerConnectionState::Initializing;

        let output = connection.interrogator.start(peer);
        self.connections.insert(params.handle, connection);

        for command in output.commands {
            self.send(command);
        }
        if let Some(result) = output.completed {
            self.on_interrogation_complete(params.handle, result);
        }

        self.try_create_next_connection(now);
    }

    fn on_connection_complete_failure(
        &mut self,
        address: BdAddr,
        peer_id: Option<PeerId>,
        status: HciStatus,
        now: Instant,
    ) {
        if let Some(peer_id) = peer_id {
            let has_request = self.connection_requests.contains_key(&peer_id);
            if has_request {
                if status == HciStatus::PageTimeout {
                    let within_window = self
                        .connection_requests
                        .get(&peer_id)
                        .map_or(false, |request| {
                            now.duration_since(request.first_attempt) < PAGE_TIMEOUT_RETRY_WINDOW
                                && !request.cancel_sent
                        });
                    if within_window {
                        info!("page timeout for {}, retrying", address);
                        let (psr, clock_offset) = {
                            let request = self.connection_requests.get_mut(&peer_id).unwrap();
                            request.deadline = now + self.config.create_connection_timeout;
                            let peer = self.peer_cache.get(peer_id);
                            (
                                peer.and_then(|p| p.page_scan_repetition_mode)
                                    .unwrap_or(PAGE_SCAN_REPETITION_R0),
                                peer.and_then(|p| p.clock_offset).unwrap_or(0),
                            )
                        };
                        self.send(HciCommand::CreateConnection {
                            bd_addr: address.bytes,
                            packet_type: ACL_PACKET_TYPES,
                            page_scan_repetition_mode: psr,
                            clock_offset,
                            allow_role_switch: true,
                        });
                        return;
                    }
                }

                let cancel_sent = self
                    .connection_requests
                    .get(&peer_id)
                    .map_or(false, |request| request.cancel_sent);
                let error = if cancel_sent && status == HciStatus::UnknownConnectionId {
                    Error::TimedOut
                } else {
                    Error::from(status)
                };
                warn!("connection to {} failed: {}", address, error);
                self.complete_connection_request(peer_id, Err(error));
            }

            if let Some(peer) = self.peer_cache.get_mut(peer_id) {
                peer.connection_state = PeerConnectionState::NotConnected;
            }
        }

        self.try_create_next_connection(now);
    }

    fn on_disconnection_complete(&mut self, params: DisconnectionCompleteParams) {
        let mut connection = match self.connections.remove(&params.handle) {
            Some(connection) => connection,
            None => return,
        };

        info!(
            "disconnection complete (handle: {:#06x}, reason: {:#04x})",
            params.handle, params.reason
        );

        connection.teardown();

        if let Some(peer) = self.peer_cache.get_mut(connection.peer_id) {
            peer.connection_state = PeerConnectionState::NotConnected;
        }

        // The controller has flushed the link's packets; only now may the
        // shared buffer credits be returned.
        if let Some(acl) = self.acl_data_channel.as_mut() {
            acl.clear_controller_packet_count(params.handle);
        }
    }

    fn on_command_status(&mut self, params: CommandStatusParams, now: Instant) {
        let status = HciStatus::from_u8(params.status);
        if status.is_success() {
            return;
        }

        if params.opcode == opcode(OGF_LINK_CTL, OCF_CREATE_CONNECTION) {
            let peer_id = match self.active_request {
                Some(peer_id) => peer_id,
                None => return,
            };

            if status == HciStatus::ConnectionAlreadyExists {
                // An inbound connection to the same peer is racing us; its
                // Connection Complete will satisfy this request.
                debug!("create connection raced an inbound connection");
                self.active_request = None;
                self.try_create_next_connection(now);
                return;
            }

            self.complete_connection_request(peer_id, Err(Error::from(status)));
            self.try_create_next_connection(now);
        } else {
            debug!(
                "command {:#06x} failed with status {:#04x}",
                params.opcode, params.status
            );
        }
    }

    fn on_command_complete(&mut self, params: CommandCompleteParams) {
        if params.opcode == opcode(OGF_HOST_CTL, OCF_READ_SCAN_ENABLE) {
            let (enabled, callback) = match self.pending_scan_changes.pop_front() {
                Some(pending) => pending,
                None => return,
            };
            let (status, current) = match params.scan_enable() {
                Some(values) => values,
                None => return,
            };
            if !HciStatus::from_u8(status).is_success() {
                if let Some(callback) = callback {
                    callback(Err(Error::from(HciStatus::from_u8(status))));
                }
                return;
            }
            let scan_enable = if enabled {
                current | SCAN_ENABLE_PAGE
            } else {
                current & !SCAN_ENABLE_PAGE
            };
            self.send(HciCommand::WriteScanEnable { scan_enable });
            self.awaiting_scan_writes.push_back((enabled, callback));
        } else if params.opcode == opcode(OGF_HOST_CTL, OCF_WRITE_SCAN_ENABLE) {
            let (enabled, callback) = match self.awaiting_scan_writes.pop_front() {
                Some(pending) => pending,
                None => return,
            };
            let status = HciStatus::from_u8(params.status().unwrap_or(0));
            if status.is_success() {
                self.connectable = enabled;
                if let Some(callback) = callback {
                    callback(Ok(()));
                }
            } else if let Some(callback) = callback {
                callback(Err(Error::from(status)));
            }
        } else if params.opcode == opcode(OGF_STATUS_PARAM, OCF_READ_ENCRYPTION_KEY_SIZE) {
            if let Some((status, handle, key_size)) = params.encryption_key_size() {
                self.dispatch_pairing(handle, move |pairing, ctx| {
                    pairing.on_encryption_key_size(status, key_size, ctx)
                });
            }
        }
    }

    fn on_role_change(&mut self, params: RoleChangeParams) {
        // Only successful role changes are adopted.
        if !HciStatus::from_u8(params.status).is_success() {
            return;
        }
        let role = match ConnectionRole::from_u8(params.role) {
            Some(role) => role,
            None => return,
        };
        let address = BdAddr::new(params.bd_addr);

        match self.handle_for_address(address) {
            Some(handle) => {
                let connection = self.connections.get_mut(&handle).unwrap();
                debug!("role change on {}: {:?}", address, role);
                connection.role = role;
                connection.pairing.set_role(role);
            }
            None => {
                // Between Accept Connection Request and Connection
                // Complete; applied when the link record is created.
                self.pending_role_changes.insert(address, role);
            }
        }
    }

    // ------------------------------------------------------------------
    // Per-link dispatch helpers
    // ------------------------------------------------------------------

    fn dispatch_interrogation<F>(&mut self, handle: ConnectionHandle, f: F)
    where
        F: FnOnce(&mut crate::gap::interrogator::Interrogator, &mut PeerRecord) -> InterrogatorOutput,
    {
        let output = {
            let connection = match self.connections.get_mut(&handle) {
                Some(connection) => connection,
                None => return,
            };
            let peer = match self.peer_cache.get_mut(connection.peer_id) {
                Some(peer) => peer,
                None => return,
            };
            f(&mut connection.interrogator, peer)
        };

        for command in output.commands {
            self.send(command);
        }
        if let Some(result) = output.completed {
            self.on_interrogation_complete(handle, result);
        }
    }

    fn on_interrogation_complete(&mut self, handle: ConnectionHandle, result: Result<()>) {
        let (peer_id, callbacks) = {
            let connection = match self.connections.get_mut(&handle) {
                Some(connection) => connection,
                None => return,
            };
            (
                connection.peer_id,
                std::mem::take(&mut connection.pending_connect_callbacks),
            )
        };

        match result {
            Ok(()) => {
                if let Some(peer) = self.peer_cache.get_mut(peer_id) {
                    peer.connection_state = PeerConnectionState::Connected;
                }
                for callback in callbacks {
                    callback(Ok(handle));
                }
                self.start_service_searches(handle, peer_id);
            }
            Err(error) => {
                warn!("interrogation failed for peer {}: {}", peer_id, error);
                for callback in callbacks {
                    callback(Err(error.clone()));
                }
                self.disconnect(peer_id, DisconnectReason::InterrogationFailed);
            }
        }
    }

    /// Open one SDP channel and run every registered search over it.
    fn start_service_searches(&mut self, handle: ConnectionHandle, peer_id: PeerId) {
        if self.searches.is_empty() {
            return;
        }

        let deferred = self.deferred.clone();
        self.channel_factory.open_channel(
            handle,
            Psm::Sdp,
            ChannelParameters::default(),
            Box::new(move |channel| {
                deferred
                    .borrow_mut()
                    .push_back(Deferred::SdpChannelOpened { peer_id, channel });
            }),
        );
    }

    fn dispatch_pairing<F>(&mut self, handle: ConnectionHandle, f: F)
    where
        F: FnOnce(&mut PairingStateMachine, &mut PairingContext<'_>) -> Actions,
    {
        let (actions, peer_id) = {
            let connection = match self.connections.get_mut(&handle) {
                Some(connection) => connection,
                None => return,
            };
            let peer_id = connection.peer_id;
            let peer = match self.peer_cache.get_mut(peer_id) {
                Some(peer) => peer,
                None => return,
            };
            let mut ctx = PairingContext {
                peer,
                delegate: self
                    .pairing_delegate
                    .as_deref_mut()
                    .map(|delegate| delegate as &mut dyn PairingDelegate),
                le_pairing_in_progress: false,
            };
            (f(&mut connection.pairing, &mut ctx), peer_id)
        };

        self.process_pairing_actions(handle, peer_id, actions);
    }

    fn process_pairing_actions(
        &mut self,
        handle: ConnectionHandle,
        peer_id: PeerId,
        actions: Actions,
    ) {
        for command in actions.commands {
            self.send(command);
        }

        if actions.start_ctkd {
            match self.security_manager.as_mut() {
                Some(security_manager) => {
                    security_manager.start_cross_transport_key_derivation(peer_id)
                }
                None => {
                    self.deferred
                        .borrow_mut()
                        .push_back(Deferred::CtkdUnavailable { handle });
                }
            }
        }

        match actions.signal {
            Some(PairingSignal::Complete(properties)) => {
                if let Some(peer) = self.peer_cache.get_mut(peer_id) {
                    peer.bonding_state = PeerBondingState::Bonded;
                    peer.connection_state = PeerConnectionState::Connected;
                }
                if let Some(connection) = self.connections.get_mut(&handle) {
                    connection.encryption_status = if properties.secure_connections {
                        crate::pairing::EncryptionStatus::OnAesCcm
                    } else {
                        crate::pairing::EncryptionStatus::On
                    };
                }
            }
            Some(PairingSignal::Failure(error)) => {
                warn!("pairing failed for peer {}: {}", peer_id, error);
                self.disconnect(peer_id, DisconnectReason::PairingFailed);
            }
            None => {}
        }
    }

    /// Cross-transport key derivation finished; forward to the link.
    pub fn on_cross_transport_key_derivation_complete(
        &mut self,
        peer_id: PeerId,
        result: Result<()>,
    ) {
        if let Some(handle) = self.handle_for_peer(peer_id) {
            self.dispatch_pairing(handle, move |pairing, ctx| {
                pairing.on_cross_transport_key_derivation_complete(result, ctx)
            });
        }
        self.process_deferred();
    }

    /// The LE Security Manager finished a pairing that was blocking SSP on
    /// this peer.
    pub fn on_le_pairing_complete(&mut self, peer_id: PeerId) {
        if let Some(handle) = self.handle_for_peer(peer_id) {
            self.dispatch_pairing(handle, |pairing, _| pairing.on_le_pairing_complete());
        }
        self.process_deferred();
    }

    // ------------------------------------------------------------------
    // Deferred work
    // ------------------------------------------------------------------

    fn process_deferred(&mut self) {
        loop {
            let item = self.deferred.borrow_mut().pop_front();
            let item = match item {
                Some(item) => item,
                None => break,
            };

            match item {
                Deferred::ChannelOpenAfterPairing {
                    handle,
                    psm,
                    parameters,
                    callback,
                    result,
                } => match result {
                    Ok(()) if self.connections.contains_key(&handle) => {
                        self.channel_factory
                            .open_channel(handle, psm, parameters, callback);
                    }
                    _ => callback(None),
                },
                Deferred::SdpChannelOpened { peer_id, channel } => {
                    let channel = match channel {
                        Some(channel) => channel,
                        None => {
                            // Logged and retried on the next connection.
                            warn!("SDP channel open failed for peer {}", peer_id);
                            continue;
                        }
                    };
                    let searches: Vec<(SearchId, Uuid, Vec<u16>)> = self
                        .searches
                        .iter()
                        .map(|(id, search)| (*id, search.uuid, search.attribute_ids.clone()))
                        .collect();
                    for (search_id, uuid, attribute_ids) in searches {
                        let deferred = self.deferred.clone();
                        self.service_discoverer.search(
                            channel,
                            uuid,
                            &attribute_ids,
                            Box::new(move |records| {
                                deferred.borrow_mut().push_back(Deferred::SearchResults {
                                    peer_id,
                                    search_id,
                                    uuid,
                                    records,
                                });
                            }),
                        );
                    }
                }
                Deferred::SearchResults {
                    peer_id,
                    search_id,
                    uuid,
                    records,
                } => {
                    if records.is_empty() {
                        continue;
                    }
                    if let Some(peer) = self.peer_cache.get_mut(peer_id) {
                        peer.merge_services(uuid, records.clone());
                    }
                    if let Some((_, search)) = self
                        .searches
                        .iter_mut()
                        .find(|(id, _)| *id == search_id)
                    {
                        (search.callback)(peer_id, records);
                    }
                }
                Deferred::CtkdUnavailable { handle } => {
                    self.dispatch_pairing(handle, |pairing, ctx| {
                        pairing.on_cross_transport_key_derivation_complete(
                            Err(Error::NotSupported),
                            ctx,
                        )
                    });
                }
            }
        }
    }
}
