//! Per-link pairing state machine
//!
//! Drives the initiator and responder HCI sequences for Secure Simple
//! Pairing and Legacy Pairing, tracks the link's security properties, and
//! completes queued pairing requests as their required security levels are
//! attained. Event hooks return the HCI commands to send plus an optional
//! signal for the owning connection manager; all side effects on the peer
//! record flow through the borrowed `PairingContext`.

use crate::error::{Error, HciStatus, Result};
use crate::gap::types::{BdAddr, ConnectionRole, PeerId, PeerRecord};
use crate::hci::constants::*;
use crate::hci::{ConnectionHandle, HciCommand};
use crate::pairing::actions::*;
use crate::pairing::delegate::{DisplayMethod, PairingDelegate};
use crate::pairing::types::*;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::VecDeque;

/// Minimum acceptable encryption key size reported by the controller.
const MIN_ENCRYPTION_KEY_SIZE: u8 = 16;

/// Callback completing one pairing request.
pub type StatusCallback = Box<dyn FnOnce(Result<()>)>;

/// States of the pairing machine. `Failed` and `Idle` are terminal;
/// `Failed` waits for link teardown, `Idle` follows successful completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    /// Wait for the peer's IO Capability Response, a Link Key Request, or a
    /// locally-initiated pairing.
    Idle,
    /// As initiator, wait for an in-flight LE pairing to finish first.
    InitiatorWaitLePairingComplete,
    /// As initiator, wait for Link Key Request.
    InitiatorWaitLinkKeyRequest,
    /// As initiator, wait for IO Capability Request.
    InitiatorWaitIoCapRequest,
    /// Wait for the peer's IO Capability Response.
    InitiatorWaitIoCapResponse,
    /// As responder, wait for IO Capability Request.
    ResponderWaitIoCapRequest,
    /// Wait for the user event selected by the association model.
    WaitUserConfirmationRequest,
    WaitUserPasskeyRequest,
    WaitUserPasskeyNotification,
    /// Wait for Simple Pairing Complete.
    WaitPairingComplete,
    /// Wait for Link Key Notification.
    WaitLinkKey,
    /// As initiator, wait for Authentication Complete.
    InitiatorWaitAuthComplete,
    /// Wait for Encryption Change and the key-size read that follows it.
    WaitEncryption,
    /// Wait for cross-transport key derivation over SMP (central only).
    WaitCrossTransportKeyDerivation,
    /// Error occurred; wait for link closure and ignore further events.
    Failed,
}

/// Signals delivered alongside outgoing commands.
#[derive(Debug, PartialEq, Eq)]
pub enum PairingSignal {
    /// Pairing reached an encrypted steady state with these properties.
    Complete(SecurityProperties),
    /// The machine entered `Failed`; the owner must disconnect the link.
    Failure(Error),
}

/// Output of one state transition.
#[derive(Default)]
pub struct Actions {
    pub commands: Vec<HciCommand>,
    pub signal: Option<PairingSignal>,
    /// True when the owner should start cross-transport key derivation.
    pub start_ctkd: bool,
}

impl Actions {
    fn none() -> Self {
        Actions::default()
    }

    fn command(command: HciCommand) -> Self {
        Actions {
            commands: vec![command],
            ..Default::default()
        }
    }
}

/// Collaborators borrowed for the duration of one event.
pub struct PairingContext<'a> {
    pub peer: &'a mut PeerRecord,
    pub delegate: Option<&'a mut dyn PairingDelegate>,
    /// True when the LE Security Manager reports a pairing in flight for
    /// this peer; SSP waits for it to finish before starting.
    pub le_pairing_in_progress: bool,
}

struct PairingRequest {
    requirements: SecurityRequirements,
    callback: StatusCallback,
}

/// Data for the pairing procedure currently in flight.
struct CurrentPairing {
    initiator: bool,
    /// Automatic ("just works") confirmation is only allowed for outgoing
    /// connections that are not re-pairing after a lost key.
    allow_automatic: bool,
    peer_iocap: Option<IoCapability>,
    action: Option<PairingAction>,
    expected_event: Option<u8>,
    authenticated: bool,
    /// Properties of the link key obtained (or about to be re-used).
    key_properties: Option<SecurityProperties>,
    preferred: SecurityRequirements,
}

impl CurrentPairing {
    fn initiator(preferred: SecurityRequirements, allow_automatic: bool) -> Self {
        Self {
            initiator: true,
            allow_automatic,
            peer_iocap: None,
            action: None,
            expected_event: None,
            authenticated: false,
            key_properties: None,
            preferred,
        }
    }

    fn responder(peer_iocap: Option<IoCapability>) -> Self {
        Self {
            initiator: false,
            allow_automatic: false,
            peer_iocap,
            action: None,
            expected_event: None,
            authenticated: false,
            key_properties: None,
            preferred: SecurityRequirements::default(),
        }
    }

    fn responder_for_bonded(key_properties: SecurityProperties) -> Self {
        Self {
            key_properties: Some(key_properties),
            ..Self::responder(None)
        }
    }
}

pub struct PairingStateMachine {
    peer_id: PeerId,
    handle: ConnectionHandle,
    address: BdAddr,
    local_iocap: IoCapability,
    role: ConnectionRole,
    outgoing_connection: bool,
    legacy_pairing_enabled: bool,
    local_secure_connections_supported: bool,
    security_mode: SecurityMode,
    state: PairingState,
    current: Option<CurrentPairing>,
    requests: VecDeque<PairingRequest>,
    properties: SecurityProperties,
    /// Set when the peer reported our cached key missing; forces re-pairing.
    peer_missing_key: bool,
    /// Set when we replied to the last Link Key Request with a cached key.
    replied_with_cached_key: bool,
}

impl PairingStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_id: PeerId,
        handle: ConnectionHandle,
        address: BdAddr,
        role: ConnectionRole,
        outgoing_connection: bool,
        local_iocap: IoCapability,
        legacy_pairing_enabled: bool,
        local_secure_connections_supported: bool,
        security_mode: SecurityMode,
    ) -> Self {
        Self {
            peer_id,
            handle,
            address,
            local_iocap,
            role,
            outgoing_connection,
            legacy_pairing_enabled,
            local_secure_connections_supported,
            security_mode,
            state: PairingState::Idle,
            current: None,
            requests: VecDeque::new(),
            properties: SecurityProperties::default(),
            peer_missing_key: false,
            replied_with_cached_key: false,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn security_properties(&self) -> SecurityProperties {
        self.properties
    }

    pub fn is_pairing(&self) -> bool {
        self.current.is_some()
    }

    pub fn set_role(&mut self, role: ConnectionRole) {
        self.role = role;
    }

    /// Takes effect on the next pairing; live links are gated by the owner.
    pub fn set_security_mode(&mut self, mode: SecurityMode) {
        self.security_mode = mode;
    }

    /// Start (or queue) a pairing toward `requirements`. If the link
    /// already satisfies them the callback runs immediately with success
    /// and no HCI traffic is generated.
    pub fn initiate_pairing(
        &mut self,
        requirements: SecurityRequirements,
        callback: StatusCallback,
        ctx: &mut PairingContext<'_>,
    ) -> Actions {
        if self.properties.satisfies(&requirements) {
            callback(Ok(()));
            return Actions::none();
        }

        if self.state == PairingState::Failed {
            callback(Err(Error::Failed));
            return Actions::none();
        }

        if ctx.delegate.is_none() {
            callback(Err(Error::NotReady));
            return Actions::none();
        }

        self.requests.push_back(PairingRequest {
            requirements,
            callback,
        });

        if self.state != PairingState::Idle {
            // A pairing is already running; the request rides along and is
            // completed once its requirements are satisfied.
            return Actions::none();
        }

        self.start_initiator_pairing(requirements, ctx)
    }

    fn start_initiator_pairing(
        &mut self,
        preferred: SecurityRequirements,
        ctx: &PairingContext<'_>,
    ) -> Actions {
        let allow_automatic = self.outgoing_connection && !self.peer_missing_key;
        self.current = Some(CurrentPairing::initiator(preferred, allow_automatic));

        if ctx.le_pairing_in_progress {
            debug!(
                "deferring pairing until LE pairing completes (peer: {})",
                self.peer_id
            );
            self.state = PairingState::InitiatorWaitLePairingComplete;
            return Actions::none();
        }

        info!("initiating authentication (peer: {})", self.peer_id);
        self.state = PairingState::InitiatorWaitLinkKeyRequest;
        Actions::command(HciCommand::AuthenticationRequested {
            handle: self.handle,
        })
    }

    /// The in-flight LE pairing finished; proceed with authentication.
    pub fn on_le_pairing_complete(&mut self) -> Actions {
        if self.state != PairingState::InitiatorWaitLePairingComplete {
            return Actions::none();
        }
        self.state = PairingState::InitiatorWaitLinkKeyRequest;
        Actions::command(HciCommand::AuthenticationRequested {
            handle: self.handle,
        })
    }

    pub fn on_link_key_request(&mut self, ctx: &mut PairingContext<'_>) -> Actions {
        match self.state {
            PairingState::Idle => {
                // Peer-initiated. Reply with the bonded key if we have one
                // the current mode accepts; otherwise force pairing.
                match ctx.peer.link_key {
                    Some(key)
                        if self.security_mode.allows_key_type(key.key_type)
                            && !self.peer_missing_key =>
                    {
                        self.current = Some(CurrentPairing::responder_for_bonded(
                            SecurityProperties::from_key_type(key.key_type),
                        ));
                        self.state = PairingState::WaitEncryption;
                        self.replied_with_cached_key = true;
                        Actions::command(HciCommand::LinkKeyRequestReply {
                            bd_addr: self.address.bytes,
                            link_key: key.value,
                        })
                    }
                    _ => {
                        // Default to assuming the peer will run SSP.
                        Actions::command(HciCommand::LinkKeyRequestNegativeReply {
                            bd_addr: self.address.bytes,
                        })
                    }
                }
            }
            PairingState::InitiatorWaitLinkKeyRequest => match ctx.peer.link_key {
                Some(key)
                    if self.security_mode.allows_key_type(key.key_type)
                        && !self.peer_missing_key
                        && self.key_type_sufficient(key.key_type) =>
                {
                    if let Some(current) = self.current.as_mut() {
                        current.key_properties =
                            Some(SecurityProperties::from_key_type(key.key_type));
                    }
                    self.replied_with_cached_key = true;
                    self.state = PairingState::InitiatorWaitAuthComplete;
                    Actions::command(HciCommand::LinkKeyRequestReply {
                        bd_addr: self.address.bytes,
                        link_key: key.value,
                    })
                }
                _ => {
                    self.replied_with_cached_key = false;
                    self.state = PairingState::InitiatorWaitIoCapRequest;
                    Actions::command(HciCommand::LinkKeyRequestNegativeReply {
                        bd_addr: self.address.bytes,
                    })
                }
            },
            _ => self.fail_with_unexpected_event("link key request"),
        }
    }

    /// True when a cached key of `key_type` is strong enough for the
    /// pairing request that triggered the current procedure.
    fn key_type_sufficient(&self, key_type: LinkKeyType) -> bool {
        let preferred = self
            .current
            .as_ref()
            .map(|current| current.preferred)
            .unwrap_or_default();
        (!preferred.authentication || key_type.authenticated())
            && (!preferred.secure_connections || key_type.secure_connections())
    }

    pub fn on_io_capability_request(&mut self, ctx: &mut PairingContext<'_>) -> Actions {
        match self.state {
            PairingState::InitiatorWaitIoCapRequest => {
                self.state = PairingState::InitiatorWaitIoCapResponse;
                Actions::command(HciCommand::IoCapabilityRequestReply {
                    bd_addr: self.address.bytes,
                    io_capability: self.local_iocap.to_u8(),
                    oob_data_present: 0x00,
                    authentication_requirements: initiator_authentication_requirements(
                        self.local_iocap,
                    )
                    .to_u8(),
                })
            }
            PairingState::ResponderWaitIoCapRequest => {
                let peer_iocap = match self.current.as_ref().and_then(|c| c.peer_iocap) {
                    Some(cap) => cap,
                    None => return self.fail_with_unexpected_event("io capability request"),
                };
                self.compute_pairing_data();
                let auth_req =
                    responder_authentication_requirements(self.local_iocap, peer_iocap);
                self.state = self.state_for_expected_event();
                Actions::command(HciCommand::IoCapabilityRequestReply {
                    bd_addr: self.address.bytes,
                    io_capability: self.local_iocap.to_u8(),
                    oob_data_present: 0x00,
                    authentication_requirements: auth_req.to_u8(),
                })
            }
            PairingState::Idle => {
                // Peer-initiated pairing where the controller asked us
                // before relaying the peer's capabilities.
                self.current = Some(CurrentPairing::responder(None));
                self.state = PairingState::InitiatorWaitIoCapResponse;
                Actions::command(HciCommand::IoCapabilityRequestReply {
                    bd_addr: self.address.bytes,
                    io_capability: self.local_iocap.to_u8(),
                    oob_data_present: 0x00,
                    authentication_requirements: initiator_authentication_requirements(
                        self.local_iocap,
                    )
                    .to_u8(),
                })
            }
            _ => self.fail_with_unexpected_event("io capability request"),
        }
    }

    pub fn on_io_capability_response(&mut self, peer_iocap: u8) -> Actions {
        let peer_iocap = match IoCapability::from_u8(peer_iocap) {
            Some(cap) => cap,
            None => return self.fail_with(Error::InvalidParameters, "io capability response"),
        };

        match self.state {
            PairingState::Idle => {
                self.current = Some(CurrentPairing::responder(Some(peer_iocap)));
                self.state = PairingState::ResponderWaitIoCapRequest;
                Actions::none()
            }
            PairingState::InitiatorWaitIoCapResponse => {
                if let Some(current) = self.current.as_mut() {
                    current.peer_iocap = Some(peer_iocap);
                }
                self.compute_pairing_data();
                self.state = self.state_for_expected_event();
                Actions::none()
            }
            _ => self.fail_with_unexpected_event("io capability response"),
        }
    }

    /// Fill in the action, expected event, and authenticated bit once both
    /// capabilities are known.
    fn compute_pairing_data(&mut self) {
        let local = self.local_iocap;
        if let Some(current) = self.current.as_mut() {
            let peer = match current.peer_iocap {
                Some(cap) => cap,
                None => return,
            };
            let action = if current.initiator {
                initiator_pairing_action(local, peer)
            } else {
                responder_pairing_action(peer, local)
            };
            current.action = Some(action);
            current.expected_event = Some(expected_pairing_event(local, peer));
            current.authenticated = is_pairing_authenticated(local, peer);
        }
    }

    fn state_for_expected_event(&self) -> PairingState {
        match self.current.as_ref().and_then(|c| c.expected_event) {
            Some(EVT_USER_CONFIRMATION_REQUEST) => PairingState::WaitUserConfirmationRequest,
            Some(EVT_USER_PASSKEY_REQUEST) => PairingState::WaitUserPasskeyRequest,
            Some(EVT_USER_PASSKEY_NOTIFICATION) => PairingState::WaitUserPasskeyNotification,
            _ => PairingState::Failed,
        }
    }

    pub fn on_user_confirmation_request(
        &mut self,
        numeric_value: u32,
        ctx: &mut PairingContext<'_>,
    ) -> Actions {
        if self.state != PairingState::WaitUserConfirmationRequest {
            return self.fail_with_unexpected_event("user confirmation request");
        }

        let action = self.current.as_ref().and_then(|c| c.action);
        let allow_automatic = self
            .current
            .as_ref()
            .map(|c| c.allow_automatic)
            .unwrap_or(false);

        let delegate = match ctx.delegate.as_deref_mut() {
            Some(delegate) => delegate,
            None => {
                let mut actions = self.fail_with(Error::NotReady, "user confirmation request");
                actions.commands.insert(
                    0,
                    HciCommand::UserConfirmationRequestNegativeReply {
                        bd_addr: self.address.bytes,
                    },
                );
                return actions;
            }
        };

        let confirmed = match action {
            Some(PairingAction::Automatic) if allow_automatic => true,
            Some(PairingAction::Automatic) | Some(PairingAction::GetConsent) => {
                delegate.confirm_pairing(self.peer_id)
            }
            Some(PairingAction::ComparePasskey) => {
                delegate.confirm_passkey(self.peer_id, numeric_value)
            }
            Some(PairingAction::DisplayPasskey) => {
                delegate.display_passkey(
                    self.peer_id,
                    numeric_value,
                    DisplayMethod::Comparison,
                );
                true
            }
            _ => return self.fail_with_unexpected_event("user confirmation request"),
        };

        self.state = PairingState::WaitPairingComplete;
        if confirmed {
            Actions::command(HciCommand::UserConfirmationRequestReply {
                bd_addr: self.address.bytes,
            })
        } else {
            info!("user rejected pairing (peer: {})", self.peer_id);
            Actions::command(HciCommand::UserConfirmationRequestNegativeReply {
                bd_addr: self.address.bytes,
            })
        }
    }

    pub fn on_user_passkey_request(&mut self, ctx: &mut PairingContext<'_>) -> Actions {
        if self.state != PairingState::WaitUserPasskeyRequest {
            return self.fail_with_unexpected_event("user passkey request");
        }

        let delegate = match ctx.delegate.as_deref_mut() {
            Some(delegate) => delegate,
            None => {
                let mut actions = self.fail_with(Error::NotReady, "user passkey request");
                actions.commands.insert(
                    0,
                    HciCommand::UserPasskeyRequestNegativeReply {
                        bd_addr: self.address.bytes,
                    },
                );
                return actions;
            }
        };

        self.state = PairingState::WaitPairingComplete;
        match delegate.request_passkey(self.peer_id) {
            Some(passkey) => Actions::command(HciCommand::UserPasskeyRequestReply {
                bd_addr: self.address.bytes,
                passkey,
            }),
            None => Actions::command(HciCommand::UserPasskeyRequestNegativeReply {
                bd_addr: self.address.bytes,
            }),
        }
    }

    pub fn on_user_passkey_notification(
        &mut self,
        passkey: u32,
        ctx: &mut PairingContext<'_>,
    ) -> Actions {
        if self.state != PairingState::WaitUserPasskeyNotification {
            return self.fail_with_unexpected_event("user passkey notification");
        }

        if let Some(delegate) = ctx.delegate.as_deref_mut() {
            delegate.display_passkey(self.peer_id, passkey, DisplayMethod::PeerEntry);
        }
        self.state = PairingState::WaitPairingComplete;
        Actions::none()
    }

    pub fn on_simple_pairing_complete(&mut self, status: u8) -> Actions {
        let status = HciStatus::from_u8(status);

        // An error status is possible any time after the IO Capability
        // exchange starts.
        let pairing_active = matches!(
            self.state,
            PairingState::InitiatorWaitIoCapResponse
                | PairingState::ResponderWaitIoCapRequest
                | PairingState::WaitUserConfirmationRequest
                | PairingState::WaitUserPasskeyRequest
                | PairingState::WaitUserPasskeyNotification
                | PairingState::WaitPairingComplete
        );

        if !pairing_active {
            return self.fail_with_unexpected_event("simple pairing complete");
        }

        if !status.is_success() {
            warn!(
                "simple pairing failed (peer: {}, status: {:#04x})",
                self.peer_id,
                status.to_u8()
            );
            return self.fail_with(Error::from(status), "simple pairing complete");
        }

        if self.state != PairingState::WaitPairingComplete {
            return self.fail_with_unexpected_event("simple pairing complete");
        }

        self.state = PairingState::WaitLinkKey;
        Actions::none()
    }

    pub fn on_link_key_notification(
        &mut self,
        key_value: [u8; 16],
        key_type: u8,
        ctx: &mut PairingContext<'_>,
    ) -> Actions {
        if self.state != PairingState::WaitLinkKey {
            return self.fail_with_unexpected_event("link key notification");
        }

        let key_type = match LinkKeyType::from_u8(key_type) {
            Some(key_type) => key_type,
            None => return self.fail_with(Error::InvalidParameters, "link key notification"),
        };

        if !self.security_mode.allows_key_type(key_type) {
            warn!(
                "link key type {:?} not permitted by security mode (peer: {})",
                key_type, self.peer_id
            );
            return self.fail_with(Error::InsufficientSecurity, "link key notification");
        }

        // The association model promised an authenticated key; a weaker
        // delivery means the procedures diverged.
        let expected_authenticated = self
            .current
            .as_ref()
            .map(|current| current.authenticated)
            .unwrap_or(false);
        if expected_authenticated && !key_type.authenticated() {
            warn!(
                "expected an authenticated link key but got {:?} (peer: {})",
                key_type, self.peer_id
            );
            return self.fail_with(Error::InsufficientSecurity, "link key notification");
        }

        let properties = SecurityProperties::from_key_type(key_type);
        ctx.peer.set_link_key(LinkKey::new(key_value, key_type));
        self.peer_missing_key = false;

        let initiator = match self.current.as_mut() {
            Some(current) => {
                current.key_properties = Some(properties);
                current.initiator
            }
            None => return self.fail_with_unexpected_event("link key notification"),
        };

        if initiator {
            self.state = PairingState::InitiatorWaitAuthComplete;
            Actions::none()
        } else {
            self.state = PairingState::WaitEncryption;
            Actions::command(HciCommand::SetConnectionEncryption {
                handle: self.handle,
                enable: true,
            })
        }
    }

    pub fn on_authentication_complete(&mut self, status: u8) -> Actions {
        let status = HciStatus::from_u8(status);

        if self.state != PairingState::InitiatorWaitAuthComplete {
            // An error can arrive at any point of an initiator procedure.
            if !status.is_success() && self.is_initiator_state() {
                return self.fail_with(Error::from(status), "authentication complete");
            }
            return self.fail_with_unexpected_event("authentication complete");
        }

        if status == HciStatus::PinOrKeyMissing && self.replied_with_cached_key {
            // The peer lost its copy of the key; restart and force a fresh
            // pairing through a negative link key reply.
            info!("peer is missing its link key, re-pairing (peer: {})", self.peer_id);
            self.peer_missing_key = true;
            self.replied_with_cached_key = false;
            if let Some(current) = self.current.as_mut() {
                current.allow_automatic = false;
                current.key_properties = None;
            }
            self.state = PairingState::InitiatorWaitLinkKeyRequest;
            return Actions::command(HciCommand::AuthenticationRequested {
                handle: self.handle,
            });
        }

        if !status.is_success() {
            return self.fail_with(Error::from(status), "authentication complete");
        }

        self.state = PairingState::WaitEncryption;
        Actions::command(HciCommand::SetConnectionEncryption {
            handle: self.handle,
            enable: true,
        })
    }

    fn is_initiator_state(&self) -> bool {
        matches!(
            self.state,
            PairingState::InitiatorWaitLePairingComplete
                | PairingState::InitiatorWaitLinkKeyRequest
                | PairingState::InitiatorWaitIoCapRequest
                | PairingState::InitiatorWaitIoCapResponse
                | PairingState::InitiatorWaitAuthComplete
        )
    }

    pub fn on_encryption_change(&mut self, status: u8, encryption_enabled: u8) -> Actions {
        let status = HciStatus::from_u8(status);

        if !status.is_success() {
            return self.fail_with(Error::from(status), "encryption change");
        }

        if encryption_enabled == 0 {
            // Losing encryption is fatal whether or not pairing is active.
            return self.fail_with(Error::Failed, "encryption disabled");
        }

        match self.state {
            PairingState::WaitEncryption => {
                Actions::command(HciCommand::ReadEncryptionKeySize {
                    handle: self.handle,
                })
            }
            PairingState::Idle => {
                // Re-encryption on an already paired link.
                self.properties.encrypted = true;
                Actions::none()
            }
            _ => self.fail_with_unexpected_event("encryption change"),
        }
    }

    /// Completion of the Read Encryption Key Size command issued after a
    /// successful Encryption Change.
    pub fn on_encryption_key_size(
        &mut self,
        status: u8,
        key_size: u8,
        ctx: &mut PairingContext<'_>,
    ) -> Actions {
        let status = HciStatus::from_u8(status);

        if self.state != PairingState::WaitEncryption {
            return self.fail_with_unexpected_event("encryption key size");
        }

        if !status.is_success() {
            return self.fail_with(Error::from(status), "encryption key size");
        }

        if key_size < MIN_ENCRYPTION_KEY_SIZE {
            warn!(
                "reported encryption key size {} below minimum (peer: {})",
                key_size, self.peer_id
            );
            return self.fail_with(Error::InsufficientSecurity, "encryption key size");
        }

        let key_properties = self
            .current
            .as_ref()
            .and_then(|current| current.key_properties)
            .unwrap_or_default();
        self.properties = SecurityProperties {
            encrypted: true,
            authenticated: key_properties.authenticated,
            secure_connections: key_properties.secure_connections,
            key_size: Some(key_size),
        };

        // Derive LE keys from this link key when we are central and both
        // sides support Secure Connections; peripherals never start it.
        if self.role == ConnectionRole::Central
            && self.local_secure_connections_supported
            && ctx.peer.supports_secure_connections()
        {
            self.state = PairingState::WaitCrossTransportKeyDerivation;
            return Actions {
                start_ctkd: true,
                ..Default::default()
            };
        }

        self.complete_pairing(ctx)
    }

    pub fn on_cross_transport_key_derivation_complete(
        &mut self,
        result: Result<()>,
        ctx: &mut PairingContext<'_>,
    ) -> Actions {
        if self.state != PairingState::WaitCrossTransportKeyDerivation {
            return Actions::none();
        }

        if let Err(error) = result {
            // The BR/EDR link is already encrypted; a CTKD failure costs
            // only the derived LE keys.
            warn!(
                "cross-transport key derivation failed (peer: {}, error: {})",
                self.peer_id, error
            );
        }

        self.complete_pairing(ctx)
    }

    /// Pairing reached the encrypted steady state: complete every request
    /// the new properties satisfy and start another iteration if some
    /// request still wants more.
    fn complete_pairing(&mut self, ctx: &mut PairingContext<'_>) -> Actions {
        info!(
            "pairing complete (peer: {}, authenticated: {}, secure connections: {})",
            self.peer_id, self.properties.authenticated, self.properties.secure_connections
        );

        self.current = None;
        self.state = PairingState::Idle;

        let properties = self.properties;
        let mut remaining = VecDeque::new();
        while let Some(request) = self.requests.pop_front() {
            if properties.satisfies(&request.requirements) {
                (request.callback)(Ok(()));
            } else {
                remaining.push_back(request);
            }
        }
        self.requests = remaining;

        let mut actions = Actions {
            signal: Some(PairingSignal::Complete(properties)),
            ..Default::default()
        };

        let next_preferred = self.requests.front().map(|request| request.requirements);
        if let Some(preferred) = next_preferred {
            // At least one queued request needs a stronger key; run another
            // pairing on the same link immediately.
            debug!("starting pairing upgrade (peer: {})", self.peer_id);
            let next_actions = self.start_initiator_pairing(preferred, ctx);
            actions.commands.extend(next_actions.commands);
        }

        actions
    }

    pub fn on_pin_code_request(&mut self, ctx: &mut PairingContext<'_>) -> Actions {
        if !matches!(self.state, PairingState::Idle | PairingState::WaitLinkKey) {
            return self.fail_with_unexpected_event("pin code request");
        }

        if ctx.peer.supports_secure_simple_pairing() == Some(true) {
            // Legacy pairing must never run against an SSP-capable peer.
            let mut actions = self.fail_with(Error::PairingNotAllowed, "pin code request");
            actions.commands.insert(
                0,
                HciCommand::PinCodeRequestNegativeReply {
                    bd_addr: self.address.bytes,
                },
            );
            return actions;
        }

        if !self.legacy_pairing_enabled || !self.local_iocap.can_display() {
            let mut actions = self.fail_with(Error::PairingNotAllowed, "pin code request");
            actions.commands.insert(
                0,
                HciCommand::PinCodeRequestNegativeReply {
                    bd_addr: self.address.bytes,
                },
            );
            return actions;
        }

        let delegate = match ctx.delegate.as_deref_mut() {
            Some(delegate) => delegate,
            None => {
                let mut actions = self.fail_with(Error::NotReady, "pin code request");
                actions.commands.insert(
                    0,
                    HciCommand::PinCodeRequestNegativeReply {
                        bd_addr: self.address.bytes,
                    },
                );
                return actions;
            }
        };

        // Generate a PIN, show it locally, and hand it to the controller;
        // the user enters the same value on the peer.
        let pin_value: u32 = rand::thread_rng().gen_range(0..10_000);
        delegate.display_passkey(self.peer_id, pin_value, DisplayMethod::PeerEntry);

        let digits = format!("{:04}", pin_value);
        let mut pin = [0u8; 16];
        pin[..4].copy_from_slice(digits.as_bytes());

        if self.state == PairingState::Idle {
            self.current = Some(CurrentPairing::responder(None));
        }
        self.state = PairingState::WaitLinkKey;

        Actions::command(HciCommand::PinCodeRequestReply {
            bd_addr: self.address.bytes,
            pin_length: 4,
            pin,
        })
    }

    /// Fail every queued request without emitting a signal; used when the
    /// link is torn down for unrelated reasons.
    pub fn fail_requests(&mut self, error: Error) {
        while let Some(request) = self.requests.pop_front() {
            (request.callback)(Err(error.clone()));
        }
    }

    fn fail_with_unexpected_event(&mut self, handler: &str) -> Actions {
        self.fail_with(Error::NotSupported, handler)
    }

    fn fail_with(&mut self, error: Error, handler: &str) -> Actions {
        warn!(
            "pairing failed in {:?} during {} (peer: {}): {}",
            self.state, handler, self.peer_id, error
        );
        self.state = PairingState::Failed;
        self.current = None;
        self.properties = SecurityProperties::default();
        self.fail_requests(error.clone());
        Actions {
            signal: Some(PairingSignal::Failure(error)),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::types::TechnologyType;
    use std::cell::RefCell;
    use std::rc::Rc;

    const TEST_ADDR: [u8; 6] = [0xCC, 0xBB, 0xAA, 0x06, 0x05, 0x04];
    const TEST_HANDLE: u16 = 0x0BAA;

    struct TestDelegate {
        confirm: bool,
        passkey: Option<u32>,
        displayed: Vec<u32>,
    }

    impl TestDelegate {
        fn accepting() -> Self {
            Self {
                confirm: true,
                passkey: Some(123456),
                displayed: Vec::new(),
            }
        }

        fn rejecting() -> Self {
            Self {
                confirm: false,
                passkey: None,
                displayed: Vec::new(),
            }
        }
    }

    impl PairingDelegate for TestDelegate {
        fn confirm_pairing(&mut self, _peer_id: PeerId) -> bool {
            self.confirm
        }

        fn confirm_passkey(&mut self, _peer_id: PeerId, _passkey: u32) -> bool {
            self.confirm
        }

        fn display_passkey(&mut self, _peer_id: PeerId, passkey: u32, _method: DisplayMethod) {
            self.displayed.push(passkey);
        }

        fn request_passkey(&mut self, _peer_id: PeerId) -> Option<u32> {
            self.passkey
        }
    }

    fn test_peer() -> PeerRecord {
        let mut peer = PeerRecord::new(
            PeerId(1),
            BdAddr::new(TEST_ADDR),
            TechnologyType::Classic,
        );
        // SSP-capable peer without Secure Connections.
        peer.features
            .set_page(0, LMP_FEATURE_SECURE_SIMPLE_PAIRING_CONTROLLER);
        peer.features
            .set_page(1, LMP_FEATURE_SECURE_SIMPLE_PAIRING_HOST);
        peer
    }

    fn test_machine(iocap: IoCapability, outgoing: bool) -> PairingStateMachine {
        PairingStateMachine::new(
            PeerId(1),
            TEST_HANDLE,
            BdAddr::new(TEST_ADDR),
            ConnectionRole::Central,
            outgoing,
            iocap,
            false,
            false,
            SecurityMode::Mode4,
        )
    }

    fn status_recorder() -> (Rc<RefCell<Vec<Result<()>>>>, StatusCallback) {
        let results = Rc::new(RefCell::new(Vec::new()));
        let results_clone = results.clone();
        let callback: StatusCallback =
            Box::new(move |result| results_clone.borrow_mut().push(result));
        (results, callback)
    }

    fn ctx<'a>(
        peer: &'a mut PeerRecord,
        delegate: &'a mut TestDelegate,
    ) -> PairingContext<'a> {
        PairingContext {
            peer,
            delegate: Some(delegate),
            le_pairing_in_progress: false,
        }
    }

    /// Drive a full initiator SSP numeric-comparison flow to completion.
    #[test]
    fn test_initiator_numeric_comparison_success() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, true);
        let mut peer = test_peer();
        let mut delegate = TestDelegate::accepting();
        let (results, callback) = status_recorder();

        let requirements = SecurityRequirements {
            authentication: true,
            secure_connections: false,
        };

        // Kick off: Authentication Requested goes out.
        let actions = machine.initiate_pairing(
            requirements,
            callback,
            &mut ctx(&mut peer, &mut delegate),
        );
        assert_eq!(
            actions.commands,
            vec![HciCommand::AuthenticationRequested { handle: TEST_HANDLE }]
        );
        assert_eq!(machine.state(), PairingState::InitiatorWaitLinkKeyRequest);

        // No cached key: negative reply forces pairing.
        let actions = machine.on_link_key_request(&mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands,
            vec![HciCommand::LinkKeyRequestNegativeReply { bd_addr: TEST_ADDR }]
        );

        // IO capability exchange.
        let actions = machine.on_io_capability_request(&mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands,
            vec![HciCommand::IoCapabilityRequestReply {
                bd_addr: TEST_ADDR,
                io_capability: 0x01,
                oob_data_present: 0x00,
                authentication_requirements: 0x05,
            }]
        );

        machine.on_io_capability_response(0x01); // DisplayYesNo
        assert_eq!(machine.state(), PairingState::WaitUserConfirmationRequest);

        // User confirms the comparison value.
        let actions = machine
            .on_user_confirmation_request(123456, &mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands,
            vec![HciCommand::UserConfirmationRequestReply { bd_addr: TEST_ADDR }]
        );

        machine.on_simple_pairing_complete(0x00);
        assert_eq!(machine.state(), PairingState::WaitLinkKey);

        let actions = machine.on_link_key_notification(
            [0xAB; 16],
            LinkKeyType::AuthenticatedCombination192.to_u8(),
            &mut ctx(&mut peer, &mut delegate),
        );
        assert!(actions.commands.is_empty());
        assert_eq!(machine.state(), PairingState::InitiatorWaitAuthComplete);
        assert!(peer.link_key.is_some());

        let actions = machine.on_authentication_complete(0x00);
        assert_eq!(
            actions.commands,
            vec![HciCommand::SetConnectionEncryption {
                handle: TEST_HANDLE,
                enable: true,
            }]
        );

        let actions = machine.on_encryption_change(0x00, 0x01);
        assert_eq!(
            actions.commands,
            vec![HciCommand::ReadEncryptionKeySize { handle: TEST_HANDLE }]
        );

        let actions =
            machine.on_encryption_key_size(0x00, 16, &mut ctx(&mut peer, &mut delegate));
        match actions.signal {
            Some(PairingSignal::Complete(properties)) => {
                assert!(properties.encrypted);
                assert!(properties.authenticated);
                assert_eq!(properties.key_size, Some(16));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(machine.state(), PairingState::Idle);
        assert_eq!(results.borrow().len(), 1);
        assert_eq!(results.borrow()[0], Ok(()));
    }

    /// The user rejecting a numeric comparison produces a negative reply
    /// and the subsequent failed Simple Pairing Complete fails the link.
    #[test]
    fn test_rejected_confirmation_fails_pairing() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, true);
        let mut peer = test_peer();
        let mut delegate = TestDelegate::rejecting();
        let (results, callback) = status_recorder();

        machine.initiate_pairing(
            SecurityRequirements::default(),
            callback,
            &mut ctx(&mut peer, &mut delegate),
        );
        machine.on_link_key_request(&mut ctx(&mut peer, &mut delegate));
        machine.on_io_capability_request(&mut ctx(&mut peer, &mut delegate));
        machine.on_io_capability_response(0x01);

        let actions = machine
            .on_user_confirmation_request(123456, &mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands,
            vec![HciCommand::UserConfirmationRequestNegativeReply { bd_addr: TEST_ADDR }]
        );

        // Controller reports the failure.
        let actions = machine.on_simple_pairing_complete(0x05);
        assert_eq!(
            actions.signal,
            Some(PairingSignal::Failure(Error::AuthenticationFailure))
        );
        assert_eq!(machine.state(), PairingState::Failed);
        assert_eq!(results.borrow().len(), 1);
        assert_eq!(results.borrow()[0], Err(Error::AuthenticationFailure));
    }

    /// A satisfied request completes immediately with no HCI traffic.
    #[test]
    fn test_initiate_pairing_already_satisfied() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, true);
        machine.properties = SecurityProperties {
            encrypted: true,
            authenticated: true,
            secure_connections: false,
            key_size: Some(16),
        };
        let mut peer = test_peer();
        let mut delegate = TestDelegate::accepting();
        let (results, callback) = status_recorder();

        let actions = machine.initiate_pairing(
            SecurityRequirements {
                authentication: true,
                secure_connections: false,
            },
            callback,
            &mut ctx(&mut peer, &mut delegate),
        );
        assert!(actions.commands.is_empty());
        assert_eq!(results.borrow().len(), 1);
        assert_eq!(results.borrow()[0], Ok(()));
        assert!(!machine.is_pairing());
    }

    /// No delegate installed: the request fails NotReady without touching
    /// the link.
    #[test]
    fn test_initiate_pairing_without_delegate() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, true);
        let mut peer = test_peer();
        let (results, callback) = status_recorder();

        let mut context = PairingContext {
            peer: &mut peer,
            delegate: None,
            le_pairing_in_progress: false,
        };
        let actions = machine.initiate_pairing(
            SecurityRequirements::default(),
            callback,
            &mut context,
        );
        assert!(actions.commands.is_empty());
        assert!(actions.signal.is_none());
        assert_eq!(results.borrow()[0], Err(Error::NotReady));
        assert_eq!(machine.state(), PairingState::Idle);
    }

    /// Queued requests complete out of order: the weak request completes on
    /// the first pairing, the strong one triggers a second iteration.
    #[test]
    fn test_request_coalescing_and_upgrade() {
        let mut machine = test_machine(IoCapability::NoInputNoOutput, true);
        let mut peer = test_peer();
        let mut delegate = TestDelegate::accepting();

        let (weak_results, weak_callback) = status_recorder();
        let (strong_results, strong_callback) = status_recorder();

        // Strong request first: authenticated pairing is preferred.
        machine.initiate_pairing(
            SecurityRequirements {
                authentication: true,
                secure_connections: false,
            },
            strong_callback,
            &mut ctx(&mut peer, &mut delegate),
        );
        machine.initiate_pairing(
            SecurityRequirements::default(),
            weak_callback,
            &mut ctx(&mut peer, &mut delegate),
        );
        assert_eq!(machine.state(), PairingState::InitiatorWaitLinkKeyRequest);

        // NoInputNoOutput pairing yields an unauthenticated key.
        machine.on_link_key_request(&mut ctx(&mut peer, &mut delegate));
        machine.on_io_capability_request(&mut ctx(&mut peer, &mut delegate));
        machine.on_io_capability_response(0x03);
        machine.on_user_confirmation_request(0, &mut ctx(&mut peer, &mut delegate));
        machine.on_simple_pairing_complete(0x00);
        machine.on_link_key_notification(
            [0x11; 16],
            LinkKeyType::UnauthenticatedCombination192.to_u8(),
            &mut ctx(&mut peer, &mut delegate),
        );
        machine.on_authentication_complete(0x00);
        machine.on_encryption_change(0x00, 0x01);
        let actions =
            machine.on_encryption_key_size(0x00, 16, &mut ctx(&mut peer, &mut delegate));

        // The weak request is satisfied; the strong one starts round two.
        assert_eq!(weak_results.borrow().len(), 1);
        assert_eq!(weak_results.borrow()[0], Ok(()));
        assert_eq!(strong_results.borrow().len(), 0);
        assert!(matches!(
            actions.signal,
            Some(PairingSignal::Complete(_))
        ));
        assert_eq!(
            actions.commands,
            vec![HciCommand::AuthenticationRequested { handle: TEST_HANDLE }]
        );
        assert_eq!(machine.state(), PairingState::InitiatorWaitLinkKeyRequest);
        assert!(machine.is_pairing());
    }

    /// Under Secure-Connections-Only, a 192-bit key fails the pairing.
    #[test]
    fn test_sc_only_rejects_weak_key() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, true);
        machine.set_security_mode(SecurityMode::SecureConnectionsOnly);
        let mut peer = test_peer();
        let mut delegate = TestDelegate::accepting();
        let (results, callback) = status_recorder();

        machine.initiate_pairing(
            SecurityRequirements::default(),
            callback,
            &mut ctx(&mut peer, &mut delegate),
        );
        machine.on_link_key_request(&mut ctx(&mut peer, &mut delegate));
        machine.on_io_capability_request(&mut ctx(&mut peer, &mut delegate));
        machine.on_io_capability_response(0x01);
        machine.on_user_confirmation_request(1, &mut ctx(&mut peer, &mut delegate));
        machine.on_simple_pairing_complete(0x00);

        let actions = machine.on_link_key_notification(
            [0x22; 16],
            LinkKeyType::AuthenticatedCombination192.to_u8(),
            &mut ctx(&mut peer, &mut delegate),
        );
        assert_eq!(
            actions.signal,
            Some(PairingSignal::Failure(Error::InsufficientSecurity))
        );
        assert_eq!(results.borrow()[0], Err(Error::InsufficientSecurity));
    }

    /// A cached key of sufficient type takes the fast path: Link Key
    /// Request Reply and straight to Authentication Complete.
    #[test]
    fn test_initiator_cached_key_fast_path() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, true);
        let mut peer = test_peer();
        peer.set_link_key(LinkKey::new(
            [0x42; 16],
            LinkKeyType::AuthenticatedCombination192,
        ));
        let mut delegate = TestDelegate::accepting();
        let (_, callback) = status_recorder();

        machine.initiate_pairing(
            SecurityRequirements {
                authentication: true,
                secure_connections: false,
            },
            callback,
            &mut ctx(&mut peer, &mut delegate),
        );
        let actions = machine.on_link_key_request(&mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands,
            vec![HciCommand::LinkKeyRequestReply {
                bd_addr: TEST_ADDR,
                link_key: [0x42; 16],
            }]
        );
        assert_eq!(machine.state(), PairingState::InitiatorWaitAuthComplete);
    }

    /// PIN_OR_KEY_MISSING after a cached-key reply restarts authentication
    /// and negative-replies the next Link Key Request.
    #[test]
    fn test_peer_missing_key_forces_repair() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, true);
        let mut peer = test_peer();
        peer.set_link_key(LinkKey::new([0x42; 16], LinkKeyType::Combination));
        let mut delegate = TestDelegate::accepting();
        let (_, callback) = status_recorder();

        machine.initiate_pairing(
            SecurityRequirements::default(),
            callback,
            &mut ctx(&mut peer, &mut delegate),
        );
        machine.on_link_key_request(&mut ctx(&mut peer, &mut delegate));
        assert_eq!(machine.state(), PairingState::InitiatorWaitAuthComplete);

        // Peer lost its key.
        let actions = machine.on_authentication_complete(0x06);
        assert_eq!(
            actions.commands,
            vec![HciCommand::AuthenticationRequested { handle: TEST_HANDLE }]
        );
        assert_eq!(machine.state(), PairingState::InitiatorWaitLinkKeyRequest);

        // This time the cached key is not offered.
        let actions = machine.on_link_key_request(&mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands,
            vec![HciCommand::LinkKeyRequestNegativeReply { bd_addr: TEST_ADDR }]
        );
    }

    /// Responder flow: IO Capability Response then Request while idle.
    #[test]
    fn test_responder_flow_reaches_encryption() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, false);
        let mut peer = test_peer();
        let mut delegate = TestDelegate::accepting();

        machine.on_io_capability_response(0x01);
        assert_eq!(machine.state(), PairingState::ResponderWaitIoCapRequest);

        let actions = machine.on_io_capability_request(&mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands,
            vec![HciCommand::IoCapabilityRequestReply {
                bd_addr: TEST_ADDR,
                io_capability: 0x01,
                oob_data_present: 0x00,
                authentication_requirements: 0x05,
            }]
        );
        assert_eq!(machine.state(), PairingState::WaitUserConfirmationRequest);

        machine.on_user_confirmation_request(999999, &mut ctx(&mut peer, &mut delegate));
        machine.on_simple_pairing_complete(0x00);

        // As responder the machine enables encryption itself after the key
        // arrives.
        let actions = machine.on_link_key_notification(
            [0x33; 16],
            LinkKeyType::AuthenticatedCombination192.to_u8(),
            &mut ctx(&mut peer, &mut delegate),
        );
        assert_eq!(
            actions.commands,
            vec![HciCommand::SetConnectionEncryption {
                handle: TEST_HANDLE,
                enable: true,
            }]
        );
        assert_eq!(machine.state(), PairingState::WaitEncryption);
    }

    /// Bonded responder: Link Key Request in idle replies with the stored
    /// key and waits for encryption.
    #[test]
    fn test_responder_bonded_key_reply() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, false);
        let mut peer = test_peer();
        peer.set_link_key(LinkKey::new(
            [0x55; 16],
            LinkKeyType::UnauthenticatedCombination192,
        ));
        let mut delegate = TestDelegate::accepting();

        let actions = machine.on_link_key_request(&mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands,
            vec![HciCommand::LinkKeyRequestReply {
                bd_addr: TEST_ADDR,
                link_key: [0x55; 16],
            }]
        );
        assert_eq!(machine.state(), PairingState::WaitEncryption);
    }

    /// Encryption reported disabled is fatal in any state.
    #[test]
    fn test_encryption_disabled_is_fatal() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, false);
        machine.properties.encrypted = true;

        let actions = machine.on_encryption_change(0x00, 0x00);
        assert!(matches!(
            actions.signal,
            Some(PairingSignal::Failure(_))
        ));
        assert_eq!(machine.state(), PairingState::Failed);
    }

    /// Legacy PIN request against an SSP-capable peer is refused.
    #[test]
    fn test_pin_request_rejected_for_ssp_peer() {
        let mut machine = PairingStateMachine::new(
            PeerId(1),
            TEST_HANDLE,
            BdAddr::new(TEST_ADDR),
            ConnectionRole::Central,
            false,
            IoCapability::DisplayYesNo,
            true, // legacy enabled
            false,
            SecurityMode::Mode4,
        );
        let mut peer = test_peer(); // SSP capable
        let mut delegate = TestDelegate::accepting();

        let actions = machine.on_pin_code_request(&mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands[0],
            HciCommand::PinCodeRequestNegativeReply { bd_addr: TEST_ADDR }
        );
        assert_eq!(machine.state(), PairingState::Failed);
    }

    /// Legacy pairing with display capability replies with a generated PIN
    /// and shows it to the user.
    #[test]
    fn test_pin_request_honored_when_legacy_enabled() {
        let mut machine = PairingStateMachine::new(
            PeerId(1),
            TEST_HANDLE,
            BdAddr::new(TEST_ADDR),
            ConnectionRole::Central,
            false,
            IoCapability::DisplayYesNo,
            true,
            false,
            SecurityMode::Mode4,
        );
        // Peer with unknown SSP support (no interrogation yet).
        let mut peer = PeerRecord::new(
            PeerId(1),
            BdAddr::new(TEST_ADDR),
            TechnologyType::Classic,
        );
        let mut delegate = TestDelegate::accepting();

        let actions = machine.on_pin_code_request(&mut ctx(&mut peer, &mut delegate));
        match &actions.commands[0] {
            HciCommand::PinCodeRequestReply {
                bd_addr,
                pin_length,
                pin,
            } => {
                assert_eq!(*bd_addr, TEST_ADDR);
                assert_eq!(*pin_length, 4);
                assert!(pin[..4].iter().all(|b| b.is_ascii_digit()));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(delegate.displayed.len(), 1);
        assert_eq!(machine.state(), PairingState::WaitLinkKey);
    }

    /// Legacy PIN without display capability fails the link.
    #[test]
    fn test_pin_request_without_display_fails() {
        let mut machine = PairingStateMachine::new(
            PeerId(1),
            TEST_HANDLE,
            BdAddr::new(TEST_ADDR),
            ConnectionRole::Central,
            false,
            IoCapability::KeyboardOnly,
            true,
            false,
            SecurityMode::Mode4,
        );
        let mut peer = PeerRecord::new(
            PeerId(1),
            BdAddr::new(TEST_ADDR),
            TechnologyType::Classic,
        );
        let mut delegate = TestDelegate::accepting();

        let actions = machine.on_pin_code_request(&mut ctx(&mut peer, &mut delegate));
        assert_eq!(
            actions.commands[0],
            HciCommand::PinCodeRequestNegativeReply { bd_addr: TEST_ADDR }
        );
        assert!(matches!(
            actions.signal,
            Some(PairingSignal::Failure(Error::PairingNotAllowed))
        ));
    }

    /// Unexpected events put the machine into Failed and flush the queue.
    #[test]
    fn test_unexpected_event_fails_queued_requests() {
        let mut machine = test_machine(IoCapability::DisplayYesNo, true);
        let mut peer = test_peer();
        let mut delegate = TestDelegate::accepting();
        let (results, callback) = status_recorder();

        machine.initiate_pairing(
            SecurityRequirements::default(),
            callback,
            &mut ctx(&mut peer, &mut delegate),
        );

        // A link key notification is not valid while waiting for the link
        // key request.
        let actions = machine.on_link_key_notification(
            [0; 16],
            LinkKeyType::Combination.to_u8(),
            &mut ctx(&mut peer, &mut delegate),
        );
        assert!(matches!(
            actions.signal,
            Some(PairingSignal::Failure(Error::NotSupported))
        ));
        assert_eq!(results.borrow()[0], Err(Error::NotSupported));
        assert_eq!(machine.state(), PairingState::Failed);
    }

    /// Central with Secure Connections on both sides runs CTKD before
    /// completing.
    #[test]
    fn test_ctkd_started_for_central_sc_link() {
        let mut machine = PairingStateMachine::new(
            PeerId(1),
            TEST_HANDLE,
            BdAddr::new(TEST_ADDR),
            ConnectionRole::Central,
            true,
            IoCapability::DisplayYesNo,
            false,
            true, // local Secure Connections
            SecurityMode::Mode4,
        );
        let mut peer = test_peer();
        peer.features.set_page(
            1,
            LMP_FEATURE_SECURE_SIMPLE_PAIRING_HOST | LMP_FEATURE_SECURE_CONNECTIONS_HOST,
        );
        peer.features
            .set_page(2, LMP_FEATURE_SECURE_CONNECTIONS_CONTROLLER);
        let mut delegate = TestDelegate::accepting();
        let (results, callback) = status_recorder();

        machine.initiate_pairing(
            SecurityRequirements::default(),
            callback,
            &mut ctx(&mut peer, &mut delegate),
        );
        machine.on_link_key_request(&mut ctx(&mut peer, &mut delegate));
        machine.on_io_capability_request(&mut ctx(&mut peer, &mut delegate));
        machine.on_io_capability_response(0x01);
        machine.on_user_confirmation_request(42, &mut ctx(&mut peer, &mut delegate));
        machine.on_simple_pairing_complete(0x00);
        machine.on_link_key_notification(
            [0x66; 16],
            LinkKeyType::AuthenticatedCombination256.to_u8(),
            &mut ctx(&mut peer, &mut delegate),
        );
        machine.on_authentication_complete(0x00);
        machine.on_encryption_change(0x00, 0x01);

        let actions =
            machine.on_encryption_key_size(0x00, 16, &mut ctx(&mut peer, &mut delegate));
        assert!(actions.start_ctkd);
        assert!(actions.signal.is_none());
        assert_eq!(
            machine.state(),
            PairingState::WaitCrossTransportKeyDerivation
        );
        assert!(results.borrow().is_empty());

        // CTKD completion finishes the pairing; even a CTKD error would.
        let actions = machine.on_cross_transport_key_derivation_complete(
            Ok(()),
            &mut ctx(&mut peer, &mut delegate),
        );
        assert!(matches!(
            actions.signal,
            Some(PairingSignal::Complete(_))
        ));
        assert_eq!(results.borrow()[0], Ok(()));
    }

    /// Peripheral never starts CTKD even on a Secure Connections link.
    #[test]
    fn test_peripheral_does_not_start_ctkd() {
        let mut machine = PairingStateMachine::new(
            PeerId(1),
            TEST_HANDLE,
            BdAddr::new(TEST_ADDR),
            ConnectionRole::Peripheral,
            false,
            IoCapability::DisplayYesNo,
            false,
            true,
            SecurityMode::Mode4,
        );
        let mut peer = test_peer();
        peer.features.set_page(
            1,
            LMP_FEATURE_SECURE_SIMPLE_PAIRING_HOST | LMP_FEATURE_SECURE_CONNECTIONS_HOST,
        );
        peer.features
            .set_page(2, LMP_FEATURE_SECURE_CONNECTIONS_CONTROLLER);
        let mut delegate = TestDelegate::accepting();

        machine.on_io_capability_response(0x01);
        machine.on_io_capability_request(&mut ctx(&mut peer, &mut delegate));
        machine.on_user_confirmation_request(7, &mut ctx(&mut peer, &mut delegate));
        machine.on_simple_pairing_complete(0x00);
        machine.on_link_key_notification(
            [0x77; 16],
            LinkKeyType::AuthenticatedCombination256.to_u8(),
            &mut ctx(&mut peer, &mut delegate),
        );
        machine.on_encryption_change(0x00, 0x01);

        let actions =
            machine.on_encryption_key_size(0x00, 16, &mut ctx(&mut peer, &mut delegate));
        assert!(!actions.start_ctkd);
        assert!(matches!(
            actions.signal,
            Some(PairingSignal::Complete(_))
        ));
    }
}
