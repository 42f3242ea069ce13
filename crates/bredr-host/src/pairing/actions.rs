//! Secure Simple Pairing association-model policy
//!
//! Maps the initiator/responder IO capability pair onto the local user
//! interaction, the controller event that will carry it, whether the
//! resulting key is authenticated, and the authentication requirements to
//! declare in the IO Capability Request Reply (Core Spec v5.0 Vol 3,
//! Part C, Sec 5.2.2.6, Table 5.7).

use crate::hci::constants::{
    EVT_USER_CONFIRMATION_REQUEST, EVT_USER_PASSKEY_NOTIFICATION, EVT_USER_PASSKEY_REQUEST,
};
use crate::pairing::types::{AuthenticationRequirements, IoCapability};

/// The local user interaction a pairing will require. This is decoupled
/// from the reply to the HCI "User" event; e.g. `DisplayPasskey` may mean
/// automatically confirming a User Confirmation Request while showing the
/// value from a User Passkey Notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingAction {
    /// Don't involve the user.
    Automatic,
    /// Request yes/no consent.
    GetConsent,
    /// Display 6-digit value with "cancel".
    DisplayPasskey,
    /// Display 6-digit value with "yes/no".
    ComparePasskey,
    /// Request a 6-digit value entry.
    RequestPasskey,
}

/// Action taken by the pairing initiator.
pub fn initiator_pairing_action(
    initiator_cap: IoCapability,
    responder_cap: IoCapability,
) -> PairingAction {
    if initiator_cap == IoCapability::NoInputNoOutput {
        return PairingAction::Automatic;
    }
    if responder_cap == IoCapability::NoInputNoOutput {
        if initiator_cap == IoCapability::DisplayYesNo {
            return PairingAction::GetConsent;
        }
        return PairingAction::Automatic;
    }
    if initiator_cap == IoCapability::KeyboardOnly {
        return PairingAction::RequestPasskey;
    }
    if responder_cap == IoCapability::KeyboardOnly {
        return PairingAction::DisplayPasskey;
    }
    if initiator_cap == IoCapability::DisplayYesNo {
        if responder_cap == IoCapability::DisplayYesNo {
            return PairingAction::ComparePasskey;
        }
        return PairingAction::GetConsent;
    }
    PairingAction::DisplayPasskey
}

/// Action taken by the pairing responder. Mostly mirror-imaged from the
/// initiator's action, with the two asymmetric cells handled first.
pub fn responder_pairing_action(
    initiator_cap: IoCapability,
    responder_cap: IoCapability,
) -> PairingAction {
    if initiator_cap == IoCapability::NoInputNoOutput
        && responder_cap == IoCapability::KeyboardOnly
    {
        return PairingAction::GetConsent;
    }
    if initiator_cap == IoCapability::DisplayYesNo && responder_cap == IoCapability::DisplayYesNo {
        return PairingAction::ComparePasskey;
    }
    initiator_pairing_action(responder_cap, initiator_cap)
}

/// The HCI "User" event the controller will deliver for this capability
/// pair, from the local side's point of view.
pub fn expected_pairing_event(local_cap: IoCapability, peer_cap: IoCapability) -> u8 {
    if local_cap == IoCapability::NoInputNoOutput || peer_cap == IoCapability::NoInputNoOutput {
        return EVT_USER_CONFIRMATION_REQUEST;
    }
    if local_cap == IoCapability::KeyboardOnly {
        return EVT_USER_PASSKEY_REQUEST;
    }
    if peer_cap == IoCapability::KeyboardOnly {
        return EVT_USER_PASSKEY_NOTIFICATION;
    }
    EVT_USER_CONFIRMATION_REQUEST
}

/// True when the association model for this capability pair resists MITM.
pub fn is_pairing_authenticated(local_cap: IoCapability, peer_cap: IoCapability) -> bool {
    if local_cap == IoCapability::NoInputNoOutput || peer_cap == IoCapability::NoInputNoOutput {
        return false;
    }
    if local_cap == IoCapability::DisplayYesNo && peer_cap == IoCapability::DisplayYesNo {
        return true;
    }
    // One side entering a passkey the other displays is authenticated.
    local_cap == IoCapability::KeyboardOnly || peer_cap == IoCapability::KeyboardOnly
}

/// Authentication requirements for a locally-initiated pairing. The peer's
/// requirements are unknown at this point, so MITM protection is requested
/// whenever the local capability can support it.
pub fn initiator_authentication_requirements(
    local_cap: IoCapability,
) -> AuthenticationRequirements {
    if local_cap == IoCapability::NoInputNoOutput {
        AuthenticationRequirements::GeneralBonding
    } else {
        AuthenticationRequirements::MitmGeneralBonding
    }
}

/// Authentication requirements for a peer-initiated pairing: MITM whenever
/// this pairing can produce an authenticated link key.
pub fn responder_authentication_requirements(
    local_cap: IoCapability,
    peer_cap: IoCapability,
) -> AuthenticationRequirements {
    if is_pairing_authenticated(local_cap, peer_cap) {
        AuthenticationRequirements::MitmGeneralBonding
    } else {
        AuthenticationRequirements::GeneralBonding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IoCapability::*;

    #[test]
    fn test_initiator_actions_no_io_local() {
        for responder in [DisplayOnly, DisplayYesNo, KeyboardOnly, NoInputNoOutput] {
            assert_eq!(
                initiator_pairing_action(NoInputNoOutput, responder),
                PairingAction::Automatic
            );
        }
    }

    #[test]
    fn test_initiator_actions_no_io_peer() {
        assert_eq!(
            initiator_pairing_action(DisplayYesNo, NoInputNoOutput),
            PairingAction::GetConsent
        );
        assert_eq!(
            initiator_pairing_action(DisplayOnly, NoInputNoOutput),
            PairingAction::Automatic
        );
        assert_eq!(
            initiator_pairing_action(KeyboardOnly, NoInputNoOutput),
            PairingAction::Automatic
        );
    }

    #[test]
    fn test_initiator_passkey_cells() {
        assert_eq!(
            initiator_pairing_action(KeyboardOnly, DisplayOnly),
            PairingAction::RequestPasskey
        );
        assert_eq!(
            initiator_pairing_action(KeyboardOnly, KeyboardOnly),
            PairingAction::RequestPasskey
        );
        assert_eq!(
            initiator_pairing_action(DisplayOnly, KeyboardOnly),
            PairingAction::DisplayPasskey
        );
        assert_eq!(
            initiator_pairing_action(DisplayYesNo, KeyboardOnly),
            PairingAction::DisplayPasskey
        );
    }

    #[test]
    fn test_numeric_comparison_cell() {
        assert_eq!(
            initiator_pairing_action(DisplayYesNo, DisplayYesNo),
            PairingAction::ComparePasskey
        );
        assert_eq!(
            responder_pairing_action(DisplayYesNo, DisplayYesNo),
            PairingAction::ComparePasskey
        );
    }

    #[test]
    fn test_responder_asymmetric_cell() {
        assert_eq!(
            responder_pairing_action(NoInputNoOutput, KeyboardOnly),
            PairingAction::GetConsent
        );
    }

    #[test]
    fn test_authenticated_bit() {
        // Any NoInputNoOutput participant rules out MITM protection.
        assert!(!is_pairing_authenticated(NoInputNoOutput, DisplayYesNo));
        assert!(!is_pairing_authenticated(KeyboardOnly, NoInputNoOutput));

        assert!(is_pairing_authenticated(DisplayYesNo, DisplayYesNo));
        assert!(is_pairing_authenticated(KeyboardOnly, DisplayOnly));
        assert!(is_pairing_authenticated(DisplayOnly, KeyboardOnly));
        assert!(is_pairing_authenticated(KeyboardOnly, KeyboardOnly));

        // Display-to-display without yes/no on both sides is just works.
        assert!(!is_pairing_authenticated(DisplayOnly, DisplayOnly));
        assert!(!is_pairing_authenticated(DisplayOnly, DisplayYesNo));
    }

    #[test]
    fn test_expected_event() {
        assert_eq!(
            expected_pairing_event(DisplayYesNo, DisplayYesNo),
            EVT_USER_CONFIRMATION_REQUEST
        );
        assert_eq!(
            expected_pairing_event(KeyboardOnly, DisplayOnly),
            EVT_USER_PASSKEY_REQUEST
        );
        assert_eq!(
            expected_pairing_event(DisplayOnly, KeyboardOnly),
            EVT_USER_PASSKEY_NOTIFICATION
        );
        assert_eq!(
            expected_pairing_event(NoInputNoOutput, KeyboardOnly),
            EVT_USER_CONFIRMATION_REQUEST
        );
    }

    #[test]
    fn test_authentication_requirements() {
        assert_eq!(
            initiator_authentication_requirements(NoInputNoOutput),
            AuthenticationRequirements::GeneralBonding
        );
        assert_eq!(
            initiator_authentication_requirements(DisplayYesNo),
            AuthenticationRequirements::MitmGeneralBonding
        );

        assert_eq!(
            responder_authentication_requirements(DisplayYesNo, DisplayYesNo),
            AuthenticationRequirements::MitmGeneralBonding
        );
        assert_eq!(
            responder_authentication_requirements(DisplayYesNo, NoInputNoOutput),
            AuthenticationRequirements::GeneralBonding
        );
    }
}
