//! Error types for the bredr-host library
//!
//! HCI status codes are kept as their own enum so that controller-reported
//! failures can be surfaced verbatim; `Error` carries the business-level
//! kinds delivered to callers of the public API.

use thiserror::Error;

/// HCI status codes reported by the controller (Core Spec Vol 1, Part F).
///
/// Only the codes the BR/EDR connection and pairing core produces or
/// consumes are enumerated; everything else round-trips through `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HciStatus {
    Success,
    UnknownCommand,
    UnknownConnectionId,
    HardwareFailure,
    PageTimeout,
    AuthenticationFailure,
    PinOrKeyMissing,
    MemoryCapacityExceeded,
    ConnectionTimeout,
    ConnectionLimitExceeded,
    SynchronousConnectionLimitExceeded,
    ConnectionAlreadyExists,
    CommandDisallowed,
    ConnectionRejectedLimitedResources,
    ConnectionRejectedSecurity,
    ConnectionRejectedBadBdAddr,
    ConnectionAcceptTimeoutExceeded,
    UnsupportedFeatureOrParameter,
    InvalidParameters,
    RemoteUserTerminatedConnection,
    RemoteLowResources,
    RemotePowerOff,
    ConnectionTerminatedByLocalHost,
    RepeatedAttempts,
    PairingNotAllowed,
    UnspecifiedError,
    RoleChangeNotAllowed,
    LmpResponseTimeout,
    LinkKeyCannotBeChanged,
    PairingWithUnitKeyNotSupported,
    ConnectionFailedToBeEstablished,
    InsufficientSecurity,
    Other(u8),
}

impl HciStatus {
    /// Convert from the wire representation.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => HciStatus::Success,
            0x01 => HciStatus::UnknownCommand,
            0x02 => HciStatus::UnknownConnectionId,
            0x03 => HciStatus::HardwareFailure,
            0x04 => HciStatus::PageTimeout,
            0x05 => HciStatus::AuthenticationFailure,
            0x06 => HciStatus::PinOrKeyMissing,
            0x07 => HciStatus::MemoryCapacityExceeded,
            0x08 => HciStatus::ConnectionTimeout,
            0x09 => HciStatus::ConnectionLimitExceeded,
            0x0A => HciStatus::SynchronousConnectionLimitExceeded,
            0x0B => HciStatus::ConnectionAlreadyExists,
            0x0C => HciStatus::CommandDisallowed,
            0x0D => HciStatus::ConnectionRejectedLimitedResources,
            0x0E => HciStatus::ConnectionRejectedSecurity,
            0x0F => HciStatus::ConnectionRejectedBadBdAddr,
            0x10 => HciStatus::ConnectionAcceptTimeoutExceeded,
            0x11 => HciStatus::UnsupportedFeatureOrParameter,
            0x12 => HciStatus::InvalidParameters,
            0x13 => HciStatus::RemoteUserTerminatedConnection,
            0x14 => HciStatus::RemoteLowResources,
            0x15 => HciStatus::RemotePowerOff,
            0x16 => HciStatus::ConnectionTerminatedByLocalHost,
            0x17 => HciStatus::RepeatedAttempts,
            0x18 => HciStatus::PairingNotAllowed,
            0x1F => HciStatus::UnspecifiedError,
            0x21 => HciStatus::RoleChangeNotAllowed,
            0x22 => HciStatus::LmpResponseTimeout,
            0x26 => HciStatus::LinkKeyCannotBeChanged,
            0x29 => HciStatus::PairingWithUnitKeyNotSupported,
            0x2F => HciStatus::InsufficientSecurity,
            0x3E => HciStatus::ConnectionFailedToBeEstablished,
            other => HciStatus::Other(other),
        }
    }

    /// Convert to the wire representation.
    pub fn to_u8(self) -> u8 {
        match self {
            HciStatus::Success => 0x00,
            HciStatus::UnknownCommand => 0x01,
            HciStatus::UnknownConnectionId => 0x02,
            HciStatus::HardwareFailure => 0x03,
            HciStatus::PageTimeout => 0x04,
            HciStatus::AuthenticationFailure => 0x05,
            HciStatus::PinOrKeyMissing => 0x06,
            HciStatus::MemoryCapacityExceeded => 0x07,
            HciStatus::ConnectionTimeout => 0x08,
            HciStatus::ConnectionLimitExceeded => 0x09,
            HciStatus::SynchronousConnectionLimitExceeded => 0x0A,
            HciStatus::ConnectionAlreadyExists => 0x0B,
            HciStatus::CommandDisallowed => 0x0C,
            HciStatus::ConnectionRejectedLimitedResources => 0x0D,
            HciStatus::ConnectionRejectedSecurity => 0x0E,
            HciStatus::ConnectionRejectedBadBdAddr => 0x0F,
            HciStatus::ConnectionAcceptTimeoutExceeded => 0x10,
            HciStatus::UnsupportedFeatureOrParameter => 0x11,
            HciStatus::InvalidParameters => 0x12,
            HciStatus::RemoteUserTerminatedConnection => 0x13,
            HciStatus::RemoteLowResources => 0x14,
            HciStatus::RemotePowerOff => 0x15,
            HciStatus::ConnectionTerminatedByLocalHost => 0x16,
            HciStatus::RepeatedAttempts => 0x17,
            HciStatus::PairingNotAllowed => 0x18,
            HciStatus::UnspecifiedError => 0x1F,
            HciStatus::RoleChangeNotAllowed => 0x21,
            HciStatus::LmpResponseTimeout => 0x22,
            HciStatus::LinkKeyCannotBeChanged => 0x26,
            HciStatus::PairingWithUnitKeyNotSupported => 0x29,
            HciStatus::InsufficientSecurity => 0x2F,
            HciStatus::ConnectionFailedToBeEstablished => 0x3E,
            HciStatus::Other(other) => other,
        }
    }

    pub fn is_success(self) -> bool {
        self == HciStatus::Success
    }
}

/// Errors surfaced to callers of the public API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unknown peer")]
    NotFound,

    #[error("no pairing delegate installed")]
    NotReady,

    #[error("invalid parameters")]
    InvalidParameters,

    #[error("request canceled")]
    Canceled,

    #[error("operation timed out")]
    TimedOut,

    #[error("page timeout")]
    PageTimeout,

    #[error("connection failed to be established")]
    ConnectionFailed,

    #[error("pairing not allowed")]
    PairingNotAllowed,

    #[error("authentication failure")]
    AuthenticationFailure,

    #[error("link security is insufficient for the active security mode")]
    InsufficientSecurity,

    #[error("all connection parameters were rejected")]
    ParametersRejected,

    #[error("peer is not usable")]
    NotSupported,

    #[error("operation failed")]
    Failed,

    #[error("HCI error: {0:?}")]
    Hci(HciStatus),
}

impl From<HciStatus> for Error {
    /// Translate an HCI status to the matching error kind, falling back to
    /// `Hci(status)` when no dedicated kind exists.
    fn from(status: HciStatus) -> Self {
        match status {
            HciStatus::PageTimeout => Error::PageTimeout,
            HciStatus::AuthenticationFailure => Error::AuthenticationFailure,
            HciStatus::PairingNotAllowed => Error::PairingNotAllowed,
            HciStatus::ConnectionFailedToBeEstablished => Error::ConnectionFailed,
            HciStatus::InsufficientSecurity => Error::InsufficientSecurity,
            other => Error::Hci(other),
        }
    }
}

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for raw in 0u8..=0x40 {
            assert_eq!(HciStatus::from_u8(raw).to_u8(), raw);
        }
    }

    #[test]
    fn test_status_to_error_mapping() {
        assert_eq!(Error::from(HciStatus::PageTimeout), Error::PageTimeout);
        assert_eq!(
            Error::from(HciStatus::AuthenticationFailure),
            Error::AuthenticationFailure
        );
        assert_eq!(
            Error::from(HciStatus::ConnectionFailedToBeEstablished),
            Error::ConnectionFailed
        );

        // Codes without a dedicated kind stay wrapped.
        assert_eq!(
            Error::from(HciStatus::CommandDisallowed),
            Error::Hci(HciStatus::CommandDisallowed)
        );
    }
}
