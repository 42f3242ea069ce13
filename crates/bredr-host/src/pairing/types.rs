//! Type definitions for BR/EDR pairing
use std::fmt;

/// IO Capability values exchanged during Secure Simple Pairing
/// (Core Spec Vol 4, Part E, Sec 7.1.29).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    NoInputNoOutput,
}

impl IoCapability {
    /// Convert to u8 value for protocol
    pub fn to_u8(self) -> u8 {
        match self {
            IoCapability::DisplayOnly => 0x00,
            IoCapability::DisplayYesNo => 0x01,
            IoCapability::KeyboardOnly => 0x02,
            IoCapability::NoInputNoOutput => 0x03,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(IoCapability::DisplayOnly),
            0x01 => Some(IoCapability::DisplayYesNo),
            0x02 => Some(IoCapability::KeyboardOnly),
            0x03 => Some(IoCapability::NoInputNoOutput),
            _ => None,
        }
    }

    /// True when this capability can show a passkey to the user.
    pub fn can_display(self) -> bool {
        matches!(self, IoCapability::DisplayOnly | IoCapability::DisplayYesNo)
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
        }
    }
}

/// Authentication requirements carried in the IO Capability Request Reply.
///
/// Dedicated bonding and non-bondable modes are not supported, so only the
/// general-bonding values are ever requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationRequirements {
    GeneralBonding,
    MitmGeneralBonding,
}

impl AuthenticationRequirements {
    pub fn to_u8(self) -> u8 {
        match self {
            AuthenticationRequirements::GeneralBonding => 0x04,
            AuthenticationRequirements::MitmGeneralBonding => 0x05,
        }
    }
}

/// Link key types delivered by Link Key Notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKeyType {
    Combination,
    LocalUnit,
    RemoteUnit,
    DebugCombination,
    UnauthenticatedCombination192,
    AuthenticatedCombination192,
    ChangedCombination,
    UnauthenticatedCombination256,
    AuthenticatedCombination256,
}

impl LinkKeyType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(LinkKeyType::Combination),
            0x01 => Some(LinkKeyType::LocalUnit),
            0x02 => Some(LinkKeyType::RemoteUnit),
            0x03 => Some(LinkKeyType::DebugCombination),
            0x04 => Some(LinkKeyType::UnauthenticatedCombination192),
            0x05 => Some(LinkKeyType::AuthenticatedCombination192),
            0x06 => Some(LinkKeyType::ChangedCombination),
            0x07 => Some(LinkKeyType::UnauthenticatedCombination256),
            0x08 => Some(LinkKeyType::AuthenticatedCombination256),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            LinkKeyType::Combination => 0x00,
            LinkKeyType::LocalUnit => 0x01,
            LinkKeyType::RemoteUnit => 0x02,
            LinkKeyType::DebugCombination => 0x03,
            LinkKeyType::UnauthenticatedCombination192 => 0x04,
            LinkKeyType::AuthenticatedCombination192 => 0x05,
            LinkKeyType::ChangedCombination => 0x06,
            LinkKeyType::UnauthenticatedCombination256 => 0x07,
            LinkKeyType::AuthenticatedCombination256 => 0x08,
        }
    }

    /// True when the key defends against MITM.
    pub fn authenticated(self) -> bool {
        matches!(
            self,
            LinkKeyType::AuthenticatedCombination192 | LinkKeyType::AuthenticatedCombination256
        )
    }

    /// True when the key was generated with Secure Connections.
    pub fn secure_connections(self) -> bool {
        matches!(
            self,
            LinkKeyType::UnauthenticatedCombination256 | LinkKeyType::AuthenticatedCombination256
        )
    }
}

/// A BR/EDR link key with its reported type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkKey {
    pub value: [u8; 16],
    pub key_type: LinkKeyType,
}

impl LinkKey {
    pub fn new(value: [u8; 16], key_type: LinkKeyType) -> Self {
        Self { value, key_type }
    }
}

/// Security level required by a pairing or channel-open request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityRequirements {
    pub authentication: bool,
    pub secure_connections: bool,
}

/// Security properties currently attained by a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityProperties {
    pub encrypted: bool,
    pub authenticated: bool,
    pub secure_connections: bool,
    pub key_size: Option<u8>,
}

impl SecurityProperties {
    /// Properties conferred by a link key before encryption is enabled.
    pub fn from_key_type(key_type: LinkKeyType) -> Self {
        Self {
            encrypted: false,
            authenticated: key_type.authenticated(),
            secure_connections: key_type.secure_connections(),
            key_size: None,
        }
    }

    /// True when this link satisfies `requirements`. A link never satisfies
    /// anything until it is encrypted.
    pub fn satisfies(&self, requirements: &SecurityRequirements) -> bool {
        self.encrypted
            && (!requirements.authentication || self.authenticated)
            && (!requirements.secure_connections || self.secure_connections)
    }
}

/// BR/EDR security modes (Core Spec Vol 3, Part C, Sec 5.2.2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityMode {
    /// Any SSP outcome is acceptable.
    #[default]
    Mode4,
    /// Only Secure Connections link keys with AES-CCM encryption.
    SecureConnectionsOnly,
}

impl SecurityMode {
    /// True when `key_type` is acceptable under this mode.
    pub fn allows_key_type(self, key_type: LinkKeyType) -> bool {
        match self {
            SecurityMode::Mode4 => true,
            SecurityMode::SecureConnectionsOnly => key_type.secure_connections(),
        }
    }
}

/// Encryption state of an ACL link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncryptionStatus {
    #[default]
    Off,
    /// E0 encryption (legacy keys).
    On,
    /// AES-CCM encryption (Secure Connections keys).
    OnAesCcm,
}
