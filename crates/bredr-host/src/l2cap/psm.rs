//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! See Bluetooth Core Specification Vol 3, Part A, Section 4 and the
//! assigned-numbers registry.

use std::fmt;

/// Protocol/Service Multiplexer (PSM) values used when opening channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Psm {
    /// Service Discovery Protocol
    Sdp,
    /// RFCOMM protocol
    Rfcomm,
    /// HID Control
    HidControl,
    /// HID Interrupt
    HidInterrupt,
    /// AVCTP protocol
    Avctp,
    /// AVDTP protocol
    Avdtp,
    /// Dynamically assigned PSM
    Dynamic(u16),
}

impl Psm {
    /// Get the PSM value as u16
    pub fn value(&self) -> u16 {
        match self {
            Psm::Sdp => 0x0001,
            Psm::Rfcomm => 0x0003,
            Psm::HidControl => 0x0011,
            Psm::HidInterrupt => 0x0013,
            Psm::Avctp => 0x0017,
            Psm::Avdtp => 0x0019,
            Psm::Dynamic(value) => *value,
        }
    }

    /// Try to create a PSM from a u16 value
    pub fn from_value(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Psm::Sdp),
            0x0003 => Some(Psm::Rfcomm),
            0x0011 => Some(Psm::HidControl),
            0x0013 => Some(Psm::HidInterrupt),
            0x0017 => Some(Psm::Avctp),
            0x0019 => Some(Psm::Avdtp),
            // Dynamic PSMs must be odd and in the dynamic range
            v if v >= 0x1001 && v % 2 == 1 => Some(Psm::Dynamic(v)),
            _ => None,
        }
    }
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Psm::Sdp => write!(f, "SDP"),
            Psm::Rfcomm => write!(f, "RFCOMM"),
            Psm::HidControl => write!(f, "HID Control"),
            Psm::HidInterrupt => write!(f, "HID Interrupt"),
            Psm::Avctp => write!(f, "AVCTP"),
            Psm::Avdtp => write!(f, "AVDTP"),
            Psm::Dynamic(value) => write!(f, "Dynamic({:#06x})", value),
        }
    }
}
