//! L2CAP channel-configuration option codec
//!
//! Configuration Request/Response payloads carry a concatenation of
//! `{type: u8, length: u8, payload}` records with little-endian payload
//! integers. Recognized options have a fixed payload size; a length
//! mismatch aborts the whole decode. Unknown options with the type MSB set
//! are hints and are dropped; other unknown options are preserved verbatim
//! so they can be echoed back.

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};
use std::io::Cursor;

// Option type codes (Core Spec Vol 3, Part A, Sec 5)
pub const OPTION_TYPE_MTU: u8 = 0x01;
pub const OPTION_TYPE_FLUSH_TIMEOUT: u8 = 0x02;
pub const OPTION_TYPE_RETRANSMISSION_AND_FLOW_CONTROL: u8 = 0x04;
pub const OPTION_TYPE_FCS: u8 = 0x05;

// An option is a hint when the MSB of its type is set.
const HINT_MASK: u8 = 0x80;

// Retransmission & flow control modes
pub const RFC_MODE_BASIC: u8 = 0x00;
pub const RFC_MODE_RETRANSMISSION: u8 = 0x01;
pub const RFC_MODE_FLOW_CONTROL: u8 = 0x02;
pub const RFC_MODE_ENHANCED_RETRANSMISSION: u8 = 0x03;
pub const RFC_MODE_STREAMING: u8 = 0x04;

/// MTU option (2-byte payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuOption {
    pub mtu: u16,
}

/// Retransmission & flow control option (9-byte payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmissionAndFlowControlOption {
    pub mode: u8,
    pub tx_window_size: u8,
    pub max_transmit: u8,
    pub rtx_timeout: u16,
    pub monitor_timeout: u16,
    pub mps: u16,
}

impl RetransmissionAndFlowControlOption {
    pub fn basic_mode() -> Self {
        Self {
            mode: RFC_MODE_BASIC,
            tx_window_size: 0,
            max_transmit: 0,
            rtx_timeout: 0,
            monitor_timeout: 0,
            mps: 0,
        }
    }

    pub fn enhanced_retransmission_mode(
        tx_window_size: u8,
        max_transmit: u8,
        rtx_timeout: u16,
        monitor_timeout: u16,
        mps: u16,
    ) -> Self {
        Self {
            mode: RFC_MODE_ENHANCED_RETRANSMISSION,
            tx_window_size,
            max_transmit,
            rtx_timeout,
            monitor_timeout,
            mps,
        }
    }
}

/// Frame check sequence types carried by the FCS option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcsType {
    None,
    SixteenBit,
    Other(u8),
}

impl FcsType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FcsType::None,
            0x01 => FcsType::SixteenBit,
            other => FcsType::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            FcsType::None => 0x00,
            FcsType::SixteenBit => 0x01,
            FcsType::Other(other) => other,
        }
    }
}

/// FCS option (1-byte payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcsOption {
    pub fcs_type: FcsType,
}

/// Flush timeout option (2-byte payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTimeoutOption {
    pub flush_timeout: u16,
}

/// An unrecognized non-hint option, preserved verbatim for echoing back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOption {
    pub option_type: u8,
    pub payload: Vec<u8>,
}

impl UnknownOption {
    /// True when the type MSB marks this option as a hint.
    pub fn is_hint(&self) -> bool {
        self.option_type & HINT_MASK != 0
    }
}

/// The set of options carried by one configuration request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfiguration {
    pub mtu: Option<MtuOption>,
    pub retransmission_and_flow_control: Option<RetransmissionAndFlowControlOption>,
    pub fcs: Option<FcsOption>,
    pub flush_timeout: Option<FlushTimeoutOption>,
    pub unknown_options: Vec<UnknownOption>,
}

// Fixed payload sizes of the recognized options.
const MTU_PAYLOAD_LEN: u8 = 2;
const RFC_PAYLOAD_LEN: u8 = 9;
const FCS_PAYLOAD_LEN: u8 = 1;
const FLUSH_TIMEOUT_PAYLOAD_LEN: u8 = 2;

impl ChannelConfiguration {
    /// Decode a concatenation of options. Returns `None` when any option is
    /// malformed (short header, length past the buffer, or a recognized
    /// type with the wrong payload length).
    pub fn decode(mut data: &[u8]) -> Option<Self> {
        let mut config = ChannelConfiguration::default();

        while !data.is_empty() {
            if data.len() < 2 {
                warn!("config option truncated at header (remaining: {})", data.len());
                return None;
            }

            let option_type = data[0];
            let length = data[1] as usize;
            if data.len() < 2 + length {
                warn!(
                    "config option length past end of buffer (type: {:#04x}, length: {})",
                    option_type, length
                );
                return None;
            }

            let payload = &data[2..2 + length];

            match option_type {
                OPTION_TYPE_MTU => {
                    if length as u8 != MTU_PAYLOAD_LEN {
                        warn!("MTU option with incorrect length {}", length);
                        return None;
                    }
                    let mut cursor = Cursor::new(payload);
                    config.mtu = Some(MtuOption {
                        mtu: cursor.read_u16::<LittleEndian>().ok()?,
                    });
                }
                OPTION_TYPE_RETRANSMISSION_AND_FLOW_CONTROL => {
                    if length as u8 != RFC_PAYLOAD_LEN {
                        warn!("retransmission option with incorrect length {}", length);
                        return None;
                    }
                    let mut cursor = Cursor::new(payload);
                    config.retransmission_and_flow_control =
                        Some(RetransmissionAndFlowControlOption {
                            mode: cursor.read_u8().ok()?,
                            tx_window_size: cursor.read_u8().ok()?,
                            max_transmit: cursor.read_u8().ok()?,
                            rtx_timeout: cursor.read_u16::<LittleEndian>().ok()?,
                            monitor_timeout: cursor.read_u16::<LittleEndian>().ok()?,
                            mps: cursor.read_u16::<LittleEndian>().ok()?,
                        });
                }
                OPTION_TYPE_FCS => {
                    if length as u8 != FCS_PAYLOAD_LEN {
                        warn!("FCS option with incorrect length {}", length);
                        return None;
                    }
                    config.fcs = Some(FcsOption {
                        fcs_type: FcsType::from_u8(payload[0]),
                    });
                }
                OPTION_TYPE_FLUSH_TIMEOUT => {
                    if length as u8 != FLUSH_TIMEOUT_PAYLOAD_LEN {
                        warn!("flush timeout option with incorrect length {}", length);
                        return None;
                    }
                    let mut cursor = Cursor::new(payload);
                    config.flush_timeout = Some(FlushTimeoutOption {
                        flush_timeout: cursor.read_u16::<LittleEndian>().ok()?,
                    });
                }
                _ => {
                    let unknown = UnknownOption {
                        option_type,
                        payload: payload.to_vec(),
                    };
                    if unknown.is_hint() {
                        debug!("dropping hint option (type: {:#04x})", option_type);
                    } else {
                        config.unknown_options.push(unknown);
                    }
                }
            }

            data = &data[2 + length..];
        }

        Some(config)
    }

    /// Encode all present options, recognized options first in the fixed
    /// order, then preserved unknown options.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        if let Some(mtu) = self.mtu {
            out.push(OPTION_TYPE_MTU);
            out.push(MTU_PAYLOAD_LEN);
            out.extend_from_slice(&mtu.mtu.to_le_bytes());
        }

        if let Some(rfc) = self.retransmission_and_flow_control {
            out.push(OPTION_TYPE_RETRANSMISSION_AND_FLOW_CONTROL);
            out.push(RFC_PAYLOAD_LEN);
            out.push(rfc.mode);
            out.push(rfc.tx_window_size);
            out.push(rfc.max_transmit);
            out.extend_from_slice(&rfc.rtx_timeout.to_le_bytes());
            out.extend_from_slice(&rfc.monitor_timeout.to_le_bytes());
            out.extend_from_slice(&rfc.mps.to_le_bytes());
        }

        if let Some(fcs) = self.fcs {
            out.push(OPTION_TYPE_FCS);
            out.push(FCS_PAYLOAD_LEN);
            out.push(fcs.fcs_type.to_u8());
        }

        if let Some(flush) = self.flush_timeout {
            out.push(OPTION_TYPE_FLUSH_TIMEOUT);
            out.push(FLUSH_TIMEOUT_PAYLOAD_LEN);
            out.extend_from_slice(&flush.flush_timeout.to_le_bytes());
        }

        for unknown in &self.unknown_options {
            out.push(unknown.option_type);
            out.push(unknown.payload.len() as u8);
            out.extend_from_slice(&unknown.payload);
        }

        out
    }

    /// Merge `other` into this configuration: recognized options from
    /// `other` overwrite, unknown options are concatenated.
    pub fn merge(&mut self, other: ChannelConfiguration) {
        if other.mtu.is_some() {
            self.mtu = other.mtu;
        }
        if other.retransmission_and_flow_control.is_some() {
            self.retransmission_and_flow_control = other.retransmission_and_flow_control;
        }
        if other.fcs.is_some() {
            self.fcs = other.fcs;
        }
        if other.flush_timeout.is_some() {
            self.flush_timeout = other.flush_timeout;
        }
        self.unknown_options.extend(other.unknown_options);
    }
}
