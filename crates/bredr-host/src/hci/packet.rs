//! HCI command structures and wire serialization
//!
//! Commands are modeled as an enum with one variant per command the core
//! sends; `to_packet` produces the exact little-endian wire form.

use crate::hci::constants::*;

/// Coding format block used by the enhanced synchronous connection commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodingFormat {
    pub format: u8,
    pub company: u16,
    pub codec_id: u16,
}

impl CodingFormat {
    /// CVSD, the baseline codec every controller supports.
    pub const CVSD: CodingFormat = CodingFormat {
        format: 0x02,
        company: 0x0000,
        codec_id: 0x0000,
    };

    pub const MSBC: CodingFormat = CodingFormat {
        format: 0x05,
        company: 0x0000,
        codec_id: 0x0000,
    };

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.format);
        out.extend_from_slice(&self.company.to_le_bytes());
        out.extend_from_slice(&self.codec_id.to_le_bytes());
    }
}

/// Parameter block for Enhanced Setup / Enhanced Accept Synchronous
/// Connection (Core Spec Vol 4, Part E, Sec 7.1.45/7.1.46).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynchronousConnectionParameters {
    pub transmit_bandwidth: u32,
    pub receive_bandwidth: u32,
    pub transmit_coding_format: CodingFormat,
    pub receive_coding_format: CodingFormat,
    pub transmit_codec_frame_size: u16,
    pub receive_codec_frame_size: u16,
    pub input_bandwidth: u32,
    pub output_bandwidth: u32,
    pub input_coding_format: CodingFormat,
    pub output_coding_format: CodingFormat,
    pub input_coded_data_size: u16,
    pub output_coded_data_size: u16,
    pub input_pcm_data_format: u8,
    pub output_pcm_data_format: u8,
    pub input_pcm_sample_payload_msb_position: u8,
    pub output_pcm_sample_payload_msb_position: u8,
    pub input_data_path: u8,
    pub output_data_path: u8,
    pub input_transport_unit_size: u8,
    pub output_transport_unit_size: u8,
    pub max_latency: u16,
    pub packet_types: u16,
    pub retransmission_effort: u8,
}

impl SynchronousConnectionParameters {
    /// True when the packet-type mask includes at least one SCO (HV) type.
    pub fn supports_sco(&self) -> bool {
        self.packet_types & (SCO_PACKET_HV1 | SCO_PACKET_HV2 | SCO_PACKET_HV3) != 0
    }

    /// True when the packet-type mask includes at least one eSCO (EV) type.
    pub fn supports_esco(&self) -> bool {
        self.packet_types & (SCO_PACKET_EV3 | SCO_PACKET_EV4 | SCO_PACKET_EV5) != 0
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.transmit_bandwidth.to_le_bytes());
        out.extend_from_slice(&self.receive_bandwidth.to_le_bytes());
        self.transmit_coding_format.write_to(out);
        self.receive_coding_format.write_to(out);
        out.extend_from_slice(&self.transmit_codec_frame_size.to_le_bytes());
        out.extend_from_slice(&self.receive_codec_frame_size.to_le_bytes());
        out.extend_from_slice(&self.input_bandwidth.to_le_bytes());
        out.extend_from_slice(&self.output_bandwidth.to_le_bytes());
        self.input_coding_format.write_to(out);
        self.output_coding_format.write_to(out);
        out.extend_from_slice(&self.input_coded_data_size.to_le_bytes());
        out.extend_from_slice(&self.output_coded_data_size.to_le_bytes());
        out.push(self.input_pcm_data_format);
        out.push(self.output_pcm_data_format);
        out.push(self.input_pcm_sample_payload_msb_position);
        out.push(self.output_pcm_sample_payload_msb_position);
        out.push(self.input_data_path);
        out.push(self.output_data_path);
        out.push(self.input_transport_unit_size);
        out.push(self.output_transport_unit_size);
        out.extend_from_slice(&self.max_latency.to_le_bytes());
        out.extend_from_slice(&self.packet_types.to_le_bytes());
        out.push(self.retransmission_effort);
    }
}

impl Default for SynchronousConnectionParameters {
    fn default() -> Self {
        // 64 kbit/s CVSD over the HCI transport, any eSCO packet type.
        Self {
            transmit_bandwidth: 8000,
            receive_bandwidth: 8000,
            transmit_coding_format: CodingFormat::CVSD,
            receive_coding_format: CodingFormat::CVSD,
            transmit_codec_frame_size: 60,
            receive_codec_frame_size: 60,
            input_bandwidth: 16000,
            output_bandwidth: 16000,
            input_coding_format: CodingFormat::CVSD,
            output_coding_format: CodingFormat::CVSD,
            input_coded_data_size: 16,
            output_coded_data_size: 16,
            input_pcm_data_format: 0x02,
            output_pcm_data_format: 0x02,
            input_pcm_sample_payload_msb_position: 0,
            output_pcm_sample_payload_msb_position: 0,
            input_data_path: 0x00,
            output_data_path: 0x00,
            input_transport_unit_size: 0,
            output_transport_unit_size: 0,
            max_latency: 0x000A,
            packet_types: SCO_PACKET_EV3,
            retransmission_effort: 0x01,
        }
    }
}

/// HCI commands issued by the BR/EDR connection and pairing core.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    CreateConnection {
        bd_addr: [u8; 6],
        packet_type: u16,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
        allow_role_switch: bool,
    },
    CreateConnectionCancel {
        bd_addr: [u8; 6],
    },
    Disconnect {
        handle: u16,
        reason: u8,
    },
    AcceptConnectionRequest {
        bd_addr: [u8; 6],
        role: u8,
    },
    RejectConnectionRequest {
        bd_addr: [u8; 6],
        reason: u8,
    },
    LinkKeyRequestReply {
        bd_addr: [u8; 6],
        link_key: [u8; 16],
    },
    LinkKeyRequestNegativeReply {
        bd_addr: [u8; 6],
    },
    PinCodeRequestReply {
        bd_addr: [u8; 6],
        pin_length: u8,
        pin: [u8; 16],
    },
    PinCodeRequestNegativeReply {
        bd_addr: [u8; 6],
    },
    AuthenticationRequested {
        handle: u16,
    },
    SetConnectionEncryption {
        handle: u16,
        enable: bool,
    },
    RemoteNameRequest {
        bd_addr: [u8; 6],
        page_scan_repetition_mode: u8,
        clock_offset: u16,
    },
    ReadRemoteSupportedFeatures {
        handle: u16,
    },
    ReadRemoteExtendedFeatures {
        handle: u16,
        page: u8,
    },
    ReadRemoteVersionInfo {
        handle: u16,
    },
    IoCapabilityRequestReply {
        bd_addr: [u8; 6],
        io_capability: u8,
        oob_data_present: u8,
        authentication_requirements: u8,
    },
    IoCapabilityRequestNegativeReply {
        bd_addr: [u8; 6],
        reason: u8,
    },
    UserConfirmationRequestReply {
        bd_addr: [u8; 6],
    },
    UserConfirmationRequestNegativeReply {
        bd_addr: [u8; 6],
    },
    UserPasskeyRequestReply {
        bd_addr: [u8; 6],
        passkey: u32,
    },
    UserPasskeyRequestNegativeReply {
        bd_addr: [u8; 6],
    },
    EnhancedSetupSynchronousConnection {
        handle: u16,
        parameters: SynchronousConnectionParameters,
    },
    EnhancedAcceptSynchronousConnectionRequest {
        bd_addr: [u8; 6],
        parameters: SynchronousConnectionParameters,
    },
    RejectSynchronousConnectionRequest {
        bd_addr: [u8; 6],
        reason: u8,
    },

    // Controller & Baseband Commands (OGF: 0x03)
    WritePinType {
        pin_type: u8,
    },
    WritePageTimeout {
        timeout: u16,
    },
    ReadScanEnable,
    WriteScanEnable {
        scan_enable: u8,
    },
    WritePageScanActivity {
        interval: u16,
        window: u16,
    },
    WritePageScanType {
        scan_type: u8,
    },

    // Status Parameters Commands (OGF: 0x05)
    ReadEncryptionKeySize {
        handle: u16,
    },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::CreateConnection { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION),
            Self::CreateConnectionCancel { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION_CANCEL),
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::AcceptConnectionRequest { .. } => (OGF_LINK_CTL, OCF_ACCEPT_CONNECTION_REQUEST),
            Self::RejectConnectionRequest { .. } => (OGF_LINK_CTL, OCF_REJECT_CONNECTION_REQUEST),
            Self::LinkKeyRequestReply { .. } => (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_REPLY),
            Self::LinkKeyRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_NEGATIVE_REPLY)
            }
            Self::PinCodeRequestReply { .. } => (OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_REPLY),
            Self::PinCodeRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_NEGATIVE_REPLY)
            }
            Self::AuthenticationRequested { .. } => (OGF_LINK_CTL, OCF_AUTHENTICATION_REQUESTED),
            Self::SetConnectionEncryption { .. } => {
                (OGF_LINK_CTL, OCF_SET_CONNECTION_ENCRYPTION)
            }
            Self::RemoteNameRequest { .. } => (OGF_LINK_CTL, OCF_REMOTE_NAME_REQUEST),
            Self::ReadRemoteSupportedFeatures { .. } => {
                (OGF_LINK_CTL, OCF_READ_REMOTE_SUPPORTED_FEATURES)
            }
            Self::ReadRemoteExtendedFeatures { .. } => {
                (OGF_LINK_CTL, OCF_READ_REMOTE_EXTENDED_FEATURES)
            }
            Self::ReadRemoteVersionInfo { .. } => (OGF_LINK_CTL, OCF_READ_REMOTE_VERSION_INFO),
            Self::IoCapabilityRequestReply { .. } => {
                (OGF_LINK_CTL, OCF_IO_CAPABILITY_REQUEST_REPLY)
            }
            Self::IoCapabilityRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_IO_CAPABILITY_REQUEST_NEGATIVE_REPLY)
            }
            Self::UserConfirmationRequestReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_CONFIRMATION_REQUEST_REPLY)
            }
            Self::UserConfirmationRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY)
            }
            Self::UserPasskeyRequestReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_PASSKEY_REQUEST_REPLY)
            }
            Self::UserPasskeyRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_PASSKEY_REQUEST_NEGATIVE_REPLY)
            }
            Self::EnhancedSetupSynchronousConnection { .. } => {
                (OGF_LINK_CTL, OCF_ENHANCED_SETUP_SYNCHRONOUS_CONNECTION)
            }
            Self::EnhancedAcceptSynchronousConnectionRequest { .. } => (
                OGF_LINK_CTL,
                OCF_ENHANCED_ACCEPT_SYNCHRONOUS_CONNECTION_REQUEST,
            ),
            Self::RejectSynchronousConnectionRequest { .. } => {
                (OGF_LINK_CTL, OCF_REJECT_SYNCHRONOUS_CONNECTION_REQUEST)
            }
            Self::WritePinType { .. } => (OGF_HOST_CTL, OCF_WRITE_PIN_TYPE),
            Self::WritePageTimeout { .. } => (OGF_HOST_CTL, OCF_WRITE_PAGE_TIMEOUT),
            Self::ReadScanEnable => (OGF_HOST_CTL, OCF_READ_SCAN_ENABLE),
            Self::WriteScanEnable { .. } => (OGF_HOST_CTL, OCF_WRITE_SCAN_ENABLE),
            Self::WritePageScanActivity { .. } => (OGF_HOST_CTL, OCF_WRITE_PAGE_SCAN_ACTIVITY),
            Self::WritePageScanType { .. } => (OGF_HOST_CTL, OCF_WRITE_PAGE_SCAN_TYPE),
            Self::ReadEncryptionKeySize { .. } => (OGF_STATUS_PARAM, OCF_READ_ENCRYPTION_KEY_SIZE),
        }
    }

    /// The assembled 16-bit opcode.
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match *self {
            Self::ReadScanEnable => vec![],

            Self::CreateConnection {
                bd_addr,
                packet_type,
                page_scan_repetition_mode,
                clock_offset,
                allow_role_switch,
            } => {
                let mut params = Vec::with_capacity(13);
                params.extend_from_slice(&bd_addr);
                params.extend_from_slice(&packet_type.to_le_bytes());
                params.push(page_scan_repetition_mode);
                params.push(0x00); // reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
                params.push(allow_role_switch as u8);
                params
            }

            Self::CreateConnectionCancel { bd_addr } => bd_addr.to_vec(),

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(reason);
                params
            }

            Self::AcceptConnectionRequest { bd_addr, role } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(&bd_addr);
                params.push(role);
                params
            }

            Self::RejectConnectionRequest { bd_addr, reason }
            | Self::RejectSynchronousConnectionRequest { bd_addr, reason } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(&bd_addr);
                params.push(reason);
                params
            }

            Self::LinkKeyRequestReply { bd_addr, link_key } => {
                let mut params = Vec::with_capacity(22);
                params.extend_from_slice(&bd_addr);
                params.extend_from_slice(&link_key);
                params
            }

            Self::LinkKeyRequestNegativeReply { bd_addr }
            | Self::PinCodeRequestNegativeReply { bd_addr }
            | Self::UserConfirmationRequestReply { bd_addr }
            | Self::UserConfirmationRequestNegativeReply { bd_addr }
            | Self::UserPasskeyRequestNegativeReply { bd_addr } => bd_addr.to_vec(),

            Self::PinCodeRequestReply {
                bd_addr,
                pin_length,
                pin,
            } => {
                let mut params = Vec::with_capacity(23);
                params.extend_from_slice(&bd_addr);
                params.push(pin_length);
                params.extend_from_slice(&pin);
                params
            }

            Self::AuthenticationRequested { handle }
            | Self::ReadRemoteSupportedFeatures { handle }
            | Self::ReadRemoteVersionInfo { handle }
            | Self::ReadEncryptionKeySize { handle } => handle.to_le_bytes().to_vec(),

            Self::SetConnectionEncryption { handle, enable } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(enable as u8);
                params
            }

            Self::RemoteNameRequest {
                bd_addr,
                page_scan_repetition_mode,
                clock_offset,
            } => {
                let mut params = Vec::with_capacity(10);
                params.extend_from_slice(&bd_addr);
                params.push(page_scan_repetition_mode);
                params.push(0x00); // reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
                params
            }

            Self::ReadRemoteExtendedFeatures { handle, page } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(page);
                params
            }

            Self::IoCapabilityRequestReply {
                bd_addr,
                io_capability,
                oob_data_present,
                authentication_requirements,
            } => {
                let mut params = Vec::with_capacity(9);
                params.extend_from_slice(&bd_addr);
                params.push(io_capability);
                params.push(oob_data_present);
                params.push(authentication_requirements);
                params
            }

            Self::IoCapabilityRequestNegativeReply { bd_addr, reason } => {
                let mut params = Vec::with_capacity(7);
                params.extend_from_slice(&bd_addr);
                params.push(reason);
                params
            }

            Self::UserPasskeyRequestReply { bd_addr, passkey } => {
                let mut params = Vec::with_capacity(10);
                params.extend_from_slice(&bd_addr);
                params.extend_from_slice(&passkey.to_le_bytes());
                params
            }

            Self::EnhancedSetupSynchronousConnection { handle, parameters } => {
                let mut params = Vec::with_capacity(59);
                params.extend_from_slice(&handle.to_le_bytes());
                parameters.write_to(&mut params);
                params
            }

            Self::EnhancedAcceptSynchronousConnectionRequest { bd_addr, parameters } => {
                let mut params = Vec::with_capacity(63);
                params.extend_from_slice(&bd_addr);
                parameters.write_to(&mut params);
                params
            }

            Self::WritePinType { pin_type } => vec![pin_type],

            Self::WritePageTimeout { timeout } => timeout.to_le_bytes().to_vec(),

            Self::WriteScanEnable { scan_enable } => vec![scan_enable],

            Self::WritePageScanActivity { interval, window } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&interval.to_le_bytes());
                params.extend_from_slice(&window.to_le_bytes());
                params
            }

            Self::WritePageScanType { scan_type } => vec![scan_type],
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();
        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}
