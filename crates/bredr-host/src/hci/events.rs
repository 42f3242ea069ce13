//! HCI event structures and parsing
//!
//! Raw event packets are decoded into `HciEvent`, then refined into the
//! typed `Event` enum consumed by the per-link state machines. Malformed
//! packets decode to `None`; the dispatcher logs and drops them.

use crate::hci::constants::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// A raw HCI event: event code plus unparsed parameter bytes.
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Self {
        Self {
            event_code,
            parameters,
        }
    }

    /// Parse an event from a raw HCI packet (indicator byte included).
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 3 || packet[0] != HCI_EVENT_PKT {
            return None;
        }

        let event_code = packet[1];
        let param_len = packet[2] as usize;
        if packet.len() < 3 + param_len {
            return None;
        }

        Some(Self {
            event_code,
            parameters: packet[3..3 + param_len].to_vec(),
        })
    }
}

fn read_bd_addr(cursor: &mut Cursor<&[u8]>) -> Option<[u8; 6]> {
    let mut addr = [0u8; 6];
    let pos = cursor.position() as usize;
    let data = *cursor.get_ref();
    if data.len() < pos + 6 {
        return None;
    }
    addr.copy_from_slice(&data[pos..pos + 6]);
    cursor.set_position((pos + 6) as u64);
    Some(addr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequestParams {
    pub bd_addr: [u8; 6],
    pub class_of_device: [u8; 3],
    pub link_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCompleteParams {
    pub status: u8,
    pub handle: u16,
    pub bd_addr: [u8; 6],
    pub link_type: u8,
    pub encryption_enabled: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionCompleteParams {
    pub status: u8,
    pub handle: u16,
    pub reason: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationCompleteParams {
    pub status: u8,
    pub handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNameRequestCompleteParams {
    pub status: u8,
    pub bd_addr: [u8; 6],
    pub remote_name: Vec<u8>,
}

impl RemoteNameRequestCompleteParams {
    /// The peer name: the first NUL-terminated UTF-8 prefix of the name
    /// field. Bytes after the terminator are ignored.
    pub fn name(&self) -> String {
        let end = self
            .remote_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.remote_name.len());
        String::from_utf8_lossy(&self.remote_name[..end]).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionChangeParams {
    pub status: u8,
    pub handle: u16,
    pub encryption_enabled: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRemoteSupportedFeaturesCompleteParams {
    pub status: u8,
    pub handle: u16,
    pub lmp_features: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRemoteVersionInfoCompleteParams {
    pub status: u8,
    pub handle: u16,
    pub version: u8,
    pub company_identifier: u16,
    pub subversion: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRemoteExtendedFeaturesCompleteParams {
    pub status: u8,
    pub handle: u16,
    pub page_number: u8,
    pub max_page_number: u8,
    pub lmp_features: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCompleteParams {
    pub num_hci_command_packets: u8,
    pub opcode: u16,
    pub return_parameters: Vec<u8>,
}

impl CommandCompleteParams {
    /// Status byte, present as the first return parameter of every command
    /// the core issues.
    pub fn status(&self) -> Option<u8> {
        self.return_parameters.first().copied()
    }

    /// Return parameters of Read Scan Enable: (status, scan_enable).
    pub fn scan_enable(&self) -> Option<(u8, u8)> {
        if self.return_parameters.len() < 2 {
            return None;
        }
        Some((self.return_parameters[0], self.return_parameters[1]))
    }

    /// Return parameters of Read Encryption Key Size:
    /// (status, connection_handle, key_size).
    pub fn encryption_key_size(&self) -> Option<(u8, u16, u8)> {
        if self.return_parameters.len() < 4 {
            return None;
        }
        let handle =
            u16::from_le_bytes([self.return_parameters[1], self.return_parameters[2]]);
        Some((self.return_parameters[0], handle, self.return_parameters[3]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatusParams {
    pub status: u8,
    pub num_hci_command_packets: u8,
    pub opcode: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleChangeParams {
    pub status: u8,
    pub bd_addr: [u8; 6],
    pub role: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinCodeRequestParams {
    pub bd_addr: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkKeyRequestParams {
    pub bd_addr: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkKeyNotificationParams {
    pub bd_addr: [u8; 6],
    pub link_key: [u8; 16],
    pub key_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynchronousConnectionCompleteParams {
    pub status: u8,
    pub handle: u16,
    pub bd_addr: [u8; 6],
    pub link_type: u8,
    pub transmission_interval: u8,
    pub retransmission_window: u8,
    pub rx_packet_length: u16,
    pub tx_packet_length: u16,
    pub air_mode: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCapabilityRequestParams {
    pub bd_addr: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCapabilityResponseParams {
    pub bd_addr: [u8; 6],
    pub io_capability: u8,
    pub oob_data_present: u8,
    pub authentication_requirements: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserConfirmationRequestParams {
    pub bd_addr: [u8; 6],
    pub numeric_value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPasskeyRequestParams {
    pub bd_addr: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimplePairingCompleteParams {
    pub status: u8,
    pub bd_addr: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPasskeyNotificationParams {
    pub bd_addr: [u8; 6],
    pub passkey: u32,
}

/// Typed view of the events the core consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ConnectionRequest(ConnectionRequestParams),
    ConnectionComplete(ConnectionCompleteParams),
    DisconnectionComplete(DisconnectionCompleteParams),
    AuthenticationComplete(AuthenticationCompleteParams),
    RemoteNameRequestComplete(RemoteNameRequestCompleteParams),
    EncryptionChange(EncryptionChangeParams),
    ReadRemoteSupportedFeaturesComplete(ReadRemoteSupportedFeaturesCompleteParams),
    ReadRemoteVersionInfoComplete(ReadRemoteVersionInfoCompleteParams),
    ReadRemoteExtendedFeaturesComplete(ReadRemoteExtendedFeaturesCompleteParams),
    CommandComplete(CommandCompleteParams),
    CommandStatus(CommandStatusParams),
    RoleChange(RoleChangeParams),
    PinCodeRequest(PinCodeRequestParams),
    LinkKeyRequest(LinkKeyRequestParams),
    LinkKeyNotification(LinkKeyNotificationParams),
    SynchronousConnectionComplete(SynchronousConnectionCompleteParams),
    IoCapabilityRequest(IoCapabilityRequestParams),
    IoCapabilityResponse(IoCapabilityResponseParams),
    UserConfirmationRequest(UserConfirmationRequestParams),
    UserPasskeyRequest(UserPasskeyRequestParams),
    SimplePairingComplete(SimplePairingCompleteParams),
    UserPasskeyNotification(UserPasskeyNotificationParams),
    /// An event code the core does not consume.
    Unhandled(u8),
}

impl Event {
    /// Refine a raw event into its typed form. Returns `None` when the
    /// parameter block is too short for the declared event code.
    pub fn parse(raw: &HciEvent) -> Option<Event> {
        let params = raw.parameters.as_slice();
        let mut cursor = Cursor::new(params);

        let event = match raw.event_code {
            EVT_CONNECTION_REQUEST => {
                let bd_addr = read_bd_addr(&mut cursor)?;
                let mut class_of_device = [0u8; 3];
                cursor.read_exact(&mut class_of_device).ok()?;
                let link_type = cursor.read_u8().ok()?;
                Event::ConnectionRequest(ConnectionRequestParams {
                    bd_addr,
                    class_of_device,
                    link_type,
                })
            }
            EVT_CONNECTION_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = cursor.read_u16::<LittleEndian>().ok()?;
                let bd_addr = read_bd_addr(&mut cursor)?;
                let link_type = cursor.read_u8().ok()?;
                let encryption_enabled = cursor.read_u8().ok()?;
                Event::ConnectionComplete(ConnectionCompleteParams {
                    status,
                    handle,
                    bd_addr,
                    link_type,
                    encryption_enabled,
                })
            }
            EVT_DISCONNECTION_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = cursor.read_u16::<LittleEndian>().ok()?;
                let reason = cursor.read_u8().ok()?;
                Event::DisconnectionComplete(DisconnectionCompleteParams {
                    status,
                    handle,
                    reason,
                })
            }
            EVT_AUTHENTICATION_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = cursor.read_u16::<LittleEndian>().ok()?;
                Event::AuthenticationComplete(AuthenticationCompleteParams { status, handle })
            }
            EVT_REMOTE_NAME_REQUEST_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let bd_addr = read_bd_addr(&mut cursor)?;
                let remote_name = params[cursor.position() as usize..].to_vec();
                Event::RemoteNameRequestComplete(RemoteNameRequestCompleteParams {
                    status,
                    bd_addr,
                    remote_name,
                })
            }
            EVT_ENCRYPTION_CHANGE => {
                let status = cursor.read_u8().ok()?;
                let handle = cursor.read_u16::<LittleEndian>().ok()?;
                let encryption_enabled = cursor.read_u8().ok()?;
                Event::EncryptionChange(EncryptionChangeParams {
                    status,
                    handle,
                    encryption_enabled,
                })
            }
            EVT_READ_REMOTE_SUPPORTED_FEATURES_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = cursor.read_u16::<LittleEndian>().ok()?;
                let lmp_features = cursor.read_u64::<LittleEndian>().ok()?;
                Event::ReadRemoteSupportedFeaturesComplete(
                    ReadRemoteSupportedFeaturesCompleteParams {
                        status,
                        handle,
                        lmp_features,
                    },
                )
            }
            EVT_READ_REMOTE_VERSION_INFO_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = cursor.read_u16::<LittleEndian>().ok()?;
                let version = cursor.read_u8().ok()?;
                let company_identifier = cursor.read_u16::<LittleEndian>().ok()?;
                let subversion = cursor.read_u16::<LittleEndian>().ok()?;
                Event::ReadRemoteVersionInfoComplete(ReadRemoteVersionInfoCompleteParams {
                    status,
                    handle,
                    version,
                    company_identifier,
                    subversion,
                })
            }
            EVT_READ_REMOTE_EXTENDED_FEATURES_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = cursor.read_u16::<LittleEndian>().ok()?;
                let page_number = cursor.read_u8().ok()?;
                let max_page_number = cursor.read_u8().ok()?;
                let lmp_features = cursor.read_u64::<LittleEndian>().ok()?;
                Event::ReadRemoteExtendedFeaturesComplete(
                    ReadRemoteExtendedFeaturesCompleteParams {
                        status,
                        handle,
                        page_number,
                        max_page_number,
                        lmp_features,
                    },
                )
            }
            EVT_COMMAND_COMPLETE => {
                let num_hci_command_packets = cursor.read_u8().ok()?;
                let opcode = cursor.read_u16::<LittleEndian>().ok()?;
                let return_parameters = params[cursor.position() as usize..].to_vec();
                Event::CommandComplete(CommandCompleteParams {
                    num_hci_command_packets,
                    opcode,
                    return_parameters,
                })
            }
            EVT_COMMAND_STATUS => {
                let status = cursor.read_u8().ok()?;
                let num_hci_command_packets = cursor.read_u8().ok()?;
                let opcode = cursor.read_u16::<LittleEndian>().ok()?;
                Event::CommandStatus(CommandStatusParams {
                    status,
                    num_hci_command_packets,
                    opcode,
                })
            }
            EVT_ROLE_CHANGE => {
                let status = cursor.read_u8().ok()?;
                let bd_addr = read_bd_addr(&mut cursor)?;
                let role = cursor.read_u8().ok()?;
                Event::RoleChange(RoleChangeParams {
                    status,
                    bd_addr,
                    role,
                })
            }
            EVT_PIN_CODE_REQUEST => {
                let bd_addr = read_bd_addr(&mut cursor)?;
                Event::PinCodeRequest(PinCodeRequestParams { bd_addr })
            }
            EVT_LINK_KEY_REQUEST => {
                let bd_addr = read_bd_addr(&mut cursor)?;
                Event::LinkKeyRequest(LinkKeyRequestParams { bd_addr })
            }
            EVT_LINK_KEY_NOTIFICATION => {
                let bd_addr = read_bd_addr(&mut cursor)?;
                let mut link_key = [0u8; 16];
                cursor.read_exact(&mut link_key).ok()?;
                let key_type = cursor.read_u8().ok()?;
                Event::LinkKeyNotification(LinkKeyNotificationParams {
                    bd_addr,
                    link_key,
                    key_type,
                })
            }
            EVT_SYNCHRONOUS_CONNECTION_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let handle = cursor.read_u16::<LittleEndian>().ok()?;
                let bd_addr = read_bd_addr(&mut cursor)?;
                let link_type = cursor.read_u8().ok()?;
                let transmission_interval = cursor.read_u8().ok()?;
                let retransmission_window = cursor.read_u8().ok()?;
                let rx_packet_length = cursor.read_u16::<LittleEndian>().ok()?;
                let tx_packet_length = cursor.read_u16::<LittleEndian>().ok()?;
                let air_mode = cursor.read_u8().ok()?;
                Event::SynchronousConnectionComplete(SynchronousConnectionCompleteParams {
                    status,
                    handle,
                    bd_addr,
                    link_type,
                    transmission_interval,
                    retransmission_window,
                    rx_packet_length,
                    tx_packet_length,
                    air_mode,
                })
            }
            EVT_IO_CAPABILITY_REQUEST => {
                let bd_addr = read_bd_addr(&mut cursor)?;
                Event::IoCapabilityRequest(IoCapabilityRequestParams { bd_addr })
            }
            EVT_IO_CAPABILITY_RESPONSE => {
                let bd_addr = read_bd_addr(&mut cursor)?;
                let io_capability = cursor.read_u8().ok()?;
                let oob_data_present = cursor.read_u8().ok()?;
                let authentication_requirements = cursor.read_u8().ok()?;
                Event::IoCapabilityResponse(IoCapabilityResponseParams {
                    bd_addr,
                    io_capability,
                    oob_data_present,
                    authentication_requirements,
                })
            }
            EVT_USER_CONFIRMATION_REQUEST => {
                let bd_addr = read_bd_addr(&mut cursor)?;
                let numeric_value = cursor.read_u32::<LittleEndian>().ok()?;
                Event::UserConfirmationRequest(UserConfirmationRequestParams {
                    bd_addr,
                    numeric_value,
                })
            }
            EVT_USER_PASSKEY_REQUEST => {
                let bd_addr = read_bd_addr(&mut cursor)?;
                Event::UserPasskeyRequest(UserPasskeyRequestParams { bd_addr })
            }
            EVT_SIMPLE_PAIRING_COMPLETE => {
                let status = cursor.read_u8().ok()?;
                let bd_addr = read_bd_addr(&mut cursor)?;
                Event::SimplePairingComplete(SimplePairingCompleteParams { status, bd_addr })
            }
            EVT_USER_PASSKEY_NOTIFICATION => {
                let bd_addr = read_bd_addr(&mut cursor)?;
                let passkey = cursor.read_u32::<LittleEndian>().ok()?;
                Event::UserPasskeyNotification(UserPasskeyNotificationParams { bd_addr, passkey })
            }
            other => Event::Unhandled(other),
        };

        Some(event)
    }
}
