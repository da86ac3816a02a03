//! Decoded HCI events (controller → host).
//!
//! Event packets are decoded exhaustively at the framer boundary into the
//! [`Event`] sum type. LE Meta events carry a nested [`LeMetaEvent`]. Codes
//! the stack does not model land in [`Event::Unknown`] with their raw
//! parameters so subscribers can still inspect them.

use core::fmt;

use crate::error::ProtocolError;
use crate::opcode::Opcode;
use crate::status::StatusCode;

/// HCI event codes (controller → host).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCode {
    /// Inquiry Complete (0x01).
    InquiryComplete = 0x01,
    /// Connection Complete (0x03).
    ConnectionComplete = 0x03,
    /// Disconnection Complete (0x05).
    DisconnectionComplete = 0x05,
    /// CommandComplete event (0x0E): reports the result of a command.
    CommandComplete = 0x0E,
    /// CommandStatus event (0x0F): command accepted / rejected, result follows later.
    CommandStatus = 0x0F,
    /// Hardware Error (0x10).
    HardwareError = 0x10,
    /// Number Of Completed Packets (0x13): controller freed data buffers.
    NumberOfCompletedPackets = 0x13,
    /// Return Link Keys (0x15): partial result of Read_Stored_Link_Key.
    ReturnLinkKeys = 0x15,
    /// Data Buffer Overflow (0x1A).
    DataBufferOverflow = 0x1A,
    /// LE Meta event (0x3E): carries an LE sub-event code.
    LeMeta = 0x3E,
    /// Vendor specific (0xFF).
    VendorSpecific = 0xFF,
}

/// LE Meta sub-event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LeSubeventCode {
    /// LE Connection Complete (0x01).
    ConnectionComplete = 0x01,
    /// LE Advertising Report (0x02).
    AdvertisingReport = 0x02,
    /// LE Connection Update Complete (0x03).
    ConnectionUpdateComplete = 0x03,
    /// LE Long Term Key Request (0x05).
    LongTermKeyRequest = 0x05,
}

/// 48-bit Bluetooth device address, stored in wire (little-endian) order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// Bytes in wire order.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{g:02X}:{e:02X}:{d:02X}:{c:02X}:{b:02X}:{a:02X}")
    }
}

/// Fields of a Command Complete event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    /// Commands the controller will accept now.
    pub num_hci_command_packets: u8,
    /// Opcode of the command this event concludes (`NOP` for credit updates).
    pub opcode: Opcode,
    /// Return parameters, status byte first.
    pub return_parameters: Vec<u8>,
}

impl CommandComplete {
    /// Status byte; a parameterless completion (NOP) counts as success.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.return_parameters
            .first()
            .copied()
            .map_or(StatusCode::SUCCESS, StatusCode::new)
    }
}

/// Fields of a Command Status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    /// `0x00` when the command was accepted and is now running.
    pub status: StatusCode,
    /// Commands the controller will accept now.
    pub num_hci_command_packets: u8,
    /// Opcode of the command this event concerns.
    pub opcode: Opcode,
}

/// One `(handle, count)` pair of Number Of Completed Packets or
/// Host_Number_Of_Completed_Packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedPackets {
    /// Connection handle.
    pub handle: u16,
    /// Packets completed on that handle.
    pub count: u16,
}

/// One entry of a Return Link Keys event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredLinkKey {
    /// Remote device.
    pub bd_addr: BdAddr,
    /// 128-bit link key.
    pub link_key: [u8; 16],
}

/// LE Meta sub-events.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LeMetaEvent {
    ConnectionComplete {
        status: StatusCode,
        handle: u16,
        role: u8,
        peer_address_type: u8,
        peer_address: BdAddr,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    /// Reports are left encoded; their layout is profile territory.
    AdvertisingReport { num_reports: u8, reports: Vec<u8> },
    ConnectionUpdateComplete {
        status: StatusCode,
        handle: u16,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    LongTermKeyRequest {
        handle: u16,
        random_number: [u8; 8],
        encrypted_diversifier: u16,
    },
    Unknown { subevent: u8, parameters: Vec<u8> },
}

impl LeMetaEvent {
    /// LE sub-event code.
    #[must_use]
    pub fn subevent_code(&self) -> u8 {
        match self {
            Self::ConnectionComplete { .. } => LeSubeventCode::ConnectionComplete as u8,
            Self::AdvertisingReport { .. } => LeSubeventCode::AdvertisingReport as u8,
            Self::ConnectionUpdateComplete { .. } => {
                LeSubeventCode::ConnectionUpdateComplete as u8
            }
            Self::LongTermKeyRequest { .. } => LeSubeventCode::LongTermKeyRequest as u8,
            Self::Unknown { subevent, .. } => *subevent,
        }
    }
}

/// Decoded HCI events.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Event {
    InquiryComplete {
        status: StatusCode,
    },
    ConnectionComplete {
        status: StatusCode,
        handle: u16,
        bd_addr: BdAddr,
        link_type: u8,
        encryption_enabled: bool,
    },
    DisconnectionComplete {
        status: StatusCode,
        handle: u16,
        reason: StatusCode,
    },
    CommandComplete(CommandComplete),
    CommandStatus(CommandStatus),
    HardwareError {
        hardware_code: u8,
    },
    NumberOfCompletedPackets(Vec<CompletedPackets>),
    ReturnLinkKeys(Vec<StoredLinkKey>),
    DataBufferOverflow {
        link_type: u8,
    },
    LeMeta(LeMetaEvent),
    VendorSpecific(Vec<u8>),
    Unknown {
        code: u8,
        parameters: Vec<u8>,
    },
}

impl Event {
    /// Outer event code.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::InquiryComplete { .. } => EventCode::InquiryComplete as u8,
            Self::ConnectionComplete { .. } => EventCode::ConnectionComplete as u8,
            Self::DisconnectionComplete { .. } => EventCode::DisconnectionComplete as u8,
            Self::CommandComplete(_) => EventCode::CommandComplete as u8,
            Self::CommandStatus(_) => EventCode::CommandStatus as u8,
            Self::HardwareError { .. } => EventCode::HardwareError as u8,
            Self::NumberOfCompletedPackets(_) => EventCode::NumberOfCompletedPackets as u8,
            Self::ReturnLinkKeys(_) => EventCode::ReturnLinkKeys as u8,
            Self::DataBufferOverflow { .. } => EventCode::DataBufferOverflow as u8,
            Self::LeMeta(_) => EventCode::LeMeta as u8,
            Self::VendorSpecific(_) => EventCode::VendorSpecific as u8,
            Self::Unknown { code, .. } => *code,
        }
    }

    /// LE sub-event code, for LE Meta events only.
    #[must_use]
    pub fn le_subevent(&self) -> Option<u8> {
        match self {
            Self::LeMeta(le) => Some(le.subevent_code()),
            _ => None,
        }
    }

    /// Decode event parameters for `code`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedEvent`] when the parameters are
    /// shorter than the layout the event code requires.
    pub fn decode(code: u8, parameters: &[u8]) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedEvent { code };
        let mut r = ParamReader::new(parameters);

        let event = match code {
            0x01 => Self::InquiryComplete {
                status: r.status().ok_or_else(malformed)?,
            },
            0x03 => Self::ConnectionComplete {
                status: r.status().ok_or_else(malformed)?,
                handle: r.handle().ok_or_else(malformed)?,
                bd_addr: r.bd_addr().ok_or_else(malformed)?,
                link_type: r.u8().ok_or_else(malformed)?,
                encryption_enabled: r.u8().ok_or_else(malformed)? != 0,
            },
            0x05 => Self::DisconnectionComplete {
                status: r.status().ok_or_else(malformed)?,
                handle: r.handle().ok_or_else(malformed)?,
                reason: r.status().ok_or_else(malformed)?,
            },
            0x0E => Self::CommandComplete(CommandComplete {
                num_hci_command_packets: r.u8().ok_or_else(malformed)?,
                opcode: Opcode::from_raw(r.u16().ok_or_else(malformed)?),
                return_parameters: r.rest().to_vec(),
            }),
            0x0F => Self::CommandStatus(CommandStatus {
                status: r.status().ok_or_else(malformed)?,
                num_hci_command_packets: r.u8().ok_or_else(malformed)?,
                opcode: Opcode::from_raw(r.u16().ok_or_else(malformed)?),
            }),
            0x10 => Self::HardwareError {
                hardware_code: r.u8().ok_or_else(malformed)?,
            },
            0x13 => {
                let count = r.u8().ok_or_else(malformed)?;
                let mut entries = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    entries.push(CompletedPackets {
                        handle: r.handle().ok_or_else(malformed)?,
                        count: r.u16().ok_or_else(malformed)?,
                    });
                }
                Self::NumberOfCompletedPackets(entries)
            }
            0x15 => {
                let count = r.u8().ok_or_else(malformed)?;
                let mut keys = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    keys.push(StoredLinkKey {
                        bd_addr: r.bd_addr().ok_or_else(malformed)?,
                        link_key: r.array().ok_or_else(malformed)?,
                    });
                }
                Self::ReturnLinkKeys(keys)
            }
            0x1A => Self::DataBufferOverflow {
                link_type: r.u8().ok_or_else(malformed)?,
            },
            0x3E => Self::LeMeta(Self::decode_le_meta(&mut r).ok_or_else(malformed)?),
            0xFF => Self::VendorSpecific(r.rest().to_vec()),
            other => Self::Unknown {
                code: other,
                parameters: r.rest().to_vec(),
            },
        };
        Ok(event)
    }

    fn decode_le_meta(r: &mut ParamReader<'_>) -> Option<LeMetaEvent> {
        let subevent = r.u8()?;
        let le = match subevent {
            0x01 => LeMetaEvent::ConnectionComplete {
                status: r.status()?,
                handle: r.handle()?,
                role: r.u8()?,
                peer_address_type: r.u8()?,
                peer_address: r.bd_addr()?,
                interval: r.u16()?,
                latency: r.u16()?,
                supervision_timeout: r.u16()?,
            },
            0x02 => LeMetaEvent::AdvertisingReport {
                num_reports: r.u8()?,
                reports: r.rest().to_vec(),
            },
            0x03 => LeMetaEvent::ConnectionUpdateComplete {
                status: r.status()?,
                handle: r.handle()?,
                interval: r.u16()?,
                latency: r.u16()?,
                supervision_timeout: r.u16()?,
            },
            0x05 => LeMetaEvent::LongTermKeyRequest {
                handle: r.handle()?,
                random_number: r.array()?,
                encrypted_diversifier: r.u16()?,
            },
            other => LeMetaEvent::Unknown {
                subevent: other,
                parameters: r.rest().to_vec(),
            },
        };
        Some(le)
    }
}

/// Little-endian cursor over event parameters.
///
/// Every accessor returns `None` instead of panicking once the input runs out.
pub(crate) struct ParamReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ParamReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        let (&first, rest) = self.bytes.split_first()?;
        self.bytes = rest;
        Some(first)
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    /// Connection handle: the low 12 bits of a 16-bit field.
    pub(crate) fn handle(&mut self) -> Option<u16> {
        self.u16().map(|raw| raw & 0x0FFF)
    }

    pub(crate) fn status(&mut self) -> Option<StatusCode> {
        self.u8().map(StatusCode::new)
    }

    pub(crate) fn bd_addr(&mut self) -> Option<BdAddr> {
        self.array().map(BdAddr)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.bytes.len() < N {
            return None;
        }
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;
        head.try_into().ok()
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        core::mem::take(&mut self.bytes)
    }
}
