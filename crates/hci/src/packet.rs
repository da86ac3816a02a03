//! H4 packet model and serialisation.
//!
//! Implements the UART transport layer defined in Bluetooth Core Spec v5.x
//! Part H, Section 4 (H4 framing). Each packet is prefixed with a 1-byte
//! packet-type indicator:
//!
//! - `0x01` — Command: `[opcode LE16][param_len u8][params]` (host → controller)
//! - `0x02` — ACL data: `[handle+flags LE16][data_len LE16][data]`
//! - `0x03` — SCO data: `[handle+flags LE16][data_len u8][data]`
//! - `0x04` — Event: `[event_code u8][param_len u8][params]` (controller → host)
//!
//! Decoding from a byte stream lives in [`crate::framer`].


// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

use core::fmt;

use crate::error::{HciError, ProtocolError};
use crate::event::Event;
use crate::opcode::{CommandParams, HciCommand, Opcode};

/// Largest command parameter block (one-byte length field).
pub const MAX_COMMAND_PARAMS: usize = 255;
/// Largest event parameter block (one-byte length field).
pub const MAX_EVENT_PARAMS: usize = 255;
/// Largest ACL payload the two-byte length field can describe.
pub const MAX_ACL_DATA: usize = u16::MAX as usize;
/// Largest SCO payload the one-byte length field can describe.
pub const MAX_SCO_DATA: usize = u8::MAX as usize;

const HANDLE_MASK: u16 = 0x0FFF;

/// H4 packet-type indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Command (host → controller).
    Command = 0x01,
    /// ACL data (both directions).
    AclData = 0x02,
    /// SCO data (both directions).
    ScoData = 0x03,
    /// Event (controller → host).
    Event = 0x04,
}

impl PacketType {
    /// Map an indicator byte to its packet type.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownPacketType`] for anything outside
    /// `0x01..=0x04`.
    pub const fn from_indicator(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Self::Command),
            0x02 => Ok(Self::AclData),
            0x03 => Ok(Self::ScoData),
            0x04 => Ok(Self::Event),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// Data link kinds that carry their own flow-control ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkType {
    /// Asynchronous connection-oriented data.
    Acl,
    /// Synchronous connection-oriented (voice) data.
    Sco,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Acl => "ACL",
            Self::Sco => "SCO",
        })
    }
}

/// A command ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    /// Command opcode.
    pub opcode: Opcode,
    /// Parameter block, at most [`MAX_COMMAND_PARAMS`] bytes.
    pub parameters: CommandParams,
}

impl CommandPacket {
    /// Build a command from an opcode and raw parameter bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HciError::CommandTooLong`] when `parameters` exceeds
    /// [`MAX_COMMAND_PARAMS`] bytes. Oversized commands are never truncated.
    pub fn new(opcode: Opcode, parameters: &[u8]) -> Result<Self, HciError> {
        let parameters = CommandParams::from_slice(parameters).map_err(|_| {
            HciError::CommandTooLong {
                len: parameters.len(),
            }
        })?;
        Ok(Self { opcode, parameters })
    }

    /// Marshal one of the typed commands.
    ///
    /// # Errors
    ///
    /// Propagates [`HciCommand::params`] failures.
    pub fn from_command(cmd: &HciCommand<'_>) -> Result<Self, HciError> {
        Ok(Self {
            opcode: cmd.opcode(),
            parameters: cmd.params()?,
        })
    }
}

/// An event as received: raw parameters plus the decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPacket {
    code: u8,
    parameters: Vec<u8>,
    event: Event,
}

impl EventPacket {
    /// Decode an event from its code and parameter block.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedEvent`] when the parameters are too
    /// short for the event code's layout.
    pub fn new(code: u8, parameters: &[u8]) -> Result<Self, ProtocolError> {
        let event = Event::decode(code, parameters)?;
        Ok(Self {
            code,
            parameters: parameters.to_vec(),
            event,
        })
    }

    /// Event code.
    #[must_use]
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Raw parameter block.
    #[must_use]
    pub fn parameters(&self) -> &[u8] {
        &self.parameters
    }

    /// Decoded event.
    #[must_use]
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Take the decoded event.
    #[must_use]
    pub fn into_event(self) -> Event {
        self.event
    }
}

/// ACL packet-boundary flag (bits 12-13 of the handle field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BoundaryFlag {
    /// First automatically-non-flushable packet of a higher-layer message.
    FirstNonFlushable = 0b00,
    /// Continuing fragment.
    Continuing = 0b01,
    /// First automatically-flushable packet.
    FirstFlushable = 0b10,
    /// Complete L2CAP PDU (LE only).
    Complete = 0b11,
}

impl BoundaryFlag {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::FirstNonFlushable,
            0b01 => Self::Continuing,
            0b10 => Self::FirstFlushable,
            _ => Self::Complete,
        }
    }
}

/// ACL data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    /// 12-bit connection handle.
    pub handle: u16,
    /// Packet-boundary flag.
    pub boundary: BoundaryFlag,
    /// 2-bit broadcast flag.
    pub broadcast: u8,
    /// Payload.
    pub data: Vec<u8>,
}

impl AclPacket {
    /// Point-to-point ACL packet; the handle is masked to 12 bits.
    #[must_use]
    pub fn new(handle: u16, boundary: BoundaryFlag, data: Vec<u8>) -> Self {
        Self {
            handle: handle & HANDLE_MASK,
            boundary,
            broadcast: 0,
            data,
        }
    }

    #[allow(clippy::arithmetic_side_effects)] // 2-bit fields shifted below bit 16
    fn header_word(&self) -> u16 {
        (self.handle & HANDLE_MASK)
            | (u16::from(self.boundary as u8) << 12)
            | (u16::from(self.broadcast & 0b11) << 14)
    }

    #[allow(clippy::cast_possible_truncation)] // masked to 2 bits
    pub(crate) fn from_header(word: u16, data: Vec<u8>) -> Self {
        Self {
            handle: word & HANDLE_MASK,
            boundary: BoundaryFlag::from_bits((word >> 12) as u8),
            broadcast: ((word >> 14) as u8) & 0b11,
            data,
        }
    }
}

/// SCO data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoPacket {
    /// 12-bit connection handle.
    pub handle: u16,
    /// 2-bit packet status flag (controller → host only).
    pub status: u8,
    /// Payload.
    pub data: Vec<u8>,
}

impl ScoPacket {
    /// SCO packet; the handle is masked to 12 bits.
    #[must_use]
    pub fn new(handle: u16, data: Vec<u8>) -> Self {
        Self {
            handle: handle & HANDLE_MASK,
            status: 0,
            data,
        }
    }

    #[allow(clippy::arithmetic_side_effects)] // 2-bit field shifted below bit 16
    fn header_word(&self) -> u16 {
        (self.handle & HANDLE_MASK) | (u16::from(self.status & 0b11) << 12)
    }

    #[allow(clippy::cast_possible_truncation)] // masked to 2 bits
    pub(crate) fn from_header(word: u16, data: Vec<u8>) -> Self {
        Self {
            handle: word & HANDLE_MASK,
            status: ((word >> 12) as u8) & 0b11,
            data,
        }
    }
}

/// One H4 packet of any type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Host → controller command.
    Command(CommandPacket),
    /// Controller → host event.
    Event(EventPacket),
    /// ACL data.
    AclData(AclPacket),
    /// SCO data.
    ScoData(ScoPacket),
}

impl Packet {
    /// H4 indicator for this packet.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Command(_) => PacketType::Command,
            Self::Event(_) => PacketType::Event,
            Self::AclData(_) => PacketType::AclData,
            Self::ScoData(_) => PacketType::ScoData,
        }
    }

    /// Serialise as an H4-framed byte vector, indicator byte included.
    ///
    /// # Errors
    ///
    /// Returns [`HciError::DataTooLong`] when a data payload does not fit its
    /// length field, or [`HciError::CommandTooLong`] for an oversized event
    /// parameter block.
    pub fn encode(&self) -> Result<Vec<u8>, HciError> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.push(self.packet_type() as u8);
        match self {
            Self::Command(cmd) => {
                out.extend_from_slice(&cmd.opcode.to_le_bytes());
                out.push(short_len(cmd.parameters.len(), |len| HciError::CommandTooLong { len })?);
                out.extend_from_slice(&cmd.parameters);
            }
            Self::Event(evt) => {
                out.push(evt.code);
                out.push(short_len(evt.parameters.len(), |len| HciError::CommandTooLong { len })?);
                out.extend_from_slice(&evt.parameters);
            }
            Self::AclData(acl) => {
                let len = u16::try_from(acl.data.len()).map_err(|_| HciError::DataTooLong {
                    len: acl.data.len(),
                    max: MAX_ACL_DATA,
                })?;
                out.extend_from_slice(&acl.header_word().to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(&acl.data);
            }
            Self::ScoData(sco) => {
                out.extend_from_slice(&sco.header_word().to_le_bytes());
                out.push(short_len(sco.data.len(), |len| HciError::DataTooLong {
                    len,
                    max: MAX_SCO_DATA,
                })?);
                out.extend_from_slice(&sco.data);
            }
        }
        Ok(out)
    }

    fn wire_len(&self) -> usize {
        let (header, body) = match self {
            Self::Command(cmd) => (4, cmd.parameters.len()),
            Self::Event(evt) => (3, evt.parameters.len()),
            Self::AclData(acl) => (5, acl.data.len()),
            Self::ScoData(sco) => (4, sco.data.len()),
        };
        body.saturating_add(header)
    }
}

fn short_len(len: usize, err: impl FnOnce(usize) -> HciError) -> Result<u8, HciError> {
    u8::try_from(len).map_err(|_| err(len))
}
