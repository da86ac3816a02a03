//! Incremental H4 decoder.
//!
//! [`PacketFramer`] buffers whatever the transport hands it and yields one
//! [`Packet`] per complete frame. Partial frames stay buffered until the rest
//! arrives. A byte that cannot start a valid frame (unknown indicator or a
//! data length above the configured maximum) is discarded on its own and
//! decoding retries from the next position. An event whose header is sound
//! but whose parameters do not decode is dropped whole: its length already
//! marks where the next frame starts.

use crate::config::{StackConfig, DEFAULT_MAX_ACL_PAYLOAD, DEFAULT_MAX_SCO_PAYLOAD, DEFAULT_RESYNC_BUDGET};
use crate::error::ProtocolError;
use crate::opcode::Opcode;
use crate::packet::{AclPacket, CommandPacket, EventPacket, LinkType, Packet, PacketType, ScoPacket};

/// Outcome of one decode attempt at the head of the buffer.
enum Frame {
    /// More bytes are needed.
    Incomplete,
    /// The head byte cannot start a frame.
    Malformed(ProtocolError),
    /// A well-delimited frame whose contents are unusable, and its length.
    Rejected(ProtocolError, usize),
    /// A packet and the number of bytes it occupied.
    Packet(Packet, usize),
}

/// Byte-stream → packet decoder with bounded resynchronisation.
#[derive(Debug)]
pub struct PacketFramer {
    buffer: Vec<u8>,
    discarded: usize,
    resync_budget: usize,
    max_acl_payload: usize,
    max_sco_payload: usize,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::with_limits(DEFAULT_RESYNC_BUDGET, DEFAULT_MAX_ACL_PAYLOAD, DEFAULT_MAX_SCO_PAYLOAD)
    }
}

impl PacketFramer {
    /// Framer using the limits in `config`.
    #[must_use]
    pub fn new(config: &StackConfig) -> Self {
        Self::with_limits(config.resync_budget, config.max_acl_payload, config.max_sco_payload)
    }

    /// Framer with explicit resync budget and data payload limits.
    #[must_use]
    pub fn with_limits(resync_budget: usize, max_acl_payload: usize, max_sco_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            discarded: 0,
            resync_budget,
            max_acl_payload,
            max_sco_payload,
        }
    }

    /// Append raw transport bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes and the discard count.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarded = 0;
    }

    /// Decode the next complete packet, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ResyncBudgetExhausted`] once more than the
    /// configured number of consecutive bytes has been discarded. The count
    /// restarts afterwards, so a caller that chooses to continue can.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        loop {
            match self.decode_head() {
                Frame::Incomplete => return Ok(None),
                Frame::Packet(packet, consumed) => {
                    self.buffer.drain(..consumed);
                    if self.discarded > 0 {
                        tracing::debug!(discarded = self.discarded, "h4 stream resynchronised");
                        self.discarded = 0;
                    }
                    return Ok(Some(packet));
                }
                Frame::Rejected(reason, consumed) => {
                    tracing::warn!(%reason, len = consumed, "dropping undecodable frame");
                    self.buffer.drain(..consumed);
                    self.discarded = 0;
                }
                Frame::Malformed(reason) => {
                    if self.discarded == 0 {
                        tracing::warn!(%reason, "discarding bytes to resynchronise h4 stream");
                    }
                    self.buffer.remove(0);
                    self.discarded = self.discarded.saturating_add(1);
                    if self.discarded > self.resync_budget {
                        let discarded = core::mem::take(&mut self.discarded);
                        return Err(ProtocolError::ResyncBudgetExhausted { discarded });
                    }
                }
            }
        }
    }

    fn decode_head(&self) -> Frame {
        let Some((&indicator, rest)) = self.buffer.split_first() else {
            return Frame::Incomplete;
        };
        let kind = match PacketType::from_indicator(indicator) {
            Ok(kind) => kind,
            Err(e) => return Frame::Malformed(e),
        };

        match kind {
            PacketType::Command => {
                let [lo, hi, len, body @ ..] = rest else {
                    return Frame::Incomplete;
                };
                let Some(params) = body.get(..usize::from(*len)) else {
                    return Frame::Incomplete;
                };
                let opcode = Opcode::from_raw(u16::from_le_bytes([*lo, *hi]));
                match CommandPacket::new(opcode, params) {
                    Ok(cmd) => Frame::Packet(Packet::Command(cmd), frame_len(4, params.len())),
                    // A one-byte length can never exceed 255.
                    Err(_) => Frame::Malformed(ProtocolError::UnknownPacketType(indicator)),
                }
            }
            PacketType::Event => {
                let [code, len, body @ ..] = rest else {
                    return Frame::Incomplete;
                };
                let Some(params) = body.get(..usize::from(*len)) else {
                    return Frame::Incomplete;
                };
                let consumed = frame_len(3, params.len());
                match EventPacket::new(*code, params) {
                    Ok(evt) => Frame::Packet(Packet::Event(evt), consumed),
                    Err(e) => Frame::Rejected(e, consumed),
                }
            }
            PacketType::AclData => {
                let [h0, h1, l0, l1, body @ ..] = rest else {
                    return Frame::Incomplete;
                };
                let len = usize::from(u16::from_le_bytes([*l0, *l1]));
                if len > self.max_acl_payload {
                    return Frame::Malformed(ProtocolError::OversizedPayload {
                        link: LinkType::Acl,
                        len,
                        max: self.max_acl_payload,
                    });
                }
                let Some(data) = body.get(..len) else {
                    return Frame::Incomplete;
                };
                let acl = AclPacket::from_header(u16::from_le_bytes([*h0, *h1]), data.to_vec());
                Frame::Packet(Packet::AclData(acl), frame_len(5, len))
            }
            PacketType::ScoData => {
                let [h0, h1, len, body @ ..] = rest else {
                    return Frame::Incomplete;
                };
                let len = usize::from(*len);
                if len > self.max_sco_payload {
                    return Frame::Malformed(ProtocolError::OversizedPayload {
                        link: LinkType::Sco,
                        len,
                        max: self.max_sco_payload,
                    });
                }
                let Some(data) = body.get(..len) else {
                    return Frame::Incomplete;
                };
                let sco = ScoPacket::from_header(u16::from_le_bytes([*h0, *h1]), data.to_vec());
                Frame::Packet(Packet::ScoData(sco), frame_len(4, len))
            }
        }
    }
}

/// Indicator + header + payload.
fn frame_len(header_with_indicator: usize, payload: usize) -> usize {
    header_with_indicator.saturating_add(payload)
}
