//! Error types for the HCI dispatch core.
//!
//! Every fallible operation in the crate returns [`HciError`]. Wire-level
//! anomalies are grouped under [`ProtocolError`] so callers can tell "the
//! controller said no" apart from "the byte stream is broken".

use std::io;

use thiserror::Error;

use crate::opcode::Opcode;
use crate::packet::LinkType;
use crate::status::StatusCode;

/// Malformed traffic, inconsistent fragments and credit accounting faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The first byte is not a recognised H4 packet-type indicator.
    #[error("unknown packet type indicator 0x{0:02X}")]
    UnknownPacketType(u8),

    /// Event parameters do not match the layout required by the event code.
    #[error("malformed parameters for event 0x{code:02X}")]
    MalformedEvent {
        /// Event code of the offending packet.
        code: u8,
    },

    /// A data packet header announces more payload than the stack accepts.
    #[error("{link} payload of {len} bytes exceeds the {max}-byte limit")]
    OversizedPayload {
        /// Link the packet belongs to.
        link: LinkType,
        /// Declared payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Too many consecutive bytes were discarded while resynchronising.
    #[error("resync budget exhausted after discarding {discarded} consecutive bytes")]
    ResyncBudgetExhausted {
        /// Number of bytes thrown away without decoding a packet.
        discarded: usize,
    },

    /// A fragment did not start where the previous one ended.
    #[error("fragment starts at offset {got}, expected {expected}")]
    FragmentOffsetMismatch {
        /// Offset the assembly was waiting for.
        expected: usize,
        /// Offset the fragment reported.
        got: usize,
    },

    /// A fragment's remaining-length disagrees with the announced total.
    #[error("fragment implies a {reported}-byte result, first fragment announced {expected}")]
    FragmentLengthMismatch {
        /// Total announced by the first fragment.
        expected: usize,
        /// Total implied by this fragment.
        reported: usize,
    },

    /// An empty fragment claimed more data was still pending.
    #[error("empty fragment at offset {offset} with data remaining")]
    StalledFragment {
        /// Offset of the stalled request.
        offset: usize,
    },

    /// A fragment was offered to an assembly that already failed.
    #[error("fragment assembly was aborted; restart it before feeding more fragments")]
    AssemblyAborted,

    /// More packets were acknowledged than were ever in flight.
    #[error("acknowledged {acknowledged} {link} packets with only {in_flight} in flight")]
    CreditUnderflow {
        /// Link whose ledger would have gone negative.
        link: LinkType,
        /// Count carried by the acknowledgment.
        acknowledged: u32,
        /// Packets actually in flight.
        in_flight: u32,
    },

    /// Return parameters are shorter than the command's documented layout.
    #[error("return parameters for command {opcode} are truncated")]
    TruncatedResponse {
        /// Command whose response was short.
        opcode: Opcode,
    },
}

/// Errors surfaced by the stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HciError {
    /// I/O failure on the underlying link. Fatal: the stack stops.
    #[error("transport failure ({kind:?}): {message}")]
    Transport {
        /// `std::io` classification of the failure.
        kind: io::ErrorKind,
        /// Human-readable description from the transport.
        message: String,
    },

    /// No matching completion arrived before the deadline.
    #[error("command {opcode} timed out")]
    Timeout {
        /// Command that was waiting.
        opcode: Opcode,
    },

    /// Malformed or inconsistent traffic.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Flow control has no credit left for this link.
    #[error("no {link} credits available")]
    NoCredits {
        /// Link that ran dry.
        link: LinkType,
    },

    /// A variable-length result exceeds its documented bound.
    #[error("result needs {needed} bytes but the buffer holds {capacity}")]
    BufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        capacity: usize,
    },

    /// The controller completed the command with a non-zero status.
    #[error("command {opcode} failed: {status}")]
    CommandFailed {
        /// Command that failed.
        opcode: Opcode,
        /// Status reported by the controller.
        status: StatusCode,
    },

    /// Command parameters do not fit in one command packet.
    #[error("command parameters of {len} bytes exceed the 255-byte limit")]
    CommandTooLong {
        /// Offending parameter length.
        len: usize,
    },

    /// Data payload does not fit the packet's length field.
    #[error("data payload of {len} bytes exceeds the {max}-byte limit")]
    DataTooLong {
        /// Offending payload length.
        len: usize,
        /// Maximum for the packet type.
        max: usize,
    },

    /// The stack has been closed or is closing.
    #[error("stack is shutting down")]
    ShuttingDown,

    /// A blocking command was issued from inside a dispatch callback.
    #[error("blocking command issued from the dispatch thread")]
    WouldDeadlock,
}

impl HciError {
    /// `true` for errors after which the stack no longer runs.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ShuttingDown
                | Self::Protocol(ProtocolError::ResyncBudgetExhausted { .. })
        )
    }
}

impl From<io::Error> for HciError {
    fn from(e: io::Error) -> Self {
        Self::Transport {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
