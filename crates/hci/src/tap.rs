//! Packet tap: trace logging and debug callbacks for every packet on the link.

use core::fmt;

use crate::packet::Packet;
use crate::registry::{CallbackId, CallbackRegistry};

/// Which way a packet crossed the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    /// Host → controller.
    Sent,
    /// Controller → host.
    Received,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sent => "tx",
            Self::Received => "rx",
        })
    }
}

/// Debug callback signature.
pub type DebugCallback = dyn FnMut(PacketDirection, &Packet) + Send;

/// Space-separated upper-case hex.
pub(crate) struct HexDump<'a>(pub(crate) &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = self.0.iter();
        if let Some(first) = bytes.next() {
            write!(f, "{first:02X}")?;
        }
        for byte in bytes {
            write!(f, " {byte:02X}")?;
        }
        Ok(())
    }
}

pub(crate) struct PacketTap {
    callbacks: CallbackRegistry<DebugCallback, ()>,
}

impl PacketTap {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: CallbackRegistry::new("debug"),
        }
    }

    pub(crate) fn register(&self, id: CallbackId, callback: Box<DebugCallback>) {
        self.callbacks.register(id, (), callback);
    }

    pub(crate) fn unregister(&self, id: CallbackId, wait: bool) -> bool {
        self.callbacks.unregister(id, wait)
    }

    pub(crate) fn clear(&self) {
        self.callbacks.clear();
    }

    /// Log `packet` at trace level and hand it to every debug callback.
    pub(crate) fn observe(&self, direction: PacketDirection, packet: &Packet) {
        if tracing::enabled!(tracing::Level::TRACE) {
            if let Ok(bytes) = packet.encode() {
                tracing::trace!(%direction, len = bytes.len(), "{}", HexDump(&bytes));
            }
        }
        self.callbacks.dispatch(|()| true, |cb| cb(direction, packet));
    }
}
