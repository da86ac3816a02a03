//! ACL / SCO data subscriptions.

use crate::flow::FlowControlManager;
use crate::packet::{AclPacket, LinkType, ScoPacket};
use crate::registry::{CallbackId, CallbackRegistry};

/// Which data packets a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFilter {
    /// Every packet of the subscribed link type.
    All,
    /// Only packets on this connection handle.
    Handle(u16),
}

impl DataFilter {
    /// `true` when a packet on `handle` passes this filter.
    #[must_use]
    pub fn matches(&self, handle: u16) -> bool {
        match *self {
            Self::All => true,
            Self::Handle(h) => h & 0x0FFF == handle,
        }
    }
}

/// ACL data callback signature.
pub type AclCallback = dyn FnMut(&AclPacket) + Send;
/// SCO data callback signature.
pub type ScoCallback = dyn FnMut(&ScoPacket) + Send;

pub(crate) struct DataCallbackRegistry {
    acl: CallbackRegistry<AclCallback, DataFilter>,
    sco: CallbackRegistry<ScoCallback, DataFilter>,
}

impl DataCallbackRegistry {
    pub(crate) fn new() -> Self {
        Self {
            acl: CallbackRegistry::new("acl"),
            sco: CallbackRegistry::new("sco"),
        }
    }

    pub(crate) fn register_acl(&self, id: CallbackId, filter: DataFilter, cb: Box<AclCallback>) {
        self.acl.register(id, filter, cb);
    }

    pub(crate) fn register_sco(&self, id: CallbackId, filter: DataFilter, cb: Box<ScoCallback>) {
        self.sco.register(id, filter, cb);
    }

    pub(crate) fn unregister(&self, id: CallbackId, wait: bool) -> bool {
        self.acl.unregister(id, wait) || self.sco.unregister(id, wait)
    }

    pub(crate) fn clear(&self) {
        self.acl.clear();
        self.sco.clear();
    }

    /// Count the packet, then hand it to matching subscribers.
    pub(crate) fn deliver_acl(&self, packet: &AclPacket, flow: &FlowControlManager) -> usize {
        flow.record_received(LinkType::Acl);
        self.acl
            .dispatch(|filter| filter.matches(packet.handle), |cb| cb(packet))
    }

    pub(crate) fn deliver_sco(&self, packet: &ScoPacket, flow: &FlowControlManager) -> usize {
        flow.record_received(LinkType::Sco);
        self.sco
            .dispatch(|filter| filter.matches(packet.handle), |cb| cb(packet))
    }
}
