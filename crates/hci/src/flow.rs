//! Credit-based host ↔ controller flow control.
//!
//! One ledger per link type. While enabled, every outgoing data packet takes a
//! credit and every completed-packets acknowledgment hands credits back. An
//! acknowledgment larger than what is in flight is clamped and reported as
//! [`ProtocolError::CreditUnderflow`]; credits never go negative.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{HciError, ProtocolError};
use crate::event::CompletedPackets;
use crate::packet::LinkType;

/// Counters for one link type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CreditLedger {
    /// Credits granted by `enable`.
    pub capacity: u32,
    /// Credits left to spend.
    pub available: u32,
    /// Packets sent and not yet acknowledged.
    pub in_flight: u32,
    /// Data packets received on this link type.
    pub received: u64,
}

/// Point-in-time view of the flow-control state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowControlState {
    /// `false` means sends are never rejected.
    pub enabled: bool,
    /// ACL buffers.
    pub acl: CreditLedger,
    /// SCO buffers.
    pub sco: CreditLedger,
}

impl FlowControlState {
    /// Ledger for `link`.
    #[must_use]
    pub fn ledger(&self, link: LinkType) -> &CreditLedger {
        match link {
            LinkType::Acl => &self.acl,
            LinkType::Sco => &self.sco,
        }
    }

    fn ledger_mut(&mut self, link: LinkType) -> &mut CreditLedger {
        match link {
            LinkType::Acl => &mut self.acl,
            LinkType::Sco => &mut self.sco,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: FlowControlState,
    /// Link type of every handle that has carried outgoing data, for
    /// attributing controller acknowledgments.
    handles: HashMap<u16, LinkType>,
}

/// Thread-safe flow-control counters.
#[derive(Debug, Default)]
pub struct FlowControlManager {
    inner: Mutex<Inner>,
}

impl FlowControlManager {
    /// Manager with flow control disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enable credit accounting with the given buffer counts.
    ///
    /// `enable(0, 0)` is the same as [`disable`](Self::disable). Packets
    /// already in flight are forgotten.
    pub fn enable(&self, acl_credits: u32, sco_credits: u32) {
        let mut inner = self.lock();
        if acl_credits == 0 && sco_credits == 0 {
            inner.state.enabled = false;
            tracing::debug!("flow control disabled");
            return;
        }
        let received = (inner.state.acl.received, inner.state.sco.received);
        inner.state = FlowControlState {
            enabled: true,
            acl: CreditLedger {
                capacity: acl_credits,
                available: acl_credits,
                in_flight: 0,
                received: received.0,
            },
            sco: CreditLedger {
                capacity: sco_credits,
                available: sco_credits,
                in_flight: 0,
                received: received.1,
            },
        };
        inner.handles.clear();
        tracing::debug!(acl_credits, sco_credits, "flow control enabled");
    }

    /// Stop accounting; sends are never refused for credits.
    pub fn disable(&self) {
        self.enable(0, 0);
    }

    /// Whether credits are currently enforced.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lock().state.enabled
    }

    /// Take one credit for a packet about to be sent on `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`HciError::NoCredits`] when enabled and the ledger is empty.
    pub fn try_consume(&self, link: LinkType, handle: u16) -> Result<(), HciError> {
        let mut inner = self.lock();
        inner.handles.insert(handle, link);
        if !inner.state.enabled {
            return Ok(());
        }
        let ledger = inner.state.ledger_mut(link);
        if ledger.available == 0 {
            return Err(HciError::NoCredits { link });
        }
        ledger.available = ledger.available.saturating_sub(1);
        ledger.in_flight = ledger.in_flight.saturating_add(1);
        Ok(())
    }

    /// Give back a credit taken by [`try_consume`](Self::try_consume) for a
    /// packet that never reached the wire.
    pub fn refund(&self, link: LinkType) {
        let mut inner = self.lock();
        if !inner.state.enabled {
            return;
        }
        let ledger = inner.state.ledger_mut(link);
        if ledger.in_flight > 0 {
            ledger.in_flight = ledger.in_flight.saturating_sub(1);
            ledger.available = ledger.available.saturating_add(1);
        }
    }

    /// Return `count` credits for completed packets.
    ///
    /// Returns the number of credits actually restored.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CreditUnderflow`] when `count` exceeds the
    /// packets in flight. The ledger is still updated, clamped at zero in
    /// flight.
    pub fn release(&self, link: LinkType, count: u32) -> Result<u32, ProtocolError> {
        let mut inner = self.lock();
        if !inner.state.enabled {
            return Ok(0);
        }
        Self::release_locked(&mut inner.state, link, count)
    }

    fn release_locked(
        state: &mut FlowControlState,
        link: LinkType,
        count: u32,
    ) -> Result<u32, ProtocolError> {
        let ledger = state.ledger_mut(link);
        let restored = count.min(ledger.in_flight);
        ledger.in_flight = ledger.in_flight.saturating_sub(restored);
        ledger.available = ledger.available.saturating_add(restored).min(ledger.capacity);
        if restored < count {
            let in_flight = restored;
            tracing::warn!(%link, acknowledged = count, in_flight, "credit underflow clamped");
            return Err(ProtocolError::CreditUnderflow {
                link,
                acknowledged: count,
                in_flight,
            });
        }
        Ok(restored)
    }

    /// Apply a controller Number Of Completed Packets report.
    ///
    /// Handles that never carried outgoing data are attributed to ACL.
    /// Every entry is applied; the first underflow, if any, is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CreditUnderflow`] as for
    /// [`release`](Self::release).
    pub fn release_handles(&self, entries: &[CompletedPackets]) -> Result<u32, ProtocolError> {
        let mut inner = self.lock();
        if !inner.state.enabled {
            return Ok(0);
        }
        let mut restored = 0u32;
        let mut first_error = None;
        for entry in entries {
            let link = inner.handles.get(&entry.handle).copied().unwrap_or(LinkType::Acl);
            match Self::release_locked(&mut inner.state, link, u32::from(entry.count)) {
                Ok(n) => restored = restored.saturating_add(n),
                Err(e) => {
                    if let ProtocolError::CreditUnderflow { in_flight, .. } = e {
                        restored = restored.saturating_add(in_flight);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(restored), Err)
    }

    /// Count one received data packet.
    pub fn record_received(&self, link: LinkType) {
        let mut inner = self.lock();
        let ledger = inner.state.ledger_mut(link);
        ledger.received = ledger.received.saturating_add(1);
    }

    /// Copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> FlowControlState {
        self.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_rejects() {
        let flow = FlowControlManager::new();
        for _ in 0..100 {
            assert!(flow.try_consume(LinkType::Acl, 1).is_ok());
        }
        assert_eq!(flow.snapshot().acl.in_flight, 0);
    }

    #[test]
    fn credits_run_out_and_come_back() {
        let flow = FlowControlManager::new();
        flow.enable(2, 0);
        assert!(flow.try_consume(LinkType::Acl, 1).is_ok());
        assert!(flow.try_consume(LinkType::Acl, 1).is_ok());
        assert_eq!(
            flow.try_consume(LinkType::Acl, 1),
            Err(HciError::NoCredits { link: LinkType::Acl })
        );
        assert_eq!(flow.release(LinkType::Acl, 1), Ok(1));
        assert_eq!(flow.snapshot().acl.available, 1);
    }

    #[test]
    fn links_are_independent() {
        let flow = FlowControlManager::new();
        flow.enable(1, 1);
        assert!(flow.try_consume(LinkType::Acl, 1).is_ok());
        assert!(flow.try_consume(LinkType::Sco, 2).is_ok());
        assert!(flow.try_consume(LinkType::Sco, 2).is_err());
    }

    #[test]
    fn underflow_is_clamped() {
        let flow = FlowControlManager::new();
        flow.enable(4, 0);
        assert!(flow.try_consume(LinkType::Acl, 1).is_ok());
        assert_eq!(
            flow.release(LinkType::Acl, 3),
            Err(ProtocolError::CreditUnderflow {
                link: LinkType::Acl,
                acknowledged: 3,
                in_flight: 1,
            })
        );
        let acl = flow.snapshot().acl;
        assert_eq!(acl.in_flight, 0);
        assert_eq!(acl.available, 4);
    }

    #[test]
    fn controller_report_uses_handle_link() {
        let flow = FlowControlManager::new();
        flow.enable(2, 2);
        assert!(flow.try_consume(LinkType::Sco, 7).is_ok());
        let restored = flow.release_handles(&[CompletedPackets { handle: 7, count: 1 }]);
        assert_eq!(restored, Ok(1));
        assert_eq!(flow.snapshot().sco.available, 2);
    }

    #[test]
    fn enable_zero_disables() {
        let flow = FlowControlManager::new();
        flow.enable(3, 0);
        flow.enable(0, 0);
        assert!(!flow.is_enabled());
    }

    #[test]
    fn received_counter_survives_reenable() {
        let flow = FlowControlManager::new();
        flow.record_received(LinkType::Acl);
        flow.enable(1, 1);
        assert_eq!(flow.snapshot().acl.received, 1);
    }
}
