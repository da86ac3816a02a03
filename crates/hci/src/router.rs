//! Event routing.
//!
//! Every decoded event passes through [`EventRouter::route`] on the dispatch
//! thread. Command Complete/Status for the command in flight is handed to the
//! [`CommandDispatcher`] and stops there. Number Of Completed Packets returns
//! flow-control credits. Whatever was not consumed goes to subscribers whose
//! [`EventFilter`] matches, in registration order.

use crate::dispatcher::{CommandDispatcher, CommandResponse};
use crate::event::Event;
use crate::flow::FlowControlManager;
use crate::registry::{CallbackId, CallbackRegistry};

/// Which events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event not consumed by a pending command.
    All,
    /// Events with this outer event code.
    Code(u8),
    /// LE Meta events (0x3E) with this sub-event code.
    LeSubevent(u8),
}

impl EventFilter {
    /// `true` when `event` passes this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        match *self {
            Self::All => true,
            Self::Code(code) => event.code() == code,
            Self::LeSubevent(sub) => event.le_subevent() == Some(sub),
        }
    }
}

/// Event callback signature.
pub type EventCallback = dyn FnMut(&Event) + Send;

pub(crate) struct EventRouter {
    subscribers: CallbackRegistry<EventCallback, EventFilter>,
}

impl EventRouter {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: CallbackRegistry::new("event"),
        }
    }

    pub(crate) fn register(&self, id: CallbackId, filter: EventFilter, callback: Box<EventCallback>) {
        self.subscribers.register(id, filter, callback);
    }

    pub(crate) fn unregister(&self, id: CallbackId, wait: bool) -> bool {
        self.subscribers.unregister(id, wait)
    }

    pub(crate) fn clear(&self) {
        self.subscribers.clear();
    }

    /// Route one event. Returns the number of subscribers invoked.
    pub(crate) fn route(
        &self,
        event: &Event,
        commands: &CommandDispatcher,
        flow: &FlowControlManager,
    ) -> usize {
        match event {
            Event::CommandComplete(cc) => {
                if commands.resolve(CommandResponse::from_complete(cc)) {
                    return 0;
                }
            }
            Event::CommandStatus(cs) => {
                if commands.resolve(CommandResponse::from_status(cs)) {
                    return 0;
                }
            }
            Event::NumberOfCompletedPackets(entries) => {
                // Underflow is already logged by the manager; the event is
                // still delivered.
                let _ = flow.release_handles(entries);
            }
            Event::HardwareError { hardware_code } => {
                tracing::warn!(hardware_code, "controller reported a hardware error");
            }
            Event::DataBufferOverflow { link_type } => {
                tracing::warn!(link_type, "controller data buffer overflow");
            }
            _ => {}
        }
        self.subscribers
            .dispatch(|filter| filter.matches(event), |cb| cb(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommandComplete, LeMetaEvent};
    use crate::opcode::Opcode;
    use crate::status::StatusCode;

    #[test]
    fn le_filter_matches_sub_event_only() {
        let event = Event::LeMeta(LeMetaEvent::AdvertisingReport {
            num_reports: 0,
            reports: Vec::new(),
        });
        assert!(EventFilter::Code(0x3E).matches(&event));
        assert!(EventFilter::LeSubevent(0x02).matches(&event));
        assert!(!EventFilter::LeSubevent(0x01).matches(&event));
        assert!(!EventFilter::LeSubevent(0x02).matches(&Event::InquiryComplete {
            status: StatusCode::SUCCESS,
        }));
    }

    #[test]
    fn unsolicited_completion_reaches_subscribers() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let router = EventRouter::new();
        let commands = CommandDispatcher::new(Box::new(std::io::sink()));
        let flow = FlowControlManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        router.register(
            crate::registry::CallbackIds::new().next(),
            EventFilter::Code(0x0E),
            Box::new(move |_: &Event| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let nop = Event::CommandComplete(CommandComplete {
            num_hci_command_packets: 5,
            opcode: Opcode::NOP,
            return_parameters: Vec::new(),
        });
        assert_eq!(router.route(&nop, &commands, &flow), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(commands.credits(), 5);
    }
}
