//! Subscription semantics: ordering, filtering, removal and panic isolation.

// Test files legitimately use expect() for readable assertions.
#![allow(clippy::expect_used)]
#![allow(clippy::panic)] // one callback panics on purpose

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hci::transport::mock::{MockController, MockTransport};
use hci::{
    AclPacket, BoundaryFlag, CallbackId, DataFilter, Event, EventFilter, LinkType, Opcode, Packet,
    PacketDirection, PacketType, ScoPacket, Stack, StackConfig, StatusCode,
};

const WAIT: Duration = Duration::from_secs(2);

fn open() -> (Arc<Stack>, MockController) {
    let (transport, controller) = MockTransport::pair();
    let stack = Stack::open(transport, StackConfig::default()).expect("stack opens");
    (Arc::new(stack), controller)
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now().checked_add(WAIT).expect("deadline fits");
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn counter(hits: &Arc<AtomicUsize>) -> impl FnMut(&Event) + Send + 'static {
    let hits = Arc::clone(hits);
    move |_: &Event| {
        hits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Inquiry Complete, success.
fn inquiry_complete(controller: &MockController) {
    controller.inject_event(0x01, &[0x00]);
}

/// Register a catch-all subscriber and return a receiver that yields once per
/// delivered event. Registered last, it fires after every other subscriber.
fn sentinel(stack: &Stack) -> mpsc::Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    stack.register_event_callback(EventFilter::All, move |event: &Event| {
        let _ = tx.send(event.code());
    });
    rx
}

#[test]
fn same_logic_registered_twice_runs_twice() {
    let (stack, controller) = open();
    let hits = Arc::new(AtomicUsize::new(0));
    let first = stack.register_event_callback(EventFilter::Code(0x01), counter(&hits));
    let second = stack.register_event_callback(EventFilter::Code(0x01), counter(&hits));
    assert_ne!(first, second);

    inquiry_complete(&controller);
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 2));
}

#[test]
fn callbacks_run_in_registration_order() {
    let (stack, controller) = open();
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..4u8 {
        let order = Arc::clone(&order);
        stack.register_event_callback(EventFilter::All, move |_: &Event| {
            order.lock().expect("order lock").push(tag);
        });
    }
    let done = sentinel(&stack);

    inquiry_complete(&controller);
    done.recv_timeout(WAIT).expect("event delivered");
    assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2, 3]);
}

#[test]
fn unregistered_callback_is_not_invoked_again() {
    let (stack, controller) = open();
    let hits = Arc::new(AtomicUsize::new(0));
    let id = stack.register_event_callback(EventFilter::Code(0x01), counter(&hits));
    let done = sentinel(&stack);

    inquiry_complete(&controller);
    done.recv_timeout(WAIT).expect("first event");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(stack.unregister_callback(id));
    assert!(!stack.unregister_callback(id));
    inquiry_complete(&controller);
    done.recv_timeout(WAIT).expect("second event");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn unregister_waits_for_the_running_invocation() {
    let (stack, controller) = open();
    let (entered_tx, entered) = mpsc::channel();
    let (release, release_rx) = mpsc::channel::<()>();
    let finished = Arc::new(AtomicBool::new(false));
    let hits = Arc::new(AtomicUsize::new(0));
    let id = {
        let finished = Arc::clone(&finished);
        let hits = Arc::clone(&hits);
        stack.register_event_callback(EventFilter::Code(0x01), move |_: &Event| {
            hits.fetch_add(1, Ordering::SeqCst);
            let _ = entered_tx.send(());
            let _ = release_rx.recv_timeout(WAIT);
            finished.store(true, Ordering::SeqCst);
        })
    };
    let done = sentinel(&stack);

    inquiry_complete(&controller);
    entered.recv_timeout(WAIT).expect("callback entered");

    let (unregistered_tx, unregistered) = mpsc::channel();
    let remover = {
        let stack = Arc::clone(&stack);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            let removed = stack.unregister_callback(id);
            let _ = unregistered_tx.send((removed, finished.load(Ordering::SeqCst)));
        })
    };
    assert!(unregistered.recv_timeout(Duration::from_millis(50)).is_err());

    release.send(()).expect("callback still waiting");
    let (removed, finished_first) = unregistered.recv_timeout(WAIT).expect("unregister returned");
    assert!(removed);
    assert!(finished_first);
    remover.join().expect("remover thread");
    done.recv_timeout(WAIT).expect("first event");

    inquiry_complete(&controller);
    done.recv_timeout(WAIT).expect("second event");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn debug_callback_can_unregister_itself_while_sending() {
    let (stack, _controller) = open();
    let hits = Arc::new(AtomicUsize::new(0));
    let own_id: Arc<Mutex<Option<CallbackId>>> = Arc::new(Mutex::new(None));
    let id = {
        let weak = Arc::downgrade(&stack);
        let own_id = Arc::clone(&own_id);
        let hits = Arc::clone(&hits);
        stack.register_debug_callback(move |direction: PacketDirection, _: &Packet| {
            if direction != PacketDirection::Sent {
                return;
            }
            hits.fetch_add(1, Ordering::SeqCst);
            let id = *own_id.lock().expect("id lock");
            if let (Some(stack), Some(id)) = (weak.upgrade(), id) {
                assert!(stack.unregister_callback(id));
            }
        })
    };
    *own_id.lock().expect("id lock") = Some(id);

    let (tx, rx) = mpsc::channel();
    let sender = {
        let stack = Arc::clone(&stack);
        thread::spawn(move || {
            for _ in 0..2 {
                let _ = tx.send(stack.send_command(Opcode::RESET, &[], false, Duration::ZERO));
            }
        })
    };
    for _ in 0..2 {
        let sent = rx.recv_timeout(WAIT).expect("sender did not block");
        assert_eq!(sent, Ok(None));
    }
    sender.join().expect("sender thread");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn debug_callback_can_send_while_observing_a_received_packet() {
    let (stack, mut controller) = open();
    let sent_once = Arc::new(AtomicBool::new(false));
    {
        let weak = Arc::downgrade(&stack);
        let sent_once = Arc::clone(&sent_once);
        stack.register_debug_callback(move |direction: PacketDirection, _: &Packet| {
            if direction != PacketDirection::Received || sent_once.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(stack) = weak.upgrade() {
                let sent = stack.send_command(Opcode::RESET, &[], false, Duration::ZERO);
                assert_eq!(sent, Ok(None));
            }
        });
    }
    let done = sentinel(&stack);

    inquiry_complete(&controller);
    let cmd = controller.next_command(WAIT).expect("command written from the callback");
    assert_eq!(cmd.opcode, Opcode::RESET);
    done.recv_timeout(WAIT).expect("first event");

    inquiry_complete(&controller);
    done.recv_timeout(WAIT).expect("dispatch thread still running");
    assert!(stack.is_running());
}

#[test]
fn unknown_id_is_reported() {
    let (stack, _controller) = open();
    let id = stack.register_debug_callback(|_: PacketDirection, _: &Packet| {});
    assert!(stack.unregister_callback(id));
    assert!(!stack.unregister_callback(id));
}

#[test]
fn callback_can_unregister_itself() {
    let (stack, controller) = open();
    let hits = Arc::new(AtomicUsize::new(0));
    let own_id: Arc<Mutex<Option<CallbackId>>> = Arc::new(Mutex::new(None));

    let id = {
        let weak = Arc::downgrade(&stack);
        let own_id = Arc::clone(&own_id);
        let hits = Arc::clone(&hits);
        stack.register_event_callback(EventFilter::Code(0x01), move |_: &Event| {
            hits.fetch_add(1, Ordering::SeqCst);
            let id = *own_id.lock().expect("id lock");
            if let (Some(stack), Some(id)) = (weak.upgrade(), id) {
                assert!(stack.unregister_callback(id));
            }
        })
    };
    *own_id.lock().expect("id lock") = Some(id);
    let done = sentinel(&stack);

    inquiry_complete(&controller);
    inquiry_complete(&controller);
    done.recv_timeout(WAIT).expect("first event");
    done.recv_timeout(WAIT).expect("second event");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn callback_can_unregister_a_later_one() {
    let (stack, controller) = open();
    let later_hits = Arc::new(AtomicUsize::new(0));
    let later: Arc<Mutex<Option<CallbackId>>> = Arc::new(Mutex::new(None));
    {
        let weak = Arc::downgrade(&stack);
        let later = Arc::clone(&later);
        stack.register_event_callback(EventFilter::Code(0x01), move |_: &Event| {
            let id = later.lock().expect("id lock").take();
            if let (Some(stack), Some(id)) = (weak.upgrade(), id) {
                stack.unregister_callback(id);
            }
        });
    }
    let id = stack.register_event_callback(EventFilter::Code(0x01), counter(&later_hits));
    *later.lock().expect("id lock") = Some(id);
    let done = sentinel(&stack);

    inquiry_complete(&controller);
    done.recv_timeout(WAIT).expect("event delivered");
    assert_eq!(later_hits.load(Ordering::SeqCst), 0);
}

#[test]
fn le_sub_event_filters_are_independent() {
    let (stack, controller) = open();
    let connections = Arc::new(AtomicUsize::new(0));
    let reports = Arc::new(AtomicUsize::new(0));
    let all_le = Arc::new(AtomicUsize::new(0));
    stack.register_event_callback(EventFilter::LeSubevent(0x01), counter(&connections));
    stack.register_event_callback(EventFilter::LeSubevent(0x02), counter(&reports));
    stack.register_event_callback(EventFilter::Code(0x3E), counter(&all_le));
    let done = sentinel(&stack);

    // LE Connection Complete: handle 0x0040, master, public 11:22:33:44:55:66.
    controller.inject_event(
        0x3E,
        &[
            0x01, 0x00, 0x40, 0x00, 0x00, 0x00, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x18, 0x00,
            0x00, 0x00, 0xC8, 0x00, 0x00,
        ],
    );
    // LE Advertising Report with one opaque report.
    controller.inject_event(0x3E, &[0x02, 0x01, 0xAA, 0xBB]);
    done.recv_timeout(WAIT).expect("connection complete");
    done.recv_timeout(WAIT).expect("advertising report");

    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(reports.load(Ordering::SeqCst), 1);
    assert_eq!(all_le.load(Ordering::SeqCst), 2);
}

#[test]
fn panicking_callback_does_not_stop_dispatch() {
    let (stack, controller) = open();
    stack.register_event_callback(EventFilter::Code(0x01), |_: &Event| {
        panic!("subscriber bug");
    });
    let hits = Arc::new(AtomicUsize::new(0));
    stack.register_event_callback(EventFilter::Code(0x01), counter(&hits));

    inquiry_complete(&controller);
    inquiry_complete(&controller);
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 2));
    assert!(stack.is_running());
}

#[test]
fn debug_tap_sees_both_directions() {
    let (stack, mut controller) = open();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        stack.register_debug_callback(move |direction: PacketDirection, packet: &Packet| {
            seen.lock()
                .expect("tap lock")
                .push((direction, packet.packet_type()));
        });
    }

    let responder = thread::spawn(move || {
        let cmd = controller.next_command(WAIT).expect("reset written");
        controller.complete_command(cmd.opcode, StatusCode::SUCCESS, &[]);
        controller
    });
    stack.execute(Opcode::RESET, &[]).expect("reset succeeds");
    let _controller = responder.join().expect("controller thread");

    assert!(eventually(|| seen.lock().expect("tap lock").len() == 2));
    assert_eq!(
        *seen.lock().expect("tap lock"),
        vec![
            (PacketDirection::Sent, PacketType::Command),
            (PacketDirection::Received, PacketType::Event),
        ]
    );
}

#[test]
fn acl_data_is_filtered_by_handle() {
    let (stack, controller) = open();
    let (tx, rx) = mpsc::channel();
    stack.register_acl_data_callback(DataFilter::Handle(0x0042), move |packet: &AclPacket| {
        let _ = tx.send(packet.clone());
    });
    let any = Arc::new(AtomicUsize::new(0));
    {
        let any = Arc::clone(&any);
        stack.register_acl_data_callback(DataFilter::All, move |_: &AclPacket| {
            any.fetch_add(1, Ordering::SeqCst);
        });
    }

    controller.inject_packet(&Packet::AclData(AclPacket::new(
        0x0001,
        BoundaryFlag::FirstFlushable,
        vec![0xEE],
    )));
    controller.inject_packet(&Packet::AclData(AclPacket::new(
        0x0042,
        BoundaryFlag::FirstFlushable,
        vec![1, 2, 3],
    )));

    let packet = rx.recv_timeout(WAIT).expect("handle 0x0042 delivered");
    assert_eq!(packet.handle, 0x0042);
    assert_eq!(packet.boundary, BoundaryFlag::FirstFlushable);
    assert_eq!(packet.data, vec![1, 2, 3]);
    assert!(eventually(|| any.load(Ordering::SeqCst) == 2));
    assert_eq!(stack.flow_control().ledger(LinkType::Acl).received, 2);
}

#[test]
fn sco_data_reaches_sco_subscribers() {
    let (stack, controller) = open();
    let (tx, rx) = mpsc::channel();
    stack.register_sco_data_callback(DataFilter::All, move |packet: &ScoPacket| {
        let _ = tx.send(packet.data.clone());
    });

    controller.inject_packet(&Packet::ScoData(ScoPacket::new(0x0003, vec![9; 30])));
    assert_eq!(rx.recv_timeout(WAIT).expect("sco delivered"), vec![9; 30]);
    assert_eq!(stack.flow_control().sco.received, 1);
}

#[test]
fn close_removes_subscriptions() {
    let (stack, controller) = open();
    let hits = Arc::new(AtomicUsize::new(0));
    let id = stack.register_event_callback(EventFilter::All, counter(&hits));
    stack.close();
    assert!(!stack.unregister_callback(id));
    inquiry_complete(&controller);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}
