//! Host → controller credit accounting through the public stack API.

// Test files legitimately use expect() for readable assertions.
#![allow(clippy::expect_used)]

use std::thread;
use std::time::{Duration, Instant};

use hci::transport::mock::{MockController, MockTransport};
use hci::{
    BoundaryFlag, CompletedPackets, HciError, LinkType, Opcode, Packet, ProtocolError, Stack,
    StackConfig, StatusCode,
};

const WAIT: Duration = Duration::from_secs(2);

fn open() -> (Stack, MockController) {
    let (transport, controller) = MockTransport::pair();
    let stack = Stack::open(transport, StackConfig::default()).expect("stack opens");
    (stack, controller)
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

fn send(stack: &Stack, handle: u16) -> Result<(), HciError> {
    stack.send_acl_data(handle, BoundaryFlag::FirstFlushable, &[0x5A; 8])
}

#[test]
fn disabled_flow_control_never_blocks() {
    let (stack, mut controller) = open();
    for _ in 0..32 {
        send(&stack, 0x0001).expect("unlimited while disabled");
    }
    assert!(matches!(controller.next_packet(WAIT), Some(Packet::AclData(_))));
    assert!(!stack.flow_control().enabled);
}

#[test]
fn fifth_packet_on_four_credits_is_refused() {
    let (stack, mut controller) = open();
    stack.set_host_flow_control(4, 0);

    for _ in 0..4 {
        send(&stack, 0x0001).expect("credit available");
    }
    assert_eq!(send(&stack, 0x0001), Err(HciError::NoCredits { link: LinkType::Acl }));

    let acl = *stack.flow_control().ledger(LinkType::Acl);
    assert_eq!(acl.available, 0);
    assert_eq!(acl.in_flight, 4);

    for _ in 0..4 {
        let packet = controller.next_packet(WAIT).expect("data written");
        let Packet::AclData(acl) = packet else {
            unreachable!("only data was sent");
        };
        assert_eq!(acl.handle, 0x0001);
        assert_eq!(acl.data, vec![0x5A; 8]);
    }
    assert!(controller.next_packet(Duration::from_millis(20)).is_none());
}

#[test]
fn acknowledgment_restores_exactly_that_many_credits() {
    let (stack, mut controller) = open();
    stack.set_host_flow_control(4, 0);
    for _ in 0..4 {
        send(&stack, 0x0001).expect("credit available");
    }

    let restored = stack
        .acknowledge_completed_packets(LinkType::Acl, &[CompletedPackets { handle: 0x0001, count: 2 }])
        .expect("two in flight can be acknowledged");
    assert_eq!(restored, 2);

    let acl = *stack.flow_control().ledger(LinkType::Acl);
    assert_eq!(acl.available, 2);
    assert_eq!(acl.in_flight, 2);

    let cmd = controller.next_command(WAIT).expect("acknowledgment sent");
    assert_eq!(cmd.opcode, Opcode::HOST_NUMBER_OF_COMPLETED_PACKETS);
    assert_eq!(cmd.parameters.as_slice(), &[0x01, 0x01, 0x00, 0x02, 0x00]);

    send(&stack, 0x0001).expect("credit came back");
    send(&stack, 0x0001).expect("credit came back");
    assert!(matches!(send(&stack, 0x0001), Err(HciError::NoCredits { .. })));
}

#[test]
fn over_acknowledgment_is_clamped_and_reported() {
    let (stack, _controller) = open();
    stack.set_host_flow_control(4, 2);
    send(&stack, 0x0001).expect("credit available");

    let err = stack
        .acknowledge_completed_packets(LinkType::Acl, &[CompletedPackets { handle: 0x0001, count: 3 }])
        .expect_err("only one in flight");
    assert_eq!(
        err,
        HciError::Protocol(ProtocolError::CreditUnderflow {
            link: LinkType::Acl,
            acknowledged: 3,
            in_flight: 1,
        })
    );
    let acl = *stack.flow_control().ledger(LinkType::Acl);
    assert_eq!(acl.available, 4);
    assert_eq!(acl.in_flight, 0);
    assert!(stack.is_running());
}

#[test]
fn completed_packets_event_returns_credits() {
    let (stack, controller) = open();
    stack.set_host_flow_control(4, 2);
    send(&stack, 0x0001).expect("acl credit");
    send(&stack, 0x0001).expect("acl credit");
    stack.send_sco_data(0x0002, &[0; 16]).expect("sco credit");

    // Number Of Completed Packets: handle 1 → 2, handle 2 → 1.
    controller.inject_event(0x13, &[0x02, 0x01, 0x00, 0x02, 0x00, 0x02, 0x00, 0x01, 0x00]);
    assert!(eventually(|| {
        let state = stack.flow_control();
        state.acl.available == 4 && state.sco.available == 2
    }));
}

#[test]
fn links_are_accounted_separately() {
    let (stack, _controller) = open();
    stack.set_host_flow_control(1, 1);
    send(&stack, 0x0001).expect("acl credit");
    assert!(matches!(send(&stack, 0x0001), Err(HciError::NoCredits { link: LinkType::Acl })));
    stack.send_sco_data(0x0002, &[0; 4]).expect("sco unaffected");
    assert_eq!(
        stack.send_sco_data(0x0002, &[0; 4]),
        Err(HciError::NoCredits { link: LinkType::Sco })
    );
}

#[test]
fn reset_disables_flow_control() {
    let (stack, mut controller) = open();
    stack.set_host_flow_control(1, 0);
    send(&stack, 0x0001).expect("acl credit");
    assert!(controller.next_packet(WAIT).is_some());

    let responder = thread::spawn(move || {
        let cmd = controller.next_command(WAIT).expect("reset written");
        controller.complete_command(cmd.opcode, StatusCode::SUCCESS, &[]);
        controller
    });
    stack.reset().expect("reset succeeds");
    let _controller = responder.join().expect("controller thread");

    assert!(!stack.flow_control().enabled);
    send(&stack, 0x0001).expect("no accounting after reset");
}

#[test]
fn oversized_data_is_rejected_without_taking_a_credit() {
    let (stack, _controller) = open();
    stack.set_host_flow_control(1, 1);
    assert_eq!(
        stack.send_sco_data(0x0002, &[0; 256]),
        Err(HciError::DataTooLong { len: 256, max: 255 })
    );
    assert_eq!(stack.flow_control().sco.available, 1);
}

#[test]
fn failed_write_refunds_the_credit() {
    let (stack, controller) = open();
    stack.set_host_flow_control(2, 0);
    controller.fail_writes();
    assert!(matches!(send(&stack, 0x0001), Err(HciError::Transport { .. })));
    assert_eq!(stack.flow_control().acl.available, 2);
}
