//! HCI transport and command/event dispatch core.
//!
//! Talks the UART (H4) framing of the Bluetooth Host Controller Interface to
//! a controller over any byte stream, and gives the rest of a host stack a
//! thread-safe handle for commands, events and data.
//!
//! # Architecture
//!
//! ```text
//! application threads          dispatch thread
//! ───────────────────          ───────────────
//! Stack::send_command ──┐      Transport::Reader
//! Stack::send_acl_data ─┤              ↓
//!                       ↓      PacketFramer (H4 resync)
//!        CommandDispatcher ◄──  EventRouter ──► event callbacks
//!        (pending slot,                   ──► FlowControlManager
//!         write half)          DataCallbackRegistry ──► ACL/SCO callbacks
//! ```
//!
//! - [`Stack`] owns one connection: open it over a [`Transport`], close it or
//!   drop it.
//! - One command is pending at a time. Its Command Complete/Status wakes the
//!   caller and is not forwarded to subscribers.
//! - Callbacks run on the dispatch thread in registration order; a panicking
//!   callback is logged and skipped.
//! - Flow control tracks controller buffer credits per link type.
//! - [`fragment`] reassembles results fetched piecewise (AMP association).
//!
//! # Features
//!
//! - `serde`: (de)serialise [`StackConfig`] and the flow-control snapshot.
//!
//! # Example
//!
//! ```no_run
//! use hci::{EventFilter, Stack, StackConfig};
//! use std::net::TcpStream;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stack = Stack::open(TcpStream::connect("127.0.0.1:1234")?, StackConfig::default())?;
//! stack.register_event_callback(EventFilter::All, |event| {
//!     tracing::info!(code = event.code(), "event");
//! });
//! stack.reset()?;
//! println!("controller {}", stack.read_bd_addr()?);
//! # Ok(())
//! # }
//! ```

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(clippy::unreachable)] // no unreachable!() that isn't documented
#![deny(unused_must_use)]
// all Results must be handled
// ────────────────────────────────────────────────────────────────────────────
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::print_stdout)] // prefer tracing over println! in lib code
#![allow(clippy::doc_markdown)] // HCI command names in doc comments
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod commands;
pub mod config;
pub mod data;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod flow;
pub mod fragment;
pub mod framer;
pub mod opcode;
pub mod packet;
pub mod registry;
pub mod router;
pub mod stack;
pub(crate) mod state;
pub mod status;
pub mod tap;
pub mod transport;

pub use config::StackConfig;
pub use data::DataFilter;
pub use dispatcher::{CommandResponse, ResponseKind};
pub use error::{HciError, ProtocolError};
pub use event::{
    BdAddr, CompletedPackets, Event, EventCode, LeMetaEvent, LeSubeventCode, StoredLinkKey,
};
pub use flow::{CreditLedger, FlowControlState};
pub use fragment::{AssemblyState, Fragment, FragmentAssembly, FragmentFetch, FragmentSource};
pub use framer::PacketFramer;
pub use opcode::{ControllerFlowControl, HciCommand, Opcode};
pub use packet::{
    AclPacket, BoundaryFlag, CommandPacket, EventPacket, LinkType, Packet, PacketType, ScoPacket,
};
pub use registry::CallbackId;
pub use router::EventFilter;
pub use stack::Stack;
pub use status::StatusCode;
pub use tap::PacketDirection;
pub use transport::Transport;
