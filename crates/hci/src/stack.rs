//! The stack handle: one open connection to a controller.
//!
//! [`Stack::open`] splits the transport and starts the dispatch thread. That
//! thread owns the read half and the [`PacketFramer`]; it decodes packets,
//! resolves the pending command, updates flow control and runs every
//! callback. Application threads issue commands and data through the shared
//! write half and never touch the read path.

use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::StackConfig;
use crate::data::{DataCallbackRegistry, DataFilter};
use crate::dispatcher::{CommandDispatcher, CommandResponse};
use crate::error::{HciError, ProtocolError};
use crate::event::{CompletedPackets, Event};
use crate::flow::{FlowControlManager, FlowControlState};
use crate::framer::PacketFramer;
use crate::opcode::{HciCommand, Opcode};
use crate::packet::{AclPacket, BoundaryFlag, LinkType, Packet, ScoPacket, MAX_ACL_DATA, MAX_SCO_DATA};
use crate::registry::{self, CallbackId, CallbackIds};
use crate::router::{EventFilter, EventRouter};
use crate::tap::PacketDirection;
use crate::transport::Transport;

/// State shared between the handle and its dispatch thread.
struct Shared {
    config: StackConfig,
    ids: CallbackIds,
    commands: CommandDispatcher,
    router: EventRouter,
    data: DataCallbackRegistry,
    flow: FlowControlManager,
}

impl Shared {
    fn stop(&self, reason: HciError) {
        self.commands.shutdown(reason);
    }

    /// Decode and dispatch everything the framer holds.
    fn drain(&self, framer: &mut PacketFramer) -> Result<(), ProtocolError> {
        while let Some(packet) = framer.next_packet()? {
            if !self.commands.is_running() {
                break;
            }
            self.dispatch(&packet);
        }
        Ok(())
    }

    fn dispatch(&self, packet: &Packet) {
        self.commands.tap().observe(PacketDirection::Received, packet);
        match packet {
            Packet::Event(evt) => {
                self.router.route(evt.event(), &self.commands, &self.flow);
            }
            Packet::AclData(acl) => {
                self.data.deliver_acl(acl, &self.flow);
            }
            Packet::ScoData(sco) => {
                self.data.deliver_sco(sco, &self.flow);
            }
            Packet::Command(cmd) => {
                tracing::warn!(opcode = %cmd.opcode, "command packet from controller dropped");
            }
        }
    }

    fn run(&self, mut reader: impl Read, mut framer: PacketFramer) {
        self.commands.mark_dispatch_thread();
        let mut buf = vec![0u8; self.config.read_chunk_size.max(1)];
        while self.commands.is_running() {
            match reader.read(&mut buf) {
                Ok(0) => {
                    self.stop(HciError::Transport {
                        kind: io::ErrorKind::UnexpectedEof,
                        message: "transport closed by controller".to_owned(),
                    });
                }
                Ok(n) => {
                    framer.push(buf.get(..n).unwrap_or_default());
                    if let Err(e) = self.drain(&mut framer) {
                        self.stop(e.into());
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => self.stop(e.into()),
            }
        }
        tracing::debug!("dispatch thread exiting");
    }
}

/// An open connection to one HCI controller.
///
/// All methods take `&self`; share the stack between threads with an `Arc`.
/// Dropping the stack closes it.
pub struct Stack {
    shared: Arc<Shared>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Stack {
    /// Split `transport` and start the dispatch thread.
    ///
    /// # Errors
    ///
    /// Returns [`HciError::Transport`] when the transport cannot be split or
    /// the thread cannot be spawned.
    pub fn open<T: Transport>(transport: T, config: StackConfig) -> Result<Self, HciError> {
        let (reader, writer) = transport.split()?;
        let framer = PacketFramer::new(&config);
        let thread_name = config.thread_name.clone();
        let shared = Arc::new(Shared {
            config,
            ids: CallbackIds::new(),
            commands: CommandDispatcher::new(Box::new(writer)),
            router: EventRouter::new(),
            data: DataCallbackRegistry::new(),
            flow: FlowControlManager::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker.run(reader, framer))?;
        tracing::debug!(thread = %thread_name, "hci stack opened");

        Ok(Self {
            shared,
            dispatch: Mutex::new(Some(handle)),
        })
    }

    /// Shut the stack down.
    ///
    /// Fails the pending command with [`HciError::ShuttingDown`], removes
    /// every subscription and joins the dispatch thread, letting a callback
    /// already running finish. Called from inside a callback, it does
    /// everything except the join. Closing twice is harmless.
    pub fn close(&self) {
        self.shared.stop(HciError::ShuttingDown);
        self.shared.router.clear();
        self.shared.data.clear();
        self.shared.commands.tap().clear();

        if self.shared.commands.on_dispatch_thread() || registry::in_callback() {
            return;
        }
        let handle = self
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("dispatch thread panicked");
            }
            tracing::debug!("hci stack closed");
        }
    }

    /// `false` once closed or after a fatal transport/protocol error.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.commands.is_running()
    }

    /// Configuration the stack was opened with.
    #[must_use]
    pub fn config(&self) -> &StackConfig {
        &self.shared.config
    }

    /// Send a command and, with `wait_for_response`, block until the
    /// controller resolves it.
    ///
    /// Returns `Ok(None)` when not waiting. Blocking callers are serialised:
    /// only one command is pending per stack.
    ///
    /// # Errors
    ///
    /// - [`HciError::CommandTooLong`] for more than 255 parameter bytes.
    /// - [`HciError::Timeout`] when no matching Command Complete/Status
    ///   arrives within `timeout` (including the wait for a command credit).
    /// - [`HciError::CommandFailed`] for a non-zero status.
    /// - [`HciError::WouldDeadlock`] when waiting from inside a callback.
    /// - [`HciError::ShuttingDown`] or the fatal error that stopped the stack.
    pub fn send_command(
        &self,
        opcode: Opcode,
        parameters: &[u8],
        wait_for_response: bool,
        timeout: Duration,
    ) -> Result<Option<CommandResponse>, HciError> {
        self.shared
            .commands
            .send_command(opcode, parameters, wait_for_response, timeout)
    }

    /// Send a command and wait for it using the configured timeout.
    ///
    /// # Errors
    ///
    /// As [`send_command`](Self::send_command).
    pub fn execute(&self, opcode: Opcode, parameters: &[u8]) -> Result<CommandResponse, HciError> {
        self.send_command(opcode, parameters, true, self.shared.config.command_timeout)?
            .ok_or(HciError::ShuttingDown)
    }

    /// Marshal and execute one of the typed commands.
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute), plus parameter marshalling errors.
    pub fn issue(&self, command: &HciCommand<'_>) -> Result<CommandResponse, HciError> {
        self.execute(command.opcode(), &command.params()?)
    }

    /// Subscribe to events matching `filter`.
    ///
    /// Callbacks run on the dispatch thread, one at a time, in registration
    /// order. Registering the same closure logic twice yields two
    /// independent subscriptions.
    pub fn register_event_callback<F>(&self, filter: EventFilter, callback: F) -> CallbackId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let id = self.shared.ids.next();
        self.shared.router.register(id, filter, Box::new(callback));
        id
    }

    /// Subscribe to incoming ACL data.
    pub fn register_acl_data_callback<F>(&self, filter: DataFilter, callback: F) -> CallbackId
    where
        F: FnMut(&AclPacket) + Send + 'static,
    {
        let id = self.shared.ids.next();
        self.shared.data.register_acl(id, filter, Box::new(callback));
        id
    }

    /// Subscribe to incoming SCO data.
    pub fn register_sco_data_callback<F>(&self, filter: DataFilter, callback: F) -> CallbackId
    where
        F: FnMut(&ScoPacket) + Send + 'static,
    {
        let id = self.shared.ids.next();
        self.shared.data.register_sco(id, filter, Box::new(callback));
        id
    }

    /// Observe every packet sent or received.
    pub fn register_debug_callback<F>(&self, callback: F) -> CallbackId
    where
        F: FnMut(PacketDirection, &Packet) + Send + 'static,
    {
        let id = self.shared.ids.next();
        self.shared.commands.tap().register(id, Box::new(callback));
        id
    }

    /// Remove a subscription of any kind.
    ///
    /// Once this returns the callback is never entered again. Called from
    /// another thread, it waits for an invocation in progress to finish;
    /// called from a callback (the callback itself included), it does not.
    /// Returns `false` for an unknown id.
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let wait = !self.shared.commands.on_dispatch_thread();
        self.shared.router.unregister(id, wait)
            || self.shared.data.unregister(id, wait)
            || self.shared.commands.tap().unregister(id, wait)
    }

    /// Send one ACL data packet, taking a flow-control credit.
    ///
    /// # Errors
    ///
    /// - [`HciError::DataTooLong`] above 65535 bytes.
    /// - [`HciError::NoCredits`] when flow control is enabled and exhausted.
    /// - [`HciError::Transport`] / [`HciError::ShuttingDown`].
    pub fn send_acl_data(&self, handle: u16, boundary: BoundaryFlag, data: &[u8]) -> Result<(), HciError> {
        if data.len() > MAX_ACL_DATA {
            return Err(HciError::DataTooLong {
                len: data.len(),
                max: MAX_ACL_DATA,
            });
        }
        let packet = AclPacket::new(handle, boundary, data.to_vec());
        self.send_data(LinkType::Acl, packet.handle, &Packet::AclData(packet))
    }

    /// Send one SCO data packet, taking a flow-control credit.
    ///
    /// # Errors
    ///
    /// As [`send_acl_data`](Self::send_acl_data), with a 255-byte limit.
    pub fn send_sco_data(&self, handle: u16, data: &[u8]) -> Result<(), HciError> {
        if data.len() > MAX_SCO_DATA {
            return Err(HciError::DataTooLong {
                len: data.len(),
                max: MAX_SCO_DATA,
            });
        }
        let packet = ScoPacket::new(handle, data.to_vec());
        self.send_data(LinkType::Sco, packet.handle, &Packet::ScoData(packet))
    }

    fn send_data(&self, link: LinkType, handle: u16, packet: &Packet) -> Result<(), HciError> {
        if !self.is_running() {
            return Err(self.shared.commands.stop_reason());
        }
        self.shared.flow.try_consume(link, handle)?;
        if let Err(e) = self.shared.commands.write_packet(packet) {
            self.shared.flow.refund(link);
            return Err(e);
        }
        Ok(())
    }

    /// Acknowledge packets on `link` as consumed.
    ///
    /// Sends Host_Number_Of_Completed_Packets without waiting (the
    /// controller answers it only on error) and returns the credits to the
    /// local ledger. Returns the number of credits restored.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::CreditUnderflow`] when more packets are
    ///   acknowledged than are in flight. The command is still sent and the
    ///   ledger is clamped.
    /// - Send errors as for [`send_command`](Self::send_command).
    pub fn acknowledge_completed_packets(
        &self,
        link: LinkType,
        entries: &[CompletedPackets],
    ) -> Result<u32, HciError> {
        let command = HciCommand::HostNumberOfCompletedPackets(entries);
        self.send_command(command.opcode(), &command.params()?, false, Duration::ZERO)?;
        let total = entries
            .iter()
            .fold(0u32, |sum, e| sum.saturating_add(u32::from(e.count)));
        self.shared.flow.release(link, total).map_err(HciError::from)
    }

    /// Enable local credit accounting with the controller's buffer counts.
    ///
    /// Sends nothing; `set_host_flow_control(0, 0)` disables accounting.
    pub fn set_host_flow_control(&self, acl_credits: u32, sco_credits: u32) {
        self.shared.flow.enable(acl_credits, sco_credits);
    }

    /// Stop local credit accounting; data sends never block on credits.
    pub fn disable_flow_control(&self) {
        self.shared.flow.disable();
    }

    /// Snapshot of the flow-control counters.
    #[must_use]
    pub fn flow_control(&self) -> FlowControlState {
        self.shared.flow.snapshot()
    }

    /// Commands the controller currently accepts (`Num_HCI_Command_Packets`).
    #[must_use]
    pub fn command_credits(&self) -> u8 {
        self.shared.commands.credits()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.close();
    }
}
