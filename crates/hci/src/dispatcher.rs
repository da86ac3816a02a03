//! Command issuance and completion correlation.
//!
//! A blocking command takes the command mutex, waits for a command credit,
//! occupies the pending slot, writes the packet and then sleeps on the slot's
//! condition variable until the receive path resolves it or the deadline
//! passes. The deadline is enforced on the caller's thread; the dispatch
//! thread only ever fills the slot in and signals.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::HciError;
use crate::event::{CommandComplete, CommandStatus};
use crate::opcode::Opcode;
use crate::packet::{CommandPacket, Packet};
use crate::state::CommandSlot;
use crate::status::StatusCode;
use crate::tap::{PacketDirection, PacketTap};

/// Which event resolved a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Command Complete (0x0E).
    Complete,
    /// Command Status (0x0F).
    Status,
}

/// Result of a successfully resolved command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Command this response belongs to.
    pub opcode: Opcode,
    /// Event that carried it.
    pub kind: ResponseKind,
    /// Status byte. Always success when handed to a caller.
    pub status: StatusCode,
    /// Commands the controller will accept now.
    pub num_hci_command_packets: u8,
    /// Return parameters after the status byte. Empty for Command Status.
    pub return_parameters: Vec<u8>,
}

impl CommandResponse {
    /// Split a Command Complete into status and remaining return parameters.
    #[must_use]
    pub fn from_complete(cc: &CommandComplete) -> Self {
        let return_parameters = cc.return_parameters.get(1..).unwrap_or_default().to_vec();
        Self {
            opcode: cc.opcode,
            kind: ResponseKind::Complete,
            status: cc.status(),
            num_hci_command_packets: cc.num_hci_command_packets,
            return_parameters,
        }
    }

    /// Response carried by a Command Status event.
    #[must_use]
    pub fn from_status(cs: &CommandStatus) -> Self {
        Self {
            opcode: cs.opcode,
            kind: ResponseKind::Status,
            status: cs.status,
            num_hci_command_packets: cs.num_hci_command_packets,
            return_parameters: Vec::new(),
        }
    }
}

/// Deadline `timeout` from now, saturating for absurd timeouts.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(Duration::from_secs(u64::from(u32::MAX))))
        .unwrap_or(now)
}

pub(crate) struct CommandDispatcher {
    /// Serialises blocking commands; held for the whole command lifetime.
    command_lock: Mutex<()>,
    slot: Mutex<CommandSlot>,
    signal: Condvar,
    writer: Mutex<Box<dyn Write + Send>>,
    tap: PacketTap,
    running: AtomicBool,
    stop_reason: Mutex<Option<HciError>>,
    dispatch_thread: OnceLock<ThreadId>,
}

impl CommandDispatcher {
    pub(crate) fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            command_lock: Mutex::new(()),
            slot: Mutex::new(CommandSlot::new()),
            signal: Condvar::new(),
            writer: Mutex::new(writer),
            tap: PacketTap::new(),
            running: AtomicBool::new(true),
            stop_reason: Mutex::new(None),
            dispatch_thread: OnceLock::new(),
        }
    }

    fn slot(&self) -> MutexGuard<'_, CommandSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tap(&self) -> &PacketTap {
        &self.tap
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Error handed to callers once the dispatcher has stopped.
    pub(crate) fn stop_reason(&self) -> HciError {
        self.stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(HciError::ShuttingDown)
    }

    /// Record the calling thread as the dispatch thread.
    pub(crate) fn mark_dispatch_thread(&self) {
        let _ = self.dispatch_thread.set(thread::current().id());
    }

    pub(crate) fn on_dispatch_thread(&self) -> bool {
        self.dispatch_thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn credits(&self) -> u8 {
        self.slot().credits()
    }

    /// Stop accepting commands and fail the one in flight with `reason`.
    ///
    /// Returns `false` when already stopped. The first reason wins.
    pub(crate) fn shutdown(&self, reason: HciError) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        {
            let mut stop = self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner);
            stop.get_or_insert_with(|| reason.clone());
        }
        if reason.is_fatal() && reason != HciError::ShuttingDown {
            tracing::error!(%reason, "hci dispatcher stopped");
        } else {
            tracing::debug!(%reason, "hci dispatcher stopped");
        }
        self.slot().fail(reason);
        self.signal.notify_all();
        true
    }

    /// Encode and write one packet, then show it to the tap.
    ///
    /// A write failure is fatal: the dispatcher shuts down with it.
    pub(crate) fn write_packet(&self, packet: &Packet) -> Result<(), HciError> {
        if !self.is_running() {
            return Err(self.stop_reason());
        }
        let bytes = packet.encode()?;
        let written = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&bytes).and_then(|()| writer.flush())
        };
        if let Err(e) = written {
            let err = HciError::from(e);
            self.shutdown(err.clone());
            return Err(err);
        }
        self.tap.observe(PacketDirection::Sent, packet);
        Ok(())
    }

    /// Send a command.
    ///
    /// With `wait = false` the packet is written and `Ok(None)` returned at
    /// once; the pending slot and command mutex are not touched.
    ///
    /// # Errors
    ///
    /// See [`crate::Stack::send_command`].
    pub(crate) fn send_command(
        &self,
        opcode: Opcode,
        parameters: &[u8],
        wait: bool,
        timeout: Duration,
    ) -> Result<Option<CommandResponse>, HciError> {
        if !self.is_running() {
            return Err(self.stop_reason());
        }
        let packet = Packet::Command(CommandPacket::new(opcode, parameters)?);

        if !wait {
            self.write_packet(&packet)?;
            tracing::debug!(%opcode, "command sent without waiting");
            return Ok(None);
        }
        if self.on_dispatch_thread() {
            return Err(HciError::WouldDeadlock);
        }

        let deadline = deadline_after(timeout);
        let _serial = self.command_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut slot = self.slot();
        while !slot.take_credit() {
            if !self.is_running() {
                return Err(self.stop_reason());
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(%opcode, "no command credit before deadline");
                return Err(HciError::Timeout { opcode });
            }
            slot = self
                .signal
                .wait_timeout(slot, deadline.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if !self.is_running() {
            return Err(self.stop_reason());
        }
        slot.begin(opcode, deadline);
        drop(slot);

        if let Err(e) = self.write_packet(&packet) {
            let mut slot = self.slot();
            // Shutdown may already have failed the slot; clear either way.
            if slot.take_outcome().is_none() {
                slot.time_out();
            }
            return Err(e);
        }
        tracing::debug!(%opcode, "command sent");

        let response = self.wait_for_outcome(opcode)?;
        if response.status.is_success() {
            tracing::debug!(%opcode, "command completed");
            Ok(Some(response))
        } else {
            tracing::debug!(%opcode, status = %response.status, "command failed");
            Err(HciError::CommandFailed {
                opcode,
                status: response.status,
            })
        }
    }

    fn wait_for_outcome(&self, opcode: Opcode) -> Result<CommandResponse, HciError> {
        let mut slot = self.slot();
        loop {
            if let Some(outcome) = slot.take_outcome() {
                return outcome;
            }
            let Some(deadline) = slot.deadline() else {
                // Only reachable if the slot was cleared underneath us.
                return Err(self.stop_reason());
            };
            let now = Instant::now();
            if now >= deadline {
                slot.time_out();
                tracing::warn!(%opcode, "command timed out");
                return Err(HciError::Timeout { opcode });
            }
            slot = self
                .signal
                .wait_timeout(slot, deadline.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Apply a Command Complete/Status from the controller.
    ///
    /// Updates the command credit and, when the opcode is the one in flight,
    /// resolves it. Returns `true` when the event was consumed that way.
    pub(crate) fn resolve(&self, response: CommandResponse) -> bool {
        let opcode = response.opcode;
        let consumed = {
            let mut slot = self.slot();
            slot.set_credits(response.num_hci_command_packets);
            slot.complete(response)
        };
        self.signal.notify_all();
        if !consumed && opcode != Opcode::NOP {
            tracing::debug!(%opcode, "completion for a command not in flight; forwarding");
        }
        consumed
    }
}
