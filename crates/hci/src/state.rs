//! Pending-command state tracker.
//!
//! The wire protocol carries no request id: the next Command Complete or
//! Command Status for the opcode in flight belongs to it. [`CommandSlot`] holds
//! that single in-flight command and the controller's advertised command
//! credit.

use std::time::Instant;

use crate::dispatcher::CommandResponse;
use crate::error::HciError;
use crate::opcode::Opcode;

/// Lifecycle of the one pending command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CommandState {
    /// Nothing outstanding.
    Idle,
    /// Written to the transport; waiting for the controller.
    Sent { opcode: Opcode, deadline: Instant },
    /// Response arrived; the waiter has not collected it yet.
    Completed(CommandResponse),
    /// Resolved without a response (shutdown, transport failure).
    Failed(HciError),
}

/// Single pending-command slot plus command credit.
#[derive(Debug)]
pub(crate) struct CommandSlot {
    state: CommandState,
    credits: u8,
}

impl CommandSlot {
    /// Idle slot. Controllers accept one command after power-up.
    pub(crate) fn new() -> Self {
        Self {
            state: CommandState::Idle,
            credits: 1,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &CommandState {
        &self.state
    }

    pub(crate) fn credits(&self) -> u8 {
        self.credits
    }

    /// Record `Num_HCI_Command_Packets` from a Command Complete/Status.
    pub(crate) fn set_credits(&mut self, credits: u8) {
        self.credits = credits;
    }

    /// Spend one command credit. Returns `false` when none is left.
    pub(crate) fn take_credit(&mut self) -> bool {
        match self.credits.checked_sub(1) {
            Some(left) => {
                self.credits = left;
                true
            }
            None => false,
        }
    }

    /// Move `Idle → Sent`.
    pub(crate) fn begin(&mut self, opcode: Opcode, deadline: Instant) {
        debug_assert!(matches!(self.state, CommandState::Idle), "slot already in use");
        self.state = CommandState::Sent { opcode, deadline };
    }

    /// Opcode in flight, if any.
    pub(crate) fn pending_opcode(&self) -> Option<Opcode> {
        match self.state {
            CommandState::Sent { opcode, .. } => Some(opcode),
            _ => None,
        }
    }

    /// Deadline of the command in flight, if any.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match self.state {
            CommandState::Sent { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    /// Move `Sent → Completed` when `response` is for the pending opcode.
    ///
    /// Returns `false`, leaving the slot untouched, otherwise.
    pub(crate) fn complete(&mut self, response: CommandResponse) -> bool {
        if self.pending_opcode() != Some(response.opcode) {
            return false;
        }
        self.state = CommandState::Completed(response);
        true
    }

    /// Move `Sent → Failed`. No-op when nothing is in flight.
    pub(crate) fn fail(&mut self, error: HciError) -> bool {
        if self.pending_opcode().is_none() {
            return false;
        }
        self.state = CommandState::Failed(error);
        true
    }

    /// Collect a resolved outcome, returning the slot to `Idle`.
    pub(crate) fn take_outcome(&mut self) -> Option<Result<CommandResponse, HciError>> {
        match std::mem::replace(&mut self.state, CommandState::Idle) {
            CommandState::Completed(response) => Some(Ok(response)),
            CommandState::Failed(error) => Some(Err(error)),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Abandon a command whose deadline passed, returning the slot to `Idle`.
    ///
    /// The controller may have dropped the command together with its credit,
    /// so one credit is restored.
    pub(crate) fn time_out(&mut self) -> Option<Opcode> {
        let opcode = self.pending_opcode()?;
        self.state = CommandState::Idle;
        self.credits = self.credits.max(1);
        Some(opcode)
    }
}

impl Default for CommandSlot {
    fn default() -> Self {
        Self::new()
    }
}
