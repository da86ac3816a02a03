//! Stack configuration.
//!
//! Every knob has a default; construct with [`StackConfig::default`] and
//! override with the `with_*` builders. With the `serde` feature the struct
//! can be loaded from any serde format, missing fields falling back to the
//! defaults.

use std::time::Duration;

/// Default deadline for a blocking command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Consecutive bytes the framer may discard while hunting for a packet
/// boundary before the stream is declared unrecoverable.
pub const DEFAULT_RESYNC_BUDGET: usize = 64;

/// Largest ACL payload accepted from the controller.
///
/// Matches the common 1021-byte controller buffer (3-DH5 payload).
pub const DEFAULT_MAX_ACL_PAYLOAD: usize = 1021;

/// Largest SCO payload accepted from the controller (one-byte length field).
pub const DEFAULT_MAX_SCO_PAYLOAD: usize = 255;

/// Bytes requested from the transport per read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024;

/// Name of the per-stack dispatch thread.
pub const DISPATCH_THREAD_NAME: &str = "hci-dispatch";

/// Longest local name a controller can return (Read_Local_Name).
pub const MAX_LOCAL_NAME_LEN: usize = 248;

/// Upper bound on an assembled AMP association.
pub const MAX_AMP_ASSOC_LENGTH: usize = 672;

/// Tunables for one [`crate::Stack`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StackConfig {
    /// Deadline for commands sent with `wait = true` and no explicit timeout.
    pub command_timeout: Duration,
    /// See [`DEFAULT_RESYNC_BUDGET`].
    pub resync_budget: usize,
    /// See [`DEFAULT_MAX_ACL_PAYLOAD`].
    pub max_acl_payload: usize,
    /// See [`DEFAULT_MAX_SCO_PAYLOAD`].
    pub max_sco_payload: usize,
    /// See [`DEFAULT_READ_CHUNK_SIZE`].
    pub read_chunk_size: usize,
    /// Dispatch thread name, visible in debuggers and panic messages.
    pub thread_name: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            resync_budget: DEFAULT_RESYNC_BUDGET,
            max_acl_payload: DEFAULT_MAX_ACL_PAYLOAD,
            max_sco_payload: DEFAULT_MAX_SCO_PAYLOAD,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            thread_name: DISPATCH_THREAD_NAME.to_owned(),
        }
    }
}

impl StackConfig {
    /// Default timeout for blocking commands.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Consecutive bytes the framer may discard before giving up.
    #[must_use]
    pub fn with_resync_budget(mut self, budget: usize) -> Self {
        self.resync_budget = budget;
        self
    }

    /// Payload limits; SCO is clamped to what its length field can express.
    #[must_use]
    pub fn with_max_payloads(mut self, acl: usize, sco: usize) -> Self {
        self.max_acl_payload = acl.min(usize::from(u16::MAX));
        self.max_sco_payload = sco.min(usize::from(u8::MAX));
        self
    }

    /// A zero chunk size is bumped to one byte.
    #[must_use]
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Name of the dispatch thread.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}
