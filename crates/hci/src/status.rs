//! HCI status / error codes (Bluetooth Core Spec Vol 1, Part F).

use core::fmt;

/// One-byte status carried by Command Complete, Command Status and most
/// connection events. `0x00` is success; everything else is a controller error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusCode(u8);

#[allow(missing_docs)] // names follow the Core spec error code table
impl StatusCode {
    pub const SUCCESS: Self = Self(0x00);
    pub const UNKNOWN_HCI_COMMAND: Self = Self(0x01);
    pub const UNKNOWN_CONNECTION_IDENTIFIER: Self = Self(0x02);
    pub const HARDWARE_FAILURE: Self = Self(0x03);
    pub const PAGE_TIMEOUT: Self = Self(0x04);
    pub const AUTHENTICATION_FAILURE: Self = Self(0x05);
    pub const PIN_OR_KEY_MISSING: Self = Self(0x06);
    pub const MEMORY_CAPACITY_EXCEEDED: Self = Self(0x07);
    pub const CONNECTION_TIMEOUT: Self = Self(0x08);
    pub const CONNECTION_LIMIT_EXCEEDED: Self = Self(0x09);
    pub const COMMAND_DISALLOWED: Self = Self(0x0C);
    pub const UNSUPPORTED_FEATURE: Self = Self(0x11);
    pub const INVALID_COMMAND_PARAMETERS: Self = Self(0x12);
    pub const REMOTE_USER_TERMINATED: Self = Self(0x13);
    pub const LOCAL_HOST_TERMINATED: Self = Self(0x16);
    pub const UNSPECIFIED_ERROR: Self = Self(0x1F);
    pub const LMP_RESPONSE_TIMEOUT: Self = Self(0x22);
    pub const CONTROLLER_BUSY: Self = Self(0x3A);
    pub const CONNECTION_FAILED_TO_ESTABLISH: Self = Self(0x3E);

    /// Wrap a raw status byte.
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// The raw status byte.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// `0x00`.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0x00
    }

    /// Bluetooth Core name of the code, or `"Reserved"` when unassigned here.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            0x00 => "Success",
            0x01 => "Unknown HCI Command",
            0x02 => "Unknown Connection Identifier",
            0x03 => "Hardware Failure",
            0x04 => "Page Timeout",
            0x05 => "Authentication Failure",
            0x06 => "PIN or Key Missing",
            0x07 => "Memory Capacity Exceeded",
            0x08 => "Connection Timeout",
            0x09 => "Connection Limit Exceeded",
            0x0A => "Synchronous Connection Limit To A Device Exceeded",
            0x0B => "Connection Already Exists",
            0x0C => "Command Disallowed",
            0x0D => "Connection Rejected due to Limited Resources",
            0x0E => "Connection Rejected due to Security Reasons",
            0x0F => "Connection Rejected due to Unacceptable BD_ADDR",
            0x10 => "Connection Accept Timeout Exceeded",
            0x11 => "Unsupported Feature or Parameter Value",
            0x12 => "Invalid HCI Command Parameters",
            0x13 => "Remote User Terminated Connection",
            0x14 => "Remote Device Terminated Connection due to Low Resources",
            0x15 => "Remote Device Terminated Connection due to Power Off",
            0x16 => "Connection Terminated By Local Host",
            0x17 => "Repeated Attempts",
            0x18 => "Pairing Not Allowed",
            0x1A => "Unsupported Remote Feature",
            0x1F => "Unspecified Error",
            0x22 => "LMP Response Timeout",
            0x28 => "Instant Passed",
            0x3A => "Controller Busy",
            0x3B => "Unacceptable Connection Parameters",
            0x3C => "Advertising Timeout",
            0x3D => "Connection Terminated due to MIC Failure",
            0x3E => "Connection Failed to be Established",
            _ => "Reserved",
        }
    }
}

impl From<u8> for StatusCode {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::StatusCode;

    #[test]
    fn zero_is_success() {
        assert!(StatusCode::new(0).is_success());
        assert!(!StatusCode::COMMAND_DISALLOWED.is_success());
    }

    #[test]
    fn display_includes_name_and_hex() {
        assert_eq!(
            StatusCode::UNKNOWN_HCI_COMMAND.to_string(),
            "Unknown HCI Command (0x01)"
        );
    }

    #[test]
    fn unassigned_codes_are_reserved() {
        assert_eq!(StatusCode::new(0x7F).name(), "Reserved");
    }
}
