//! Command opcodes and the handful of typed commands the stack issues itself.
//!
//! An opcode packs the Opcode Group Field (6 bits) and the Opcode Command
//! Field (10 bits): `opcode = (OGF << 10) | OCF`.

use core::fmt;

use crate::error::HciError;
use crate::event::{BdAddr, CompletedPackets};
use crate::packet::MAX_COMMAND_PARAMS;

/// 16-bit HCI command opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(u16);

impl Opcode {
    /// No-operation opcode used by the controller to hand out command credits.
    pub const NOP: Self = Self(0x0000);
    /// HCI_Reset — OGF=0x03 (Controller & Baseband), OCF=0x0003.
    pub const RESET: Self = Self::new(0x03, 0x0003);
    /// HCI_Read_Stored_Link_Key — OGF=0x03, OCF=0x000D.
    pub const READ_STORED_LINK_KEY: Self = Self::new(0x03, 0x000D);
    /// HCI_Read_Local_Name — OGF=0x03, OCF=0x0014.
    pub const READ_LOCAL_NAME: Self = Self::new(0x03, 0x0014);
    /// HCI_Set_Controller_To_Host_Flow_Control — OGF=0x03, OCF=0x0031.
    pub const SET_CONTROLLER_TO_HOST_FLOW_CONTROL: Self = Self::new(0x03, 0x0031);
    /// HCI_Host_Buffer_Size — OGF=0x03, OCF=0x0033.
    pub const HOST_BUFFER_SIZE: Self = Self::new(0x03, 0x0033);
    /// HCI_Host_Number_Of_Completed_Packets — OGF=0x03, OCF=0x0035.
    pub const HOST_NUMBER_OF_COMPLETED_PACKETS: Self = Self::new(0x03, 0x0035);
    /// HCI_Read_BD_ADDR — OGF=0x04 (Informational), OCF=0x0009.
    pub const READ_BD_ADDR: Self = Self::new(0x04, 0x0009);
    /// HCI_Read_Local_AMP_ASSOC — OGF=0x05 (Status), OCF=0x000A.
    pub const READ_LOCAL_AMP_ASSOC: Self = Self::new(0x05, 0x000A);

    /// Build an opcode from its group and command fields.
    ///
    /// Bits outside the 6-bit OGF / 10-bit OCF ranges are masked off.
    #[must_use]
    pub const fn new(ogf: u8, ocf: u16) -> Self {
        Self((((ogf & 0x3F) as u16) << 10) | (ocf & 0x03FF))
    }

    /// Wrap a raw little-endian-decoded opcode.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Packed 16-bit value.
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Opcode Group Field.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // 6-bit field after the shift
    pub const fn ogf(self) -> u8 {
        (self.0 >> 10) as u8
    }

    /// Opcode Command Field.
    #[must_use]
    pub const fn ocf(self) -> u16 {
        self.0 & 0x03FF
    }

    /// Wire encoding.
    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// `Set_Controller_To_Host_Flow_Control` modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ControllerFlowControl {
    Off = 0x00,
    AclOnly = 0x01,
    ScoOnly = 0x02,
    AclAndSco = 0x03,
}

/// Command parameter buffer: one command packet's worth.
pub type CommandParams = heapless::Vec<u8, MAX_COMMAND_PARAMS>;

/// HCI commands the stack knows how to marshal.
///
/// Everything else goes through [`crate::Stack::send_command`] with raw
/// parameter bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HciCommand<'a> {
    /// HCI_Reset.
    Reset,
    /// HCI_Read_Local_Name.
    ReadLocalName,
    /// HCI_Read_BD_ADDR.
    ReadBdAddr,
    /// HCI_Host_Buffer_Size: the host's receive buffers.
    #[allow(missing_docs)]
    HostBufferSize {
        acl_data_packet_length: u16,
        sco_data_packet_length: u8,
        total_acl_packets: u16,
        total_sco_packets: u16,
    },
    /// HCI_Set_Controller_To_Host_Flow_Control.
    SetControllerToHostFlowControl(ControllerFlowControl),
    /// HCI_Host_Number_Of_Completed_Packets.
    HostNumberOfCompletedPackets(&'a [CompletedPackets]),
    /// HCI_Read_Stored_Link_Key; `None` reads every stored key.
    ReadStoredLinkKey(Option<BdAddr>),
    /// HCI_Read_Local_AMP_ASSOC: one fragment starting at `length_so_far`.
    #[allow(missing_docs)]
    ReadLocalAmpAssoc {
        physical_link_handle: u8,
        length_so_far: u16,
        max_remote_amp_assoc_length: u16,
    },
}

impl HciCommand<'_> {
    /// Return the 16-bit opcode: `(OGF << 10) | OCF`.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            HciCommand::Reset => Opcode::RESET,
            HciCommand::ReadLocalName => Opcode::READ_LOCAL_NAME,
            HciCommand::ReadBdAddr => Opcode::READ_BD_ADDR,
            HciCommand::HostBufferSize { .. } => Opcode::HOST_BUFFER_SIZE,
            HciCommand::SetControllerToHostFlowControl(_) => {
                Opcode::SET_CONTROLLER_TO_HOST_FLOW_CONTROL
            }
            HciCommand::HostNumberOfCompletedPackets(_) => {
                Opcode::HOST_NUMBER_OF_COMPLETED_PACKETS
            }
            HciCommand::ReadStoredLinkKey(_) => Opcode::READ_STORED_LINK_KEY,
            HciCommand::ReadLocalAmpAssoc { .. } => Opcode::READ_LOCAL_AMP_ASSOC,
        }
    }

    /// Serialise the command parameters.
    ///
    /// # Errors
    ///
    /// Returns [`HciError::CommandTooLong`] when the parameters would not fit
    /// in a single command packet (only possible for
    /// `HostNumberOfCompletedPackets` with more than 63 handles).
    pub fn params(&self) -> Result<CommandParams, HciError> {
        let mut out = CommandParams::new();
        let mut put = |bytes: &[u8]| {
            let len = out.len().saturating_add(bytes.len());
            out.extend_from_slice(bytes)
                .map_err(|_| HciError::CommandTooLong { len })
        };

        match *self {
            HciCommand::Reset | HciCommand::ReadLocalName | HciCommand::ReadBdAddr => {}
            HciCommand::HostBufferSize {
                acl_data_packet_length,
                sco_data_packet_length,
                total_acl_packets,
                total_sco_packets,
            } => {
                put(&acl_data_packet_length.to_le_bytes())?;
                put(&[sco_data_packet_length])?;
                put(&total_acl_packets.to_le_bytes())?;
                put(&total_sco_packets.to_le_bytes())?;
            }
            HciCommand::SetControllerToHostFlowControl(mode) => put(&[mode as u8])?,
            HciCommand::HostNumberOfCompletedPackets(entries) => {
                let count = u8::try_from(entries.len()).map_err(|_| HciError::CommandTooLong {
                    len: entries.len().saturating_mul(4).saturating_add(1),
                })?;
                put(&[count])?;
                for entry in entries {
                    put(&entry.handle.to_le_bytes())?;
                    put(&entry.count.to_le_bytes())?;
                }
            }
            HciCommand::ReadStoredLinkKey(addr) => {
                let read_all = addr.is_none();
                put(addr.unwrap_or_default().as_bytes())?;
                put(&[u8::from(read_all)])?;
            }
            HciCommand::ReadLocalAmpAssoc {
                physical_link_handle,
                length_so_far,
                max_remote_amp_assoc_length,
            } => {
                put(&[physical_link_handle])?;
                put(&length_so_far.to_le_bytes())?;
                put(&max_remote_amp_assoc_length.to_le_bytes())?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Tests use expect() for readable assertions
mod tests {
    use super::*;

    #[test]
    fn reset_opcode_matches_core_spec() {
        // Reset is OGF=0x03, OCF=0x003 → (0x03 << 10) | 0x003 = 0x0C03
        assert_eq!(HciCommand::Reset.opcode().raw(), 0x0C03);
        assert_eq!(Opcode::RESET.ogf(), 0x03);
        assert_eq!(Opcode::RESET.ocf(), 0x0003);
    }

    #[test]
    fn opcode_display_is_hex() {
        assert_eq!(Opcode::HOST_NUMBER_OF_COMPLETED_PACKETS.to_string(), "0x0C35");
        assert_eq!(Opcode::READ_LOCAL_AMP_ASSOC.to_string(), "0x140A");
    }

    #[test]
    fn reset_has_no_params() {
        assert!(HciCommand::Reset.params().expect("params").is_empty());
    }

    #[test]
    fn host_buffer_size_is_little_endian() {
        let params = HciCommand::HostBufferSize {
            acl_data_packet_length: 0x0400,
            sco_data_packet_length: 0x40,
            total_acl_packets: 8,
            total_sco_packets: 2,
        }
        .params()
        .expect("params");
        assert_eq!(params.as_slice(), &[0x00, 0x04, 0x40, 0x08, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn completed_packets_list_is_counted() {
        let entries = [
            CompletedPackets { handle: 0x0001, count: 2 },
            CompletedPackets { handle: 0x0042, count: 1 },
        ];
        let params = HciCommand::HostNumberOfCompletedPackets(&entries)
            .params()
            .expect("params");
        assert_eq!(
            params.as_slice(),
            &[0x02, 0x01, 0x00, 0x02, 0x00, 0x42, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn too_many_completed_handles_is_rejected() {
        let entries = [CompletedPackets { handle: 1, count: 1 }; 64];
        let err = HciCommand::HostNumberOfCompletedPackets(&entries)
            .params()
            .expect_err("64 handles cannot fit");
        assert!(matches!(err, HciError::CommandTooLong { .. }));
    }

    #[test]
    fn read_all_stored_keys_sets_flag() {
        let params = HciCommand::ReadStoredLinkKey(None).params().expect("params");
        assert_eq!(params.as_slice(), &[0, 0, 0, 0, 0, 0, 0x01]);
    }
}
