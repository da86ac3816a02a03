//! Typed command helpers on [`Stack`].
//!
//! Each helper marshals one command, waits for it with the configured
//! timeout and decodes its return parameters.

use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{MAX_AMP_ASSOC_LENGTH, MAX_LOCAL_NAME_LEN};
use crate::error::{HciError, ProtocolError};
use crate::event::{BdAddr, Event, EventCode, StoredLinkKey};
use crate::fragment::{Fragment, FragmentFetch, FragmentSource};
use crate::opcode::{ControllerFlowControl, HciCommand, Opcode};
use crate::router::EventFilter;
use crate::stack::Stack;

impl Stack {
    /// HCI_Reset. Local flow-control accounting is switched off with it.
    ///
    /// # Errors
    ///
    /// As [`Stack::execute`].
    pub fn reset(&self) -> Result<(), HciError> {
        self.issue(&HciCommand::Reset)?;
        self.disable_flow_control();
        Ok(())
    }

    /// HCI_Read_Local_Name, decoded up to the first NUL.
    ///
    /// # Errors
    ///
    /// [`HciError::BufferTooSmall`] when the name is longer than `max_len`
    /// bytes, otherwise as [`Stack::execute`].
    pub fn read_local_name(&self, max_len: usize) -> Result<String, HciError> {
        let response = self.issue(&HciCommand::ReadLocalName)?;
        let raw = response
            .return_parameters
            .get(..MAX_LOCAL_NAME_LEN)
            .unwrap_or(&response.return_parameters);
        let name = raw.split(|&b| b == 0).next().unwrap_or_default();
        if name.len() > max_len {
            return Err(HciError::BufferTooSmall {
                needed: name.len(),
                capacity: max_len,
            });
        }
        Ok(String::from_utf8_lossy(name).into_owned())
    }

    /// HCI_Read_BD_ADDR.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::TruncatedResponse`] when fewer than six address
    /// bytes come back, otherwise as [`Stack::execute`].
    pub fn read_bd_addr(&self) -> Result<BdAddr, HciError> {
        let response = self.issue(&HciCommand::ReadBdAddr)?;
        response
            .return_parameters
            .get(..6)
            .and_then(|bytes| <[u8; 6]>::try_from(bytes).ok())
            .map(BdAddr)
            .ok_or_else(|| ProtocolError::TruncatedResponse { opcode: response.opcode }.into())
    }

    /// Tell the controller about the host's receive buffers and turn on
    /// controller → host flow control for every link with a non-zero count.
    ///
    /// # Errors
    ///
    /// As [`Stack::execute`], for either command.
    pub fn enable_controller_to_host_flow_control(
        &self,
        acl_data_packet_length: u16,
        sco_data_packet_length: u8,
        total_acl_packets: u16,
        total_sco_packets: u16,
    ) -> Result<(), HciError> {
        self.issue(&HciCommand::HostBufferSize {
            acl_data_packet_length,
            sco_data_packet_length,
            total_acl_packets,
            total_sco_packets,
        })?;
        let mode = match (total_acl_packets > 0, total_sco_packets > 0) {
            (false, false) => ControllerFlowControl::Off,
            (true, false) => ControllerFlowControl::AclOnly,
            (false, true) => ControllerFlowControl::ScoOnly,
            (true, true) => ControllerFlowControl::AclAndSco,
        };
        self.issue(&HciCommand::SetControllerToHostFlowControl(mode))?;
        Ok(())
    }

    /// HCI_Read_Stored_Link_Key; `None` reads every stored key.
    ///
    /// Keys arrive in Return Link Keys events ahead of the Command Complete;
    /// they are collected while the command is pending.
    ///
    /// # Errors
    ///
    /// As [`Stack::execute`].
    pub fn read_stored_link_keys(&self, addr: Option<BdAddr>) -> Result<Vec<StoredLinkKey>, HciError> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let id = self.register_event_callback(
            EventFilter::Code(EventCode::ReturnLinkKeys as u8),
            move |event: &Event| {
                if let Event::ReturnLinkKeys(keys) = event {
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(keys);
                }
            },
        );
        let outcome = self.issue(&HciCommand::ReadStoredLinkKey(addr));
        self.unregister_callback(id);
        let response = outcome?;

        let keys = std::mem::take(&mut *collected.lock().unwrap_or_else(PoisonError::into_inner));
        if let Some(&[_, _, lo, hi]) = response.return_parameters.get(..4) {
            let reported = usize::from(u16::from_le_bytes([lo, hi]));
            if reported != keys.len() {
                tracing::debug!(reported, collected = keys.len(), "stored link key count differs");
            }
        }
        Ok(keys)
    }

    /// Lazy HCI_Read_Local_AMP_ASSOC fetch for `physical_link_handle`.
    ///
    /// Each step of the returned iterator issues one command; nothing is
    /// sent until it is advanced.
    pub fn amp_assoc_fetch(&self, physical_link_handle: u8) -> FragmentFetch<impl FragmentSource + '_> {
        let max_remote = u16::try_from(MAX_AMP_ASSOC_LENGTH).unwrap_or(u16::MAX);
        let source = move |offset: usize| -> Result<Fragment, HciError> {
            let length_so_far = u16::try_from(offset).map_err(|_| HciError::BufferTooSmall {
                needed: offset,
                capacity: MAX_AMP_ASSOC_LENGTH,
            })?;
            let response = self.issue(&HciCommand::ReadLocalAmpAssoc {
                physical_link_handle,
                length_so_far,
                max_remote_amp_assoc_length: max_remote,
            })?;
            decode_amp_fragment(offset, &response.return_parameters)
        };
        FragmentFetch::new(source, MAX_AMP_ASSOC_LENGTH)
    }

    /// Read the whole local AMP association.
    ///
    /// # Errors
    ///
    /// The first command or reassembly error.
    pub fn read_local_amp_assoc(&self, physical_link_handle: u8) -> Result<Vec<u8>, HciError> {
        self.amp_assoc_fetch(physical_link_handle).collect_all()
    }
}

/// `[physical_link_handle][remaining LE16][fragment...]`
fn decode_amp_fragment(offset: usize, params: &[u8]) -> Result<Fragment, HciError> {
    let [_handle, lo, hi, data @ ..] = params else {
        return Err(ProtocolError::TruncatedResponse {
            opcode: Opcode::READ_LOCAL_AMP_ASSOC,
        }
        .into());
    };
    Ok(Fragment {
        offset,
        remaining: usize::from(u16::from_le_bytes([*lo, *hi])),
        data: data.to_vec(),
    })
}
