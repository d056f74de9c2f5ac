//! iSCSI PDU parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs based on
//! RFC 3720. Every PDU is a 48-byte Basic Header Segment, optionally
//! followed by a CRC-32C header digest, additional header segments, a data
//! segment padded to four bytes, and a CRC-32C data digest.

use vdisk_core::codec::{be_u16, be_u32, be_u64, crc32c};
use vdisk_core::{Error, Result};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// iSCSI PDU opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator -> target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;

    // Target opcodes (target -> initiator)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const REJECT: u8 = 0x3F;
}

/// Login stages (CSG/NSG values)
pub mod stage {
    pub const SECURITY_NEGOTIATION: u8 = 0;
    pub const LOGIN_OPERATIONAL_NEGOTIATION: u8 = 1;
    pub const FULL_FEATURE_PHASE: u8 = 3;
}

/// SCSI status codes carried by ScsiResponse / DataIn
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
}

/// Logout response codes
pub mod logout_response {
    pub const CLOSED_SUCCESSFULLY: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

const FINAL: u8 = 0x80;
const CONTINUE: u8 = 0x40;
const IMMEDIATE: u8 = 0x40;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginRequest {
    pub transit: bool,
    pub continue_: bool,
    pub current_stage: u8,
    pub next_stage: u8,
    pub version_max: u8,
    pub version_min: u8,
    pub isid: [u8; 6],
    pub tsih: u16,
    pub initiator_task_tag: u32,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginResponse {
    pub transit: bool,
    pub continue_: bool,
    pub current_stage: u8,
    pub next_stage: u8,
    pub version_max: u8,
    pub version_active: u8,
    pub isid: [u8; 6],
    pub tsih: u16,
    pub initiator_task_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub status_class: u8,
    pub status_detail: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogoutRequest {
    pub immediate: bool,
    pub reason: u8,
    pub initiator_task_tag: u32,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogoutResponse {
    pub response: u8,
    pub initiator_task_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub time2wait: u16,
    pub time2retain: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextRequest {
    pub immediate: bool,
    pub final_: bool,
    pub continue_: bool,
    pub lun: u64,
    pub initiator_task_tag: u32,
    pub target_transfer_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextResponse {
    pub final_: bool,
    pub continue_: bool,
    pub lun: u64,
    pub initiator_task_tag: u32,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScsiCommand {
    pub immediate: bool,
    pub final_: bool,
    pub read: bool,
    pub write: bool,
    pub attr: u8,
    pub lun: u64,
    pub initiator_task_tag: u32,
    pub expected_data_length: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub cdb: [u8; 16],
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScsiResponse {
    pub flags: u8,
    pub response: u8,
    pub status: u8,
    pub initiator_task_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub exp_data_sn: u32,
    pub residual_count: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadyToTransfer {
    pub lun: u64,
    pub initiator_task_tag: u32,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_transfer_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataIn {
    pub final_: bool,
    pub acknowledge: bool,
    pub status_present: bool,
    pub status: u8,
    pub lun: u64,
    pub initiator_task_tag: u32,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub residual_count: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataOut {
    pub final_: bool,
    pub lun: u64,
    pub initiator_task_tag: u32,
    pub target_transfer_tag: u32,
    pub exp_stat_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NopOut {
    pub immediate: bool,
    pub lun: u64,
    pub initiator_task_tag: u32,
    pub target_transfer_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NopIn {
    pub lun: u64,
    pub initiator_task_tag: u32,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reject {
    pub reason: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    pub data: Vec<u8>,
}

/// The structured opcode union of every PDU this initiator handles
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    LoginRequest(LoginRequest),
    LoginResponse(LoginResponse),
    LogoutRequest(LogoutRequest),
    LogoutResponse(LogoutResponse),
    TextRequest(TextRequest),
    TextResponse(TextResponse),
    ScsiCommand(ScsiCommand),
    ScsiResponse(ScsiResponse),
    ReadyToTransfer(ReadyToTransfer),
    DataIn(DataIn),
    DataOut(DataOut),
    NopOut(NopOut),
    NopIn(NopIn),
    Reject(Reject),
}

impl Pdu {
    pub fn opcode(&self) -> u8 {
        match self {
            Pdu::NopOut(_) => opcode::NOP_OUT,
            Pdu::ScsiCommand(_) => opcode::SCSI_COMMAND,
            Pdu::LoginRequest(_) => opcode::LOGIN_REQUEST,
            Pdu::TextRequest(_) => opcode::TEXT_REQUEST,
            Pdu::DataOut(_) => opcode::SCSI_DATA_OUT,
            Pdu::LogoutRequest(_) => opcode::LOGOUT_REQUEST,
            Pdu::NopIn(_) => opcode::NOP_IN,
            Pdu::ScsiResponse(_) => opcode::SCSI_RESPONSE,
            Pdu::LoginResponse(_) => opcode::LOGIN_RESPONSE,
            Pdu::TextResponse(_) => opcode::TEXT_RESPONSE,
            Pdu::DataIn(_) => opcode::SCSI_DATA_IN,
            Pdu::LogoutResponse(_) => opcode::LOGOUT_RESPONSE,
            Pdu::ReadyToTransfer(_) => opcode::R2T,
            Pdu::Reject(_) => opcode::REJECT,
        }
    }

    pub fn opcode_name(&self) -> &'static str {
        match self {
            Pdu::NopOut(_) => "NOP-Out",
            Pdu::ScsiCommand(_) => "SCSI Command",
            Pdu::LoginRequest(_) => "Login Request",
            Pdu::TextRequest(_) => "Text Request",
            Pdu::DataOut(_) => "SCSI Data-Out",
            Pdu::LogoutRequest(_) => "Logout Request",
            Pdu::NopIn(_) => "NOP-In",
            Pdu::ScsiResponse(_) => "SCSI Response",
            Pdu::LoginResponse(_) => "Login Response",
            Pdu::TextResponse(_) => "Text Response",
            Pdu::DataIn(_) => "SCSI Data-In",
            Pdu::LogoutResponse(_) => "Logout Response",
            Pdu::ReadyToTransfer(_) => "Ready To Transfer",
            Pdu::Reject(_) => "Reject",
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            Pdu::LoginRequest(p) => &p.data,
            Pdu::LoginResponse(p) => &p.data,
            Pdu::TextRequest(p) => &p.data,
            Pdu::TextResponse(p) => &p.data,
            Pdu::ScsiCommand(p) => &p.data,
            Pdu::ScsiResponse(p) => &p.data,
            Pdu::DataIn(p) => &p.data,
            Pdu::DataOut(p) => &p.data,
            Pdu::NopOut(p) => &p.data,
            Pdu::NopIn(p) => &p.data,
            Pdu::Reject(p) => &p.data,
            Pdu::LogoutRequest(_) | Pdu::LogoutResponse(_) | Pdu::ReadyToTransfer(_) => &[],
        }
    }

    /// Serialize the 48-byte BHS
    fn encode_bhs(&self) -> [u8; BHS_SIZE] {
        let mut bhs = [0u8; BHS_SIZE];
        bhs[0] = self.opcode();
        let data_len = self.data().len() as u32;
        bhs[5..8].copy_from_slice(&data_len.to_be_bytes()[1..4]);

        match self {
            Pdu::LoginRequest(p) => {
                bhs[0] |= IMMEDIATE; // login requests are always immediate
                bhs[1] = flag(p.transit, FINAL)
                    | flag(p.continue_, CONTINUE)
                    | ((p.current_stage & 0x3) << 2)
                    | (p.next_stage & 0x3);
                bhs[2] = p.version_max;
                bhs[3] = p.version_min;
                bhs[8..14].copy_from_slice(&p.isid);
                bhs[14..16].copy_from_slice(&p.tsih.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..22].copy_from_slice(&p.cid.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.cmd_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_stat_sn.to_be_bytes());
            }
            Pdu::LoginResponse(p) => {
                bhs[1] = flag(p.transit, FINAL)
                    | flag(p.continue_, CONTINUE)
                    | ((p.current_stage & 0x3) << 2)
                    | (p.next_stage & 0x3);
                bhs[2] = p.version_max;
                bhs[3] = p.version_active;
                bhs[8..14].copy_from_slice(&p.isid);
                bhs[14..16].copy_from_slice(&p.tsih.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.stat_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_cmd_sn.to_be_bytes());
                bhs[32..36].copy_from_slice(&p.max_cmd_sn.to_be_bytes());
                bhs[36] = p.status_class;
                bhs[37] = p.status_detail;
            }
            Pdu::LogoutRequest(p) => {
                bhs[0] |= flag(p.immediate, IMMEDIATE);
                bhs[1] = FINAL | (p.reason & 0x7F);
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..22].copy_from_slice(&p.cid.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.cmd_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_stat_sn.to_be_bytes());
            }
            Pdu::LogoutResponse(p) => {
                bhs[1] = FINAL;
                bhs[2] = p.response;
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.stat_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_cmd_sn.to_be_bytes());
                bhs[32..36].copy_from_slice(&p.max_cmd_sn.to_be_bytes());
                bhs[40..42].copy_from_slice(&p.time2wait.to_be_bytes());
                bhs[42..44].copy_from_slice(&p.time2retain.to_be_bytes());
            }
            Pdu::TextRequest(p) => {
                bhs[0] |= flag(p.immediate, IMMEDIATE);
                bhs[1] = flag(p.final_, FINAL) | flag(p.continue_, CONTINUE);
                bhs[8..16].copy_from_slice(&p.lun.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..24].copy_from_slice(&p.target_transfer_tag.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.cmd_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_stat_sn.to_be_bytes());
            }
            Pdu::TextResponse(p) => {
                bhs[1] = flag(p.final_, FINAL) | flag(p.continue_, CONTINUE);
                bhs[8..16].copy_from_slice(&p.lun.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..24].copy_from_slice(&p.target_transfer_tag.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.stat_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_cmd_sn.to_be_bytes());
                bhs[32..36].copy_from_slice(&p.max_cmd_sn.to_be_bytes());
            }
            Pdu::ScsiCommand(p) => {
                bhs[0] |= flag(p.immediate, IMMEDIATE);
                bhs[1] = flag(p.final_, FINAL)
                    | flag(p.read, 0x40)
                    | flag(p.write, 0x20)
                    | (p.attr & 0x7);
                bhs[8..16].copy_from_slice(&p.lun.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..24].copy_from_slice(&p.expected_data_length.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.cmd_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_stat_sn.to_be_bytes());
                bhs[32..48].copy_from_slice(&p.cdb);
            }
            Pdu::ScsiResponse(p) => {
                bhs[1] = FINAL | p.flags;
                bhs[2] = p.response;
                bhs[3] = p.status;
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.stat_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_cmd_sn.to_be_bytes());
                bhs[32..36].copy_from_slice(&p.max_cmd_sn.to_be_bytes());
                bhs[36..40].copy_from_slice(&p.exp_data_sn.to_be_bytes());
                bhs[44..48].copy_from_slice(&p.residual_count.to_be_bytes());
            }
            Pdu::ReadyToTransfer(p) => {
                bhs[1] = FINAL;
                bhs[8..16].copy_from_slice(&p.lun.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..24].copy_from_slice(&p.target_transfer_tag.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.stat_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_cmd_sn.to_be_bytes());
                bhs[32..36].copy_from_slice(&p.max_cmd_sn.to_be_bytes());
                bhs[36..40].copy_from_slice(&p.r2t_sn.to_be_bytes());
                bhs[40..44].copy_from_slice(&p.buffer_offset.to_be_bytes());
                bhs[44..48].copy_from_slice(&p.desired_transfer_length.to_be_bytes());
            }
            Pdu::DataIn(p) => {
                bhs[1] = flag(p.final_, FINAL)
                    | flag(p.acknowledge, 0x40)
                    | flag(p.status_present, 0x01);
                bhs[3] = if p.status_present { p.status } else { 0 };
                bhs[8..16].copy_from_slice(&p.lun.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..24].copy_from_slice(&p.target_transfer_tag.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.stat_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_cmd_sn.to_be_bytes());
                bhs[32..36].copy_from_slice(&p.max_cmd_sn.to_be_bytes());
                bhs[36..40].copy_from_slice(&p.data_sn.to_be_bytes());
                bhs[40..44].copy_from_slice(&p.buffer_offset.to_be_bytes());
                bhs[44..48].copy_from_slice(&p.residual_count.to_be_bytes());
            }
            Pdu::DataOut(p) => {
                bhs[1] = flag(p.final_, FINAL);
                bhs[8..16].copy_from_slice(&p.lun.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..24].copy_from_slice(&p.target_transfer_tag.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_stat_sn.to_be_bytes());
                bhs[36..40].copy_from_slice(&p.data_sn.to_be_bytes());
                bhs[40..44].copy_from_slice(&p.buffer_offset.to_be_bytes());
            }
            Pdu::NopOut(p) => {
                bhs[0] |= flag(p.immediate, IMMEDIATE);
                bhs[1] = FINAL;
                bhs[8..16].copy_from_slice(&p.lun.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..24].copy_from_slice(&p.target_transfer_tag.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.cmd_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_stat_sn.to_be_bytes());
            }
            Pdu::NopIn(p) => {
                bhs[1] = FINAL;
                bhs[8..16].copy_from_slice(&p.lun.to_be_bytes());
                bhs[16..20].copy_from_slice(&p.initiator_task_tag.to_be_bytes());
                bhs[20..24].copy_from_slice(&p.target_transfer_tag.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.stat_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_cmd_sn.to_be_bytes());
                bhs[32..36].copy_from_slice(&p.max_cmd_sn.to_be_bytes());
            }
            Pdu::Reject(p) => {
                bhs[1] = FINAL;
                bhs[2] = p.reason;
                bhs[16..20].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
                bhs[24..28].copy_from_slice(&p.stat_sn.to_be_bytes());
                bhs[28..32].copy_from_slice(&p.exp_cmd_sn.to_be_bytes());
                bhs[32..36].copy_from_slice(&p.max_cmd_sn.to_be_bytes());
                bhs[36..40].copy_from_slice(&p.data_sn.to_be_bytes());
            }
        }
        bhs
    }

    /// Parse a BHS plus its data segment into the structured union
    fn decode_bhs(bhs: &[u8; BHS_SIZE], data: Vec<u8>) -> Result<Pdu> {
        let immediate = bhs[0] & IMMEDIATE != 0;
        let op = bhs[0] & 0x3F;
        let flags = bhs[1];

        let mut isid = [0u8; 6];
        isid.copy_from_slice(&bhs[8..14]);
        let mut cdb = [0u8; 16];
        let lun = be_u64(&bhs[8..16]);
        let itt = be_u32(&bhs[16..20]);

        let pdu = match op {
            opcode::LOGIN_REQUEST => Pdu::LoginRequest(LoginRequest {
                transit: flags & FINAL != 0,
                continue_: flags & CONTINUE != 0,
                current_stage: (flags >> 2) & 0x3,
                next_stage: flags & 0x3,
                version_max: bhs[2],
                version_min: bhs[3],
                isid,
                tsih: be_u16(&bhs[14..16]),
                initiator_task_tag: itt,
                cid: be_u16(&bhs[20..22]),
                cmd_sn: be_u32(&bhs[24..28]),
                exp_stat_sn: be_u32(&bhs[28..32]),
                data,
            }),
            opcode::LOGIN_RESPONSE => Pdu::LoginResponse(LoginResponse {
                transit: flags & FINAL != 0,
                continue_: flags & CONTINUE != 0,
                current_stage: (flags >> 2) & 0x3,
                next_stage: flags & 0x3,
                version_max: bhs[2],
                version_active: bhs[3],
                isid,
                tsih: be_u16(&bhs[14..16]),
                initiator_task_tag: itt,
                stat_sn: be_u32(&bhs[24..28]),
                exp_cmd_sn: be_u32(&bhs[28..32]),
                max_cmd_sn: be_u32(&bhs[32..36]),
                status_class: bhs[36],
                status_detail: bhs[37],
                data,
            }),
            opcode::LOGOUT_REQUEST => Pdu::LogoutRequest(LogoutRequest {
                immediate,
                reason: flags & 0x7F,
                initiator_task_tag: itt,
                cid: be_u16(&bhs[20..22]),
                cmd_sn: be_u32(&bhs[24..28]),
                exp_stat_sn: be_u32(&bhs[28..32]),
            }),
            opcode::LOGOUT_RESPONSE => Pdu::LogoutResponse(LogoutResponse {
                response: bhs[2],
                initiator_task_tag: itt,
                stat_sn: be_u32(&bhs[24..28]),
                exp_cmd_sn: be_u32(&bhs[28..32]),
                max_cmd_sn: be_u32(&bhs[32..36]),
                time2wait: be_u16(&bhs[40..42]),
                time2retain: be_u16(&bhs[42..44]),
            }),
            opcode::TEXT_REQUEST => Pdu::TextRequest(TextRequest {
                immediate,
                final_: flags & FINAL != 0,
                continue_: flags & CONTINUE != 0,
                lun,
                initiator_task_tag: itt,
                target_transfer_tag: be_u32(&bhs[20..24]),
                cmd_sn: be_u32(&bhs[24..28]),
                exp_stat_sn: be_u32(&bhs[28..32]),
                data,
            }),
            opcode::TEXT_RESPONSE => Pdu::TextResponse(TextResponse {
                final_: flags & FINAL != 0,
                continue_: flags & CONTINUE != 0,
                lun,
                initiator_task_tag: itt,
                target_transfer_tag: be_u32(&bhs[20..24]),
                stat_sn: be_u32(&bhs[24..28]),
                exp_cmd_sn: be_u32(&bhs[28..32]),
                max_cmd_sn: be_u32(&bhs[32..36]),
                data,
            }),
            opcode::SCSI_COMMAND => {
                cdb.copy_from_slice(&bhs[32..48]);
                Pdu::ScsiCommand(ScsiCommand {
                    immediate,
                    final_: flags & FINAL != 0,
                    read: flags & 0x40 != 0,
                    write: flags & 0x20 != 0,
                    attr: flags & 0x7,
                    lun,
                    initiator_task_tag: itt,
                    expected_data_length: be_u32(&bhs[20..24]),
                    cmd_sn: be_u32(&bhs[24..28]),
                    exp_stat_sn: be_u32(&bhs[28..32]),
                    cdb,
                    data,
                })
            }
            opcode::SCSI_RESPONSE => Pdu::ScsiResponse(ScsiResponse {
                flags: flags & 0x7F,
                response: bhs[2],
                status: bhs[3],
                initiator_task_tag: itt,
                stat_sn: be_u32(&bhs[24..28]),
                exp_cmd_sn: be_u32(&bhs[28..32]),
                max_cmd_sn: be_u32(&bhs[32..36]),
                exp_data_sn: be_u32(&bhs[36..40]),
                residual_count: be_u32(&bhs[44..48]),
                data,
            }),
            opcode::R2T => Pdu::ReadyToTransfer(ReadyToTransfer {
                lun,
                initiator_task_tag: itt,
                target_transfer_tag: be_u32(&bhs[20..24]),
                stat_sn: be_u32(&bhs[24..28]),
                exp_cmd_sn: be_u32(&bhs[28..32]),
                max_cmd_sn: be_u32(&bhs[32..36]),
                r2t_sn: be_u32(&bhs[36..40]),
                buffer_offset: be_u32(&bhs[40..44]),
                desired_transfer_length: be_u32(&bhs[44..48]),
            }),
            opcode::SCSI_DATA_IN => Pdu::DataIn(DataIn {
                final_: flags & FINAL != 0,
                acknowledge: flags & 0x40 != 0,
                status_present: flags & 0x01 != 0,
                status: bhs[3],
                lun,
                initiator_task_tag: itt,
                target_transfer_tag: be_u32(&bhs[20..24]),
                stat_sn: be_u32(&bhs[24..28]),
                exp_cmd_sn: be_u32(&bhs[28..32]),
                max_cmd_sn: be_u32(&bhs[32..36]),
                data_sn: be_u32(&bhs[36..40]),
                buffer_offset: be_u32(&bhs[40..44]),
                residual_count: be_u32(&bhs[44..48]),
                data,
            }),
            opcode::SCSI_DATA_OUT => Pdu::DataOut(DataOut {
                final_: flags & FINAL != 0,
                lun,
                initiator_task_tag: itt,
                target_transfer_tag: be_u32(&bhs[20..24]),
                exp_stat_sn: be_u32(&bhs[28..32]),
                data_sn: be_u32(&bhs[36..40]),
                buffer_offset: be_u32(&bhs[40..44]),
                data,
            }),
            opcode::NOP_OUT => Pdu::NopOut(NopOut {
                immediate,
                lun,
                initiator_task_tag: itt,
                target_transfer_tag: be_u32(&bhs[20..24]),
                cmd_sn: be_u32(&bhs[24..28]),
                exp_stat_sn: be_u32(&bhs[28..32]),
                data,
            }),
            opcode::NOP_IN => Pdu::NopIn(NopIn {
                lun,
                initiator_task_tag: itt,
                target_transfer_tag: be_u32(&bhs[20..24]),
                stat_sn: be_u32(&bhs[24..28]),
                exp_cmd_sn: be_u32(&bhs[28..32]),
                max_cmd_sn: be_u32(&bhs[32..36]),
                data,
            }),
            opcode::REJECT => Pdu::Reject(Reject {
                reason: bhs[2],
                stat_sn: be_u32(&bhs[24..28]),
                exp_cmd_sn: be_u32(&bhs[28..32]),
                max_cmd_sn: be_u32(&bhs[32..36]),
                data_sn: be_u32(&bhs[36..40]),
                data,
            }),
            other => {
                return Err(Error::protocol(format!(
                    "unknown iSCSI opcode {:#04x}",
                    other
                )));
            }
        };
        Ok(pdu)
    }
}

fn flag(set: bool, bit: u8) -> u8 {
    if set {
        bit
    } else {
        0
    }
}

fn pad4(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// Encoder/decoder with the connection's negotiated digest settings
#[derive(Debug, Clone, Copy, Default)]
pub struct PduCodec {
    pub header_digest: bool,
    pub data_digest: bool,
}

impl PduCodec {
    /// Serialize a full wire frame: BHS, digests, padded data
    pub fn encode(&self, pdu: &Pdu) -> Vec<u8> {
        let bhs = pdu.encode_bhs();
        let data = pdu.data();

        let mut frame = Vec::with_capacity(BHS_SIZE + 8 + pad4(data.len()));
        frame.extend_from_slice(&bhs);
        if self.header_digest {
            frame.extend_from_slice(&crc32c(&bhs).to_le_bytes());
        }
        if !data.is_empty() {
            let padded_len = pad4(data.len());
            let start = frame.len();
            frame.extend_from_slice(data);
            frame.resize(start + padded_len, 0);
            if self.data_digest {
                let digest = crc32c(&frame[start..start + padded_len]);
                frame.extend_from_slice(&digest.to_le_bytes());
            }
        }
        frame
    }

    /// Total frame length implied by a BHS, including digests and padding
    pub fn frame_len(&self, bhs: &[u8; BHS_SIZE]) -> usize {
        let ahs_len = bhs[4] as usize * 4;
        let data_len = be_u32(&[0, bhs[5], bhs[6], bhs[7]]) as usize;
        let mut len = BHS_SIZE + ahs_len + pad4(data_len);
        if self.header_digest {
            len += 4;
        }
        if self.data_digest && data_len > 0 {
            len += 4;
        }
        len
    }

    /// Parse a full wire frame produced by [`PduCodec::encode`]
    pub fn decode(&self, frame: &[u8]) -> Result<Pdu> {
        if frame.len() < BHS_SIZE {
            return Err(Error::protocol(format!(
                "PDU frame of {} bytes is shorter than a BHS",
                frame.len()
            )));
        }
        let mut bhs = [0u8; BHS_SIZE];
        bhs.copy_from_slice(&frame[..BHS_SIZE]);

        let total = self.frame_len(&bhs);
        if frame.len() < total {
            return Err(Error::protocol(format!(
                "PDU frame of {} bytes, header implies {}",
                frame.len(),
                total
            )));
        }

        let mut cursor = BHS_SIZE;
        if self.header_digest {
            let stored = u32::from_le_bytes(frame[cursor..cursor + 4].try_into().unwrap());
            let computed = crc32c(&bhs);
            if stored != computed {
                return Err(Error::protocol(format!(
                    "header digest mismatch: stored {:#010x}, computed {:#010x}",
                    stored, computed
                )));
            }
            cursor += 4;
        }

        // AHS segments are not used by this initiator; skip them.
        cursor += bhs[4] as usize * 4;

        let data_len = be_u32(&[0, bhs[5], bhs[6], bhs[7]]) as usize;
        let padded = pad4(data_len);
        let data = frame[cursor..cursor + data_len].to_vec();
        let data_area = &frame[cursor..cursor + padded];
        cursor += padded;

        if self.data_digest && data_len > 0 {
            let stored = u32::from_le_bytes(frame[cursor..cursor + 4].try_into().unwrap());
            let computed = crc32c(data_area);
            if stored != computed {
                return Err(Error::protocol(format!(
                    "data digest mismatch: stored {:#010x}, computed {:#010x}",
                    stored, computed
                )));
            }
        }

        Pdu::decode_bhs(&bhs, data)
    }
}

/// Parse null-separated `key=value` text parameters
pub fn parse_text_parameters(data: &[u8]) -> Result<Vec<(String, String)>> {
    let mut params = Vec::new();
    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(chunk)
            .map_err(|_| Error::protocol("text parameter is not UTF-8"))?;
        let (key, value) = text
            .split_once('=')
            .ok_or_else(|| Error::protocol(format!("text parameter '{}' lacks '='", text)))?;
        params.push((key.to_string(), value.to_string()));
    }
    Ok(params)
}

/// Serialize text parameters to the null-terminated wire form
pub fn serialize_text_parameters<K: AsRef<str>, V: AsRef<str>>(params: &[(K, V)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_ref().as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_ref().as_bytes());
        data.push(0);
    }
    data
}
