//! Login/text negotiation keys
//!
//! The negotiation loop is driven by a static table of key descriptors
//! rather than by types: each descriptor names the key, the phase it may
//! appear in, how the initiator proposes it and how a target's reply is
//! applied to the session parameter set.

use vdisk_core::{Error, Result};

/// Negotiated (or declared) session and connection parameters.
///
/// Starts from the RFC 3720 defaults; the login negotiation updates it in
/// place as target replies arrive.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub header_digest: bool,
    pub data_digest: bool,
    /// Our receive limit, declared to the target
    pub max_recv_data_segment_length: u32,
    /// The target's receive limit, bounding our DataOut bursts
    pub target_max_recv_data_segment_length: u32,
    pub first_burst_length: u32,
    pub max_burst_length: u32,
    pub immediate_data: bool,
    pub initial_r2t: bool,
    pub default_time2wait: u32,
    pub default_time2retain: u32,
    pub max_outstanding_r2t: u32,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u32,
    pub max_connections: u32,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            header_digest: false,
            data_digest: false,
            max_recv_data_segment_length: 262_144,
            target_max_recv_data_segment_length: 8192,
            first_burst_length: 65_536,
            max_burst_length: 262_144,
            immediate_data: true,
            initial_r2t: true,
            default_time2wait: 2,
            default_time2retain: 20,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
            max_connections: 1,
        }
    }
}

/// Which login stage a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Operational,
}

/// One negotiable key
pub struct KeyDescriptor {
    pub name: &'static str,
    pub phase: KeyPhase,
    /// Whether the initiator proposes this key during login
    pub proposed: bool,
    /// The initiator's proposal, rendered from the current parameters
    pub propose: fn(&SessionParams) -> String,
    /// Fold the target's reply into the parameters
    pub accept: fn(&mut SessionParams, &str) -> Result<()>,
}

fn yes_no(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value {
        "Yes" => Ok(true),
        "No" => Ok(false),
        _ => Err(Error::protocol(format!(
            "{} value '{}' is not Yes/No",
            key, value
        ))),
    }
}

fn parse_number(key: &'static str, value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| Error::protocol(format!("{} value '{}' is not a number", key, value)))
}

fn parse_digest(key: &'static str, value: &str) -> Result<bool> {
    // The reply is the single selected choice.
    match value {
        "CRC32C" => Ok(true),
        "None" => Ok(false),
        _ => Err(Error::protocol(format!(
            "{} selection '{}' is neither CRC32C nor None",
            key, value
        ))),
    }
}

/// Every key the negotiation loop knows how to handle
pub static NEGOTIATION_KEYS: &[KeyDescriptor] = &[
    KeyDescriptor {
        name: "HeaderDigest",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| {
            if p.header_digest {
                "CRC32C,None".to_string()
            } else {
                "None".to_string()
            }
        },
        accept: |p, v| {
            p.header_digest = parse_digest("HeaderDigest", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "DataDigest",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| {
            if p.data_digest {
                "CRC32C,None".to_string()
            } else {
                "None".to_string()
            }
        },
        accept: |p, v| {
            p.data_digest = parse_digest("DataDigest", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "MaxRecvDataSegmentLength",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| p.max_recv_data_segment_length.to_string(),
        accept: |p, v| {
            // Declarative in both directions: the target's value bounds our
            // DataOut bursts, ours stays as declared.
            p.target_max_recv_data_segment_length =
                parse_number("MaxRecvDataSegmentLength", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "FirstBurstLength",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| p.first_burst_length.to_string(),
        accept: |p, v| {
            p.first_burst_length = parse_number("FirstBurstLength", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "MaxBurstLength",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| p.max_burst_length.to_string(),
        accept: |p, v| {
            p.max_burst_length = parse_number("MaxBurstLength", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "ImmediateData",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| yes_no(p.immediate_data),
        accept: |p, v| {
            // AND semantics: both sides must agree to use immediate data.
            p.immediate_data &= parse_bool("ImmediateData", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "InitialR2T",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| yes_no(p.initial_r2t),
        accept: |p, v| {
            // OR semantics: either side may insist on an initial R2T.
            p.initial_r2t |= parse_bool("InitialR2T", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "DefaultTime2Wait",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| p.default_time2wait.to_string(),
        accept: |p, v| {
            p.default_time2wait = parse_number("DefaultTime2Wait", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "DefaultTime2Retain",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| p.default_time2retain.to_string(),
        accept: |p, v| {
            p.default_time2retain = parse_number("DefaultTime2Retain", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "MaxOutstandingR2T",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| p.max_outstanding_r2t.to_string(),
        accept: |p, v| {
            p.max_outstanding_r2t = parse_number("MaxOutstandingR2T", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "DataPDUInOrder",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| yes_no(p.data_pdu_in_order),
        accept: |p, v| {
            p.data_pdu_in_order = parse_bool("DataPDUInOrder", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "DataSequenceInOrder",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| yes_no(p.data_sequence_in_order),
        accept: |p, v| {
            p.data_sequence_in_order = parse_bool("DataSequenceInOrder", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "ErrorRecoveryLevel",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| p.error_recovery_level.to_string(),
        accept: |p, v| {
            p.error_recovery_level = parse_number("ErrorRecoveryLevel", v)?;
            Ok(())
        },
    },
    KeyDescriptor {
        name: "MaxConnections",
        phase: KeyPhase::Operational,
        proposed: true,
        propose: |p| p.max_connections.to_string(),
        accept: |p, v| {
            p.max_connections = parse_number("MaxConnections", v)?;
            Ok(())
        },
    },
];

/// Look up a key descriptor by name
pub fn find_key(name: &str) -> Option<&'static KeyDescriptor> {
    NEGOTIATION_KEYS.iter().find(|k| k.name == name)
}
