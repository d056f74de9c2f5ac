//! iSCSI connection and login state machine
//!
//! One connection per session (multi-connection sessions are out of scope),
//! strictly request/response over a single stream. The connection is
//! generic over the transport so tests can drive it through an in-process
//! duplex pipe.
//!
//! Phases: SecurityNegotiation -> LoginOperationalNegotiation ->
//! FullFeaturePhase -> LoggedOut. CHAP (algorithm 5) runs inside the
//! security phase; the operational phase walks the static key table.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vdisk_core::{Error, Result};

use crate::chap;
use crate::keys::{find_key, SessionParams, NEGOTIATION_KEYS};
use crate::pdu::{
    parse_text_parameters, serialize_text_parameters, stage, LoginRequest, LoginResponse,
    LogoutRequest, Pdu, PduCodec, BHS_SIZE,
};

/// CHAP credentials for the security phase
#[derive(Debug, Clone)]
pub struct ChapCredentials {
    /// `CHAP_N`, usually the initiator IQN
    pub name: String,
    pub secret: String,
}

/// Session-level configuration for login
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub initiator_name: String,
    pub target_name: String,
    pub chap: Option<ChapCredentials>,
    /// Initial proposals; updated in place by the negotiation
    pub params: SessionParams,
}

impl SessionConfig {
    pub fn new(initiator_name: impl Into<String>, target_name: impl Into<String>) -> Self {
        Self {
            initiator_name: initiator_name.into(),
            target_name: target_name.into(),
            chap: None,
            params: SessionParams::default(),
        }
    }

    pub fn with_chap(mut self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.chap = Some(ChapCredentials {
            name: name.into(),
            secret: secret.into(),
        });
        self
    }
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    SecurityNegotiation,
    LoginOperationalNegotiation,
    FullFeaturePhase,
    LoggedOut,
}

/// Read one PDU frame from a stream with the given digest settings
pub async fn read_pdu_from<T: AsyncRead + Unpin>(stream: &mut T, codec: &PduCodec) -> Result<Pdu> {
    let mut frame = vec![0u8; BHS_SIZE];
    stream.read_exact(&mut frame).await?;

    let mut bhs = [0u8; BHS_SIZE];
    bhs.copy_from_slice(&frame);
    let total = codec.frame_len(&bhs);
    frame.resize(total, 0);
    if total > BHS_SIZE {
        stream.read_exact(&mut frame[BHS_SIZE..]).await?;
    }
    codec.decode(&frame)
}

/// An iSCSI initiator connection over `T`
pub struct Connection<T> {
    stream: T,
    codec: PduCodec,
    state: ConnectionState,
    pub(crate) params: SessionParams,
    isid: [u8; 6],
    tsih: u16,
    pub(crate) task_tag: u32,
    pub(crate) cmd_sn: u32,
    expected_stat_sn: Option<u32>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            codec: PduCodec::default(),
            state: ConnectionState::SecurityNegotiation,
            params: SessionParams::default(),
            isid: [0x00, 0x02, 0x3D, 0x00, 0x00, 0x01],
            tsih: 0,
            task_tag: 1,
            cmd_sn: 1,
            expected_stat_sn: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub(crate) async fn send(&mut self, pdu: &Pdu) -> Result<()> {
        let frame = self.codec.encode(pdu);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one PDU, enforcing the status sequence invariant and
    /// surfacing target Rejects as protocol errors
    pub(crate) async fn recv(&mut self) -> Result<Pdu> {
        let pdu = read_pdu_from(&mut self.stream, &self.codec).await?;

        let status_sn = match &pdu {
            Pdu::LoginResponse(p) => Some(p.stat_sn),
            Pdu::TextResponse(p) => Some(p.stat_sn),
            Pdu::ScsiResponse(p) => Some(p.stat_sn),
            Pdu::LogoutResponse(p) => Some(p.stat_sn),
            Pdu::Reject(p) => Some(p.stat_sn),
            Pdu::NopIn(p) if p.initiator_task_tag != 0xFFFF_FFFF => Some(p.stat_sn),
            Pdu::DataIn(p) if p.status_present => Some(p.stat_sn),
            _ => None,
        };
        if let Some(stat_sn) = status_sn {
            self.note_status(stat_sn)?;
        }

        if let Pdu::Reject(reject) = &pdu {
            return Err(Error::protocol(format!(
                "target rejected PDU, reason {:#04x}",
                reject.reason
            )));
        }
        Ok(pdu)
    }

    fn note_status(&mut self, stat_sn: u32) -> Result<()> {
        match self.expected_stat_sn {
            _ if stat_sn == 0 => {}
            None if stat_sn == 1 => {
                // The status sequence starts at 1.
                self.expected_stat_sn = Some(2);
            }
            None => {
                return Err(Error::protocol(format!(
                    "status sequence violation: first StatSN is {}, not 1",
                    stat_sn
                )));
            }
            Some(expected) if stat_sn == expected => {
                self.expected_stat_sn = Some(expected.wrapping_add(1));
            }
            Some(expected) => {
                return Err(Error::protocol(format!(
                    "status sequence violation: StatSN {} where {} was expected",
                    stat_sn, expected
                )));
            }
        }
        Ok(())
    }

    /// Expected StatSN to echo back to the target
    pub(crate) fn exp_stat_sn_hint(&self) -> u32 {
        self.expected_stat_sn.unwrap_or(0)
    }

    /// One login request/response exchange, reassembling a
    /// `Continue`-fragmented response text payload
    async fn login_exchange(
        &mut self,
        current_stage: u8,
        next_stage: u8,
        transit: bool,
        data: Vec<u8>,
    ) -> Result<LoginResponse> {
        let request = LoginRequest {
            transit,
            continue_: false,
            current_stage,
            next_stage,
            version_max: 0,
            version_min: 0,
            isid: self.isid,
            tsih: self.tsih,
            initiator_task_tag: self.task_tag,
            cid: 0,
            cmd_sn: self.cmd_sn,
            exp_stat_sn: self.exp_stat_sn_hint(),
            data,
        };
        self.send(&Pdu::LoginRequest(request)).await?;

        let mut response = self.expect_login_response().await?;
        while response.continue_ {
            let more = LoginRequest {
                transit: false,
                continue_: false,
                current_stage,
                next_stage,
                isid: self.isid,
                tsih: self.tsih,
                initiator_task_tag: self.task_tag,
                cmd_sn: self.cmd_sn,
                exp_stat_sn: self.exp_stat_sn_hint(),
                ..Default::default()
            };
            self.send(&Pdu::LoginRequest(more)).await?;
            let next = self.expect_login_response().await?;
            response.data.extend_from_slice(&next.data);
            response.transit = next.transit;
            response.continue_ = next.continue_;
            response.next_stage = next.next_stage;
            response.tsih = next.tsih;
        }
        Ok(response)
    }

    async fn expect_login_response(&mut self) -> Result<LoginResponse> {
        match self.recv().await? {
            Pdu::LoginResponse(response) => {
                if response.status_class != 0 {
                    return Err(Error::auth(format!(
                        "login failed with status {:#04x}/{:#04x}",
                        response.status_class, response.status_detail
                    )));
                }
                Ok(response)
            }
            other => Err(Error::protocol(format!(
                "expected Login Response, received {}",
                other.opcode_name()
            ))),
        }
    }

    /// Drive the full login: security phase (with CHAP when configured),
    /// then operational parameter negotiation
    pub async fn login(&mut self, config: &SessionConfig) -> Result<()> {
        if self.state != ConnectionState::SecurityNegotiation {
            return Err(Error::protocol("login attempted twice"));
        }
        self.params = config.params.clone();

        self.security_phase(config).await?;
        self.state = ConnectionState::LoginOperationalNegotiation;

        self.operational_phase().await?;
        self.state = ConnectionState::FullFeaturePhase;

        // Negotiated digests take effect with the first full-feature PDU.
        self.codec = PduCodec {
            header_digest: self.params.header_digest,
            data_digest: self.params.data_digest,
        };
        tracing::debug!(
            header_digest = self.params.header_digest,
            data_digest = self.params.data_digest,
            "entered full feature phase"
        );
        Ok(())
    }

    async fn security_phase(&mut self, config: &SessionConfig) -> Result<()> {
        let auth_offer = if config.chap.is_some() {
            "CHAP,None"
        } else {
            "None"
        };
        let hello = serialize_text_parameters(&[
            ("InitiatorName", config.initiator_name.as_str()),
            ("TargetName", config.target_name.as_str()),
            ("SessionType", "Normal"),
            ("AuthMethod", auth_offer),
        ]);

        let mut response = self
            .login_exchange(
                stage::SECURITY_NEGOTIATION,
                stage::LOGIN_OPERATIONAL_NEGOTIATION,
                config.chap.is_none(),
                hello,
            )
            .await?;

        let params = parse_text_parameters(&response.data)?;
        let auth_method = params
            .iter()
            .find(|(key, _)| key == "AuthMethod")
            .map(|(_, value)| value.as_str())
            .unwrap_or("None");

        match auth_method {
            "None" => {}
            "CHAP" => {
                let credentials = config.chap.as_ref().ok_or_else(|| {
                    Error::auth("target requires CHAP but no credentials are configured")
                })?;
                response = self.chap_handshake(credentials).await?;
            }
            other => {
                return Err(Error::auth(format!(
                    "unsupported AuthMethod '{}' selected by target",
                    other
                )));
            }
        }

        // Keep exchanging until the target transits out of security.
        while !response.transit {
            response = self
                .login_exchange(
                    stage::SECURITY_NEGOTIATION,
                    stage::LOGIN_OPERATIONAL_NEGOTIATION,
                    true,
                    Vec::new(),
                )
                .await?;
        }
        if response.next_stage != stage::LOGIN_OPERATIONAL_NEGOTIATION {
            return Err(Error::protocol(format!(
                "target transitioned to stage {} instead of operational negotiation",
                response.next_stage
            )));
        }
        self.tsih = response.tsih;
        Ok(())
    }

    /// CHAP algorithm 5: A -> (A, I, C) -> (N, R)
    async fn chap_handshake(&mut self, credentials: &ChapCredentials) -> Result<LoginResponse> {
        let offer = serialize_text_parameters(&[("CHAP_A", "5")]);
        let response = self
            .login_exchange(
                stage::SECURITY_NEGOTIATION,
                stage::LOGIN_OPERATIONAL_NEGOTIATION,
                false,
                offer,
            )
            .await?;

        let params = parse_text_parameters(&response.data)?;
        let lookup = |key: &str| -> Result<&str> {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| Error::auth(format!("CHAP challenge lacks {}", key)))
        };

        let algorithm = lookup("CHAP_A")?;
        if algorithm.parse::<u32>().ok() != Some(chap::CHAP_ALGORITHM_MD5) {
            return Err(Error::auth(format!(
                "target selected CHAP algorithm '{}', only 5 (MD5) is supported",
                algorithm
            )));
        }
        let identifier = chap::parse_identifier(lookup("CHAP_I")?)?;
        let challenge = chap::parse_hex_value(lookup("CHAP_C")?)?;

        let chap_r = chap::chap_response(identifier, &credentials.secret, &challenge);
        let answer = serialize_text_parameters(&[
            ("CHAP_N", credentials.name.as_str()),
            ("CHAP_R", chap_r.as_str()),
        ]);
        self.login_exchange(
            stage::SECURITY_NEGOTIATION,
            stage::LOGIN_OPERATIONAL_NEGOTIATION,
            true,
            answer,
        )
        .await
    }

    async fn operational_phase(&mut self) -> Result<()> {
        // Propose everything in the table in one text buffer.
        let proposals: Vec<(String, String)> = NEGOTIATION_KEYS
            .iter()
            .filter(|key| key.proposed)
            .map(|key| (key.name.to_string(), (key.propose)(&self.params)))
            .collect();
        let mut outgoing = serialize_text_parameters(&proposals);

        loop {
            let response = self
                .login_exchange(
                    stage::LOGIN_OPERATIONAL_NEGOTIATION,
                    stage::FULL_FEATURE_PHASE,
                    true,
                    std::mem::take(&mut outgoing),
                )
                .await?;

            let mut not_understood: Vec<(String, String)> = Vec::new();
            for (key, value) in parse_text_parameters(&response.data)? {
                match find_key(&key) {
                    Some(descriptor) => (descriptor.accept)(&mut self.params, &value)?,
                    None if value == "NotUnderstood" || value == "Reject" => {
                        tracing::debug!(key = %key, "target declined proposal");
                    }
                    None => {
                        // Unknown target key: answer NotUnderstood.
                        tracing::debug!(key = %key, "echoing NotUnderstood");
                        not_understood.push((key, "NotUnderstood".to_string()));
                    }
                }
            }

            if !not_understood.is_empty() {
                outgoing = serialize_text_parameters(&not_understood);
                continue;
            }
            if response.transit {
                if response.next_stage != stage::FULL_FEATURE_PHASE {
                    return Err(Error::protocol(format!(
                        "target transitioned to stage {} instead of full feature",
                        response.next_stage
                    )));
                }
                return Ok(());
            }
        }
    }

    /// Close the session with a Logout exchange
    pub async fn logout(&mut self) -> Result<()> {
        if self.state != ConnectionState::FullFeaturePhase {
            return Err(Error::protocol("logout outside full feature phase"));
        }

        let request = LogoutRequest {
            immediate: true,
            reason: 0, // close the session
            initiator_task_tag: self.task_tag,
            cid: 0,
            cmd_sn: self.cmd_sn,
            exp_stat_sn: self.exp_stat_sn_hint(),
        };
        self.send(&Pdu::LogoutRequest(request)).await?;

        match self.recv().await? {
            Pdu::LogoutResponse(response) => {
                if response.response != crate::pdu::logout_response::CLOSED_SUCCESSFULLY {
                    return Err(Error::protocol(format!(
                        "logout failed with response {:#04x}",
                        response.response
                    )));
                }
            }
            other => {
                return Err(Error::protocol(format!(
                    "expected Logout Response, received {}",
                    other.opcode_name()
                )));
            }
        }
        self.state = ConnectionState::LoggedOut;
        self.task_tag = self.task_tag.wrapping_add(1);
        Ok(())
    }

    /// Verify the target is responsive with a NOP exchange
    pub async fn ping(&mut self) -> Result<()> {
        if self.state != ConnectionState::FullFeaturePhase {
            return Err(Error::protocol("ping outside full feature phase"));
        }
        let request = crate::pdu::NopOut {
            immediate: true,
            lun: 0,
            initiator_task_tag: self.task_tag,
            target_transfer_tag: 0xFFFF_FFFF,
            cmd_sn: self.cmd_sn,
            exp_stat_sn: self.exp_stat_sn_hint(),
            data: Vec::new(),
        };
        self.send(&Pdu::NopOut(request)).await?;
        match self.recv().await? {
            Pdu::NopIn(_) => {
                self.task_tag = self.task_tag.wrapping_add(1);
                Ok(())
            }
            other => Err(Error::protocol(format!(
                "expected NOP-In, received {}",
                other.opcode_name()
            ))),
        }
    }
}
