//! # vdisk iSCSI
//!
//! iSCSI initiator (RFC 3720 subset) exposing remote SCSI LUNs as block
//! devices.
//!
//! - [`pdu`]: BHS framing, the structured opcode union, optional CRC-32C
//!   digests
//! - [`connection`]: login state machine (CHAP algorithm 5, operational key
//!   negotiation), status sequencing, logout
//! - [`task`]: command dispatch with R2T-driven data-out and data-in
//!   reassembly
//! - [`scsi`]: CDB builders (REPORT LUNS, READ CAPACITY, READ, WRITE)
//! - [`device`]: the block-device adapter plus its blocking facade
//!
//! The initiator is strictly request/response over one TCP connection; no
//! multi-connection sessions, no iSNS discovery, no transport encryption
//! beyond CHAP.

pub mod chap;
pub mod connection;
pub mod device;
pub mod keys;
pub mod pdu;
pub mod scsi;
pub mod task;

pub use connection::{ChapCredentials, Connection, ConnectionState, SessionConfig};
pub use device::{BlockingDevice, IscsiDevice};
pub use keys::SessionParams;
pub use pdu::{Pdu, PduCodec};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::read_pdu_from;
    use crate::pdu::*;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use vdisk_core::Error;

    /// Scripted in-process target
    struct Target {
        stream: DuplexStream,
        codec: PduCodec,
        stat_sn: u32,
    }

    impl Target {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                codec: PduCodec::default(),
                stat_sn: 1,
            }
        }

        async fn recv(&mut self) -> Pdu {
            read_pdu_from(&mut self.stream, &self.codec).await.unwrap()
        }

        async fn send(&mut self, pdu: Pdu) {
            let frame = self.codec.encode(&pdu);
            self.stream.write_all(&frame).await.unwrap();
        }

        fn next_stat(&mut self) -> u32 {
            let sn = self.stat_sn;
            self.stat_sn += 1;
            sn
        }

        async fn recv_login(&mut self) -> LoginRequest {
            match self.recv().await {
                Pdu::LoginRequest(request) => request,
                other => panic!("target expected Login Request, got {}", other.opcode_name()),
            }
        }

        async fn send_login(
            &mut self,
            request: &LoginRequest,
            transit: bool,
            next_stage: u8,
            data: Vec<u8>,
        ) {
            let stat_sn = self.next_stat();
            self.send(Pdu::LoginResponse(LoginResponse {
                transit,
                continue_: false,
                current_stage: request.current_stage,
                next_stage,
                isid: request.isid,
                tsih: 1,
                initiator_task_tag: request.initiator_task_tag,
                stat_sn,
                exp_cmd_sn: request.cmd_sn,
                max_cmd_sn: request.cmd_sn + 31,
                data,
                ..Default::default()
            }))
            .await;
        }

        /// Plain login: no authentication, accept every proposal silently
        async fn login_none(&mut self) {
            let request = self.recv_login().await;
            assert!(text_value(&request.data, "AuthMethod").is_some());
            self.send_login(
                &request,
                true,
                stage::LOGIN_OPERATIONAL_NEGOTIATION,
                serialize_text_parameters(&[("AuthMethod", "None")]),
            )
            .await;

            let request = self.recv_login().await;
            assert_eq!(request.current_stage, stage::LOGIN_OPERATIONAL_NEGOTIATION);
            self.send_login(&request, true, stage::FULL_FEATURE_PHASE, Vec::new())
                .await;
        }

        async fn recv_command(&mut self) -> ScsiCommand {
            match self.recv().await {
                Pdu::ScsiCommand(command) => command,
                other => panic!("target expected SCSI Command, got {}", other.opcode_name()),
            }
        }
    }

    fn text_value(data: &[u8], key: &str) -> Option<String> {
        parse_text_parameters(data)
            .unwrap()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn initiator_pair() -> (Connection<DuplexStream>, Target) {
        let (client, server) = duplex(1 << 20);
        (Connection::new(client), Target::new(server))
    }

    #[tokio::test]
    async fn test_chap_login_exchange() {
        // The target advertises CHAP and challenges with id=0x42,
        // c=0x1234567890; the initiator must answer with the MD5 response.
        let (mut conn, mut target) = initiator_pair();

        let target_task = tokio::spawn(async move {
            let request = target.recv_login().await;
            assert_eq!(
                text_value(&request.data, "AuthMethod").as_deref(),
                Some("CHAP,None")
            );
            assert_eq!(
                text_value(&request.data, "InitiatorName").as_deref(),
                Some("iqn.test")
            );
            assert!(!request.transit);
            target
                .send_login(
                    &request,
                    false,
                    stage::SECURITY_NEGOTIATION,
                    serialize_text_parameters(&[("AuthMethod", "CHAP")]),
                )
                .await;

            let request = target.recv_login().await;
            assert_eq!(text_value(&request.data, "CHAP_A").as_deref(), Some("5"));
            target
                .send_login(
                    &request,
                    false,
                    stage::SECURITY_NEGOTIATION,
                    serialize_text_parameters(&[
                        ("CHAP_A", "5"),
                        ("CHAP_I", "66"),
                        ("CHAP_C", "0x1234567890"),
                    ]),
                )
                .await;

            let request = target.recv_login().await;
            assert_eq!(
                text_value(&request.data, "CHAP_N").as_deref(),
                Some("iqn.test")
            );
            let mut input = vec![0x42u8];
            input.extend_from_slice(b"opensesame");
            input.extend_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x90]);
            let expected = format!("0x{}", hex::encode(md5::compute(&input).0));
            assert_eq!(text_value(&request.data, "CHAP_R").as_deref(), Some(expected.as_str()));
            assert!(request.transit);
            target
                .send_login(
                    &request,
                    true,
                    stage::LOGIN_OPERATIONAL_NEGOTIATION,
                    Vec::new(),
                )
                .await;

            let request = target.recv_login().await;
            assert_eq!(request.current_stage, stage::LOGIN_OPERATIONAL_NEGOTIATION);
            target
                .send_login(&request, true, stage::FULL_FEATURE_PHASE, Vec::new())
                .await;
        });

        let config = SessionConfig::new("iqn.test", "iqn.target")
            .with_chap("iqn.test", "opensesame");
        conn.login(&config).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::FullFeaturePhase);
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_rejects_unsupported_auth() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            let request = target.recv_login().await;
            target
                .send_login(
                    &request,
                    false,
                    stage::SECURITY_NEGOTIATION,
                    serialize_text_parameters(&[("AuthMethod", "SRP")]),
                )
                .await;
        });

        let config = SessionConfig::new("iqn.test", "iqn.target").with_chap("u", "p");
        assert!(matches!(conn.login(&config).await, Err(Error::Auth(_))));
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_failure_status_is_auth_error() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            let request = target.recv_login().await;
            let stat_sn = target.next_stat();
            target
                .send(Pdu::LoginResponse(LoginResponse {
                    transit: false,
                    initiator_task_tag: request.initiator_task_tag,
                    stat_sn,
                    status_class: 0x02,
                    status_detail: 0x01, // authentication failure
                    ..Default::default()
                }))
                .await;
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        assert!(matches!(conn.login(&config).await, Err(Error::Auth(_))));
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_operational_negotiation_applies_target_values() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            let request = target.recv_login().await;
            target
                .send_login(
                    &request,
                    true,
                    stage::LOGIN_OPERATIONAL_NEGOTIATION,
                    serialize_text_parameters(&[("AuthMethod", "None")]),
                )
                .await;

            let request = target.recv_login().await;
            // The initiator proposes the whole key table in one buffer.
            assert_eq!(
                text_value(&request.data, "MaxRecvDataSegmentLength").as_deref(),
                Some("262144")
            );
            target
                .send_login(
                    &request,
                    true,
                    stage::FULL_FEATURE_PHASE,
                    serialize_text_parameters(&[
                        ("MaxRecvDataSegmentLength", "4096"),
                        ("ImmediateData", "No"),
                        ("HeaderDigest", "None"),
                    ]),
                )
                .await;
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        conn.login(&config).await.unwrap();
        assert_eq!(conn.params().target_max_recv_data_segment_length, 4096);
        assert!(!conn.params().immediate_data);
        // Our receive limit stays as declared
        assert_eq!(conn.params().max_recv_data_segment_length, 262_144);
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_target_key_answered_not_understood() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            target.login_none_with_vendor_key().await;
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        conn.login(&config).await.unwrap();
        target_task.await.unwrap();
    }

    impl Target {
        /// Login that slips an unknown key into the operational response
        async fn login_none_with_vendor_key(&mut self) {
            let request = self.recv_login().await;
            self.send_login(
                &request,
                true,
                stage::LOGIN_OPERATIONAL_NEGOTIATION,
                serialize_text_parameters(&[("AuthMethod", "None")]),
            )
            .await;

            let request = self.recv_login().await;
            self.send_login(
                &request,
                false,
                stage::LOGIN_OPERATIONAL_NEGOTIATION,
                serialize_text_parameters(&[("X-Vendor.Frobnicate", "1")]),
            )
            .await;

            // The initiator must echo the unknown key back.
            let request = self.recv_login().await;
            assert_eq!(
                text_value(&request.data, "X-Vendor.Frobnicate").as_deref(),
                Some("NotUnderstood")
            );
            self.send_login(&request, true, stage::FULL_FEATURE_PHASE, Vec::new())
                .await;
        }
    }

    #[tokio::test]
    async fn test_read_reassembles_two_data_in_bursts() {
        // Read(6) of 8 sectors returned as two Data-In PDUs followed by a
        // Good response.
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            target.login_none().await;

            let command = target.recv_command().await;
            assert!(command.read && !command.write);
            assert_eq!(command.cdb[0], 0x08);
            assert_eq!(command.expected_data_length, 4096);

            let first: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
            let second: Vec<u8> = (0..2048u32).map(|i| ((i + 7) % 251) as u8).collect();
            target
                .send(Pdu::DataIn(DataIn {
                    final_: false,
                    initiator_task_tag: command.initiator_task_tag,
                    target_transfer_tag: 0xFFFF_FFFF,
                    data_sn: 0,
                    buffer_offset: 0,
                    data: first.clone(),
                    ..Default::default()
                }))
                .await;
            target
                .send(Pdu::DataIn(DataIn {
                    final_: true,
                    initiator_task_tag: command.initiator_task_tag,
                    target_transfer_tag: 0xFFFF_FFFF,
                    data_sn: 1,
                    buffer_offset: 2048,
                    data: second.clone(),
                    ..Default::default()
                }))
                .await;
            let stat_sn = target.next_stat();
            target
                .send(Pdu::ScsiResponse(ScsiResponse {
                    status: scsi_status::GOOD,
                    initiator_task_tag: command.initiator_task_tag,
                    stat_sn,
                    ..Default::default()
                }))
                .await;
            (first, second)
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        conn.login(&config).await.unwrap();

        let cdb = scsi::read6(0, 8).unwrap();
        let mut in_buf = vec![0u8; 4096];
        let n = conn.execute(0, &cdb, &[], &mut in_buf).await.unwrap();
        assert_eq!(n, 4096);

        let (first, second) = target_task.await.unwrap();
        assert_eq!(&in_buf[..2048], &first[..]);
        assert_eq!(&in_buf[2048..], &second[..]);
    }

    #[tokio::test]
    async fn test_write_drives_r2t_bursts() {
        let (mut conn, mut target) = initiator_pair();
        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 241) as u8).collect();
        let expected = payload.clone();

        let target_task = tokio::spawn(async move {
            let request = target.recv_login().await;
            target
                .send_login(
                    &request,
                    true,
                    stage::LOGIN_OPERATIONAL_NEGOTIATION,
                    serialize_text_parameters(&[("AuthMethod", "None")]),
                )
                .await;
            let request = target.recv_login().await;
            // Forbid immediate data and cap DataOut PDUs at 4 KiB.
            target
                .send_login(
                    &request,
                    true,
                    stage::FULL_FEATURE_PHASE,
                    serialize_text_parameters(&[
                        ("ImmediateData", "No"),
                        ("MaxRecvDataSegmentLength", "4096"),
                    ]),
                )
                .await;

            let command = target.recv_command().await;
            assert!(command.write);
            assert!(command.data.is_empty(), "immediate data was forbidden");

            target
                .send(Pdu::ReadyToTransfer(ReadyToTransfer {
                    initiator_task_tag: command.initiator_task_tag,
                    target_transfer_tag: 0x55,
                    r2t_sn: 0,
                    buffer_offset: 0,
                    desired_transfer_length: 8192,
                    ..Default::default()
                }))
                .await;

            let mut received = vec![0u8; 8192];
            let mut seen_final = false;
            let mut pdus = 0;
            while !seen_final {
                match target.recv().await {
                    Pdu::DataOut(data_out) => {
                        assert_eq!(data_out.target_transfer_tag, 0x55);
                        assert!(data_out.data.len() <= 4096);
                        let at = data_out.buffer_offset as usize;
                        received[at..at + data_out.data.len()].copy_from_slice(&data_out.data);
                        seen_final = data_out.final_;
                        pdus += 1;
                    }
                    other => panic!("expected Data-Out, got {}", other.opcode_name()),
                }
            }
            assert_eq!(pdus, 2);

            let stat_sn = target.next_stat();
            target
                .send(Pdu::ScsiResponse(ScsiResponse {
                    status: scsi_status::GOOD,
                    initiator_task_tag: command.initiator_task_tag,
                    stat_sn,
                    ..Default::default()
                }))
                .await;
            received
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        conn.login(&config).await.unwrap();

        let cdb = scsi::write10(0, 16);
        conn.execute(0, &cdb, &payload, &mut []).await.unwrap();

        let received = target_task.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_check_condition_surfaces_sense() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            target.login_none().await;
            let command = target.recv_command().await;

            let sense = [0x70, 0x00, 0x05, 0x00];
            let mut data = (sense.len() as u16).to_be_bytes().to_vec();
            data.extend_from_slice(&sense);
            let stat_sn = target.next_stat();
            target
                .send(Pdu::ScsiResponse(ScsiResponse {
                    status: scsi_status::CHECK_CONDITION,
                    initiator_task_tag: command.initiator_task_tag,
                    stat_sn,
                    data,
                    ..Default::default()
                }))
                .await;
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        conn.login(&config).await.unwrap();

        let cdb = scsi::read10(0, 1);
        let mut in_buf = vec![0u8; 512];
        match conn.execute(0, &cdb, &[], &mut in_buf).await {
            Err(Error::Scsi { status, sense }) => {
                assert_eq!(status, scsi_status::CHECK_CONDITION);
                assert_eq!(sense, vec![0x70, 0x00, 0x05, 0x00]);
            }
            other => panic!("expected ScsiError, got {:?}", other.map(|_| ())),
        }
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stat_sn_must_start_at_one() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            let request = target.recv_login().await;
            // Open the sequence at 5 instead of 1.
            target.stat_sn = 5;
            target
                .send_login(
                    &request,
                    true,
                    stage::LOGIN_OPERATIONAL_NEGOTIATION,
                    serialize_text_parameters(&[("AuthMethod", "None")]),
                )
                .await;
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        assert!(matches!(
            conn.login(&config).await,
            Err(Error::Protocol(_))
        ));
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stat_sn_violation_is_protocol_error() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            target.login_none().await;
            let command = target.recv_command().await;
            // Jump the sequence: 3 was established, send 99.
            target
                .send(Pdu::ScsiResponse(ScsiResponse {
                    status: scsi_status::GOOD,
                    initiator_task_tag: command.initiator_task_tag,
                    stat_sn: 99,
                    ..Default::default()
                }))
                .await;
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        conn.login(&config).await.unwrap();

        let cdb = scsi::read10(0, 1);
        let mut in_buf = vec![0u8; 512];
        assert!(matches!(
            conn.execute(0, &cdb, &[], &mut in_buf).await,
            Err(Error::Protocol(_))
        ));
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_target_reject_aborts_task() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            target.login_none().await;
            let _command = target.recv_command().await;
            let stat_sn = target.next_stat();
            target
                .send(Pdu::Reject(Reject {
                    reason: 0x04, // protocol error
                    stat_sn,
                    data: vec![0u8; 48],
                    ..Default::default()
                }))
                .await;
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        conn.login(&config).await.unwrap();

        let cdb = scsi::read10(0, 1);
        let mut in_buf = vec![0u8; 512];
        let error = conn.execute(0, &cdb, &[], &mut in_buf).await.unwrap_err();
        assert!(error.to_string().contains("rejected"));
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_closed_successfully() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            target.login_none().await;
            match target.recv().await {
                Pdu::LogoutRequest(request) => {
                    assert_eq!(request.reason, 0);
                    let stat_sn = target.next_stat();
                    target
                        .send(Pdu::LogoutResponse(LogoutResponse {
                            response: logout_response::CLOSED_SUCCESSFULLY,
                            initiator_task_tag: request.initiator_task_tag,
                            stat_sn,
                            time2wait: 2,
                            time2retain: 20,
                            ..Default::default()
                        }))
                        .await;
                }
                other => panic!("expected Logout Request, got {}", other.opcode_name()),
            }
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        conn.login(&config).await.unwrap();
        conn.logout().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::LoggedOut);
        target_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_failure_code_is_error() {
        let (mut conn, mut target) = initiator_pair();
        let target_task = tokio::spawn(async move {
            target.login_none().await;
            match target.recv().await {
                Pdu::LogoutRequest(request) => {
                    let stat_sn = target.next_stat();
                    target
                        .send(Pdu::LogoutResponse(LogoutResponse {
                            response: logout_response::CLEANUP_FAILED,
                            initiator_task_tag: request.initiator_task_tag,
                            stat_sn,
                            ..Default::default()
                        }))
                        .await;
                }
                other => panic!("expected Logout Request, got {}", other.opcode_name()),
            }
        });

        let config = SessionConfig::new("iqn.test", "iqn.target");
        conn.login(&config).await.unwrap();
        assert!(matches!(conn.logout().await, Err(Error::Protocol(_))));
        target_task.await.unwrap();
    }

    /// Target side of the block-device test: serve a 1 MiB in-memory LUN
    async fn serve_lun(mut target: Target, mut disk: Vec<u8>) -> Vec<u8> {
        target.login_none().await;
        loop {
            let pdu = target.recv().await;
            match pdu {
                Pdu::ScsiCommand(command) => match command.cdb[0] {
                    0x25 => {
                        let mut payload = [0u8; 8];
                        let blocks = (disk.len() / 512) as u32;
                        payload[0..4].copy_from_slice(&(blocks - 1).to_be_bytes());
                        payload[4..8].copy_from_slice(&512u32.to_be_bytes());
                        let stat_sn = target.next_stat();
                        target
                            .send(Pdu::DataIn(DataIn {
                                final_: true,
                                status_present: true,
                                status: scsi_status::GOOD,
                                initiator_task_tag: command.initiator_task_tag,
                                target_transfer_tag: 0xFFFF_FFFF,
                                stat_sn,
                                data: payload.to_vec(),
                                ..Default::default()
                            }))
                            .await;
                    }
                    0x28 => {
                        let lba = u32::from_be_bytes(command.cdb[2..6].try_into().unwrap());
                        let blocks =
                            u16::from_be_bytes(command.cdb[7..9].try_into().unwrap()) as usize;
                        let start = lba as usize * 512;
                        let data = disk[start..start + blocks * 512].to_vec();
                        let stat_sn = target.next_stat();
                        target
                            .send(Pdu::DataIn(DataIn {
                                final_: true,
                                status_present: true,
                                status: scsi_status::GOOD,
                                initiator_task_tag: command.initiator_task_tag,
                                target_transfer_tag: 0xFFFF_FFFF,
                                stat_sn,
                                data,
                                ..Default::default()
                            }))
                            .await;
                    }
                    0x2A => {
                        let lba = u32::from_be_bytes(command.cdb[2..6].try_into().unwrap());
                        let start = lba as usize * 512;
                        // Immediate data carries the whole write here.
                        disk[start..start + command.data.len()]
                            .copy_from_slice(&command.data);
                        let stat_sn = target.next_stat();
                        target
                            .send(Pdu::ScsiResponse(ScsiResponse {
                                status: scsi_status::GOOD,
                                initiator_task_tag: command.initiator_task_tag,
                                stat_sn,
                                ..Default::default()
                            }))
                            .await;
                    }
                    op => panic!("unexpected CDB opcode {:#04x}", op),
                },
                Pdu::LogoutRequest(request) => {
                    let stat_sn = target.next_stat();
                    target
                        .send(Pdu::LogoutResponse(LogoutResponse {
                            response: logout_response::CLOSED_SUCCESSFULLY,
                            initiator_task_tag: request.initiator_task_tag,
                            stat_sn,
                            ..Default::default()
                        }))
                        .await;
                    return disk;
                }
                other => panic!("unexpected {}", other.opcode_name()),
            }
        }
    }

    #[test]
    fn test_blocking_device_roundtrip() {
        use vdisk_core::BlockDevice;

        let (client, server) = duplex(1 << 20);
        let disk = vec![0u8; 1024 * 1024];

        let target_thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            runtime.block_on(serve_lun(Target::new(server), disk))
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let device = runtime
            .block_on(async {
                let mut conn = Connection::new(client);
                conn.login(&SessionConfig::new("iqn.test", "iqn.target"))
                    .await?;
                IscsiDevice::open(conn, 0).await
            })
            .unwrap();
        let mut device = BlockingDevice::from_parts(runtime, device);

        assert_eq!(device.length(), 1024 * 1024);

        // Unaligned write forces the sector read-modify-write path.
        device.write_at(1000, b"blocking adapter").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(device.read_at(1000, &mut buf).unwrap(), 16);
        assert_eq!(&buf, b"blocking adapter");

        let extents = device.extents(0..device.length()).unwrap();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].len, 1024 * 1024);

        device.close().unwrap();
        let final_disk = target_thread.join().unwrap();
        assert_eq!(&final_disk[1000..1016], b"blocking adapter");
    }
}
