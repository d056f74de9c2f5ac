//! SCSI task execution
//!
//! One in-flight task at a time: emit the command with whatever immediate
//! data fits, answer R2Ts with DataOut bursts, reassemble DataIn payloads,
//! and fold the final status (and sense data) into the result.

use tokio::io::{AsyncRead, AsyncWrite};
use vdisk_core::codec::be_u16;
use vdisk_core::{Error, Result};

use crate::connection::{Connection, ConnectionState};
use crate::pdu::{scsi_status, DataOut, Pdu, ScsiCommand, ScsiResponse};

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection<T> {
    /// Execute one SCSI command.
    ///
    /// `out` is sent to the target (immediate data first, then R2T-driven
    /// bursts); DataIn payloads are scattered into `in_buf` at their buffer
    /// offsets. Returns the number of bytes received.
    pub async fn execute(
        &mut self,
        lun: u64,
        cdb: &[u8],
        out: &[u8],
        in_buf: &mut [u8],
    ) -> Result<usize> {
        if self.state() != ConnectionState::FullFeaturePhase {
            return Err(Error::protocol("SCSI command outside full feature phase"));
        }
        if cdb.len() > 16 {
            return Err(Error::protocol(format!(
                "CDB of {} bytes exceeds the 16-byte BHS field",
                cdb.len()
            )));
        }

        let mut padded_cdb = [0u8; 16];
        padded_cdb[..cdb.len()].copy_from_slice(cdb);

        let immediate_len = if self.params.immediate_data {
            out.len()
                .min(self.params.first_burst_length as usize)
                .min(self.params.target_max_recv_data_segment_length as usize)
        } else {
            0
        };

        let task_tag = self.task_tag;
        let command = ScsiCommand {
            immediate: false,
            final_: true,
            read: !in_buf.is_empty(),
            write: !out.is_empty(),
            attr: 1, // simple queueing
            lun,
            initiator_task_tag: task_tag,
            expected_data_length: out.len().max(in_buf.len()) as u32,
            cmd_sn: self.cmd_sn,
            exp_stat_sn: self.exp_stat_sn_hint(),
            cdb: padded_cdb,
            data: out[..immediate_len].to_vec(),
        };
        self.send(&Pdu::ScsiCommand(command)).await?;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);

        let mut bytes_read = 0usize;
        let response: ScsiResponse = loop {
            match self.recv().await? {
                Pdu::ReadyToTransfer(r2t) => {
                    if r2t.initiator_task_tag != task_tag {
                        return Err(Error::protocol(format!(
                            "R2T for unknown task tag {}",
                            r2t.initiator_task_tag
                        )));
                    }
                    self.answer_r2t(lun, task_tag, &r2t, out).await?;
                }
                Pdu::DataIn(data_in) => {
                    if data_in.initiator_task_tag != task_tag {
                        return Err(Error::protocol(format!(
                            "Data-In for unknown task tag {}",
                            data_in.initiator_task_tag
                        )));
                    }
                    let offset = data_in.buffer_offset as usize;
                    let end = offset + data_in.data.len();
                    if end > in_buf.len() {
                        return Err(Error::protocol(format!(
                            "Data-In writes {}..{} past the {}-byte buffer",
                            offset,
                            end,
                            in_buf.len()
                        )));
                    }
                    in_buf[offset..end].copy_from_slice(&data_in.data);
                    bytes_read = bytes_read.max(end);

                    if data_in.status_present {
                        // Phase-collapsed status: the task ends here.
                        if data_in.status != scsi_status::GOOD {
                            return Err(Error::Scsi {
                                status: data_in.status,
                                sense: Vec::new(),
                            });
                        }
                        self.task_tag = self.task_tag.wrapping_add(1);
                        return Ok(bytes_read);
                    }
                }
                Pdu::ScsiResponse(response) => {
                    if response.initiator_task_tag != task_tag {
                        return Err(Error::protocol(format!(
                            "SCSI Response for unknown task tag {}",
                            response.initiator_task_tag
                        )));
                    }
                    break response;
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected {} during SCSI task",
                        other.opcode_name()
                    )));
                }
            }
        };

        self.task_tag = self.task_tag.wrapping_add(1);

        match response.status {
            scsi_status::GOOD => Ok(bytes_read),
            scsi_status::CHECK_CONDITION => Err(Error::Scsi {
                status: response.status,
                sense: parse_sense(&response.data),
            }),
            status => Err(Error::Scsi {
                status,
                sense: parse_sense(&response.data),
            }),
        }
    }

    /// Emit the DataOut burst a Ready-to-Transfer asks for
    async fn answer_r2t(
        &mut self,
        lun: u64,
        task_tag: u32,
        r2t: &crate::pdu::ReadyToTransfer,
        out: &[u8],
    ) -> Result<()> {
        let start = r2t.buffer_offset as usize;
        let desired = r2t.desired_transfer_length as usize;
        let end = start
            .checked_add(desired)
            .filter(|&end| end <= out.len())
            .ok_or_else(|| {
                Error::protocol(format!(
                    "R2T requests {}..{} beyond the {}-byte output buffer",
                    start,
                    start + desired,
                    out.len()
                ))
            })?;

        let limit = self.params.target_max_recv_data_segment_length as usize;
        let mut offset = start;
        let mut data_sn = 0u32;
        while offset < end {
            let len = limit.min(end - offset);
            let pdu = DataOut {
                final_: offset + len == end,
                lun,
                initiator_task_tag: task_tag,
                target_transfer_tag: r2t.target_transfer_tag,
                exp_stat_sn: self.exp_stat_sn_hint(),
                data_sn,
                buffer_offset: offset as u32,
                data: out[offset..offset + len].to_vec(),
            };
            self.send(&Pdu::DataOut(pdu)).await?;
            offset += len;
            data_sn += 1;
        }
        Ok(())
    }
}

/// Sense payload: a big-endian u16 length followed by the sense bytes
fn parse_sense(data: &[u8]) -> Vec<u8> {
    if data.len() < 2 {
        return Vec::new();
    }
    let len = be_u16(&data[0..2]) as usize;
    data[2..].get(..len).map(<[u8]>::to_vec).unwrap_or_else(|| data[2..].to_vec())
}
