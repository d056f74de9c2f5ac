//! VHDX write-ahead log scanning and replay
//!
//! The log is a circular buffer of 4-KiB-aligned entries. Each entry is a
//! 64-byte header, a descriptor array and one 4-KiB data sector per Data
//! descriptor. On open, the longest self-consistent ascending-sequence run
//! whose head's tail points back inside the run is replayed against the
//! file, bringing its metadata back to consistency.

use uuid::Uuid;
use vdisk_core::codec::{crc32c, guid_from_le, le_u32, le_u64};
use vdisk_core::store::write_zeroes;
use vdisk_core::{ByteStore, Error, Result};

/// Log sector granularity
pub const LOG_SECTOR: u64 = 4096;
const ENTRY_HEADER_SIZE: usize = 64;
const DESCRIPTOR_SIZE: usize = 32;

const ENTRY_SIGNATURE: &[u8; 4] = b"loge";
const ZERO_SIGNATURE: &[u8; 4] = b"zero";
const DESC_SIGNATURE: &[u8; 4] = b"desc";
const DATA_SIGNATURE: &[u8; 4] = b"data";

/// Where the log lives and which entries belong to it
#[derive(Debug, Clone, Copy)]
pub struct LogRange {
    pub offset: u64,
    pub length: u64,
    pub guid: Uuid,
}

/// Parsed log entry header (64 bytes)
#[derive(Debug, Clone)]
pub struct LogEntryHeader {
    pub checksum: u32,
    pub entry_length: u32,
    /// Offset (from the log start) of the first entry of the sequence this
    /// entry ends
    pub tail: u32,
    pub sequence_number: u64,
    pub descriptor_count: u32,
    pub log_guid: Uuid,
    pub flushed_file_offset: u64,
    pub last_file_offset: u64,
}

impl LogEntryHeader {
    fn parse(bytes: &[u8]) -> Option<Self> {
        if &bytes[0..4] != ENTRY_SIGNATURE {
            return None;
        }
        Some(Self {
            checksum: le_u32(&bytes[4..8]),
            entry_length: le_u32(&bytes[8..12]),
            tail: le_u32(&bytes[12..16]),
            sequence_number: le_u64(&bytes[16..24]),
            descriptor_count: le_u32(&bytes[24..28]),
            log_guid: guid_from_le(&bytes[32..48]),
            flushed_file_offset: le_u64(&bytes[48..56]),
            last_file_offset: le_u64(&bytes[56..64]),
        })
    }
}

/// One descriptor of a log entry
#[derive(Debug, Clone)]
pub enum LogDescriptor {
    /// Clear `[file_offset, file_offset + length)`
    Zero { length: u64, file_offset: u64 },
    /// Overwrite one 4-KiB sector at `file_offset`; the first eight and last
    /// four bytes of the update travel in the descriptor itself
    Data {
        trailing: [u8; 4],
        leading: [u8; 8],
        file_offset: u64,
    },
}

/// A validated log entry with its raw bytes
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub header: LogEntryHeader,
    /// Offset of this entry from the log start
    pub offset: u64,
    raw: Vec<u8>,
}

impl LogEntry {
    fn descriptors(&self) -> Result<Vec<LogDescriptor>> {
        let count = self.header.descriptor_count as usize;
        let mut descriptors = Vec::with_capacity(count);
        for i in 0..count {
            let offset = ENTRY_HEADER_SIZE + i * DESCRIPTOR_SIZE;
            let bytes = &self.raw[offset..offset + DESCRIPTOR_SIZE];
            let sequence = le_u64(&bytes[24..32]);
            if sequence != self.header.sequence_number {
                return Err(Error::format(format!(
                    "log descriptor sequence {} disagrees with entry {}",
                    sequence, self.header.sequence_number
                )));
            }
            match &bytes[0..4] {
                sig if sig == ZERO_SIGNATURE => descriptors.push(LogDescriptor::Zero {
                    length: le_u64(&bytes[8..16]),
                    file_offset: le_u64(&bytes[16..24]),
                }),
                sig if sig == DESC_SIGNATURE => {
                    let mut trailing = [0u8; 4];
                    trailing.copy_from_slice(&bytes[4..8]);
                    let mut leading = [0u8; 8];
                    leading.copy_from_slice(&bytes[8..16]);
                    descriptors.push(LogDescriptor::Data {
                        trailing,
                        leading,
                        file_offset: le_u64(&bytes[16..24]),
                    });
                }
                sig => {
                    return Err(Error::format(format!(
                        "unknown log descriptor signature {:02x?}",
                        sig
                    )));
                }
            }
        }
        Ok(descriptors)
    }

    /// Offset of the first data sector within the entry
    fn data_area(&self) -> usize {
        let header_bytes =
            ENTRY_HEADER_SIZE + self.header.descriptor_count as usize * DESCRIPTOR_SIZE;
        header_bytes.div_ceil(LOG_SECTOR as usize) * LOG_SECTOR as usize
    }

    /// Reconstruct the 4-KiB update carried by data descriptor `index`
    fn data_sector(
        &self,
        index: usize,
        leading: &[u8; 8],
        trailing: &[u8; 4],
    ) -> Result<Vec<u8>> {
        let start = self.data_area() + index * LOG_SECTOR as usize;
        let sector = &self.raw[start..start + LOG_SECTOR as usize];

        if &sector[0..4] != DATA_SIGNATURE {
            return Err(Error::format("log data sector signature mismatch"));
        }
        let seq = self.header.sequence_number;
        if le_u32(&sector[4092..4096]) != (seq & 0xFFFF_FFFF) as u32 {
            return Err(Error::format("log data sector sequence-low mismatch"));
        }
        if le_u32(&sector[4..8]) != (seq >> 32) as u32 {
            return Err(Error::format("log data sector sequence-high mismatch"));
        }

        let mut update = Vec::with_capacity(LOG_SECTOR as usize);
        update.extend_from_slice(leading);
        update.extend_from_slice(&sector[8..4092]);
        update.extend_from_slice(trailing);
        Ok(update)
    }
}

/// Read within the circular log region, wrapping at its end
fn read_circular<S: ByteStore>(
    store: &mut S,
    log: &LogRange,
    pos: u64,
    buf: &mut [u8],
) -> Result<()> {
    let mut pos = pos % log.length;
    let mut done = 0usize;
    while done < buf.len() {
        let n = ((log.length - pos) as usize).min(buf.len() - done);
        store.read_at(log.offset + pos, &mut buf[done..done + n])?;
        done += n;
        pos = (pos + n as u64) % log.length;
    }
    Ok(())
}

/// Attempt to parse a valid entry at `offset` within the log
fn try_parse_entry<S: ByteStore>(
    store: &mut S,
    log: &LogRange,
    offset: u64,
) -> Result<Option<LogEntry>> {
    let mut head = [0u8; ENTRY_HEADER_SIZE];
    read_circular(store, log, offset, &mut head)?;

    let header = match LogEntryHeader::parse(&head) {
        Some(header) => header,
        None => return Ok(None),
    };

    if header.log_guid != log.guid {
        return Ok(None);
    }
    let entry_length = header.entry_length as u64;
    if entry_length == 0 || entry_length % LOG_SECTOR != 0 || entry_length > log.length {
        return Ok(None);
    }
    if header.tail as u64 % LOG_SECTOR != 0 || header.tail as u64 >= log.length {
        return Ok(None);
    }
    if header.sequence_number == 0 {
        return Ok(None);
    }
    let descriptor_bytes = ENTRY_HEADER_SIZE as u64
        + header.descriptor_count as u64 * DESCRIPTOR_SIZE as u64;
    if descriptor_bytes > entry_length {
        return Ok(None);
    }

    let mut raw = vec![0u8; entry_length as usize];
    read_circular(store, log, offset, &mut raw)?;

    let mut copy = raw.clone();
    copy[4..8].fill(0);
    let computed = crc32c(&copy);
    if computed != header.checksum {
        return Err(Error::format(format!(
            "log entry checksum mismatch at offset {}: stored {:#010x}, computed {:#010x}",
            offset, header.checksum, computed
        )));
    }

    Ok(Some(LogEntry {
        header,
        offset,
        raw,
    }))
}

/// Find the active log sequence: among candidate ascending runs, the one
/// whose head's tail points inside the run, with the highest head sequence.
pub fn scan<S: ByteStore>(store: &mut S, log: &LogRange) -> Result<Vec<LogEntry>> {
    if log.guid.is_nil() {
        return Ok(Vec::new());
    }

    let mut best: Vec<LogEntry> = Vec::new();
    let mut offset = 0u64;
    while offset < log.length {
        if let Some(first) = try_parse_entry(store, log, offset)? {
            let mut run = vec![first];
            loop {
                let last = run.last().expect("run is non-empty");
                let next = (last.offset + last.header.entry_length as u64) % log.length;
                if next == run[0].offset {
                    break;
                }
                match try_parse_entry(store, log, next)? {
                    Some(entry)
                        if entry.header.sequence_number
                            == last.header.sequence_number + 1 =>
                    {
                        run.push(entry);
                    }
                    _ => break,
                }
            }

            // The head's tail must reference an entry inside the run; the
            // active sequence starts there.
            let head_tail = run.last().expect("run is non-empty").header.tail as u64;
            if let Some(tail_index) = run.iter().position(|e| e.offset == head_tail) {
                let candidate = &run[tail_index..];
                let head_seq = candidate
                    .last()
                    .expect("candidate is non-empty")
                    .header
                    .sequence_number;
                let best_seq = best.last().map(|e| e.header.sequence_number);
                if best_seq.map_or(true, |s| head_seq > s) {
                    best = candidate.to_vec();
                }
            }
        }
        offset += LOG_SECTOR;
    }
    Ok(best)
}

/// Scan for the active sequence and apply it to `target`.
pub fn replay<S: ByteStore, T: ByteStore>(
    store: &mut S,
    log: &LogRange,
    target: &mut T,
) -> Result<usize> {
    let entries = scan(store, log)?;
    apply(&entries, target)
}

/// Apply an active sequence to `target` and size it to the head's
/// `last_file_offset`. Returns the number of entries applied.
pub fn apply<T: ByteStore>(entries: &[LogEntry], target: &mut T) -> Result<usize> {
    let Some(head) = entries.last() else {
        return Ok(0);
    };

    if head.header.flushed_file_offset > target.len()? {
        return Err(Error::truncated(format!(
            "log expects at least {} flushed bytes, file has {}",
            head.header.flushed_file_offset,
            target.len()?
        )));
    }

    let head_header = head.header.clone();
    let count = entries.len();
    for entry in entries {
        let descriptors = entry.descriptors()?;
        let mut data_index = 0usize;
        for descriptor in &descriptors {
            match descriptor {
                LogDescriptor::Zero {
                    length,
                    file_offset,
                } => {
                    if length % LOG_SECTOR != 0 || file_offset % LOG_SECTOR != 0 {
                        return Err(Error::format("misaligned zero descriptor"));
                    }
                    write_zeroes(target, *file_offset, *length)?;
                }
                LogDescriptor::Data {
                    trailing,
                    leading,
                    file_offset,
                } => {
                    if file_offset % LOG_SECTOR != 0 {
                        return Err(Error::format("misaligned data descriptor"));
                    }
                    let update = entry.data_sector(data_index, leading, trailing)?;
                    target.write_at(*file_offset, &update)?;
                    data_index += 1;
                }
            }
        }
        tracing::debug!(
            sequence = entry.header.sequence_number,
            descriptors = descriptors.len(),
            "replayed log entry"
        );
    }

    target.set_len(head_header.last_file_offset)?;
    Ok(count)
}


#[cfg(test)]
mod tests {
    use super::build::{encode_entry, BuildDescriptor};
    use super::*;
    use uuid::uuid;
    use vdisk_pipeline::MemStore;

    const LOG_LEN: u64 = 1024 * 1024;
    const GUID: Uuid = uuid!("020a46dd-b41d-134d-ad70-dc3093afd5c2");

    fn log_store(entries: &[(u64, Vec<u8>)]) -> MemStore {
        // Log region at offset 0 for simplicity
        let mut store = MemStore::with_len(LOG_LEN as usize);
        for (offset, raw) in entries {
            vdisk_core::ByteStore::write_at(&mut store, *offset, raw).unwrap();
        }
        store
    }

    fn range() -> LogRange {
        LogRange {
            offset: 0,
            length: LOG_LEN,
            guid: GUID,
        }
    }

    #[test]
    fn test_scan_empty_log() {
        let mut store = MemStore::with_len(LOG_LEN as usize);
        assert!(scan(&mut store, &range()).unwrap().is_empty());
    }

    #[test]
    fn test_scan_nil_guid_skips_replay() {
        let entry = encode_entry(GUID, 5, 0, &[], 0, 0);
        let mut store = log_store(&[(0, entry)]);
        let log = LogRange {
            guid: Uuid::nil(),
            ..range()
        };
        assert!(scan(&mut store, &log).unwrap().is_empty());
    }

    #[test]
    fn test_scan_finds_chain() {
        let e5 = encode_entry(GUID, 5, 0, &[], 0, 0);
        let e6 = encode_entry(GUID, 6, 0, &[], 0, 0);
        let e7 = encode_entry(GUID, 7, 0, &[], 0, 0);
        let mut store = log_store(&[(0, e5), (4096, e6), (8192, e7)]);

        let entries = scan(&mut store, &range()).unwrap();
        let sequences: Vec<u64> = entries.iter().map(|e| e.header.sequence_number).collect();
        assert_eq!(sequences, vec![5, 6, 7]);
    }

    #[test]
    fn test_scan_tail_outside_run_rejected() {
        // Head's tail points at 64 KiB where no entry lives
        let entry = encode_entry(GUID, 5, 64 * 1024, &[], 0, 0);
        let mut store = log_store(&[(0, entry)]);
        assert!(scan(&mut store, &range()).unwrap().is_empty());
    }

    #[test]
    fn test_scan_prefers_higher_sequence() {
        // Two disjoint self-consistent chains; the later one wins
        let old = encode_entry(GUID, 3, 0, &[], 0, 0);
        let newer = encode_entry(GUID, 9, 128 * 1024, &[], 0, 0);
        let mut store = log_store(&[(0, old), (128 * 1024, newer)]);

        let entries = scan(&mut store, &range()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].header.sequence_number, 9);
    }

    #[test]
    fn test_scan_corrupt_header_checksum_is_fatal() {
        let mut entry = encode_entry(GUID, 5, 0, &[], 0, 0);
        entry[5] ^= 0xFF; // checksum field
        let mut store = log_store(&[(0, entry)]);
        assert!(matches!(
            scan(&mut store, &range()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_replay_zero_data_zero() {
        let mut payload = [0u8; 4096];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        let e5 = encode_entry(
            GUID,
            5,
            0,
            &[BuildDescriptor::Zero {
                length: 4096,
                file_offset: 0,
            }],
            0,
            16384,
        );
        let e6_off = e5.len() as u64;
        let e6 = encode_entry(
            GUID,
            6,
            0,
            &[BuildDescriptor::Data {
                file_offset: 4096,
                payload,
            }],
            0,
            16384,
        );
        let e7_off = e6_off + e6.len() as u64;
        let e7 = encode_entry(
            GUID,
            7,
            0,
            &[BuildDescriptor::Zero {
                length: 4096,
                file_offset: 8192,
            }],
            0,
            16384,
        );

        let mut store = log_store(&[(0, e5), (e6_off, e6), (e7_off, e7)]);
        let mut target = MemStore::from_vec(vec![0xEEu8; 16384]);

        let applied = replay(&mut store, &range(), &mut target).unwrap();
        assert_eq!(applied, 3);

        let bytes = target.as_slice();
        assert!(bytes[0..4096].iter().all(|&b| b == 0));
        assert_eq!(&bytes[4096..8192], &payload[..]);
        assert!(bytes[8192..12288].iter().all(|&b| b == 0));
        assert!(bytes[12288..].iter().all(|&b| b == 0xEE));
        assert_eq!(target.as_slice().len(), 16384);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut payload = [0u8; 4096];
        payload[100] = 0xAB;
        let entry = encode_entry(
            GUID,
            5,
            0,
            &[BuildDescriptor::Data {
                file_offset: 0,
                payload,
            }],
            0,
            8192,
        );
        let mut store = log_store(&[(0, entry)]);

        let mut target = MemStore::from_vec(vec![0u8; 8192]);
        replay(&mut store, &range(), &mut target).unwrap();
        let first = target.as_slice().to_vec();

        replay(&mut store, &range(), &mut target).unwrap();
        assert_eq!(target.as_slice(), &first[..]);
    }

    #[test]
    fn test_replay_truncated_file_is_fatal() {
        let entry = encode_entry(GUID, 5, 0, &[], 1024 * 1024 * 1024, 0);
        let mut store = log_store(&[(0, entry)]);
        let mut target = MemStore::from_vec(vec![0u8; 4096]);
        assert!(matches!(
            replay(&mut store, &range(), &mut target),
            Err(Error::Truncated(_))
        ));
    }

    #[test]
    fn test_replay_wrapping_chain() {
        // Entry at the last log sector chains to offset 0
        let last_off = LOG_LEN - 4096;
        let e5 = encode_entry(GUID, 5, last_off as u32, &[], 0, 4096);
        let e6 = encode_entry(GUID, 6, last_off as u32, &[], 0, 4096);
        let mut store = log_store(&[(last_off, e5), (0, e6)]);

        let entries = scan(&mut store, &range()).unwrap();
        let sequences: Vec<u64> = entries.iter().map(|e| e.header.sequence_number).collect();
        assert_eq!(sequences, vec![5, 6]);
    }
}
