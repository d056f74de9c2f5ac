//! VHDX file identifier, headers and region table
//!
//! Two 4-KiB headers alternate at 64 KiB and 128 KiB; each carries a
//! CRC-32C checksum and a monotonic sequence number. The header with the
//! higher sequence among the valid copies is current. The region table is
//! likewise duplicated at 192 KiB and 256 KiB.

use uuid::{uuid, Uuid};
use vdisk_core::codec::{crc32c, guid_from_le, guid_to_le, le_u16, le_u32, le_u64};
use vdisk_core::{ByteStore, Error, Result};

/// Offset of the first header
pub const HEADER1_OFFSET: u64 = 64 * 1024;
/// Offset of the second header
pub const HEADER2_OFFSET: u64 = 128 * 1024;
/// Offset of the first region table
pub const REGION1_OFFSET: u64 = 192 * 1024;
/// Offset of the second region table
pub const REGION2_OFFSET: u64 = 256 * 1024;

/// The BAT region GUID
pub const BAT_REGION_GUID: Uuid = uuid!("2dc27766-f623-4200-9d64-115e9bfd4a08");
/// The metadata region GUID
pub const METADATA_REGION_GUID: Uuid = uuid!("8b7ca206-4790-4b9a-b8fe-575f050f886e");

/// File type identifier at offset 0
#[derive(Debug, Clone)]
pub struct FileIdentifier {
    pub creator: String,
}

impl FileIdentifier {
    pub const SIGNATURE: &'static [u8; 8] = b"vhdxfile";

    /// Signature plus the 512-byte UTF-16LE creator field
    pub const SIZE: usize = 520;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::truncated("VHDX file identifier too small"));
        }
        if &bytes[0..8] != Self::SIGNATURE {
            return Err(Error::format(format!(
                "invalid VHDX file signature: '{}'",
                String::from_utf8_lossy(&bytes[0..8])
            )));
        }
        let units: Vec<u16> = bytes[8..Self::SIZE]
            .chunks_exact(2)
            .map(le_u16)
            .take_while(|&c| c != 0)
            .collect();
        Ok(Self {
            creator: String::from_utf16_lossy(&units),
        })
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(Self::SIGNATURE);
        for (i, unit) in self.creator.encode_utf16().take(255).enumerate() {
            let offset = 8 + i * 2;
            bytes[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
        }
        bytes
    }
}

/// One of the two alternating 4-KiB VHDX headers
#[derive(Debug, Clone)]
pub struct VhdxHeader {
    pub sequence_number: u64,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
    /// Nil when the log is empty and must not be replayed
    pub log_guid: Uuid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl VhdxHeader {
    pub const SIGNATURE: &'static [u8; 4] = b"head";
    pub const SIZE: usize = 4096;

    const CHECKSUM_FIELD: std::ops::Range<usize> = 4..8;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::truncated("VHDX header too small"));
        }
        if &bytes[0..4] != Self::SIGNATURE {
            return Err(Error::format("VHDX header signature mismatch"));
        }

        let stored = le_u32(&bytes[4..8]);
        let mut copy = bytes[..Self::SIZE].to_vec();
        copy[Self::CHECKSUM_FIELD].fill(0);
        let computed = crc32c(&copy);
        if stored != computed {
            return Err(Error::format(format!(
                "VHDX header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        let header = Self {
            sequence_number: le_u64(&bytes[8..16]),
            file_write_guid: guid_from_le(&bytes[16..32]),
            data_write_guid: guid_from_le(&bytes[32..48]),
            log_guid: guid_from_le(&bytes[48..64]),
            log_version: le_u16(&bytes[64..66]),
            version: le_u16(&bytes[66..68]),
            log_length: le_u32(&bytes[68..72]),
            log_offset: le_u64(&bytes[72..80]),
        };

        if header.version != 1 {
            return Err(Error::format(format!(
                "unsupported VHDX format version {}",
                header.version
            )));
        }
        if header.log_version != 0 && !header.log_guid.is_nil() {
            return Err(Error::format(format!(
                "unsupported VHDX log version {}",
                header.log_version
            )));
        }

        Ok(header)
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(Self::SIGNATURE);
        bytes[8..16].copy_from_slice(&self.sequence_number.to_le_bytes());
        bytes[16..32].copy_from_slice(&guid_to_le(&self.file_write_guid));
        bytes[32..48].copy_from_slice(&guid_to_le(&self.data_write_guid));
        bytes[48..64].copy_from_slice(&guid_to_le(&self.log_guid));
        bytes[64..66].copy_from_slice(&self.log_version.to_le_bytes());
        bytes[66..68].copy_from_slice(&self.version.to_le_bytes());
        bytes[68..72].copy_from_slice(&self.log_length.to_le_bytes());
        bytes[72..80].copy_from_slice(&self.log_offset.to_le_bytes());

        let checksum = crc32c(&bytes);
        bytes[4..8].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }
}

/// The current header plus which slot it came from
#[derive(Debug, Clone)]
pub struct ActiveHeader {
    pub header: VhdxHeader,
    /// 0 for the copy at 64 KiB, 1 for the copy at 128 KiB
    pub slot: usize,
}

impl ActiveHeader {
    pub fn slot_offset(slot: usize) -> u64 {
        if slot == 0 {
            HEADER1_OFFSET
        } else {
            HEADER2_OFFSET
        }
    }

    /// Offset of the slot the next header update must be written to
    pub fn inactive_offset(&self) -> u64 {
        Self::slot_offset(1 - self.slot)
    }
}

/// Elect the current header: valid checksum, higher sequence wins.
///
/// A single corrupt copy is tolerated; both corrupt is fatal.
pub fn read_active_header<S: ByteStore>(store: &mut S) -> Result<ActiveHeader> {
    let mut buf = vec![0u8; VhdxHeader::SIZE];

    let mut candidates: [Option<VhdxHeader>; 2] = [None, None];
    for (slot, offset) in [HEADER1_OFFSET, HEADER2_OFFSET].into_iter().enumerate() {
        store.read_at(offset, &mut buf)?;
        match VhdxHeader::parse(&buf) {
            Ok(header) => candidates[slot] = Some(header),
            Err(error) => {
                tracing::warn!(slot, %error, "ignoring corrupt VHDX header copy");
            }
        }
    }

    match candidates {
        [Some(a), Some(b)] => {
            if a.sequence_number >= b.sequence_number {
                Ok(ActiveHeader { header: a, slot: 0 })
            } else {
                Ok(ActiveHeader { header: b, slot: 1 })
            }
        }
        [Some(a), None] => Ok(ActiveHeader { header: a, slot: 0 }),
        [None, Some(b)] => Ok(ActiveHeader { header: b, slot: 1 }),
        [None, None] => Err(Error::format("both VHDX header copies are invalid")),
    }
}

/// Write `header` (with a bumped sequence) into the inactive slot, making it
/// current. Returns the new active view.
pub fn write_header_update<S: ByteStore>(
    store: &mut S,
    active: &ActiveHeader,
    mut header: VhdxHeader,
) -> Result<ActiveHeader> {
    header.sequence_number = active.header.sequence_number + 1;
    let offset = active.inactive_offset();
    store.write_at(offset, &header.serialize())?;
    Ok(ActiveHeader {
        header,
        slot: 1 - active.slot,
    })
}

/// One entry of the region table
#[derive(Debug, Clone, Copy)]
pub struct RegionEntry {
    pub guid: Uuid,
    pub file_offset: u64,
    pub length: u32,
    pub required: bool,
}

/// The region table (64 KiB, duplicated)
#[derive(Debug, Clone)]
pub struct RegionTable {
    pub entries: Vec<RegionEntry>,
}

impl RegionTable {
    pub const SIGNATURE: &'static [u8; 4] = b"regi";
    pub const SIZE: usize = 64 * 1024;

    const CHECKSUM_FIELD: std::ops::Range<usize> = 4..8;
    const MAX_ENTRIES: usize = 2047;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::truncated("VHDX region table too small"));
        }
        if &bytes[0..4] != Self::SIGNATURE {
            return Err(Error::format("VHDX region table signature mismatch"));
        }

        let stored = le_u32(&bytes[4..8]);
        let mut copy = bytes[..Self::SIZE].to_vec();
        copy[Self::CHECKSUM_FIELD].fill(0);
        let computed = crc32c(&copy);
        if stored != computed {
            return Err(Error::format(format!(
                "VHDX region table checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        let entry_count = le_u32(&bytes[8..12]) as usize;
        if entry_count > Self::MAX_ENTRIES {
            return Err(Error::format(format!(
                "VHDX region table claims {} entries",
                entry_count
            )));
        }

        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let offset = 16 + i * 32;
            let entry = &bytes[offset..offset + 32];
            entries.push(RegionEntry {
                guid: guid_from_le(&entry[0..16]),
                file_offset: le_u64(&entry[16..24]),
                length: le_u32(&entry[24..28]),
                required: le_u32(&entry[28..32]) & 1 != 0,
            });
        }
        Ok(Self { entries })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(Self::SIGNATURE);
        bytes[8..12].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = 16 + i * 32;
            bytes[offset..offset + 16].copy_from_slice(&guid_to_le(&entry.guid));
            bytes[offset + 16..offset + 24].copy_from_slice(&entry.file_offset.to_le_bytes());
            bytes[offset + 24..offset + 28].copy_from_slice(&entry.length.to_le_bytes());
            bytes[offset + 28..offset + 32]
                .copy_from_slice(&(entry.required as u32).to_le_bytes());
        }

        let checksum = crc32c(&bytes);
        bytes[4..8].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    pub fn find(&self, guid: Uuid) -> Option<&RegionEntry> {
        self.entries.iter().find(|e| e.guid == guid)
    }
}

/// Read the region table, falling back to the second copy on corruption
pub fn read_region_table<S: ByteStore>(store: &mut S) -> Result<RegionTable> {
    let mut buf = vec![0u8; RegionTable::SIZE];
    store.read_at(REGION1_OFFSET, &mut buf)?;
    match RegionTable::parse(&buf) {
        Ok(table) => Ok(table),
        Err(error) => {
            tracing::warn!(%error, "first VHDX region table corrupt, trying second copy");
            store.read_at(REGION2_OFFSET, &mut buf)?;
            RegionTable::parse(&buf)
                .map_err(|_| Error::format("both VHDX region table copies are invalid"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdisk_pipeline::MemStore;

    pub(crate) fn test_header(sequence: u64) -> VhdxHeader {
        VhdxHeader {
            sequence_number: sequence,
            file_write_guid: uuid!("11111111-2222-3333-4444-555555555555"),
            data_write_guid: uuid!("66666666-7777-8888-9999-aaaaaaaaaaaa"),
            log_guid: Uuid::nil(),
            log_version: 0,
            version: 1,
            log_length: 1024 * 1024,
            log_offset: 1024 * 1024,
        }
    }

    #[test]
    fn test_file_identifier_roundtrip() {
        let id = FileIdentifier {
            creator: "vdisk test".to_string(),
        };
        let parsed = FileIdentifier::parse(&id.serialize()).unwrap();
        assert_eq!(parsed.creator, "vdisk test");
    }

    #[test]
    fn test_header_roundtrip() {
        let header = test_header(7);
        let parsed = VhdxHeader::parse(&header.serialize()).unwrap();
        assert_eq!(parsed.sequence_number, 7);
        assert_eq!(parsed.log_offset, 1024 * 1024);
        assert_eq!(parsed.file_write_guid, header.file_write_guid);
    }

    #[test]
    fn test_header_checksum_rejected() {
        let mut bytes = test_header(1).serialize();
        bytes[100] ^= 0xFF;
        assert!(VhdxHeader::parse(&bytes).is_err());
    }

    fn store_with_headers(a: Option<&VhdxHeader>, b: Option<&VhdxHeader>) -> MemStore {
        let mut store = MemStore::with_len(192 * 1024);
        if let Some(a) = a {
            vdisk_core::ByteStore::write_at(&mut store, HEADER1_OFFSET, &a.serialize()).unwrap();
        }
        if let Some(b) = b {
            vdisk_core::ByteStore::write_at(&mut store, HEADER2_OFFSET, &b.serialize()).unwrap();
        }
        store
    }

    #[test]
    fn test_higher_sequence_wins() {
        let mut store = store_with_headers(Some(&test_header(4)), Some(&test_header(9)));
        let active = read_active_header(&mut store).unwrap();
        assert_eq!(active.header.sequence_number, 9);
        assert_eq!(active.slot, 1);
    }

    #[test]
    fn test_single_valid_header_survives() {
        let mut store = store_with_headers(Some(&test_header(4)), None);
        let active = read_active_header(&mut store).unwrap();
        assert_eq!(active.header.sequence_number, 4);
        assert_eq!(active.slot, 0);
    }

    #[test]
    fn test_both_headers_corrupt_is_fatal() {
        let mut store = store_with_headers(None, None);
        assert!(matches!(
            read_active_header(&mut store),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_header_update_alternates_slots() {
        let mut store = store_with_headers(Some(&test_header(4)), Some(&test_header(5)));
        let active = read_active_header(&mut store).unwrap();
        assert_eq!(active.slot, 1);

        let updated = write_header_update(&mut store, &active, active.header.clone()).unwrap();
        assert_eq!(updated.slot, 0);
        assert_eq!(updated.header.sequence_number, 6);

        let reread = read_active_header(&mut store).unwrap();
        assert_eq!(reread.slot, 0);
        assert_eq!(reread.header.sequence_number, 6);
    }

    #[test]
    fn test_region_table_roundtrip_and_fallback() {
        let table = RegionTable {
            entries: vec![
                RegionEntry {
                    guid: BAT_REGION_GUID,
                    file_offset: 3 * 1024 * 1024,
                    length: 1024 * 1024,
                    required: true,
                },
                RegionEntry {
                    guid: METADATA_REGION_GUID,
                    file_offset: 2 * 1024 * 1024,
                    length: 1024 * 1024,
                    required: true,
                },
            ],
        };

        let mut store = MemStore::with_len(320 * 1024);
        // First copy corrupt, second valid
        vdisk_core::ByteStore::write_at(&mut store, REGION1_OFFSET, &[0xAA; 64]).unwrap();
        vdisk_core::ByteStore::write_at(&mut store, REGION2_OFFSET, &table.serialize()).unwrap();

        let parsed = read_region_table(&mut store).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        let bat = parsed.find(BAT_REGION_GUID).unwrap();
        assert_eq!(bat.file_offset, 3 * 1024 * 1024);
        assert!(bat.required);
        assert!(parsed.find(METADATA_REGION_GUID).is_some());
    }
}
