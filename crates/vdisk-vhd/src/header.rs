//! VHD dynamic header (1024 bytes) and parent locators

use uuid::Uuid;
use vdisk_core::codec::{be_u32, be_u64, ones_complement_checksum};
use vdisk_core::{Error, Result};

/// Parent locator entry (24 bytes) inside the dynamic header.
///
/// Differencing images carry up to eight of these, each pointing at a
/// platform-specific blob elsewhere in the file that names the parent image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParentLocator {
    pub platform_code: [u8; 4],
    /// Space reserved for the blob, in 512-byte sectors
    pub data_space: u32,
    /// Actual blob length in bytes
    pub data_length: u32,
    /// Absolute file offset of the blob
    pub data_offset: u64,
}

impl ParentLocator {
    /// Windows absolute Unicode path
    pub const PLATFORM_W2KU: &'static [u8; 4] = b"W2ku";
    /// Windows relative Unicode path
    pub const PLATFORM_W2RU: &'static [u8; 4] = b"W2ru";

    pub const SIZE: usize = 24;

    pub fn parse(bytes: &[u8]) -> Self {
        let mut platform_code = [0u8; 4];
        platform_code.copy_from_slice(&bytes[0..4]);
        Self {
            platform_code,
            data_space: be_u32(&bytes[4..8]),
            data_length: be_u32(&bytes[8..12]),
            data_offset: be_u64(&bytes[16..24]),
        }
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.platform_code);
        bytes[4..8].copy_from_slice(&self.data_space.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.data_length.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes
    }

    /// A locator is in use when it has a platform code and a non-empty blob
    pub fn is_set(&self) -> bool {
        self.platform_code != [0u8; 4] && self.data_length > 0
    }
}

/// VHD dynamic header structure (1024 bytes, big-endian).
///
/// Located at the footer's `data_offset` in dynamic and differencing images.
#[derive(Debug, Clone)]
pub struct DynamicHeader {
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_uuid: Uuid,
    pub parent_timestamp: u32,
    pub parent_unicode_name: [u16; 256],
    pub parent_locators: [ParentLocator; 8],
}

impl DynamicHeader {
    /// Dynamic header cookie value
    pub const COOKIE: &'static [u8; 8] = b"cxsparse";

    /// Size of the dynamic header in bytes
    pub const SIZE: usize = 1024;

    /// Header version this implementation understands
    pub const VERSION: u32 = 0x0001_0000;

    /// Default block size (2 MiB)
    pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

    const CHECKSUM_FIELD: std::ops::Range<usize> = 36..40;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::truncated("VHD dynamic header too small"));
        }

        if &bytes[0..8] != Self::COOKIE {
            return Err(Error::format(format!(
                "invalid VHD dynamic header cookie: '{}'",
                String::from_utf8_lossy(&bytes[0..8])
            )));
        }

        let checksum = be_u32(&bytes[36..40]);
        let computed = ones_complement_checksum(&bytes[..Self::SIZE], Self::CHECKSUM_FIELD);
        if checksum != computed {
            return Err(Error::format(format!(
                "VHD dynamic header checksum mismatch: stored {:#010x}, computed {:#010x}",
                checksum, computed
            )));
        }

        let header_version = be_u32(&bytes[24..28]);
        if header_version != Self::VERSION {
            return Err(Error::format(format!(
                "unsupported VHD dynamic header version {:#010x}",
                header_version
            )));
        }

        let block_size = be_u32(&bytes[32..36]);
        if block_size == 0 || !block_size.is_power_of_two() || block_size % 512 != 0 {
            return Err(Error::format(format!(
                "invalid VHD block size {}",
                block_size
            )));
        }

        let mut parent_unicode_name = [0u16; 256];
        for (i, chunk) in bytes[64..576].chunks_exact(2).enumerate() {
            parent_unicode_name[i] = u16::from_be_bytes([chunk[0], chunk[1]]);
        }

        let mut parent_locators = [ParentLocator::default(); 8];
        for (i, entry) in parent_locators.iter_mut().enumerate() {
            let offset = 576 + i * ParentLocator::SIZE;
            *entry = ParentLocator::parse(&bytes[offset..offset + ParentLocator::SIZE]);
        }

        Ok(Self {
            data_offset: be_u64(&bytes[8..16]),
            table_offset: be_u64(&bytes[16..24]),
            header_version,
            max_table_entries: be_u32(&bytes[28..32]),
            block_size,
            checksum,
            parent_uuid: vdisk_core::codec::guid_from_be(&bytes[40..56]),
            parent_timestamp: be_u32(&bytes[56..60]),
            parent_unicode_name,
            parent_locators,
        })
    }

    /// Serialize the header, recomputing the checksum field
    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(Self::COOKIE);
        bytes[8..16].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.header_version.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[40..56].copy_from_slice(self.parent_uuid.as_bytes());
        bytes[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        for (i, ch) in self.parent_unicode_name.iter().enumerate() {
            let offset = 64 + i * 2;
            bytes[offset..offset + 2].copy_from_slice(&ch.to_be_bytes());
        }
        for (i, entry) in self.parent_locators.iter().enumerate() {
            let offset = 576 + i * ParentLocator::SIZE;
            bytes[offset..offset + ParentLocator::SIZE].copy_from_slice(&entry.serialize());
        }

        let checksum = ones_complement_checksum(&bytes, Self::CHECKSUM_FIELD);
        bytes[36..40].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }

    /// Parent image name decoded from the UTF-16BE field, if any
    pub fn parent_name(&self) -> Option<String> {
        let end = self
            .parent_unicode_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.parent_unicode_name.len());
        if end == 0 {
            return None;
        }
        String::from_utf16(&self.parent_unicode_name[..end]).ok()
    }

    /// Store the parent image name into the UTF-16BE field
    pub fn set_parent_name(&mut self, name: &str) -> Result<()> {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() > 256 {
            return Err(Error::format("parent name longer than 256 UTF-16 units"));
        }
        self.parent_unicode_name = [0u16; 256];
        self.parent_unicode_name[..units.len()].copy_from_slice(&units);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_header(max_table_entries: u32, block_size: u32) -> DynamicHeader {
        DynamicHeader {
            data_offset: u64::MAX,
            table_offset: 1536,
            header_version: DynamicHeader::VERSION,
            max_table_entries,
            block_size,
            checksum: 0,
            parent_uuid: Uuid::nil(),
            parent_timestamp: 0,
            parent_unicode_name: [0u16; 256],
            parent_locators: [ParentLocator::default(); 8],
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = test_header(32, 2 * 1024 * 1024);
        let bytes = header.serialize();
        let parsed = DynamicHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.max_table_entries, 32);
        assert_eq!(parsed.block_size, 2 * 1024 * 1024);
        assert_eq!(parsed.table_offset, 1536);
    }

    #[test]
    fn test_header_parent_name_roundtrip() {
        let mut header = test_header(4, 2 * 1024 * 1024);
        header.set_parent_name("base.vhd").unwrap();
        let parsed = DynamicHeader::parse(&header.serialize()).unwrap();
        assert_eq!(parsed.parent_name().as_deref(), Some("base.vhd"));
    }

    #[test]
    fn test_header_rejects_odd_block_size() {
        let mut header = test_header(4, 2 * 1024 * 1024);
        header.block_size = 3 * 1024 * 1024;
        assert!(DynamicHeader::parse(&header.serialize()).is_err());
    }

    #[test]
    fn test_header_bad_checksum() {
        let mut bytes = test_header(4, 2 * 1024 * 1024).serialize();
        bytes[37] ^= 0x01;
        assert!(DynamicHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_parent_locator_roundtrip() {
        let locator = ParentLocator {
            platform_code: *ParentLocator::PLATFORM_W2KU,
            data_space: 1,
            data_length: 100,
            data_offset: 0x2000,
        };
        let parsed = ParentLocator::parse(&locator.serialize());
        assert!(parsed.is_set());
        assert_eq!(parsed.platform_code, *ParentLocator::PLATFORM_W2KU);
        assert_eq!(parsed.data_length, 100);
        assert_eq!(parsed.data_offset, 0x2000);
    }
}
