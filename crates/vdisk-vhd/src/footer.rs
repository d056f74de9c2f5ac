//! VHD footer (512 bytes)
//!
//! The footer appears at the end of every VHD file. Dynamic and differencing
//! images carry a second, identical copy at offset 0 so a crash between a
//! block allocation and the trailing-footer rewrite stays recoverable.

use uuid::Uuid;
use vdisk_core::codec::{be_u32, be_u64, ones_complement_checksum};
use vdisk_core::{Error, Result};

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 UTC)
pub const VHD_EPOCH_OFFSET: u64 = 946_684_800;

/// VHD disk type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiskType {
    None = 0,
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl DiskType {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(DiskType::None),
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            _ => Err(Error::format(format!("invalid VHD disk type: {}", value))),
        }
    }

    /// Whether images of this type carry a dynamic header and BAT
    pub fn is_sparse(&self) -> bool {
        matches!(self, DiskType::Dynamic | DiskType::Differencing)
    }
}

/// Disk geometry (CHS addressing)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl DiskGeometry {
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            cylinders: u16::from_be_bytes([bytes[0], bytes[1]]),
            heads: bytes[2],
            sectors: bytes[3],
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let cyl = self.cylinders.to_be_bytes();
        [cyl[0], cyl[1], self.heads, self.sectors]
    }

    /// Compute CHS geometry for a disk of `size` bytes (the VHD algorithm)
    pub fn for_size(size: u64) -> Self {
        let mut total_sectors = size / 512;
        if total_sectors > 65535 * 16 * 255 {
            total_sectors = 65535 * 16 * 255;
        }

        let (cylinder_times_heads, heads, sectors_per_track) =
            if total_sectors >= 65535 * 16 * 63 {
                (total_sectors / 255, 16u64, 255u64)
            } else {
                let mut sectors_per_track = 17u64;
                let mut cylinder_times_heads = total_sectors / sectors_per_track;
                let mut heads = (cylinder_times_heads + 1023) / 1024;
                if heads < 4 {
                    heads = 4;
                }
                if cylinder_times_heads >= heads * 1024 || heads > 16 {
                    sectors_per_track = 31;
                    heads = 16;
                    cylinder_times_heads = total_sectors / sectors_per_track;
                }
                if cylinder_times_heads >= heads * 1024 {
                    sectors_per_track = 63;
                    heads = 16;
                    cylinder_times_heads = total_sectors / sectors_per_track;
                }
                (cylinder_times_heads, heads, sectors_per_track)
            };

        Self {
            cylinders: (cylinder_times_heads / heads) as u16,
            heads: heads as u8,
            sectors: sectors_per_track as u8,
        }
    }
}

/// VHD footer structure (512 bytes, big-endian)
#[derive(Debug, Clone)]
pub struct VhdFooter {
    pub features: u32,
    pub version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub uuid: Uuid,
    pub saved_state: u8,
}

impl VhdFooter {
    /// VHD footer cookie value
    pub const COOKIE: &'static [u8; 8] = b"conectix";

    /// Size of the VHD footer in bytes
    pub const SIZE: usize = 512;

    /// Format version this implementation understands
    pub const VERSION: u32 = 0x0001_0000;

    const CHECKSUM_FIELD: std::ops::Range<usize> = 64..68;

    /// Parse a footer from a 512-byte sector.
    ///
    /// Validation requires the cookie, the checksum and the format version
    /// to all match.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::truncated("VHD footer sector too small"));
        }

        if &bytes[0..8] != Self::COOKIE {
            return Err(Error::format(format!(
                "invalid VHD footer cookie: '{}'",
                String::from_utf8_lossy(&bytes[0..8])
            )));
        }

        let checksum = be_u32(&bytes[64..68]);
        let computed = ones_complement_checksum(&bytes[..Self::SIZE], Self::CHECKSUM_FIELD);
        if checksum != computed {
            return Err(Error::format(format!(
                "VHD footer checksum mismatch: stored {:#010x}, computed {:#010x}",
                checksum, computed
            )));
        }

        let version = be_u32(&bytes[12..16]);
        if version != Self::VERSION {
            return Err(Error::format(format!(
                "unsupported VHD format version {:#010x}",
                version
            )));
        }

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&bytes[28..32]);

        Ok(Self {
            features: be_u32(&bytes[8..12]),
            version,
            data_offset: be_u64(&bytes[16..24]),
            timestamp: be_u32(&bytes[24..28]),
            creator_app,
            creator_version: be_u32(&bytes[32..36]),
            creator_os: be_u32(&bytes[36..40]),
            original_size: be_u64(&bytes[40..48]),
            current_size: be_u64(&bytes[48..56]),
            geometry: DiskGeometry::parse(&bytes[56..60]),
            disk_type: DiskType::from_u32(be_u32(&bytes[60..64]))?,
            checksum,
            uuid: vdisk_core::codec::guid_from_be(&bytes[68..84]),
            saved_state: bytes[84],
        })
    }

    /// Serialize the footer, recomputing the checksum field
    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(Self::COOKIE);
        bytes[8..12].copy_from_slice(&self.features.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.version.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.creator_app);
        bytes[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.creator_os.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        bytes[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        bytes[56..60].copy_from_slice(&self.geometry.to_bytes());
        bytes[60..64].copy_from_slice(&(self.disk_type as u32).to_be_bytes());
        bytes[68..84].copy_from_slice(self.uuid.as_bytes());
        bytes[84] = self.saved_state;

        let checksum = ones_complement_checksum(&bytes, Self::CHECKSUM_FIELD);
        bytes[64..68].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }
}
