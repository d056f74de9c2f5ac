//! VHDX block allocation table entries and chunk addressing
//!
//! The BAT interleaves `chunk_ratio` payload-block entries with one
//! sector-bitmap entry per chunk. Each 64-bit entry keeps a 3-bit state and
//! a 44-bit file offset in MiB units (bits 20-63).

use vdisk_core::{Error, Result};

/// Payload block state stored in BAT bits 0-2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadBlockStatus {
    NotPresent = 0,
    Undefined = 1,
    Zero = 2,
    Unmapped = 3,
    FullyPresent = 6,
    PartiallyPresent = 7,
}

impl PayloadBlockStatus {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(Self::NotPresent),
            1 => Ok(Self::Undefined),
            2 => Ok(Self::Zero),
            3 => Ok(Self::Unmapped),
            6 => Ok(Self::FullyPresent),
            7 => Ok(Self::PartiallyPresent),
            other => Err(Error::format(format!(
                "invalid payload block state {}",
                other
            ))),
        }
    }
}

/// Sector-bitmap block state stored in BAT bits 0-2
pub const SB_BLOCK_NOT_PRESENT: u8 = 0;
pub const SB_BLOCK_PRESENT: u8 = 6;

/// A decoded 64-bit BAT entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatEntry {
    pub state: u8,
    /// File offset in MiB units (bits 20-63)
    pub file_offset_mb: u64,
}

impl BatEntry {
    pub const SIZE: usize = 8;

    pub fn from_u64(raw: u64) -> Self {
        Self {
            state: (raw & 0x7) as u8,
            file_offset_mb: raw >> 20,
        }
    }

    pub fn to_u64(self) -> u64 {
        (self.state as u64 & 0x7) | (self.file_offset_mb << 20)
    }

    pub fn zeroed() -> Self {
        Self {
            state: 0,
            file_offset_mb: 0,
        }
    }

    pub fn new(state: u8, file_offset: u64) -> Self {
        debug_assert_eq!(file_offset % (1024 * 1024), 0);
        Self {
            state,
            file_offset_mb: file_offset >> 20,
        }
    }

    pub fn payload_status(&self) -> Result<PayloadBlockStatus> {
        PayloadBlockStatus::from_bits(self.state)
    }

    /// Absolute file offset in bytes
    pub fn file_offset(&self) -> u64 {
        self.file_offset_mb << 20
    }
}

/// Chunk/block/sector addressing for a given metadata record
#[derive(Debug, Clone, Copy)]
pub struct ChunkLayout {
    pub block_size: u64,
    pub logical_sector_size: u64,
    pub chunk_size: u64,
    pub chunk_ratio: u64,
}

impl ChunkLayout {
    pub fn new(block_size: u32, logical_sector_size: u32) -> Self {
        let chunk_size = (1u64 << 23) * logical_sector_size as u64;
        Self {
            block_size: block_size as u64,
            logical_sector_size: logical_sector_size as u64,
            chunk_size,
            chunk_ratio: chunk_size / block_size as u64,
        }
    }

    pub fn block_of(&self, pos: u64) -> u64 {
        pos / self.block_size
    }

    pub fn chunk_of_block(&self, block: u64) -> u64 {
        block / self.chunk_ratio
    }

    /// BAT byte offset of the payload entry for `block`
    pub fn payload_entry_offset(&self, block: u64) -> u64 {
        let chunk = block / self.chunk_ratio;
        let within = block % self.chunk_ratio;
        (chunk * (self.chunk_ratio + 1) + within) * BatEntry::SIZE as u64
    }

    /// BAT byte offset of the sector-bitmap entry for `chunk`
    pub fn bitmap_entry_offset(&self, chunk: u64) -> u64 {
        (chunk * (self.chunk_ratio + 1) + self.chunk_ratio) * BatEntry::SIZE as u64
    }

    /// Total BAT bytes needed to map `virtual_size` bytes
    pub fn bat_length(&self, virtual_size: u64) -> u64 {
        let blocks = virtual_size.div_ceil(self.block_size);
        let chunks = blocks.div_ceil(self.chunk_ratio);
        chunks * (self.chunk_ratio + 1) * BatEntry::SIZE as u64
    }

    /// Index of `pos`'s sector within its chunk's bitmap
    pub fn sector_in_chunk(&self, pos: u64) -> u64 {
        (pos % self.chunk_size) / self.logical_sector_size
    }
}
