//! Byte codec utilities shared by the on-disk and wire formats
//!
//! VHD is big-endian throughout; VHDX is little-endian with CRC-32C
//! checksums; iSCSI is big-endian with optional CRC-32C digests.

use crc::{Crc, CRC_32_ISCSI};
use uuid::Uuid;

/// Castagnoli CRC-32 (CRC-32C), as used by VHDX checksums and iSCSI digests
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Compute the CRC-32C of `data`
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

pub fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

pub fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

pub fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

pub fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// One's-complement additive checksum over `bytes` with the field at
/// `checksum_field` treated as zero (the VHD footer/header algorithm)
pub fn ones_complement_checksum(bytes: &[u8], checksum_field: std::ops::Range<usize>) -> u32 {
    let mut sum: u32 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if checksum_field.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(byte as u32);
    }
    !sum
}

/// Unpack a GUID stored in Microsoft mixed-endian form (first three fields
/// little-endian), as VHDX and the region/metadata tables store them
pub fn guid_from_le(bytes: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[..16]);
    Uuid::from_bytes_le(raw)
}

/// Pack a GUID into Microsoft mixed-endian form
pub fn guid_to_le(guid: &Uuid) -> [u8; 16] {
    guid.to_bytes_le()
}

/// Unpack a GUID stored as straight big-endian bytes (VHD footer/header)
pub fn guid_from_be(bytes: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[..16]);
    Uuid::from_bytes(raw)
}
