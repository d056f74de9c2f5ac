//! SCSI CDB builders and response decoding
//!
//! Thin builders for the handful of block commands the initiator needs;
//! everything runs through [`crate::connection::Connection::execute`].

use vdisk_core::codec::{be_u32, be_u64};
use vdisk_core::{Error, Result};

/// REPORT LUNS (0xA0)
pub fn report_luns(allocation_length: u32) -> [u8; 12] {
    let mut cdb = [0u8; 12];
    cdb[0] = 0xA0;
    cdb[6..10].copy_from_slice(&allocation_length.to_be_bytes());
    cdb
}

/// Decode a REPORT LUNS payload into LUN values
pub fn parse_report_luns(data: &[u8]) -> Result<Vec<u64>> {
    if data.len() < 8 {
        return Err(Error::protocol("REPORT LUNS payload shorter than header"));
    }
    let list_length = be_u32(&data[0..4]) as usize;
    let end = 8usize
        .checked_add(list_length)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Error::protocol("REPORT LUNS list exceeds payload"))?;
    Ok(data[8..end].chunks_exact(8).map(be_u64).collect())
}

/// READ CAPACITY (10) (0x25)
pub fn read_capacity10() -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x25;
    cdb
}

/// Decode a READ CAPACITY (10) payload into (total blocks, block size).
///
/// The wire carries the last LBA, so the count is one higher.
pub fn parse_read_capacity10(data: &[u8]) -> Result<(u64, u32)> {
    if data.len() < 8 {
        return Err(Error::protocol("READ CAPACITY payload shorter than 8 bytes"));
    }
    let last_lba = be_u32(&data[0..4]);
    let block_size = be_u32(&data[4..8]);
    if block_size == 0 {
        return Err(Error::protocol("READ CAPACITY reports zero block size"));
    }
    Ok((last_lba as u64 + 1, block_size))
}

/// READ (6) (0x08); LBA limited to 21 bits, count to 256 (0 means 256)
pub fn read6(lba: u32, blocks: u16) -> Result<[u8; 6]> {
    if lba >= 1 << 21 {
        return Err(Error::out_of_range(format!("READ(6) LBA {} needs 22 bits", lba)));
    }
    if blocks == 0 || blocks > 256 {
        return Err(Error::out_of_range(format!(
            "READ(6) transfer of {} blocks outside 1..=256",
            blocks
        )));
    }
    let mut cdb = [0u8; 6];
    cdb[0] = 0x08;
    cdb[1] = ((lba >> 16) & 0x1F) as u8;
    cdb[2] = (lba >> 8) as u8;
    cdb[3] = lba as u8;
    cdb[4] = if blocks == 256 { 0 } else { blocks as u8 };
    Ok(cdb)
}

/// READ (10) (0x28)
pub fn read10(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x28;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

/// WRITE (10) (0x2A)
pub fn write10(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x2A;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read6_encoding() {
        let cdb = read6(0x123456, 8).unwrap();
        assert_eq!(cdb, [0x08, 0x12, 0x34, 0x56, 8, 0]);

        let full = read6(0, 256).unwrap();
        assert_eq!(full[4], 0);

        assert!(read6(1 << 21, 1).is_err());
        assert!(read6(0, 0).is_err());
        assert!(read6(0, 257).is_err());
    }

    #[test]
    fn test_read10_write10_encoding() {
        let cdb = read10(0x01020304, 0x0506);
        assert_eq!(cdb, [0x28, 0, 0x01, 0x02, 0x03, 0x04, 0, 0x05, 0x06, 0]);
        let cdb = write10(0x0A0B0C0D, 2);
        assert_eq!(cdb, [0x2A, 0, 0x0A, 0x0B, 0x0C, 0x0D, 0, 0, 2, 0]);
    }

    #[test]
    fn test_report_luns_roundtrip() {
        let cdb = report_luns(1024);
        assert_eq!(cdb[0], 0xA0);
        assert_eq!(&cdb[6..10], &1024u32.to_be_bytes());

        let mut payload = vec![0u8; 8 + 16];
        payload[0..4].copy_from_slice(&16u32.to_be_bytes());
        payload[8..16].copy_from_slice(&0u64.to_be_bytes());
        payload[16..24].copy_from_slice(&(1u64 << 48).to_be_bytes());
        let luns = parse_report_luns(&payload).unwrap();
        assert_eq!(luns, vec![0, 1 << 48]);
    }

    #[test]
    fn test_read_capacity_decoding() {
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&0x0000_1FFFu32.to_be_bytes());
        payload[4..8].copy_from_slice(&512u32.to_be_bytes());
        let (blocks, block_size) = parse_read_capacity10(&payload).unwrap();
        assert_eq!(blocks, 0x2000);
        assert_eq!(block_size, 512);

        payload[4..8].copy_from_slice(&0u32.to_be_bytes());
        assert!(parse_read_capacity10(&payload).is_err());
    }
}
