//! Fixed VHD engine
//!
//! Fixed images store the disk content contiguously from byte 0 with the
//! footer after it, so I/O maps straight through.

use std::ops::Range;

use vdisk_core::{check_read, check_write, BlockDevice, ByteStore, Error, Extent, Result};

use crate::dynamic::read_footer_with_fallback;
use crate::footer::{DiskType, VhdFooter};

/// A fixed-size VHD over a host byte store
pub struct FixedVhd<S> {
    store: S,
    footer: VhdFooter,
}

impl<S: ByteStore> FixedVhd<S> {
    pub fn open(mut store: S) -> Result<Self> {
        let footer = read_footer_with_fallback(&mut store)?;
        if footer.disk_type != DiskType::Fixed {
            return Err(Error::format(format!(
                "expected a fixed VHD, found {:?}",
                footer.disk_type
            )));
        }
        if store.len()? < footer.current_size + VhdFooter::SIZE as u64 {
            return Err(Error::truncated("fixed VHD shorter than its footer claims"));
        }
        Ok(Self { store, footer })
    }

    pub fn footer(&self) -> &VhdFooter {
        &self.footer
    }
}

impl<S: ByteStore> BlockDevice for FixedVhd<S> {
    fn length(&self) -> u64 {
        self.footer.current_size
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = check_read(pos, buf.len(), self.length())?;
        if n > 0 {
            self.store.read_at(pos, &mut buf[..n])?;
        }
        Ok(n)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        check_write(pos, buf.len(), self.length())?;
        self.store.write_at(pos, buf)
    }

    fn extents(&mut self, range: Range<u64>) -> Result<Vec<Extent>> {
        // A fixed disk is fully populated.
        let all = [Extent::new(0, self.length())];
        Ok(vdisk_core::device::clip_extents(&all, &range))
    }

    fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::VhdBuilder;
    use vdisk_pipeline::MemStore;

    fn fixed_image(size: u64) -> MemStore {
        let mut store = MemStore::new();
        VhdBuilder::new().create_fixed(&mut store, size).unwrap();
        store
    }

    #[test]
    fn test_fixed_open_and_length() {
        let disk = FixedVhd::open(fixed_image(1024 * 1024)).unwrap();
        assert_eq!(disk.length(), 1024 * 1024);
        assert_eq!(disk.footer().disk_type, DiskType::Fixed);
    }

    #[test]
    fn test_fixed_roundtrip() {
        let mut disk = FixedVhd::open(fixed_image(1024 * 1024)).unwrap();
        disk.write_at(100, b"fixed payload").unwrap();
        let mut buf = [0u8; 13];
        assert_eq!(disk.read_at(100, &mut buf).unwrap(), 13);
        assert_eq!(&buf, b"fixed payload");
    }

    #[test]
    fn test_fixed_single_extent() {
        let mut disk = FixedVhd::open(fixed_image(1024 * 1024)).unwrap();
        let extents = disk.extents(0..disk.length()).unwrap();
        assert_eq!(extents, vec![Extent::new(0, 1024 * 1024)]);
    }

    #[test]
    fn test_fixed_write_past_end() {
        let mut disk = FixedVhd::open(fixed_image(4096)).unwrap();
        assert!(disk.write_at(4090, &[0u8; 10]).is_err());
    }
}
