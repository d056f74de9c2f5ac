//! Sector-aligning adapter
//!
//! The VHDX content engine only accepts I/O aligned to the logical sector
//! size. This adapter wraps such a device and offers arbitrary byte-range
//! access by reading whole sectors and performing read-modify-write for
//! partial overlaps.

use std::ops::Range;
use vdisk_core::{check_read, check_write, BlockDevice, Extent, Result};

/// Byte-granular view over a device that requires sector-aligned I/O
pub struct SectorAligned<D> {
    inner: D,
    sector_size: u64,
}

impl<D: BlockDevice> SectorAligned<D> {
    pub fn new(inner: D, sector_size: u32) -> Self {
        Self {
            inner,
            sector_size: sector_size as u64,
        }
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }
}

impl<D: BlockDevice> BlockDevice for SectorAligned<D> {
    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = check_read(pos, buf.len(), self.length())?;
        if n == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..n];

        let aligned_start = pos - pos % self.sector_size;
        let end = pos + n as u64;
        let aligned_end = end.div_ceil(self.sector_size) * self.sector_size;

        if aligned_start == pos && aligned_end == end {
            self.inner.read_at(pos, buf)?;
            return Ok(n);
        }

        let mut scratch = vec![0u8; (aligned_end - aligned_start) as usize];
        self.inner.read_at(aligned_start, &mut scratch)?;
        let skip = (pos - aligned_start) as usize;
        buf.copy_from_slice(&scratch[skip..skip + n]);
        Ok(n)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        check_write(pos, buf.len(), self.length())?;
        if buf.is_empty() {
            return Ok(());
        }

        let aligned_start = pos - pos % self.sector_size;
        let end = pos + buf.len() as u64;
        let aligned_end = end.div_ceil(self.sector_size) * self.sector_size;

        if aligned_start == pos && aligned_end == end {
            return self.inner.write_at(pos, buf);
        }

        // Read the covering sector span, overlay the payload, write it back.
        let mut scratch = vec![0u8; (aligned_end - aligned_start) as usize];
        self.inner.read_at(aligned_start, &mut scratch)?;
        let skip = (pos - aligned_start) as usize;
        scratch[skip..skip + buf.len()].copy_from_slice(buf);
        self.inner.write_at(aligned_start, &scratch)
    }

    fn extents(&mut self, range: Range<u64>) -> Result<Vec<Extent>> {
        self.inner.extents(range)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
