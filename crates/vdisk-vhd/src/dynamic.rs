//! Dynamic and differencing VHD engine
//!
//! Layers the sparse block device contract over a host byte store and, for
//! differencing images, a read-only parent device. Non-differencing dynamic
//! disks behave as differencing over an implicit all-zero parent.
//!
//! Instances are single-owner; the caller provides external exclusion when
//! sharing one across tasks.

use std::collections::HashMap;
use std::ops::Range;

use vdisk_core::store::write_zeroes;
use vdisk_core::{
    check_read, check_write, merge_extents, BlockDevice, BytePool, ByteStore, Error, Extent,
    Result,
};

use crate::bat::{bat_entry_offset, BlockAllocationTable, BlockLayout, SectorBitmap};
use crate::footer::{DiskType, VhdFooter};
use crate::header::DynamicHeader;
use crate::VhdOptions;

const SECTOR: u64 = 512;

/// A writable dynamic or differencing VHD over a host byte store
pub struct DynamicVhd<S> {
    store: S,
    footer: VhdFooter,
    header: DynamicHeader,
    bat: BlockAllocationTable,
    layout: BlockLayout,
    parent: Option<Box<dyn BlockDevice>>,
    bitmap_cache: HashMap<usize, SectorBitmap>,
    leading_footer: Option<[u8; VhdFooter::SIZE]>,
    next_block_start: u64,
    auto_commit_footer: bool,
    new_blocks_allocated: bool,
    pool: BytePool,
}

impl<S: ByteStore> DynamicVhd<S> {
    /// Open a dynamic or differencing image.
    ///
    /// `parent` is mandatory for differencing images and rejected otherwise.
    /// The trailing footer is authoritative; a corrupt one falls back to the
    /// leading copy.
    pub fn open(
        mut store: S,
        parent: Option<Box<dyn BlockDevice>>,
        options: &VhdOptions,
    ) -> Result<Self> {
        let file_len = store.len()?;
        if file_len < SECTOR {
            return Err(Error::truncated("file too small to be a VHD"));
        }

        let footer = read_footer(&mut store, file_len)?;
        if !footer.disk_type.is_sparse() {
            return Err(Error::format(format!(
                "expected a dynamic or differencing VHD, found {:?}",
                footer.disk_type
            )));
        }

        match (footer.disk_type, &parent) {
            (DiskType::Differencing, None) => {
                return Err(Error::format(
                    "differencing VHD requires its parent device",
                ));
            }
            (DiskType::Dynamic, Some(_)) => {
                return Err(Error::format(
                    "parent device supplied for a non-differencing VHD",
                ));
            }
            _ => {}
        }
        if let Some(parent) = &parent {
            if parent.length() != footer.current_size {
                return Err(Error::format(format!(
                    "parent length {} does not match child virtual size {}",
                    parent.length(),
                    footer.current_size
                )));
            }
        }

        let header_end = footer
            .data_offset
            .checked_add(DynamicHeader::SIZE as u64)
            .filter(|&end| end <= file_len);
        if header_end.is_none() {
            return Err(Error::truncated("VHD dynamic header out of bounds"));
        }
        let mut header_bytes = [0u8; DynamicHeader::SIZE];
        store.read_at(footer.data_offset, &mut header_bytes)?;
        let header = DynamicHeader::parse(&header_bytes)?;

        let layout = BlockLayout::new(header.block_size);
        let required_blocks = footer.current_size.div_ceil(layout.block_size);
        if (header.max_table_entries as u64) < required_blocks {
            return Err(Error::format(format!(
                "BAT with {} entries cannot map {} blocks",
                header.max_table_entries, required_blocks
            )));
        }

        let bat_bytes = header.max_table_entries as u64 * 4;
        let bat_end = header
            .table_offset
            .checked_add(bat_bytes.div_ceil(SECTOR) * SECTOR)
            .filter(|&end| end <= file_len)
            .ok_or_else(|| Error::truncated("BAT extends past end of file"))?;
        let mut bat_buf = vec![0u8; bat_bytes as usize];
        store.read_at(header.table_offset, &mut bat_buf)?;
        let bat = BlockAllocationTable::parse(&bat_buf);

        // New blocks are appended after everything already allocated.
        let mut next_block_start = bat_end;
        for block in 0..bat.len() {
            if let Some(start) = bat.block_start(block) {
                next_block_start = next_block_start.max(start + layout.allocated_size());
            }
        }

        Ok(Self {
            store,
            footer,
            header,
            bat,
            layout,
            parent,
            bitmap_cache: HashMap::new(),
            leading_footer: None,
            next_block_start,
            auto_commit_footer: options.auto_commit_footer,
            new_blocks_allocated: false,
            pool: BytePool::new(),
        })
    }

    pub fn footer(&self) -> &VhdFooter {
        &self.footer
    }

    pub fn header(&self) -> &DynamicHeader {
        &self.header
    }

    pub fn block_size(&self) -> u64 {
        self.layout.block_size
    }

    /// Whether this engine has appended blocks since open
    pub fn new_blocks_allocated(&self) -> bool {
        self.new_blocks_allocated
    }

    /// Give back the host store; callers should `flush` first
    pub fn into_store(self) -> S {
        self.store
    }

    fn bitmap(&mut self, block: usize, block_start: u64) -> Result<&SectorBitmap> {
        self.ensure_bitmap(block, block_start)?;
        Ok(&self.bitmap_cache[&block])
    }

    fn ensure_bitmap(&mut self, block: usize, block_start: u64) -> Result<()> {
        if !self.bitmap_cache.contains_key(&block) {
            let mut bytes = vec![0u8; self.layout.bitmap_size as usize];
            self.store.read_at(block_start, &mut bytes)?;
            self.bitmap_cache
                .insert(block, SectorBitmap::new(bytes, self.layout.sectors_per_block));
        }
        Ok(())
    }

    fn read_parent(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        match &mut self.parent {
            Some(parent) => {
                let n = parent.read_at(pos, buf)?;
                if n != buf.len() {
                    return Err(Error::truncated(format!(
                        "parent returned {} of {} bytes at {}",
                        n,
                        buf.len(),
                        pos
                    )));
                }
                Ok(())
            }
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    /// Append a fresh bitmap+data region for `block` and point its BAT entry
    /// at it. With `auto_commit_footer` the trailing footer is rewritten from
    /// the cached leading copy right away; otherwise `flush` does it.
    fn allocate_block(&mut self, block: usize) -> Result<u64> {
        debug_assert!(self.bat.block_start(block).is_none());

        let start = self.next_block_start;
        let sector = start / SECTOR;
        if sector > u32::MAX as u64 - 1 {
            return Err(Error::out_of_range("VHD file exceeds BAT addressing"));
        }

        let new_len = start + self.layout.allocated_size() + SECTOR;
        self.store.set_len(new_len)?;
        write_zeroes(&mut self.store, start, self.layout.bitmap_size)?;

        self.bat.set_entry(block, sector as u32);
        self.store.write_at(
            bat_entry_offset(self.header.table_offset, block),
            &(sector as u32).to_be_bytes(),
        )?;

        self.next_block_start = start + self.layout.allocated_size();
        self.new_blocks_allocated = true;
        self.bitmap_cache.insert(
            block,
            SectorBitmap::zeroed(self.layout.sectors_per_block, self.layout.bitmap_size as usize),
        );

        if self.auto_commit_footer {
            self.update_footer()?;
        }

        tracing::debug!(block, offset = start, "allocated VHD block");
        Ok(start)
    }

    /// Rewrite the trailing footer from the cached leading-footer sector
    pub fn update_footer(&mut self) -> Result<()> {
        let raw = self.leading_footer()?;
        let file_len = self.store.len()?;
        self.store.write_at(file_len - SECTOR, &raw)?;
        Ok(())
    }

    fn leading_footer(&mut self) -> Result<[u8; VhdFooter::SIZE]> {
        if let Some(raw) = self.leading_footer {
            return Ok(raw);
        }
        let mut raw = [0u8; VhdFooter::SIZE];
        self.store.read_at(0, &mut raw)?;
        if VhdFooter::parse(&raw).is_err() {
            // Leading copy unusable; regenerate from the parsed footer.
            tracing::warn!("leading VHD footer invalid, regenerating from parsed footer");
            raw = self.footer.serialize();
        }
        self.leading_footer = Some(raw);
        Ok(raw)
    }

    /// Read a whole sector, honoring the presence bitmap
    fn read_sector(
        &mut self,
        block: usize,
        block_start: u64,
        sector_in_block: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let present = self.bitmap(block, block_start)?.get(sector_in_block);
        if present {
            let offset = block_start + self.layout.bitmap_size + sector_in_block * SECTOR;
            self.store.read_at(offset, buf)
        } else {
            let abs = block as u64 * self.layout.block_size + sector_in_block * SECTOR;
            self.read_parent(abs, buf)
        }
    }

    /// Read-modify-write a partially overwritten sector
    fn write_partial_sector(
        &mut self,
        block: usize,
        block_start: u64,
        sector_in_block: u64,
        within_sector: usize,
        data: &[u8],
    ) -> Result<()> {
        let mut sector = self.pool.acquire(SECTOR as usize);
        self.read_sector(block, block_start, sector_in_block, &mut sector)?;
        sector[within_sector..within_sector + data.len()].copy_from_slice(data);
        let offset = block_start + self.layout.bitmap_size + sector_in_block * SECTOR;
        self.store.write_at(offset, &sector)
    }

    fn write_block_span(&mut self, block: usize, within_block: u64, data: &[u8]) -> Result<()> {
        let block_start = match self.bat.block_start(block) {
            Some(start) => start,
            None => self.allocate_block(block)?,
        };
        self.ensure_bitmap(block, block_start)?;

        let data_base = block_start + self.layout.bitmap_size;
        let first_sector = within_block / SECTOR;
        let last_sector = (within_block + data.len() as u64 - 1) / SECTOR;

        let mut consumed = 0usize;

        // Leading partial sector
        let head_offset = (within_block % SECTOR) as usize;
        if head_offset != 0 || data.len() < SECTOR as usize {
            let n = (SECTOR as usize - head_offset).min(data.len());
            self.write_partial_sector(block, block_start, first_sector, head_offset, &data[..n])?;
            consumed = n;
        }

        // Whole sectors in one write
        let whole_start = if consumed > 0 { first_sector + 1 } else { first_sector };
        let remaining = data.len() - consumed;
        let whole_sectors = remaining as u64 / SECTOR;
        if whole_sectors > 0 {
            let n = (whole_sectors * SECTOR) as usize;
            self.store
                .write_at(data_base + whole_start * SECTOR, &data[consumed..consumed + n])?;
            consumed += n;
        }

        // Trailing partial sector
        if consumed < data.len() {
            let tail_sector = whole_start + whole_sectors;
            self.write_partial_sector(block, block_start, tail_sector, 0, &data[consumed..])?;
        }

        // Mark all touched sectors present, then persist the bitmap if it
        // changed.
        let mut changed = false;
        {
            let bitmap = self
                .bitmap_cache
                .get_mut(&block)
                .expect("bitmap cached above");
            for sector in first_sector..=last_sector {
                changed |= bitmap.set(sector);
            }
        }
        if changed {
            let bytes = self.bitmap_cache[&block].as_bytes().to_vec();
            self.store.write_at(block_start, &bytes)?;
        }

        Ok(())
    }

    fn block_extents(
        &mut self,
        block: usize,
        block_start: u64,
        span: Range<u64>,
        out: &mut Vec<Extent>,
    ) -> Result<()> {
        let block_base = block as u64 * self.layout.block_size;
        let mut sector = (span.start - block_base) / SECTOR;
        let end_sector = (span.end - block_base).div_ceil(SECTOR);

        while sector < end_sector {
            let present = self.bitmap(block, block_start)?.get(sector);
            let run = self
                .bitmap(block, block_start)?
                .run_len(sector, end_sector - sector);
            let run_start = (block_base + sector * SECTOR).max(span.start);
            let run_end = (block_base + (sector + run) * SECTOR).min(span.end);

            if present {
                out.push(Extent::new(run_start, run_end - run_start));
            } else if self.parent.is_some() {
                let parent = self.parent.as_mut().expect("checked above");
                out.extend(parent.extents(run_start..run_end)?);
            }
            sector += run;
        }
        Ok(())
    }
}

impl<S: ByteStore> BlockDevice for DynamicVhd<S> {
    fn length(&self) -> u64 {
        self.footer.current_size
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = check_read(pos, buf.len(), self.length())?;
        if n == 0 {
            return Ok(0);
        }

        let mut done = 0usize;
        while done < n {
            let abs = pos + done as u64;
            let block = (abs / self.layout.block_size) as usize;
            let within = abs % self.layout.block_size;
            let chunk = ((self.layout.block_size - within) as usize).min(n - done);

            match self.bat.block_start(block) {
                None => {
                    // Whole span comes from the parent (or zeros).
                    let dst = &mut buf[done..done + chunk];
                    self.read_parent(abs, dst)?;
                    done += chunk;
                }
                Some(block_start) => {
                    let data_base = block_start + self.layout.bitmap_size;
                    let mut within = within;
                    let mut remaining = chunk;
                    while remaining > 0 {
                        let sector = within / SECTOR;
                        let limit = (within + remaining as u64).div_ceil(SECTOR) - sector;
                        let (present, run) = {
                            let bitmap = self.bitmap(block, block_start)?;
                            (bitmap.get(sector), bitmap.run_len(sector, limit))
                        };
                        let run_end = ((sector + run) * SECTOR).min(within + remaining as u64);
                        let len = (run_end - within) as usize;
                        let dst = &mut buf[done..done + len];
                        if present {
                            self.store.read_at(data_base + within, dst)?;
                        } else {
                            let abs_run = block as u64 * self.layout.block_size + within;
                            self.read_parent(abs_run, dst)?;
                        }
                        within += len as u64;
                        done += len;
                        remaining -= len;
                    }
                }
            }
        }
        Ok(n)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        check_write(pos, buf.len(), self.length())?;

        let mut done = 0usize;
        while done < buf.len() {
            let abs = pos + done as u64;
            let block = (abs / self.layout.block_size) as usize;
            let within = abs % self.layout.block_size;
            let chunk = ((self.layout.block_size - within) as usize).min(buf.len() - done);
            self.write_block_span(block, within, &buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    fn extents(&mut self, range: Range<u64>) -> Result<Vec<Extent>> {
        let end = range.end.min(self.length());
        let mut out = Vec::new();
        let mut pos = range.start.min(end);

        while pos < end {
            let block = (pos / self.layout.block_size) as usize;
            let block_end = ((block as u64 + 1) * self.layout.block_size).min(end);
            match self.bat.block_start(block) {
                None => {
                    if let Some(parent) = self.parent.as_mut() {
                        out.extend(parent.extents(pos..block_end)?);
                    }
                }
                Some(block_start) => {
                    self.block_extents(block, block_start, pos..block_end, &mut out)?;
                }
            }
            pos = block_end;
        }
        Ok(merge_extents(out))
    }

    fn flush(&mut self) -> Result<()> {
        if self.new_blocks_allocated && !self.auto_commit_footer {
            self.update_footer()?;
        }
        self.store.flush()
    }
}

fn read_footer<S: ByteStore>(store: &mut S, file_len: u64) -> Result<VhdFooter> {
    let mut trailing = [0u8; VhdFooter::SIZE];
    store.read_at(file_len - SECTOR, &mut trailing)?;
    match VhdFooter::parse(&trailing) {
        Ok(footer) => Ok(footer),
        Err(trailing_err) => {
            tracing::warn!(error = %trailing_err, "trailing VHD footer invalid, trying leading copy");
            let mut leading = [0u8; VhdFooter::SIZE];
            store.read_at(0, &mut leading)?;
            VhdFooter::parse(&leading)
                .map_err(|_| Error::format("both VHD footer copies are invalid"))
        }
    }
}

/// Shared open-time footer recovery for the fixed engine too
pub(crate) fn read_footer_with_fallback<S: ByteStore>(store: &mut S) -> Result<VhdFooter> {
    let file_len = store.len()?;
    if file_len < SECTOR {
        return Err(Error::truncated("file too small to be a VHD"));
    }
    read_footer(store, file_len)
}
