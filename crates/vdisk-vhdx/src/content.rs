//! VHDX content engine
//!
//! Translates sector-aligned byte I/O into payload-block reads and writes
//! through the BAT, with copy-on-write over a parent for differencing
//! images. Unaligned requests fail with `Unaligned`; callers wanting byte
//! granularity wrap the device in `vdisk_pipeline::SectorAligned`.

use std::collections::HashMap;
use std::ops::Range;

use vdisk_core::codec::le_u64;
use vdisk_core::store::write_zeroes;
use vdisk_core::{
    check_read, check_write, merge_extents, BlockDevice, ByteStore, Error, Extent, Result,
};

use crate::bat::{BatEntry, ChunkLayout, PayloadBlockStatus, SB_BLOCK_PRESENT};
use crate::freespace::FreeSpaceTable;
use crate::metadata::DiskMetadata;

const MB: u64 = 1024 * 1024;
/// Sector bitmap blocks are always 1 MiB
const BITMAP_BLOCK_SIZE: u64 = MB;

/// A chunk's sector bitmap, bit `i` of byte `b` covering sector `b*8 + i`
struct ChunkBitmap {
    file_offset: u64,
    bytes: Vec<u8>,
}

impl ChunkBitmap {
    fn get(&self, sector: u64) -> bool {
        self.bytes[(sector / 8) as usize] & (1 << (sector % 8)) != 0
    }

    fn set(&mut self, sector: u64) -> bool {
        let byte = (sector / 8) as usize;
        let mask = 1u8 << (sector % 8);
        let changed = self.bytes[byte] & mask == 0;
        self.bytes[byte] |= mask;
        changed
    }

    /// Sectors from `from` sharing its presence value, capped at `limit`
    fn run_len(&self, from: u64, limit: u64) -> u64 {
        let want = self.get(from);
        let mut sector = from + 1;
        let end = from + limit;
        while sector < end {
            let skip = if want { 0xFF } else { 0x00 };
            if sector % 8 == 0 && self.bytes[(sector / 8) as usize] == skip {
                sector += 8;
                continue;
            }
            if self.get(sector) != want {
                break;
            }
            sector += 1;
        }
        sector.min(end) - from
    }
}

/// The sparse content stream of an opened VHDX
pub struct VhdxContent<S> {
    store: S,
    meta: DiskMetadata,
    layout: ChunkLayout,
    bat_offset: u64,
    free: FreeSpaceTable,
    parent: Option<Box<dyn BlockDevice>>,
    bitmap_cache: HashMap<u64, ChunkBitmap>,
    read_only: bool,
}

impl<S: ByteStore> VhdxContent<S> {
    pub fn new(
        store: S,
        meta: DiskMetadata,
        bat_offset: u64,
        free: FreeSpaceTable,
        parent: Option<Box<dyn BlockDevice>>,
        read_only: bool,
    ) -> Self {
        let layout = ChunkLayout::new(meta.block_size, meta.logical_sector_size);
        Self {
            store,
            meta,
            layout,
            bat_offset,
            free,
            parent,
            bitmap_cache: HashMap::new(),
            read_only,
        }
    }

    pub fn metadata(&self) -> &DiskMetadata {
        &self.meta
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn check_aligned(&self, pos: u64, len: usize) -> Result<()> {
        let sector = self.layout.logical_sector_size;
        if pos % sector != 0 || len as u64 % sector != 0 {
            return Err(Error::unaligned(format!(
                "access of {} bytes at {} not aligned to {}-byte sectors",
                len, pos, sector
            )));
        }
        Ok(())
    }

    fn bat_entry_at(&mut self, entry_offset: u64) -> Result<BatEntry> {
        let mut raw = [0u8; BatEntry::SIZE];
        self.store.read_at(self.bat_offset + entry_offset, &mut raw)?;
        Ok(BatEntry::from_u64(le_u64(&raw)))
    }

    fn write_bat_entry(&mut self, entry_offset: u64, entry: BatEntry) -> Result<()> {
        self.store
            .write_at(self.bat_offset + entry_offset, &entry.to_u64().to_le_bytes())
    }

    fn payload_entry(&mut self, block: u64) -> Result<BatEntry> {
        let offset = self.layout.payload_entry_offset(block);
        self.bat_entry_at(offset)
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

    /// Load a chunk's sector bitmap if its BAT entry marks one present
    fn chunk_bitmap(&mut self, chunk: u64) -> Result<Option<&ChunkBitmap>> {
        if !self.bitmap_cache.contains_key(&chunk) {
            let entry = self.bat_entry_at(self.layout.bitmap_entry_offset(chunk))?;
            if entry.state != SB_BLOCK_PRESENT {
                return Ok(None);
            }
            let mut bytes = vec![0u8; BITMAP_BLOCK_SIZE as usize];
            self.store.read_at(entry.file_offset(), &mut bytes)?;
            self.bitmap_cache.insert(
                chunk,
                ChunkBitmap {
                    file_offset: entry.file_offset(),
                    bytes,
                },
            );
        }
        Ok(self.bitmap_cache.get(&chunk))
    }

    /// Allocate `len` bytes of 1-MiB-aligned file space, extending the file
    /// when the free list is exhausted
    fn allocate_region(&mut self, len: u64) -> Result<u64> {
        if let Some(offset) = self.free.allocate(len, MB) {
            return Ok(offset);
        }
        let new_end = self.free.file_end().next_multiple_of(MB) + len;
        self.store.set_len(new_end)?;
        self.free.extend_file(new_end);
        self.free
            .allocate(len, MB)
            .ok_or_else(|| Error::format("free-space table inconsistent after extend"))
    }

    /// Ensure the chunk has an on-disk sector bitmap block, allocating and
    /// zeroing one if needed
    fn ensure_chunk_bitmap(&mut self, chunk: u64) -> Result<()> {
        if self.chunk_bitmap(chunk)?.is_some() {
            return Ok(());
        }
        let offset = self.allocate_region(BITMAP_BLOCK_SIZE)?;
        write_zeroes(&mut self.store, offset, BITMAP_BLOCK_SIZE)?;
        self.write_bat_entry(
            self.layout.bitmap_entry_offset(chunk),
            BatEntry::new(SB_BLOCK_PRESENT, offset),
        )?;
        self.bitmap_cache.insert(
            chunk,
            ChunkBitmap {
                file_offset: offset,
                bytes: vec![0u8; BITMAP_BLOCK_SIZE as usize],
            },
        );
        tracing::debug!(chunk, offset, "allocated VHDX sector bitmap block");
        Ok(())
    }

    /// Allocate a payload block for `block` and record its BAT state
    fn allocate_block(&mut self, block: u64) -> Result<BatEntry> {
        let offset = self.allocate_region(self.layout.block_size)?;
        // First-fit may hand back reclaimed interior space; unwritten
        // sectors of a FullyPresent block must read as zeros.
        write_zeroes(&mut self.store, offset, self.layout.block_size)?;

        let status = if self.meta.has_parent {
            self.ensure_chunk_bitmap(self.layout.chunk_of_block(block))?;
            PayloadBlockStatus::PartiallyPresent
        } else {
            PayloadBlockStatus::FullyPresent
        };
        let entry = BatEntry::new(status as u8, offset);
        self.write_bat_entry(self.layout.payload_entry_offset(block), entry)?;
        tracing::debug!(block, offset, ?status, "allocated VHDX payload block");
        Ok(entry)
    }

    /// Mark sectors `[first, first+count)` of `chunk` present and persist
    /// the touched bitmap bytes
    fn mark_sectors_present(&mut self, chunk: u64, first: u64, count: u64) -> Result<()> {
        self.ensure_chunk_bitmap(chunk)?;
        let bitmap = self
            .bitmap_cache
            .get_mut(&chunk)
            .expect("bitmap ensured above");

        let mut changed = false;
        for sector in first..first + count {
            changed |= bitmap.set(sector);
        }
        if !changed {
            return Ok(());
        }

        let first_byte = first / 8;
        let last_byte = (first + count - 1) / 8;
        let offset = bitmap.file_offset + first_byte;
        let slice = bitmap.bytes[first_byte as usize..=last_byte as usize].to_vec();
        self.store.write_at(offset, &slice)
    }

    fn read_partial_block(
        &mut self,
        block: u64,
        entry: &BatEntry,
        within: u64,
        abs: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let chunk = self.layout.chunk_of_block(block);
        let sector_size = self.layout.logical_sector_size;
        let chunk_sector_base = self.layout.sector_in_chunk(abs - within);

        let mut done = 0usize;
        while done < buf.len() {
            let offset_in_block = within + done as u64;
            let sector = chunk_sector_base + offset_in_block / sector_size;
            let sectors_left = (buf.len() - done) as u64 / sector_size;

            let (present, run) = match self.chunk_bitmap(chunk)? {
                Some(bitmap) => (bitmap.get(sector), bitmap.run_len(sector, sectors_left)),
                None => (false, sectors_left),
            };
            let len = (run * sector_size) as usize;
            let dst = &mut buf[done..done + len];
            if present {
                self.store.read_at(entry.file_offset() + offset_in_block, dst)?;
            } else {
                self.read_parent(abs + done as u64, dst)?;
            }
            done += len;
        }
        Ok(())
    }

    fn block_extents(
        &mut self,
        block: u64,
        span: Range<u64>,
        out: &mut Vec<Extent>,
    ) -> Result<()> {
        let entry = self.payload_entry(block)?;
        match entry.payload_status()? {
            PayloadBlockStatus::FullyPresent => {
                out.push(Extent::new(span.start, span.end - span.start));
            }
            PayloadBlockStatus::PartiallyPresent => {
                let chunk = self.layout.chunk_of_block(block);
                let sector_size = self.layout.logical_sector_size;
                let mut pos = span.start;
                while pos < span.end {
                    let sector = self.layout.sector_in_chunk(pos);
                    let limit = (span.end - pos).div_ceil(sector_size);
                    let (present, run) = match self.chunk_bitmap(chunk)? {
                        Some(bitmap) => (bitmap.get(sector), bitmap.run_len(sector, limit)),
                        None => (false, limit),
                    };
                    let end = (pos + run * sector_size).min(span.end);
                    if present {
                        out.push(Extent::new(pos, end - pos));
                    } else if let Some(parent) = self.parent.as_mut() {
                        out.extend(parent.extents(pos..end)?);
                    }
                    pos = end;
                }
            }
            PayloadBlockStatus::NotPresent => {
                if let Some(parent) = self.parent.as_mut() {
                    out.extend(parent.extents(span)?);
                }
            }
            PayloadBlockStatus::Zero
            | PayloadBlockStatus::Unmapped
            | PayloadBlockStatus::Undefined => {}
        }
        Ok(())
    }
}

impl<S: ByteStore> BlockDevice for VhdxContent<S> {
    fn length(&self) -> u64 {
        self.meta.virtual_disk_size
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_aligned(pos, buf.len())?;
        let n = check_read(pos, buf.len(), self.length())?;
        if n == 0 {
            return Ok(0);
        }

        let mut done = 0usize;
        while done < n {
            let abs = pos + done as u64;
            let block = self.layout.block_of(abs);
            let within = abs % self.layout.block_size;
            let chunk_len = ((self.layout.block_size - within) as usize).min(n - done);
            let entry = self.payload_entry(block)?;

            let dst_range = done..done + chunk_len;
            match entry.payload_status()? {
                PayloadBlockStatus::FullyPresent => {
                    self.store
                        .read_at(entry.file_offset() + within, &mut buf[dst_range])?;
                }
                PayloadBlockStatus::PartiallyPresent => {
                    self.read_partial_block(block, &entry, within, abs, &mut buf[dst_range])?;
                }
                PayloadBlockStatus::NotPresent => {
                    let dst = &mut buf[dst_range];
                    self.read_parent(abs, dst)?;
                }
                PayloadBlockStatus::Zero
                | PayloadBlockStatus::Unmapped
                | PayloadBlockStatus::Undefined => {
                    buf[dst_range].fill(0);
                }
            }
            done += chunk_len;
        }
        Ok(n)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "VHDX opened read-only",
            )));
        }
        self.check_aligned(pos, buf.len())?;
        check_write(pos, buf.len(), self.length())?;

        let mut done = 0usize;
        while done < buf.len() {
            let abs = pos + done as u64;
            let block = self.layout.block_of(abs);
            let within = abs % self.layout.block_size;
            let chunk_len = ((self.layout.block_size - within) as usize).min(buf.len() - done);

            let entry = self.payload_entry(block)?;
            let entry = match entry.payload_status()? {
                PayloadBlockStatus::FullyPresent | PayloadBlockStatus::PartiallyPresent => entry,
                _ => self.allocate_block(block)?,
            };

            self.store
                .write_at(entry.file_offset() + within, &buf[done..done + chunk_len])?;

            if entry.payload_status()? == PayloadBlockStatus::PartiallyPresent {
                let sector_size = self.layout.logical_sector_size;
                let first = self.layout.sector_in_chunk(abs);
                let count = chunk_len as u64 / sector_size;
                self.mark_sectors_present(self.layout.chunk_of_block(block), first, count)?;
            }
            done += chunk_len;
        }
        Ok(())
    }

    fn extents(&mut self, range: Range<u64>) -> Result<Vec<Extent>> {
        let end = range.end.min(self.length());
        let mut out = Vec::new();
        let mut pos = range.start.min(end);
        while pos < end {
            let block = self.layout.block_of(pos);
            let block_end = ((block + 1) * self.layout.block_size).min(end);
            self.block_extents(block, pos..block_end, &mut out)?;
            pos = block_end;
        }
        Ok(merge_extents(out))
    }

    fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }
}
