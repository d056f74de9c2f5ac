//! # vdisk VHDX
//!
//! Microsoft VHDX storage backend.
//!
//! ## Format overview
//!
//! A VHDX is little-endian with CRC-32C checksums: a file identifier at 0,
//! two alternating 4-KiB headers at 64/128 KiB, duplicated region tables at
//! 192/256 KiB, a circular write-ahead log, a metadata region and a BAT
//! region that interleaves payload-block entries with one sector-bitmap
//! entry per chunk.
//!
//! Opening replays any pending log (onto an in-memory overlay when the
//! image is opened read-only) and, for writable opens, refreshes the
//! FileWriteGuid and LogGuid through two alternating-header writes.
//!
//! I/O on the content stream must be aligned to the logical sector size;
//! wrap the disk in [`vdisk_pipeline::SectorAligned`] for byte-granular
//! access.

pub mod bat;
pub mod content;
pub mod create;
pub mod freespace;
pub mod header;
pub mod log;
pub mod metadata;

pub use bat::{BatEntry, ChunkLayout, PayloadBlockStatus};
pub use content::VhdxContent;
pub use create::{create_dynamic, VhdxCreateOptions};
pub use header::{ActiveHeader, FileIdentifier, RegionTable, VhdxHeader};
pub use metadata::DiskMetadata;

use std::ops::Range;

use uuid::Uuid;
use vdisk_core::{BlockDevice, ByteStore, Error, Extent, Result};
use vdisk_pipeline::{Overlay, Window};

use crate::bat::SB_BLOCK_PRESENT;
use crate::freespace::FreeSpaceTable;
use crate::header::{read_active_header, read_region_table, write_header_update};
use crate::log::LogRange;

const MB: u64 = 1024 * 1024;

/// Configuration for opening a VHDX
#[derive(Debug, Clone, Default)]
pub struct VhdxOptions {
    /// Open without modifying the file; log replay happens on an in-memory
    /// overlay and writes are rejected
    pub read_only: bool,
}

/// The logical (post-log-replay) byte store of an opened image
pub enum Logical<S> {
    Direct(S),
    Snapshot(Overlay<S>),
}

impl<S: ByteStore> Logical<S> {
    /// Return the host store, discarding any snapshot overlay
    pub fn into_base(self) -> S {
        match self {
            Logical::Direct(store) => store,
            Logical::Snapshot(overlay) => overlay.into_base(),
        }
    }
}

impl<S: ByteStore> ByteStore for Logical<S> {
    fn len(&mut self) -> Result<u64> {
        match self {
            Logical::Direct(store) => store.len(),
            Logical::Snapshot(overlay) => overlay.len(),
        }
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        match self {
            Logical::Direct(store) => store.set_len(len),
            Logical::Snapshot(overlay) => overlay.set_len(len),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Logical::Direct(store) => store.read_at(offset, buf),
            Logical::Snapshot(overlay) => overlay.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            Logical::Direct(store) => store.write_at(offset, buf),
            Logical::Snapshot(overlay) => overlay.write_at(offset, buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Logical::Direct(store) => store.flush(),
            Logical::Snapshot(overlay) => overlay.flush(),
        }
    }
}

/// An opened VHDX image
pub struct VhdxDisk<S> {
    content: VhdxContent<Logical<S>>,
    active_sequence: u64,
}

impl<S: ByteStore> VhdxDisk<S> {
    /// Open a non-differencing VHDX
    pub fn open(store: S, options: &VhdxOptions) -> Result<Self> {
        Self::open_impl(store, None, options)
    }

    /// Open a differencing VHDX layered over `parent`
    pub fn open_differencing(
        store: S,
        parent: Box<dyn BlockDevice>,
        options: &VhdxOptions,
    ) -> Result<Self> {
        Self::open_impl(store, Some(parent), options)
    }

    fn open_impl(
        mut store: S,
        parent: Option<Box<dyn BlockDevice>>,
        options: &VhdxOptions,
    ) -> Result<Self> {
        let mut id_bytes = [0u8; FileIdentifier::SIZE];
        store.read_at(0, &mut id_bytes)?;
        FileIdentifier::parse(&id_bytes)?;

        let mut active = read_active_header(&mut store)?;
        let log = LogRange {
            offset: active.header.log_offset,
            length: active.header.log_length as u64,
            guid: active.header.log_guid,
        };

        // Pending log entries are replayed before any other structure is
        // trusted. A read-only open repairs a snapshot overlay instead of
        // the file.
        let mut logical = if options.read_only && !log.guid.is_nil() {
            Logical::Snapshot(Overlay::new(store)?)
        } else {
            Logical::Direct(store)
        };
        if !log.guid.is_nil() && log.length > 0 {
            let entries = log::scan(&mut logical, &log)?;
            let applied = log::apply(&entries, &mut logical)?;
            if applied > 0 {
                tracing::debug!(entries = applied, "replayed VHDX log");
            }
        }

        if !options.read_only {
            // Open-for-write ritual: refresh FileWriteGuid, then retire the
            // log under a fresh (nil) LogGuid. Two alternating writes, so
            // the active sequence advances by two.
            let mut update = active.header.clone();
            update.file_write_guid = Uuid::new_v4();
            active = write_header_update(&mut logical, &active, update)?;

            let mut update = active.header.clone();
            update.data_write_guid = Uuid::new_v4();
            update.log_guid = Uuid::nil();
            active = write_header_update(&mut logical, &active, update)?;
        }

        let regions = read_region_table(&mut logical)?;
        let bat_region = *regions
            .find(header::BAT_REGION_GUID)
            .ok_or_else(|| Error::format("region table lacks a BAT region"))?;
        let metadata_region = *regions
            .find(header::METADATA_REGION_GUID)
            .ok_or_else(|| Error::format("region table lacks a metadata region"))?;

        let mut metadata_bytes = vec![0u8; metadata_region.length as usize];
        logical.read_at(metadata_region.file_offset, &mut metadata_bytes)?;
        let meta = DiskMetadata::parse(&metadata_bytes)?;

        match (meta.has_parent, &parent) {
            (true, None) => {
                return Err(Error::format(
                    "differencing VHDX requires its parent device",
                ));
            }
            (false, Some(_)) => {
                return Err(Error::format(
                    "parent device supplied for a non-differencing VHDX",
                ));
            }
            _ => {}
        }
        if let Some(parent) = &parent {
            if parent.length() != meta.virtual_disk_size {
                return Err(Error::format(format!(
                    "parent length {} does not match child virtual size {}",
                    parent.length(),
                    meta.virtual_disk_size
                )));
            }
        }

        let layout = ChunkLayout::new(meta.block_size, meta.logical_sector_size);
        let bat_length = layout.bat_length(meta.virtual_disk_size);
        if bat_length > bat_region.length as u64 {
            return Err(Error::truncated(format!(
                "BAT region of {} bytes cannot map {} bytes of disk",
                bat_region.length, meta.virtual_disk_size
            )));
        }

        let free = build_free_space(
            &mut logical,
            &regions,
            &log,
            &layout,
            &meta,
            bat_region.file_offset,
        )?;

        let content = VhdxContent::new(
            logical,
            meta,
            bat_region.file_offset,
            free,
            parent,
            options.read_only,
        );
        Ok(Self {
            content,
            active_sequence: active.header.sequence_number,
        })
    }

    pub fn metadata(&self) -> &DiskMetadata {
        self.content.metadata()
    }

    /// Sequence number of the active header as of open
    pub fn active_sequence(&self) -> u64 {
        self.active_sequence
    }

    /// Give back the logical store; callers should `flush` first
    pub fn into_store(self) -> Logical<S> {
        self.content.into_store()
    }
}

/// Reserve every structure and in-use block, leaving the gaps allocatable
fn build_free_space<S: ByteStore>(
    store: &mut S,
    regions: &RegionTable,
    log: &LogRange,
    layout: &ChunkLayout,
    meta: &DiskMetadata,
    bat_offset: u64,
) -> Result<FreeSpaceTable> {
    let file_len = store.len()?;
    let mut free = FreeSpaceTable::new(file_len);

    // Fixed header area: file identifier, headers, region tables.
    free.reserve(0, MB);
    free.reserve(log.offset, log.length);
    for entry in &regions.entries {
        free.reserve(entry.file_offset, entry.length as u64);
    }

    let blocks = meta.virtual_disk_size.div_ceil(layout.block_size);
    let chunks = blocks.div_ceil(layout.chunk_ratio);

    let bat_length = layout.bat_length(meta.virtual_disk_size);
    let mut bat_view = Window::new(&mut *store, bat_offset, bat_length);
    let mut bat_bytes = vec![0u8; bat_length as usize];
    bat_view.read_at(0, &mut bat_bytes)?;
    let entry_at = |offset: u64| {
        BatEntry::from_u64(vdisk_core::codec::le_u64(
            &bat_bytes[offset as usize..offset as usize + 8],
        ))
    };

    for block in 0..blocks {
        let entry = entry_at(layout.payload_entry_offset(block));
        if entry.file_offset() != 0
            && matches!(
                entry.payload_status(),
                Ok(PayloadBlockStatus::FullyPresent) | Ok(PayloadBlockStatus::PartiallyPresent)
            )
        {
            free.reserve(entry.file_offset(), layout.block_size);
        }
    }
    for chunk in 0..chunks {
        let entry = entry_at(layout.bitmap_entry_offset(chunk));
        if entry.state == SB_BLOCK_PRESENT && entry.file_offset() != 0 {
            free.reserve(entry.file_offset(), MB);
        }
    }

    Ok(free)
}

impl<S: ByteStore> BlockDevice for VhdxDisk<S> {
    fn length(&self) -> u64 {
        self.content.length()
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.content.read_at(pos, buf)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        self.content.write_at(pos, buf)
    }

    fn extents(&mut self, range: Range<u64>) -> Result<Vec<Extent>> {
        self.content.extents(range)
    }

    fn flush(&mut self) -> Result<()> {
        self.content.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdisk_pipeline::{MemStore, SectorAligned};

    const SIZE: u64 = 16 * MB;

    fn new_image() -> MemStore {
        let mut store = MemStore::new();
        let options = VhdxCreateOptions {
            block_size: MB as u32,
            ..Default::default()
        };
        create_dynamic(&mut store, SIZE, &options).unwrap();
        store
    }

    fn reopen_bytes<S: ByteStore>(disk: VhdxDisk<S>) -> S {
        disk.into_store().into_base()
    }

    #[test]
    fn test_write_flush_reopen_sector_survives() {
        let mut store = new_image();
        let created_sequence = read_active_header(&mut store)
            .unwrap()
            .header
            .sequence_number;

        let mut disk = VhdxDisk::open(store, &VhdxOptions::default()).unwrap();
        let sector = [0xCDu8; 512];
        disk.write_at(512, &sector).unwrap();
        disk.flush().unwrap();
        let bytes = reopen_bytes(disk);

        let mut reopened =
            VhdxDisk::open(bytes, &VhdxOptions { read_only: true }).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(reopened.read_at(512, &mut buf).unwrap(), 512);
        assert_eq!(buf, sector);

        // The open-for-write ritual advanced the active header by >= 2
        assert!(reopened.active_sequence() >= created_sequence + 2);
    }

    #[test]
    fn test_unaligned_io_rejected() {
        let mut disk = VhdxDisk::open(new_image(), &VhdxOptions::default()).unwrap();
        let mut buf = [0u8; 512];
        assert!(matches!(
            disk.read_at(100, &mut buf),
            Err(Error::Unaligned(_))
        ));
        assert!(matches!(
            disk.write_at(0, &buf[..100]),
            Err(Error::Unaligned(_))
        ));

        // The aligning adapter makes byte access work
        let mut aligned = SectorAligned::new(disk, 512);
        aligned.write_at(100, b"unaligned").unwrap();
        let mut small = [0u8; 9];
        aligned.read_at(100, &mut small).unwrap();
        assert_eq!(&small, b"unaligned");
    }

    #[test]
    fn test_fresh_image_is_sparse() {
        let mut disk = VhdxDisk::open(new_image(), &VhdxOptions::default()).unwrap();
        assert!(disk.extents(0..disk.length()).unwrap().is_empty());

        let mut buf = vec![0xFFu8; 4096];
        disk.read_at(MB, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_extent_after_write() {
        let mut disk = VhdxDisk::open(new_image(), &VhdxOptions::default()).unwrap();
        disk.write_at(2 * MB, &[0xABu8; 4096]).unwrap();

        // Non-differencing blocks go FullyPresent, so the whole block shows
        let extents = disk.extents(0..disk.length()).unwrap();
        assert_eq!(extents, vec![Extent::new(2 * MB, MB)]);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut disk =
            VhdxDisk::open(new_image(), &VhdxOptions { read_only: true }).unwrap();
        assert!(disk.write_at(0, &[0u8; 512]).is_err());
    }

    #[test]
    fn test_boundary_semantics() {
        let mut disk = VhdxDisk::open(new_image(), &VhdxOptions::default()).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(disk.read_at(SIZE, &mut buf).unwrap(), 0);
        assert!(disk.read_at(SIZE + 512, &mut buf).is_err());
        assert!(disk.write_at(SIZE - 256, &buf[..256]).is_err());
    }

    #[test]
    fn test_idempotent_write() {
        let mut disk = VhdxDisk::open(new_image(), &VhdxOptions::default()).unwrap();
        let payload = [0x77u8; 4096];
        disk.write_at(4096, &payload).unwrap();
        let first = disk.extents(0..disk.length()).unwrap();
        disk.write_at(4096, &payload).unwrap();
        assert_eq!(disk.extents(0..disk.length()).unwrap(), first);

        let mut buf = [0u8; 4096];
        disk.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, payload);
    }

    /// Write both header slots with the given header (sequences n, n+1)
    fn force_headers(store: &mut MemStore, header: &VhdxHeader) {
        let mut first = header.clone();
        first.sequence_number = 10;
        ByteStore::write_at(store, header::HEADER1_OFFSET, &first.serialize()).unwrap();
        let mut second = header.clone();
        second.sequence_number = 11;
        ByteStore::write_at(store, header::HEADER2_OFFSET, &second.serialize()).unwrap();
    }

    #[test]
    fn test_log_replay_on_read_only_open() {
        // Build an image with one FullyPresent block, then record a log
        // entry that overwrites its first 4 KiB with 0xAB.
        let store = new_image();
        let mut disk = VhdxDisk::open(store, &VhdxOptions::default()).unwrap();
        disk.write_at(0, &[0x11u8; 4096]).unwrap();
        disk.flush().unwrap();
        let mut bytes = reopen_bytes(disk);

        // Find block 0's file offset straight from the BAT at 3 MiB.
        let bat_entry = {
            let slice = &bytes.as_slice()[3 * MB as usize..3 * MB as usize + 8];
            BatEntry::from_u64(u64::from_le_bytes(slice.try_into().unwrap()))
        };
        assert_eq!(
            bat_entry.payload_status().unwrap(),
            PayloadBlockStatus::FullyPresent
        );

        let log_guid = uuid::Uuid::new_v4();
        let mut payload = [0xABu8; 4096];
        payload[0] = 0x01; // distinct leading/trailing bytes
        payload[4095] = 0x02;
        let entry = log::build::encode_entry(
            log_guid,
            5,
            0,
            &[log::build::BuildDescriptor::Data {
                file_offset: bat_entry.file_offset(),
                payload,
            }],
            0,
            ByteStore::len(&mut bytes).unwrap(),
        );
        ByteStore::write_at(&mut bytes, MB, &entry).unwrap();

        let active = read_active_header(&mut bytes).unwrap();
        let mut header = active.header.clone();
        header.log_guid = log_guid;
        force_headers(&mut bytes, &header);

        let mut reopened =
            VhdxDisk::open(bytes, &VhdxOptions { read_only: true }).unwrap();
        let mut buf = [0u8; 4096];
        reopened.read_at(0, &mut buf).unwrap();
        assert_eq!(buf[..], payload[..]);

        // Read-only replay never touches the underlying file
        let base = reopen_bytes(reopened);
        let data_off = bat_entry.file_offset() as usize;
        assert!(base.as_slice()[data_off..data_off + 4096]
            .iter()
            .all(|&b| b == 0x11));
    }

    /// Minimal parent device for differencing tests
    struct ParentDev(Vec<u8>);

    impl BlockDevice for ParentDev {
        fn length(&self) -> u64 {
            self.0.len() as u64
        }

        fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
            let n = vdisk_core::check_read(pos, buf.len(), self.length())?;
            let start = pos as usize;
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }

        fn write_at(&mut self, _pos: u64, _buf: &[u8]) -> Result<()> {
            panic!("parent is read-only");
        }

        fn extents(&mut self, range: Range<u64>) -> Result<Vec<Extent>> {
            Ok(vec![Extent::new(range.start, range.end - range.start)])
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Patch a freshly created image into a differencing one
    fn make_differencing(store: &mut MemStore) {
        let mut meta = DiskMetadata {
            block_size: MB as u32,
            leave_blocks_allocated: false,
            has_parent: true,
            virtual_disk_size: SIZE,
            virtual_disk_id: uuid::Uuid::new_v4(),
            logical_sector_size: 512,
            physical_sector_size: 4096,
            parent_locator: None,
        };
        let mut entries = std::collections::HashMap::new();
        entries.insert("relative_path".to_string(), ".\\base.vhdx".to_string());
        meta.parent_locator = Some(metadata::ParentLocator {
            locator_type: uuid::Uuid::new_v4(),
            entries,
        });
        let region = meta.serialize(MB as usize).unwrap();
        ByteStore::write_at(store, 2 * MB, &region).unwrap();
    }

    #[test]
    fn test_differencing_copy_on_write() {
        let mut store = new_image();
        make_differencing(&mut store);

        let parent_bytes: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
        let parent = ParentDev(parent_bytes.clone());

        let mut child =
            VhdxDisk::open_differencing(store, Box::new(parent), &VhdxOptions::default())
                .unwrap();

        // Unwritten positions read through to the parent
        let mut buf = [0u8; 512];
        child.read_at(4 * MB, &mut buf).unwrap();
        assert_eq!(&buf[..], &parent_bytes[4 * MB as usize..4 * MB as usize + 512]);

        // Diverge one sector; neighbours still come from the parent
        child.write_at(4 * MB, &[0xEEu8; 512]).unwrap();
        child.read_at(4 * MB, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xEE));
        child.read_at(4 * MB + 512, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &parent_bytes[(4 * MB + 512) as usize..(4 * MB + 1024) as usize]
        );
    }
}
