//! VHD image creation
//!
//! Builds empty fixed, dynamic and differencing images, and can populate a
//! freshly created device from a raw source stream.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;
use vdisk_core::{BlockDevice, ByteStore, Error, Result};

use crate::bat::{BlockAllocationTable, BlockLayout};
use crate::footer::{DiskGeometry, DiskType, VhdFooter, VHD_EPOCH_OFFSET};
use crate::header::{DynamicHeader, ParentLocator};

/// Options for VHD creation
#[derive(Debug, Clone)]
pub struct VhdCreateOptions {
    /// Block size for dynamic images; must be a power of two
    pub block_size: u32,
    /// Creator application identifier (4 bytes)
    pub creator_app: [u8; 4],
}

impl Default for VhdCreateOptions {
    fn default() -> Self {
        Self {
            block_size: DynamicHeader::DEFAULT_BLOCK_SIZE,
            creator_app: *b"vdsk",
        }
    }
}

/// VHD image builder
pub struct VhdBuilder {
    options: VhdCreateOptions,
    cancel_flag: Arc<AtomicBool>,
}

impl Default for VhdBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VhdBuilder {
    pub fn new() -> Self {
        Self::with_options(VhdCreateOptions::default())
    }

    pub fn with_options(options: VhdCreateOptions) -> Self {
        Self {
            options,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a cancel flag that aborts a running `populate`
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    fn footer(&self, size: u64, disk_type: DiskType) -> VhdFooter {
        VhdFooter {
            features: 0x0000_0002,
            version: VhdFooter::VERSION,
            data_offset: if disk_type == DiskType::Fixed {
                u64::MAX
            } else {
                VhdFooter::SIZE as u64
            },
            timestamp: vhd_timestamp_now(),
            creator_app: self.options.creator_app,
            creator_version: 0x0001_0000,
            creator_os: 0x5769_326B, // Wi2k
            original_size: size,
            current_size: size,
            geometry: DiskGeometry::for_size(size),
            disk_type,
            checksum: 0,
            uuid: Uuid::new_v4(),
            saved_state: 0,
        }
    }

    /// Create an empty fixed VHD of `size` bytes
    pub fn create_fixed<S: ByteStore>(&self, store: &mut S, size: u64) -> Result<()> {
        check_size(size)?;
        let footer = self.footer(size, DiskType::Fixed);
        store.set_len(size + VhdFooter::SIZE as u64)?;
        store.write_at(size, &footer.serialize())?;
        store.flush()
    }

    /// Create an empty dynamic VHD of `size` bytes
    pub fn create_dynamic<S: ByteStore>(&self, store: &mut S, size: u64) -> Result<()> {
        check_size(size)?;
        let block_size = self.options.block_size;
        if !block_size.is_power_of_two() || block_size % 512 != 0 {
            return Err(Error::format(format!("invalid block size {}", block_size)));
        }

        let footer = self.footer(size, DiskType::Dynamic);
        let layout = BlockLayout::new(block_size);
        let block_count = size.div_ceil(layout.block_size) as u32;

        let header = DynamicHeader {
            data_offset: u64::MAX,
            table_offset: (VhdFooter::SIZE + DynamicHeader::SIZE) as u64,
            header_version: DynamicHeader::VERSION,
            max_table_entries: block_count,
            block_size,
            checksum: 0,
            parent_uuid: Uuid::nil(),
            parent_timestamp: 0,
            parent_unicode_name: [0u16; 256],
            parent_locators: [ParentLocator::default(); 8],
        };

        write_sparse_image(store, &footer, &header, &[])
    }

    /// Create a differencing child over `parent`.
    ///
    /// `parent_path` is recorded in the header name field and in the
    /// Windows absolute/relative locator blobs; resolving it back to a file
    /// at open time is the caller's job.
    pub fn create_differencing<S: ByteStore>(
        &self,
        store: &mut S,
        parent: &VhdFooter,
        parent_header: &DynamicHeader,
        parent_path: &str,
    ) -> Result<()> {
        let size = parent.current_size;
        let mut footer = self.footer(size, DiskType::Differencing);
        footer.geometry = parent.geometry;

        let layout = BlockLayout::new(parent_header.block_size);
        let block_count = size.div_ceil(layout.block_size) as u32;

        let mut header = DynamicHeader {
            data_offset: u64::MAX,
            table_offset: (VhdFooter::SIZE + DynamicHeader::SIZE) as u64,
            header_version: DynamicHeader::VERSION,
            max_table_entries: block_count,
            block_size: parent_header.block_size,
            checksum: 0,
            parent_uuid: parent.uuid,
            parent_timestamp: parent.timestamp,
            parent_unicode_name: [0u16; 256],
            parent_locators: [ParentLocator::default(); 8],
        };
        header.set_parent_name(parent_path)?;

        // Absolute and relative Windows Unicode locator blobs, one sector
        // each, placed between the BAT and the trailing footer.
        let absolute = utf16le_blob(parent_path);
        let relative = utf16le_blob(&format!(".\\{}", parent_path));
        let blobs = [
            (*ParentLocator::PLATFORM_W2KU, absolute),
            (*ParentLocator::PLATFORM_W2RU, relative),
        ];

        write_sparse_image(store, &footer, &header, &blobs)
    }

    /// Stream `source` into a freshly created device, skipping all-zero
    /// blocks so sparse images stay sparse
    pub fn populate<D: BlockDevice, R: Read>(&self, dev: &mut D, source: &mut R) -> Result<u64> {
        let chunk_size = self.options.block_size as usize;
        let mut buffer = vec![0u8; chunk_size];
        let mut pos = 0u64;

        loop {
            if self.cancel_flag.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }

            let mut filled = 0usize;
            while filled < chunk_size {
                let n = source.read(&mut buffer[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }

            let n = (filled as u64).min(dev.length().saturating_sub(pos)) as usize;
            if n == 0 {
                break;
            }
            if buffer[..n].iter().any(|&b| b != 0) {
                dev.write_at(pos, &buffer[..n])?;
            }
            pos += n as u64;
            if filled < chunk_size {
                break;
            }
        }

        dev.flush()?;
        Ok(pos)
    }
}

fn check_size(size: u64) -> Result<()> {
    if size == 0 || size % 512 != 0 {
        return Err(Error::format(format!(
            "virtual size {} is not a positive multiple of 512",
            size
        )));
    }
    Ok(())
}

/// Lay out `[footer | dynamic header | BAT | locator blobs | footer]`
fn write_sparse_image<S: ByteStore>(
    store: &mut S,
    footer: &VhdFooter,
    header: &DynamicHeader,
    locator_blobs: &[([u8; 4], Vec<u8>)],
) -> Result<()> {
    let bat_bytes = header.max_table_entries as u64 * 4;
    let bat_padded = bat_bytes.div_ceil(512) * 512;
    let blobs_start = header.table_offset + bat_padded;

    let mut header = header.clone();
    for (i, (code, blob)) in locator_blobs.iter().enumerate() {
        let blob_space = (blob.len() as u64).div_ceil(512) * 512;
        header.parent_locators[i] = ParentLocator {
            platform_code: *code,
            data_space: blob_space as u32,
            data_length: blob.len() as u32,
            data_offset: blobs_start + i as u64 * 512,
        };
    }

    let footer_bytes = footer.serialize();
    store.write_at(0, &footer_bytes)?;
    store.write_at(VhdFooter::SIZE as u64, &header.serialize())?;

    let bat = BlockAllocationTable::new_unallocated(header.max_table_entries);
    let mut bat_region = bat.serialize();
    bat_region.resize(bat_padded as usize, 0);
    store.write_at(header.table_offset, &bat_region)?;

    let mut end = blobs_start;
    for (i, (_, blob)) in locator_blobs.iter().enumerate() {
        let mut sector = vec![0u8; 512];
        sector[..blob.len()].copy_from_slice(blob);
        store.write_at(blobs_start + i as u64 * 512, &sector)?;
        end = blobs_start + (i as u64 + 1) * 512;
    }

    store.write_at(end, &footer_bytes)?;
    store.flush()
}

fn utf16le_blob(text: &str) -> Vec<u8> {
    let mut blob = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        blob.extend_from_slice(&unit.to_le_bytes());
    }
    blob
}

/// Seconds since the VHD epoch (2000-01-01 UTC)
fn vhd_timestamp_now() -> u32 {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    unix.saturating_sub(VHD_EPOCH_OFFSET) as u32
}
