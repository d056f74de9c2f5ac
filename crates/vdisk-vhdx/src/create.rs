//! VHDX image creation
//!
//! Only dynamic images can be created. Fixed and differencing writers are
//! intentionally absent; opening an existing differencing image works.

use uuid::Uuid;
use vdisk_core::{ByteStore, Error, Result};

use crate::bat::ChunkLayout;
use crate::header::{
    FileIdentifier, RegionEntry, RegionTable, VhdxHeader, BAT_REGION_GUID, HEADER1_OFFSET,
    HEADER2_OFFSET, METADATA_REGION_GUID, REGION1_OFFSET, REGION2_OFFSET,
};
use crate::metadata::DiskMetadata;

const MB: u64 = 1024 * 1024;

/// Options for VHDX creation
#[derive(Debug, Clone)]
pub struct VhdxCreateOptions {
    /// Payload block size; power of two in 1 MiB..256 MiB
    pub block_size: u32,
    /// Logical sector size; 512 or 4096
    pub logical_sector_size: u32,
    /// Physical sector size reported to callers
    pub physical_sector_size: u32,
    /// Log region length, a multiple of 1 MiB
    pub log_length: u32,
}

impl Default for VhdxCreateOptions {
    fn default() -> Self {
        Self {
            block_size: 32 * 1024 * 1024,
            logical_sector_size: 512,
            physical_sector_size: 4096,
            log_length: MB as u32,
        }
    }
}

/// Create an empty dynamic VHDX of `size` bytes
pub fn create_dynamic<S: ByteStore>(
    store: &mut S,
    size: u64,
    options: &VhdxCreateOptions,
) -> Result<()> {
    if size == 0 || size % options.logical_sector_size as u64 != 0 {
        return Err(Error::format(format!(
            "virtual size {} is not a positive multiple of the sector size",
            size
        )));
    }

    let meta = DiskMetadata {
        block_size: options.block_size,
        leave_blocks_allocated: false,
        has_parent: false,
        virtual_disk_size: size,
        virtual_disk_id: Uuid::new_v4(),
        logical_sector_size: options.logical_sector_size,
        physical_sector_size: options.physical_sector_size,
        parent_locator: None,
    };

    let layout = ChunkLayout::new(options.block_size, options.logical_sector_size);
    let log_offset = MB;
    let log_length = options.log_length as u64;
    let metadata_offset = log_offset + log_length;
    let metadata_length = MB;
    let bat_offset = metadata_offset + metadata_length;
    let bat_length = layout.bat_length(size).next_multiple_of(MB);
    let file_len = bat_offset + bat_length;

    // Everything starts zeroed: the log is empty and every BAT entry is
    // NotPresent.
    store.set_len(file_len)?;

    let identifier = FileIdentifier {
        creator: "vdisk 0.1".to_string(),
    };
    store.write_at(0, &identifier.serialize())?;

    let header = VhdxHeader {
        sequence_number: 1,
        file_write_guid: Uuid::new_v4(),
        data_write_guid: Uuid::new_v4(),
        log_guid: Uuid::nil(),
        log_version: 0,
        version: 1,
        log_length: options.log_length,
        log_offset,
    };
    store.write_at(HEADER1_OFFSET, &header.serialize())?;
    let mut second = header;
    second.sequence_number = 2;
    store.write_at(HEADER2_OFFSET, &second.serialize())?;

    let regions = RegionTable {
        entries: vec![
            RegionEntry {
                guid: BAT_REGION_GUID,
                file_offset: bat_offset,
                length: bat_length as u32,
                required: true,
            },
            RegionEntry {
                guid: METADATA_REGION_GUID,
                file_offset: metadata_offset,
                length: metadata_length as u32,
                required: true,
            },
        ],
    };
    let region_bytes = regions.serialize();
    store.write_at(REGION1_OFFSET, &region_bytes)?;
    store.write_at(REGION2_OFFSET, &region_bytes)?;

    let metadata_bytes = meta.serialize(metadata_length as usize)?;
    store.write_at(metadata_offset, &metadata_bytes)?;

    store.flush()
}

/// Fixed-VHDX creation is not supported
pub fn create_fixed<S: ByteStore>(_store: &mut S, _size: u64) -> Result<()> {
    Err(Error::NotImplemented("fixed VHDX creation"))
}

/// Differencing-VHDX creation is not supported
pub fn create_differencing<S: ByteStore>(_store: &mut S, _parent_path: &str) -> Result<()> {
    Err(Error::NotImplemented("differencing VHDX creation"))
}
