//! VHDX metadata table and the known metadata items

use std::collections::HashMap;

use uuid::{uuid, Uuid};
use vdisk_core::codec::{guid_from_le, guid_to_le, le_u16, le_u32, le_u64};
use vdisk_core::{Error, Result};

pub const FILE_PARAMETERS_GUID: Uuid = uuid!("caa16737-fa36-4d43-b3b6-33f0aa44e76b");
pub const VIRTUAL_DISK_SIZE_GUID: Uuid = uuid!("2fa54224-cd1b-4876-b211-5dbed83bf4b8");
pub const VIRTUAL_DISK_ID_GUID: Uuid = uuid!("beca12ab-b2e6-4523-93ef-c309e000c746");
pub const LOGICAL_SECTOR_SIZE_GUID: Uuid = uuid!("8141bf1d-a96f-4709-ba47-f233a8faab5f");
pub const PHYSICAL_SECTOR_SIZE_GUID: Uuid = uuid!("cda348c7-445d-4471-9cc9-e9885251c556");
pub const PARENT_LOCATOR_GUID: Uuid = uuid!("a8d35f2d-b30b-454d-abf7-d3d84834ab0c");

const TABLE_SIGNATURE: &[u8; 8] = b"metadata";
const MAX_ENTRIES: usize = 2047;
/// Item payloads start past the 64-KiB table area within the region
const ITEM_AREA_OFFSET: usize = 64 * 1024;

const MIN_BLOCK_SIZE: u32 = 1024 * 1024;
const MAX_BLOCK_SIZE: u32 = 256 * 1024 * 1024;

/// Parent locator key/value map for differencing images
#[derive(Debug, Clone)]
pub struct ParentLocator {
    pub locator_type: Uuid,
    pub entries: HashMap<String, String>,
}

/// The parsed metadata of a VHDX image
#[derive(Debug, Clone)]
pub struct DiskMetadata {
    pub block_size: u32,
    pub leave_blocks_allocated: bool,
    pub has_parent: bool,
    pub virtual_disk_size: u64,
    pub virtual_disk_id: Uuid,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub parent_locator: Option<ParentLocator>,
}

impl DiskMetadata {
    /// Parse the metadata region (table plus item payloads)
    pub fn parse(region: &[u8]) -> Result<Self> {
        if region.len() < 32 {
            return Err(Error::truncated("VHDX metadata region too small"));
        }
        if &region[0..8] != TABLE_SIGNATURE {
            return Err(Error::format("VHDX metadata table signature mismatch"));
        }

        let entry_count = le_u16(&region[10..12]) as usize;
        if entry_count > MAX_ENTRIES {
            return Err(Error::format(format!(
                "VHDX metadata table claims {} entries",
                entry_count
            )));
        }

        let mut file_parameters: Option<(u32, u32)> = None;
        let mut virtual_disk_size: Option<u64> = None;
        let mut virtual_disk_id: Option<Uuid> = None;
        let mut logical_sector_size: Option<u32> = None;
        let mut physical_sector_size: Option<u32> = None;
        let mut parent_locator: Option<ParentLocator> = None;

        for i in 0..entry_count {
            let offset = 32 + i * 32;
            if offset + 32 > region.len() {
                return Err(Error::truncated("VHDX metadata table truncated"));
            }
            let entry = &region[offset..offset + 32];
            let item_id = guid_from_le(&entry[0..16]);
            let item_offset = le_u32(&entry[16..20]) as usize;
            let item_length = le_u32(&entry[20..24]) as usize;
            let is_required = le_u32(&entry[24..28]) & 0x4 != 0;

            if item_length == 0 {
                continue;
            }
            let end = item_offset
                .checked_add(item_length)
                .filter(|&end| end <= region.len())
                .ok_or_else(|| Error::truncated("VHDX metadata item out of region"))?;
            let item = &region[item_offset..end];

            match item_id {
                id if id == FILE_PARAMETERS_GUID => {
                    if item.len() < 8 {
                        return Err(Error::truncated("file parameters item too small"));
                    }
                    file_parameters = Some((le_u32(&item[0..4]), le_u32(&item[4..8])));
                }
                id if id == VIRTUAL_DISK_SIZE_GUID => {
                    if item.len() < 8 {
                        return Err(Error::truncated("virtual disk size item too small"));
                    }
                    virtual_disk_size = Some(le_u64(&item[0..8]));
                }
                id if id == VIRTUAL_DISK_ID_GUID => {
                    if item.len() < 16 {
                        return Err(Error::truncated("virtual disk id item too small"));
                    }
                    virtual_disk_id = Some(guid_from_le(&item[0..16]));
                }
                id if id == LOGICAL_SECTOR_SIZE_GUID => {
                    if item.len() < 4 {
                        return Err(Error::truncated("logical sector size item too small"));
                    }
                    logical_sector_size = Some(le_u32(&item[0..4]));
                }
                id if id == PHYSICAL_SECTOR_SIZE_GUID => {
                    if item.len() < 4 {
                        return Err(Error::truncated("physical sector size item too small"));
                    }
                    physical_sector_size = Some(le_u32(&item[0..4]));
                }
                id if id == PARENT_LOCATOR_GUID => {
                    parent_locator = Some(parse_parent_locator(item)?);
                }
                _ if is_required => {
                    return Err(Error::format(format!(
                        "unknown required metadata item {}",
                        item_id
                    )));
                }
                _ => {}
            }
        }

        let (block_size, flags) = file_parameters
            .ok_or_else(|| Error::format("VHDX metadata lacks file parameters"))?;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || !block_size.is_power_of_two()
        {
            return Err(Error::format(format!(
                "VHDX block size {} outside 1 MiB..256 MiB power-of-two range",
                block_size
            )));
        }

        let logical_sector_size = logical_sector_size
            .ok_or_else(|| Error::format("VHDX metadata lacks logical sector size"))?;
        if logical_sector_size != 512 && logical_sector_size != 4096 {
            return Err(Error::format(format!(
                "VHDX logical sector size {} is not 512 or 4096",
                logical_sector_size
            )));
        }

        let virtual_disk_size = virtual_disk_size
            .ok_or_else(|| Error::format("VHDX metadata lacks virtual disk size"))?;
        if virtual_disk_size == 0 || virtual_disk_size % logical_sector_size as u64 != 0 {
            return Err(Error::format(format!(
                "VHDX virtual disk size {} not a multiple of the sector size",
                virtual_disk_size
            )));
        }

        let has_parent = flags & 0x2 != 0;
        if has_parent && parent_locator.is_none() {
            return Err(Error::format(
                "differencing VHDX lacks a parent locator item",
            ));
        }

        Ok(Self {
            block_size,
            leave_blocks_allocated: flags & 0x1 != 0,
            has_parent,
            virtual_disk_size,
            virtual_disk_id: virtual_disk_id.unwrap_or_else(Uuid::nil),
            logical_sector_size,
            physical_sector_size: physical_sector_size.unwrap_or(4096),
            parent_locator,
        })
    }

    /// Serialize table plus items into a fresh metadata region image
    pub fn serialize(&self, region_len: usize) -> Result<Vec<u8>> {
        let mut region = vec![0u8; region_len];
        region[0..8].copy_from_slice(TABLE_SIGNATURE);

        let mut items: Vec<(Uuid, u32, Vec<u8>)> = Vec::new();

        let mut file_parameters = vec![0u8; 8];
        file_parameters[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        let flags =
            (self.leave_blocks_allocated as u32) | ((self.has_parent as u32) << 1);
        file_parameters[4..8].copy_from_slice(&flags.to_le_bytes());
        // IsRequired = bit 2 of the entry flags word
        items.push((FILE_PARAMETERS_GUID, 0x4, file_parameters));

        items.push((
            VIRTUAL_DISK_SIZE_GUID,
            0x4 | 0x2, // required, virtual-disk scope
            self.virtual_disk_size.to_le_bytes().to_vec(),
        ));
        items.push((
            VIRTUAL_DISK_ID_GUID,
            0x4 | 0x2,
            guid_to_le(&self.virtual_disk_id).to_vec(),
        ));
        items.push((
            LOGICAL_SECTOR_SIZE_GUID,
            0x4 | 0x2,
            self.logical_sector_size.to_le_bytes().to_vec(),
        ));
        items.push((
            PHYSICAL_SECTOR_SIZE_GUID,
            0x4 | 0x2,
            self.physical_sector_size.to_le_bytes().to_vec(),
        ));
        if let Some(locator) = &self.parent_locator {
            items.push((PARENT_LOCATOR_GUID, 0x4, serialize_parent_locator(locator)));
        }

        region[10..12].copy_from_slice(&(items.len() as u16).to_le_bytes());

        let mut payload_offset = ITEM_AREA_OFFSET;
        for (i, (guid, flags, payload)) in items.iter().enumerate() {
            let entry_offset = 32 + i * 32;
            let end = payload_offset + payload.len();
            if end > region_len {
                return Err(Error::format("metadata items exceed the metadata region"));
            }

            region[entry_offset..entry_offset + 16].copy_from_slice(&guid_to_le(guid));
            region[entry_offset + 16..entry_offset + 20]
                .copy_from_slice(&(payload_offset as u32).to_le_bytes());
            region[entry_offset + 20..entry_offset + 24]
                .copy_from_slice(&(payload.len() as u32).to_le_bytes());
            region[entry_offset + 24..entry_offset + 28].copy_from_slice(&flags.to_le_bytes());

            region[payload_offset..end].copy_from_slice(payload);
            payload_offset = end;
        }

        Ok(region)
    }

    /// Bytes covered by one chunk: `2^23 * logical_sector_size`
    pub fn chunk_size(&self) -> u64 {
        (1u64 << 23) * self.logical_sector_size as u64
    }

    /// Payload blocks per chunk
    pub fn chunk_ratio(&self) -> u64 {
        self.chunk_size() / self.block_size as u64
    }
}

fn parse_parent_locator(item: &[u8]) -> Result<ParentLocator> {
    if item.len() < 20 {
        return Err(Error::truncated("parent locator header too small"));
    }
    let locator_type = guid_from_le(&item[0..16]);
    let count = le_u16(&item[18..20]) as usize;

    let mut entries = HashMap::with_capacity(count);
    for i in 0..count {
        let offset = 20 + i * 12;
        if offset + 12 > item.len() {
            return Err(Error::truncated("parent locator entry truncated"));
        }
        let key_offset = le_u32(&item[offset..offset + 4]) as usize;
        let value_offset = le_u32(&item[offset + 4..offset + 8]) as usize;
        let key_length = le_u16(&item[offset + 8..offset + 10]) as usize;
        let value_length = le_u16(&item[offset + 10..offset + 12]) as usize;

        let key = utf16le_string(item, key_offset, key_length)?;
        let value = utf16le_string(item, value_offset, value_length)?;
        entries.insert(key, value);
    }

    Ok(ParentLocator {
        locator_type,
        entries,
    })
}

fn serialize_parent_locator(locator: &ParentLocator) -> Vec<u8> {
    let header_len = 20 + locator.entries.len() * 12;
    let mut out = vec![0u8; header_len];
    out[0..16].copy_from_slice(&guid_to_le(&locator.locator_type));
    out[18..20].copy_from_slice(&(locator.entries.len() as u16).to_le_bytes());

    let mut keys: Vec<_> = locator.entries.keys().collect();
    keys.sort();
    for (i, key) in keys.iter().enumerate() {
        let value = &locator.entries[*key];
        let key_bytes = utf16le_bytes(key);
        let value_bytes = utf16le_bytes(value);

        let entry = 20 + i * 12;
        let key_offset = out.len();
        out.extend_from_slice(&key_bytes);
        let value_offset = out.len();
        out.extend_from_slice(&value_bytes);

        out[entry..entry + 4].copy_from_slice(&(key_offset as u32).to_le_bytes());
        out[entry + 4..entry + 8].copy_from_slice(&(value_offset as u32).to_le_bytes());
        out[entry + 8..entry + 10].copy_from_slice(&(key_bytes.len() as u16).to_le_bytes());
        out[entry + 10..entry + 12].copy_from_slice(&(value_bytes.len() as u16).to_le_bytes());
    }
    out
}

fn utf16le_string(bytes: &[u8], offset: usize, len: usize) -> Result<String> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::truncated("parent locator string out of bounds"))?;
    let units: Vec<u16> = bytes[offset..end].chunks_exact(2).map(le_u16).collect();
    String::from_utf16(&units).map_err(|_| Error::format("parent locator string is not UTF-16"))
}

fn utf16le_bytes(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}
