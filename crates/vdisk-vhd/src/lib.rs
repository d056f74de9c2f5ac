//! # vdisk VHD
//!
//! Microsoft VHD (Virtual Hard Disk) storage backend.
//!
//! ## Supported formats
//!
//! - **Fixed VHD**: content stored contiguously with a trailing footer
//! - **Dynamic VHD**: sparse format using a Block Allocation Table and
//!   per-block sector bitmaps
//! - **Differencing VHD**: copy-on-write layer over a parent image; only
//!   diverging sectors are stored locally
//!
//! ## Format overview
//!
//! Every VHD ends with a 512-byte footer. Sparse variants duplicate it at
//! offset 0 and lay the file out as
//! `[footer | dynamic header | BAT | {bitmap|block}* | footer]`.
//! All integers are big-endian.

pub mod bat;
pub mod create;
pub mod dynamic;
pub mod fixed;
pub mod footer;
pub mod header;

pub use create::{VhdBuilder, VhdCreateOptions};
pub use dynamic::DynamicVhd;
pub use fixed::FixedVhd;
pub use footer::{DiskGeometry, DiskType, VhdFooter};
pub use header::{DynamicHeader, ParentLocator};

use std::ops::Range;
use vdisk_core::{BlockDevice, ByteStore, Error, Extent, Result};

/// Configuration for opening a VHD
#[derive(Debug, Clone)]
pub struct VhdOptions {
    /// Rewrite the trailing footer immediately after every block allocation.
    /// When off, the rewrite is deferred to `flush`.
    pub auto_commit_footer: bool,
}

impl Default for VhdOptions {
    fn default() -> Self {
        Self {
            auto_commit_footer: true,
        }
    }
}

/// An opened VHD of any supported type
pub enum VhdDisk<S> {
    Fixed(FixedVhd<S>),
    Dynamic(DynamicVhd<S>),
}

impl<S: ByteStore> VhdDisk<S> {
    /// Open a fixed or dynamic VHD.
    ///
    /// Differencing images need their parent device and go through
    /// [`VhdDisk::open_differencing`]; resolving the parent locator to a
    /// path is the host's job.
    pub fn open(mut store: S, options: &VhdOptions) -> Result<Self> {
        let footer = dynamic::read_footer_with_fallback(&mut store)?;
        match footer.disk_type {
            DiskType::Fixed => Ok(VhdDisk::Fixed(FixedVhd::open(store)?)),
            DiskType::Dynamic => Ok(VhdDisk::Dynamic(DynamicVhd::open(store, None, options)?)),
            DiskType::Differencing => Err(Error::format(
                "differencing VHD requires open_differencing with its parent",
            )),
            DiskType::None => Err(Error::format("VHD disk type is None")),
        }
    }

    /// Open a differencing VHD layered over `parent`
    pub fn open_differencing(
        store: S,
        parent: Box<dyn BlockDevice>,
        options: &VhdOptions,
    ) -> Result<Self> {
        Ok(VhdDisk::Dynamic(DynamicVhd::open(
            store,
            Some(parent),
            options,
        )?))
    }

    /// Human-readable description of the image type
    pub fn describe(&self) -> &'static str {
        match self {
            VhdDisk::Fixed(_) => "Microsoft VHD (Fixed)",
            VhdDisk::Dynamic(disk) => match disk.footer().disk_type {
                DiskType::Differencing => "Microsoft VHD (Differencing)",
                _ => "Microsoft VHD (Dynamic)",
            },
        }
    }
}

impl<S: ByteStore> BlockDevice for VhdDisk<S> {
    fn length(&self) -> u64 {
        match self {
            VhdDisk::Fixed(disk) => disk.length(),
            VhdDisk::Dynamic(disk) => disk.length(),
        }
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            VhdDisk::Fixed(disk) => disk.read_at(pos, buf),
            VhdDisk::Dynamic(disk) => disk.read_at(pos, buf),
        }
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        match self {
            VhdDisk::Fixed(disk) => disk.write_at(pos, buf),
            VhdDisk::Dynamic(disk) => disk.write_at(pos, buf),
        }
    }

    fn extents(&mut self, range: Range<u64>) -> Result<Vec<Extent>> {
        match self {
            VhdDisk::Fixed(disk) => disk.extents(range),
            VhdDisk::Dynamic(disk) => disk.extents(range),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            VhdDisk::Fixed(disk) => disk.flush(),
            VhdDisk::Dynamic(disk) => disk.flush(),
        }
    }
}
