//! Stream adapters between byte stores and block devices
//!
//! - [`MemStore`]: a growable in-memory [`vdisk_core::ByteStore`]
//! - [`Window`]: a sub-range view over a store
//! - [`Overlay`]: a copy-on-write page overlay for read-only stores
//! - [`SectorAligned`]: read-modify-write adapter over an aligned-only device

pub mod align;
pub mod mem;
pub mod overlay;
pub mod window;

pub use align::SectorAligned;
pub use mem::MemStore;
pub use overlay::Overlay;
pub use window::Window;
