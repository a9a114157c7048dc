// file: src/iso/mod.rs
// version: 1.0.0
// guid: 59279bfa-7777-46c7-9e05-eab1ff7814e4

//! ISO9660 + El Torito image handling
//!
//! The layer is split the way the on-disk format is:
//! 1. **Volume layer** - descriptor set starting at sector 16
//! 2. **Directory layer** - directory records, path tables, Rock Ridge names
//! 3. **Boot layer** - El Torito boot catalog, boot info tables, isohybrid MBR
//! 4. **Image layer** - staged edits over a loaded image and full re-serialization
//!
//! Edits never patch the source in place. [`IsoImage`] keeps the decoded tree,
//! stages replacements/additions in memory and lays the whole image out again
//! on [`IsoImage::write`].

pub(crate) mod bytes;
pub(crate) mod descriptor;
pub(crate) mod directory;
pub(crate) mod eltorito;
#[cfg(any(test, feature = "test-fixtures"))]
#[doc(hidden)]
pub mod fixture;
pub mod image;
pub(crate) mod path_table;
pub(crate) mod rock_ridge;
pub(crate) mod writer;

pub use image::{BootCatalogEntry, Extent, ImageSource, IsoImage};

use serde::{Deserialize, Serialize};
use std::fmt;

/// ISO9660 logical block size. Only 2048-byte blocks are supported.
pub const BLOCK_SIZE: usize = 2048;

/// Logical blocks 0..16 form the system area.
pub const SYSTEM_AREA_BLOCKS: u32 = 16;

/// Firmware family an El Torito boot entry targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformKind {
    /// Legacy BIOS (El Torito platform id 0x00, "MBR" boot)
    Bios,
    /// UEFI (El Torito platform id 0xEF)
    Uefi,
}

impl PlatformKind {
    /// El Torito platform id for this kind
    pub fn platform_id(&self) -> u8 {
        match self {
            PlatformKind::Bios => eltorito::PLATFORM_X86,
            PlatformKind::Uefi => eltorito::PLATFORM_EFI,
        }
    }

    /// Map an El Torito platform id back to a kind
    pub fn from_platform_id(id: u8) -> Option<Self> {
        match id {
            eltorito::PLATFORM_X86 => Some(PlatformKind::Bios),
            eltorito::PLATFORM_EFI => Some(PlatformKind::Uefi),
            _ => None,
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformKind::Bios => write!(f, "BIOS"),
            PlatformKind::Uefi => write!(f, "UEFI"),
        }
    }
}

/// Number of logical blocks needed to hold `len` bytes
pub fn blocks_for(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE as u64)
}
