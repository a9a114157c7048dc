// file: src/iso/eltorito.rs
// version: 1.0.0
// guid: 9c3e94da-f5f5-4334-8e8d-970a3163554e

//! El Torito boot catalog
//!
//! The catalog starts with a validation entry followed by the initial/default
//! entry, then optional section headers each followed by their section entries.
//! Entries are kept as their raw 32 bytes; only the boot indicator, sector
//! count and load RBA are ever rewritten.

use super::bytes::{put_u16_le, put_u32_le, u16_le, u32_le};
use super::BLOCK_SIZE;
use crate::error::{AutoInstallError, Result};
use tracing::debug;

/// Catalog entry size
pub(crate) const ENTRY_SIZE: usize = 32;

pub(crate) const PLATFORM_X86: u8 = 0x00;
pub(crate) const PLATFORM_EFI: u8 = 0xEF;

const HEADER_VALIDATION: u8 = 0x01;
const HEADER_MORE: u8 = 0x90;
const HEADER_FINAL: u8 = 0x91;
const EXTENSION_INDICATOR: u8 = 0x44;
const KEY_BYTES: [u8; 2] = [0x55, 0xAA];

pub(crate) const BOOTABLE: u8 = 0x88;
pub(crate) const NOT_BOOTABLE: u8 = 0x00;

/// Media type bit announcing a following extension entry
const MEDIA_EXTENSION_FOLLOWS: u8 = 0x20;
const EXTENSION_MORE_FOLLOWS: u8 = 0x20;

/// Default or section boot entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BootEntry {
    raw: [u8; ENTRY_SIZE],
    /// Platform id inherited from the validation entry or the section header
    pub platform_id: u8,
    pub is_default: bool,
}

impl BootEntry {
    fn new(raw: &[u8], platform_id: u8, is_default: bool) -> Self {
        let mut entry = [0u8; ENTRY_SIZE];
        entry.copy_from_slice(raw);
        Self {
            raw: entry,
            platform_id,
            is_default,
        }
    }

    /// Fresh bootable no-emulation entry
    #[cfg(any(test, feature = "test-fixtures"))]
    pub fn no_emulation(platform_id: u8, is_default: bool, load_rba: u32, sector_count: u16) -> Self {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = BOOTABLE;
        put_u16_le(&mut raw, 6, sector_count);
        put_u32_le(&mut raw, 8, load_rba);
        Self {
            raw,
            platform_id,
            is_default,
        }
    }

    pub fn is_bootable(&self) -> bool {
        self.raw[0] == BOOTABLE
    }

    pub fn set_bootable(&mut self, bootable: bool) {
        self.raw[0] = if bootable { BOOTABLE } else { NOT_BOOTABLE };
    }

    /// Boot media type (low nibble of byte 1); 0 is no emulation
    pub fn media_type(&self) -> u8 {
        self.raw[1] & 0x0F
    }

    /// Virtual 512-byte sectors loaded by the firmware
    pub fn sector_count(&self) -> u16 {
        u16::from_le_bytes([self.raw[6], self.raw[7]])
    }

    pub fn set_sector_count(&mut self, count: u16) {
        put_u16_le(&mut self.raw, 6, count);
    }

    /// Logical block holding the boot image
    pub fn load_rba(&self) -> u32 {
        u32::from_le_bytes([self.raw[8], self.raw[9], self.raw[10], self.raw[11]])
    }

    pub fn set_load_rba(&mut self, lba: u32) {
        put_u32_le(&mut self.raw, 8, lba);
    }

    fn extension_follows(&self) -> bool {
        !self.is_default && self.raw[1] & MEDIA_EXTENSION_FOLLOWS != 0
    }
}

/// Everything after the validation entry, in catalog order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CatalogRecord {
    Entry(BootEntry),
    SectionHeader([u8; ENTRY_SIZE]),
    Extension([u8; ENTRY_SIZE]),
}

/// Parsed El Torito boot catalog
#[derive(Debug, Clone)]
pub(crate) struct BootCatalog {
    validation: [u8; ENTRY_SIZE],
    pub records: Vec<CatalogRecord>,
}

fn raw_entry(data: &[u8], index: usize) -> Result<[u8; ENTRY_SIZE]> {
    data.get(index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| AutoInstallError::layout("boot catalog is truncated"))
}

/// Sum of the little-endian 16-bit words of an entry
pub(crate) fn word_sum(entry: &[u8]) -> u16 {
    entry
        .chunks_exact(2)
        .map(|w| u16::from_le_bytes([w[0], w[1]]))
        .fold(0u16, |sum, w| sum.wrapping_add(w))
}

impl BootCatalog {
    /// Parse a catalog sector
    pub fn parse(data: &[u8]) -> Result<Self> {
        let validation = raw_entry(data, 0)?;
        if validation[0] != HEADER_VALIDATION || validation[30..32] != KEY_BYTES {
            return Err(AutoInstallError::layout("boot catalog validation entry is malformed"));
        }
        if word_sum(&validation) != 0 {
            return Err(AutoInstallError::layout("boot catalog validation checksum failed"));
        }

        let platform = validation[1];
        let mut records = vec![CatalogRecord::Entry(BootEntry::new(&raw_entry(data, 1)?, platform, true))];
        let max_entries = data.len().min(BLOCK_SIZE) / ENTRY_SIZE;
        let mut index = 2;

        while index < max_entries {
            let header = raw_entry(data, index)?;
            if header[0] != HEADER_MORE && header[0] != HEADER_FINAL {
                break;
            }
            let section_platform = header[1];
            let count = u16_le(&header, 2)? as usize;
            records.push(CatalogRecord::SectionHeader(header));
            index += 1;

            for _ in 0..count {
                let entry = BootEntry::new(&raw_entry(data, index)?, section_platform, false);
                index += 1;
                let mut more = entry.extension_follows();
                records.push(CatalogRecord::Entry(entry));
                while more {
                    let ext = raw_entry(data, index)?;
                    if ext[0] != EXTENSION_INDICATOR {
                        return Err(AutoInstallError::layout(
                            "boot catalog section extension entry is malformed",
                        ));
                    }
                    more = ext[1] & EXTENSION_MORE_FOLLOWS != 0;
                    records.push(CatalogRecord::Extension(ext));
                    index += 1;
                }
            }

            if header[0] == HEADER_FINAL {
                break;
            }
        }

        debug!("Parsed boot catalog with {} records", records.len() + 1);
        Ok(Self { validation, records })
    }

    /// Build a catalog from scratch: validation entry, default entry and
    /// one section per additional entry
    #[cfg(any(test, feature = "test-fixtures"))]
    pub fn new(id_string: &str, default: BootEntry, sections: Vec<BootEntry>) -> Self {
        let mut validation = [0u8; ENTRY_SIZE];
        validation[0] = HEADER_VALIDATION;
        validation[1] = default.platform_id;
        let id = id_string.as_bytes();
        let len = id.len().min(24);
        validation[4..4 + len].copy_from_slice(&id[..len]);
        validation[30..32].copy_from_slice(&KEY_BYTES);

        let mut records = vec![CatalogRecord::Entry(default)];
        let total = sections.len();
        for (i, entry) in sections.into_iter().enumerate() {
            let mut header = [0u8; ENTRY_SIZE];
            header[0] = if i + 1 == total { HEADER_FINAL } else { HEADER_MORE };
            header[1] = entry.platform_id;
            put_u16_le(&mut header, 2, 1);
            records.push(CatalogRecord::SectionHeader(header));
            records.push(CatalogRecord::Entry(entry));
        }
        Self { validation, records }
    }

    pub fn entries(&self) -> impl Iterator<Item = &BootEntry> {
        self.records.iter().filter_map(|r| match r {
            CatalogRecord::Entry(e) => Some(e),
            _ => None,
        })
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut BootEntry> {
        self.records.iter_mut().filter_map(|r| match r {
            CatalogRecord::Entry(e) => Some(e),
            _ => None,
        })
    }

    /// Serialize into one catalog sector, recomputing the validation checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_SIZE);
        let mut validation = self.validation;
        put_u16_le(&mut validation, 28, 0);
        let checksum = 0u16.wrapping_sub(word_sum(&validation));
        put_u16_le(&mut validation, 28, checksum);
        out.extend_from_slice(&validation);

        for record in &self.records {
            match record {
                CatalogRecord::Entry(e) => out.extend_from_slice(&e.raw),
                CatalogRecord::SectionHeader(raw) | CatalogRecord::Extension(raw) => {
                    out.extend_from_slice(raw)
                }
            }
        }
        out.resize(BLOCK_SIZE.max(out.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE), 0);
        out
    }
}

/// Whether an encoded catalog satisfies the validation checksum rule
pub(crate) fn validation_checksum_ok(catalog: &[u8]) -> bool {
    catalog.len() >= ENTRY_SIZE && word_sum(&catalog[..ENTRY_SIZE]) == 0
}

/// Offset of the boot info table inside a no-emulation boot image
const BOOT_INFO_OFFSET: usize = 8;
/// Checksummed region of a boot image starts here
const BOOT_INFO_CHECKSUM_START: usize = 64;

/// Rewrite the boot info table of a relocated no-emulation boot image
///
/// The table is only touched when it provably describes this image at its
/// old location: PVD at `pvd_lba`, file at `old_lba` with the image's length.
pub(crate) fn patch_boot_info_table(image: &mut [u8], pvd_lba: u32, old_lba: u32, new_lba: u32) -> bool {
    if image.len() <= BOOT_INFO_CHECKSUM_START {
        return false;
    }
    let table = (
        u32_le(image, BOOT_INFO_OFFSET),
        u32_le(image, BOOT_INFO_OFFSET + 4),
        u32_le(image, BOOT_INFO_OFFSET + 8),
    );
    match table {
        (Ok(pvd), Ok(lba), Ok(len)) if pvd == pvd_lba && lba == old_lba && len as usize == image.len() => {}
        _ => return false,
    }

    let checksum = image[BOOT_INFO_CHECKSUM_START..]
        .chunks(4)
        .map(|c| {
            let mut word = [0u8; 4];
            word[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(word)
        })
        .fold(0u32, |sum, w| sum.wrapping_add(w));
    put_u32_le(image, BOOT_INFO_OFFSET + 4, new_lba);
    put_u32_le(image, BOOT_INFO_OFFSET + 12, checksum);
    true
}

/// MBR offset where isohybrid boot code keeps the boot image's 512-byte sector
const ISOHYBRID_POINTER: usize = 432;
const MBR_SIGNATURE: usize = 510;
const MBR_PARTITION_TABLE: usize = 446;
const GPT_PROTECTIVE: u8 = 0xEE;

const PARTITION_ENTRY: usize = 16;
const EFI_SYSTEM: u8 = 0xEF;
/// 512-byte MBR sectors per logical block
const MBR_SECTORS_PER_BLOCK: u32 = (BLOCK_SIZE / 512) as u32;

fn has_mbr(system_area: &[u8]) -> bool {
    system_area.len() >= 512 && system_area[MBR_SIGNATURE..MBR_SIGNATURE + 2] == KEY_BYTES
}

fn partition_entry(system_area: &mut [u8], index: usize) -> &mut [u8] {
    let start = MBR_PARTITION_TABLE + index * PARTITION_ENTRY;
    &mut system_area[start..start + PARTITION_ENTRY]
}

/// Move the isohybrid boot pointer from the BIOS image at `old_lba` to `new_lba`
///
/// Returns whether the system area carried an isohybrid MBR for `old_lba`.
pub(crate) fn refresh_isohybrid(system_area: &mut [u8], old_lba: u32, new_lba: u32) -> bool {
    if !has_mbr(system_area) {
        return false;
    }
    match u32_le(system_area, ISOHYBRID_POINTER) {
        Ok(pointer) if pointer == old_lba.wrapping_mul(MBR_SECTORS_PER_BLOCK) && old_lba != 0 => {}
        _ => return false,
    }
    put_u32_le(system_area, ISOHYBRID_POINTER, new_lba.wrapping_mul(MBR_SECTORS_PER_BLOCK));
    true
}

/// Point the MBR EFI system partition at the relocated EFI boot image
///
/// Only an `0xEF` entry that starts exactly at the image's old extent is moved.
pub(crate) fn relocate_efi_partition(system_area: &mut [u8], old_lba: u32, new_lba: u32, len: u64) -> bool {
    if !has_mbr(system_area) || old_lba == 0 {
        return false;
    }
    let old_start = old_lba.wrapping_mul(MBR_SECTORS_PER_BLOCK);
    let sectors = u32::try_from(len.div_ceil(512)).unwrap_or(u32::MAX);
    for index in 0..4 {
        let entry = partition_entry(system_area, index);
        if entry[4] != EFI_SYSTEM || u32_le(entry, 8).ok() != Some(old_start) {
            continue;
        }
        put_u32_le(entry, 8, new_lba.saturating_mul(MBR_SECTORS_PER_BLOCK));
        put_u32_le(entry, 12, sectors);
        return true;
    }
    false
}

/// Grow the partition that starts at sector 0 to the new volume size
pub(crate) fn resize_image_partition(system_area: &mut [u8], total_blocks: u32) -> bool {
    if !has_mbr(system_area) {
        return false;
    }
    let entry = partition_entry(system_area, 0);
    let in_use = entry.iter().any(|&b| b != 0);
    if !in_use || entry[4] == GPT_PROTECTIVE || u32_le(entry, 8).ok() != Some(0) {
        return false;
    }
    put_u32_le(entry, 12, total_blocks.saturating_mul(MBR_SECTORS_PER_BLOCK));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual_catalog() -> BootCatalog {
        BootCatalog::new(
            "TEST",
            BootEntry::no_emulation(PLATFORM_X86, true, 30, 4),
            vec![BootEntry::no_emulation(PLATFORM_EFI, false, 40, 16)],
        )
    }

    #[test]
    fn test_encode_parse_preserves_entries() {
        let encoded = dual_catalog().encode();
        assert_eq!(encoded.len(), BLOCK_SIZE);
        assert!(validation_checksum_ok(&encoded));

        let parsed = BootCatalog::parse(&encoded).unwrap();
        let entries: Vec<_> = parsed.entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].platform_id, PLATFORM_X86);
        assert!(entries[0].is_default);
        assert_eq!(entries[0].load_rba(), 30);
        assert_eq!(entries[1].platform_id, PLATFORM_EFI);
        assert_eq!(entries[1].sector_count(), 16);
    }

    #[test]
    fn test_checksum_holds_after_clearing_indicator() {
        let mut catalog = dual_catalog();
        for entry in catalog.entries_mut() {
            entry.set_bootable(false);
        }
        let encoded = catalog.encode();
        assert!(validation_checksum_ok(&encoded));
        assert_eq!(encoded[ENTRY_SIZE], NOT_BOOTABLE);
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let mut encoded = dual_catalog().encode();
        encoded[28] ^= 0xFF;
        assert!(BootCatalog::parse(&encoded).is_err());
    }

    #[test]
    fn test_boot_info_table_patch() {
        let mut image = vec![0xABu8; 4096];
        put_u32_le(&mut image, 8, 16);
        put_u32_le(&mut image, 12, 30);
        put_u32_le(&mut image, 16, 4096);
        assert!(patch_boot_info_table(&mut image, 16, 30, 77));
        assert_eq!(u32_le(&image, 12).unwrap(), 77);
        // Stale table (already moved) is left alone
        assert!(!patch_boot_info_table(&mut image, 16, 30, 99));
    }

    fn hybrid_area(first_type: u8) -> Vec<u8> {
        let mut area = vec![0u8; 16 * BLOCK_SIZE];
        put_u32_le(&mut area, ISOHYBRID_POINTER, 30 * 4);
        area[MBR_SIGNATURE] = 0x55;
        area[MBR_SIGNATURE + 1] = 0xAA;
        area[MBR_PARTITION_TABLE] = 0x80;
        area[MBR_PARTITION_TABLE + 4] = first_type;
        put_u32_le(&mut area, MBR_PARTITION_TABLE + 12, 100 * 4);
        area
    }

    #[test]
    fn test_isohybrid_refresh() {
        let mut area = hybrid_area(0x17);

        assert!(refresh_isohybrid(&mut area, 30, 50));
        assert!(resize_image_partition(&mut area, 200));
        assert_eq!(u32_le(&area, ISOHYBRID_POINTER).unwrap(), 200);
        assert_eq!(u32_le(&area, MBR_PARTITION_TABLE + 12).unwrap(), 800);
        // Pointer no longer matches the old image
        assert!(!refresh_isohybrid(&mut area, 30, 60));
    }

    #[test]
    fn test_empty_typed_image_partition_is_resized() {
        let mut area = hybrid_area(0x00);
        assert!(resize_image_partition(&mut area, 300));
        assert_eq!(u32_le(&area, MBR_PARTITION_TABLE + 12).unwrap(), 1200);
    }

    #[test]
    fn test_protective_or_unused_partition_untouched() {
        let mut area = hybrid_area(GPT_PROTECTIVE);
        assert!(!resize_image_partition(&mut area, 300));
        assert_eq!(u32_le(&area, MBR_PARTITION_TABLE + 12).unwrap(), 400);

        let mut area = hybrid_area(0x00);
        area[MBR_PARTITION_TABLE..MBR_PARTITION_TABLE + 16].fill(0);
        assert!(!resize_image_partition(&mut area, 300));
        assert_eq!(u32_le(&area, MBR_PARTITION_TABLE + 12).unwrap(), 0);
    }

    #[test]
    fn test_efi_partition_follows_efi_image() {
        // Arrange
        let mut area = hybrid_area(0x00);
        let second = MBR_PARTITION_TABLE + PARTITION_ENTRY;
        area[second + 4] = EFI_SYSTEM;
        put_u32_le(&mut area, second + 8, 25 * 4);
        put_u32_le(&mut area, second + 12, 16);

        // Act
        let moved = relocate_efi_partition(&mut area, 25, 40, 5000);

        // Assert
        assert!(moved);
        assert_eq!(u32_le(&area, second + 8).unwrap(), 160);
        assert_eq!(u32_le(&area, second + 12).unwrap(), 10);
        // A partition that does not start at the old extent is left alone
        assert!(!relocate_efi_partition(&mut area, 25, 70, 5000));
        assert_eq!(u32_le(&area, second + 8).unwrap(), 160);
    }
}
