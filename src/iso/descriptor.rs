// file: src/iso/descriptor.rs
// version: 1.0.0
// guid: fa1ca1b7-7ec4-4aec-bf70-fe2216240d83

//! Volume descriptor set parsing and rebuilding (ECMA-119 8)
//!
//! The primary volume descriptor is kept as its original 2048 bytes so that
//! identifiers and timestamps survive a rewrite untouched; only the layout
//! fields are patched when the image is serialized.

use super::bytes::{put_both_u16, put_both_u32, put_u32_be, put_u32_le, u16_le, u32_le};
use super::directory::RawRecord;
use super::BLOCK_SIZE;
use crate::error::{AutoInstallError, Result};
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, warn};

/// Volume descriptor set starts at sector 16
pub(crate) const DESCRIPTOR_START: u32 = 16;

/// Standard identifier carried by every descriptor
pub(crate) const STANDARD_ID: &[u8; 5] = b"CD001";

/// Boot system identifier of an El Torito boot record
pub(crate) const EL_TORITO_ID: &[u8] = b"EL TORITO SPECIFICATION";

/// Give up looking for the terminator after this many descriptors
const MAX_DESCRIPTORS: u32 = 64;

const OFFSET_VOLUME_ID: usize = 40;
const OFFSET_VOLUME_SPACE_SIZE: usize = 80;
const OFFSET_LOGICAL_BLOCK_SIZE: usize = 128;
const OFFSET_PATH_TABLE_SIZE: usize = 132;
const OFFSET_L_PATH_TABLE: usize = 140;
const OFFSET_OPT_L_PATH_TABLE: usize = 144;
const OFFSET_M_PATH_TABLE: usize = 148;
const OFFSET_OPT_M_PATH_TABLE: usize = 152;
const OFFSET_ROOT_RECORD: usize = 156;
const ROOT_RECORD_LEN: usize = 34;
const OFFSET_CATALOG_POINTER: usize = 71;

/// Volume descriptor type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptorType {
    BootRecord,
    Primary,
    Supplementary,
    Partition,
    Terminator,
    Other(u8),
}

impl From<u8> for DescriptorType {
    fn from(code: u8) -> Self {
        match code {
            0 => DescriptorType::BootRecord,
            1 => DescriptorType::Primary,
            2 => DescriptorType::Supplementary,
            3 => DescriptorType::Partition,
            255 => DescriptorType::Terminator,
            other => DescriptorType::Other(other),
        }
    }
}

/// Primary volume descriptor
#[derive(Debug, Clone)]
pub(crate) struct PrimaryVolume {
    raw: Vec<u8>,
    pub volume_space_size: u32,
    pub path_table_size: u32,
    pub l_path_table: u32,
    pub root: RawRecord,
}

/// Layout fields written back into the primary descriptor
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrimaryLayout {
    pub volume_space_size: u32,
    pub path_table_size: u32,
    pub l_path_table: u32,
    pub m_path_table: u32,
    pub root_extent: u32,
    pub root_size: u32,
}

impl PrimaryVolume {
    /// Parse a primary descriptor sector
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() != BLOCK_SIZE {
            return Err(AutoInstallError::layout("short primary volume descriptor"));
        }

        let block_size = u16_le(sector, OFFSET_LOGICAL_BLOCK_SIZE)?;
        if block_size as usize != BLOCK_SIZE {
            return Err(AutoInstallError::layout(format!(
                "logical block size {} is not supported (expected {})",
                block_size, BLOCK_SIZE
            )));
        }

        let root = RawRecord::parse(&sector[OFFSET_ROOT_RECORD..OFFSET_ROOT_RECORD + ROOT_RECORD_LEN])?;
        if !root.is_directory() {
            return Err(AutoInstallError::layout(
                "root directory record is not flagged as a directory",
            ));
        }

        Ok(Self {
            volume_space_size: u32_le(sector, OFFSET_VOLUME_SPACE_SIZE)?,
            path_table_size: u32_le(sector, OFFSET_PATH_TABLE_SIZE)?,
            l_path_table: u32_le(sector, OFFSET_L_PATH_TABLE)?,
            root,
            raw: sector.to_vec(),
        })
    }

    /// Blank descriptor carrying only the fixed header fields
    #[cfg(any(test, feature = "test-fixtures"))]
    pub fn blank(volume_id: &str) -> Self {
        let mut raw = vec![0u8; BLOCK_SIZE];
        raw[0] = 1;
        raw[1..6].copy_from_slice(STANDARD_ID);
        raw[6] = 1;
        raw[8..72].fill(b' ');
        let id = volume_id.as_bytes();
        let len = id.len().min(32);
        raw[OFFSET_VOLUME_ID..OFFSET_VOLUME_ID + len].copy_from_slice(&id[..len]);
        put_both_u16(&mut raw, 120, 1);
        put_both_u16(&mut raw, 124, 1);
        put_both_u16(&mut raw, OFFSET_LOGICAL_BLOCK_SIZE, BLOCK_SIZE as u16);
        raw[190..813].fill(b' ');
        // Unspecified dates are sixteen ASCII zeros and a zero offset
        for date in [813usize, 830, 847, 864] {
            raw[date..date + 16].fill(b'0');
        }
        raw[881] = 1;

        Self {
            raw,
            volume_space_size: 0,
            path_table_size: 0,
            l_path_table: 0,
            root: RawRecord::root_placeholder(),
        }
    }

    /// Volume identifier with padding removed
    pub fn volume_id(&self) -> String {
        String::from_utf8_lossy(&self.raw[OFFSET_VOLUME_ID..OFFSET_VOLUME_ID + 32])
            .trim_end_matches([' ', '\0'])
            .to_string()
    }

    /// Serialize the descriptor with a new layout
    pub fn encode(&self, layout: &PrimaryLayout) -> Vec<u8> {
        let mut out = self.raw.clone();
        put_both_u32(&mut out, OFFSET_VOLUME_SPACE_SIZE, layout.volume_space_size);
        put_both_u16(&mut out, OFFSET_LOGICAL_BLOCK_SIZE, BLOCK_SIZE as u16);
        put_both_u32(&mut out, OFFSET_PATH_TABLE_SIZE, layout.path_table_size);
        put_u32_le(&mut out, OFFSET_L_PATH_TABLE, layout.l_path_table);
        put_u32_le(&mut out, OFFSET_OPT_L_PATH_TABLE, 0);
        put_u32_be(&mut out, OFFSET_M_PATH_TABLE, layout.m_path_table);
        put_u32_be(&mut out, OFFSET_OPT_M_PATH_TABLE, 0);

        let mut root = self.root.clone();
        root.extent = layout.root_extent;
        root.data_len = layout.root_size;
        root.system_use.clear();
        let mut record = Vec::with_capacity(ROOT_RECORD_LEN);
        root.encode(&mut record);
        out[OFFSET_ROOT_RECORD..OFFSET_ROOT_RECORD + ROOT_RECORD_LEN].copy_from_slice(&record);
        out
    }

    /// Recording date used for entries the image did not have before
    pub fn root_recorded(&self) -> [u8; 7] {
        self.root.recorded
    }
}

/// El Torito boot record volume descriptor
#[derive(Debug, Clone)]
pub(crate) struct BootRecord {
    raw: Vec<u8>,
    pub catalog_lba: u32,
}

impl BootRecord {
    /// Parse a boot record sector; `None` if it is not an El Torito record
    pub fn parse(sector: &[u8]) -> Result<Option<Self>> {
        if !sector[7..].starts_with(EL_TORITO_ID) {
            return Ok(None);
        }
        Ok(Some(Self {
            catalog_lba: u32_le(sector, OFFSET_CATALOG_POINTER)?,
            raw: sector.to_vec(),
        }))
    }

    /// Fresh El Torito boot record pointing at `catalog_lba`
    #[cfg(any(test, feature = "test-fixtures"))]
    pub fn new(catalog_lba: u32) -> Self {
        let mut raw = vec![0u8; BLOCK_SIZE];
        raw[0] = 0;
        raw[1..6].copy_from_slice(STANDARD_ID);
        raw[6] = 1;
        raw[7..7 + EL_TORITO_ID.len()].copy_from_slice(EL_TORITO_ID);
        put_u32_le(&mut raw, OFFSET_CATALOG_POINTER, catalog_lba);
        Self { raw, catalog_lba }
    }

    pub fn encode(&self, catalog_lba: u32) -> Vec<u8> {
        let mut out = self.raw.clone();
        put_u32_le(&mut out, OFFSET_CATALOG_POINTER, catalog_lba);
        out
    }
}

/// Volume descriptor set terminator
pub(crate) fn terminator() -> Vec<u8> {
    let mut raw = vec![0u8; BLOCK_SIZE];
    raw[0] = 255;
    raw[1..6].copy_from_slice(STANDARD_ID);
    raw[6] = 1;
    raw
}

/// Descriptors recovered from an image
#[derive(Debug)]
pub(crate) struct DescriptorSet {
    pub primary: PrimaryVolume,
    pub boot_record: Option<BootRecord>,
    /// Supplementary/partition descriptors that are not carried over
    pub dropped: usize,
}

/// Read the descriptor set starting at sector 16
pub(crate) fn read_descriptor_set<R: Read + Seek + ?Sized>(source: &mut R) -> Result<DescriptorSet> {
    let mut primary = None;
    let mut primaries = 0usize;
    let mut boot_record = None;
    let mut dropped = 0usize;
    let mut sector = vec![0u8; BLOCK_SIZE];

    for index in 0..MAX_DESCRIPTORS {
        let lba = DESCRIPTOR_START + index;
        source.seek(SeekFrom::Start(lba as u64 * BLOCK_SIZE as u64))?;
        source.read_exact(&mut sector).map_err(|e| {
            AutoInstallError::layout(format!("cannot read volume descriptor at sector {}: {}", lba, e))
        })?;

        if &sector[1..6] != STANDARD_ID {
            return Err(AutoInstallError::layout(format!(
                "sector {} does not carry the CD001 identifier",
                lba
            )));
        }

        match DescriptorType::from(sector[0]) {
            DescriptorType::Primary => {
                primaries += 1;
                primary = Some(PrimaryVolume::parse(&sector)?);
            }
            DescriptorType::BootRecord => {
                if let Some(record) = BootRecord::parse(&sector)? {
                    debug!("El Torito boot record at sector {}", lba);
                    boot_record = Some(record);
                }
            }
            DescriptorType::Supplementary | DescriptorType::Partition => {
                debug!("Descriptor type {} at sector {} will be dropped", sector[0], lba);
                dropped += 1;
            }
            DescriptorType::Terminator => {
                if primaries > 1 {
                    return Err(AutoInstallError::layout(format!(
                        "found {} primary volume descriptors",
                        primaries
                    )));
                }
                let primary = primary
                    .ok_or_else(|| AutoInstallError::layout("no primary volume descriptor"))?;
                return Ok(DescriptorSet {
                    primary,
                    boot_record,
                    dropped,
                });
            }
            DescriptorType::Other(code) => {
                warn!("Ignoring unknown volume descriptor type {} at sector {}", code, lba);
            }
        }
    }

    Err(AutoInstallError::layout(
        "volume descriptor set terminator not found",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image_with(descriptors: &[Vec<u8>]) -> Cursor<Vec<u8>> {
        let mut data = vec![0u8; DESCRIPTOR_START as usize * BLOCK_SIZE];
        for d in descriptors {
            data.extend_from_slice(d);
        }
        Cursor::new(data)
    }

    fn primary_sector() -> Vec<u8> {
        let pvd = PrimaryVolume::blank("TEST_VOLUME");
        pvd.encode(&PrimaryLayout {
            volume_space_size: 30,
            path_table_size: 10,
            l_path_table: 19,
            m_path_table: 20,
            root_extent: 21,
            root_size: 2048,
        })
    }

    #[test]
    fn test_primary_roundtrip_fields() {
        let sector = primary_sector();
        let pvd = PrimaryVolume::parse(&sector).unwrap();
        assert_eq!(pvd.volume_space_size, 30);
        assert_eq!(pvd.path_table_size, 10);
        assert_eq!(pvd.l_path_table, 19);
        assert_eq!(pvd.root.extent, 21);
        assert_eq!(pvd.volume_id(), "TEST_VOLUME");
    }

    #[test]
    fn test_read_set_finds_boot_record() {
        let mut src = image_with(&[primary_sector(), BootRecord::new(25).encode(25), terminator()]);
        let set = read_descriptor_set(&mut src).unwrap();
        assert_eq!(set.boot_record.unwrap().catalog_lba, 25);
        assert_eq!(set.dropped, 0);
    }

    #[test]
    fn test_two_primaries_rejected() {
        let mut src = image_with(&[primary_sector(), primary_sector(), terminator()]);
        let err = read_descriptor_set(&mut src).unwrap_err();
        assert!(err.to_string().contains("2 primary"));
    }

    #[test]
    fn test_block_size_must_be_2048() {
        let mut sector = primary_sector();
        put_both_u16(&mut sector, OFFSET_LOGICAL_BLOCK_SIZE, 512);
        assert!(PrimaryVolume::parse(&sector).is_err());
    }

    #[test]
    fn test_missing_terminator() {
        let mut src = image_with(&[primary_sector()]);
        assert!(read_descriptor_set(&mut src).is_err());
    }
}
