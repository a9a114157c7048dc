// file: src/iso/path_table.rs
// version: 1.0.0
// guid: 9ec475f4-ca11-4d2a-844e-6115e5991a02

//! Path tables (ECMA-119 9.4)
//!
//! Path tables list every directory breadth-first. The L table is recorded
//! little-endian, the M table big-endian; both are rebuilt on every write.

use super::bytes::{u16_le, u32_le};
use crate::error::{AutoInstallError, Result};

/// Path table record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PathTableRecord {
    pub extent: u32,
    /// 1-based number of the parent directory record
    pub parent: u16,
    pub identifier: Vec<u8>,
}

/// Path table type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathTableType {
    /// Little-endian (Type L)
    LittleEndian,
    /// Big-endian (Type M)
    BigEndian,
}

impl PathTableRecord {
    fn encoded_len(&self) -> usize {
        8 + self.identifier.len() + self.identifier.len() % 2
    }
}

/// Parse a Type L path table
pub(crate) fn parse_l(data: &[u8]) -> Result<Vec<PathTableRecord>> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let id_len = data[pos] as usize;
        if id_len == 0 {
            return Err(AutoInstallError::layout(format!(
                "path table record at byte {} has an empty identifier",
                pos
            )));
        }
        let id_end = pos + 8 + id_len;
        if id_end > data.len() {
            return Err(AutoInstallError::layout("path table record overruns the table"));
        }
        records.push(PathTableRecord {
            extent: u32_le(data, pos + 2)?,
            parent: u16_le(data, pos + 6)?,
            identifier: data[pos + 8..id_end].to_vec(),
        });
        pos = id_end + id_len % 2;
    }
    Ok(records)
}

/// Encode a path table of the given type
pub(crate) fn encode(records: &[PathTableRecord], kind: PathTableType) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.iter().map(PathTableRecord::encoded_len).sum());
    for record in records {
        out.push(record.identifier.len() as u8);
        out.push(0);
        match kind {
            PathTableType::LittleEndian => {
                out.extend_from_slice(&record.extent.to_le_bytes());
                out.extend_from_slice(&record.parent.to_le_bytes());
            }
            PathTableType::BigEndian => {
                out.extend_from_slice(&record.extent.to_be_bytes());
                out.extend_from_slice(&record.parent.to_be_bytes());
            }
        }
        out.extend_from_slice(&record.identifier);
        if record.identifier.len() % 2 == 1 {
            out.push(0);
        }
    }
    out
}
