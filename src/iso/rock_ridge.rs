// file: src/iso/rock_ridge.rs
// version: 1.0.0
// guid: 7e9b50db-86f7-40a4-864d-b9b58b6c0caa

//! Just enough SUSP / Rock Ridge to keep POSIX names intact
//!
//! Installer images carry their real (long, lowercase) file names in Rock
//! Ridge `NM` entries. The System Use areas are copied verbatim on rewrite;
//! only `CE` continuation pointers need relocating.

use super::bytes::{put_both_u32, u32_le};

const SIGNATURE_CE: [u8; 2] = *b"CE";
const SIGNATURE_NM: [u8; 2] = *b"NM";
const SIGNATURE_SP: [u8; 2] = *b"SP";
const SIGNATURE_ST: [u8; 2] = *b"ST";

const NM_CONTINUE: u8 = 0x01;
const NM_CURRENT: u8 = 0x02;
const NM_PARENT: u8 = 0x04;

pub(crate) const CE_ENTRY_LEN: usize = 28;

/// One SUSP entry inside a System Use area
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuspEntry<'a> {
    pub offset: usize,
    pub signature: [u8; 2],
    pub bytes: &'a [u8],
}

/// Iterator over the entries of a System Use area
pub(crate) struct Entries<'a> {
    area: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Entries<'a> {
    type Item = SuspEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.area.get(self.pos..)?;
        if rest.len() < 4 {
            return None;
        }
        let len = rest[2] as usize;
        if len < 4 || len > rest.len() {
            return None;
        }
        let signature = [rest[0], rest[1]];
        if signature == SIGNATURE_ST {
            return None;
        }
        let entry = SuspEntry {
            offset: self.pos,
            signature,
            bytes: &rest[..len],
        };
        self.pos += len;
        Some(entry)
    }
}

pub(crate) fn entries(area: &[u8]) -> Entries<'_> {
    Entries { area, pos: 0 }
}

/// Location of a continuation area referenced by a `CE` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContinuationRef {
    /// Offset of the `CE` entry inside its System Use area
    pub entry_offset: usize,
    pub block: u32,
    pub offset: u32,
    pub length: u32,
}

/// Find the `CE` entry of a System Use area, if any
pub(crate) fn find_continuation(area: &[u8]) -> Option<ContinuationRef> {
    entries(area)
        .find(|e| e.signature == SIGNATURE_CE && e.bytes.len() >= CE_ENTRY_LEN)
        .and_then(|e| {
            Some(ContinuationRef {
                entry_offset: e.offset,
                block: u32_le(e.bytes, 4).ok()?,
                offset: u32_le(e.bytes, 12).ok()?,
                length: u32_le(e.bytes, 20).ok()?,
            })
        })
}

/// Point the `CE` entry at `entry_offset` to a new continuation location
pub(crate) fn patch_continuation(area: &mut [u8], entry_offset: usize, block: u32, offset: u32, length: u32) {
    let entry = &mut area[entry_offset..entry_offset + CE_ENTRY_LEN];
    put_both_u32(entry, 4, block);
    put_both_u32(entry, 12, offset);
    put_both_u32(entry, 20, length);
}

/// Whether a System Use area opens with the SUSP `SP` indicator
pub(crate) fn has_sp(area: &[u8]) -> bool {
    entries(area)
        .next()
        .map(|e| e.signature == SIGNATURE_SP && e.bytes.len() >= 7 && e.bytes[4..6] == [0xBE, 0xEF])
        .unwrap_or(false)
}

/// Alternate name from `NM` entries across the given areas
pub(crate) fn alternate_name<'a>(areas: impl IntoIterator<Item = &'a [u8]>) -> Option<String> {
    let mut name = Vec::new();
    let mut found = false;
    for area in areas {
        for entry in entries(area).filter(|e| e.signature == SIGNATURE_NM) {
            let Some(&flags) = entry.bytes.get(4) else {
                continue;
            };
            if flags & (NM_CURRENT | NM_PARENT) != 0 {
                return None;
            }
            found = true;
            name.extend_from_slice(&entry.bytes[5..]);
            if flags & NM_CONTINUE == 0 {
                return Some(String::from_utf8_lossy(&name).into_owned());
            }
        }
    }
    found.then(|| String::from_utf8_lossy(&name).into_owned())
}

/// `PX` entry (RRIP 1.10 layout, 36 bytes)
pub(crate) fn px_entry(is_dir: bool) -> Vec<u8> {
    let mut entry = vec![0u8; 36];
    entry[..4].copy_from_slice(&[b'P', b'X', 36, 1]);
    let (mode, links) = if is_dir { (0o040555, 2) } else { (0o100444, 1) };
    put_both_u32(&mut entry, 4, mode);
    put_both_u32(&mut entry, 12, links);
    entry
}

/// `NM` entry carrying the whole name
pub(crate) fn nm_entry(name: &str) -> Vec<u8> {
    let name = &name.as_bytes()[..name.len().min(250)];
    let mut entry = vec![b'N', b'M', (5 + name.len()) as u8, 1, 0];
    entry.extend_from_slice(name);
    entry
}

/// System Use area for a new entry on a Rock Ridge image
pub(crate) fn synthesize(name: &str, is_dir: bool) -> Vec<u8> {
    let mut area = px_entry(is_dir);
    area.extend(nm_entry(name));
    area
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ce_entry(block: u32, offset: u32, length: u32) -> Vec<u8> {
        let mut entry = vec![0u8; CE_ENTRY_LEN];
        entry[..4].copy_from_slice(&[b'C', b'E', CE_ENTRY_LEN as u8, 1]);
        put_both_u32(&mut entry, 4, block);
        put_both_u32(&mut entry, 12, offset);
        put_both_u32(&mut entry, 20, length);
        entry
    }

    #[test]
    fn test_alternate_name_from_synthesized_area() {
        let area = synthesize("user-data", false);
        assert_eq!(alternate_name([area.as_slice()]), Some("user-data".to_string()));
    }

    #[test]
    fn test_name_continues_into_second_area() {
        let mut first = vec![b'N', b'M', 9, 1, NM_CONTINUE];
        first.extend_from_slice(b"live");
        let second = nm_entry("-server.iso");
        assert_eq!(
            alternate_name([first.as_slice(), second.as_slice()]),
            Some("live-server.iso".to_string())
        );
    }

    #[test]
    fn test_find_and_patch_continuation() {
        let mut area = px_entry(true);
        area.extend(ce_entry(100, 64, 237));
        let found = find_continuation(&area).unwrap();
        assert_eq!(found.entry_offset, 36);
        assert_eq!((found.block, found.offset, found.length), (100, 64, 237));

        patch_continuation(&mut area, found.entry_offset, 7, 0, 237);
        let patched = find_continuation(&area).unwrap();
        assert_eq!((patched.block, patched.offset), (7, 0));
    }

    #[test]
    fn test_sp_detection() {
        let sp = [b'S', b'P', 7, 1, 0xBE, 0xEF, 0];
        assert!(has_sp(&sp));
        assert!(!has_sp(&px_entry(true)));
        assert!(!has_sp(&[]));
    }

    #[test]
    fn test_trailing_padding_is_ignored() {
        let mut area = nm_entry("md5sum.txt");
        area.push(0);
        assert_eq!(entries(&area).count(), 1);
    }
}
