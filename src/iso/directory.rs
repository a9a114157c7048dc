// file: src/iso/directory.rs
// version: 1.0.0
// guid: 4206128f-61a3-4cd6-8264-bf8d01fb51a7

//! Directory records (ECMA-119 9.1) and identifier handling

use super::bytes::{put_both_u16, put_both_u32, u32_le};
use super::BLOCK_SIZE;
use crate::error::{AutoInstallError, Result};
use std::cmp::Ordering;

/// Fixed part of a directory record, before the identifier
pub(crate) const RECORD_HEADER_LEN: usize = 33;

pub(crate) const FLAG_HIDDEN: u8 = 0x01;
pub(crate) const FLAG_DIRECTORY: u8 = 0x02;
pub(crate) const FLAG_MULTI_EXTENT: u8 = 0x80;

/// Identifier of the "." record
pub(crate) const SELF_IDENTIFIER: &[u8] = &[0x00];
/// Identifier of the ".." record
pub(crate) const PARENT_IDENTIFIER: &[u8] = &[0x01];

/// One directory record as it appears on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawRecord {
    pub extent: u32,
    pub data_len: u32,
    pub recorded: [u8; 7],
    pub flags: u8,
    pub identifier: Vec<u8>,
    pub system_use: Vec<u8>,
}

impl RawRecord {
    /// Parse one record from the start of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let len = *buf
            .first()
            .ok_or_else(|| AutoInstallError::layout("empty directory record"))? as usize;
        if len < RECORD_HEADER_LEN + 1 || len > buf.len() {
            return Err(AutoInstallError::layout(format!(
                "directory record length {} is invalid",
                len
            )));
        }
        let id_len = buf[32] as usize;
        if RECORD_HEADER_LEN + id_len > len {
            return Err(AutoInstallError::layout(
                "directory record identifier overruns the record",
            ));
        }
        let id_end = RECORD_HEADER_LEN + id_len;
        let su_start = id_end + usize::from(id_len % 2 == 0);
        let mut recorded = [0u8; 7];
        recorded.copy_from_slice(&buf[18..25]);

        Ok(Self {
            extent: u32_le(buf, 2)?,
            data_len: u32_le(buf, 10)?,
            recorded,
            flags: buf[25],
            identifier: buf[RECORD_HEADER_LEN..id_end].to_vec(),
            system_use: buf.get(su_start..len).map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    /// Record used as a stand-in until a real root is known
    pub fn root_placeholder() -> Self {
        Self {
            extent: 0,
            data_len: BLOCK_SIZE as u32,
            recorded: [0; 7],
            flags: FLAG_DIRECTORY,
            identifier: SELF_IDENTIFIER.to_vec(),
            system_use: Vec::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    pub fn is_self_or_parent(&self) -> bool {
        self.identifier == SELF_IDENTIFIER || self.identifier == PARENT_IDENTIFIER
    }

    /// On-disk length of this record
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.identifier.len(), self.system_use.len())
    }

    /// Append the record to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        let len = self.encoded_len();
        let start = out.len();
        out.resize(start + len, 0);
        let rec = &mut out[start..];
        rec[0] = len as u8;
        rec[1] = 0;
        put_both_u32(rec, 2, self.extent);
        put_both_u32(rec, 10, self.data_len);
        rec[18..25].copy_from_slice(&self.recorded);
        rec[25] = self.flags;
        rec[26] = 0;
        rec[27] = 0;
        put_both_u16(rec, 28, 1);
        rec[32] = self.identifier.len() as u8;
        let id_end = RECORD_HEADER_LEN + self.identifier.len();
        rec[RECORD_HEADER_LEN..id_end].copy_from_slice(&self.identifier);
        let su_start = id_end + usize::from(self.identifier.len() % 2 == 0);
        rec[su_start..su_start + self.system_use.len()].copy_from_slice(&self.system_use);
    }
}

/// On-disk length of a record with the given identifier and System Use lengths
pub(crate) fn encoded_len(identifier_len: usize, system_use_len: usize) -> usize {
    let mut len = RECORD_HEADER_LEN + identifier_len;
    if identifier_len % 2 == 0 {
        len += 1;
    }
    len += system_use_len;
    len + len % 2
}

/// Split a directory extent into its records
///
/// Records never cross a sector boundary; a zero length byte means the rest of
/// the sector is padding.
pub(crate) fn parse_extent(data: &[u8]) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let len = data[pos] as usize;
        if len == 0 {
            pos = (pos / BLOCK_SIZE + 1) * BLOCK_SIZE;
            continue;
        }
        let sector_end = (pos / BLOCK_SIZE + 1) * BLOCK_SIZE;
        if pos + len > sector_end.min(data.len()) {
            return Err(AutoInstallError::layout(format!(
                "directory record at byte {} crosses a sector boundary",
                pos
            )));
        }
        records.push(RawRecord::parse(&data[pos..pos + len])?);
        pos += len;
    }
    Ok(records)
}

/// Lay record lengths out into sectors; returns the byte size of the extent
pub(crate) fn packed_size(record_lengths: impl IntoIterator<Item = usize>) -> usize {
    let mut pos = 0usize;
    for len in record_lengths {
        let room = BLOCK_SIZE - pos % BLOCK_SIZE;
        if len > room {
            pos += room;
        }
        pos += len;
    }
    pos.div_ceil(BLOCK_SIZE).max(1) * BLOCK_SIZE
}

/// Append `record` to a directory extent under construction
pub(crate) fn push_packed(out: &mut Vec<u8>, record: &RawRecord) {
    let len = record.encoded_len();
    let room = BLOCK_SIZE - out.len() % BLOCK_SIZE;
    if len > room {
        out.resize(out.len() + room, 0);
    }
    record.encode(out);
}

/// User-facing name for an identifier: version and trailing dot removed, lowercased
pub(crate) fn display_name(identifier: &[u8]) -> String {
    let name = match identifier.iter().rposition(|&b| b == b';') {
        Some(pos) => &identifier[..pos],
        None => identifier,
    };
    let name = name.strip_suffix(b".").unwrap_or(name);
    String::from_utf8_lossy(name).to_lowercase()
}

/// ISO9660 identifier for a new entry
///
/// Characters outside the d-character set become underscores. Files carry
/// a `.` separator and a `;1` version.
pub(crate) fn make_identifier(name: &str, is_dir: bool) -> Vec<u8> {
    fn d_chars(part: &str, max: usize) -> String {
        part.chars()
            .map(|c| c.to_ascii_uppercase())
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .take(max)
            .collect()
    }

    if is_dir {
        return d_chars(name, 31).into_bytes();
    }
    let (base, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos + 1..]),
        _ => (name, ""),
    };
    let ext = d_chars(ext, 8);
    let base = d_chars(base, 30 - ext.len());
    format!("{}.{};1", base, ext).into_bytes()
}

/// Ordering of identifiers within a directory (ECMA-119 9.3)
///
/// Name and extension are compared separately, each padded with spaces;
/// higher versions sort first.
pub(crate) fn identifier_cmp(a: &[u8], b: &[u8]) -> Ordering {
    fn split(id: &[u8]) -> (&[u8], &[u8], u32) {
        let (body, version) = match id.iter().position(|&c| c == b';') {
            Some(pos) => {
                let version = std::str::from_utf8(&id[pos + 1..])
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                (&id[..pos], version)
            }
            None => (id, 0),
        };
        match body.iter().position(|&c| c == b'.') {
            Some(pos) => (&body[..pos], &body[pos + 1..], version),
            None => (body, &[][..], version),
        }
    }

    fn padded_cmp(a: &[u8], b: &[u8]) -> Ordering {
        let len = a.len().max(b.len());
        let pad = |s: &[u8], i: usize| s.get(i).copied().unwrap_or(b' ');
        (0..len)
            .map(|i| pad(a, i).cmp(&pad(b, i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    let (a_name, a_ext, a_ver) = split(a);
    let (b_name, b_ext, b_ver) = split(b);
    padded_cmp(a_name, b_name)
        .then_with(|| padded_cmp(a_ext, b_ext))
        .then_with(|| b_ver.cmp(&a_ver))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &[u8], su: &[u8]) -> RawRecord {
        RawRecord {
            extent: 42,
            data_len: 1234,
            recorded: [120, 1, 2, 3, 4, 5, 0],
            flags: 0,
            identifier: id.to_vec(),
            system_use: su.to_vec(),
        }
    }

    #[test]
    fn test_record_encode_parse() {
        let original = record(b"GRUB.CFG;1", b"NM\x0c\x01\x00grub.cfg");
        let mut buf = Vec::new();
        original.encode(&mut buf);
        assert_eq!(buf.len() % 2, 0);
        assert_eq!(buf[0] as usize, buf.len());
        let parsed = RawRecord::parse(&buf).unwrap();
        assert_eq!(parsed.extent, 42);
        assert_eq!(parsed.data_len, 1234);
        assert_eq!(parsed.identifier, b"GRUB.CFG;1");
        // Trailing pad byte becomes part of the System Use area on parse
        assert!(parsed.system_use.starts_with(b"NM\x0c\x01\x00grub.cfg"));
    }

    #[test]
    fn test_root_record_is_34_bytes() {
        assert_eq!(RawRecord::root_placeholder().encoded_len(), 34);
    }

    #[test]
    fn test_records_do_not_cross_sectors() {
        let rec = record(b"A_LONG_FILE_NAME_FOR_PADDING.TXT;1", &[0u8; 150]);
        let mut extent = Vec::new();
        for _ in 0..20 {
            push_packed(&mut extent, &rec);
        }
        let size = packed_size(std::iter::repeat(rec.encoded_len()).take(20));
        extent.resize(size, 0);
        let parsed = parse_extent(&extent).unwrap();
        assert_eq!(parsed.len(), 20);
        assert_eq!(size % BLOCK_SIZE, 0);
        assert!(size > BLOCK_SIZE);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(b"GRUB.CFG;1"), "grub.cfg");
        assert_eq!(display_name(b"VMLINUZ.;1"), "vmlinuz");
        assert_eq!(display_name(b"CASPER"), "casper");
    }

    #[test]
    fn test_make_identifier() {
        assert_eq!(make_identifier("user-data", false), b"USER_DATA.;1");
        assert_eq!(make_identifier("grub.cfg", false), b"GRUB.CFG;1");
        assert_eq!(make_identifier("nocloud", true), b"NOCLOUD");
    }

    #[test]
    fn test_identifier_ordering() {
        assert_eq!(identifier_cmp(b"A.B;1", b"A.C;1"), Ordering::Less);
        // "AB" vs "A" + "." ext: names compare first with space padding
        assert_eq!(identifier_cmp(b"A.Z;1", b"AB.A;1"), Ordering::Less);
        assert_eq!(identifier_cmp(b"X.Y;2", b"X.Y;1"), Ordering::Less);
        assert_eq!(identifier_cmp(b"BOOT", b"BOOT"), Ordering::Equal);
    }
}
