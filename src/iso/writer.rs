// file: src/iso/writer.rs
// version: 1.0.0
// guid: 7afbe45e-17ac-4624-838e-b5b9acc0caeb

//! Layout allocation and sector serialization
//!
//! Every write lays the whole image out again. Extents are allocated
//! sequentially in this order:
//!
//! | region                      | notes                                   |
//! |-----------------------------|-----------------------------------------|
//! | system area (blocks 0-15)   | copied, isohybrid MBR refreshed          |
//! | descriptors (16, 17, 18)    | primary, El Torito boot record, end      |
//! | L and M path tables         |                                         |
//! | boot catalog                | unless the catalog is a file in the tree |
//! | directories                 | path table order                        |
//! | System Use continuations    | Rock Ridge `CE` areas                    |
//! | files                       | directory order                         |
//! | hidden boot images          | boot images outside the tree            |

use super::descriptor::{terminator, PrimaryLayout, PrimaryVolume, BootRecord, DESCRIPTOR_START};
use super::directory::{self, push_packed, RawRecord, PARENT_IDENTIFIER, SELF_IDENTIFIER};
use super::eltorito::{self, BootCatalog, PLATFORM_EFI, PLATFORM_X86};
use super::image::{read_at, BootTarget, DirNode, EntryMeta, FileData, FileNode, ImageSource, Node};
use super::path_table::{self, PathTableRecord, PathTableType};
use super::rock_ridge;
use super::{blocks_for, BLOCK_SIZE};
use crate::error::{AutoInstallError, Result};
use crate::reporter::ProgressReporter;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const BLOCK: u64 = BLOCK_SIZE as u64;

/// Primary descriptor, boot record and terminator
const DESCRIPTOR_BLOCKS: u32 = 3;

/// Bytes read from the source per copy step
const COPY_CHUNK: usize = 32 * BLOCK_SIZE;

/// El Torito sector counts are in 512-byte units
const VIRTUAL_SECTOR: u64 = 512;

static ZEROES: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

pub(crate) const WRITE_TASK: &str = "Writing image";

/// Borrowed view of everything that ends up in the output
pub(crate) struct ImageParts<'a> {
    pub volume: &'a PrimaryVolume,
    pub boot_record: &'a BootRecord,
    pub system_area: &'a [u8],
    pub root: &'a DirNode,
    pub catalog: &'a BootCatalog,
    pub boot_targets: &'a [BootTarget],
}

struct DirPlan<'a> {
    node: &'a DirNode,
    /// Index of the parent in `Layout::dirs`; the root is its own parent
    parent: usize,
    lba: u32,
    size: u32,
}

struct FilePlan<'a> {
    node: &'a FileNode,
    lba: u32,
    len: u32,
    /// BIOS no-emulation image whose boot info table follows it
    patch_boot_info: bool,
}

struct Layout<'a> {
    dirs: Vec<DirPlan<'a>>,
    /// (directory, child slot) -> index in `dirs`
    child_dirs: HashMap<(usize, usize), usize>,
    files: Vec<FilePlan<'a>>,
    /// (directory, child slot) -> index in `files`
    child_files: HashMap<(usize, usize), usize>,
    path_table_size: u32,
    l_path_table: u32,
    m_path_table: u32,
    catalog_lba: u32,
    catalog_in_tree: bool,
    continuation_lba: u32,
    continuation_area: Vec<u8>,
    /// (directory, record slot) -> (block, offset); slot 0 is ".", 1 is ".."
    continuation_slots: HashMap<(usize, usize), (u32, u32)>,
    hidden: Vec<(u32, &'a [u8])>,
    total_blocks: u32,
}

fn to_block(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| AutoInstallError::LayoutOverflow {
        required: value,
        limit: u32::MAX as u64,
        unit: "blocks",
    })
}

fn to_data_length(len: u64) -> Result<u32> {
    u32::try_from(len).map_err(|_| AutoInstallError::LayoutOverflow {
        required: len,
        limit: u32::MAX as u64,
        unit: "bytes in one file",
    })
}

fn contains_catalog(dir: &DirNode) -> bool {
    dir.children.iter().any(|c| match c {
        Node::File(f) => f.boot_catalog,
        Node::Dir(d) => contains_catalog(d),
    })
}

fn record_metas(node: &DirNode) -> impl Iterator<Item = &EntryMeta> {
    [&node.dot, &node.dotdot]
        .into_iter()
        .chain(node.children.iter().map(Node::meta))
}

fn plan<'a>(parts: &ImageParts<'a>) -> Result<Layout<'a>> {
    let mut dirs = vec![DirPlan {
        node: parts.root,
        parent: 0,
        lba: 0,
        size: 0,
    }];
    let mut child_dirs = HashMap::new();
    let mut index = 0;
    while index < dirs.len() {
        let node = dirs[index].node;
        for (slot, child) in node.children.iter().enumerate() {
            if let Node::Dir(dir) = child {
                child_dirs.insert((index, slot), dirs.len());
                dirs.push(DirPlan {
                    node: dir,
                    parent: index,
                    lba: 0,
                    size: 0,
                });
            }
        }
        index += 1;
    }
    if dirs.len() > u16::MAX as usize {
        return Err(AutoInstallError::layout(format!(
            "{} directories do not fit a path table",
            dirs.len()
        )));
    }

    for dir in &mut dirs {
        let node = dir.node;
        let lengths = [&node.dot, &node.dotdot]
            .into_iter()
            .map(|m| directory::encoded_len(SELF_IDENTIFIER.len(), m.system_use.bytes.len()))
            .chain(
                node.children
                    .iter()
                    .map(|c| directory::encoded_len(c.identifier().len(), c.meta().system_use.bytes.len())),
            );
        dir.size = to_block(directory::packed_size(lengths) as u64)?;
    }

    let path_table_size: u64 = dirs
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let len = if i == 0 { 1 } else { d.node.identifier.len() };
            (8 + len + len % 2) as u64
        })
        .sum();
    let table_blocks = blocks_for(path_table_size);
    let catalog_len = parts.catalog.encode().len() as u64;

    let mut next = (DESCRIPTOR_START + DESCRIPTOR_BLOCKS) as u64;
    let l_path_table = to_block(next)?;
    next += table_blocks;
    let m_path_table = to_block(next)?;
    next += table_blocks;

    let catalog_in_tree = contains_catalog(parts.root);
    let mut catalog_lba = 0u32;
    if !catalog_in_tree {
        catalog_lba = to_block(next)?;
        next += blocks_for(catalog_len);
    }

    for dir in &mut dirs {
        dir.lba = to_block(next)?;
        next += dir.size as u64 / BLOCK;
    }

    let continuation_lba = to_block(next)?;
    let mut continuation_area: Vec<u8> = Vec::new();
    let mut continuation_slots = HashMap::new();
    for (index, dir) in dirs.iter().enumerate() {
        for (slot, meta) in record_metas(dir.node).enumerate() {
            let Some(continuation) = &meta.system_use.continuation else {
                continue;
            };
            let offset = continuation_area.len() % BLOCK_SIZE;
            if offset + continuation.data.len() > BLOCK_SIZE {
                continuation_area.resize(continuation_area.len() + BLOCK_SIZE - offset, 0);
            }
            let block = continuation_lba as u64 + (continuation_area.len() / BLOCK_SIZE) as u64;
            let offset = (continuation_area.len() % BLOCK_SIZE) as u32;
            continuation_slots.insert((index, slot), (to_block(block)?, offset));
            continuation_area.extend_from_slice(&continuation.data);
        }
    }
    continuation_area.resize(continuation_area.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
    next += (continuation_area.len() / BLOCK_SIZE) as u64;

    let mut files = Vec::new();
    let mut child_files = HashMap::new();
    for (index, dir) in dirs.iter().enumerate() {
        for (slot, child) in dir.node.children.iter().enumerate() {
            let Node::File(file) = child else {
                continue;
            };
            let len = if file.boot_catalog {
                catalog_len
            } else {
                file.data.len()
            };
            let len32 = to_data_length(len)?;
            let lba = to_block(next)?;
            if file.boot_catalog {
                catalog_lba = lba;
            }
            next += blocks_for(len);
            child_files.insert((index, slot), files.len());
            files.push(FilePlan {
                node: file,
                lba,
                len: len32,
                patch_boot_info: false,
            });
        }
    }

    let mut hidden = Vec::new();
    for target in parts.boot_targets {
        if let BootTarget::Hidden(bytes) = target {
            hidden.push((to_block(next)?, bytes.as_slice()));
            next += blocks_for(bytes.len() as u64);
        }
    }

    let total_blocks = to_block(next)?;
    debug!(
        "Layout: {} directories, {} files, {} hidden boot images, {} blocks",
        dirs.len(),
        files.len(),
        hidden.len(),
        total_blocks
    );

    Ok(Layout {
        dirs,
        child_dirs,
        files,
        child_files,
        path_table_size: to_block(path_table_size)?,
        l_path_table,
        m_path_table,
        catalog_lba,
        catalog_in_tree,
        continuation_lba,
        continuation_area,
        continuation_slots,
        hidden,
        total_blocks,
    })
}

/// Index in `Layout::files` of the file at `path`
fn resolve_file(layout: &Layout<'_>, path: &[String]) -> Option<usize> {
    let (name, parents) = path.split_last()?;
    let mut dir = 0usize;
    for part in parents {
        let slot = layout.dirs[dir].node.find(part)?;
        dir = *layout.child_dirs.get(&(dir, slot))?;
    }
    let slot = layout.dirs[dir].node.find(name)?;
    layout.child_files.get(&(dir, slot)).copied()
}

/// Point boot entries at their new extents
///
/// Returns the encoded catalog and the refreshed system area.
fn relocate_boot(parts: &ImageParts<'_>, layout: &mut Layout<'_>) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut catalog = parts.catalog.clone();
    let mut system_area = parts.system_area.to_vec();
    let mut hidden = layout.hidden.iter().map(|(lba, _)| *lba).collect::<Vec<_>>().into_iter();
    let mut isohybrid_checked = false;
    let mut hybrid = false;

    for (entry, target) in catalog.entries_mut().zip(parts.boot_targets) {
        let old_lba = entry.load_rba();
        let (new_lba, image_len) = match target {
            BootTarget::File(path) => {
                let index = resolve_file(layout, path).ok_or_else(|| {
                    AutoInstallError::internal(format!("boot image /{} is not in the layout", path.join("/")))
                })?;
                let plan = &mut layout.files[index];
                if entry.platform_id == PLATFORM_EFI {
                    if let FileData::Staged(data) = &plan.node.data {
                        let sectors = (data.len() as u64).div_ceil(VIRTUAL_SECTOR).min(u16::MAX as u64);
                        entry.set_sector_count(sectors as u16);
                    }
                }
                if entry.platform_id == PLATFORM_X86 && entry.media_type() == 0 {
                    plan.patch_boot_info = matches!(plan.node.data, FileData::Source { .. });
                }
                (plan.lba, plan.len as u64)
            }
            BootTarget::Hidden(bytes) => {
                let lba = hidden
                    .next()
                    .ok_or_else(|| AutoInstallError::internal("hidden boot image was not allocated"))?;
                (lba, bytes.len() as u64)
            }
        };
        entry.set_load_rba(new_lba);

        if entry.platform_id == PLATFORM_X86 && !isohybrid_checked {
            isohybrid_checked = true;
            if eltorito::refresh_isohybrid(&mut system_area, old_lba, new_lba) {
                debug!("isohybrid MBR now points at block {}", new_lba);
                hybrid = true;
            }
        }
        if entry.platform_id == PLATFORM_EFI
            && eltorito::relocate_efi_partition(&mut system_area, old_lba, new_lba, image_len)
        {
            debug!("MBR EFI partition now starts at block {}", new_lba);
            hybrid = true;
        }
    }
    if hybrid {
        eltorito::resize_image_partition(&mut system_area, layout.total_blocks);
    }

    Ok((catalog.encode(), system_area))
}

fn path_table_records(layout: &Layout<'_>) -> Vec<PathTableRecord> {
    layout
        .dirs
        .iter()
        .enumerate()
        .map(|(i, dir)| PathTableRecord {
            extent: dir.lba,
            parent: (dir.parent + 1) as u16,
            identifier: if i == 0 {
                SELF_IDENTIFIER.to_vec()
            } else {
                dir.node.identifier.clone()
            },
        })
        .collect()
}

fn system_use(meta: &EntryMeta, placement: Option<(u32, u32)>) -> Vec<u8> {
    let mut bytes = meta.system_use.bytes.clone();
    if let (Some(continuation), Some((block, offset))) = (&meta.system_use.continuation, placement) {
        rock_ridge::patch_continuation(
            &mut bytes,
            continuation.entry_offset,
            block,
            offset,
            continuation.data.len() as u32,
        );
    }
    bytes
}

fn encode_directory(layout: &Layout<'_>, index: usize) -> Result<Vec<u8>> {
    let plan = &layout.dirs[index];
    let parent = &layout.dirs[plan.parent];
    let node = plan.node;
    let record = |slot: usize, meta: &EntryMeta, identifier: &[u8], extent: u32, data_len: u32| RawRecord {
        extent,
        data_len,
        recorded: meta.recorded,
        flags: meta.flags,
        identifier: identifier.to_vec(),
        system_use: system_use(meta, layout.continuation_slots.get(&(index, slot)).copied()),
    };

    let mut out = Vec::with_capacity(plan.size as usize);
    push_packed(&mut out, &record(0, &node.dot, SELF_IDENTIFIER, plan.lba, plan.size));
    push_packed(&mut out, &record(1, &node.dotdot, PARENT_IDENTIFIER, parent.lba, parent.size));
    for (slot, child) in node.children.iter().enumerate() {
        let missing = || AutoInstallError::internal(format!("/{} has no layout", child.name()));
        let (extent, len) = match child {
            Node::Dir(_) => {
                let dir = &layout.dirs[*layout.child_dirs.get(&(index, slot)).ok_or_else(missing)?];
                (dir.lba, dir.size)
            }
            Node::File(_) => {
                let file = &layout.files[*layout.child_files.get(&(index, slot)).ok_or_else(missing)?];
                (file.lba, file.len)
            }
        };
        push_packed(&mut out, &record(slot + 2, child.meta(), child.identifier(), extent, len));
    }
    out.resize(plan.size as usize, 0);
    Ok(out)
}

/// Sequential sector sink that checks every extent lands where it was planned
struct BlockWriter<'r, W: Write> {
    out: W,
    position: u64,
    reporter: &'r dyn ProgressReporter,
    /// Checked before every block
    cancel: &'r AtomicBool,
}

impl<W: Write> BlockWriter<'_, W> {
    fn expect(&self, lba: u32) -> Result<()> {
        let planned = lba as u64 * BLOCK;
        if self.position != planned {
            return Err(AutoInstallError::internal(format!(
                "block {} was planned at byte {} but the writer is at byte {}",
                lba, planned, self.position
            )));
        }
        Ok(())
    }

    fn put(&mut self, data: &[u8]) -> Result<()> {
        for block in data.chunks(BLOCK_SIZE) {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(AutoInstallError::Interrupted);
            }
            self.out.write_all(block)?;
            self.position += block.len() as u64;
            self.reporter.advance(self.position);
        }
        Ok(())
    }

    fn pad(&mut self) -> Result<()> {
        let used = (self.position % BLOCK) as usize;
        if used != 0 {
            self.put(&ZEROES[..BLOCK_SIZE - used])?;
        }
        Ok(())
    }

    fn extent(&mut self, lba: u32, data: &[u8]) -> Result<()> {
        self.expect(lba)?;
        self.put(data)?;
        self.pad()
    }

    fn copy_extent(&mut self, lba: u32, source: &mut dyn ImageSource, offset: u64, len: u64) -> Result<()> {
        self.expect(lba)?;
        source.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(COPY_CHUNK as u64) as usize;
            source.read_exact(&mut buf[..n])?;
            self.put(&buf[..n])?;
            remaining -= n as u64;
        }
        self.pad()
    }
}

/// Lay the image out and stream it to `out`
pub(crate) fn write_image<W: Write>(
    parts: &ImageParts<'_>,
    source: &mut dyn ImageSource,
    out: W,
    reporter: &dyn ProgressReporter,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut layout = plan(parts)?;
    let (catalog, system_area) = relocate_boot(parts, &mut layout)?;

    reporter.begin(WRITE_TASK, Some(layout.total_blocks as u64 * BLOCK));
    let mut writer = BlockWriter {
        out,
        position: 0,
        reporter,
        cancel,
    };

    writer.extent(0, &system_area)?;
    let root = &layout.dirs[0];
    let primary = parts.volume.encode(&PrimaryLayout {
        volume_space_size: layout.total_blocks,
        path_table_size: layout.path_table_size,
        l_path_table: layout.l_path_table,
        m_path_table: layout.m_path_table,
        root_extent: root.lba,
        root_size: root.size,
    });
    writer.extent(DESCRIPTOR_START, &primary)?;
    writer.extent(DESCRIPTOR_START + 1, &parts.boot_record.encode(layout.catalog_lba))?;
    writer.extent(DESCRIPTOR_START + 2, &terminator())?;

    let records = path_table_records(&layout);
    writer.extent(layout.l_path_table, &path_table::encode(&records, PathTableType::LittleEndian))?;
    writer.extent(layout.m_path_table, &path_table::encode(&records, PathTableType::BigEndian))?;

    if !layout.catalog_in_tree {
        writer.extent(layout.catalog_lba, &catalog)?;
    }

    for index in 0..layout.dirs.len() {
        writer.extent(layout.dirs[index].lba, &encode_directory(&layout, index)?)?;
    }

    if !layout.continuation_area.is_empty() {
        writer.extent(layout.continuation_lba, &layout.continuation_area)?;
    }

    for plan in &layout.files {
        if plan.node.boot_catalog {
            writer.extent(plan.lba, &catalog)?;
            continue;
        }
        match &plan.node.data {
            FileData::Staged(data) => writer.extent(plan.lba, data)?,
            FileData::Source { lba, len } if plan.patch_boot_info => {
                let mut image = read_at(source, *lba as u64 * BLOCK, *len as usize)?;
                if eltorito::patch_boot_info_table(&mut image, DESCRIPTOR_START, *lba, plan.lba) {
                    debug!("Boot info table of {} now points at block {}", plan.node.name, plan.lba);
                }
                writer.extent(plan.lba, &image)?;
            }
            FileData::Source { lba, len } => {
                writer.copy_extent(plan.lba, source, *lba as u64 * BLOCK, *len)?;
            }
        }
    }

    for (lba, bytes) in &layout.hidden {
        writer.extent(*lba, bytes)?;
    }

    writer.expect(layout.total_blocks)?;
    writer.out.flush()?;
    reporter.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso::fixture::{self, FixtureOptions};
    use crate::iso::IsoImage;
    use crate::reporter::NoProgress;
    use std::io::Cursor;

    fn parts(image: &IsoImage) -> ImageParts<'_> {
        ImageParts {
            volume: &image.volume,
            boot_record: &image.boot_record,
            system_area: &image.system_area,
            root: &image.root,
            catalog: &image.catalog,
            boot_targets: &image.boot_targets,
        }
    }

    #[test]
    fn test_layout_order() {
        // Arrange
        let image = IsoImage::from_reader(Cursor::new(fixture::build(&FixtureOptions::default()))).unwrap();

        // Act
        let layout = plan(&parts(&image)).unwrap();

        // Assert
        assert_eq!(layout.l_path_table, 19);
        assert!(layout.m_path_table > layout.l_path_table);
        assert!(layout.catalog_in_tree);
        let dir_lbas: Vec<u32> = layout.dirs.iter().map(|d| d.lba).collect();
        assert!(dir_lbas.windows(2).all(|w| w[0] < w[1]));
        let first_file = layout.files.iter().map(|f| f.lba).min().unwrap();
        assert!(dir_lbas.iter().all(|&lba| lba < first_file));
        assert!(layout.continuation_lba < first_file);
        assert!(layout.files.iter().any(|f| f.lba == layout.catalog_lba && f.node.boot_catalog));
        assert!(layout.hidden.is_empty());
    }

    #[test]
    fn test_block_writer_rejects_misplaced_extent() {
        let mut out = Vec::new();
        let mut writer = BlockWriter {
            out: &mut out,
            position: 0,
            reporter: &NoProgress,
            cancel: &AtomicBool::new(false),
        };
        writer.extent(0, &[1, 2, 3]).unwrap();
        assert_eq!(writer.position, BLOCK);
        let err = writer.extent(5, &[4]).unwrap_err();
        assert!(matches!(err, AutoInstallError::Internal(_)));
    }

    #[test]
    fn test_block_writer_stops_when_cancelled() {
        let mut out = Vec::new();
        let cancel = AtomicBool::new(false);
        let mut writer = BlockWriter {
            out: &mut out,
            position: 0,
            reporter: &NoProgress,
            cancel: &cancel,
        };
        writer.extent(0, &[1]).unwrap();
        cancel.store(true, Ordering::Relaxed);
        let err = writer.extent(1, &[2]).unwrap_err();
        assert!(matches!(err, AutoInstallError::Interrupted));
        assert_eq!(writer.position, BLOCK);
    }

    #[test]
    fn test_file_length_overflow_counts_bytes() {
        assert_eq!(to_data_length(4096).unwrap(), 4096);
        let err = to_data_length(1 << 32).unwrap_err();
        assert!(matches!(err, AutoInstallError::LayoutOverflow { unit: "bytes in one file", .. }));
        assert!(err.to_string().contains("4294967296 bytes in one file"));
        assert!(to_block(1 << 32).unwrap_err().to_string().contains("blocks"));
    }

    #[test]
    fn test_zero_length_files_take_no_blocks() {
        let image = IsoImage::from_reader(Cursor::new(fixture::build(&FixtureOptions::default()))).unwrap();
        let layout = plan(&parts(&image)).unwrap();
        let index = layout.files.iter().position(|f| f.len == 0).unwrap();
        let following = layout.files.get(index + 1).map(|f| f.lba).unwrap_or(layout.total_blocks);
        assert_eq!(following, layout.files[index].lba);
    }
}
