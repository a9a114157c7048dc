// file: src/iso/image.rs
// version: 1.0.0
// guid: b2e2500d-901c-44fc-82d6-1f757fb2788b

//! Loaded ISO image with staged edits

use super::descriptor::{read_descriptor_set, BootRecord, PrimaryVolume};
use super::directory::{
    self, display_name, identifier_cmp, make_identifier, RawRecord, FLAG_DIRECTORY,
    FLAG_MULTI_EXTENT, PARENT_IDENTIFIER, SELF_IDENTIFIER,
};
use super::eltorito::BootCatalog;
use super::path_table;
use super::rock_ridge;
use super::writer::{self, ImageParts};
use super::{blocks_for, PlatformKind, BLOCK_SIZE, SYSTEM_AREA_BLOCKS};
use crate::error::{AutoInstallError, Result};
use crate::reporter::ProgressReporter;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Anything an image can be read from
pub trait ImageSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ImageSource for T {}

/// Directory nesting accepted before the tree is considered corrupt
const MAX_DEPTH: usize = 64;

/// Directory records carry their length in one byte
const MAX_RECORD_LEN: usize = 255;

/// Location of data on the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extent {
    /// First logical block
    pub lba: u32,
    /// Length in bytes
    pub length: u64,
}

/// One boot catalog entry as seen by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootCatalogEntry {
    pub platform: PlatformKind,
    /// Boot indicator is set
    pub present: bool,
    pub extent: Extent,
}

/// System Use area of a directory record plus its continuation, if any
#[derive(Debug, Clone, Default)]
pub(crate) struct SystemUse {
    pub bytes: Vec<u8>,
    pub continuation: Option<Continuation>,
}

#[derive(Debug, Clone)]
pub(crate) struct Continuation {
    /// Offset of the `CE` entry inside `SystemUse::bytes`
    pub entry_offset: usize,
    pub data: Vec<u8>,
}

impl SystemUse {
    fn areas(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(self.bytes.as_slice()).chain(self.continuation.iter().map(|c| c.data.as_slice()))
    }
}

/// Record fields preserved across a rewrite
#[derive(Debug, Clone)]
pub(crate) struct EntryMeta {
    pub recorded: [u8; 7],
    pub flags: u8,
    pub system_use: SystemUse,
}

#[derive(Debug, Clone)]
pub(crate) enum FileData {
    /// Bytes still live in the source image
    Source { lba: u32, len: u64 },
    Staged(Vec<u8>),
}

impl FileData {
    pub fn len(&self) -> u64 {
        match self {
            FileData::Source { len, .. } => *len,
            FileData::Staged(data) => data.len() as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FileNode {
    pub name: String,
    pub identifier: Vec<u8>,
    pub meta: EntryMeta,
    pub data: FileData,
    /// This file is the El Torito boot catalog
    pub boot_catalog: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct DirNode {
    pub name: String,
    pub identifier: Vec<u8>,
    pub meta: EntryMeta,
    pub dot: EntryMeta,
    pub dotdot: EntryMeta,
    /// Kept in ISO9660 identifier order
    pub children: Vec<Node>,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Dir(DirNode),
    File(FileNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Dir(d) => &d.name,
            Node::File(f) => &f.name,
        }
    }

    pub fn identifier(&self) -> &[u8] {
        match self {
            Node::Dir(d) => &d.identifier,
            Node::File(f) => &f.identifier,
        }
    }

    pub fn meta(&self) -> &EntryMeta {
        match self {
            Node::Dir(d) => &d.meta,
            Node::File(f) => &f.meta,
        }
    }
}

impl DirNode {
    /// Child index by name: exact match first, then ASCII case-insensitive
    pub fn find(&self, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|c| c.name() == name)
            .or_else(|| self.children.iter().position(|c| c.name().eq_ignore_ascii_case(name)))
    }

    fn insert(&mut self, node: Node) -> usize {
        let pos = self
            .children
            .iter()
            .position(|c| identifier_cmp(c.identifier(), node.identifier()) == Ordering::Greater)
            .unwrap_or(self.children.len());
        self.children.insert(pos, node);
        pos
    }

    fn dir(&self, parts: &[String]) -> Option<&DirNode> {
        let mut dir = self;
        for part in parts {
            dir = match &dir.children[dir.find(part)?] {
                Node::Dir(d) => d,
                Node::File(_) => return None,
            };
        }
        Some(dir)
    }

    fn dir_mut(&mut self, parts: &[String]) -> Option<&mut DirNode> {
        let mut dir = self;
        for part in parts {
            let index = dir.find(part)?;
            dir = match &mut dir.children[index] {
                Node::Dir(d) => d,
                Node::File(_) => return None,
            };
        }
        Some(dir)
    }

    fn node(&self, parts: &[String]) -> Option<&Node> {
        let (name, parents) = parts.split_last()?;
        let dir = self.dir(parents)?;
        dir.children.get(dir.find(name)?)
    }

    fn node_mut(&mut self, parts: &[String]) -> Option<&mut Node> {
        let (name, parents) = parts.split_last()?;
        let dir = self.dir_mut(parents)?;
        let index = dir.find(name)?;
        dir.children.get_mut(index)
    }

    fn file(&self, parts: &[String]) -> Option<&FileNode> {
        match self.node(parts)? {
            Node::File(f) => Some(f),
            Node::Dir(_) => None,
        }
    }

    /// Identifier not yet used by any child
    fn unique_identifier(&self, name: &str, is_dir: bool) -> Vec<u8> {
        let taken = |id: &[u8]| self.children.iter().any(|c| c.identifier() == id);
        let base = make_identifier(name, is_dir);
        if !taken(&base) {
            return base;
        }
        let dot = base.iter().position(|&b| b == b'.').unwrap_or(base.len());
        (1u32..)
            .map(|n| {
                let suffix = n.to_string();
                let keep = dot.min(24usize.saturating_sub(suffix.len()));
                let mut id = base[..keep].to_vec();
                id.extend_from_slice(suffix.as_bytes());
                id.extend_from_slice(&base[dot..]);
                id
            })
            .find(|id| !taken(id))
            .unwrap_or(base)
    }
}

/// Boot image referenced by a catalog entry
#[derive(Debug, Clone)]
pub(crate) enum BootTarget {
    /// A file in the tree, by path components
    File(Vec<String>),
    /// Data outside the tree, carried as bytes
    Hidden(Vec<u8>),
}

/// Split an absolute image path into components
pub(crate) fn split_path(path: &str) -> Result<Vec<String>> {
    if !path.starts_with('/') {
        return Err(AutoInstallError::InvalidPath(format!(
            "{} is not an absolute image path",
            path
        )));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(AutoInstallError::InvalidPath(format!(
                    "{} contains a parent reference",
                    path
                )))
            }
            part => parts.push(part.to_string()),
        }
    }
    Ok(parts)
}

/// Read `len` bytes at byte `offset` of the source
pub(crate) fn read_at(source: &mut dyn ImageSource, offset: u64, len: usize) -> Result<Vec<u8>> {
    source.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    source.read_exact(&mut buf).map_err(|e| match e.kind() {
        IoErrorKind::UnexpectedEof => AutoInstallError::layout(format!(
            "{} bytes at offset {} run past the end of the image",
            len, offset
        )),
        _ => AutoInstallError::IoError(e),
    })?;
    Ok(buf)
}

/// ISO9660 image loaded for editing
///
/// File contents stay in the source until [`IsoImage::write`] streams them out;
/// replacements and additions are held in memory.
pub struct IsoImage {
    source: Box<dyn ImageSource>,
    pub(crate) volume: PrimaryVolume,
    pub(crate) boot_record: BootRecord,
    pub(crate) system_area: Vec<u8>,
    pub(crate) root: DirNode,
    pub(crate) catalog: BootCatalog,
    pub(crate) boot_targets: Vec<BootTarget>,
}

impl fmt::Debug for IsoImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsoImage")
            .field("volume_id", &self.volume_id())
            .field("volume_space_size", &self.volume.volume_space_size)
            .field("boot_entries", &self.boot_targets.len())
            .finish()
    }
}

impl IsoImage {
    /// Load an image from disk
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading ISO image: {}", path.display());
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Load an image from any seekable source
    pub fn from_reader<R: ImageSource + 'static>(reader: R) -> Result<Self> {
        let mut source: Box<dyn ImageSource> = Box::new(reader);

        let set = read_descriptor_set(source.as_mut())?;
        if set.dropped > 0 {
            info!(
                "{} supplementary/partition descriptor(s) will not be carried over",
                set.dropped
            );
        }
        let boot_record = set
            .boot_record
            .ok_or_else(|| AutoInstallError::layout("image has no El Torito boot record"))?;
        let volume = set.primary;
        let catalog_lba = boot_record.catalog_lba;

        let system_area = read_at(source.as_mut(), 0, SYSTEM_AREA_BLOCKS as usize * BLOCK_SIZE)?;

        let mut loader = TreeLoader {
            source: source.as_mut(),
            volume_blocks: volume.volume_space_size,
            claims: Vec::new(),
            dir_extents: Vec::new(),
            visited: HashSet::new(),
            file_lbas: HashMap::new(),
        };
        let root_meta = EntryMeta {
            recorded: volume.root.recorded,
            flags: volume.root.flags,
            system_use: SystemUse::default(),
        };
        let mut root = loader.load_dir(&volume.root, String::new(), root_meta, &mut Vec::new(), 0)?;
        loader.check_overlaps()?;
        if catalog_lba >= volume.volume_space_size {
            return Err(AutoInstallError::layout(format!(
                "boot catalog at block {} lies outside the {}-block volume",
                catalog_lba, volume.volume_space_size
            )));
        }
        let TreeLoader {
            dir_extents,
            file_lbas,
            ..
        } = loader;

        check_path_table(source.as_mut(), &volume, dir_extents)?;

        let catalog_block = read_at(source.as_mut(), catalog_lba as u64 * BLOCK_SIZE as u64, BLOCK_SIZE)?;
        let catalog = BootCatalog::parse(&catalog_block)?;

        if let Some(path) = file_lbas.get(&catalog_lba) {
            if let Some(Node::File(file)) = root.node_mut(path) {
                debug!("Boot catalog is exposed as /{}", path.join("/"));
                file.boot_catalog = true;
            }
        }

        let mut boot_targets = Vec::new();
        for entry in catalog.entries() {
            let lba = entry.load_rba();
            let target = match file_lbas.get(&lba) {
                Some(path) if lba != catalog_lba => BootTarget::File(path.clone()),
                _ => {
                    let len = blocks_for(u64::from(entry.sector_count().max(1)) * 512) as usize * BLOCK_SIZE;
                    debug!("Boot image at block {} is not a file; carrying {} bytes", lba, len);
                    BootTarget::Hidden(read_at(source.as_mut(), lba as u64 * BLOCK_SIZE as u64, len)?)
                }
            };
            boot_targets.push(target);
        }

        let image = Self {
            source,
            volume,
            boot_record,
            system_area,
            root,
            catalog,
            boot_targets,
        };
        info!(
            "Loaded image {:?}: {} blocks, {} boot entries, Rock Ridge: {}",
            image.volume_id(),
            image.volume.volume_space_size,
            image.boot_targets.len(),
            image.uses_rock_ridge()
        );
        Ok(image)
    }

    /// Volume identifier from the primary descriptor
    pub fn volume_id(&self) -> String {
        self.volume.volume_id()
    }

    /// Whether the image carries Rock Ridge names
    pub fn uses_rock_ridge(&self) -> bool {
        rock_ridge::has_sp(&self.root.dot.system_use.bytes)
    }

    /// Whether a file or directory exists at `path`
    pub fn exists(&self, path: &str) -> bool {
        match split_path(path) {
            Ok(parts) if parts.is_empty() => true,
            Ok(parts) => self.root.node(&parts).is_some(),
            Err(_) => false,
        }
    }

    /// Names of the entries in a directory
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let parts = split_path(path)?;
        let dir = self
            .root
            .dir(&parts)
            .ok_or_else(|| AutoInstallError::FileNotFound(path.to_string()))?;
        Ok(dir.children.iter().map(|c| c.name().to_string()).collect())
    }

    /// Where a file's current bytes live in the source image
    ///
    /// `None` for files whose contents were staged in memory.
    pub fn file_extent(&self, path: &str) -> Result<Option<Extent>> {
        let parts = split_path(path)?;
        let file = self
            .root
            .file(&parts)
            .ok_or_else(|| AutoInstallError::FileNotFound(path.to_string()))?;
        Ok(match file.data {
            FileData::Source { lba, len } => Some(Extent { lba, length: len }),
            FileData::Staged(_) => None,
        })
    }

    /// Contents of a file, staged edits included
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let parts = split_path(path)?;
        let file = self
            .root
            .file(&parts)
            .ok_or_else(|| AutoInstallError::FileNotFound(path.to_string()))?;
        if file.boot_catalog {
            return Ok(self.catalog.encode());
        }
        match &file.data {
            FileData::Staged(data) => Ok(data.clone()),
            FileData::Source { lba, len } => {
                let len = usize::try_from(*len)
                    .map_err(|_| AutoInstallError::layout(format!("{} is too large to read", path)))?;
                read_at(self.source.as_mut(), *lba as u64 * BLOCK_SIZE as u64, len)
            }
        }
    }

    /// Stage new contents for an existing file
    pub fn replace_file(&mut self, path: &str, data: Vec<u8>) -> Result<()> {
        let parts = split_path(path)?;
        match self.root.node_mut(&parts) {
            Some(Node::File(file)) if file.boot_catalog => Err(AutoInstallError::InvalidPath(format!(
                "{} is the El Torito boot catalog",
                path
            ))),
            Some(Node::File(file)) => {
                debug!("Staged {} bytes for {}", data.len(), path);
                file.data = FileData::Staged(data);
                Ok(())
            }
            Some(Node::Dir(_)) => Err(AutoInstallError::InvalidPath(format!("{} is a directory", path))),
            None => Err(AutoInstallError::FileNotFound(path.to_string())),
        }
    }

    /// Add a new file, creating missing parent directories
    pub fn add_file(&mut self, path: &str, data: Vec<u8>) -> Result<()> {
        let parts = split_path(path)?;
        let (name, parents) = parts
            .split_last()
            .ok_or_else(|| AutoInstallError::InvalidPath(format!("{} names the root directory", path)))?;
        if self.root.node(&parts).is_some() {
            return Err(AutoInstallError::FileExists(path.to_string()));
        }

        let template = NewEntry {
            rock_ridge: self.uses_rock_ridge(),
            recorded: self.volume.root_recorded(),
        };
        let mut dir = &mut self.root;
        for part in parents {
            let index = match dir.find(part) {
                Some(index) => index,
                None => {
                    debug!("Creating directory {} for {}", part, path);
                    let node = template.dir(dir, part)?;
                    dir.insert(Node::Dir(node))
                }
            };
            dir = match &mut dir.children[index] {
                Node::Dir(d) => d,
                Node::File(_) => {
                    return Err(AutoInstallError::InvalidPath(format!(
                        "{} in {} is a file",
                        part, path
                    )))
                }
            };
        }

        let file = template.file(dir, name, data)?;
        debug!(
            "Added {} as {} ({} bytes)",
            path,
            String::from_utf8_lossy(&file.identifier),
            file.data.len()
        );
        dir.insert(Node::File(file));
        Ok(())
    }

    /// Entries of the boot catalog in catalog order
    ///
    /// Entries for platforms other than x86 BIOS and UEFI are skipped.
    pub fn list_boot_catalog_entries(&self) -> Vec<BootCatalogEntry> {
        self.catalog
            .entries()
            .zip(&self.boot_targets)
            .filter_map(|(entry, target)| {
                let platform = PlatformKind::from_platform_id(entry.platform_id)?;
                let length = match target {
                    BootTarget::File(parts) => self.root.file(parts).map(|f| f.data.len()).unwrap_or(0),
                    BootTarget::Hidden(bytes) => bytes.len() as u64,
                };
                Some(BootCatalogEntry {
                    platform,
                    present: entry.is_bootable(),
                    extent: Extent {
                        lba: entry.load_rba(),
                        length,
                    },
                })
            })
            .collect()
    }

    /// Clear the boot indicator of every entry for `platform`
    pub fn disable_boot_entry(&mut self, platform: PlatformKind) -> Result<()> {
        let id = platform.platform_id();
        let mut disabled = 0usize;
        for entry in self.catalog.entries_mut().filter(|e| e.platform_id == id) {
            entry.set_bootable(false);
            disabled += 1;
        }
        if disabled == 0 {
            return Err(AutoInstallError::BootEntryNotFound(platform));
        }
        info!("Disabled {} {} boot entr{}", disabled, platform, if disabled == 1 { "y" } else { "ies" });
        Ok(())
    }

    /// Serialize the image with all staged edits to `output`
    ///
    /// The image is written to a temporary file next to `output` and renamed
    /// into place once complete.
    pub fn write(&mut self, output: &Path, reporter: &dyn ProgressReporter) -> Result<()> {
        self.write_cancellable(output, reporter, &AtomicBool::new(false))
    }

    /// [`IsoImage::write`] that gives up with [`AutoInstallError::Interrupted`]
    /// once `cancel` is set; nothing is left at `output` in that case
    pub fn write_cancellable(
        &mut self,
        output: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &AtomicBool,
    ) -> Result<()> {
        info!("Writing ISO image: {}", output.display());
        let dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        {
            let parts = ImageParts {
                volume: &self.volume,
                boot_record: &self.boot_record,
                system_area: &self.system_area,
                root: &self.root,
                catalog: &self.catalog,
                boot_targets: &self.boot_targets,
            };
            let mut out = BufWriter::new(temp.as_file_mut());
            writer::write_image(&parts, self.source.as_mut(), &mut out, reporter, cancel)?;
            out.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(output).map_err(|e| AutoInstallError::IoError(e.error))?;
        info!("Image written: {}", output.display());
        Ok(())
    }
}

/// Attributes for entries created by edits
struct NewEntry {
    rock_ridge: bool,
    recorded: [u8; 7],
}

impl NewEntry {
    fn meta(&self, system_use: Vec<u8>, is_dir: bool) -> EntryMeta {
        EntryMeta {
            recorded: self.recorded,
            flags: if is_dir { FLAG_DIRECTORY } else { 0 },
            system_use: SystemUse {
                bytes: if self.rock_ridge { system_use } else { Vec::new() },
                continuation: None,
            },
        }
    }

    fn named(&self, parent: &DirNode, name: &str, is_dir: bool) -> Result<(Vec<u8>, EntryMeta)> {
        let identifier = parent.unique_identifier(name, is_dir);
        let meta = self.meta(rock_ridge::synthesize(name, is_dir), is_dir);
        if directory::encoded_len(identifier.len(), meta.system_use.bytes.len()) > MAX_RECORD_LEN {
            return Err(AutoInstallError::InvalidPath(format!("name {} is too long", name)));
        }
        Ok((identifier, meta))
    }

    fn dir(&self, parent: &DirNode, name: &str) -> Result<DirNode> {
        let (identifier, meta) = self.named(parent, name, true)?;
        Ok(DirNode {
            name: name.to_string(),
            identifier,
            meta,
            dot: self.meta(rock_ridge::px_entry(true), true),
            dotdot: self.meta(rock_ridge::px_entry(true), true),
            children: Vec::new(),
        })
    }

    fn file(&self, parent: &DirNode, name: &str, data: Vec<u8>) -> Result<FileNode> {
        let (identifier, meta) = self.named(parent, name, false)?;
        Ok(FileNode {
            name: name.to_string(),
            identifier,
            meta,
            data: FileData::Staged(data),
            boot_catalog: false,
        })
    }
}

/// Walks the directory tree of a source image
struct TreeLoader<'a> {
    source: &'a mut dyn ImageSource,
    volume_blocks: u32,
    /// (first block, block count, path) of every non-empty extent
    claims: Vec<(u32, u64, String)>,
    dir_extents: Vec<u32>,
    visited: HashSet<u32>,
    /// First file found at each non-empty extent
    file_lbas: HashMap<u32, Vec<String>>,
}

impl TreeLoader<'_> {
    fn claim(&mut self, lba: u32, len: u64, path: &[String]) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let blocks = blocks_for(len);
        if lba as u64 + blocks > self.volume_blocks as u64 {
            return Err(AutoInstallError::layout(format!(
                "extent of /{} (block {}, {} blocks) lies outside the {}-block volume",
                path.join("/"),
                lba,
                blocks,
                self.volume_blocks
            )));
        }
        self.claims.push((lba, blocks, format!("/{}", path.join("/"))));
        Ok(())
    }

    fn check_overlaps(&mut self) -> Result<()> {
        self.claims.sort();
        for pair in self.claims.windows(2) {
            let (a_lba, a_blocks, a_path) = &pair[0];
            let (b_lba, b_blocks, b_path) = &pair[1];
            if a_lba == b_lba && a_blocks == b_blocks {
                // Hard links share an extent
                debug!("{} and {} share block {}", a_path, b_path, a_lba);
                continue;
            }
            if *a_lba as u64 + a_blocks > *b_lba as u64 {
                return Err(AutoInstallError::layout(format!(
                    "extents of {} and {} overlap at block {}",
                    a_path, b_path, b_lba
                )));
            }
        }
        Ok(())
    }

    fn system_use(&mut self, bytes: &[u8]) -> Result<SystemUse> {
        let continuation = match rock_ridge::find_continuation(bytes) {
            None => None,
            Some(ce) => {
                if ce.offset as usize + ce.length as usize > BLOCK_SIZE || ce.block >= self.volume_blocks {
                    return Err(AutoInstallError::layout(format!(
                        "continuation area at block {} offset {} length {} is invalid",
                        ce.block, ce.offset, ce.length
                    )));
                }
                let data = read_at(
                    self.source,
                    ce.block as u64 * BLOCK_SIZE as u64 + ce.offset as u64,
                    ce.length as usize,
                )?;
                if rock_ridge::find_continuation(&data).is_some() {
                    return Err(AutoInstallError::layout(
                        "chained System Use continuation areas are not supported",
                    ));
                }
                Some(Continuation {
                    entry_offset: ce.entry_offset,
                    data,
                })
            }
        };
        Ok(SystemUse {
            bytes: bytes.to_vec(),
            continuation,
        })
    }

    fn meta(&mut self, record: &RawRecord) -> Result<EntryMeta> {
        Ok(EntryMeta {
            recorded: record.recorded,
            flags: record.flags,
            system_use: self.system_use(&record.system_use)?,
        })
    }

    fn load_dir(
        &mut self,
        record: &RawRecord,
        name: String,
        meta: EntryMeta,
        path: &mut Vec<String>,
        depth: usize,
    ) -> Result<DirNode> {
        if depth > MAX_DEPTH {
            return Err(AutoInstallError::layout(format!(
                "directory nesting below /{} exceeds {} levels",
                path.join("/"),
                MAX_DEPTH
            )));
        }
        if !self.visited.insert(record.extent) {
            return Err(AutoInstallError::layout(format!(
                "directory extent at block {} is referenced more than once",
                record.extent
            )));
        }
        self.claim(record.extent, record.data_len as u64, path)?;
        self.dir_extents.push(record.extent);

        let data = read_at(
            self.source,
            record.extent as u64 * BLOCK_SIZE as u64,
            record.data_len as usize,
        )?;
        let mut records = directory::parse_extent(&data)?.into_iter();
        let dot = records
            .next()
            .filter(|r| r.identifier == SELF_IDENTIFIER)
            .ok_or_else(|| AutoInstallError::layout(format!("/{} has no \".\" record", path.join("/"))))?;
        let dotdot = records
            .next()
            .filter(|r| r.identifier == PARENT_IDENTIFIER)
            .ok_or_else(|| AutoInstallError::layout(format!("/{} has no \"..\" record", path.join("/"))))?;

        let mut children = Vec::new();
        for child in records {
            if child.is_self_or_parent() {
                warn!("Skipping stray self/parent record in /{}", path.join("/"));
                continue;
            }
            let meta = self.meta(&child)?;
            let name = rock_ridge::alternate_name(meta.system_use.areas())
                .unwrap_or_else(|| display_name(&child.identifier));
            path.push(name.clone());

            if child.flags & FLAG_MULTI_EXTENT != 0 {
                return Err(AutoInstallError::layout(format!(
                    "/{} is a multi-extent file",
                    path.join("/")
                )));
            }

            let node = if child.is_directory() {
                Node::Dir(self.load_dir(&child, name, meta, path, depth + 1)?)
            } else {
                self.claim(child.extent, child.data_len as u64, path)?;
                if child.data_len > 0 {
                    self.file_lbas.entry(child.extent).or_insert_with(|| path.clone());
                }
                Node::File(FileNode {
                    name,
                    identifier: child.identifier,
                    meta,
                    data: FileData::Source {
                        lba: child.extent,
                        len: child.data_len as u64,
                    },
                    boot_catalog: false,
                })
            };
            path.pop();
            children.push(node);
        }

        Ok(DirNode {
            name,
            identifier: record.identifier.clone(),
            meta,
            dot: self.meta(&dot)?,
            dotdot: self.meta(&dotdot)?,
            children,
        })
    }
}

/// The Type L path table must list exactly the directories of the tree
fn check_path_table(source: &mut dyn ImageSource, volume: &PrimaryVolume, mut dir_extents: Vec<u32>) -> Result<()> {
    let table = read_at(
        source,
        volume.l_path_table as u64 * BLOCK_SIZE as u64,
        volume.path_table_size as usize,
    )?;
    let mut listed: Vec<u32> = path_table::parse_l(&table)?.into_iter().map(|r| r.extent).collect();
    listed.sort_unstable();
    dir_extents.sort_unstable();
    if listed != dir_extents {
        return Err(AutoInstallError::layout(format!(
            "path table lists {} directories that disagree with the {} in the directory tree",
            listed.len(),
            dir_extents.len()
        )));
    }
    Ok(())
}
