// file: src/iso/fixture.rs
// version: 1.0.0
// guid: dcf3673a-3990-4624-8607-b30a39a42c28

//! Synthetic installer images for tests
//!
//! Builds a small image shaped like an Ubuntu live-server ISO: GRUB and
//! isolinux menus, a BIOS no-emulation boot image with a boot info table, an
//! EFI boot image, an isohybrid MBR, Rock Ridge names and a Joliet
//! descriptor. File data is laid out before the directories, the reverse of
//! what [`IsoImage::write`](super::IsoImage::write) produces, so every edit
//! exercises relocation.

use super::bytes::{put_both_u32, put_u32_le};
use super::descriptor::{terminator, BootRecord, PrimaryLayout, PrimaryVolume, DESCRIPTOR_START};
use super::directory::{identifier_cmp, make_identifier, packed_size, push_packed, RawRecord, FLAG_DIRECTORY};
use super::eltorito::{BootCatalog, BootEntry, PLATFORM_EFI, PLATFORM_X86};
use super::path_table::{self, PathTableRecord, PathTableType};
use super::rock_ridge::{self, CE_ENTRY_LEN};
use super::{blocks_for, BLOCK_SIZE};
use crate::error::Result;
use std::path::Path;

/// Stock GRUB menu of a live-server image
pub const GRUB_CFG: &str = r#"set timeout=30

loadfont unicode

set menu_color_normal=white/black
set menu_color_highlight=black/light-gray

menuentry "Try or Install Ubuntu Server" {
	set gfxpayload=keep
	linux	/casper/vmlinuz  ---
	initrd	/casper/initrd
}
menuentry "Ubuntu Server with the HWE kernel" {
	set gfxpayload=keep
	linux	/casper/hwe-vmlinuz  ---
	initrd	/casper/hwe-initrd
}
grub_platform
if [ "$grub_platform" = "efi" ]; then
menuentry 'Boot from next volume' {
	exit 1
}
menuentry 'UEFI Firmware Settings' {
	fwsetup
}
fi
"#;

/// Stock isolinux text menu
pub const TXT_CFG: &str = "default live
label live
  menu label ^Install Ubuntu Server
  kernel /casper/vmlinuz
  append   initrd=/casper/initrd quiet  ---
label memtest
  menu label Test ^memory
  kernel /install/mt86plus
";

pub const VOLUME_ID: &str = "Ubuntu-Server 22.04.4 LTS amd64";

const MD5SUM_TXT: &str = "d41d8cd98f00b204e9800998ecf8427e  ./ubuntu\n";

/// Recording date shared by every record (2024-04-01 12:00:00 UTC)
const DATE: [u8; 7] = [124, 4, 1, 12, 0, 0, 0];

const FIRST_FILE_BLOCK: u32 = 24;

const ER_IDENTIFIER: &[u8] = b"RRIP_1991A";
const ER_DESCRIPTOR: &[u8] = b"THE ROCK RIDGE INTERCHANGE PROTOCOL PROVIDES SUPPORT FOR POSIX FILE SYSTEM SEMANTICS";
const ER_SOURCE: &[u8] = b"PLEASE CONTACT DISC PUBLISHER FOR SPECIFICATION SOURCE.  SEE PUBLISHER IDENTIFIER IN PRIMARY VOLUME DESCRIPTOR FOR CONTACT INFORMATION.";

/// Shape of the generated image
#[derive(Debug, Clone)]
pub struct FixtureOptions {
    /// Carry Rock Ridge names (`SP`/`PX`/`NM`, plus a `CE` on the root)
    pub rock_ridge: bool,
    /// BIOS boot entry, isolinux directory and isohybrid MBR
    pub bios: bool,
    /// UEFI boot entry and `/boot/grub/efi.img`
    pub efi: bool,
    /// Contents of `/boot/grub/grub.cfg`; `None` leaves it out
    pub grub_cfg: Option<String>,
    /// Include `/isolinux/txt.cfg` (needs `bios`)
    pub isolinux_cfg: bool,
    /// Hybrid MBR shaped like 20.04: empty-typed partition 1 over the whole
    /// image and an `0xEF` partition 2 over `efi.img` (needs `bios` and `efi`)
    pub efi_partition: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            rock_ridge: true,
            bios: true,
            efi: true,
            grub_cfg: Some(GRUB_CFG.to_string()),
            isolinux_cfg: true,
            efi_partition: false,
        }
    }
}

/// Contents of `/casper/vmlinuz`
pub fn kernel_bytes() -> Vec<u8> {
    let mut data = pattern(5000, 0x4B);
    data[..2].copy_from_slice(b"MZ");
    data
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Plain,
    Catalog,
    BiosImage,
    EfiImage,
}

struct Item {
    name: String,
    identifier: Vec<u8>,
    parent: usize,
    children: Vec<usize>,
    /// `None` for directories
    data: Option<Vec<u8>>,
    role: Role,
    lba: u32,
    size: u32,
}

const ROOT: usize = 0;

struct Tree {
    items: Vec<Item>,
}

impl Tree {
    fn new() -> Self {
        Self {
            items: vec![Item {
                name: String::new(),
                identifier: vec![0],
                parent: ROOT,
                children: Vec::new(),
                data: None,
                role: Role::Plain,
                lba: 0,
                size: 0,
            }],
        }
    }

    fn add(&mut self, parent: usize, name: &str, data: Option<Vec<u8>>, role: Role) -> usize {
        let id = self.items.len();
        self.items.push(Item {
            name: name.to_string(),
            identifier: make_identifier(name, data.is_none()),
            parent,
            children: Vec::new(),
            data,
            role,
            lba: 0,
            size: 0,
        });
        self.items[parent].children.push(id);
        id
    }

    fn dir(&mut self, parent: usize, name: &str) -> usize {
        self.add(parent, name, None, Role::Plain)
    }

    fn file(&mut self, parent: usize, name: &str, data: Vec<u8>, role: Role) -> usize {
        self.add(parent, name, Some(data), role)
    }

    fn sort(&mut self) {
        for index in 0..self.items.len() {
            let mut children = std::mem::take(&mut self.items[index].children);
            children.sort_by(|&a, &b| identifier_cmp(&self.items[a].identifier, &self.items[b].identifier));
            self.items[index].children = children;
        }
    }

    fn breadth_first(&self) -> Vec<usize> {
        let mut order = vec![ROOT];
        let mut index = 0;
        while index < order.len() {
            let dir = order[index];
            order.extend(self.items[dir].children.iter().copied().filter(|&c| self.items[c].data.is_none()));
            index += 1;
        }
        order
    }

    fn role(&self, role: Role) -> Option<usize> {
        self.items.iter().position(|i| i.role == role)
    }
}

fn sp_entry() -> Vec<u8> {
    vec![b'S', b'P', 7, 1, 0xBE, 0xEF, 0]
}

fn er_entry() -> Vec<u8> {
    let len = 8 + ER_IDENTIFIER.len() + ER_DESCRIPTOR.len() + ER_SOURCE.len();
    let mut entry = vec![
        b'E',
        b'R',
        len as u8,
        1,
        ER_IDENTIFIER.len() as u8,
        ER_DESCRIPTOR.len() as u8,
        ER_SOURCE.len() as u8,
        1,
    ];
    entry.extend_from_slice(ER_IDENTIFIER);
    entry.extend_from_slice(ER_DESCRIPTOR);
    entry.extend_from_slice(ER_SOURCE);
    entry
}

fn ce_entry(block: u32, length: u32) -> Vec<u8> {
    let mut entry = vec![0u8; CE_ENTRY_LEN];
    entry[..4].copy_from_slice(&[b'C', b'E', CE_ENTRY_LEN as u8, 1]);
    put_both_u32(&mut entry, 4, block);
    put_both_u32(&mut entry, 12, 0);
    put_both_u32(&mut entry, 20, length);
    entry
}

struct Encoder<'a> {
    tree: &'a Tree,
    rock_ridge: bool,
    continuation_block: u32,
    continuation_len: u32,
}

impl Encoder<'_> {
    fn dot_system_use(&self, dir: usize) -> Vec<u8> {
        if !self.rock_ridge {
            return Vec::new();
        }
        if dir == ROOT {
            let mut area = sp_entry();
            area.extend(rock_ridge::px_entry(true));
            area.extend(ce_entry(self.continuation_block, self.continuation_len));
            area
        } else {
            rock_ridge::px_entry(true)
        }
    }

    fn parent_system_use(&self) -> Vec<u8> {
        if self.rock_ridge {
            rock_ridge::px_entry(true)
        } else {
            Vec::new()
        }
    }

    fn child_system_use(&self, item: &Item) -> Vec<u8> {
        if self.rock_ridge {
            rock_ridge::synthesize(&item.name, item.data.is_none())
        } else {
            Vec::new()
        }
    }

    fn records(&self, dir: usize) -> Vec<RawRecord> {
        let item = &self.tree.items[dir];
        let parent = &self.tree.items[item.parent];
        let mut records = vec![
            RawRecord {
                extent: item.lba,
                data_len: item.size,
                recorded: DATE,
                flags: FLAG_DIRECTORY,
                identifier: vec![0],
                system_use: self.dot_system_use(dir),
            },
            RawRecord {
                extent: parent.lba,
                data_len: parent.size,
                recorded: DATE,
                flags: FLAG_DIRECTORY,
                identifier: vec![1],
                system_use: self.parent_system_use(),
            },
        ];
        for &child in &item.children {
            let child = &self.tree.items[child];
            let (data_len, flags) = match &child.data {
                Some(data) => (data.len() as u32, 0),
                None => (child.size, FLAG_DIRECTORY),
            };
            records.push(RawRecord {
                extent: child.lba,
                data_len,
                recorded: DATE,
                flags,
                identifier: child.identifier.clone(),
                system_use: self.child_system_use(child),
            });
        }
        records
    }

    fn size(&self, dir: usize) -> u32 {
        packed_size(self.records(dir).iter().map(RawRecord::encoded_len)) as u32
    }

    fn encode(&self, dir: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for record in self.records(dir) {
            push_packed(&mut out, &record);
        }
        out.resize(self.tree.items[dir].size as usize, 0);
        out
    }
}

fn place(image: &mut [u8], lba: u32, data: &[u8]) {
    let start = lba as usize * BLOCK_SIZE;
    image[start..start + data.len()].copy_from_slice(data);
}

fn fill_boot_info_table(image: &mut [u8], lba: u32) {
    let len = image.len() as u32;
    image[8..64].fill(0);
    let checksum = image[64..]
        .chunks(4)
        .map(|c| {
            let mut word = [0u8; 4];
            word[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(word)
        })
        .fold(0u32, |sum, w| sum.wrapping_add(w));
    put_u32_le(image, 8, DESCRIPTOR_START);
    put_u32_le(image, 12, lba);
    put_u32_le(image, 16, len);
    put_u32_le(image, 20, checksum);
}

/// Build the image in memory
pub fn build(options: &FixtureOptions) -> Vec<u8> {
    let mut tree = Tree::new();
    let boot = tree.dir(ROOT, "boot");
    let grub = tree.dir(boot, "grub");
    if let Some(cfg) = &options.grub_cfg {
        tree.file(grub, "grub.cfg", cfg.as_bytes().to_vec(), Role::Plain);
    }
    if options.efi {
        tree.file(grub, "efi.img", pattern(8192, 0xE1), Role::EfiImage);
    }
    let casper = tree.dir(ROOT, "casper");
    tree.file(casper, "vmlinuz", kernel_bytes(), Role::Plain);
    tree.file(casper, "initrd", pattern(3000, 0x1D), Role::Plain);
    if options.bios {
        let isolinux = tree.dir(ROOT, "isolinux");
        tree.file(isolinux, "isolinux.bin", pattern(4096, 0x15), Role::BiosImage);
        if options.isolinux_cfg {
            tree.file(isolinux, "txt.cfg", TXT_CFG.as_bytes().to_vec(), Role::Plain);
        }
        tree.file(isolinux, "boot.cat", vec![0; BLOCK_SIZE], Role::Catalog);
    } else if options.efi {
        tree.file(ROOT, "boot.catalog", vec![0; BLOCK_SIZE], Role::Catalog);
    }
    tree.file(ROOT, "md5sum.txt", MD5SUM_TXT.as_bytes().to_vec(), Role::Plain);
    tree.dir(ROOT, "pool");
    tree.file(ROOT, "ubuntu", Vec::new(), Role::Plain);
    tree.sort();

    // Files first
    let mut next = FIRST_FILE_BLOCK;
    for item in tree.items.iter_mut() {
        if let Some(data) = &item.data {
            item.lba = next;
            next += blocks_for(data.len() as u64) as u32;
        }
    }

    let order = tree.breadth_first();
    let er = er_entry();
    let sizes: Vec<u32> = {
        let sizing = Encoder {
            tree: &tree,
            rock_ridge: options.rock_ridge,
            continuation_block: 0,
            continuation_len: er.len() as u32,
        };
        order.iter().map(|&d| sizing.size(d)).collect()
    };

    let l_path_table = next;
    let m_path_table = next + 1;
    next += 2;
    let mut lbas = Vec::with_capacity(order.len());
    for size in &sizes {
        lbas.push(next);
        next += size / BLOCK_SIZE as u32;
    }
    let continuation_block = next;
    if options.rock_ridge {
        next += 1;
    }
    let total = next;

    for ((&dir, size), lba) in order.iter().zip(&sizes).zip(&lbas) {
        tree.items[dir].size = *size;
        tree.items[dir].lba = *lba;
    }

    let bios_lba = tree.role(Role::BiosImage).map(|i| tree.items[i].lba);
    if let Some(index) = tree.role(Role::BiosImage) {
        let lba = tree.items[index].lba;
        if let Some(data) = tree.items[index].data.as_mut() {
            fill_boot_info_table(data, lba);
        }
    }
    let efi = tree
        .role(Role::EfiImage)
        .map(|i| (tree.items[i].lba, tree.items[i].data.as_ref().map_or(0, Vec::len)));
    let catalog = match (bios_lba, efi) {
        (Some(bios), Some((efi_lba, efi_len))) => Some(BootCatalog::new(
            "UBAUTOISO FIXTURE",
            BootEntry::no_emulation(PLATFORM_X86, true, bios, 4),
            vec![BootEntry::no_emulation(PLATFORM_EFI, false, efi_lba, (efi_len / 512) as u16)],
        )),
        (Some(bios), None) => Some(BootCatalog::new(
            "UBAUTOISO FIXTURE",
            BootEntry::no_emulation(PLATFORM_X86, true, bios, 4),
            Vec::new(),
        )),
        (None, Some((efi_lba, efi_len))) => Some(BootCatalog::new(
            "UBAUTOISO FIXTURE",
            BootEntry::no_emulation(PLATFORM_EFI, true, efi_lba, (efi_len / 512) as u16),
            Vec::new(),
        )),
        (None, None) => None,
    };
    let catalog_index = tree.role(Role::Catalog);
    if let (Some(catalog), Some(index)) = (&catalog, catalog_index) {
        tree.items[index].data = Some(catalog.encode());
    }

    let encoder = Encoder {
        tree: &tree,
        rock_ridge: options.rock_ridge,
        continuation_block,
        continuation_len: er.len() as u32,
    };

    let mut image = vec![0u8; total as usize * BLOCK_SIZE];

    if let Some(bios) = bios_lba {
        image[..16].copy_from_slice(b"isohybrid mbr\0\0\0");
        put_u32_le(&mut image, 432, bios * 4);
        image[446] = 0x80;
        image[446 + 4] = if options.efi_partition { 0x00 } else { 0x17 };
        put_u32_le(&mut image, 446 + 8, 0);
        put_u32_le(&mut image, 446 + 12, total * 4);
        if let (true, Some((efi_lba, efi_len))) = (options.efi_partition, efi) {
            image[462 + 4] = 0xEF;
            put_u32_le(&mut image, 462 + 8, efi_lba * 4);
            put_u32_le(&mut image, 462 + 12, efi_len.div_ceil(512) as u32);
        }
        image[510] = 0x55;
        image[511] = 0xAA;
    }

    let records: Vec<PathTableRecord> = order
        .iter()
        .map(|&d| {
            let item = &tree.items[d];
            let parent = order.iter().position(|&p| p == item.parent).unwrap_or(0);
            PathTableRecord {
                extent: item.lba,
                parent: (parent + 1) as u16,
                identifier: item.identifier.clone(),
            }
        })
        .collect();
    let l_table = path_table::encode(&records, PathTableType::LittleEndian);
    place(&mut image, l_path_table, &l_table);
    place(&mut image, m_path_table, &path_table::encode(&records, PathTableType::BigEndian));

    let mut primary = PrimaryVolume::blank(VOLUME_ID);
    primary.root.recorded = DATE;
    let pvd = primary.encode(&PrimaryLayout {
        volume_space_size: total,
        path_table_size: l_table.len() as u32,
        l_path_table,
        m_path_table,
        root_extent: tree.items[ROOT].lba,
        root_size: tree.items[ROOT].size,
    });
    let mut descriptors = vec![pvd.clone()];
    if catalog.is_some() {
        let catalog_lba = catalog_index.map_or(0, |i| tree.items[i].lba);
        descriptors.push(BootRecord::new(catalog_lba).encode(catalog_lba));
    }
    let mut joliet = pvd;
    joliet[0] = 2;
    descriptors.push(joliet);
    descriptors.push(terminator());
    for (i, descriptor) in descriptors.iter().enumerate() {
        place(&mut image, DESCRIPTOR_START + i as u32, descriptor);
    }

    for item in &tree.items {
        if let Some(data) = &item.data {
            place(&mut image, item.lba, data);
        }
    }
    for &dir in &order {
        place(&mut image, tree.items[dir].lba, &encoder.encode(dir));
    }
    if options.rock_ridge {
        place(&mut image, continuation_block, &er);
    }

    image
}

/// Build the image and write it to `path`
pub fn write(path: &Path, options: &FixtureOptions) -> Result<()> {
    std::fs::write(path, build(options))?;
    Ok(())
}
