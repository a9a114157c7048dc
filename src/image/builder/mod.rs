// file: src/image/builder/mod.rs
// version: 2.0.0
// guid: f9f03c0b-e513-4561-a934-9e0147e24686

//! Autoinstall patch sequence over a loaded [`IsoImage`]

mod menu;
mod seed;

pub use menu::{patch_grub_cfg, patch_isolinux_cfg, strip_stamped_block, GRUB_SEED_ARG, SEED_ARG};
pub use seed::{AutoInstallPayload, SEED_DIR};

use crate::config::settings::DEFAULT_GRUB_ENTRY_STAMP;
use crate::error::AutoInstallError;
use crate::iso::{IsoImage, PlatformKind};
use crate::Result;
use std::fmt;
use tracing::{debug, info};

/// GRUB menu of the live-server image
pub const GRUB_CFG_PATH: &str = "/boot/grub/grub.cfg";

/// isolinux text menu on BIOS-bootable images
pub const ISOLINUX_CFG_PATH: &str = "/isolinux/txt.cfg";

/// Progress of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Loaded,
    SeedInjected,
    MenuPatched,
    BootEntriesResolved,
    Done,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildState::Loaded => "loaded",
            BuildState::SeedInjected => "seed injected",
            BuildState::MenuPatched => "menu patched",
            BuildState::BootEntriesResolved => "boot entries resolved",
            BuildState::Done => "done",
        };
        f.write_str(name)
    }
}

/// What the build should produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Title and marker of the injected menu entry
    pub grub_entry_stamp: String,
    /// Pass `autoinstall` so the installer does not ask for confirmation
    pub no_prompt: bool,
    /// Keep the BIOS (MBR) boot entry
    pub supports_mbr: bool,
    /// Keep the UEFI boot entry
    pub supports_efi: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            grub_entry_stamp: DEFAULT_GRUB_ENTRY_STAMP.to_string(),
            no_prompt: false,
            supports_mbr: true,
            supports_efi: true,
        }
    }
}

/// Applies the autoinstall patches to an image
///
/// The builder only talks to the image through paths and platform kinds. A
/// failed build leaves the image partially patched; reload it to retry.
pub struct AutoInstallBuilder<'a> {
    image: &'a mut IsoImage,
    payload: AutoInstallPayload,
    options: BuildOptions,
    state: BuildState,
}

impl<'a> AutoInstallBuilder<'a> {
    pub fn new(image: &'a mut IsoImage, payload: AutoInstallPayload, options: BuildOptions) -> Self {
        Self {
            image,
            payload,
            options,
            state: BuildState::Loaded,
        }
    }

    /// Current build state
    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Run the whole patch sequence
    pub fn build(&mut self) -> Result<()> {
        if self.state != BuildState::Loaded {
            return Err(AutoInstallError::BuilderState(format!(
                "build() called on a builder that is already {}",
                self.state
            )));
        }
        if !self.options.supports_mbr && !self.options.supports_efi {
            return Err(AutoInstallError::NoBootEntryRemaining);
        }

        info!("Building autoinstall image from {}", self.image.volume_id());
        self.inject_seed()?;
        self.advance(BuildState::SeedInjected);

        self.patch_menus()?;
        self.advance(BuildState::MenuPatched);

        self.resolve_boot_entries()?;
        self.advance(BuildState::BootEntriesResolved);

        self.advance(BuildState::Done);
        Ok(())
    }

    fn advance(&mut self, next: BuildState) {
        debug!("Build state: {} -> {}", self.state, next);
        self.state = next;
    }

    fn put_file(&mut self, path: &str, data: Vec<u8>) -> Result<()> {
        if self.image.exists(path) {
            self.image.replace_file(path, data)
        } else {
            self.image.add_file(path, data)
        }
    }

    fn inject_seed(&mut self) -> Result<()> {
        let user_data = self.payload.user_data().as_bytes().to_vec();
        let meta_data = self.payload.meta_data().as_bytes().to_vec();
        self.put_file(&AutoInstallPayload::user_data_path(), user_data)?;
        self.put_file(&AutoInstallPayload::meta_data_path(), meta_data)?;
        info!("Injected autoinstall seed into {}", SEED_DIR);
        Ok(())
    }

    fn patch_menus(&mut self) -> Result<()> {
        let stamp = self.options.grub_entry_stamp.clone();
        let no_prompt = self.options.no_prompt;

        let grub = read_text(self.image, GRUB_CFG_PATH)?;
        let patched = patch_grub_cfg(&grub, &stamp, no_prompt)?;
        self.image.replace_file(GRUB_CFG_PATH, patched.into_bytes())?;
        info!("Added '{}' entry to {}", stamp, GRUB_CFG_PATH);

        if self.options.supports_mbr && self.image.exists(ISOLINUX_CFG_PATH) {
            let isolinux = read_text(self.image, ISOLINUX_CFG_PATH)?;
            let patched = patch_isolinux_cfg(&isolinux, &stamp, no_prompt)?;
            self.image.replace_file(ISOLINUX_CFG_PATH, patched.into_bytes())?;
            info!("Added '{}' entry to {}", stamp, ISOLINUX_CFG_PATH);
        }
        Ok(())
    }

    fn resolve_boot_entries(&mut self) -> Result<()> {
        if !self.options.supports_mbr {
            self.image.disable_boot_entry(PlatformKind::Bios)?;
        }
        if !self.options.supports_efi {
            self.image.disable_boot_entry(PlatformKind::Uefi)?;
        }
        Ok(())
    }
}

fn read_text(image: &mut IsoImage, path: &str) -> Result<String> {
    let data = image.read_file(path)?;
    String::from_utf8(data)
        .map_err(|_| AutoInstallError::layout(format!("{} is not valid UTF-8", path)))
}
