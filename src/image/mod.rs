// file: src/image/mod.rs
// version: 2.0.0
// guid: 701b24fd-08d5-4400-aa48-ddfe863bf052

//! Autoinstall image building
//!
//! This module handles:
//! - Seed (`user-data` / `meta-data`) validation and injection
//! - Boot menu patching for GRUB and isolinux
//! - Boot catalog selection (BIOS / UEFI)

pub mod builder;

pub use builder::{AutoInstallBuilder, AutoInstallPayload, BuildOptions, BuildState};
