// file: src/lib.rs
// version: 3.0.0
// guid: be474b53-24c4-496b-baa9-018d227a2a11

//! # ubautoiso
//!
//! Builds unattended Ubuntu Server installer images. A pristine release ISO is
//! fetched into a local cache and checked against the published `SHA256SUMS`,
//! then an autoinstall seed and a stamped boot menu entry are injected and the
//! ISO9660 / El Torito image is written out again.
//!
//! The library is split into:
//! - [`network`]: resumable, verified release image fetch
//! - [`iso`]: ISO9660 + El Torito reader, editor and writer
//! - [`image`]: the autoinstall patch sequence
//! - [`pipeline`]: fetch, patch and write in one call

pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod iso;
pub mod logging;
pub mod network;
pub mod pipeline;
pub mod reporter;
pub mod utils;

pub use error::{AutoInstallError, ErrorKind, Result};

/// Version information for the tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
