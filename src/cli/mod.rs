// file: src/cli/mod.rs
// version: 2.0.0
// guid: 578dd1e9-f3cb-4ec6-9534-21ce205fb92d

//! Command line interface for the autoinstall ISO builder

pub mod args;
pub mod commands;

pub use args::{ArchArg, Cli};
pub use commands::{build_command, resolve_request};
