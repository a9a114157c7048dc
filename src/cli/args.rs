// file: src/cli/args.rs
// version: 2.0.0
// guid: a229facd-278a-4d3c-a4d4-0aaf0cad758f

//! Command line argument definitions

use crate::config::{Architecture, Release};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ubautoiso")]
#[command(about = "Build an unattended Ubuntu Server installer ISO")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Autoinstall configuration (cloud-init user-data or a bare autoinstall document)
    #[arg(value_name = "AUTOINSTALL_FILE")]
    pub autoinstall_file: PathBuf,

    /// Output image [default: ./autoinstall.iso]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory for cached release images [default: $XDG_CACHE_HOME/ubautoiso]
    #[arg(short, long, env = "UBAUTOISO_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Ubuntu release, YY.MM or YY.MM.P
    #[arg(short, long, default_value = "20.04", value_parser = parse_release)]
    pub release: Release,

    /// Image architecture (overrides the config file)
    #[arg(short, long, value_enum, ignore_case = true)]
    pub arch: Option<ArchArg>,

    /// Start the installation without asking for confirmation
    #[arg(long)]
    pub no_prompt: bool,

    /// Disable legacy BIOS (MBR) boot
    #[arg(long, conflicts_with = "no_efi")]
    pub no_mbr: bool,

    /// Disable UEFI boot
    #[arg(long)]
    pub no_efi: bool,

    /// Settings file [default: $XDG_CONFIG_HOME/ubautoiso/config.yaml]
    #[arg(long, env = "UBAUTOISO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,
}

fn parse_release(value: &str) -> Result<Release, String> {
    value.parse().map_err(|e: crate::error::AutoInstallError| e.to_string())
}

/// Architecture argument for CLI
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchArg {
    Amd64,
    Arm64,
}

impl From<ArchArg> for Architecture {
    fn from(arch: ArchArg) -> Self {
        match arch {
            ArchArg::Amd64 => Architecture::Amd64,
            ArchArg::Arm64 => Architecture::Arm64,
        }
    }
}

impl From<Architecture> for ArchArg {
    fn from(arch: Architecture) -> Self {
        match arch {
            Architecture::Amd64 => ArchArg::Amd64,
            Architecture::Arm64 => ArchArg::Arm64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["ubautoiso", "user-data.yaml"]).unwrap();
        assert_eq!(cli.autoinstall_file, PathBuf::from("user-data.yaml"));
        assert_eq!(cli.release.to_string(), "20.04");
        assert!(!cli.no_prompt && !cli.no_mbr && !cli.no_efi);
        assert_eq!(cli.arch, None);
    }

    #[test]
    fn test_flags_and_values() {
        let cli = Cli::try_parse_from([
            "ubautoiso",
            "-o",
            "out.iso",
            "-r",
            "22.04.3",
            "--arch",
            "ARM64",
            "--no-prompt",
            "--no-efi",
            "seed.yaml",
        ])
        .unwrap();
        assert_eq!(cli.output, Some(PathBuf::from("out.iso")));
        assert_eq!(cli.release.point(), Some(3));
        assert_eq!(cli.arch.map(Architecture::from), Some(Architecture::Arm64));
        assert!(cli.no_prompt && cli.no_efi && !cli.no_mbr);
    }

    #[test]
    fn test_both_boot_disables_conflict() {
        let result = Cli::try_parse_from(["ubautoiso", "--no-mbr", "--no-efi", "seed.yaml"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_release_rejected() {
        let result = Cli::try_parse_from(["ubautoiso", "-r", "focal", "seed.yaml"]);
        assert!(result.is_err());
    }
}
