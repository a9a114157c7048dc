// file: src/cli/commands.rs
// version: 2.0.0
// guid: 623b2de3-7a98-4784-8197-8d455c4268ed

//! Command implementations for the CLI

use super::args::Cli;
use crate::{
    config::{loader::ConfigLoader, Settings},
    pipeline::{self, BuildRequest},
    reporter::{ConsoleProgress, NoProgress, ProgressReporter},
    Result,
};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Default output file name in the working directory
pub const DEFAULT_OUTPUT: &str = "autoinstall.iso";

/// Turn parsed arguments into settings and a build request
pub fn resolve_request(cli: &Cli) -> Result<(BuildRequest, Settings)> {
    let loader = ConfigLoader::new();
    let mut settings = loader.load_settings(cli.config.as_deref())?;
    if let Some(arch) = cli.arch {
        settings.architecture = arch.into();
    }

    let output = match &cli.output {
        Some(path) => ConfigLoader::expand_path(path),
        None => std::env::current_dir()?.join(DEFAULT_OUTPUT),
    };
    let cache_dir = match &cli.cache_dir {
        Some(path) => ConfigLoader::expand_path(path),
        None => ConfigLoader::default_cache_dir()?,
    };

    let autoinstall_file = ConfigLoader::expand_path(&cli.autoinstall_file);
    if !autoinstall_file.is_file() {
        return Err(crate::error::AutoInstallError::ConfigError(format!(
            "Autoinstall file not found: {}",
            autoinstall_file.display()
        )));
    }

    let request = BuildRequest {
        output,
        cache_dir,
        release: cli.release.clone(),
        no_prompt: cli.no_prompt,
        no_mbr: cli.no_mbr,
        no_efi: cli.no_efi,
        autoinstall_file,
    };
    debug!("Build request: {:?}", request);
    Ok((request, settings))
}

/// Fetch the release image, patch it and write the autoinstall image
pub async fn build_command(cli: &Cli) -> Result<PathBuf> {
    let (request, settings) = resolve_request(cli)?;
    info!(
        "Building Ubuntu {} ({}) autoinstall image",
        request.release,
        settings.architecture.as_str()
    );

    tokio::fs::create_dir_all(&request.cache_dir).await?;

    let reporter: Arc<dyn ProgressReporter> = if cli.quiet {
        Arc::new(NoProgress)
    } else {
        Arc::new(ConsoleProgress::new())
    };
    let output = pipeline::run(&request, &settings, reporter).await?;

    if !cli.quiet {
        println!(
            "{} {}",
            "You're ready to burn:".bright_green().bold(),
            output.display()
        );
    }
    Ok(output)
}
