// file: src/pipeline.rs
// version: 1.0.0
// guid: c65834a3-1ad7-48f2-a681-3e0f5c539c10

//! Fetch, patch and write one autoinstall image

use crate::config::{Release, Settings};
use crate::error::AutoInstallError;
use crate::image::{AutoInstallBuilder, AutoInstallPayload, BuildOptions};
use crate::iso::IsoImage;
use crate::logging::{with_async_operation_span, with_operation_span};
use crate::network::{ImageFetcher, Transport};
use crate::reporter::ProgressReporter;
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Everything one build needs from the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Where the finished image goes
    pub output: PathBuf,
    /// Root of the release image cache
    pub cache_dir: PathBuf,
    /// Release to build from
    pub release: Release,
    /// Skip the installer's confirmation prompt
    pub no_prompt: bool,
    /// Disable BIOS (MBR) boot
    pub no_mbr: bool,
    /// Disable UEFI boot
    pub no_efi: bool,
    /// User autoinstall configuration
    pub autoinstall_file: PathBuf,
}

impl BuildRequest {
    /// Builder options for this request
    pub fn build_options(&self, settings: &Settings) -> BuildOptions {
        BuildOptions {
            grub_entry_stamp: settings.grub_entry_stamp.clone(),
            no_prompt: self.no_prompt,
            supports_mbr: !self.no_mbr,
            supports_efi: !self.no_efi,
        }
    }
}

/// Run a build against the configured mirror
pub async fn run(
    request: &BuildRequest,
    settings: &Settings,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<PathBuf> {
    let fetcher = ImageFetcher::from_settings(settings, &request.cache_dir)?;
    run_with_fetcher(request, settings, &fetcher, reporter).await
}

/// Raises the shared flag when dropped
///
/// A build future that is dropped mid-write (Ctrl+C) stops the blocking
/// writer at its next block instead of letting it finish the output.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Run a build with a caller-supplied fetcher
pub async fn run_with_fetcher<T: Transport>(
    request: &BuildRequest,
    settings: &Settings,
    fetcher: &ImageFetcher<T>,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<PathBuf> {
    with_async_operation_span("build", || async {
        if request.no_mbr && request.no_efi {
            return Err(AutoInstallError::NoBootEntryRemaining);
        }
        let payload = load_payload(&request.autoinstall_file).await?;

        let source = fetcher.fetch(&request.release, reporter.as_ref()).await?;

        let options = request.build_options(settings);
        let output = request.output.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_guard = CancelOnDrop(cancel.clone());
        tokio::task::spawn_blocking(move || {
            patch_and_write(&source, &output, payload, options, reporter.as_ref(), &cancel)
        })
        .await
        .map_err(|e| AutoInstallError::internal(format!("image task failed: {}", e)))??;

        info!("Autoinstall image ready: {}", request.output.display());
        Ok(request.output.clone())
    })
    .await
}

async fn load_payload(path: &Path) -> Result<AutoInstallPayload> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        AutoInstallError::config(format!(
            "Failed to read autoinstall file {}: {}",
            path.display(),
            e
        ))
    })?;
    AutoInstallPayload::from_yaml(&text)
}

/// Load `source`, apply the autoinstall patches and write `output`
///
/// Setting `cancel` aborts the write without leaving a file at `output`.
pub fn patch_and_write(
    source: &Path,
    output: &Path,
    payload: AutoInstallPayload,
    options: BuildOptions,
    reporter: &dyn ProgressReporter,
    cancel: &AtomicBool,
) -> Result<()> {
    with_operation_span("patch", || {
        let mut image = IsoImage::load(source)?;
        AutoInstallBuilder::new(&mut image, payload, options).build()?;
        image.write_cancellable(output, reporter, cancel)
    })
}
