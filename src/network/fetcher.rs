// file: src/network/fetcher.rs
// version: 1.0.0
// guid: 44a4d142-71c6-4df9-be75-1f4132a40486

//! Cached, resumable and checksum-verified release image fetch
//!
//! Cache layout, one slot per requested release:
//!
//! ```text
//! <cache>/<release>/SHA256SUMS                         cached manifest
//! <cache>/<release>/ubuntu-<ver>-live-server-<arch>.iso   verified image
//! <cache>/<release>/ubuntu-<ver>-live-server-<arch>.iso.partial
//! <cache>/<release>/entry.json                         CacheEntry record
//! ```

use super::manifest::{ChecksumManifest, MANIFEST_FILENAME};
use super::transport::{HttpTransport, RangeResponse, Transport};
use crate::config::{Architecture, Release, Settings};
use crate::error::{AutoInstallError, ErrorKind};
use crate::reporter::ProgressReporter;
use crate::utils::CryptoUtils;
use crate::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

const ENTRY_FILENAME: &str = "entry.json";
const PARTIAL_SUFFIX: &str = ".partial";

/// Record of one cached image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub release: Release,
    pub architecture: Architecture,
    pub source_url: String,
    pub local_path: PathBuf,
    pub expected_checksum: String,
    pub size: Option<u64>,
    pub complete: bool,
}

/// Image location resolved from the manifest
#[derive(Debug, Clone)]
struct ResolvedImage {
    filename: String,
    digest: String,
    url: Url,
}

/// Resolves releases to verified local ISO files
pub struct ImageFetcher<T: Transport = HttpTransport> {
    transport: T,
    cache_dir: PathBuf,
    mirror: String,
    architecture: Architecture,
    stall_timeout: Duration,
}

impl ImageFetcher<HttpTransport> {
    /// Fetcher talking to the configured mirror over HTTP
    pub fn from_settings(settings: &Settings, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(HttpTransport::new(settings)?, cache_dir, settings))
    }
}

impl<T: Transport> ImageFetcher<T> {
    pub fn new(transport: T, cache_dir: impl Into<PathBuf>, settings: &Settings) -> Self {
        Self {
            transport,
            cache_dir: cache_dir.into(),
            mirror: settings.mirror.clone(),
            architecture: settings.architecture,
            stall_timeout: settings.http_timeout(),
        }
    }

    /// The transport in use
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Cache slot directory for `release`
    pub fn slot_dir(&self, release: &Release) -> PathBuf {
        self.cache_dir.join(release.to_string())
    }

    /// URL of `file` in the mirror directory of `release`
    pub fn release_url(&self, release: &Release, file: &str) -> Result<Url> {
        let mut base = self.mirror.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|e| {
            AutoInstallError::config(format!("Invalid mirror URL {}: {}", self.mirror, e))
        })?;
        base.join(&format!("{}/{}", release.series(), file))
            .map_err(|e| AutoInstallError::config(format!("Cannot build URL for {}: {}", file, e)))
    }

    /// Checksum manifest URL for `release`
    pub fn manifest_url(&self, release: &Release) -> Result<Url> {
        self.release_url(release, MANIFEST_FILENAME)
    }

    /// Read the slot's cache record, if any
    pub async fn cached_entry(&self, release: &Release) -> Result<Option<CacheEntry>> {
        let path = self.slot_dir(release).join(ENTRY_FILENAME);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return a verified local copy of the release image, downloading only
    /// what the cache lacks
    pub async fn fetch(&self, release: &Release, reporter: &dyn ProgressReporter) -> Result<PathBuf> {
        let slot = self.slot_dir(release);
        tokio::fs::create_dir_all(&slot).await?;

        if let Some(path) = self.try_cache_hit(release, &slot, reporter).await? {
            info!("Using cached image {}", path.display());
            return Ok(path);
        }

        let resolved = self.refresh_manifest(release, &slot).await?;
        let final_path = slot.join(&resolved.filename);

        if final_path.is_file() {
            if self.verify(&final_path, &resolved.digest, reporter).await? {
                info!("Cached image matches refreshed manifest: {}", final_path.display());
                self.record_entry(release, &resolved, &final_path, true).await?;
                return Ok(final_path);
            }
            warn!("Discarding cached image that fails verification: {}", final_path.display());
            tokio::fs::remove_file(&final_path).await?;
        }

        let partial_path = partial_path(&final_path);
        self.record_entry(release, &resolved, &final_path, false).await?;
        self.download_resuming(&resolved, &partial_path, reporter).await?;

        let actual =
            CryptoUtils::calculate_file_checksum(&partial_path, "Verifying checksum", reporter)
                .await?;
        if !actual.eq_ignore_ascii_case(&resolved.digest) {
            tokio::fs::remove_file(&partial_path).await?;
            return Err(AutoInstallError::ChecksumMismatch {
                path: final_path,
                expected: resolved.digest,
                actual,
            });
        }

        tokio::fs::rename(&partial_path, &final_path).await?;
        self.record_entry(release, &resolved, &final_path, true).await?;
        info!("Downloaded and verified {}", final_path.display());
        Ok(final_path)
    }

    /// A slot with a cached manifest and a matching image needs no network
    async fn try_cache_hit(
        &self,
        release: &Release,
        slot: &Path,
        reporter: &dyn ProgressReporter,
    ) -> Result<Option<PathBuf>> {
        let manifest_path = slot.join(MANIFEST_FILENAME);
        let text = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some((filename, digest)) =
            ChecksumManifest::parse(&text).resolve(release, self.architecture)
        else {
            debug!("Cached manifest has no entry for {}", release);
            return Ok(None);
        };

        let path = slot.join(filename);
        if !path.is_file() {
            return Ok(None);
        }
        if self.verify(&path, &digest, reporter).await? {
            return Ok(Some(path));
        }

        warn!("Cached image {} failed verification, fetching again", path.display());
        tokio::fs::remove_file(&path).await?;
        Ok(None)
    }

    /// Download the manifest, cache it in the slot and resolve the image
    async fn refresh_manifest(&self, release: &Release, slot: &Path) -> Result<ResolvedImage> {
        let manifest_url = self.manifest_url(release)?;
        info!("Fetching checksum manifest {}", manifest_url);

        let response = self.request(manifest_url.as_str(), None).await?;
        if response.status != 200 {
            return Err(AutoInstallError::network(format!(
                "Manifest download failed with status: {}",
                response.status
            )));
        }
        let body = response.collect().await?;
        let text = String::from_utf8_lossy(&body);

        let Some((filename, digest)) =
            ChecksumManifest::parse(&text).resolve(release, self.architecture)
        else {
            return Err(AutoInstallError::ManifestEntryMissing {
                filename: super::manifest::image_filename(release, self.architecture),
                manifest_url: manifest_url.to_string(),
            });
        };

        let staged = slot.join(format!("{}{}", MANIFEST_FILENAME, PARTIAL_SUFFIX));
        tokio::fs::write(&staged, &body).await?;
        tokio::fs::rename(&staged, slot.join(MANIFEST_FILENAME)).await?;

        let url = self.release_url(release, &filename)?;
        debug!("Resolved {} to {} ({})", release, filename, digest);
        Ok(ResolvedImage {
            filename,
            digest,
            url,
        })
    }

    /// Download into `partial`, resuming once after a mid-stream failure
    async fn download_resuming(
        &self,
        image: &ResolvedImage,
        partial: &Path,
        reporter: &dyn ProgressReporter,
    ) -> Result<()> {
        match self.download_once(image, partial, reporter).await {
            Err(e) if e.kind() == ErrorKind::TransientNetwork => {
                warn!("Download interrupted ({}), resuming", e);
                self.download_once(image, partial, reporter).await
            }
            other => other,
        }
    }

    async fn download_once(
        &self,
        image: &ResolvedImage,
        partial: &Path,
        reporter: &dyn ProgressReporter,
    ) -> Result<()> {
        let start = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let range = (start > 0).then_some(start);
        let mut response = self.request(image.url.as_str(), range).await?;

        let (mut file, mut written, total) = match response.status {
            206 if start > 0 => {
                debug!("Resuming {} from byte {}", image.filename, start);
                let file = OpenOptions::new().append(true).open(partial).await?;
                (file, start, response.content_length.map(|len| start + len))
            }
            200 => {
                if start > 0 {
                    warn!("Server ignored the range request, restarting download from zero");
                }
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(partial)
                    .await?;
                (file, 0, response.content_length)
            }
            416 if start > 0 => {
                debug!("Partial file already holds the complete body");
                return Ok(());
            }
            status => {
                return Err(AutoInstallError::network(format!(
                    "Download failed with status: {}",
                    status
                )));
            }
        };

        info!("Downloading: {}", image.url);
        reporter.begin(&format!("Downloading {}", image.filename), total);
        reporter.advance(written);

        let outcome = self
            .stream_body(&mut response, &mut file, &mut written, reporter)
            .await;
        file.flush().await?;
        reporter.finish();
        outcome
    }

    async fn stream_body(
        &self,
        response: &mut RangeResponse,
        file: &mut tokio::fs::File,
        written: &mut u64,
        reporter: &dyn ProgressReporter,
    ) -> Result<()> {
        loop {
            let next = tokio::time::timeout(self.stall_timeout, response.body.next())
                .await
                .map_err(|_| AutoInstallError::network("Download stalled"))?;
            let Some(chunk) = next else {
                return Ok(());
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            *written += chunk.len() as u64;
            reporter.advance(*written);
        }
    }

    async fn request(&self, url: &str, range_start: Option<u64>) -> Result<RangeResponse> {
        tokio::time::timeout(self.stall_timeout, self.transport.get(url, range_start))
            .await
            .map_err(|_| AutoInstallError::network(format!("Request timed out: {}", url)))?
    }

    async fn verify(&self, path: &Path, digest: &str, reporter: &dyn ProgressReporter) -> Result<bool> {
        CryptoUtils::verify_file_integrity(path, digest, reporter).await
    }

    async fn record_entry(
        &self,
        release: &Release,
        image: &ResolvedImage,
        final_path: &Path,
        complete: bool,
    ) -> Result<()> {
        let size = if complete {
            Some(tokio::fs::metadata(final_path).await?.len())
        } else {
            None
        };
        let entry = CacheEntry {
            release: release.clone(),
            architecture: self.architecture,
            source_url: image.url.to_string(),
            local_path: final_path.to_path_buf(),
            expected_checksum: image.digest.clone(),
            size,
            complete,
        };
        let slot = self.slot_dir(release);
        tokio::fs::write(slot.join(ENTRY_FILENAME), serde_json::to_vec_pretty(&entry)?).await?;
        Ok(())
    }
}

fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::{MemoryTransport, RecordedRequest};
    use crate::reporter::{NoProgress, RecordingProgress};
    use tempfile::TempDir;

    const MIRROR: &str = "http://mirror.test";
    const MANIFEST_URL: &str = "http://mirror.test/22.04/SHA256SUMS";
    const IMAGE_NAME: &str = "ubuntu-22.04.1-live-server-amd64.iso";
    const IMAGE_URL: &str = "http://mirror.test/22.04/ubuntu-22.04.1-live-server-amd64.iso";

    fn image_body() -> Vec<u8> {
        (0..20_000u32).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn manifest_for(body: &[u8]) -> String {
        format!(
            "{}  ubuntu-22.04.1-desktop-amd64.iso\n{} *{}\n",
            "0".repeat(64),
            CryptoUtils::sha256_hex(body),
            IMAGE_NAME
        )
    }

    fn settings() -> Settings {
        Settings {
            mirror: MIRROR.to_string(),
            ..Settings::default()
        }
    }

    fn release() -> Release {
        "22.04.1".parse().unwrap()
    }

    fn fetcher(transport: MemoryTransport, cache: &TempDir) -> ImageFetcher<MemoryTransport> {
        ImageFetcher::new(transport, cache.path(), &settings())
    }

    fn mirror_with(body: Vec<u8>) -> MemoryTransport {
        let manifest = manifest_for(&body);
        MemoryTransport::new()
            .with_body(MANIFEST_URL, manifest)
            .with_body(IMAGE_URL, body)
    }

    fn image_requests(transport: &MemoryTransport) -> Vec<Option<u64>> {
        transport
            .requests_for(IMAGE_URL)
            .into_iter()
            .map(|r| r.range_start)
            .collect()
    }

    #[tokio::test]
    async fn test_cache_miss_downloads_verifies_and_caches() {
        // Arrange
        let cache = TempDir::new().unwrap();
        let body = image_body();
        let fetcher = fetcher(mirror_with(body.clone()), &cache);
        let progress = RecordingProgress::new();

        // Act
        let path = fetcher.fetch(&release(), &progress).await.unwrap();

        // Assert
        assert_eq!(path, cache.path().join("22.04.1").join(IMAGE_NAME));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
        assert!(cache.path().join("22.04.1").join("SHA256SUMS").is_file());
        assert!(!partial_path(&path).exists());

        let advances = progress.advances_for(&format!("Downloading {}", IMAGE_NAME));
        assert!(advances.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(advances.last().copied(), Some(body.len() as u64));

        let entry = fetcher.cached_entry(&release()).await.unwrap().unwrap();
        assert!(entry.complete);
        assert_eq!(entry.size, Some(body.len() as u64));
        assert_eq!(entry.source_url, IMAGE_URL);
    }

    #[tokio::test]
    async fn test_second_fetch_performs_no_requests() {
        let cache = TempDir::new().unwrap();
        let fetcher = fetcher(mirror_with(image_body()), &cache);
        let first = fetcher.fetch(&release(), &NoProgress).await.unwrap();
        let requests_after_first = fetcher.transport().requests().len();

        let second = fetcher.fetch(&release(), &NoProgress).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.transport().requests().len(), requests_after_first);
    }

    #[tokio::test]
    async fn test_resume_from_any_partial_length() {
        let body = image_body();
        for k in [1usize, 4095, 4096, 10_001, body.len() - 1] {
            // Arrange
            let cache = TempDir::new().unwrap();
            let slot = cache.path().join("22.04.1");
            std::fs::create_dir_all(&slot).unwrap();
            std::fs::write(slot.join(format!("{}.partial", IMAGE_NAME)), &body[..k]).unwrap();
            let fetcher = fetcher(mirror_with(body.clone()), &cache);

            // Act
            let path = fetcher.fetch(&release(), &NoProgress).await.unwrap();

            // Assert
            assert_eq!(tokio::fs::read(&path).await.unwrap(), body, "k = {}", k);
            assert_eq!(image_requests(fetcher.transport()), vec![Some(k as u64)]);
        }
    }

    #[tokio::test]
    async fn test_server_ignoring_range_restarts_from_zero() {
        let cache = TempDir::new().unwrap();
        let body = image_body();
        let slot = cache.path().join("22.04.1");
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(slot.join(format!("{}.partial", IMAGE_NAME)), &body[..5000]).unwrap();
        let fetcher = fetcher(mirror_with(body.clone()).ignoring_ranges(), &cache);

        let path = fetcher.fetch(&release(), &NoProgress).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
        assert_eq!(image_requests(fetcher.transport()), vec![Some(5000)]);
    }

    #[tokio::test]
    async fn test_complete_partial_answered_with_416() {
        let cache = TempDir::new().unwrap();
        let body = image_body();
        let slot = cache.path().join("22.04.1");
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(slot.join(format!("{}.partial", IMAGE_NAME)), &body).unwrap();
        let fetcher = fetcher(mirror_with(body.clone()), &cache);

        let path = fetcher.fetch(&release(), &NoProgress).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
        assert_eq!(image_requests(fetcher.transport()), vec![Some(body.len() as u64)]);
    }

    #[tokio::test]
    async fn test_single_automatic_resume_after_stream_failure() {
        let cache = TempDir::new().unwrap();
        let body = image_body();
        let transport = mirror_with(body.clone()).fail_once_after(IMAGE_URL, 8192);
        let fetcher = fetcher(transport, &cache);

        let path = fetcher.fetch(&release(), &NoProgress).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
        assert_eq!(image_requests(fetcher.transport()), vec![None, Some(8192)]);
    }

    #[tokio::test]
    async fn test_second_stream_failure_keeps_partial() {
        let cache = TempDir::new().unwrap();
        let body = image_body();
        let transport = mirror_with(body.clone())
            .fail_once_after(IMAGE_URL, 4096)
            .fail_once_after(IMAGE_URL, 4096);
        let fetcher = fetcher(transport, &cache);

        let err = fetcher.fetch(&release(), &NoProgress).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransientNetwork);
        let slot = cache.path().join("22.04.1");
        let partial = std::fs::read(slot.join(format!("{}.partial", IMAGE_NAME))).unwrap();
        assert_eq!(partial, body[..8192].to_vec());
        assert!(!slot.join(IMAGE_NAME).exists());
    }

    #[tokio::test]
    async fn test_corrupted_download_is_rejected() {
        // Arrange
        let cache = TempDir::new().unwrap();
        let body = image_body();
        let mut corrupted = body.clone();
        corrupted[12_345] ^= 0x01;
        let transport = MemoryTransport::new()
            .with_body(MANIFEST_URL, manifest_for(&body))
            .with_body(IMAGE_URL, corrupted);
        let fetcher = fetcher(transport, &cache);

        // Act
        let err = fetcher.fetch(&release(), &NoProgress).await.unwrap_err();

        // Assert
        assert!(matches!(err, AutoInstallError::ChecksumMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
        let slot = cache.path().join("22.04.1");
        assert!(!slot.join(IMAGE_NAME).exists());
        assert!(!slot.join(format!("{}.partial", IMAGE_NAME)).exists());
        assert_eq!(image_requests(fetcher.transport()), vec![None]);
    }

    #[tokio::test]
    async fn test_tampered_cache_is_fetched_again() {
        let cache = TempDir::new().unwrap();
        let body = image_body();
        let fetcher = fetcher(mirror_with(body.clone()), &cache);
        let path = fetcher.fetch(&release(), &NoProgress).await.unwrap();

        let mut tampered = body.clone();
        tampered[0] ^= 0xFF;
        std::fs::write(&path, &tampered).unwrap();

        let again = fetcher.fetch(&release(), &NoProgress).await.unwrap();

        assert_eq!(again, path);
        assert_eq!(tokio::fs::read(&again).await.unwrap(), body);
        assert_eq!(image_requests(fetcher.transport()), vec![None, None]);
    }

    #[tokio::test]
    async fn test_missing_manifest_entry() {
        let cache = TempDir::new().unwrap();
        let transport = MemoryTransport::new().with_body(MANIFEST_URL, "garbage\n");
        let fetcher = fetcher(transport, &cache);

        let err = fetcher.fetch(&release(), &NoProgress).await.unwrap_err();

        match err {
            AutoInstallError::ManifestEntryMissing {
                filename,
                manifest_url,
            } => {
                assert_eq!(filename, IMAGE_NAME);
                assert_eq!(manifest_url, MANIFEST_URL);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_series_release_resolves_to_point_release() {
        let cache = TempDir::new().unwrap();
        let body = image_body();
        let fetcher = fetcher(mirror_with(body.clone()), &cache);
        let series: Release = "22.04".parse().unwrap();

        let path = fetcher.fetch(&series, &NoProgress).await.unwrap();

        assert_eq!(path, cache.path().join("22.04").join(IMAGE_NAME));
        assert_eq!(
            fetcher.transport().requests()[0],
            RecordedRequest {
                url: MANIFEST_URL.to_string(),
                range_start: None
            }
        );
    }

    #[test]
    fn test_release_url_handles_mirror_paths() {
        let settings = Settings {
            mirror: "http://mirror.lan/ubuntu-releases".to_string(),
            ..Settings::default()
        };
        let fetcher = ImageFetcher::new(MemoryTransport::new(), "/tmp/cache", &settings);
        let url = fetcher.manifest_url(&"24.04".parse().unwrap()).unwrap();
        assert_eq!(url.as_str(), "http://mirror.lan/ubuntu-releases/24.04/SHA256SUMS");
    }
}
