// file: src/utils/crypto.rs
// version: 2.0.0
// guid: 4492994e-ec65-48c8-a7de-0b327bde6542

use crate::reporter::ProgressReporter;
use crate::Result;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::debug;

const READ_CHUNK: usize = 64 * 1024;

/// Digest helpers used for integrity checks
pub struct CryptoUtils;

impl CryptoUtils {
    /// Hex SHA-256 of an in-memory buffer
    pub fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Calculate the SHA-256 of a file, streaming it in chunks and reporting
    /// bytes hashed under `task`
    pub async fn calculate_file_checksum(
        path: &Path,
        task: &str,
        reporter: &dyn ProgressReporter,
    ) -> Result<String> {
        let mut file = tokio::fs::File::open(path).await?;
        let total = file.metadata().await?.len();

        reporter.begin(task, Some(total));
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_CHUNK];
        let mut hashed = 0u64;

        loop {
            let bytes_read = file.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            hashed += bytes_read as u64;
            reporter.advance(hashed);
        }
        reporter.finish();

        let digest = hex::encode(hasher.finalize());
        debug!("sha256 {} = {}", path.display(), digest);
        Ok(digest)
    }

    /// Compare a file against an expected hex digest (case-insensitive)
    pub async fn verify_file_integrity(
        path: &Path,
        expected_checksum: &str,
        reporter: &dyn ProgressReporter,
    ) -> Result<bool> {
        let actual = Self::calculate_file_checksum(path, "Verifying checksum", reporter).await?;
        Ok(actual.eq_ignore_ascii_case(expected_checksum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{NoProgress, RecordingProgress};
    use tempfile::TempDir;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(CryptoUtils::sha256_hex(b"abc"), ABC_SHA256);
    }

    #[tokio::test]
    async fn test_file_checksum_matches_buffer_digest() {
        // Arrange
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blob");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();
        let progress = RecordingProgress::new();

        // Act
        let digest = CryptoUtils::calculate_file_checksum(&path, "hash", &progress)
            .await
            .unwrap();

        // Assert
        assert_eq!(digest, CryptoUtils::sha256_hex(&data));
        let advances = progress.advances_for("hash");
        assert!(advances.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(advances.last().copied(), Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_verify_file_integrity_ignores_case() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("abc");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let upper = ABC_SHA256.to_uppercase();
        assert!(CryptoUtils::verify_file_integrity(&path, &upper, &NoProgress)
            .await
            .unwrap());
        assert!(!CryptoUtils::verify_file_integrity(&path, "00", &NoProgress)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = CryptoUtils::calculate_file_checksum(
            &temp_dir.path().join("absent"),
            "hash",
            &NoProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, crate::error::AutoInstallError::IoError(_)));
    }
}
