// file: src/config/settings.rs
// version: 1.0.0
// guid: bbe85c8e-f32a-4d79-8af1-601d8fd332c0

//! Tool settings

use super::Architecture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default upstream mirror for Ubuntu release images
pub const DEFAULT_MIRROR: &str = "https://releases.ubuntu.com";

/// Title and marker of the injected boot menu entry
pub const DEFAULT_GRUB_ENTRY_STAMP: &str = "paranoidNAS AutoInstall";

/// Settings that shape a build but are not part of a single request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the release mirror
    pub mirror: String,
    /// Image architecture to fetch
    pub architecture: Architecture,
    /// Stamp identifying the injected GRUB entry
    pub grub_entry_stamp: String,
    /// Connect/read timeout for HTTP requests, in seconds
    pub http_timeout_secs: u64,
    /// User-Agent header sent to the mirror
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mirror: DEFAULT_MIRROR.to_string(),
            architecture: Architecture::default(),
            grub_entry_stamp: DEFAULT_GRUB_ENTRY_STAMP.to_string(),
            http_timeout_secs: 60,
            user_agent: format!("ubautoiso/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Settings {
    /// HTTP timeout as a [`Duration`]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Validate the settings
    pub fn validate(&self) -> crate::Result<()> {
        let mirror = url::Url::parse(&self.mirror).map_err(|e| {
            crate::error::AutoInstallError::ValidationError(format!(
                "Invalid mirror URL {}: {}",
                self.mirror, e
            ))
        })?;
        if !matches!(mirror.scheme(), "http" | "https") {
            return Err(crate::error::AutoInstallError::ValidationError(format!(
                "Mirror must be an http(s) URL: {}",
                self.mirror
            )));
        }

        let stamp = self.grub_entry_stamp.trim();
        if stamp.is_empty() {
            return Err(crate::error::AutoInstallError::ValidationError(
                "GRUB entry stamp cannot be empty".to_string(),
            ));
        }
        if stamp != self.grub_entry_stamp {
            return Err(crate::error::AutoInstallError::ValidationError(
                "GRUB entry stamp cannot start or end with whitespace".to_string(),
            ));
        }
        if self.grub_entry_stamp.contains(['\n', '\r', '"']) {
            return Err(crate::error::AutoInstallError::ValidationError(
                "GRUB entry stamp must be a single line without quotes".to_string(),
            ));
        }

        if self.http_timeout_secs == 0 {
            return Err(crate::error::AutoInstallError::ValidationError(
                "HTTP timeout must be at least one second".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.mirror, "https://releases.ubuntu.com");
        assert_eq!(settings.grub_entry_stamp, "paranoidNAS AutoInstall");
        assert_eq!(settings.http_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let settings: Settings = serde_yaml::from_str("architecture: arm64\n").unwrap();
        assert_eq!(settings.architecture, Architecture::Arm64);
        assert_eq!(settings.mirror, DEFAULT_MIRROR);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings {
            mirror: "ftp://mirror.example".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        settings.mirror = DEFAULT_MIRROR.to_string();
        settings.grub_entry_stamp = "two\nlines".to_string();
        assert!(settings.validate().is_err());

        settings.grub_entry_stamp = "Lab ".to_string();
        assert!(settings.validate().is_err());

        settings.grub_entry_stamp = "ok".to_string();
        settings.http_timeout_secs = 0;
        assert!(settings.validate().is_err());
    }
}
