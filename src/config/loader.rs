// file: src/config/loader.rs
// version: 2.0.0
// guid: f160fac2-6953-4670-9f1e-c3db6c3bbb15

//! Configuration file loading and environment variable substitution

use super::Settings;
use crate::Result;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Application directory name under the XDG config and cache roots
pub const APP_NAME: &str = "ubautoiso";

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
    env_vars: HashMap<String, String>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self {
            env_vars: std::env::vars().collect(),
        }
    }

    /// `$XDG_CONFIG_HOME/ubautoiso/config.yaml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.yaml"))
    }

    /// `$XDG_CACHE_HOME/ubautoiso`
    pub fn default_cache_dir() -> Result<PathBuf> {
        dirs::cache_dir()
            .map(|dir| dir.join(APP_NAME))
            .ok_or_else(|| {
                crate::error::AutoInstallError::ConfigError(
                    "Could not determine a cache directory; pass --cache-dir".to_string(),
                )
            })
    }

    /// Load settings from `path`, or from the default location when `path` is
    /// `None`; a missing default file yields [`Settings::default`]
    pub fn load_settings(&self, path: Option<&Path>) -> Result<Settings> {
        let settings = match path {
            Some(path) => self.load_settings_file(&Self::expand_path(path))?,
            None => match Self::default_config_path() {
                Some(default) if default.is_file() => self.load_settings_file(&default)?,
                _ => {
                    debug!("No config file found, using default settings");
                    Settings::default()
                }
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    fn load_settings_file(&self, path: &Path) -> Result<Settings> {
        let content = fs::read_to_string(path).map_err(|e| {
            crate::error::AutoInstallError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let expanded = self.expand_env_vars(&content)?;
        if expanded.trim().is_empty() {
            return Ok(Settings::default());
        }
        let settings: Settings = serde_yaml::from_str(&expanded)?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Expand `~` and `$VAR` in a user-supplied path
    pub fn expand_path(path: &Path) -> PathBuf {
        let raw = path.to_string_lossy();
        match shellexpand::full(&raw) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => path.to_path_buf(),
        }
    }

    /// Expand environment variables in configuration content
    fn expand_env_vars(&self, content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| {
            crate::error::AutoInstallError::ConfigError(format!("Invalid regex pattern: {}", e))
        })?;

        let mut result = content.to_string();
        let mut missing_vars = Vec::new();

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let placeholder = &cap[0];

            if let Some(value) = self.env_vars.get(var_name) {
                result = result.replace(placeholder, value);
            } else {
                missing_vars.push(var_name.to_string());
            }
        }

        if !missing_vars.is_empty() {
            return Err(crate::error::AutoInstallError::ConfigError(format!(
                "Missing environment variables: {}",
                missing_vars.join(", ")
            )));
        }

        Ok(result)
    }

    /// Set environment variable for substitution
    pub fn set_env_var(&mut self, key: String, value: String) {
        self.env_vars.insert(key, value);
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Architecture;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_env_var_expansion() {
        let mut loader = ConfigLoader::new();
        loader.set_env_var("TEST_VAR".to_string(), "test_value".to_string());

        let content = "key: ${TEST_VAR}";
        let result = loader.expand_env_vars(content).unwrap();
        assert_eq!(result, "key: test_value");
    }

    #[test]
    fn test_missing_env_var() {
        let loader = ConfigLoader::new();
        let content = "key: ${UBAUTOISO_SURELY_MISSING_VAR}";

        let result = loader.expand_env_vars(content);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Missing environment variables"));
    }

    #[test]
    fn test_load_settings_file() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
mirror: ${{UBAUTOISO_TEST_MIRROR}}
architecture: arm64
grub_entry_stamp: Lab AutoInstall
http_timeout_secs: 15
"#
        )
        .unwrap();

        let mut loader = ConfigLoader::new();
        loader.set_env_var(
            "UBAUTOISO_TEST_MIRROR".to_string(),
            "http://mirror.lan/ubuntu".to_string(),
        );
        let settings = loader.load_settings(Some(file.path()))?;

        assert_eq!(settings.mirror, "http://mirror.lan/ubuntu");
        assert_eq!(settings.architecture, Architecture::Arm64);
        assert_eq!(settings.grub_entry_stamp, "Lab AutoInstall");
        assert_eq!(settings.http_timeout_secs, 15);

        Ok(())
    }

    #[test]
    fn test_empty_file_gives_defaults() -> Result<()> {
        let file = NamedTempFile::new().unwrap();
        let settings = ConfigLoader::new().load_settings(Some(file.path()))?;
        assert_eq!(settings, Settings::default());
        Ok(())
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "mirror: not a url").unwrap();
        let err = ConfigLoader::new()
            .load_settings(Some(file.path()))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::AutoInstallError::ValidationError(_)
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_config_error() {
        let err = ConfigLoader::new()
            .load_settings(Some(Path::new("/nonexistent/ubautoiso.yaml")))
            .unwrap_err();
        assert!(matches!(err, crate::error::AutoInstallError::ConfigError(_)));
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = ConfigLoader::expand_path(Path::new("~/iso-cache"));
        assert!(!expanded.to_string_lossy().starts_with('~') || dirs::home_dir().is_none());
    }
}
