// file: src/config/mod.rs
// version: 2.0.0
// guid: 16ee6a92-c9c1-40fa-acdd-2b655b946c8e

//! Configuration module for the autoinstall ISO builder
//!
//! Holds the closed value types shared across the crate (architecture,
//! release identifier) and the tool settings loaded from YAML.

pub mod loader;
pub mod settings;

pub use loader::ConfigLoader;
pub use settings::Settings;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported system architectures for Ubuntu Server images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "amd64")]
    Amd64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Architecture {
    /// Get the architecture as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Architecture {
    type Err = crate::error::AutoInstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            _ => Err(crate::error::AutoInstallError::ValidationError(format!(
                "Unknown architecture: {}",
                s
            ))),
        }
    }
}

/// Ubuntu release identifier, `YY.MM` or `YY.MM.P`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Release {
    year: u8,
    month: u8,
    point: Option<u32>,
}

impl Release {
    /// The `YY.MM` series, which is also the mirror directory name
    pub fn series(&self) -> String {
        format!("{:02}.{:02}", self.year, self.month)
    }

    /// Point release number, if one was given
    pub fn point(&self) -> Option<u32> {
        self.point
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.point {
            Some(point) => write!(f, "{}.{}", self.series(), point),
            None => f.write_str(&self.series()),
        }
    }
}

impl std::str::FromStr for Release {
    type Err = crate::error::AutoInstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            crate::error::AutoInstallError::ValidationError(format!(
                "Invalid release '{}': expected YY.MM or YY.MM.P",
                s
            ))
        };
        let two_digits = |part: &str| -> Option<u8> {
            if part.len() == 2 && part.bytes().all(|b| b.is_ascii_digit()) {
                part.parse().ok()
            } else {
                None
            }
        };

        let mut parts = s.trim().split('.');
        let year = parts.next().and_then(two_digits).ok_or_else(invalid)?;
        let month = parts.next().and_then(two_digits).ok_or_else(invalid)?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }
        let point = match parts.next() {
            Some(p) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
                Some(p.parse().map_err(|_| invalid())?)
            }
            Some(_) => return Err(invalid()),
            None => None,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Release { year, month, point })
    }
}

impl TryFrom<String> for Release {
    type Error = crate::error::AutoInstallError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Release> for String {
    fn from(release: Release) -> Self {
        release.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_aliases() {
        assert_eq!("x86_64".parse::<Architecture>().unwrap(), Architecture::Amd64);
        assert_eq!("arm64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert!("riscv64".parse::<Architecture>().is_err());
        assert_eq!(Architecture::Arm64.to_string(), "arm64");
    }

    #[test]
    fn test_release_parsing() {
        let lts: Release = "20.04".parse().unwrap();
        assert_eq!(lts.series(), "20.04");
        assert_eq!(lts.point(), None);
        assert_eq!(lts.to_string(), "20.04");

        let point: Release = "22.04.3".parse().unwrap();
        assert_eq!(point.series(), "22.04");
        assert_eq!(point.point(), Some(3));
        assert_eq!(point.to_string(), "22.04.3");
    }

    #[test]
    fn test_release_rejects_malformed_input() {
        for bad in ["", "20", "2004", "20.4", "20.13", "20.04.", "20.04.x", "20.04.1.2", "../x"] {
            assert!(bad.parse::<Release>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_release_serde_as_string() {
        let release: Release = serde_yaml::from_str("\"24.04.1\"").unwrap();
        assert_eq!(release.point(), Some(1));
        let json = serde_json::to_string(&release).unwrap();
        assert_eq!(json, "\"24.04.1\"");
    }
}
