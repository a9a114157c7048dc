// file: src/image/builder/seed.rs
// version: 1.0.0
// guid: 78bd4a55-9128-467f-8235-cf9fb8f930fc

//! NoCloud seed (`user-data` + `meta-data`) generation

use crate::error::AutoInstallError;
use crate::utils::CryptoUtils;
use crate::Result;
use serde_yaml::Value;
use tracing::debug;

/// Seed directory inside the image (`/cdrom/nocloud/` at install time)
pub const SEED_DIR: &str = "/nocloud";

const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

/// Validated autoinstall configuration ready to be written into the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoInstallPayload {
    user_data: String,
    meta_data: String,
}

impl AutoInstallPayload {
    /// Validate user configuration and derive the seed files from it
    ///
    /// Accepts either cloud-init user-data with an `autoinstall` section or a
    /// bare autoinstall document (top-level `version`), which gets wrapped.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let document: Value = serde_yaml::from_str(text)?;
        let mapping = document.as_mapping().ok_or_else(|| {
            AutoInstallError::validation("autoinstall configuration must be a YAML mapping")
        })?;

        let body = if mapping.contains_key("autoinstall") {
            text.to_string()
        } else if mapping.contains_key("version") {
            debug!("Wrapping bare autoinstall document under `autoinstall:`");
            wrap_bare_document(text)
        } else {
            return Err(AutoInstallError::validation(
                "autoinstall configuration needs an `autoinstall` section or a top-level `version`",
            ));
        };

        let mut user_data = if body.lines().next().map(str::trim_end) == Some(CLOUD_CONFIG_HEADER) {
            body
        } else {
            format!("{}\n{}", CLOUD_CONFIG_HEADER, body)
        };
        if !user_data.ends_with('\n') {
            user_data.push('\n');
        }

        let reparsed: Value = serde_yaml::from_str(&user_data)?;
        if !reparsed.get("autoinstall").is_some_and(Value::is_mapping) {
            return Err(AutoInstallError::validation(
                "`autoinstall` must be a mapping",
            ));
        }

        let digest = CryptoUtils::sha256_hex(user_data.as_bytes());
        let meta_data = format!("instance-id: autoinstall-{}\n", &digest[..16]);

        Ok(Self {
            user_data,
            meta_data,
        })
    }

    pub fn user_data(&self) -> &str {
        &self.user_data
    }

    pub fn meta_data(&self) -> &str {
        &self.meta_data
    }

    /// Image path of `user-data`
    pub fn user_data_path() -> String {
        format!("{}/user-data", SEED_DIR)
    }

    /// Image path of `meta-data`
    pub fn meta_data_path() -> String {
        format!("{}/meta-data", SEED_DIR)
    }
}

/// Indent a bare document under an `autoinstall:` key, dropping any header
/// comment and leading document marker
fn wrap_bare_document(text: &str) -> String {
    let mut wrapped = String::from("autoinstall:\n");
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.peek() {
        let trimmed = line.trim_end();
        if trimmed == CLOUD_CONFIG_HEADER || trimmed == "---" || trimmed.is_empty() {
            lines.next();
        } else {
            break;
        }
    }
    for line in lines {
        if line.trim().is_empty() {
            wrapped.push('\n');
        } else {
            wrapped.push_str("  ");
            wrapped.push_str(line);
            wrapped.push('\n');
        }
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "#cloud-config\nautoinstall:\n  version: 1\n  identity:\n    hostname: nas\n";

    #[test]
    fn test_full_user_data_kept_verbatim() {
        let payload = AutoInstallPayload::from_yaml(FULL).unwrap();
        assert_eq!(payload.user_data(), FULL);
        assert!(payload.meta_data().starts_with("instance-id: autoinstall-"));
    }

    #[test]
    fn test_bare_document_is_wrapped() {
        // Arrange
        let bare = "version: 1\nlocale: en_US.UTF-8\nstorage:\n  layout:\n    name: lvm\n";

        // Act
        let payload = AutoInstallPayload::from_yaml(bare).unwrap();

        // Assert
        assert!(payload.user_data().starts_with("#cloud-config\nautoinstall:\n  version: 1\n"));
        let value: Value = serde_yaml::from_str(payload.user_data()).unwrap();
        assert_eq!(value["autoinstall"]["storage"]["layout"]["name"].as_str(), Some("lvm"));
    }

    #[test]
    fn test_header_added_when_missing() {
        let payload = AutoInstallPayload::from_yaml("autoinstall:\n  version: 1").unwrap();
        assert_eq!(payload.user_data(), "#cloud-config\nautoinstall:\n  version: 1\n");
    }

    #[test]
    fn test_instance_id_is_reproducible() {
        let a = AutoInstallPayload::from_yaml(FULL).unwrap();
        let b = AutoInstallPayload::from_yaml(FULL).unwrap();
        let c = AutoInstallPayload::from_yaml("autoinstall:\n  version: 2\n").unwrap();
        assert_eq!(a.meta_data(), b.meta_data());
        assert_ne!(a.meta_data(), c.meta_data());
    }

    #[test]
    fn test_invalid_payloads_rejected() {
        assert!(matches!(
            AutoInstallPayload::from_yaml("autoinstall: [unclosed"),
            Err(AutoInstallError::YamlError(_))
        ));
        assert!(matches!(
            AutoInstallPayload::from_yaml("- just\n- a list\n"),
            Err(AutoInstallError::ValidationError(_))
        ));
        assert!(matches!(
            AutoInstallPayload::from_yaml("hostname: nas\n"),
            Err(AutoInstallError::ValidationError(_))
        ));
        assert!(matches!(
            AutoInstallPayload::from_yaml("autoinstall: 1\n"),
            Err(AutoInstallError::ValidationError(_))
        ));
    }

    #[test]
    fn test_seed_paths() {
        assert_eq!(AutoInstallPayload::user_data_path(), "/nocloud/user-data");
        assert_eq!(AutoInstallPayload::meta_data_path(), "/nocloud/meta-data");
    }
}
