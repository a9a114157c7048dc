// file: src/network/manifest.rs
// version: 1.0.0
// guid: e37de343-b9a1-4f10-baeb-2e1307322b89

//! `SHA256SUMS` manifest parsing and image name resolution

use crate::config::{Architecture, Release};

/// Name of the checksum manifest published next to each release
pub const MANIFEST_FILENAME: &str = "SHA256SUMS";

/// Image filename for an exact release and architecture
pub fn image_filename(release: &Release, architecture: Architecture) -> String {
    format!(
        "ubuntu-{}-live-server-{}.iso",
        release,
        architecture.as_str()
    )
}

/// Parsed checksum manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: Vec<(String, String)>,
}

impl ChecksumManifest {
    /// Parse `<hex digest>  <filename>` lines; anything else is skipped
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                let (digest, rest) = line.split_once(char::is_whitespace)?;
                if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return None;
                }
                let name = rest.trim_start();
                let name = name.strip_prefix('*').unwrap_or(name);
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), digest.to_ascii_lowercase()))
            })
            .collect();

        Self { entries }
    }

    /// Number of usable entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Digest listed for `filename`
    pub fn lookup(&self, filename: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == filename)
            .map(|(_, digest)| digest.as_str())
    }

    /// Resolve the image for `release`, returning `(filename, digest)`
    ///
    /// The exact name wins. A release without a point component also
    /// matches the highest point release of its series.
    pub fn resolve(&self, release: &Release, architecture: Architecture) -> Option<(String, String)> {
        let exact = image_filename(release, architecture);
        if let Some(digest) = self.lookup(&exact) {
            return Some((exact, digest.to_string()));
        }
        if release.point().is_some() {
            return None;
        }

        let prefix = format!("ubuntu-{}.", release.series());
        let suffix = format!("-live-server-{}.iso", architecture.as_str());
        self.entries
            .iter()
            .filter_map(|(name, digest)| {
                let point = name.strip_prefix(&prefix)?.strip_suffix(&suffix)?;
                if point.is_empty() || !point.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                Some((point.parse::<u32>().ok()?, name, digest))
            })
            .max_by_key(|(point, _, _)| *point)
            .map(|(_, name, digest)| (name.clone(), digest.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    fn sample() -> String {
        format!(
            "{}  ubuntu-22.04.1-live-server-amd64.iso\n\
             {} *ubuntu-22.04.3-live-server-amd64.iso\n\
             {}  ubuntu-22.04.3-live-server-arm64.iso\n\
             {}  ubuntu-22.04.3-desktop-amd64.iso\n\
             # comment line\n\
             nothex  ubuntu-22.04.9-live-server-amd64.iso\n\
             \n",
            digest('a'),
            digest('B'),
            digest('c'),
            digest('d'),
        )
    }

    #[test]
    fn test_parse_tolerates_binary_marker_and_noise() {
        let manifest = ChecksumManifest::parse(&sample());

        assert_eq!(manifest.len(), 4);
        assert_eq!(
            manifest.lookup("ubuntu-22.04.3-live-server-amd64.iso"),
            Some(digest('b').as_str())
        );
        assert_eq!(manifest.lookup("ubuntu-22.04.9-live-server-amd64.iso"), None);
    }

    #[test]
    fn test_resolve_exact_point_release() {
        let manifest = ChecksumManifest::parse(&sample());
        let release: Release = "22.04.1".parse().unwrap();

        let (name, sum) = manifest.resolve(&release, Architecture::Amd64).unwrap();
        assert_eq!(name, "ubuntu-22.04.1-live-server-amd64.iso");
        assert_eq!(sum, digest('a'));
    }

    #[test]
    fn test_resolve_series_picks_newest_point_release() {
        let manifest = ChecksumManifest::parse(&sample());
        let release: Release = "22.04".parse().unwrap();

        let (name, _) = manifest.resolve(&release, Architecture::Amd64).unwrap();
        assert_eq!(name, "ubuntu-22.04.3-live-server-amd64.iso");

        let (arm, _) = manifest.resolve(&release, Architecture::Arm64).unwrap();
        assert_eq!(arm, "ubuntu-22.04.3-live-server-arm64.iso");
    }

    #[test]
    fn test_resolve_series_prefers_exact_name() {
        let text = format!(
            "{}  ubuntu-20.04-live-server-amd64.iso\n{}  ubuntu-20.04.6-live-server-amd64.iso\n",
            digest('1'),
            digest('2')
        );
        let manifest = ChecksumManifest::parse(&text);
        let release: Release = "20.04".parse().unwrap();

        let (name, _) = manifest.resolve(&release, Architecture::Amd64).unwrap();
        assert_eq!(name, "ubuntu-20.04-live-server-amd64.iso");
    }

    #[test]
    fn test_resolve_missing_point_release() {
        let manifest = ChecksumManifest::parse(&sample());
        let release: Release = "22.04.2".parse().unwrap();
        assert!(manifest.resolve(&release, Architecture::Amd64).is_none());
        assert!(ChecksumManifest::parse("").is_empty());
    }
}
