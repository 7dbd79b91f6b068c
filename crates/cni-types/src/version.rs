//! CNI protocol versions and the `VERSION` document.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Versions this plugin accepts in `cniVersion` and can emit results for.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0", "1.1.0"];

/// A parsed `major.minor.patch` CNI version.
///
/// Missing trailing components read as zero, so `"1.0"` equals `"1.0.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SpecVersion {
    /// The newest version this plugin speaks.
    pub const LATEST: SpecVersion = SpecVersion::new(1, 1, 0);

    /// First version that defines the `CHECK` command.
    pub const CHECK_MIN: SpecVersion = SpecVersion::new(0, 4, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_VERSIONS
            .iter()
            .filter_map(|v| v.parse::<SpecVersion>().ok())
            .any(|v| v == *self)
    }

    pub fn supports_check(&self) -> bool {
        *self >= Self::CHECK_MIN
    }

    /// Pre-1.0 results tag every IP entry with `"version": "4"|"6"`.
    pub fn tags_ip_version(&self) -> bool {
        self.major < 1
    }
}

impl fmt::Display for SpecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SpecVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidVersion(s.to_string());
        let mut parts = [0u32; 3];
        let mut count = 0;
        for part in s.split('.') {
            if count == parts.len() || part.is_empty() {
                return Err(invalid());
            }
            parts[count] = part.parse().map_err(|_| invalid())?;
            count += 1;
        }
        if count == 0 {
            return Err(invalid());
        }
        Ok(SpecVersion::new(parts[0], parts[1], parts[2]))
    }
}

/// Output of the `VERSION` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

impl VersionInfo {
    /// Answers a `VERSION` request; an empty request reports the latest version.
    pub fn for_request(requested: Option<&str>) -> Self {
        let cni_version = match requested {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => SpecVersion::LATEST.to_string(),
        };
        Self {
            cni_version,
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_order() {
        let v030: SpecVersion = "0.3.0".parse().unwrap();
        let v040: SpecVersion = "0.4.0".parse().unwrap();
        let v100: SpecVersion = "1.0".parse().unwrap();
        assert!(v030 < v040);
        assert!(v040 < v100);
        assert_eq!(v100, SpecVersion::new(1, 0, 0));
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "1..0", "a.b.c", "1.0.0.0", "1.0."] {
            assert!(bad.parse::<SpecVersion>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_supported_set() {
        assert!("0.3.1".parse::<SpecVersion>().unwrap().is_supported());
        assert!(SpecVersion::LATEST.is_supported());
        assert!(!"0.2.0".parse::<SpecVersion>().unwrap().is_supported());
        assert!(!"2.0.0".parse::<SpecVersion>().unwrap().is_supported());
    }

    #[test]
    fn test_check_gate() {
        assert!(!"0.3.1".parse::<SpecVersion>().unwrap().supports_check());
        assert!("0.4.0".parse::<SpecVersion>().unwrap().supports_check());
        assert!(SpecVersion::LATEST.supports_check());
    }

    #[test]
    fn test_version_info_json() {
        let info = VersionInfo::for_request(Some("0.4.0"));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["cniVersion"], "0.4.0");
        assert_eq!(json["supportedVersions"].as_array().unwrap().len(), 5);

        let latest = VersionInfo::for_request(None);
        assert_eq!(latest.cni_version, "1.1.0");
    }
}
