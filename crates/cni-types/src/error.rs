//! The CNI error document and its numeric codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes a plugin may report.
///
/// Codes below 100 are reserved by the CNI protocol; 100 and above are
/// plugin-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    IncompatibleVersion = 1,
    UnsupportedField = 2,
    ContainerUnknown = 3,
    InvalidEnvironment = 4,
    IoFailure = 5,
    DecodeFailure = 6,
    InvalidNetworkConfig = 7,
    TryAgainLater = 11,
    Ipam = 101,
    Device = 102,
    Namespace = 103,
    ReadinessTimeout = 104,
    Validation = 105,
}

impl ErrorCode {
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// The document written to stdout when a command fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorReport {
    pub fn new(cni_version: impl Into<String>, code: u32, msg: impl Into<String>) -> Self {
        Self {
            cni_version: cni_version.into(),
            code,
            msg: msg.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        let details = details.into();
        self.details = (!details.is_empty()).then_some(details);
        self
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}; {}", self.msg, details),
            None => write!(f, "{}", self.msg),
        }
    }
}

impl std::error::Error for ErrorReport {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_delegate_error() {
        let data = r#"{
            "code": 7,
            "msg": "Invalid Configuration",
            "details": "Network 192.168.0.0/31 too small to allocate from."
        }"#;
        let report: ErrorReport = serde_json::from_str(data).unwrap();
        assert_eq!(report.code, ErrorCode::InvalidNetworkConfig.code());
        assert_eq!(report.cni_version, "");
        assert_eq!(
            report.to_string(),
            "Invalid Configuration; Network 192.168.0.0/31 too small to allocate from."
        );
    }

    #[test]
    fn test_serialize_omits_empty_details() {
        let report = ErrorReport::new("1.0.0", ErrorCode::Device.code(), "boom").with_details("");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"cniVersion": "1.0.0", "code": 102, "msg": "boom"})
        );
    }
}
