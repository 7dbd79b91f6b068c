//! Plugin error type and its mapping onto CNI error codes.

use crate::netns::NetnsError;
use cni_types::{ErrorCode, ErrorReport};
use std::io;
use thiserror::Error;

/// Result type alias for plugin operations.
pub type Result<T> = std::result::Result<T, CniError>;

/// Errors a command can fail with. Every variant is terminal for the call.
#[derive(Debug, Error)]
pub enum CniError {
    /// Malformed configuration or call arguments.
    #[error("{0}")]
    Config(String),

    /// Missing or invalid `CNI_*` environment variables.
    #[error("{0}")]
    InvalidEnvironment(String),

    #[error("failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    #[error("{0}")]
    IncompatibleVersion(String),

    /// Named device missing, of the wrong kind, or with mismatched attributes.
    #[error("{0}")]
    Device(String),

    /// Namespace path invalid or no longer present.
    #[error("{0}")]
    Namespace(String),

    /// IPAM delegate failed, or returned no addresses.
    #[error("{0}")]
    Ipam(String),

    /// The IPAM delegate reported a structured error of its own.
    #[error("{report}")]
    Delegate { plugin: String, report: ErrorReport },

    /// Host port never reached "up" within the bounded poll.
    #[error("{0}")]
    ReadinessTimeout(String),

    /// CHECK found recorded and live state disagreeing.
    #[error("{0}")]
    Validation(String),

    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
}

impl CniError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid_env(message: impl Into<String>) -> Self {
        Self::InvalidEnvironment(message.into())
    }

    pub fn decode(what: &'static str, message: impl ToString) -> Self {
        Self::Decode {
            what,
            message: message.to_string(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }

    pub fn namespace(message: impl Into<String>) -> Self {
        Self::Namespace(message.into())
    }

    pub fn ipam(message: impl Into<String>) -> Self {
        Self::Ipam(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// The numeric code reported in the error document.
    pub fn code(&self) -> u32 {
        let code = match self {
            Self::Config(_) => ErrorCode::InvalidNetworkConfig,
            Self::InvalidEnvironment(_) => ErrorCode::InvalidEnvironment,
            Self::Decode { .. } => ErrorCode::DecodeFailure,
            Self::IncompatibleVersion(_) => ErrorCode::IncompatibleVersion,
            Self::Device(_) => ErrorCode::Device,
            Self::Namespace(_) => ErrorCode::Namespace,
            Self::Ipam(_) => ErrorCode::Ipam,
            Self::Delegate { report, .. } => return report.code,
            Self::ReadinessTimeout(_) => ErrorCode::ReadinessTimeout,
            Self::Validation(_) => ErrorCode::Validation,
            Self::Io(_) => ErrorCode::IoFailure,
        };
        code.code()
    }

    /// Builds the error document for stdout.
    ///
    /// Delegate errors pass through with the delegate's own msg and details.
    pub fn to_report(&self, cni_version: &str) -> ErrorReport {
        match self {
            Self::Delegate { report, .. } => ErrorReport {
                cni_version: cni_version.to_string(),
                ..report.clone()
            },
            _ => ErrorReport::new(cni_version, self.code(), self.to_string()),
        }
    }
}

impl From<NetnsError> for CniError {
    fn from(err: NetnsError) -> Self {
        Self::Namespace(err.to_string())
    }
}
