//! Wire types shared by CNI plugins.
//!
//! This crate provides type-safe representations of the documents a CNI
//! plugin exchanges with its runtime and with delegated plugins:
//!
//! - [`MacAddress`]: 48-bit Ethernet hardware addresses
//! - [`OperState`]: kernel-reported operational state of a link
//! - [`SpecVersion`]: CNI protocol versions and version negotiation
//! - [`CniResult`]: the success document, decodable from every supported shape
//! - [`ErrorReport`]: the error document written on failure

mod error;
mod mac;
mod oper;
mod result;
mod version;

pub use error::{ErrorCode, ErrorReport};
pub use mac::MacAddress;
pub use oper::OperState;
pub use result::{CniResult, Dns, Interface, IpConfig, Route};
pub use version::{SpecVersion, VersionInfo, SUPPORTED_VERSIONS};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid operational state: {0}")]
    InvalidOperState(String),

    #[error("invalid CNI version: {0}")]
    InvalidVersion(String),

    #[error("failed to decode result: {0}")]
    InvalidResult(String),
}
