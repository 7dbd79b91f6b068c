//! Integration test infrastructure for bridge-cni
//!
//! Provides:
//! - An in-memory kernel with namespaces and veth peering
//! - A recording IPAM delegate with scripted replies
//! - A ready-made host (bridge plus pod namespace) to run commands against
//! - Topology verification helpers

pub mod fixtures;
mod verification;

pub use fixtures::*;
pub use verification::*;
