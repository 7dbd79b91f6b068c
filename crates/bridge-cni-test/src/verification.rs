//! Verification helpers for wired topologies
//!
//! Assertions over [`FakeKernel`] state after a command has run.

use crate::fixtures::{FakeKernel, HOST_NS};
use bridge_cni::kernel::AddrScope;
use cni_types::OperState;
use ipnet::IpNet;
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected link '{name}' in namespace '{netns}'")]
    LinkMissing { netns: String, name: String },

    #[error("Link '{name}' in namespace '{netns}' should not exist")]
    LinkPresent { netns: String, name: String },

    #[error("Link '{name}' is {state}, expected up")]
    NotUp { name: String, state: OperState },

    #[error("Link '{port}' is not enslaved to '{bridge}'")]
    NotEnslaved { port: String, bridge: String },

    #[error("Links '{host}' and '{container}' are not veth peers")]
    NotPeers { host: String, container: String },

    #[error("Addresses on '{name}': expected {expected:?}, got {actual:?}")]
    AddressMismatch {
        name: String,
        expected: Vec<IpNet>,
        actual: Vec<IpNet>,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Topology verifier over a [`FakeKernel`]
pub struct TopologyVerifier<'a> {
    kernel: &'a FakeKernel,
}

impl<'a> TopologyVerifier<'a> {
    pub fn new(kernel: &'a FakeKernel) -> Self {
        Self { kernel }
    }

    pub fn assert_link_exists(&self, netns: &str, name: &str) -> VerifyResult<()> {
        self.kernel
            .link(netns, name)
            .map(drop)
            .ok_or_else(|| VerificationError::LinkMissing {
                netns: netns.to_string(),
                name: name.to_string(),
            })
    }

    pub fn assert_link_absent(&self, netns: &str, name: &str) -> VerifyResult<()> {
        match self.kernel.link(netns, name) {
            Some(_) => Err(VerificationError::LinkPresent {
                netns: netns.to_string(),
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn assert_link_up(&self, netns: &str, name: &str) -> VerifyResult<()> {
        let link = self.kernel.link(netns, name).ok_or_else(|| VerificationError::LinkMissing {
            netns: netns.to_string(),
            name: name.to_string(),
        })?;
        if link.oper_state.is_up() {
            Ok(())
        } else {
            Err(VerificationError::NotUp {
                name: name.to_string(),
                state: link.oper_state,
            })
        }
    }

    /// Host veth `host` is a port of `bridge` and peers with the
    /// container-side `container` in `netns`.
    pub fn assert_wired(&self, bridge: &str, host: &str, netns: &str, container: &str) -> VerifyResult<()> {
        let missing = |ns: &str, name: &str| VerificationError::LinkMissing {
            netns: ns.to_string(),
            name: name.to_string(),
        };
        let br = self.kernel.link(HOST_NS, bridge).ok_or_else(|| missing(HOST_NS, bridge))?;
        let port = self.kernel.link(HOST_NS, host).ok_or_else(|| missing(HOST_NS, host))?;
        let cont = self.kernel.link(netns, container).ok_or_else(|| missing(netns, container))?;

        if port.master != Some(br.index) {
            return Err(VerificationError::NotEnslaved {
                port: host.to_string(),
                bridge: bridge.to_string(),
            });
        }
        if port.peer_index != Some(cont.index) || cont.peer_index != Some(port.index) {
            return Err(VerificationError::NotPeers {
                host: host.to_string(),
                container: container.to_string(),
            });
        }
        Ok(())
    }

    /// Global-scope addresses on `name` are exactly `expected`.
    pub fn assert_addresses(&self, netns: &str, name: &str, expected: &[&str]) -> VerifyResult<()> {
        let mut actual: Vec<IpNet> = self
            .kernel
            .addresses(netns, name)
            .into_iter()
            .filter(|a| a.scope == AddrScope::Universe)
            .map(|a| a.address)
            .collect();
        let mut expected: Vec<IpNet> = expected
            .iter()
            .map(|a| a.parse().unwrap_or_else(|e| panic!("bad address {a}: {e}")))
            .collect();
        actual.sort();
        expected.sort();
        if actual == expected {
            Ok(())
        } else {
            Err(VerificationError::AddressMismatch {
                name: name.to_string(),
                expected,
                actual,
            })
        }
    }
}
