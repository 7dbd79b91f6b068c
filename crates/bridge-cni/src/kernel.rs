//! Kernel operations the plugin needs, behind one trait.
//!
//! Every link, address, route and sysctl operation acts on the network
//! namespace the calling thread is currently in. Callers switch namespaces
//! with [`Netns::run`](crate::netns::Netns::run) and then use the same
//! [`Kernel`] handle on either side.

use crate::netns::{Netns, NetnsError};
use cni_types::{MacAddress, OperState, Route};
use ipnet::IpNet;
use std::io;
use thiserror::Error;

/// Errors returned by kernel operations.
#[derive(Debug, Error)]
pub enum KernelError {
    /// No link with the requested name or index (`ENODEV`).
    #[error("Link not found")]
    LinkNotFound,

    /// The object being created already exists (`EEXIST`).
    #[error("file exists")]
    Exists,

    /// Any other errno reported by the kernel.
    #[error("{operation}: {source}")]
    Os {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// The kernel reply could not be decoded.
    #[error("netlink decode error: {0}")]
    Decode(String),
}

impl KernelError {
    pub fn os(operation: &'static str, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::ENODEV) => Self::LinkNotFound,
            Some(libc::EEXIST) => Self::Exists,
            _ => Self::Os { operation, source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::LinkNotFound)
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Exists)
    }
}

/// Link type as reported by `IFLA_INFO_KIND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Veth,
    Other(String),
}

/// Snapshot of a kernel link. Never cached across steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    pub mac: Option<MacAddress>,
    /// Index of the bridge this link is enslaved to.
    pub master: Option<u32>,
    /// For veths, the peer's index in the peer's namespace.
    pub peer_index: Option<u32>,
    pub oper_state: OperState,
    pub mtu: u32,
}

impl Link {
    pub fn is_bridge(&self) -> bool {
        self.kind == LinkKind::Bridge
    }

    pub fn is_veth(&self) -> bool {
        self.kind == LinkKind::Veth
    }
}

/// Address scope (`ifa_scope`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrScope {
    Universe,
    Site,
    Link,
    Host,
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAddress {
    pub address: IpNet,
    pub scope: AddrScope,
}

/// Parameters for creating a veth pair from inside the container namespace.
#[derive(Debug, Clone)]
pub struct VethRequest<'a> {
    /// Container-side name.
    pub name: &'a str,
    /// Host-side name; the peer is created directly in the peer namespace.
    pub peer_name: &'a str,
    /// Applied to both ends. Zero keeps the kernel default.
    pub mtu: u32,
    /// Container-side hardware address override.
    pub mac: Option<MacAddress>,
}

/// Kernel network operations, relative to the thread's current namespace.
pub trait Kernel {
    type Netns: Netns;

    /// Opens a handle on the namespace bound at `path`.
    fn open_netns(&self, path: &str) -> Result<Self::Netns, NetnsError>;

    /// Opens a handle on the calling thread's current namespace.
    fn current_netns(&self) -> Result<Self::Netns, NetnsError>;

    fn link_by_name(&self, name: &str) -> Result<Link, KernelError>;

    /// Creates a veth pair whose peer end lands in `peer_netns`.
    ///
    /// Returns the local (container-side) end.
    fn create_veth(&self, req: &VethRequest<'_>, peer_netns: &Self::Netns)
        -> Result<Link, KernelError>;

    fn set_link_up(&self, index: u32) -> Result<(), KernelError>;

    fn set_link_master(&self, index: u32, master: u32) -> Result<(), KernelError>;

    /// Deletes a link by name. A veth takes its peer with it.
    fn delete_link(&self, name: &str) -> Result<(), KernelError>;

    fn add_address(&self, index: u32, address: IpNet) -> Result<(), KernelError>;

    fn link_addresses(&self, index: u32) -> Result<Vec<LinkAddress>, KernelError>;

    /// Installs `route` out of link `index`. `route.gw` is used as given.
    fn add_route(&self, index: u32, route: &Route) -> Result<(), KernelError>;

    /// Writes a `/proc/sys` key given in slash form, e.g. `net/ipv4/conf/all/arp_notify`.
    fn write_sysctl(&self, key: &str, value: &str) -> Result<(), KernelError>;
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{Kernel, KernelError, Link, LinkAddress, VethRequest};
    use crate::netlink::NetlinkHandle;
    use crate::netns::{LinuxNetns, NetnsError};
    use crate::sysctl;
    use cni_types::Route;
    use ipnet::IpNet;
    use std::os::fd::AsRawFd;
    use tracing::debug;

    /// [`Kernel`] backed by rtnetlink and `/proc/sys`.
    ///
    /// A fresh netlink socket is opened per operation so that it binds to
    /// whichever namespace the thread is in at that moment.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LinuxKernel;

    impl LinuxKernel {
        pub fn new() -> Self {
            Self
        }
    }

    impl Kernel for LinuxKernel {
        type Netns = LinuxNetns;

        fn open_netns(&self, path: &str) -> Result<LinuxNetns, NetnsError> {
            LinuxNetns::open(path)
        }

        fn current_netns(&self) -> Result<LinuxNetns, NetnsError> {
            LinuxNetns::current()
        }

        fn link_by_name(&self, name: &str) -> Result<Link, KernelError> {
            NetlinkHandle::new()?.link_by_name(name)
        }

        fn create_veth(
            &self,
            req: &VethRequest<'_>,
            peer_netns: &LinuxNetns,
        ) -> Result<Link, KernelError> {
            let mut handle = NetlinkHandle::new()?;
            handle.create_veth(req, peer_netns.as_raw_fd())?;
            debug!(name = req.name, peer = req.peer_name, "Created veth pair");
            handle.link_by_name(req.name)
        }

        fn set_link_up(&self, index: u32) -> Result<(), KernelError> {
            NetlinkHandle::new()?.set_link_up(index)
        }

        fn set_link_master(&self, index: u32, master: u32) -> Result<(), KernelError> {
            NetlinkHandle::new()?.set_link_master(index, master)
        }

        fn delete_link(&self, name: &str) -> Result<(), KernelError> {
            NetlinkHandle::new()?.delete_link(name)
        }

        fn add_address(&self, index: u32, address: IpNet) -> Result<(), KernelError> {
            NetlinkHandle::new()?.add_address(index, address)
        }

        fn link_addresses(&self, index: u32) -> Result<Vec<LinkAddress>, KernelError> {
            NetlinkHandle::new()?.link_addresses(index)
        }

        fn add_route(&self, index: u32, route: &Route) -> Result<(), KernelError> {
            NetlinkHandle::new()?.add_route(index, route)
        }

        fn write_sysctl(&self, key: &str, value: &str) -> Result<(), KernelError> {
            sysctl::write(key, value).map_err(|e| KernelError::os("sysctl", e))
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxKernel;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let err = KernelError::os("get link", io::Error::from_raw_os_error(libc::ENODEV));
        assert!(err.is_not_found());

        let err = KernelError::os("new link", io::Error::from_raw_os_error(libc::EEXIST));
        assert!(err.is_exists());

        let err = KernelError::os("new link", io::Error::from_raw_os_error(libc::EPERM));
        assert!(matches!(err, KernelError::Os { operation: "new link", .. }));
        assert!(err.to_string().starts_with("new link: "));
    }

    #[test]
    fn test_link_kind_helpers() {
        let link = Link {
            index: 3,
            name: "cni0".into(),
            kind: LinkKind::Bridge,
            mac: None,
            master: None,
            peer_index: None,
            oper_state: OperState::Up,
            mtu: 1500,
        };
        assert!(link.is_bridge());
        assert!(!link.is_veth());
    }
}
