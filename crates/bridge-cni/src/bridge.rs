//! Bridge lookup.

use crate::error::{CniError, Result};
use crate::kernel::{Kernel, Link};
use cni_types::Interface;
use tracing::{debug, instrument};

/// Resolves `name` in the current namespace and requires it to be a bridge.
pub fn bridge_by_name<K: Kernel>(kernel: &K, name: &str) -> Result<Link> {
    let link = kernel
        .link_by_name(name)
        .map_err(|e| CniError::device(format!("could not lookup {name:?}: {e}")))?;
    if !link.is_bridge() {
        return Err(CniError::device(format!(
            "{name:?} already exists but is not a bridge"
        )));
    }
    Ok(link)
}

/// Resolves the configured bridge and builds its result record.
///
/// Router advertisements are switched off on the bridge so the plugin owns
/// its routes; failure to do so is not an error.
#[instrument(skip(kernel))]
pub fn resolve_default_bridge<K: Kernel>(kernel: &K, name: &str) -> Result<(Link, Interface)> {
    let bridge = bridge_by_name(kernel, name)?;

    let key = format!("net/ipv6/conf/{name}/accept_ra");
    if let Err(e) = kernel.write_sysctl(&key, "0") {
        debug!(key = %key, error = %e, "Ignoring sysctl failure");
    }

    let record = Interface {
        name: bridge.name.clone(),
        mac: bridge.mac,
        sandbox: None,
    };
    Ok((bridge, record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelError, LinkAddress, LinkKind, VethRequest};
    use crate::netns::{Netns, NetnsError};
    use cni_types::{OperState, Route};
    use ipnet::IpNet;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    struct HostOnly;

    impl Netns for HostOnly {
        fn path(&self) -> &str {
            ""
        }

        fn run<T, E, F>(&self, f: F) -> std::result::Result<T, E>
        where
            F: FnOnce() -> std::result::Result<T, E>,
            E: From<NetnsError>,
        {
            f()
        }
    }

    /// Kernel that knows one link and records sysctl writes.
    struct OneLink {
        link: Link,
        sysctls: RefCell<Vec<String>>,
    }

    impl Kernel for OneLink {
        type Netns = HostOnly;

        fn open_netns(&self, _: &str) -> std::result::Result<HostOnly, NetnsError> {
            Ok(HostOnly)
        }

        fn current_netns(&self) -> std::result::Result<HostOnly, NetnsError> {
            Ok(HostOnly)
        }

        fn link_by_name(&self, name: &str) -> std::result::Result<Link, KernelError> {
            if name == self.link.name {
                Ok(self.link.clone())
            } else {
                Err(KernelError::LinkNotFound)
            }
        }

        fn create_veth(&self, _: &VethRequest<'_>, _: &HostOnly) -> std::result::Result<Link, KernelError> {
            unimplemented!()
        }

        fn set_link_up(&self, _: u32) -> std::result::Result<(), KernelError> {
            unimplemented!()
        }

        fn set_link_master(&self, _: u32, _: u32) -> std::result::Result<(), KernelError> {
            unimplemented!()
        }

        fn delete_link(&self, _: &str) -> std::result::Result<(), KernelError> {
            unimplemented!()
        }

        fn add_address(&self, _: u32, _: IpNet) -> std::result::Result<(), KernelError> {
            unimplemented!()
        }

        fn link_addresses(&self, _: u32) -> std::result::Result<Vec<LinkAddress>, KernelError> {
            unimplemented!()
        }

        fn add_route(&self, _: u32, _: &Route) -> std::result::Result<(), KernelError> {
            unimplemented!()
        }

        fn write_sysctl(&self, key: &str, _: &str) -> std::result::Result<(), KernelError> {
            self.sysctls.borrow_mut().push(key.to_string());
            Err(KernelError::os("sysctl", std::io::Error::from_raw_os_error(libc::EACCES)))
        }
    }

    fn kernel(kind: LinkKind) -> OneLink {
        OneLink {
            link: Link {
                index: 4,
                name: "cni0".into(),
                kind,
                mac: Some("0a:58:0a:f4:00:01".parse().unwrap()),
                master: None,
                peer_index: None,
                oper_state: OperState::Up,
                mtu: 1500,
            },
            sysctls: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn test_resolve_bridge() {
        let kernel = kernel(LinkKind::Bridge);
        let (link, record) = resolve_default_bridge(&kernel, "cni0").unwrap();
        assert_eq!(link.index, 4);
        assert_eq!(record, Interface::host("cni0", link.mac));
        assert_eq!(
            kernel.sysctls.borrow().as_slice(),
            ["net/ipv6/conf/cni0/accept_ra".to_string()]
        );
    }

    #[test]
    fn test_missing_bridge() {
        let err = bridge_by_name(&kernel(LinkKind::Bridge), "br-x").unwrap_err();
        assert_eq!(err.code(), 102);
        assert_eq!(err.to_string(), "could not lookup \"br-x\": Link not found");
    }

    #[test]
    fn test_not_a_bridge() {
        let err = bridge_by_name(&kernel(LinkKind::Other("dummy".into())), "cni0").unwrap_err();
        assert_eq!(err.to_string(), "\"cni0\" already exists but is not a bridge");
    }
}
