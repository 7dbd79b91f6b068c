//! Veth pair creation and bridge attachment.

use crate::error::{CniError, Result};
use crate::kernel::{Kernel, Link, VethRequest};
use crate::netns::Netns;
use cni_types::{Interface, MacAddress};
use rand::Rng;
use tracing::{debug, info, instrument};

/// Attempts at drawing a free host-side name.
const MAX_NAME_ATTEMPTS: usize = 10;

/// Result records for both ends of a new pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub host: Interface,
    pub container: Interface,
}

/// A host-side name of the form `veth` plus eight lowercase hex digits.
pub fn random_veth_name() -> String {
    format!("veth{:08x}", rand::thread_rng().gen::<u32>())
}

/// Creates the pair in `netns` and attaches the host end to `bridge`.
pub fn setup_veth<K: Kernel>(
    kernel: &K,
    netns: &K::Netns,
    bridge: &Link,
    ifname: &str,
    mtu: u32,
    mac: Option<MacAddress>,
) -> Result<VethPair> {
    setup_veth_with(kernel, netns, bridge, ifname, mtu, mac, random_veth_name)
}

/// [`setup_veth`] with a caller-supplied host name generator.
#[instrument(skip(kernel, netns, bridge, next_name), fields(netns = %netns.path(), bridge = %bridge.name))]
pub fn setup_veth_with<K, G>(
    kernel: &K,
    netns: &K::Netns,
    bridge: &Link,
    ifname: &str,
    mtu: u32,
    mac: Option<MacAddress>,
    mut next_name: G,
) -> Result<VethPair>
where
    K: Kernel,
    G: FnMut() -> String,
{
    let host_netns = kernel.current_netns()?;

    let (container, host_name) = netns.run(|| -> Result<(Link, String)> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let peer_name = next_name();
            let req = VethRequest {
                name: ifname,
                peer_name: &peer_name,
                mtu,
                mac,
            };
            match kernel.create_veth(&req, &host_netns) {
                Ok(link) => return Ok((link, peer_name)),
                Err(e) if e.is_exists() => {
                    if kernel.link_by_name(ifname).is_ok() {
                        return Err(CniError::device(format!(
                            "container veth name {ifname:?} already exists"
                        )));
                    }
                    debug!(peer = %peer_name, "Host veth name taken, drawing another");
                }
                Err(e) => {
                    return Err(CniError::device(format!("failed to make veth pair: {e}")));
                }
            }
        }
        Err(CniError::device("failed to find a unique veth name"))
    })?;

    // The host end changed index when it moved namespaces; look it up again.
    let host = kernel
        .link_by_name(&host_name)
        .map_err(|e| CniError::device(format!("failed to lookup {host_name:?}: {e}")))?;
    kernel
        .set_link_up(host.index)
        .map_err(|e| CniError::device(format!("failed to set {host_name:?} up: {e}")))?;
    kernel.set_link_master(host.index, bridge.index).map_err(|e| {
        CniError::device(format!(
            "failed to connect {host_name:?} to bridge {}: {e}",
            bridge.name
        ))
    })?;

    info!(host = %host_name, container = %container.name, "Wired veth pair");

    Ok(VethPair {
        host: Interface::host(host.name, host.mac),
        container: Interface::container(container.name, container.mac, netns.path()),
    })
}
