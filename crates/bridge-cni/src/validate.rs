//! Verification of a recorded topology against the live kernel state.
//!
//! A previous ADD result names three interfaces: the bridge, the host end of
//! the veth pair, and the container end. Each is resolved in its namespace
//! and the links between them (veth peering and bridge membership) are
//! checked by kernel index.

use crate::error::{CniError, Result};
use crate::iface::validate_expected_ips;
use crate::kernel::{Kernel, Link};
use crate::netns::Netns;
use cni_types::{CniResult, Interface, MacAddress};
use ipnet::IpNet;
use tracing::{debug, instrument};

/// One interface as seen during validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub name: String,
    pub mac: Option<MacAddress>,
    pub sandbox: String,
    pub kernel_index: u32,
    pub peer_index: u32,
    pub master_index: u32,
    pub found: bool,
}

impl InterfaceRecord {
    fn resolved(link: &Link, sandbox: &str) -> Self {
        Self {
            name: link.name.clone(),
            mac: link.mac,
            sandbox: sandbox.to_string(),
            kernel_index: link.index,
            peer_index: link.peer_index.unwrap_or_default(),
            master_index: link.master.unwrap_or_default(),
            found: false,
        }
    }
}

/// Resolves `intf` in the current namespace and checks its sandbox field.
fn lookup_recorded<K: Kernel>(kernel: &K, intf: &Interface, expect_in_sandbox: bool) -> Result<Link> {
    if intf.name.is_empty() {
        return Err(CniError::validation("Interface name missing"));
    }

    let link = kernel
        .link_by_name(&intf.name)
        .map_err(|_| CniError::device(format!("Interface name {} not found", intf.name)))?;

    match (expect_in_sandbox, intf.sandbox().is_empty()) {
        (true, true) => Err(CniError::validation(format!(
            "Interface {} is expected to be in a sandbox",
            intf.name
        ))),
        (false, false) => Err(CniError::validation(format!(
            "Interface {} should not be in sandbox",
            intf.name
        ))),
        _ => Ok(link),
    }
}

fn mac_matches(recorded: Option<MacAddress>, live: Option<MacAddress>) -> bool {
    recorded.is_none() || recorded == live
}

fn validate_bridge<K: Kernel>(kernel: &K, intf: &Interface) -> Result<InterfaceRecord> {
    let link = lookup_recorded(kernel, intf, false)?;
    if !link.is_bridge() {
        return Err(CniError::device(format!(
            "Interface {} does not have link type of bridge",
            intf.name
        )));
    }
    if !mac_matches(intf.mac, link.mac) {
        return Err(CniError::device(format!(
            "Bridge interface {} Mac doesn't match: {}",
            intf.name,
            display_mac(intf.mac)
        )));
    }

    let mut record = InterfaceRecord::resolved(&link, "");
    record.found = true;
    Ok(record)
}

fn validate_container<K: Kernel>(kernel: &K, intf: &Interface) -> Result<InterfaceRecord> {
    let link = lookup_recorded(kernel, intf, true)?;
    if !link.is_veth() {
        return Err(CniError::device(format!(
            "Error: Container interface {} not of type veth",
            link.name
        )));
    }
    if link.peer_index.is_none() {
        return Err(CniError::device(format!(
            "Unable to obtain veth peer index for veth {}",
            link.name
        )));
    }
    if !mac_matches(intf.mac, link.mac) {
        return Err(CniError::device(format!(
            "Interface {} Mac {} doesn't match container Mac: {}",
            intf.name,
            display_mac(intf.mac),
            display_mac(link.mac)
        )));
    }

    let mut record = InterfaceRecord::resolved(&link, intf.sandbox());
    record.found = true;
    Ok(record)
}

/// Checks whether `intf` is the host end peered with `container` and
/// enslaved to `bridge`. Anything else is not ours and is skipped.
fn validate_host_veth<K: Kernel>(
    kernel: &K,
    intf: &Interface,
    bridge: &InterfaceRecord,
    container: &InterfaceRecord,
) -> Result<InterfaceRecord> {
    let link = lookup_recorded(kernel, intf, false)?;
    if !link.is_veth() {
        return Ok(InterfaceRecord::default());
    }
    if link.peer_index.is_none() {
        return Err(CniError::device(format!(
            "Unable to obtain veth peer index for veth {}",
            link.name
        )));
    }

    let mut record = InterfaceRecord::resolved(&link, "");
    if record.kernel_index != container.peer_index
        || container.kernel_index != record.peer_index
        || record.master_index != bridge.kernel_index
    {
        return Ok(record);
    }

    if !mac_matches(intf.mac, link.mac) {
        return Err(CniError::device(format!(
            "Interface {} Mac doesn't match: {} not found",
            intf.name,
            display_mac(intf.mac)
        )));
    }

    record.found = true;
    Ok(record)
}

fn display_mac(mac: Option<MacAddress>) -> String {
    mac.map(|m| m.to_string()).unwrap_or_default()
}

/// Addresses recorded for the container interface at position `container`.
fn expected_addresses(prev: &CniResult, container: Option<usize>) -> Vec<IpNet> {
    prev.ips
        .iter()
        .filter(|ip| ip.interface.is_none() || ip.interface == container)
        .map(|ip| ip.address)
        .collect()
}

/// Verifies that the live topology reproduces `prev`.
///
/// Must be called from the host namespace; the container side is inspected
/// through `netns`.
#[instrument(skip(kernel, netns, prev), fields(netns = %netns.path()))]
pub fn validate_topology<K: Kernel>(
    kernel: &K,
    netns: &K::Netns,
    bridge_name: &str,
    ifname: &str,
    prev: &CniResult,
) -> Result<()> {
    let bridge_pos = prev.interfaces.iter().position(|i| i.name == bridge_name);
    let container_pos = prev
        .interfaces
        .iter()
        .position(|i| i.name == ifname && i.sandbox() == netns.path());

    let empty = Interface::default();
    let bridge_intf = bridge_pos.map_or(&empty, |p| &prev.interfaces[p]);
    let container_intf = container_pos.map_or(&empty, |p| &prev.interfaces[p]);

    let bridge = validate_bridge(kernel, bridge_intf)?;

    if container_intf.sandbox() != netns.path() {
        return Err(CniError::validation(format!(
            "Sandbox in prevResult {} doesn't match configured netns: {}",
            container_intf.sandbox(),
            netns.path()
        )));
    }

    let container = netns.run(|| validate_container(kernel, container_intf))?;

    let mut veth = InterfaceRecord::default();
    for intf in &prev.interfaces {
        if intf.name == bridge_intf.name || intf.name == container_intf.name {
            continue;
        }
        veth = validate_host_veth(kernel, intf, &bridge, &container)?;
        if veth.found {
            debug!(veth = %veth.name, "Found host veth");
            break;
        }
    }

    if !bridge.found {
        return Err(CniError::validation(format!(
            "CNI created bridge {bridge_name} in host namespace was not found"
        )));
    }
    if !container.found {
        return Err(CniError::validation(format!(
            "CNI created interface in container {ifname} not found"
        )));
    }
    if !veth.found {
        return Err(CniError::validation(format!(
            "CNI veth created for bridge {bridge_name} was not found"
        )));
    }

    let expected = expected_addresses(prev, container_pos);
    netns.run(|| validate_expected_ips(kernel, ifname, &expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cni_types::IpConfig;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mac_matches() {
        let mac: MacAddress = "0a:58:0a:f4:00:01".parse().unwrap();
        let other: MacAddress = "0a:58:0a:f4:00:02".parse().unwrap();
        assert!(mac_matches(None, Some(mac)));
        assert!(mac_matches(Some(mac), Some(mac)));
        assert!(!mac_matches(Some(mac), Some(other)));
        assert!(!mac_matches(Some(mac), None));
    }

    #[test]
    fn test_expected_addresses_follow_container_index() {
        let ip = |addr: &str, interface| IpConfig {
            address: addr.parse().unwrap(),
            gateway: None,
            interface,
        };
        let prev = CniResult {
            ips: vec![
                ip("10.244.0.5/24", Some(2)),
                ip("10.99.0.5/24", Some(1)),
                ip("fd00::5/64", None),
            ],
            ..Default::default()
        };
        let expected: Vec<String> = expected_addresses(&prev, Some(2))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(expected, vec!["10.244.0.5/24", "fd00::5/64"]);
    }
}
