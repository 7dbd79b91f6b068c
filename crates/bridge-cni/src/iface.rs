//! Container interface addressing.
//!
//! Both functions act on the namespace the thread is currently in and are
//! meant to be called from inside [`Netns::run`](crate::netns::Netns::run).

use crate::error::{CniError, Result};
use crate::kernel::{AddrScope, Kernel};
use cni_types::{CniResult, Route};
use ipnet::IpNet;
use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// Brings `ifname` up and applies the addresses and routes of `result`.
///
/// Only addresses whose `interface` index refers to `ifname` are applied.
/// Routes without a gateway use the first gateway of the same family.
#[instrument(skip(kernel, result))]
pub fn configure_iface<K: Kernel>(kernel: &K, ifname: &str, result: &CniResult) -> Result<()> {
    let link = kernel
        .link_by_name(ifname)
        .map_err(|e| CniError::device(format!("failed to lookup {ifname:?}: {e}")))?;
    kernel
        .set_link_up(link.index)
        .map_err(|e| CniError::device(format!("failed to set {ifname:?} UP: {e}")))?;

    for ip in &result.ips {
        let Some(idx) = ip.interface else {
            continue;
        };
        let owned = result
            .interfaces
            .get(idx)
            .is_some_and(|iface| iface.name == ifname);
        if !owned {
            return Err(CniError::device(format!(
                "failed to add IP addr {} to {ifname:?}: invalid interface index",
                ip.address
            )));
        }

        kernel.add_address(link.index, ip.address).map_err(|e| {
            CniError::device(format!("failed to add IP addr {} to {ifname:?}: {e}", ip.address))
        })?;
        debug!(address = %ip.address, "Added address");
    }

    for route in &result.routes {
        let effective = Route {
            dst: route.dst,
            gw: route.gw.or_else(|| result.gateway_for(&route.dst)),
        };
        match kernel.add_route(link.index, &effective) {
            Ok(()) => debug!(dst = %effective.dst, gw = ?effective.gw, "Added route"),
            Err(e) if e.is_exists() => {
                debug!(dst = %effective.dst, "Route already present");
            }
            Err(e) => {
                let via = effective
                    .gw
                    .map(|gw| gw.to_string())
                    .unwrap_or_else(|| "<nil>".to_string());
                return Err(CniError::device(format!(
                    "failed to add route '{} via {via} dev {ifname}': {e}",
                    effective.dst
                )));
            }
        }
    }

    Ok(())
}

/// Requires the global-scope addresses on `ifname` to be exactly `expected`.
///
/// Addresses the kernel assigns on its own (link-local) are not compared.
pub fn validate_expected_ips<K: Kernel>(kernel: &K, ifname: &str, expected: &[IpNet]) -> Result<()> {
    let link = kernel
        .link_by_name(ifname)
        .map_err(|e| CniError::device(format!("failed to lookup {ifname:?}: {e}")))?;
    let live: BTreeSet<IpNet> = kernel
        .link_addresses(link.index)
        .map_err(|e| CniError::device(format!("failed to list addresses on {ifname:?}: {e}")))?
        .into_iter()
        .filter(|addr| addr.scope == AddrScope::Universe)
        .map(|addr| addr.address)
        .collect();

    let wanted: BTreeSet<IpNet> = expected.iter().copied().collect();

    if let Some(missing) = wanted.difference(&live).next() {
        return Err(CniError::validation(format!(
            "Failed to match addr {missing} on interface {ifname}"
        )));
    }
    if let Some(extra) = live.difference(&wanted).next() {
        return Err(CniError::validation(format!(
            "Unexpected addr {extra} on interface {ifname}"
        )));
    }
    Ok(())
}
