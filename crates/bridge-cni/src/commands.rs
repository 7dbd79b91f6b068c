//! ADD, DEL and CHECK.

use crate::bridge::{bridge_by_name, resolve_default_bridge};
use crate::config::NetConf;
use crate::error::{CniError, Result};
use crate::iface::configure_iface;
use crate::ipam::{decode_result, IpamDelegate};
use crate::kernel::Kernel;
use crate::netns::{Netns, NetnsError};
use crate::readiness::wait_for_port;
use crate::skel::CmdArgs;
use crate::validate::validate_topology;
use crate::veth::setup_veth;
use cni_types::CniResult;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Position of the container interface in an ADD result.
const CONTAINER_IFACE_INDEX: usize = 2;

/// Releases the IPAM allocation unless the command completed.
struct IpamRelease<'a, I: IpamDelegate> {
    ipam: &'a I,
    conf: &'a NetConf,
    args: &'a CmdArgs,
    success: bool,
}

impl<'a, I: IpamDelegate> IpamRelease<'a, I> {
    fn new(ipam: &'a I, conf: &'a NetConf, args: &'a CmdArgs) -> Self {
        Self {
            ipam,
            conf,
            args,
            success: false,
        }
    }

    fn disarm(mut self) {
        self.success = true;
    }
}

impl<I: IpamDelegate> Drop for IpamRelease<'_, I> {
    fn drop(&mut self) {
        if self.success {
            return;
        }
        info!(container = %self.args.container_id, "Releasing IPAM allocation after failed ADD");
        if let Err(e) = self.ipam.del(self.conf, self.args) {
            warn!(error = %e, "IPAM release failed");
        }
    }
}

fn open_netns_error(path: &str, err: &NetnsError) -> CniError {
    CniError::namespace(format!("failed to open netns {path:?}: {err}"))
}

/// The plugin: kernel access plus the IPAM delegate.
pub struct Plugin<K, I> {
    kernel: K,
    ipam: I,
    sleep: Box<dyn Fn(Duration)>,
}

impl<K: Kernel, I: IpamDelegate> Plugin<K, I> {
    pub fn new(kernel: K, ipam: I) -> Self {
        Self {
            kernel,
            ipam,
            sleep: Box::new(std::thread::sleep),
        }
    }

    /// Replaces the sleep used between readiness probes.
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn ipam(&self) -> &I {
        &self.ipam
    }

    fn open_netns(&self, path: &str) -> Result<K::Netns> {
        self.kernel
            .open_netns(path)
            .map_err(|e| open_netns_error(path, &e))
    }

    #[instrument(skip_all, fields(container = %args.container_id, netns = %args.netns, ifname = %args.ifname))]
    pub fn cmd_add(&self, conf: &NetConf, args: &CmdArgs) -> Result<CniResult> {
        let (bridge, bridge_record) = resolve_default_bridge(&self.kernel, &conf.bridge)?;
        let netns = self.open_netns(&args.netns)?;

        let pair = setup_veth(&self.kernel, &netns, &bridge, &args.ifname, conf.mtu, conf.mac)?;
        let host_name = pair.host.name.clone();

        let mut result = CniResult {
            interfaces: vec![bridge_record, pair.host, pair.container],
            ..Default::default()
        };

        let release = if conf.is_layer3() {
            let raw = self.ipam.add(conf, args)?;
            let release = IpamRelease::new(&self.ipam, conf, args);
            let allocated = decode_result(&raw)?;

            result.ips = allocated
                .ips
                .into_iter()
                .map(|mut ip| {
                    ip.interface = Some(CONTAINER_IFACE_INDEX);
                    ip
                })
                .collect();
            result.routes = allocated.routes;
            result.dns = allocated.dns;

            if result.ips.is_empty() {
                return Err(CniError::ipam("IPAM plugin returned missing IP config"));
            }

            netns.run(|| {
                self.write_container_sysctls(&args.ifname, conf.enable_dad);
                configure_iface(&self.kernel, &args.ifname, &result)
            })?;

            wait_for_port(
                || {
                    self.kernel
                        .link_by_name(&host_name)
                        .map(|link| link.oper_state)
                        .map_err(|e| CniError::device(format!("failed to lookup {host_name:?}: {e}")))
                },
                |delay| (self.sleep)(delay),
            )?;

            Some(release)
        } else {
            netns.run(|| {
                let link = self
                    .kernel
                    .link_by_name(&args.ifname)
                    .map_err(|e| CniError::device(format!("failed to retrieve link: {e}")))?;
                self.kernel.set_link_up(link.index).map_err(|e| {
                    CniError::device(format!("failed to set {:?} up: {e}", args.ifname))
                })
            })?;
            None
        };

        // The bridge MAC can change when its first port is attached.
        let bridge = bridge_by_name(&self.kernel, &conf.bridge)?;
        result.interfaces[0].mac = bridge.mac;

        if let Some(release) = release {
            release.disarm();
        }

        info!(host = %host_name, ips = result.ips.len(), "ADD complete");
        Ok(result)
    }

    /// Sysctl failures are ignored.
    fn write_container_sysctls(&self, ifname: &str, enable_dad: bool) {
        let mut writes = Vec::with_capacity(3);
        if enable_dad {
            writes.push((format!("net/ipv6/conf/{ifname}/enhanced_dad"), "1"));
            writes.push((format!("net/ipv6/conf/{ifname}/accept_dad"), "1"));
        } else {
            writes.push((format!("net/ipv6/conf/{ifname}/accept_dad"), "0"));
        }
        writes.push((format!("net/ipv4/conf/{ifname}/arp_notify"), "1"));

        for (key, value) in writes {
            if let Err(e) = self.kernel.write_sysctl(&key, value) {
                debug!(key = %key, error = %e, "Ignoring sysctl failure");
            }
        }
    }

    fn release_ipam(&self, conf: &NetConf, args: &CmdArgs) -> Result<()> {
        if conf.is_layer3() {
            self.ipam.del(conf, args)?;
        }
        Ok(())
    }

    /// Removes the container interface and releases its addresses.
    ///
    /// Safe to repeat: a missing interface or namespace is not an error.
    #[instrument(skip_all, fields(container = %args.container_id, netns = %args.netns, ifname = %args.ifname))]
    pub fn cmd_del(&self, conf: &NetConf, args: &CmdArgs) -> Result<()> {
        if args.netns.is_empty() {
            return self.release_ipam(conf, args);
        }

        let netns = match self.kernel.open_netns(&args.netns) {
            Ok(netns) => netns,
            Err(e) if e.is_not_exist() => {
                debug!("Namespace already gone");
                return self.release_ipam(conf, args);
            }
            Err(e) => return Err(open_netns_error(&args.netns, &e)),
        };

        netns.run(|| match self.kernel.delete_link(&args.ifname) {
            Ok(()) => {
                debug!("Deleted container interface");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Container interface already gone");
                Ok(())
            }
            Err(e) => Err(CniError::device(format!(
                "failed to delete {:?}: {e}",
                args.ifname
            ))),
        })?;

        self.release_ipam(conf, args)
    }

    /// Verifies that a previous ADD's result still matches the kernel.
    #[instrument(skip_all, fields(container = %args.container_id, netns = %args.netns, ifname = %args.ifname))]
    pub fn cmd_check(&self, conf: &NetConf, args: &CmdArgs) -> Result<()> {
        if !conf.cni_version.supports_check() {
            return Err(CniError::IncompatibleVersion(
                "config version does not allow CHECK".to_string(),
            ));
        }

        let netns = self.open_netns(&args.netns)?;

        if conf.is_layer3() {
            self.ipam.check(conf, args)?;
        }

        let raw = conf
            .prev_result
            .as_ref()
            .ok_or_else(|| CniError::validation("Required prevResult missing"))?;
        let prev = CniResult::from_json(raw).map_err(|e| CniError::decode("prevResult", e))?;

        validate_topology(&self.kernel, &netns, &conf.bridge, &args.ifname, &prev)
    }
}
