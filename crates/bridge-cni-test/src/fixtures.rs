//! In-memory kernel and IPAM fixtures
//!
//! [`FakeKernel`] models just enough of the kernel for the command handlers:
//! per-namespace link tables, veth peering across namespaces, bridge
//! membership, addresses, routes and sysctl writes. Interface indices are
//! unique across namespaces so peer indices can be compared directly.

use bridge_cni::config::NetConf;
use bridge_cni::error::{CniError, Result};
use bridge_cni::ipam::IpamDelegate;
use bridge_cni::kernel::{AddrScope, Kernel, KernelError, Link, LinkAddress, LinkKind, VethRequest};
use bridge_cni::netns::{Netns, NetnsError};
use bridge_cni::skel::{self, CmdArgs, Command};
use bridge_cni::Plugin;
use cni_types::{CniResult, ErrorReport, IpConfig, MacAddress, OperState, Route, SpecVersion};
use ipnet::IpNet;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

/// Key of the host namespace in [`FakeKernel`].
pub const HOST_NS: &str = "host";

/// Namespace path used by the default [`TestEnv`].
pub const POD_NETNS: &str = "/var/run/netns/ns1";

/// Bridge created by the default [`TestEnv`].
pub const BRIDGE: &str = "cni0";

const DEFAULT_MTU: u32 = 1500;

#[derive(Debug, Clone)]
struct FakeLink {
    netns: String,
    index: u32,
    name: String,
    kind: LinkKind,
    mac: Option<MacAddress>,
    master: Option<u32>,
    peer: Option<u32>,
    oper_state: OperState,
    mtu: u32,
    addresses: Vec<LinkAddress>,
    routes: Vec<Route>,
}

impl FakeLink {
    fn snapshot(&self) -> Link {
        Link {
            index: self.index,
            name: self.name.clone(),
            kind: self.kind.clone(),
            mac: self.mac,
            master: self.master,
            peer_index: self.peer,
            oper_state: self.oper_state,
            mtu: self.mtu,
        }
    }
}

#[derive(Debug)]
struct State {
    current: String,
    namespaces: Vec<String>,
    links: Vec<FakeLink>,
    next_index: u32,
    next_mac: u16,
    /// Operational state host-side ports take when set up.
    port_state: OperState,
    /// `add_address` fails with EPERM when set.
    reject_addresses: bool,
    sysctls: Vec<(String, String, String)>,
}

impl State {
    fn allocate_mac(&mut self) -> MacAddress {
        self.next_mac += 1;
        let [hi, lo] = self.next_mac.to_be_bytes();
        MacAddress::new([0x0a, 0x58, 0x00, 0x00, hi, lo])
    }

    fn allocate_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn find(&self, netns: &str, name: &str) -> Option<&FakeLink> {
        self.links.iter().find(|l| l.netns == netns && l.name == name)
    }

    fn find_mut(&mut self, netns: &str, name: &str) -> Option<&mut FakeLink> {
        self.links
            .iter_mut()
            .find(|l| l.netns == netns && l.name == name)
    }

    fn by_index_mut(&mut self, index: u32) -> std::result::Result<&mut FakeLink, KernelError> {
        let current = self.current.clone();
        self.links
            .iter_mut()
            .find(|l| l.netns == current && l.index == index)
            .ok_or(KernelError::LinkNotFound)
    }

    fn insert(&mut self, netns: &str, name: &str, kind: LinkKind, mac: Option<MacAddress>) -> u32 {
        let index = self.allocate_index();
        self.links.push(FakeLink {
            netns: netns.to_string(),
            index,
            name: name.to_string(),
            kind,
            mac,
            master: None,
            peer: None,
            oper_state: OperState::Down,
            mtu: DEFAULT_MTU,
            addresses: Vec::new(),
            routes: Vec::new(),
        });
        index
    }
}

/// In-memory [`Kernel`]. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeKernel {
    state: Rc<RefCell<State>>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// A kernel with only the host namespace.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                current: HOST_NS.to_string(),
                namespaces: vec![HOST_NS.to_string()],
                links: Vec::new(),
                next_index: 1,
                next_mac: 0,
                port_state: OperState::Up,
                reject_addresses: false,
                sysctls: Vec::new(),
            })),
        }
    }

    /// Adds a host bridge with no MAC; it takes its first port's MAC.
    pub fn add_bridge(&self, name: &str) -> u32 {
        self.state
            .borrow_mut()
            .insert(HOST_NS, name, LinkKind::Bridge, None)
    }

    /// Adds a host link of an arbitrary kind.
    pub fn add_link(&self, netns: &str, name: &str, kind: LinkKind) -> u32 {
        let mut state = self.state.borrow_mut();
        let mac = state.allocate_mac();
        state.insert(netns, name, kind, Some(mac))
    }

    pub fn add_netns(&self, path: &str) {
        let mut state = self.state.borrow_mut();
        if !state.namespaces.iter().any(|ns| ns == path) {
            state.namespaces.push(path.to_string());
        }
    }

    /// Destroys a namespace along with its links and their veth peers.
    pub fn remove_netns(&self, path: &str) {
        let mut state = self.state.borrow_mut();
        state.namespaces.retain(|ns| ns != path);
        let peers: Vec<u32> = state
            .links
            .iter()
            .filter(|l| l.netns == path)
            .filter_map(|l| l.peer)
            .collect();
        state
            .links
            .retain(|l| l.netns != path && !peers.contains(&l.index));
    }

    /// Operational state host veths report once set up.
    pub fn set_port_state(&self, state: OperState) {
        self.state.borrow_mut().port_state = state;
    }

    /// Makes every following `add_address` fail with a permission error.
    pub fn reject_addresses(&self) {
        self.state.borrow_mut().reject_addresses = true;
    }

    /// Overwrites a link's MAC.
    pub fn set_mac(&self, netns: &str, name: &str, mac: MacAddress) {
        if let Some(link) = self.state.borrow_mut().find_mut(netns, name) {
            link.mac = Some(mac);
        }
    }

    /// Detaches a link from its bridge.
    pub fn set_nomaster(&self, netns: &str, name: &str) {
        if let Some(link) = self.state.borrow_mut().find_mut(netns, name) {
            link.master = None;
        }
    }

    /// Adds an address behind the plugin's back.
    pub fn inject_address(&self, netns: &str, name: &str, address: IpNet) {
        if let Some(link) = self.state.borrow_mut().find_mut(netns, name) {
            link.addresses.push(LinkAddress {
                address,
                scope: AddrScope::Universe,
            });
        }
    }

    pub fn remove_address(&self, netns: &str, name: &str, address: IpNet) {
        if let Some(link) = self.state.borrow_mut().find_mut(netns, name) {
            link.addresses.retain(|a| a.address != address);
        }
    }

    /// Deletes a link behind the plugin's back.
    pub fn remove_link(&self, netns: &str, name: &str) {
        let mut state = self.state.borrow_mut();
        state.links.retain(|l| !(l.netns == netns && l.name == name));
    }

    pub fn link(&self, netns: &str, name: &str) -> Option<Link> {
        self.state.borrow().find(netns, name).map(FakeLink::snapshot)
    }

    pub fn link_names(&self, netns: &str) -> Vec<String> {
        self.state
            .borrow()
            .links
            .iter()
            .filter(|l| l.netns == netns)
            .map(|l| l.name.clone())
            .collect()
    }

    pub fn addresses(&self, netns: &str, name: &str) -> Vec<LinkAddress> {
        self.state
            .borrow()
            .find(netns, name)
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    pub fn routes(&self, netns: &str, name: &str) -> Vec<Route> {
        self.state
            .borrow()
            .find(netns, name)
            .map(|l| l.routes.clone())
            .unwrap_or_default()
    }

    /// Recorded sysctl writes as `(netns, key, value)`.
    pub fn sysctls(&self) -> Vec<(String, String, String)> {
        self.state.borrow().sysctls.clone()
    }

    /// The namespace the "thread" is currently in.
    pub fn current(&self) -> String {
        self.state.borrow().current.clone()
    }
}

/// Handle on a [`FakeKernel`] namespace.
#[derive(Debug, Clone)]
pub struct FakeNetns {
    path: String,
    state: Rc<RefCell<State>>,
}

impl Netns for FakeNetns {
    fn path(&self) -> &str {
        &self.path
    }

    fn run<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<NetnsError>,
    {
        let origin = {
            let mut state = self.state.borrow_mut();
            if !state.namespaces.contains(&self.path) {
                return Err(NetnsError::Os {
                    operation: "setns",
                    path: self.path.clone(),
                    source: io::Error::from(io::ErrorKind::InvalidInput),
                }
                .into());
            }
            std::mem::replace(&mut state.current, self.path.clone())
        };
        let out = f();
        self.state.borrow_mut().current = origin;
        out
    }
}

impl Kernel for FakeKernel {
    type Netns = FakeNetns;

    fn open_netns(&self, path: &str) -> std::result::Result<FakeNetns, NetnsError> {
        if !self.state.borrow().namespaces.iter().any(|ns| ns == path) {
            return Err(NetnsError::NotExist {
                path: path.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        Ok(FakeNetns {
            path: path.to_string(),
            state: Rc::clone(&self.state),
        })
    }

    fn current_netns(&self) -> std::result::Result<FakeNetns, NetnsError> {
        Ok(FakeNetns {
            path: self.current(),
            state: Rc::clone(&self.state),
        })
    }

    fn link_by_name(&self, name: &str) -> std::result::Result<Link, KernelError> {
        let state = self.state.borrow();
        state
            .find(&state.current, name)
            .map(FakeLink::snapshot)
            .ok_or(KernelError::LinkNotFound)
    }

    fn create_veth(
        &self,
        req: &VethRequest<'_>,
        peer_netns: &FakeNetns,
    ) -> std::result::Result<Link, KernelError> {
        let mut state = self.state.borrow_mut();
        let current = state.current.clone();
        if state.find(&current, req.name).is_some()
            || state.find(&peer_netns.path, req.peer_name).is_some()
        {
            return Err(KernelError::Exists);
        }

        let mtu = if req.mtu == 0 { DEFAULT_MTU } else { req.mtu };
        let container_mac = req.mac.unwrap_or_else(|| state.allocate_mac());
        let host_mac = state.allocate_mac();

        let container = state.insert(&current, req.name, LinkKind::Veth, Some(container_mac));
        let host = state.insert(&peer_netns.path, req.peer_name, LinkKind::Veth, Some(host_mac));
        for link in state.links.iter_mut() {
            if link.index == container {
                link.peer = Some(host);
                link.mtu = mtu;
            } else if link.index == host {
                link.peer = Some(container);
                link.mtu = mtu;
            }
        }

        state
            .find(&current, req.name)
            .map(FakeLink::snapshot)
            .ok_or(KernelError::LinkNotFound)
    }

    fn set_link_up(&self, index: u32) -> std::result::Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        let in_host = state.current == HOST_NS;
        let port_state = state.port_state;
        let link = state.by_index_mut(index)?;

        link.oper_state = if in_host && link.kind == LinkKind::Veth {
            port_state
        } else {
            OperState::Up
        };

        if !in_host {
            let link_local: IpNet = format!("fe80::{:x}/64", index)
                .parse()
                .map_err(|e| KernelError::Decode(format!("{e}")))?;
            if !link.addresses.iter().any(|a| a.address == link_local) {
                link.addresses.push(LinkAddress {
                    address: link_local,
                    scope: AddrScope::Link,
                });
            }
        }
        Ok(())
    }

    fn set_link_master(&self, index: u32, master: u32) -> std::result::Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        let port_mac = {
            let link = state.by_index_mut(index)?;
            link.master = Some(master);
            link.mac
        };
        let bridge = state.by_index_mut(master)?;
        if bridge.mac.is_none() {
            bridge.mac = port_mac;
        }
        Ok(())
    }

    fn delete_link(&self, name: &str) -> std::result::Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        let current = state.current.clone();
        let link = state.find(&current, name).ok_or(KernelError::LinkNotFound)?;
        let (index, peer) = (link.index, link.peer);
        state
            .links
            .retain(|l| l.index != index && Some(l.index) != peer);
        Ok(())
    }

    fn add_address(&self, index: u32, address: IpNet) -> std::result::Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        if state.reject_addresses {
            return Err(KernelError::Os {
                operation: "add address",
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        let link = state.by_index_mut(index)?;
        if link.addresses.iter().any(|a| a.address == address) {
            return Err(KernelError::Exists);
        }
        link.addresses.push(LinkAddress {
            address,
            scope: AddrScope::Universe,
        });
        Ok(())
    }

    fn link_addresses(&self, index: u32) -> std::result::Result<Vec<LinkAddress>, KernelError> {
        let mut state = self.state.borrow_mut();
        Ok(state.by_index_mut(index)?.addresses.clone())
    }

    fn add_route(&self, index: u32, route: &Route) -> std::result::Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        let link = state.by_index_mut(index)?;
        if link.routes.iter().any(|r| r.dst == route.dst) {
            return Err(KernelError::Exists);
        }
        link.routes.push(route.clone());
        Ok(())
    }

    fn write_sysctl(&self, key: &str, value: &str) -> std::result::Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        let current = state.current.clone();
        state
            .sysctls
            .push((current, key.to_string(), value.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct IpamState {
    result: CniResult,
    /// Replaces the encoded `result` when set.
    raw_result: Option<Value>,
    add_error: Option<ErrorReport>,
    del_error: Option<String>,
    adds: usize,
    dels: usize,
    checks: usize,
}

/// [`IpamDelegate`] with scripted replies and call counters. Clones share
/// state.
#[derive(Debug, Clone, Default)]
pub struct RecordingIpam {
    state: Rc<RefCell<IpamState>>,
}

impl RecordingIpam {
    /// A delegate handing out `addresses`, each with `gateway`.
    pub fn with_addresses(addresses: &[&str], gateway: Option<&str>) -> Self {
        let ipam = Self::default();
        ipam.state.borrow_mut().result = CniResult {
            ips: addresses
                .iter()
                .map(|a| IpConfig {
                    address: a.parse().unwrap_or_else(|e| panic!("bad fixture address {a}: {e}")),
                    gateway: gateway.map(|g| g.parse().unwrap_or_else(|e| panic!("bad gateway {g}: {e}"))),
                    interface: None,
                })
                .collect(),
            ..Default::default()
        };
        ipam
    }

    pub fn with_routes(self, routes: &[&str]) -> Self {
        self.state.borrow_mut().result.routes = routes
            .iter()
            .map(|r| Route {
                dst: r.parse().unwrap_or_else(|e| panic!("bad route {r}: {e}")),
                gw: None,
            })
            .collect();
        self
    }

    /// ADD succeeds but prints `document` instead of the scripted result.
    pub fn with_raw_result(self, document: Value) -> Self {
        self.state.borrow_mut().raw_result = Some(document);
        self
    }

    /// ADD fails with `report`.
    pub fn failing_add(self, report: ErrorReport) -> Self {
        self.state.borrow_mut().add_error = Some(report);
        self
    }

    /// DEL fails with an IPAM error.
    pub fn failing_del(self, msg: &str) -> Self {
        self.state.borrow_mut().del_error = Some(msg.to_string());
        self
    }

    pub fn add_calls(&self) -> usize {
        self.state.borrow().adds
    }

    pub fn del_calls(&self) -> usize {
        self.state.borrow().dels
    }

    pub fn check_calls(&self) -> usize {
        self.state.borrow().checks
    }
}

impl IpamDelegate for RecordingIpam {
    fn add(&self, _conf: &NetConf, _args: &CmdArgs) -> Result<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        state.adds += 1;
        if let Some(report) = &state.add_error {
            return Err(CniError::Delegate {
                plugin: "recording".to_string(),
                report: report.clone(),
            });
        }
        let document = match &state.raw_result {
            Some(raw) => raw.clone(),
            None => state.result.to_json(SpecVersion::LATEST),
        };
        Ok(document.to_string().into_bytes())
    }

    fn del(&self, _conf: &NetConf, _args: &CmdArgs) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.dels += 1;
        match &state.del_error {
            Some(msg) => Err(CniError::ipam(msg.clone())),
            None => Ok(()),
        }
    }

    fn check(&self, _conf: &NetConf, _args: &CmdArgs) -> Result<()> {
        self.state.borrow_mut().checks += 1;
        Ok(())
    }
}

/// Network configuration for tests.
pub fn net_conf(version: &str, layer3: bool) -> Value {
    let mut conf = json!({
        "cniVersion": version,
        "name": "podnet",
        "type": "bridge-cni",
        "bridge": BRIDGE,
        "mtu": 1500,
    });
    if layer3 {
        conf["ipam"] = json!({"type": "host-local", "subnet": "10.244.0.0/24"});
    }
    conf
}

/// A host with bridge [`BRIDGE`], pod namespace [`POD_NETNS`] and a
/// delegate, plus the sleeps the readiness poll asked for.
pub struct TestEnv {
    pub kernel: FakeKernel,
    pub ipam: RecordingIpam,
    pub slept: Rc<RefCell<Vec<Duration>>>,
}

impl TestEnv {
    pub fn new(ipam: RecordingIpam) -> Self {
        let kernel = FakeKernel::new();
        kernel.add_bridge(BRIDGE);
        kernel.add_netns(POD_NETNS);
        Self {
            kernel,
            ipam,
            slept: Rc::default(),
        }
    }

    /// Layer-2 environment: no addresses are handed out.
    pub fn layer2() -> Self {
        Self::new(RecordingIpam::default())
    }

    /// Layer-3 environment handing out 10.244.0.5/24 via 10.244.0.1.
    pub fn layer3() -> Self {
        Self::new(RecordingIpam::with_addresses(&["10.244.0.5/24"], Some("10.244.0.1")))
    }

    pub fn plugin(&self) -> Plugin<FakeKernel, RecordingIpam> {
        let slept = Rc::clone(&self.slept);
        Plugin::new(self.kernel.clone(), self.ipam.clone())
            .with_sleep(move |d| slept.borrow_mut().push(d))
    }

    pub fn args(&self, netns: &str, conf: &Value) -> CmdArgs {
        CmdArgs {
            container_id: "3f2a9c".to_string(),
            netns: netns.to_string(),
            ifname: "eth0".to_string(),
            args: String::new(),
            path: "/opt/cni/bin".to_string(),
            stdin: conf.to_string().into_bytes(),
        }
    }

    /// Runs `command` against [`POD_NETNS`] with `conf`.
    pub fn run(&self, command: Command, conf: &Value) -> Result<Option<Value>> {
        self.run_in(command, POD_NETNS, conf)
    }

    pub fn run_in(&self, command: Command, netns: &str, conf: &Value) -> Result<Option<Value>> {
        skel::execute(&self.plugin(), command, &self.args(netns, conf))
    }

    /// Runs ADD and returns the encoded result.
    pub fn add(&self, conf: &Value) -> Result<Value> {
        self.run(Command::Add, conf)
            .map(|doc| doc.unwrap_or(Value::Null))
    }

    /// Runs CHECK with `prev` spliced in as `prevResult`.
    pub fn check(&self, conf: &Value, prev: &Value) -> Result<()> {
        let mut conf = conf.clone();
        conf["prevResult"] = prev.clone();
        self.run(Command::Check, &conf).map(drop)
    }

    /// Host-side veth name from an ADD result.
    pub fn host_veth(result: &Value) -> String {
        result["interfaces"][1]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }
}
