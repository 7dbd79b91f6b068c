//! Synchronous rtnetlink requests for links, addresses and routes.

#[cfg(target_os = "linux")]
mod linux {
    use crate::kernel::{AddrScope, KernelError, Link, LinkAddress, LinkKind, VethRequest};
    use cni_types::{MacAddress, OperState, Route};
    use ipnet::IpNet;
    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP,
        NLM_F_EXCL, NLM_F_REQUEST,
    };
    use netlink_packet_route::address::{AddressAttribute, AddressMessage, AddressScope};
    use netlink_packet_route::link::{
        InfoData, InfoKind, InfoVeth, LinkAttribute, LinkFlags, LinkInfo, LinkMessage, State,
    };
    use netlink_packet_route::route::{
        RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol, RouteScope,
        RouteType,
    };
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use std::io;
    use std::net::IpAddr;
    use std::os::fd::RawFd;
    use tracing::{instrument, trace};

    const RECV_BUFFER_SIZE: usize = 64 * 1024;

    /// A bound rtnetlink socket in the thread's current namespace.
    pub struct NetlinkHandle {
        socket: Socket,
        sequence: u32,
        buffer: Vec<u8>,
    }

    impl NetlinkHandle {
        pub fn new() -> Result<Self, KernelError> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| KernelError::os("create netlink socket", e))?;
            socket
                .bind_auto()
                .map_err(|e| KernelError::os("bind netlink socket", e))?;
            socket
                .connect(&SocketAddr::new(0, 0))
                .map_err(|e| KernelError::os("connect netlink socket", e))?;

            Ok(Self {
                socket,
                sequence: 0,
                buffer: vec![0u8; RECV_BUFFER_SIZE],
            })
        }

        /// Sends one request and collects replies until the ACK or `NLMSG_DONE`.
        fn request(
            &mut self,
            operation: &'static str,
            message: RouteNetlinkMessage,
            flags: u16,
        ) -> Result<Vec<RouteNetlinkMessage>, KernelError> {
            self.sequence = self.sequence.wrapping_add(1);

            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | flags;
            header.sequence_number = self.sequence;

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket
                .send(&buf, 0)
                .map_err(|e| KernelError::os(operation, e))?;

            let mut replies = Vec::new();
            loop {
                let len = self
                    .socket
                    .recv(&mut &mut self.buffer[..], 0)
                    .map_err(|e| KernelError::os(operation, e))?;

                let mut offset = 0;
                while offset < len {
                    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                        &self.buffer[offset..len],
                    )
                    .map_err(|e| KernelError::Decode(e.to_string()))?;

                    let msg_len = msg.header.length as usize;
                    if msg_len == 0 {
                        return Err(KernelError::Decode("zero-length netlink message".into()));
                    }
                    // Align to 4 bytes (netlink alignment requirement)
                    offset += (msg_len + 3) & !3;

                    if msg.header.sequence_number != self.sequence {
                        trace!(seq = msg.header.sequence_number, "Skipping stale reply");
                        continue;
                    }

                    match msg.payload {
                        NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                        NetlinkPayload::Done(_) => return Ok(replies),
                        NetlinkPayload::Error(err) => {
                            return match err.code {
                                None => Ok(replies),
                                Some(code) => Err(KernelError::os(
                                    operation,
                                    io::Error::from_raw_os_error(-code.get()),
                                )),
                            };
                        }
                        _ => {}
                    }
                }
            }
        }

        #[instrument(skip(self))]
        pub fn link_by_name(&mut self, name: &str) -> Result<Link, KernelError> {
            let mut msg = LinkMessage::default();
            msg.attributes.push(LinkAttribute::IfName(name.to_string()));

            let replies = self.request("get link", RouteNetlinkMessage::GetLink(msg), NLM_F_ACK)?;
            replies
                .into_iter()
                .find_map(|reply| match reply {
                    RouteNetlinkMessage::NewLink(link) => Some(parse_link(&link)),
                    _ => None,
                })
                .ok_or(KernelError::LinkNotFound)
        }

        #[instrument(skip(self, req), fields(name = req.name, peer = req.peer_name))]
        pub fn create_veth(
            &mut self,
            req: &VethRequest<'_>,
            peer_netns_fd: RawFd,
        ) -> Result<(), KernelError> {
            let mut peer = LinkMessage::default();
            peer.attributes
                .push(LinkAttribute::IfName(req.peer_name.to_string()));
            if req.mtu > 0 {
                peer.attributes.push(LinkAttribute::Mtu(req.mtu));
            }
            peer.attributes.push(LinkAttribute::NetNsFd(peer_netns_fd));

            let mut msg = LinkMessage::default();
            msg.attributes.push(LinkAttribute::IfName(req.name.to_string()));
            if req.mtu > 0 {
                msg.attributes.push(LinkAttribute::Mtu(req.mtu));
            }
            if let Some(mac) = req.mac {
                msg.attributes
                    .push(LinkAttribute::Address(mac.as_bytes().to_vec()));
            }
            msg.attributes.push(LinkAttribute::LinkInfo(vec![
                LinkInfo::Kind(InfoKind::Veth),
                LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer))),
            ]));

            self.request(
                "create veth",
                RouteNetlinkMessage::NewLink(msg),
                NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            )
            .map(drop)
        }

        pub fn set_link_up(&mut self, index: u32) -> Result<(), KernelError> {
            let mut msg = LinkMessage::default();
            msg.header.index = index;
            msg.header.flags = LinkFlags::Up;
            msg.header.change_mask = LinkFlags::Up;

            self.request("set link up", RouteNetlinkMessage::SetLink(msg), NLM_F_ACK)
                .map(drop)
        }

        pub fn set_link_master(&mut self, index: u32, master: u32) -> Result<(), KernelError> {
            let mut msg = LinkMessage::default();
            msg.header.index = index;
            msg.attributes.push(LinkAttribute::Controller(master));

            self.request("set link master", RouteNetlinkMessage::SetLink(msg), NLM_F_ACK)
                .map(drop)
        }

        pub fn delete_link(&mut self, name: &str) -> Result<(), KernelError> {
            let mut msg = LinkMessage::default();
            msg.attributes.push(LinkAttribute::IfName(name.to_string()));

            self.request("delete link", RouteNetlinkMessage::DelLink(msg), NLM_F_ACK)
                .map(drop)
        }

        pub fn add_address(&mut self, index: u32, address: IpNet) -> Result<(), KernelError> {
            let mut msg = AddressMessage::default();
            msg.header.index = index;
            msg.header.prefix_len = address.prefix_len();
            msg.header.scope = AddressScope::Universe;
            msg.header.family = family_of(&address.addr());

            match address {
                IpNet::V4(v4) => {
                    msg.attributes
                        .push(AddressAttribute::Local(IpAddr::V4(v4.addr())));
                    msg.attributes
                        .push(AddressAttribute::Address(IpAddr::V4(v4.addr())));
                    if v4.prefix_len() < 31 {
                        msg.attributes
                            .push(AddressAttribute::Broadcast(v4.broadcast()));
                    }
                }
                IpNet::V6(v6) => {
                    msg.attributes
                        .push(AddressAttribute::Address(IpAddr::V6(v6.addr())));
                }
            }

            self.request(
                "add address",
                RouteNetlinkMessage::NewAddress(msg),
                NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            )
            .map(drop)
        }

        pub fn link_addresses(&mut self, index: u32) -> Result<Vec<LinkAddress>, KernelError> {
            let mut msg = AddressMessage::default();
            msg.header.index = index;

            let replies =
                self.request("dump addresses", RouteNetlinkMessage::GetAddress(msg), NLM_F_DUMP)?;
            Ok(replies
                .into_iter()
                .filter_map(|reply| match reply {
                    RouteNetlinkMessage::NewAddress(addr) if addr.header.index == index => {
                        parse_address(&addr)
                    }
                    _ => None,
                })
                .collect())
        }

        pub fn add_route(&mut self, index: u32, route: &Route) -> Result<(), KernelError> {
            let mut msg = RouteMessage::default();
            msg.header.address_family = family_of(&route.dst.addr());
            msg.header.destination_prefix_length = route.dst.prefix_len();
            msg.header.table = RouteHeader::RT_TABLE_MAIN;
            msg.header.protocol = RouteProtocol::Boot;
            msg.header.kind = RouteType::Unicast;
            msg.header.scope = if route.gw.is_some() {
                RouteScope::Universe
            } else {
                RouteScope::Link
            };

            if route.dst.prefix_len() > 0 {
                msg.attributes
                    .push(RouteAttribute::Destination(route_address(route.dst.addr())));
            }
            if let Some(gw) = route.gw {
                msg.attributes
                    .push(RouteAttribute::Gateway(route_address(gw)));
            }
            msg.attributes.push(RouteAttribute::Oif(index));

            self.request(
                "add route",
                RouteNetlinkMessage::NewRoute(msg),
                NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            )
            .map(drop)
        }
    }

    fn family_of(addr: &IpAddr) -> AddressFamily {
        match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    fn route_address(addr: IpAddr) -> RouteAddress {
        match addr {
            IpAddr::V4(v4) => RouteAddress::Inet(v4),
            IpAddr::V6(v6) => RouteAddress::Inet6(v6),
        }
    }

    fn parse_link(msg: &LinkMessage) -> Link {
        let mut link = Link {
            index: msg.header.index,
            name: String::new(),
            kind: LinkKind::Other(String::new()),
            mac: None,
            master: None,
            peer_index: None,
            oper_state: OperState::Unknown,
            mtu: 0,
        };

        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(name) => link.name = name.clone(),
                LinkAttribute::Address(bytes) => link.mac = MacAddress::from_slice(bytes),
                LinkAttribute::Mtu(mtu) => link.mtu = *mtu,
                LinkAttribute::Controller(master) => link.master = Some(*master),
                LinkAttribute::Link(peer) => link.peer_index = Some(*peer),
                LinkAttribute::OperState(state) => link.oper_state = oper_state(state),
                LinkAttribute::LinkInfo(infos) => {
                    for info in infos {
                        if let LinkInfo::Kind(kind) = info {
                            link.kind = match kind {
                                InfoKind::Bridge => LinkKind::Bridge,
                                InfoKind::Veth => LinkKind::Veth,
                                other => LinkKind::Other(format!("{other:?}").to_lowercase()),
                            };
                        }
                    }
                }
                _ => {}
            }
        }

        link
    }

    fn oper_state(state: &State) -> OperState {
        match state {
            State::NotPresent => OperState::NotPresent,
            State::Down => OperState::Down,
            State::LowerLayerDown => OperState::LowerLayerDown,
            State::Testing => OperState::Testing,
            State::Dormant => OperState::Dormant,
            State::Up => OperState::Up,
            _ => OperState::Unknown,
        }
    }

    fn parse_address(msg: &AddressMessage) -> Option<LinkAddress> {
        let mut local = None;
        let mut address = None;
        for attr in &msg.attributes {
            match attr {
                AddressAttribute::Local(ip) => local = Some(*ip),
                AddressAttribute::Address(ip) => address = Some(*ip),
                _ => {}
            }
        }

        let ip = local.or(address)?;
        let address = IpNet::new(ip, msg.header.prefix_len).ok()?;
        let scope = match msg.header.scope {
            AddressScope::Universe => AddrScope::Universe,
            AddressScope::Site => AddrScope::Site,
            AddressScope::Link => AddrScope::Link,
            AddressScope::Host => AddrScope::Host,
            other => AddrScope::Other(u8::from(other)),
        };

        Some(LinkAddress { address, scope })
    }
}

#[cfg(target_os = "linux")]
pub use linux::NetlinkHandle;
