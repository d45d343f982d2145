use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::address::nlas::Nla as AddrNla;
use netlink_packet_route::link::nlas::{Info, InfoData, InfoKind, InfoVlan, Nla as LinkNla};
use netlink_packet_route::route::nlas::Nla as RouteNla;
use netlink_packet_route::{AddressMessage, LinkMessage, RouteMessage, AF_INET, RT_TABLE_MAIN};
use nix::errno::Errno;
use rtnetlink::{Handle, IpVersion};
use std::net::Ipv4Addr;

use crate::hostnet::error::{HostNetError, HostNetResult};

/// A host link as the provisioner sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub is_vlan: bool,
    pub vlan_id: Option<u16>,
    /// `IFLA_LINK`: the parent device for VLAN children.
    pub parent_index: Option<u32>,
    pub master_index: Option<u32>,
    pub mac: Vec<u8>,
}

/// One IPv4 address on a link.
#[derive(Debug, Clone, PartialEq)]
pub struct IfAddr {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
    pub label: Option<String>,
}

impl IfAddr {
    pub fn is_loopback(&self) -> bool {
        self.addr.is_loopback()
    }

    /// Same address with the interface label dropped; labels name the device
    /// they were configured on and must not follow the address to a bridge.
    pub fn without_label(&self) -> Self {
        Self {
            addr: self.addr,
            prefix_len: self.prefix_len,
            label: None,
        }
    }
}

/// An IPv4 route; `dest == None` is the default route.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub dest: Option<(Ipv4Addr, u8)>,
    pub gateway: Option<Ipv4Addr>,
    pub link_index: Option<u32>,
}

/// The netlink operations host provisioning needs. Reads always go to the
/// kernel; nothing is cached above this trait.
#[async_trait]
pub trait Netlink: Send + Sync {
    async fn link_by_name(&self, name: &str) -> HostNetResult<Link>;
    async fn link_add_bridge(&self, name: &str, mac: Option<&[u8]>) -> HostNetResult<()>;
    async fn link_add_vlan(&self, name: &str, parent_index: u32, vlan_id: u16)
        -> HostNetResult<()>;
    async fn link_set_up(&self, index: u32) -> HostNetResult<()>;
    async fn link_set_master(&self, index: u32, master_index: u32) -> HostNetResult<()>;
    async fn addr_list_v4(&self, link_index: u32) -> HostNetResult<Vec<IfAddr>>;
    async fn addr_add(&self, link_index: u32, addr: &IfAddr) -> HostNetResult<()>;
    async fn addr_del(&self, link_index: u32, addr: &IfAddr) -> HostNetResult<()>;
    async fn route_add(&self, route: &RouteEntry) -> HostNetResult<()>;
    async fn route_del(&self, route: &RouteEntry) -> HostNetResult<()>;
    async fn default_route_v4(&self) -> HostNetResult<Option<RouteEntry>>;
}

/// Real implementation over an rtnetlink socket. The connection task is
/// spawned onto the current runtime, which the CNI binary keeps on a single
/// OS thread.
pub struct RtNetlink {
    handle: Handle,
}

impl RtNetlink {
    pub fn connect() -> HostNetResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

fn netlink_errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|code| code.get()),
        _ => None,
    }
}

fn map_err(op: &'static str, what: &str, err: rtnetlink::Error) -> HostNetError {
    if netlink_errno(&err) == Some(-(Errno::EEXIST as i32)) {
        return HostNetError::AlreadyExists(what.to_string());
    }
    HostNetError::Netlink { op, source: err }
}

fn link_from_message(msg: &LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        is_vlan: false,
        vlan_id: None,
        parent_index: None,
        master_index: None,
        mac: Vec::new(),
    };

    for nla in &msg.nlas {
        match nla {
            LinkNla::IfName(name) => link.name = name.clone(),
            LinkNla::Address(mac) => link.mac = mac.clone(),
            LinkNla::Link(parent) => link.parent_index = Some(*parent),
            LinkNla::Master(master) => link.master_index = Some(*master),
            LinkNla::Info(infos) => {
                for info in infos {
                    match info {
                        Info::Kind(InfoKind::Vlan) => link.is_vlan = true,
                        Info::Data(InfoData::Vlan(vlan_infos)) => {
                            for vlan_info in vlan_infos {
                                if let InfoVlan::Id(id) = vlan_info {
                                    link.vlan_id = Some(*id);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    link
}

fn addr_from_message(msg: &AddressMessage) -> Option<IfAddr> {
    let mut address = None;
    let mut local = None;
    let mut label = None;

    for nla in &msg.nlas {
        match nla {
            AddrNla::Address(bytes) if bytes.len() == 4 => {
                address = Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
            }
            AddrNla::Local(bytes) if bytes.len() == 4 => {
                local = Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
            }
            AddrNla::Label(value) => label = Some(value.clone()),
            _ => {}
        }
    }

    // IFA_LOCAL is the interface address; IFA_ADDRESS is the peer on
    // point-to-point links.
    local.or(address).map(|addr| IfAddr {
        addr,
        prefix_len: msg.header.prefix_len,
        label,
    })
}

fn route_from_message(msg: &RouteMessage) -> RouteEntry {
    let mut entry = RouteEntry {
        dest: None,
        gateway: None,
        link_index: None,
    };

    for nla in &msg.nlas {
        match nla {
            RouteNla::Destination(bytes) if bytes.len() == 4 => {
                entry.dest = Some((
                    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
                    msg.header.destination_prefix_length,
                ));
            }
            RouteNla::Gateway(bytes) if bytes.len() == 4 => {
                entry.gateway = Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
            }
            RouteNla::Oif(index) => entry.link_index = Some(*index),
            _ => {}
        }
    }

    entry
}

#[async_trait]
impl Netlink for RtNetlink {
    async fn link_by_name(&self, name: &str) -> HostNetResult<Link> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(link_from_message(&msg)),
            Ok(None) => Err(HostNetError::LinkNotFound(name.to_string())),
            Err(e) if netlink_errno(&e) == Some(-(Errno::ENODEV as i32)) => {
                Err(HostNetError::LinkNotFound(name.to_string()))
            }
            Err(e) => Err(map_err("link get", name, e)),
        }
    }

    async fn link_add_bridge(&self, name: &str, mac: Option<&[u8]>) -> HostNetResult<()> {
        let mut request = self.handle.link().add().bridge(name.to_string());
        if let Some(mac) = mac {
            request.message_mut().nlas.push(LinkNla::Address(mac.to_vec()));
        }
        request
            .execute()
            .await
            .map_err(|e| map_err("bridge add", name, e))
    }

    async fn link_add_vlan(
        &self,
        name: &str,
        parent_index: u32,
        vlan_id: u16,
    ) -> HostNetResult<()> {
        self.handle
            .link()
            .add()
            .vlan(name.to_string(), parent_index, vlan_id)
            .execute()
            .await
            .map_err(|e| map_err("vlan add", name, e))
    }

    async fn link_set_up(&self, index: u32) -> HostNetResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| map_err("link set up", "link", e))
    }

    async fn link_set_master(&self, index: u32, master_index: u32) -> HostNetResult<()> {
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(|e| map_err("link set master", "link", e))
    }

    async fn addr_list_v4(&self, link_index: u32) -> HostNetResult<Vec<IfAddr>> {
        let mut messages = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link_index)
            .execute();

        let mut addrs = Vec::new();
        loop {
            match messages.try_next().await {
                Ok(Some(msg)) => {
                    if u16::from(msg.header.family) != AF_INET {
                        continue;
                    }
                    if let Some(addr) = addr_from_message(&msg) {
                        addrs.push(addr);
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(map_err("addr list", "link", e)),
            }
        }
        Ok(addrs)
    }

    async fn addr_add(&self, link_index: u32, addr: &IfAddr) -> HostNetResult<()> {
        let mut request =
            self.handle
                .address()
                .add(link_index, std::net::IpAddr::V4(addr.addr), addr.prefix_len);
        if let Some(label) = &addr.label {
            request.message_mut().nlas.push(AddrNla::Label(label.clone()));
        }
        request
            .execute()
            .await
            .map_err(|e| map_err("addr add", &addr.addr.to_string(), e))
    }

    async fn addr_del(&self, link_index: u32, addr: &IfAddr) -> HostNetResult<()> {
        let mut messages = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link_index)
            .execute();

        while let Some(msg) = messages
            .try_next()
            .await
            .map_err(|e| map_err("addr list", "link", e))?
        {
            if u16::from(msg.header.family) != AF_INET {
                continue;
            }
            let matches = addr_from_message(&msg)
                .map(|found| found.addr == addr.addr && found.prefix_len == addr.prefix_len)
                .unwrap_or(false);
            if matches {
                return self
                    .handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| map_err("addr del", &addr.addr.to_string(), e));
            }
        }

        Ok(())
    }

    async fn route_add(&self, route: &RouteEntry) -> HostNetResult<()> {
        let mut request = self.handle.route().add().v4();
        if let Some((dest, prefix_len)) = route.dest {
            request = request.destination_prefix(dest, prefix_len);
        }
        if let Some(gateway) = route.gateway {
            request = request.gateway(gateway);
        }
        if let Some(index) = route.link_index {
            request = request.output_interface(index);
        }
        request
            .execute()
            .await
            .map_err(|e| map_err("route add", "route", e))
    }

    async fn route_del(&self, route: &RouteEntry) -> HostNetResult<()> {
        let mut routes = self.handle.route().get(IpVersion::V4).execute();
        while let Some(msg) = routes
            .try_next()
            .await
            .map_err(|e| map_err("route list", "route", e))?
        {
            if msg.header.table != RT_TABLE_MAIN {
                continue;
            }
            if route_from_message(&msg) == *route {
                return self
                    .handle
                    .route()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| map_err("route del", "route", e));
            }
        }
        Ok(())
    }

    async fn default_route_v4(&self) -> HostNetResult<Option<RouteEntry>> {
        let mut routes = self.handle.route().get(IpVersion::V4).execute();
        while let Some(msg) = routes
            .try_next()
            .await
            .map_err(|e| map_err("route list", "route", e))?
        {
            if msg.header.table != RT_TABLE_MAIN {
                continue;
            }
            if msg.header.destination_prefix_length != 0 {
                continue;
            }
            let entry = route_from_message(&msg);
            if entry.dest.is_none() && entry.gateway.is_some() {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}
