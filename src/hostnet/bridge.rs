use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::hostnet::error::{HostNetError, HostNetResult};
use crate::hostnet::netlink::{IfAddr, Link, Netlink, RouteEntry};

/// The default bridge; inherits the uplink's addresses and default route.
pub const DEFAULT_BRIDGE: &str = "docker";

/// Serializes bridge/VLAN provisioning between concurrent CNI invocations in
/// this process. Not a cross-process lock; callers wanting that must hold a
/// file lock themselves.
static PROVISION_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// A compensating action registered while mutating host network state.
/// Unwound in reverse registration order on the error path only, which is
/// why these are explicit records rather than drop guards.
#[derive(Debug)]
enum Rollback {
    RestoreAddr { link_index: u32, addr: IfAddr },
    RestoreRoute(RouteEntry),
}

/// Idempotent provisioning of the default bridge and per-VLAN bridges.
pub struct BridgeProvisioner {
    netlink: Arc<dyn Netlink>,
    uplink: String,
}

impl BridgeProvisioner {
    pub fn new(netlink: Arc<dyn Netlink>, uplink: impl Into<String>) -> Self {
        Self {
            netlink,
            uplink: uplink.into(),
        }
    }

    /// Moves the uplink's IPv4 addresses and default route onto the default
    /// bridge and enslaves the uplink. Transactional: any failure after the
    /// default route or an address has been touched restores what was moved.
    pub async fn setup_bridge(&self) -> HostNetResult<()> {
        let _guard = PROVISION_LOCK.lock().await;

        let mut rollbacks = Vec::new();
        match self.setup_bridge_steps(&mut rollbacks).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("bridge setup failed: {}, restoring host state", e);
                self.unwind(rollbacks).await;
                Err(e)
            }
        }
    }

    async fn setup_bridge_steps(&self, rollbacks: &mut Vec<Rollback>) -> HostNetResult<()> {
        let uplink = self.netlink.link_by_name(&self.uplink).await?;

        let addrs: Vec<IfAddr> = self
            .netlink
            .addr_list_v4(uplink.index)
            .await?
            .into_iter()
            .filter(|a| !a.is_loopback())
            .collect();

        if addrs.is_empty() {
            // A previous run may already have migrated everything.
            if let Ok(bridge) = self.netlink.link_by_name(DEFAULT_BRIDGE).await {
                if uplink.master_index == Some(bridge.index) {
                    tracing::debug!("uplink {} already enslaved to {}", self.uplink, DEFAULT_BRIDGE);
                    return Ok(());
                }
            }
            return Err(HostNetError::NoAddress(self.uplink.clone()));
        }

        let bridge = self
            .ensure_bridge(DEFAULT_BRIDGE, Some(&uplink.mac))
            .await?;
        self.netlink.link_set_up(bridge.index).await?;

        // The default route must follow the addresses onto the bridge; drop
        // it first so the kernel does not reject the address moves.
        let mut uplink_default = None;
        if let Some(route) = self.netlink.default_route_v4().await? {
            if route.link_index == Some(uplink.index) {
                self.netlink.route_del(&route).await?;
                rollbacks.push(Rollback::RestoreRoute(route.clone()));
                uplink_default = Some(route);
            }
        }

        for addr in &addrs {
            self.netlink.addr_del(uplink.index, addr).await?;
            rollbacks.push(Rollback::RestoreAddr {
                link_index: uplink.index,
                addr: addr.clone(),
            });
            match self.netlink.addr_add(bridge.index, &addr.without_label()).await {
                Ok(()) => {}
                Err(e) if e.is_exists() => {
                    tracing::debug!("{} already carries {}", DEFAULT_BRIDGE, addr.addr);
                }
                Err(e) => return Err(e),
            }
        }

        self.netlink.link_set_master(uplink.index, bridge.index).await?;

        if let Some(mut route) = uplink_default {
            route.link_index = Some(bridge.index);
            self.netlink.route_add(&route).await?;
        }

        tracing::info!(
            "migrated {} address(es) from {} to {}",
            addrs.len(),
            self.uplink,
            DEFAULT_BRIDGE
        );
        Ok(())
    }

    async fn unwind(&self, rollbacks: Vec<Rollback>) {
        for rollback in rollbacks.into_iter().rev() {
            let outcome = match &rollback {
                Rollback::RestoreAddr { link_index, addr } => {
                    self.netlink.addr_add(*link_index, addr).await
                }
                Rollback::RestoreRoute(route) => self.netlink.route_add(route).await,
            };
            if let Err(e) = outcome {
                // Best effort; the operator reconciles what this misses.
                tracing::warn!("rollback {:?} failed: {}", rollback, e);
            }
        }
    }

    /// Creates `vlan<id>` under the uplink's VLAN parent and bridges it onto
    /// `docker<id>`. Every step is get-or-create, so repeated calls converge
    /// on the same two devices. `vlan_id == 0` is untagged traffic on the
    /// default bridge, a no-op here.
    pub async fn create_vlan_device(&self, vlan_id: u16) -> HostNetResult<()> {
        if vlan_id == 0 {
            return Ok(());
        }

        let _guard = PROVISION_LOCK.lock().await;

        let uplink = self.netlink.link_by_name(&self.uplink).await?;
        let parent_index = if uplink.is_vlan {
            uplink.parent_index.unwrap_or(uplink.index)
        } else {
            uplink.index
        };

        let vlan_name = format!("vlan{}", vlan_id);
        let bridge_name = format!("{}{}", DEFAULT_BRIDGE, vlan_id);

        let vlan = self.ensure_vlan(&vlan_name, parent_index, vlan_id).await?;
        let bridge = self.ensure_bridge(&bridge_name, None).await?;

        if vlan.master_index != Some(bridge.index) {
            self.netlink.link_set_master(vlan.index, bridge.index).await?;
        }
        self.netlink.link_set_up(vlan.index).await?;
        self.netlink.link_set_up(bridge.index).await?;

        Ok(())
    }

    async fn ensure_bridge(&self, name: &str, mac: Option<&[u8]>) -> HostNetResult<Link> {
        match self.netlink.link_by_name(name).await {
            Ok(link) => Ok(link),
            Err(HostNetError::LinkNotFound(_)) => {
                match self.netlink.link_add_bridge(name, mac).await {
                    Ok(()) => {}
                    Err(e) if e.is_exists() => {}
                    Err(e) => return Err(e),
                }
                self.netlink.link_by_name(name).await
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_vlan(
        &self,
        name: &str,
        parent_index: u32,
        vlan_id: u16,
    ) -> HostNetResult<Link> {
        match self.netlink.link_by_name(name).await {
            Ok(link) => Ok(link),
            Err(HostNetError::LinkNotFound(_)) => {
                match self.netlink.link_add_vlan(name, parent_index, vlan_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_exists() => {}
                    Err(e) => return Err(e),
                }
                self.netlink.link_by_name(name).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone)]
    struct FakeLink {
        index: u32,
        name: String,
        is_vlan: bool,
        vlan_id: Option<u16>,
        parent_index: Option<u32>,
        master_index: Option<u32>,
        mac: Vec<u8>,
        up: bool,
    }

    #[derive(Debug, Default)]
    struct FakeState {
        links: Vec<FakeLink>,
        addrs: HashMap<u32, Vec<IfAddr>>,
        routes: Vec<RouteEntry>,
        next_index: u32,
        fail_op: Option<&'static str>,
        link_adds: u32,
    }

    struct FakeNetlink {
        state: StdMutex<FakeState>,
    }

    impl FakeNetlink {
        fn new() -> Self {
            Self {
                state: StdMutex::new(FakeState {
                    next_index: 1,
                    ..Default::default()
                }),
            }
        }

        fn with_uplink(name: &str, addrs: Vec<IfAddr>, default_gw: Option<Ipv4Addr>) -> Self {
            let fake = Self::new();
            let index = fake.add_link(name, false, None, None);
            {
                let mut state = fake.state.lock().unwrap();
                state.addrs.insert(index, addrs);
                if let Some(gw) = default_gw {
                    state.routes.push(RouteEntry {
                        dest: None,
                        gateway: Some(gw),
                        link_index: Some(index),
                    });
                }
            }
            fake
        }

        fn add_link(
            &self,
            name: &str,
            is_vlan: bool,
            vlan_id: Option<u16>,
            parent_index: Option<u32>,
        ) -> u32 {
            let mut state = self.state.lock().unwrap();
            let index = state.next_index;
            state.next_index += 1;
            state.links.push(FakeLink {
                index,
                name: name.to_string(),
                is_vlan,
                vlan_id,
                parent_index,
                master_index: None,
                mac: vec![0x02, 0x42, 0x00, 0x00, 0x00, index as u8],
                up: false,
            });
            state.addrs.insert(index, Vec::new());
            index
        }

        fn fail_on(&self, op: &'static str) {
            self.state.lock().unwrap().fail_op = Some(op);
        }

        fn link(&self, name: &str) -> Option<FakeLink> {
            self.state
                .lock()
                .unwrap()
                .links
                .iter()
                .find(|l| l.name == name)
                .cloned()
        }

        fn addrs_of(&self, index: u32) -> Vec<IfAddr> {
            self.state
                .lock()
                .unwrap()
                .addrs
                .get(&index)
                .cloned()
                .unwrap_or_default()
        }

        fn routes(&self) -> Vec<RouteEntry> {
            self.state.lock().unwrap().routes.clone()
        }

        fn link_adds(&self) -> u32 {
            self.state.lock().unwrap().link_adds
        }

        fn check_fail(&self, op: &'static str) -> HostNetResult<()> {
            if self.state.lock().unwrap().fail_op == Some(op) {
                return Err(HostNetError::Socket(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("injected failure in {}", op),
                )));
            }
            Ok(())
        }
    }

    fn to_link(fake: &FakeLink) -> Link {
        Link {
            index: fake.index,
            name: fake.name.clone(),
            is_vlan: fake.is_vlan,
            vlan_id: fake.vlan_id,
            parent_index: fake.parent_index,
            master_index: fake.master_index,
            mac: fake.mac.clone(),
        }
    }

    #[async_trait]
    impl Netlink for FakeNetlink {
        async fn link_by_name(&self, name: &str) -> HostNetResult<Link> {
            self.check_fail("link_by_name")?;
            let state = self.state.lock().unwrap();
            state
                .links
                .iter()
                .find(|l| l.name == name)
                .map(to_link)
                .ok_or_else(|| HostNetError::LinkNotFound(name.to_string()))
        }

        async fn link_add_bridge(&self, name: &str, mac: Option<&[u8]>) -> HostNetResult<()> {
            self.check_fail("link_add_bridge")?;
            if self.link(name).is_some() {
                return Err(HostNetError::AlreadyExists(name.to_string()));
            }
            let index = self.add_link(name, false, None, None);
            let mut state = self.state.lock().unwrap();
            state.link_adds += 1;
            if let Some(mac) = mac {
                if let Some(link) = state.links.iter_mut().find(|l| l.index == index) {
                    link.mac = mac.to_vec();
                }
            }
            Ok(())
        }

        async fn link_add_vlan(
            &self,
            name: &str,
            parent_index: u32,
            vlan_id: u16,
        ) -> HostNetResult<()> {
            self.check_fail("link_add_vlan")?;
            if self.link(name).is_some() {
                return Err(HostNetError::AlreadyExists(name.to_string()));
            }
            self.add_link(name, true, Some(vlan_id), Some(parent_index));
            self.state.lock().unwrap().link_adds += 1;
            Ok(())
        }

        async fn link_set_up(&self, index: u32) -> HostNetResult<()> {
            self.check_fail("link_set_up")?;
            let mut state = self.state.lock().unwrap();
            if let Some(link) = state.links.iter_mut().find(|l| l.index == index) {
                link.up = true;
            }
            Ok(())
        }

        async fn link_set_master(&self, index: u32, master_index: u32) -> HostNetResult<()> {
            self.check_fail("link_set_master")?;
            let mut state = self.state.lock().unwrap();
            if let Some(link) = state.links.iter_mut().find(|l| l.index == index) {
                link.master_index = Some(master_index);
            }
            Ok(())
        }

        async fn addr_list_v4(&self, link_index: u32) -> HostNetResult<Vec<IfAddr>> {
            self.check_fail("addr_list_v4")?;
            Ok(self.addrs_of(link_index))
        }

        async fn addr_add(&self, link_index: u32, addr: &IfAddr) -> HostNetResult<()> {
            self.check_fail("addr_add")?;
            let mut state = self.state.lock().unwrap();
            let addrs = state.addrs.entry(link_index).or_default();
            if addrs
                .iter()
                .any(|a| a.addr == addr.addr && a.prefix_len == addr.prefix_len)
            {
                return Err(HostNetError::AlreadyExists(addr.addr.to_string()));
            }
            addrs.push(addr.clone());
            Ok(())
        }

        async fn addr_del(&self, link_index: u32, addr: &IfAddr) -> HostNetResult<()> {
            self.check_fail("addr_del")?;
            let mut state = self.state.lock().unwrap();
            if let Some(addrs) = state.addrs.get_mut(&link_index) {
                addrs.retain(|a| !(a.addr == addr.addr && a.prefix_len == addr.prefix_len));
            }
            Ok(())
        }

        async fn route_add(&self, route: &RouteEntry) -> HostNetResult<()> {
            self.check_fail("route_add")?;
            self.state.lock().unwrap().routes.push(route.clone());
            Ok(())
        }

        async fn route_del(&self, route: &RouteEntry) -> HostNetResult<()> {
            self.check_fail("route_del")?;
            self.state.lock().unwrap().routes.retain(|r| r != route);
            Ok(())
        }

        async fn default_route_v4(&self) -> HostNetResult<Option<RouteEntry>> {
            self.check_fail("default_route_v4")?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .routes
                .iter()
                .find(|r| r.dest.is_none())
                .cloned())
        }
    }

    fn uplink_addr() -> IfAddr {
        IfAddr {
            addr: Ipv4Addr::new(192, 168, 1, 5),
            prefix_len: 24,
            label: Some("eth1".to_string()),
        }
    }

    fn provisioner(fake: FakeNetlink) -> (Arc<FakeNetlink>, BridgeProvisioner) {
        let fake = Arc::new(fake);
        let prov = BridgeProvisioner::new(fake.clone(), "eth1");
        (fake, prov)
    }

    #[tokio::test]
    async fn test_setup_bridge_migrates_addresses_and_route() {
        let fake = FakeNetlink::with_uplink(
            "eth1",
            vec![uplink_addr()],
            Some(Ipv4Addr::new(192, 168, 1, 1)),
        );
        let (fake, prov) = provisioner(fake);

        prov.setup_bridge().await.unwrap();

        let uplink = fake.link("eth1").unwrap();
        let bridge = fake.link(DEFAULT_BRIDGE).unwrap();

        assert!(fake.addrs_of(uplink.index).is_empty());
        let bridge_addrs = fake.addrs_of(bridge.index);
        assert_eq!(bridge_addrs.len(), 1);
        assert_eq!(bridge_addrs[0].addr, Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(bridge_addrs[0].label, None);

        assert_eq!(uplink.master_index, Some(bridge.index));
        assert_eq!(bridge.mac, uplink.mac);
        assert!(bridge.up);

        let routes = fake.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].link_index, Some(bridge.index));
        assert_eq!(routes[0].gateway, Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[tokio::test]
    async fn test_setup_bridge_rollback_restores_addresses_and_route() {
        let fake = FakeNetlink::with_uplink(
            "eth1",
            vec![uplink_addr()],
            Some(Ipv4Addr::new(192, 168, 1, 1)),
        );
        // Fail the final step, after the route was dropped and the address
        // moved.
        fake.fail_on("link_set_master");
        let (fake, prov) = provisioner(fake);

        assert!(prov.setup_bridge().await.is_err());

        let uplink = fake.link("eth1").unwrap();
        let restored = fake.addrs_of(uplink.index);
        assert_eq!(restored, vec![uplink_addr()]);

        let routes = fake.routes();
        assert!(routes
            .iter()
            .any(|r| r.dest.is_none() && r.link_index == Some(uplink.index)));
        assert_eq!(uplink.master_index, None);
    }

    #[tokio::test]
    async fn test_setup_bridge_without_address_fails() {
        let fake = FakeNetlink::with_uplink("eth1", vec![], None);
        let (_fake, prov) = provisioner(fake);

        assert!(matches!(
            prov.setup_bridge().await,
            Err(HostNetError::NoAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_setup_bridge_accepts_already_enslaved_uplink() {
        let fake = FakeNetlink::with_uplink("eth1", vec![], None);
        let bridge_index = fake.add_link(DEFAULT_BRIDGE, false, None, None);
        {
            let mut state = fake.state.lock().unwrap();
            if let Some(link) = state.links.iter_mut().find(|l| l.name == "eth1") {
                link.master_index = Some(bridge_index);
            }
        }
        let (_fake, prov) = provisioner(fake);

        prov.setup_bridge().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_vlan_device_is_idempotent() {
        let fake = FakeNetlink::with_uplink("eth1", vec![uplink_addr()], None);
        let (fake, prov) = provisioner(fake);

        prov.create_vlan_device(100).await.unwrap();
        let adds_after_first = fake.link_adds();
        prov.create_vlan_device(100).await.unwrap();

        // Second call created nothing new.
        assert_eq!(fake.link_adds(), adds_after_first);

        let vlan = fake.link("vlan100").unwrap();
        let bridge = fake.link("docker100").unwrap();
        assert_eq!(vlan.vlan_id, Some(100));
        assert_eq!(vlan.master_index, Some(bridge.index));
        assert!(vlan.up);
        assert!(bridge.up);
    }

    #[tokio::test]
    async fn test_create_vlan_zero_is_noop() {
        let fake = FakeNetlink::with_uplink("eth1", vec![uplink_addr()], None);
        let (fake, prov) = provisioner(fake);

        prov.create_vlan_device(0).await.unwrap();
        assert!(fake.link("vlan0").is_none());
        assert_eq!(fake.link_adds(), 0);
    }

    #[tokio::test]
    async fn test_vlan_device_roots_at_vlan_parent() {
        // Uplink is itself a VLAN child (eth1.12); new VLAN devices must hang
        // off its parent NIC, not off the VLAN child.
        let fake = FakeNetlink::new();
        let parent = fake.add_link("eth1", false, None, None);
        fake.add_link("eth1.12", true, Some(12), Some(parent));
        let fake = Arc::new(fake);
        let prov = BridgeProvisioner::new(fake.clone(), "eth1.12");

        prov.create_vlan_device(100).await.unwrap();

        let vlan = fake.link("vlan100").unwrap();
        assert_eq!(vlan.parent_index, Some(parent));
    }
}
