use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::ipam::error::{IpamError, IpamResult};
use crate::ipam::store::{FloatingIp, IpPoolStore};

/// How many lost `allocate_op` races to absorb before reporting a conflict.
const ALLOCATE_RETRY_BUDGET: u32 = 3;

#[derive(Debug, Clone)]
pub struct AllocationRequest {
    /// Owner key, typically `<namespace>_<podname>`.
    pub key: String,
    /// Restrict the candidate search to one subnet; `None` takes the lowest
    /// free address pool-wide.
    pub subnet: Option<String>,
    pub policy: u16,
    pub attr: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub ip: Ipv4Addr,
    pub subnet: String,
}

/// Policy layer above the pool store. The contract it keeps: at most one IP
/// per `(subnet, key)` at any time, while one key may hold addresses in
/// several subnets.
#[derive(Clone)]
pub struct FloatingIpAllocator {
    store: IpPoolStore,
}

impl FloatingIpAllocator {
    pub fn new(store: IpPoolStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &IpPoolStore {
        &self.store
    }

    /// Binds an address to `req.key`. Re-entrant: if the key already holds an
    /// address in the requested scope, that binding is refreshed and returned
    /// instead of a second one being created.
    ///
    /// Races with concurrent allocators show up as `NotUpdated` from the
    /// conditional update; the candidate is re-fetched and retried a bounded
    /// number of times before `Conflict` surfaces.
    pub async fn allocate(&self, req: &AllocationRequest) -> IpamResult<Allocation> {
        if let Some(existing) = self.existing_binding(req).await? {
            tracing::debug!("key {} already holds {}, refreshing", req.key, existing.ip);
            self.store
                .update_policy(existing.ip, &req.key, req.policy, &req.attr)
                .await?;
            return Ok(Allocation {
                ip: existing.ip,
                subnet: existing.subnet,
            });
        }

        for attempt in 0..ALLOCATE_RETRY_BUDGET {
            let candidates = match &req.subnet {
                Some(subnet) => self.store.find_available_in_subnet(subnet, 1).await?,
                None => self.store.find_available(1).await?,
            };
            let Some(candidate) = candidates.into_iter().next() else {
                return Err(IpamError::PoolExhausted {
                    subnet: req.subnet.clone(),
                });
            };

            let mut claim = candidate.clone();
            claim.key = req.key.clone();
            claim.policy = req.policy;
            claim.attr = req.attr.clone();

            match self.store.allocate_op(&claim).await {
                Ok(()) => {
                    tracing::info!(
                        "allocated {} in {} for key {} (attempt {})",
                        claim.ip,
                        claim.subnet,
                        req.key,
                        attempt + 1
                    );
                    return Ok(Allocation {
                        ip: claim.ip,
                        subnet: claim.subnet,
                    });
                }
                Err(IpamError::NotUpdated) => {
                    tracing::debug!(
                        "lost allocation race on {} for key {}, retrying",
                        claim.ip,
                        req.key
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(IpamError::Conflict {
            key: req.key.clone(),
            attempts: ALLOCATE_RETRY_BUDGET,
        })
    }

    async fn existing_binding(&self, req: &AllocationRequest) -> IpamResult<Option<FloatingIp>> {
        let held = self.store.find_by_key(&req.key).await?;
        Ok(match &req.subnet {
            Some(subnet) => held.into_iter().find(|f| &f.subnet == subnet),
            None => held.into_iter().next(),
        })
    }

    /// Claims one specific address for `key`; fails `NotUpdated` if it is
    /// already held.
    pub async fn allocate_specific(
        &self,
        ip: Ipv4Addr,
        key: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        self.store.allocate_specific(ip, key, policy, attr).await
    }

    pub async fn release(&self, key: &str, ip: Ipv4Addr) -> IpamResult<()> {
        self.store.release_ip(key, ip).await?;
        tracing::info!("released {} held by {}", ip, key);
        Ok(())
    }

    /// Namespace- or app-wide cleanup; the prefix is caller-supplied, e.g.
    /// `"<namespace>_"`.
    pub async fn release_prefix(&self, prefix: &str) -> IpamResult<u64> {
        let released = self.store.release_by_prefix(prefix).await?;
        tracing::info!("released {} addresses with key prefix {:?}", released, prefix);
        Ok(released)
    }

    /// Moves the newest binding `old_key` holds in `subnet` over to
    /// `new_key`, so a re-created pod inherits its predecessor's address.
    pub async fn rebind_in_subnet(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        self.store
            .update_one_in_subnet(old_key, new_key, subnet, policy, attr)
            .await
    }

    pub async fn rename(&self, old_key: &str, new_key: &str, attr: &str) -> IpamResult<u64> {
        self.store.update_key(old_key, new_key, attr).await
    }

    /// Most recent binding for `key`, if any.
    pub async fn latest_for_key(&self, key: &str) -> IpamResult<Option<FloatingIp>> {
        Ok(self.store.find_by_key(key).await?.into_iter().next())
    }

    pub async fn ips_for_key(&self, key: &str) -> IpamResult<Vec<FloatingIp>> {
        self.store.find_by_key(key).await
    }

    pub async fn subnets_for_key(&self, key: &str) -> IpamResult<Vec<String>> {
        self.store.query_by_key_group_by_subnet(key).await
    }

    pub async fn search(&self, keyword: &str) -> IpamResult<Vec<FloatingIp>> {
        self.store.get_by_keyword(keyword).await
    }

    /// Reconciliation against upstream truth: releases every `(ip, key)`
    /// binding the caller believes stale, reporting the pairs whose rows had
    /// already moved on. The only multi-row operation allowed to partially
    /// succeed.
    pub async fn reconcile(
        &self,
        stale: &HashMap<Ipv4Addr, String>,
    ) -> IpamResult<(Vec<Ipv4Addr>, HashMap<Ipv4Addr, String>)> {
        self.store.delete_ips(stale).await
    }

    /// Seeds one pool row per host address in `cidr`. The network and
    /// broadcast addresses are always skipped; `reserve_gateway` also skips
    /// the first usable address. Re-seeding an existing subnet is a no-op for
    /// rows already present.
    pub async fn seed_subnet(&self, cidr: &str, reserve_gateway: bool) -> IpamResult<u64> {
        let net: Ipv4Network = cidr.parse().map_err(|e| IpamError::InvalidSubnet {
            subnet: cidr.to_string(),
            reason: format!("{}", e),
        })?;

        let network = u32::from(net.network());
        let broadcast = u32::from(net.broadcast());
        let gateway = network.wrapping_add(1);

        let mut created = 0u64;
        for addr in net.iter() {
            let raw = u32::from(addr);
            if raw == network || raw == broadcast {
                continue;
            }
            if reserve_gateway && raw == gateway {
                continue;
            }

            let fip = FloatingIp::unallocated(addr, net.to_string());
            match self.store.create(&fip).await {
                Ok(()) => created += 1,
                Err(IpamError::Database(sqlx::Error::Database(db_err)))
                    if db_err.is_unique_violation() =>
                {
                    // Row survived from an earlier seeding run.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!("seeded {} addresses from {}", created, cidr);
        Ok(created)
    }
}
