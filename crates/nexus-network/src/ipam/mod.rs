//! IP address management for the node subnet.
//!
//! Addresses are handed out by a deterministic linear scan over the host
//! range of one subnet, skipping the gateway and every leased address. One
//! mutex plus the store's own lock cover the whole load-scan-save cycle, so
//! concurrent callers never receive the same address, whether they share
//! an allocator or only a lease file.

pub mod store;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use ipnet::Ipv4Net;
use nexus_common::error::{NexusError, Result};
use nexus_common::types::{IpAddress, NodeId};

pub use store::{FileLeaseStore, Lease, LeaseStore, LeaseTable, MemoryLeaseStore};

/// Address pool for a single subnet.
pub struct IpAllocator {
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    store: Mutex<Box<dyn LeaseStore>>,
}

impl std::fmt::Debug for IpAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpAllocator")
            .field("subnet", &self.subnet)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl IpAllocator {
    /// Creates an allocator over `subnet` with `gateway` permanently
    /// reserved.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Config`] if the gateway is not a host address
    /// of the subnet.
    pub fn new(subnet: Ipv4Net, gateway: Ipv4Addr, store: Box<dyn LeaseStore>) -> Result<Self> {
        let subnet = subnet.trunc();
        if !subnet.hosts().any(|host| host == gateway) {
            return Err(NexusError::Config {
                message: format!("gateway {gateway} is not a host of {subnet}"),
            });
        }
        Ok(Self {
            subnet,
            gateway,
            store: Mutex::new(store),
        })
    }

    /// Allocator backed by an in-memory table.
    ///
    /// # Errors
    ///
    /// Same as [`IpAllocator::new`].
    pub fn in_memory(subnet: Ipv4Net, gateway: Ipv4Addr) -> Result<Self> {
        Self::new(subnet, gateway, Box::new(MemoryLeaseStore::new()))
    }

    /// Subnet this allocator serves.
    #[must_use]
    pub const fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Reserved gateway address.
    #[must_use]
    pub const fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn LeaseStore>>> {
        self.store.lock().map_err(|_| NexusError::Config {
            message: "lease table lock poisoned".into(),
        })
    }

    fn load(&self, store: &dyn LeaseStore) -> Result<LeaseTable> {
        let mut table = store.load()?;
        let _ = table.insert(self.gateway, Lease::Gateway);
        Ok(table)
    }

    /// Leases the lowest free host address to `node`.
    ///
    /// Every call allocates a new address; a node that already holds one
    /// gets a second.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::AddressExhausted`] when every host address is
    /// taken (the table is left untouched), or a store error.
    pub fn assign_ip(&self, node: &NodeId) -> Result<IpAddress> {
        let mut store = self.lock()?;
        let _held = store.acquire()?;
        let mut table = self.load(&**store)?;

        let Some(ip) = self.subnet.hosts().find(|host| !table.contains_key(host)) else {
            tracing::warn!(node = %node, subnet = %self.subnet, "address pool exhausted");
            return Err(NexusError::AddressExhausted {
                subnet: self.subnet.to_string(),
            });
        };

        let _ = table.insert(ip, Lease::Node(node.clone()));
        store.save(&table)?;
        tracing::info!(node = %node, %ip, "address assigned");
        Ok(IpAddress {
            ip,
            subnet: self.subnet,
            gateway: self.gateway,
        })
    }

    /// Returns `addr` to the pool.
    ///
    /// Releasing an address that is not leased is a no-op; the gateway is
    /// never released.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn release_ip(&self, addr: Ipv4Addr) -> Result<()> {
        if addr == self.gateway {
            tracing::warn!(%addr, "refusing to release the gateway address");
            return Ok(());
        }
        let mut store = self.lock()?;
        let _held = store.acquire()?;
        let mut table = self.load(&**store)?;
        if table.remove(&addr).is_some() {
            store.save(&table)?;
            tracing::info!(%addr, "address released");
        }
        Ok(())
    }

    /// Releases every address leased to `node` and returns them.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn release_node(&self, node: &NodeId) -> Result<Vec<Ipv4Addr>> {
        let mut store = self.lock()?;
        let _held = store.acquire()?;
        let mut table = self.load(&**store)?;
        let released: Vec<Ipv4Addr> = table
            .iter()
            .filter(|(_, lease)| matches!(lease, Lease::Node(owner) if owner == node))
            .map(|(addr, _)| *addr)
            .collect();
        if released.is_empty() {
            return Ok(released);
        }
        table.retain(|addr, _| !released.contains(addr));
        store.save(&table)?;
        tracing::info!(node = %node, addresses = ?released, "node addresses released");
        Ok(released)
    }

    /// Current node leases, gateway excluded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn leases(&self) -> Result<BTreeMap<Ipv4Addr, NodeId>> {
        let store = self.lock()?;
        let _held = store.acquire()?;
        let table = store.load()?;
        Ok(table
            .into_iter()
            .filter_map(|(addr, lease)| match lease {
                Lease::Node(node) => Some((addr, node)),
                Lease::Gateway => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn allocator(cidr: &str, gateway: [u8; 4]) -> IpAllocator {
        IpAllocator::in_memory(cidr.parse().unwrap(), Ipv4Addr::from(gateway)).unwrap()
    }

    #[test]
    fn first_address_follows_gateway() {
        let ipam = allocator("10.0.42.0/24", [10, 0, 42, 1]);
        let ip = ipam.assign_ip(&node("web-1")).unwrap();
        assert_eq!(ip.ip, Ipv4Addr::new(10, 0, 42, 2));
        assert_eq!(ip.gateway, Ipv4Addr::new(10, 0, 42, 1));
        assert_eq!(ip.subnet.to_string(), "10.0.42.0/24");
    }

    #[test]
    fn sequential_assignments_are_unique_and_skip_gateway() {
        let ipam = allocator("10.0.42.0/24", [10, 0, 42, 1]);
        let mut seen = HashSet::new();
        for i in 0..253 {
            let ip = ipam.assign_ip(&node(&format!("n{i}"))).unwrap().ip;
            assert_ne!(ip, ipam.gateway());
            assert!(seen.insert(ip), "{ip} handed out twice");
        }
        assert_eq!(seen.len(), 253);
    }

    #[test]
    fn gateway_in_the_middle_is_skipped() {
        let ipam = allocator("192.168.7.0/29", [192, 168, 7, 3]);
        let ips: Vec<_> = (0..5)
            .map(|i| ipam.assign_ip(&node(&format!("n{i}"))).unwrap().ip.octets()[3])
            .collect();
        assert_eq!(ips, [1, 2, 4, 5, 6]);
    }

    #[test]
    fn exhaustion_leaves_pool_unchanged() {
        let ipam = allocator("10.1.0.0/29", [10, 1, 0, 1]);
        for i in 0..5 {
            let _ = ipam.assign_ip(&node(&format!("n{i}"))).unwrap();
        }
        let before = ipam.leases().unwrap();
        let err = ipam.assign_ip(&node("late")).unwrap_err();
        assert!(matches!(err, NexusError::AddressExhausted { .. }));
        assert_eq!(ipam.leases().unwrap(), before);
    }

    #[test]
    fn released_address_is_reused_after_exhaustion() {
        let ipam = allocator("10.1.0.0/29", [10, 1, 0, 1]);
        let ips: Vec<_> = (0..5)
            .map(|i| ipam.assign_ip(&node(&format!("n{i}"))).unwrap().ip)
            .collect();
        ipam.release_ip(ips[2]).unwrap();
        assert_eq!(ipam.assign_ip(&node("again")).unwrap().ip, ips[2]);
    }

    #[test]
    fn releasing_unallocated_address_is_a_no_op() {
        let ipam = allocator("10.0.42.0/24", [10, 0, 42, 1]);
        ipam.release_ip(Ipv4Addr::new(10, 0, 42, 77)).unwrap();
        ipam.release_ip(Ipv4Addr::new(172, 16, 0, 1)).unwrap();
        assert!(ipam.leases().unwrap().is_empty());
    }

    #[test]
    fn gateway_can_never_be_released() {
        let ipam = allocator("10.0.42.0/24", [10, 0, 42, 1]);
        ipam.release_ip(Ipv4Addr::new(10, 0, 42, 1)).unwrap();
        let ip = ipam.assign_ip(&node("web-1")).unwrap().ip;
        assert_eq!(ip, Ipv4Addr::new(10, 0, 42, 2));
    }

    #[test]
    fn release_by_node_returns_its_addresses() {
        let ipam = allocator("10.0.42.0/24", [10, 0, 42, 1]);
        let a = ipam.assign_ip(&node("web-1")).unwrap().ip;
        let b = ipam.assign_ip(&node("db-1")).unwrap().ip;
        let c = ipam.assign_ip(&node("web-1")).unwrap().ip;

        assert_eq!(ipam.release_node(&node("web-1")).unwrap(), vec![a, c]);
        assert!(ipam.release_node(&node("web-1")).unwrap().is_empty());
        let remaining = ipam.leases().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[&b], node("db-1"));
    }

    #[test]
    fn gateway_outside_subnet_is_rejected() {
        let err = IpAllocator::in_memory("10.0.42.0/24".parse().unwrap(), Ipv4Addr::new(10, 0, 43, 1))
            .unwrap_err();
        assert!(matches!(err, NexusError::Config { .. }));
    }

    #[test]
    fn concurrent_assignments_never_collide() {
        let ipam = allocator("10.0.42.0/24", [10, 0, 42, 1]);
        let ips: Vec<Ipv4Addr> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|t| {
                    let ipam = &ipam;
                    s.spawn(move || {
                        (0..8)
                            .map(|i| ipam.assign_ip(&node(&format!("t{t}-{i}"))).unwrap().ip)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        let unique: HashSet<_> = ips.iter().collect();
        assert_eq!(ips.len(), 128);
        assert_eq!(unique.len(), 128);
    }

    #[test]
    fn file_backed_pool_sees_earlier_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");
        let subnet: Ipv4Net = "10.0.42.0/24".parse().unwrap();
        let gateway = Ipv4Addr::new(10, 0, 42, 1);

        let first = IpAllocator::new(subnet, gateway, Box::new(FileLeaseStore::new(&path))).unwrap();
        let _ = first.assign_ip(&node("web-1")).unwrap();
        drop(first);

        let second = IpAllocator::new(subnet, gateway, Box::new(FileLeaseStore::new(&path))).unwrap();
        assert_eq!(
            second.assign_ip(&node("web-2")).unwrap().ip,
            Ipv4Addr::new(10, 0, 42, 3)
        );
    }

    #[test]
    fn allocators_sharing_a_lease_file_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");
        let subnet: Ipv4Net = "10.0.42.0/24".parse().unwrap();
        let gateway = Ipv4Addr::new(10, 0, 42, 1);
        let pools: Vec<IpAllocator> = (0..2)
            .map(|_| IpAllocator::new(subnet, gateway, Box::new(FileLeaseStore::new(&path))).unwrap())
            .collect();

        let ips: Vec<Ipv4Addr> = std::thread::scope(|s| {
            let handles: Vec<_> = pools
                .iter()
                .enumerate()
                .map(|(p, pool)| {
                    s.spawn(move || {
                        (0..40)
                            .map(|i| pool.assign_ip(&node(&format!("p{p}-{i}"))).unwrap().ip)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<_> = ips.iter().collect();
        assert_eq!(unique.len(), 80, "an address was handed out twice");
        assert_eq!(pools[0].leases().unwrap().len(), 80);
    }
}
