//! IPv4 address allocation within a network's IPAM pool.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use wgdock_common::{WgdockError, WgdockResult};

/// Hands out unique host addresses within a subnet.
///
/// The allocator is single-writer: the owning network serializes access.
#[derive(Debug)]
pub struct IpAllocator {
    pool: Ipv4Network,
    used: BTreeSet<Ipv4Addr>,
}

impl IpAllocator {
    /// Create an allocator over `pool` with no address in use.
    #[must_use]
    pub fn new(pool: Ipv4Network) -> Self {
        Self {
            pool,
            used: BTreeSet::new(),
        }
    }

    /// The pool this allocator draws from.
    #[must_use]
    pub fn pool(&self) -> Ipv4Network {
        self.pool
    }

    /// Record `ip` as taken. Idempotent.
    pub fn mark_used(&mut self, ip: Ipv4Addr) {
        self.used.insert(ip);
    }

    /// Record `ip` as free. Idempotent.
    pub fn mark_unused(&mut self, ip: Ipv4Addr) {
        self.used.remove(&ip);
    }

    /// Whether `ip` is currently marked used.
    #[must_use]
    pub fn is_used(&self, ip: Ipv4Addr) -> bool {
        self.used.contains(&ip)
    }

    /// Find the numerically smallest free host address and mark it used.
    ///
    /// The network and broadcast addresses are never handed out. The
    /// returned value carries the pool's prefix length.
    ///
    /// # Errors
    ///
    /// [`WgdockError::PoolExhausted`] when no host address remains.
    pub fn find_address(&mut self) -> WgdockResult<Ipv4Network> {
        let first = u32::from(self.pool.network());
        let last = u32::from(self.pool.broadcast());

        for candidate in first.saturating_add(1)..last {
            let ip = Ipv4Addr::from(candidate);
            if self.used.contains(&ip) {
                continue;
            }
            self.used.insert(ip);
            let net = Ipv4Network::new(ip, self.pool.prefix())
                .expect("prefix comes from a valid pool");
            return Ok(net);
        }

        Err(WgdockError::PoolExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn allocates_smallest_free_host() {
        let mut alloc = IpAllocator::new(pool("10.20.0.0/24"));

        let first = alloc.find_address().unwrap();
        assert_eq!(first.ip(), Ipv4Addr::new(10, 20, 0, 1));
        assert_eq!(first.prefix(), 24);

        let second = alloc.find_address().unwrap();
        assert_eq!(second.ip(), Ipv4Addr::new(10, 20, 0, 2));
    }

    #[test]
    fn skips_marked_addresses() {
        let mut alloc = IpAllocator::new(pool("10.20.0.0/24"));
        alloc.mark_used(Ipv4Addr::new(10, 20, 0, 1));
        alloc.mark_used(Ipv4Addr::new(10, 20, 0, 2));

        let found = alloc.find_address().unwrap();
        assert_eq!(found.ip(), Ipv4Addr::new(10, 20, 0, 3));
    }

    #[test]
    fn never_hands_out_network_or_broadcast() {
        let mut alloc = IpAllocator::new(pool("10.20.0.0/30"));

        // Two usable hosts in a /30.
        assert_eq!(alloc.find_address().unwrap().ip(), Ipv4Addr::new(10, 20, 0, 1));
        assert_eq!(alloc.find_address().unwrap().ip(), Ipv4Addr::new(10, 20, 0, 2));
        assert!(matches!(
            alloc.find_address(),
            Err(WgdockError::PoolExhausted)
        ));
    }

    #[test]
    fn mark_unused_returns_address_to_pool() {
        let mut alloc = IpAllocator::new(pool("10.20.0.0/29"));
        let a = alloc.find_address().unwrap();
        let _b = alloc.find_address().unwrap();

        alloc.mark_unused(a.ip());
        let again = alloc.find_address().unwrap();
        assert_eq!(again.ip(), a.ip());
    }

    #[test]
    fn marking_is_idempotent() {
        let mut alloc = IpAllocator::new(pool("10.20.0.0/29"));
        let ip = Ipv4Addr::new(10, 20, 0, 1);
        alloc.mark_used(ip);
        alloc.mark_used(ip);
        assert!(alloc.is_used(ip));
        alloc.mark_unused(ip);
        alloc.mark_unused(ip);
        assert!(!alloc.is_used(ip));
    }
}
