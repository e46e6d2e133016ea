// src/network/ip_pool.rs
//! Virtual address pool management.
//!
//! This module hands out unique IPv4 addresses to IP flows from the range
//! configured for the server. The pool is shared by every tunnel; all
//! bookkeeping happens under a single lock.

use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

/// Prefix length of the network both ends of the range must share
const POOL_NETWORK_PREFIX: u8 = 16;

/// Bitmap allocator over a contiguous IPv4 range.
///
/// The range is end-exclusive. A pool built from an invalid range has no
/// addresses, so every allocation fails.
#[derive(Debug)]
pub struct AddressPool {
    /// First address of the range
    base_address: Ipv4Addr,
    /// One flag per offset, set while allocated
    in_use: Mutex<Vec<bool>>,
}

impl AddressPool {
    /// Create a pool from textual start and end addresses
    pub fn new(start: &str, end: &str) -> Self {
        match parse_range(start, end) {
            Ok((base_address, size)) => {
                info!(
                    "Address pool {} - {} with {} addresses",
                    start, end, size
                );
                Self {
                    base_address,
                    in_use: Mutex::new(vec![false; size]),
                }
            }
            Err(reason) => {
                warn!("Invalid address pool {} - {}: {}", start, end, reason);
                Self::empty()
            }
        }
    }

    /// A pool without addresses
    pub fn empty() -> Self {
        Self {
            base_address: Ipv4Addr::UNSPECIFIED,
            in_use: Mutex::new(Vec::new()),
        }
    }

    /// Allocate the lowest free address
    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let mut in_use = self.in_use.lock();

        let offset = match in_use.iter().position(|used| !used) {
            Some(offset) => offset,
            None => {
                warn!("Address pool exhausted ({} addresses)", in_use.len());
                return None;
            }
        };
        in_use[offset] = true;

        let address = Ipv4Addr::from(u32::from(self.base_address) + offset as u32);
        debug!("Allocated address {}", address);
        Some(address)
    }

    /// Return an address to the pool.
    ///
    /// Addresses outside the pool or not currently allocated are ignored.
    pub fn deallocate(&self, address: Ipv4Addr) {
        let mut in_use = self.in_use.lock();

        let offset = match u32::from(address).checked_sub(u32::from(self.base_address)) {
            Some(offset) if (offset as usize) < in_use.len() => offset as usize,
            _ => {
                debug!("Ignoring release of {}, not in pool", address);
                return;
            }
        };

        if in_use[offset] {
            in_use[offset] = false;
            debug!("Released address {}", address);
        } else {
            debug!("Ignoring release of {}, not allocated", address);
        }
    }

    /// Number of free addresses
    pub fn available(&self) -> usize {
        self.in_use.lock().iter().filter(|used| !**used).count()
    }

    /// Total number of addresses
    pub fn capacity(&self) -> usize {
        self.in_use.lock().len()
    }
}

/// Validate a range, returning its base address and size
fn parse_range(start: &str, end: &str) -> Result<(Ipv4Addr, usize), String> {
    let start: IpAddr = start
        .parse()
        .map_err(|_| format!("start address {} does not parse", start))?;
    let end: IpAddr = end
        .parse()
        .map_err(|_| format!("end address {} does not parse", end))?;

    let (start, end) = match (start, end) {
        (IpAddr::V4(start), IpAddr::V4(end)) => (start, end),
        (IpAddr::V6(_), IpAddr::V6(_)) => return Err("IPv6 pools are not supported".into()),
        _ => return Err("address families differ".into()),
    };

    let network = Ipv4Network::new(start, POOL_NETWORK_PREFIX).map_err(|e| e.to_string())?;
    if !network.contains(end) {
        return Err(format!("addresses are not within one /{} network", POOL_NETWORK_PREFIX));
    }

    let size = u32::from(end)
        .checked_sub(u32::from(start))
        .ok_or_else(|| "end address precedes start address".to_string())?;

    Ok((start, size as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, TestResult};
    use std::collections::HashSet;
    use std::sync::Arc;
    use test_case::test_case;

    #[test]
    fn test_pool_basic() {
        let pool = AddressPool::new("10.0.0.1", "10.0.0.4");
        assert_eq!(pool.capacity(), 3);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(b, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(c, Ipv4Addr::new(10, 0, 0, 3));

        // End address is exclusive
        assert!(pool.allocate().is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_reuse_after_release() {
        let pool = AddressPool::new("192.168.5.10", "192.168.5.12");
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());

        pool.deallocate(first);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.allocate(), Some(first));

        pool.deallocate(second);
        pool.deallocate(second);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_release_outside_pool_ignored() {
        let pool = AddressPool::new("10.1.0.1", "10.1.0.3");
        pool.allocate().unwrap();

        pool.deallocate(Ipv4Addr::new(10, 1, 0, 0));
        pool.deallocate(Ipv4Addr::new(10, 1, 0, 3));
        pool.deallocate(Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_range_across_octet_boundary() {
        let pool = AddressPool::new("10.0.0.254", "10.0.1.2");
        assert_eq!(pool.capacity(), 4);
        let addresses: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(addresses[2], Ipv4Addr::new(10, 0, 1, 0));
    }

    #[test_case("not-an-address", "10.0.0.4" ; "start does not parse")]
    #[test_case("10.0.0.1", "10.0.0" ; "end does not parse")]
    #[test_case("10.0.0.1", "fd00::4" ; "families differ")]
    #[test_case("fd00::1", "fd00::4" ; "ipv6")]
    #[test_case("10.0.0.1", "10.1.0.4" ; "different networks")]
    #[test_case("10.0.0.9", "10.0.0.4" ; "end before start")]
    fn test_invalid_range_is_empty(start: &str, end: &str) {
        let pool = AddressPool::new(start, end);
        assert_eq!(pool.capacity(), 0);
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn test_concurrent_allocation() {
        let pool = Arc::new(AddressPool::new("172.16.0.1", "172.16.0.101"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..25).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for address in handle.join().unwrap() {
                assert!(seen.insert(address));
            }
        }
        assert_eq!(seen.len(), 100);
        assert!(pool.allocate().is_none());
    }

    quickcheck! {
        fn prop_allocations_distinct_and_in_range(size: u8, frees: Vec<u8>) -> TestResult {
            let end = Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 9, 0, 1)) + size as u32);
            let pool = AddressPool::new("10.9.0.1", &end.to_string());

            let mut allocated = Vec::new();
            while let Some(address) = pool.allocate() {
                if address < Ipv4Addr::new(10, 9, 0, 1) || address >= end {
                    return TestResult::failed();
                }
                allocated.push(address);
            }
            let unique: HashSet<_> = allocated.iter().collect();
            if unique.len() != size as usize || allocated.len() != size as usize {
                return TestResult::failed();
            }

            let mut released = HashSet::new();
            for index in frees {
                if let Some(address) = allocated.get(index as usize) {
                    pool.deallocate(*address);
                    released.insert(*address);
                }
            }
            TestResult::from_bool(pool.available() == released.len())
        }
    }
}
