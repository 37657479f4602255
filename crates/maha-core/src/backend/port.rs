//! Ephemeral port allocation for the container backend (spec §4.3, §4.3.1).
//!
//! Ports are claimed by actually binding them, not by picking a random
//! unused-looking number: a bind that succeeds and is immediately released
//! is the only reliable signal on a shared host. Handed-out ports are also
//! tracked in-process so two containers started back-to-back never race
//! each other onto the same port before the OS would otherwise notice.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;

use rand::Rng;

use super::BackendError;

const DYNAMIC_RANGE_START: u16 = 49152;
const DYNAMIC_RANGE_END: u16 = 65535;
const MAX_BIND_ATTEMPTS: u32 = 50;

/// Allocates ports from the IANA dynamic/private range via bind-test,
/// tracking currently handed-out ports so `release` can return them to the
/// pool.
#[derive(Debug, Default)]
pub struct PortAllocator {
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Find a free port by binding to random candidates in
    /// `[49152, 65535]` until one binds successfully and isn't already
    /// tracked as in-use, or attempts are exhausted.
    pub fn allocate(&self) -> Result<u16, BackendError> {
        let mut rng = rand::rng();
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());

        for _ in 0..MAX_BIND_ATTEMPTS {
            let candidate = rng.random_range(DYNAMIC_RANGE_START..=DYNAMIC_RANGE_END);
            if in_use.contains(&candidate) {
                continue;
            }

            let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, candidate);
            if TcpListener::bind(addr).is_ok() {
                in_use.insert(candidate);
                return Ok(candidate);
            }
        }

        Err(BackendError::NoPortAvailable(DYNAMIC_RANGE_START, DYNAMIC_RANGE_END))
    }

    /// Release a port back to the pool. Workers release their port on
    /// backend `terminate`.
    pub fn release(&self, port: u16) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_port_in_dynamic_range() {
        let allocator = PortAllocator::new();
        let port = allocator.allocate().expect("allocation failed");
        assert!(port >= DYNAMIC_RANGE_START);
    }

    #[test]
    fn allocate_returns_a_bindable_port() {
        let allocator = PortAllocator::new();
        let port = allocator.allocate().expect("allocation failed");
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        assert!(TcpListener::bind(addr).is_ok());
    }

    #[test]
    fn released_port_can_be_reallocated() {
        let allocator = PortAllocator::new();
        let port = allocator.allocate().expect("allocation failed");
        allocator.release(port);
        assert!(!allocator.in_use.lock().unwrap().contains(&port));
    }

    #[test]
    fn allocate_never_double_hands_out_a_tracked_port() {
        let allocator = PortAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let port = allocator.allocate().expect("allocation failed");
            assert!(seen.insert(port), "port {port} handed out twice while still in use");
        }
    }
}
