//! Port allocator
//!
//! Hands each starting instance a TCP port no other live instance holds.
//! "Free" is verified with an OS-level bind probe rather than assumed from
//! bookkeeping, so ports taken by unrelated processes are skipped too.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use crate::error::RouteError;

pub struct PortAllocator {
    start_port: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start_port: u16) -> Self {
        Self {
            start_port,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Claim the next free port at or above `start_port`. The probe listener
    /// is dropped immediately; the claim in `allocated` is what keeps two
    /// instances from racing onto the same port.
    pub fn allocate(&self) -> Result<u16, RouteError> {
        let mut allocated = self.allocated.lock().unwrap();
        for port in self.start_port..=u16::MAX {
            if allocated.contains(&port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                allocated.insert(port);
                return Ok(port);
            }
        }
        Err(RouteError::PortExhausted)
    }

    /// Return a port to the pool once its instance has fully stopped
    pub fn release(&self, port: u16) {
        self.allocated.lock().unwrap().remove(&port);
    }

    #[cfg(test)]
    pub fn held(&self) -> usize {
        self.allocated.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_pairwise_distinct() {
        let ports = PortAllocator::new(21500);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        let c = ports.allocate().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(ports.held(), 3);
    }

    #[test]
    fn released_ports_are_reused() {
        let ports = PortAllocator::new(21600);
        let a = ports.allocate().unwrap();
        ports.release(a);
        let b = ports.allocate().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn externally_bound_ports_are_skipped() {
        let ports = PortAllocator::new(21700);
        // Occupy the first candidate port at the OS level
        let holder = TcpListener::bind(("127.0.0.1", 21700));
        if let Ok(_holder) = holder {
            let a = ports.allocate().unwrap();
            assert_ne!(a, 21700);
        }
    }
}
