//! Public port allocation
//!
//! Ports are handed out from a counter that only ever grows: every agent gets
//! a port strictly greater than every port handed out before, and ports are
//! never reused. Allocation is sequential and therefore predictable; it is not
//! randomized.

use parking_lot::Mutex;

use sr_core::error::AllocationError;

/// Issues unique, strictly increasing port numbers
pub struct PortAllocator {
    /// Last port handed out (or the configured start)
    last: Mutex<u16>,
}

impl PortAllocator {
    /// Create an allocator whose first port is `start + 1`
    pub fn new(start: u16) -> Self {
        Self {
            last: Mutex::new(start),
        }
    }

    /// Reset the starting value.
    ///
    /// Administrative; meant to run before any allocation.
    pub fn init(&self, start: u16) {
        *self.last.lock() = start;
    }

    /// Allocate the next port
    pub fn next(&self) -> Result<u16, AllocationError> {
        let mut last = self.last.lock();
        let port = last
            .checked_add(1)
            .ok_or(AllocationError::Exhausted { last: *last })?;
        *last = port;
        Ok(port)
    }

    /// The most recently allocated port (the start value before any allocation)
    pub fn last(&self) -> u16 {
        *self.last.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequential_allocation() {
        let allocator = PortAllocator::new(3000);
        let ports: Vec<u16> = (0..5).map(|_| allocator.next().unwrap()).collect();
        assert_eq!(ports, vec![3001, 3002, 3003, 3004, 3005]);
        assert_eq!(allocator.last(), 3005);
    }

    #[test]
    fn test_init_resets_start() {
        let allocator = PortAllocator::new(0);
        allocator.init(4000);
        assert_eq!(allocator.next().unwrap(), 4001);
    }

    #[test]
    fn test_concurrent_allocation_is_unique_and_increasing() {
        let allocator = Arc::new(PortAllocator::new(10_000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| allocator.next().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let ports = handle.join().unwrap();
            // Each thread observes its own allocations in increasing order
            assert!(ports.windows(2).all(|w| w[0] < w[1]));
            for port in ports {
                assert!(all.insert(port), "port {} handed out twice", port);
            }
        }

        assert_eq!(all.len(), 4000);
        assert_eq!(*all.iter().min().unwrap(), 10_001);
        assert_eq!(*all.iter().max().unwrap(), 14_000);
    }

    #[test]
    fn test_exhaustion_does_not_wrap() {
        let allocator = PortAllocator::new(u16::MAX - 1);
        assert_eq!(allocator.next().unwrap(), u16::MAX);
        assert_eq!(
            allocator.next(),
            Err(AllocationError::Exhausted { last: u16::MAX })
        );
        assert_eq!(allocator.last(), u16::MAX);
    }
}
