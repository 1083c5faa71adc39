use std::collections::BTreeSet;
use std::ops::Range;

use parking_lot::Mutex;

/// Borrow/return allocator for the TCP ports the per-renderer AirPlay
/// listeners bind. One pool is shared by the whole bridge.
pub struct PortPool {
    free: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            free: Mutex::new(range.collect()),
        }
    }

    pub fn allocate(&self) -> Option<u16> {
        self.free.lock().pop_first()
    }

    pub fn release(&self, port: u16) {
        self.free.lock().insert(port);
    }
}

#[cfg(test)]
mod tests {
    use super::PortPool;

    #[test]
    fn test_allocate_and_release() {
        let pool = PortPool::new(22555..22557);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.allocate(), None);

        pool.release(a);
        assert_eq!(pool.allocate(), Some(a));
    }
}
