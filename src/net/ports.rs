//! Host SSH port pool.

use std::collections::BTreeSet;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from port allocation.
#[derive(Debug, Error)]
pub enum PortPoolError {
    #[error("no free host SSH ports in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("port {port} is outside the configured range {start}-{end}")]
    OutOfRange { port: u16, start: u16, end: u16 },
}

/// Mutex-guarded pool over a closed port interval.
///
/// Allocation returns the lowest free port, which keeps behavior
/// deterministic for tests.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    used: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reserve the lowest free port in the range.
    pub fn allocate(&self) -> Result<u16, PortPoolError> {
        let mut used = self.used.lock().expect("port pool mutex poisoned");
        for port in self.start..=self.end {
            if !used.contains(&port) {
                used.insert(port);
                debug!(port, "allocated host SSH port");
                return Ok(port);
            }
        }
        Err(PortPoolError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Release a port. Idempotent.
    pub fn release(&self, port: u16) {
        let mut used = self.used.lock().expect("port pool mutex poisoned");
        if used.remove(&port) {
            debug!(port, "released host SSH port");
        } else {
            warn!(port, "port already released");
        }
    }

    /// Mark a port as held during startup reconciliation.
    pub fn mark_held(&self, port: u16) -> Result<(), PortPoolError> {
        if port < self.start || port > self.end {
            return Err(PortPoolError::OutOfRange {
                port,
                start: self.start,
                end: self.end,
            });
        }
        let mut used = self.used.lock().expect("port pool mutex poisoned");
        used.insert(port);
        Ok(())
    }

    /// Number of held ports.
    pub fn held_count(&self) -> usize {
        self.used.lock().expect("port pool mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port() {
        let pool = PortPool::new(10000, 10002);
        assert_eq!(pool.allocate().unwrap(), 10000);
        assert_eq!(pool.allocate().unwrap(), 10001);
        assert_eq!(pool.allocate().unwrap(), 10002);
        assert!(matches!(
            pool.allocate(),
            Err(PortPoolError::Exhausted { .. })
        ));
    }

    #[test]
    fn released_port_is_reused_first() {
        let pool = PortPool::new(10000, 10010);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        pool.release(a);
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn release_is_idempotent() {
        let pool = PortPool::new(10000, 10010);
        let a = pool.allocate().unwrap();
        pool.release(a);
        pool.release(a);
        pool.release(19999);
        assert_eq!(pool.held_count(), 0);
    }

    #[test]
    fn mark_held_checks_range() {
        let pool = PortPool::new(10000, 10010);
        pool.mark_held(10005).unwrap();
        assert!(matches!(
            pool.mark_held(9999),
            Err(PortPoolError::OutOfRange { .. })
        ));
        // The marked port is skipped by allocation.
        assert_eq!(pool.allocate().unwrap(), 10000);
        for _ in 0..4 {
            pool.allocate().unwrap();
        }
        assert_eq!(pool.allocate().unwrap(), 10006);
    }
}
