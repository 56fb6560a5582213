use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::config::IosSettings;

/// Local ports for relay and WebDriverAgent proxy sessions. Filled once at construction;
/// a port is held by exactly one `PortLease` until the lease is dropped.
#[derive(Debug)]
pub struct PortPool {
    free: Mutex<VecDeque<u16>>,
    cv: Condvar,
}

impl PortPool {
    /// `start..end` stepping by `step`, truncated to `capacity` entries.
    pub fn new(start: u16, end: u16, step: u16, capacity: usize) -> Self {
        let mut free: VecDeque<u16> = (start..end).step_by(usize::from(step.max(1))).collect();
        if free.len() > capacity {
            warn!(
                configured = free.len(),
                capacity, "port range exceeds pool capacity; extra ports ignored"
            );
            free.truncate(capacity);
        }
        debug!(ports = free.len(), start, end, step, "port pool filled");
        Self {
            free: Mutex::new(free),
            cv: Condvar::new(),
        }
    }

    pub fn from_settings(settings: &IosSettings) -> Self {
        Self::new(
            settings.port_range_start,
            settings.port_range_end,
            settings.port_step,
            settings.pool_capacity,
        )
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<u16>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn available(&self) -> usize {
        self.lock().len()
    }

    /// Blocks until a port is free.
    pub fn acquire(self: &Arc<Self>) -> PortLease {
        let mut free = self.lock();
        loop {
            if let Some(port) = free.pop_front() {
                return self.lease(port);
            }
            free = self.cv.wait(free).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<PortLease> {
        let port = self.lock().pop_front()?;
        Some(self.lease(port))
    }

    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<PortLease> {
        let deadline = Instant::now() + timeout;
        let mut free = self.lock();
        loop {
            if let Some(port) = free.pop_front() {
                return Some(self.lease(port));
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            free = self
                .cv
                .wait_timeout(free, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn lease(self: &Arc<Self>, port: u16) -> PortLease {
        PortLease {
            port,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, port: u16) {
        self.lock().push_back(port);
        self.cv.notify_one();
    }
}

#[derive(Debug)]
pub struct PortLease {
    port: u16,
    pool: Arc<PortPool>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn fills_range_with_step() {
        let pool = PortPool::from_settings(&IosSettings::default());
        assert_eq!(pool.available(), 80);
        let pool = Arc::new(PortPool::new(10600, 10620, 5, 100));
        let first = pool.try_acquire().expect("port");
        assert_eq!(first.port(), 10600);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn capacity_truncates_range() {
        let pool = PortPool::new(1000, 2000, 1, 10);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn dropped_lease_returns_port() {
        let pool = Arc::new(PortPool::new(10600, 10601, 1, 10));
        let lease = pool.try_acquire().expect("port");
        assert!(pool.try_acquire().is_none());
        assert!(pool.acquire_timeout(Duration::from_millis(20)).is_none());
        drop(lease);
        assert_eq!(pool.try_acquire().map(|lease| lease.port()), Some(10600));
    }

    #[test]
    fn concurrent_holders_never_share_a_port() {
        let pool = Arc::new(PortPool::new(10600, 10620, 5, 100));
        let held = Arc::new(Mutex::new(HashSet::new()));
        let collided = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            let held = Arc::clone(&held);
            let collided = Arc::clone(&collided);
            handles.push(thread::spawn(move || {
                let lease = pool.acquire();
                if !held.lock().expect("held").insert(lease.port()) {
                    collided.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(15));
                held.lock().expect("held").remove(&lease.port());
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert!(!collided.load(Ordering::SeqCst));
        assert_eq!(pool.available(), 4);
    }
}
