//! Bounded pools of fixed-size transfer buffers.
//!
//! Every buffer is owned by exactly one of: the pool's free list, a
//! [`PooledBuffer`] lease held by a block task, or the pending map of a
//! transfer. Dropping the lease puts the buffer back on the free list.
//!
//! ```text
//! PoolRegistry
//!   pools: Mutex<HashMap<block_size, Arc<BufferPool>>>
//!
//! BufferPool
//!   free:   Mutex<Vec<Vec<u8>>>   (cold path, one lock)
//!   leases: DashMap<lease, ()>    (outstanding buffers)
//!   allocated: AtomicUsize        (free + leased, <= capacity)
//! ```

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::TransferConfig;

/// Fixed-size buffer pool shared by every transfer using one block size.
#[derive(Debug)]
pub struct BufferPool {
    block_size: usize,
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    leases: DashMap<u64, ()>,
    allocated: AtomicUsize,
    next_lease: AtomicU64,
}

impl BufferPool {
    /// Creates a pool of at most `capacity` buffers of `block_size` bytes.
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            block_size,
            capacity: capacity.max(1),
            free: Mutex::new(Vec::new()),
            leases: DashMap::new(),
            allocated: AtomicUsize::new(0),
            next_lease: AtomicU64::new(1),
        }
    }

    /// Creates a pool sized from a memory budget.
    pub fn with_budget(block_size: usize, budget_bytes: u64, max_cells: usize) -> Self {
        let by_budget = budget_bytes / block_size.max(1) as u64;
        let capacity = usize::try_from(by_budget).unwrap_or(usize::MAX).min(max_cells);
        Self::new(block_size, capacity)
    }

    /// Leases a buffer, or returns `None` when the pool is exhausted.
    ///
    /// `None` means "try again later", never an error.
    pub fn acquire(self: &Arc<Self>) -> Option<PooledBuffer> {
        let recycled = self.free.lock().pop();
        let data = match recycled {
            Some(data) => data,
            None => {
                self.allocated
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < self.capacity).then_some(n + 1)
                    })
                    .ok()?;
                vec![0u8; self.block_size]
            }
        };

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        self.leases.insert(lease, ());
        Some(PooledBuffer {
            data: Some(data),
            lease,
            pool: Arc::clone(self),
        })
    }

    /// Returns a leased buffer to the free list.
    ///
    /// # Panics
    ///
    /// If the buffer has the wrong size or the lease is unknown.
    fn release(&self, lease: u64, data: Vec<u8>) {
        assert_eq!(
            data.len(),
            self.block_size,
            "buffer of {} bytes returned to a {}-byte pool",
            data.len(),
            self.block_size
        );
        assert!(
            self.leases.remove(&lease).is_some(),
            "buffer lease {lease} is not outstanding"
        );
        self.free.lock().push(data);
    }

    /// Drops every idle buffer. Leased buffers are unaffected.
    pub fn trim(&self) -> usize {
        let drained = std::mem::take(&mut *self.free.lock());
        self.allocated.fetch_sub(drained.len(), Ordering::AcqRel);
        drained.len()
    }

    /// Buffers currently leased out.
    pub fn in_use(&self) -> usize {
        self.leases.len()
    }

    /// Buffers idle on the free list.
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

/// A leased pool buffer. Dropping it returns the buffer to its pool.
///
/// Dereferences to the full `block_size` bytes; callers track how much of it
/// a block uses.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Option<Vec<u8>>,
    lease: u64,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(self.lease, data);
        }
    }
}

/// One pool per distinct block size.
#[derive(Debug)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<usize, Arc<BufferPool>>>,
    budget_bytes: u64,
    max_cells: usize,
}

impl PoolRegistry {
    pub fn new(budget_bytes: u64, max_cells: usize) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            budget_bytes,
            max_cells,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.pool_budget_bytes, config.pool_max_cells)
    }

    /// Process-wide registry sized with the default configuration.
    pub fn global() -> Arc<PoolRegistry> {
        static GLOBAL: OnceLock<Arc<PoolRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| {
            Arc::new(PoolRegistry::from_config(&TransferConfig::default()))
        }))
    }

    /// Returns the pool for `block_size`, creating it on first use.
    pub fn pool_for(&self, block_size: usize) -> Arc<BufferPool> {
        let mut pools = self.pools.lock();
        Arc::clone(pools.entry(block_size).or_insert_with(|| {
            tracing::debug!(block_size, "creating buffer pool");
            Arc::new(BufferPool::with_budget(
                block_size,
                self.budget_bytes,
                self.max_cells,
            ))
        }))
    }

    /// Trims every pool; returns the number of buffers dropped.
    pub fn trim_all(&self) -> usize {
        self.pools.lock().values().map(|pool| pool.trim()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let pool = Arc::new(BufferPool::new(8, 2));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 2);
        assert_eq!(a.len(), 8);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.free_len(), 1);
        let c = pool.acquire().unwrap();
        assert_eq!(pool.free_len(), 0);

        drop(b);
        drop(c);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn buffers_are_recycled() {
        let pool = Arc::new(BufferPool::new(4, 1));
        let mut buf = pool.acquire().unwrap();
        buf.copy_from_slice(b"abcd");
        drop(buf);
        let buf = pool.acquire().unwrap();
        assert_eq!(&buf[..], b"abcd");
    }

    #[test]
    fn trim_keeps_leases() {
        let pool = Arc::new(BufferPool::new(4, 3));
        let held = pool.acquire().unwrap();
        drop(pool.acquire().unwrap());
        assert_eq!(pool.trim(), 1);
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.in_use(), 1);
        // Trimmed slots become allocatable again.
        let _x = pool.acquire().unwrap();
        let _y = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        drop(held);
    }

    #[test]
    fn capacity_follows_budget() {
        let pool = BufferPool::with_budget(1024, 10 * 1024, 8192);
        assert_eq!(pool.capacity(), 10);
        let pool = BufferPool::with_budget(1024, u64::MAX, 16);
        assert_eq!(pool.capacity(), 16);
        let pool = BufferPool::with_budget(1024, 10, 16);
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    #[should_panic(expected = "not outstanding")]
    fn releasing_unknown_lease_panics() {
        let pool = BufferPool::new(4, 1);
        pool.release(42, vec![0; 4]);
    }

    #[test]
    #[should_panic(expected = "returned to a")]
    fn releasing_wrong_size_panics() {
        let pool = BufferPool::new(4, 1);
        pool.release(1, vec![0; 3]);
    }

    #[test]
    fn registry_shares_pools_by_size() {
        let registry = PoolRegistry::new(1 << 20, 64);
        let a = registry.pool_for(1024);
        let b = registry.pool_for(1024);
        let c = registry.pool_for(2048);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        drop(a.acquire().unwrap());
        drop(c.acquire().unwrap());
        assert_eq!(registry.trim_all(), 2);
    }

    #[test]
    fn concurrent_leases_balance() {
        let pool = Arc::new(BufferPool::new(16, 8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(mut buf) = pool.acquire() {
                            buf[0] = 1;
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
        assert!(pool.free_len() <= pool.capacity());
    }
}
