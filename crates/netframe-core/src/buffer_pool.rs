//! Multi-class byte buffer pool.
//!
//! Buffers are bucketed into power-of-two size classes between a configured
//! minimum and maximum. `rent` hands out the smallest class that satisfies
//! the request; `return_buffer` puts a buffer back into its class's free
//! list. Oversized requests (larger than the pool's maximum class) bypass
//! pooling entirely and allocate directly — `return_buffer` silently drops
//! anything whose capacity doesn't match a known class.
//!
//! Buffers rented from this pool are returned by their caller on every exit
//! path, including error — the pool itself has no way to detect a leaked
//! rental, only a caller that returns the same buffer twice, which it does
//! not attempt to guard against (the contract requires callers not to).

use std::sync::Mutex;

/// Configuration for a [`ByteBufferPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Smallest size class (must be a power of two).
    pub min_class: usize,
    /// Largest size class (must be a power of two, `>= min_class`).
    pub max_class: usize,
    /// Free buffers retained per size class before further returns are
    /// dropped instead of pooled.
    pub per_class_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { min_class: 256, max_class: 65_536, per_class_capacity: 64 }
    }
}

struct BufferClass {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

/// A pool of reusable byte buffers bucketed by power-of-two size class.
pub struct ByteBufferPool {
    classes: Vec<BufferClass>,
    per_class_capacity: usize,
    max_buffer_size: usize,
}

impl ByteBufferPool {
    /// Build a pool from `config`.
    ///
    /// # Panics
    ///
    /// Panics if `min_class`/`max_class` aren't powers of two or
    /// `min_class > max_class` — this is a startup configuration error, not
    /// a runtime condition.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        assert!(config.min_class.is_power_of_two(), "min_class must be a power of two");
        assert!(config.max_class.is_power_of_two(), "max_class must be a power of two");
        assert!(config.min_class <= config.max_class, "min_class must not exceed max_class");

        let mut classes = Vec::new();
        let mut size = config.min_class;
        while size <= config.max_class {
            classes.push(BufferClass { size, free: Mutex::new(Vec::new()) });
            size *= 2;
        }

        Self { classes, per_class_capacity: config.per_class_capacity, max_buffer_size: config.max_class }
    }

    /// Largest buffer size this pool actually pools. Callers (e.g.
    /// `TransportStream`) use this to decide whether an incoming frame's
    /// declared length is plausible before allocating for it.
    #[must_use]
    pub const fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    fn class_for(&self, n: usize) -> Option<usize> {
        self.classes.iter().position(|c| c.size >= n)
    }

    /// Rent a zero-filled buffer of at least `n` bytes.
    ///
    /// Requests larger than every configured class allocate directly and are
    /// not tracked by the pool.
    #[must_use]
    pub fn rent(&self, n: usize) -> Vec<u8> {
        match self.class_for(n) {
            Some(idx) => {
                let class = &self.classes[idx];
                let mut free = class.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(mut buf) = free.pop() {
                    buf.clear();
                    buf.resize(class.size, 0);
                    buf
                } else {
                    vec![0u8; class.size]
                }
            },
            None => vec![0u8; n],
        }
    }

    /// Return a previously rented buffer.
    ///
    /// Buffers whose capacity doesn't exactly match one of this pool's
    /// classes (oversized rentals, or buffers from a different pool) are
    /// simply dropped. A class whose free list is already at
    /// `per_class_capacity` also just drops the incoming buffer.
    pub fn return_buffer(&self, buf: Vec<u8>) {
        let Some(idx) = self.classes.iter().position(|c| c.size == buf.capacity()) else {
            return;
        };
        let class = &self.classes[idx];
        let mut free = class.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if free.len() < self.per_class_capacity {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_returns_smallest_satisfying_class() {
        let pool = ByteBufferPool::new(PoolConfig { min_class: 64, max_class: 1024, per_class_capacity: 8 });
        let buf = pool.rent(100);
        assert_eq!(buf.capacity(), 128);
    }

    #[test]
    fn oversized_rent_bypasses_pool() {
        let pool = ByteBufferPool::new(PoolConfig { min_class: 64, max_class: 1024, per_class_capacity: 8 });
        let buf = pool.rent(5000);
        assert_eq!(buf.len(), 5000);
        // Returning it is a silent no-op since no class has this capacity.
        pool.return_buffer(buf);
    }

    #[test]
    fn returned_buffer_is_reused() {
        let pool = ByteBufferPool::new(PoolConfig { min_class: 64, max_class: 1024, per_class_capacity: 8 });
        let first = pool.rent(64);
        let ptr_before = first.as_ptr();
        pool.return_buffer(first);

        let second = pool.rent(64);
        assert_eq!(second.as_ptr(), ptr_before);
    }

    #[test]
    fn never_hands_out_the_same_buffer_twice_concurrently() {
        let pool = ByteBufferPool::new(PoolConfig { min_class: 64, max_class: 64, per_class_capacity: 8 });
        let a = pool.rent(64);
        let b = pool.rent(64);
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn max_buffer_size_matches_configured_max_class() {
        let pool = ByteBufferPool::new(PoolConfig { min_class: 64, max_class: 4096, per_class_capacity: 8 });
        assert_eq!(pool.max_buffer_size(), 4096);
    }
}
