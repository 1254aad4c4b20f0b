use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Size classes for pooled buffers. Anything larger is allocated directly.
const BUCKET_SIZES: [usize; 4] = [1024, 16 * 1024, 256 * 1024, 4 * 1024 * 1024];

/// How many buffers each size class retains.
const BUCKET_SLOTS: usize = 64;

/// A bucketed pool of reusable byte buffers.
///
/// Buffers are grouped into size classes with one lock per class, so
/// concurrent sessions mostly contend on different buckets. Acquired buffers
/// come back cleared; releasing a buffer that no class fits simply drops it.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buckets: [Bucket; 4],
    total_acquired: AtomicU64,
    total_allocated: AtomicU64,
    total_released: AtomicU64,
}

#[derive(Debug)]
struct Bucket {
    size: usize,
    slots: Mutex<Vec<Vec<u8>>>,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub total_acquired: u64,
    pub total_allocated: u64,
    pub total_released: u64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buckets: BUCKET_SIZES.map(|size| Bucket {
                    size,
                    slots: Mutex::new(Vec::new()),
                }),
                total_acquired: AtomicU64::new(0),
                total_allocated: AtomicU64::new(0),
                total_released: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a cleared buffer with at least `capacity` bytes of room.
    pub fn acquire(&self, capacity: usize) -> Vec<u8> {
        self.inner.total_acquired.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.inner.buckets {
            if bucket.size >= capacity {
                let mut slots = bucket.slots.lock().unwrap();
                if let Some(mut buf) = slots.pop() {
                    buf.clear();
                    return buf;
                }
                drop(slots);
                self.inner.total_allocated.fetch_add(1, Ordering::Relaxed);
                return Vec::with_capacity(bucket.size);
            }
        }
        // Oversized request: allocate exactly, never pooled on release
        self.inner.total_allocated.fetch_add(1, Ordering::Relaxed);
        Vec::with_capacity(capacity)
    }

    /// Return a buffer to its size class.
    pub fn release(&self, mut buffer: Vec<u8>) {
        self.inner.total_released.fetch_add(1, Ordering::Relaxed);
        // Largest class the buffer can serve
        let mut target = None;
        for bucket in &self.inner.buckets {
            if buffer.capacity() >= bucket.size {
                target = Some(bucket);
            }
        }
        if let Some(bucket) = target {
            let mut slots = bucket.slots.lock().unwrap();
            if slots.len() < BUCKET_SLOTS {
                buffer.clear();
                slots.push(buffer);
            }
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            total_acquired: self.inner.total_acquired.load(Ordering::Relaxed),
            total_allocated: self.inner.total_allocated.load(Ordering::Relaxed),
            total_released: self.inner.total_released.load(Ordering::Relaxed),
        }
    }

    /// Percentage of acquires served without a fresh allocation.
    pub fn hit_rate(&self) -> f64 {
        let m = self.metrics();
        if m.total_acquired == 0 {
            return 0.0;
        }
        let hits = m.total_acquired - m.total_allocated;
        (hits as f64 / m.total_acquired as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuse() {
        let pool = BufferPool::new();

        let mut buf = pool.acquire(512);
        assert!(buf.capacity() >= 512);
        buf.extend_from_slice(&[1, 2, 3]);
        pool.release(buf);

        let buf2 = pool.acquire(512);
        assert_eq!(buf2.len(), 0);

        let m = pool.metrics();
        assert_eq!(m.total_acquired, 2);
        assert_eq!(m.total_allocated, 1);
        assert_eq!(m.total_released, 1);
    }

    #[test]
    fn test_size_classes() {
        let pool = BufferPool::new();
        let small = pool.acquire(100);
        let large = pool.acquire(100_000);
        assert!(small.capacity() >= 100);
        assert!(large.capacity() >= 100_000);
        pool.release(small);
        pool.release(large);

        // The small class buffer comes back for a small request
        let again = pool.acquire(100);
        assert!(again.capacity() >= 100);
        assert_eq!(pool.metrics().total_allocated, 2);
    }

    #[test]
    fn test_oversized_not_pooled() {
        let pool = BufferPool::new();
        let huge = pool.acquire(32 * 1024 * 1024);
        assert!(huge.capacity() >= 32 * 1024 * 1024);
        pool.release(huge);
        // Next oversized acquire allocates again
        let _huge2 = pool.acquire(32 * 1024 * 1024);
        assert_eq!(pool.metrics().total_allocated, 2);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let pool = BufferPool::new();
        let mut handles = vec![];
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let buf = pool.acquire(2048);
                    pool.release(buf);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let m = pool.metrics();
        assert_eq!(m.total_acquired, 1600);
        assert_eq!(m.total_released, 1600);
    }
}
