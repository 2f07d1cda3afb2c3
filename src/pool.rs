//! Pooled relay buffers
//!
//! Relay copy loops churn through 32 KiB buffers; recycling them through a
//! lock-free queue keeps the hot path allocation-free. Buffers are handed
//! out on demand and retained up to the pool capacity on return.

use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

/// Size of one relay buffer.
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Buffers retained across relay operations.
const POOL_CAPACITY: usize = 1024;

/// Process-wide pool shared by every relay direction.
pub static RELAY_POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(POOL_CAPACITY));

/// A buffer checked out of the pool; returns itself on drop.
pub struct Buffer {
    data: Box<[u8]>,
    pool: Arc<PoolInner>,
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = std::mem::replace(&mut self.data, Box::new([]));
        self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
        let _ = self.pool.buffers.push(data);
    }
}

struct PoolInner {
    buffers: ArrayQueue<Box<[u8]>>,
    in_use: AtomicUsize,
}

/// Lock-free pool of fixed-size relay buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: ArrayQueue::new(capacity),
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Check a buffer out of the pool, allocating when it runs dry.
    pub fn acquire(&self) -> Buffer {
        self.inner.in_use.fetch_add(1, Ordering::Relaxed);
        let data = self
            .inner
            .buffers
            .pop()
            .unwrap_or_else(|| vec![0u8; RELAY_BUFFER_SIZE].into_boxed_slice());
        Buffer {
            data,
            pool: self.inner.clone(),
        }
    }

    /// Buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }
}
