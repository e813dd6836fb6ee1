//! Reusable buffers handed between the network, decode and encode threads.
//!
//! A [`PooledBuf`] owns its storage while checked out and gives it back to the
//! pool when dropped, so a buffer cannot be used after it was released.

use log::debug;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Free buffers kept per pool before extras are left to the allocator.
const MAX_IDLE: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: usize,
    pub idle: usize,
    pub outstanding: usize,
}

struct PoolInner<T> {
    name: &'static str,
    min_capacity: usize,
    free: Mutex<Vec<Vec<T>>>,
    allocated: AtomicUsize,
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

impl<T> PoolInner<T> {
    fn give_back(&self, mut storage: Vec<T>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        storage.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_IDLE {
            free.push(storage);
        }
    }
}

pub struct BufferPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Copy + Default> BufferPool<T> {
    pub fn new(name: &'static str, min_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                min_capacity,
                free: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Checks out a zero-filled buffer of exactly `len` elements.
    pub fn checkout(&self, len: usize) -> PooledBuf<T> {
        let reused = {
            let mut free = self.inner.free.lock();
            free.iter()
                .position(|candidate| candidate.capacity() >= len)
                .map(|index| free.swap_remove(index))
        };
        let mut storage = match reused {
            Some(storage) => storage,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::AcqRel);
                Vec::with_capacity(len.max(self.inner.min_capacity))
            }
        };
        storage.resize(len, T::default());
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuf {
            storage: Some(storage),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Checks out a buffer holding a copy of `data`.
    pub fn checkout_from(&self, data: &[T]) -> PooledBuf<T> {
        let mut buf = self.checkout(data.len());
        buf.copy_from_slice(data);
        buf
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.inner.allocated.load(Ordering::Acquire),
            idle: self.inner.free.lock().len(),
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
        }
    }

    /// Drops every idle buffer; buffers still checked out are freed when
    /// their owner releases them.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let dropped = {
            let mut free = self.inner.free.lock();
            let count = free.len();
            free.clear();
            count
        };
        debug!(
            "pool {} closed, {} idle dropped, {} outstanding",
            self.inner.name,
            dropped,
            self.inner.outstanding.load(Ordering::Acquire)
        );
    }
}

/// Buffer checked out of a [`BufferPool`].
pub struct PooledBuf<T> {
    storage: Option<Vec<T>>,
    pool: Arc<PoolInner<T>>,
}

impl<T> PooledBuf<T> {
    /// Returns the buffer to its pool now instead of at end of scope.
    pub fn release(self) {}

    pub fn truncate(&mut self, len: usize) {
        if let Some(storage) = self.storage.as_mut() {
            storage.truncate(len);
        }
    }
}

impl<T> Deref for PooledBuf<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.storage.as_deref().unwrap_or(&[])
    }
}

impl<T> DerefMut for PooledBuf<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.storage.as_deref_mut().unwrap_or(&mut [])
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PooledBuf<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("pool", &self.pool.name)
            .field("data", &self.deref())
            .finish()
    }
}

impl<T> Drop for PooledBuf<T> {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.give_back(storage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferPool, PoolStats};
    use std::thread;

    /// Released buffers are reused instead of allocating again.
    #[test]
    fn released_buffers_are_reused() {
        // Arrange
        let pool: BufferPool<u8> = BufferPool::new("test", 64);
        let first = pool.checkout(32);

        // Act
        first.release();
        let second = pool.checkout(48);

        // Assert
        assert_eq!(second.len(), 48);
        assert_eq!(
            pool.stats(),
            PoolStats {
                allocated: 1,
                idle: 0,
                outstanding: 1,
            }
        );
    }

    /// Reused storage is zero-filled again on checkout.
    #[test]
    fn checkout_clears_previous_contents() {
        let pool: BufferPool<f32> = BufferPool::new("pcm", 8);
        let mut buf = pool.checkout(4);
        buf.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        drop(buf);

        let buf = pool.checkout(4);

        assert_eq!(&buf[..], &[0.0, 0.0, 0.0, 0.0]);
    }

    /// Ownership moves across threads and the buffer comes home on drop.
    #[test]
    fn buffers_return_from_other_threads() {
        // Arrange
        let pool: BufferPool<u8> = BufferPool::new("opus", 16);
        let buf = pool.checkout_from(&[1, 2, 3]);

        // Act
        let sum = thread::spawn(move || buf.iter().map(|b| u32::from(*b)).sum::<u32>())
            .join()
            .expect("worker panicked");

        // Assert
        assert_eq!(sum, 6);
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    /// After close, late releases are dropped rather than pooled.
    #[test]
    fn close_discards_idle_and_late_buffers() {
        // Arrange
        let pool: BufferPool<u8> = BufferPool::new("test", 4);
        let idle = pool.checkout(4);
        let held = pool.checkout(4);
        drop(idle);

        // Act
        pool.close();
        drop(held);

        // Assert
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn truncate_shortens_view() {
        let pool: BufferPool<u8> = BufferPool::new("test", 4);
        let mut buf = pool.checkout_from(&[9, 8, 7, 6]);
        buf.truncate(2);
        assert_eq!(&buf[..], &[9, 8]);
    }
}
