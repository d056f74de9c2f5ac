//! Scoped scratch-buffer pool
//!
//! Sector and block engines need short-lived byte scratch on every request.
//! Buffers are acquired from a pool and returned by the guard's `Drop`, so
//! they come back on every exit path including failure.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

const MAX_POOLED: usize = 8;

/// A small pool of reusable byte buffers
#[derive(Clone, Default)]
pub struct BytePool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BytePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a zeroed buffer of exactly `len` bytes
    pub fn acquire(&self, len: usize) -> PoolBuf {
        let mut buf = {
            let mut free = self.free.lock().expect("byte pool poisoned");
            free.pop().unwrap_or_default()
        };
        buf.clear();
        buf.resize(len, 0);
        PoolBuf {
            buf,
            free: Arc::clone(&self.free),
        }
    }
}

/// A pooled buffer; returns itself to the pool on drop
pub struct PoolBuf {
    buf: Vec<u8>,
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < MAX_POOLED {
                free.push(std::mem::take(&mut self.buf));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_zeroed() {
        let pool = BytePool::new();
        {
            let mut buf = pool.acquire(8);
            buf.copy_from_slice(&[0xFF; 8]);
        }
        // Reused buffer must come back zeroed at the requested length
        let buf = pool.acquire(16);
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_buffer_returns_on_drop() {
        let pool = BytePool::new();
        {
            let _a = pool.acquire(32);
        }
        assert_eq!(pool.free.lock().unwrap().len(), 1);
        {
            let _a = pool.acquire(32);
            assert_eq!(pool.free.lock().unwrap().len(), 0);
        }
        assert_eq!(pool.free.lock().unwrap().len(), 1);
    }
}
