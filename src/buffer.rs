//! Frame buffer management
//!
//! CPU copies of captured frames are drawn from a small reuse pool so a
//! 60 fps producer does not churn multi-megabyte allocations. Backends
//! that hand out their own memory (shared-memory segments, mapped
//! textures) wrap it in a [`SharedSlice`] carrying a release token that
//! runs when the owning frame is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

/// Statistics for the buffer pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub available_buffers: usize,
    pub buffers_created: u64,
    pub buffers_reused: u64,
    pub bytes_pooled: usize,
}

/// Reuse pool for frame-sized byte buffers
pub struct BufferPool {
    buffers: Mutex<VecDeque<Vec<u8>>>,
    max_buffers: usize,
    created: AtomicU64,
    reused: AtomicU64,
}

impl BufferPool {
    pub fn new(max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(VecDeque::new()),
            max_buffers,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        })
    }

    /// Obtain a zero-filled buffer of exactly `size` bytes.
    ///
    /// A pooled buffer is reused when its capacity fits within twice the
    /// request; otherwise a fresh allocation is made.
    pub fn acquire(self: &Arc<Self>, size: usize) -> PooledBuffer {
        let recycled = {
            let mut buffers = self.buffers.lock();
            let position = buffers
                .iter()
                .position(|b| b.capacity() >= size && b.capacity() <= size * 2);
            position.and_then(|i| buffers.remove(i))
        };

        let data = match recycled {
            Some(mut buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(size, 0);
                buf
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                vec![0u8; size]
            }
        };

        PooledBuffer {
            data: Some(data),
            pool: Some(Arc::clone(self)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let buffers = self.buffers.lock();
        PoolStats {
            available_buffers: buffers.len(),
            buffers_created: self.created.load(Ordering::Relaxed),
            buffers_reused: self.reused.load(Ordering::Relaxed),
            bytes_pooled: buffers.iter().map(|b| b.capacity()).sum(),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_buffers {
            buffers.push_back(buf);
        }
    }
}

/// Process-wide pool shared by all backends
pub fn global_pool() -> Arc<BufferPool> {
    static POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();
    // A coordinator keeps at most a handful of frames in flight per round.
    Arc::clone(POOL.get_or_init(|| BufferPool::new(8)))
}

/// A buffer that returns to its pool when dropped
pub struct PooledBuffer {
    data: Option<Vec<u8>>,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBuffer {
    pub fn bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach the buffer from pool management
    pub fn into_vec(mut self) -> Vec<u8> {
        self.pool = None;
        self.data.take().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(pool), Some(data)) = (self.pool.take(), self.data.take()) {
            pool.release(data);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len()).finish()
    }
}

/// An action run exactly once when the owning frame is dropped.
///
/// Backends use this to return memory or acquisition resources that the
/// frame still references; callers never issue raw release calls.
pub struct ReleaseToken(Option<Box<dyn FnOnce() + Send>>);

impl ReleaseToken {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }
}

impl Drop for ReleaseToken {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl fmt::Debug for ReleaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReleaseToken({})", if self.0.is_some() { "armed" } else { "spent" })
    }
}

/// Backend-owned memory referenced by a frame.
///
/// The token must keep the backing storage alive; the pointer is only
/// dereferenced while `self` exists.
pub struct SharedSlice {
    ptr: *const u8,
    len: usize,
    _release: ReleaseToken,
}

// The referenced memory is immutable for the lease's lifetime and the
// release token is Send.
unsafe impl Send for SharedSlice {}

impl SharedSlice {
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid and unwritten until `release` runs.
    pub unsafe fn new(ptr: *const u8, len: usize, release: ReleaseToken) -> Self {
        Self {
            ptr,
            len,
            _release: release,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for SharedSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSlice").field("len", &self.len).finish()
    }
}

/// Pixel storage of one captured frame
#[derive(Debug)]
pub enum FrameBuffer {
    /// Heap buffer owned by the frame
    Owned(Vec<u8>),
    /// Buffer borrowed from the reuse pool, returned on drop
    Pooled(PooledBuffer),
    /// Backend-owned memory with a release token invoked on drop
    Shared(SharedSlice),
}

impl FrameBuffer {
    pub fn bytes(&self) -> &[u8] {
        match self {
            FrameBuffer::Owned(v) => v,
            FrameBuffer::Pooled(b) => b.bytes(),
            FrameBuffer::Shared(s) => s.bytes(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FrameBuffer::Owned(v) => v.len(),
            FrameBuffer::Pooled(b) => b.len(),
            FrameBuffer::Shared(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for FrameBuffer {
    fn from(v: Vec<u8>) -> Self {
        FrameBuffer::Owned(v)
    }
}

impl From<PooledBuffer> for FrameBuffer {
    fn from(b: PooledBuffer) -> Self {
        FrameBuffer::Pooled(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_pool_reuses_buffers() {
        let pool = BufferPool::new(4);

        let buf = pool.acquire(4096);
        assert_eq!(buf.len(), 4096);
        drop(buf);

        let buf = pool.acquire(4096);
        drop(buf);

        let stats = pool.stats();
        assert_eq!(stats.buffers_created, 1);
        assert_eq!(stats.buffers_reused, 1);
        assert_eq!(stats.available_buffers, 1);
    }

    #[test]
    fn test_pool_respects_capacity() {
        let pool = BufferPool::new(1);
        let a = pool.acquire(128);
        let b = pool.acquire(128);
        drop(a);
        drop(b);
        assert_eq!(pool.stats().available_buffers, 1);
    }

    #[test]
    fn test_into_vec_detaches_from_pool() {
        let pool = BufferPool::new(4);
        let buf = pool.acquire(64);
        let v = buf.into_vec();
        assert_eq!(v.len(), 64);
        assert_eq!(pool.stats().available_buffers, 0);
    }

    #[test]
    fn test_release_token_runs_once_on_drop() {
        static RAN: AtomicBool = AtomicBool::new(false);
        let token = ReleaseToken::new(|| {
            assert!(!RAN.swap(true, Ordering::SeqCst));
        });
        drop(token);
        assert!(RAN.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shared_slice_releases_backing() {
        let released = Arc::new(AtomicBool::new(false));
        let backing = vec![7u8; 16];
        let ptr = backing.as_ptr();

        let flag = Arc::clone(&released);
        let token = ReleaseToken::new(move || {
            flag.store(true, Ordering::SeqCst);
            drop(backing);
        });

        let slice = unsafe { SharedSlice::new(ptr, 16, token) };
        assert_eq!(slice.bytes()[0], 7);
        drop(slice);
        assert!(released.load(Ordering::SeqCst));
    }
}
