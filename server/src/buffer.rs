//! Pooled packet buffers.
//!
//! Every inbound payload lives in a [`PooledBuffer`] taken from a
//! [`BufferPool`]. A buffer has exactly one owner at a time; dropping it hands
//! the allocation back to its size class, which can only happen once.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use shared::MAX_PACKET_SIZE;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const SIZE_CLASSES: [usize; 4] = [64, 256, 1024, MAX_PACKET_SIZE];

/// Free allocations kept per size class.
const MAX_FREE_PER_CLASS: usize = 256;

struct PoolInner {
    free: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES.len()],
    outstanding: AtomicUsize,
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
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
                free: std::array::from_fn(|_| Mutex::new(Vec::new())),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    fn class_for(len: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|size| len <= *size)
    }

    /// Copies `bytes` into a buffer from the smallest fitting class.
    /// Payloads larger than every class get a one-off allocation.
    pub fn copy_from(&self, bytes: &[u8]) -> PooledBuffer {
        let class = Self::class_for(bytes.len());
        let mut data = class
            .and_then(|index| self.inner.free[index].lock().pop())
            .unwrap_or_else(|| {
                Vec::with_capacity(class.map(|index| SIZE_CLASSES[index]).unwrap_or(bytes.len()))
            });
        data.clear();
        data.extend_from_slice(bytes);
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            data,
            class,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.inner.free.iter().map(|class| class.lock().len()).sum()
    }
}

pub struct PooledBuffer {
    data: Vec<u8>,
    class: Option<usize>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("class", &self.class)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        if let Some(index) = self.class {
            let mut free = self.pool.free[index].lock();
            if free.len() < MAX_FREE_PER_CLASS {
                free.push(std::mem::take(&mut self.data));
            }
        }
    }
}

/// Cursor over an inbound payload. Owns its buffer.
#[derive(Debug)]
pub struct PacketReader {
    buffer: PooledBuffer,
    position: usize,
}

impl PacketReader {
    pub fn new(buffer: PooledBuffer) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.buffer.get(self.position).copied()?;
        self.position += 1;
        Some(byte)
    }

    pub fn remaining(&self) -> &[u8] {
        &self.buffer[self.position..]
    }

    pub fn is_empty(&self) -> bool {
        self.remaining().is_empty()
    }

    /// Decodes the unread bytes as one message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, bincode::Error> {
        bincode::deserialize(self.remaining())
    }

    /// Returns the buffer to its pool.
    pub fn recycle(self) {
        drop(self);
    }
}
