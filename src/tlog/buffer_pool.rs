//! Reusable encoding buffers.
//!
//! A [`PooledBuffer`] is checked out for the duration of one encode/append
//! and goes back to the pool when dropped, on error paths too. Buffers that
//! grew past `max_retained_capacity` are dropped instead of pooled.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    initial_capacity: usize,
    max_retained_capacity: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(initial_capacity: usize, max_retained_capacity: usize, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            initial_capacity,
            max_retained_capacity,
            max_idle,
        }
    }

    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity));
        PooledBuffer { pool: self, buf }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_retained_capacity {
            return;
        }
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(4 * 1024, 1024 * 1024, 4)
    }
}

pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}
