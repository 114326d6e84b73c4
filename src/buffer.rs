//! Fixed-size frame buffers drawn from per-card pools.
//!
//! A [`Buf`] goes back to its pool when dropped, so every path that
//! discards a frame (an unhandled event, a flushed queue, a transmit
//! completion) releases it without bookkeeping.
use anyhow::{Error, Result};
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct BufPool {
    name: String,
    size: usize,
    count: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufPool {
    /// Create a pool of `count` buffers of `size` bytes each.
    #[must_use]
    pub fn new(name: &str, count: usize, size: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            size,
            count,
            free: Mutex::new((0..count).map(|_| Vec::with_capacity(size)).collect()),
        })
    }

    fn free_list(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a buffer, or None if the pool is exhausted.
    pub fn get(self: &Arc<Self>, tag: &'static str) -> Option<Buf> {
        let data = self.free_list().pop();
        match data {
            Some(data) => {
                trace!("{}: get {tag}", self.name);
                Some(Buf {
                    data,
                    offset: 0,
                    tag,
                    pool: Arc::clone(self),
                })
            }
            None => {
                debug!("{}: exhausted, no buffer for {tag}", self.name);
                None
            }
        }
    }

    /// Take a buffer and fill it.
    pub fn get_with(self: &Arc<Self>, tag: &'static str, bytes: &[u8]) -> Option<Buf> {
        let mut buf = self.get(tag)?;
        match buf.put(bytes) {
            Ok(()) => Some(buf),
            Err(e) => {
                debug!("{}: {e}", self.name);
                None
            }
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free_list().len()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// A pooled buffer.
///
/// The readable contents start at an offset so that lower-layer headers can
/// be stripped in place with [`Buf::pull`].
pub struct Buf {
    data: Vec<u8>,
    offset: usize,
    tag: &'static str,
    pool: Arc<BufPool>,
}

impl Buf {
    /// Append bytes. Fails if the buffer would outgrow the pool's size.
    pub fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.data.len() + bytes.len() > self.pool.size {
            return Err(Error::msg(format!(
                "buffer {} overflow: {} + {} > {}",
                self.tag,
                self.data.len(),
                bytes.len(),
                self.pool.size
            )));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Strip `n` bytes of header from the front.
    pub fn pull(&mut self, n: usize) -> Result<()> {
        if self.offset + n > self.data.len() {
            return Err(Error::msg(format!(
                "buffer {}: can't strip {n} of {} bytes",
                self.tag,
                self.len()
            )));
        }
        self.offset += n;
        Ok(())
    }

    #[must_use]
    pub fn tag(&self) -> &'static str {
        self.tag
    }
}

impl std::ops::Deref for Buf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

impl std::fmt::Debug for Buf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buf({}, {:02x?})", self.tag, &self[..])
    }
}

impl PartialEq for Buf {
    fn eq(&self, other: &Self) -> bool {
        self[..] == other[..]
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        data.clear();
        trace!("{}: release {}", self.pool.name, self.tag);
        self.pool.free_list().push(data);
    }
}

/// FIFO of buffers.
#[derive(Debug, Default)]
pub struct BufQueue {
    q: VecDeque<Buf>,
}

impl BufQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    pub fn link(&mut self, buf: Buf) {
        self.q.push_back(buf);
    }
    pub fn link_front(&mut self, buf: Buf) {
        self.q.push_front(buf);
    }
    pub fn unlink(&mut self) -> Option<Buf> {
        self.q.pop_front()
    }
    /// Drop every queued buffer back into its pool.
    pub fn discard(&mut self) {
        self.q.clear();
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.q.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}
