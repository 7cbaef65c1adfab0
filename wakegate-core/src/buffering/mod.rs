//! Fixed-capacity byte ring with one writer and N independent readers.
//!
//! The writer is the first-stage engine's buffering loop. Readers trail it at
//! their own positions: one per second-stage verifier, one for the client's
//! lab capture.
//!
//! ## Locking
//!
//! The buffer lock guards storage, the write offset and the reader list. Each
//! reader cursor has its own small lock. The order is always buffer, then
//! cursor. Readers keep only a [`Weak`] handle back to the buffer and the buffer
//! keeps only [`Weak`] handles to reader cursors, so dropping a reader never
//! needs the buffer lock.
//!
//! ## Free space
//!
//! `free_size = capacity - max(unread of enabled readers)`. A write never
//! overwrites bytes an enabled reader has not consumed; it is truncated
//! instead, and the caller checks the returned count.

pub mod format;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Result, WakegateError};

/// Reader participation in the free-space calculation and in reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Disabled,
    Enabled,
}

#[derive(Debug)]
struct Cursor {
    read_offset: usize,
    unread: usize,
    state: ReaderState,
}

struct Inner {
    data: Vec<u8>,
    write_offset: usize,
    start_index: usize,
    end_index: usize,
    readers: Vec<Weak<Mutex<Cursor>>>,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn free_size(&self) -> usize {
        let max_unread = self
            .readers
            .iter()
            .filter_map(Weak::upgrade)
            .map(|c| {
                let c = c.lock();
                if c.state == ReaderState::Enabled {
                    c.unread
                } else {
                    0
                }
            })
            .max()
            .unwrap_or(0);
        self.capacity().saturating_sub(max_unread)
    }

    fn copy_in(&mut self, bytes: &[u8]) {
        let cap = self.capacity();
        let first = bytes.len().min(cap - self.write_offset);
        let wo = self.write_offset;
        self.data[wo..wo + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&bytes[first..]);
        }
        self.write_offset = (wo + bytes.len()) % cap;
    }

    fn copy_out(&self, from: usize, out: &mut [u8]) {
        let cap = self.capacity();
        let first = out.len().min(cap - from);
        out[..first].copy_from_slice(&self.data[from..from + first]);
        let rest = out.len() - first;
        if rest > 0 {
            out[first..].copy_from_slice(&self.data[..rest]);
        }
    }
}

/// Streaming ring buffer shared between the first-stage writer and readers.
pub struct RingBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: vec![0; capacity],
                write_offset: 0,
                start_index: 0,
                end_index: 0,
                readers: Vec::new(),
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn write_offset(&self) -> usize {
        self.inner.lock().write_offset
    }

    /// `capacity - max(unread)` over enabled readers.
    pub fn free_size(&self) -> usize {
        self.inner.lock().free_size()
    }

    /// Copies up to `min(bytes.len(), free_size)` bytes in, wrapping at the
    /// end of storage. Returns the number of bytes written.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        inner.readers.retain(|r| r.strong_count() > 0);
        let cap = inner.capacity();
        if cap == 0 {
            return 0;
        }

        let written = bytes.len().min(inner.free_size());
        if written < bytes.len() {
            trace!(requested = bytes.len(), written, "ring buffer write truncated");
        }
        if written == 0 {
            return 0;
        }
        inner.copy_in(&bytes[..written]);

        let write_offset = inner.write_offset;
        for reader in inner.readers.iter().filter_map(Weak::upgrade) {
            let mut c = reader.lock();
            c.unread += written;
            // Only a disabled reader can fall a full lap behind.
            if c.unread > cap {
                c.unread = cap;
                c.read_offset = write_offset;
            }
        }
        written
    }

    /// Registers a new reader. It starts disabled, positioned at the current
    /// write offset with nothing unread.
    pub fn new_reader(&self) -> RingBufferReader {
        let mut inner = self.inner.lock();
        let cursor = Arc::new(Mutex::new(Cursor {
            read_offset: inner.write_offset,
            unread: 0,
            state: ReaderState::Disabled,
        }));
        inner.readers.push(Arc::downgrade(&cursor));
        RingBufferReader {
            buffer: Arc::downgrade(&self.inner),
            cursor,
        }
    }

    /// Detaches `reader` from the fan-out list. Must not be called while the
    /// caller holds a reader operation in progress on the same thread.
    pub fn remove_reader(&self, reader: &RingBufferReader) {
        let mut inner = self.inner.lock();
        inner.readers.retain(|r| match r.upgrade() {
            Some(c) => !Arc::ptr_eq(&c, &reader.cursor),
            None => false,
        });
    }

    pub fn reader_count(&self) -> usize {
        self.inner
            .lock()
            .readers
            .iter()
            .filter(|r| r.strong_count() > 0)
            .count()
    }

    /// Rewinds the write offset to zero and resets every reader to disabled
    /// with nothing unread. Keyword indices are cleared.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.write_offset = 0;
        inner.start_index = 0;
        inner.end_index = 0;
        for reader in inner.readers.iter().filter_map(Weak::upgrade) {
            let mut c = reader.lock();
            c.read_offset = 0;
            c.unread = 0;
            c.state = ReaderState::Disabled;
        }
        debug!(capacity = inner.capacity(), "ring buffer reset");
    }

    /// Reallocates storage. Refused while any reader still holds unread data.
    pub fn resize(&self, capacity: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.capacity() == capacity {
            return Ok(());
        }
        let live = inner
            .readers
            .iter()
            .filter_map(Weak::upgrade)
            .any(|c| c.lock().unread > 0);
        if live {
            warn!(from = inner.capacity(), to = capacity, "resize refused, readers hold unread data");
            return Err(WakegateError::invalid_state("resize", "readers hold unread data"));
        }
        inner.data = vec![0; capacity];
        inner.write_offset = 0;
        for reader in inner.readers.iter().filter_map(Weak::upgrade) {
            reader.lock().read_offset = 0;
        }
        debug!(capacity, "ring buffer resized");
        Ok(())
    }

    /// Records the keyword start/end byte offsets relative to the write
    /// stream since the last reset.
    pub fn update_indices(&self, start: usize, end: usize) {
        let mut inner = self.inner.lock();
        inner.start_index = start;
        inner.end_index = end;
    }

    pub fn indices(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.start_index, inner.end_index)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &inner.capacity())
            .field("write_offset", &inner.write_offset)
            .field("readers", &inner.readers.len())
            .finish()
    }
}

/// An independent read cursor into one [`RingBuffer`].
pub struct RingBufferReader {
    buffer: Weak<Mutex<Inner>>,
    cursor: Arc<Mutex<Cursor>>,
}

impl RingBufferReader {
    fn buffer(&self) -> Result<Arc<Mutex<Inner>>> {
        self.buffer
            .upgrade()
            .ok_or_else(|| WakegateError::invalid_state("reader access", "ring buffer released"))
    }

    /// Copies up to `out.len()` unread bytes. Returns `Ok(0)` when nothing is
    /// unread and [`WakegateError::ReaderDisabled`] for a disabled reader.
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        let buffer = self.buffer()?;
        let inner = buffer.lock();
        let mut c = self.cursor.lock();
        if c.state == ReaderState::Disabled {
            return Err(WakegateError::ReaderDisabled);
        }
        let n = out.len().min(c.unread);
        if n == 0 {
            return Ok(0);
        }
        inner.copy_out(c.read_offset, &mut out[..n]);
        c.read_offset = (c.read_offset + n) % inner.capacity();
        c.unread -= n;
        Ok(n)
    }

    /// Discards `n` unread bytes without copying them out.
    pub fn advance_read_offset(&self, n: usize) -> Result<()> {
        let buffer = self.buffer()?;
        let inner = buffer.lock();
        let mut c = self.cursor.lock();
        if n > c.unread {
            return Err(WakegateError::InsufficientUnread {
                requested: n,
                available: c.unread,
            });
        }
        let cap = inner.capacity();
        if cap > 0 {
            c.read_offset = (c.read_offset + n) % cap;
        }
        c.unread -= n;
        Ok(())
    }

    /// Enabling places the cursor `unread` bytes behind the current write
    /// offset, clamped to one buffer length.
    pub fn set_state(&self, state: ReaderState) {
        let Ok(buffer) = self.buffer() else {
            self.cursor.lock().state = state;
            return;
        };
        let inner = buffer.lock();
        let mut c = self.cursor.lock();
        if state == ReaderState::Enabled && c.state == ReaderState::Disabled {
            let cap = inner.capacity();
            c.unread = c.unread.min(cap);
            c.read_offset = if cap == 0 {
                0
            } else {
                (inner.write_offset + cap - c.unread) % cap
            };
        }
        c.state = state;
    }

    pub fn enable(&self) {
        self.set_state(ReaderState::Enabled);
    }

    pub fn disable(&self) {
        self.set_state(ReaderState::Disabled);
    }

    /// Moves the cursor to the write offset, drops unread data and disables.
    pub fn reset(&self) {
        match self.buffer() {
            Ok(buffer) => {
                let inner = buffer.lock();
                let mut c = self.cursor.lock();
                c.read_offset = inner.write_offset;
                c.unread = 0;
                c.state = ReaderState::Disabled;
            }
            Err(_) => {
                let mut c = self.cursor.lock();
                c.unread = 0;
                c.state = ReaderState::Disabled;
            }
        }
    }

    pub fn unread_size(&self) -> usize {
        self.cursor.lock().unread
    }

    pub fn read_offset(&self) -> usize {
        self.cursor.lock().read_offset
    }

    pub fn state(&self) -> ReaderState {
        self.cursor.lock().state
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == ReaderState::Enabled
    }

    /// Keyword indices last recorded on the owning buffer.
    pub fn indices(&self) -> (usize, usize) {
        match self.buffer() {
            Ok(buffer) => {
                let inner = buffer.lock();
                (inner.start_index, inner.end_index)
            }
            Err(_) => (0, 0),
        }
    }
}

impl std::fmt::Debug for RingBufferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.cursor.lock();
        f.debug_struct("RingBufferReader")
            .field("read_offset", &c.read_offset)
            .field("unread", &c.unread)
            .field("state", &c.state)
            .finish()
    }
}
