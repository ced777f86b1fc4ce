//! Per-consumer cursor into a shared [`Buffer`]
//!
//! One reader exists per consuming input port. The reader owns its own
//! `total_read` cursor and holds a non-owning back-reference to the shared
//! buffer; the producer outlives all readers within one run because graph
//! wiring guarantees producer lifetime >= consumer lifetime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::buffer::Buffer;
use super::tags::Tag;

/// Cursor state shared between a reader and its parent buffer's
/// space-accounting
pub(crate) struct ReaderShared {
    /// Monotonic count of items this reader has consumed
    pub(crate) total_read: AtomicU64,
    /// Set when the consuming block is permanently done; a detached reader
    /// no longer clamps the producer's writable space
    pub(crate) detached: AtomicBool,
}

/// One consumer's position in a shared buffer
pub struct BufferReader {
    buffer: Arc<Buffer>,
    shared: Arc<ReaderShared>,
}

impl BufferReader {
    pub(crate) fn new(buffer: Arc<Buffer>, shared: Arc<ReaderShared>) -> Self {
        Self { buffer, shared }
    }

    /// The buffer this reader consumes from
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Item size in bytes
    pub fn item_size(&self) -> usize {
        self.buffer.item_size()
    }

    /// Monotonic count of items consumed so far
    pub fn total_items_read(&self) -> u64 {
        self.shared.total_read.load(Ordering::Acquire)
    }

    /// Items written upstream but not yet consumed by this reader
    pub fn items_available(&self) -> usize {
        let written = self.buffer.total_items_written();
        let read = self.shared.total_read.load(Ordering::Relaxed);
        (written - read) as usize
    }

    /// Bytes written upstream but not yet consumed by this reader
    pub fn bytes_available(&self) -> usize {
        self.items_available() * self.buffer.item_size()
    }

    /// Whether the producing block has permanently completed
    pub fn is_finished(&self) -> bool {
        self.buffer.is_finished()
    }

    /// Contiguous view of all currently available bytes
    ///
    /// The double mapping guarantees contiguity for up to the buffer's full
    /// capacity, so no wrap handling is needed here.
    pub fn read_slice(&self) -> &[u8] {
        // Acquire-load availability first: any byte in the returned span was
        // fully written and mirrored before `total_written` was published.
        let avail = self.items_available();
        let read = self.shared.total_read.load(Ordering::Relaxed);
        let offset = (read % self.buffer.capacity() as u64) as usize * self.buffer.item_size();
        // SAFETY: the span covers only published items; the producer never
        // writes physical bytes overlapping an unread span (see
        // `Buffer::write_region`).
        unsafe {
            std::slice::from_raw_parts(
                self.buffer.storage_ptr().add(offset),
                avail * self.buffer.item_size(),
            )
        }
    }

    /// Advance the cursor past `num_items` consumed items
    pub fn post_read(&self, num_items: usize) {
        if num_items == 0 {
            return;
        }
        debug_assert!(
            num_items <= self.items_available(),
            "post_read of {num_items} items exceeds availability"
        );
        self.shared
            .total_read
            .fetch_add(num_items as u64, Ordering::Release);
    }

    /// Snapshot of tags covering the next `window_items` unread items
    pub fn tags_in_window(&self, window_items: usize) -> Vec<Tag> {
        let start = self.shared.total_read.load(Ordering::Relaxed);
        self.buffer.tags_in_range(start, start + window_items as u64)
    }

    /// Permanently withdraw this reader from upstream space accounting
    ///
    /// Called when the consuming block reaches its done state; once every
    /// reader of a buffer has detached, the producer can never deliver
    /// output again and finishes in turn.
    pub(crate) fn detach(&self) {
        self.shared.detached.store(true, Ordering::Release);
    }

    /// Hook invoked when the executor needs more input than is available.
    ///
    /// Returns true if the reader did something about it (e.g., a
    /// compacting buffer variant moved data); the default has no remedy.
    pub fn input_blocked_callback(&self, _items_required: usize) -> bool {
        false
    }
}
