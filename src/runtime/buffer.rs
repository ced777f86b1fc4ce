//! Double-mapped circular buffer shared by one producer and N consumers
//!
//! The buffer owns `2 × capacity` physical bytes: the second half mirrors
//! the first, so any contiguous read or write of up to `capacity` bytes can
//! be addressed with a single slice, with no wrap arithmetic in the hot
//! path. The mirror is maintained by copying freshly written bytes into the
//! opposite half on every `post_write`, the portable alternative to mmap
//! aliasing.
//!
//! Counters are in items, not bytes. `total_written` is monotonic and
//! Release-published after the mirror copy, so a consumer that Acquire-loads
//! it observes fully written, fully mirrored data.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::reader::{BufferReader, ReaderShared};
use super::tags::Tag;

/// Cache-line alignment for the backing storage, so typed views of any
/// primitive item size are always well aligned.
const STORAGE_ALIGN: usize = 64;

/// Raw aligned allocation backing a buffer (2 × capacity bytes, zeroed)
struct AlignedStorage {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedStorage {
    fn zeroed(len: usize) -> Self {
        assert!(len > 0, "buffer storage must be non-empty");
        let layout = Layout::from_size_align(len, STORAGE_ALIGN)
            .expect("buffer size overflows the allocator layout");
        // Allocation failure is fatal at graph start.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Self { ptr, len }
    }
}

impl Drop for AlignedStorage {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, STORAGE_ALIGN).unwrap();
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

/// Growable-by-recreation circular byte arena with one writer and N readers
///
/// Created once per producing output port when the graph is finalized; not
/// resizable after allocation. All cross-thread data flow in the runtime
/// goes through cursor advancement on these buffers.
pub struct Buffer {
    storage: AlignedStorage,
    /// Logical capacity in items
    capacity: usize,
    item_size: usize,
    /// Monotonic count of items ever written (Release-published)
    total_written: AtomicU64,
    /// One entry per attached reader; readers are attached before the graph
    /// starts, so this lock is uncontended at runtime (producer-only).
    readers: Mutex<Vec<Arc<ReaderShared>>>,
    /// Tags attached by the producer, keyed by absolute item offset
    tags: Mutex<Vec<Tag>>,
    /// Upstream-done marker, set when the producing block reaches DONE
    finished: AtomicBool,
}

// SAFETY: the raw storage is shared across threads, but the producer only
// writes physical regions that no reader is allowed to observe yet (see the
// region-disjointness argument on `write_region`), and all cursor state is
// atomic or mutex-guarded.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocate a buffer holding `capacity` items of `item_size` bytes each
    pub fn new(capacity: usize, item_size: usize) -> Self {
        assert!(item_size > 0, "item size must be non-zero");
        assert!(capacity > 0, "buffer capacity must be non-zero");
        let bytes = capacity
            .checked_mul(item_size)
            .and_then(|b| b.checked_mul(2))
            .expect("buffer size overflows usize");
        Self {
            storage: AlignedStorage::zeroed(bytes),
            capacity,
            item_size,
            total_written: AtomicU64::new(0),
            readers: Mutex::new(Vec::new()),
            tags: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    /// Item size in bytes
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Logical capacity in items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Monotonic count of items written so far
    pub fn total_items_written(&self) -> u64 {
        self.total_written.load(Ordering::Acquire)
    }

    /// Slowest attached reader's absolute position, or `total_written` when
    /// no reader is attached
    fn min_items_read(&self) -> u64 {
        let readers = self.readers.lock().unwrap();
        readers
            .iter()
            .filter(|r| !r.detached.load(Ordering::Acquire))
            .map(|r| r.total_read.load(Ordering::Acquire))
            .min()
            .unwrap_or_else(|| self.total_written.load(Ordering::Relaxed))
    }

    /// Whether any attached reader is still consuming
    pub fn has_active_readers(&self) -> bool {
        self.readers
            .lock()
            .unwrap()
            .iter()
            .any(|r| !r.detached.load(Ordering::Acquire))
    }

    /// Items the producer may write without overrunning the slowest reader
    ///
    /// Zero space is a stall condition, never an error; the scheduler
    /// retries on a later pass.
    pub fn space_available(&self) -> usize {
        let written = self.total_written.load(Ordering::Relaxed);
        let behind = written - self.min_items_read();
        self.capacity - behind as usize
    }

    /// Pointer to the write cursor in the first mapping
    ///
    /// Up to `space_available()` items may be written contiguously starting
    /// here; the mirror half guarantees no wrap handling is needed.
    ///
    /// # Safety
    ///
    /// Only the single producing executor may write through this pointer,
    /// and only within `space_available()` items, before calling
    /// [`post_write`](Self::post_write). Disjointness from concurrent reads
    /// holds because every reader's unread span plus the writable span
    /// totals at most `capacity` items, so their physical byte ranges
    /// (taken mod capacity, in either mapping) never overlap.
    pub unsafe fn write_region(&self) -> *mut u8 {
        let written = self.total_written.load(Ordering::Relaxed);
        let offset = (written % self.capacity as u64) as usize * self.item_size;
        unsafe { self.storage.ptr.as_ptr().add(offset) }
    }

    /// Base pointer of the physical storage (both mappings)
    pub(crate) fn storage_ptr(&self) -> *const u8 {
        self.storage.ptr.as_ptr()
    }

    /// Commit `num_items` freshly written items
    ///
    /// Copies the new region into the mirror half, then Release-publishes
    /// the advanced `total_written` counter, and prunes tags every reader
    /// has already passed.
    pub fn post_write(&self, num_items: usize) {
        if num_items == 0 {
            return;
        }
        debug_assert!(
            num_items <= self.space_available(),
            "post_write of {num_items} items exceeds available space"
        );
        let cap_bytes = self.capacity * self.item_size;
        let written = self.total_written.load(Ordering::Relaxed);
        let start = (written % self.capacity as u64) as usize * self.item_size;
        let len = num_items * self.item_size;
        let end = start + len;

        // Mirror the new bytes into the opposite half. The region may span
        // the wrap point, in which case it splits into two chunks: primary
        // bytes below `cap_bytes` mirror upward, bytes at or above mirror
        // downward. Source and destination are `cap_bytes` apart and each
        // chunk is at most `cap_bytes` long, so the copies never overlap.
        let base = self.storage.ptr.as_ptr();
        unsafe {
            let first = end.min(cap_bytes).saturating_sub(start);
            if first > 0 {
                ptr::copy_nonoverlapping(base.add(start), base.add(start + cap_bytes), first);
            }
            if end > cap_bytes {
                ptr::copy_nonoverlapping(base.add(cap_bytes), base, end - cap_bytes);
            }
        }

        self.total_written
            .store(written + num_items as u64, Ordering::Release);

        let min_read = self.min_items_read();
        let mut tags = self.tags.lock().unwrap();
        tags.retain(|t| t.offset >= min_read);
    }

    /// Attach a new reader starting at the current write position
    ///
    /// Readers see only data written after they attach; history is not
    /// replayed. Attach all readers before the graph starts running.
    pub fn add_reader(self: &Arc<Self>) -> BufferReader {
        let shared = Arc::new(ReaderShared {
            total_read: AtomicU64::new(self.total_written.load(Ordering::Acquire)),
            detached: AtomicBool::new(false),
        });
        self.readers.lock().unwrap().push(Arc::clone(&shared));
        BufferReader::new(Arc::clone(self), shared)
    }

    /// Attach a tag at an absolute item offset
    pub fn add_tag(&self, tag: Tag) {
        self.tags.lock().unwrap().push(tag);
    }

    /// Snapshot of tags with offsets in `[start, end)` (absolute items)
    pub fn tags_in_range(&self, start: u64, end: u64) -> Vec<Tag> {
        let tags = self.tags.lock().unwrap();
        tags.iter()
            .filter(|t| t.offset >= start && t.offset < end)
            .cloned()
            .collect()
    }

    /// Mark the producing block as permanently done
    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Whether the producing block has signaled permanent completion
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tags::TagValue;
    use proptest::prelude::*;

    // Write `vals` through the producer API, as the executor would.
    fn write_items(buf: &Buffer, vals: &[u8]) {
        assert!(vals.len() <= buf.space_available());
        unsafe {
            let dst = buf.write_region();
            ptr::copy_nonoverlapping(vals.as_ptr(), dst, vals.len());
        }
        buf.post_write(vals.len());
    }

    #[test]
    fn test_space_accounting_single_reader() {
        let buf = Arc::new(Buffer::new(8, 1));
        let reader = buf.add_reader();

        assert_eq!(buf.space_available(), 8);
        write_items(&buf, &[1, 2, 3]);
        assert_eq!(buf.space_available(), 5);
        assert_eq!(reader.items_available(), 3);

        reader.post_read(3);
        assert_eq!(buf.space_available(), 8);
    }

    #[test]
    fn test_round_trip_identity_across_wrap() {
        let buf = Arc::new(Buffer::new(8, 1));
        let reader = buf.add_reader();

        let mut produced = Vec::new();
        let mut observed = Vec::new();
        let mut next = 0u8;

        // Interleave writes and reads so the cursor wraps several times.
        for round in 0..50 {
            let n = (round % 5) + 1;
            let n = n.min(buf.space_available());
            let chunk: Vec<u8> = (0..n).map(|_| {
                let v = next;
                next = next.wrapping_add(1);
                v
            }).collect();
            produced.extend_from_slice(&chunk);
            write_items(&buf, &chunk);

            let avail = reader.items_available();
            observed.extend_from_slice(&reader.read_slice()[..avail]);
            reader.post_read(avail);
        }

        assert_eq!(observed, produced);
    }

    #[test]
    fn test_mirror_gives_contiguous_read_across_wrap() {
        let buf = Arc::new(Buffer::new(4, 1));
        let reader = buf.add_reader();

        write_items(&buf, &[10, 11, 12]);
        reader.post_read(2);
        // This write wraps: one byte at index 3, two at indices 0..2.
        write_items(&buf, &[13, 14, 15]);

        // The reader sees 12..=15 as one contiguous slice.
        assert_eq!(reader.items_available(), 4);
        assert_eq!(&reader.read_slice()[..4], &[12, 13, 14, 15]);
    }

    #[test]
    fn test_reader_attaches_at_current_position() {
        let buf = Arc::new(Buffer::new(8, 1));
        let early = buf.add_reader();
        write_items(&buf, &[1, 2, 3]);

        let late = buf.add_reader();
        assert_eq!(early.items_available(), 3);
        assert_eq!(late.items_available(), 0);

        write_items(&buf, &[4]);
        assert_eq!(late.items_available(), 1);
        assert_eq!(late.read_slice()[0], 4);
    }

    #[test]
    fn test_multi_reader_fanout_sees_identical_bytes() {
        let buf = Arc::new(Buffer::new(8, 1));
        let fast = buf.add_reader();
        let slow = buf.add_reader();

        let data: Vec<u8> = (0..40).collect();
        let mut fast_seen = Vec::new();
        let mut slow_seen = Vec::new();
        let mut cursor = 0;

        while slow_seen.len() < data.len() {
            let n = buf.space_available().min(data.len() - cursor);
            if n > 0 {
                write_items(&buf, &data[cursor..cursor + n]);
                cursor += n;
            }
            // Fast reader drains everything, slow reader takes one item.
            let f = fast.items_available();
            fast_seen.extend_from_slice(&fast.read_slice()[..f]);
            fast.post_read(f);

            let s = slow.items_available().min(1);
            slow_seen.extend_from_slice(&slow.read_slice()[..s]);
            slow.post_read(s);
        }

        assert_eq!(fast_seen, data);
        assert_eq!(slow_seen, data);
    }

    #[test]
    fn test_space_clamped_by_slowest_reader() {
        let buf = Arc::new(Buffer::new(4, 1));
        let fast = buf.add_reader();
        let slow = buf.add_reader();

        write_items(&buf, &[1, 2, 3, 4]);
        fast.post_read(4);
        slow.post_read(1);

        // Only what the slow reader has released is writable.
        assert_eq!(buf.space_available(), 1);
    }

    #[test]
    fn test_detached_reader_stops_clamping_space() {
        let buf = Arc::new(Buffer::new(4, 1));
        let fast = buf.add_reader();
        let slow = buf.add_reader();

        write_items(&buf, &[1, 2, 3, 4]);
        fast.post_read(4);
        assert_eq!(buf.space_available(), 0);

        slow.detach();
        assert_eq!(buf.space_available(), 4);
        assert!(buf.has_active_readers());

        fast.detach();
        assert!(!buf.has_active_readers());
    }

    #[test]
    fn test_tags_pruned_after_all_readers_pass() {
        let buf = Arc::new(Buffer::new(8, 1));
        let reader = buf.add_reader();

        buf.add_tag(Tag::new(0, "start", TagValue::Bool(true)));
        write_items(&buf, &[1, 2]);
        assert_eq!(buf.tags_in_range(0, 2).len(), 1);

        reader.post_read(2);
        write_items(&buf, &[3]);
        assert!(buf.tags_in_range(0, 3).is_empty());
    }

    #[test]
    fn test_larger_item_size() {
        let buf = Arc::new(Buffer::new(4, 4));
        let reader = buf.add_reader();

        let vals: [i32; 3] = [-1, 7, 40];
        unsafe {
            let dst = buf.write_region().cast::<i32>();
            ptr::copy_nonoverlapping(vals.as_ptr(), dst, vals.len());
        }
        buf.post_write(3);

        assert_eq!(reader.items_available(), 3);
        let bytes = reader.read_slice();
        let seen = unsafe {
            std::slice::from_raw_parts(bytes.as_ptr().cast::<i32>(), 3)
        };
        assert_eq!(seen, &vals);
    }

    proptest! {
        // No-overrun property: for any interleaving of writes and reads
        // that respects availability, total_read never exceeds
        // total_written, and the write cursor never passes the slowest
        // reader by more than the capacity.
        #[test]
        fn prop_no_overrun(ops in proptest::collection::vec((any::<bool>(), 1usize..6), 1..200)) {
            let buf = Arc::new(Buffer::new(8, 1));
            let r0 = buf.add_reader();
            let r1 = buf.add_reader();

            for (is_write, n) in ops {
                if is_write {
                    let n = n.min(buf.space_available());
                    let chunk = vec![0xabu8; n];
                    if n > 0 {
                        write_items(&buf, &chunk);
                    }
                } else {
                    let n = n.min(r0.items_available());
                    r0.post_read(n);
                    let n = n.min(r1.items_available());
                    r1.post_read(n);
                }

                let written = buf.total_items_written();
                for r in [&r0, &r1] {
                    let read = r.total_items_read();
                    prop_assert!(read <= written);
                    prop_assert!(written - read <= buf.capacity() as u64);
                }
            }
        }
    }
}
