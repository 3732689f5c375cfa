//! A single slot of the buffer pool.

use crate::storage::{PageId, PAGE_SIZE};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Page-sized byte buffer plus the header the pool keeps about it.
///
/// Header fields are atomics so handles can read them without the pool lock,
/// but they are only ever written while the pool lock is held.
pub struct Frame {
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
    page_id: AtomicU32,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    pub(crate) fn new() -> Self {
        Self {
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
            page_id: AtomicU32::new(PageId::INVALID.0),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Page currently held by this frame, if any.
    pub fn page_id(&self) -> Option<PageId> {
        let page_id = PageId(self.page_id.load(Ordering::Acquire));
        page_id.is_valid().then_some(page_id)
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Copy of the current bytes. Uses a recursive read so a thread that already
    /// holds a read guard on this frame does not queue behind a waiting writer.
    pub(crate) fn snapshot(&self) -> Box<[u8; PAGE_SIZE]> {
        self.data.read_recursive().clone()
    }

    pub(crate) fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.is_dirty.store(false, Ordering::Release);
    }

    /// Clear the dirty flag, returning its previous value.
    pub(crate) fn take_dirty(&self) -> bool {
        self.is_dirty.swap(false, Ordering::AcqRel)
    }

    /// Increment the pin count, returning the new value.
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the pin count, returning the new value. Caller checks for zero first.
    pub(crate) fn unpin(&self) -> u32 {
        self.pin_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Bind to `page_id` with a single pin, clean and zero-filled.
    pub(crate) fn bind(&self, page_id: PageId) {
        self.data.write().fill(0);
        self.page_id.store(page_id.0, Ordering::Release);
        self.pin_count.store(1, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
    }

    /// Return to the unbound state.
    pub(crate) fn reset(&self) {
        self.data.write().fill(0);
        self.page_id.store(PageId::INVALID.0, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_frame_is_unbound() {
        let frame = Frame::new();
        assert_eq!(frame.page_id(), None);
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert!(frame.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bind_zeroes_and_pins() {
        let frame = Frame::new();
        frame.write()[10] = 0xab;
        frame.mark_dirty();

        frame.bind(PageId(4));
        assert_eq!(frame.page_id(), Some(PageId(4)));
        assert_eq!(frame.pin_count(), 1);
        assert!(!frame.is_dirty());
        assert_eq!(frame.read()[10], 0);

        assert_eq!(frame.pin(), 2);
        assert_eq!(frame.unpin(), 1);
    }

    #[test]
    fn test_take_dirty_and_snapshot() {
        let frame = Frame::new();
        frame.bind(PageId(2));
        frame.write()[3] = 9;
        frame.mark_dirty();

        let _reader = frame.read();
        let copy = frame.snapshot();
        assert_eq!(copy[3], 9);

        assert!(frame.take_dirty());
        assert!(!frame.take_dirty());
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_reset() {
        let frame = Frame::new();
        frame.bind(PageId(1));
        frame.write()[0] = 1;
        frame.mark_dirty();

        frame.reset();
        assert_eq!(frame.page_id(), None);
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert_eq!(frame.read()[0], 0);
    }
}
