pub mod clock;
pub mod frame;
pub mod replacer;

use crate::storage::disk::DiskManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::LogManager;
use crate::storage::{PageId, PAGE_SIZE};
use clock::ClockReplacer;
use frame::Frame;
use log::{debug, trace, warn};
use parking_lot::{Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};
use replacer::{FrameId, Replacer};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// When dirty pages are written back to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Write back only on eviction or an explicit flush.
    #[default]
    Deferred,
    /// Also write back whenever a dirty page is unpinned.
    EagerOnUnpin,
}

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames, fixed for the lifetime of the pool.
    pub pool_size: usize,
    /// Write-back timing for dirty pages.
    pub flush_policy: FlushPolicy,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            pool_size: 64,
            flush_policy: FlushPolicy::Deferred,
        }
    }
}

/// Fixed-capacity page cache over a [`DiskManager`].
///
/// Every successful [`fetch_page`](Self::fetch_page) or [`new_page`](Self::new_page)
/// pins the page and must be matched by exactly one [`unpin_page`](Self::unpin_page).
/// The RAII guards returned by `fetch_page_read`, `fetch_page_write` and
/// `new_page_write` do the unpin on drop.
///
/// All bookkeeping and disk I/O happen under one pool lock. Page bytes have their
/// own lock. The pool never waits on the byte lock of a pinned page while holding
/// the pool lock: flushes pin the page, release the pool lock, copy the bytes, and
/// only then relock to write. A thread may hold page guards while calling back
/// into the pool, but must not flush a page it holds a write guard on.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    frames: Box<[Frame]>,
    state: Mutex<PoolState>,
    flush_policy: FlushPolicy,
    log_manager: Option<Arc<dyn LogManager>>,
}

/// Everything that must change atomically when a frame is bound or released.
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    /// Frames holding no page. Never overlaps with the replacer's eligible set.
    free_list: VecDeque<FrameId>,
    replacer: Box<dyn Replacer>,
    disk: Box<dyn DiskManager>,
    bound_frames: usize,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: impl DiskManager + 'static) -> Self {
        Self::with_config(
            BufferPoolConfig {
                pool_size,
                ..BufferPoolConfig::default()
            },
            disk,
        )
    }

    pub fn with_config(config: BufferPoolConfig, disk: impl DiskManager + 'static) -> Self {
        let replacer = Box::new(ClockReplacer::new(config.pool_size));
        Self::with_parts(config, Box::new(disk), replacer, None)
    }

    /// Build a pool from explicit collaborators. `replacer` must accept every
    /// frame id below `config.pool_size`.
    pub fn with_parts(
        config: BufferPoolConfig,
        disk: Box<dyn DiskManager>,
        replacer: Box<dyn Replacer>,
        log_manager: Option<Arc<dyn LogManager>>,
    ) -> Self {
        let frames = (0..config.pool_size).map(|_| Frame::new()).collect();
        let free_list = (0..config.pool_size as FrameId).collect();

        Self {
            inner: Arc::new(BufferPoolInner {
                frames,
                state: Mutex::new(PoolState {
                    page_table: HashMap::with_capacity(config.pool_size),
                    free_list,
                    replacer,
                    disk,
                    bound_frames: 0,
                }),
                flush_policy: config.flush_policy,
                log_manager,
            }),
        }
    }

    /// Pin `page_id`, reading it from disk if it is not resident.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageHandle<'_>> {
        if !page_id.is_valid() {
            return Err(StorageError::InvalidPageId);
        }

        let mut state = self.inner.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            self.pin_frame(&mut state, frame_id);
            trace!("Fetch hit: page {} in frame {}", page_id, frame_id);
            return Ok(self.handle(page_id, frame_id));
        }

        let frame_id = self.acquire_frame(&mut state)?;
        self.bind_frame(&mut state, frame_id, page_id);

        let frame = self.frame(frame_id);
        let read = state.disk.read_page(page_id, &mut frame.write()[..]);
        if let Err(err) = read {
            warn!(
                "Failed to read page {} into frame {}: {}",
                page_id, frame_id, err
            );
            self.release_frame(&mut state, page_id, frame_id);
            return Err(err);
        }

        debug!("Loaded page {} into frame {}", page_id, frame_id);
        Ok(self.handle(page_id, frame_id))
    }

    /// Allocate a fresh page on disk and pin a zeroed frame for it.
    pub fn new_page(&self) -> StorageResult<(PageId, PageHandle<'_>)> {
        let mut state = self.inner.state.lock();

        if state.free_list.is_empty() && state.replacer.size() == 0 {
            return Err(StorageError::BufferPoolFull);
        }

        let page_id = state.disk.allocate_page()?;
        let frame_id = match self.acquire_frame(&mut state) {
            Ok(frame_id) => frame_id,
            Err(err) => {
                if let Err(dealloc_err) = state.disk.deallocate_page(page_id) {
                    warn!(
                        "Failed to release page {} after bind failure: {}",
                        page_id, dealloc_err
                    );
                }
                return Err(err);
            }
        };
        self.bind_frame(&mut state, frame_id, page_id);

        debug!("Created page {} in frame {}", page_id, frame_id);
        Ok((page_id, self.handle(page_id, frame_id)))
    }

    /// Drop one pin on `page_id`. `is_dirty` reports whether the caller modified it.
    ///
    /// Under [`FlushPolicy::EagerOnUnpin`] a dirty page is written back before the
    /// pin is dropped. A failed eager write is logged and the page stays dirty for
    /// a later flush or eviction; the unpin itself still succeeds.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> StorageResult<()> {
        let mut state = self.inner.state.lock();
        let frame_id = Self::lookup(&state, page_id)?;
        let frame = self.frame(frame_id);

        if frame.pin_count() == 0 {
            return Err(StorageError::PageNotPinned(page_id));
        }
        if is_dirty {
            frame.mark_dirty();
        }

        if self.inner.flush_policy == FlushPolicy::EagerOnUnpin && frame.is_dirty() {
            // The caller's pin keeps the frame bound while the pool lock is released
            let was_dirty = frame.take_dirty();
            drop(state);
            let (relocked, result) = self.write_pinned(page_id, frame_id, was_dirty);
            state = relocked;
            if let Err(err) = result {
                warn!(
                    "Eager write-back of page {} failed, leaving it dirty: {}",
                    page_id, err
                );
            }
        }

        self.unpin_frame(&mut state, frame_id);
        trace!(
            "Unpinned page {} (pin count {}, dirty {})",
            page_id,
            frame.pin_count(),
            frame.is_dirty()
        );
        Ok(())
    }

    /// Write the current bytes of a resident page to disk, dirty or not.
    ///
    /// Waits for any write guard on the page to drop. Calling this while holding
    /// that page's write guard on the same thread deadlocks.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        let (frame_id, was_dirty) = {
            let mut state = self.inner.state.lock();
            let frame_id = Self::lookup(&state, page_id)?;
            self.pin_frame(&mut state, frame_id);
            (frame_id, self.frame(frame_id).take_dirty())
        };

        let (mut state, result) = self.write_pinned(page_id, frame_id, was_dirty);
        self.unpin_frame(&mut state, frame_id);
        result
    }

    /// Write every page resident at the time of the call to disk once, in page-id
    /// order. Pages evicted or deleted in the meantime are skipped; eviction has
    /// already written them back.
    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let mut resident: Vec<PageId> = self
            .inner
            .state
            .lock()
            .page_table
            .keys()
            .copied()
            .collect();
        resident.sort_unstable();

        for page_id in resident {
            match self.flush_page(page_id) {
                Ok(()) | Err(StorageError::PageNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Remove a page from the pool and deallocate it on disk.
    ///
    /// Succeeds without touching disk if the page is not resident. Fails with
    /// [`StorageError::PagePinned`] while anyone holds a pin.
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<()> {
        let mut state = self.inner.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(());
        };
        let frame = self.frame(frame_id);
        let pin_count = frame.pin_count();
        if pin_count != 0 {
            return Err(StorageError::PagePinned { page_id, pin_count });
        }

        self.release_frame(&mut state, page_id, frame_id);
        debug!("Deleted page {} from frame {}", page_id, frame_id);
        state.disk.deallocate_page(page_id)
    }

    /// Pin a page and hold a shared lock on its bytes until the guard drops.
    pub fn fetch_page_read(&self, page_id: PageId) -> StorageResult<PageReadGuard<'_>> {
        let handle = self.fetch_page(page_id)?;
        Ok(PageReadGuard {
            pool: self,
            page_id,
            data: ManuallyDrop::new(handle.read()),
        })
    }

    /// Pin a page and hold an exclusive lock on its bytes until the guard drops.
    /// The page is unpinned dirty if the bytes were mutably borrowed.
    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard<'_>> {
        let handle = self.fetch_page(page_id)?;
        Ok(PageWriteGuard::new(self, handle))
    }

    pub fn new_page_write(&self) -> StorageResult<(PageId, PageWriteGuard<'_>)> {
        let (page_id, handle) = self.new_page()?;
        Ok((page_id, PageWriteGuard::new(self, handle)))
    }

    pub fn pool_size(&self) -> usize {
        self.inner.frames.len()
    }

    pub fn free_frame_count(&self) -> usize {
        self.inner.state.lock().free_list.len()
    }

    /// Number of resident pages that could be evicted right now.
    pub fn evictable_count(&self) -> usize {
        self.inner.state.lock().replacer.size()
    }

    pub fn resident_count(&self) -> usize {
        let state = self.inner.state.lock();
        debug_assert_eq!(state.bound_frames, state.page_table.len());
        state.bound_frames
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.state.lock().page_table.contains_key(&page_id)
    }

    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.inner.state.lock();
        let frame_id = state.page_table.get(&page_id)?;
        Some(self.frame(*frame_id).pin_count())
    }

    pub fn is_dirty(&self, page_id: PageId) -> Option<bool> {
        let state = self.inner.state.lock();
        let frame_id = state.page_table.get(&page_id)?;
        Some(self.frame(*frame_id).is_dirty())
    }

    pub fn log_manager(&self) -> Option<&Arc<dyn LogManager>> {
        self.inner.log_manager.as_ref()
    }

    fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.inner.frames[frame_id as usize]
    }

    fn handle(&self, page_id: PageId, frame_id: FrameId) -> PageHandle<'_> {
        PageHandle {
            frame: self.frame(frame_id),
            page_id,
            frame_id,
        }
    }

    fn lookup(state: &PoolState, page_id: PageId) -> StorageResult<FrameId> {
        state
            .page_table
            .get(&page_id)
            .copied()
            .ok_or(StorageError::PageNotFound(page_id))
    }

    /// Take a frame from the free list, or evict one. An evicted frame has been
    /// written back and dropped from the page table but still carries its old header.
    fn acquire_frame(&self, state: &mut PoolState) -> StorageResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = state.replacer.victim().ok_or(StorageError::BufferPoolFull)?;
        let frame = self.frame(frame_id);

        if let Some(old_page_id) = frame.page_id() {
            if frame.is_dirty() {
                if let Err(err) = self.write_back(state, old_page_id, frame_id) {
                    warn!(
                        "Failed to write back page {} from frame {}: {}",
                        old_page_id, frame_id, err
                    );
                    state.replacer.unpin(frame_id);
                    return Err(err);
                }
            }
            state.page_table.remove(&old_page_id);
            state.bound_frames -= 1;
            debug!("Evicted page {} from frame {}", old_page_id, frame_id);
        }

        Ok(frame_id)
    }

    fn pin_frame(&self, state: &mut PoolState, frame_id: FrameId) {
        if self.frame(frame_id).pin() == 1 {
            state.replacer.pin(frame_id);
        }
    }

    fn unpin_frame(&self, state: &mut PoolState, frame_id: FrameId) {
        if self.frame(frame_id).unpin() == 0 {
            state.replacer.unpin(frame_id);
        }
    }

    fn bind_frame(&self, state: &mut PoolState, frame_id: FrameId, page_id: PageId) {
        self.frame(frame_id).bind(page_id);
        state.page_table.insert(page_id, frame_id);
        state.bound_frames += 1;
        state.replacer.pin(frame_id);
    }

    /// Unbind a frame and put it back on the free list.
    fn release_frame(&self, state: &mut PoolState, page_id: PageId, frame_id: FrameId) {
        state.page_table.remove(&page_id);
        state.bound_frames -= 1;
        state.replacer.pin(frame_id);
        self.frame(frame_id).reset();
        state.free_list.push_back(frame_id);
    }

    /// Write back an eviction victim. Its pin count is zero, so no guard holds its
    /// bytes and the read lock is free.
    fn write_back(
        &self,
        state: &mut PoolState,
        page_id: PageId,
        frame_id: FrameId,
    ) -> StorageResult<()> {
        let frame = self.frame(frame_id);
        state.disk.write_page(page_id, &frame.read()[..])?;
        frame.clear_dirty();
        debug!("Wrote page {} from frame {}", page_id, frame_id);
        Ok(())
    }

    /// Copy a pinned frame's bytes without the pool lock, then relock and write
    /// them. `was_dirty` is the flag taken before the copy; it is restored if the
    /// write fails. Returns with the pool lock held.
    fn write_pinned(
        &self,
        page_id: PageId,
        frame_id: FrameId,
        was_dirty: bool,
    ) -> (MutexGuard<'_, PoolState>, StorageResult<()>) {
        let frame = self.frame(frame_id);
        let data = frame.snapshot();

        let mut state = self.inner.state.lock();
        let result = state.disk.write_page(page_id, &data[..]);
        match &result {
            Ok(()) => debug!("Wrote page {} from frame {}", page_id, frame_id),
            Err(_) if was_dirty => frame.mark_dirty(),
            Err(_) => {}
        }
        (state, result)
    }
}

/// A pinned page: which frame holds it, plus the right to lock its bytes.
///
/// Holding a handle does not keep the page pinned; pair every handle with one
/// [`BufferPoolManager::unpin_page`] and stop using it afterwards. Byte guards
/// from [`read`](Self::read) and [`write`](Self::write) must be dropped before
/// the unpin.
pub struct PageHandle<'a> {
    frame: &'a Frame,
    page_id: PageId,
    frame_id: FrameId,
}

impl<'a> PageHandle<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn pin_count(&self) -> u32 {
        self.frame.pin_count()
    }

    pub fn read(&self) -> RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>> {
        self.frame.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>> {
        self.frame.write()
    }
}

impl fmt::Debug for PageHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_id", &self.page_id)
            .field("frame_id", &self.frame_id)
            .finish()
    }
}

pub struct PageReadGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    data: ManuallyDrop<RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl PageReadGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: `data` is dropped exactly once, here, and never touched again.
        // The byte lock has to go before the unpin, which may read the frame.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        if let Err(err) = self.pool.unpin_page(self.page_id, false) {
            warn!("Failed to unpin page {}: {}", self.page_id, err);
        }
    }
}

pub struct PageWriteGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    data: ManuallyDrop<RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>>,
    dirty: bool,
}

impl<'a> PageWriteGuard<'a> {
    fn new(pool: &'a BufferPoolManager, handle: PageHandle<'a>) -> Self {
        Self {
            pool,
            page_id: handle.page_id(),
            data: ManuallyDrop::new(handle.write()),
            dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.dirty = true;
        &mut self.data
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: see `PageReadGuard::drop`.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        if let Err(err) = self.pool.unpin_page(self.page_id, self.dirty) {
            warn!("Failed to unpin page {}: {}", self.page_id, err);
        }
    }
}
