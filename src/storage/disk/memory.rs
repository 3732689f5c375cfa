use super::{check_buffer_size, DiskManager, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One call made against a [`MemoryDiskManager`], in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskOp {
    Allocate(PageId),
    Deallocate(PageId),
    Read(PageId),
    Write(PageId),
}

/// Running operation counters.
#[derive(Debug, Default)]
pub struct DiskStats {
    reads: AtomicU64,
    writes: AtomicU64,
    allocations: AtomicU64,
    deallocations: AtomicU64,
}

impl DiskStats {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn deallocations(&self) -> u64 {
        self.deallocations.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct MemoryDisk {
    pages: HashMap<PageId, Box<[u8; PAGE_SIZE]>>,
    deallocated: HashSet<PageId>,
    next_page_id: u32,
    journal: Option<Vec<DiskOp>>,
}

impl MemoryDisk {
    fn record(&mut self, op: DiskOp) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(op);
        }
    }

    fn live_page(&mut self, page_id: PageId) -> StorageResult<&mut Box<[u8; PAGE_SIZE]>> {
        if self.deallocated.contains(&page_id) {
            return Err(StorageError::PageDeallocated(page_id));
        }
        self.pages
            .get_mut(&page_id)
            .ok_or(StorageError::PageOutOfRange(page_id))
    }
}

/// In-memory page store.
///
/// Clones share the same pages, so a test can keep a clone to inspect the
/// store and its journal after handing another clone to a buffer pool.
#[derive(Clone, Default)]
pub struct MemoryDiskManager {
    disk: Arc<Mutex<MemoryDisk>>,
    stats: Arc<DiskStats>,
    fail_io: Arc<AtomicBool>,
}

impl MemoryDiskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`MemoryDiskManager::new`], but every operation is also appended to a journal.
    pub fn with_journal() -> Self {
        let manager = Self::default();
        manager.disk.lock().journal = Some(Vec::new());
        manager
    }

    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }

    /// Operations recorded so far. Empty when the journal is disabled.
    pub fn journal(&self) -> Vec<DiskOp> {
        self.disk.lock().journal.clone().unwrap_or_default()
    }

    pub fn clear_journal(&self) {
        if let Some(journal) = self.disk.lock().journal.as_mut() {
            journal.clear();
        }
    }

    /// Make every subsequent read and write fail with an I/O error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.fail_io.store(failing, Ordering::SeqCst);
    }

    /// Copy of the stored bytes of a live page.
    pub fn page_data(&self, page_id: PageId) -> Option<Vec<u8>> {
        let disk = self.disk.lock();
        if disk.deallocated.contains(&page_id) {
            return None;
        }
        disk.pages.get(&page_id).map(|page| page.to_vec())
    }

    fn check_failing(&self) -> StorageResult<()> {
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected disk failure").into());
        }
        Ok(())
    }
}

impl DiskManager for MemoryDiskManager {
    fn allocate_page(&mut self) -> StorageResult<PageId> {
        let mut disk = self.disk.lock();
        if disk.next_page_id == PageId::INVALID.0 {
            return Err(StorageError::InvalidPageId);
        }
        let page_id = PageId(disk.next_page_id);
        disk.next_page_id += 1;
        disk.pages.insert(page_id, Box::new([0u8; PAGE_SIZE]));
        disk.record(DiskOp::Allocate(page_id));
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(page_id)
    }

    fn deallocate_page(&mut self, page_id: PageId) -> StorageResult<()> {
        let mut disk = self.disk.lock();
        disk.live_page(page_id)?;
        disk.pages.remove(&page_id);
        disk.deallocated.insert(page_id);
        disk.record(DiskOp::Deallocate(page_id));
        self.stats.deallocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        check_buffer_size(buf.len())?;
        self.check_failing()?;
        let mut disk = self.disk.lock();
        buf.copy_from_slice(&disk.live_page(page_id)?[..]);
        disk.record(DiskOp::Read(page_id));
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        check_buffer_size(data.len())?;
        self.check_failing()?;
        let mut disk = self.disk.lock();
        disk.live_page(page_id)?.copy_from_slice(data);
        disk.record(DiskOp::Write(page_id));
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
