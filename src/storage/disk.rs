//! Page-addressed backing stores consumed by the buffer pool.

pub mod memory;
pub mod page_manager;

use crate::storage::error::StorageResult;
use crate::storage::page::PageId;

pub use memory::{DiskOp, DiskStats, MemoryDiskManager};
pub use page_manager::PageManager;

pub const PAGE_SIZE: usize = 8192;

/// A synchronous, order-preserving store of `PAGE_SIZE` records keyed by page id.
pub trait DiskManager: Send {
    /// Allocate a fresh page id. Ids grow monotonically and are never reused.
    fn allocate_page(&mut self) -> StorageResult<PageId>;

    /// Release a page id. Later reads and writes of it fail.
    fn deallocate_page(&mut self, page_id: PageId) -> StorageResult<()>;

    /// Read a page into `buf`, which must be exactly `PAGE_SIZE` bytes.
    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()>;

    /// Write `data`, which must be exactly `PAGE_SIZE` bytes, to a page.
    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()>;
}

pub(crate) fn check_buffer_size(len: usize) -> StorageResult<()> {
    if len != PAGE_SIZE {
        return Err(crate::storage::StorageError::InvalidBufferSize {
            expected: PAGE_SIZE,
            actual: len,
        });
    }
    Ok(())
}
