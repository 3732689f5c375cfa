//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Buffer pool is full: every frame is pinned")]
    BufferPoolFull,

    #[error("Page not found in buffer pool: {0}")]
    PageNotFound(PageId),

    #[error("Page {page_id} is pinned (pin count {pin_count})")]
    PagePinned { page_id: PageId, pin_count: u32 },

    #[error("Page {0} is not pinned")]
    PageNotPinned(PageId),

    #[error("Invalid page id")]
    InvalidPageId,

    #[error("Buffer size must be {expected} bytes, got {actual}")]
    InvalidBufferSize { expected: usize, actual: usize },

    #[error("Page {0} does not exist on disk")]
    PageOutOfRange(PageId),

    #[error("Page {0} has been deallocated")]
    PageDeallocated(PageId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the error came from the disk collaborator rather than pool bookkeeping.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_)
                | StorageError::InvalidBufferSize { .. }
                | StorageError::PageOutOfRange(_)
                | StorageError::PageDeallocated(_)
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
