//! Storage layer for clockpool.
//!
//! This module provides a fixed-capacity page cache over a page-addressed store.
//! Key components:
//!
//! - **Page**: Fixed-size (8KB) blocks of data, the basic unit of I/O
//! - **DiskManager**: Allocates, reads and writes pages on the backing store
//! - **BufferPoolManager**: In-memory cache of pages with clock eviction
//! - **LogManager**: Write-ahead log collaborator handed to the pool
//!
//! Callers pin a page through the buffer pool before touching its bytes and
//! unpin it exactly once when done, reporting whether they modified it.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{
    BufferPoolConfig, BufferPoolManager, FlushPolicy, PageHandle, PageReadGuard, PageWriteGuard,
};
pub use disk::{DiskManager, MemoryDiskManager, PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::PageId;
pub use wal::{LogManager, NoopLogManager};
