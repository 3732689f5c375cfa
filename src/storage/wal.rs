//! Write-ahead log collaborator.
//!
//! The buffer pool accepts a log manager so that a WAL can later enforce
//! "log before data" on write-back. Nothing in the pool consults it yet.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Log sequence number.
pub type Lsn = u64;

pub trait LogManager: Send + Sync + Debug {
    /// Highest LSN known to be durable.
    fn flushed_lsn(&self) -> Lsn;

    /// Force the log up to and including `lsn` to stable storage.
    fn flush(&self, lsn: Lsn);
}

/// Log manager for pools that run without a WAL. Every flush is durable immediately.
#[derive(Debug, Default)]
pub struct NoopLogManager {
    flushed: AtomicU64,
}

impl NoopLogManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogManager for NoopLogManager {
    fn flushed_lsn(&self) -> Lsn {
        self.flushed.load(Ordering::Acquire)
    }

    fn flush(&self, lsn: Lsn) {
        self.flushed.fetch_max(lsn, Ordering::AcqRel);
    }
}
