use super::{check_buffer_size, DiskManager, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// File-backed page store. Page `n` lives at byte offset `n * PAGE_SIZE`.
pub struct PageManager {
    file: File,
    next_page_id: u32,
    /// Released ids. Their file space is left as a hole and never handed out again.
    deallocated: HashSet<PageId>,
}

impl PageManager {
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            next_page_id: 0,
            deallocated: HashSet::new(),
        })
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut manager = Self {
            file,
            next_page_id: 0,
            deallocated: HashSet::new(),
        };
        manager.next_page_id = manager.num_pages()?;
        Ok(manager)
    }

    pub fn num_pages(&self) -> StorageResult<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }

    fn check_live(&self, page_id: PageId) -> StorageResult<()> {
        if !page_id.is_valid() {
            return Err(StorageError::InvalidPageId);
        }
        if self.deallocated.contains(&page_id) {
            return Err(StorageError::PageDeallocated(page_id));
        }
        Ok(())
    }
}

impl DiskManager for PageManager {
    fn allocate_page(&mut self) -> StorageResult<PageId> {
        // Pages written past the end without allocation still count as taken.
        let id = self.next_page_id.max(self.num_pages()?);
        if id == PageId::INVALID.0 {
            return Err(StorageError::InvalidPageId);
        }
        let new_size = (id as u64 + 1) * PAGE_SIZE as u64;
        if self.file.metadata()?.len() < new_size {
            self.file.set_len(new_size)?;
        }
        self.next_page_id = id + 1;
        Ok(PageId(id))
    }

    fn deallocate_page(&mut self, page_id: PageId) -> StorageResult<()> {
        self.check_live(page_id)?;
        if page_id.0 >= self.next_page_id.max(self.num_pages()?) {
            return Err(StorageError::PageOutOfRange(page_id));
        }
        self.deallocated.insert(page_id);
        Ok(())
    }

    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        check_buffer_size(buf.len())?;
        self.check_live(page_id)?;

        let offset = Self::page_offset(page_id);
        if offset >= self.file.metadata()?.len() {
            return Err(StorageError::PageOutOfRange(page_id));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        check_buffer_size(data.len())?;
        self.check_live(page_id)?;

        let offset = Self::page_offset(page_id);
        if offset >= self.file.metadata()?.len() {
            self.file.set_len(offset + PAGE_SIZE as u64)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.sync_all()?;
        Ok(())
    }
}
