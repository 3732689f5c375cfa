use clockpool::storage::disk::DiskOp;
use clockpool::storage::{
    BufferPoolConfig, BufferPoolManager, FlushPolicy, MemoryDiskManager, PageId, StorageError,
    PAGE_SIZE,
};
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn journaled_pool(pool_size: usize) -> (MemoryDiskManager, BufferPoolManager) {
    let disk = MemoryDiskManager::with_journal();
    let pool = BufferPoolManager::new(pool_size, disk.clone());
    (disk, pool)
}

/// Allocate `count` pages, stamp each with its id, and leave them unpinned and dirty.
fn populate(pool: &BufferPoolManager, count: usize) -> Vec<PageId> {
    (0..count)
        .map(|_| {
            let (page_id, mut guard) = pool.new_page_write().unwrap();
            guard[0] = page_id.0 as u8;
            page_id
        })
        .collect()
}

#[test]
fn test_pin_count_held_until_unpin() {
    let (_disk, pool) = journaled_pool(4);

    let (page_id, handle) = pool.new_page().unwrap();
    assert_eq!(handle.pin_count(), 1);

    let again = pool.fetch_page(page_id).unwrap();
    assert_eq!(again.frame_id(), handle.frame_id());
    assert_eq!(pool.pin_count(page_id), Some(2));
    assert_eq!(pool.evictable_count(), 0);

    pool.unpin_page(page_id, false).unwrap();
    assert_eq!(pool.pin_count(page_id), Some(1));
    assert_eq!(pool.evictable_count(), 0);

    pool.unpin_page(page_id, false).unwrap();
    assert_eq!(pool.pin_count(page_id), Some(0));
    assert_eq!(pool.evictable_count(), 1);

    assert!(matches!(
        pool.unpin_page(page_id, false),
        Err(StorageError::PageNotPinned(_))
    ));
}

#[test]
fn test_fetch_hit_takes_frame_out_of_replacer() {
    let (_disk, pool) = journaled_pool(2);

    let (page_id, _) = pool.new_page().unwrap();
    pool.unpin_page(page_id, false).unwrap();
    assert_eq!(pool.evictable_count(), 1);

    let handle = pool.fetch_page(page_id).unwrap();
    assert_eq!(handle.pin_count(), 1);
    assert_eq!(pool.evictable_count(), 0);

    // The free frame goes next; after that the re-pinned page must not be a victim
    let (_other, _) = pool.new_page().unwrap();
    assert!(matches!(pool.new_page(), Err(StorageError::BufferPoolFull)));
    assert!(pool.contains(page_id));
    assert_eq!(pool.pin_count(page_id), Some(1));
}

#[test]
fn test_capacity_bound() {
    let (disk, pool) = journaled_pool(3);

    let mut page_ids = Vec::new();
    for _ in 0..3 {
        let (page_id, _) = pool.new_page().unwrap();
        page_ids.push(page_id);
    }
    assert_eq!(pool.free_frame_count(), 0);

    // Failing new_page must not allocate anything on disk
    let allocations = disk.stats().allocations();
    assert!(matches!(pool.new_page(), Err(StorageError::BufferPoolFull)));
    assert_eq!(disk.stats().allocations(), allocations);

    // A miss fails the same way, before touching disk
    disk.clear_journal();
    assert!(matches!(
        pool.fetch_page(PageId(99)),
        Err(StorageError::BufferPoolFull)
    ));
    assert!(disk.journal().is_empty());

    // Hits still succeed while the pool is full
    let handle = pool.fetch_page(page_ids[1]).unwrap();
    assert_eq!(handle.pin_count(), 2);
}

#[test]
fn test_eviction_writes_dirty_victim_before_read() {
    let (disk, pool) = journaled_pool(1);

    let (first, mut guard) = pool.new_page_write().unwrap();
    guard[..5].copy_from_slice(b"first");
    drop(guard);

    // Evicts `first`, then leaves the clean `second` as the sole occupant
    let (second, handle) = pool.new_page().unwrap();
    let frame_id = handle.frame_id();
    pool.unpin_page(second, false).unwrap();

    let handle = pool.fetch_page(first).unwrap();
    assert_eq!(handle.frame_id(), frame_id);
    handle.write()[0] = b'F';
    pool.unpin_page(first, true).unwrap();

    disk.clear_journal();
    let handle = pool.fetch_page(second).unwrap();
    assert_eq!(handle.frame_id(), frame_id);
    assert_eq!(
        disk.journal(),
        vec![DiskOp::Write(first), DiskOp::Read(second)]
    );
    assert_eq!(&disk.page_data(first).unwrap()[..5], b"First");
    assert!(!pool.contains(first));
}

#[test]
fn test_clean_victim_is_not_written() {
    let (disk, pool) = journaled_pool(1);
    let page_ids = populate(&pool, 2);
    pool.flush_all_pages().unwrap();

    disk.clear_journal();
    let handle = pool.fetch_page(page_ids[0]).unwrap();
    assert_eq!(handle.read()[0], page_ids[0].0 as u8);
    assert_eq!(disk.journal(), vec![DiskOp::Read(page_ids[0])]);
}

#[test]
fn test_delete_pinned_page_fails() {
    let (disk, pool) = journaled_pool(2);
    let (page_id, _handle) = pool.new_page().unwrap();

    let err = pool.delete_page(page_id).unwrap_err();
    assert!(matches!(
        err,
        StorageError::PagePinned { pin_count: 1, .. }
    ));
    assert!(pool.contains(page_id));
    assert_eq!(pool.pin_count(page_id), Some(1));
    assert_eq!(disk.stats().deallocations(), 0);
}

#[test]
fn test_delete_absent_page_is_noop() {
    let (disk, pool) = journaled_pool(2);
    disk.clear_journal();

    pool.delete_page(PageId(17)).unwrap();
    assert!(disk.journal().is_empty());
    assert_eq!(pool.free_frame_count(), 2);
}

#[test]
fn test_delete_unpinned_page() {
    let (disk, pool) = journaled_pool(2);
    let page_ids = populate(&pool, 2);
    assert_eq!(pool.free_frame_count(), 0);

    disk.clear_journal();
    pool.delete_page(page_ids[0]).unwrap();

    assert_eq!(disk.journal(), vec![DiskOp::Deallocate(page_ids[0])]);
    assert!(!pool.contains(page_ids[0]));
    assert_eq!(pool.free_frame_count(), 1);
    assert_eq!(pool.evictable_count(), 1);
    assert_eq!(pool.resident_count(), 1);

    // The freed frame is used before anything is evicted
    let (page_id, _guard) = pool.new_page_write().unwrap();
    assert!(pool.contains(page_ids[1]));
    assert!(pool.contains(page_id));
    assert_eq!(disk.stats().deallocations(), 1);

    // Deleting again is a no-op
    pool.delete_page(page_ids[0]).unwrap();
    assert_eq!(disk.stats().deallocations(), 1);
}

#[test]
fn test_deleted_frame_is_not_also_evictable() {
    let (_disk, pool) = journaled_pool(2);
    let page_ids = populate(&pool, 2);
    pool.delete_page(page_ids[0]).unwrap();

    // Two new pages: one takes the free frame, the other must evict page_ids[1]
    let (a, _ga) = pool.new_page_write().unwrap();
    let (b, _gb) = pool.new_page_write().unwrap();
    assert_ne!(a, b);
    assert!(!pool.contains(page_ids[1]));
    assert_eq!(pool.resident_count(), 2);
    assert!(matches!(pool.new_page(), Err(StorageError::BufferPoolFull)));
}

#[test]
fn test_flush_page_writes_clean_page() {
    let (disk, pool) = journaled_pool(2);
    let (page_id, _handle) = pool.new_page().unwrap();
    assert_eq!(pool.is_dirty(page_id), Some(false));

    disk.clear_journal();
    pool.flush_page(page_id).unwrap();
    pool.flush_page(page_id).unwrap();
    assert_eq!(
        disk.journal(),
        vec![DiskOp::Write(page_id), DiskOp::Write(page_id)]
    );

    assert!(matches!(
        pool.flush_page(PageId(40)),
        Err(StorageError::PageNotFound(PageId(40)))
    ));
}

#[test]
fn test_flush_all_writes_each_page_once() {
    let (disk, pool) = journaled_pool(4);
    let page_ids = populate(&pool, 3);

    disk.clear_journal();
    pool.flush_all_pages().unwrap();

    let written: Vec<_> = disk.journal();
    assert_eq!(written.len(), 3);
    let unique: HashSet<_> = written.iter().copied().collect();
    let expected: HashSet<_> = page_ids.iter().map(|&p| DiskOp::Write(p)).collect();
    assert_eq!(unique, expected);
    for page_id in page_ids {
        assert_eq!(pool.is_dirty(page_id), Some(false));
    }
}

#[test]
fn test_round_trip_through_eviction() {
    let (disk, pool) = journaled_pool(2);

    let mut expected = Vec::new();
    for i in 0..6u8 {
        let (page_id, mut guard) = pool.new_page_write().unwrap();
        guard.fill(i);
        guard[PAGE_SIZE - 1] = 0xee;
        expected.push((page_id, i));
    }

    for &(page_id, fill) in expected.iter().rev() {
        let guard = pool.fetch_page_read(page_id).unwrap();
        assert!(guard[..PAGE_SIZE - 1].iter().all(|&b| b == fill));
        assert_eq!(guard[PAGE_SIZE - 1], 0xee);
    }
    assert!(disk.stats().writes() >= 4);
}

#[test]
fn test_eager_flush_on_unpin() {
    let disk = MemoryDiskManager::with_journal();
    let pool = BufferPoolManager::with_config(
        BufferPoolConfig {
            pool_size: 2,
            flush_policy: FlushPolicy::EagerOnUnpin,
        },
        disk.clone(),
    );

    let (page_id, _) = pool.new_page().unwrap();
    disk.clear_journal();

    pool.unpin_page(page_id, true).unwrap();
    assert_eq!(disk.journal(), vec![DiskOp::Write(page_id)]);
    assert_eq!(pool.is_dirty(page_id), Some(false));

    // Clean unpins never write
    pool.fetch_page(page_id).unwrap();
    pool.unpin_page(page_id, false).unwrap();
    assert_eq!(disk.journal().len(), 1);
}

#[test]
fn test_failed_eager_write_back_still_unpins() {
    let disk = MemoryDiskManager::with_journal();
    let pool = BufferPoolManager::with_config(
        BufferPoolConfig {
            pool_size: 2,
            flush_policy: FlushPolicy::EagerOnUnpin,
        },
        disk.clone(),
    );

    let (page_id, handle) = pool.new_page().unwrap();
    handle.write()[0] = 0x5a;
    disk.set_failing(true);

    pool.unpin_page(page_id, true).unwrap();
    assert_eq!(pool.pin_count(page_id), Some(0));
    assert_eq!(pool.is_dirty(page_id), Some(true));
    assert_eq!(pool.evictable_count(), 1);
    assert!(matches!(
        pool.unpin_page(page_id, true),
        Err(StorageError::PageNotPinned(_))
    ));

    // The change is still pending and reaches disk once writes work again
    disk.set_failing(false);
    pool.flush_page(page_id).unwrap();
    assert_eq!(pool.is_dirty(page_id), Some(false));
    assert_eq!(disk.page_data(page_id).unwrap()[0], 0x5a);
}

#[test]
fn test_flush_waits_for_writer_without_holding_pool() {
    let (disk, pool) = journaled_pool(4);
    let page_ids = populate(&pool, 2);
    let (held, other) = (page_ids[0], page_ids[1]);

    let (locked_tx, locked_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let writer_pool = pool.clone();
    let writer = thread::spawn(move || {
        let mut guard = writer_pool.fetch_page_write(held).unwrap();
        locked_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));

        // Walk to another page while still holding the first one
        let next = writer_pool.fetch_page_read(other).unwrap();
        guard[1] = next[0];
        drop(next);
        drop(guard);
        done_tx.send(()).unwrap();
    });

    let flusher_pool = pool.clone();
    let flusher = thread::spawn(move || {
        locked_rx.recv().unwrap();
        flusher_pool.flush_page(held).unwrap();
        flusher_pool.flush_all_pages().unwrap();
    });

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("writer stalled behind a flush of its page");
    writer.join().unwrap();
    flusher.join().unwrap();

    // The flush copied the page only after the writer let go of it
    assert_eq!(disk.page_data(held).unwrap()[1], other.0 as u8);
    assert_eq!(pool.pin_count(held), Some(0));
    assert_eq!(pool.pin_count(other), Some(0));
    assert_eq!(pool.evictable_count(), 2);
}

#[test]
fn test_write_back_failure_keeps_victim_resident() {
    let (disk, pool) = journaled_pool(1);
    let page_ids = populate(&pool, 1);
    let other = {
        let mut store = disk.clone();
        clockpool::storage::DiskManager::allocate_page(&mut store).unwrap()
    };

    disk.set_failing(true);
    let err = pool.fetch_page(other).unwrap_err();
    assert!(err.is_io());
    assert!(pool.contains(page_ids[0]));
    assert_eq!(pool.is_dirty(page_ids[0]), Some(true));
    assert_eq!(pool.evictable_count(), 1);

    disk.set_failing(false);
    let handle = pool.fetch_page(other).unwrap();
    assert_eq!(handle.page_id(), other);
    assert_eq!(disk.page_data(page_ids[0]).unwrap()[0], page_ids[0].0 as u8);
}

#[test]
fn test_concurrent_fetch_single_copy() {
    let disk = MemoryDiskManager::new();
    let pool = Arc::new(BufferPoolManager::new(8, disk.clone()));
    let page_ids = populate(&pool, 16);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let pool = Arc::clone(&pool);
            let page_ids = page_ids.clone();
            thread::spawn(move || {
                for round in 0..200 {
                    let page_id = page_ids[(round * 7 + t) % page_ids.len()];
                    loop {
                        match pool.fetch_page_read(page_id) {
                            Ok(guard) => {
                                assert_eq!(guard[0], page_id.0 as u8);
                                break;
                            }
                            Err(StorageError::BufferPoolFull) => thread::yield_now(),
                            Err(err) => panic!("fetch failed: {err}"),
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(pool.resident_count() <= 8);
    assert_eq!(pool.resident_count() + pool.free_frame_count(), 8);
    assert_eq!(pool.evictable_count(), pool.resident_count());
}
