//! clockpool - buffer pool workload driver
//!
//! Creates a working set of pages larger than the pool, then hammers it with a
//! random mix of reads, writes, flushes and delete/re-create cycles, checking
//! that every page always reads back the last version written to it.

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use clap::Parser as ClapParser;
use clockpool::storage::{
    BufferPoolConfig, BufferPoolManager, FlushPolicy, MemoryDiskManager, PageId, PageManager,
    StorageError, StorageResult,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::AddAssign;
use std::path::PathBuf;
use std::thread;

/// clockpool - exercise a clock-replacement buffer pool
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of frames in the buffer pool
    #[arg(short = 'n', long, default_value = "16")]
    pool_size: usize,

    /// Number of pages in the working set
    #[arg(short, long, default_value = "64")]
    pages: usize,

    /// Number of random operations to run
    #[arg(short, long, default_value = "10000")]
    ops: usize,

    /// Worker threads, each owning a disjoint share of the pages
    #[arg(short, long, default_value = "1")]
    threads: usize,

    /// Page file to use instead of an in-memory store
    #[arg(short = 'f', long)]
    data_file: Option<PathBuf>,

    /// Write dirty pages back on every unpin
    #[arg(long)]
    eager_flush: bool,

    /// Seed for the operation mix
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Default)]
struct Report {
    reads: usize,
    writes: usize,
    flushes: usize,
    recreated: usize,
}

impl AddAssign for Report {
    fn add_assign(&mut self, other: Self) {
        self.reads += other.reads;
        self.writes += other.writes;
        self.flushes += other.flushes;
        self.recreated += other.recreated;
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if args.pool_size == 0 || args.pages == 0 || args.threads == 0 {
        bail!("--pool-size, --pages and --threads must all be at least 1");
    }

    let config = BufferPoolConfig {
        pool_size: args.pool_size,
        flush_policy: if args.eager_flush {
            FlushPolicy::EagerOnUnpin
        } else {
            FlushPolicy::Deferred
        },
    };

    let memory = MemoryDiskManager::new();
    let pool = match &args.data_file {
        Some(path) => {
            let page_manager = PageManager::create(path)
                .with_context(|| format!("Failed to create page file {}", path.display()))?;
            BufferPoolManager::with_config(config.clone(), page_manager)
        }
        None => BufferPoolManager::with_config(config.clone(), memory.clone()),
    };

    println!("Buffer pool configuration:");
    println!("   - Frames: {}", config.pool_size);
    println!("   - Flush policy: {:?}", config.flush_policy);
    println!(
        "   - Store: {}",
        args.data_file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "in-memory".to_string())
    );
    println!(
        "Running {} ops over {} pages on {} thread(s)",
        args.ops, args.pages, args.threads
    );

    let report = thread::scope(|scope| -> Result<Report> {
        let workers: Vec<_> = (0..args.threads)
            .map(|worker| {
                let pool = pool.clone();
                let pages = (worker..args.pages).step_by(args.threads).count();
                let ops = args.ops / args.threads;
                let seed = args.seed.wrapping_add(worker as u64);
                scope.spawn(move || run_worker(&pool, pages, ops, seed))
            })
            .collect();

        let mut total = Report::default();
        for worker in workers {
            match worker.join() {
                Ok(report) => total += report?,
                Err(_) => bail!("Worker thread panicked"),
            }
        }
        Ok(total)
    })?;

    pool.flush_all_pages().context("Failed to flush pages")?;

    println!("Workload finished:");
    println!("   - Reads verified: {}", report.reads);
    println!("   - Writes: {}", report.writes);
    println!("   - Explicit flushes: {}", report.flushes);
    println!("   - Pages re-created: {}", report.recreated);
    println!("   - Resident pages: {}", pool.resident_count());
    if args.data_file.is_none() {
        let stats = memory.stats();
        println!(
            "   - Disk: {} reads, {} writes, {} allocations, {} deallocations",
            stats.reads(),
            stats.writes(),
            stats.allocations(),
            stats.deallocations()
        );
    }

    Ok(())
}

fn run_worker(pool: &BufferPoolManager, pages: usize, ops: usize, seed: u64) -> Result<Report> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut versions = Vec::with_capacity(pages);
    for _ in 0..pages {
        versions.push((create_page(pool)?, 0u64));
    }

    let mut report = Report::default();
    if versions.is_empty() {
        return Ok(report);
    }
    for _ in 0..ops {
        let slot = rng.gen_range(0..versions.len());
        let (page_id, version) = versions[slot];

        match rng.gen_range(0..100) {
            0..=59 => {
                let guard = retry(move || pool.fetch_page_read(page_id))?;
                check_stamp(&guard[..], page_id, version)?;
                report.reads += 1;
            }
            60..=94 => {
                let mut guard = retry(move || pool.fetch_page_write(page_id))?;
                check_stamp(&guard[..], page_id, version)?;
                write_stamp(&mut guard[..], page_id, version + 1);
                versions[slot].1 = version + 1;
                report.writes += 1;
            }
            95..=97 => {
                // Pin first so the page is resident while it is flushed
                let guard = retry(move || pool.fetch_page_read(page_id))?;
                drop(guard);
                match pool.flush_page(page_id) {
                    Ok(()) => report.flushes += 1,
                    // Another worker evicted it in between; nothing left to flush
                    Err(StorageError::PageNotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            _ => {
                // Deleting only deallocates a resident page. Another worker can
                // still evict it between this unpin and the delete, in which case
                // the old disk page stays allocated and is simply abandoned.
                drop(retry(move || pool.fetch_page_read(page_id))?);
                pool.delete_page(page_id)
                    .with_context(|| format!("Failed to delete page {}", page_id))?;
                versions[slot] = (create_page(pool)?, 0);
                report.recreated += 1;
            }
        }
    }

    Ok(report)
}

fn create_page(pool: &BufferPoolManager) -> Result<PageId> {
    let (page_id, mut guard) = retry(move || pool.new_page_write())?;
    write_stamp(&mut guard[..], page_id, 0);
    Ok(page_id)
}

/// Retry while every frame is pinned by other workers.
fn retry<T>(mut op: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
    loop {
        match op() {
            Err(StorageError::BufferPoolFull) => thread::yield_now(),
            other => return other,
        }
    }
}

/// Page header: page id (u32) then version (u64), little-endian.
fn write_stamp(data: &mut [u8], page_id: PageId, version: u64) {
    LittleEndian::write_u32(&mut data[0..4], page_id.0);
    LittleEndian::write_u64(&mut data[4..12], version);
}

fn check_stamp(data: &[u8], page_id: PageId, version: u64) -> Result<()> {
    let stored_id = LittleEndian::read_u32(&data[0..4]);
    let stored_version = LittleEndian::read_u64(&data[4..12]);
    if stored_id != page_id.0 || stored_version != version {
        bail!(
            "Page {} read back as page {} version {}, expected version {}",
            page_id,
            stored_id,
            stored_version,
            version
        );
    }
    Ok(())
}
