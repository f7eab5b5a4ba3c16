//! `mklfs`: lays out a fresh image and writes its first, real checkpoint.
//!
//! Grounded on `mkfs`'s single-purpose-binary shape (parse arguments, open
//! the target, delegate to the library crate's own on-disk structs) rather
//! than hand-rolling layout logic here — every byte this binary writes goes
//! through `Superblock`/`SegmentWriter`/`CheckpointManager`, the same types
//! `mount.rlfs` uses, so the two can never drift apart on format details.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use rlfs::bio::BufferCache;
use rlfs::checkpoint::CheckpointManager;
use rlfs::device::Device;
use rlfs::directory;
use rlfs::imap::Imap;
use rlfs::inode::{self, InodeCache, IoCtx, ROOT_INO, S_IFDIR};
use rlfs::param::{DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_CACHE_CAPACITY, DEFAULT_INODE_CACHE_CAPACITY, DEFAULT_SEGMENT_SIZE_BLOCKS};
use rlfs::segment::{BlockType, SegmentTable};
use rlfs::segment_writer::{CleanerSignal, SegmentWriter};
use rlfs::superblock::Superblock;

/// Formats a new log-structured file system image.
#[derive(Parser)]
#[command(name = "mklfs", about = "Create a new rlfs image")]
struct Args {
    /// Path to the image file to create (or truncate).
    path: PathBuf,

    /// Total image size, in mebibytes.
    #[arg(long, default_value_t = 64)]
    size_mb: u64,

    /// Block size in bytes.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Segment size, in blocks.
    #[arg(long, default_value_t = DEFAULT_SEGMENT_SIZE_BLOCKS)]
    segment_size_blocks: u32,

    /// Maximum number of inodes the image can ever hold.
    #[arg(long, default_value_t = 4096)]
    inode_count: u32,
}

fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

fn run(args: Args) -> rlfs::Result<()> {
    let block_count = args.size_mb * 1024 * 1024 / args.block_size as u64;
    let uuid = *uuid::Uuid::new_v4().as_bytes();
    let now = now_ns() / 1_000_000_000;

    let mut superblock = Superblock::format(
        block_count,
        args.block_size,
        args.segment_size_blocks,
        args.inode_count,
        uuid,
        now,
    )?;
    // Flip past the `format()` default before the first real checkpoint is
    // emitted: `CheckpointManager::emit` always targets `1 -
    // active_checkpoint`, so setting this to 1 here makes the very first
    // commit land in region 0, matching a freshly formatted image's
    // intended "checkpoint A is authoritative" state.
    superblock.raw.active_checkpoint = 1;

    let device = Arc::new(Device::create(&args.path, args.block_size, block_count)?);
    let shared_superblock = Arc::new(parking_lot::Mutex::new(superblock));
    let sb_snapshot = shared_superblock.lock().clone();

    let buffer_cache = Arc::new(BufferCache::new(device.clone(), DEFAULT_BUFFER_CACHE_CAPACITY));
    let segment_table = Arc::new(SegmentTable::new(sb_snapshot.total_segments()));
    let imap = Arc::new(Imap::new(sb_snapshot.inode_count()));
    let cleaner_signal = CleanerSignal::new();
    let log_head_cursor = Arc::new(AtomicU64::new(sb_snapshot.log_start_block()));
    let segment_writer = Arc::new(SegmentWriter::new(
        device.clone(),
        segment_table.clone(),
        args.block_size,
        args.segment_size_blocks,
        cleaner_signal,
        log_head_cursor,
    ));
    let inode_cache = Arc::new(InodeCache::new(DEFAULT_INODE_CACHE_CAPACITY));

    {
        let ctx = IoCtx {
            buffer_cache: &buffer_cache,
            segment_writer: &segment_writer,
            segment_table: &segment_table,
            superblock: &sb_snapshot,
        };
        let root = inode_cache.alloc(&ctx, &imap, S_IFDIR | 0o755, 0, 0, now_ns())?;
        let init_block = directory::init(ROOT_INO, ROOT_INO, args.block_size as usize);
        let mut data = root.data.lock();
        data.nlink = 2;
        let addr = segment_writer.append(&sb_snapshot, &init_block, root.ino, 0, BlockType::Dirent)?;
        inode::write_block_index(&ctx, &mut data, 0, addr)?;
        data.block_count = 1;
        data.size = args.block_size as u64;
        inode::write_inode_record(&ctx, &imap, &mut data)?;
    }

    let checkpoint = CheckpointManager::new(
        device,
        buffer_cache,
        shared_superblock,
        imap,
        segment_table,
        segment_writer,
        inode_cache,
        0,
    );
    checkpoint.emit()?;

    println!(
        "formatted {} ({} blocks, {} bytes/block, {} segments, {} inodes)",
        args.path.display(),
        block_count,
        args.block_size,
        sb_snapshot.total_segments(),
        sb_snapshot.inode_count(),
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mklfs: {e}");
            ExitCode::FAILURE
        }
    }
}
