//! `lfsdump`: prints an image's on-disk metadata for hand inspection.
//!
//! Grounded on the same read-only CLI shape as `lfsck`, reusing the core's
//! own decoders rather than re-implementing the layout here, so a dump can
//! never show something the engine itself wouldn't agree is there.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use clap::Parser;

use rlfs::bio::BufferCache;
use rlfs::checkpoint;
use rlfs::device::Device;
use rlfs::imap::Imap;
use rlfs::inode::{self, IoCtx};
use rlfs::param::DEFAULT_BUFFER_CACHE_CAPACITY;
use rlfs::segment::SegmentState;
use rlfs::segment_writer::{CleanerSignal, SegmentWriter};
use rlfs::superblock::{RawSuperblock, Superblock, SUPERBLOCK_MAGIC};
use rlfs::Error;

/// Dumps superblock, checkpoint, and inode metadata from an rlfs image.
#[derive(Parser)]
#[command(name = "lfsdump", about = "Inspect an rlfs image's metadata")]
struct Args {
    /// Path to the image file to inspect.
    path: PathBuf,

    /// Print the full inode record for this inode number, if present.
    #[arg(long)]
    inode: Option<u32>,
}

fn probe_block_size(path: &std::path::Path) -> rlfs::Result<u32> {
    use std::io::Read;
    use zerocopy::FromBytes;
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; RawSuperblock::SIZE];
    file.read_exact(&mut buf)?;
    let raw = RawSuperblock::read_from_bytes(&buf).map_err(|_| Error::Corrupt("superblock layout mismatch".into()))?;
    if raw.magic != SUPERBLOCK_MAGIC {
        return Err(Error::Corrupt(format!("bad superblock magic: {:#x}", raw.magic)));
    }
    Ok(raw.block_size)
}

fn run(args: Args) -> rlfs::Result<()> {
    let block_size = probe_block_size(&args.path)?;
    let device = Device::open_read_only(&args.path, block_size)?;

    let mut sb_buf = vec![0u8; block_size as usize];
    device.read_block(0, &mut sb_buf)?;
    let superblock = Superblock::from_block(&sb_buf)?;

    println!("superblock:");
    println!("  uuid: {}", uuid::Uuid::from_bytes(superblock.raw.uuid));
    println!("  block_size: {}", superblock.raw.block_size);
    println!("  total_blocks: {}", superblock.raw.total_blocks);
    println!("  segment_size_blocks: {}", superblock.raw.segment_size_blocks);
    println!("  total_segments: {}", superblock.raw.total_segments);
    println!("  inode_count: {}", superblock.raw.inode_count);
    println!("  active_checkpoint: {}", superblock.raw.active_checkpoint);
    println!("  free_segment_count: {}", superblock.raw.free_segment_count);
    println!("  clean_flag: {}", superblock.raw.clean_flag);
    println!("  mount_count: {}", superblock.raw.mount_count);
    println!("  log_head: {}", superblock.raw.log_head);
    println!("  log_start_block: {}", superblock.raw.log_start_block);
    println!("  segment_table_block: {}", superblock.raw.segment_table_block);

    let mut active_region = None;
    for region in [0u32, 1u32] {
        match checkpoint::read_header(&device, &superblock, region)? {
            Some(header) => {
                println!("checkpoint region {region}: valid");
                println!("  sequence: {}", header.sequence);
                println!("  timestamp: {}", header.timestamp);
                println!("  log_head: {}", header.log_head);
                println!("  imap_entry_count: {}", header.imap_entry_count);
                println!("  segment_entry_count: {}", header.segment_entry_count);
                let better = match active_region {
                    Some((_, best)) => header.sequence > best,
                    None => true,
                };
                if better {
                    active_region = Some((region, header.sequence));
                }
            }
            None => println!("checkpoint region {region}: invalid or absent"),
        }
    }
    let Some((region, sequence)) = active_region else {
        println!("no valid checkpoint region found");
        return Ok(());
    };
    println!("authoritative region: {region} (sequence {sequence})");

    let header = checkpoint::read_header(&device, &superblock, region)?.expect("validated above");
    let imap_entries = checkpoint::read_imap(&device, &superblock, region, header.imap_entry_count)?;
    let segment_table = checkpoint::read_segment_table(&device, &superblock)?;

    println!("inode map: {} entries", imap_entries.len());

    let mut free = 0u32;
    let mut active = 0u32;
    let mut full = 0u32;
    let mut cleaning = 0u32;
    for id in 0..segment_table.len() as u32 {
        match segment_table.state(id) {
            SegmentState::Free => free += 1,
            SegmentState::Active => active += 1,
            SegmentState::Full => full += 1,
            SegmentState::Cleaning => cleaning += 1,
        }
    }
    println!("segment table: {free} free, {active} active, {full} full, {cleaning} cleaning ({} total)", segment_table.len());

    if let Some(ino) = args.inode {
        let device = Arc::new(device);
        let buffer_cache = Arc::new(BufferCache::new(device.clone(), DEFAULT_BUFFER_CACHE_CAPACITY));
        let segment_table = Arc::new(segment_table);
        let cleaner_signal = CleanerSignal::new();
        let log_head_cursor = Arc::new(AtomicU64::new(header.log_head));
        let segment_writer = Arc::new(SegmentWriter::new(
            device,
            segment_table.clone(),
            block_size,
            superblock.segment_size_blocks(),
            cleaner_signal,
            log_head_cursor,
        ));
        let ctx = IoCtx {
            buffer_cache: &buffer_cache,
            segment_writer: &segment_writer,
            segment_table: &segment_table,
            superblock: &superblock,
        };
        let imap = Imap::from_entries(imap_entries, superblock.inode_count());
        match inode::read_inode_record(&ctx, &imap, ino) {
            Ok(data) => {
                println!("inode {ino}:");
                println!("  mode: {:#o}", data.mode);
                println!("  uid/gid: {}/{}", data.uid, data.gid);
                println!("  size: {}", data.size);
                println!("  block_count: {}", data.block_count);
                println!("  nlink: {}", data.nlink);
                println!("  generation: {}", data.generation);
                println!("  disk_location: {}", data.disk_location);
                println!("  direct: {:?}", data.direct);
                println!("  indirect: {}", data.indirect);
                println!("  double_indirect: {}", data.double_indirect);
            }
            Err(e) => println!("inode {ino}: {e}"),
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("lfsdump: {e}");
            ExitCode::FAILURE
        }
    }
}
