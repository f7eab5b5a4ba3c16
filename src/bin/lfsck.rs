//! `lfsck`: consistency checker, read-only unless `--repair` is given.
//!
//! Grounded on the same single-purpose-CLI shape as `mklfs`. Inspection
//! always goes through `Device::open_read_only`, so a plain run can never be
//! the thing that corrupts an image it's checking; `--repair` reopens the
//! image read-write only for the two fixes the interface calls for: a
//! free-count mismatch, and an active checkpoint region that turned out to
//! be corrupt (switched to the other, valid region).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use clap::Parser;

use rlfs::bio::BufferCache;
use rlfs::checkpoint;
use rlfs::device::Device;
use rlfs::imap::Imap;
use rlfs::inode::{self, IoCtx, ROOT_INO};
use rlfs::param::DEFAULT_BUFFER_CACHE_CAPACITY;
use rlfs::segment::{SegmentState, SegmentTable};
use rlfs::segment_writer::{CleanerSignal, SegmentWriter};
use rlfs::superblock::{RawSuperblock, Superblock, SUPERBLOCK_MAGIC};
use rlfs::Error;

/// Checks an rlfs image for consistency, optionally repairing it.
#[derive(Parser)]
#[command(name = "lfsck", about = "Check an rlfs image for consistency")]
struct Args {
    /// Path to the image file to check.
    path: PathBuf,

    /// Repair free-count mismatches and recover from a corrupt active
    /// checkpoint by switching the superblock to the other, valid region.
    #[arg(long)]
    repair: bool,
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

struct Report {
    errors: Vec<String>,
    warnings: Vec<String>,
    repaired: Vec<String>,
}

impl Report {
    fn new() -> Self {
        Report { errors: Vec::new(), warnings: Vec::new(), repaired: Vec::new() }
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn repaired(&mut self, msg: impl Into<String>) {
        self.repaired.push(msg.into());
    }
}

/// Rewrites block 0 with a patched superblock. Opens its own read-write
/// `Device` rather than reusing the checker's read-only one, so a plain run
/// (no `--repair`) can never reach a code path that writes.
fn write_superblock(path: &std::path::Path, block_size: u32, superblock: &Superblock) -> rlfs::Result<()> {
    let device = Device::open(path, block_size)?;
    device.write_block(0, &superblock.to_block(block_size as usize))?;
    device.sync()
}

fn run(args: Args) -> rlfs::Result<Report> {
    let mut report = Report::new();

    let block_size = probe_block_size(&args.path)?;
    let device = Device::open_read_only(&args.path, block_size)?;

    let mut sb_buf = vec![0u8; block_size as usize];
    device.read_block(0, &mut sb_buf)?;
    let mut superblock = Superblock::from_block(&sb_buf)?;

    let header_a = checkpoint::read_header(&device, &superblock, 0)?;
    let header_b = checkpoint::read_header(&device, &superblock, 1)?;
    let (region, header) = match (header_a, header_b) {
        (Some(ha), Some(hb)) if ha.sequence >= hb.sequence => (0u32, ha),
        (Some(ha), Some(hb)) => {
            let _ = ha;
            (1u32, hb)
        }
        (Some(ha), None) => (0u32, ha),
        (None, Some(hb)) => (1u32, hb),
        (None, None) => {
            report.error("neither checkpoint region has a valid header");
            return Ok(report);
        }
    };
    if header_a.is_none() {
        report.warn("checkpoint region 0 header is missing or invalid");
    }
    if header_b.is_none() {
        report.warn("checkpoint region 1 header is missing or invalid");
    }

    let active_checkpoint = superblock.raw.active_checkpoint;
    let active_region_valid = if active_checkpoint == 0 { header_a.is_some() } else { header_b.is_some() };
    if !active_region_valid {
        if args.repair {
            superblock.raw.active_checkpoint = region;
            write_superblock(&args.path, block_size, &superblock)?;
            report.repaired(format!(
                "active checkpoint region {active_checkpoint} was corrupt; switched the superblock to valid region {region}"
            ));
        } else {
            report.error(format!(
                "active checkpoint region {active_checkpoint} is corrupt; region {region} is valid (rerun with --repair to switch)"
            ));
        }
    }

    let imap_entries = checkpoint::read_imap(&device, &superblock, region, header.imap_entry_count)?;
    let segment_table = checkpoint::read_segment_table(&device, &superblock)?;

    if segment_table.len() as u32 != superblock.total_segments() {
        report.error(format!(
            "segment table length {} does not match superblock total_segments {}",
            segment_table.len(),
            superblock.total_segments()
        ));
    }

    let free_in_table = (0..segment_table.len() as u32).filter(|&id| segment_table.state(id) == SegmentState::Free).count() as u32;
    if free_in_table != superblock.raw.free_segment_count {
        if args.repair {
            let stale = superblock.raw.free_segment_count;
            superblock.raw.free_segment_count = free_in_table;
            write_superblock(&args.path, block_size, &superblock)?;
            report.repaired(format!("free_segment_count corrected from {stale} to {free_in_table}"));
        } else {
            report.warn(format!(
                "superblock free_segment_count {} does not match segment table's {free_in_table} free segments (stale since last checkpoint, expected; rerun with --repair to fix)",
                superblock.raw.free_segment_count
            ));
        }
    }

    let device = Arc::new(device);
    let buffer_cache = Arc::new(BufferCache::new(device.clone(), DEFAULT_BUFFER_CACHE_CAPACITY));
    let segment_table = Arc::new(segment_table);
    let cleaner_signal = CleanerSignal::new();
    let log_head_cursor = Arc::new(AtomicU64::new(header.log_head));
    let segment_writer = Arc::new(SegmentWriter::new(
        device.clone(),
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
    let imap = Imap::from_entries(imap_entries.clone(), superblock.inode_count());

    let mut root_seen = false;
    for entry in &imap_entries {
        if entry.ino == 0 || entry.ino >= superblock.inode_count() {
            report.error(format!("imap entry for ino {} is outside the valid inode range", entry.ino));
            continue;
        }
        if entry.ino == ROOT_INO {
            root_seen = true;
        }
        if superblock.locate_block(entry.location).is_none() {
            report.error(format!("inode {} location {} is outside the log region", entry.ino, entry.location));
            continue;
        }
        match inode::read_inode_record(&ctx, &imap, entry.ino) {
            Ok(data) => {
                if data.ino != entry.ino {
                    report.error(format!("inode record at {} claims ino {} but imap maps {}", entry.location, data.ino, entry.ino));
                }
                if entry.ino == ROOT_INO && !data.is_dir() {
                    report.error("root inode is not a directory");
                }
                for &ptr in data.direct.iter() {
                    if ptr != 0 && superblock.locate_block(ptr as u64).is_none() {
                        report.error(format!("inode {} has a direct pointer {ptr} outside the log region", entry.ino));
                    }
                }
            }
            Err(e) => report.error(format!("failed to read inode {}: {e}", entry.ino)),
        }
    }
    if !root_seen {
        report.error("root inode (ino 1) is missing from the inode map");
    }

    Ok(report)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(report) => {
            for r in &report.repaired {
                println!("repaired: {r}");
            }
            for w in &report.warnings {
                println!("warning: {w}");
            }
            for e in &report.errors {
                println!("error: {e}");
            }
            if report.errors.is_empty() {
                println!("clean: no inconsistencies found");
                ExitCode::SUCCESS
            } else {
                println!("{} error(s) found", report.errors.len());
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("lfsck: {e}");
            ExitCode::FAILURE
        }
    }
}
