//! Cross-module integration scenarios run against a real temp-file image,
//! never through FUSE — exercising `fs::Lfs` the way `adapter.rs` does, but
//! without needing an actual mount (§8's testable properties: persistence
//! across remount, crash roll-forward, cleaner progress, cross-directory
//! rename bookkeeping, and space exhaustion recovery).

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use rlfs::bio::BufferCache;
use rlfs::checkpoint::CheckpointManager;
use rlfs::device::Device;
use rlfs::directory;
use rlfs::imap::Imap;
use rlfs::inode::{self, InodeCache, IoCtx, ROOT_INO, S_IFDIR};
use rlfs::param::DEFAULT_GC_POLL_INTERVAL_SECS;
use rlfs::segment::{BlockType, SegmentTable};
use rlfs::segment_writer::{CleanerSignal, SegmentWriter};
use rlfs::superblock::Superblock;
use rlfs::{Error, Lfs, MountOptions};

/// Formats a fresh image the same way `mklfs` does, without shelling out to
/// the binary. Kept in lock step with `bin/mklfs.rs` by construction: both
/// go through nothing but `Superblock`/`SegmentWriter`/`CheckpointManager`.
fn format_image(
    path: &std::path::Path,
    block_count: u64,
    block_size: u32,
    segment_size_blocks: u32,
    inode_count: u32,
) -> rlfs::Result<()> {
    let uuid = [7u8; 16];
    let mut superblock = Superblock::format(block_count, block_size, segment_size_blocks, inode_count, uuid, 0)?;
    superblock.raw.active_checkpoint = 1;

    let device = Arc::new(Device::create(path, block_size, block_count)?);
    let shared_superblock = Arc::new(parking_lot::Mutex::new(superblock));
    let sb_snapshot = shared_superblock.lock().clone();

    let buffer_cache = Arc::new(BufferCache::new(device.clone(), 64));
    let segment_table = Arc::new(SegmentTable::new(sb_snapshot.total_segments()));
    let imap = Arc::new(Imap::new(sb_snapshot.inode_count()));
    let cleaner_signal = CleanerSignal::new();
    let log_head_cursor = Arc::new(AtomicU64::new(sb_snapshot.log_start_block()));
    let segment_writer = Arc::new(SegmentWriter::new(
        device.clone(),
        segment_table.clone(),
        block_size,
        segment_size_blocks,
        cleaner_signal,
        log_head_cursor,
    ));
    let inode_cache = Arc::new(InodeCache::new(32));

    {
        let ctx = IoCtx {
            buffer_cache: &buffer_cache,
            segment_writer: &segment_writer,
            segment_table: &segment_table,
            superblock: &sb_snapshot,
        };
        let root = inode_cache.alloc(&ctx, &imap, S_IFDIR | 0o755, 0, 0, 0)?;
        let init_block = directory::init(ROOT_INO, ROOT_INO, block_size as usize);
        let mut data = root.data.lock();
        data.nlink = 2;
        let addr = segment_writer.append(&sb_snapshot, &init_block, root.ino, 0, BlockType::Dirent)?;
        inode::write_block_index(&ctx, &mut data, 0, addr)?;
        data.block_count = 1;
        data.size = block_size as u64;
        inode::write_inode_record(&ctx, &imap, &mut data)?;
    }

    let checkpoint = CheckpointManager::new(device, buffer_cache, shared_superblock, imap, segment_table, segment_writer, inode_cache, 0);
    checkpoint.emit()
}

fn temp_image() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.lfs");
    (dir, path)
}

#[test]
fn persists_a_file_across_remount() {
    let (_dir, path) = temp_image();
    format_image(&path, 512, 4096, 32, 64).unwrap();

    let lfs = Lfs::mount(&path, MountOptions::default()).unwrap();
    let root = lfs.root();
    let attr = lfs.create(root, "hello.txt", 0o644, 1000, 1000).unwrap();
    lfs.write(attr.ino, 0, b"hello, log-structured world").unwrap();
    lfs.fsync(attr.ino).unwrap();
    lfs.unmount().unwrap();
    drop(lfs);

    let lfs2 = Lfs::mount(&path, MountOptions::default()).unwrap();
    let found = lfs2.lookup(lfs2.root(), "hello.txt").unwrap();
    let data = lfs2.read(found.ino, 0, 64).unwrap();
    assert_eq!(&data[..28], b"hello, log-structured world");
    assert_eq!(found.size, 28);
    lfs2.unmount().unwrap();
}

#[test]
fn large_file_spans_direct_and_indirect_pointers() {
    let (_dir, path) = temp_image();
    // 1 MiB of payload at 4 KiB blocks is 256 blocks: past the 29 direct
    // pointers, exercising the single-indirect path (but not double-
    // indirect, which needs far more blocks than this test's image holds).
    format_image(&path, 4096, 4096, 64, 64).unwrap();

    let lfs = Lfs::mount(&path, MountOptions::default()).unwrap();
    let attr = lfs.create(lfs.root(), "big.bin", 0o644, 0, 0).unwrap();

    let chunk = vec![0xAB_u8; 65536];
    let mut written = 0u64;
    while written < 1_048_576 {
        lfs.write(attr.ino, written, &chunk).unwrap();
        written += chunk.len() as u64;
    }
    lfs.fsync(attr.ino).unwrap();

    let readback = lfs.read(attr.ino, 1_048_576 - 65536, 65536).unwrap();
    assert_eq!(readback, chunk);
    let final_attr = lfs.getattr(attr.ino).unwrap();
    assert_eq!(final_attr.size, 1_048_576);
    lfs.unmount().unwrap();
}

#[test]
fn survives_crash_without_clean_unmount() {
    let (_dir, path) = temp_image();
    // A small segment size so a handful of writes fill and durably flush at
    // least one full segment before the process "crashes".
    format_image(&path, 512, 4096, 8, 64).unwrap();

    {
        let lfs = Lfs::mount(&path, MountOptions::default()).unwrap();
        let attr = lfs.create(lfs.root(), "durable.txt", 0o644, 0, 0).unwrap();
        for i in 0..16u64 {
            lfs.write(attr.ino, i * 4096, &vec![i as u8; 4096]).unwrap();
        }
        // No `unmount()` call: drop simulates a crash after the writes have
        // landed in full segments on disk but before any clean shutdown.
    }

    let lfs2 = Lfs::mount(&path, MountOptions::default()).unwrap();
    let found = lfs2.lookup(lfs2.root(), "durable.txt").unwrap();
    let data = lfs2.read(found.ino, 0, 4096).unwrap();
    assert_eq!(data, vec![0u8; 4096]);
    lfs2.unmount().unwrap();
}

#[test]
fn rename_across_directories_updates_links_and_dotdot() {
    let (_dir, path) = temp_image();
    format_image(&path, 512, 4096, 16, 64).unwrap();

    let lfs = Lfs::mount(&path, MountOptions::default()).unwrap();
    let root = lfs.root();
    let dir_a = lfs.mkdir(root, "a", 0o755, 0, 0).unwrap();
    let dir_b = lfs.mkdir(root, "b", 0o755, 0, 0).unwrap();
    let moved = lfs.mkdir(dir_a.ino, "child", 0o755, 0, 0).unwrap();

    let a_before = lfs.getattr(dir_a.ino).unwrap();
    let b_before = lfs.getattr(dir_b.ino).unwrap();

    lfs.rename(dir_a.ino, "child", dir_b.ino, "child").unwrap();

    let a_after = lfs.getattr(dir_a.ino).unwrap();
    let b_after = lfs.getattr(dir_b.ino).unwrap();
    assert_eq!(a_after.nlink, a_before.nlink - 1);
    assert_eq!(b_after.nlink, b_before.nlink + 1);

    let entries = lfs.readdir(moved.ino, 0).unwrap();
    let dotdot = entries.iter().find(|e| e.name == "..").unwrap();
    assert_eq!(dotdot.ino, dir_b.ino);

    assert!(lfs.lookup(dir_a.ino, "child").is_err());
    let found = lfs.lookup(dir_b.ino, "child").unwrap();
    assert_eq!(found.ino, moved.ino);
    lfs.unmount().unwrap();
}

#[test]
fn cleaner_recovers_free_segments_under_churn() {
    let (_dir, path) = temp_image();
    // Small image, small segments: easy to push free_ratio below the low
    // watermark with a handful of file writes and deletions.
    format_image(&path, 320, 4096, 8, 128).unwrap();

    let lfs = Lfs::mount(&path, MountOptions::default()).unwrap();
    let root = lfs.root();

    let mut inos = Vec::new();
    for i in 0..20 {
        let attr = lfs.create(root, &format!("churn{i}.bin"), 0o644, 0, 0).unwrap();
        lfs.write(attr.ino, 0, &vec![0x5A_u8; 28 * 4096]).unwrap();
        inos.push((i, attr.ino));
    }
    let before = lfs.statfs().unwrap();

    // Delete most of what was just written so the segments holding it
    // become mostly-dead and eligible for cleaning.
    for (i, _) in inos.iter().take(16) {
        lfs.unlink(root, &format!("churn{i}.bin")).unwrap();
    }
    lfs.fsync(root).unwrap();

    // Give the background cleaner a few poll cycles to catch up.
    std::thread::sleep(Duration::from_secs(DEFAULT_GC_POLL_INTERVAL_SECS * 3));

    let after = lfs.statfs().unwrap();
    assert!(
        after.free_blocks >= before.free_blocks,
        "expected cleaner to reclaim at least as many free blocks as before deletion (before={}, after={})",
        before.free_blocks,
        after.free_blocks
    );
    lfs.unmount().unwrap();
}

#[test]
fn write_fails_cleanly_when_out_of_space() {
    let (_dir, path) = temp_image();
    format_image(&path, 96, 4096, 8, 32).unwrap();

    let lfs = Lfs::mount(&path, MountOptions::default()).unwrap();
    let root = lfs.root();

    let mut last_err = None;
    'outer: for i in 0..64 {
        let attr = match lfs.create(root, &format!("f{i}"), 0o644, 0, 0) {
            Ok(a) => a,
            Err(e) => {
                last_err = Some(e);
                break 'outer;
            }
        };
        for block in 0..64u64 {
            if let Err(e) = lfs.write(attr.ino, block * 4096, &vec![1u8; 4096]) {
                last_err = Some(e);
                break 'outer;
            }
        }
    }

    match last_err {
        Some(Error::OutOfSpace) => {}
        Some(other) => panic!("expected OutOfSpace, got {other:?}"),
        None => panic!("expected the image to run out of space"),
    }

    // The file system must still answer read-only queries after exhaustion.
    let entries = lfs.readdir(root, 0).unwrap();
    assert!(!entries.is_empty());
    lfs.unmount().unwrap();
}
