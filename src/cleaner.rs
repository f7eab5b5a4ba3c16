//! Garbage collector: a dedicated background thread selecting and cleaning
//! under-utilised segments (§4.10).
//!
//! Grounded closely on `fs/lfs/cleaner.rs::scan_block`/`scan_segment`/
//! `clean_segment`/`clean` — the liveness predicates per `BlockType` carry
//! over almost directly. The selection policy is replaced with spec.md
//! §4.10's cost-benefit utility (`age * (1-u) / (1+u)`) in place of the
//! teacher's live-block-count threshold, and the teacher's inline call (at
//! transaction end) becomes a real `std::thread` woken by a `Condvar`,
//! matching `fuser`'s concurrency idiom of plain `std::thread`s over custom
//! kernel scheduling. `arrayvec::ArrayVec` for the bounded per-pass
//! cleaned-segment list is carried over unchanged from `fs/lfs/cleaner.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arrayvec::ArrayVec;

use crate::bio::BufferCache;
use crate::checkpoint::CheckpointManager;
use crate::error::Result;
use crate::imap::Imap;
use crate::inode::{self, InodeCache, IoCtx};
use crate::param::{
    DEFAULT_GC_CLEAN_CAP, DEFAULT_GC_HIGH_WATERMARK, DEFAULT_GC_LOW_WATERMARK, DEFAULT_GC_POLL_INTERVAL_SECS,
    DEFAULT_GC_WORK_BUDGET,
};
use crate::segment::{BlockType, SegmentSummary, SegmentTable};
use crate::segment_writer::{CleanerSignal, SegmentWriter};
use crate::superblock::SharedSuperblock;

/// Everything one cleaning pass needs, bundled so `Cleaner::spawn` can move
/// a single value into the background thread closure.
pub struct CleanerContext {
    pub buffer_cache: Arc<BufferCache>,
    pub superblock: SharedSuperblock,
    pub imap: Arc<Imap>,
    pub segment_table: Arc<SegmentTable>,
    pub segment_writer: Arc<SegmentWriter>,
    pub inode_cache: Arc<InodeCache>,
    pub checkpoint: Arc<CheckpointManager>,
    pub signal: Arc<CleanerSignal>,
}

fn needed(segment_table: &SegmentTable) -> bool {
    segment_table.free_ratio() < DEFAULT_GC_LOW_WATERMARK
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Whether the live-list entry at `descriptor` is still referenced by
/// current metadata (§4.10 step 3), and if so, what new address to rewrite
/// it to once relocated is decided by the caller — this only answers the
/// liveness question.
fn is_live(ctx: &IoCtx<'_>, imap: &Imap, inode_cache: &InodeCache, addr: u64, descriptor: &crate::segment::Descriptor) -> Result<bool> {
    match descriptor.block_type {
        BlockType::Inode => Ok(imap.get(descriptor.owning_ino).map(|(_, loc)| loc) == Some(addr)),
        BlockType::Data | BlockType::Dirent => {
            let inode = inode_cache.get(ctx, imap, descriptor.owning_ino)?;
            let data = inode.data.lock();
            Ok(inode::read_block_index(ctx, &data, descriptor.intra_index as u64)? == Some(addr))
        }
        BlockType::Indirect => {
            let inode = inode_cache.get(ctx, imap, descriptor.owning_ino)?;
            let data = inode.data.lock();
            inode::is_indirect_referenced(ctx, &data, addr)
        }
    }
}

/// Cleans one `full` segment (§4.10 `clean(id)`): transitions it to
/// `cleaning`, relocates every block still referenced by current metadata,
/// then frees it. Never escalates a relocation failure past this pass — a
/// corrupt descriptor aborts cleaning this segment and leaves it `full`
/// (§7), to be retried or hand-inspected later.
pub fn clean_segment(ctx: &IoCtx<'_>, imap: &Imap, inode_cache: &InodeCache, id: u32) -> Result<()> {
    ctx.segment_table.mark_cleaning(id)?;

    let start = ctx.superblock.segment_start_block(id);
    let block_size = ctx.superblock.block_size() as usize;

    let summary = {
        let handle = ctx.buffer_cache.get(start)?;
        let block = handle.lock();
        SegmentSummary::decode(block.data())?
    };

    for (slot_index, descriptor) in summary.descriptors.iter().enumerate() {
        let addr = start + 1 + slot_index as u64;
        if !is_live(ctx, imap, inode_cache, addr, descriptor)? {
            continue;
        }

        let mut payload = vec![0u8; block_size];
        {
            let handle = ctx.buffer_cache.get(addr)?;
            payload.copy_from_slice(handle.lock().data());
        }

        let new_addr = ctx.segment_writer.append(
            ctx.superblock,
            &payload,
            descriptor.owning_ino,
            descriptor.intra_index,
            descriptor.block_type,
        )?;

        match descriptor.block_type {
            BlockType::Inode => {
                let version = imap.set(descriptor.owning_ino, new_addr);
                inode_cache.update_location_if_cached(descriptor.owning_ino, new_addr, version);
            }
            BlockType::Data | BlockType::Dirent => {
                let inode = inode_cache.get(ctx, imap, descriptor.owning_ino)?;
                let mut data = inode.data.lock();
                inode::relocate_data_at(ctx, &mut data, descriptor.intra_index as u64, new_addr)?;
            }
            BlockType::Indirect => {
                let inode = inode_cache.get(ctx, imap, descriptor.owning_ino)?;
                let mut data = inode.data.lock();
                inode::relocate_indirect_block(ctx, &mut data, addr, new_addr)?;
            }
        }
    }

    ctx.segment_table.mark_free(id);
    log::debug!("cleaned segment {id}");
    Ok(())
}

/// Owns the background thread. `spawn` returns a handle whose `stop` joins
/// the thread cooperatively (§9: "shutdown sequence sets `running = false`,
/// signals the condition, and awaits thread exit").
pub struct Cleaner {
    running: Arc<AtomicBool>,
    signal: Arc<CleanerSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Cleaner {
    pub fn spawn(context: CleanerContext) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let signal = context.signal.clone();
        let thread_running = running.clone();

        let handle = std::thread::Builder::new()
            .name("rlfs-cleaner".into())
            .spawn(move || run_loop(context, thread_running))
            .expect("failed to spawn cleaner thread");

        Cleaner { running, signal, handle: Some(handle) }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.signal.notify_needed();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(ctx: CleanerContext, running: Arc<AtomicBool>) {
    let poll = Duration::from_secs(DEFAULT_GC_POLL_INTERVAL_SECS);
    while running.load(Ordering::Acquire) {
        ctx.signal.wait_timeout(poll);
        if !running.load(Ordering::Acquire) {
            break;
        }
        if !needed(&ctx.segment_table) {
            continue;
        }
        if let Err(e) = run_pass(&ctx) {
            log::warn!("cleaner pass failed: {e}");
        }
    }
}

fn run_pass(ctx: &CleanerContext) -> Result<()> {
    let mut cleaned: ArrayVec<u32, DEFAULT_GC_WORK_BUDGET> = ArrayVec::new();
    loop {
        if cleaned.is_full() {
            break;
        }
        if ctx.segment_table.free_ratio() >= DEFAULT_GC_HIGH_WATERMARK {
            break;
        }
        let sb_snapshot = ctx.superblock.lock().clone();
        let segment_payload_blocks = sb_snapshot.segment_size_blocks().saturating_sub(1);
        let Some(id) = ctx.segment_table.select_for_cleaning(now_secs(), segment_payload_blocks, DEFAULT_GC_CLEAN_CAP)
        else {
            break;
        };

        let io_ctx = IoCtx {
            buffer_cache: &ctx.buffer_cache,
            segment_writer: &ctx.segment_writer,
            segment_table: &ctx.segment_table,
            superblock: &sb_snapshot,
        };
        clean_segment(&io_ctx, &ctx.imap, &ctx.inode_cache, id)?;
        cleaned.push(id);
    }

    if !cleaned.is_empty() {
        log::info!("cleaner pass reclaimed {} segment(s)", cleaned.len());
        ctx.checkpoint.emit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needed_follows_low_watermark() {
        let table = SegmentTable::new(10);
        // All 10 free: ratio 1.0, well above LOW.
        assert!(!needed(&table));
        for id in 0..9 {
            table.mark_full(id, 0, 0);
        }
        // 1 of 10 free = 0.1, not strictly below LOW (0.10).
        assert!(!needed(&table));
        table.mark_full(9, 0, 0);
        // 0 of 10 free.
        assert!(needed(&table));
    }
}
