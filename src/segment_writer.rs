//! Segment writer: the only component that appends to the log (§4.4).
//!
//! Grounded on `fs/lfs/segment.rs`'s `Segment::push_back_inode` /
//! `push_back_data_block` / `flush` — that file holds the in-memory
//! descriptor array exactly this way, but its `flush` is a
//! `// TODO: write to disk` stub and its descriptor-to-append split
//! (`push_back_inode` then `push_back_data_block`) never actually threads
//! the resulting block address back to the caller. Both gaps are closed
//! here: `append` returns the absolute block address synchronously, and
//! `flush` performs the five-step durable write the spec describes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::segment::{BlockType, Descriptor, SegmentSummary, SegmentTable};
use crate::superblock::Superblock;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// The superblock's `log_head`, shared between the segment writer (which
/// advances it past every segment it flushes and consults it as the
/// allocation sweep's starting point) and the checkpoint manager (which
/// persists its current value into the checkpoint header and the
/// superblock). Kept as a bare atomic rather than inside the `Superblock`
/// struct itself so the hot append path never needs to take the
/// superblock's lock — only checkpoint emission, which is already a
/// global-write-lock-held slow path, does.
pub type LogHeadCursor = Arc<AtomicU64>;

/// A simple wake channel the segment writer signals when it cannot
/// allocate a fresh active segment, and the cleaner thread waits on (§4.10:
/// "wakes on a condition variable fired by the segment writer on
/// 'no free segment', or by a watchdog, or on a five-second timeout").
pub struct CleanerSignal {
    needed: StdMutex<bool>,
    condvar: Condvar,
}

impl CleanerSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(CleanerSignal { needed: StdMutex::new(false), condvar: Condvar::new() })
    }

    pub fn notify_needed(&self) {
        *self.needed.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    pub fn clear(&self) {
        *self.needed.lock().unwrap() = false;
    }

    /// Waits up to `timeout` for a notification, returning whether one
    /// arrived (vs. the poll timeout firing).
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let guard = self.needed.lock().unwrap();
        let (mut guard, _) = self.condvar.wait_timeout(guard, timeout).unwrap();
        let was_needed = *guard;
        *guard = false;
        was_needed
    }
}

struct Staging {
    /// `segment_size_blocks * block_size` bytes; slot 0 is reserved for the
    /// summary and only materialised at flush time.
    buffer: Vec<u8>,
    descriptors: Vec<Descriptor>,
    active_segment: Option<u32>,
    next_slot: u32,
}

pub struct SegmentWriter {
    device: Arc<Device>,
    block_size: u32,
    segment_size_blocks: u32,
    segment_table: Arc<SegmentTable>,
    cleaner_signal: Arc<CleanerSignal>,
    log_head: LogHeadCursor,
    state: Mutex<Staging>,
}

impl SegmentWriter {
    pub fn new(
        device: Arc<Device>,
        segment_table: Arc<SegmentTable>,
        block_size: u32,
        segment_size_blocks: u32,
        cleaner_signal: Arc<CleanerSignal>,
        log_head: LogHeadCursor,
    ) -> Self {
        SegmentWriter {
            device,
            block_size,
            segment_size_blocks,
            segment_table,
            cleaner_signal,
            log_head,
            state: Mutex::new(Staging {
                buffer: vec![0u8; (segment_size_blocks * block_size) as usize],
                descriptors: Vec::new(),
                active_segment: None,
                next_slot: 1,
            }),
        }
    }

    pub fn log_head(&self) -> u64 {
        self.log_head.load(Ordering::Acquire)
    }

    pub fn log_head_cursor(&self) -> LogHeadCursor {
        self.log_head.clone()
    }

    fn ensure_active(&self, state: &mut Staging, superblock: &Superblock) -> Result<()> {
        if state.active_segment.is_some() {
            return Ok(());
        }
        let hint = superblock
            .locate_block(self.log_head.load(Ordering::Acquire))
            .map(|(id, _)| id)
            .unwrap_or(0);
        match self.segment_table.allocate_free_from(hint) {
            Some(id) => {
                state.active_segment = Some(id);
                state.next_slot = 1;
                state.descriptors.clear();
                for b in state.buffer.iter_mut() {
                    *b = 0;
                }
                Ok(())
            }
            None => {
                self.cleaner_signal.notify_needed();
                Err(Error::OutOfSpace)
            }
        }
    }

    /// Appends one payload block, returning its absolute block address.
    /// Flushes and rolls to a fresh active segment automatically when the
    /// current one fills.
    pub fn append(
        &self,
        superblock: &Superblock,
        data: &[u8],
        owning_ino: u32,
        intra_index: u32,
        block_type: BlockType,
    ) -> Result<u64> {
        debug_assert_eq!(data.len(), self.block_size as usize);
        let mut state = self.state.lock();
        self.ensure_active(&mut state, superblock)?;

        let segment_id = state.active_segment.unwrap();
        let slot = state.next_slot;
        let off = (slot * self.block_size) as usize;
        state.buffer[off..off + self.block_size as usize].copy_from_slice(data);
        state.descriptors.push(Descriptor { owning_ino, intra_index, block_type });
        state.next_slot += 1;

        let addr = superblock.segment_start_block(segment_id) + slot as u64;

        if state.next_slot == self.segment_size_blocks {
            self.flush_locked(&mut state, superblock, segment_id)?;
        }
        Ok(addr)
    }

    /// Forces the current partial segment to disk, used by `fsync` and by
    /// the checkpoint manager's step 1. No-op if nothing has been staged.
    pub fn force_flush(&self, superblock: &Superblock) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(segment_id) = state.active_segment else { return Ok(false) };
        if state.next_slot == 1 {
            return Ok(false);
        }
        self.flush_locked(&mut state, superblock, segment_id)?;
        Ok(true)
    }

    fn flush_locked(&self, state: &mut Staging, superblock: &Superblock, segment_id: u32) -> Result<()> {
        let block_count = state.next_slot;
        let summary = SegmentSummary {
            segment_id,
            timestamp: now_secs(),
            block_count,
            descriptors: state.descriptors.clone(),
        };
        let summary_block = summary.encode(self.block_size as usize);
        state.buffer[..self.block_size as usize].copy_from_slice(&summary_block);

        // Step 2: write the segment contiguously (only the blocks actually
        // used; the rest of the staging buffer past block_count is never
        // part of this segment's durable extent).
        let start = superblock.segment_start_block(segment_id);
        let written_len = (block_count * self.block_size) as usize;
        self.device.write_range(start, &state.buffer[..written_len])?;
        self.device.sync()?;

        // Step 3: transition full, with live_blocks = block_count - 1.
        self.segment_table.mark_full(segment_id, block_count.saturating_sub(1), summary.timestamp);

        // Step 4: advance log_head past this segment.
        let next_hint = superblock
            .segment_start_block((segment_id + 1) % self.segment_table.len().max(1) as u32);
        self.log_head.store(next_hint, Ordering::Release);
        log::debug!("segment {segment_id} flushed ({block_count} blocks), log_head -> {next_hint}");

        state.active_segment = None;
        state.next_slot = 1;
        state.descriptors.clear();

        // Step 5: allocate the next active segment right away, inside the
        // same flush, so a call to `append` that fills and flushes a
        // segment fails immediately if there is nowhere left to write,
        // rather than succeeding here and letting some later, unrelated
        // append discover the exhaustion.
        self.ensure_active(state, superblock)
    }

    pub fn segment_size_blocks(&self) -> u32 {
        self.segment_size_blocks
    }

    pub fn cleaner_signal(&self) -> Arc<CleanerSignal> {
        self.cleaner_signal.clone()
    }
}
