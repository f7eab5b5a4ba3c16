//! Transaction admission: the `begin_op`/`end_op` bracket every foreground
//! mutation runs inside, checkpoint-trigger policy, and the back-pressure
//! that wakes the cleaner before space runs out (§4.8 trigger, §5).
//!
//! Grounded on `fs/lfs/tx.rs::TxManager` (`outstanding`, `committing`,
//! sleep/wakeup around `end_op`'s checkpoint commit), translated from the
//! teacher's kernel-only `SleepableLock`/`WaitChannel` to
//! `std::sync::{Mutex, Condvar}` the way a userspace port of the same
//! pattern would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::checkpoint::CheckpointManager;
use crate::param::{DEFAULT_CHECKPOINT_INTERVAL_SECS, DEFAULT_CHECKPOINT_WRITE_TRIGGER, DEFAULT_GC_LOW_WATERMARK};
use crate::segment::SegmentTable;
use crate::segment_writer::CleanerSignal;

struct Inner {
    outstanding: u32,
    committing: bool,
}

/// Brackets every foreground mutation. Mirrors the teacher's shape almost
/// field-for-field: `outstanding` counts in-flight operations, `committing`
/// blocks new ones from starting while a checkpoint is in flight, and a
/// `Condvar` replaces the kernel's custom wait channel.
pub struct TxManager {
    inner: Mutex<Inner>,
    condvar: Condvar,
    checkpoint: Arc<CheckpointManager>,
    segment_table: Arc<SegmentTable>,
    cleaner_signal: Arc<CleanerSignal>,
    write_trigger: u32,
    checkpoint_interval: Duration,
    writes_since_checkpoint: AtomicU64,
    last_checkpoint_at: Mutex<Instant>,
}

impl TxManager {
    pub fn new(
        checkpoint: Arc<CheckpointManager>,
        segment_table: Arc<SegmentTable>,
        cleaner_signal: Arc<CleanerSignal>,
    ) -> Self {
        TxManager {
            inner: Mutex::new(Inner { outstanding: 0, committing: false }),
            condvar: Condvar::new(),
            checkpoint,
            segment_table,
            cleaner_signal,
            write_trigger: DEFAULT_CHECKPOINT_WRITE_TRIGGER,
            checkpoint_interval: Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECS),
            writes_since_checkpoint: AtomicU64::new(0),
            last_checkpoint_at: Mutex::new(Instant::now()),
        }
    }

    pub fn with_triggers(mut self, write_trigger: u32, checkpoint_interval: Duration) -> Self {
        self.write_trigger = write_trigger;
        self.checkpoint_interval = checkpoint_interval;
        self
    }

    /// Called at the start of every mutating upcall. Blocks while a
    /// checkpoint commit is in flight, same as the teacher's `begin_op`.
    pub fn begin_op(&self) {
        let mut guard = self.inner.lock().unwrap();
        while guard.committing {
            guard = self.condvar.wait(guard).unwrap();
        }
        guard.outstanding += 1;
    }

    /// Called at the end of every mutating upcall. The last concurrent
    /// operation to leave triggers a checkpoint if the write-count or
    /// interval trigger has fired, and wakes the cleaner if the free-segment
    /// ratio has dropped below `LOW` (§4.10 `needed()`).
    pub fn end_op(&self) -> crate::error::Result<()> {
        self.writes_since_checkpoint.fetch_add(1, Ordering::Relaxed);
        let should_commit = {
            let mut guard = self.inner.lock().unwrap();
            guard.outstanding -= 1;
            assert!(!guard.committing);
            if guard.outstanding == 0 && self.trigger_fired() {
                guard.committing = true;
                true
            } else {
                false
            }
        };

        if should_commit {
            let result = self.checkpoint.emit();
            self.writes_since_checkpoint.store(0, Ordering::Relaxed);
            *self.last_checkpoint_at.lock().unwrap() = Instant::now();
            let mut guard = self.inner.lock().unwrap();
            guard.committing = false;
            drop(guard);
            self.condvar.notify_all();
            result?;
        } else {
            self.condvar.notify_all();
        }

        if self.segment_table.free_ratio() < DEFAULT_GC_LOW_WATERMARK {
            self.cleaner_signal.notify_needed();
        }
        Ok(())
    }

    fn trigger_fired(&self) -> bool {
        let writes = self.writes_since_checkpoint.load(Ordering::Relaxed);
        if writes >= self.write_trigger as u64 {
            return true;
        }
        self.last_checkpoint_at.lock().unwrap().elapsed() >= self.checkpoint_interval
    }

    /// Forces an immediate checkpoint regardless of the trigger, used by
    /// `fsync` and `unmount`.
    pub fn force_checkpoint(&self) -> crate::error::Result<()> {
        {
            let mut guard = self.inner.lock().unwrap();
            while guard.committing {
                guard = self.condvar.wait(guard).unwrap();
            }
            guard.committing = true;
        }
        let result = self.checkpoint.emit();
        self.writes_since_checkpoint.store(0, Ordering::Relaxed);
        *self.last_checkpoint_at.lock().unwrap() = Instant::now();
        self.inner.lock().unwrap().committing = false;
        self.condvar.notify_all();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outstanding_bracket_is_balanced() {
        // Exercises only the in-memory admission bookkeeping (no real
        // checkpoint is triggered since writes_since_checkpoint stays 0 and
        // the interval trigger needs real wall-clock time to fire).
        let inner = Mutex::new(Inner { outstanding: 0, committing: false });
        {
            let mut g = inner.lock().unwrap();
            g.outstanding += 1;
            assert_eq!(g.outstanding, 1);
        }
        {
            let mut g = inner.lock().unwrap();
            g.outstanding -= 1;
            assert_eq!(g.outstanding, 0);
        }
    }
}
