//! Runtime policy defaults.
//!
//! On-disk geometry (block size, segment size, region extents) lives in the
//! superblock and must never be hard-coded here — everything in this module
//! is either a format-time default that gets baked into the superblock once,
//! or a pure runtime knob (cache sizes, trigger thresholds) that can differ
//! between mounts of the same image.

/// Default block size in bytes, used by `mklfs` when the caller doesn't
/// override it.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default segment size, in blocks. Chosen so that a segment's summary
/// (§3: "exactly one block, slot 0") can always describe every other block
/// in the segment: with a 4 KiB block, a `SegSumEntry` of 12 bytes and a
/// 32-byte summary header, one block holds up to 338 descriptors, so a
/// segment of 256 blocks (255 payload descriptors) leaves headroom. The
/// spec's "recommended" 4 MiB / 1024-block segment would overflow a
/// single-block summary; see DESIGN.md.
pub const DEFAULT_SEGMENT_SIZE_BLOCKS: u32 = 256;

/// Checkpoint trigger: emit a checkpoint after this many foreground writes
/// since the last one (§4.8).
pub const DEFAULT_CHECKPOINT_WRITE_TRIGGER: u32 = 100;

/// Checkpoint trigger: emit a checkpoint after this many seconds since the
/// last one, regardless of write count (§4.8).
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 30;

/// Below this fraction of free segments, the cleaner is needed (§4.10 `LOW`).
pub const DEFAULT_GC_LOW_WATERMARK: f64 = 0.10;

/// The cleaner runs until the free-segment ratio reaches this fraction
/// (§4.10 `HIGH`, used by the cleaner-progress test scenario in §8).
pub const DEFAULT_GC_HIGH_WATERMARK: f64 = 0.20;

/// Segments at or below this utilisation are eligible for cleaning
/// (§4.10 `CLEAN_CAP`).
pub const DEFAULT_GC_CLEAN_CAP: f64 = 0.50;

/// Maximum number of segments cleaned per cleaner pass (§9).
pub const DEFAULT_GC_WORK_BUDGET: usize = 5;

/// The cleaner wakes on this timeout even without an explicit signal (§4.10).
pub const DEFAULT_GC_POLL_INTERVAL_SECS: u64 = 5;

/// Number of blocks held by the buffer cache.
pub const DEFAULT_BUFFER_CACHE_CAPACITY: usize = 512;

/// Number of in-memory inodes held by the inode cache.
pub const DEFAULT_INODE_CACHE_CAPACITY: usize = 256;

/// Fixed size of an on-disk inode record, in bytes (§3).
pub const INODE_SIZE: usize = 256;

/// Inode records packed per block, for a 4 KiB block (§3: "one block holds
/// 16 records when block is 4 KiB"). Computed from the *configured* block
/// size at runtime via `Superblock::inodes_per_block`; this constant is only
/// the documented reference value for the default geometry.
pub const DEFAULT_INODES_PER_BLOCK: u32 = (DEFAULT_BLOCK_SIZE as usize / INODE_SIZE) as u32;

/// Number of direct block pointers that fit in a 256-byte inode record
/// alongside its other fixed fields (see `inode::DInode` for the exact
/// layout this is derived from).
pub const DIRECT_POINTERS: usize = 29;

/// Directory record alignment, in bytes (§3).
pub const DIRENT_ALIGN: usize = 4;

/// Length of the inline-symlink field in an on-disk inode (§3).
pub const INLINE_SYMLINK_LEN: usize = 64;
