//! On-disk superblock (block 0) and the geometry every other component
//! derives its block addresses from (§3, §6).
//!
//! Grounded on the teacher's `fs/lfs/superblock.rs` / `fs/ufs/superblock.rs`
//! `Superblock` type and its `seg_to_disk_block_no`/`disk_to_seg_block_no`
//! pair of helpers, extended with the checkpoint/UUID/epoch fields the
//! checkpoint manager and recovery need. `zerocopy` gives the bit-exact
//! little-endian layout the spec requires without a hand-rolled byte
//! cursor.

use std::sync::Arc;

use parking_lot::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::param::{DIRECT_POINTERS, INODE_SIZE};

pub const SUPERBLOCK_MAGIC: u32 = 0x4C53_4653;
pub const CHECKPOINT_MAGIC: u32 = 0x4348_4B50;
pub const SEGMENT_SUMMARY_MAGIC: u32 = 0x5345_474D;
pub const FORMAT_VERSION: u32 = 1;

/// The fixed-size, bit-exact block-0 layout. Field order is chosen so that
/// `repr(C)` introduces no inter-field padding: every 8-byte field precedes
/// every 4-byte field, which precedes the trailing byte array.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawSuperblock {
    pub total_blocks: u64,
    pub checkpoint_block: [u64; 2],
    pub log_head: u64,
    pub created_at: u64,
    pub mounted_at: u64,
    pub segment_table_block: u64,
    pub log_start_block: u64,

    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub segment_size_blocks: u32,
    pub total_segments: u32,
    pub inode_count: u32,
    pub active_checkpoint: u32,
    pub free_segment_count: u32,
    pub clean_flag: u32,
    pub mount_count: u32,
    pub checkpoint_region_blocks: u32,
    pub segment_table_blocks: u32,

    pub uuid: [u8; 16],
}

impl RawSuperblock {
    pub const SIZE: usize = core::mem::size_of::<RawSuperblock>();
}

/// 1 when the filesystem was unmounted cleanly, 0 while mounted or after a
/// crash; recovery treats 0 as "roll-forward required", not an error.
pub const CLEAN: u32 = 1;
pub const DIRTY: u32 = 0;

/// The in-memory superblock: the raw header plus the geometry helpers every
/// component uses instead of hard-coding offsets (§3: "all offsets are
/// computed from constants in the superblock").
#[derive(Debug, Clone)]
pub struct Superblock {
    pub raw: RawSuperblock,
}

impl Superblock {
    /// Lays out a fresh superblock for an image of `total_blocks` blocks,
    /// choosing checkpoint-region and segment-table sizes from
    /// `inode_count`/`total_segments`. Used only by the formatter.
    pub fn format(
        total_blocks: u64,
        block_size: u32,
        segment_size_blocks: u32,
        inode_count: u32,
        uuid: [u8; 16],
        now: u64,
    ) -> Result<Self> {
        // IMAP entries are (ino: u32, version: u32, location: u64) = 16 bytes.
        let imap_bytes = inode_count as u64 * 16;
        let imap_blocks = imap_bytes.div_ceil(block_size as u64) as u32;
        let checkpoint_region_blocks = 1 + imap_blocks; // header block + imap blocks

        let checkpoint_a = 1u64;
        let checkpoint_b = checkpoint_a + checkpoint_region_blocks as u64;
        let segment_table_block = checkpoint_b + checkpoint_region_blocks as u64;

        if total_blocks <= segment_size_blocks as u64 {
            return Err(Error::InvalidArgument("image too small for one segment"));
        }
        let total_segments = ((total_blocks.saturating_sub(segment_table_block))
            / segment_size_blocks as u64) as u32;
        // Segment table: one 16-byte entry (id implicit by index: state u8,
        // live_blocks u32, timestamp u64, padding) per segment.
        const SEGMENT_TABLE_ENTRY_SIZE: u64 = 16;
        let segment_table_bytes = total_segments as u64 * SEGMENT_TABLE_ENTRY_SIZE;
        let segment_table_blocks = segment_table_bytes.div_ceil(block_size as u64) as u32;
        let log_start_block = segment_table_block + segment_table_blocks as u64;

        if total_segments == 0 {
            return Err(Error::InvalidArgument("image too small to hold any segment"));
        }

        let raw = RawSuperblock {
            total_blocks,
            checkpoint_block: [checkpoint_a, checkpoint_b],
            log_head: log_start_block,
            created_at: now,
            mounted_at: now,
            segment_table_block,
            log_start_block,
            magic: SUPERBLOCK_MAGIC,
            version: FORMAT_VERSION,
            block_size,
            segment_size_blocks,
            total_segments,
            inode_count,
            active_checkpoint: 0,
            free_segment_count: total_segments,
            clean_flag: CLEAN,
            mount_count: 0,
            checkpoint_region_blocks,
            segment_table_blocks,
            uuid,
        };
        Ok(Superblock { raw })
    }

    pub fn from_block(buf: &[u8]) -> Result<Self> {
        if buf.len() < RawSuperblock::SIZE {
            return Err(Error::Corrupt("superblock block too short".into()));
        }
        let raw = RawSuperblock::read_from_bytes(&buf[..RawSuperblock::SIZE])
            .map_err(|_| Error::Corrupt("superblock layout mismatch".into()))?;
        if raw.magic != SUPERBLOCK_MAGIC {
            return Err(Error::Corrupt(format!(
                "bad superblock magic: {:#x}",
                raw.magic
            )));
        }
        if raw.version != FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported on-disk version: {}",
                raw.version
            )));
        }
        Ok(Superblock { raw })
    }

    pub fn to_block(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        buf[..RawSuperblock::SIZE].copy_from_slice(self.raw.as_bytes());
        buf
    }

    pub fn block_size(&self) -> u32 {
        self.raw.block_size
    }

    pub fn segment_size_blocks(&self) -> u32 {
        self.raw.segment_size_blocks
    }

    pub fn total_segments(&self) -> u32 {
        self.raw.total_segments
    }

    pub fn inode_count(&self) -> u32 {
        self.raw.inode_count
    }

    pub fn inodes_per_block(&self) -> u32 {
        self.raw.block_size / INODE_SIZE as u32
    }

    pub fn checkpoint_region_block(&self, region: u32) -> u64 {
        self.raw.checkpoint_block[region as usize]
    }

    pub fn checkpoint_region_blocks(&self) -> u32 {
        self.raw.checkpoint_region_blocks
    }

    pub fn segment_table_block(&self) -> u64 {
        self.raw.segment_table_block
    }

    pub fn log_start_block(&self) -> u64 {
        self.raw.log_start_block
    }

    /// First absolute block address of segment `segment_id`.
    pub fn segment_start_block(&self, segment_id: u32) -> u64 {
        self.raw.log_start_block + segment_id as u64 * self.raw.segment_size_blocks as u64
    }

    /// Inverse of `segment_start_block` for an arbitrary block inside the
    /// log region: which segment owns it, and the offset within it.
    pub fn locate_block(&self, block_no: u64) -> Option<(u32, u32)> {
        if block_no < self.raw.log_start_block {
            return None;
        }
        let rel = block_no - self.raw.log_start_block;
        let segment_id = rel / self.raw.segment_size_blocks as u64;
        if segment_id >= self.raw.total_segments as u64 {
            return None;
        }
        let offset = (rel % self.raw.segment_size_blocks as u64) as u32;
        Some((segment_id as u32, offset))
    }

    /// Block address and intra-block slot holding inode record `ino`,
    /// given its IMAP-recorded block location.
    pub fn inode_slot(&self, location: u64, ino: u32) -> (u64, u32) {
        (location, ino % self.inodes_per_block())
    }

    pub fn max_direct_bytes(&self) -> u64 {
        DIRECT_POINTERS as u64 * self.raw.block_size as u64
    }
}

/// The handful of superblock fields that mutate after format time
/// (`active_checkpoint`, `free_segment_count`, `clean_flag`, `mount_count`,
/// `mounted_at`) live behind this shared lock; `log_head` does not — it has
/// its own lock-free `LogHeadCursor` (see `segment_writer`) since it's on
/// every append's hot path, while these fields only change at checkpoint
/// and (u)mount time.
pub type SharedSuperblock = Arc<Mutex<Superblock>>;
