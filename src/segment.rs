//! Segment summary on-disk layout, and the in-memory segment table (§3,
//! §4.10).
//!
//! Grounded on `fs/lfs/segment.rs`'s `BlockType`/`SegSumEntry`/`Segment`
//! sketch, generalized from its fixed `[SegSumEntry; SEGSIZE]` in-memory
//! array (and its `// TODO: write to disk` stub `flush`) into a summary
//! that's actually serialized to and read back from slot 0 of a segment,
//! plus the per-segment state table the cleaner and recovery both consult.

use parking_lot::RwLock;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::superblock::SEGMENT_SUMMARY_MAGIC;

/// What kind of block a segment summary slot describes (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Data,
    Inode,
    Indirect,
    Dirent,
}

impl BlockType {
    fn to_u8(self) -> u8 {
        match self {
            BlockType::Data => 0,
            BlockType::Inode => 1,
            BlockType::Indirect => 2,
            BlockType::Dirent => 3,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(BlockType::Data),
            1 => Ok(BlockType::Inode),
            2 => Ok(BlockType::Indirect),
            3 => Ok(BlockType::Dirent),
            other => Err(Error::Corrupt(format!("bad block type tag {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawDescriptor {
    owning_ino: u32,
    intra_index: u32,
    block_type: u8,
    _pad: [u8; 3],
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawHeader {
    timestamp: u64,
    magic: u32,
    segment_id: u32,
    block_count: u32,
    checksum: u32,
}

const HEADER_SIZE: usize = core::mem::size_of::<RawHeader>();
const DESCRIPTOR_SIZE: usize = core::mem::size_of::<RawDescriptor>();

/// One live descriptor: which inode and intra-file index a payload block
/// belongs to, and what kind of block it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub owning_ino: u32,
    pub intra_index: u32,
    pub block_type: BlockType,
}

/// The decoded contents of a segment's slot-0 summary block.
#[derive(Debug, Clone)]
pub struct SegmentSummary {
    pub segment_id: u32,
    pub timestamp: u64,
    pub block_count: u32,
    pub descriptors: Vec<Descriptor>,
}

impl SegmentSummary {
    pub fn max_descriptors(block_size: usize) -> usize {
        (block_size - HEADER_SIZE) / DESCRIPTOR_SIZE
    }

    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        for (i, d) in self.descriptors.iter().enumerate() {
            let raw = RawDescriptor {
                owning_ino: d.owning_ino,
                intra_index: d.intra_index,
                block_type: d.block_type.to_u8(),
                _pad: [0; 3],
            };
            let off = HEADER_SIZE + i * DESCRIPTOR_SIZE;
            buf[off..off + DESCRIPTOR_SIZE].copy_from_slice(raw.as_bytes());
        }
        let checksum = crc32c::crc32c(&buf[HEADER_SIZE..]);
        let header = RawHeader {
            timestamp: self.timestamp,
            magic: SEGMENT_SUMMARY_MAGIC,
            segment_id: self.segment_id,
            block_count: self.block_count,
            checksum,
        };
        buf[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        buf
    }

    /// Decodes a summary block; `Err(Corrupt)` if the magic is absent
    /// (§4.4: "a crash before step 2 completes leaves the segment
    /// invisible") or the checksum doesn't match.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corrupt("segment summary block too short".into()));
        }
        let header = RawHeader::read_from_bytes(&buf[..HEADER_SIZE])
            .map_err(|_| Error::Corrupt("segment summary header layout mismatch".into()))?;
        if header.magic != SEGMENT_SUMMARY_MAGIC {
            return Err(Error::Corrupt(format!(
                "bad segment summary magic: {:#x}",
                header.magic
            )));
        }
        let checksum = crc32c::crc32c(&buf[HEADER_SIZE..]);
        if checksum != header.checksum {
            return Err(Error::Corrupt("segment summary checksum mismatch".into()));
        }
        let payload_count = header.block_count.saturating_sub(1) as usize;
        let max = Self::max_descriptors(buf.len());
        if payload_count > max {
            return Err(Error::Corrupt("segment summary descriptor count overflow".into()));
        }
        let mut descriptors = Vec::with_capacity(payload_count);
        for i in 0..payload_count {
            let off = HEADER_SIZE + i * DESCRIPTOR_SIZE;
            let raw = RawDescriptor::read_from_bytes(&buf[off..off + DESCRIPTOR_SIZE])
                .map_err(|_| Error::Corrupt("segment descriptor layout mismatch".into()))?;
            descriptors.push(Descriptor {
                owning_ino: raw.owning_ino,
                intra_index: raw.intra_index,
                block_type: BlockType::from_u8(raw.block_type)?,
            });
        }
        Ok(SegmentSummary { segment_id: header.segment_id, timestamp: header.timestamp, block_count: header.block_count, descriptors })
    }
}

/// Per-segment lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Free,
    Active,
    Full,
    Cleaning,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawTableEntry {
    timestamp: u64,
    live_blocks: u32,
    state: u8,
    _pad: [u8; 3],
}

fn state_to_u8(s: SegmentState) -> u8 {
    match s {
        SegmentState::Free => 0,
        SegmentState::Active => 1,
        SegmentState::Full => 2,
        SegmentState::Cleaning => 3,
    }
}

fn state_from_u8(v: u8) -> Result<SegmentState> {
    match v {
        0 => Ok(SegmentState::Free),
        1 => Ok(SegmentState::Active),
        2 => Ok(SegmentState::Full),
        3 => Ok(SegmentState::Cleaning),
        other => Err(Error::Corrupt(format!("bad segment state tag {other}"))),
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: SegmentState,
    live_blocks: u32,
    timestamp: u64,
}

pub const SEGMENT_TABLE_ENTRY_SIZE: usize = core::mem::size_of::<RawTableEntry>();

/// Per-segment state (free/active/full/cleaning), live-block accounting,
/// and age, behind one lock per §5's "segment table lock" tier.
pub struct SegmentTable {
    entries: RwLock<Vec<Entry>>,
}

impl SegmentTable {
    pub fn new(total_segments: u32) -> Self {
        SegmentTable {
            entries: RwLock::new(vec![
                Entry { state: SegmentState::Free, live_blocks: 0, timestamp: 0 };
                total_segments as usize
            ]),
        }
    }

    pub fn decode(buf: &[u8], total_segments: u32) -> Result<Self> {
        let mut entries = Vec::with_capacity(total_segments as usize);
        for i in 0..total_segments as usize {
            let off = i * SEGMENT_TABLE_ENTRY_SIZE;
            let raw = RawTableEntry::read_from_bytes(
                buf.get(off..off + SEGMENT_TABLE_ENTRY_SIZE)
                    .ok_or_else(|| Error::Corrupt("segment table truncated".into()))?,
            )
            .map_err(|_| Error::Corrupt("segment table entry layout mismatch".into()))?;
            entries.push(Entry {
                state: state_from_u8(raw.state)?,
                live_blocks: raw.live_blocks,
                timestamp: raw.timestamp,
            });
        }
        Ok(SegmentTable { entries: RwLock::new(entries) })
    }

    pub fn encode(&self) -> Vec<u8> {
        let entries = self.entries.read();
        let mut buf = vec![0u8; entries.len() * SEGMENT_TABLE_ENTRY_SIZE];
        for (i, e) in entries.iter().enumerate() {
            let raw = RawTableEntry {
                timestamp: e.timestamp,
                live_blocks: e.live_blocks,
                state: state_to_u8(e.state),
                _pad: [0; 3],
            };
            let off = i * SEGMENT_TABLE_ENTRY_SIZE;
            buf[off..off + SEGMENT_TABLE_ENTRY_SIZE].copy_from_slice(raw.as_bytes());
        }
        buf
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn state(&self, id: u32) -> SegmentState {
        self.entries.read()[id as usize].state
    }

    pub fn mark_full(&self, id: u32, live_blocks: u32, timestamp: u64) {
        let mut e = self.entries.write();
        e[id as usize] = Entry { state: SegmentState::Full, live_blocks, timestamp };
    }

    pub fn mark_cleaning(&self, id: u32) -> Result<()> {
        let mut e = self.entries.write();
        if e[id as usize].state != SegmentState::Full {
            return Err(Error::InvalidArgument("segment not full"));
        }
        e[id as usize].state = SegmentState::Cleaning;
        Ok(())
    }

    pub fn mark_free(&self, id: u32) {
        let mut e = self.entries.write();
        e[id as usize] = Entry { state: SegmentState::Free, live_blocks: 0, timestamp: 0 };
    }

    /// `mark_dead`: decrements a segment's live-block count, saturating at
    /// zero (§4.10).
    pub fn decrement_live(&self, id: u32) {
        let mut e = self.entries.write();
        e[id as usize].live_blocks = e[id as usize].live_blocks.saturating_sub(1);
    }

    pub fn live_blocks(&self, id: u32) -> u32 {
        self.entries.read()[id as usize].live_blocks
    }

    pub fn timestamp(&self, id: u32) -> u64 {
        self.entries.read()[id as usize].timestamp
    }

    /// First `Free` segment at or after `start_id`, wrapping circularly.
    /// Starting the search at the writer's last-known `log_head` (rather
    /// than always at index 0) keeps allocation sweeping forward through
    /// the log the way a real LFS write pointer does, which is what lets
    /// recovery's circular segment-id walk (§4.9, grounded on the
    /// teacher's `cleaner.rs::clean`'s own `(last_seg_no + i + 1) %
    /// nsegments` scan) find every segment written since the last
    /// checkpoint: a segment the cleaner frees behind the pointer is only
    /// reused once the sweep wraps back around to it, so every segment
    /// ahead of the checkpoint's `log_head` at the time it's chosen is one
    /// this mount actually wrote.
    pub fn allocate_free_from(&self, start_id: u32) -> Option<u32> {
        let mut e = self.entries.write();
        let n = e.len() as u32;
        if n == 0 {
            return None;
        }
        for i in 0..n {
            let id = (start_id + i) % n;
            if e[id as usize].state == SegmentState::Free {
                e[id as usize].state = SegmentState::Active;
                return Some(id);
            }
        }
        None
    }

    pub fn free_count(&self) -> u32 {
        self.entries.read().iter().filter(|e| e.state == SegmentState::Free).count() as u32
    }

    pub fn free_ratio(&self) -> f64 {
        let entries = self.entries.read();
        if entries.is_empty() {
            return 1.0;
        }
        entries.iter().filter(|e| e.state == SegmentState::Free).count() as f64 / entries.len() as f64
    }

    /// Cost-benefit segment selection (§4.10): among `Full` segments at or
    /// under `clean_cap` utilisation, pick the one maximising
    /// `age * (1 - u) / (1 + u)`, ties broken by the lower `segment_id`.
    pub fn select_for_cleaning(
        &self,
        now: u64,
        segment_payload_blocks: u32,
        clean_cap: f64,
    ) -> Option<u32> {
        let entries = self.entries.read();
        let mut best: Option<(u32, f64)> = None;
        for (id, e) in entries.iter().enumerate() {
            if e.state != SegmentState::Full {
                continue;
            }
            let u = e.live_blocks as f64 / segment_payload_blocks.max(1) as f64;
            if u > clean_cap {
                continue;
            }
            let age = now.saturating_sub(e.timestamp) as f64;
            let utility = age * (1.0 - u) / (1.0 + u);
            match best {
                Some((_, best_utility)) if utility <= best_utility => {}
                _ => best = Some((id as u32, utility)),
            }
        }
        best.map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_round_trips() {
        let summary = SegmentSummary {
            segment_id: 7,
            timestamp: 1234,
            block_count: 3,
            descriptors: vec![
                Descriptor { owning_ino: 1, intra_index: 0, block_type: BlockType::Inode },
                Descriptor { owning_ino: 1, intra_index: 0, block_type: BlockType::Data },
            ],
        };
        let encoded = summary.encode(4096);
        let decoded = SegmentSummary::decode(&encoded).unwrap();
        assert_eq!(decoded.segment_id, 7);
        assert_eq!(decoded.descriptors.len(), 2);
        assert_eq!(decoded.descriptors[1].block_type, BlockType::Data);
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let mut buf = vec![0u8; 4096];
        assert!(SegmentSummary::decode(&mut buf).is_err());
    }

    #[test]
    fn selection_prefers_higher_utility() {
        let table = SegmentTable::new(3);
        table.mark_full(0, 200, 0); // u=200/255, old
        table.mark_full(1, 10, 0); // u=10/255, equally old, much emptier
        table.mark_full(2, 250, 0); // over clean cap at 0.5
        let chosen = table.select_for_cleaning(1_000_000, 255, 0.5);
        assert_eq!(chosen, Some(1));
    }
}
