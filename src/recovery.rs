//! Crash recovery: choose the authoritative checkpoint, then roll forward
//! through the segments it doesn't yet cover (§4.9).
//!
//! No direct teacher code exists for this — `Lfs::init` in the reference
//! `fs/lfs/mod.rs` is `todo!()`. Grounded instead on the *cleaner's*
//! segment-scanning pattern in `fs/lfs/cleaner.rs::scan_seg_sum`/
//! `scan_segment` for how to walk a segment's summary safely, and on
//! spec.md §4.9 directly for the replay predicate and stop condition.

use crate::checkpoint::{self, RawCheckpointHeader};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::imap::Imap;
use crate::segment::{SegmentSummary, SegmentTable};
use crate::superblock::Superblock;

/// Everything recovery hands back to the mount path: the rebuilt IMAP and
/// segment table, the advanced log head, and which checkpoint region / what
/// sequence the next emitted checkpoint should supersede.
pub struct RecoveredState {
    pub imap: Imap,
    pub segment_table: SegmentTable,
    pub log_head: u64,
    pub active_region: u32,
    pub sequence: u32,
    /// Whether roll-forward replayed at least one segment past the
    /// checkpoint — surfaced purely for logging ("unclean shutdown"
    /// detection is the superblock's `clean_flag`, not this).
    pub replayed_segments: u32,
}

fn choose_header(device: &Device, superblock: &Superblock) -> Result<(u32, RawCheckpointHeader)> {
    let a = checkpoint::read_header(device, superblock, 0)?;
    let b = checkpoint::read_header(device, superblock, 1)?;
    match (a, b) {
        (Some(ha), Some(hb)) => {
            if ha.sequence >= hb.sequence {
                Ok((0, ha))
            } else {
                Ok((1, hb))
            }
        }
        (Some(ha), None) => Ok((0, ha)),
        (None, Some(hb)) => Ok((1, hb)),
        (None, None) => Err(Error::Corrupt("no valid checkpoint header found in either region".into())),
    }
}

/// Runs the full §4.9 protocol. Does not itself emit the fresh checkpoint
/// step 6 calls for — the caller (`fs::Lfs::mount`) does that once it has
/// assembled live `SegmentWriter`/`CheckpointManager` instances from this
/// state, since recovery runs before any component that can append exists.
pub fn recover(device: &Device, superblock: &Superblock) -> Result<RecoveredState> {
    let (active_region, header) = choose_header(device, superblock)?;
    log::info!(
        "recovery: chosen checkpoint region {active_region}, sequence {}, log_head {}",
        header.sequence,
        header.log_head
    );

    let imap_entries = checkpoint::read_imap(device, superblock, active_region, header.imap_entry_count)?;
    let imap = Imap::from_entries(imap_entries, superblock.inode_count());
    let segment_table = checkpoint::read_segment_table(device, superblock)?;

    let total_segments = superblock.total_segments();
    let (mut cursor_segment, _) = superblock
        .locate_block(header.log_head)
        .unwrap_or((0, 0));

    let mut log_head = header.log_head;
    let mut replayed = 0u32;
    let block_size = superblock.block_size() as usize;

    for i in 0..total_segments {
        let id = (cursor_segment + i) % total_segments.max(1);
        let start = superblock.segment_start_block(id);
        let mut buf = vec![0u8; block_size];
        if device.read_block(start, &mut buf).is_err() {
            break;
        }
        let summary = match SegmentSummary::decode(&buf) {
            Ok(s) => s,
            Err(_) => break,
        };
        if summary.timestamp < header.timestamp {
            break;
        }

        for (slot_index, descriptor) in summary.descriptors.iter().enumerate() {
            if descriptor.block_type == crate::segment::BlockType::Inode && descriptor.owning_ino != 0 {
                let addr = start + 1 + slot_index as u64;
                imap.set(descriptor.owning_ino, addr);
            }
        }

        segment_table.mark_full(id, summary.block_count.saturating_sub(1), summary.timestamp);
        log_head = superblock.segment_start_block((id + 1) % total_segments.max(1));
        cursor_segment = (id + 1) % total_segments.max(1);
        replayed += 1;
    }

    log::info!("recovery: replayed {replayed} segment(s), new log_head {log_head}");

    Ok(RecoveredState {
        imap,
        segment_table,
        log_head,
        active_region,
        sequence: header.sequence,
        replayed_segments: replayed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock::CLEAN;
    use tempfile::NamedTempFile;

    #[test]
    fn choose_header_prefers_higher_sequence() {
        let tmp = NamedTempFile::new().unwrap();
        let block_size = 4096u32;
        let total_blocks = 64u64;
        let sb = Superblock::format(total_blocks, block_size, 8, 16, [0u8; 16], 0).unwrap();
        let dev = Device::create(tmp.path(), block_size, total_blocks).unwrap();
        dev.write_block(0, &sb.to_block(block_size as usize)).unwrap();

        // Write a complete header at region 0 with sequence 1.
        let mut header = RawCheckpointHeader {
            timestamp: 0,
            log_head: sb.log_start_block(),
            magic: crate::superblock::CHECKPOINT_MAGIC,
            version: crate::superblock::FORMAT_VERSION,
            sequence: 1,
            imap_entry_count: 0,
            segment_entry_count: sb.total_segments(),
            checksum: 0,
            complete_flag: 1,
            _pad: 0,
        };
        let checksum = {
            use zerocopy::IntoBytes;
            let mut c = header;
            c.checksum = 0;
            crc32c::crc32c(c.as_bytes())
        };
        header.checksum = checksum;
        let mut buf = vec![0u8; block_size as usize];
        {
            use zerocopy::IntoBytes;
            buf[..core::mem::size_of::<RawCheckpointHeader>()].copy_from_slice(header.as_bytes());
        }
        dev.write_block(sb.checkpoint_region_block(0), &buf).unwrap();

        let segment_table_bytes = vec![0u8; sb.total_segments() as usize * 16];
        dev.write_range(sb.segment_table_block(), &pad(segment_table_bytes, block_size as usize)).unwrap();

        let recovered = recover(&dev, &sb).unwrap();
        assert_eq!(recovered.active_region, 0);
        assert_eq!(recovered.sequence, 1);
        let _ = CLEAN;
    }

    fn pad(mut bytes: Vec<u8>, block_size: usize) -> Vec<u8> {
        let len = bytes.len().div_ceil(block_size) * block_size;
        bytes.resize(len, 0);
        bytes
    }
}
