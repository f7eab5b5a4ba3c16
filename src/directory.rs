//! Directory body format: variable-length, 4-byte-aligned records (§3,
//! §4.7).
//!
//! Grounded on `fs/ufs/inode.rs`'s `Dirent`/`dirlink`/`dirlookup`/
//! `is_dir_empty`, generalized from that file's fixed 14-byte name field
//! (`DIRSIZ`) to the variable-length `rec_len` record the spec calls for,
//! so names longer than 14 bytes aren't silently truncated.

use crate::error::{Error, Result};
use crate::param::DIRENT_ALIGN;

/// File type tag carried in a directory record, mirroring `fuser`'s
/// `FileType` closely enough that the adapter can translate it in one
/// match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

impl FileType {
    fn to_u8(self) -> u8 {
        match self {
            FileType::RegularFile => 1,
            FileType::Directory => 2,
            FileType::Symlink => 3,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(FileType::RegularFile),
            2 => Ok(FileType::Directory),
            3 => Ok(FileType::Symlink),
            other => Err(Error::Corrupt(format!("bad directory entry type tag {other}"))),
        }
    }
}

/// One decoded directory record. `ino == 0` marks a tombstone.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u32,
    pub rec_len: u16,
    pub file_type: FileType,
    pub name: String,
    pub offset: u64,
}

const HEADER_LEN: usize = 4 + 2 + 1 + 1; // ino, rec_len, name_len, file_type

fn padded_len(name_len: usize) -> u16 {
    let raw = HEADER_LEN + name_len;
    raw.div_ceil(DIRENT_ALIGN) as u16 * DIRENT_ALIGN as u16
}

/// Scans a directory body buffer (the concatenation of a directory
/// inode's data blocks) and returns every non-tombstoned, well-formed
/// record. Stops (rather than erroring) at the first record whose header
/// doesn't fit — the directory is logically over at that offset.
pub fn scan(buf: &[u8], base_offset: u64) -> Vec<DirEntry> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + HEADER_LEN <= buf.len() {
        let ino = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        let rec_len = u16::from_le_bytes(buf[pos + 4..pos + 6].try_into().unwrap());
        let name_len = buf[pos + 6] as usize;
        let file_type_raw = buf[pos + 7];
        if rec_len == 0 || pos + rec_len as usize > buf.len() {
            break;
        }
        if ino != 0 {
            if let Ok(file_type) = FileType::from_u8(file_type_raw) {
                let name_bytes = &buf[pos + HEADER_LEN..pos + HEADER_LEN + name_len];
                if let Ok(name) = String::from_utf8(name_bytes.to_vec()) {
                    out.push(DirEntry { ino, rec_len, file_type, name, offset: base_offset + pos as u64 });
                }
            }
        }
        pos += rec_len as usize;
    }
    out
}

/// Finds `name`'s live record, if any (§4.7 `lookup`).
pub fn lookup(buf: &[u8], name: &str) -> Option<DirEntry> {
    scan(buf, 0).into_iter().find(|e| e.name == name)
}

pub fn is_empty(buf: &[u8]) -> bool {
    scan(buf, 0).iter().all(|e| e.name == "." || e.name == "..")
}

/// Encodes one record, `rec_len`-padded to 4 bytes, ready to be spliced
/// into a directory body.
fn encode(ino: u32, file_type: FileType, name: &str) -> Vec<u8> {
    let rec_len = padded_len(name.len());
    let mut buf = vec![0u8; rec_len as usize];
    buf[0..4].copy_from_slice(&ino.to_le_bytes());
    buf[4..6].copy_from_slice(&rec_len.to_le_bytes());
    buf[6] = name.len() as u8;
    buf[7] = file_type.to_u8();
    buf[HEADER_LEN..HEADER_LEN + name.len()].copy_from_slice(name.as_bytes());
    buf
}

/// Result of `add`: the byte range of the directory body to overwrite (a
/// tombstone slot, tail slack of the last record, or a brand new record
/// appended past the current end) and the bytes to write there.
pub struct Splice {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Adds `(name, ino, file_type)` to a directory whose current body is
/// `buf` (§4.7 `add`). Fails with `Error::Exists` if `name` is already
/// live. Picks the first tombstoned slot whose `rec_len` is large enough,
/// else the tail slack of the last record, else appends past the end.
pub fn add(buf: &[u8], name: &str, ino: u32, file_type: FileType) -> Result<Splice> {
    if name.len() > u8::MAX as usize {
        return Err(Error::InvalidArgument("directory entry name too long"));
    }
    if lookup(buf, name).is_some() {
        return Err(Error::Exists);
    }
    let needed = padded_len(name.len());
    let encoded = encode(ino, file_type, name);

    let mut pos = 0usize;
    let mut last_record_start = None;
    while pos + HEADER_LEN <= buf.len() {
        let rec_ino = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        let rec_len = u16::from_le_bytes(buf[pos + 4..pos + 6].try_into().unwrap());
        if rec_len == 0 || pos + rec_len as usize > buf.len() {
            break;
        }
        if rec_ino == 0 && rec_len >= needed {
            let mut bytes = encoded;
            bytes.resize(rec_len as usize, 0);
            bytes[4..6].copy_from_slice(&rec_len.to_le_bytes());
            return Ok(Splice { offset: pos as u64, bytes });
        }
        last_record_start = Some((pos, rec_len));
        pos += rec_len as usize;
    }

    if let Some((start, rec_len)) = last_record_start {
        let actual_used = padded_len({
            let name_len = buf[start + 6] as usize;
            name_len
        });
        let slack = rec_len - actual_used;
        if slack >= needed {
            let mut shrunk_header = buf[start..start + HEADER_LEN].to_vec();
            shrunk_header[4..6].copy_from_slice(&actual_used.to_le_bytes());
            let mut bytes = shrunk_header;
            bytes.truncate(HEADER_LEN);
            let name_len = buf[start + 6] as usize;
            bytes.extend_from_slice(&buf[start + HEADER_LEN..start + HEADER_LEN + name_len]);
            bytes.resize(actual_used as usize, 0);
            bytes.extend_from_slice(&encoded);
            return Ok(Splice { offset: start as u64, bytes });
        }
    }

    Ok(Splice { offset: buf.len() as u64, bytes: encoded })
}

/// Tombstones `name`'s record by zeroing its `ino` field (§4.7 `remove`).
pub fn remove(buf: &[u8], name: &str) -> Result<Splice> {
    let entry = lookup(buf, name).ok_or(Error::NoEntry)?;
    Ok(Splice { offset: entry.offset, bytes: vec![0u8; 4] })
}

/// Builds the first block of a fresh directory: `.` pointing at itself and
/// `..` pointing at `parent_ino` (§4.7 `init`).
pub fn init(self_ino: u32, parent_ino: u32, block_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; block_size];
    let dot = encode(self_ino, FileType::Directory, ".");
    let dotdot = encode(parent_ino, FileType::Directory, "..");
    buf[..dot.len()].copy_from_slice(&dot);
    buf[dot.len()..dot.len() + dotdot.len()].copy_from_slice(&dotdot);
    buf
}

/// Rewrites the `..` entry in a directory's first block to point at
/// `new_parent_ino`. Supplemented behavior (§9, REDESIGN FLAG): the
/// reference prototype leaves `..` stale across a cross-directory rename.
pub fn rewrite_dotdot(first_block: &mut [u8], new_parent_ino: u32) -> Result<()> {
    let entries = scan(first_block, 0);
    let dotdot = entries.iter().find(|e| e.name == "..").ok_or_else(|| {
        Error::Corrupt("directory missing '..' entry".into())
    })?;
    let off = dotdot.offset as usize;
    first_block[off..off + 4].copy_from_slice(&new_parent_ino.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_lookup_round_trips() {
        let block_size = 4096;
        let mut buf = init(2, 1, block_size);
        let splice = add(&buf, "hello.txt", 42, FileType::RegularFile).unwrap();
        buf[splice.offset as usize..splice.offset as usize + splice.bytes.len()]
            .copy_from_slice(&splice.bytes);

        let found = lookup(&buf, "hello.txt").unwrap();
        assert_eq!(found.ino, 42);
        assert_eq!(found.file_type, FileType::RegularFile);
    }

    #[test]
    fn remove_then_lookup_is_no_entry() {
        let block_size = 4096;
        let mut buf = init(2, 1, block_size);
        let splice = add(&buf, "a", 5, FileType::RegularFile).unwrap();
        buf[splice.offset as usize..splice.offset as usize + splice.bytes.len()]
            .copy_from_slice(&splice.bytes);

        let splice = remove(&buf, "a").unwrap();
        buf[splice.offset as usize..splice.offset as usize + splice.bytes.len()]
            .copy_from_slice(&splice.bytes);
        assert!(lookup(&buf, "a").is_none());
    }

    #[test]
    fn is_empty_ignores_dot_entries() {
        let block_size = 4096;
        let buf = init(2, 1, block_size);
        assert!(is_empty(&buf));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let block_size = 4096;
        let mut buf = init(2, 1, block_size);
        let splice = add(&buf, "dup", 9, FileType::RegularFile).unwrap();
        buf[splice.offset as usize..splice.offset as usize + splice.bytes.len()]
            .copy_from_slice(&splice.bytes);
        assert!(add(&buf, "dup", 10, FileType::RegularFile).is_err());
    }
}
