//! Inode map: the authoritative `ino -> (version, location)` translation
//! table (§4.3).
//!
//! Grounded on `fs/lfs/imap.rs`'s `Imap` (`get`/`set`/`get_empty_inum`), but
//! restructured from the teacher's fixed per-inode on-disk block table into
//! the dense sorted array the spec's §4.3 and the location-type testable
//! property (§8.1) specifically call for: a binary-searchable
//! `Vec<(ino, version, location)>` rather than an array indexed by `ino`.

use parking_lot::RwLock;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImapEntry {
    pub ino: u32,
    pub version: u32,
    pub location: u64,
}

struct Inner {
    /// Sorted by `ino`. Absence of an entry means the `ino` is free.
    entries: Vec<ImapEntry>,
    next_ino: u32,
    ceiling: u32,
}

/// Reader-parallel, writer-exclusive map from inode number to its current
/// on-disk location, per §5's lock-ordering rule (IMAP sits above the inode
/// cache and below the segment table in acquisition order).
pub struct Imap {
    inner: RwLock<Inner>,
}

impl Imap {
    /// `ceiling` is the superblock's `inode_count`: the highest `ino + 1`
    /// that may ever be allocated.
    pub fn new(ceiling: u32) -> Self {
        Imap {
            inner: RwLock::new(Inner { entries: Vec::new(), next_ino: 1, ceiling }),
        }
    }

    /// Rebuilds the map from a previously-persisted, already-sorted entry
    /// list (used by recovery and by checkpoint loading).
    pub fn from_entries(entries: Vec<ImapEntry>, ceiling: u32) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].ino < w[1].ino));
        let next_ino = entries.last().map(|e| e.ino + 1).unwrap_or(1).max(1);
        Imap {
            inner: RwLock::new(Inner { entries, next_ino, ceiling }),
        }
    }

    fn search(entries: &[ImapEntry], ino: u32) -> std::result::Result<usize, usize> {
        entries.binary_search_by_key(&ino, |e| e.ino)
    }

    /// Looks up the current `(version, location)` for `ino`.
    pub fn get(&self, ino: u32) -> Option<(u32, u64)> {
        let inner = self.inner.read();
        match Self::search(&inner.entries, ino) {
            Ok(idx) => {
                let e = inner.entries[idx];
                Some((e.version, e.location))
            }
            Err(_) => None,
        }
    }

    /// Inserts or updates `ino`'s location, bumping `version`. Returns the
    /// new version.
    pub fn set(&self, ino: u32, location: u64) -> u32 {
        let mut inner = self.inner.write();
        match Self::search(&inner.entries, ino) {
            Ok(idx) => {
                inner.entries[idx].location = location;
                inner.entries[idx].version = inner.entries[idx].version.wrapping_add(1);
                inner.entries[idx].version
            }
            Err(idx) => {
                inner.entries.insert(idx, ImapEntry { ino, version: 1, location });
                1
            }
        }
    }

    /// Removes `ino`'s entry entirely (nlink reached zero, §3 inode
    /// lifecycle).
    pub fn remove(&self, ino: u32) {
        let mut inner = self.inner.write();
        if let Ok(idx) = Self::search(&inner.entries, ino) {
            inner.entries.remove(idx);
        }
    }

    /// Allocates a fresh `ino`: a monotonically increasing counter, falling
    /// back to a linear scan for the lowest unused value once the counter
    /// saturates against `ceiling` (§4.3).
    pub fn alloc_ino(&self) -> Result<u32> {
        let mut inner = self.inner.write();
        if inner.next_ino < inner.ceiling {
            let ino = inner.next_ino;
            inner.next_ino += 1;
            return Ok(ino);
        }
        let ceiling = inner.ceiling;
        let taken: std::collections::HashSet<u32> =
            inner.entries.iter().map(|e| e.ino).collect();
        for candidate in 1..ceiling {
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::OutOfSpace)
    }

    /// Entries packed contiguously in `ino` order, for persisting into the
    /// checkpoint region (§4.3, §4.8).
    pub fn snapshot(&self) -> Vec<ImapEntry> {
        self.inner.read().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let imap = Imap::new(1024);
        let v1 = imap.set(5, 100);
        assert_eq!(v1, 1);
        assert_eq!(imap.get(5), Some((1, 100)));
        let v2 = imap.set(5, 200);
        assert_eq!(v2, 2);
        assert_eq!(imap.get(5), Some((2, 200)));
    }

    #[test]
    fn entries_stay_sorted() {
        let imap = Imap::new(1024);
        imap.set(10, 1);
        imap.set(3, 2);
        imap.set(7, 3);
        let snap = imap.snapshot();
        let inos: Vec<u32> = snap.iter().map(|e| e.ino).collect();
        assert_eq!(inos, vec![3, 7, 10]);
    }

    #[test]
    fn alloc_skips_removed_then_reused() {
        let imap = Imap::new(4);
        let a = imap.alloc_ino().unwrap();
        let b = imap.alloc_ino().unwrap();
        let c = imap.alloc_ino().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert!(imap.alloc_ino().is_err());
        imap.remove(2);
        // ceiling saturated: falls back to the linear scan, finds 2 free.
        assert_eq!(imap.alloc_ino().unwrap(), 2);
    }
}
