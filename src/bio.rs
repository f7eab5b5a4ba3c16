//! Buffer cache (§4.2).
//!
//! A fixed-capacity pool of block-sized buffers keyed by block number.
//! Reduces redundant disk reads and gives every other component a single
//! synchronization point for a given block. Mirrors the role the teacher's
//! `bio.rs` plays (get/lock/release around a `BufEntry`), but the
//! arena/pin machinery that file used to stay `no_std` is replaced here with
//! `parking_lot::Mutex` guarding a plain `HashMap` + LRU queue — the same
//! trade `fuser` itself makes for its own interior mutability.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::Device;
use crate::error::Result;

/// One cached block: its contents plus whether it needs to be written back.
pub struct CachedBlock {
    block_no: u64,
    data: Vec<u8>,
    dirty: bool,
}

impl CachedBlock {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the block's bytes. Any caller taking this handle is
    /// assumed to be about to change the block, so it is marked dirty
    /// immediately; `write_back`/`flush_all` later clears the flag.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    pub fn block_no(&self) -> u64 {
        self.block_no
    }
}

/// A handle to a cached block, shared with whoever else currently holds it.
/// Dropping the last handle does not evict the block; eviction only happens
/// under cache pressure, in LRU order, and only for blocks nobody else is
/// holding.
pub type BlockHandle = Arc<Mutex<CachedBlock>>;

struct Inner {
    map: HashMap<u64, BlockHandle>,
    /// Most-recently-used at the back.
    lru: VecDeque<u64>,
}

pub struct BufferCache {
    device: Arc<Device>,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl BufferCache {
    pub fn new(device: Arc<Device>, capacity: usize) -> Self {
        BufferCache {
            device,
            capacity,
            inner: Mutex::new(Inner { map: HashMap::new(), lru: VecDeque::new() }),
        }
    }

    fn touch(inner: &mut Inner, block_no: u64) {
        inner.lru.retain(|&b| b != block_no);
        inner.lru.push_back(block_no);
    }

    /// Evicts the least-recently-used block not currently held elsewhere,
    /// writing it back first if dirty. No-op if every cached block is
    /// pinned by a live handle — the cache is then allowed to exceed
    /// `capacity` rather than violate correctness.
    fn evict_one(&self, inner: &mut Inner) -> Result<()> {
        let victim = inner.lru.iter().position(|&b| {
            inner
                .map
                .get(&b)
                .map(|h| Arc::strong_count(h) == 1)
                .unwrap_or(false)
        });
        let Some(pos) = victim else { return Ok(()) };
        let block_no = inner.lru.remove(pos).unwrap();
        if let Some(handle) = inner.map.remove(&block_no) {
            let block = handle.lock();
            if block.dirty {
                self.device.write_block(block_no, &block.data)?;
            }
        }
        Ok(())
    }

    /// Returns the cached block, reading it from disk on a miss.
    pub fn get(&self, block_no: u64) -> Result<BlockHandle> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.map.get(&block_no) {
            let handle = handle.clone();
            Self::touch(&mut inner, block_no);
            return Ok(handle);
        }
        if inner.map.len() >= self.capacity {
            self.evict_one(&mut inner)?;
        }
        let mut data = vec![0u8; self.device.block_size() as usize];
        self.device.read_block(block_no, &mut data)?;
        let handle = Arc::new(Mutex::new(CachedBlock { block_no, data, dirty: false }));
        inner.map.insert(block_no, handle.clone());
        Self::touch(&mut inner, block_no);
        Ok(handle)
    }

    /// Returns a cached block pre-zeroed and marked dirty, without reading
    /// it from disk. Used when a block is freshly allocated and its prior
    /// on-disk contents are irrelevant (§4.4 segment staging, §4.6 new
    /// indirect blocks).
    pub fn get_zeroed(&self, block_no: u64) -> Result<BlockHandle> {
        let mut inner = self.inner.lock();
        if inner.map.len() >= self.capacity && !inner.map.contains_key(&block_no) {
            self.evict_one(&mut inner)?;
        }
        let data = vec![0u8; self.device.block_size() as usize];
        let handle = Arc::new(Mutex::new(CachedBlock { block_no, data, dirty: true }));
        inner.map.insert(block_no, handle.clone());
        Self::touch(&mut inner, block_no);
        Ok(handle)
    }

    /// Writes a single block back to disk immediately if dirty, leaving it
    /// cached.
    pub fn write_back(&self, block_no: u64) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(handle) = inner.map.get(&block_no) {
            let mut block = handle.lock();
            if block.dirty {
                self.device.write_block(block_no, &block.data)?;
                block.dirty = false;
            }
        }
        Ok(())
    }

    /// Writes every dirty cached block back to disk and calls `Device::sync`.
    /// The durability points of the engine (segment flush, checkpoint
    /// commit) call this so that "on disk" in the log means what it says.
    pub fn flush_all(&self) -> Result<()> {
        let inner = self.inner.lock();
        for (&block_no, handle) in inner.map.iter() {
            let mut block = handle.lock();
            if block.dirty {
                self.device.write_block(block_no, &block.data)?;
                block.dirty = false;
            }
        }
        drop(inner);
        self.device.sync()
    }

    /// Drops a block from the cache without writing it back, used by the
    /// checker/inspector utilities which want a clean view after each step.
    pub fn evict(&self, block_no: u64) {
        let mut inner = self.inner.lock();
        inner.map.remove(&block_no);
        inner.lru.retain(|&b| b != block_no);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn cache(capacity: usize) -> BufferCache {
        let tmp = NamedTempFile::new().unwrap();
        let dev = Device::create(tmp.path(), 512, 64).unwrap();
        std::mem::forget(tmp);
        BufferCache::new(Arc::new(dev), capacity)
    }

    #[test]
    fn write_back_persists_across_eviction() {
        let cache = cache(2);
        {
            let h = cache.get_zeroed(0).unwrap();
            h.lock().data_mut()[0] = 0x42;
        }
        cache.write_back(0).unwrap();
        cache.evict(0);
        let h = cache.get(0).unwrap();
        assert_eq!(h.lock().data()[0], 0x42);
    }

    #[test]
    fn eviction_skips_pinned_blocks() {
        let cache = cache(1);
        let pinned = cache.get_zeroed(0).unwrap();
        // Capacity is 1 and block 0 is still held, so fetching block 1
        // cannot evict it; the cache simply grows past capacity.
        let other = cache.get_zeroed(1).unwrap();
        assert_eq!(pinned.lock().block_no(), 0);
        assert_eq!(other.lock().block_no(), 1);
    }
}
