//! `Lfs`: the top-level context object that owns every component and
//! exposes the adapter upcall surface of §6 as plain Rust methods (§5:
//! "every component receives the context as an explicit parameter rather
//! than through ambient state").
//!
//! No single teacher file plays this role directly — `fs/ufs/mod.rs`'s
//! `Ufs` is the closest shape (one struct bundling a superblock, a log, and
//! an itable behind the methods a kernel VFS calls), but its body is built
//! on `KernelCtx`/`StrongPin`/`pin_project`, machinery that only makes sense
//! inside the teacher's own in-kernel harness. This file borrows `Ufs`'s
//! *wiring* — one struct owning every subsystem, constructed once at mount
//! — and writes the actual method bodies fresh against this crate's own
//! `Imap`/`SegmentTable`/`SegmentWriter`/`InodeCache`/`CheckpointManager`/
//! `TxManager`/`Cleaner` types.

use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use zerocopy::FromBytes;

use crate::bio::BufferCache;
use crate::checkpoint::CheckpointManager;
use crate::cleaner::{Cleaner, CleanerContext};
use crate::device::Device;
use crate::directory::{self, DirEntry, FileType as DirFileType};
use crate::error::{Error, Result};
use crate::imap::Imap;
use crate::inode::{self, InodeCache, InodeData, InodeRef, IoCtx, S_IFDIR, S_IFMT, S_IFREG, ROOT_INO};
use crate::param::{
    DEFAULT_BUFFER_CACHE_CAPACITY, DEFAULT_CHECKPOINT_INTERVAL_SECS, DEFAULT_CHECKPOINT_WRITE_TRIGGER,
    DEFAULT_INODE_CACHE_CAPACITY,
};
use crate::recovery;
use crate::segment::BlockType;
use crate::segment_writer::{CleanerSignal, SegmentWriter};
use crate::superblock::{RawSuperblock, SharedSuperblock, Superblock, CLEAN, DIRTY};
use crate::tx::TxManager;

fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

/// Runtime knobs overridable at mount time (§1: "runtime policy ... made
/// overridable at mount time where the spec calls them configurable").
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub buffer_cache_capacity: usize,
    pub inode_cache_capacity: usize,
    pub checkpoint_write_trigger: u32,
    pub checkpoint_interval_secs: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            buffer_cache_capacity: DEFAULT_BUFFER_CACHE_CAPACITY,
            inode_cache_capacity: DEFAULT_INODE_CACHE_CAPACITY,
            checkpoint_write_trigger: DEFAULT_CHECKPOINT_WRITE_TRIGGER,
            checkpoint_interval_secs: DEFAULT_CHECKPOINT_INTERVAL_SECS,
        }
    }
}

/// Attribute record handed back by `lookup`/`getattr`/`setattr`/`create`/
/// `mkdir` (§6: "results are attribute records"). Deliberately independent
/// of `fuser::FileAttr` so the core never depends on the adapter crate.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub ino: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime_ns: u64,
    pub mtime_ns: u64,
    pub ctime_ns: u64,
    pub kind: DirFileType,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

fn attr_of(data: &InodeData) -> Attr {
    let kind = if data.mode & S_IFMT == S_IFDIR {
        DirFileType::Directory
    } else if data.is_symlink() {
        DirFileType::Symlink
    } else {
        DirFileType::RegularFile
    };
    Attr {
        ino: data.ino,
        size: data.size,
        blocks: data.block_count,
        atime_ns: data.atime,
        mtime_ns: data.mtime,
        ctime_ns: data.ctime,
        kind,
        perm: (data.mode & 0o7777) as u16,
        nlink: data.nlink,
        uid: data.uid,
        gid: data.gid,
    }
}

/// Fields `setattr` may update; `None` leaves the field untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime_ns: Option<u64>,
    pub mtime_ns: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

/// Reads the magic-prefixed superblock fields straight out of the image's
/// first bytes, without yet knowing the image's own block size — the raw
/// struct's layout doesn't depend on it, only the geometry it describes
/// does.
fn probe_block_size(path: &Path) -> Result<u32> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; RawSuperblock::SIZE];
    file.read_exact(&mut buf)?;
    let raw = RawSuperblock::read_from_bytes(&buf)
        .map_err(|_| Error::Corrupt("superblock layout mismatch".into()))?;
    if raw.magic != crate::superblock::SUPERBLOCK_MAGIC {
        return Err(Error::Corrupt(format!("bad superblock magic: {:#x}", raw.magic)));
    }
    Ok(raw.block_size)
}

/// The top-level context object. Every upcall method takes `&self`: internal
/// mutability lives entirely behind the per-component locks described in
/// §5, so `adapter.rs` can share one `Lfs` across `fuser`'s dispatch without
/// its own additional locking.
pub struct Lfs {
    device: Arc<Device>,
    buffer_cache: Arc<BufferCache>,
    superblock: SharedSuperblock,
    imap: Arc<Imap>,
    segment_table: Arc<crate::segment::SegmentTable>,
    segment_writer: Arc<SegmentWriter>,
    inode_cache: Arc<InodeCache>,
    checkpoint: Arc<CheckpointManager>,
    tx: Arc<TxManager>,
    cleaner: Mutex<Option<Cleaner>>,
    block_size: u32,
}

impl Lfs {
    /// Opens the image at `path`, runs recovery, emits the post-recovery
    /// checkpoint (§4.9 step 6), and spawns the cleaner. The file system is
    /// available for user operations only once this returns `Ok`.
    pub fn mount(path: impl AsRef<Path>, opts: MountOptions) -> Result<Lfs> {
        let path = path.as_ref();
        let block_size = probe_block_size(path)?;
        let device = Arc::new(Device::open(path, block_size)?);

        let mut sb_buf = vec![0u8; block_size as usize];
        device.read_block(0, &mut sb_buf)?;
        let superblock = Superblock::from_block(&sb_buf)?;

        log::info!(
            "mounting image with {} blocks, {} segments, clean_flag={}",
            superblock.raw.total_blocks,
            superblock.total_segments(),
            superblock.raw.clean_flag
        );

        let recovered = recovery::recover(&device, &superblock)?;

        let shared_superblock: SharedSuperblock = Arc::new(Mutex::new(superblock));
        let buffer_cache = Arc::new(BufferCache::new(device.clone(), opts.buffer_cache_capacity));
        let segment_table = Arc::new(recovered.segment_table);
        let imap = Arc::new(recovered.imap);
        let cleaner_signal = CleanerSignal::new();
        let log_head_cursor: crate::segment_writer::LogHeadCursor = Arc::new(AtomicU64::new(recovered.log_head));

        let segment_size_blocks = shared_superblock.lock().segment_size_blocks();
        let segment_writer = Arc::new(SegmentWriter::new(
            device.clone(),
            segment_table.clone(),
            block_size,
            segment_size_blocks,
            cleaner_signal.clone(),
            log_head_cursor,
        ));
        let inode_cache = Arc::new(InodeCache::new(opts.inode_cache_capacity));

        let checkpoint = Arc::new(CheckpointManager::new(
            device.clone(),
            buffer_cache.clone(),
            shared_superblock.clone(),
            imap.clone(),
            segment_table.clone(),
            segment_writer.clone(),
            inode_cache.clone(),
            recovered.sequence,
        ));
        // §4.9 step 6: only after this persists is the file system available.
        checkpoint.emit()?;

        let tx = Arc::new(
            TxManager::new(checkpoint.clone(), segment_table.clone(), cleaner_signal.clone()).with_triggers(
                opts.checkpoint_write_trigger,
                std::time::Duration::from_secs(opts.checkpoint_interval_secs),
            ),
        );

        let cleaner = Cleaner::spawn(CleanerContext {
            buffer_cache: buffer_cache.clone(),
            superblock: shared_superblock.clone(),
            imap: imap.clone(),
            segment_table: segment_table.clone(),
            segment_writer: segment_writer.clone(),
            inode_cache: inode_cache.clone(),
            checkpoint: checkpoint.clone(),
            signal: cleaner_signal,
        });

        {
            let mut sb = shared_superblock.lock();
            sb.raw.clean_flag = DIRTY;
            sb.raw.mount_count += 1;
            sb.raw.mounted_at = now_ns() / 1_000_000_000;
            let block = sb.to_block(block_size as usize);
            device.write_block(0, &block)?;
            device.sync()?;
        }

        Ok(Lfs {
            device,
            buffer_cache,
            superblock: shared_superblock,
            imap,
            segment_table,
            segment_writer,
            inode_cache,
            checkpoint,
            tx,
            cleaner: Mutex::new(Some(cleaner)),
            block_size,
        })
    }

    /// Stops the cleaner, flushes every dirty inode and the active segment,
    /// forces a final checkpoint, and marks the superblock clean.
    pub fn unmount(&self) -> Result<()> {
        if let Some(mut cleaner) = self.cleaner.lock().take() {
            cleaner.stop();
        }
        self.with_ctx(|ctx| self.inode_cache.flush_all(ctx, &self.imap))?;
        self.tx.force_checkpoint()?;
        {
            let mut sb = self.superblock.lock();
            sb.raw.clean_flag = CLEAN;
            let block = sb.to_block(self.block_size as usize);
            self.device.write_block(0, &block)?;
            self.device.sync()?;
        }
        Ok(())
    }

    pub fn root(&self) -> u32 {
        ROOT_INO
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn with_ctx<T>(&self, f: impl FnOnce(&IoCtx<'_>) -> Result<T>) -> Result<T> {
        let sb = self.superblock.lock().clone();
        let ctx = IoCtx {
            buffer_cache: &self.buffer_cache,
            segment_writer: &self.segment_writer,
            segment_table: &self.segment_table,
            superblock: &sb,
        };
        f(&ctx)
    }

    /// Brackets a mutating upcall with `TxManager::begin_op`/`end_op`,
    /// running the bracket's checkpoint-trigger check even if `f` fails, so
    /// the outstanding-operation count never leaks (§5, §4.8 trigger).
    fn mutate<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.tx.begin_op();
        let result = f();
        let end_result = self.tx.end_op();
        match result {
            Ok(v) => end_result.map(|_| v),
            Err(e) => Err(e),
        }
    }

    fn dir_body(&self, ctx: &IoCtx<'_>, data: &InodeData) -> Result<Vec<u8>> {
        self.read_range(ctx, data, 0, data.size as usize)
    }

    /// Reads `len` bytes of `data`'s content starting at `offset`. Holes
    /// (unallocated blocks) read as zero (§4.6).
    fn read_range(&self, ctx: &IoCtx<'_>, data: &InodeData, offset: u64, len: usize) -> Result<Vec<u8>> {
        let bs = ctx.superblock.block_size() as u64;
        let mut out = vec![0u8; len];
        let end = offset + len as u64;
        let mut pos = offset;
        while pos < end {
            let k = pos / bs;
            let in_block_off = (pos % bs) as usize;
            let chunk = (bs as usize - in_block_off).min((end - pos) as usize);
            if let Some(addr) = inode::read_block_index(ctx, data, k)? {
                let handle = ctx.buffer_cache.get(addr)?;
                let block = handle.lock();
                let out_off = (pos - offset) as usize;
                out[out_off..out_off + chunk].copy_from_slice(&block.data()[in_block_off..in_block_off + chunk]);
            }
            pos += chunk as u64;
        }
        Ok(out)
    }

    /// Writes `buf` into `data`'s content starting at `offset`, read-modify-
    /// writing each touched block and appending its new version through the
    /// segment writer (§4.6). Grows `size` if the write extends past it.
    fn write_range(
        &self,
        ctx: &IoCtx<'_>,
        data: &mut InodeData,
        offset: u64,
        buf: &[u8],
        block_type: BlockType,
    ) -> Result<()> {
        let bs = ctx.superblock.block_size() as u64;
        let end = offset + buf.len() as u64;
        let mut pos = offset;
        while pos < end {
            let k = pos / bs;
            let in_block_off = (pos % bs) as usize;
            let chunk = (bs as usize - in_block_off).min((end - pos) as usize);

            let mut block_buf = vec![0u8; bs as usize];
            if let Some(old_addr) = inode::read_block_index(ctx, data, k)? {
                let handle = ctx.buffer_cache.get(old_addr)?;
                block_buf.copy_from_slice(handle.lock().data());
            }
            let in_off = (pos - offset) as usize;
            block_buf[in_block_off..in_block_off + chunk].copy_from_slice(&buf[in_off..in_off + chunk]);

            let new_addr = ctx.segment_writer.append(ctx.superblock, &block_buf, data.ino, k as u32, block_type)?;
            let filled_new = inode::write_block_index(ctx, data, k, new_addr)?;
            if filled_new {
                data.block_count += 1;
            }
            pos += chunk as u64;
        }
        if end > data.size {
            data.size = end;
        }
        let now = now_ns();
        data.mtime = now;
        data.ctime = now;
        data.dirty = true;
        Ok(())
    }

    fn dir_add(&self, ctx: &IoCtx<'_>, inode: &InodeRef, name: &str, child_ino: u32, file_type: DirFileType) -> Result<()> {
        let mut data = inode.data.lock();
        let body = self.dir_body(ctx, &data)?;
        let splice = directory::add(&body, name, child_ino, file_type)?;
        self.write_range(ctx, &mut data, splice.offset, &splice.bytes, BlockType::Dirent)
    }

    fn dir_remove(&self, ctx: &IoCtx<'_>, inode: &InodeRef, name: &str) -> Result<()> {
        let mut data = inode.data.lock();
        let body = self.dir_body(ctx, &data)?;
        let splice = directory::remove(&body, name)?;
        self.write_range(ctx, &mut data, splice.offset, &splice.bytes, BlockType::Dirent)
    }

    pub fn lookup(&self, parent: u32, name: &str) -> Result<Attr> {
        self.with_ctx(|ctx| {
            let parent_inode = self.inode_cache.get(ctx, &self.imap, parent)?;
            let body = {
                let data = parent_inode.data.lock();
                if !data.is_dir() {
                    return Err(Error::NotADirectory);
                }
                self.dir_body(ctx, &data)?
            };
            let entry = directory::lookup(&body, name).ok_or(Error::NoEntry)?;
            let child = self.inode_cache.get(ctx, &self.imap, entry.ino)?;
            Ok(attr_of(&child.data.lock()))
        })
    }

    pub fn getattr(&self, ino: u32) -> Result<Attr> {
        self.with_ctx(|ctx| {
            let inode = self.inode_cache.get(ctx, &self.imap, ino)?;
            Ok(attr_of(&inode.data.lock()))
        })
    }

    pub fn setattr(&self, ino: u32, req: SetAttrRequest) -> Result<Attr> {
        self.mutate(|| {
            self.with_ctx(|ctx| {
                let inode = self.inode_cache.get(ctx, &self.imap, ino)?;
                let mut data = inode.data.lock();
                if let Some(mode) = req.mode {
                    data.mode = (data.mode & S_IFMT) | (mode & 0o7777);
                }
                if let Some(uid) = req.uid {
                    data.uid = uid;
                }
                if let Some(gid) = req.gid {
                    data.gid = gid;
                }
                if let Some(size) = req.size {
                    if size < data.size {
                        let bs = ctx.superblock.block_size() as u64;
                        let keep_blocks = size.div_ceil(bs.max(1));
                        inode::truncate_blocks(ctx, &mut data, keep_blocks)?;
                    }
                    data.size = size;
                }
                if let Some(atime) = req.atime_ns {
                    data.atime = atime;
                }
                if let Some(mtime) = req.mtime_ns {
                    data.mtime = mtime;
                }
                data.ctime = now_ns();
                data.dirty = true;
                inode::write_inode_record(ctx, &self.imap, &mut data)?;
                Ok(attr_of(&data))
            })
        })
    }

    pub fn readdir(&self, ino: u32, offset: u64) -> Result<Vec<DirEntry>> {
        self.with_ctx(|ctx| {
            let inode = self.inode_cache.get(ctx, &self.imap, ino)?;
            let data = inode.data.lock();
            if !data.is_dir() {
                return Err(Error::NotADirectory);
            }
            let body = self.dir_body(ctx, &data)?;
            let mut entries = directory::scan(&body, 0);
            entries.retain(|e| e.offset >= offset);
            Ok(entries)
        })
    }

    pub fn open(&self, ino: u32) -> Result<()> {
        self.with_ctx(|ctx| {
            self.inode_cache.get(ctx, &self.imap, ino)?;
            Ok(())
        })
    }

    pub fn read(&self, ino: u32, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.with_ctx(|ctx| {
            let inode = self.inode_cache.get(ctx, &self.imap, ino)?;
            let mut data = inode.data.lock();
            data.atime = now_ns();
            let file_size = data.size;
            let start = offset.min(file_size);
            let len = (size as u64).min(file_size.saturating_sub(start)) as usize;
            self.read_range(ctx, &data, start, len)
        })
    }

    pub fn write(&self, ino: u32, offset: u64, buf: &[u8]) -> Result<u32> {
        self.mutate(|| {
            self.with_ctx(|ctx| {
                let inode = self.inode_cache.get(ctx, &self.imap, ino)?;
                let mut data = inode.data.lock();
                if data.is_dir() {
                    return Err(Error::IsADirectory);
                }
                self.write_range(ctx, &mut data, offset, buf, BlockType::Data)?;
                inode::write_inode_record(ctx, &self.imap, &mut data)?;
                Ok(buf.len() as u32)
            })
        })
    }

    pub fn create(&self, parent: u32, name: &str, mode: u32, uid: u32, gid: u32) -> Result<Attr> {
        self.mutate(|| {
            self.with_ctx(|ctx| {
                let parent_inode = self.inode_cache.get(ctx, &self.imap, parent)?;
                {
                    let parent_data = parent_inode.data.lock();
                    if !parent_data.is_dir() {
                        return Err(Error::NotADirectory);
                    }
                    let body = self.dir_body(ctx, &parent_data)?;
                    if directory::lookup(&body, name).is_some() {
                        return Err(Error::Exists);
                    }
                }
                let now = now_ns();
                let child = self.inode_cache.alloc(ctx, &self.imap, S_IFREG | (mode & 0o7777), uid, gid, now)?;
                {
                    let mut child_data = child.data.lock();
                    child_data.nlink = 1;
                }
                if let Err(e) = self.dir_add(ctx, &parent_inode, name, child.ino, DirFileType::RegularFile) {
                    self.inode_cache.forget(child.ino);
                    return Err(e);
                }
                let mut child_data = child.data.lock();
                inode::write_inode_record(ctx, &self.imap, &mut child_data)?;
                Ok(attr_of(&child_data))
            })
        })
    }

    pub fn mkdir(&self, parent: u32, name: &str, mode: u32, uid: u32, gid: u32) -> Result<Attr> {
        self.mutate(|| {
            self.with_ctx(|ctx| {
                let parent_inode = self.inode_cache.get(ctx, &self.imap, parent)?;
                {
                    let parent_data = parent_inode.data.lock();
                    if !parent_data.is_dir() {
                        return Err(Error::NotADirectory);
                    }
                    let body = self.dir_body(ctx, &parent_data)?;
                    if directory::lookup(&body, name).is_some() {
                        return Err(Error::Exists);
                    }
                }
                let now = now_ns();
                let child = self.inode_cache.alloc(ctx, &self.imap, S_IFDIR | (mode & 0o7777), uid, gid, now)?;
                let init_block = directory::init(child.ino, parent, ctx.superblock.block_size() as usize);
                {
                    let mut child_data = child.data.lock();
                    child_data.nlink = 2;
                    self.write_range(ctx, &mut child_data, 0, &init_block, BlockType::Dirent)?;
                }
                if let Err(e) = self.dir_add(ctx, &parent_inode, name, child.ino, DirFileType::Directory) {
                    self.inode_cache.forget(child.ino);
                    return Err(e);
                }
                {
                    let mut parent_data = parent_inode.data.lock();
                    parent_data.nlink += 1;
                    parent_data.dirty = true;
                    inode::write_inode_record(ctx, &self.imap, &mut parent_data)?;
                }
                let mut child_data = child.data.lock();
                inode::write_inode_record(ctx, &self.imap, &mut child_data)?;
                Ok(attr_of(&child_data))
            })
        })
    }

    pub fn unlink(&self, parent: u32, name: &str) -> Result<()> {
        self.mutate(|| {
            self.with_ctx(|ctx| {
                let parent_inode = self.inode_cache.get(ctx, &self.imap, parent)?;
                let entry = {
                    let parent_data = parent_inode.data.lock();
                    let body = self.dir_body(ctx, &parent_data)?;
                    directory::lookup(&body, name).ok_or(Error::NoEntry)?
                };
                if entry.file_type == DirFileType::Directory {
                    return Err(Error::IsADirectory);
                }
                let target = self.inode_cache.get(ctx, &self.imap, entry.ino)?;
                self.dir_remove(ctx, &parent_inode, name)?;

                let mut target_data = target.data.lock();
                target_data.nlink = target_data.nlink.saturating_sub(1);
                target_data.dirty = true;
                if target_data.nlink == 0 {
                    inode::free_all_blocks(ctx, &mut target_data)?;
                    self.imap.remove(target.ino);
                    drop(target_data);
                    self.inode_cache.forget(target.ino);
                } else {
                    inode::write_inode_record(ctx, &self.imap, &mut target_data)?;
                }
                Ok(())
            })
        })
    }

    pub fn rmdir(&self, parent: u32, name: &str) -> Result<()> {
        self.mutate(|| {
            self.with_ctx(|ctx| {
                let parent_inode = self.inode_cache.get(ctx, &self.imap, parent)?;
                let entry = {
                    let parent_data = parent_inode.data.lock();
                    let body = self.dir_body(ctx, &parent_data)?;
                    directory::lookup(&body, name).ok_or(Error::NoEntry)?
                };
                if entry.file_type != DirFileType::Directory {
                    return Err(Error::NotADirectory);
                }
                let target = self.inode_cache.get(ctx, &self.imap, entry.ino)?;
                {
                    let target_data = target.data.lock();
                    let body = self.dir_body(ctx, &target_data)?;
                    if !directory::is_empty(&body) {
                        return Err(Error::NotEmpty);
                    }
                }

                self.dir_remove(ctx, &parent_inode, name)?;
                {
                    let mut parent_data = parent_inode.data.lock();
                    parent_data.nlink = parent_data.nlink.saturating_sub(1);
                    parent_data.dirty = true;
                    inode::write_inode_record(ctx, &self.imap, &mut parent_data)?;
                }

                let mut target_data = target.data.lock();
                inode::free_all_blocks(ctx, &mut target_data)?;
                self.imap.remove(target.ino);
                drop(target_data);
                self.inode_cache.forget(target.ino);
                Ok(())
            })
        })
    }

    pub fn rename(&self, old_parent: u32, old_name: &str, new_parent: u32, new_name: &str) -> Result<()> {
        self.mutate(|| {
            self.with_ctx(|ctx| {
                let old_parent_inode = self.inode_cache.get(ctx, &self.imap, old_parent)?;
                let new_parent_inode = self.inode_cache.get(ctx, &self.imap, new_parent)?;

                let entry = {
                    let data = old_parent_inode.data.lock();
                    let body = self.dir_body(ctx, &data)?;
                    directory::lookup(&body, old_name).ok_or(Error::NoEntry)?
                };

                let existing = {
                    let data = new_parent_inode.data.lock();
                    let body = self.dir_body(ctx, &data)?;
                    directory::lookup(&body, new_name)
                };
                if let Some(existing) = existing {
                    if existing.ino == entry.ino {
                        // Renaming a name onto itself (same directory, same
                        // entry): nothing to overwrite or free.
                        return Ok(());
                    }
                    let existing_inode = self.inode_cache.get(ctx, &self.imap, existing.ino)?;
                    if existing.file_type == DirFileType::Directory {
                        let existing_data = existing_inode.data.lock();
                        let body = self.dir_body(ctx, &existing_data)?;
                        if !directory::is_empty(&body) {
                            return Err(Error::NotEmpty);
                        }
                    }
                    self.dir_remove(ctx, &new_parent_inode, new_name)?;

                    let mut existing_data = existing_inode.data.lock();
                    existing_data.nlink = existing_data.nlink.saturating_sub(1);
                    existing_data.dirty = true;
                    if existing_data.nlink == 0 {
                        inode::free_all_blocks(ctx, &mut existing_data)?;
                        self.imap.remove(existing_inode.ino);
                        drop(existing_data);
                        self.inode_cache.forget(existing_inode.ino);
                    } else {
                        inode::write_inode_record(ctx, &self.imap, &mut existing_data)?;
                    }
                }

                self.dir_add(ctx, &new_parent_inode, new_name, entry.ino, entry.file_type)?;
                self.dir_remove(ctx, &old_parent_inode, old_name)?;

                if entry.file_type == DirFileType::Directory && old_parent != new_parent {
                    let moved = self.inode_cache.get(ctx, &self.imap, entry.ino)?;
                    let mut moved_data = moved.data.lock();
                    if let Some(first_addr) = inode::read_block_index(ctx, &moved_data, 0)? {
                        let mut block = {
                            let handle = ctx.buffer_cache.get(first_addr)?;
                            handle.lock().data().to_vec()
                        };
                        directory::rewrite_dotdot(&mut block, new_parent)?;
                        self.write_range(ctx, &mut moved_data, 0, &block, BlockType::Dirent)?;
                    }
                    drop(moved_data);

                    let mut old_parent_data = old_parent_inode.data.lock();
                    old_parent_data.nlink = old_parent_data.nlink.saturating_sub(1);
                    old_parent_data.dirty = true;
                    inode::write_inode_record(ctx, &self.imap, &mut old_parent_data)?;
                    drop(old_parent_data);

                    let mut new_parent_data = new_parent_inode.data.lock();
                    new_parent_data.nlink += 1;
                    new_parent_data.dirty = true;
                    inode::write_inode_record(ctx, &self.imap, &mut new_parent_data)?;
                }
                Ok(())
            })
        })
    }

    pub fn statfs(&self) -> Result<StatFs> {
        let sb = self.superblock.lock().clone();
        let free_segments = self.segment_table.free_count() as u64;
        let free_blocks = free_segments * sb.segment_size_blocks() as u64;
        let total_inodes = sb.inode_count() as u64;
        let free_inodes = total_inodes.saturating_sub(self.imap.len() as u64);
        Ok(StatFs {
            block_size: sb.block_size(),
            total_blocks: sb.raw.total_blocks,
            free_blocks,
            total_inodes,
            free_inodes,
        })
    }

    /// Flushes `ino`'s dirty record, forces the active segment to disk, and
    /// commits a checkpoint, all under the checkpoint manager's write lock
    /// so a concurrent triggered checkpoint can't interleave (§5).
    pub fn fsync(&self, ino: u32) -> Result<()> {
        self.with_ctx(|ctx| {
            let inode = self.inode_cache.get(ctx, &self.imap, ino)?;
            let mut data = inode.data.lock();
            if data.dirty {
                inode::write_inode_record(ctx, &self.imap, &mut data)?;
            }
            Ok(())
        })?;
        self.checkpoint.with_write_lock(|| {
            let sb = self.superblock.lock().clone();
            self.segment_writer.force_flush(&sb).map(|_| ())
        })?;
        self.tx.force_checkpoint()
    }
}
