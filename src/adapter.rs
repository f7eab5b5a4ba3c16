//! Thin `fuser::Filesystem` glue (§6). Every method here does nothing but
//! translate: argument types in, `fs::Lfs` call, reply type out. No
//! durability or locking decision is made in this file — that all lives in
//! `fs::Lfs`, so the adapter can be swapped for, say, an NFS front-end
//! without touching the engine.
//!
//! Grounded on `fuse-ufs`'s `src/fs.rs` `Filesystem` impl: one field (a
//! handle to the real file system), a fixed per-reply TTL, and a match over
//! the core's error type to `reply.error(errno)` on every fallible call.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};

use crate::directory::FileType as DirFileType;
use crate::fs::{Attr, Lfs, SetAttrRequest};

/// Attribute cache lifetime handed back with every reply. The engine itself
/// has no notion of client-side caching, so any fixed value is fine; one
/// second matches what most read-only FUSE front-ends in the pack use.
const TTL: Duration = Duration::from_secs(1);

fn ns_to_system_time(ns: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(ns)
}

fn system_time_to_ns(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

fn to_fuse_file_type(kind: DirFileType) -> FuseFileType {
    match kind {
        DirFileType::RegularFile => FuseFileType::RegularFile,
        DirFileType::Directory => FuseFileType::Directory,
        DirFileType::Symlink => FuseFileType::Symlink,
    }
}

fn to_file_attr(attr: &Attr, block_size: u32) -> FileAttr {
    FileAttr {
        ino: attr.ino as u64,
        size: attr.size,
        blocks: attr.blocks,
        atime: ns_to_system_time(attr.atime_ns),
        mtime: ns_to_system_time(attr.mtime_ns),
        ctime: ns_to_system_time(attr.ctime_ns),
        crtime: ns_to_system_time(attr.ctime_ns),
        kind: to_fuse_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

fn name_str(name: &OsStr) -> Option<&str> {
    std::str::from_utf8(name.as_bytes()).ok()
}

/// Owns the mounted `Lfs` and nothing else. `fuser` dispatches on `&mut
/// self`, but every upcall below only ever takes `&self.lfs` — the engine's
/// own per-component locking (§5) is what actually serializes concurrent
/// requests.
pub struct LfsAdapter {
    lfs: Lfs,
}

impl LfsAdapter {
    pub fn new(lfs: Lfs) -> Self {
        LfsAdapter { lfs }
    }

    fn block_size(&self) -> u32 {
        self.lfs.block_size()
    }
}

impl Filesystem for LfsAdapter {
    fn destroy(&mut self) {
        if let Err(e) = self.lfs.unmount() {
            log::error!("unmount failed: {e}");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.lfs.lookup(parent as u32, name) {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr, self.block_size()), attr.ino as u64 as i64),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.lfs.getattr(ino as u32) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr, self.block_size())),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let req = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime_ns: atime.map(|t| match t {
                TimeOrNow::Now => system_time_to_ns(SystemTime::now()),
                TimeOrNow::SpecificTime(t) => system_time_to_ns(t),
            }),
            mtime_ns: mtime.map(|t| match t {
                TimeOrNow::Now => system_time_to_ns(SystemTime::now()),
                TimeOrNow::SpecificTime(t) => system_time_to_ns(t),
            }),
        };
        match self.lfs.setattr(ino as u32, req) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr, self.block_size())),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let entries = match self.lfs.readdir(ino as u32, offset as u64) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        for entry in entries {
            let next_offset = (entry.offset + entry.rec_len as u64) as i64;
            let full = reply.add(entry.ino as u64, next_offset, to_fuse_file_type(entry.file_type), &entry.name);
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.lfs.open(ino as u32) {
            Ok(()) => reply.opened(ino, flags as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.lfs.read(ino as u32, offset.max(0) as u64, size) {
            Ok(buf) => reply.data(&buf),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.lfs.write(ino as u32, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.lfs.create(parent as u32, name, mode, req.uid(), req.gid()) {
            Ok(attr) => reply.created(&TTL, &to_file_attr(&attr, self.block_size()), attr.ino as u64, attr.ino as u64, flags as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.lfs.mkdir(parent as u32, name, mode, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr, self.block_size()), attr.ino as u64 as i64),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.lfs.unlink(parent as u32, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.lfs.rmdir(parent as u32, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name_str(name), name_str(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.lfs.rename(parent as u32, name, newparent as u32, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.lfs.statfs() {
            Ok(stat) => reply.statfs(
                stat.total_blocks,
                stat.free_blocks,
                stat.free_blocks,
                stat.total_inodes,
                stat.free_inodes,
                stat.block_size,
                255,
                stat.block_size,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.lfs.fsync(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
