//! A user-space log-structured file system, mounted through FUSE.
//!
//! The crate is split into the on-disk/in-memory engine (`superblock`,
//! `bio`, `imap`, `segment`, `segment_writer`, `inode`, `directory`,
//! `checkpoint`, `recovery`, `cleaner`, `tx`) and the top-level context
//! object `fs::Lfs` that wires them together and exposes the operations a
//! file system front-end calls. `adapter` is the only module that knows
//! about `fuser`; everything below it is plain Rust with no FUSE
//! dependency, so the engine can be exercised directly in tests and by the
//! `mklfs`/`lfsck`/`lfsdump` utilities without mounting anything.

pub mod adapter;
pub mod bio;
pub mod checkpoint;
pub mod cleaner;
pub mod device;
pub mod directory;
pub mod error;
pub mod fs;
pub mod imap;
pub mod inode;
pub mod param;
pub mod recovery;
pub mod segment;
pub mod segment_writer;
pub mod superblock;
pub mod tx;

pub use error::{Error, Result};
pub use fs::{Attr, Lfs, MountOptions, SetAttrRequest, StatFs};
