//! Positional access to the backing store (§4.1).
//!
//! The engine never holds a raw `fd` anywhere else: every read or write to
//! the image file funnels through a `Device`, so the buffer cache is the
//! only other component that touches bytes on disk.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{Error, Result};

/// A block-addressed view over a regular file (or block device node).
pub struct Device {
    file: File,
    block_size: u32,
    read_only: bool,
}

impl Device {
    /// Opens `path` for both reading and writing.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Device { file, block_size, read_only: false })
    }

    /// Opens `path` read-only; every `write_block` call then fails with
    /// `Error::Io`. Used by `lfsck` and `lfsdump`, which must never mutate
    /// the image they inspect.
    pub fn open_read_only(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Device { file, block_size, read_only: true })
    }

    /// Creates (or truncates) `path` and preallocates it to `block_count`
    /// blocks, for use by `mklfs`.
    pub fn create(path: impl AsRef<Path>, block_size: u32, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * block_size as u64)?;
        Ok(Device { file, block_size, read_only: false })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Total number of blocks the backing file currently spans.
    pub fn block_count(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        Ok(len / self.block_size as u64)
    }

    /// Reads exactly one block into `buf`, which must be `block_size` bytes.
    pub fn read_block(&self, block_no: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        let offset = block_no * self.block_size as u64;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Writes exactly one block from `buf`, which must be `block_size`
    /// bytes.
    pub fn write_block(&self, block_no: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device is read-only",
            )));
        }
        debug_assert_eq!(buf.len(), self.block_size as usize);
        let offset = block_no * self.block_size as u64;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Reads `count` contiguous blocks starting at `block_no` into `buf`
    /// (`buf.len()` must equal `count * block_size`). Used by the segment
    /// writer to flush a whole segment in one syscall.
    pub fn read_range(&self, block_no: u64, buf: &mut [u8]) -> Result<()> {
        let offset = block_no * self.block_size as u64;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Writes `buf` (a multiple of `block_size` bytes) starting at
    /// `block_no`.
    pub fn write_range(&self, block_no: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device is read-only",
            )));
        }
        let offset = block_no * self.block_size as u64;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Forces all prior writes to stable storage. Every durability point in
    /// the engine (segment flush, checkpoint commit) calls this before
    /// considering the write durable.
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_a_block() {
        let tmp = NamedTempFile::new().unwrap();
        let dev = Device::create(tmp.path(), 4096, 16).unwrap();
        let mut data = vec![0u8; 4096];
        data[0] = 0xAB;
        data[4095] = 0xCD;
        dev.write_block(3, &data).unwrap();

        let mut readback = vec![0u8; 4096];
        dev.read_block(3, &mut readback).unwrap();
        assert_eq!(data, readback);
    }

    #[test]
    fn read_only_rejects_writes() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let dev = Device::create(tmp.path(), 4096, 4).unwrap();
            dev.write_block(0, &vec![1u8; 4096]).unwrap();
        }
        let dev = Device::open_read_only(tmp.path(), 4096).unwrap();
        assert!(dev.write_block(0, &vec![2u8; 4096]).is_err());
        let mut buf = vec![0u8; 4096];
        dev.read_block(0, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
    }
}
