//! Block device abstraction.
//!
//! The header codec, keyslot manager and reencryption coordinator only talk
//! to storage through [`BlockDevice`]. [`FileDevice`] backs it with a file or
//! a raw device node; [`MemDevice`] keeps everything in memory.

use crate::error::{Error, Result};
use crate::storage::lock::{lock_file, lock_flag, MetadataLockGuard};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Random-access storage holding a LUKS2 volume.
pub trait BlockDevice: Send {
    /// Total size in bytes.
    fn size(&mut self) -> Result<u64>;

    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush written data to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Take the exclusive metadata lock, waiting at most `timeout`.
    ///
    /// Devices without a lock return `Ok(None)`.
    fn lock_metadata(&self, _timeout: Duration) -> Result<Option<MetadataLockGuard>> {
        Ok(None)
    }

    /// Human-readable name (for logging).
    fn name(&self) -> String;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn size(&mut self) -> Result<u64> {
        (**self).size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }

    fn lock_metadata(&self, timeout: Duration) -> Result<Option<MetadataLockGuard>> {
        (**self).lock_metadata(timeout)
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

/// A regular file or device node.
pub struct FileDevice {
    file: File,
    path: PathBuf,
}

impl FileDevice {
    /// Open an existing file or device for reading and writing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Create (or truncate) an image file of `size` bytes.
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn size(&mut self) -> Result<u64> {
        // Device nodes report zero in metadata; seeking to the end works for both.
        let size = self.file.seek(SeekFrom::End(0))?;
        Ok(size)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn lock_metadata(&self, timeout: Duration) -> Result<Option<MetadataLockGuard>> {
        let handle = File::open(&self.path)?;
        lock_file(handle, timeout).map(Some)
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory device. Clones share the same bytes and lock.
#[derive(Clone)]
pub struct MemDevice {
    data: Arc<Mutex<Vec<u8>>>,
    locked: Arc<AtomicBool>,
}

impl MemDevice {
    /// Zero-filled device of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; size])),
            locked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Device holding `bytes`, with its own lock.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(bytes)),
            locked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> Result<T>) -> Result<T> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::Io(std::io::Error::other("memory device poisoned")))?;
        f(&mut data)
    }
}

fn out_of_range(offset: u64, len: usize, size: usize) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("{} bytes at {} beyond device end {}", len, offset, size),
    ))
}

impl BlockDevice for MemDevice {
    fn size(&mut self) -> Result<u64> {
        self.with_data(|d| Ok(d.len() as u64))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.with_data(|d| {
            let start = offset as usize;
            let end = start
                .checked_add(buf.len())
                .filter(|&end| end <= d.len())
                .ok_or_else(|| out_of_range(offset, buf.len(), d.len()))?;
            buf.copy_from_slice(&d[start..end]);
            Ok(())
        })
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.with_data(|d| {
            let start = offset as usize;
            let end = start
                .checked_add(data.len())
                .filter(|&end| end <= d.len())
                .ok_or_else(|| out_of_range(offset, data.len(), d.len()))?;
            d[start..end].copy_from_slice(data);
            Ok(())
        })
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn lock_metadata(&self, timeout: Duration) -> Result<Option<MetadataLockGuard>> {
        lock_flag(&self.locked, timeout).map(Some)
    }

    fn name(&self) -> String {
        "memory".to_string()
    }
}
