//! Exclusive metadata lock.
//!
//! Only one writer may mutate a volume's header at a time. File-backed
//! devices take an `flock` on the device file; in-memory devices use a
//! shared flag. Acquisition polls until the caller's timeout expires.

use crate::error::{Error, Result};
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Interval between lock attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Holds the metadata lock until dropped.
#[derive(Debug)]
pub enum MetadataLockGuard {
    File(File),
    Flag(Arc<AtomicBool>),
}

impl Drop for MetadataLockGuard {
    fn drop(&mut self) {
        match self {
            MetadataLockGuard::File(file) => {
                let _ = unlock(file);
            }
            MetadataLockGuard::Flag(flag) => flag.store(false, Ordering::Release),
        }
    }
}

/// Poll `attempt` until it reports success or `timeout` passes.
fn poll<F>(timeout: Duration, mut attempt: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if attempt()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::LockTimeout(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Lock `file` exclusively. The guard owns `file`.
pub fn lock_file(file: File, timeout: Duration) -> Result<MetadataLockGuard> {
    poll(timeout, || try_lock_exclusive(&file).map_err(Error::Io))?;
    Ok(MetadataLockGuard::File(file))
}

/// Take an in-process lock flag.
pub fn lock_flag(flag: &Arc<AtomicBool>, timeout: Duration) -> Result<MetadataLockGuard> {
    poll(timeout, || {
        Ok(flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    })?;
    Ok(MetadataLockGuard::Flag(Arc::clone(flag)))
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    let fd = std::os::unix::io::AsRawFd::as_raw_fd(file);
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(true)
    } else {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> std::io::Result<()> {
    let fd = std::os::unix::io::AsRawFd::as_raw_fd(file);
    let result = unsafe { libc::flock(fd, libc::LOCK_UN) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

// Advisory locking is only implemented for unix; elsewhere the caller's
// outer serialization is relied upon.
#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> std::io::Result<()> {
    Ok(())
}
