//! Secure overwrite of device regions.

use crate::config::wipe_params;
use crate::error::Result;
use crate::storage::BlockDevice;
use rand::RngCore;

/// Largest buffer used per write.
const WIPE_CHUNK: usize = 64 * 1024;

/// Overwrite `len` bytes at `offset`.
///
/// Performs multiple overwrite passes:
/// 1. Random data passes
/// 2. Zero passes
///
/// Each pass is synced before the next one starts.
pub fn wipe_region<D: BlockDevice + ?Sized>(
    device: &mut D,
    offset: u64,
    len: u64,
    passes: Option<u8>,
) -> Result<()> {
    let random_passes = passes.unwrap_or(wipe_params::RANDOM_PASSES);
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; WIPE_CHUNK.min(len as usize)];

    for _ in 0..random_passes {
        let mut pos = 0u64;
        while pos < len {
            let n = WIPE_CHUNK.min((len - pos) as usize);
            rng.fill_bytes(&mut buf[..n]);
            device.write_at(offset + pos, &buf[..n])?;
            pos += n as u64;
        }
        device.sync()?;
    }

    buf.fill(0);
    for _ in 0..wipe_params::ZERO_PASSES {
        let mut pos = 0u64;
        while pos < len {
            let n = WIPE_CHUNK.min((len - pos) as usize);
            device.write_at(offset + pos, &buf[..n])?;
            pos += n as u64;
        }
        device.sync()?;
    }

    Ok(())
}
