//! AES-XTS sector encryption with plain64 IVs.
//!
//! Used for both the keyslot areas and the data segment. The IV of a sector
//! is its 64-bit little-endian number, zero padded to one AES block.

use crate::config::DEFAULT_CIPHER;
use crate::error::{Error, Result};
use aes::cipher::{InvalidLength, KeyInit};
use aes::{Aes128, Aes256};
use xts_mode::Xts128;

/// AES block size.
const BLOCK_SIZE: usize = 16;

enum XtsKeys {
    Aes128(Xts128<Aes128>),
    Aes256(Xts128<Aes256>),
}

/// plain64 IV: the low 64 bits of the sector number, little-endian.
fn plain64(sector: u128) -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    iv[..8].copy_from_slice(&(sector as u64).to_le_bytes());
    iv
}

/// AES-XTS cipher bound to a key and a sector size.
pub struct SectorCipher {
    keys: XtsKeys,
    sector_size: usize,
}

impl SectorCipher {
    /// Create a cipher for the cipher `name` (only `aes-xts-plain64`).
    ///
    /// A 32-byte key selects AES-128-XTS, a 64-byte key AES-256-XTS.
    pub fn new(name: &str, key: &[u8], sector_size: usize) -> Result<Self> {
        if name != DEFAULT_CIPHER {
            return Err(Error::UnsupportedParameter(format!("cipher {}", name)));
        }
        if sector_size == 0 || sector_size % BLOCK_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "sector size {} is not a multiple of {}",
                sector_size, BLOCK_SIZE
            )));
        }

        let (data, tweak) = key.split_at(key.len() / 2);
        let bad_key = |_: InvalidLength| Error::UnsupportedParameter(format!("{}-byte XTS key", key.len()));
        let keys = match key.len() {
            32 => XtsKeys::Aes128(Xts128::new(
                Aes128::new_from_slice(data).map_err(bad_key)?,
                Aes128::new_from_slice(tweak).map_err(bad_key)?,
            )),
            64 => XtsKeys::Aes256(Xts128::new(
                Aes256::new_from_slice(data).map_err(bad_key)?,
                Aes256::new_from_slice(tweak).map_err(bad_key)?,
            )),
            n => {
                return Err(Error::UnsupportedParameter(format!("{}-byte XTS key", n)));
            }
        };

        Ok(Self { keys, sector_size })
    }

    /// Bytes per sector.
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Encrypt whole sectors in place, the first one numbered `first_sector`.
    pub fn encrypt(&self, first_sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len())?;
        let first = u128::from(first_sector);
        match &self.keys {
            XtsKeys::Aes128(xts) => xts.encrypt_area(buf, self.sector_size, first, plain64),
            XtsKeys::Aes256(xts) => xts.encrypt_area(buf, self.sector_size, first, plain64),
        }
        Ok(())
    }

    /// Decrypt whole sectors in place, the first one numbered `first_sector`.
    pub fn decrypt(&self, first_sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len())?;
        let first = u128::from(first_sector);
        match &self.keys {
            XtsKeys::Aes128(xts) => xts.decrypt_area(buf, self.sector_size, first, plain64),
            XtsKeys::Aes256(xts) => xts.decrypt_area(buf, self.sector_size, first, plain64),
        }
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len % self.sector_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "buffer of {} bytes is not a whole number of {}-byte sectors",
                len, self.sector_size
            )));
        }
        Ok(())
    }
}
