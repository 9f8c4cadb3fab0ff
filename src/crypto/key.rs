//! In-memory volume key.

use crate::crypto::random_bytes;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// The symmetric key protecting bulk data (securely zeroized on drop).
#[derive(Clone)]
pub struct VolumeKey {
    key: Vec<u8>,
}

impl VolumeKey {
    /// Generate a random key of `len` bytes.
    pub fn generate(len: usize) -> Self {
        Self {
            key: random_bytes(len),
        }
    }

    /// Wrap a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            key: bytes.to_vec(),
        }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.key.len()
    }

    /// True for a zero-length key.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl Drop for VolumeKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl PartialEq for VolumeKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.len() == other.key.len() && bool::from(self.key.ct_eq(&other.key))
    }
}

impl Eq for VolumeKey {}

impl fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeKey({} bytes)", self.key.len())
    }
}
