//! Volume key digests.
//!
//! A digest is PBKDF2 over the volume key. It is the integrity tag that
//! tells a correctly decrypted key apart from garbage produced by a wrong
//! passphrase.

use crate::config::pbkdf2_params;
use crate::crypto::{HashAlg, VolumeKey};
use subtle::ConstantTimeEq;

/// Compute the digest of `key`.
pub fn digest_volume_key(key: &VolumeKey, hash: HashAlg, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut out = vec![0u8; pbkdf2_params::DIGEST_LENGTH];
    hash.pbkdf2(key.as_bytes(), salt, iterations, &mut out);
    out
}

/// Constant-time comparison of `key`'s digest against `expected`.
pub fn verify_volume_key(
    key: &VolumeKey,
    hash: HashAlg,
    salt: &[u8],
    iterations: u32,
    expected: &[u8],
) -> bool {
    let mut out = vec![0u8; expected.len()];
    hash.pbkdf2(key.as_bytes(), salt, iterations, &mut out);
    bool::from(out.ct_eq(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_matches_only_same_key() {
        let key = VolumeKey::from_bytes(&[1u8; 64]);
        let other = VolumeKey::from_bytes(&[2u8; 64]);
        let salt = [3u8; 32];

        let digest = digest_volume_key(&key, HashAlg::Sha256, &salt, 1000);
        assert!(verify_volume_key(&key, HashAlg::Sha256, &salt, 1000, &digest));
        assert!(!verify_volume_key(&other, HashAlg::Sha256, &salt, 1000, &digest));
    }
}
