//! Passphrase key derivation for keyslots.

use crate::config::{argon2_params, pbkdf2_params};
use crate::crypto::{random_bytes, HashAlg};
use crate::encoding::b64;
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Argon2 flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Argon2Variant {
    Argon2i,
    Argon2id,
}

impl Argon2Variant {
    fn algorithm(self) -> Algorithm {
        match self {
            Argon2Variant::Argon2i => Algorithm::Argon2i,
            Argon2Variant::Argon2id => Algorithm::Argon2id,
        }
    }
}

/// Cost parameters chosen by the caller, before a salt is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfParams {
    Pbkdf2 {
        hash: HashAlg,
        iterations: u32,
    },
    Argon2 {
        variant: Argon2Variant,
        time: u32,
        memory: u32,
        cpus: u32,
    },
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams::Argon2 {
            variant: Argon2Variant::Argon2id,
            time: argon2_params::TIME_COST,
            memory: argon2_params::MEMORY_COST,
            cpus: argon2_params::PARALLELISM,
        }
    }
}

/// Fixed low-cost configuration for keys that are already high-entropy.
///
/// PBKDF2-SHA512 at the NIST SP 800-132 minimum of 1000 iterations. The KDF
/// is not the security boundary in that case; never use this for
/// user-chosen passphrases.
pub fn minimal_kdf_parameters() -> KdfParams {
    KdfParams::Pbkdf2 {
        hash: HashAlg::Sha512,
        iterations: pbkdf2_params::MIN_ITERATIONS,
    }
}

impl KdfParams {
    /// Reject parameters outside the bounds this crate will run.
    pub fn validate(&self) -> Result<()> {
        match *self {
            KdfParams::Pbkdf2 { iterations, .. } => {
                if iterations < pbkdf2_params::MIN_ITERATIONS {
                    return Err(Error::KdfFailure(format!(
                        "pbkdf2 iterations {} below minimum {}",
                        iterations,
                        pbkdf2_params::MIN_ITERATIONS
                    )));
                }
            }
            KdfParams::Argon2 {
                time, memory, cpus, ..
            } => {
                if time == 0 {
                    return Err(Error::KdfFailure("argon2 time cost must be positive".into()));
                }
                if !(argon2_params::MIN_MEMORY..=argon2_params::MAX_MEMORY).contains(&memory) {
                    return Err(Error::KdfFailure(format!(
                        "argon2 memory {} KiB outside {}..={}",
                        memory,
                        argon2_params::MIN_MEMORY,
                        argon2_params::MAX_MEMORY
                    )));
                }
                if cpus == 0 || cpus > argon2_params::MAX_PARALLELISM {
                    return Err(Error::KdfFailure(format!(
                        "argon2 parallelism {} outside 1..={}",
                        cpus,
                        argon2_params::MAX_PARALLELISM
                    )));
                }
            }
        }
        Ok(())
    }

    /// True for either Argon2 variant.
    pub fn is_argon2(&self) -> bool {
        matches!(self, KdfParams::Argon2 { .. })
    }

    /// Attach a fresh random salt.
    pub fn with_random_salt(self) -> Kdf {
        let salt_len = match self {
            KdfParams::Pbkdf2 { .. } => pbkdf2_params::SALT_LENGTH,
            KdfParams::Argon2 { .. } => argon2_params::SALT_LENGTH,
        };
        self.with_salt(random_bytes(salt_len))
    }

    /// Bind the parameters to `salt`.
    pub fn with_salt(self, salt: Vec<u8>) -> Kdf {
        match self {
            KdfParams::Pbkdf2 { hash, iterations } => Kdf::Pbkdf2 {
                hash,
                iterations,
                salt,
            },
            KdfParams::Argon2 {
                variant,
                time,
                memory,
                cpus,
            } => Kdf::Argon2 {
                variant,
                time,
                memory,
                cpus,
                salt,
            },
        }
    }
}

/// Keyslot KDF as stored in the `kdf` object of a keyslot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kdf {
    Pbkdf2 {
        hash: HashAlg,
        iterations: u32,
        salt: Vec<u8>,
    },
    Argon2 {
        variant: Argon2Variant,
        time: u32,
        memory: u32,
        cpus: u32,
        salt: Vec<u8>,
    },
}

impl Kdf {
    /// Cost parameters without the salt.
    pub fn params(&self) -> KdfParams {
        match *self {
            Kdf::Pbkdf2 {
                hash, iterations, ..
            } => KdfParams::Pbkdf2 { hash, iterations },
            Kdf::Argon2 {
                variant,
                time,
                memory,
                cpus,
                ..
            } => KdfParams::Argon2 {
                variant,
                time,
                memory,
                cpus,
            },
        }
    }

    /// Salt of the derivation.
    pub fn salt(&self) -> &[u8] {
        match self {
            Kdf::Pbkdf2 { salt, .. } | Kdf::Argon2 { salt, .. } => salt,
        }
    }

    /// Derive a key-encryption key of `len` bytes from `passphrase`.
    pub fn derive_key(&self, passphrase: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
        self.params().validate()?;
        let mut key = Zeroizing::new(vec![0u8; len]);

        match self {
            Kdf::Pbkdf2 {
                hash,
                iterations,
                salt,
            } => {
                hash.pbkdf2(passphrase, salt, *iterations, &mut key);
            }
            Kdf::Argon2 {
                variant,
                time,
                memory,
                cpus,
                salt,
            } => {
                let params = Params::new(*memory, *time, *cpus, Some(len))
                    .map_err(|e| Error::KdfFailure(e.to_string()))?;
                let argon2 = Argon2::new(variant.algorithm(), Version::V0x13, params);
                argon2
                    .hash_password_into(passphrase, salt, &mut key)
                    .map_err(|e| Error::KdfFailure(e.to_string()))?;
            }
        }

        Ok(key)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum KdfRepr {
    Pbkdf2 {
        hash: HashAlg,
        iterations: u32,
        #[serde(with = "b64")]
        salt: Vec<u8>,
    },
    Argon2i {
        time: u32,
        memory: u32,
        cpus: u32,
        #[serde(with = "b64")]
        salt: Vec<u8>,
    },
    Argon2id {
        time: u32,
        memory: u32,
        cpus: u32,
        #[serde(with = "b64")]
        salt: Vec<u8>,
    },
}

impl Serialize for Kdf {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let repr = match self.clone() {
            Kdf::Pbkdf2 {
                hash,
                iterations,
                salt,
            } => KdfRepr::Pbkdf2 {
                hash,
                iterations,
                salt,
            },
            Kdf::Argon2 {
                variant: Argon2Variant::Argon2i,
                time,
                memory,
                cpus,
                salt,
            } => KdfRepr::Argon2i {
                time,
                memory,
                cpus,
                salt,
            },
            Kdf::Argon2 {
                variant: Argon2Variant::Argon2id,
                time,
                memory,
                cpus,
                salt,
            } => KdfRepr::Argon2id {
                time,
                memory,
                cpus,
                salt,
            },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Kdf {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match KdfRepr::deserialize(deserializer)? {
            KdfRepr::Pbkdf2 {
                hash,
                iterations,
                salt,
            } => Kdf::Pbkdf2 {
                hash,
                iterations,
                salt,
            },
            KdfRepr::Argon2i {
                time,
                memory,
                cpus,
                salt,
            } => Kdf::Argon2 {
                variant: Argon2Variant::Argon2i,
                time,
                memory,
                cpus,
                salt,
            },
            KdfRepr::Argon2id {
                time,
                memory,
                cpus,
                salt,
            } => Kdf::Argon2 {
                variant: Argon2Variant::Argon2id,
                time,
                memory,
                cpus,
                salt,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_argon2() -> KdfParams {
        KdfParams::Argon2 {
            variant: Argon2Variant::Argon2id,
            time: 1,
            memory: 64,
            cpus: 1,
        }
    }

    #[test]
    fn test_key_derivation_deterministic() {
        let kdf = minimal_kdf_parameters().with_salt(vec![1u8; 32]);

        let key1 = kdf.derive_key(b"password123", 32).unwrap();
        let key2 = kdf.derive_key(b"password123", 32).unwrap();

        assert_eq!(*key1, *key2);
    }

    #[test]
    fn test_different_passwords_different_keys() {
        let kdf = small_argon2().with_salt(vec![2u8; 32]);

        let key1 = kdf.derive_key(b"password1", 32).unwrap();
        let key2 = kdf.derive_key(b"password2", 32).unwrap();

        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_different_salts_different_keys() {
        let kdf1 = small_argon2().with_salt(vec![1u8; 32]);
        let kdf2 = small_argon2().with_salt(vec![2u8; 32]);

        let key1 = kdf1.derive_key(b"password", 64).unwrap();
        let key2 = kdf2.derive_key(b"password", 64).unwrap();

        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_random_salt() {
        let kdf1 = minimal_kdf_parameters().with_random_salt();
        let kdf2 = minimal_kdf_parameters().with_random_salt();

        assert_ne!(kdf1.salt(), kdf2.salt());
    }

    #[test]
    fn test_minimal_parameters() {
        assert_eq!(
            minimal_kdf_parameters(),
            KdfParams::Pbkdf2 {
                hash: HashAlg::Sha512,
                iterations: 1000
            }
        );
    }

    #[test]
    fn test_validate_rejects_low_iterations() {
        let params = KdfParams::Pbkdf2 {
            hash: HashAlg::Sha256,
            iterations: 10,
        };
        assert!(matches!(params.validate(), Err(Error::KdfFailure(_))));
    }

    #[test]
    fn test_json_layout() {
        let kdf = small_argon2().with_salt(vec![0u8; 4]);
        let value = serde_json::to_value(&kdf).unwrap();
        assert_eq!(value["type"], "argon2id");
        assert_eq!(value["memory"], 64);
        assert_eq!(value["salt"], "AAAAAA==");

        let back: Kdf = serde_json::from_value(value).unwrap();
        assert_eq!(back, kdf);
    }
}
