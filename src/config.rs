//! Configuration constants and types for LUKS2 volumes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Magic of the primary header copy.
pub const LUKS2_MAGIC_PRIMARY: [u8; 6] = *b"LUKS\xba\xbe";

/// Magic of the secondary header copy.
pub const LUKS2_MAGIC_SECONDARY: [u8; 6] = *b"SKUL\xba\xbe";

/// On-disk format version handled by this crate.
pub const LUKS2_VERSION: u16 = 2;

/// Size of the fixed binary part of each header copy.
pub const BINARY_HEADER_SIZE: u64 = 4096;

/// Default size of one header copy (binary header plus JSON area).
pub const DEFAULT_METADATA_SIZE: u64 = 16 * 1024;

/// Header copy sizes the format allows.
pub const VALID_METADATA_SIZES: [u64; 9] = [
    16 * 1024,
    32 * 1024,
    64 * 1024,
    128 * 1024,
    256 * 1024,
    512 * 1024,
    1024 * 1024,
    2048 * 1024,
    4096 * 1024,
];

/// Default keyslots area size, so data starts at 16 MiB with default metadata.
pub const DEFAULT_KEYSLOTS_SIZE: u64 = 16 * 1024 * 1024 - 2 * DEFAULT_METADATA_SIZE;

/// Highest number of keyslots a header can describe.
pub const KEYSLOTS_MAX: usize = 32;

/// Highest number of tokens a header can describe.
pub const TOKENS_MAX: usize = 32;

/// Default data sector size.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// The only data cipher this crate implements.
pub const DEFAULT_CIPHER: &str = "aes-xts-plain64";

/// Volume key size for AES-256 in XTS mode (two 256-bit keys).
pub const DEFAULT_VOLUME_KEY_SIZE: usize = 64;

/// Volume key sizes the data cipher accepts: AES-128-XTS and AES-256-XTS.
pub const VALID_VOLUME_KEY_SIZES: [usize; 2] = [32, 64];

/// Check a volume key size against [`VALID_VOLUME_KEY_SIZES`].
pub fn validate_key_size(key_size: usize) -> Result<(), String> {
    if VALID_VOLUME_KEY_SIZES.contains(&key_size) {
        Ok(())
    } else {
        Err(format!(
            "Key size must be one of {:?} bytes, got {}",
            VALID_VOLUME_KEY_SIZES, key_size
        ))
    }
}

/// Checksum algorithm written into the binary header.
pub const CHECKSUM_ALG: &str = "sha256";

/// Alignment of keyslot areas and the data segment.
pub const AREA_ALIGNMENT: u64 = 4096;

/// Anti-forensic splitter parameters.
pub mod af_params {
    /// Number of stripes per key.
    pub const STRIPES: u32 = 4000;

    /// Diffusion hash.
    pub const HASH: &str = "sha256";
}

/// Argon2 parameters for keyslot key derivation.
pub mod argon2_params {
    /// Memory cost in KiB (256 MB).
    pub const MEMORY_COST: u32 = 262_144;

    /// Time cost (iterations).
    pub const TIME_COST: u32 = 4;

    /// Parallelism factor.
    pub const PARALLELISM: u32 = 4;

    /// Salt length in bytes.
    pub const SALT_LENGTH: usize = 32;

    /// Lowest accepted memory cost in KiB.
    pub const MIN_MEMORY: u32 = 32;

    /// Highest accepted memory cost in KiB (4 GB).
    pub const MAX_MEMORY: u32 = 4 * 1024 * 1024;

    /// Highest accepted parallelism.
    pub const MAX_PARALLELISM: u32 = 4;
}

/// PBKDF2 parameters for keyslots and volume key digests.
pub mod pbkdf2_params {
    /// Default iteration count for passphrase keyslots.
    pub const DEFAULT_ITERATIONS: u32 = 1_000_000;

    /// Minimum iteration count (NIST SP 800-132, section 5.2).
    pub const MIN_ITERATIONS: u32 = 1000;

    /// Hash for the minimal, high-entropy-key configuration.
    pub const MINIMAL_HASH: &str = "sha512";

    /// Default iteration count of the volume key digest.
    pub const DIGEST_ITERATIONS: u32 = 100_000;

    /// Salt length in bytes.
    pub const SALT_LENGTH: usize = 32;

    /// Digest output length in bytes.
    pub const DIGEST_LENGTH: usize = 32;
}

/// Secure wipe parameters.
pub mod wipe_params {
    /// Number of random overwrite passes.
    pub const RANDOM_PASSES: u8 = 3;

    /// Number of zero overwrite passes.
    pub const ZERO_PASSES: u8 = 1;
}

/// Reencryption parameters.
pub mod reencrypt_params {
    /// Default chunk size (1 MiB).
    pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

    /// Requirement flag recorded while a job is pending.
    pub const REQUIREMENT: &str = "online-reencrypt-v2";

    /// Hotzone checksum hash.
    pub const CHECKSUM_HASH: &str = "sha256";
}

/// Environment variable redirecting the token module directory.
pub const TOKEN_PATH_ENV: &str = "LUKS2_TOKEN_PATH";

/// Token module directory when the override is unset.
pub const DEFAULT_TOKEN_DIR: &str = "/usr/lib/luks2/tokens";

/// Default wait for the metadata lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve the token module directory, honouring the environment override.
pub fn token_module_dir() -> PathBuf {
    match std::env::var_os(TOKEN_PATH_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_TOKEN_DIR),
    }
}

/// Options for formatting a new volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Data cipher, e.g. `aes-xts-plain64`.
    pub cipher: String,

    /// Volume key size in bytes.
    pub key_size: usize,

    /// Data sector size (512 to 4096, power of two).
    pub sector_size: u32,

    /// Size of one header copy.
    pub metadata_size: u64,

    /// Size of the keyslots area.
    pub keyslots_size: u64,

    /// Explicit data segment offset; by default data follows the keyslots
    /// area directly.
    #[serde(default)]
    pub data_offset: Option<u64>,

    /// Optional label.
    pub label: Option<String>,

    /// Optional subsystem tag.
    pub subsystem: Option<String>,

    /// Fixed UUID instead of a random one.
    pub uuid: Option<String>,

    /// Iterations of the volume key digest.
    pub digest_iterations: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            cipher: DEFAULT_CIPHER.to_string(),
            key_size: DEFAULT_VOLUME_KEY_SIZE,
            sector_size: DEFAULT_SECTOR_SIZE,
            metadata_size: DEFAULT_METADATA_SIZE,
            keyslots_size: DEFAULT_KEYSLOTS_SIZE,
            data_offset: None,
            label: None,
            subsystem: None,
            uuid: None,
            digest_iterations: pbkdf2_params::DIGEST_ITERATIONS,
        }
    }
}

impl FormatOptions {
    /// End of the keyslots area.
    pub fn keyslots_end(&self) -> u64 {
        2 * self.metadata_size + self.keyslots_size
    }

    /// Offset of the data segment.
    pub fn data_offset(&self) -> u64 {
        self.data_offset.unwrap_or_else(|| self.keyslots_end())
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<(), String> {
        if self.cipher != DEFAULT_CIPHER {
            return Err(format!("Cipher must be {}", DEFAULT_CIPHER));
        }
        validate_key_size(self.key_size)?;
        if !(512..=4096).contains(&self.sector_size) || !self.sector_size.is_power_of_two() {
            return Err("Sector size must be a power of 2 between 512 and 4096".to_string());
        }
        if !VALID_METADATA_SIZES.contains(&self.metadata_size) {
            return Err(format!("Invalid metadata size {}", self.metadata_size));
        }
        if self.keyslots_size == 0 || self.keyslots_size % AREA_ALIGNMENT != 0 {
            return Err("Keyslots size must be a non-zero multiple of 4096".to_string());
        }
        if let Some(offset) = self.data_offset {
            if offset % u64::from(self.sector_size) != 0 {
                return Err(format!(
                    "Data offset {} is not aligned to the {}-byte sector size",
                    offset, self.sector_size
                ));
            }
            if offset < self.keyslots_end() {
                return Err(format!(
                    "Data offset {} lies inside the keyslots area ending at {}",
                    offset,
                    self.keyslots_end()
                ));
            }
        }
        if self.label.as_ref().is_some_and(|l| l.len() >= 48) {
            return Err("Label must be shorter than 48 bytes".to_string());
        }
        if self.subsystem.as_ref().is_some_and(|s| s.len() >= 48) {
            return Err("Subsystem must be shorter than 48 bytes".to_string());
        }
        if self.digest_iterations < pbkdf2_params::MIN_ITERATIONS {
            return Err(format!(
                "Digest iterations must be at least {}",
                pbkdf2_params::MIN_ITERATIONS
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let opts = FormatOptions::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.data_offset(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_rejects_odd_sector_size() {
        let opts = FormatOptions {
            sector_size: 1000,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_data_offset_override() {
        let opts = FormatOptions {
            data_offset: Some(32 * 1024 * 1024),
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
        assert_eq!(opts.data_offset(), 32 * 1024 * 1024);
        assert_eq!(opts.keyslots_end(), 16 * 1024 * 1024);

        let unaligned = FormatOptions {
            data_offset: Some(16 * 1024 * 1024 + 100),
            ..Default::default()
        };
        assert!(unaligned.validate().is_err());

        let overlapping = FormatOptions {
            data_offset: Some(8 * 1024 * 1024),
            ..Default::default()
        };
        assert!(overlapping.validate().is_err());
    }

    #[test]
    fn test_key_sizes() {
        for key_size in [32, 64] {
            let opts = FormatOptions {
                key_size,
                ..Default::default()
            };
            assert!(opts.validate().is_ok(), "{}", key_size);
        }
        let opts = FormatOptions {
            key_size: 48,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_metadata_size() {
        let opts = FormatOptions {
            metadata_size: 20000,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
