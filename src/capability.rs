//! Runtime capability query.
//!
//! Optional functionality is resolved once into a [`Capabilities`] value and
//! handed to the components that need it. Feature-gated operations call
//! [`Capabilities::require`] and fail with [`Error::Unsupported`] instead of
//! being absent from the API.

use crate::config::token_module_dir;
use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

static DETECTED: OnceLock<Capabilities> = OnceLock::new();

/// Optional features an operation may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Argon2,
    Reencryption,
    SignedKeyActivation,
    KeyringActivation,
    ResumeByVolumeKey,
    MetadataSizeOverride,
    DataOffsetOverride,
}

impl Feature {
    pub const ALL: [Feature; 7] = [
        Feature::Argon2,
        Feature::Reencryption,
        Feature::SignedKeyActivation,
        Feature::KeyringActivation,
        Feature::ResumeByVolumeKey,
        Feature::MetadataSizeOverride,
        Feature::DataOffsetOverride,
    ];

    /// Human-readable feature name.
    pub fn name(self) -> &'static str {
        match self {
            Feature::Argon2 => "argon2 key derivation",
            Feature::Reencryption => "reencryption",
            Feature::SignedKeyActivation => "signed volume key activation",
            Feature::KeyringActivation => "keyring volume key activation",
            Feature::ResumeByVolumeKey => "resume by volume key",
            Feature::MetadataSizeOverride => "custom metadata size",
            Feature::DataOffsetOverride => "custom data offset",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of features available to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub argon2: bool,
    pub reencryption: bool,
    pub signed_key_activation: bool,
    pub keyring_activation: bool,
    pub resume_by_volume_key: bool,
    pub metadata_size_override: bool,
    pub data_offset_override: bool,
    /// Directory external token handlers are looked up in.
    pub token_module_dir: PathBuf,
}

impl Capabilities {
    /// Capabilities of this build, resolved on first call.
    pub fn detect() -> &'static Capabilities {
        DETECTED.get_or_init(Self::from_build)
    }

    fn from_build() -> Self {
        Self {
            argon2: true,
            reencryption: cfg!(feature = "reencryption"),
            signed_key_activation: cfg!(feature = "signed-key"),
            keyring_activation: cfg!(feature = "keyring"),
            resume_by_volume_key: true,
            metadata_size_override: true,
            data_offset_override: true,
            token_module_dir: token_module_dir(),
        }
    }

    /// Everything enabled.
    pub fn all() -> Self {
        Self {
            argon2: true,
            reencryption: true,
            signed_key_activation: true,
            keyring_activation: true,
            resume_by_volume_key: true,
            metadata_size_override: true,
            data_offset_override: true,
            token_module_dir: token_module_dir(),
        }
    }

    /// Only the base format; every optional feature disabled.
    pub fn minimal() -> Self {
        Self {
            argon2: false,
            reencryption: false,
            signed_key_activation: false,
            keyring_activation: false,
            resume_by_volume_key: false,
            metadata_size_override: false,
            data_offset_override: false,
            token_module_dir: token_module_dir(),
        }
    }

    /// Whether `feature` is available.
    pub fn has(&self, feature: Feature) -> bool {
        match feature {
            Feature::Argon2 => self.argon2,
            Feature::Reencryption => self.reencryption,
            Feature::SignedKeyActivation => self.signed_key_activation,
            Feature::KeyringActivation => self.keyring_activation,
            Feature::ResumeByVolumeKey => self.resume_by_volume_key,
            Feature::MetadataSizeOverride => self.metadata_size_override,
            Feature::DataOffsetOverride => self.data_offset_override,
        }
    }

    /// Fail with `Unsupported` unless `feature` is available.
    pub fn require(&self, feature: Feature) -> Result<()> {
        if self.has(feature) {
            Ok(())
        } else {
            Err(Error::Unsupported(feature))
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::detect().clone()
    }
}
