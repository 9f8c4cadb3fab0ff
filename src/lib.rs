//! LUKS2-compatible volume encryption.
//!
//! A library for managing encrypted block volumes in the LUKS2 on-disk
//! format: the redundant binary+JSON header, passphrase keyslots, opaque
//! tokens, the volume key lifecycle and resumable in-place reencryption.
//!
//! # Features
//!
//! - **Two-copy header**: checksummed primary and secondary copies, written
//!   in an order that keeps one valid copy through a crash
//! - **Keyslots**: Argon2id/PBKDF2 key derivation, anti-forensic splitting
//!   and AES-XTS encrypted key material
//! - **Tokens**: JSON objects bound to a keyslot for external unlock agents
//! - **Reencryption**: chunked, checksum-protected and resumable
//!
//! # Architecture
//!
//! ```text
//! Passphrase → KDF → Keyslot (AF + AES-XTS) → Volume Key → Data Segment
//!                          ↑ digest check
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use luks2_core::crypto::KdfParams;
//! use luks2_core::storage::FileDevice;
//! use luks2_core::{FormatOptions, Volume};
//! use std::path::Path;
//!
//! let device = FileDevice::create(Path::new("disk.img"), 64 * 1024 * 1024).unwrap();
//! let (mut volume, key) = Volume::format(device, &FormatOptions::default()).unwrap();
//! volume
//!     .add_keyslot(&key, b"passphrase", KdfParams::default())
//!     .unwrap();
//!
//! let mut active = volume.into_active();
//! active.activate_by_passphrase(b"passphrase", None).unwrap();
//! active.write_sectors(0, &[0u8; 512]).unwrap();
//! ```

pub mod capability;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod header;
pub mod keyslot;
pub mod logging;
pub mod reencrypt;
pub mod storage;
pub mod token;
pub mod volume;

pub use capability::{Capabilities, Feature};
pub use config::FormatOptions;
pub use error::{Error, ErrorKind, Result};
pub use reencrypt::{CancelToken, Progress, ReencryptKeys, ReencryptParams, Reencryptor};
pub use volume::{ActiveVolume, Volume, VolumeContext, VolumeState};
