//! Storage layer for volume metadata and data.
//!
//! This module handles:
//! - Random-access devices (files, device nodes, memory)
//! - The exclusive metadata lock
//! - Secure overwrite of key material

mod device;
mod lock;
mod wipe;

pub use device::{BlockDevice, FileDevice, MemDevice};
pub use lock::MetadataLockGuard;
pub use wipe::wipe_region;
