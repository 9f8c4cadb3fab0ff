//! Error types for LUKS2 volume operations.
//!
//! Every failure is a specific [`Error`] variant; [`Error::kind`] folds it
//! into the small [`ErrorKind`] taxonomy that unlock and provisioning flows
//! branch on.

use crate::capability::Feature;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for volume operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable classification of failures surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Feature or format revision unavailable.
    NotSupported,
    /// Header or JSON unreadable, checksum mismatch, broken references.
    Corrupt,
    /// Index or field absent.
    NotFound,
    /// Value present but of the wrong kind or shape.
    TypeMismatch,
    /// Passphrase or key verification failed.
    WrongCredential,
    /// No free keyslot, token or metadata space.
    NoCapacity,
    /// Underlying storage error.
    IoFailure,
    /// Operation aborted between atomic steps.
    Cancelled,
    /// Caller supplied an out-of-range index or invalid parameters.
    InvalidArgument,
}

/// Reasons a token's `keyslots` field cannot be turned into a keyslot index.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyslotRefError {
    /// No `keyslots` field.
    #[error("token has no \"keyslots\" field")]
    MissingField,

    /// `keyslots` is not an array of exactly one element.
    #[error("token \"keyslots\" must be an array with exactly one element")]
    NotSingleton,

    /// The element is not a string holding a decimal integer.
    #[error("token keyslot reference is not an integer: {0}")]
    NotAnInteger(String),

    /// The element parsed to a negative number.
    #[error("token keyslot reference is negative: {0}")]
    NegativeIndex(i64),
}

/// Errors that can occur in volume operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the backing device.
    #[error("[LK1000] I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata lock could not be taken in time.
    #[error("[LK1001] metadata lock not acquired within {0:?}")]
    LockTimeout(Duration),

    /// Device is smaller than the layout requires.
    #[error("[LK1002] device too small: need {needed} bytes, have {available} bytes")]
    DeviceTooSmall { needed: u64, available: u64 },

    /// Capability not present in this build or environment.
    #[error("[LK1100] not supported: {0}")]
    Unsupported(Feature),

    /// Cipher or format option this implementation does not handle.
    #[error("[LK1101] unsupported parameter: {0}")]
    UnsupportedParameter(String),

    /// Header carries a known magic but an unknown version.
    #[error("[LK1102] unsupported LUKS version: {0}")]
    UnsupportedVersion(u16),

    /// No readable header copy.
    #[error("[LK1200] header corrupt: {0}")]
    Corrupt(String),

    /// Header checksum does not match its contents.
    #[error("[LK1201] header checksum mismatch")]
    ChecksumMismatch,

    /// JSON metadata does not fit the configured area.
    #[error("[LK1202] JSON metadata needs {needed} bytes, area holds {available} bytes")]
    JsonAreaOverflow { needed: usize, available: usize },

    /// Metadata references an object that does not exist.
    #[error("[LK1203] dangling reference: {0}")]
    DanglingReference(String),

    /// JSON (de)serialization failure.
    #[error("[LK1204] JSON error: {0}")]
    Json(String),

    /// Every keyslot index is in use.
    #[error("[LK1300] no free keyslot")]
    NoFreeSlot,

    /// The keyslot area has no gap large enough for new key material.
    #[error("[LK1301] keyslots area full: need {needed} bytes")]
    KeyslotAreaFull { needed: u64 },

    /// Keyslot index beyond the format maximum.
    #[error("[LK1302] keyslot index {0} out of range")]
    SlotIndexOutOfRange(usize),

    /// Keyslot index is not occupied.
    #[error("[LK1303] keyslot {0} is empty")]
    SlotEmpty(usize),

    /// Keyslot exists but its metadata or material is unusable.
    #[error("[LK1304] keyslot {slot} corrupt: {reason}")]
    SlotCorrupt { slot: usize, reason: String },

    /// Key derivation rejected its parameters or failed.
    #[error("[LK1305] key derivation failed: {0}")]
    KdfFailure(String),

    /// Passphrase does not unlock the keyslot.
    #[error("[LK1400] no key available with this passphrase")]
    WrongPassphrase,

    /// Supplied volume key does not match the volume digest.
    #[error("[LK1401] volume key does not match")]
    WrongVolumeKey,

    /// Signature over a volume key was rejected.
    #[error("[LK1402] volume key signature rejected")]
    SignatureRejected,

    /// No key under the given description in the keyring.
    #[error("[LK1403] key \"{0}\" not found in keyring")]
    KeyringKeyNotFound(String),

    /// Token index beyond the format maximum.
    #[error("[LK1500] token index {0} out of range")]
    TokenIndexOutOfRange(usize),

    /// Token index is not occupied.
    #[error("[LK1501] token {0} not found")]
    TokenNotFound(usize),

    /// Token text is not a JSON object with a string `type`.
    #[error("[LK1502] token {index} malformed: {reason}")]
    TokenMalformed { index: usize, reason: String },

    /// Token type differs from the expected one.
    #[error("[LK1503] token type mismatch: expected {expected}, found {found}")]
    TokenTypeMismatch { expected: String, found: String },

    /// Token object rejected on insertion.
    #[error("[LK1504] invalid token: {0}")]
    InvalidToken(String),

    /// Token `keyslots` field cannot be resolved.
    #[error("[LK1505] {0}")]
    KeyslotRef(#[from] KeyslotRefError),

    /// Every token index is in use.
    #[error("[LK1506] no free token slot")]
    NoFreeToken,

    /// Lifecycle transition not allowed from the current state.
    #[error("[LK1600] invalid state: expected {expected}, volume is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Volume has an unfinished reencryption and cannot be activated.
    #[error("[LK1601] reencryption in progress")]
    ReencryptionPending,

    /// No reencryption job is recorded.
    #[error("[LK1602] no reencryption in progress")]
    NoReencryption,

    /// Operation cancelled between chunks.
    #[error("[LK1603] operation cancelled")]
    Cancelled,

    /// Invalid caller input.
    #[error("[LK1700] invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Fold this error into the stable taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::LockTimeout(_) => ErrorKind::IoFailure,
            Error::Unsupported(_)
            | Error::UnsupportedParameter(_)
            | Error::UnsupportedVersion(_)
            | Error::ReencryptionPending => ErrorKind::NotSupported,
            Error::Corrupt(_)
            | Error::ChecksumMismatch
            | Error::DanglingReference(_)
            | Error::Json(_)
            | Error::SlotCorrupt { .. }
            | Error::TokenMalformed { .. } => ErrorKind::Corrupt,
            Error::SlotEmpty(_)
            | Error::TokenNotFound(_)
            | Error::NoReencryption
            | Error::KeyringKeyNotFound(_) => ErrorKind::NotFound,
            Error::TokenTypeMismatch { .. } | Error::InvalidToken(_) => ErrorKind::TypeMismatch,
            Error::KeyslotRef(inner) => match inner {
                KeyslotRefError::MissingField => ErrorKind::NotFound,
                KeyslotRefError::NotSingleton | KeyslotRefError::NotAnInteger(_) => {
                    ErrorKind::TypeMismatch
                }
                KeyslotRefError::NegativeIndex(_) => ErrorKind::InvalidArgument,
            },
            Error::WrongPassphrase | Error::WrongVolumeKey | Error::SignatureRejected => {
                ErrorKind::WrongCredential
            }
            Error::NoFreeSlot
            | Error::KeyslotAreaFull { .. }
            | Error::NoFreeToken
            | Error::JsonAreaOverflow { .. }
            | Error::DeviceTooSmall { .. } => ErrorKind::NoCapacity,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::SlotIndexOutOfRange(_)
            | Error::TokenIndexOutOfRange(_)
            | Error::KdfFailure(_)
            | Error::InvalidState { .. }
            | Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Stable error code, as printed in the message prefix.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "LK1000",
            Error::LockTimeout(_) => "LK1001",
            Error::DeviceTooSmall { .. } => "LK1002",
            Error::Unsupported(_) => "LK1100",
            Error::UnsupportedParameter(_) => "LK1101",
            Error::UnsupportedVersion(_) => "LK1102",
            Error::Corrupt(_) => "LK1200",
            Error::ChecksumMismatch => "LK1201",
            Error::JsonAreaOverflow { .. } => "LK1202",
            Error::DanglingReference(_) => "LK1203",
            Error::Json(_) => "LK1204",
            Error::NoFreeSlot => "LK1300",
            Error::KeyslotAreaFull { .. } => "LK1301",
            Error::SlotIndexOutOfRange(_) => "LK1302",
            Error::SlotEmpty(_) => "LK1303",
            Error::SlotCorrupt { .. } => "LK1304",
            Error::KdfFailure(_) => "LK1305",
            Error::WrongPassphrase => "LK1400",
            Error::WrongVolumeKey => "LK1401",
            Error::SignatureRejected => "LK1402",
            Error::KeyringKeyNotFound(_) => "LK1403",
            Error::TokenIndexOutOfRange(_) => "LK1500",
            Error::TokenNotFound(_) => "LK1501",
            Error::TokenMalformed { .. } => "LK1502",
            Error::TokenTypeMismatch { .. } => "LK1503",
            Error::InvalidToken(_) => "LK1504",
            Error::KeyslotRef(_) => "LK1505",
            Error::NoFreeToken => "LK1506",
            Error::InvalidState { .. } => "LK1600",
            Error::ReencryptionPending => "LK1601",
            Error::NoReencryption => "LK1602",
            Error::Cancelled => "LK1603",
            Error::InvalidArgument(_) => "LK1700",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_not_collapsed() {
        assert_eq!(Error::TokenNotFound(1).kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::TokenTypeMismatch {
                expected: "a".into(),
                found: "b".into()
            }
            .kind(),
            ErrorKind::TypeMismatch
        );
        assert_eq!(
            Error::TokenMalformed {
                index: 0,
                reason: "x".into()
            }
            .kind(),
            ErrorKind::Corrupt
        );
        assert_eq!(Error::NoFreeSlot.kind(), ErrorKind::NoCapacity);
        assert_eq!(Error::WrongPassphrase.kind(), ErrorKind::WrongCredential);
    }

    #[test]
    fn test_code_matches_message_prefix() {
        let err = Error::SlotEmpty(3);
        assert!(err.to_string().starts_with(&format!("[{}]", err.code())));
    }

    #[test]
    fn test_keyslot_ref_kinds() {
        assert_eq!(
            Error::from(KeyslotRefError::MissingField).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::from(KeyslotRefError::NotSingleton).kind(),
            ErrorKind::TypeMismatch
        );
        assert_eq!(
            Error::from(KeyslotRefError::NegativeIndex(-1)).kind(),
            ErrorKind::InvalidArgument
        );
    }
}
