//! Token store.
//!
//! Tokens are JSON objects of the form
//! `{"type": "...", "keyslots": ["3"], ...}` that tie an external unlocking
//! mechanism to a keyslot. They are owned by the header and only refer to
//! keyslots by index.

use crate::config::TOKENS_MAX;
use crate::error::{Error, KeyslotRefError, Result};
use crate::header::Metadata;
use crate::logging::LogSink;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Token types with this prefix are handled by the library itself.
pub const INTERNAL_TYPE_PREFIX: &str = "luks2-";

/// Occupancy of a token index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Inactive,
    /// Handled internally; carries the type.
    Internal(String),
    /// Handled by an external module; carries the type.
    External(String),
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenStatus::Inactive => f.write_str("inactive"),
            TokenStatus::Internal(t) => write!(f, "internal ({})", t),
            TokenStatus::External(t) => write!(f, "external ({})", t),
        }
    }
}

/// Resolve the single keyslot a token refers to.
///
/// Tokens written by this crate always reference exactly one keyslot; an
/// empty or longer list is a format violation, not a missing field.
pub fn extract_keyslot_reference(token: &Value) -> std::result::Result<usize, KeyslotRefError> {
    let field = token
        .get("keyslots")
        .ok_or(KeyslotRefError::MissingField)?;
    let element = match field.as_array().map(Vec::as_slice) {
        Some([only]) => only,
        _ => return Err(KeyslotRefError::NotSingleton),
    };
    let text = element
        .as_str()
        .ok_or_else(|| KeyslotRefError::NotAnInteger(element.to_string()))?;
    let value: i64 = text
        .trim_start()
        .parse()
        .map_err(|_| KeyslotRefError::NotAnInteger(text.to_string()))?;
    if value < 0 {
        return Err(KeyslotRefError::NegativeIndex(value));
    }
    usize::try_from(value).map_err(|_| KeyslotRefError::NotAnInteger(text.to_string()))
}

/// Check that `token` is well formed and that its keyslots exist.
///
/// Shape problems are `InvalidToken`; references to absent keyslots are
/// `DanglingReference`.
pub fn check_token(token: &Value, metadata: &Metadata) -> Result<()> {
    let object = token
        .as_object()
        .ok_or_else(|| Error::InvalidToken("not a JSON object".into()))?;
    match object.get("type").and_then(Value::as_str) {
        Some(t) if !t.is_empty() => {}
        _ => return Err(Error::InvalidToken("missing string \"type\"".into())),
    }
    let keyslots = object
        .get("keyslots")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::InvalidToken("missing \"keyslots\" array".into()))?;

    for entry in keyslots {
        let slot = entry
            .as_str()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| Error::InvalidToken(format!("bad keyslot reference {}", entry)))?;
        if !metadata.keyslots.contains_key(&slot) {
            return Err(Error::DanglingReference(format!("keyslot {} does not exist", slot)));
        }
    }
    Ok(())
}

/// Operations on the `tokens` section of decoded metadata.
pub struct TokenStore {
    log: Arc<dyn LogSink>,
}

impl TokenStore {
    /// Token store logging added tokens to `log`.
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self { log }
    }

    /// Number of token indices the format allows.
    pub fn max(&self) -> usize {
        TOKENS_MAX
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= TOKENS_MAX {
            return Err(Error::TokenIndexOutOfRange(index));
        }
        Ok(())
    }

    /// Fetch token `index`, optionally insisting on its type.
    pub fn get(
        &self,
        metadata: &Metadata,
        index: usize,
        expected_type: Option<&str>,
    ) -> Result<Value> {
        self.check_index(index)?;
        let token = metadata
            .tokens
            .get(&index)
            .ok_or(Error::TokenNotFound(index))?;

        if !token.is_object() {
            return Err(Error::TokenMalformed {
                index,
                reason: "not a JSON object".into(),
            });
        }

        if let Some(expected) = expected_type {
            let found = token
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::TokenMalformed {
                    index,
                    reason: "no string \"type\" field".into(),
                })?;
            if found != expected {
                return Err(Error::TokenTypeMismatch {
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
        }

        Ok(token.clone())
    }

    /// Parse `text` and store it at the first free index.
    pub fn add(&self, metadata: &mut Metadata, text: &str) -> Result<usize> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::InvalidToken(format!("not valid JSON: {}", e)))?;
        self.add_value(metadata, value)
    }

    /// Store an already parsed token at the first free index.
    pub fn add_value(&self, metadata: &mut Metadata, token: Value) -> Result<usize> {
        check_token(&token, metadata)?;
        let index = metadata.free_token().ok_or(Error::NoFreeToken)?;
        self.log
            .debug(&format!("adding token {}: {}", index, token));
        metadata.tokens.insert(index, token);
        Ok(index)
    }

    /// Store a token at a specific free index.
    pub fn add_at(&self, metadata: &mut Metadata, index: usize, token: Value) -> Result<usize> {
        self.check_index(index)?;
        if metadata.tokens.contains_key(&index) {
            return Err(Error::InvalidArgument(format!("token {} is in use", index)));
        }
        check_token(&token, metadata)?;
        self.log
            .debug(&format!("adding token {}: {}", index, token));
        metadata.tokens.insert(index, token);
        Ok(index)
    }

    /// Drop token `index`; `TokenNotFound` if it is not in use.
    pub fn remove(&self, metadata: &mut Metadata, index: usize) -> Result<()> {
        self.check_index(index)?;
        metadata
            .tokens
            .remove(&index)
            .ok_or(Error::TokenNotFound(index))?;
        self.log.debug(&format!("removed token {}", index));
        Ok(())
    }

    /// Whether `index` is in use and, if so, who handles its type.
    pub fn status(&self, metadata: &Metadata, index: usize) -> Result<TokenStatus> {
        self.check_index(index)?;
        let Some(token) = metadata.tokens.get(&index) else {
            return Ok(TokenStatus::Inactive);
        };
        let kind = token
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::TokenMalformed {
                index,
                reason: "no string \"type\" field".into(),
            })?
            .to_string();
        if kind.starts_with(INTERNAL_TYPE_PREFIX) {
            Ok(TokenStatus::Internal(kind))
        } else {
            Ok(TokenStatus::External(kind))
        }
    }

    /// Occupied tokens in index order.
    pub fn iter<'a>(&self, metadata: &'a Metadata) -> impl Iterator<Item = (usize, &'a Value)> {
        metadata.tokens.iter().map(|(i, t)| (*i, t))
    }

    /// Keyslot referenced by token `index`.
    pub fn keyslot_of(&self, metadata: &Metadata, index: usize) -> Result<usize> {
        let token = self.get(metadata, index, None)?;
        Ok(extract_keyslot_reference(&token)?)
    }

    /// Drop `slot` from every token's keyslot list.
    pub fn unassign_keyslot(&self, metadata: &mut Metadata, slot: usize) {
        let wanted = slot.to_string();
        for (index, token) in metadata.tokens.iter_mut() {
            if let Some(list) = token.get_mut("keyslots").and_then(Value::as_array_mut) {
                let before = list.len();
                list.retain(|v| v.as_str() != Some(wanted.as_str()));
                if list.len() != before {
                    self.log.debug(&format!(
                        "unassigned keyslot {} from token {}",
                        slot, index
                    ));
                }
            }
        }
    }
}
