//! JSON metadata area.
//!
//! Mirrors the LUKS2 layout: `keyslots`, `tokens`, `segments`, `digests` and
//! `config` objects keyed by decimal strings. Tokens are kept as raw JSON
//! because their payload is owned by whatever mechanism wrote them.

use crate::config::{reencrypt_params, KEYSLOTS_MAX, TOKENS_MAX};
use crate::crypto::{HashAlg, Kdf};
use crate::encoding::{b64, number};
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON members of an entry that this crate does not model; kept so a
/// commit writes them back unchanged.
pub type Extra = serde_json::Map<String, Value>;

/// Decoded JSON metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub keyslots: BTreeMap<usize, Keyslot>,
    pub tokens: BTreeMap<usize, Value>,
    pub segments: BTreeMap<usize, Segment>,
    pub digests: BTreeMap<usize, DigestEntry>,
    pub config: MetadataConfig,
}

/// A keyslot entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Keyslot {
    #[serde(rename = "luks2")]
    Luks2(Luks2Keyslot),
    #[serde(rename = "reencrypt")]
    Reencrypt(ReencryptKeyslot),
}

/// Passphrase keyslot holding split, encrypted key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Luks2Keyslot {
    pub key_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    pub af: AntiForensic,
    pub area: KeyslotArea,
    pub kdf: Kdf,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Anti-forensic splitter parameters of a keyslot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiForensic {
    #[serde(rename = "type")]
    pub kind: String,
    pub stripes: u32,
    pub hash: HashAlg,
}

/// Location and encryption of keyslot material inside the keyslots area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyslotArea {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "number")]
    pub offset: u64,
    #[serde(with = "number")]
    pub size: u64,
    pub encryption: String,
    pub key_size: usize,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Direction a reencryption walks the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
}

/// Persisted progress of a reencryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReencryptKeyslot {
    pub mode: String,
    pub direction: Direction,
    /// Bytes of the data segment already rewritten with the new key.
    #[serde(with = "number")]
    pub offset: u64,
    #[serde(with = "number")]
    pub chunk_size: u64,
    pub old_digest: usize,
    pub new_digest: usize,
    pub old_segment: usize,
    pub new_segment: usize,
    pub area: ChecksumArea,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotzone: Option<Hotzone>,
}

/// Region of the keyslots area holding the hotzone checksum table.
///
/// For each sector of the hotzone the table has the checksum of its old
/// ciphertext followed by the checksum of its new ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumArea {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "number")]
    pub offset: u64,
    #[serde(with = "number")]
    pub size: u64,
    pub hash: HashAlg,
    pub sector_size: u32,
}

impl ChecksumArea {
    /// Bytes of table describing `sectors` sectors.
    pub fn table_len(&self, sectors: usize) -> usize {
        sectors * 2 * self.hash.output_len()
    }
}

/// Chunk being rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotzone {
    #[serde(with = "number")]
    pub offset: u64,
    #[serde(with = "number")]
    pub length: u64,
    /// Digest of the checksum table, so a damaged table is detected.
    #[serde(with = "b64")]
    pub table_digest: Vec<u8>,
}

/// Size of a segment: fixed, or up to the end of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentSize {
    Dynamic,
    Fixed(u64),
}

impl Serialize for SegmentSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            SegmentSize::Dynamic => serializer.serialize_str("dynamic"),
            SegmentSize::Fixed(n) => serializer.serialize_str(&n.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for SegmentSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text == "dynamic" {
            Ok(SegmentSize::Dynamic)
        } else {
            text.parse::<u64>()
                .map(SegmentSize::Fixed)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// Encrypted data segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "number")]
    pub offset: u64,
    pub size: SegmentSize,
    #[serde(with = "number")]
    pub iv_tweak: u64,
    pub encryption: String,
    pub sector_size: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Segment {
    /// Length in bytes on a device of `device_size` bytes.
    pub fn length(&self, device_size: u64) -> u64 {
        match self.size {
            SegmentSize::Fixed(n) => n,
            SegmentSize::Dynamic => device_size.saturating_sub(self.offset),
        }
    }
}

/// PBKDF2 digest binding keyslots and segments to one volume key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "number::index_list")]
    pub keyslots: Vec<usize>,
    #[serde(with = "number::index_list")]
    pub segments: Vec<usize>,
    pub hash: HashAlg,
    pub iterations: u32,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub digest: Vec<u8>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Global metadata settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(with = "number")]
    pub json_size: u64,
    #[serde(with = "number")]
    pub keyslots_size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Requirements::is_empty")]
    pub requirements: Requirements,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Features a reader must understand before touching the volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub mandatory: Vec<String>,
}

impl Requirements {
    /// True when nothing is required.
    pub fn is_empty(&self) -> bool {
        self.mandatory.is_empty()
    }
}

impl Metadata {
    /// Empty metadata with a single data segment.
    pub fn new(json_size: u64, keyslots_size: u64, segment: Segment) -> Self {
        let mut segments = BTreeMap::new();
        segments.insert(0, segment);
        Self {
            keyslots: BTreeMap::new(),
            tokens: BTreeMap::new(),
            segments,
            digests: BTreeMap::new(),
            config: MetadataConfig {
                json_size,
                keyslots_size,
                flags: Vec::new(),
                requirements: Requirements::default(),
                extra: Extra::new(),
            },
        }
    }

    /// First unused keyslot index.
    pub fn free_keyslot(&self) -> Option<usize> {
        (0..KEYSLOTS_MAX).find(|i| !self.keyslots.contains_key(i))
    }

    /// First unused token index.
    pub fn free_token(&self) -> Option<usize> {
        (0..TOKENS_MAX).find(|i| !self.tokens.contains_key(i))
    }

    /// First unused digest index.
    pub fn free_digest(&self) -> usize {
        (0..).find(|i| !self.digests.contains_key(i)).unwrap_or(0)
    }

    /// First unused segment index.
    pub fn free_segment(&self) -> usize {
        (0..).find(|i| !self.segments.contains_key(i)).unwrap_or(0)
    }

    /// Digest a keyslot is bound to.
    pub fn digest_for_keyslot(&self, slot: usize) -> Option<(usize, &DigestEntry)> {
        self.digests
            .iter()
            .find(|(_, d)| d.keyslots.contains(&slot))
            .map(|(i, d)| (*i, d))
    }

    /// Digest a segment is bound to.
    pub fn digest_for_segment(&self, segment: usize) -> Option<(usize, &DigestEntry)> {
        self.digests
            .iter()
            .find(|(_, d)| d.segments.contains(&segment))
            .map(|(i, d)| (*i, d))
    }

    /// The reencryption job, if one is recorded.
    pub fn reencrypt_job(&self) -> Option<(usize, &ReencryptKeyslot)> {
        self.keyslots.iter().find_map(|(i, k)| match k {
            Keyslot::Reencrypt(job) => Some((*i, job)),
            Keyslot::Luks2(_) => None,
        })
    }

    /// True while a reencryption job or its requirement is recorded.
    pub fn reencryption_pending(&self) -> bool {
        self.reencrypt_job().is_some()
            || self
                .config
                .requirements
                .mandatory
                .iter()
                .any(|r| r == reencrypt_params::REQUIREMENT)
    }

    /// Byte ranges of the keyslots area in use, with the owning keyslot.
    pub fn used_areas(&self) -> Vec<(u64, u64, usize)> {
        let mut areas: Vec<(u64, u64, usize)> = self
            .keyslots
            .iter()
            .map(|(&index, keyslot)| {
                let (offset, size) = match keyslot {
                    Keyslot::Luks2(slot) => (slot.area.offset, slot.area.size),
                    Keyslot::Reencrypt(job) => (job.area.offset, job.area.size),
                };
                (offset, offset.saturating_add(size), index)
            })
            .collect();
        areas.sort();
        areas
    }

    /// Passphrase keyslots, by index.
    pub fn luks2_keyslots(&self) -> impl Iterator<Item = (usize, &Luks2Keyslot)> {
        self.keyslots.iter().filter_map(|(i, k)| match k {
            Keyslot::Luks2(slot) => Some((*i, slot)),
            Keyslot::Reencrypt(_) => None,
        })
    }

    /// Check internal consistency.
    ///
    /// `area_start` is where the keyslots area begins (twice the header copy
    /// size).
    pub fn validate(&self, area_start: u64) -> Result<()> {
        if self.segments.is_empty() {
            return Err(Error::Corrupt("no data segment".into()));
        }

        let area_end = area_start + self.config.keyslots_size;
        if let Some(&index) = self.keyslots.keys().find(|&&i| i >= KEYSLOTS_MAX) {
            return Err(Error::Corrupt(format!("keyslot index {} out of range", index)));
        }
        let areas = self.used_areas();
        for &(start, end, index) in &areas {
            if start < area_start || end > area_end {
                return Err(Error::SlotCorrupt {
                    slot: index,
                    reason: format!("area {}..{} outside keyslots area", start, end),
                });
            }
        }
        for pair in areas.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(Error::Corrupt(format!(
                    "keyslot {} and {} areas overlap",
                    pair[0].2, pair[1].2
                )));
            }
        }

        for (index, digest) in &self.digests {
            for slot in &digest.keyslots {
                if !self.keyslots.contains_key(slot) {
                    return Err(Error::DanglingReference(format!(
                        "digest {} references missing keyslot {}",
                        index, slot
                    )));
                }
            }
            for segment in &digest.segments {
                if !self.segments.contains_key(segment) {
                    return Err(Error::DanglingReference(format!(
                        "digest {} references missing segment {}",
                        index, segment
                    )));
                }
            }
        }

        for (&index, token) in &self.tokens {
            if index >= TOKENS_MAX {
                return Err(Error::Corrupt(format!("token index {} out of range", index)));
            }
            crate::token::check_token(token, self).map_err(|e| match e {
                Error::InvalidToken(reason) => {
                    Error::Corrupt(format!("token {}: {}", index, reason))
                }
                Error::DanglingReference(reason) => {
                    Error::DanglingReference(format!("token {}: {}", index, reason))
                }
                other => other,
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segment() -> Segment {
        Segment {
            kind: "crypt".into(),
            offset: 16_777_216,
            size: SegmentSize::Dynamic,
            iv_tweak: 0,
            encryption: "aes-xts-plain64".into(),
            sector_size: 512,
            flags: Vec::new(),
            extra: Extra::new(),
        }
    }

    #[test]
    fn test_parses_luks2_layout() {
        let text = json!({
            "keyslots": {
                "0": {
                    "type": "luks2",
                    "key_size": 64,
                    "af": {"type": "luks1", "stripes": 4000, "hash": "sha256"},
                    "area": {"type": "raw", "offset": "32768", "size": "258048",
                             "encryption": "aes-xts-plain64", "key_size": 64},
                    "kdf": {"type": "pbkdf2", "hash": "sha512", "iterations": 1000,
                            "salt": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="}
                }
            },
            "tokens": {"0": {"type": "systemd-tpm2", "keyslots": ["0"]}},
            "segments": {
                "0": {"type": "crypt", "offset": "16777216", "size": "dynamic",
                      "iv_tweak": "0", "encryption": "aes-xts-plain64", "sector_size": 512}
            },
            "digests": {
                "0": {"type": "pbkdf2", "keyslots": ["0"], "segments": ["0"], "hash": "sha256",
                      "iterations": 1000, "salt": "AAAA", "digest": "AAAA"}
            },
            "config": {"json_size": "12288", "keyslots_size": "16744448"}
        });

        let meta: Metadata = serde_json::from_value(text).unwrap();
        assert_eq!(meta.keyslots.len(), 1);
        assert_eq!(meta.segments[&0].size, SegmentSize::Dynamic);
        assert_eq!(meta.digest_for_keyslot(0).map(|(i, _)| i), Some(0));
        assert!(meta.validate(32768).is_ok());
    }

    #[test]
    fn test_unknown_members_survive_reserialization() {
        let text = json!({
            "keyslots": {
                "0": {
                    "type": "luks2",
                    "key_size": 64,
                    "af": {"type": "luks1", "stripes": 4000, "hash": "sha256"},
                    "area": {"type": "raw", "offset": "32768", "size": "258048",
                             "encryption": "aes-xts-plain64", "key_size": 64,
                             "vendor_hint": 7},
                    "kdf": {"type": "pbkdf2", "hash": "sha512", "iterations": 1000,
                            "salt": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="},
                    "x-origin": "other-tool"
                }
            },
            "tokens": {},
            "segments": {
                "0": {"type": "crypt", "offset": "16777216", "size": "dynamic",
                      "iv_tweak": "0", "encryption": "aes-xts-plain64", "sector_size": 512,
                      "integrity": {"type": "hmac(sha256)", "journal_encryption": "none",
                                    "journal_integrity": "none"}}
            },
            "digests": {
                "0": {"type": "pbkdf2", "keyslots": ["0"], "segments": ["0"], "hash": "sha256",
                      "iterations": 1000, "salt": "AAAA", "digest": "AAAA", "note": "x"}
            },
            "config": {"json_size": "12288", "keyslots_size": "16744448",
                       "mtime": "1700000000"}
        });

        let meta: Metadata = serde_json::from_value(text.clone()).unwrap();
        assert_eq!(
            meta.segments[&0].extra["integrity"]["type"],
            json!("hmac(sha256)")
        );
        assert_eq!(meta.config.extra["mtime"], json!("1700000000"));
        match &meta.keyslots[&0] {
            Keyslot::Luks2(k) => {
                assert_eq!(k.extra["x-origin"], json!("other-tool"));
                assert_eq!(k.area.extra["vendor_hint"], json!(7));
                assert!(!k.extra.contains_key("type"));
            }
            other => panic!("unexpected keyslot {:?}", other),
        }

        let written = serde_json::to_value(&meta).unwrap();
        assert_eq!(written, text);
    }

    #[test]
    fn test_free_indices() {
        let meta = Metadata::new(12288, 16_744_448, segment());
        assert_eq!(meta.free_keyslot(), Some(0));
        assert_eq!(meta.free_token(), Some(0));
        assert_eq!(meta.free_digest(), 0);
        assert_eq!(meta.free_segment(), 1);
    }

    #[test]
    fn test_dangling_token_reference_is_validation_error() {
        let mut meta = Metadata::new(12288, 16_744_448, segment());
        meta.tokens
            .insert(0, json!({"type": "systemd-fido2", "keyslots": ["5"]}));

        let err = meta.validate(32768).unwrap_err();
        assert!(matches!(err, Error::DanglingReference(_)));
    }

    #[test]
    fn test_segment_length() {
        let mut seg = segment();
        assert_eq!(seg.length(20_000_000), 20_000_000 - 16_777_216);
        seg.size = SegmentSize::Fixed(4096);
        assert_eq!(seg.length(20_000_000), 4096);
    }
}
