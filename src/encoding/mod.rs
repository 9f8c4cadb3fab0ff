//! Field encodings used by the LUKS2 JSON metadata.
//!
//! The format stores binary values (salts, digests) as base64 strings and
//! 64-bit offsets and sizes as decimal strings, so that JSON parsers limited
//! to doubles do not lose precision. These modules plug into serde's
//! `#[serde(with = "...")]`.

pub mod b64;
pub mod number;
