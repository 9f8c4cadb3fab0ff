//! Property-based tests for format invariants
//!
//! Uses proptest to check the header fallback, the keyslot reference rules
//! and the sector cipher against arbitrary inputs.

use luks2_core::crypto::{af_merge, af_split, HashAlg, SectorCipher};
use luks2_core::error::KeyslotRefError;
use luks2_core::header::{Header, HeaderCodec};
use luks2_core::logging::NullSink;
use luks2_core::token::extract_keyslot_reference;
use luks2_core::FormatOptions;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn header() -> Header {
    let opts = FormatOptions {
        label: Some("prop".into()),
        ..Default::default()
    };
    Header::new(&opts).expect("Header creation should succeed")
}

// Strategy for sector-aligned data (1 to 16 sectors of 512 bytes)
fn sectors_strategy() -> impl Strategy<Value = Vec<u8>> {
    (1usize..=16).prop_flat_map(|n| prop::collection::vec(any::<u8>(), n * 512))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: any single damaged byte in the primary copy is survived
    #[test]
    fn primary_damage_falls_back_to_secondary(
        position in 0usize..16384,
        flip in 1u8..=255,
    ) {
        let codec = HeaderCodec::new(Arc::new(NullSink));
        let original = header();
        let mut bytes = codec.encode(&original).expect("Encoding should succeed");

        bytes[position] ^= flip;

        let loaded = codec.load_detailed(&bytes).expect("Secondary copy should load");
        prop_assert!(loaded.repair_needed);
        prop_assert_eq!(loaded.header, original);
    }

    /// Property: a singleton list of a decimal index resolves to that index
    #[test]
    fn singleton_reference_resolves(slot in 0u32..1_000_000) {
        let token = json!({"type": "t", "keyslots": [slot.to_string()]});
        prop_assert_eq!(extract_keyslot_reference(&token), Ok(slot as usize));
    }

    /// Property: lists of any other length are rejected
    #[test]
    fn non_singleton_reference_rejected(
        slots in prop::collection::vec(0u32..32, 0..8)
            .prop_filter("exactly one element is valid", |v| v.len() != 1)
    ) {
        let list: Vec<String> = slots.iter().map(|s| s.to_string()).collect();
        let token = json!({"type": "t", "keyslots": list});
        prop_assert_eq!(
            extract_keyslot_reference(&token),
            Err(KeyslotRefError::NotSingleton)
        );
    }

    /// Property: negative references never resolve
    #[test]
    fn negative_reference_rejected(slot in i64::MIN..0) {
        let token = json!({"type": "t", "keyslots": [slot.to_string()]});
        prop_assert_eq!(
            extract_keyslot_reference(&token),
            Err(KeyslotRefError::NegativeIndex(slot))
        );
    }

    /// Property: AF merge inverts AF split for any key and stripe count
    #[test]
    fn af_merge_inverts_split(
        key in prop::collection::vec(any::<u8>(), 16..=64),
        stripes in 1u32..64,
    ) {
        let material = af_split(&key, stripes, HashAlg::Sha256).expect("Split should succeed");
        prop_assert_eq!(material.len(), key.len() * stripes as usize);
        let merged = af_merge(&material, key.len(), stripes, HashAlg::Sha256)
            .expect("Merge should succeed");
        prop_assert_eq!(&merged[..], &key[..]);
    }

    /// Property: encrypting sector by sector matches one call over the run
    #[test]
    fn sector_cipher_is_position_addressed(
        data in sectors_strategy(),
        first_sector in 0u64..1_000_000,
        key in prop::collection::vec(any::<u8>(), 64),
    ) {
        let cipher = SectorCipher::new("aes-xts-plain64", &key, 512).expect("Cipher should build");

        let mut whole = data.clone();
        cipher.encrypt(first_sector, &mut whole).expect("Encryption should succeed");

        let mut piecewise = data.clone();
        for (i, sector) in piecewise.chunks_mut(512).enumerate() {
            cipher
                .encrypt(first_sector + i as u64, sector)
                .expect("Encryption should succeed");
        }
        prop_assert_eq!(&whole, &piecewise);
        prop_assert_ne!(&whole, &data);

        cipher.decrypt(first_sector, &mut whole).expect("Decryption should succeed");
        prop_assert_eq!(&whole, &data);
    }
}
