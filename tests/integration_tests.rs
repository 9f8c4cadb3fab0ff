//! Integration tests for volume end-to-end functionality.

use luks2_core::crypto::{minimal_kdf_parameters, VolumeKey};
use luks2_core::header::{HeaderCodec, HeaderCopy};
use luks2_core::logging::NullSink;
use luks2_core::storage::{BlockDevice, FileDevice};
use luks2_core::token::TokenStatus;
use luks2_core::volume::SignatureVerifier;
use luks2_core::{
    Capabilities, Error, ErrorKind, FormatOptions, Volume, VolumeContext, VolumeState,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const DATA_SIZE: u64 = 256 * 1024;

fn opts() -> FormatOptions {
    FormatOptions {
        keyslots_size: 2 * 1024 * 1024,
        digest_iterations: 1000,
        label: Some("integration".into()),
        ..Default::default()
    }
}

fn ctx() -> VolumeContext {
    VolumeContext::default()
        .with_log(Arc::new(NullSink))
        .with_capabilities(Capabilities::all())
}

/// Format an image file in a fresh temp dir with one keyslot for "secret".
fn setup_volume() -> (TempDir, PathBuf, VolumeKey) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("disk.img");
    let opts = opts();
    let device =
        FileDevice::create(&path, opts.data_offset() + DATA_SIZE).expect("Failed to create image");
    let (mut volume, key) = Volume::format_with(ctx(), device, &opts).expect("Failed to format");
    volume
        .add_keyslot(&key, b"secret", minimal_kdf_parameters())
        .expect("Failed to add keyslot");
    (temp_dir, path, key)
}

fn open(path: &Path) -> Volume<FileDevice> {
    let device = FileDevice::open(path).expect("Failed to open image");
    Volume::load_with(ctx(), device).expect("Failed to load volume")
}

#[test]
fn test_format_reopen_and_unlock() {
    let (_dir, path, key) = setup_volume();

    let mut volume = open(&path);
    assert_eq!(volume.label(), "integration");
    assert_eq!(volume.cipher().unwrap(), "aes-xts-plain64");
    assert_eq!(volume.data_offset(), opts().data_offset());

    let (slot, opened) = volume.open_any_keyslot(b"secret").unwrap();
    assert_eq!(slot, 0);
    assert_eq!(opened, key);
}

#[test]
fn test_data_survives_reopen() {
    let (_dir, path, key) = setup_volume();
    let data: Vec<u8> = (0..8192).map(|i| (i % 256) as u8).collect();

    let mut active = open(&path).into_active();
    active.activate_by_passphrase(b"secret", None).unwrap();
    assert_eq!(active.size_sectors().unwrap(), DATA_SIZE / 512);
    active.write_sectors(10, &data).unwrap();
    active.sync().unwrap();
    active.deactivate().unwrap();
    drop(active);

    // Ciphertext on disk, not plaintext.
    let raw = std::fs::read(&path).unwrap();
    let at = (opts().data_offset() + 10 * 512) as usize;
    assert_ne!(&raw[at..at + data.len()], &data[..]);

    let mut active = open(&path).into_active();
    active.activate_by_volume_key(&key).unwrap();
    let mut back = vec![0u8; data.len()];
    active.read_sectors(10, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn test_wrong_passphrase_and_empty_slot() {
    let (_dir, path, _key) = setup_volume();
    let mut volume = open(&path);

    let err = volume.open_any_keyslot(b"nope").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WrongCredential);

    let err = volume.open_keyslot(5, b"secret").unwrap_err();
    assert!(matches!(err, Error::SlotEmpty(5)));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = volume.open_keyslot(40, b"secret").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_keyslots_fill_then_free() {
    let (_dir, path, key) = setup_volume();
    let mut volume = open(&path);

    // 2 MiB area holds eight 258048-byte keyslot areas; slot 0 is taken.
    for expected in 1..8 {
        let slot = volume
            .add_keyslot(&key, format!("pass{}", expected).as_bytes(), minimal_kdf_parameters())
            .unwrap();
        assert_eq!(slot, expected);
    }
    let err = volume
        .add_keyslot(&key, b"one too many", minimal_kdf_parameters())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoCapacity);

    volume.destroy_keyslot(3).unwrap();
    let slot = volume
        .add_keyslot(&key, b"replacement", minimal_kdf_parameters())
        .unwrap();
    assert_eq!(slot, 3);

    let mut volume = open(&path);
    assert_eq!(volume.open_any_keyslot(b"replacement").unwrap().0, 3);
    assert!(volume.open_any_keyslot(b"pass3").is_err());
}

#[test]
fn test_add_keyslot_with_foreign_key_fails() {
    let (_dir, path, _key) = setup_volume();
    let mut volume = open(&path);
    let foreign = VolumeKey::generate(64);

    let err = volume
        .add_keyslot(&foreign, b"x", minimal_kdf_parameters())
        .unwrap_err();
    assert!(matches!(err, Error::WrongVolumeKey));
    assert_eq!(volume.header().metadata.keyslots.len(), 1);
}

#[test]
fn test_token_lifecycle() {
    let (_dir, path, _key) = setup_volume();
    let mut volume = open(&path);

    let token = json!({"type": "luks2-keyring", "keyslots": ["0"], "key_description": "vk"});
    let index = volume.token_add(&token.to_string()).unwrap();
    assert_eq!(index, 0);

    let volume = open(&path);
    assert_eq!(volume.token_get(0, Some("luks2-keyring")).unwrap(), token);
    assert_eq!(volume.token_keyslot(0).unwrap(), 0);
    assert_eq!(
        volume.token_status(0).unwrap(),
        TokenStatus::Internal("luks2-keyring".into())
    );
    assert_eq!(volume.token_status(1).unwrap(), TokenStatus::Inactive);

    let err = volume.token_get(0, Some("fido2")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    let err = volume.token_get(1, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let mut volume = open(&path);
    volume.token_remove(0).unwrap();
    assert_eq!(open(&path).token_status(0).unwrap(), TokenStatus::Inactive);
}

#[test]
fn test_token_rejected_for_missing_keyslot() {
    let (_dir, path, _key) = setup_volume();
    let mut volume = open(&path);

    let err = volume
        .token_add(r#"{"type": "fido2", "keyslots": ["7"]}"#)
        .unwrap_err();
    assert!(matches!(err, Error::DanglingReference(_)));
    assert!(volume.tokens().is_empty());
}

#[test]
fn test_destroy_keyslot_unassigns_tokens() {
    let (_dir, path, key) = setup_volume();
    let mut volume = open(&path);
    let slot = volume
        .add_keyslot(&key, b"second", minimal_kdf_parameters())
        .unwrap();
    volume
        .token_add(&json!({"type": "fido2", "keyslots": [slot.to_string()]}).to_string())
        .unwrap();

    volume.destroy_keyslot(slot).unwrap();

    let volume = open(&path);
    let err = volume.token_keyslot(0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert_eq!(volume.token_get(0, None).unwrap()["keyslots"], json!([]));
}

#[test]
fn test_header_backup_and_restore() {
    let (dir, path, key) = setup_volume();
    let backup = dir.path().join("header.bak");

    let mut volume = open(&path);
    volume.header_backup(&backup).unwrap();
    assert_eq!(
        std::fs::metadata(&backup).unwrap().len(),
        volume.data_offset()
    );

    volume
        .add_keyslot(&key, b"added later", minimal_kdf_parameters())
        .unwrap();
    volume.header_restore(&backup).unwrap();
    assert!(volume.open_any_keyslot(b"added later").is_err());

    let mut volume = open(&path);
    assert_eq!(volume.open_any_keyslot(b"secret").unwrap().1, key);
}

#[test]
fn test_both_copies_written_on_commit() {
    let (_dir, path, _key) = setup_volume();
    let mut volume = open(&path);
    volume.set_label("renamed", "sys").unwrap();
    let seqid = volume.header().seqid;

    let mut device = FileDevice::open(&path).unwrap();
    let size = 2 * volume.header().metadata_size as usize;
    let mut raw = vec![0u8; size];
    device.read_at(0, &mut raw).unwrap();

    let loaded = HeaderCodec::new(Arc::new(NullSink)).load_detailed(&raw).unwrap();
    assert!(!loaded.repair_needed);
    assert_eq!(loaded.header.seqid, seqid);
    assert_eq!(loaded.header.label, "renamed");
    assert_eq!(loaded.header.subsystem, "sys");
}

#[test]
fn test_foreign_members_survive_commit() {
    let (_dir, path, _key) = setup_volume();
    let integrity = json!({"type": "hmac(sha256)", "journal_encryption": "none"});

    // Another writer records a segment member this crate does not model.
    let mut device = FileDevice::open(&path).unwrap();
    let codec = HeaderCodec::new(Arc::new(NullSink));
    let mut header = codec.read_from(&mut device).unwrap().header;
    header
        .metadata
        .segments
        .get_mut(&0)
        .unwrap()
        .extra
        .insert("integrity".into(), integrity.clone());
    codec
        .store(&mut device, &mut header, HeaderCopy::Primary)
        .unwrap();
    drop(device);

    let mut volume = open(&path);
    volume
        .token_add(r#"{"type": "fido2", "keyslots": ["0"]}"#)
        .unwrap();

    let volume = open(&path);
    assert_eq!(volume.tokens().len(), 1);
    assert_eq!(
        volume.header().metadata.segments[&0].extra["integrity"],
        integrity
    );
}

#[test]
fn test_suspend_resume_cycle() {
    let (_dir, path, key) = setup_volume();
    let mut active = open(&path).into_active();
    active.activate_by_passphrase(b"secret", None).unwrap();

    active.suspend().unwrap();
    assert_eq!(active.state(), VolumeState::Suspended);
    let mut buf = vec![0u8; 512];
    assert_eq!(
        active.read_sectors(0, &mut buf).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    assert!(active.resume(b"wrong").is_err());
    assert_eq!(active.state(), VolumeState::Suspended);
    active.resume_by_volume_key(&key).unwrap();
    assert_eq!(active.state(), VolumeState::Unlocked);
    active.read_sectors(0, &mut buf).unwrap();
}

struct XorSigner(u8);

impl SignatureVerifier for XorSigner {
    fn verify(&self, volume_key: &[u8], signature: &[u8]) -> bool {
        signature.len() == volume_key.len()
            && volume_key
                .iter()
                .zip(signature)
                .all(|(k, s)| k ^ self.0 == *s)
    }
}

#[test]
fn test_signed_key_activation() {
    let (_dir, path, key) = setup_volume();
    let good: Vec<u8> = key.as_bytes().iter().map(|b| b ^ 0x5a).collect();

    let mut active = open(&path).into_active();
    let err = active
        .activate_by_signed_key(&key, &[0u8; 64], &XorSigner(0x5a))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WrongCredential);
    assert_eq!(active.state(), VolumeState::Locked);

    active
        .activate_by_signed_key(&key, &good, &XorSigner(0x5a))
        .unwrap();
    assert_eq!(active.state(), VolumeState::Unlocked);
}

#[test]
fn test_minimal_capabilities_refuse_optional_features() {
    let (_dir, path, key) = setup_volume();
    let device = FileDevice::open(&path).unwrap();
    let ctx = ctx().with_capabilities(Capabilities::minimal());
    let mut active = Volume::load_with(ctx, device).unwrap().into_active();

    let err = active
        .activate_by_signed_key(&key, &[], &XorSigner(0))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);

    active.activate_by_volume_key(&key).unwrap();
    active.suspend().unwrap();
    let err = active.resume_by_volume_key(&key).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
}
