//! Keyslot manager.
//!
//! A keyslot stores the volume key AF-split and encrypted with a key derived
//! from a passphrase. Every passphrase keyslot is bound to a digest; a key
//! recovered from a slot is only returned after it matches that digest.

use crate::capability::{Capabilities, Feature};
use crate::config::{af_params, pbkdf2_params, AREA_ALIGNMENT, DEFAULT_CIPHER, KEYSLOTS_MAX};
use crate::crypto::{
    af_merge, af_split, af_split_size, digest_volume_key, random_bytes, verify_volume_key,
    HashAlg, KdfParams, SectorCipher, VolumeKey,
};
use crate::error::{Error, Result};
use crate::header::{
    AntiForensic, DigestEntry, Header, Keyslot, KeyslotArea, Luks2Keyslot,
};
use crate::logging::LogSink;
use crate::storage::{wipe_region, BlockDevice};
use std::fmt;
use std::sync::Arc;

pub use crate::crypto::minimal_kdf_parameters;

/// Sector size used to encrypt keyslot material.
const KEYSLOT_SECTOR_SIZE: usize = 512;

/// Priority at which a slot is skipped by [`KeyslotManager::open_any`].
pub const PRIORITY_IGNORE: u8 = 0;
/// Default priority.
pub const PRIORITY_NORMAL: u8 = 1;
/// Slots tried first.
pub const PRIORITY_PREFER: u8 = 2;

/// Occupancy of a keyslot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyslotStatus {
    Inactive,
    Active,
    /// Holds reencryption progress rather than key material.
    Reencrypt,
}

impl fmt::Display for KeyslotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyslotStatus::Inactive => "inactive",
            KeyslotStatus::Active => "active",
            KeyslotStatus::Reencrypt => "reencrypt",
        })
    }
}

fn round_up(value: u64, to: u64) -> u64 {
    value.div_ceil(to) * to
}

/// Bytes of encrypted material for a key of `key_len` bytes.
fn material_len(key_len: usize, stripes: u32) -> usize {
    let raw = af_split_size(key_len, stripes) as u64;
    round_up(raw, KEYSLOT_SECTOR_SIZE as u64) as usize
}

/// Adds, opens and destroys keyslots of a decoded header.
///
/// Mutations change the header in memory and write key material to the
/// device; the caller commits the header afterwards.
pub struct KeyslotManager {
    caps: Capabilities,
    log: Arc<dyn LogSink>,
}

impl KeyslotManager {
    /// Manager honouring `caps`.
    pub fn new(caps: Capabilities, log: Arc<dyn LogSink>) -> Self {
        Self { caps, log }
    }

    /// Number of keyslot indices the format allows.
    pub fn max(&self) -> usize {
        KEYSLOTS_MAX
    }

    fn check_index(&self, slot: usize) -> Result<()> {
        if slot >= KEYSLOTS_MAX {
            return Err(Error::SlotIndexOutOfRange(slot));
        }
        Ok(())
    }

    /// Occupancy of `slot`; `SlotIndexOutOfRange` past [`Self::max`].
    pub fn status(&self, header: &Header, slot: usize) -> Result<KeyslotStatus> {
        self.check_index(slot)?;
        Ok(match header.metadata.keyslots.get(&slot) {
            None => KeyslotStatus::Inactive,
            Some(Keyslot::Luks2(_)) => KeyslotStatus::Active,
            Some(Keyslot::Reencrypt(_)) => KeyslotStatus::Reencrypt,
        })
    }

    fn check_kdf(&self, kdf: &KdfParams) -> Result<()> {
        if kdf.is_argon2() {
            self.caps.require(Feature::Argon2)?;
        }
        kdf.validate()
    }

    /// Record a new digest of `volume_key` bound to `segments`.
    pub fn create_digest(
        &self,
        header: &mut Header,
        volume_key: &VolumeKey,
        segments: Vec<usize>,
        iterations: u32,
    ) -> Result<usize> {
        if iterations < pbkdf2_params::MIN_ITERATIONS {
            return Err(Error::KdfFailure(format!(
                "digest iterations {} below minimum {}",
                iterations,
                pbkdf2_params::MIN_ITERATIONS
            )));
        }
        let salt = random_bytes(pbkdf2_params::SALT_LENGTH);
        let digest = digest_volume_key(volume_key, HashAlg::Sha256, &salt, iterations);
        let index = header.metadata.free_digest();
        header.metadata.digests.insert(
            index,
            DigestEntry {
                kind: "pbkdf2".into(),
                keyslots: Vec::new(),
                segments,
                hash: HashAlg::Sha256,
                iterations,
                salt,
                digest,
                extra: Default::default(),
            },
        );
        Ok(index)
    }

    /// Index of the digest `volume_key` matches.
    pub fn find_digest(&self, header: &Header, volume_key: &VolumeKey) -> Option<usize> {
        header
            .metadata
            .digests
            .iter()
            .find(|(_, d)| verify_volume_key(volume_key, d.hash, &d.salt, d.iterations, &d.digest))
            .map(|(i, _)| *i)
    }

    /// First gap in the keyslots area that holds `len` bytes, rounded up to
    /// the area alignment. Returns the offset and the rounded size.
    pub(crate) fn allocate_area(&self, header: &Header, len: u64) -> Result<(u64, u64)> {
        let len = round_up(len, AREA_ALIGNMENT);
        let mut candidate = header.keyslots_area_start();
        for (start, end, _) in header.metadata.used_areas() {
            if candidate + len <= start {
                break;
            }
            candidate = candidate.max(round_up(end, AREA_ALIGNMENT));
        }
        if candidate + len > header.keyslots_area_end() {
            return Err(Error::KeyslotAreaFull { needed: len });
        }
        Ok((candidate, len))
    }

    /// Store `volume_key` under `passphrase` in the first free keyslot.
    pub fn add<D: BlockDevice + ?Sized>(
        &self,
        device: &mut D,
        header: &mut Header,
        volume_key: &VolumeKey,
        passphrase: &[u8],
        kdf: KdfParams,
    ) -> Result<usize> {
        let slot = header.metadata.free_keyslot().ok_or(Error::NoFreeSlot)?;
        self.add_at(device, header, slot, volume_key, passphrase, kdf)
    }

    /// Store `volume_key` under `passphrase` in keyslot `slot`.
    pub fn add_at<D: BlockDevice + ?Sized>(
        &self,
        device: &mut D,
        header: &mut Header,
        slot: usize,
        volume_key: &VolumeKey,
        passphrase: &[u8],
        kdf: KdfParams,
    ) -> Result<usize> {
        self.check_index(slot)?;
        if header.metadata.keyslots.contains_key(&slot) {
            return Err(Error::InvalidArgument(format!("keyslot {} is in use", slot)));
        }
        self.check_kdf(&kdf)?;

        let digest = self
            .find_digest(header, volume_key)
            .ok_or(Error::WrongVolumeKey)?;

        let hash = HashAlg::Sha256;
        let stripes = af_params::STRIPES;
        let len = material_len(volume_key.len(), stripes);
        let (offset, area_size) = self.allocate_area(header, len as u64)?;

        let kdf = kdf.with_random_salt();
        let kek = kdf.derive_key(passphrase, volume_key.len())?;

        let split = af_split(volume_key.as_bytes(), stripes, hash)?;
        let mut material = zeroize::Zeroizing::new(vec![0u8; len]);
        material[..split.len()].copy_from_slice(&split);
        SectorCipher::new(DEFAULT_CIPHER, &kek, KEYSLOT_SECTOR_SIZE)?.encrypt(0, &mut material)?;

        device.write_at(offset, &material)?;
        device.sync()?;

        header.metadata.keyslots.insert(
            slot,
            Keyslot::Luks2(Luks2Keyslot {
                key_size: volume_key.len(),
                priority: None,
                af: AntiForensic {
                    kind: "luks1".into(),
                    stripes,
                    hash,
                },
                area: KeyslotArea {
                    kind: "raw".into(),
                    offset,
                    size: area_size,
                    encryption: DEFAULT_CIPHER.into(),
                    key_size: volume_key.len(),
                    extra: Default::default(),
                },
                kdf,
                extra: Default::default(),
            }),
        );
        if let Some(entry) = header.metadata.digests.get_mut(&digest) {
            entry.keyslots.push(slot);
            entry.keyslots.sort_unstable();
        }

        self.log.debug(&format!(
            "keyslot {} added at offset {} ({} bytes), digest {}",
            slot, offset, area_size, digest
        ));
        Ok(slot)
    }

    fn luks2_slot<'h>(&self, header: &'h Header, slot: usize) -> Result<&'h Luks2Keyslot> {
        self.check_index(slot)?;
        match header.metadata.keyslots.get(&slot) {
            None => Err(Error::SlotEmpty(slot)),
            Some(Keyslot::Luks2(k)) => Ok(k),
            Some(Keyslot::Reencrypt(_)) => Err(Error::InvalidArgument(format!(
                "keyslot {} holds reencryption progress",
                slot
            ))),
        }
    }

    /// Recover the volume key from `slot`.
    pub fn open<D: BlockDevice + ?Sized>(
        &self,
        device: &mut D,
        header: &Header,
        slot: usize,
        passphrase: &[u8],
    ) -> Result<VolumeKey> {
        let keyslot = self.luks2_slot(header, slot)?;
        let corrupt = |reason: String| Error::SlotCorrupt { slot, reason };

        if keyslot.af.kind != "luks1" {
            return Err(corrupt(format!("unknown AF type {}", keyslot.af.kind)));
        }
        if keyslot.area.kind != "raw" {
            return Err(corrupt(format!("unknown area type {}", keyslot.area.kind)));
        }
        let len = material_len(keyslot.key_size, keyslot.af.stripes);
        if (len as u64) > keyslot.area.size {
            return Err(corrupt(format!(
                "area of {} bytes cannot hold {} bytes of material",
                keyslot.area.size, len
            )));
        }
        let (_, digest) = header
            .metadata
            .digest_for_keyslot(slot)
            .ok_or_else(|| corrupt("not bound to a digest".into()))?;

        let kdf_params = keyslot.kdf.params();
        if kdf_params.is_argon2() {
            self.caps.require(Feature::Argon2)?;
        }
        let kek = keyslot.kdf.derive_key(passphrase, keyslot.area.key_size)?;

        let mut material = zeroize::Zeroizing::new(vec![0u8; len]);
        device.read_at(keyslot.area.offset, &mut material)?;
        SectorCipher::new(&keyslot.area.encryption, &kek, KEYSLOT_SECTOR_SIZE)?
            .decrypt(0, &mut material)?;

        let key = af_merge(&material, keyslot.key_size, keyslot.af.stripes, keyslot.af.hash)?;
        let key = VolumeKey::from_bytes(&key);

        if verify_volume_key(&key, digest.hash, &digest.salt, digest.iterations, &digest.digest) {
            self.log.debug(&format!("keyslot {} opened", slot));
            Ok(key)
        } else {
            Err(Error::WrongPassphrase)
        }
    }

    /// Try every passphrase keyslot, preferred ones first.
    ///
    /// Only slots bound to `segment`'s digest are tried when `segment` is
    /// given. Fails with `WrongPassphrase` when no slot opens.
    pub fn open_any<D: BlockDevice + ?Sized>(
        &self,
        device: &mut D,
        header: &Header,
        passphrase: &[u8],
        segment: Option<usize>,
    ) -> Result<(usize, VolumeKey)> {
        let wanted_digest = segment.and_then(|s| header.metadata.digest_for_segment(s));
        let mut candidates: Vec<(u8, usize)> = header
            .metadata
            .luks2_keyslots()
            .filter(|(slot, _)| match wanted_digest {
                Some((_, d)) => d.keyslots.contains(slot),
                None => true,
            })
            .map(|(slot, k)| (k.priority.unwrap_or(PRIORITY_NORMAL), slot))
            .filter(|(priority, _)| *priority != PRIORITY_IGNORE)
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, slot) in candidates {
            match self.open(device, header, slot, passphrase) {
                Ok(key) => return Ok((slot, key)),
                Err(Error::WrongPassphrase) => continue,
                Err(e @ Error::Io(_)) => return Err(e),
                Err(e) => {
                    self.log
                        .notice(&format!("skipping keyslot {}: {}", slot, e));
                }
            }
        }
        Err(Error::WrongPassphrase)
    }

    /// Set the priority `open_any` uses for `slot`.
    pub fn set_priority(&self, header: &mut Header, slot: usize, priority: u8) -> Result<()> {
        self.luks2_slot(header, slot)?;
        if priority > PRIORITY_PREFER {
            return Err(Error::InvalidArgument(format!("priority {}", priority)));
        }
        if let Some(Keyslot::Luks2(k)) = header.metadata.keyslots.get_mut(&slot) {
            k.priority = if priority == PRIORITY_NORMAL {
                None
            } else {
                Some(priority)
            };
        }
        Ok(())
    }

    /// Wipe the material of `slot`, then remove it from the header.
    pub fn destroy<D: BlockDevice + ?Sized>(
        &self,
        device: &mut D,
        header: &mut Header,
        slot: usize,
    ) -> Result<()> {
        let area = self.luks2_slot(header, slot)?.area.clone();

        wipe_region(device, area.offset, area.size, None)?;

        header.metadata.keyslots.remove(&slot);
        let mut emptied = Vec::new();
        for (index, digest) in header.metadata.digests.iter_mut() {
            digest.keyslots.retain(|&s| s != slot);
            if digest.keyslots.is_empty() && digest.segments.is_empty() {
                emptied.push(*index);
            }
        }
        for index in emptied {
            header.metadata.digests.remove(&index);
        }
        crate::token::TokenStore::new(Arc::clone(&self.log))
            .unassign_keyslot(&mut header.metadata, slot);

        self.log.debug(&format!(
            "keyslot {} destroyed, {} bytes at {} wiped",
            slot, area.size, area.offset
        ));
        Ok(())
    }
}
