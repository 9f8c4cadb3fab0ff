//! Volume key lifecycle and the decrypted data path.
//!
//! ```text
//! Locked -> Unlocking -> Unlocked <-> Suspended
//!    ^                       |            |
//!    +-------- deactivate ---+------------+
//! ```
//!
//! `Unlocking` is only observable while the KDF runs; a failed unlock
//! returns to `Locked`.

use super::Volume;
use crate::capability::Feature;
use crate::crypto::{SectorCipher, VolumeKey};
use crate::error::{Error, Result};
use crate::header::Segment;
use crate::logging::LogSink;
use crate::storage::BlockDevice;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Lifecycle state of an [`ActiveVolume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Locked,
    Unlocking,
    Unlocked,
    Suspended,
}

impl VolumeState {
    /// Lowercase state name.
    pub fn name(self) -> &'static str {
        match self {
            VolumeState::Locked => "locked",
            VolumeState::Unlocking => "unlocking",
            VolumeState::Unlocked => "unlocked",
            VolumeState::Suspended => "suspended",
        }
    }
}

/// Checks a detached signature over a volume key.
pub trait SignatureVerifier {
    fn verify(&self, volume_key: &[u8], signature: &[u8]) -> bool;
}

/// Store of volume keys by description.
pub trait Keyring: Send + Sync {
    fn add_key(&self, description: &str, key: &VolumeKey) -> Result<()>;

    fn lookup(&self, description: &str) -> Option<VolumeKey>;

    /// Drop a key; returns whether it existed.
    fn revoke(&self, description: &str) -> bool;
}

/// Keyring living in this process.
#[derive(Default)]
pub struct SessionKeyring {
    keys: Mutex<HashMap<String, VolumeKey>>,
}

impl SessionKeyring {
    /// Empty keyring.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keyring for SessionKeyring {
    fn add_key(&self, description: &str, key: &VolumeKey) -> Result<()> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| Error::InvalidArgument("keyring poisoned".into()))?;
        keys.insert(description.to_string(), key.clone());
        Ok(())
    }

    fn lookup(&self, description: &str) -> Option<VolumeKey> {
        self.keys.lock().ok()?.get(description).cloned()
    }

    fn revoke(&self, description: &str) -> bool {
        self.keys
            .lock()
            .map(|mut keys| keys.remove(description).is_some())
            .unwrap_or(false)
    }
}

struct Mapping {
    key: VolumeKey,
    cipher: SectorCipher,
    segment: Segment,
}

/// A volume with its key lifecycle and sector-level data path.
pub struct ActiveVolume<D: BlockDevice> {
    volume: Volume<D>,
    state: VolumeState,
    mapping: Option<Mapping>,
    log: Arc<dyn LogSink>,
}

impl<D: BlockDevice> ActiveVolume<D> {
    /// Wrap `volume` in the locked state.
    pub fn new(volume: Volume<D>) -> Self {
        let log = Arc::clone(volume.log());
        Self {
            volume,
            state: VolumeState::Locked,
            mapping: None,
            log,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VolumeState {
        self.state
    }

    /// Wrapped volume.
    pub fn volume(&self) -> &Volume<D> {
        &self.volume
    }

    /// Header access, only while no I/O can run.
    pub fn volume_mut(&mut self) -> Result<&mut Volume<D>> {
        match self.state {
            VolumeState::Locked | VolumeState::Suspended => Ok(&mut self.volume),
            other => Err(Error::InvalidState {
                expected: "locked or suspended",
                actual: other.name(),
            }),
        }
    }

    /// Wipe the key and give the volume back.
    pub fn into_volume(mut self) -> Volume<D> {
        self.mapping = None;
        self.volume
    }

    fn expect(&self, expected: VolumeState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            })
        }
    }

    fn activate_with<F>(&mut self, unlock: F) -> Result<()>
    where
        F: FnOnce(&mut Volume<D>) -> Result<VolumeKey>,
    {
        self.expect(VolumeState::Locked)?;
        if self.volume.reencryption_pending() {
            return Err(Error::ReencryptionPending);
        }

        self.state = VolumeState::Unlocking;
        let mapping = unlock(&mut self.volume).and_then(|key| self.map(key));
        match mapping {
            Ok(mapping) => {
                self.mapping = Some(mapping);
                self.state = VolumeState::Unlocked;
                self.log
                    .info(&format!("volume {} unlocked", self.volume.uuid()));
                Ok(())
            }
            Err(e) => {
                self.state = VolumeState::Locked;
                Err(e)
            }
        }
    }

    fn map(&self, key: VolumeKey) -> Result<Mapping> {
        self.volume.verify_volume_key(&key)?;
        let (_, segment) = self.volume.active_segment()?;
        let cipher = SectorCipher::new(
            &segment.encryption,
            key.as_bytes(),
            segment.sector_size as usize,
        )?;
        Ok(Mapping {
            key,
            cipher,
            segment: segment.clone(),
        })
    }

    /// Unlock with a passphrase; returns the keyslot that opened.
    pub fn activate_by_passphrase(&mut self, passphrase: &[u8], slot: Option<usize>) -> Result<usize> {
        let mut used = 0;
        self.activate_with(|volume| {
            let (index, key) = match slot {
                Some(index) => (index, volume.open_keyslot(index, passphrase)?),
                None => volume.open_any_keyslot(passphrase)?,
            };
            used = index;
            Ok(key)
        })?;
        Ok(used)
    }

    /// Unlock with the raw volume key.
    pub fn activate_by_volume_key(&mut self, key: &VolumeKey) -> Result<()> {
        self.activate_with(|_| Ok(key.clone()))
    }

    /// Unlock with a volume key accompanied by a signature over it.
    pub fn activate_by_signed_key(
        &mut self,
        key: &VolumeKey,
        signature: &[u8],
        verifier: &dyn SignatureVerifier,
    ) -> Result<()> {
        self.volume
            .capabilities()
            .require(Feature::SignedKeyActivation)?;
        self.activate_with(|_| {
            if verifier.verify(key.as_bytes(), signature) {
                Ok(key.clone())
            } else {
                Err(Error::SignatureRejected)
            }
        })
    }

    /// Unlock with a volume key previously linked into `keyring`.
    pub fn activate_by_keyring(&mut self, description: &str, keyring: &dyn Keyring) -> Result<()> {
        self.volume
            .capabilities()
            .require(Feature::KeyringActivation)?;
        self.activate_with(|_| {
            keyring
                .lookup(description)
                .ok_or_else(|| Error::KeyringKeyNotFound(description.to_string()))
        })
    }

    /// Put the active volume key into `keyring` under `description`.
    pub fn link_to_keyring(&self, description: &str, keyring: &dyn Keyring) -> Result<()> {
        self.volume
            .capabilities()
            .require(Feature::KeyringActivation)?;
        let mapping = self.mapping.as_ref().ok_or(Error::InvalidState {
            expected: "unlocked or suspended",
            actual: self.state.name(),
        })?;
        keyring.add_key(description, &mapping.key)
    }

    /// Block the data path but keep the key.
    pub fn suspend(&mut self) -> Result<()> {
        self.expect(VolumeState::Unlocked)?;
        self.state = VolumeState::Suspended;
        self.log
            .info(&format!("volume {} suspended", self.volume.uuid()));
        Ok(())
    }

    fn resume_with(&mut self, key: VolumeKey) -> Result<()> {
        let held = self.mapping.as_ref().map(|m| &m.key);
        if held != Some(&key) {
            return Err(Error::WrongVolumeKey);
        }
        // The header may have been replaced while suspended.
        self.volume.verify_volume_key(&key)?;
        self.state = VolumeState::Unlocked;
        self.log
            .info(&format!("volume {} resumed", self.volume.uuid()));
        Ok(())
    }

    /// Re-open a keyslot with `passphrase` and leave suspension.
    pub fn resume(&mut self, passphrase: &[u8]) -> Result<()> {
        self.expect(VolumeState::Suspended)?;
        let (_, key) = self.volume.open_any_keyslot(passphrase)?;
        self.resume_with(key)
    }

    /// Resume a suspended volume by checking `key` against the held key.
    pub fn resume_by_volume_key(&mut self, key: &VolumeKey) -> Result<()> {
        self.volume
            .capabilities()
            .require(Feature::ResumeByVolumeKey)?;
        self.expect(VolumeState::Suspended)?;
        self.resume_with(key.clone())
    }

    /// Wipe the key and return to `Locked`.
    pub fn deactivate(&mut self) -> Result<()> {
        match self.state {
            VolumeState::Unlocked | VolumeState::Suspended => {
                self.mapping = None;
                self.state = VolumeState::Locked;
                self.log
                    .info(&format!("volume {} locked", self.volume.uuid()));
                Ok(())
            }
            other => Err(Error::InvalidState {
                expected: "unlocked or suspended",
                actual: other.name(),
            }),
        }
    }

    fn io_mapping(&self) -> Result<&Mapping> {
        self.expect(VolumeState::Unlocked)?;
        self.mapping.as_ref().ok_or(Error::InvalidState {
            expected: "unlocked",
            actual: self.state.name(),
        })
    }

    /// Data size in sectors.
    pub fn size_sectors(&mut self) -> Result<u64> {
        self.io_mapping()?;
        let device_size = self.volume.device_mut().size()?;
        let segment = &self.io_mapping()?.segment;
        Ok(segment.length(device_size) / u64::from(segment.sector_size))
    }

    /// Byte offset on the device and IV of data sector `sector`.
    fn locate(&mut self, sector: u64, len: usize) -> Result<(u64, u64)> {
        let total = self.size_sectors()?;
        let mapping = self.io_mapping()?;
        let sector_size = u64::from(mapping.segment.sector_size);
        if len as u64 % sector_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} bytes is not a whole number of {}-byte sectors",
                len, sector_size
            )));
        }
        let count = len as u64 / sector_size;
        if sector.checked_add(count).map_or(true, |end| end > total) {
            return Err(Error::InvalidArgument(format!(
                "sectors {}..{} beyond end of volume ({} sectors)",
                sector,
                sector.saturating_add(count),
                total
            )));
        }
        Ok((
            mapping.segment.offset + sector * sector_size,
            mapping.segment.iv_tweak + sector,
        ))
    }

    /// Read and decrypt whole sectors starting at `sector`.
    pub fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let (offset, iv) = self.locate(sector, buf.len())?;
        self.volume.device_mut().read_at(offset, buf)?;
        self.io_mapping()?.cipher.decrypt(iv, buf)
    }

    /// Encrypt and write whole sectors starting at `sector`.
    pub fn write_sectors(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        let (offset, iv) = self.locate(sector, data.len())?;
        let mut buf = zeroize::Zeroizing::new(data.to_vec());
        self.io_mapping()?.cipher.encrypt(iv, &mut buf)?;
        self.volume.device_mut().write_at(offset, &buf)
    }

    /// Flush written sectors to the device.
    pub fn sync(&mut self) -> Result<()> {
        self.volume.device_mut().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities;
    use crate::config::FormatOptions;
    use crate::crypto::{minimal_kdf_parameters, HashAlg};
    use crate::error::ErrorKind;
    use crate::logging::NullSink;
    use crate::storage::MemDevice;
    use crate::volume::VolumeContext;

    struct Sha256Signer;

    impl SignatureVerifier for Sha256Signer {
        fn verify(&self, volume_key: &[u8], signature: &[u8]) -> bool {
            HashAlg::Sha256.hash(&[volume_key]) == signature
        }
    }

    fn setup(caps: Capabilities) -> (ActiveVolume<MemDevice>, VolumeKey) {
        let opts = FormatOptions {
            keyslots_size: 1024 * 1024,
            digest_iterations: 1000,
            ..Default::default()
        };
        let ctx = VolumeContext::default()
            .with_log(Arc::new(NullSink))
            .with_capabilities(caps);
        let device = MemDevice::new(opts.data_offset() as usize + 64 * 1024);
        let (mut volume, key) = Volume::format_with(ctx, device, &opts).unwrap();
        volume
            .add_keyslot(&key, b"open sesame", minimal_kdf_parameters())
            .unwrap();
        (volume.into_active(), key)
    }

    #[test]
    fn test_passphrase_activation_and_io() {
        let (mut active, _key) = setup(Capabilities::all());
        assert_eq!(active.state(), VolumeState::Locked);

        let slot = active.activate_by_passphrase(b"open sesame", None).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(active.state(), VolumeState::Unlocked);
        assert_eq!(active.size_sectors().unwrap(), 128);

        let data: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        active.write_sectors(3, &data).unwrap();
        let mut back = vec![0u8; 1024];
        active.read_sectors(3, &mut back).unwrap();
        assert_eq!(back, data);

        // Ciphertext on the device differs from the plaintext.
        let offset = active.volume().data_offset() + 3 * 512;
        let mut raw = vec![0u8; 1024];
        active.volume.device_mut().read_at(offset, &mut raw).unwrap();
        assert_ne!(raw, data);
    }

    #[test]
    fn test_wrong_passphrase_returns_to_locked() {
        let (mut active, _key) = setup(Capabilities::all());
        let err = active.activate_by_passphrase(b"nope", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongCredential);
        assert_eq!(active.state(), VolumeState::Locked);
    }

    #[test]
    fn test_suspend_blocks_io_and_resume_revalidates() {
        let (mut active, key) = setup(Capabilities::all());
        active.activate_by_volume_key(&key).unwrap();
        active.suspend().unwrap();

        let mut buf = vec![0u8; 512];
        let err = active.read_sectors(0, &mut buf).unwrap_err();
        assert!(matches!(err, Error::InvalidState { actual: "suspended", .. }));

        // Header changes are allowed while suspended.
        active
            .volume_mut()
            .unwrap()
            .token_add(r#"{"type":"systemd-tpm2","keyslots":["0"]}"#)
            .unwrap();

        assert!(active.resume(b"wrong").is_err());
        assert_eq!(active.state(), VolumeState::Suspended);
        active.resume(b"open sesame").unwrap();
        assert!(active.read_sectors(0, &mut buf).is_ok());
    }

    #[test]
    fn test_resume_by_volume_key() {
        let (mut active, key) = setup(Capabilities::all());
        active.activate_by_volume_key(&key).unwrap();
        active.suspend().unwrap();

        let other = VolumeKey::generate(64);
        assert!(matches!(
            active.resume_by_volume_key(&other),
            Err(Error::WrongVolumeKey)
        ));
        active.resume_by_volume_key(&key).unwrap();
        assert_eq!(active.state(), VolumeState::Unlocked);
    }

    #[test]
    fn test_deactivate_from_locked_is_invalid() {
        let (mut active, key) = setup(Capabilities::all());
        assert!(active.deactivate().is_err());
        active.activate_by_volume_key(&key).unwrap();
        active.deactivate().unwrap();
        assert_eq!(active.state(), VolumeState::Locked);
        assert!(active.volume_mut().is_ok());
    }

    #[test]
    fn test_signed_key_activation() {
        let (mut active, key) = setup(Capabilities::all());
        let bad = active.activate_by_signed_key(&key, b"forged", &Sha256Signer);
        assert!(matches!(bad, Err(Error::SignatureRejected)));

        let signature = HashAlg::Sha256.hash(&[key.as_bytes()]);
        active
            .activate_by_signed_key(&key, &signature, &Sha256Signer)
            .unwrap();
        assert_eq!(active.state(), VolumeState::Unlocked);
    }

    #[test]
    fn test_keyring_roundtrip() {
        let keyring = SessionKeyring::new();
        let (mut active, key) = setup(Capabilities::all());
        active.activate_by_volume_key(&key).unwrap();
        active.link_to_keyring("cryptsetup:data", &keyring).unwrap();
        active.deactivate().unwrap();

        let missing = active.activate_by_keyring("other", &keyring).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        active.activate_by_keyring("cryptsetup:data", &keyring).unwrap();
        assert!(keyring.revoke("cryptsetup:data"));
    }

    #[test]
    fn test_optional_activation_methods_need_capability() {
        let (mut active, key) = setup(Capabilities::minimal());
        let keyring = SessionKeyring::new();

        let err = active
            .activate_by_signed_key(&key, b"", &Sha256Signer)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        let err = active.activate_by_keyring("x", &keyring).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert_eq!(active.state(), VolumeState::Locked);
    }

    #[test]
    fn test_out_of_range_io() {
        let (mut active, key) = setup(Capabilities::all());
        active.activate_by_volume_key(&key).unwrap();
        let mut buf = vec![0u8; 1024];
        assert!(active.read_sectors(127, &mut buf).is_err());
        assert!(active.read_sectors(0, &mut buf[..100]).is_err());
    }
}
