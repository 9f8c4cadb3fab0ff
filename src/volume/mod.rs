//! Volume handle - the main interface.
//!
//! A [`Volume`] owns a block device and its decoded header. Every mutation
//! takes the metadata lock, re-reads the header, applies the change to a
//! copy and commits it through the header codec.

mod lifecycle;

pub use lifecycle::{ActiveVolume, Keyring, SessionKeyring, SignatureVerifier, VolumeState};

use crate::capability::{Capabilities, Feature};
use crate::config::{reencrypt_params, FormatOptions, DEFAULT_LOCK_TIMEOUT, DEFAULT_METADATA_SIZE};
use crate::crypto::{verify_volume_key, KdfParams, VolumeKey};
use crate::error::{Error, Result};
use crate::header::{Header, HeaderCodec, HeaderCopy, Segment, SegmentSize};
use crate::keyslot::{KeyslotManager, KeyslotStatus};
use crate::logging::{LogBridge, LogSink};
use crate::storage::{wipe_region, BlockDevice};
use crate::token::{TokenStatus, TokenStore};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Collaborators shared by every component of a volume.
#[derive(Clone)]
pub struct VolumeContext {
    pub caps: Capabilities,
    pub log: Arc<dyn LogSink>,
    /// Longest wait for the metadata lock.
    pub lock_timeout: Duration,
}

impl Default for VolumeContext {
    fn default() -> Self {
        Self {
            caps: Capabilities::default(),
            log: LogBridge::shared(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl VolumeContext {
    /// Route library messages to `log`.
    pub fn with_log(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    /// Replace the detected capabilities.
    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    /// How long to wait for the metadata lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Header mutation in progress, holding the metadata lock.
pub(crate) struct Txn<'a, D: BlockDevice> {
    pub device: &'a mut D,
    pub header: Header,
    pub keyslots: &'a KeyslotManager,
    pub tokens: &'a TokenStore,
    pub log: &'a Arc<dyn LogSink>,
    codec: &'a HeaderCodec,
    active: HeaderCopy,
}

impl<D: BlockDevice> Txn<'_, D> {
    /// Persist the current header without ending the transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.active = self
            .codec
            .store(&mut *self.device, &mut self.header, self.active)?;
        Ok(())
    }
}

/// An opened LUKS2 volume.
pub struct Volume<D: BlockDevice> {
    device: D,
    header: Header,
    active: HeaderCopy,
    ctx: VolumeContext,
    codec: HeaderCodec,
    keyslots: KeyslotManager,
    tokens: TokenStore,
}

impl<D: BlockDevice> Volume<D> {
    fn assemble(device: D, header: Header, active: HeaderCopy, ctx: VolumeContext) -> Self {
        Self {
            codec: HeaderCodec::new(Arc::clone(&ctx.log)),
            keyslots: KeyslotManager::new(ctx.caps.clone(), Arc::clone(&ctx.log)),
            tokens: TokenStore::new(Arc::clone(&ctx.log)),
            device,
            header,
            active,
            ctx,
        }
    }

    /// Format `device` with default collaborators.
    pub fn format(device: D, opts: &FormatOptions) -> Result<(Self, VolumeKey)> {
        Self::format_with(VolumeContext::default(), device, opts)
    }

    /// Write a fresh header to `device` and return the new volume key.
    ///
    /// The volume has no keyslots yet; add one with
    /// [`Volume::add_keyslot`] before dropping the key.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Capabilities, log sink and lock timeout
    /// * `device` - Target device; everything before the data offset is wiped
    /// * `opts` - Layout and cipher options
    pub fn format_with(
        ctx: VolumeContext,
        mut device: D,
        opts: &FormatOptions,
    ) -> Result<(Self, VolumeKey)> {
        if opts.metadata_size != DEFAULT_METADATA_SIZE {
            ctx.caps.require(Feature::MetadataSizeOverride)?;
        }
        if opts.data_offset.is_some() {
            ctx.caps.require(Feature::DataOffsetOverride)?;
        }
        let mut header = Header::new(opts)?;

        let needed = opts.data_offset() + u64::from(opts.sector_size);
        let available = device.size()?;
        if available < needed {
            return Err(Error::DeviceTooSmall { needed, available });
        }

        let _guard = device.lock_metadata(ctx.lock_timeout)?;

        // Clear old headers and keyslot material
        wipe_region(&mut device, 0, opts.data_offset(), Some(0))?;

        let key = VolumeKey::generate(opts.key_size);
        let mut volume = Self::assemble(device, header.clone(), HeaderCopy::Primary, ctx);
        volume
            .keyslots
            .create_digest(&mut header, &key, vec![0], opts.digest_iterations)?;
        volume.active = volume
            .codec
            .store(&mut volume.device, &mut header, HeaderCopy::Primary)?;
        volume.header = header;

        volume.ctx.log.notice(&format!(
            "formatted {} as LUKS2, uuid {}",
            volume.device.name(),
            volume.header.uuid
        ));
        Ok((volume, key))
    }

    /// Open the volume on `device` with default collaborators.
    pub fn load(device: D) -> Result<Self> {
        Self::load_with(VolumeContext::default(), device)
    }

    /// Read the header from `device`.
    ///
    /// A damaged or stale header copy is rewritten from the good one when
    /// the device allows it.
    pub fn load_with(ctx: VolumeContext, mut device: D) -> Result<Self> {
        let codec = HeaderCodec::new(Arc::clone(&ctx.log));
        let loaded = codec.read_from(&mut device)?;

        for requirement in &loaded.header.metadata.config.requirements.mandatory {
            if requirement != reencrypt_params::REQUIREMENT {
                return Err(Error::UnsupportedParameter(format!(
                    "mandatory requirement {}",
                    requirement
                )));
            }
        }

        let repair_needed = loaded.repair_needed;
        let mut volume = Self::assemble(device, loaded.header, loaded.active, ctx);
        if repair_needed {
            volume.ctx.log.notice("repairing header copies");
            if let Err(e) = volume.update(|_| Ok(())) {
                volume
                    .ctx
                    .log
                    .error(&format!("header repair failed: {}", e));
            }
        }
        Ok(volume)
    }

    fn refresh(&mut self) -> Result<()> {
        let loaded = self.codec.read_from(&mut self.device)?;
        self.header = loaded.header;
        self.active = loaded.active;
        Ok(())
    }

    /// Run `f` on a copy of the header under the metadata lock and commit
    /// the result. On failure the in-memory header is re-read from disk.
    pub(crate) fn update<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Txn<'_, D>) -> Result<T>,
    {
        let _guard = self.device.lock_metadata(self.ctx.lock_timeout)?;
        self.refresh()?;

        let mut txn = Txn {
            device: &mut self.device,
            header: self.header.clone(),
            keyslots: &self.keyslots,
            tokens: &self.tokens,
            log: &self.ctx.log,
            codec: &self.codec,
            active: self.active,
        };
        let result = f(&mut txn).and_then(|out| txn.commit().map(|_| out));
        let Txn { header, active, .. } = txn;

        match result {
            Ok(out) => {
                self.header = header;
                self.active = active;
                Ok(out)
            }
            Err(e) => {
                if let Err(reload) = self.refresh() {
                    self.ctx
                        .log
                        .error(&format!("could not re-read header: {}", reload));
                }
                Err(e)
            }
        }
    }

    /// Header as of the last load or commit.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Volume UUID.
    pub fn uuid(&self) -> &str {
        &self.header.uuid
    }

    /// Volume label; empty when unset.
    pub fn label(&self) -> &str {
        &self.header.label
    }

    /// Subsystem tag; empty when unset.
    pub fn subsystem(&self) -> &str {
        &self.header.subsystem
    }

    /// Byte offset of the data segment.
    pub fn data_offset(&self) -> u64 {
        self.header.data_offset()
    }

    /// Capabilities this volume was opened with.
    pub fn capabilities(&self) -> &Capabilities {
        &self.ctx.caps
    }

    /// Log sink of this volume.
    pub fn log(&self) -> &Arc<dyn LogSink> {
        &self.ctx.log
    }

    /// Underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    pub(crate) fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Consume the handle and hand back the device.
    pub fn into_device(self) -> D {
        self.device
    }

    /// Segment data is currently read through: the lowest-numbered one.
    pub fn active_segment(&self) -> Result<(usize, &Segment)> {
        self.header
            .metadata
            .segments
            .iter()
            .next()
            .map(|(i, s)| (*i, s))
            .ok_or_else(|| Error::Corrupt("no data segment".into()))
    }

    /// Cipher of the active data segment.
    pub fn cipher(&self) -> Result<&str> {
        Ok(&self.active_segment()?.1.encryption)
    }

    /// Sector size of the active data segment.
    pub fn sector_size(&self) -> Result<u32> {
        Ok(self.active_segment()?.1.sector_size)
    }

    /// Size in bytes of the volume key of the active segment.
    pub fn volume_key_size(&self) -> Option<usize> {
        let (segment, _) = self.active_segment().ok()?;
        let (_, digest) = self.header.metadata.digest_for_segment(segment)?;
        digest.keyslots.iter().find_map(|slot| {
            self.header
                .metadata
                .luks2_keyslots()
                .find(|(i, _)| i == slot)
                .map(|(_, k)| k.key_size)
        })
    }

    /// True while a reencryption job or its requirement is recorded.
    pub fn reencryption_pending(&self) -> bool {
        self.header.metadata.reencryption_pending()
    }

    /// Check `key` against the digest of the active segment.
    pub fn verify_volume_key(&self, key: &VolumeKey) -> Result<()> {
        let (segment, _) = self.active_segment()?;
        let (_, digest) = self
            .header
            .metadata
            .digest_for_segment(segment)
            .ok_or_else(|| Error::Corrupt(format!("segment {} has no digest", segment)))?;
        if verify_volume_key(key, digest.hash, &digest.salt, digest.iterations, &digest.digest) {
            Ok(())
        } else {
            Err(Error::WrongVolumeKey)
        }
    }

    /// Number of keyslot indices.
    pub fn keyslot_max(&self) -> usize {
        self.keyslots.max()
    }

    /// Occupancy of keyslot `slot`.
    pub fn keyslot_status(&self, slot: usize) -> Result<KeyslotStatus> {
        self.keyslots.status(&self.header, slot)
    }

    /// Add a keyslot for `volume_key` at the first free index.
    pub fn add_keyslot(
        &mut self,
        volume_key: &VolumeKey,
        passphrase: &[u8],
        kdf: KdfParams,
    ) -> Result<usize> {
        self.update(|t| {
            t.keyslots
                .add(&mut *t.device, &mut t.header, volume_key, passphrase, kdf)
        })
    }

    /// Add a keyslot for `volume_key` at index `slot`.
    pub fn add_keyslot_at(
        &mut self,
        slot: usize,
        volume_key: &VolumeKey,
        passphrase: &[u8],
        kdf: KdfParams,
    ) -> Result<usize> {
        self.update(|t| {
            t.keyslots
                .add_at(&mut *t.device, &mut t.header, slot, volume_key, passphrase, kdf)
        })
    }

    /// Add a keyslot unlocked by `new_passphrase`, proving access with an
    /// existing passphrase.
    pub fn add_keyslot_by_passphrase(
        &mut self,
        passphrase: &[u8],
        new_passphrase: &[u8],
        kdf: KdfParams,
    ) -> Result<usize> {
        let (_, key) = self.open_any_keyslot(passphrase)?;
        self.add_keyslot(&key, new_passphrase, kdf)
    }

    /// Recover the volume key from keyslot `slot`.
    pub fn open_keyslot(&mut self, slot: usize, passphrase: &[u8]) -> Result<VolumeKey> {
        self.keyslots
            .open(&mut self.device, &self.header, slot, passphrase)
    }

    /// Open whichever keyslot of the active segment `passphrase` unlocks.
    pub fn open_any_keyslot(&mut self, passphrase: &[u8]) -> Result<(usize, VolumeKey)> {
        let (segment, _) = self.active_segment()?;
        self.keyslots
            .open_any(&mut self.device, &self.header, passphrase, Some(segment))
    }

    /// Open a keyslot bound to the digest of `segment`.
    pub(crate) fn open_keyslot_for_segment(
        &mut self,
        passphrase: &[u8],
        segment: usize,
    ) -> Result<(usize, VolumeKey)> {
        self.keyslots
            .open_any(&mut self.device, &self.header, passphrase, Some(segment))
    }

    /// Wipe keyslot `slot` and commit.
    pub fn destroy_keyslot(&mut self, slot: usize) -> Result<()> {
        self.update(|t| t.keyslots.destroy(&mut *t.device, &mut t.header, slot))
    }

    /// Change the order `open_any_keyslot` tries `slot` in.
    pub fn set_keyslot_priority(&mut self, slot: usize, priority: u8) -> Result<()> {
        self.update(|t| t.keyslots.set_priority(&mut t.header, slot, priority))
    }

    /// Number of token indices.
    pub fn token_max(&self) -> usize {
        self.tokens.max()
    }

    /// Token `index`, optionally checked against `expected_type`.
    pub fn token_get(&self, index: usize, expected_type: Option<&str>) -> Result<Value> {
        self.tokens.get(&self.header.metadata, index, expected_type)
    }

    /// Store the token JSON `text` and return its index.
    pub fn token_add(&mut self, text: &str) -> Result<usize> {
        self.update(|t| t.tokens.add(&mut t.header.metadata, text))
    }

    /// Remove token `index` and commit.
    pub fn token_remove(&mut self, index: usize) -> Result<()> {
        self.update(|t| t.tokens.remove(&mut t.header.metadata, index))
    }

    /// Occupancy and handler of token `index`.
    pub fn token_status(&self, index: usize) -> Result<TokenStatus> {
        self.tokens.status(&self.header.metadata, index)
    }

    /// Keyslot token `index` refers to.
    pub fn token_keyslot(&self, index: usize) -> Result<usize> {
        self.tokens.keyslot_of(&self.header.metadata, index)
    }

    /// All tokens in index order.
    pub fn tokens(&self) -> Vec<(usize, Value)> {
        self.tokens
            .iter(&self.header.metadata)
            .map(|(i, t)| (i, t.clone()))
            .collect()
    }

    /// Set label and subsystem (each under 48 bytes) and commit.
    pub fn set_label(&mut self, label: &str, subsystem: &str) -> Result<()> {
        if label.len() >= 48 || subsystem.len() >= 48 {
            return Err(Error::InvalidArgument(
                "label and subsystem must be shorter than 48 bytes".into(),
            ));
        }
        self.update(|t| {
            t.header.label = label.to_string();
            t.header.subsystem = subsystem.to_string();
            Ok(())
        })
    }

    /// Fix the data segment to `size` bytes, or let it span the device
    /// when `None`.
    pub fn resize(&mut self, size: Option<u64>) -> Result<()> {
        if self.reencryption_pending() {
            return Err(Error::ReencryptionPending);
        }
        self.update(|t| {
            let device_size = t.device.size()?;
            let segment = t
                .header
                .metadata
                .segments
                .values_mut()
                .next()
                .ok_or_else(|| Error::Corrupt("no data segment".into()))?;
            segment.size = match size {
                None => SegmentSize::Dynamic,
                Some(bytes) => {
                    if bytes == 0 || bytes % u64::from(segment.sector_size) != 0 {
                        return Err(Error::InvalidArgument(format!(
                            "size {} is not a positive multiple of the {}-byte sector",
                            bytes, segment.sector_size
                        )));
                    }
                    let needed = segment.offset + bytes;
                    if needed > device_size {
                        return Err(Error::DeviceTooSmall {
                            needed,
                            available: device_size,
                        });
                    }
                    SegmentSize::Fixed(bytes)
                }
            };
            t.log.debug(&format!("data segment resized to {:?}", segment.size));
            Ok(())
        })
    }

    /// Copy the header and keyslots area to `path`.
    pub fn header_backup(&mut self, path: &Path) -> Result<()> {
        let len = self.header.data_offset();
        let mut bytes = vec![0u8; len as usize];
        {
            let _guard = self.device.lock_metadata(self.ctx.lock_timeout)?;
            self.device.read_at(0, &mut bytes)?;
        }
        // Validates before anything reaches the backup file.
        self.codec.load(&bytes)?;
        std::fs::write(path, &bytes)?;
        self.ctx
            .log
            .info(&format!("header backup of {} bytes written to {}", len, path.display()));
        Ok(())
    }

    /// Replace the header and keyslots area with the backup in `path`.
    ///
    /// The backup must decode and must describe the same data offset as
    /// the current header.
    pub fn header_restore(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let restored = self.codec.load(&bytes)?;
        if restored.data_offset() != self.header.data_offset()
            || bytes.len() as u64 != restored.data_offset()
        {
            return Err(Error::InvalidArgument(format!(
                "backup layout (data offset {}, {} bytes) does not match volume (data offset {})",
                restored.data_offset(),
                bytes.len(),
                self.header.data_offset()
            )));
        }

        {
            let _guard = self.device.lock_metadata(self.ctx.lock_timeout)?;
            self.device.write_at(0, &bytes)?;
            self.device.sync()?;
        }
        self.refresh()?;
        self.ctx
            .log
            .notice(&format!("header restored from {}", path.display()));
        Ok(())
    }

    /// Start the lifecycle state machine for this volume.
    pub fn into_active(self) -> ActiveVolume<D> {
        ActiveVolume::new(self)
    }
}
