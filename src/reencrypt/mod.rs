//! Resumable in-place reencryption.
//!
//! The data segment is rewritten chunk by chunk from the old volume key to a
//! new one. Progress lives in a `reencrypt` keyslot, which also owns a
//! checksum area in the keyslots area. Before a chunk is overwritten, the
//! checksums of the old and new ciphertext of every sector in it are written
//! there and the chunk is recorded as the hotzone. After a crash each sector
//! of the hotzone is classified on its own as rewritten, untouched, or
//! damaged, so a chunk write that only partly landed is finished rather than
//! lost.
//!
//! Per chunk, in order:
//! 1. read old ciphertext, decrypt with the old key, encrypt with the new key
//! 2. write the per-sector checksum table and sync
//! 3. persist the hotzone
//! 4. write the new ciphertext and sync
//! 5. advance the marker past the chunk and persist

use crate::capability::Feature;
use crate::config::{pbkdf2_params, reencrypt_params, validate_key_size, DEFAULT_VOLUME_KEY_SIZE};
use crate::crypto::{verify_volume_key, HashAlg, KdfParams, SectorCipher, VolumeKey};
use crate::error::{Error, Result};
use crate::header::{ChecksumArea, Direction, Hotzone, Keyslot, ReencryptKeyslot, Segment};
use crate::logging::LogSink;
use crate::storage::BlockDevice;
use crate::volume::{Txn, Volume};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Parameters of a new reencryption.
#[derive(Debug, Clone)]
pub struct ReencryptParams {
    /// Bytes rewritten per step; a multiple of the sector size.
    pub chunk_size: u64,
    /// KDF of the keyslot created for the new key.
    pub kdf: KdfParams,
    /// Size of the new volume key.
    pub key_size: usize,
    /// Iterations of the new key's digest.
    pub digest_iterations: u32,
}

impl ReencryptParams {
    /// Check the parameters against a segment of `sector_size` bytes.
    pub fn validate(&self, sector_size: u32) -> Result<()> {
        validate_key_size(self.key_size).map_err(Error::InvalidArgument)?;
        let sector_size = u64::from(sector_size);
        if self.chunk_size == 0 || self.chunk_size % sector_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "chunk size {} is not a positive multiple of {}",
                self.chunk_size, sector_size
            )));
        }
        Ok(())
    }
}

impl Default for ReencryptParams {
    fn default() -> Self {
        Self {
            chunk_size: reencrypt_params::DEFAULT_CHUNK_SIZE,
            kdf: KdfParams::default(),
            key_size: DEFAULT_VOLUME_KEY_SIZE,
            digest_iterations: pbkdf2_params::DIGEST_ITERATIONS,
        }
    }
}

/// Old and new volume keys of a running reencryption.
#[derive(Debug, Clone)]
pub struct ReencryptKeys {
    pub old: VolumeKey,
    pub new: VolumeKey,
}

/// What the header says about reencryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReencryptStatus {
    None,
    /// A job is recorded and stopped between chunks.
    Clean,
    /// A job stopped inside a chunk; the hotzone must be checked.
    Crash,
}

/// Cancellation flag checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Token that is not cancelled yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running job to stop after its current chunk.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bytes rewritten so far out of the segment total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
}

const CHECKSUM_HASH: HashAlg = HashAlg::Sha256;

/// Drives reencryption of a [`Volume`].
pub struct Reencryptor {
    log: Arc<dyn LogSink>,
}

impl Reencryptor {
    /// Reencryptor logging progress to `log`.
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self { log }
    }

    /// Reencryption state recorded in the header of `volume`.
    pub fn status<D: BlockDevice>(volume: &Volume<D>) -> ReencryptStatus {
        match volume.header().metadata.reencrypt_job() {
            None => ReencryptStatus::None,
            Some((_, job)) if job.hotzone.is_some() => ReencryptStatus::Crash,
            Some(_) => ReencryptStatus::Clean,
        }
    }

    /// Record a new job: generate the new key, add a keyslot for it under
    /// `new_passphrase` and persist the progress marker at zero.
    pub fn start<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        old_passphrase: &[u8],
        new_passphrase: &[u8],
        params: &ReencryptParams,
    ) -> Result<ReencryptKeys> {
        volume.capabilities().require(Feature::Reencryption)?;
        if volume.reencryption_pending() {
            return Err(Error::ReencryptionPending);
        }

        let keys = volume.update(|t| {
            let (old_segment, segment) = t
                .header
                .metadata
                .segments
                .iter()
                .next()
                .map(|(i, s)| (*i, s.clone()))
                .ok_or_else(|| Error::Corrupt("no data segment".into()))?;
            params.validate(segment.sector_size)?;
            let sectors_per_chunk = (params.chunk_size / u64::from(segment.sector_size)) as usize;
            let (old_digest, _) = t
                .header
                .metadata
                .digest_for_segment(old_segment)
                .ok_or_else(|| Error::Corrupt(format!("segment {} has no digest", old_segment)))?;

            let (_, old_key) =
                t.keyslots
                    .open_any(&mut *t.device, &t.header, old_passphrase, Some(old_segment))?;

            let new_key = VolumeKey::generate(params.key_size);
            SectorCipher::new(&segment.encryption, new_key.as_bytes(), segment.sector_size as usize)?;
            let new_segment = t.header.metadata.free_segment();
            t.header.metadata.segments.insert(new_segment, segment.clone());
            let new_digest = t.keyslots.create_digest(
                &mut t.header,
                &new_key,
                vec![new_segment],
                params.digest_iterations,
            )?;
            let new_slot =
                t.keyslots
                    .add(&mut *t.device, &mut t.header, &new_key, new_passphrase, params.kdf)?;

            let job_slot = t.header.metadata.free_keyslot().ok_or(Error::NoFreeSlot)?;
            let mut area = ChecksumArea {
                kind: "checksum".into(),
                offset: 0,
                size: 0,
                hash: CHECKSUM_HASH,
                sector_size: segment.sector_size,
            };
            let table_len = area.table_len(sectors_per_chunk) as u64;
            (area.offset, area.size) = t.keyslots.allocate_area(&t.header, table_len)?;
            t.header.metadata.keyslots.insert(
                job_slot,
                Keyslot::Reencrypt(ReencryptKeyslot {
                    mode: "reencrypt".into(),
                    direction: Direction::Forward,
                    offset: 0,
                    chunk_size: params.chunk_size,
                    old_digest,
                    new_digest,
                    old_segment,
                    new_segment,
                    area,
                    hotzone: None,
                }),
            );
            t.header
                .metadata
                .config
                .requirements
                .mandatory
                .push(reencrypt_params::REQUIREMENT.to_string());

            t.log.notice(&format!(
                "reencryption started: keyslot {} holds the new key, job in keyslot {}",
                new_slot, job_slot
            ));
            Ok(ReencryptKeys {
                old: old_key,
                new: new_key,
            })
        })?;
        Ok(keys)
    }

    /// Recover both keys of a recorded job from passphrases.
    pub fn unlock<D: BlockDevice>(
        &self,
        volume: &mut Volume<D>,
        old_passphrase: &[u8],
        new_passphrase: &[u8],
    ) -> Result<ReencryptKeys> {
        let (old_segment, new_segment) = {
            let (_, job) = volume
                .header()
                .metadata
                .reencrypt_job()
                .ok_or(Error::NoReencryption)?;
            (job.old_segment, job.new_segment)
        };
        let (_, old) = volume.open_keyslot_for_segment(old_passphrase, old_segment)?;
        let (_, new) = volume.open_keyslot_for_segment(new_passphrase, new_segment)?;
        Ok(ReencryptKeys { old, new })
    }

    /// Rewrite the remaining chunks, then retire the old key.
    ///
    /// Stops with `Cancelled` between chunks once `cancel` is set; the marker
    /// is already persisted at that point and a later `run` picks up from
    /// it. `progress` is called after every chunk.
    pub fn run<D, F>(
        &self,
        volume: &mut Volume<D>,
        keys: &ReencryptKeys,
        cancel: &CancelToken,
        mut progress: F,
    ) -> Result<()>
    where
        D: BlockDevice,
        F: FnMut(Progress),
    {
        volume.capabilities().require(Feature::Reencryption)?;
        volume.update(|t| {
            let (job_slot, mut job) = t
                .header
                .metadata
                .reencrypt_job()
                .map(|(i, j)| (i, j.clone()))
                .ok_or(Error::NoReencryption)?;

            let old_segment = segment(t, job.old_segment)?;
            let new_segment = segment(t, job.new_segment)?;
            check_key(t, job.old_digest, &keys.old)?;
            check_key(t, job.new_digest, &keys.new)?;

            let sector_size = u64::from(old_segment.sector_size);
            let device_size = t.device.size()?;
            let total = old_segment.length(device_size) / sector_size * sector_size;
            let old_cipher =
                SectorCipher::new(&old_segment.encryption, keys.old.as_bytes(), sector_size as usize)?;
            let new_cipher = SectorCipher::new(
                &new_segment.encryption,
                keys.new.as_bytes(),
                new_segment.sector_size as usize,
            )?;

            if job.area.sector_size != old_segment.sector_size
                || job.area.sector_size != new_segment.sector_size
            {
                return Err(Error::Corrupt(format!(
                    "checksum area sector size {} does not match the segments",
                    job.area.sector_size
                )));
            }
            let ciphers = ChunkCiphers {
                old_segment: &old_segment,
                new_segment: &new_segment,
                old: &old_cipher,
                new: &new_cipher,
            };

            if let Some(hotzone) = job.hotzone.take() {
                self.recover(t, &ciphers, &mut job, &hotzone)?;
                save(t, job_slot, &job)?;
            }

            while job.offset < total {
                if cancel.is_cancelled() {
                    self.log.notice(&format!(
                        "reencryption cancelled at {} of {} bytes",
                        job.offset, total
                    ));
                    return Err(Error::Cancelled);
                }

                let len = job.chunk_size.min(total - job.offset);
                let position = old_segment.offset + job.offset;
                let sector = job.offset / sector_size;

                let mut buf = Zeroizing::new(vec![0u8; len as usize]);
                t.device.read_at(position, &mut buf)?;
                let old_sums: Vec<Vec<u8>> = buf
                    .chunks(sector_size as usize)
                    .map(|s| job.area.hash.hash(&[s]))
                    .collect();
                ciphers.rewrite(sector, &mut buf)?;

                let mut table = Vec::with_capacity(job.area.table_len(old_sums.len()));
                for (old_sum, new_sector) in old_sums.iter().zip(buf.chunks(sector_size as usize)) {
                    table.extend_from_slice(old_sum);
                    table.extend_from_slice(&job.area.hash.hash(&[new_sector]));
                }
                t.device.write_at(job.area.offset, &table)?;
                t.device.sync()?;

                job.hotzone = Some(Hotzone {
                    offset: job.offset,
                    length: len,
                    table_digest: job.area.hash.hash(&[table.as_slice()]),
                });
                save(t, job_slot, &job)?;

                t.device.write_at(position, &buf)?;
                t.device.sync()?;

                job.offset += len;
                job.hotzone = None;
                save(t, job_slot, &job)?;

                self.log.debug(&format!(
                    "reencrypted {} bytes at {}, {} of {} done",
                    len,
                    position,
                    job.offset,
                    total
                ));
                progress(Progress {
                    done: job.offset,
                    total,
                });
            }

            self.finish(t, job_slot, &job)
        })
    }

    /// Finish the chunk under the marker after an interrupted run.
    ///
    /// Every sector of the hotzone must match either its old or its new
    /// checksum. Sectors still holding old ciphertext are rewritten; the
    /// marker then moves past the chunk.
    fn recover<D: BlockDevice>(
        &self,
        t: &mut Txn<'_, D>,
        ciphers: &ChunkCiphers<'_>,
        job: &mut ReencryptKeyslot,
        hotzone: &Hotzone,
    ) -> Result<()> {
        if hotzone.offset != job.offset {
            return Err(Error::Corrupt(format!(
                "hotzone at {} does not match progress marker {}",
                hotzone.offset, job.offset
            )));
        }
        let area = &job.area;
        let sector_size = u64::from(area.sector_size);
        if hotzone.length == 0 || hotzone.length % sector_size != 0 {
            return Err(Error::Corrupt(format!(
                "hotzone length {} is not a whole number of sectors",
                hotzone.length
            )));
        }
        let sectors = (hotzone.length / sector_size) as usize;
        let table_len = area.table_len(sectors);
        if table_len as u64 > area.size {
            return Err(Error::Corrupt(format!(
                "hotzone of {} sectors does not fit checksum area of {} bytes",
                sectors, area.size
            )));
        }

        let mut table = vec![0u8; table_len];
        t.device.read_at(area.offset, &mut table)?;
        if area.hash.hash(&[table.as_slice()]) != hotzone.table_digest {
            return Err(Error::Corrupt(format!(
                "checksum table of hotzone at {} is damaged",
                hotzone.offset
            )));
        }

        let position = ciphers.old_segment.offset + hotzone.offset;
        let mut buf = Zeroizing::new(vec![0u8; hotzone.length as usize]);
        t.device.read_at(position, &mut buf)?;

        let entry = area.hash.output_len();
        let mut stale = Vec::new();
        for (i, (sector, sums)) in buf
            .chunks(sector_size as usize)
            .zip(table.chunks(2 * entry))
            .enumerate()
        {
            let (old_sum, new_sum) = sums.split_at(entry);
            let current = area.hash.hash(&[sector]);
            if current == new_sum {
                continue;
            }
            if current != old_sum {
                return Err(Error::Corrupt(format!(
                    "sector {} of chunk at {} matches neither old nor new ciphertext",
                    i, hotzone.offset
                )));
            }
            stale.push(i);
        }

        let first_sector = hotzone.offset / sector_size;
        for &i in &stale {
            let range = i * sector_size as usize..(i + 1) * sector_size as usize;
            let sector = &mut buf[range];
            ciphers.rewrite(first_sector + i as u64, sector)?;
            t.device
                .write_at(position + i as u64 * sector_size, sector)?;
        }
        t.device.sync()?;

        self.log.notice(&format!(
            "hotzone at {}: {} of {} sectors rewritten again, advancing marker",
            hotzone.offset,
            stale.len(),
            sectors
        ));
        job.offset += hotzone.length;
        Ok(())
    }

    /// Make the new segment the only one, then wipe the old keyslots.
    ///
    /// The switch is committed before any wiping, so a crash in between
    /// leaves a finished volume with stale old keyslots rather than a job
    /// whose old key can no longer be opened.
    fn finish<D: BlockDevice>(
        &self,
        t: &mut Txn<'_, D>,
        job_slot: usize,
        job: &ReencryptKeyslot,
    ) -> Result<()> {
        let meta = &mut t.header.metadata;
        meta.keyslots.remove(&job_slot);
        let new_segment = meta
            .segments
            .remove(&job.new_segment)
            .ok_or_else(|| Error::Corrupt(format!("segment {} missing", job.new_segment)))?;
        meta.segments.clear();
        meta.segments.insert(0, new_segment);
        if let Some(digest) = meta.digests.get_mut(&job.new_digest) {
            digest.segments = vec![0];
        }
        let old_slots = match meta.digests.get_mut(&job.old_digest) {
            Some(digest) => {
                digest.segments.clear();
                digest.keyslots.clone()
            }
            None => Vec::new(),
        };
        meta.config
            .requirements
            .mandatory
            .retain(|r| r != reencrypt_params::REQUIREMENT);
        t.commit()?;
        self.log.notice("data segment switched to the new volume key");

        for slot in old_slots {
            t.keyslots.destroy(&mut *t.device, &mut t.header, slot)?;
            t.commit()?;
        }
        t.header.metadata.digests.remove(&job.old_digest);

        self.log.notice("reencryption finished");
        Ok(())
    }
}

/// Old and new segment ciphers of a job.
struct ChunkCiphers<'a> {
    old_segment: &'a Segment,
    new_segment: &'a Segment,
    old: &'a SectorCipher,
    new: &'a SectorCipher,
}

impl ChunkCiphers<'_> {
    /// Re-encrypt whole sectors in place, the first one at segment sector
    /// `sector`.
    fn rewrite(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.old.decrypt(self.old_segment.iv_tweak + sector, buf)?;
        self.new.encrypt(self.new_segment.iv_tweak + sector, buf)
    }
}

fn segment<D: BlockDevice>(t: &Txn<'_, D>, index: usize) -> Result<Segment> {
    t.header
        .metadata
        .segments
        .get(&index)
        .cloned()
        .ok_or_else(|| Error::Corrupt(format!("reencryption segment {} missing", index)))
}

fn check_key<D: BlockDevice>(t: &Txn<'_, D>, digest: usize, key: &VolumeKey) -> Result<()> {
    let entry = t
        .header
        .metadata
        .digests
        .get(&digest)
        .ok_or_else(|| Error::Corrupt(format!("reencryption digest {} missing", digest)))?;
    if verify_volume_key(key, entry.hash, &entry.salt, entry.iterations, &entry.digest) {
        Ok(())
    } else {
        Err(Error::WrongVolumeKey)
    }
}

fn save<D: BlockDevice>(t: &mut Txn<'_, D>, job_slot: usize, job: &ReencryptKeyslot) -> Result<()> {
    t.header
        .metadata
        .keyslots
        .insert(job_slot, Keyslot::Reencrypt(job.clone()));
    t.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities;
    use crate::config::FormatOptions;
    use crate::crypto::minimal_kdf_parameters;
    use crate::error::ErrorKind;
    use crate::logging::NullSink;
    use crate::storage::MemDevice;
    use crate::volume::VolumeContext;

    const DATA: usize = 64 * 1024;

    fn params() -> ReencryptParams {
        ReencryptParams {
            chunk_size: 16 * 1024,
            kdf: minimal_kdf_parameters(),
            key_size: 64,
            digest_iterations: 1000,
        }
    }

    fn ctx(caps: Capabilities) -> VolumeContext {
        VolumeContext::default()
            .with_log(Arc::new(NullSink))
            .with_capabilities(caps)
    }

    fn volume_with_data(caps: Capabilities) -> (Volume<MemDevice>, Vec<u8>) {
        let opts = FormatOptions {
            keyslots_size: 1024 * 1024,
            digest_iterations: 1000,
            ..Default::default()
        };
        let device = MemDevice::new(opts.data_offset() as usize + DATA);
        let (mut volume, key) = Volume::format_with(ctx(caps), device, &opts).unwrap();
        volume
            .add_keyslot(&key, b"old", minimal_kdf_parameters())
            .unwrap();

        let plaintext: Vec<u8> = (0..DATA).map(|i| (i * 7 % 251) as u8).collect();
        let mut active = volume.into_active();
        active.activate_by_volume_key(&key).unwrap();
        active.write_sectors(0, &plaintext).unwrap();
        (active.into_volume(), plaintext)
    }

    fn read_all(volume: Volume<MemDevice>, passphrase: &[u8]) -> Vec<u8> {
        let mut active = volume.into_active();
        active.activate_by_passphrase(passphrase, None).unwrap();
        let mut buf = vec![0u8; DATA];
        active.read_sectors(0, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_full_run() {
        let (mut volume, plaintext) = volume_with_data(Capabilities::all());
        let reencryptor = Reencryptor::new(Arc::new(NullSink));

        let keys = reencryptor
            .start(&mut volume, b"old", b"new", &params())
            .unwrap();
        assert_eq!(Reencryptor::status(&volume), ReencryptStatus::Clean);

        let mut seen = Vec::new();
        reencryptor
            .run(&mut volume, &keys, &CancelToken::new(), |p| seen.push(p.done))
            .unwrap();
        assert_eq!(seen, vec![16384, 32768, 49152, 65536]);
        assert_eq!(Reencryptor::status(&volume), ReencryptStatus::None);
        assert_eq!(volume.header().metadata.segments.len(), 1);
        assert!(volume.header().metadata.config.requirements.is_empty());

        assert!(volume.open_any_keyslot(b"old").is_err());
        assert_eq!(read_all(volume, b"new"), plaintext);
    }

    #[test]
    fn test_activation_refused_while_pending() {
        let (mut volume, _) = volume_with_data(Capabilities::all());
        let reencryptor = Reencryptor::new(Arc::new(NullSink));
        reencryptor
            .start(&mut volume, b"old", b"new", &params())
            .unwrap();

        let mut active = volume.into_active();
        let err = active.activate_by_passphrase(b"old", None).unwrap_err();
        assert!(matches!(err, Error::ReencryptionPending));
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_cancel_then_resume() {
        let (mut volume, plaintext) = volume_with_data(Capabilities::all());
        let reencryptor = Reencryptor::new(Arc::new(NullSink));
        let keys = reencryptor
            .start(&mut volume, b"old", b"new", &params())
            .unwrap();

        let cancel = CancelToken::new();
        let err = reencryptor
            .run(&mut volume, &keys, &cancel, |p| {
                if p.done == 32768 {
                    cancel.cancel();
                }
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let (_, job) = volume.header().metadata.reencrypt_job().unwrap();
        assert_eq!(job.offset, 32768);
        assert!(job.hotzone.is_none());

        let keys = reencryptor.unlock(&mut volume, b"old", b"new").unwrap();
        let mut seen = Vec::new();
        reencryptor
            .run(&mut volume, &keys, &CancelToken::new(), |p| seen.push(p.done))
            .unwrap();
        assert_eq!(seen, vec![49152, 65536]);
        assert_eq!(read_all(volume, b"new"), plaintext);
    }

    #[test]
    fn test_requires_capability() {
        let (mut volume, _) = volume_with_data(Capabilities::minimal());
        let err = Reencryptor::new(Arc::new(NullSink))
            .start(&mut volume, b"old", b"new", &params())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert!(!volume.reencryption_pending());
    }

    #[test]
    fn test_job_owns_checksum_area() {
        let (mut volume, _) = volume_with_data(Capabilities::all());
        Reencryptor::new(Arc::new(NullSink))
            .start(&mut volume, b"old", b"new", &params())
            .unwrap();

        let header = volume.header();
        let (job_slot, job) = header.metadata.reencrypt_job().unwrap();
        assert_eq!(job.area.kind, "checksum");
        // 32 sectors per chunk, two sha256 sums each, one aligned block.
        assert_eq!(job.area.table_len(32), 2048);
        assert_eq!(job.area.size, 4096);
        assert!(job.area.offset >= header.keyslots_area_start());
        assert!(job.area.offset + job.area.size <= header.keyslots_area_end());

        let areas = header.metadata.used_areas();
        assert_eq!(areas.len(), 3);
        assert!(areas.iter().any(|&(_, _, slot)| slot == job_slot));
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_bad_key_size() {
        let (mut volume, _) = volume_with_data(Capabilities::all());
        let bad = ReencryptParams {
            key_size: 48,
            ..params()
        };
        let err = Reencryptor::new(Arc::new(NullSink))
            .start(&mut volume, b"old", b"new", &bad)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!volume.reencryption_pending());
    }

    #[test]
    fn test_bad_chunk_size() {
        let (mut volume, _) = volume_with_data(Capabilities::all());
        let bad = ReencryptParams {
            chunk_size: 1000,
            ..params()
        };
        let err = Reencryptor::new(Arc::new(NullSink))
            .start(&mut volume, b"old", b"new", &bad)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!volume.reencryption_pending());
    }
}
