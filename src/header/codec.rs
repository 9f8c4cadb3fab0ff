//! Reading and writing the two header copies.
//!
//! The primary copy sits at offset 0, the secondary right after it. The copy
//! with the higher valid `seqid` wins. A store bumps `seqid` and writes the
//! inactive copy first, so a crash mid-store always leaves one complete copy.

use super::binary::{BinaryHeader, HeaderCopy};
use super::{Header, Metadata};
use crate::config::{BINARY_HEADER_SIZE, CHECKSUM_ALG, LUKS2_VERSION, VALID_METADATA_SIZES};
use crate::error::{Error, Result};
use crate::logging::LogSink;
use crate::storage::BlockDevice;
use std::sync::Arc;

/// Result of reading both copies.
#[derive(Debug, Clone)]
pub struct LoadedHeader {
    pub header: Header,
    /// Copy the header was taken from.
    pub active: HeaderCopy,
    /// The other copy is missing, damaged, older or different.
    pub repair_needed: bool,
}

/// Encodes and decodes header copies.
pub struct HeaderCodec {
    log: Arc<dyn LogSink>,
}

impl HeaderCodec {
    /// Codec reporting fallbacks to `log`.
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self { log }
    }

    /// Decode a header from a device image starting at offset 0.
    pub fn load(&self, bytes: &[u8]) -> Result<Header> {
        Ok(self.load_detailed(bytes)?.header)
    }

    /// Decode a header and report which copy was used.
    pub fn load_detailed(&self, bytes: &[u8]) -> Result<LoadedHeader> {
        let primary = self.decode_copy(bytes, 0, HeaderCopy::Primary);

        let candidates: Vec<u64> = match &primary {
            Ok(header) => vec![header.metadata_size],
            Err(_) => VALID_METADATA_SIZES.to_vec(),
        };
        let mut secondary = Err(Error::Corrupt("secondary header not found".into()));
        for offset in candidates {
            match self.decode_copy(bytes, offset, HeaderCopy::Secondary) {
                Ok(header) => {
                    secondary = Ok(header);
                    break;
                }
                Err(e) => {
                    if !matches!(secondary, Err(Error::UnsupportedVersion(_))) {
                        secondary = Err(e);
                    }
                }
            }
        }

        match (primary, secondary) {
            (Ok(p), Ok(s)) => {
                if s.seqid > p.seqid {
                    self.log.notice(&format!(
                        "secondary header is newer (seqid {} > {}), using it",
                        s.seqid, p.seqid
                    ));
                    Ok(LoadedHeader {
                        header: s,
                        active: HeaderCopy::Secondary,
                        repair_needed: true,
                    })
                } else {
                    let repair_needed = p != s;
                    Ok(LoadedHeader {
                        header: p,
                        active: HeaderCopy::Primary,
                        repair_needed,
                    })
                }
            }
            (Ok(p), Err(e)) => {
                self.log
                    .notice(&format!("secondary header unusable ({}), using primary", e));
                Ok(LoadedHeader {
                    header: p,
                    active: HeaderCopy::Primary,
                    repair_needed: true,
                })
            }
            (Err(e), Ok(s)) => {
                self.log
                    .notice(&format!("primary header unusable ({}), using secondary", e));
                Ok(LoadedHeader {
                    header: s,
                    active: HeaderCopy::Secondary,
                    repair_needed: true,
                })
            }
            (Err(Error::UnsupportedVersion(v)), Err(_))
            | (Err(_), Err(Error::UnsupportedVersion(v))) => Err(Error::UnsupportedVersion(v)),
            (Err(p), Err(s)) => Err(Error::Corrupt(format!(
                "no valid header copy (primary: {}; secondary: {})",
                p, s
            ))),
        }
    }

    fn decode_copy(&self, bytes: &[u8], offset: u64, expected: HeaderCopy) -> Result<Header> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::Corrupt("header offset out of range".into()))?;
        if bytes.len() < start + BINARY_HEADER_SIZE as usize {
            return Err(Error::Corrupt(format!(
                "{} header beyond end of device",
                expected.name()
            )));
        }
        let area = &bytes[start..];

        let bin = BinaryHeader::parse(area)?;
        if bin.copy != expected {
            return Err(Error::Corrupt(format!(
                "{} magic at {} header position",
                bin.copy.name(),
                expected.name()
            )));
        }
        if bin.hdr_offset != offset {
            return Err(Error::Corrupt(format!(
                "header claims offset {} but sits at {}",
                bin.hdr_offset, offset
            )));
        }
        bin.verify_checksum(area)?;

        let json_area = &area[BINARY_HEADER_SIZE as usize..bin.hdr_size as usize];
        let end = json_area.iter().position(|&b| b == 0).unwrap_or(json_area.len());
        let metadata: Metadata = serde_json::from_slice(&json_area[..end])
            .map_err(|e| Error::Corrupt(format!("{} JSON area: {}", expected.name(), e)))?;

        let header = Header {
            seqid: bin.seqid,
            metadata_size: bin.hdr_size,
            label: bin.label,
            subsystem: bin.subsystem,
            uuid: bin.uuid,
            salt: bin.salt,
            metadata,
        };
        header.validate()?;
        Ok(header)
    }

    /// Serialize one copy of `header`.
    pub fn encode_copy(&self, header: &Header, copy: HeaderCopy) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(&header.metadata)?;
        let available = header.json_area_size() as usize;
        if json.len() > available {
            return Err(Error::JsonAreaOverflow {
                needed: json.len(),
                available,
            });
        }

        let mut area = vec![0u8; header.metadata_size as usize];
        let json_start = BINARY_HEADER_SIZE as usize;
        area[json_start..json_start + json.len()].copy_from_slice(&json);

        let mut bin = BinaryHeader {
            copy,
            version: LUKS2_VERSION,
            hdr_size: header.metadata_size,
            seqid: header.seqid,
            label: header.label.clone(),
            checksum_alg: CHECKSUM_ALG.to_string(),
            salt: header.salt,
            uuid: header.uuid.clone(),
            subsystem: header.subsystem.clone(),
            hdr_offset: match copy {
                HeaderCopy::Primary => 0,
                HeaderCopy::Secondary => header.metadata_size,
            },
            csum: [0u8; 64],
        };
        bin.write_into(&mut area)?;
        Ok(area)
    }

    /// Serialize both copies back to back, as they lie on disk.
    pub fn encode(&self, header: &Header) -> Result<Vec<u8>> {
        let mut out = self.encode_copy(header, HeaderCopy::Primary)?;
        out.extend(self.encode_copy(header, HeaderCopy::Secondary)?);
        Ok(out)
    }

    /// Read the header from `device`.
    pub fn read_from<D: BlockDevice + ?Sized>(&self, device: &mut D) -> Result<LoadedHeader> {
        let size = device.size()?;
        if size < BINARY_HEADER_SIZE {
            return Err(Error::Corrupt("device smaller than a binary header".into()));
        }

        let mut first = vec![0u8; BINARY_HEADER_SIZE as usize];
        device.read_at(0, &mut first)?;
        let largest = VALID_METADATA_SIZES[VALID_METADATA_SIZES.len() - 1];
        let wanted = match BinaryHeader::parse(&first) {
            Ok(bin) if bin.copy == HeaderCopy::Primary => 2 * bin.hdr_size,
            _ => 2 * largest,
        };

        let mut bytes = vec![0u8; wanted.min(size) as usize];
        device.read_at(0, &mut bytes)?;
        match self.load_detailed(&bytes) {
            Err(Error::Corrupt(_)) if wanted < 2 * largest && size > wanted => {
                // Primary hdr_size may itself be damaged; scan every offset.
                bytes = vec![0u8; (2 * largest).min(size) as usize];
                device.read_at(0, &mut bytes)?;
                self.load_detailed(&bytes)
            }
            other => other,
        }
    }

    /// Write `header` to `device`, bumping its `seqid`.
    ///
    /// The copy other than `active` is written and synced first. Returns the
    /// copy that is active afterwards.
    pub fn store<D: BlockDevice + ?Sized>(
        &self,
        device: &mut D,
        header: &mut Header,
        active: HeaderCopy,
    ) -> Result<HeaderCopy> {
        let mut next = header.clone();
        next.seqid += 1;
        next.validate()?;

        let first = active.other();
        let first_area = self.encode_copy(&next, first)?;
        let second_area = self.encode_copy(&next, active)?;

        let needed = 2 * next.metadata_size;
        let available = device.size()?;
        if available < needed {
            return Err(Error::DeviceTooSmall { needed, available });
        }

        for (copy, area) in [(first, &first_area), (active, &second_area)] {
            let offset = match copy {
                HeaderCopy::Primary => 0,
                HeaderCopy::Secondary => next.metadata_size,
            };
            self.log.debug(&format!(
                "writing {} header copy, seqid {}",
                copy.name(),
                next.seqid
            ));
            device.write_at(offset, area)?;
            device.sync()?;
        }

        *header = next;
        Ok(HeaderCopy::Primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatOptions;
    use crate::logging::{MemorySink, NullSink, Severity};
    use crate::storage::MemDevice;
    use serde_json::json;

    fn codec() -> HeaderCodec {
        HeaderCodec::new(Arc::new(NullSink))
    }

    fn header() -> Header {
        Header::new(&FormatOptions::default()).unwrap()
    }

    #[test]
    fn test_encode_load_roundtrip() {
        let h = header();
        let bytes = codec().encode(&h).unwrap();
        assert_eq!(bytes.len(), 32768);
        assert_eq!(codec().load(&bytes).unwrap(), h);
    }

    #[test]
    fn test_corrupt_primary_falls_back() {
        let sink = Arc::new(MemorySink::new());
        let codec = HeaderCodec::new(sink.clone());
        let h = header();
        let mut bytes = codec.encode(&h).unwrap();
        bytes[4200] ^= 0x55;

        let loaded = codec.load_detailed(&bytes).unwrap();
        assert_eq!(loaded.header, h);
        assert_eq!(loaded.active, HeaderCopy::Secondary);
        assert!(loaded.repair_needed);
        assert!(sink.contains(Severity::Notice, "primary header unusable"));
    }

    #[test]
    fn test_secondary_found_by_scan_when_primary_wiped() {
        let opts = FormatOptions {
            metadata_size: 64 * 1024,
            ..Default::default()
        };
        let h = Header::new(&opts).unwrap();
        let mut bytes = codec().encode(&h).unwrap();
        bytes[..4096].fill(0);

        assert_eq!(codec().load(&bytes).unwrap(), h);
    }

    #[test]
    fn test_both_corrupt() {
        let mut bytes = codec().encode(&header()).unwrap();
        bytes[4200] ^= 1;
        bytes[16384 + 4200] ^= 1;

        let err = codec().load(&bytes).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_higher_seqid_wins() {
        let mut old = header();
        old.seqid = 3;
        let mut new = old.clone();
        new.seqid = 4;
        new.label = "renamed".into();

        let mut bytes = codec().encode_copy(&old, HeaderCopy::Primary).unwrap();
        bytes.extend(codec().encode_copy(&new, HeaderCopy::Secondary).unwrap());

        let loaded = codec().load_detailed(&bytes).unwrap();
        assert_eq!(loaded.header.label, "renamed");
        assert_eq!(loaded.active, HeaderCopy::Secondary);
    }

    #[test]
    fn test_json_overflow() {
        let mut h = header();
        h.metadata
            .tokens
            .insert(0, json!({"type": "big", "keyslots": [], "blob": "x".repeat(20000)}));

        let err = codec().encode(&h).unwrap_err();
        assert!(matches!(err, Error::JsonAreaOverflow { available: 12288, .. }));
    }

    #[test]
    fn test_store_bumps_seqid_and_writes_both() {
        let mut device = MemDevice::new(64 * 1024);
        let mut h = header();

        let active = codec().store(&mut device, &mut h, HeaderCopy::Primary).unwrap();
        assert_eq!(active, HeaderCopy::Primary);
        assert_eq!(h.seqid, 1);

        let loaded = codec().read_from(&mut device).unwrap();
        assert_eq!(loaded.header, h);
        assert!(!loaded.repair_needed);
    }

    #[test]
    fn test_store_overflow_leaves_device_untouched() {
        let mut device = MemDevice::new(64 * 1024);
        let mut h = header();
        codec().store(&mut device, &mut h, HeaderCopy::Primary).unwrap();
        let before = device.snapshot();

        let mut big = h.clone();
        big.metadata
            .tokens
            .insert(0, json!({"type": "big", "keyslots": [], "blob": "x".repeat(20000)}));
        assert!(codec().store(&mut device, &mut big, HeaderCopy::Primary).is_err());
        assert_eq!(device.snapshot(), before);
        assert_eq!(big.seqid, h.seqid);
    }
}
