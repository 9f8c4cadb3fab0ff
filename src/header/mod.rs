//! LUKS2 header: binary superblock, JSON metadata and the two-copy codec.

mod binary;
mod codec;
mod metadata;

pub use binary::{compute_checksum, BinaryHeader, HeaderCopy};
pub use codec::{HeaderCodec, LoadedHeader};
pub use metadata::{
    AntiForensic, ChecksumArea, DigestEntry, Direction, Extra, Hotzone, Keyslot, KeyslotArea,
    Luks2Keyslot, Metadata, MetadataConfig, ReencryptKeyslot, Requirements, Segment, SegmentSize,
};

use crate::config::{FormatOptions, BINARY_HEADER_SIZE};
use crate::crypto::random_bytes;
use crate::error::{Error, Result};
use uuid::Uuid;

/// A decoded header: the fields shared by both copies plus the metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Sequence number; bumped on every store.
    pub seqid: u64,
    /// Size of one header copy.
    pub metadata_size: u64,
    pub label: String,
    pub subsystem: String,
    pub uuid: String,
    pub salt: [u8; 64],
    pub metadata: Metadata,
}

impl Header {
    /// Build the header of a freshly formatted volume.
    pub fn new(opts: &FormatOptions) -> Result<Self> {
        opts.validate().map_err(Error::InvalidArgument)?;

        let uuid = match &opts.uuid {
            Some(text) => Uuid::parse_str(text)
                .map_err(|e| Error::InvalidArgument(format!("uuid: {}", e)))?
                .hyphenated()
                .to_string(),
            None => Uuid::new_v4().hyphenated().to_string(),
        };

        let mut salt = [0u8; 64];
        salt.copy_from_slice(&random_bytes(64));

        let segment = Segment {
            kind: "crypt".into(),
            offset: opts.data_offset(),
            size: SegmentSize::Dynamic,
            iv_tweak: 0,
            encryption: opts.cipher.clone(),
            sector_size: opts.sector_size,
            flags: Vec::new(),
            extra: Default::default(),
        };

        Ok(Self {
            seqid: 0,
            metadata_size: opts.metadata_size,
            label: opts.label.clone().unwrap_or_default(),
            subsystem: opts.subsystem.clone().unwrap_or_default(),
            uuid,
            salt,
            metadata: Metadata::new(
                opts.metadata_size - BINARY_HEADER_SIZE,
                opts.keyslots_size,
                segment,
            ),
        })
    }

    /// Bytes available for JSON in each copy.
    pub fn json_area_size(&self) -> u64 {
        self.metadata_size - BINARY_HEADER_SIZE
    }

    /// First byte of the keyslots area.
    pub fn keyslots_area_start(&self) -> u64 {
        2 * self.metadata_size
    }

    /// One past the last byte of the keyslots area.
    pub fn keyslots_area_end(&self) -> u64 {
        self.keyslots_area_start() + self.metadata.config.keyslots_size
    }

    /// Offset of the lowest data segment.
    pub fn data_offset(&self) -> u64 {
        self.metadata
            .segments
            .values()
            .map(|s| s.offset)
            .min()
            .unwrap_or_else(|| self.keyslots_area_end())
    }

    /// Structural validation of the whole header.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.config.json_size != self.json_area_size() {
            return Err(Error::Corrupt(format!(
                "json_size {} does not match header size {}",
                self.metadata.config.json_size, self.metadata_size
            )));
        }
        if self.data_offset() < self.keyslots_area_end() {
            return Err(Error::Corrupt("data segment overlaps keyslots area".into()));
        }
        self.metadata.validate(self.keyslots_area_start())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header_layout() {
        let header = Header::new(&FormatOptions::default()).unwrap();
        assert_eq!(header.json_area_size(), 12288);
        assert_eq!(header.keyslots_area_start(), 32768);
        assert_eq!(header.data_offset(), 16 * 1024 * 1024);
        assert!(header.validate().is_ok());
        assert!(Uuid::parse_str(&header.uuid).is_ok());
    }

    #[test]
    fn test_fixed_uuid() {
        let opts = FormatOptions {
            uuid: Some("2F9A4C3E-5B1D-4E0A-9C7F-6D8E1B2A3C4D".into()),
            ..Default::default()
        };
        let header = Header::new(&opts).unwrap();
        assert_eq!(header.uuid, "2f9a4c3e-5b1d-4e0a-9c7f-6d8e1b2a3c4d");
    }

    #[test]
    fn test_bad_uuid_rejected() {
        let opts = FormatOptions {
            uuid: Some("not-a-uuid".into()),
            ..Default::default()
        };
        assert!(matches!(Header::new(&opts), Err(Error::InvalidArgument(_))));
    }
}
