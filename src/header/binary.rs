//! Fixed 4096-byte binary header at the start of each header copy.
//!
//! All integers are big-endian. Text fields are NUL-padded. The checksum
//! covers the whole header copy (binary part plus JSON area) with the
//! checksum field itself zeroed.

use crate::config::{
    BINARY_HEADER_SIZE, CHECKSUM_ALG, LUKS2_MAGIC_PRIMARY, LUKS2_MAGIC_SECONDARY, LUKS2_VERSION,
    VALID_METADATA_SIZES,
};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

pub const MAGIC_LEN: usize = 6;
pub const LABEL_LEN: usize = 48;
pub const CHECKSUM_ALG_LEN: usize = 32;
pub const SALT_LEN: usize = 64;
pub const UUID_LEN: usize = 40;
pub const SUBSYSTEM_LEN: usize = 48;
pub const CSUM_LEN: usize = 64;

const OFF_VERSION: usize = 6;
const OFF_HDR_SIZE: usize = 8;
const OFF_SEQID: usize = 16;
const OFF_LABEL: usize = 24;
const OFF_CHECKSUM_ALG: usize = 72;
const OFF_SALT: usize = 104;
const OFF_UUID: usize = 168;
const OFF_SUBSYSTEM: usize = 208;
const OFF_HDR_OFFSET: usize = 256;
const OFF_CSUM: usize = 448;

/// Which of the two header copies a binary header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCopy {
    Primary,
    Secondary,
}

impl HeaderCopy {
    /// Magic bytes identifying this copy.
    pub fn magic(self) -> [u8; MAGIC_LEN] {
        match self {
            HeaderCopy::Primary => LUKS2_MAGIC_PRIMARY,
            HeaderCopy::Secondary => LUKS2_MAGIC_SECONDARY,
        }
    }

    /// The opposite copy.
    pub fn other(self) -> HeaderCopy {
        match self {
            HeaderCopy::Primary => HeaderCopy::Secondary,
            HeaderCopy::Secondary => HeaderCopy::Primary,
        }
    }

    /// Name used in log messages.
    pub fn name(self) -> &'static str {
        match self {
            HeaderCopy::Primary => "primary",
            HeaderCopy::Secondary => "secondary",
        }
    }
}

/// Decoded binary header of one copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryHeader {
    pub copy: HeaderCopy,
    pub version: u16,
    pub hdr_size: u64,
    pub seqid: u64,
    pub label: String,
    pub checksum_alg: String,
    pub salt: [u8; SALT_LEN],
    pub uuid: String,
    pub subsystem: String,
    pub hdr_offset: u64,
    pub csum: [u8; CSUM_LEN],
}

fn put_str(buf: &mut [u8], offset: usize, len: usize, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() >= len {
        return Err(Error::InvalidArgument(format!(
            "header field '{}' longer than {} bytes",
            value,
            len - 1
        )));
    }
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn get_str(buf: &[u8], offset: usize, len: usize) -> Result<String> {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| Error::Corrupt("non UTF-8 text in binary header".into()))
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

/// SHA-256 over a header copy with the checksum field treated as zero.
pub fn compute_checksum(area: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&area[..OFF_CSUM]);
    hasher.update([0u8; CSUM_LEN]);
    hasher.update(&area[OFF_CSUM + CSUM_LEN..]);
    hasher.finalize().into()
}

impl BinaryHeader {
    /// Serialize into the first 4096 bytes of `area` and seal the checksum
    /// over the whole of `area`, which must be exactly `hdr_size` long.
    pub fn write_into(&mut self, area: &mut [u8]) -> Result<()> {
        if area.len() as u64 != self.hdr_size || self.hdr_size < BINARY_HEADER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "header area of {} bytes for hdr_size {}",
                area.len(),
                self.hdr_size
            )));
        }
        area[..BINARY_HEADER_SIZE as usize].fill(0);
        area[..MAGIC_LEN].copy_from_slice(&self.copy.magic());
        area[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&self.version.to_be_bytes());
        area[OFF_HDR_SIZE..OFF_HDR_SIZE + 8].copy_from_slice(&self.hdr_size.to_be_bytes());
        area[OFF_SEQID..OFF_SEQID + 8].copy_from_slice(&self.seqid.to_be_bytes());
        put_str(area, OFF_LABEL, LABEL_LEN, &self.label)?;
        put_str(area, OFF_CHECKSUM_ALG, CHECKSUM_ALG_LEN, &self.checksum_alg)?;
        area[OFF_SALT..OFF_SALT + SALT_LEN].copy_from_slice(&self.salt);
        put_str(area, OFF_UUID, UUID_LEN, &self.uuid)?;
        put_str(area, OFF_SUBSYSTEM, SUBSYSTEM_LEN, &self.subsystem)?;
        area[OFF_HDR_OFFSET..OFF_HDR_OFFSET + 8].copy_from_slice(&self.hdr_offset.to_be_bytes());

        let digest = compute_checksum(area);
        self.csum = [0u8; CSUM_LEN];
        self.csum[..digest.len()].copy_from_slice(&digest);
        area[OFF_CSUM..OFF_CSUM + CSUM_LEN].copy_from_slice(&self.csum);
        Ok(())
    }

    /// Parse the binary header at the start of `buf`.
    ///
    /// Only the fixed fields are checked; the checksum needs the full copy
    /// and is verified by [`BinaryHeader::verify_checksum`].
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if (buf.len() as u64) < BINARY_HEADER_SIZE {
            return Err(Error::Corrupt("truncated binary header".into()));
        }

        let copy = if buf[..MAGIC_LEN] == LUKS2_MAGIC_PRIMARY {
            HeaderCopy::Primary
        } else if buf[..MAGIC_LEN] == LUKS2_MAGIC_SECONDARY {
            HeaderCopy::Secondary
        } else {
            return Err(Error::Corrupt("bad header magic".into()));
        };

        let version = u16::from_be_bytes([buf[OFF_VERSION], buf[OFF_VERSION + 1]]);
        if version != LUKS2_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let hdr_size = get_u64(buf, OFF_HDR_SIZE);
        if !VALID_METADATA_SIZES.contains(&hdr_size) {
            return Err(Error::Corrupt(format!("invalid header size {}", hdr_size)));
        }

        let checksum_alg = get_str(buf, OFF_CHECKSUM_ALG, CHECKSUM_ALG_LEN)?;
        if checksum_alg != CHECKSUM_ALG {
            return Err(Error::UnsupportedParameter(format!(
                "header checksum {}",
                checksum_alg
            )));
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[OFF_SALT..OFF_SALT + SALT_LEN]);
        let mut csum = [0u8; CSUM_LEN];
        csum.copy_from_slice(&buf[OFF_CSUM..OFF_CSUM + CSUM_LEN]);

        Ok(Self {
            copy,
            version,
            hdr_size,
            seqid: get_u64(buf, OFF_SEQID),
            label: get_str(buf, OFF_LABEL, LABEL_LEN)?,
            checksum_alg,
            salt,
            uuid: get_str(buf, OFF_UUID, UUID_LEN)?,
            subsystem: get_str(buf, OFF_SUBSYSTEM, SUBSYSTEM_LEN)?,
            hdr_offset: get_u64(buf, OFF_HDR_OFFSET),
            csum,
        })
    }

    /// Check the stored checksum against the full header copy.
    pub fn verify_checksum(&self, area: &[u8]) -> Result<()> {
        if (area.len() as u64) < self.hdr_size {
            return Err(Error::Corrupt("truncated header copy".into()));
        }
        let digest = compute_checksum(&area[..self.hdr_size as usize]);
        let stored = &self.csum[..digest.len()];
        let padding_clear = self.csum[digest.len()..].iter().all(|&b| b == 0);
        if stored == digest.as_slice() && padding_clear {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_METADATA_SIZE;

    fn sample(copy: HeaderCopy) -> BinaryHeader {
        BinaryHeader {
            copy,
            version: LUKS2_VERSION,
            hdr_size: DEFAULT_METADATA_SIZE,
            seqid: 7,
            label: "data".into(),
            checksum_alg: CHECKSUM_ALG.into(),
            salt: [3u8; SALT_LEN],
            uuid: "2f9a4c3e-5b1d-4e0a-9c7f-6d8e1b2a3c4d".into(),
            subsystem: String::new(),
            hdr_offset: 0,
            csum: [0u8; CSUM_LEN],
        }
    }

    #[test]
    fn test_write_parse_and_verify() {
        let mut header = sample(HeaderCopy::Primary);
        let mut area = vec![0u8; DEFAULT_METADATA_SIZE as usize];
        area[4096..4098].copy_from_slice(b"{}");
        header.write_into(&mut area).unwrap();

        assert_eq!(&area[..6], b"LUKS\xba\xbe");
        assert_eq!(&area[6..8], &[0, 2]);

        let parsed = BinaryHeader::parse(&area).unwrap();
        assert_eq!(parsed, header);
        parsed.verify_checksum(&area).unwrap();
    }

    #[test]
    fn test_checksum_covers_json_area() {
        let mut header = sample(HeaderCopy::Secondary);
        let mut area = vec![0u8; DEFAULT_METADATA_SIZE as usize];
        header.write_into(&mut area).unwrap();
        area[5000] ^= 0xff;

        let parsed = BinaryHeader::parse(&area).unwrap();
        assert_eq!(parsed.copy, HeaderCopy::Secondary);
        assert!(matches!(parsed.verify_checksum(&area), Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_bad_magic() {
        let area = vec![0u8; 4096];
        assert!(matches!(BinaryHeader::parse(&area), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_version_one_is_unsupported() {
        let mut header = sample(HeaderCopy::Primary);
        let mut area = vec![0u8; DEFAULT_METADATA_SIZE as usize];
        header.write_into(&mut area).unwrap();
        area[7] = 1;

        assert!(matches!(
            BinaryHeader::parse(&area),
            Err(Error::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn test_label_too_long() {
        let mut header = sample(HeaderCopy::Primary);
        header.label = "x".repeat(LABEL_LEN);
        let mut area = vec![0u8; DEFAULT_METADATA_SIZE as usize];
        assert!(header.write_into(&mut area).is_err());
    }
}
