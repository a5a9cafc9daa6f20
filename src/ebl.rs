//! Extended Bootloader (EBL) tag-stream codec.
//!
//! Same shape as the GBL codec, but tag ids and lengths are 16-bit
//! big-endian, and the final file length is padded to a multiple of 64
//! bytes of `0xFF`. EBL images carry no NabuCasa metadata tag.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{FlasherError, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const EBL_TAG_HEADER: u16 = 0x0000;
const EBL_TAG_END: u16 = 0xFC04;

/// An EBL tag id. `Header` and `End` are structurally significant; every
/// other id is passed through opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EblTagId {
    Header,
    End,
    Other(u16),
}

impl EblTagId {
    fn from_u16(value: u16) -> Self {
        match value {
            EBL_TAG_HEADER => EblTagId::Header,
            EBL_TAG_END => EblTagId::End,
            other => EblTagId::Other(other),
        }
    }

    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            EblTagId::Header => EBL_TAG_HEADER,
            EblTagId::End => EBL_TAG_END,
            EblTagId::Other(v) => v,
        }
    }
}

/// A parsed EBL image: an ordered list of `(tag_id, value)` pairs.
#[derive(Debug, Clone)]
pub struct EblImage {
    pub tags: Vec<(EblTagId, Vec<u8>)>,
}

impl EblImage {
    /// Parses an EBL file, validating tag ordering and the trailing CRC-32.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut tags = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            if data.len() - offset < 4 {
                return Err(FlasherError::InvalidFormat(
                    "truncated EBL tag header".to_string(),
                ));
            }

            let tag_id_raw = u16::from_be_bytes(data[offset..offset + 2].try_into().unwrap());
            let length =
                u16::from_be_bytes(data[offset + 2..offset + 4].try_into().unwrap()) as usize;
            let tag_id = EblTagId::from_u16(tag_id_raw);

            offset += 4;
            if data.len() - offset < length {
                return Err(FlasherError::InvalidFormat(
                    "truncated EBL tag value".to_string(),
                ));
            }

            let value = data[offset..offset + length].to_vec();
            offset += length;

            if tags.is_empty() && tag_id != EblTagId::Header {
                return Err(FlasherError::InvalidFormat(
                    "first EBL tag must be HEADER".to_string(),
                ));
            }

            let is_end = tag_id == EblTagId::End;
            tags.push((tag_id, value));

            if is_end {
                break;
            }
        }

        match tags.last() {
            Some((EblTagId::End, end_value)) => {
                if end_value.len() < 4 {
                    return Err(FlasherError::InvalidFormat(
                        "END tag value too short to hold a CRC-32".to_string(),
                    ));
                }

                let crc_offset = offset - 4;
                let expected = u32::from_le_bytes(data[crc_offset..offset].try_into().unwrap());
                let actual = CRC32.checksum(&data[..crc_offset]);

                if expected != actual {
                    return Err(FlasherError::InvalidFormat(format!(
                        "EBL CRC-32 mismatch: expected 0x{expected:08X}, computed 0x{actual:08X}"
                    )));
                }
            }
            _ => {
                return Err(FlasherError::InvalidFormat(
                    "last EBL tag must be END".to_string(),
                ))
            }
        }

        Ok(Self { tags })
    }

    /// Re-serializes the image, recomputing the END tag's CRC-32 and
    /// padding the final length to a multiple of 64 with `0xFF`.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();

        for (tag_id, value) in &self.tags {
            out.extend_from_slice(&tag_id.as_u16().to_be_bytes());
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value);
        }

        if out.len() >= 4 {
            let crc_start = out.len() - 4;
            let crc = CRC32.checksum(&out[..crc_start]);
            out[crc_start..].copy_from_slice(&crc.to_le_bytes());
        }

        let remainder = out.len() % 64;
        if remainder != 0 {
            out.resize(out.len() + (64 - remainder), 0xFF);
        }

        out
    }

    /// EBL images have no NabuCasa metadata tag; always `NotFound`.
    pub fn get_nabucasa_metadata(&self) -> Result<crate::metadata::NabuCasaMetadata> {
        Err(FlasherError::NotFound(
            "EBL images do not carry NabuCasa metadata".to_string(),
        ))
    }
}
