//! Gecko Bootloader Loadable (GBL) tag-stream codec.
//!
//! A GBL file is an ordered sequence of `(tag_id, value)` records: a
//! 32-bit little-endian tag id, a 32-bit little-endian value length, and
//! the value bytes. `HEADER` must be first and `END` must be last; the
//! final four bytes of `END`'s value are a CRC-32 over every preceding
//! byte of the file.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{FlasherError, Result};
use crate::metadata::NabuCasaMetadata;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The closed set of GBL tag ids this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TagId {
    Header = 0x03A6_17EB,
    AppInfo = 0xF40A_0AF4,
    SeUpgrade = 0x5EA6_17EB,
    Bootloader = 0xF509_09F5,
    ProgramData1 = 0xFE01_01FE,
    ProgramData2 = 0xFD03_03FD,
    ProgramDataLz4 = 0xFD05_05FD,
    ProgramDataLzma = 0xFD07_07FD,
    Metadata = 0xF608_08F6,
    Signature = 0xF70A_0AF7,
    End = 0xFC04_04FC,
}

impl TagId {
    fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0x03A6_17EB => TagId::Header,
            0xF40A_0AF4 => TagId::AppInfo,
            0x5EA6_17EB => TagId::SeUpgrade,
            0xF509_09F5 => TagId::Bootloader,
            0xFE01_01FE => TagId::ProgramData1,
            0xFD03_03FD => TagId::ProgramData2,
            0xFD05_05FD => TagId::ProgramDataLz4,
            0xFD07_07FD => TagId::ProgramDataLzma,
            0xF608_08F6 => TagId::Metadata,
            0xF70A_0AF7 => TagId::Signature,
            0xFC04_04FC => TagId::End,
            other => {
                return Err(FlasherError::InvalidFormat(format!(
                    "unknown GBL tag id 0x{other:08X}"
                )))
            }
        })
    }

    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A parsed GBL image: an ordered list of `(tag_id, value)` pairs.
#[derive(Debug, Clone)]
pub struct GblImage {
    pub tags: Vec<(TagId, Vec<u8>)>,
}

impl GblImage {
    /// Parses a GBL file, validating tag ordering and the trailing CRC-32.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut tags = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            if data.len() - offset < 8 {
                return Err(FlasherError::InvalidFormat(
                    "truncated GBL tag header".to_string(),
                ));
            }

            let tag_id_raw = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
            let length =
                u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize;
            let tag_id = TagId::from_u32(tag_id_raw)?;

            offset += 8;
            if data.len() - offset < length {
                return Err(FlasherError::InvalidFormat(
                    "truncated GBL tag value".to_string(),
                ));
            }

            let value = data[offset..offset + length].to_vec();
            offset += length;

            let is_first = tags.is_empty();
            if is_first && tag_id != TagId::Header {
                return Err(FlasherError::InvalidFormat(
                    "first GBL tag must be HEADER".to_string(),
                ));
            }

            let is_end = tag_id == TagId::End;
            tags.push((tag_id, value));

            if is_end {
                break;
            }
        }

        match tags.last() {
            Some((TagId::End, end_value)) => {
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
                        "GBL CRC-32 mismatch: expected 0x{expected:08X}, computed 0x{actual:08X}"
                    )));
                }
            }
            _ => {
                return Err(FlasherError::InvalidFormat(
                    "last GBL tag must be END".to_string(),
                ))
            }
        }

        Ok(Self { tags })
    }

    /// Re-serializes the image, recomputing the END tag's CRC-32 and
    /// padding the final length to a multiple of 4 with `0xFF`.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();

        for (tag_id, value) in &self.tags {
            out.extend_from_slice(&tag_id.as_u32().to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }

        if out.len() >= 4 {
            let crc_start = out.len() - 4;
            let crc = CRC32.checksum(&out[..crc_start]);
            out[crc_start..].copy_from_slice(&crc.to_le_bytes());
        }

        let remainder = out.len() % 4;
        if remainder != 0 {
            out.resize(out.len() + (4 - remainder), 0xFF);
        }

        out
    }

    /// Returns the first tag value matching `tag_id`.
    pub fn get_first_tag(&self, tag_id: TagId) -> Result<&[u8]> {
        self.tags
            .iter()
            .find(|(id, _)| *id == tag_id)
            .map(|(_, v)| v.as_slice())
            .ok_or_else(|| FlasherError::NotFound(format!("no tag with id {tag_id:?}")))
    }

    /// Parses and validates the embedded NabuCasa `METADATA` tag, if any.
    pub fn get_nabucasa_metadata(&self) -> Result<NabuCasaMetadata> {
        NabuCasaMetadata::from_json_bytes(self.get_first_tag(TagId::Metadata)?)
    }
}
