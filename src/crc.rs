//! CRC-16 variants and padding helpers shared by the CPC, XMODEM, and
//! Spinel/HDLC-Lite codecs.

use crc::{Crc, CRC_16_X_25, CRC_16_XMODEM};

use crate::error::{FlasherError, Result};

/// poly 0x1021, init 0x0000, no reflection, no xor-out. The `crc` crate
/// catalogs this parameter set as `CRC_16_XMODEM`.
const CRC16_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// poly 0x1021, init 0xFFFF, reflected in and out, xor-out 0xFFFF. The
/// `crc` crate catalogs this parameter set as `CRC_16_X_25`; the HDLC-Lite
/// framing layer here calls it "kermit".
const CRC16_KERMIT: Crc<u16> = Crc::<u16>::new(&CRC_16_X_25);

/// Used by the CPC transport frame header/payload checksums and by the
/// XMODEM-CRC packet checksum.
#[must_use]
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    CRC16_CCITT_FALSE.checksum(data)
}

/// Used by the HDLC-Lite framing layer that carries Spinel frames.
#[must_use]
pub fn crc16_kermit(data: &[u8]) -> u16 {
    CRC16_KERMIT.checksum(data)
}

/// Pads `data` with `fill` until its length is a multiple of `n`.
///
/// Returns `data` unchanged if it is already aligned. `fill` must be a
/// single byte; anything else is an `InvalidArgument`.
pub fn pad_to_multiple(data: &[u8], n: usize, fill: &[u8]) -> Result<Vec<u8>> {
    if fill.len() != 1 {
        return Err(FlasherError::InvalidArgument(
            "fill must be a single byte".to_string(),
        ));
    }

    let mut out = data.to_vec();
    let remainder = out.len() % n;

    if remainder != 0 {
        out.resize(out.len() + (n - remainder), fill[0]);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case(b"", 0x0000)]
    #[case(b"foobar", 0x147B)]
    pub fn test_crc16_kermit_vectors(#[case] data: &[u8], #[case] expected: u16) {
        assert_eq!(crc16_kermit(data), expected);
    }

    #[test]
    fn test_crc16_kermit_hex_vector() {
        let data = hex_decode("fa9b51b9f253e3bd");
        assert_eq!(crc16_kermit(&data), 0x6782);
    }

    fn hex_decode(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_pad_to_multiple_already_aligned() {
        let data = vec![1, 2, 3, 4];
        let out = pad_to_multiple(&data, 4, &[0xFF]).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_pad_to_multiple_pads() {
        let data = vec![1, 2, 3];
        let out = pad_to_multiple(&data, 4, &[0xFF]).unwrap();
        assert_eq!(out, vec![1, 2, 3, 0xFF]);
    }

    #[test]
    fn test_pad_to_multiple_is_idempotent_prefix() {
        let data = vec![1u8; 130];
        let out = pad_to_multiple(&data, 128, &[0xFF]).unwrap();
        assert_eq!(out.len() % 128, 0);
        assert_eq!(&out[..130], &data[..]);
    }

    #[test]
    fn test_pad_to_multiple_rejects_multi_byte_fill() {
        assert!(pad_to_multiple(&[1, 2], 4, &[0xFF, 0xFF]).is_err());
    }
}
