//! Client for the OpenThread Spinel NCP protocol, carried over
//! HDLC-Lite framing: byte-stuffed frames terminated by CRC-16/KERMIT,
//! with Spinel commands matched by a 4-bit transaction id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::crc::crc16_kermit;
use crate::error::{FlasherError, Result};
use crate::reactor::ByteAccumulator;
use crate::version::Version;

const HDLC_FLAG: u8 = 0x7E;
const HDLC_ESCAPE: u8 = 0x7D;
const HDLC_XON: u8 = 0x11;
const HDLC_XOFF: u8 = 0x13;
const HDLC_VENDOR: u8 = 0xF8;
const HDLC_ESCAPE_XOR: u8 = 0x20;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u32 = 3;
const ENTER_BOOTLOADER_DELAY: Duration = Duration::from_millis(500);

/// Command ids understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    Noop,
    Reset,
    PropValueGet,
    PropValueSet,
    PropValueIs,
}

impl CommandId {
    fn as_u32(self) -> u32 {
        match self {
            CommandId::Noop => 0,
            CommandId::Reset => 1,
            CommandId::PropValueGet => 2,
            CommandId::PropValueSet => 3,
            CommandId::PropValueIs => 6,
        }
    }

    fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0 => CommandId::Noop,
            1 => CommandId::Reset,
            2 => CommandId::PropValueGet,
            3 => CommandId::PropValueSet,
            6 => CommandId::PropValueIs,
            other => {
                return Err(FlasherError::InvalidFormat(format!(
                    "unknown Spinel command id {other}"
                )))
            }
        })
    }
}

/// Property ids this crate reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PropertyId {
    NcpVersion = 2,
}

/// Reset reasons accepted by `CMD_RESET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetReason {
    Platform = 1,
    Stack = 2,
    Bootloader = 3,
}

/// Encodes `value` as Spinel's packed, little-endian, 7-bits-per-byte
/// unsigned integer. Always emits at least one byte, even for zero.
pub fn encode_packed_uint21(value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut remaining = value;

    loop {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if remaining == 0 {
            break;
        }
    }

    out
}

/// Decodes a packed uint21 from the front of `buf`. Returns the value
/// and the number of bytes consumed.
pub fn decode_packed_uint21(buf: &[u8]) -> Result<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if i == 3 {
            break;
        }
    }
    Err(FlasherError::BufferTooShort)
}

/// Byte-stuffs `payload` and appends a trailing CRC-16/KERMIT, framed
/// between `HDLC_FLAG` bytes.
pub fn hdlc_serialize(payload: &[u8]) -> Vec<u8> {
    let crc = crc16_kermit(payload);
    let mut raw = payload.to_vec();
    raw.extend_from_slice(&crc.to_le_bytes());

    let mut out = vec![HDLC_FLAG];
    for byte in raw {
        if needs_escape(byte) {
            out.push(HDLC_ESCAPE);
            out.push(byte ^ HDLC_ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out.push(HDLC_FLAG);
    out
}

fn needs_escape(byte: u8) -> bool {
    matches!(
        byte,
        HDLC_FLAG | HDLC_ESCAPE | HDLC_XON | HDLC_XOFF | HDLC_VENDOR
    )
}

/// Un-escapes a complete, flag-delimited HDLC-Lite frame (the flags
/// themselves not included) and validates its trailing CRC-16/KERMIT.
pub fn hdlc_deserialize(framed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(framed.len());
    let mut iter = framed.iter().copied();

    while let Some(byte) = iter.next() {
        if byte == HDLC_ESCAPE {
            let next = iter
                .next()
                .ok_or_else(|| FlasherError::InvalidFormat("dangling HDLC escape".to_string()))?;
            out.push(next ^ HDLC_ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }

    if out.len() < 2 {
        return Err(FlasherError::InvalidFormat(
            "HDLC frame too short for a CRC".to_string(),
        ));
    }

    let split = out.len() - 2;
    let crc = u16::from_le_bytes(out[split..].try_into().unwrap());
    if crc16_kermit(&out[..split]) != crc {
        return Err(FlasherError::InvalidFormat(
            "HDLC CRC-16/KERMIT mismatch".to_string(),
        ));
    }

    out.truncate(split);
    Ok(out)
}

/// Finds and unframes the next complete HDLC-Lite frame in `buf`.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
    let start = match buf.iter().position(|&b| b == HDLC_FLAG) {
        Some(i) => i,
        None => return Ok(None),
    };

    // Drop any leading non-frame bytes together with repeated flags.
    let content_start = start + 1;
    let end_offset = match buf[content_start..].iter().position(|&b| b == HDLC_FLAG) {
        Some(i) => i,
        None => return Ok(None),
    };

    if end_offset == 0 {
        // Back-to-back flags (idle fill); consume one and retry.
        return Ok(Some((Vec::new(), content_start)));
    }

    let content_end = content_start + end_offset;
    let payload = hdlc_deserialize(&buf[content_start..content_end])?;
    Ok(Some((payload, content_end + 1)))
}

/// A Spinel frame: header byte plus packed command id and payload.
#[derive(Debug, Clone)]
pub struct SpinelFrame {
    pub transaction_id: u8,
    pub network_link_id: u8,
    pub command: CommandId,
    pub payload: Vec<u8>,
}

impl SpinelFrame {
    fn header_byte(&self) -> u8 {
        0b1000_0000 | ((self.network_link_id & 0x03) << 4) | (self.transaction_id & 0x0F)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![self.header_byte()];
        out.extend_from_slice(&encode_packed_uint21(self.command.as_u32()));
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let header = *raw
            .first()
            .ok_or_else(|| FlasherError::InvalidFormat("empty Spinel frame".to_string()))?;

        if header >> 6 != 0b10 {
            return Err(FlasherError::InvalidFormat(format!(
                "Spinel header flag bits must be 0b10, found 0b{:02b}",
                header >> 6
            )));
        }

        let (command_value, consumed) = decode_packed_uint21(&raw[1..])?;

        Ok(Self {
            transaction_id: header & 0x0F,
            network_link_id: (header >> 4) & 0x03,
            command: CommandId::from_u32(command_value)?,
            payload: raw[1 + consumed..].to_vec(),
        })
    }
}

/// A Spinel client over a streaming HDLC-Lite transport.
pub struct SpinelClient<T> {
    transport: T,
    transaction_id: u8,
    accumulator: ByteAccumulator,
    pending: Mutex<HashMap<u8, oneshot::Sender<SpinelFrame>>>,
}

impl<T> SpinelClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            transaction_id: 0,
            accumulator: ByteAccumulator::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Cycles through transaction ids 1..=14; 0 is reserved for frames
    /// that expect no response and 15 is out of the 4-bit header range.
    fn next_transaction_id(&mut self) -> u8 {
        self.transaction_id = (self.transaction_id % 14) + 1;
        self.transaction_id
    }

    async fn send_frame(
        &mut self,
        command: CommandId,
        payload: Vec<u8>,
        wait_response: bool,
    ) -> Result<Option<SpinelFrame>> {
        let transaction_id = if wait_response {
            self.next_transaction_id()
        } else {
            0
        };

        let frame = SpinelFrame {
            transaction_id,
            network_link_id: 0,
            command,
            payload,
        };
        let wire = hdlc_serialize(&frame.serialize());

        if !wait_response {
            self.transport.write_all(&wire).await?;
            self.transport.flush().await?;
            return Ok(None);
        }

        for attempt in 0..MAX_ATTEMPTS {
            self.transport.write_all(&wire).await?;
            self.transport.flush().await?;

            match self.wait_for_reply(transaction_id).await {
                Ok(reply) => return Ok(Some(reply)),
                Err(FlasherError::Timeout) if attempt + 1 < MAX_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }

        Err(FlasherError::Timeout)
    }

    async fn wait_for_reply(&mut self, transaction_id: u8) -> Result<SpinelFrame> {
        timeout(RESPONSE_TIMEOUT, async {
            loop {
                let mut byte = [0u8; 1];
                self.transport.read_exact(&mut byte).await?;
                self.accumulator.extend(&byte);

                loop {
                    match decode_frame(self.accumulator.peek()) {
                        Ok(Some((raw, consumed))) => {
                            self.accumulator.consume(consumed);
                            if raw.is_empty() {
                                continue;
                            }
                            match SpinelFrame::parse(&raw) {
                                Ok(frame) if frame.transaction_id == transaction_id => {
                                    return Ok(frame)
                                }
                                Ok(frame) => {
                                    log::debug!("discarding unsolicited Spinel frame: {frame:?}");
                                }
                                Err(e) => log::debug!("dropping malformed Spinel frame: {e}"),
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
        })
        .await
        .map_err(|_| FlasherError::Timeout)?
    }

    /// Probes for an NCP by requesting `NCP_VERSION`, parsing the
    /// version as the text before the first `;`.
    pub async fn probe(&mut self) -> Result<Version> {
        let reply = self
            .send_frame(
                CommandId::PropValueGet,
                encode_packed_uint21(PropertyId::NcpVersion as u32),
                true,
            )
            .await?
            .expect("wait_response=true always yields a frame");

        // The response payload carries the property id again, ahead of
        // the NUL-terminated string value.
        let (_, consumed) = decode_packed_uint21(&reply.payload)?;
        let text = String::from_utf8_lossy(&reply.payload[consumed..]).to_string();
        let text = text.trim_end_matches('\0');
        let version_text = text.split(';').next().unwrap_or(text).trim();
        Ok(Version::parse(version_text))
    }

    /// Sends `CMD_RESET(BOOTLOADER)` without waiting for a reply, then
    /// gives the device time to switch into the bootloader.
    pub async fn enter_bootloader(&mut self) -> Result<()> {
        self.send_frame(
            CommandId::Reset,
            vec![ResetReason::Bootloader as u8],
            false,
        )
        .await?;
        tokio::time::sleep(ENTER_BOOTLOADER_DELAY).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_uint21_zero_is_one_byte() {
        assert_eq!(encode_packed_uint21(0), vec![0x00]);
    }

    #[test]
    fn test_packed_uint21_roundtrip() {
        for value in [0u32, 1, 127, 128, 16384, 2_097_151] {
            let encoded = encode_packed_uint21(value);
            let (decoded, consumed) = decode_packed_uint21(&encoded).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_hdlc_roundtrip_with_escapes() {
        let payload = vec![0x01, HDLC_FLAG, 0x02, HDLC_ESCAPE, 0x03];
        let framed = hdlc_serialize(&payload);

        assert_eq!(*framed.first().unwrap(), HDLC_FLAG);
        assert_eq!(*framed.last().unwrap(), HDLC_FLAG);

        let (decoded, consumed) = decode_frame(&framed).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(consumed, framed.len());
    }

    #[test]
    fn test_spinel_frame_roundtrip() {
        let frame = SpinelFrame {
            transaction_id: 3,
            network_link_id: 0,
            command: CommandId::PropValueGet,
            payload: encode_packed_uint21(PropertyId::NcpVersion as u32),
        };

        let parsed = SpinelFrame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.transaction_id, 3);
        assert_eq!(parsed.command, CommandId::PropValueGet);
    }

    #[test]
    fn test_transaction_id_cycles_through_valid_range() {
        // next_transaction_id must never return 0 (reserved) or exceed
        // the 4-bit header field, and must visit every id in 1..=14.
        let mut client = SpinelClient::new(tokio_test_noop_transport());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..14 {
            let id = client.next_transaction_id();
            assert!((1..=14).contains(&id));
            seen.insert(id);
        }
        assert_eq!(seen, (1..=14).collect());
    }

    fn tokio_test_noop_transport() -> std::io::Cursor<Vec<u8>> {
        std::io::Cursor::new(Vec::new())
    }
}
