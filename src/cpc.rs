//! Client for the Silicon Labs CPC (Co-Processor Communication) UART
//! transport: frame codec, the unnumbered sub-layer used to probe and
//! reset a secondary, and request/response matching by sequence number.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::crc::crc16_ccitt_false;
use crate::error::{FlasherError, Result};
use crate::reactor::ByteAccumulator;
use crate::version::Version;

const FLAG: u8 = 0x14;
const HEADER_LEN: usize = 5;
const HEADER_CRC_LEN: usize = 2;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u32 = 3;

const FRAME_TYPE_UNNUMBERED: u8 = 0b11;

/// Property ids this crate exchanges with the CPC unnumbered layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PropertyId {
    SecondaryCpcVersion = 0x06,
    SecondaryAppVersion = 0x07,
    BootloaderRebootMode = 0x12,
}

/// `BOOTLOADER_REBOOT_MODE` values; only `Bootloader` is ever sent.
const REBOOT_MODE_BOOTLOADER: u8 = 0x01;

const COMMAND_PROP_VALUE_GET: u8 = 0x01;
const COMMAND_PROP_VALUE_SET: u8 = 0x02;
const COMMAND_PROP_VALUE_IS: u8 = 0x03;
const COMMAND_RESET: u8 = 0x04;

/// One CPC transport frame: a 5-byte header (flag, endpoint, 16-bit LE
/// length — payload length plus 2, control), its own CRC-16, a
/// payload, and the payload's CRC-16. Both CRCs are little-endian.
#[derive(Debug, Clone)]
pub struct CpcFrame {
    pub endpoint: u8,
    pub control: u8,
    pub payload: Vec<u8>,
}

impl CpcFrame {
    pub fn serialize(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.push(FLAG);
        header.push(self.endpoint);
        header.extend_from_slice(&((self.payload.len() + 2) as u16).to_le_bytes());
        header.push(self.control);

        let header_crc = crc16_ccitt_false(&header);

        let mut out = header;
        out.extend_from_slice(&header_crc.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&crc16_ccitt_false(&self.payload).to_le_bytes());
        out
    }

    /// Attempts to decode one frame from the front of `buf`. Returns
    /// `Ok(None)` if more bytes are needed. A header-CRC failure is
    /// reported as an error so the caller can resynchronize onto the
    /// next `FLAG` byte rather than silently misinterpreting garbage
    /// as a frame length.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != FLAG {
            return Err(FlasherError::InvalidFormat(format!(
                "expected CPC flag byte 0x{FLAG:02X}, found 0x{:02X}",
                buf[0]
            )));
        }
        if buf.len() < HEADER_LEN + HEADER_CRC_LEN {
            return Ok(None);
        }

        let header = &buf[..HEADER_LEN];
        let header_crc = u16::from_le_bytes(buf[HEADER_LEN..HEADER_LEN + HEADER_CRC_LEN].try_into().unwrap());
        if crc16_ccitt_false(header) != header_crc {
            return Err(FlasherError::InvalidFormat(
                "CPC header CRC mismatch".to_string(),
            ));
        }

        let endpoint = header[1];
        let length = (u16::from_le_bytes([header[2], header[3]]) as usize)
            .checked_sub(2)
            .ok_or_else(|| FlasherError::InvalidFormat("CPC length field underflows".to_string()))?;
        let control = header[4];

        let payload_start = HEADER_LEN + HEADER_CRC_LEN;
        let payload_end = payload_start + length;
        let total_len = payload_end + HEADER_CRC_LEN;

        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = buf[payload_start..payload_end].to_vec();
        let payload_crc =
            u16::from_le_bytes(buf[payload_end..total_len].try_into().unwrap());

        if crc16_ccitt_false(&payload) != payload_crc {
            return Err(FlasherError::InvalidFormat(
                "CPC payload CRC mismatch".to_string(),
            ));
        }

        Ok(Some((
            CpcFrame {
                endpoint,
                control,
                payload,
            },
            total_len,
        )))
    }

    fn frame_type(&self) -> u8 {
        self.control >> 6
    }

    /// Bits 5-0 of `control` for an UNNUMBERED frame: this core only
    /// ever sends and expects `POLL_FINAL`.
    fn unnumbered_sub_type(&self) -> u8 {
        self.control & 0x3F
    }

    /// The command-sequence byte embedded as the second payload byte
    /// of every unnumbered command, used to match a reply to its
    /// request (the CPC control byte's own bits carry the frame's
    /// sub-type, not a request id).
    fn command_seq(&self) -> Option<u8> {
        self.payload.get(1).copied()
    }
}

/// The command layer carried inside an unnumbered frame's payload.
#[derive(Debug, Clone)]
pub enum UnnumberedCommand {
    PropertyGet { property: u8 },
    PropertySet { property: u8, value: Vec<u8> },
    PropertyIs { property: u8, value: Vec<u8> },
    Reset,
}

impl UnnumberedCommand {
    fn command_id(&self) -> u8 {
        match self {
            UnnumberedCommand::PropertyGet { .. } => COMMAND_PROP_VALUE_GET,
            UnnumberedCommand::PropertySet { .. } => COMMAND_PROP_VALUE_SET,
            UnnumberedCommand::PropertyIs { .. } => COMMAND_PROP_VALUE_IS,
            UnnumberedCommand::Reset => COMMAND_RESET,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            UnnumberedCommand::PropertyGet { property } => vec![*property],
            UnnumberedCommand::PropertySet { property, value }
            | UnnumberedCommand::PropertyIs { property, value } => {
                let mut body = vec![*property];
                body.extend_from_slice(value);
                body
            }
            UnnumberedCommand::Reset => Vec::new(),
        }
    }

    fn decode(command_id: u8, body: &[u8]) -> Result<Self> {
        Ok(match command_id {
            COMMAND_PROP_VALUE_GET => UnnumberedCommand::PropertyGet {
                property: *body.first().ok_or_else(too_short)?,
            },
            COMMAND_PROP_VALUE_SET => UnnumberedCommand::PropertySet {
                property: *body.first().ok_or_else(too_short)?,
                value: body.get(1..).unwrap_or_default().to_vec(),
            },
            COMMAND_PROP_VALUE_IS => UnnumberedCommand::PropertyIs {
                property: *body.first().ok_or_else(too_short)?,
                value: body.get(1..).unwrap_or_default().to_vec(),
            },
            COMMAND_RESET => UnnumberedCommand::Reset,
            other => {
                return Err(FlasherError::InvalidFormat(format!(
                    "unknown CPC unnumbered command 0x{other:02X}"
                )))
            }
        })
    }
}

fn too_short() -> FlasherError {
    FlasherError::InvalidFormat("truncated CPC unnumbered command body".to_string())
}

/// The only unnumbered sub-type this core sends or expects.
const UNNUMBERED_SUB_TYPE_POLL_FINAL: u8 = 0x00;

fn build_unnumbered_frame(endpoint: u8, seq: u8, command: &UnnumberedCommand) -> CpcFrame {
    let body = command.encode_body();

    let mut payload = vec![command.command_id(), seq];
    payload.extend_from_slice(&(body.len() as u16).to_le_bytes());
    payload.extend_from_slice(&body);

    CpcFrame {
        endpoint,
        control: (FRAME_TYPE_UNNUMBERED << 6) | UNNUMBERED_SUB_TYPE_POLL_FINAL,
        payload,
    }
}

/// A CPC client driving the unnumbered sub-layer over a streaming
/// transport: property get/set, and the reset command used to enter
/// the bootloader.
pub struct CpcClient<T> {
    transport: T,
    command_seq: u8,
    accumulator: ByteAccumulator,
    pending: Mutex<HashMap<u8, oneshot::Sender<CpcFrame>>>,
}

impl<T> CpcClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            command_seq: 0,
            accumulator: ByteAccumulator::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn next_seq(&mut self) -> u8 {
        self.command_seq = self.command_seq.wrapping_add(1) & 0x3F;
        self.command_seq
    }

    /// Sends an unnumbered command and waits for its reply, retrying on
    /// timeout up to `MAX_ATTEMPTS` times.
    async fn send_unnumbered(&mut self, endpoint: u8, command: UnnumberedCommand) -> Result<CpcFrame> {
        let seq = self.next_seq();
        let frame = build_unnumbered_frame(endpoint, seq, &command);
        let wire = frame.serialize();

        for attempt in 0..MAX_ATTEMPTS {
            self.transport.write_all(&wire).await?;
            self.transport.flush().await?;

            match self.wait_for_reply(seq).await {
                Ok(reply) => return Ok(reply),
                Err(FlasherError::Timeout) if attempt + 1 < MAX_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }

        Err(FlasherError::Timeout)
    }

    /// Reads and decodes frames until one matches `seq`, discarding and
    /// logging anything unsolicited, and resynchronizing on decode
    /// errors by dropping the first buffered byte.
    async fn wait_for_reply(&mut self, seq: u8) -> Result<CpcFrame> {
        timeout(RESPONSE_TIMEOUT, async {
            loop {
                let mut byte = [0u8; 1];
                self.transport.read_exact(&mut byte).await?;
                self.accumulator.extend(&byte);

                loop {
                    match CpcFrame::decode(self.buffered()) {
                        Ok(Some((frame, consumed))) => {
                            self.consume(consumed);
                            if frame.frame_type() == FRAME_TYPE_UNNUMBERED
                                && frame.command_seq() == Some(seq)
                            {
                                return Ok(frame);
                            }
                            log::debug!("discarding unsolicited CPC frame: {frame:?}");
                        }
                        Ok(None) => break,
                        Err(_) => {
                            self.accumulator.skip_one();
                            break;
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| FlasherError::Timeout)?
    }

    fn buffered(&self) -> &[u8] {
        // `ByteAccumulator` does not expose its buffer directly; we only
        // ever need to peek it from within this module.
        self.accumulator.peek()
    }

    fn consume(&mut self, n: usize) {
        self.accumulator.consume(n);
    }

    async fn get_property(&mut self, property: PropertyId) -> Result<Vec<u8>> {
        let reply = self
            .send_unnumbered(0, UnnumberedCommand::PropertyGet { property: property as u8 })
            .await?;

        let command = UnnumberedCommand::decode(reply.payload[0], &reply.payload[4..])?;
        match command {
            UnnumberedCommand::PropertyIs { value, .. } => Ok(value),
            other => Err(FlasherError::InvalidFormat(format!(
                "unexpected reply to PROP_VALUE_GET: {other:?}"
            ))),
        }
    }

    /// Reads the secondary's application version string via
    /// `PROP_VALUE_GET(SecondaryAppVersion)`: a NUL-terminated ASCII
    /// string.
    pub async fn get_secondary_version(&mut self) -> Result<Version> {
        let value = self.get_property(PropertyId::SecondaryAppVersion).await?;
        let text = String::from_utf8(value).map_err(|e| {
            FlasherError::InvalidFormat(format!("non-UTF8 CPC version reply: {e}"))
        })?;
        Ok(Version::parse(text.trim_end_matches('\0')))
    }

    /// Probes for a CPC secondary via `PROP_VALUE_GET(SecondaryCpcVersion)`:
    /// three little-endian `u32`s (major, minor, patch).
    pub async fn probe(&mut self) -> Result<Version> {
        let value = self.get_property(PropertyId::SecondaryCpcVersion).await?;
        if value.len() < 12 {
            return Err(FlasherError::InvalidFormat(
                "truncated SecondaryCpcVersion reply".to_string(),
            ));
        }

        let major = u32::from_le_bytes(value[0..4].try_into().unwrap());
        let minor = u32::from_le_bytes(value[4..8].try_into().unwrap());
        let patch = u32::from_le_bytes(value[8..12].try_into().unwrap());

        Ok(Version::parse(&format!("{major}.{minor}.{patch}")))
    }

    /// Sets `BOOTLOADER_REBOOT_MODE` to `BOOTLOADER`, then sends the
    /// CPC-layer reset command without waiting for a reply (the
    /// secondary does not acknowledge before rebooting).
    pub async fn enter_bootloader(&mut self) -> Result<()> {
        let seq = self.next_seq();
        let set_mode = build_unnumbered_frame(
            0,
            seq,
            &UnnumberedCommand::PropertySet {
                property: PropertyId::BootloaderRebootMode as u8,
                value: vec![REBOOT_MODE_BOOTLOADER],
            },
        );
        self.transport.write_all(&set_mode.serialize()).await?;
        self.transport.flush().await?;

        let seq = self.next_seq();
        let reset = build_unnumbered_frame(0, seq, &UnnumberedCommand::Reset);
        self.transport.write_all(&reset.serialize()).await?;
        self.transport.flush().await?;

        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = CpcFrame {
            endpoint: 0,
            control: (FRAME_TYPE_UNNUMBERED << 6) | 5,
            payload: vec![COMMAND_PROP_VALUE_GET, 5, 0x07],
        };

        let wire = frame.serialize();
        let (decoded, consumed) = CpcFrame::decode(&wire).unwrap().unwrap();

        assert_eq!(consumed, wire.len());
        assert_eq!(decoded.endpoint, 0);
        assert_eq!(decoded.frame_type(), FRAME_TYPE_UNNUMBERED);
        assert_eq!(decoded.command_seq(), Some(5));
        assert_eq!(decoded.payload, vec![COMMAND_PROP_VALUE_GET, 5, 0x07]);
    }

    #[test]
    fn test_decode_needs_more_bytes() {
        let frame = CpcFrame {
            endpoint: 0,
            control: 0,
            payload: vec![1, 2, 3],
        };
        let wire = frame.serialize();
        assert!(CpcFrame::decode(&wire[..wire.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_bad_header_crc() {
        let frame = CpcFrame {
            endpoint: 0,
            control: 0,
            payload: vec![1, 2, 3],
        };
        let mut wire = frame.serialize();
        wire[1] ^= 0xFF;
        assert!(CpcFrame::decode(&wire).is_err());
    }

    #[test]
    fn test_build_unnumbered_frame_includes_length_prefix() {
        let frame = build_unnumbered_frame(
            0,
            5,
            &UnnumberedCommand::PropertyGet {
                property: PropertyId::SecondaryAppVersion as u8,
            },
        );

        // command id, seq, 16-bit LE length, then the length-prefixed body.
        assert_eq!(frame.payload[0], COMMAND_PROP_VALUE_GET);
        assert_eq!(frame.payload[1], 5);
        assert_eq!(u16::from_le_bytes([frame.payload[2], frame.payload[3]]), 1);
        assert_eq!(frame.payload[4], PropertyId::SecondaryAppVersion as u8);
    }

    #[test]
    fn test_unnumbered_command_roundtrip() {
        let command = UnnumberedCommand::PropertyIs {
            property: 0x07,
            value: b"7.4.4.0 GA\0".to_vec(),
        };
        let id = command.command_id();
        let body = command.encode_body();

        let decoded = UnnumberedCommand::decode(id, &body).unwrap();
        assert!(matches!(decoded, UnnumberedCommand::PropertyIs { property, .. } if property == 0x07));
    }
}
