//! XMODEM-CRC sender: the 128-byte-block protocol the Gecko bootloader
//! uses to receive a firmware image.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::crc::crc16_ccitt_false;
use crate::error::{FlasherError, Result};

/// Block payload size.
pub const BLOCK_SIZE: usize = 128;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);
const START_BYTE_DRAIN: Duration = Duration::from_millis(50);

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;

/// A single 128-byte XMODEM-CRC block.
struct Packet {
    number: u8,
    payload: [u8; BLOCK_SIZE],
}

impl Packet {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + BLOCK_SIZE + 2);
        out.push(SOH);
        out.push(self.number);
        out.push(0xFF - self.number);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&crc16_ccitt_false(&self.payload).to_be_bytes());
        out
    }
}

/// Waits for the receiver's initial `C` byte, then discards any further
/// `C` bytes already sitting in the transport's buffer.
async fn wait_for_start<T>(transport: &mut T) -> Result<()>
where
    T: AsyncRead + Unpin,
{
    loop {
        let byte = transport.read_u8().await?;
        if byte == b'C' {
            break;
        }
    }

    while let Ok(Ok(b'C')) = timeout(START_BYTE_DRAIN, transport.read_u8()).await {}

    Ok(())
}

/// Sends `data` (one fully-formed wire chunk: a packet or `EOT`) and
/// retries on `NAK` up to `max_failures` consecutive times.
async fn send_with_retries<T>(transport: &mut T, data: &[u8], max_failures: u32) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut failures = 0;

    loop {
        transport.write_all(data).await?;
        transport.flush().await?;

        let response = timeout(RECEIVE_TIMEOUT, transport.read_u8())
            .await
            .map_err(|_| FlasherError::Timeout)??;

        match response {
            ACK => return Ok(()),
            NAK => {
                failures += 1;
                if failures > max_failures {
                    return Err(FlasherError::TooManyFailures);
                }
            }
            CAN => return Err(FlasherError::ReceiverCancelled),
            other => {
                return Err(FlasherError::InvalidFormat(format!(
                    "unexpected XMODEM response byte 0x{other:02X}"
                )))
            }
        }
    }
}

/// Sends `data` over `transport` using XMODEM-CRC with 128-byte blocks.
///
/// `data.len()` must be a multiple of [`BLOCK_SIZE`]. `progress` is
/// invoked with `(bytes_sent, total)`, once at `(0, total)` before the
/// first block and again after every successfully-acknowledged block.
pub async fn send<T>(
    transport: &mut T,
    data: &[u8],
    max_failures: u32,
    mut progress: impl FnMut(usize, usize),
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if data.len() % BLOCK_SIZE != 0 {
        return Err(FlasherError::InvalidArgument(format!(
            "data length {} is not a multiple of {BLOCK_SIZE}",
            data.len()
        )));
    }

    wait_for_start(transport).await?;
    progress(0, data.len());

    for (index, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
        let number = ((index + 1) & 0xFF) as u8;
        let mut payload = [0u8; BLOCK_SIZE];
        payload.copy_from_slice(chunk);

        let packet = Packet { number, payload };
        send_with_retries(transport, &packet.serialize(), max_failures).await?;

        progress((index + 1) * BLOCK_SIZE, data.len());
    }

    send_with_retries(transport, &[EOT], max_failures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// An in-memory transport scripted with a fixed reply sequence.
    struct ScriptedPort {
        replies: VecDeque<u8>,
        sent: Vec<u8>,
    }

    impl AsyncRead for ScriptedPort {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if let Some(b) = self.replies.pop_front() {
                buf.put_slice(&[b]);
            }
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for ScriptedPort {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.sent.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_happy_path_two_blocks() {
        let mut port = ScriptedPort {
            replies: VecDeque::from(vec![b'C', ACK, ACK, ACK]),
            sent: Vec::new(),
        };

        let data: Vec<u8> = (0..256u32).map(|i| (i % 256) as u8).collect();
        let mut progress_calls = Vec::new();

        send(&mut port, &data, 3, |sent, total| {
            progress_calls.push((sent, total));
        })
        .await
        .unwrap();

        assert_eq!(progress_calls, vec![(0, 256), (128, 256), (256, 256)]);

        // First packet: SOH, #1, ~#1, 128 bytes, 2-byte CRC
        assert_eq!(port.sent[0], SOH);
        assert_eq!(port.sent[1], 1);
        assert_eq!(port.sent[2], 0xFF - 1);
        let crc1 = crc16_ccitt_false(&data[0..128]);
        assert_eq!(&port.sent[3 + 128..3 + 128 + 2], &crc1.to_be_bytes());

        // Second packet begins right after the first
        let second_start = 3 + 128 + 2;
        assert_eq!(port.sent[second_start], SOH);
        assert_eq!(port.sent[second_start + 1], 2);

        // Final byte sent is EOT
        assert_eq!(*port.sent.last().unwrap(), EOT);
    }

    #[tokio::test]
    async fn test_block_number_wraps_at_256() {
        let mut replies = VecDeque::new();
        replies.push_back(b'C');
        for _ in 0..257 {
            replies.push_back(ACK);
        }

        let mut port = ScriptedPort {
            replies,
            sent: Vec::new(),
        };

        let data = vec![0u8; BLOCK_SIZE * 256];
        send(&mut port, &data, 3, |_, _| {}).await.unwrap();

        // Block 256 (index 255) wraps to packet number 0
        let block_256_offset = 255 * (3 + BLOCK_SIZE + 2);
        assert_eq!(port.sent[block_256_offset + 1], 0);
    }

    #[tokio::test]
    async fn test_can_cancels_transfer() {
        let mut port = ScriptedPort {
            replies: VecDeque::from(vec![b'C', CAN]),
            sent: Vec::new(),
        };

        let data = vec![0u8; BLOCK_SIZE];
        let err = send(&mut port, &data, 3, |_, _| {}).await.unwrap_err();
        assert!(matches!(err, FlasherError::ReceiverCancelled));
    }

    #[tokio::test]
    async fn test_rejects_unaligned_data() {
        let mut port = ScriptedPort {
            replies: VecDeque::new(),
            sent: Vec::new(),
        };

        let err = send(&mut port, &[0u8; 10], 3, |_, _| {}).await.unwrap_err();
        assert!(matches!(err, FlasherError::InvalidArgument(_)));
    }
}
