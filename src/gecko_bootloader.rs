//! Client for the Silicon Labs Gecko standalone bootloader's serial menu.
//!
//! The bootloader prints a banner and a numbered menu over the same
//! UART the application uses. This module recognizes that banner,
//! drives the menu by number, and uploads a firmware image over
//! XMODEM-CRC.

use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{FlasherError, Result};
use crate::version::Version;
use crate::xmodem;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const RUN_APPLICATION_DELAY: Duration = Duration::from_millis(500);
const NO_FIRMWARE_WINDOW: Duration = Duration::from_millis(100);

const UPLOAD_GBL: u8 = b'1';
const RUN_FIRMWARE: u8 = b'2';
const EBL_INFO: u8 = b'3';

fn menu_regex() -> Regex {
    Regex::new(
        r"(?:Gecko Bootloader|[A-Za-z0-9_\-]+ Serial) Bootloader v(\d+\.\d+\.\d+)\r\n1\. upload (?:gbl|ebl)\r\n2\. run\r\n3\. ebl info\r\nBL > ",
    )
    .expect("static regex is valid")
}

fn upload_status_regex() -> Regex {
    Regex::new(r"Serial upload (complete|aborted)").expect("static regex is valid")
}

/// The banner the bootloader prints on entry, giving its own version.
#[derive(Debug, Clone)]
pub struct BootloaderBanner {
    pub version: Version,
}

/// Reads single bytes from `transport` until the bootloader's startup
/// banner is seen, or `PROBE_TIMEOUT` elapses. Returns `NoFirmware` if
/// the banner never appears because an application is already running.
pub async fn probe<T>(transport: &mut T) -> Result<BootloaderBanner>
where
    T: AsyncRead + Unpin,
{
    let menu_re = menu_regex();
    let mut seen = String::new();

    let outcome = timeout(PROBE_TIMEOUT, async {
        loop {
            let byte = transport.read_u8().await?;
            seen.push(byte as char);

            if let Some(captures) = menu_re.captures(&seen) {
                let version = Version::parse(&captures[1]);
                return Ok(BootloaderBanner { version });
            }

            if seen.len() > 4096 {
                seen.drain(..seen.len() - 4096);
            }
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(FlasherError::Timeout),
    }
}

/// Sends the `EBL_INFO` menu option and returns the raw bytes the
/// bootloader prints in response, up to a short idle gap.
pub async fn ebl_info<T>(transport: &mut T) -> Result<Vec<u8>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport.write_all(&[EBL_INFO]).await?;
    transport.flush().await?;

    let mut out = Vec::new();
    loop {
        match timeout(Duration::from_millis(250), transport.read_u8()).await {
            Ok(Ok(byte)) => out.push(byte),
            _ => break,
        }
    }

    Ok(out)
}

/// Selects "run firmware" from the menu. If no application is present,
/// the bootloader reprints its own banner instead of launching
/// anything; we detect that by racing a short re-probe window.
pub async fn run_firmware<T>(transport: &mut T) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport.write_all(&[RUN_FIRMWARE]).await?;
    transport.flush().await?;

    match timeout(NO_FIRMWARE_WINDOW, probe(transport)).await {
        Ok(Ok(_banner)) => Err(FlasherError::NoFirmware),
        _ => {
            tokio::time::sleep(RUN_APPLICATION_DELAY).await;
            Ok(())
        }
    }
}

/// Selects "upload gbl" from the menu and sends `image` over
/// XMODEM-CRC, then waits for the bootloader's completion message.
pub async fn upload_firmware<T>(
    transport: &mut T,
    image: &[u8],
    max_failures: u32,
    progress: impl FnMut(usize, usize),
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport.write_all(&[UPLOAD_GBL]).await?;
    transport.flush().await?;

    xmodem::send(transport, image, max_failures, progress).await?;

    let status_re = upload_status_regex();
    let mut seen = String::new();

    let status = timeout(Duration::from_secs(30), async {
        let aborted = loop {
            let byte = transport.read_u8().await?;
            seen.push(byte as char);

            if let Some(captures) = status_re.captures(&seen) {
                break &captures[1] == "aborted";
            }

            if seen.len() > 4096 {
                seen.drain(..seen.len() - 4096);
            }
        };

        if !aborted {
            return Ok(Ok(()));
        }

        // The status line is followed by a `<message>` up to the next
        // `\r\n` or NUL; read it before reporting the abort.
        seen.clear();
        let message = loop {
            let byte = transport.read_u8().await?;
            if byte == 0 || (byte == b'\n' && seen.ends_with('\r')) {
                seen.pop();
                break seen.clone();
            }
            seen.push(byte as char);

            if seen.len() > 4096 {
                break seen.clone();
            }
        };

        Ok(Err(FlasherError::UploadAborted(message)))
    })
    .await
    .unwrap_or(Err(FlasherError::Timeout))?;

    // The menu normally reprints itself unprompted; force it with
    // `ebl_info` if it hasn't shown up after half a second.
    if timeout(Duration::from_millis(500), probe(transport))
        .await
        .is_err()
    {
        ebl_info(transport).await?;
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct ScriptedPort {
        replies: VecDeque<u8>,
        sent: Vec<u8>,
    }

    impl ScriptedPort {
        fn from_bytes(bytes: &[u8]) -> Self {
            Self {
                replies: bytes.iter().copied().collect(),
                sent: Vec::new(),
            }
        }
    }

    impl AsyncRead for ScriptedPort {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if let Some(b) = self.replies.pop_front() {
                buf.put_slice(&[b]);
            } else {
                return Poll::Pending;
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
    async fn test_probe_recognizes_gecko_banner() {
        let banner =
            b"\r\nGecko Bootloader v1.11.0\r\n1. upload gbl\r\n2. run\r\n3. ebl info\r\nBL > ";
        let mut port = ScriptedPort::from_bytes(banner);

        let result = probe(&mut port).await.unwrap();
        assert_eq!(result.version.as_str(), "1.11.0");
    }

    #[tokio::test]
    async fn test_probe_recognizes_vendor_serial_banner() {
        let banner =
            b"Yellow Serial Bootloader v2.4.1\r\n1. upload ebl\r\n2. run\r\n3. ebl info\r\nBL > ";
        let mut port = ScriptedPort::from_bytes(banner);

        let result = probe(&mut port).await.unwrap();
        assert_eq!(result.version.as_str(), "2.4.1");
    }

    #[tokio::test]
    async fn test_run_firmware_detects_no_firmware() {
        // Selecting "run" just reprints the banner: no application.
        let banner = b"Gecko Bootloader v1.11.0\r\n1. upload gbl\r\n2. run\r\n3. ebl info\r\nBL > ";
        let mut port = ScriptedPort::from_bytes(banner);

        let err = run_firmware(&mut port).await.unwrap_err();
        assert!(matches!(err, FlasherError::NoFirmware));
    }

    #[tokio::test]
    async fn test_upload_firmware_records_aborted_message() {
        let mut wire = Vec::new();
        // XMODEM's own exchange: start byte, one block ACKed, EOT ACKed.
        wire.push(b'C');
        wire.push(0x06); // ACK the single data block
        wire.push(0x06); // ACK the EOT
        wire.extend_from_slice(b"\r\nSerial upload aborted\r\nbad crc\r\n");

        let mut port = ScriptedPort::from_bytes(&wire);

        let err = upload_firmware(&mut port, &[0xAA; 128], 0, |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, FlasherError::UploadAborted(ref msg) if msg == "bad crc"));
    }
}
