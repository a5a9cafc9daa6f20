//! Serial transport handling: opening a local TTY via `tokio-serial`,
//! or a `socket://host:port` TCP passthrough, behind one `AsyncRead +
//! AsyncWrite` type every protocol client can share.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_serial::SerialPort;

use crate::error::{FlasherError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const SONOFF_RESET_HOLD: Duration = Duration::from_millis(100);
const SONOFF_RESET_SETTLE: Duration = Duration::from_millis(500);

/// Where to connect: a local serial device, or a `socket://host:port`
/// TCP passthrough (e.g. an ESPHome or ser2net bridge).
#[derive(Debug, Clone)]
pub enum PortSpec {
    Serial { path: String, baudrate: u32 },
    Socket { host: String, port: u16 },
}

impl PortSpec {
    /// Parses a port argument, recognizing the `socket://host:port`
    /// scheme and treating anything else as a local serial device path.
    pub fn parse(path: &str, baudrate: u32) -> Result<Self> {
        if let Some(rest) = path.strip_prefix("socket://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                FlasherError::InvalidArgument(format!("malformed socket URL: {path}"))
            })?;
            let port: u16 = port.parse().map_err(|_| {
                FlasherError::InvalidArgument(format!("malformed socket port: {port}"))
            })?;
            return Ok(PortSpec::Socket {
                host: host.to_string(),
                port,
            });
        }

        Ok(PortSpec::Serial {
            path: path.to_string(),
            baudrate,
        })
    }
}

/// A transport to a radio co-processor: either a local serial port or
/// a TCP socket passthrough. Both sides implement `AsyncRead +
/// AsyncWrite`, so every protocol client is generic over this type
/// without needing to know which one it got.
pub enum Transport {
    Serial(tokio_serial::SerialStream),
    Socket(TcpStream),
}

impl Transport {
    /// Opens `spec`, with hardware flow control enabled if requested.
    /// Serial opens are synchronous; socket opens race a one-second
    /// connect timeout.
    pub async fn open(spec: &PortSpec, flow_control: bool) -> Result<Self> {
        match spec {
            PortSpec::Serial { path, baudrate } => {
                let flow = if flow_control {
                    tokio_serial::FlowControl::Hardware
                } else {
                    tokio_serial::FlowControl::None
                };

                let port = tokio_serial::new(path, *baudrate)
                    .flow_control(flow)
                    .open_native_async()?;

                Ok(Transport::Serial(port))
            }
            PortSpec::Socket { host, port } => {
                let stream =
                    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), *port)))
                        .await
                        .map_err(|_| FlasherError::Timeout)??;
                stream.set_nodelay(true)?;
                Ok(Transport::Socket(stream))
            }
        }
    }

    /// The DTR/RTS edge sequence Sonoff Zigbee adapters use in place of
    /// a dedicated reset line: DTR off + RTS on, hold, then DTR on +
    /// RTS off, settle, then DTR off. A no-op for socket transports.
    pub async fn sonoff_reset_sequence(&mut self) -> Result<()> {
        if let Transport::Serial(port) = self {
            port.write_data_terminal_ready(false)?;
            port.write_request_to_send(true)?;
            tokio::time::sleep(SONOFF_RESET_HOLD).await;
            port.write_data_terminal_ready(true)?;
            port.write_request_to_send(false)?;
            tokio::time::sleep(SONOFF_RESET_SETTLE).await;
            port.write_data_terminal_ready(false)?;
        }
        Ok(())
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Serial(port) => Pin::new(port).poll_read(cx, buf),
            Transport::Socket(sock) => Pin::new(sock).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Serial(port) => Pin::new(port).poll_write(cx, data),
            Transport::Socket(sock) => Pin::new(sock).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Serial(port) => Pin::new(port).poll_flush(cx),
            Transport::Socket(sock) => Pin::new(sock).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Serial(port) => Pin::new(port).poll_shutdown(cx),
            Transport::Socket(sock) => Pin::new(sock).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_serial_path() {
        let spec = PortSpec::parse("/dev/ttyUSB0", 115200).unwrap();
        assert!(matches!(
            spec,
            PortSpec::Serial { path, baudrate }
                if path == "/dev/ttyUSB0" && baudrate == 115200
        ));
    }

    #[test]
    fn test_parse_socket_url() {
        let spec = PortSpec::parse("socket://192.168.1.5:6638", 115200).unwrap();
        assert!(matches!(
            spec,
            PortSpec::Socket { host, port }
                if host == "192.168.1.5" && port == 6638
        ));
    }

    #[test]
    fn test_parse_malformed_socket_url() {
        assert!(PortSpec::parse("socket://no-port-here", 115200).is_err());
    }
}
