//! The EmberZNet EZSP interface this crate needs from a running NCP
//! application. EZSP itself — the full ASH/SPI transport, frame IDs,
//! and command set — lives in its own protocol stack; this trait is
//! only the narrow surface the flasher drives a probe, a version
//! check, and a bootloader launch through.

use crate::error::Result;
use crate::version::Version;

/// Board identification reported by `GET_MFG_TOKEN`/`GET_EUI64`-style
/// EZSP commands.
#[derive(Debug, Clone)]
pub struct BoardInfo {
    pub eui64: [u8; 8],
    pub manufacturer: Option<String>,
    pub board_name: Option<String>,
}

/// An EZSP session against a running EmberZNet NCP application.
pub trait EzspClient {
    /// Reads the NCP's EZSP protocol and stack version.
    async fn get_version(&mut self) -> Result<Version>;

    /// Reads manufacturing-token board identification.
    async fn get_board_info(&mut self) -> Result<BoardInfo>;

    /// Issues the EZSP command that reboots the NCP into its
    /// standalone bootloader.
    async fn launch_standalone_bootloader(&mut self) -> Result<()>;

    /// Whether this NCP build permits writing a custom EUI64.
    async fn can_write_custom_eui64(&mut self) -> Result<bool>;

    /// Reads a manufacturing configuration value by token id.
    async fn get_configuration_value(&mut self, id: u8) -> Result<u16>;
}
