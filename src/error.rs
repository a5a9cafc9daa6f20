//! Error kinds shared by every codec and client in the crate.

use thiserror::Error;

/// Errors produced while framing, parsing, or orchestrating a flash.
#[derive(Debug, Error)]
pub enum FlasherError {
    /// An incremental parser needs more bytes before it can decode a frame.
    #[error("buffer too short to decode a frame")]
    BufferTooShort,

    /// A frame failed structural validation (bad flag, CRC, or length).
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),

    /// A request or probe exceeded its time budget.
    #[error("timed out waiting for a response")]
    Timeout,

    /// The XMODEM receiver cancelled the transfer with `CAN`.
    #[error("receiver cancelled the transfer")]
    ReceiverCancelled,

    /// A block exhausted its consecutive-retransmission budget.
    #[error("too many consecutive failures sending block")]
    TooManyFailures,

    /// The bootloader rejected the uploaded image.
    #[error("upload aborted by device: {0}")]
    UploadAborted(String),

    /// The bootloader has no application it can launch.
    #[error("bootloader has no firmware to run")]
    NoFirmware,

    /// Every probe method was exhausted without identifying a running app.
    #[error("could not identify a running application")]
    NoRunningApp,

    /// The firmware image type does not match the running image type.
    #[error("running image type does not match firmware image type: {0}")]
    CrossFlash(String),

    /// A caller passed an argument that violates the function's contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A tag, property, or file was looked up but does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An underlying I/O, serial-port, GPIO, or EZSP error.
    #[error(transparent)]
    External(#[from] std::io::Error),
}

impl From<tokio_serial::Error> for FlasherError {
    fn from(e: tokio_serial::Error) -> Self {
        FlasherError::External(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

impl From<tokio::time::error::Elapsed> for FlasherError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FlasherError::Timeout
    }
}

pub type Result<T> = std::result::Result<T, FlasherError>;
