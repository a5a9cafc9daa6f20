// SPDX-License-Identifier: MIT OR Apache-2.0
//! Firmware flashing core for Silicon Labs RCP/NCP radio co-processor
//! modules: a Gecko standalone bootloader client, clients for the CPC
//! and Spinel application protocols used to detect and enter that
//! bootloader, and a GBL/EBL image codec carrying NabuCasa's firmware
//! metadata.
//!
//! The pieces are layered so each can be used on its own:
//!
//! 1. [`version`] and [`metadata`] give you a comparable [`Version`]
//!    type and a typed view over a GBL image's embedded metadata.
//! 2. [`gbl`] and [`ebl`] parse and re-serialize the firmware container
//!    formats themselves.
//! 3. [`cpc`], [`spinel`], and [`gecko_bootloader`] are protocol clients
//!    over any `AsyncRead + AsyncWrite` transport, including [`serial`]'s
//!    serial-port-or-socket abstraction.
//! 4. [`xmodem`] is the block transfer protocol the bootloader speaks.
//! 5. [`flasher`] ties the rest together: probe what is running, drive
//!    it into the bootloader, and decide whether an image is safe to
//!    upload before doing so.

#![deny(clippy::all)]

pub mod cpc;
pub mod crc;
pub mod ebl;
pub mod error;
pub mod ezsp;
pub mod flasher;
pub mod gbl;
pub mod gecko_bootloader;
pub mod gpio;
pub mod metadata;
pub mod reactor;
pub mod serial;
pub mod spinel;
pub mod version;
pub mod xmodem;

pub use error::{FlasherError, Result};
pub use flasher::{ApplicationType, FlashOptions, Flasher, RunningApp};
pub use metadata::{FwType, NabuCasaMetadata};
pub use version::Version;
