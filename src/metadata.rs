//! `NabuCasaMetadata`: a typed view over the JSON payload of a GBL
//! `METADATA` tag.

use std::collections::HashMap;

use serde::Deserialize;
use strum_macros::{EnumIter, EnumString};

use crate::error::{FlasherError, Result};
use crate::version::Version;

/// Highest `metadata_version` this crate understands.
pub const SUPPORTED_METADATA_VERSION: u32 = 2;

/// The kind of firmware an image contains, as recorded in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FwType {
    ZigbeeNcp,
    OpenthreadRcp,
    ZwaveNcp,
    Bootloader,
    Multipan,
    Unknown,
}

/// Legacy `fw_type` strings used by older firmware images, remapped to
/// their modern [`FwType`] equivalent before enum lookup.
fn legacy_remap(raw: &str) -> Option<FwType> {
    Some(match raw {
        "ncp-uart-hw" | "ncp-uart-sw" => FwType::ZigbeeNcp,
        "rcp-uart-802154" => FwType::Multipan,
        "ot-rcp" => FwType::OpenthreadRcp,
        "z-wave" => FwType::ZwaveNcp,
        "gecko-bootloader" => FwType::Bootloader,
        _ => return None,
    })
}

fn parse_fw_type(raw: &str) -> FwType {
    if let Some(mapped) = legacy_remap(raw) {
        return mapped;
    }

    match raw {
        "zigbee_ncp" => FwType::ZigbeeNcp,
        "openthread_rcp" => FwType::OpenthreadRcp,
        "zwave_ncp" => FwType::ZwaveNcp,
        "bootloader" => FwType::Bootloader,
        "multipan" => FwType::Multipan,
        _ => FwType::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    metadata_version: u32,
    sdk_version: Option<String>,
    ezsp_version: Option<String>,
    ot_rcp_version: Option<String>,
    cpc_version: Option<String>,
    fw_type: Option<String>,
    fw_variant: Option<String>,
    baudrate: Option<u32>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

/// A typed view over a GBL image's embedded `METADATA` JSON record.
#[derive(Debug, Clone)]
pub struct NabuCasaMetadata {
    pub metadata_version: u32,
    pub sdk_version: Option<Version>,
    pub ezsp_version: Option<Version>,
    pub ot_rcp_version: Option<Version>,
    pub cpc_version: Option<Version>,
    pub fw_type: Option<FwType>,
    pub fw_variant: Option<String>,
    pub baudrate: Option<u32>,
    /// The original parsed JSON, preserved verbatim.
    pub raw: serde_json::Value,
}

impl NabuCasaMetadata {
    /// Parses a `NabuCasaMetadata` from the raw UTF-8 JSON bytes of a GBL
    /// `METADATA` tag value.
    pub fn from_json_bytes(data: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| FlasherError::InvalidFormat(format!("invalid metadata JSON: {e}")))?;

        let parsed: RawMetadata = serde_json::from_value(raw.clone())
            .map_err(|e| FlasherError::InvalidFormat(format!("invalid metadata JSON: {e}")))?;

        if parsed.metadata_version > SUPPORTED_METADATA_VERSION {
            return Err(FlasherError::InvalidFormat(format!(
                "unsupported metadata_version {} (supported up to {})",
                parsed.metadata_version, SUPPORTED_METADATA_VERSION
            )));
        }

        Ok(Self {
            metadata_version: parsed.metadata_version,
            sdk_version: parsed.sdk_version.as_deref().map(Version::parse),
            ezsp_version: parsed.ezsp_version.as_deref().map(Version::parse),
            ot_rcp_version: parsed.ot_rcp_version.as_deref().map(Version::parse),
            cpc_version: parsed.cpc_version.as_deref().map(Version::parse),
            fw_type: parsed.fw_type.as_deref().map(parse_fw_type),
            fw_variant: parsed.fw_variant,
            baudrate: parsed.baudrate,
            raw,
        })
    }

    /// Returns the version that best identifies the running application,
    /// in preference order: CPC, EZSP, OpenThread RCP, then SDK.
    #[must_use]
    pub fn public_version(&self) -> Option<&Version> {
        self.cpc_version
            .as_ref()
            .or(self.ezsp_version.as_ref())
            .or(self.ot_rcp_version.as_ref())
            .or(self.sdk_version.as_ref())
    }
}
