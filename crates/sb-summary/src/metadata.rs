//! Metadata attached to every scalar summary.

use sb_serialize::{LegacySummaryMetadata, PluginData, SerializeError, SummaryMetadata};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const PLUGIN_NAME: &str = "scalars";

/// Version of [`ScalarPluginData`] written by this crate. Readers accept
/// newer versions and warn.
pub const PROTO_VERSION: i32 = 0;

/// Plugin-specific content stored in `PluginData::content`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScalarPluginData {
    #[serde(default)]
    pub version: i32,
}

pub fn create_summary_metadata(
    display_name: Option<&str>,
    description: Option<&str>,
) -> Result<SummaryMetadata, SerializeError> {
    let content = serde_json::to_vec(&ScalarPluginData {
        version: PROTO_VERSION,
    })
    .map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("scalar plugin data encoding failed: {error}"),
    })?;

    Ok(SummaryMetadata {
        plugin_data: PluginData {
            plugin_name: PLUGIN_NAME.to_string(),
            content,
        },
        display_name: display_name.unwrap_or_default().to_string(),
        summary_description: description.unwrap_or_default().to_string(),
    })
}

pub fn parse_plugin_data(content: &[u8]) -> Result<ScalarPluginData, SerializeError> {
    if content.is_empty() {
        return Ok(ScalarPluginData::default());
    }
    let data: ScalarPluginData =
        serde_json::from_slice(content).map_err(|error| SerializeError::InvalidJson {
            diagnostic: format!("scalar plugin data: {error}"),
        })?;
    if data.version > PROTO_VERSION {
        warn!(
            version = data.version,
            supported = PROTO_VERSION,
            "unknown scalar plugin data version; reading as the latest known version"
        );
    }
    Ok(data)
}

/// Re-reads current metadata as the legacy representation, through its
/// serialized bytes.
pub fn to_legacy_metadata(
    metadata: &SummaryMetadata,
) -> Result<LegacySummaryMetadata, SerializeError> {
    LegacySummaryMetadata::from_bytes(&metadata.to_bytes()?)
}
