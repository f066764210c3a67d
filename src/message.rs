use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Monotonic per-environment build version carried by every deployment message.
pub type BuildIdentifier = u64;

/// Default metadata key holding the build identifier.
pub const DEFAULT_IDENTIFIER_KEY: &str = "BUILD_TIMESTAMP";
/// Legacy camel-case identifier key still written by the publisher.
pub const LEGACY_IDENTIFIER_KEY: &str = "buildTimestamp";
/// Metadata key naming the ConfigMap that records the watermark.
pub const CONFIG_MAP_NAME_KEY: &str = "CONFIG_MAP_NAME";

/// Unit transported on the deploy queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentMessage {
    pub identifier: BuildIdentifier,
    pub metadata: BTreeMap<String, String>,
    pub manifest_bundle: String,
}

impl DeploymentMessage {
    /// Parses a queue body, reading the identifier from `identifier_key`.
    pub fn parse(body: &str, identifier_key: &str) -> Result<Self, MessageError> {
        let wire: WireMessage = serde_json::from_str(body).map_err(MessageError::Body)?;
        let data = wire.data.ok_or(MessageError::MissingData)?;
        let raw = data
            .get(identifier_key)
            .ok_or_else(|| MessageError::MissingIdentifier {
                key: identifier_key.to_string(),
            })?;
        let identifier = parse_identifier(raw).ok_or_else(|| MessageError::InvalidIdentifier {
            key: identifier_key.to_string(),
            value: metadata_text(raw),
        })?;
        let manifest_bundle = wire.manifests.ok_or(MessageError::MissingManifests)?;
        let metadata = data
            .iter()
            .map(|(key, value)| (key.clone(), metadata_text(value)))
            .collect();
        Ok(Self {
            identifier,
            metadata,
            manifest_bundle,
        })
    }

    /// Watermark resource named by the message, if any.
    pub fn config_map_name(&self) -> Option<&str> {
        self.metadata
            .get(CONFIG_MAP_NAME_KEY)
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
    }

    /// Serializes the message into its queue body.
    pub fn to_body(&self) -> Result<String, MessageError> {
        let data = self
            .metadata
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        let wire = WireMessage {
            data: Some(data),
            manifests: Some(self.manifest_bundle.clone()),
        };
        serde_json::to_string(&wire).map_err(MessageError::Body)
    }
}

/// Reasons a queue body cannot be turned into a [`DeploymentMessage`].
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message body is not valid JSON: {0}")]
    Body(#[source] serde_json::Error),
    #[error("message has no data section")]
    MissingData,
    #[error("message data does not contain {key}")]
    MissingIdentifier { key: String },
    #[error("identifier {key}={value} is not a non-negative integer")]
    InvalidIdentifier { key: String, value: String },
    #[error("message has no manifests")]
    MissingManifests,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    manifests: Option<String>,
}

fn parse_identifier(raw: &Value) -> Option<BuildIdentifier> {
    match raw {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

fn metadata_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
