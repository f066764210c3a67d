use crate::config::PublisherConfig;
use crate::manifests::{build_info_config_map, ManifestError, DOCUMENT_SEPARATOR};
use crate::message::{
    BuildIdentifier, DeploymentMessage, MessageError, CONFIG_MAP_NAME_KEY, LEGACY_IDENTIFIER_KEY,
};
use crate::queue::{QueueError, QueueResolver, QueueSink};
use chrono::Utc;
use std::collections::BTreeMap;
use std::env;
use thiserror::Error;
use tracing::info;

/// Value recorded for provenance fields the build environment does not set.
pub const UNDEFINED: &str = "undefined";

const PROVENANCE_VARS: &[&str] = &["BRANCH_NAME", "COMMIT_HASH", "TAG_NAME", "GITHUB_RUN_NUMBER"];

/// CI provenance attached to every published bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildProvenance {
    fields: BTreeMap<String, String>,
}

impl BuildProvenance {
    /// Reads `BRANCH_NAME`, `COMMIT_HASH`, `TAG_NAME` and `GITHUB_RUN_NUMBER`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fields = PROVENANCE_VARS
            .iter()
            .map(|name| {
                let value = lookup(name)
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| UNDEFINED.to_string());
                (name.to_string(), value)
            })
            .collect();
        Self { fields }
    }

    pub fn into_metadata(self) -> BTreeMap<String, String> {
        self.fields
    }
}

/// Current UNIX time in seconds, the default build identifier.
pub fn current_identifier() -> BuildIdentifier {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

/// Confirmation of an enqueued deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub queue: String,
    pub message_id: String,
    pub message: DeploymentMessage,
}

/// Packages manifests into deployment messages and enqueues them.
///
/// There is no read-before-write and no dedup here; consumers handle
/// duplicates through the watermark comparison.
pub struct Publisher<R> {
    resolver: R,
    config: PublisherConfig,
}

impl<R: QueueResolver> Publisher<R> {
    pub fn new(resolver: R, config: PublisherConfig) -> Self {
        Self { resolver, config }
    }

    /// Fixes the identifier, then finalizes the bundle with the build-info ConfigMap.
    pub fn prepare(
        &self,
        manifests: &str,
        identifier: Option<BuildIdentifier>,
        metadata: BTreeMap<String, String>,
    ) -> Result<DeploymentMessage, PublishError> {
        let identifier = identifier.unwrap_or_else(current_identifier);
        let mut metadata = metadata;
        metadata.insert(self.config.identifier_key.clone(), identifier.to_string());
        metadata.insert(LEGACY_IDENTIFIER_KEY.to_string(), identifier.to_string());
        metadata.insert(
            CONFIG_MAP_NAME_KEY.to_string(),
            self.config.config_map_name.clone(),
        );

        let config_map = build_info_config_map(&self.config.config_map_name, &metadata)?;
        let mut manifest_bundle = manifests.to_string();
        if !manifest_bundle.is_empty() && !manifest_bundle.ends_with(DOCUMENT_SEPARATOR) {
            manifest_bundle.push_str(DOCUMENT_SEPARATOR);
        }
        manifest_bundle.push_str(&config_map);

        Ok(DeploymentMessage {
            identifier,
            metadata,
            manifest_bundle,
        })
    }

    /// Publishes one message to `target_queue`.
    pub fn publish(
        &mut self,
        target_queue: &str,
        manifests: &str,
        identifier: Option<BuildIdentifier>,
        metadata: BTreeMap<String, String>,
    ) -> Result<PublishReceipt, PublishError> {
        if target_queue.trim().is_empty() {
            return Err(PublishError::Configuration(
                "deploy queue name is neither given nor configured".into(),
            ));
        }
        let message = self.prepare(manifests, identifier, metadata)?;
        let body = message.to_body()?;

        let mut queue = self.resolver.open(target_queue).map_err(|err| match err {
            QueueError::NotFound { .. } | QueueError::Configuration(_) => {
                PublishError::Configuration(err.to_string())
            }
            other => PublishError::Transport(other),
        })?;
        let message_id = queue.send(&body).map_err(PublishError::Transport)?;
        info!(
            identifier = message.identifier,
            queue = target_queue,
            message_id = %message_id,
            "sent deployment message"
        );
        Ok(PublishReceipt {
            queue: target_queue.to_string(),
            message_id,
            message,
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot resolve deploy queue: {0}")]
    Configuration(String),
    #[error("failed to send deployment message: {0}")]
    Transport(#[source] QueueError),
    #[error(transparent)]
    Encode(#[from] MessageError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}
