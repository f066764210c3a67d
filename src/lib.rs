//! Queue-driven continuous deployment: a publisher packages manifests with a
//! monotonic build identifier, and an in-cluster listener applies every build
//! that is not older than the watermark recorded in the cluster.

pub mod app;
pub mod applier;
pub mod bootstrap;
pub mod config;
pub mod kubernetes;
pub mod logging;
pub mod manifests;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod reconcile;
pub mod watermark;

pub use applier::{ApplyError, Applier};
pub use bootstrap::{BootstrapError, ListenerManifest, DEFAULT_LISTENER_IMAGE, IRSA_ROLE_ANNOTATION};
pub use config::{
    service_account_namespace, ConfigError, ListenerConfig, LogFormat, PublisherConfig, Settings,
    ENV_PREFIX,
};
pub use kubernetes::{
    classify_kubectl_failure, watermark_from_config_map, ConfigMapWatermarkStore, Kubectl,
    KubectlApplier,
};
pub use logging::{env_filter, init_tracing, LoggingError};
pub use manifests::{
    build_info_config_map, collect_manifests, ManifestError, ManifestSet, DOCUMENT_SEPARATOR,
};
pub use message::{
    BuildIdentifier, DeploymentMessage, MessageError, CONFIG_MAP_NAME_KEY, DEFAULT_IDENTIFIER_KEY,
    LEGACY_IDENTIFIER_KEY,
};
pub use publisher::{
    current_identifier, BuildProvenance, PublishError, PublishReceipt, Publisher, UNDEFINED,
};
pub use queue::{
    CredentialProvider, CredentialSource, Credentials, InMemoryBroker, InMemoryQueue, QueueError,
    QueueMessage, QueuePort, QueueResolver, QueueSink, SqsClient, SqsQueue,
};
pub use reconcile::{
    decide, ApplyFailurePolicy, IdleThrottle, MessageOutcome, PollReport, ReconcileStats,
    ReconciliationDecision, ReconciliationLoop,
};
pub use watermark::{parse_watermark, StaticWatermarks, WatermarkReadError, WatermarkStore};
