use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Listener image referenced by generated Deployments.
pub const DEFAULT_LISTENER_IMAGE: &str = "empoemai/kube-pico-cd:v0.0.1";
/// Label selecting the listener pods.
pub const APP_LABEL: &str = "kube-pico-cd";
/// Service-account annotation that makes EKS inject web identity credentials.
pub const IRSA_ROLE_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

/// Manifest that installs the listener into one namespace: a service account,
/// an `edit` role binding scoped to the namespace, and a single-replica Deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerManifest {
    namespace: String,
    queue_name: String,
    aws_region: String,
    image: String,
    role_arn: Option<String>,
}

impl ListenerManifest {
    pub fn new(
        namespace: impl Into<String>,
        queue_name: impl Into<String>,
        aws_region: impl Into<String>,
    ) -> Result<Self, BootstrapError> {
        let manifest = Self {
            namespace: namespace.into(),
            queue_name: queue_name.into(),
            aws_region: aws_region.into(),
            image: DEFAULT_LISTENER_IMAGE.into(),
            role_arn: None,
        };
        for (field, value) in [
            ("namespace", &manifest.namespace),
            ("queue name", &manifest.queue_name),
            ("aws region", &manifest.aws_region),
        ] {
            if value.trim().is_empty() {
                return Err(BootstrapError::Empty(field));
            }
        }
        Ok(manifest)
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Annotates the service account so the pod assumes `role_arn` through IRSA.
    pub fn with_role_arn(mut self, role_arn: impl Into<String>) -> Self {
        self.role_arn = Some(role_arn.into()).filter(|arn| !arn.trim().is_empty());
        self
    }

    pub fn service_account_name(&self) -> String {
        format!("kube-pico-cd-{}-edit", self.namespace)
    }

    pub fn deployment_name(&self) -> String {
        format!("kube-pico-cd-{}", self.namespace)
    }

    /// File name used when the caller does not choose one.
    pub fn default_file_name(&self) -> PathBuf {
        PathBuf::from(format!("kube-pico-cd-{}.yaml", self.namespace))
    }

    pub fn to_value(&self) -> Value {
        let namespace = &self.namespace;
        let service_account = self.service_account_name();
        let mut service_account_metadata = json!({ "name": service_account, "namespace": namespace });
        if let Some(role_arn) = &self.role_arn {
            let mut annotations = Map::new();
            annotations.insert(IRSA_ROLE_ANNOTATION.to_string(), Value::String(role_arn.clone()));
            service_account_metadata["annotations"] = Value::Object(annotations);
        }
        json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {
                    "apiVersion": "v1",
                    "kind": "ServiceAccount",
                    "metadata": service_account_metadata,
                },
                {
                    "apiVersion": "rbac.authorization.k8s.io/v1",
                    "kind": "RoleBinding",
                    "metadata": {
                        "name": format!("{namespace}-namespace-edit"),
                        "namespace": namespace,
                    },
                    "subjects": [
                        { "kind": "ServiceAccount", "name": service_account, "namespace": namespace },
                    ],
                    "roleRef": {
                        "kind": "ClusterRole",
                        "name": "edit",
                        "apiGroup": "rbac.authorization.k8s.io",
                    },
                },
                {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": { "name": self.deployment_name(), "namespace": namespace },
                    "spec": {
                        "replicas": 1,
                        "selector": { "matchLabels": { "app": APP_LABEL } },
                        "template": {
                            "metadata": { "labels": { "app": APP_LABEL } },
                            "spec": {
                                "serviceAccountName": service_account,
                                "containers": [
                                    {
                                        "name": "kube-pico-cd-container",
                                        "image": self.image,
                                        "env": [
                                            { "name": "KUBE_PICO_CD_DEPLOY_QUEUE_NAME", "value": self.queue_name },
                                            { "name": "AWS_DEFAULT_REGION", "value": self.aws_region },
                                        ],
                                    },
                                ],
                            },
                        },
                    },
                },
            ],
        })
    }

    pub fn render(&self) -> Result<String, BootstrapError> {
        serde_yaml::to_string(&self.to_value()).map_err(BootstrapError::Render)
    }

    /// Writes the manifest to `path`, or to [`Self::default_file_name`].
    pub fn write(&self, path: Option<&Path>) -> Result<PathBuf, BootstrapError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_file_name());
        let rendered = self.render()?;
        fs::write(&path, rendered).map_err(|source| BootstrapError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("failed to render manifest: {0}")]
    Render(#[source] serde_yaml::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
