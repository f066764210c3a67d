use crate::applier::{ApplyError, Applier};
use crate::message::BuildIdentifier;
use crate::watermark::{parse_watermark, WatermarkReadError, WatermarkStore};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, info};

/// Thin wrapper over the `kubectl` binary. Uses whatever kubeconfig or
/// in-cluster service account `kubectl` itself resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kubectl {
    program: PathBuf,
}

impl Kubectl {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn run<I, S>(&self, args: I) -> io::Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(&self.program).args(args).output()
    }
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

/// Reads watermarks from ConfigMaps in one namespace.
///
/// The watermark key names the ConfigMap; the identifier is the entry stored
/// under `identifier_key` in its `data`.
#[derive(Debug, Clone)]
pub struct ConfigMapWatermarkStore {
    kubectl: Kubectl,
    namespace: String,
    identifier_key: String,
}

impl ConfigMapWatermarkStore {
    pub fn new(
        kubectl: Kubectl,
        namespace: impl Into<String>,
        identifier_key: impl Into<String>,
    ) -> Self {
        Self {
            kubectl,
            namespace: namespace.into(),
            identifier_key: identifier_key.into(),
        }
    }
}

impl WatermarkStore for ConfigMapWatermarkStore {
    fn read(&mut self, key: &str) -> Result<BuildIdentifier, WatermarkReadError> {
        debug!(
            config_map = key,
            namespace = %self.namespace,
            identifier_key = %self.identifier_key,
            "reading watermark"
        );
        let output = self
            .kubectl
            .run([
                "get",
                "configmap",
                key,
                "--namespace",
                self.namespace.as_str(),
                "--output",
                "json",
            ])
            .map_err(|err| {
                WatermarkReadError::Unreachable(format!(
                    "failed to launch {}: {err}",
                    self.kubectl.program().display()
                ))
            })?;
        if !output.status.success() {
            return Err(classify_kubectl_failure(
                key,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        watermark_from_config_map(key, &self.identifier_key, &String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Debug, Deserialize)]
struct ConfigMapDocument {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

/// Extracts the watermark from `kubectl get configmap -o json` output.
pub fn watermark_from_config_map(
    name: &str,
    identifier_key: &str,
    json: &str,
) -> Result<BuildIdentifier, WatermarkReadError> {
    let document: ConfigMapDocument = serde_json::from_str(json).map_err(|err| {
        WatermarkReadError::Unreachable(format!("unexpected configmap document for {name}: {err}"))
    })?;
    let raw = document
        .data
        .get(identifier_key)
        .ok_or_else(|| WatermarkReadError::NotFound {
            key: format!("{name}/{identifier_key}"),
        })?;
    parse_watermark(name, raw)
}

/// Maps a failed `kubectl get` onto the store error taxonomy.
pub fn classify_kubectl_failure(key: &str, stderr: &str) -> WatermarkReadError {
    if stderr.contains("NotFound") || stderr.contains("not found") {
        WatermarkReadError::NotFound {
            key: key.to_string(),
        }
    } else {
        WatermarkReadError::Unreachable(stderr.trim().to_string())
    }
}

/// Applies bundles with `kubectl apply` from a staged temporary file.
#[derive(Debug, Clone)]
pub struct KubectlApplier {
    kubectl: Kubectl,
    namespace: String,
}

impl KubectlApplier {
    pub fn new(kubectl: Kubectl, namespace: impl Into<String>) -> Self {
        Self {
            kubectl,
            namespace: namespace.into(),
        }
    }
}

impl Applier for KubectlApplier {
    fn apply(&mut self, manifest_bundle: &str) -> Result<(), ApplyError> {
        let mut staged = tempfile::Builder::new()
            .prefix("kube-pico-cd-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|err| ApplyError::Staging(err.to_string()))?;
        staged
            .write_all(manifest_bundle.as_bytes())
            .and_then(|()| staged.flush())
            .map_err(|err| ApplyError::Staging(err.to_string()))?;

        let namespace = self.namespace.as_str();
        let output = self
            .kubectl
            .run([
                OsStr::new("apply"),
                OsStr::new("--namespace"),
                OsStr::new(namespace),
                OsStr::new("--filename"),
                staged.path().as_os_str(),
            ])
            .map_err(|err| ApplyError::Launch {
                program: self.kubectl.program().display().to_string(),
                reason: err.to_string(),
            })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(namespace, "{line}");
        }
        if !output.status.success() {
            return Err(ApplyError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
