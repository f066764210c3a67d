use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Separator appended after every manifest file in a bundle.
pub const DOCUMENT_SEPARATOR: &str = "\n---\n";

/// Manifests gathered from a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSet {
    pub paths: Vec<PathBuf>,
    pub bundle: String,
}

/// Concatenates every `*.yaml` file below `root`, in path order.
pub fn collect_manifests(root: &Path) -> Result<ManifestSet, ManifestError> {
    let pattern = root.join("**").join("*.yaml");
    let pattern = pattern.to_string_lossy();
    let mut paths = Vec::new();
    for entry in glob::glob(&pattern).map_err(|err| ManifestError::Pattern(err.to_string()))? {
        let path = entry.map_err(|err| ManifestError::Walk(err.to_string()))?;
        if path.is_file() {
            paths.push(path);
        }
    }
    if paths.is_empty() {
        let absolute = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        return Err(ManifestError::Empty {
            root: root.to_path_buf(),
            absolute,
        });
    }
    paths.sort();

    let mut bundle = String::new();
    for path in &paths {
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        bundle.push_str(&text);
        bundle.push_str(DOCUMENT_SEPARATOR);
    }
    Ok(ManifestSet { paths, bundle })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMapManifest<'a> {
    api_version: &'static str,
    kind: &'static str,
    metadata: ObjectMeta<'a>,
    data: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ObjectMeta<'a> {
    name: &'a str,
}

/// Renders the ConfigMap that records a build's metadata, watermark included.
pub fn build_info_config_map(
    name: &str,
    data: &BTreeMap<String, String>,
) -> Result<String, ManifestError> {
    let manifest = ConfigMapManifest {
        api_version: "v1",
        kind: "ConfigMap",
        metadata: ObjectMeta { name },
        data,
    };
    serde_yaml::to_string(&manifest).map_err(ManifestError::Render)
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no YAML files found in {root} ({absolute})")]
    Empty { root: PathBuf, absolute: PathBuf },
    #[error("invalid manifest pattern: {0}")]
    Pattern(String),
    #[error("failed to walk manifests: {0}")]
    Walk(String),
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render manifest: {0}")]
    Render(#[source] serde_yaml::Error),
}
