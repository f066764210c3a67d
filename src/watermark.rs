use crate::message::BuildIdentifier;
use std::collections::HashMap;
use thiserror::Error;

/// Read-only view over the persisted "last applied" identifier per watermark key.
///
/// Implementations are scoped to one namespace chosen at startup. Writes happen
/// only as a side effect of applying a bundle that carries the watermark resource.
pub trait WatermarkStore {
    fn read(&mut self, key: &str) -> Result<BuildIdentifier, WatermarkReadError>;
}

/// Failures reading a watermark. The reconciliation loop treats all of them as `0`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatermarkReadError {
    #[error("watermark {key} not found")]
    NotFound { key: String },
    #[error("watermark store unreachable: {0}")]
    Unreachable(String),
    #[error("watermark {key} holds unusable value {value:?}")]
    Invalid { key: String, value: String },
}

/// Fixed watermarks, used when running the loop without a cluster.
#[derive(Debug, Clone, Default)]
pub struct StaticWatermarks {
    values: HashMap<String, BuildIdentifier>,
}

impl StaticWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: BuildIdentifier) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: BuildIdentifier) {
        self.values.insert(key.into(), value);
    }
}

impl WatermarkStore for StaticWatermarks {
    fn read(&mut self, key: &str) -> Result<BuildIdentifier, WatermarkReadError> {
        self.values
            .get(key)
            .copied()
            .ok_or_else(|| WatermarkReadError::NotFound {
                key: key.to_string(),
            })
    }
}

/// Parses a stored watermark value.
pub fn parse_watermark(key: &str, raw: &str) -> Result<BuildIdentifier, WatermarkReadError> {
    raw.trim()
        .parse()
        .map_err(|_| WatermarkReadError::Invalid {
            key: key.to_string(),
            value: raw.to_string(),
        })
}
