//! # Layer Error Types
//!
//! Authoring-time errors ([`CatalogError`], [`ConfigError`]) are returned
//! immediately and never merged silently. Runtime collaborator errors
//! ([`StreamingError`], [`EffectError`]) never cross a simulation step: the
//! streaming controller retries and then reports a failure event, the effect
//! driver logs and retries on the next update.

use std::path::PathBuf;

use stratum_mask::MaskError;
use thiserror::Error;

use crate::layer::{AssetRef, LayerId};

/// Errors raised while building the layer catalog.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    /// A layer with this identifier already exists.
    #[error("duplicate layer identifier: {0}")]
    DuplicateIdentifier(LayerId),

    /// The catalog was frozen when the world went live.
    #[error("layer catalog is frozen; mutation during simulation is not allowed")]
    CatalogFrozen,

    /// Activation threshold outside [0, 1].
    #[error("layer {layer} has activation threshold {threshold} outside [0, 1]")]
    InvalidThreshold {
        /// Offending layer.
        layer: LayerId,
        /// Authored threshold.
        threshold: f32,
    },
}

/// Result type for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors raised while loading authored configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {path:?}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TOML is malformed or does not match the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A tunable has an unusable value.
    #[error("invalid setting {setting}: {reason}")]
    InvalidSetting {
        /// Setting name.
        setting: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Layer set is inconsistent.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Mask source is unusable.
    #[error(transparent)]
    Mask(#[from] MaskError),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failure reported by the asset streaming collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamingError {
    /// The registry does not know the reference.
    #[error("asset not found in registry: {0}")]
    NotFound(AssetRef),

    /// The service refused or failed the request.
    #[error("streaming request failed: {0}")]
    RequestFailed(String),

    /// The service is temporarily unable to serve requests.
    #[error("streaming service unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by the effect runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EffectError {
    /// The template is not known to the runtime.
    #[error("unknown effect template: {0}")]
    UnknownTemplate(AssetRef),

    /// The runtime could not create an instance right now.
    #[error("effect spawn failed: {0}")]
    SpawnFailed(String),
}
