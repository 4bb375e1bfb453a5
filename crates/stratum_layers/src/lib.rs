//! # STRATUM Layers
//!
//! Turns image-encoded masks into stable decisions about which assets and
//! effects exist where.
//!
//! ## Data Flow
//!
//! ```text
//! LayerCatalog + MaskStore ──► LayerResolver::resolve(coord) ──► ResolvedSample
//!                                                                   │
//!                    ┌──────────────────────────────────────────────┤
//!                    ▼                                              ▼
//!   StreamingController::tick(cell)                   EffectDriver::update(cell)
//!   (load/unload requests, hysteresis)                (spawn / set_parameter / destroy)
//!
//! RegistryValidator: offline, catalog + AssetRegistry only
//! ```
//!
//! ## Runtime Rules
//!
//! - The catalog is frozen before the world goes live
//! - Resolution is a pure function of (catalog, masks, coordinate)
//! - Streaming completions arrive through a queue drained once per step
//! - Nothing on the step returns an error; failures degrade to "inactive"

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod catalog;
pub mod config;
pub mod effects;
pub mod error;
pub mod layer;
pub mod registry;
pub mod resolver;
pub mod streaming;
pub mod validator;

pub use catalog::LayerCatalog;
pub use config::WorldLayersConfig;
pub use effects::{EffectDriver, EffectStats, EffectsConfig};
pub use error::{CatalogError, CatalogResult, ConfigError, ConfigResult, EffectError, StreamingError};
pub use layer::{
    AssetBinding, AssetKind, AssetRef, BlendMode, EffectBinding, LayerDefinition, LayerId, ParameterMapping,
};
pub use registry::{
    AssetDescriptor, AssetManifest, AssetRegistry, AssetStreamingService, CompletionSender, EffectInstanceHandle,
    EffectRuntime, InMemoryRegistry, ManifestEntry, RequestId, StreamHandle, StreamingCompletion, StreamingOutcome,
};
pub use resolver::{LayerResolver, ResolvedEntry, ResolvedSample};
pub use streaming::{
    LayerState, StreamingConfig, StreamingController, StreamingEvent, StreamingFailure, StreamingOperation,
    StreamingStats,
};
pub use validator::{validate, ValidationIssue, ValidationReport};
