//! # Host Collaborators
//!
//! Interfaces the layer core consumes from the host engine. Their internals
//! are the host's business.
//!
//! | Collaborator              | Used by                         |
//! |---------------------------|---------------------------------|
//! | [`AssetRegistry`]         | validator, streaming controller |
//! | [`AssetStreamingService`] | streaming controller            |
//! | [`EffectRuntime`]         | effect driver                   |
//!
//! Streaming requests complete asynchronously: the service answers through
//! the [`CompletionSender`] handed to it with each request, and the
//! controller drains those answers on a later step.

use std::collections::BTreeMap;
use std::path::Path;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use stratum_shared::Vec2;

use crate::error::{ConfigError, ConfigResult, EffectError, StreamingError};
use crate::layer::{AssetKind, AssetRef};

// ============================================================================
// ASSET REGISTRY
// ============================================================================

/// What the registry knows about a reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetDescriptor {
    /// The resolved reference.
    pub reference: AssetRef,
    /// Its kind.
    pub kind: AssetKind,
}

/// Looks up asset references.
pub trait AssetRegistry: Send + Sync {
    /// Descriptor for `reference`, or `None` if it does not exist.
    fn resolve(&self, reference: &AssetRef) -> Option<AssetDescriptor>;
}

/// One `[[asset]]` record of a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Asset reference.
    pub reference: AssetRef,
    /// Asset kind.
    pub kind: AssetKind,
}

/// Asset manifest document.
///
/// ```toml
/// [[asset]]
/// reference = "/Game/Foliage/Pine"
/// kind = "static_mesh"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    /// Known assets.
    #[serde(default, rename = "asset")]
    pub assets: Vec<ManifestEntry>,
}

/// Registry backed by a map, typically loaded from an [`AssetManifest`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryRegistry {
    assets: BTreeMap<AssetRef, AssetKind>,
}

impl InMemoryRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every manifest entry. Later duplicates win.
    #[must_use]
    pub fn from_manifest(manifest: &AssetManifest) -> Self {
        let mut registry = Self::new();
        for entry in &manifest.assets {
            registry.insert(entry.reference.clone(), entry.kind);
        }
        registry
    }

    /// Parses a manifest TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let manifest: AssetManifest = toml::from_str(text)?;
        Ok(Self::from_manifest(&manifest))
    }

    /// Reads a manifest TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Adds or replaces an asset.
    pub fn insert(&mut self, reference: impl Into<AssetRef>, kind: AssetKind) {
        self.assets.insert(reference.into(), kind);
    }

    /// Number of assets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// True if no assets are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl AssetRegistry for InMemoryRegistry {
    fn resolve(&self, reference: &AssetRef) -> Option<AssetDescriptor> {
        self.assets.get(reference).map(|&kind| AssetDescriptor {
            reference: reference.clone(),
            kind,
        })
    }
}

// ============================================================================
// ASSET STREAMING
// ============================================================================

/// Identifies one load or unload request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// Service-side handle of a loaded asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamHandle(pub u64);

/// How a streaming request ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingOutcome {
    /// Load finished; the asset is resident under this handle.
    Loaded(StreamHandle),
    /// Unload finished.
    Unloaded,
    /// The request failed.
    Failed(StreamingError),
}

/// Completion of a streaming request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingCompletion {
    /// The request being answered.
    pub request: RequestId,
    /// Its outcome.
    pub outcome: StreamingOutcome,
}

/// Reply channel for streaming requests. Cheap to clone, usable from any thread.
#[derive(Clone, Debug)]
pub struct CompletionSender {
    tx: Sender<StreamingCompletion>,
}

impl CompletionSender {
    pub(crate) fn new(tx: Sender<StreamingCompletion>) -> Self {
        Self { tx }
    }

    /// Reports the outcome of `request`.
    ///
    /// Returns false if the controller is gone; the answer is then moot.
    pub fn complete(&self, request: RequestId, outcome: StreamingOutcome) -> bool {
        self.tx.send(StreamingCompletion { request, outcome }).is_ok()
    }
}

/// Loads and unloads assets in the background.
pub trait AssetStreamingService: Send + Sync {
    /// Starts loading `asset`. Answer through `reply`, possibly much later.
    fn request_load(&self, request: RequestId, asset: &AssetDescriptor, reply: CompletionSender);

    /// Starts unloading a resident asset. Answer through `reply`.
    fn request_unload(&self, request: RequestId, handle: StreamHandle, reply: CompletionSender);

    /// Best-effort cancellation. A late answer to a cancelled request is
    /// still accepted and handled by the controller.
    fn cancel(&self, request: RequestId);
}

// ============================================================================
// EFFECT RUNTIME
// ============================================================================

/// Handle of a live effect instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EffectInstanceHandle(pub u64);

/// Particle/effect runtime of the host.
pub trait EffectRuntime: Send + Sync {
    /// Creates an instance of `template` at world position `position`.
    ///
    /// # Errors
    ///
    /// [`EffectError`] if the instance cannot be created.
    fn spawn(&self, template: &AssetRef, position: Vec2) -> Result<EffectInstanceHandle, EffectError>;

    /// Sets a named float parameter on a live instance.
    fn set_parameter(&self, instance: EffectInstanceHandle, name: &str, value: f32);

    /// Destroys a live instance.
    fn destroy(&self, instance: EffectInstanceHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_registry() {
        let registry = InMemoryRegistry::from_toml_str(
            r#"
            [[asset]]
            reference = "/Game/Pine"
            kind = "static_mesh"

            [[asset]]
            reference = "/Game/FX/Dust"
            kind = "effect"
            "#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        let pine = registry.resolve(&AssetRef::new("/Game/Pine")).unwrap();
        assert_eq!(pine.kind, AssetKind::StaticMesh);
        assert!(registry.resolve(&AssetRef::new("/Game/Oak")).is_none());
    }

    #[test]
    fn test_completion_sender_after_drop() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sender = CompletionSender::new(tx);
        assert!(sender.complete(RequestId(1), StreamingOutcome::Unloaded));
        assert_eq!(rx.try_recv().unwrap().request, RequestId(1));
        drop(rx);
        assert!(!sender.complete(RequestId(2), StreamingOutcome::Unloaded));
    }
}
