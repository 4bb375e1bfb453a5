//! # Layer Catalog
//!
//! Priority-ordered set of layer definitions.
//!
//! ## Lifecycle
//!
//! ```text
//!   AUTHORING                         LIVE
//!   add_layer / register_mask_bounds  freeze()  ->  read-only
//!   (re-sorted on every insert)                    mutation = CatalogFrozen
//! ```
//!
//! Order is total: priority descending, then identifier ascending.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use stratum_shared::{Bounds2, Vec2};
use tracing::{debug, info};

use crate::config::WorldLayersConfig;
use crate::error::{CatalogError, CatalogResult};
use crate::layer::{LayerDefinition, LayerId};

/// Catalog order: priority descending, identifier ascending.
#[inline]
fn catalog_order(a: &LayerDefinition, b: &LayerDefinition) -> Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
}

/// Ordered, freezable set of layers.
#[derive(Debug, Clone, Default)]
pub struct LayerCatalog {
    layers: Vec<LayerDefinition>,
    index: HashMap<LayerId, usize>,
    mask_bounds: HashMap<PathBuf, Bounds2>,
    frozen: bool,
}

impl LayerCatalog {
    /// Empty, unfrozen catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an unfrozen catalog from authored configuration.
    ///
    /// # Errors
    ///
    /// The first [`CatalogError`] raised by an authored layer.
    pub fn from_config(config: &WorldLayersConfig) -> CatalogResult<Self> {
        let mut catalog = Self::new();
        for source in &config.masks {
            catalog.register_mask_bounds(source.path.clone(), source.bounds())?;
        }
        for layer in &config.layers {
            catalog.add_layer(layer.clone())?;
        }
        Ok(catalog)
    }

    /// Inserts a layer at its priority position.
    ///
    /// # Errors
    ///
    /// [`CatalogError::CatalogFrozen`] after [`LayerCatalog::freeze`],
    /// [`CatalogError::DuplicateIdentifier`] if the id exists,
    /// [`CatalogError::InvalidThreshold`] if the threshold is outside [0, 1].
    pub fn add_layer(&mut self, definition: LayerDefinition) -> CatalogResult<()> {
        if self.frozen {
            return Err(CatalogError::CatalogFrozen);
        }
        if !(0.0..=1.0).contains(&definition.threshold) {
            return Err(CatalogError::InvalidThreshold {
                layer: definition.id.clone(),
                threshold: definition.threshold,
            });
        }
        if self.index.contains_key(&definition.id) {
            return Err(CatalogError::DuplicateIdentifier(definition.id));
        }

        let pos = self
            .layers
            .binary_search_by(|probe| catalog_order(probe, &definition))
            .unwrap_or_else(|insert_at| insert_at);
        debug!(layer = %definition.id, priority = definition.priority, pos, "Added layer");
        self.layers.insert(pos, definition);
        self.reindex();
        Ok(())
    }

    /// Records the world bounds of a mask. Layers reading an unregistered
    /// mask never overlap any query.
    ///
    /// # Errors
    ///
    /// [`CatalogError::CatalogFrozen`] after [`LayerCatalog::freeze`].
    pub fn register_mask_bounds(&mut self, mask: impl Into<PathBuf>, bounds: Bounds2) -> CatalogResult<()> {
        if self.frozen {
            return Err(CatalogError::CatalogFrozen);
        }
        self.mask_bounds.insert(mask.into(), bounds);
        Ok(())
    }

    fn reindex(&mut self) {
        self.index = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| (layer.id.clone(), i))
            .collect();
    }

    /// Ends the authoring phase.
    pub fn freeze(&mut self) {
        if !self.frozen {
            info!(layers = self.layers.len(), masks = self.mask_bounds.len(), "Layer catalog frozen");
        }
        self.frozen = true;
    }

    /// True once the world is live.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Layers whose mask bounds intersect the circle `(center, radius)`, in
    /// catalog order. A zero radius is a point query.
    #[must_use]
    pub fn layers_overlapping(&self, center: Vec2, radius: f32) -> Vec<&LayerDefinition> {
        self.layers
            .iter()
            .filter(|layer| {
                self.mask_bounds
                    .get(&layer.mask)
                    .is_some_and(|bounds| bounds.intersects_circle(center, radius))
            })
            .collect()
    }

    /// Layer by identifier.
    #[must_use]
    pub fn get(&self, id: &LayerId) -> Option<&LayerDefinition> {
        self.index.get(id).map(|&i| &self.layers[i])
    }

    /// Layer by identifier text.
    #[must_use]
    pub fn get_str(&self, id: &str) -> Option<&LayerDefinition> {
        self.index.get(id).map(|&i| &self.layers[i])
    }

    /// Position of a layer in catalog order (0 = highest priority).
    #[must_use]
    pub fn rank(&self, id: &LayerId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// World bounds registered for a mask.
    #[must_use]
    pub fn mask_bounds(&self, mask: &Path) -> Option<Bounds2> {
        self.mask_bounds.get(mask).copied()
    }

    /// True if bounds are registered for `mask`.
    #[must_use]
    pub fn has_mask(&self, mask: &Path) -> bool {
        self.mask_bounds.contains_key(mask)
    }

    /// Layers in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &LayerDefinition> {
        self.layers.iter()
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True if there are no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> LayerCatalog {
        let mut c = LayerCatalog::new();
        c.register_mask_bounds("left.png", Bounds2::new(Vec2::new(0.0, 0.0), Vec2::new(10.0, 10.0)))
            .unwrap();
        c.register_mask_bounds("right.png", Bounds2::new(Vec2::new(20.0, 0.0), Vec2::new(30.0, 10.0)))
            .unwrap();
        c.add_layer(LayerDefinition::new("b", "left.png").with_priority(5)).unwrap();
        c.add_layer(LayerDefinition::new("a", "left.png").with_priority(5)).unwrap();
        c.add_layer(LayerDefinition::new("top", "right.png").with_priority(10)).unwrap();
        c.add_layer(LayerDefinition::new("orphan", "missing.png").with_priority(99)).unwrap();
        c
    }

    #[test]
    fn test_priority_then_identifier_order() {
        let c = catalog();
        let ids: Vec<_> = c.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, ["orphan", "top", "a", "b"]);
        assert_eq!(c.rank(&LayerId::new("a")), Some(2));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut c = catalog();
        let err = c.add_layer(LayerDefinition::new("a", "right.png")).unwrap_err();
        assert_eq!(err, CatalogError::DuplicateIdentifier(LayerId::new("a")));
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn test_frozen_rejects_mutation() {
        let mut c = catalog();
        c.freeze();
        assert!(c.is_frozen());
        assert_eq!(c.add_layer(LayerDefinition::new("new", "left.png")), Err(CatalogError::CatalogFrozen));
        assert_eq!(
            c.register_mask_bounds("x.png", Bounds2::default()),
            Err(CatalogError::CatalogFrozen)
        );
    }

    #[test]
    fn test_threshold_range() {
        let mut c = LayerCatalog::new();
        let err = c.add_layer(LayerDefinition::new("x", "m.png").with_threshold(1.5)).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidThreshold { .. }));
    }

    #[test]
    fn test_overlap_queries() {
        let c = catalog();
        let at = |x: f32, r: f32| -> Vec<String> {
            c.layers_overlapping(Vec2::new(x, 5.0), r).iter().map(|l| l.id.to_string()).collect()
        };
        assert_eq!(at(5.0, 0.0), ["a", "b"]);
        assert_eq!(at(25.0, 0.0), ["top"]);
        assert!(at(15.0, 0.0).is_empty());
        assert_eq!(at(15.0, 6.0), ["top", "a", "b"]);
    }
}
