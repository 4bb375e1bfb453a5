//! # Layer Resolver
//!
//! Turns a world coordinate into a [`ResolvedSample`]: which layers are
//! present there and with what composited weight.
//!
//! ## Compositing
//!
//! Layers blend only with layers on the same output channel (by default a
//! layer's own identifier, so distinct layers do not interact unless they
//! opt into a shared channel). Each channel is walked from the lowest to the
//! highest priority:
//!
//! ```text
//!   first contributor   acc = s
//!   Override            acc = s          lower contributions removed
//!   Additive            acc = min(acc + s, 1)
//!   Multiply            acc = acc * s    lower contributions scaled by s
//! ```
//!
//! A layer's composited weight is the accumulator right after it was
//! applied. Samples below a layer's threshold never enter compositing.
//!
//! Resolution is a pure function of (catalog, cached masks, coordinate).

use std::collections::BTreeMap;
use std::sync::Arc;

use stratum_mask::MaskStore;
use stratum_shared::Vec2;

use crate::catalog::LayerCatalog;
use crate::layer::{BlendMode, LayerDefinition, LayerId};

/// One layer present at a resolved coordinate.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedEntry {
    /// Layer identifier.
    pub layer: LayerId,
    /// Composited weight in (0, 1].
    pub weight: f32,
    /// True if the composited weight clears the layer's threshold.
    pub active: bool,
}

/// Result of one resolver query. Highest weight first; ties in catalog order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedSample {
    coord: Vec2,
    entries: Vec<ResolvedEntry>,
    channels: Vec<(String, f32)>,
}

impl ResolvedSample {
    /// Sample with no layers at `coord`.
    #[must_use]
    pub fn empty(coord: Vec2) -> Self {
        Self {
            coord,
            entries: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Sample from precomputed entries, kept in the given order. Channel
    /// values are not reconstructed.
    #[must_use]
    pub fn from_entries(coord: Vec2, entries: Vec<ResolvedEntry>) -> Self {
        Self {
            coord,
            entries,
            channels: Vec::new(),
        }
    }

    /// Queried coordinate.
    #[must_use]
    pub const fn coord(&self) -> Vec2 {
        self.coord
    }

    /// Entries, highest weight first.
    #[must_use]
    pub fn entries(&self) -> &[ResolvedEntry] {
        &self.entries
    }

    /// `(layer, weight)` pairs, highest weight first.
    #[must_use]
    pub fn weights(&self) -> Vec<(LayerId, f32)> {
        self.entries.iter().map(|e| (e.layer.clone(), e.weight)).collect()
    }

    /// Entry for `layer`.
    #[must_use]
    pub fn entry(&self, layer: &LayerId) -> Option<&ResolvedEntry> {
        self.entries.iter().find(|e| &e.layer == layer)
    }

    /// Composited weight of `layer`, 0 if absent.
    #[must_use]
    pub fn weight_of(&self, layer: &LayerId) -> f32 {
        self.entry(layer).map_or(0.0, |e| e.weight)
    }

    /// True if `layer` is present and active.
    #[must_use]
    pub fn is_active(&self, layer: &LayerId) -> bool {
        self.entry(layer).is_some_and(|e| e.active)
    }

    /// Active layers, highest weight first.
    pub fn active_layers(&self) -> impl Iterator<Item = &LayerId> {
        self.entries.iter().filter(|e| e.active).map(|e| &e.layer)
    }

    /// Final value of every output channel, sorted by channel name.
    #[must_use]
    pub fn channels(&self) -> &[(String, f32)] {
        &self.channels
    }

    /// Final value of one output channel, 0 if nothing wrote to it.
    #[must_use]
    pub fn channel_value(&self, channel: &str) -> f32 {
        self.channels
            .iter()
            .find(|(name, _)| name == channel)
            .map_or(0.0, |(_, v)| *v)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no layer is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Running state of one output channel.
#[derive(Default)]
struct ChannelAccumulator {
    value: f32,
    /// (catalog rank, composited weight) of surviving contributors.
    contributors: Vec<(usize, f32)>,
}

/// Samples masks and composites layers. Cheap to clone; safe to share across threads.
#[derive(Clone, Debug)]
pub struct LayerResolver {
    catalog: Arc<LayerCatalog>,
    masks: Arc<MaskStore>,
}

impl LayerResolver {
    /// Resolver over a (normally frozen) catalog and a mask store.
    #[must_use]
    pub fn new(catalog: Arc<LayerCatalog>, masks: Arc<MaskStore>) -> Self {
        if !catalog.is_frozen() {
            tracing::warn!("Resolver built over an unfrozen catalog");
        }
        Self { catalog, masks }
    }

    /// Catalog being resolved.
    #[must_use]
    pub fn catalog(&self) -> &Arc<LayerCatalog> {
        &self.catalog
    }

    /// Mask store being sampled.
    #[must_use]
    pub fn masks(&self) -> &Arc<MaskStore> {
        &self.masks
    }

    /// Resolves the layers present at `coord`.
    #[must_use]
    pub fn resolve(&self, coord: Vec2) -> ResolvedSample {
        let layers = self.catalog.layers_overlapping(coord, 0.0);
        Self::composite(coord, &layers, |layer| self.sample(layer, coord))
    }

    /// Resolves the layers present anywhere near `coord`.
    ///
    /// Each layer overlapping the circle is sampled at the centre and at
    /// eight points on the circle; its strongest sample is composited.
    #[must_use]
    pub fn resolve_region(&self, coord: Vec2, radius: f32) -> ResolvedSample {
        if radius <= 0.0 {
            return self.resolve(coord);
        }
        let diag = radius * std::f32::consts::FRAC_1_SQRT_2;
        let probes = [
            coord,
            coord + Vec2::new(radius, 0.0),
            coord + Vec2::new(-radius, 0.0),
            coord + Vec2::new(0.0, radius),
            coord + Vec2::new(0.0, -radius),
            coord + Vec2::new(diag, diag),
            coord + Vec2::new(-diag, diag),
            coord + Vec2::new(diag, -diag),
            coord + Vec2::new(-diag, -diag),
        ];
        let layers = self.catalog.layers_overlapping(coord, radius);
        Self::composite(coord, &layers, |layer| {
            probes.iter().map(|&p| self.sample(layer, p)).fold(0.0, f32::max)
        })
    }

    /// Raw RGBA mask value under `coord` for one layer.
    #[must_use]
    pub fn value_at(&self, layer: &LayerId, coord: Vec2) -> Option<[f32; 4]> {
        let def = self.catalog.get(layer)?;
        self.masks.value_at(&def.mask, coord)
    }

    #[inline]
    fn sample(&self, layer: &LayerDefinition, coord: Vec2) -> f32 {
        self.masks.sample(&layer.mask, coord, layer.channel)
    }

    fn composite(
        coord: Vec2,
        layers: &[&LayerDefinition],
        sample: impl Fn(&LayerDefinition) -> f32,
    ) -> ResolvedSample {
        let mut channels: BTreeMap<&str, ChannelAccumulator> = BTreeMap::new();

        // `layers` is in catalog order (highest first); composite lowest first.
        for (rank, layer) in layers.iter().enumerate().rev() {
            let s = sample(layer);
            if s <= 0.0 || s < layer.threshold {
                continue;
            }

            let acc = channels.entry(layer.output_channel()).or_default();
            if acc.contributors.is_empty() {
                acc.value = s;
            } else {
                match layer.blend {
                    BlendMode::Override => {
                        acc.value = s;
                        acc.contributors.clear();
                    }
                    BlendMode::Additive => {
                        acc.value = (acc.value + s).min(1.0);
                    }
                    BlendMode::Multiply => {
                        acc.value *= s;
                        for (_, w) in &mut acc.contributors {
                            *w *= s;
                        }
                    }
                }
            }
            acc.contributors.push((rank, acc.value));
        }

        let mut ranked: Vec<(usize, &LayerDefinition, f32)> = channels
            .values()
            .flat_map(|acc| acc.contributors.iter())
            .filter(|(_, w)| *w > 0.0)
            .map(|&(rank, w)| (rank, layers[rank], w))
            .collect();
        ranked.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));

        let entries = ranked
            .into_iter()
            .map(|(_, layer, weight)| ResolvedEntry {
                layer: layer.id.clone(),
                weight,
                active: weight >= layer.threshold,
            })
            .collect();
        let channels = channels
            .into_iter()
            .map(|(name, acc)| (name.to_string(), acc.value))
            .collect();

        ResolvedSample { coord, entries, channels }
    }
}
