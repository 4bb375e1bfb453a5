//! # Effect Driver
//!
//! Keeps one live effect instance per (cell, layer, effect binding) for
//! every loaded layer and feeds it the layer's composited weight.
//!
//! ```text
//! ResolvedSample ──► update(cell) ──► spawn (lazy) ──► set_parameter("Weight", w)
//!                                                  └─► set_parameter(mapping, offset + scale * w_src)
//! StreamingEvent::LayerDeactivated ──► release(cell, layer) ──► destroy
//! ```
//!
//! Releasing is idempotent. Spawn failures are logged and retried on the
//! next update; nothing here returns an error to the simulation step.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stratum_shared::{CellCoord, WEIGHT_EPSILON};
use tracing::{debug, warn};

use crate::catalog::LayerCatalog;
use crate::layer::{LayerDefinition, LayerId};
use crate::registry::{EffectInstanceHandle, EffectRuntime};
use crate::resolver::ResolvedSample;
use crate::streaming::StreamingEvent;

/// Effect driver tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    /// Parameter that always receives the layer's composited weight.
    pub weight_parameter: String,
    /// Upper bound on simultaneously live instances.
    pub max_live_instances: usize,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            weight_parameter: "Weight".to_string(),
            max_live_instances: 4_096,
        }
    }
}

impl EffectsConfig {
    /// Larger instance budget for shipping worlds.
    #[must_use]
    pub fn production() -> Self {
        Self {
            max_live_instances: 16_384,
            ..Self::default()
        }
    }
}

/// Driver counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EffectStats {
    /// Instances created.
    pub spawned: u64,
    /// Instances destroyed.
    pub destroyed: u64,
    /// Spawn attempts the runtime refused.
    pub spawn_failures: u64,
    /// Spawns skipped because the instance budget was exhausted.
    pub budget_skips: u64,
    /// `set_parameter` calls made.
    pub parameter_updates: u64,
    /// Instances currently live.
    pub live: usize,
}

type InstanceKey = (CellCoord, LayerId, usize);

#[derive(Debug)]
struct LiveInstance {
    handle: EffectInstanceHandle,
    /// Last values pushed: the weight parameter, then one per mapping.
    pushed: Vec<f32>,
}

/// Maps resolved weights onto live effect instances.
pub struct EffectDriver {
    config: EffectsConfig,
    catalog: Arc<LayerCatalog>,
    runtime: Arc<dyn EffectRuntime>,
    cell_size: f32,
    instances: BTreeMap<InstanceKey, LiveInstance>,
    stats: EffectStats,
}

impl EffectDriver {
    /// Driver spawning instances at the centre of `cell_size` cells.
    #[must_use]
    pub fn new(
        config: EffectsConfig,
        catalog: Arc<LayerCatalog>,
        runtime: Arc<dyn EffectRuntime>,
        cell_size: f32,
    ) -> Self {
        Self {
            config,
            catalog,
            runtime,
            cell_size,
            instances: BTreeMap::new(),
            stats: EffectStats::default(),
        }
    }

    /// Tunables.
    #[must_use]
    pub const fn config(&self) -> &EffectsConfig {
        &self.config
    }

    /// Brings the instances of `cell` in line with its loaded layers and
    /// pushes current parameters.
    ///
    /// Instances of layers not in `loaded` are released.
    pub fn update(&mut self, cell: CellCoord, sample: &ResolvedSample, loaded: &[LayerId]) {
        let stale: Vec<InstanceKey> = self
            .cell_keys(cell)
            .filter(|(_, layer, _)| !loaded.contains(layer))
            .collect();
        for key in stale {
            self.destroy(&key);
        }

        let catalog = Arc::clone(&self.catalog);
        for layer in loaded {
            let Some(def) = catalog.get(layer) else {
                continue;
            };
            for index in 0..def.effects.len() {
                self.drive_binding(cell, def, index, sample);
            }
        }
    }

    fn drive_binding(&mut self, cell: CellCoord, def: &LayerDefinition, index: usize, sample: &ResolvedSample) {
        let binding = &def.effects[index];
        let key = (cell, def.id.clone(), index);

        if !self.instances.contains_key(&key) {
            if self.instances.len() >= self.config.max_live_instances {
                self.stats.budget_skips += 1;
                debug!(cell = %cell, layer = %def.id, "Effect instance budget exhausted");
                return;
            }
            let position = cell.center(self.cell_size);
            match self.runtime.spawn(&binding.template, position) {
                Ok(handle) => {
                    self.stats.spawned += 1;
                    debug!(cell = %cell, layer = %def.id, template = %binding.template, ?handle, "Spawned effect");
                    self.instances.insert(
                        key.clone(),
                        LiveInstance {
                            handle,
                            pushed: Vec::new(),
                        },
                    );
                }
                Err(error) => {
                    self.stats.spawn_failures += 1;
                    warn!(cell = %cell, layer = %def.id, template = %binding.template, %error, "Effect spawn failed");
                    return;
                }
            }
        }

        let Some(instance) = self.instances.get_mut(&key) else {
            return;
        };
        let weight = sample.weight_of(&def.id);
        let values = std::iter::once((self.config.weight_parameter.as_str(), weight)).chain(
            binding.parameters.iter().map(|mapping| {
                let source = mapping.source.as_ref().unwrap_or(&def.id);
                (mapping.name.as_str(), mapping.apply(sample.weight_of(source)))
            }),
        );

        let first_push = instance.pushed.is_empty();
        instance.pushed.resize(binding.parameters.len() + 1, 0.0);
        for (slot, (name, value)) in values.enumerate() {
            if first_push || (instance.pushed[slot] - value).abs() > WEIGHT_EPSILON {
                self.runtime.set_parameter(instance.handle, name, value);
                instance.pushed[slot] = value;
                self.stats.parameter_updates += 1;
            }
        }
    }

    fn cell_keys(&self, cell: CellCoord) -> impl Iterator<Item = InstanceKey> + '_ {
        self.instances
            .keys()
            .filter(move |(c, _, _)| *c == cell)
            .cloned()
    }

    fn destroy(&mut self, key: &InstanceKey) -> bool {
        let Some(instance) = self.instances.remove(key) else {
            return false;
        };
        self.runtime.destroy(instance.handle);
        self.stats.destroyed += 1;
        debug!(cell = %key.0, layer = %key.1, handle = ?instance.handle, "Released effect");
        true
    }

    // ========================================================================
    // RELEASE
    // ========================================================================

    /// Releases every instance of `layer` in `cell`. Returns how many were
    /// live; a second call returns 0.
    pub fn release(&mut self, cell: CellCoord, layer: &LayerId) -> usize {
        let keys: Vec<InstanceKey> = self.cell_keys(cell).filter(|(_, l, _)| l == layer).collect();
        keys.iter().filter(|key| self.destroy(key)).count()
    }

    /// Releases one instance by handle. False if it was not live.
    pub fn release_instance(&mut self, handle: EffectInstanceHandle) -> bool {
        let key = self
            .instances
            .iter()
            .find(|(_, instance)| instance.handle == handle)
            .map(|(key, _)| key.clone());
        key.is_some_and(|key| self.destroy(&key))
    }

    /// Releases everything in `cell`.
    pub fn release_cell(&mut self, cell: CellCoord) -> usize {
        let keys: Vec<InstanceKey> = self.cell_keys(cell).collect();
        keys.iter().filter(|key| self.destroy(key)).count()
    }

    /// Releases every live instance.
    pub fn release_all(&mut self) -> usize {
        let keys: Vec<InstanceKey> = self.instances.keys().cloned().collect();
        keys.iter().filter(|key| self.destroy(key)).count()
    }

    /// Releases instances a streaming event took out of `Loaded`.
    pub fn handle_event(&mut self, event: &StreamingEvent) {
        match event {
            StreamingEvent::LayerDeactivated { cell, layer } => {
                self.release(*cell, layer);
            }
            StreamingEvent::CellEvicted { cell } => {
                self.release_cell(*cell);
            }
            _ => {}
        }
    }

    // ========================================================================
    // OBSERVABILITY
    // ========================================================================

    /// Live instance for one binding of a layer in a cell.
    #[must_use]
    pub fn instance(&self, cell: CellCoord, layer: &LayerId, binding: usize) -> Option<EffectInstanceHandle> {
        self.instances
            .get(&(cell, layer.clone(), binding))
            .map(|instance| instance.handle)
    }

    /// Number of live instances.
    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> EffectStats {
        EffectStats {
            live: self.instances.len(),
            ..self.stats
        }
    }
}

impl Drop for EffectDriver {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for EffectDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectDriver")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EffectError;
    use crate::layer::{AssetRef, EffectBinding, ParameterMapping};
    use crate::resolver::ResolvedEntry;
    use parking_lot::Mutex;
    use stratum_shared::Vec2;

    #[derive(Default)]
    struct RecordingRuntime {
        next: Mutex<u64>,
        refuse: Mutex<bool>,
        spawned: Mutex<Vec<(AssetRef, Vec2)>>,
        params: Mutex<Vec<(EffectInstanceHandle, String, f32)>>,
        destroyed: Mutex<Vec<EffectInstanceHandle>>,
    }

    impl EffectRuntime for RecordingRuntime {
        fn spawn(&self, template: &AssetRef, position: Vec2) -> Result<EffectInstanceHandle, EffectError> {
            if *self.refuse.lock() {
                return Err(EffectError::SpawnFailed("pool exhausted".into()));
            }
            let mut next = self.next.lock();
            *next += 1;
            self.spawned.lock().push((template.clone(), position));
            Ok(EffectInstanceHandle(*next))
        }
        fn set_parameter(&self, instance: EffectInstanceHandle, name: &str, value: f32) {
            self.params.lock().push((instance, name.to_string(), value));
        }
        fn destroy(&self, instance: EffectInstanceHandle) {
            self.destroyed.lock().push(instance);
        }
    }

    fn driver(runtime: &Arc<RecordingRuntime>) -> EffectDriver {
        let mut catalog = LayerCatalog::new();
        catalog
            .add_layer(
                LayerDefinition::new("marsh", "m.png").with_effect(
                    EffectBinding::new("/Game/FX/Mist")
                        .with_parameter(ParameterMapping::new("Density").scaled(2.0, 0.5))
                        .with_parameter(ParameterMapping::new("Wet").from_layer("rain")),
                ),
            )
            .unwrap();
        catalog.add_layer(LayerDefinition::new("rain", "r.png")).unwrap();
        catalog.freeze();
        EffectDriver::new(
            EffectsConfig::default(),
            Arc::new(catalog),
            Arc::clone(runtime) as Arc<dyn EffectRuntime>,
            10.0,
        )
    }

    fn sample(marsh: f32, rain: f32) -> ResolvedSample {
        ResolvedSample::from_entries(
            Vec2::ZERO,
            vec![
                ResolvedEntry {
                    layer: "marsh".into(),
                    weight: marsh,
                    active: true,
                },
                ResolvedEntry {
                    layer: "rain".into(),
                    weight: rain,
                    active: true,
                },
            ],
        )
    }

    const CELL: CellCoord = CellCoord::new(1, 2);

    #[test]
    fn test_spawn_at_cell_center_and_push_parameters() {
        let runtime = Arc::new(RecordingRuntime::default());
        let mut d = driver(&runtime);
        d.update(CELL, &sample(0.5, 0.25), &["marsh".into()]);

        assert_eq!(*runtime.spawned.lock(), vec![(AssetRef::new("/Game/FX/Mist"), Vec2::new(15.0, 25.0))]);
        let params = runtime.params.lock().clone();
        let h = EffectInstanceHandle(1);
        assert_eq!(
            params,
            vec![(h, "Weight".into(), 0.5), (h, "Density".into(), 1.5), (h, "Wet".into(), 0.25)]
        );
        assert_eq!(d.live_instances(), 1);
    }

    #[test]
    fn test_unchanged_values_not_repushed() {
        let runtime = Arc::new(RecordingRuntime::default());
        let mut d = driver(&runtime);
        d.update(CELL, &sample(0.5, 0.25), &["marsh".into()]);
        d.update(CELL, &sample(0.5, 0.75), &["marsh".into()]);
        let params = runtime.params.lock().clone();
        assert_eq!(params.len(), 4);
        assert_eq!(params[3].1, "Wet");
        assert_eq!(runtime.spawned.lock().len(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let runtime = Arc::new(RecordingRuntime::default());
        let mut d = driver(&runtime);
        d.update(CELL, &sample(0.5, 0.0), &["marsh".into()]);

        assert_eq!(d.release(CELL, &"marsh".into()), 1);
        assert_eq!(d.release(CELL, &"marsh".into()), 0);
        assert!(!d.release_instance(EffectInstanceHandle(1)));
        assert_eq!(runtime.destroyed.lock().len(), 1);
    }

    #[test]
    fn test_unloaded_layer_released_on_update() {
        let runtime = Arc::new(RecordingRuntime::default());
        let mut d = driver(&runtime);
        d.update(CELL, &sample(0.5, 0.0), &["marsh".into()]);
        d.update(CELL, &sample(0.5, 0.0), &[]);
        assert_eq!(d.live_instances(), 0);
        assert_eq!(*runtime.destroyed.lock(), vec![EffectInstanceHandle(1)]);
    }

    #[test]
    fn test_spawn_failure_retried_next_update() {
        let runtime = Arc::new(RecordingRuntime::default());
        let mut d = driver(&runtime);
        *runtime.refuse.lock() = true;
        d.update(CELL, &sample(0.5, 0.0), &["marsh".into()]);
        assert_eq!(d.live_instances(), 0);
        assert_eq!(d.stats().spawn_failures, 1);

        *runtime.refuse.lock() = false;
        d.update(CELL, &sample(0.5, 0.0), &["marsh".into()]);
        assert_eq!(d.live_instances(), 1);
    }

    #[test]
    fn test_deactivation_event_releases() {
        let runtime = Arc::new(RecordingRuntime::default());
        let mut d = driver(&runtime);
        d.update(CELL, &sample(0.5, 0.0), &["marsh".into()]);
        d.handle_event(&StreamingEvent::LayerDeactivated {
            cell: CELL,
            layer: "marsh".into(),
        });
        assert_eq!(d.live_instances(), 0);
        d.handle_event(&StreamingEvent::CellEvicted { cell: CELL });
        assert_eq!(runtime.destroyed.lock().len(), 1);
    }

    #[test]
    fn test_drop_releases_everything() {
        let runtime = Arc::new(RecordingRuntime::default());
        {
            let mut d = driver(&runtime);
            d.update(CELL, &sample(0.5, 0.0), &["marsh".into()]);
            d.update(CellCoord::new(0, 0), &sample(0.5, 0.0), &["marsh".into()]);
        }
        assert_eq!(runtime.destroyed.lock().len(), 2);
    }
}
