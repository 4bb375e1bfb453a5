//! # World Layers
//!
//! One call per simulation step drives the whole layer pipeline:
//!
//! ```text
//! step(dt, observers):
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ 1. MASKS      install finished background decodes                   │
//! │ 2. STREAMING  apply completions, advance clock, fire retries        │
//! │ 3. RESOLVE    every cell within stream_radius of an observer,       │
//! │               sampled at the cell centre, ticked into streaming;    │
//! │               then settle cells nobody ticked (stale / idle)        │
//! │ 4. CLEANUP    force-evict cells beyond radius + eviction margin     │
//! │ 5. EVENTS     release effects of deactivated layers, publish        │
//! │ 6. EFFECTS    spawn / update instances of loaded layers             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cells are visited in coordinate order, so a step is deterministic for a
//! given input and completion order.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stratum_layers::{
    AssetRegistry, AssetStreamingService, ConfigResult, EffectDriver, EffectRuntime, LayerCatalog, LayerResolver,
    ResolvedSample, StreamingController, WorldLayersConfig,
};
use stratum_mask::MaskStore;
use stratum_shared::{CellCoord, Vec2};
use tracing::{debug, info, warn};

use crate::events::{EventBus, EventReceiver, EventSender, WorldLayerEvent};

/// Step time above which a warning is logged.
pub const STEP_BUDGET: Duration = Duration::from_millis(4);

/// What one step did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepStats {
    /// Step number, starting at 0.
    pub step: u64,
    /// Masks that finished decoding.
    pub masks_completed: usize,
    /// Streaming completions applied.
    pub completions_applied: usize,
    /// Cells resolved and ticked.
    pub cells_resolved: usize,
    /// Cells force-evicted for distance.
    pub cells_evicted: usize,
    /// Events published.
    pub events_published: usize,
    /// Events the bus had to drop.
    pub events_dropped: usize,
    /// Live effect instances after the step.
    pub live_effects: usize,
    /// Wall time of the step in microseconds.
    pub elapsed_us: u64,
}

/// Per-step facade over the layer pipeline.
pub struct WorldLayers {
    masks: Arc<MaskStore>,
    resolver: LayerResolver,
    streaming: StreamingController,
    effects: EffectDriver,
    bus: EventBus,
    sender: EventSender,
    step_count: u64,
}

impl WorldLayers {
    /// Wires the pipeline from authored configuration.
    ///
    /// Mask sources not yet known to `masks` are registered and queued for
    /// background decoding. The catalog is built and frozen.
    ///
    /// # Errors
    ///
    /// Any [`stratum_layers::ConfigError`] from validation, mask
    /// registration or catalog construction.
    pub fn new(
        config: WorldLayersConfig,
        masks: Arc<MaskStore>,
        registry: Arc<dyn AssetRegistry>,
        streaming_service: Arc<dyn AssetStreamingService>,
        effect_runtime: Arc<dyn EffectRuntime>,
    ) -> ConfigResult<Self> {
        config.validate()?;

        for source in &config.masks {
            if !masks.is_registered(&source.path) {
                masks.register(source.clone())?;
            }
            masks.request_load(&source.path);
        }

        let mut catalog = LayerCatalog::from_config(&config)?;
        catalog.freeze();
        let catalog = Arc::new(catalog);

        let resolver = LayerResolver::new(Arc::clone(&catalog), Arc::clone(&masks));
        let cell_size = config.streaming.cell_size;
        let streaming = StreamingController::new(config.streaming, Arc::clone(&catalog), registry, streaming_service);
        let effects = EffectDriver::new(config.effects, catalog, effect_runtime, cell_size);

        let bus = EventBus::default();
        let sender = bus.sender();
        info!(
            layers = resolver.catalog().len(),
            masks = config.masks.len(),
            cell_size,
            "World layers ready"
        );

        Ok(Self {
            masks,
            resolver,
            streaming,
            effects,
            bus,
            sender,
            step_count: 0,
        })
    }

    /// Loads a configuration file and builds a mask store from its
    /// `[mask_cache]` section.
    ///
    /// # Errors
    ///
    /// As [`WorldLayersConfig::load`] and [`WorldLayers::new`].
    pub fn load(
        path: impl AsRef<Path>,
        registry: Arc<dyn AssetRegistry>,
        streaming_service: Arc<dyn AssetStreamingService>,
        effect_runtime: Arc<dyn EffectRuntime>,
    ) -> ConfigResult<Self> {
        let config = WorldLayersConfig::load(path)?;
        let masks = Arc::new(MaskStore::new(config.mask_cache.clone()));
        Self::new(config, masks, registry, streaming_service, effect_runtime)
    }

    // ========================================================================
    // STEP
    // ========================================================================

    /// Advances the pipeline by `dt` around the given observer positions.
    pub fn step(&mut self, dt: Duration, observers: &[Vec2]) -> StepStats {
        let started = Instant::now();
        let mut stats = StepStats {
            step: self.step_count,
            ..StepStats::default()
        };
        let mut published = Vec::new();

        // 1. Masks
        for completion in self.masks.poll_completions() {
            stats.masks_completed += 1;
            published.push(match completion.result {
                Ok(_) => WorldLayerEvent::MaskLoaded { path: completion.path },
                Err(error) => WorldLayerEvent::MaskFailed {
                    path: completion.path,
                    error,
                },
            });
        }

        // 2. Streaming completions and clock
        stats.completions_applied = self.streaming.drain_completions();
        self.streaming.advance(dt);

        // 3. Resolve, tick, settle
        let config = self.streaming.config();
        let cell_size = config.cell_size;
        let radius = config.stream_radius_cells;
        let keep_radius = radius.saturating_add(config.eviction_margin_cells);
        let centres: Vec<CellCoord> = observers
            .iter()
            .map(|&pos| CellCoord::from_world(pos, cell_size))
            .collect();
        let cells: BTreeSet<CellCoord> = centres.iter().flat_map(|c| c.neighborhood(radius)).collect();

        let mut samples = Vec::with_capacity(cells.len());
        for cell in cells {
            let sample = self.resolver.resolve(cell.center(cell_size));
            self.streaming.tick(cell, &sample);
            samples.push((cell, sample));
        }
        stats.cells_resolved = samples.len();
        self.streaming.settle();

        // 4. Distance cleanup
        stats.cells_evicted = self
            .streaming
            .retain(|cell| centres.iter().any(|c| c.chebyshev_distance(cell) <= keep_radius));

        // 5. Events
        for event in self.streaming.drain_events() {
            self.effects.handle_event(&event);
            published.push(WorldLayerEvent::Streaming(event));
        }

        // 6. Effects
        for (cell, sample) in &samples {
            let loaded = self.streaming.loaded_layers(*cell);
            if !loaded.is_empty() {
                self.effects.update(*cell, sample, &loaded);
            }
        }

        for event in published {
            if self.sender.send(event) {
                stats.events_published += 1;
            } else {
                stats.events_dropped += 1;
            }
        }
        if stats.events_dropped > 0 {
            warn!(step = stats.step, dropped = stats.events_dropped, "Event bus full");
        }

        stats.live_effects = self.effects.live_instances();
        let elapsed = started.elapsed();
        stats.elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        if elapsed > STEP_BUDGET {
            warn!(
                step = stats.step,
                elapsed_us = stats.elapsed_us,
                budget_us = STEP_BUDGET.as_micros() as u64,
                cells = stats.cells_resolved,
                "Layer step exceeded budget"
            );
        }
        debug!(
            step = stats.step,
            cells = stats.cells_resolved,
            completions = stats.completions_applied,
            events = stats.events_published,
            "Layer step"
        );

        self.step_count += 1;
        stats
    }

    /// Releases every effect and unloads every tracked cell. Unload
    /// completions still arrive through later steps.
    pub fn shutdown(&mut self) {
        let released = self.effects.release_all();
        let evicted = self.streaming.retain(|_| false);
        for event in self.streaming.drain_events() {
            self.sender.send(WorldLayerEvent::Streaming(event));
        }
        info!(released, evicted, "World layers shut down");
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Layers present at `coord`, for ad-hoc gameplay queries.
    #[must_use]
    pub fn query(&self, coord: Vec2) -> ResolvedSample {
        self.resolver.resolve(coord)
    }

    /// Layers present anywhere within `radius` of `coord`.
    #[must_use]
    pub fn query_region(&self, coord: Vec2, radius: f32) -> ResolvedSample {
        self.resolver.resolve_region(coord, radius)
    }

    /// Consumer handle of the event bus.
    #[must_use]
    pub fn events(&self) -> EventReceiver {
        self.bus.receiver()
    }

    /// The resolver.
    #[must_use]
    pub const fn resolver(&self) -> &LayerResolver {
        &self.resolver
    }

    /// The streaming controller.
    #[must_use]
    pub const fn streaming(&self) -> &StreamingController {
        &self.streaming
    }

    /// The effect driver.
    #[must_use]
    pub const fn effects(&self) -> &EffectDriver {
        &self.effects
    }

    /// The mask store.
    #[must_use]
    pub fn masks(&self) -> &Arc<MaskStore> {
        &self.masks
    }

    /// Steps taken so far.
    #[must_use]
    pub const fn step_count(&self) -> u64 {
        self.step_count
    }
}

impl std::fmt::Debug for WorldLayers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldLayers")
            .field("step_count", &self.step_count)
            .field("streaming", &self.streaming)
            .field("effects", &self.effects)
            .finish_non_exhaustive()
    }
}
