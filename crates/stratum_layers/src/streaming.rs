//! # Streaming Controller
//!
//! Turns resolved samples into stable load/unload decisions per streaming
//! cell.
//!
//! ## Per (cell, layer) State Machine
//!
//! ```text
//!            active                 active for activate_debounce
//! Unloaded ---------> Pending ------------------------------> Loaded
//!    ^                  |  inactive                          |   ^
//!    |                  v                          inactive  |   | active again
//!    |               Unloaded                                v   | (no new load)
//!    +------------------------------------------------- Unloading
//!         inactive for deactivate_debounce (unload issued)
//! ```
//!
//! Entering `Loaded` issues one load per asset binding; entering `Unloaded`
//! from `Unloading` issues one unload per resident asset.
//!
//! ## I/O Model
//!
//! Requests go to the [`AssetStreamingService`] and complete later through
//! a crossbeam queue drained by [`StreamingController::drain_completions`].
//! The logical state never waits on I/O: it always reflects the intended
//! target, and a reconcile pass brings each asset towards it. Failed
//! requests are retried with exponential backoff (seeded jitter) and
//! finally reported as [`StreamingEvent::Failure`]. A load whose cell no
//! longer wants it is cancelled; if it completes anyway, the asset is
//! unloaded straight away and never attached to the cell.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use stratum_shared::{CellCoord, DEFAULT_CELL_SIZE};
use tracing::{debug, info, warn};

use crate::catalog::LayerCatalog;
use crate::error::{ConfigError, ConfigResult, StreamingError};
use crate::layer::{AssetRef, LayerDefinition, LayerId};
use crate::registry::{
    AssetRegistry, AssetStreamingService, CompletionSender, RequestId, StreamHandle, StreamingCompletion,
    StreamingOutcome,
};
use crate::resolver::ResolvedSample;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Streaming controller tunables. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Edge length of a streaming cell in world units.
    pub cell_size: f32,
    /// Cells around each observer that are resolved every step.
    pub stream_radius_cells: u32,
    /// Extra rings kept (and left to unload through debounce) before cells
    /// are force-evicted.
    pub eviction_margin_cells: u32,
    /// Time a layer must stay active before it loads.
    pub activate_debounce_ms: u64,
    /// Time a layer must stay inactive before it unloads.
    pub deactivate_debounce_ms: u64,
    /// Time a cell with nothing loaded or pending is kept before eviction.
    pub idle_eviction_ms: u64,
    /// A cell not ticked for this long is treated as empty.
    pub stale_after_ms: u64,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_base_ms: u64,
    /// Upper bound on a retry delay.
    pub retry_max_ms: u64,
    /// Fraction in [0, 1] by which a retry delay may be shortened at random.
    pub retry_jitter: f32,
    /// Seed of the jitter generator.
    pub seed: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            stream_radius_cells: 2,
            eviction_margin_cells: 2,
            activate_debounce_ms: 250,
            deactivate_debounce_ms: 2_000,
            idle_eviction_ms: 10_000,
            stale_after_ms: 1_000,
            max_retries: 4,
            retry_base_ms: 100,
            retry_max_ms: 5_000,
            retry_jitter: 0.25,
            seed: 0x5354_5241,
        }
    }
}

impl StreamingConfig {
    /// Wider radius and longer unload dwell for shipping worlds.
    #[must_use]
    pub fn production() -> Self {
        Self {
            stream_radius_cells: 4,
            deactivate_debounce_ms: 5_000,
            idle_eviction_ms: 30_000,
            max_retries: 6,
            ..Self::default()
        }
    }

    /// Activation dwell.
    #[must_use]
    pub const fn activate_debounce(&self) -> Duration {
        Duration::from_millis(self.activate_debounce_ms)
    }

    /// Deactivation dwell.
    #[must_use]
    pub const fn deactivate_debounce(&self) -> Duration {
        Duration::from_millis(self.deactivate_debounce_ms)
    }

    /// Idle period before eviction.
    #[must_use]
    pub const fn idle_eviction(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_ms)
    }

    /// Staleness period.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidSetting`] for the first bad value.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(invalid("streaming.cell_size", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(invalid("streaming.retry_jitter", "must be within [0, 1]"));
        }
        if self.retry_max_ms < self.retry_base_ms {
            return Err(invalid("streaming.retry_max_ms", "must not be below retry_base_ms"));
        }
        Ok(())
    }

    fn retry_delay(&self, attempt: u32, rng: &mut ChaCha8Rng) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.retry_base_ms.saturating_mul(1 << exp).min(self.retry_max_ms);
        let shrink: f32 = rng.gen_range(0.0..=self.retry_jitter);
        Duration::from_millis(ms).mul_f32(1.0 - shrink)
    }
}

fn invalid(setting: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        setting,
        reason: reason.to_string(),
    }
}

// ============================================================================
// PUBLIC STATE & EVENTS
// ============================================================================

/// Logical state of a layer in a cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LayerState {
    /// Not wanted.
    #[default]
    Unloaded,
    /// Active, waiting out the activation debounce.
    Pending,
    /// Loaded; assets requested.
    Loaded,
    /// Inactive, waiting out the deactivation debounce.
    Unloading,
}

impl LayerState {
    /// True while the layer's assets should be resident.
    #[must_use]
    pub const fn wants_resident(self) -> bool {
        matches!(self, Self::Loaded | Self::Unloading)
    }
}

/// Kind of streaming request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamingOperation {
    /// Asset load.
    Load,
    /// Asset unload.
    Unload,
}

/// A request that kept failing. Non-fatal.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamingFailure {
    /// Cell that wanted the operation.
    pub cell: CellCoord,
    /// Layer owning the asset.
    pub layer: LayerId,
    /// Asset reference.
    pub asset: AssetRef,
    /// Failed operation.
    pub operation: StreamingOperation,
    /// Attempts made.
    pub attempts: u32,
    /// Last error.
    pub error: StreamingError,
}

/// Observable streaming side effects, in the order they happened.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamingEvent {
    /// Layer entered `Loaded` in a cell.
    LayerActivated {
        /// Cell.
        cell: CellCoord,
        /// Layer.
        layer: LayerId,
    },
    /// Layer left `Loaded` in a cell.
    LayerDeactivated {
        /// Cell.
        cell: CellCoord,
        /// Layer.
        layer: LayerId,
    },
    /// Load request issued.
    LoadRequested {
        /// Cell.
        cell: CellCoord,
        /// Layer.
        layer: LayerId,
        /// Asset.
        asset: AssetRef,
        /// Request.
        request: RequestId,
    },
    /// Unload request issued.
    UnloadRequested {
        /// Cell.
        cell: CellCoord,
        /// Layer.
        layer: LayerId,
        /// Asset.
        asset: AssetRef,
        /// Request.
        request: RequestId,
    },
    /// Load completed and the asset is attached to the cell.
    AssetLoaded {
        /// Cell.
        cell: CellCoord,
        /// Layer.
        layer: LayerId,
        /// Asset.
        asset: AssetRef,
        /// Resident handle.
        handle: StreamHandle,
    },
    /// Unload completed.
    AssetUnloaded {
        /// Cell.
        cell: CellCoord,
        /// Layer.
        layer: LayerId,
        /// Asset.
        asset: AssetRef,
    },
    /// Request gave up after retries.
    Failure(StreamingFailure),
    /// Cell dropped from the tracked set.
    CellEvicted {
        /// Cell.
        cell: CellCoord,
    },
}

/// Controller counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamingStats {
    /// Load requests issued (including retries).
    pub load_requests: u64,
    /// Unload requests issued (including retries).
    pub unload_requests: u64,
    /// In-flight loads cancelled.
    pub cancellations: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Operations given up on.
    pub failures: u64,
    /// Completions for requests nobody wanted any more.
    pub discarded_completions: u64,
    /// Cells evicted.
    pub cell_evictions: u64,
    /// Cells currently tracked.
    pub tracked_cells: usize,
    /// (cell, layer) pairs currently `Loaded` or `Unloading`.
    pub resident_layers: usize,
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

#[derive(Debug)]
struct AssetSlot {
    reference: AssetRef,
    handle: Option<StreamHandle>,
    pending: Option<(RequestId, StreamingOperation)>,
    retry: Option<(StreamingOperation, Duration)>,
    attempts: u32,
    failed: Option<StreamingOperation>,
}

enum Work {
    Load,
    Unload(StreamHandle),
    Cancel(RequestId),
}

impl AssetSlot {
    fn new(reference: AssetRef) -> Self {
        Self {
            reference,
            handle: None,
            pending: None,
            retry: None,
            attempts: 0,
            failed: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.handle.is_none() && self.pending.is_none() && self.retry.is_none()
    }

    /// What to do next to move towards the target residency.
    fn next_work(&mut self, resident: bool) -> Option<Work> {
        let wanted = if resident {
            StreamingOperation::Load
        } else {
            StreamingOperation::Unload
        };
        if self.failed.is_some_and(|op| op != wanted) {
            self.failed = None;
        }
        if let Some((op, _)) = self.retry {
            if op == wanted {
                return None;
            }
            self.retry = None;
            self.attempts = 0;
        }
        if let Some((id, op)) = self.pending {
            if op == StreamingOperation::Load && !resident {
                self.pending = None;
                self.attempts = 0;
                return Some(Work::Cancel(id));
            }
            return None;
        }
        if self.failed.is_some() {
            return None;
        }
        match (resident, self.handle) {
            (true, None) => Some(Work::Load),
            (false, Some(handle)) => Some(Work::Unload(handle)),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct LayerSlot {
    state: LayerState,
    since: Duration,
    assets: Vec<AssetSlot>,
}

impl LayerSlot {
    fn new(def: &LayerDefinition, now: Duration) -> Self {
        Self {
            state: LayerState::Unloaded,
            since: now,
            assets: def.assets.iter().map(|a| AssetSlot::new(a.reference.clone())).collect(),
        }
    }

    fn is_disposable(&self) -> bool {
        self.state == LayerState::Unloaded && self.assets.iter().all(AssetSlot::is_idle)
    }
}

#[derive(Debug)]
struct StreamingCell {
    slots: BTreeMap<LayerId, LayerSlot>,
    last_tick: Duration,
    idle_since: Option<Duration>,
}

#[derive(Debug)]
struct InFlight {
    operation: StreamingOperation,
    cell: CellCoord,
    layer: LayerId,
    asset_index: usize,
    asset: AssetRef,
    /// Nobody is waiting for this result any more.
    abandoned: bool,
}

fn slot_mut<'a>(
    cells: &'a mut BTreeMap<CellCoord, StreamingCell>,
    cell: CellCoord,
    layer: &LayerId,
) -> Option<&'a mut LayerSlot> {
    cells.get_mut(&cell)?.slots.get_mut(layer)
}

/// State transitions taken by one layer during one evaluation.
#[derive(Default)]
struct Transitions {
    activated: bool,
    deactivated: bool,
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Per-cell load/unload state machine with hysteresis.
pub struct StreamingController {
    config: StreamingConfig,
    catalog: Arc<LayerCatalog>,
    registry: Arc<dyn AssetRegistry>,
    service: Arc<dyn AssetStreamingService>,
    cells: BTreeMap<CellCoord, StreamingCell>,
    in_flight: BTreeMap<RequestId, InFlight>,
    next_request: u64,
    now: Duration,
    rng: ChaCha8Rng,
    completion_tx: Sender<StreamingCompletion>,
    completion_rx: Receiver<StreamingCompletion>,
    events: Vec<StreamingEvent>,
    stats: StreamingStats,
}

impl StreamingController {
    /// Creates a controller at time zero with no tracked cells.
    #[must_use]
    pub fn new(
        config: StreamingConfig,
        catalog: Arc<LayerCatalog>,
        registry: Arc<dyn AssetRegistry>,
        service: Arc<dyn AssetStreamingService>,
    ) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            catalog,
            registry,
            service,
            cells: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            next_request: 0,
            now: Duration::ZERO,
            rng,
            completion_tx,
            completion_rx,
            events: Vec::new(),
            stats: StreamingStats::default(),
        }
    }

    /// Reply channel for out-of-band completions.
    #[must_use]
    pub fn completion_sender(&self) -> CompletionSender {
        CompletionSender::new(self.completion_tx.clone())
    }

    /// Controller clock.
    #[must_use]
    pub const fn now(&self) -> Duration {
        self.now
    }

    /// Tunables.
    #[must_use]
    pub const fn config(&self) -> &StreamingConfig {
        &self.config
    }

    // ========================================================================
    // STEP ENTRY POINTS
    // ========================================================================

    /// Applies every completion that has arrived. Returns how many.
    pub fn drain_completions(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.apply_completion(completion);
            applied += 1;
        }
        applied
    }

    /// Advances the clock and fires due retries.
    ///
    /// Stale and idle cells are handled by [`StreamingController::settle`],
    /// once the step's ticks are in.
    pub fn advance(&mut self, dt: Duration) {
        self.now += dt;
        self.fire_due_retries();
    }

    /// Ends a step: cells not ticked since the clock last moved are judged
    /// for staleness and idleness. Call after every `tick` of the step.
    ///
    /// A cell ticked at the current time is never stale or evicted, however
    /// long the step was.
    pub fn settle(&mut self) {
        self.settle_stale_cells();
        self.evict_idle_cells();
    }

    /// Feeds one resolved sample for `cell`.
    pub fn tick(&mut self, cell: CellCoord, sample: &ResolvedSample) {
        let now = self.now;
        let state = self.cells.entry(cell).or_insert_with(|| {
            debug!(cell = %cell, "Tracking streaming cell");
            StreamingCell {
                slots: BTreeMap::new(),
                last_tick: now,
                idle_since: None,
            }
        });
        state.last_tick = now;
        self.evaluate_cell(cell, sample);
    }

    /// Force-evicts every tracked cell for which `keep` returns false.
    /// Resident assets are unloaded and in-flight loads cancelled.
    pub fn retain(&mut self, mut keep: impl FnMut(CellCoord) -> bool) -> usize {
        let doomed: Vec<CellCoord> = self.cells.keys().copied().filter(|&c| !keep(c)).collect();
        for &cell in &doomed {
            self.force_evict(cell);
        }
        doomed.len()
    }

    /// Force-evicts cells further than `radius` rings from `center`.
    pub fn retain_within(&mut self, center: CellCoord, radius: u32) -> usize {
        self.retain(|cell| cell.chebyshev_distance(center) <= radius)
    }

    /// Takes the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<StreamingEvent> {
        std::mem::take(&mut self.events)
    }

    // ========================================================================
    // OBSERVABILITY
    // ========================================================================

    /// State of `layer` in `cell`.
    #[must_use]
    pub fn layer_state(&self, cell: CellCoord, layer: &LayerId) -> LayerState {
        self.cells
            .get(&cell)
            .and_then(|c| c.slots.get(layer))
            .map_or(LayerState::Unloaded, |s| s.state)
    }

    /// Layers in `Loaded` state in `cell`, in identifier order.
    #[must_use]
    pub fn loaded_layers(&self, cell: CellCoord) -> Vec<LayerId> {
        self.cells.get(&cell).map_or_else(Vec::new, |c| {
            c.slots
                .iter()
                .filter(|(_, s)| s.state == LayerState::Loaded)
                .map(|(id, _)| id.clone())
                .collect()
        })
    }

    /// Resident handle of an asset binding, once its load has completed.
    #[must_use]
    pub fn asset_handle(&self, cell: CellCoord, layer: &LayerId, asset: &AssetRef) -> Option<StreamHandle> {
        let slot = self.cells.get(&cell)?.slots.get(layer)?;
        slot.assets.iter().find(|a| &a.reference == asset)?.handle
    }

    /// Tracked cells in order.
    #[must_use]
    pub fn tracked_cells(&self) -> Vec<CellCoord> {
        self.cells.keys().copied().collect()
    }

    /// Requests still awaiting completion (including abandoned ones).
    #[must_use]
    pub fn in_flight_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> StreamingStats {
        StreamingStats {
            tracked_cells: self.cells.len(),
            resident_layers: self
                .cells
                .values()
                .flat_map(|c| c.slots.values())
                .filter(|s| s.state.wants_resident())
                .count(),
            ..self.stats
        }
    }

    // ========================================================================
    // STATE MACHINE
    // ========================================================================

    fn evaluate_cell(&mut self, cell: CellCoord, sample: &ResolvedSample) {
        let Some(state) = self.cells.get(&cell) else {
            return;
        };
        let mut layers: Vec<LayerId> = state.slots.keys().cloned().collect();
        layers.extend(sample.active_layers().cloned());
        layers.sort();
        layers.dedup();

        for layer in &layers {
            self.evaluate_layer(cell, layer, sample.is_active(layer));
        }
        self.refresh_idle(cell);
    }

    fn evaluate_layer(&mut self, cell: CellCoord, layer: &LayerId, active: bool) {
        let now = self.now;
        let catalog = Arc::clone(&self.catalog);
        let Some(def) = catalog.get(layer) else {
            return;
        };
        let Some(state) = self.cells.get_mut(&cell) else {
            return;
        };
        if !active && !state.slots.contains_key(layer) {
            return;
        }
        let slot = state
            .slots
            .entry(layer.clone())
            .or_insert_with(|| LayerSlot::new(def, now));

        let mut t = Transitions::default();
        match (slot.state, active) {
            (LayerState::Unloaded, true) => {
                slot.state = LayerState::Pending;
                slot.since = now;
            }
            (LayerState::Pending, false) => slot.state = LayerState::Unloaded,
            (LayerState::Loaded, false) => {
                slot.state = LayerState::Unloading;
                slot.since = now;
                t.deactivated = true;
            }
            (LayerState::Unloading, true) => {
                slot.state = LayerState::Loaded;
                t.activated = true;
            }
            _ => {}
        }
        // Dwell checks run after the edge so zero debounces commit in the same tick.
        let dwell = now.saturating_sub(slot.since);
        match slot.state {
            LayerState::Pending if dwell >= self.config.activate_debounce() => {
                slot.state = LayerState::Loaded;
                t.activated = true;
            }
            LayerState::Unloading if dwell >= self.config.deactivate_debounce() => {
                slot.state = LayerState::Unloaded;
            }
            _ => {}
        }
        let new_state = slot.state;

        if t.deactivated {
            debug!(cell = %cell, layer = %layer, "Layer deactivated");
            self.events.push(StreamingEvent::LayerDeactivated {
                cell,
                layer: layer.clone(),
            });
        }
        if t.activated {
            debug!(cell = %cell, layer = %layer, "Layer activated");
            self.events.push(StreamingEvent::LayerActivated {
                cell,
                layer: layer.clone(),
            });
        }
        if t.activated || new_state == LayerState::Unloaded {
            self.reconcile(cell, layer);
        }
    }

    /// Issues, cancels or waits on requests so each asset of the layer moves
    /// towards the residency its state wants. Drops the slot once settled.
    fn reconcile(&mut self, cell: CellCoord, layer: &LayerId) {
        let Some(slot) = slot_mut(&mut self.cells, cell, layer) else {
            return;
        };
        let resident = slot.state.wants_resident();
        let work: Vec<(usize, Work)> = slot
            .assets
            .iter_mut()
            .enumerate()
            .filter_map(|(i, asset)| asset.next_work(resident).map(|w| (i, w)))
            .collect();

        for (index, item) in work {
            match item {
                Work::Load => self.issue_load(cell, layer, index),
                Work::Unload(handle) => self.issue_unload(cell, layer, index, handle),
                Work::Cancel(request) => self.cancel(request),
            }
        }

        if let Some(state) = self.cells.get_mut(&cell) {
            if state.slots.get(layer).is_some_and(LayerSlot::is_disposable) {
                state.slots.remove(layer);
            }
        }
    }

    // ========================================================================
    // REQUESTS
    // ========================================================================

    fn next_request_id(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId(self.next_request)
    }

    fn issue_load(&mut self, cell: CellCoord, layer: &LayerId, index: usize) {
        let Some(asset) = slot_mut(&mut self.cells, cell, layer).and_then(|s| s.assets.get_mut(index)) else {
            return;
        };
        let reference = asset.reference.clone();

        let Some(descriptor) = self.registry.resolve(&reference) else {
            asset.failed = Some(StreamingOperation::Load);
            asset.attempts = 0;
            self.report_failure(StreamingFailure {
                cell,
                layer: layer.clone(),
                asset: reference.clone(),
                operation: StreamingOperation::Load,
                attempts: 1,
                error: StreamingError::NotFound(reference),
            });
            return;
        };

        self.next_request += 1;
        let request = RequestId(self.next_request);
        asset.pending = Some((request, StreamingOperation::Load));
        asset.attempts += 1;
        self.in_flight.insert(
            request,
            InFlight {
                operation: StreamingOperation::Load,
                cell,
                layer: layer.clone(),
                asset_index: index,
                asset: reference.clone(),
                abandoned: false,
            },
        );
        self.stats.load_requests += 1;
        self.events.push(StreamingEvent::LoadRequested {
            cell,
            layer: layer.clone(),
            asset: reference,
            request,
        });
        self.service
            .request_load(request, &descriptor, CompletionSender::new(self.completion_tx.clone()));
    }

    fn issue_unload(&mut self, cell: CellCoord, layer: &LayerId, index: usize, handle: StreamHandle) {
        let request = self.next_request_id();
        let Some(asset) = slot_mut(&mut self.cells, cell, layer).and_then(|s| s.assets.get_mut(index)) else {
            return;
        };
        asset.pending = Some((request, StreamingOperation::Unload));
        asset.attempts += 1;
        let reference = asset.reference.clone();
        self.send_unload(request, cell, layer, index, reference, handle, false);
    }

    /// Unload for an asset no cell owns any more. Not retried.
    fn issue_orphan_unload(&mut self, cell: CellCoord, layer: &LayerId, reference: AssetRef, handle: StreamHandle) {
        let request = self.next_request_id();
        self.send_unload(request, cell, layer, usize::MAX, reference, handle, true);
    }

    #[allow(clippy::too_many_arguments)]
    fn send_unload(
        &mut self,
        request: RequestId,
        cell: CellCoord,
        layer: &LayerId,
        asset_index: usize,
        reference: AssetRef,
        handle: StreamHandle,
        abandoned: bool,
    ) {
        self.in_flight.insert(
            request,
            InFlight {
                operation: StreamingOperation::Unload,
                cell,
                layer: layer.clone(),
                asset_index,
                asset: reference.clone(),
                abandoned,
            },
        );
        self.stats.unload_requests += 1;
        self.events.push(StreamingEvent::UnloadRequested {
            cell,
            layer: layer.clone(),
            asset: reference,
            request,
        });
        self.service
            .request_unload(request, handle, CompletionSender::new(self.completion_tx.clone()));
    }

    fn cancel(&mut self, request: RequestId) {
        if let Some(flight) = self.in_flight.get_mut(&request) {
            flight.abandoned = true;
            self.stats.cancellations += 1;
            debug!(cell = %flight.cell, layer = %flight.layer, asset = %flight.asset, ?request, "Cancelled load");
            self.service.cancel(request);
        }
    }

    fn report_failure(&mut self, failure: StreamingFailure) {
        warn!(
            cell = %failure.cell,
            layer = %failure.layer,
            asset = %failure.asset,
            operation = ?failure.operation,
            attempts = failure.attempts,
            error = %failure.error,
            "Streaming request failed"
        );
        self.stats.failures += 1;
        self.events.push(StreamingEvent::Failure(failure));
    }

    // ========================================================================
    // COMPLETIONS
    // ========================================================================

    fn apply_completion(&mut self, completion: StreamingCompletion) {
        let Some(flight) = self.in_flight.remove(&completion.request) else {
            debug!(request = ?completion.request, "Completion for unknown request");
            self.stats.discarded_completions += 1;
            return;
        };

        let owned = !flight.abandoned
            && slot_mut(&mut self.cells, flight.cell, &flight.layer)
                .and_then(|s| s.assets.get(flight.asset_index))
                .is_some_and(|a| a.pending == Some((completion.request, flight.operation)));
        if !owned {
            self.apply_abandoned(flight, completion.outcome);
            return;
        }

        let now = self.now;
        let max_retries = self.config.max_retries;
        let Some(asset) =
            slot_mut(&mut self.cells, flight.cell, &flight.layer).and_then(|s| s.assets.get_mut(flight.asset_index))
        else {
            return;
        };
        asset.pending = None;

        match completion.outcome {
            StreamingOutcome::Loaded(handle) => {
                asset.handle = Some(handle);
                asset.attempts = 0;
                self.events.push(StreamingEvent::AssetLoaded {
                    cell: flight.cell,
                    layer: flight.layer.clone(),
                    asset: flight.asset,
                    handle,
                });
            }
            StreamingOutcome::Unloaded => {
                asset.handle = None;
                asset.attempts = 0;
                self.events.push(StreamingEvent::AssetUnloaded {
                    cell: flight.cell,
                    layer: flight.layer.clone(),
                    asset: flight.asset,
                });
            }
            StreamingOutcome::Failed(error) if asset.attempts <= max_retries => {
                let delay = self.config.retry_delay(asset.attempts, &mut self.rng);
                asset.retry = Some((flight.operation, now + delay));
                self.stats.retries += 1;
                debug!(
                    cell = %flight.cell,
                    layer = %flight.layer,
                    asset = %flight.asset,
                    attempt = asset.attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Retrying streaming request"
                );
            }
            StreamingOutcome::Failed(error) => {
                let attempts = asset.attempts;
                asset.attempts = 0;
                if flight.operation == StreamingOperation::Unload {
                    // Given up: the asset is no longer tracked as resident.
                    asset.handle = None;
                } else {
                    asset.failed = Some(StreamingOperation::Load);
                }
                self.report_failure(StreamingFailure {
                    cell: flight.cell,
                    layer: flight.layer.clone(),
                    asset: flight.asset,
                    operation: flight.operation,
                    attempts,
                    error,
                });
            }
        }

        self.reconcile(flight.cell, &flight.layer);
        self.refresh_idle(flight.cell);
    }

    fn apply_abandoned(&mut self, flight: InFlight, outcome: StreamingOutcome) {
        match (flight.operation, outcome) {
            (StreamingOperation::Load, StreamingOutcome::Loaded(handle)) => {
                debug!(cell = %flight.cell, layer = %flight.layer, asset = %flight.asset, "Unloading late load");
                self.stats.discarded_completions += 1;
                self.issue_orphan_unload(flight.cell, &flight.layer, flight.asset, handle);
            }
            (StreamingOperation::Unload, StreamingOutcome::Unloaded) => {
                self.events.push(StreamingEvent::AssetUnloaded {
                    cell: flight.cell,
                    layer: flight.layer,
                    asset: flight.asset,
                });
            }
            (StreamingOperation::Unload, StreamingOutcome::Failed(error)) => {
                self.report_failure(StreamingFailure {
                    cell: flight.cell,
                    layer: flight.layer,
                    asset: flight.asset,
                    operation: StreamingOperation::Unload,
                    attempts: 1,
                    error,
                });
            }
            _ => self.stats.discarded_completions += 1,
        }
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    fn fire_due_retries(&mut self) {
        let now = self.now;
        let mut due = Vec::new();
        for (&cell, state) in &mut self.cells {
            for (layer, slot) in &mut state.slots {
                let mut any = false;
                for asset in &mut slot.assets {
                    if asset.retry.is_some_and(|(_, at)| at <= now) {
                        asset.retry = None;
                        any = true;
                    }
                }
                if any {
                    due.push((cell, layer.clone()));
                }
            }
        }
        for (cell, layer) in due {
            self.reconcile(cell, &layer);
            self.refresh_idle(cell);
        }
    }

    fn settle_stale_cells(&mut self) {
        let now = self.now;
        let stale_after = self.config.stale_after();
        let stale: Vec<CellCoord> = self
            .cells
            .iter()
            .filter(|(_, c)| {
                !c.slots.is_empty() && c.last_tick < now && now.saturating_sub(c.last_tick) >= stale_after
            })
            .map(|(&cell, _)| cell)
            .collect();
        for cell in stale {
            let center = cell.center(self.config.cell_size);
            self.evaluate_cell(cell, &ResolvedSample::empty(center));
        }
    }

    fn refresh_idle(&mut self, cell: CellCoord) {
        let now = self.now;
        if let Some(state) = self.cells.get_mut(&cell) {
            if state.slots.is_empty() {
                state.idle_since.get_or_insert(now);
            } else {
                state.idle_since = None;
            }
        }
    }

    fn evict_idle_cells(&mut self) {
        let now = self.now;
        let idle_for = self.config.idle_eviction();
        let idle: Vec<CellCoord> = self
            .cells
            .iter()
            .filter(|(_, c)| c.last_tick < now && c.idle_since.is_some_and(|t| now.saturating_sub(t) >= idle_for))
            .map(|(&cell, _)| cell)
            .collect();
        for cell in idle {
            self.cells.remove(&cell);
            self.stats.cell_evictions += 1;
            debug!(cell = %cell, "Evicted idle streaming cell");
            self.events.push(StreamingEvent::CellEvicted { cell });
        }
    }

    fn force_evict(&mut self, cell: CellCoord) {
        let Some(state) = self.cells.remove(&cell) else {
            return;
        };
        for (layer, slot) in state.slots {
            if slot.state.wants_resident() {
                self.events.push(StreamingEvent::LayerDeactivated {
                    cell,
                    layer: layer.clone(),
                });
            }
            for asset in slot.assets {
                if let Some((request, op)) = asset.pending {
                    if op == StreamingOperation::Load {
                        self.cancel(request);
                    } else if let Some(flight) = self.in_flight.get_mut(&request) {
                        flight.abandoned = true;
                    }
                }
                if let Some(handle) = asset.handle {
                    if !matches!(asset.pending, Some((_, StreamingOperation::Unload))) {
                        self.issue_orphan_unload(cell, &layer, asset.reference, handle);
                    }
                }
            }
        }
        self.stats.cell_evictions += 1;
        info!(cell = %cell, "Force-evicted streaming cell");
        self.events.push(StreamingEvent::CellEvicted { cell });
    }
}

impl std::fmt::Debug for StreamingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingController")
            .field("now", &self.now)
            .field("stats", &self.stats())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}
