//! Recording host collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use stratum_layers::{
    AssetDescriptor, AssetRef, AssetStreamingService, CompletionSender, EffectError, EffectInstanceHandle,
    EffectRuntime, LayerCatalog, LayerDefinition, RequestId, StreamHandle, StreamingError, StreamingOutcome,
};
use stratum_mask::{DataFormat, MaskCacheConfig, MaskField, MaskSource, MaskStore, PixelGrid};
use stratum_shared::Vec2;

/// Side of the square every test mask covers, anchored at the origin.
pub const WORLD: f32 = 256.0;

/// One request seen by [`RecordingService`].
#[derive(Clone, Debug)]
pub enum Request {
    Load(RequestId, AssetRef),
    Unload(RequestId, StreamHandle),
}

/// Streaming service that records requests and, in auto mode, answers
/// each one immediately through the completion queue.
#[derive(Default)]
pub struct RecordingService {
    pub auto_complete: Mutex<bool>,
    /// Failures to inject before answering successfully.
    pub failures_left: Mutex<u32>,
    pub requests: Mutex<Vec<Request>>,
    pub held: Mutex<Vec<(RequestId, CompletionSender)>>,
    pub cancelled: Mutex<Vec<RequestId>>,
}

impl RecordingService {
    pub fn auto() -> Arc<Self> {
        let service = Self::default();
        *service.auto_complete.lock() = true;
        Arc::new(service)
    }

    pub fn manual() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn loads(&self) -> usize {
        self.requests.lock().iter().filter(|r| matches!(r, Request::Load(..))).count()
    }

    pub fn unloads(&self) -> usize {
        self.requests.lock().iter().filter(|r| matches!(r, Request::Unload(..))).count()
    }

    /// Answers every held request with `outcome`.
    pub fn complete_held(&self, outcome: impl Fn(RequestId) -> StreamingOutcome) {
        for (id, reply) in std::mem::take(&mut *self.held.lock()) {
            reply.complete(id, outcome(id));
        }
    }

    fn answer(&self, request: RequestId, reply: CompletionSender, success: StreamingOutcome) {
        if !*self.auto_complete.lock() {
            self.held.lock().push((request, reply));
            return;
        }
        let mut failures = self.failures_left.lock();
        if *failures > 0 {
            *failures -= 1;
            reply.complete(request, StreamingOutcome::Failed(StreamingError::Unavailable("io busy".into())));
        } else {
            reply.complete(request, success);
        }
    }
}

impl AssetStreamingService for RecordingService {
    fn request_load(&self, request: RequestId, asset: &AssetDescriptor, reply: CompletionSender) {
        self.requests.lock().push(Request::Load(request, asset.reference.clone()));
        self.answer(request, reply, StreamingOutcome::Loaded(StreamHandle(request.0 + 1_000)));
    }

    fn request_unload(&self, request: RequestId, handle: StreamHandle, reply: CompletionSender) {
        self.requests.lock().push(Request::Unload(request, handle));
        self.answer(request, reply, StreamingOutcome::Unloaded);
    }

    fn cancel(&self, request: RequestId) {
        self.cancelled.lock().push(request);
    }
}

/// Effect runtime that hands out sequential handles and records calls.
#[derive(Default)]
pub struct RecordingRuntime {
    next: Mutex<u64>,
    pub spawned: Mutex<Vec<(EffectInstanceHandle, AssetRef, Vec2)>>,
    pub parameters: Mutex<Vec<(EffectInstanceHandle, String, f32)>>,
    pub destroyed: Mutex<Vec<EffectInstanceHandle>>,
}

impl RecordingRuntime {
    /// Latest value pushed for `name` on `handle`.
    pub fn last_parameter(&self, handle: EffectInstanceHandle, name: &str) -> Option<f32> {
        self.parameters
            .lock()
            .iter()
            .rev()
            .find(|(h, n, _)| *h == handle && n == name)
            .map(|(_, _, v)| *v)
    }
}

impl EffectRuntime for RecordingRuntime {
    fn spawn(&self, template: &AssetRef, position: Vec2) -> Result<EffectInstanceHandle, EffectError> {
        let mut next = self.next.lock();
        *next += 1;
        let handle = EffectInstanceHandle(*next);
        self.spawned.lock().push((handle, template.clone(), position));
        Ok(handle)
    }

    fn set_parameter(&self, instance: EffectInstanceHandle, name: &str, value: f32) {
        self.parameters.lock().push((instance, name.to_string(), value));
    }

    fn destroy(&self, instance: EffectInstanceHandle) {
        self.destroyed.lock().push(instance);
    }
}

/// Registers and caches a mask holding `value` on every channel.
pub fn constant_mask(store: &MaskStore, catalog: &mut LayerCatalog, path: &str, value: f32) {
    let source = MaskSource::new(path, Vec2::ZERO, Vec2::new(WORLD, WORLD)).with_format(DataFormat::R16F);
    catalog.register_mask_bounds(path, source.bounds()).unwrap();
    store.register(source.clone()).unwrap();
    store.insert(MaskField::from_grid(&source, &PixelGrid::uniform(8, 8, [value; 4])).unwrap());
}

/// Frozen catalog where each layer reads its own constant mask.
pub fn constant_world(layers: Vec<(LayerDefinition, f32)>) -> (Arc<LayerCatalog>, Arc<MaskStore>) {
    let store = MaskStore::new(MaskCacheConfig::default());
    let mut catalog = LayerCatalog::new();
    for (layer, value) in layers {
        let path = layer.mask.to_string_lossy().into_owned();
        constant_mask(&store, &mut catalog, &path, value);
        catalog.add_layer(layer).unwrap();
    }
    catalog.freeze();
    (Arc::new(catalog), Arc::new(store))
}
