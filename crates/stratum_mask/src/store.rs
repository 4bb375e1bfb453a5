//! # Mask Store
//!
//! Decodes mask images into [`MaskField`]s and caches them by source path.
//!
//! ## Architecture
//!
//! ```text
//!   simulation thread                      decode workers
//!   -----------------                      --------------
//!   request_load(path) ------spawn-------> read + decode + build
//!                                                  |
//!   poll_completions() <----crossbeam------ (ticket, path, result)
//!        |
//!        v
//!   RwLock<cache>  <---- sample()/get() read lock, many readers
//! ```
//!
//! The cache is read-mostly: lookups take a shared lock and bump an atomic
//! recency stamp; only installs and invalidations take the write lock. The
//! cache is bounded by entry count and decoded bytes, evicting the entry
//! sampled least recently. Querying a registered mask that is not cached
//! queues it for decoding again, so an evicted mask comes back on its own
//! once it is sampled.
//!
//! Failed paths are remembered. A layer reading a failed mask samples 0
//! (inactive) until [`MaskStore::invalidate`] clears the failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stratum_shared::{Bounds2, Vec2};
use tracing::{debug, info, warn};

use crate::decoder::{DefaultDecoder, ImageDecoder};
use crate::error::{MaskError, MaskResult};
use crate::field::MaskField;
use crate::format::Channel;
use crate::source::MaskSource;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Cache bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskCacheConfig {
    /// Maximum number of decoded fields kept.
    pub max_entries: usize,
    /// Maximum decoded bytes kept across all fields.
    pub max_bytes: usize,
}

impl Default for MaskCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

impl MaskCacheConfig {
    /// Bounds for a shipping world with many large masks.
    #[must_use]
    pub fn production() -> Self {
        Self {
            max_entries: 256,
            max_bytes: 1024 * 1024 * 1024,
        }
    }
}

// ============================================================================
// COMPLETIONS & STATS
// ============================================================================

/// Result of a background decode, installed by [`MaskStore::poll_completions`].
#[derive(Debug, Clone)]
pub struct MaskCompletion {
    /// Source path.
    pub path: PathBuf,
    /// The installed field, or why decoding failed.
    pub result: MaskResult<Arc<MaskField>>,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskStoreStats {
    /// Fields currently cached.
    pub entries: usize,
    /// Decoded bytes currently cached.
    pub bytes: usize,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that had to decode.
    pub misses: u64,
    /// Fields dropped to stay within bounds.
    pub evictions: u64,
    /// Paths currently marked as failed.
    pub failures: usize,
    /// Background decodes not yet installed.
    pub in_flight: usize,
}

struct CacheEntry {
    field: Arc<MaskField>,
    last_used: AtomicU64,
}

struct DecodeMessage {
    ticket: u64,
    path: PathBuf,
    result: MaskResult<MaskField>,
}

// ============================================================================
// STORE
// ============================================================================

/// Decoded mask cache. Shareable across threads.
pub struct MaskStore {
    config: MaskCacheConfig,
    decoder: Arc<dyn ImageDecoder>,
    sources: RwLock<HashMap<PathBuf, MaskSource>>,
    cache: RwLock<HashMap<PathBuf, CacheEntry>>,
    failures: RwLock<HashMap<PathBuf, MaskError>>,
    /// Path -> ticket of the decode whose result is still wanted.
    in_flight: Mutex<HashMap<PathBuf, u64>>,
    clock: AtomicU64,
    next_ticket: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    completion_tx: Sender<DecodeMessage>,
    completion_rx: Receiver<DecodeMessage>,
}

impl MaskStore {
    /// Store using the `image`-crate decoder.
    #[must_use]
    pub fn new(config: MaskCacheConfig) -> Self {
        Self::with_decoder(config, Arc::new(DefaultDecoder))
    }

    /// Store using a host-provided decoder.
    #[must_use]
    pub fn with_decoder(config: MaskCacheConfig, decoder: Arc<dyn ImageDecoder>) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        Self {
            config,
            decoder,
            sources: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            next_ticket: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            completion_tx,
            completion_rx,
        }
    }

    // ========================================================================
    // SOURCES
    // ========================================================================

    /// Registers where a mask lives and how it is placed.
    ///
    /// Re-registering a path replaces its source and drops any cached field.
    ///
    /// # Errors
    ///
    /// [`MaskError::InvalidPlacement`] if the placement cannot produce a grid.
    pub fn register(&self, source: MaskSource) -> MaskResult<()> {
        source.validate()?;
        let path = source.path.clone();
        let replaced = self.sources.write().insert(path.clone(), source).is_some();
        if replaced {
            self.invalidate(&path);
        }
        debug!(mask = %path.display(), replaced, "Registered mask source");
        Ok(())
    }

    /// Authored source of a registered mask.
    #[must_use]
    pub fn source(&self, path: &Path) -> Option<MaskSource> {
        self.sources.read().get(path).cloned()
    }

    /// True if `path` has a registered source.
    #[must_use]
    pub fn is_registered(&self, path: &Path) -> bool {
        self.sources.read().contains_key(path)
    }

    /// All registered paths, sorted.
    #[must_use]
    pub fn registered_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.sources.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// World bounds of a registered mask. Known without decoding it.
    #[must_use]
    pub fn bounds(&self, path: &Path) -> Option<Bounds2> {
        self.sources.read().get(path).map(MaskSource::bounds)
    }

    // ========================================================================
    // LOADING
    // ========================================================================

    /// Returns the decoded field for `path`, decoding on this thread if needed.
    ///
    /// Masks without an image are built from their default value and never
    /// touch the filesystem.
    ///
    /// # Errors
    ///
    /// [`MaskError::NotRegistered`] for unknown paths, [`MaskError::Io`] if
    /// the file cannot be read, [`MaskError::Decode`] or
    /// [`MaskError::UnsupportedFormat`] for bad image data. A failure is
    /// remembered and returned again until the path is invalidated.
    pub fn load(&self, path: impl AsRef<Path>) -> MaskResult<Arc<MaskField>> {
        let path = path.as_ref();
        if let Some(field) = self.get(path) {
            return Ok(field);
        }
        if let Some(err) = self.failure(path) {
            return Err(err);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let source = self.source(path).ok_or_else(|| MaskError::NotRegistered(path.to_path_buf()))?;
        match decode_source(self.decoder.as_ref(), &source) {
            Ok(field) => Ok(self.install(field)),
            Err(err) => {
                self.record_failure(path, err.clone());
                Err(err)
            }
        }
    }

    /// Decodes `bytes` as the registered mask at `path` and caches it.
    ///
    /// # Errors
    ///
    /// As [`MaskStore::load`], minus I/O.
    pub fn load_from_bytes(&self, path: impl AsRef<Path>, bytes: &[u8]) -> MaskResult<Arc<MaskField>> {
        let path = path.as_ref();
        let source = self.source(path).ok_or_else(|| MaskError::NotRegistered(path.to_path_buf()))?;
        match decode_bytes(self.decoder.as_ref(), &source, bytes) {
            Ok(field) => Ok(self.install(field)),
            Err(err) => {
                self.record_failure(path, err.clone());
                Err(err)
            }
        }
    }

    /// Caches an already built field under its source path.
    pub fn insert(&self, field: MaskField) -> Arc<MaskField> {
        self.install(field)
    }

    /// Starts decoding `path` on a background worker.
    ///
    /// Returns false if the field is already cached, already decoding,
    /// marked failed, or not registered.
    pub fn request_load(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if self.contains(path) || self.failure(path).is_some() {
            return false;
        }
        let Some(source) = self.source(path) else {
            self.record_failure(path, MaskError::NotRegistered(path.to_path_buf()));
            return false;
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(path) {
                return false;
            }
            in_flight.insert(path.to_path_buf(), ticket);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let decoder = Arc::clone(&self.decoder);
        let tx = self.completion_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("mask-decode-{ticket}"))
            .spawn(move || {
                let result = decode_source(decoder.as_ref(), &source);
                // Receiver lives as long as the store; a send error means the store is gone.
                let _ = tx.send(DecodeMessage {
                    ticket,
                    path: source.path,
                    result,
                });
            });

        if let Err(e) = spawned {
            self.in_flight.lock().remove(path);
            self.record_failure(path, MaskError::io(path, &e));
            return false;
        }
        debug!(mask = %path.display(), ticket, "Queued background mask decode");
        true
    }

    /// Installs finished background decodes. Call once per simulation step.
    ///
    /// Results superseded by [`MaskStore::invalidate`] are discarded.
    pub fn poll_completions(&self) -> Vec<MaskCompletion> {
        let mut done = Vec::new();
        while let Ok(msg) = self.completion_rx.try_recv() {
            let wanted = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(&msg.path) {
                    Some(&ticket) if ticket == msg.ticket => {
                        in_flight.remove(&msg.path);
                        true
                    }
                    _ => false,
                }
            };
            if !wanted {
                debug!(mask = %msg.path.display(), ticket = msg.ticket, "Discarding superseded mask decode");
                continue;
            }

            let result = match msg.result {
                Ok(field) => Ok(self.install(field)),
                Err(err) => {
                    self.record_failure(&msg.path, err.clone());
                    Err(err)
                }
            };
            done.push(MaskCompletion { path: msg.path, result });
        }
        done
    }

    /// True while a background decode for `path` is outstanding.
    #[must_use]
    pub fn is_loading(&self, path: &Path) -> bool {
        self.in_flight.lock().contains_key(path)
    }

    // ========================================================================
    // LOOKUP & SAMPLING
    // ========================================================================

    /// Cached field for `path`, without decoding. Refreshes its recency.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<Arc<MaskField>> {
        let cache = self.cache.read();
        let entry = cache.get(path)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&entry.field))
    }

    /// True if a decoded field for `path` is cached.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.cache.read().contains_key(path)
    }

    /// Cached field for a query. A registered mask that is not cached (never
    /// loaded, or evicted by the cache bound) is queued for background
    /// decoding, so it reads again once [`MaskStore::poll_completions`]
    /// installs it.
    fn query(&self, path: &Path) -> Option<Arc<MaskField>> {
        let field = self.get(path);
        if field.is_none() && self.is_registered(path) && !self.is_loading(path) && self.failure(path).is_none() {
            self.request_load(path);
        }
        field
    }

    /// Samples a mask. Missing, failed, or still-decoding masks read as 0.
    #[must_use]
    pub fn sample(&self, path: &Path, pos: Vec2, channel: Channel) -> f32 {
        self.query(path).map_or(0.0, |field| field.sample(pos, channel))
    }

    /// Raw RGBA of the pixel under `pos`.
    #[must_use]
    pub fn value_at(&self, path: &Path, pos: Vec2) -> Option<[f32; 4]> {
        self.query(path)?.value_at(pos)
    }

    /// Nearest tracked pixel with `value`. See [`MaskField::find_nearest_with_value`].
    #[must_use]
    pub fn find_nearest_with_value(&self, path: &Path, origin: Vec2, max_radius: f32, value: [f32; 4]) -> Option<Vec2> {
        self.query(path)?.find_nearest_with_value(origin, max_radius, value)
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Drops the cached field, failure record and any pending decode for
    /// `path`, so the next load decodes again. Returns true if anything was dropped.
    pub fn invalidate(&self, path: &Path) -> bool {
        let cached = self.cache.write().remove(path).is_some();
        let failed = self.failures.write().remove(path).is_some();
        let pending = self.in_flight.lock().remove(path).is_some();
        if cached || failed || pending {
            info!(mask = %path.display(), cached, failed, pending, "Invalidated mask");
        }
        cached || failed || pending
    }

    /// Failure recorded for `path`, if any.
    #[must_use]
    pub fn failure(&self, path: &Path) -> Option<MaskError> {
        self.failures.read().get(path).cloned()
    }

    /// Cache counters.
    #[must_use]
    pub fn stats(&self) -> MaskStoreStats {
        let cache = self.cache.read();
        MaskStoreStats {
            entries: cache.len(),
            bytes: cache.values().map(|e| e.field.byte_size()).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            failures: self.failures.read().len(),
            in_flight: self.in_flight.lock().len(),
        }
    }

    /// Cache bounds.
    #[must_use]
    pub const fn config(&self) -> &MaskCacheConfig {
        &self.config
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn install(&self, field: MaskField) -> Arc<MaskField> {
        let path = field.source().to_path_buf();
        let field = Arc::new(field);
        info!(
            mask = %path.display(),
            width = field.width(),
            height = field.height(),
            format = ?field.format(),
            bytes = field.byte_size(),
            "Mask decoded"
        );

        let mut cache = self.cache.write();
        cache.insert(
            path.clone(),
            CacheEntry {
                field: Arc::clone(&field),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        self.failures.write().remove(&path);
        self.evict_over_budget(&mut cache, &path);
        field
    }

    /// Drops least-recently-sampled entries until within bounds. Never drops `keep`.
    fn evict_over_budget(&self, cache: &mut HashMap<PathBuf, CacheEntry>, keep: &Path) {
        loop {
            let bytes: usize = cache.values().map(|e| e.field.byte_size()).sum();
            if cache.len() <= self.config.max_entries && bytes <= self.config.max_bytes {
                return;
            }
            let victim = cache
                .iter()
                .filter(|(p, _)| p.as_path() != keep)
                .min_by(|a, b| {
                    let (sa, sb) = (a.1.last_used.load(Ordering::Relaxed), b.1.last_used.load(Ordering::Relaxed));
                    sa.cmp(&sb).then_with(|| a.0.cmp(b.0))
                })
                .map(|(p, _)| p.clone());
            let Some(victim) = victim else {
                return;
            };
            cache.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(mask = %victim.display(), "Evicted mask from cache");
        }
    }

    fn record_failure(&self, path: &Path, err: MaskError) {
        warn!(mask = %path.display(), error = %err, "Mask failed to load; layers reading it stay inactive");
        self.failures.write().insert(path.to_path_buf(), err);
    }
}

impl std::fmt::Debug for MaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskStore")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn decode_source(decoder: &dyn ImageDecoder, source: &MaskSource) -> MaskResult<MaskField> {
    if source.blank {
        return MaskField::from_default(source);
    }
    let bytes = std::fs::read(&source.path).map_err(|e| MaskError::io(&source.path, &e))?;
    decode_bytes(decoder, source, &bytes)
}

fn decode_bytes(decoder: &dyn ImageDecoder, source: &MaskSource, bytes: &[u8]) -> MaskResult<MaskField> {
    let grid = decoder.decode(bytes)?;
    MaskField::from_grid(source, &grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::PixelGrid;

    /// Decoder that ignores the bytes and returns a fixed grid.
    struct FixedDecoder(PixelGrid);

    impl ImageDecoder for FixedDecoder {
        fn decode(&self, _bytes: &[u8]) -> MaskResult<PixelGrid> {
            Ok(self.0.clone())
        }
    }

    fn source(name: &str) -> MaskSource {
        MaskSource::new(name, Vec2::ZERO, Vec2::new(16.0, 16.0))
    }

    fn field(name: &str, value: f32) -> MaskField {
        MaskField::from_grid(&source(name), &PixelGrid::uniform(4, 4, [value; 4])).unwrap()
    }

    #[test]
    fn test_missing_mask_samples_zero() {
        let store = MaskStore::new(MaskCacheConfig::default());
        assert_eq!(store.sample(Path::new("nope.png"), Vec2::new(1.0, 1.0), Channel::R), 0.0);
        assert_eq!(store.load("nope.png").unwrap_err(), MaskError::NotRegistered(PathBuf::from("nope.png")));
    }

    #[test]
    fn test_lru_evicts_least_recently_sampled() {
        let store = MaskStore::new(MaskCacheConfig {
            max_entries: 2,
            max_bytes: usize::MAX,
        });
        store.insert(field("a.png", 0.1));
        store.insert(field("b.png", 0.2));
        // Touch a so b becomes the oldest.
        let _ = store.sample(Path::new("a.png"), Vec2::new(1.0, 1.0), Channel::R);
        store.insert(field("c.png", 0.3));

        assert!(store.contains(Path::new("a.png")));
        assert!(!store.contains(Path::new("b.png")));
        assert!(store.contains(Path::new("c.png")));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_evicted_mask_reloads_on_sample() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MaskStore::new(MaskCacheConfig {
            max_entries: 1,
            max_bytes: usize::MAX,
        });
        let paths: Vec<PathBuf> = ["a.png", "b.png"].iter().map(|n| dir.path().join(n)).collect();
        for path in &paths {
            let src = MaskSource::new(path, Vec2::ZERO, Vec2::new(16.0, 16.0));
            let grid = PixelGrid::uniform(4, 4, [1.0; 4]);
            std::fs::write(path, crate::export::encode_png(&MaskField::from_grid(&src, &grid).unwrap()).unwrap())
                .unwrap();
            store.register(src).unwrap();
            store.load(path).unwrap();
        }
        let (a, b) = (paths[0].as_path(), paths[1].as_path());
        assert!(!store.contains(a));
        assert!(store.contains(b));

        let at = Vec2::new(8.0, 8.0);
        assert_eq!(store.sample(a, at, Channel::R), 0.0);
        assert!(store.is_loading(a));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while store.is_loading(a) && std::time::Instant::now() < deadline {
            store.poll_completions();
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(store.sample(a, at, Channel::R), 1.0);
        assert!(!store.contains(b));
    }

    #[test]
    fn test_unregistered_sample_does_not_queue() {
        let store = MaskStore::new(MaskCacheConfig::default());
        let _ = store.sample(Path::new("ghost.png"), Vec2::ZERO, Channel::R);
        assert!(!store.is_loading(Path::new("ghost.png")));
        assert!(store.failure(Path::new("ghost.png")).is_none());
    }

    #[test]
    fn test_blank_mask_needs_no_file() {
        let store = MaskStore::new(MaskCacheConfig::default());
        store
            .register(source("no/such/dir/flat").without_image([0.6, 0.0, 0.0, 0.0]))
            .unwrap();
        let field = store.load("no/such/dir/flat").unwrap();
        assert_eq!((field.width(), field.height()), (1, 1));
        assert!((store.sample(Path::new("no/such/dir/flat"), Vec2::new(3.0, 3.0), Channel::R) - 0.6).abs() < 0.01);
    }

    #[test]
    fn test_byte_budget() {
        let store = MaskStore::new(MaskCacheConfig {
            max_entries: 100,
            max_bytes: 20,
        });
        store.insert(field("a.png", 0.1));
        store.insert(field("b.png", 0.2));
        let stats = store.stats();
        assert_eq!(stats.entries, 1);
        assert!(stats.bytes <= 20);
    }

    #[test]
    fn test_load_from_bytes_uses_decoder() {
        let store = MaskStore::with_decoder(
            MaskCacheConfig::default(),
            Arc::new(FixedDecoder(PixelGrid::uniform(2, 2, [0.6; 4]))),
        );
        store.register(source("m.png")).unwrap();
        let field = store.load_from_bytes("m.png", b"ignored").unwrap();
        assert_eq!((field.width(), field.height()), (2, 2));
        let w = store.sample(Path::new("m.png"), Vec2::new(8.0, 8.0), Channel::R);
        assert!((w - 0.6).abs() < 1.0 / 255.0);
    }

    #[test]
    fn test_failure_is_sticky_until_invalidate() {
        let store = MaskStore::new(MaskCacheConfig::default());
        store.register(source("/definitely/missing/mask.png")).unwrap();

        let err = store.load("/definitely/missing/mask.png").unwrap_err();
        assert!(matches!(err, MaskError::Io { .. }));
        assert!(store.failure(Path::new("/definitely/missing/mask.png")).is_some());
        assert!(!store.request_load("/definitely/missing/mask.png"));

        assert!(store.invalidate(Path::new("/definitely/missing/mask.png")));
        assert!(store.failure(Path::new("/definitely/missing/mask.png")).is_none());
    }

    #[test]
    fn test_register_rejects_bad_placement() {
        let store = MaskStore::new(MaskCacheConfig::default());
        let bad = MaskSource::new("bad.png", Vec2::ZERO, Vec2::new(-1.0, 1.0));
        assert!(store.register(bad).is_err());
        assert!(!store.is_registered(Path::new("bad.png")));
    }
}
