//! # STRATUM
//!
//! World-layer compositing and streaming.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              STRATUM                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐   │
//! │  │  stratum_mask   │────>│ stratum_layers  │────>│    stratum      │   │
//! │  │                 │     │                 │     │                 │   │
//! │  │  • Decode       │     │  • Catalog      │     │  • WorldLayers  │   │
//! │  │  • Sample       │     │  • Resolver     │     │  • Event bus    │   │
//! │  │  • Cache / LRU  │     │  • Streaming    │     │  • CI validator │   │
//! │  │  • Quadtree     │     │  • Effects      │     │                 │   │
//! │  └─────────────────┘     └─────────────────┘     └─────────────────┘   │
//! │           ▲                       ▲                                     │
//! │           └──── stratum_shared ───┘   (Vec2, Bounds2, CellCoord)        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `events`: event bus carrying mask and streaming side effects
//! - `world`: the per-step facade

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod events;
pub mod world;

pub use stratum_layers as layers;
pub use stratum_mask as mask;
pub use stratum_shared as shared;

pub use events::{EventBus, EventReceiver, EventSender, WorldLayerEvent, DEFAULT_EVENT_CAPACITY};
pub use world::{StepStats, WorldLayers, STEP_BUDGET};
