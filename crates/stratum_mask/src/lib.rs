//! # STRATUM Mask
//!
//! Image-encoded weight fields for world layers.
//!
//! ## Pipeline
//!
//! ```text
//! MaskSource --(ImageDecoder)--> PixelGrid --(resample, linearise,
//!   quantise, index)--> MaskField --(MaskStore cache)--> sample()
//! ```
//!
//! ## Guarantees
//!
//! - Sampling never extrapolates: outside a field's bounds the weight is 0
//! - Samples are clamped to [0, 1]
//! - Fields are immutable; a changed source image is picked up only after
//!   [`MaskStore::invalidate`]
//! - A mask that fails to decode reads as 0 everywhere until invalidated

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod decoder;
pub mod error;
pub mod export;
pub mod field;
pub mod format;
pub mod quadtree;
pub mod source;
pub mod store;

pub use decoder::{DefaultDecoder, ImageDecoder, PixelGrid};
pub use error::{MaskError, MaskResult};
pub use export::{encode_png, export_png};
pub use field::MaskField;
pub use format::{Channel, ColorSpace, DataFormat, SamplingMode};
pub use quadtree::Quadtree;
pub use source::{MaskSource, ResolutionMode};
pub use store::{MaskCacheConfig, MaskCompletion, MaskStore, MaskStoreStats};
