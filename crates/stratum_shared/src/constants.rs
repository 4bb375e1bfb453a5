//! # Engine Constants
//!
//! Defaults shared by the mask store, the streaming controller and the host
//! facade. Every one of them can be overridden from configuration.

/// Default streaming cell edge length in world units.
pub const DEFAULT_CELL_SIZE: f32 = 64.0;

/// Weights closer than this are considered equal.
///
/// Matches the quantisation step of an 8-bit mask channel with margin.
pub const WEIGHT_EPSILON: f32 = 1.0e-4;

/// Largest supported mask edge in pixels.
pub const MAX_MASK_DIMENSION: u32 = 16_384;
