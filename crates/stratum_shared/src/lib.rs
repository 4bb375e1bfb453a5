//! # STRATUM Shared
//!
//! World-space types used by every STRATUM crate.
//!
//! ## CRITICAL RULE
//!
//! This crate must NEVER depend on:
//! - image decoding
//! - threads or channels
//! - any host-engine collaborator
//!
//! If you need those, put them in `stratum_mask` or `stratum_layers`.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod cell;
pub mod constants;
pub mod math;

pub use cell::CellCoord;
pub use constants::{DEFAULT_CELL_SIZE, WEIGHT_EPSILON};
pub use math::{Bounds2, Vec2};
