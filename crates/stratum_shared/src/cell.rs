//! # Streaming Cells
//!
//! The world is bucketed into fixed-size square cells so load/unload
//! decisions are batched per cell instead of per query.
//!
//! Cell `(0, 0)` covers `[0, size) x [0, size)`; negative coordinates use
//! floor division, so `-0.5` lands in cell `-1`.

use serde::{Deserialize, Serialize};

use crate::math::{Bounds2, Vec2};

/// Cell coordinate (identifies a cell in the streaming grid).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    /// X coordinate (in cells, not world units).
    pub x: i32,
    /// Y coordinate (in cells, not world units).
    pub y: i32,
}

impl CellCoord {
    /// Creates a new cell coordinate.
    #[inline]
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Converts a world position to the cell containing it.
    #[inline]
    #[must_use]
    pub fn from_world(pos: Vec2, cell_size: f32) -> Self {
        Self {
            x: (pos.x / cell_size).floor() as i32,
            y: (pos.y / cell_size).floor() as i32,
        }
    }

    /// World position of the cell's lower corner.
    #[inline]
    #[must_use]
    pub fn origin(self, cell_size: f32) -> Vec2 {
        Vec2::new(self.x as f32 * cell_size, self.y as f32 * cell_size)
    }

    /// World position of the cell's centre.
    #[inline]
    #[must_use]
    pub fn center(self, cell_size: f32) -> Vec2 {
        let half = cell_size * 0.5;
        self.origin(cell_size) + Vec2::new(half, half)
    }

    /// World-space rectangle covered by the cell.
    #[must_use]
    pub fn bounds(self, cell_size: f32) -> Bounds2 {
        Bounds2::from_origin_size(self.origin(cell_size), Vec2::new(cell_size, cell_size))
    }

    /// Chebyshev distance in cells (ring index around `other`).
    #[inline]
    #[must_use]
    pub fn chebyshev_distance(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// All cells within `radius` rings of `self`, row-major, deterministic order.
    #[must_use]
    pub fn neighborhood(self, radius: u32) -> Vec<Self> {
        let r = radius as i32;
        let side = (2 * r + 1) as usize;
        let mut cells = Vec::with_capacity(side * side);
        for y in (self.y - r)..=(self.y + r) {
            for x in (self.x - r)..=(self.x + r) {
                cells.push(Self::new(x, y));
            }
        }
        cells
    }
}

impl std::fmt::Display for CellCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.x, self.y)
    }
}
