//! World-space math used for mask placement and region queries.
//!
//! The world is treated as a 2D plane (X/Y); height plays no role in layer
//! resolution.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// 2D vector - world coordinates, sizes, pixel-space positions
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Vec2 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
}

impl Vec2 {
    /// Creates a new Vec2
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Zero vector
    pub const ZERO: Self = Self::new(0.0, 0.0);

    /// One on both axes
    pub const ONE: Self = Self::new(1.0, 1.0);

    /// Converts to array
    #[must_use]
    pub const fn to_array(self) -> [f32; 2] {
        [self.x, self.y]
    }

    /// Creates from array
    #[must_use]
    pub const fn from_array(arr: [f32; 2]) -> Self {
        Self::new(arr[0], arr[1])
    }

    /// Dot product
    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }

    /// Length squared (avoids sqrt)
    #[must_use]
    pub fn length_squared(self) -> f32 {
        self.dot(self)
    }

    /// Distance squared (avoids sqrt)
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f32 {
        (self - other).length_squared()
    }

    /// Distance to another point
    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        self.distance_squared(other).sqrt()
    }

    /// Component-wise multiply
    #[must_use]
    pub fn mul_elem(self, other: Self) -> Self {
        Self::new(self.x * other.x, self.y * other.y)
    }

    /// Component-wise divide
    #[must_use]
    pub fn div_elem(self, other: Self) -> Self {
        Self::new(self.x / other.x, self.y / other.y)
    }

    /// True if both components are finite and strictly positive.
    #[must_use]
    pub fn is_positive(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.x > 0.0 && self.y > 0.0
    }
}

impl std::ops::Add for Vec2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<f32> for Vec2 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

/// Axis-aligned world rectangle, half-open: `[min, max)`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Bounds2 {
    /// Inclusive lower corner
    pub min: Vec2,
    /// Exclusive upper corner
    pub max: Vec2,
}

impl Bounds2 {
    /// Creates bounds from two corners.
    #[must_use]
    pub const fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Creates bounds from an origin and a size.
    #[must_use]
    pub fn from_origin_size(origin: Vec2, size: Vec2) -> Self {
        Self::new(origin, origin + size)
    }

    /// Width and height.
    #[must_use]
    pub fn size(&self) -> Vec2 {
        self.max - self.min
    }

    /// Centre point.
    #[must_use]
    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    /// True if `point` lies inside (lower edges inclusive, upper exclusive).
    #[inline]
    #[must_use]
    pub fn contains(&self, point: Vec2) -> bool {
        point.x >= self.min.x && point.x < self.max.x && point.y >= self.min.y && point.y < self.max.y
    }

    /// Squared distance from `point` to the closest point of the rectangle.
    ///
    /// Zero when the point is inside.
    #[must_use]
    pub fn distance_squared_to(&self, point: Vec2) -> f32 {
        let dx = (self.min.x - point.x).max(0.0).max(point.x - self.max.x);
        let dy = (self.min.y - point.y).max(0.0).max(point.y - self.max.y);
        dx * dx + dy * dy
    }

    /// True if a circle of `radius` around `center` touches the rectangle.
    ///
    /// A zero radius degenerates to [`Bounds2::contains`].
    #[must_use]
    pub fn intersects_circle(&self, center: Vec2, radius: f32) -> bool {
        if radius <= 0.0 {
            return self.contains(center);
        }
        self.distance_squared_to(center) <= radius * radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec2_operations() {
        let a = Vec2::new(1.0, 2.0);
        let b = Vec2::new(4.0, 6.0);

        let sum = a + b;
        assert_eq!(sum, Vec2::new(5.0, 8.0));
        assert_eq!(a.dot(b), 16.0);
        assert_eq!(a.distance(b), 5.0);
    }

    #[test]
    fn test_bounds_half_open() {
        let b = Bounds2::from_origin_size(Vec2::new(-50.0, -50.0), Vec2::new(100.0, 100.0));
        assert!(b.contains(Vec2::new(-50.0, -50.0)));
        assert!(b.contains(Vec2::new(49.9, 0.0)));
        assert!(!b.contains(Vec2::new(50.0, 0.0)));
        assert_eq!(b.center(), Vec2::ZERO);
    }

    #[test]
    fn test_bounds_circle_intersection() {
        let b = Bounds2::from_origin_size(Vec2::ZERO, Vec2::new(10.0, 10.0));
        assert!(b.intersects_circle(Vec2::new(12.0, 5.0), 2.5));
        assert!(!b.intersects_circle(Vec2::new(12.0, 5.0), 1.5));
        assert!(!b.intersects_circle(Vec2::new(10.0, 5.0), 0.0));
    }

    #[test]
    fn test_vec2_bytemuck() {
        let v = Vec2::new(1.0, 2.0);
        let bytes: &[u8] = bytemuck::bytes_of(&v);
        assert_eq!(bytes.len(), 8);
    }
}
