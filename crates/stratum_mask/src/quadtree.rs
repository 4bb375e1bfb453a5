//! # Point Quadtree
//!
//! Indexes world positions of mask pixels that carry a tracked value, so
//! "where is the nearest river pixel" does not scan the whole grid.
//!
//! ```text
//! +-------+-------+
//! |  NW   |  NE   |     A node splits into four equal quadrants once it
//! |   .   |  . .  |     holds more than `capacity` points, until
//! +-------+-------+     `MAX_DEPTH` is reached.
//! |  SW   |  SE   |
//! | .  .  |       |
//! +-------+-------+
//! ```

use stratum_shared::{Bounds2, Vec2};

const MAX_DEPTH: u32 = 12;

#[derive(Debug, Clone)]
struct Node {
    bounds: Bounds2,
    points: Vec<Vec2>,
    children: Option<Box<[Node; 4]>>,
}

impl Node {
    fn new(bounds: Bounds2) -> Self {
        Self {
            bounds,
            points: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, point: Vec2, capacity: usize, depth: u32) {
        if let Some(children) = self.children.as_mut() {
            let idx = quadrant(&self.bounds, point);
            children[idx].insert(point, capacity, depth + 1);
            return;
        }

        self.points.push(point);
        if self.points.len() > capacity && depth < MAX_DEPTH {
            self.split(capacity, depth);
        }
    }

    fn split(&mut self, capacity: usize, depth: u32) {
        let c = self.bounds.center();
        let (min, max) = (self.bounds.min, self.bounds.max);
        let mut children = Box::new([
            Node::new(Bounds2::new(min, c)),
            Node::new(Bounds2::new(Vec2::new(c.x, min.y), Vec2::new(max.x, c.y))),
            Node::new(Bounds2::new(Vec2::new(min.x, c.y), Vec2::new(c.x, max.y))),
            Node::new(Bounds2::new(c, max)),
        ]);
        for p in self.points.drain(..) {
            let idx = quadrant(&self.bounds, p);
            children[idx].insert(p, capacity, depth + 1);
        }
        self.children = Some(children);
    }

    fn nearest(&self, target: Vec2, best: &mut Option<(Vec2, f32)>) {
        let limit = best.map_or(f32::INFINITY, |(_, d)| d);
        if self.bounds.distance_squared_to(target) > limit {
            return;
        }

        for &p in &self.points {
            let d = p.distance_squared(target);
            if best.map_or(true, |(_, bd)| d < bd) {
                *best = Some((p, d));
            }
        }

        if let Some(children) = self.children.as_ref() {
            // Visit the quadrant holding the target first so pruning kicks in early.
            let first = quadrant(&self.bounds, target);
            children[first].nearest(target, best);
            for (i, child) in children.iter().enumerate() {
                if i != first {
                    child.nearest(target, best);
                }
            }
        }
    }
}

#[inline]
fn quadrant(bounds: &Bounds2, p: Vec2) -> usize {
    let c = bounds.center();
    usize::from(p.x >= c.x) | (usize::from(p.y >= c.y) << 1)
}

/// Quadtree over points inside a fixed rectangle.
#[derive(Debug, Clone)]
pub struct Quadtree {
    root: Node,
    capacity: usize,
    len: usize,
}

impl Quadtree {
    /// Default number of points a leaf holds before splitting.
    pub const DEFAULT_CAPACITY: usize = 8;

    /// Empty tree covering `bounds`.
    #[must_use]
    pub fn new(bounds: Bounds2) -> Self {
        Self::with_capacity(bounds, Self::DEFAULT_CAPACITY)
    }

    /// Empty tree with a custom leaf capacity.
    #[must_use]
    pub fn with_capacity(bounds: Bounds2, capacity: usize) -> Self {
        Self {
            root: Node::new(bounds),
            capacity: capacity.max(1),
            len: 0,
        }
    }

    /// Inserts a point. Returns false if it lies outside the tree bounds.
    pub fn insert(&mut self, point: Vec2) -> bool {
        if !self.root.bounds.contains(point) {
            return false;
        }
        self.root.insert(point, self.capacity, 0);
        self.len += 1;
        true
    }

    /// Nearest stored point within `max_radius` of `target`.
    #[must_use]
    pub fn find_nearest(&self, target: Vec2, max_radius: f32) -> Option<Vec2> {
        if self.len == 0 || max_radius.is_nan() || max_radius < 0.0 {
            return None;
        }
        let mut best = None;
        self.root.nearest(target, &mut best);
        best.filter(|(_, d)| *d <= max_radius * max_radius).map(|(p, _)| p)
    }

    /// Number of stored points.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if no points are stored.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Quadtree {
        let mut t = Quadtree::with_capacity(Bounds2::new(Vec2::ZERO, Vec2::new(100.0, 100.0)), 2);
        for p in [(10.0, 10.0), (90.0, 90.0), (12.0, 80.0), (55.0, 52.0), (54.0, 50.0)] {
            assert!(t.insert(Vec2::new(p.0, p.1)));
        }
        t
    }

    #[test]
    fn test_nearest_matches_brute_force() {
        let t = tree();
        assert_eq!(t.len(), 5);
        assert_eq!(t.find_nearest(Vec2::new(50.0, 50.0), 100.0), Some(Vec2::new(54.0, 50.0)));
        assert_eq!(t.find_nearest(Vec2::new(0.0, 95.0), 100.0), Some(Vec2::new(12.0, 80.0)));
    }

    #[test]
    fn test_radius_limit() {
        let t = tree();
        assert_eq!(t.find_nearest(Vec2::new(30.0, 30.0), 5.0), None);
    }

    #[test]
    fn test_out_of_bounds_insert_rejected() {
        let mut t = Quadtree::new(Bounds2::new(Vec2::ZERO, Vec2::ONE));
        assert!(!t.insert(Vec2::new(2.0, 0.5)));
        assert!(t.is_empty());
    }

    #[test]
    fn test_duplicate_points_stop_at_max_depth() {
        let mut t = Quadtree::with_capacity(Bounds2::new(Vec2::ZERO, Vec2::ONE), 1);
        for _ in 0..64 {
            t.insert(Vec2::new(0.5, 0.5));
        }
        assert_eq!(t.len(), 64);
        assert_eq!(t.find_nearest(Vec2::ZERO, 1.0), Some(Vec2::new(0.5, 0.5)));
    }
}
