//! # Mask Fields
//!
//! A decoded, world-placed weight grid. Immutable once built.
//!
//! ## Pixel Placement
//!
//! ```text
//!   origin + (i, j) * cell                 origin + (i + 1, j + 1) * cell
//!        +------------------------------------+
//!        |                                    |
//!        |        pixel (i, j)                |
//!        |             x  <- sample point     |
//!        |                of pixel centre     |
//!        +------------------------------------+
//! ```
//!
//! Bilinear sampling interpolates between pixel centres. Near the edge the
//! missing neighbour is the edge pixel itself, so a sample never reads
//! outside the grid. Outside the field bounds every sample is 0.

use std::iter;
use std::path::{Path, PathBuf};

use stratum_shared::{Bounds2, Vec2};

use crate::decoder::PixelGrid;
use crate::error::{MaskError, MaskResult};
use crate::format::{Channel, DataFormat, PixelData, SamplingMode};
use crate::quadtree::Quadtree;
use crate::source::MaskSource;

/// Pixels carrying one tracked value.
#[derive(Debug, Clone)]
struct TrackedIndex {
    /// Value after quantisation into the field's format.
    value: [f32; 4],
    tree: Quadtree,
}

/// Immutable 2D weight grid with a world placement.
#[derive(Debug, Clone)]
pub struct MaskField {
    source: PathBuf,
    width: u32,
    height: u32,
    origin: Vec2,
    cell_size: Vec2,
    sampling: SamplingMode,
    data: PixelData,
    tracked: Vec<TrackedIndex>,
}

impl MaskField {
    /// Builds a field from a decoded image and its authored source.
    ///
    /// Applies resolution resampling (nearest pixel), colour space
    /// conversion, quantisation and the tracked-value index.
    ///
    /// # Errors
    ///
    /// [`MaskError::InvalidPlacement`] if the placement or resolution is
    /// unusable or the image is empty.
    pub fn from_grid(source: &MaskSource, grid: &PixelGrid) -> MaskResult<Self> {
        let (gw, gh) = (grid.width(), grid.height());
        if gw == 0 || gh == 0 {
            return Err(MaskError::InvalidPlacement {
                path: source.path.clone(),
                reason: "image has no pixels".to_string(),
            });
        }
        let (width, height) = source.target_resolution(gw, gh)?;

        let color_space = source.color_space;
        let pixels = (0..height).flat_map(move |y| {
            let sy = resample_index(y, height, gh);
            (0..width).map(move |x| color_space.linearize(grid.get(resample_index(x, width, gw), sy)))
        });
        Ok(Self::build(source, width, height, pixels))
    }

    /// Builds a field whose every pixel holds the source's `default_value`.
    ///
    /// `Native` resolution yields a single pixel. The value is stored as
    /// authored, with no colour space conversion.
    ///
    /// # Errors
    ///
    /// [`MaskError::InvalidPlacement`] if the placement or resolution is unusable.
    pub fn from_default(source: &MaskSource) -> MaskResult<Self> {
        let (width, height) = source.target_resolution(1, 1)?;
        let pixels = iter::repeat(source.default_value).take(width as usize * height as usize);
        Ok(Self::build(source, width, height, pixels))
    }

    fn build(source: &MaskSource, width: u32, height: u32, pixels: impl Iterator<Item = [f32; 4]>) -> Self {
        let world_size = Vec2::from_array(source.world_size);
        let mut field = Self {
            source: source.path.clone(),
            width,
            height,
            origin: Vec2::from_array(source.origin),
            cell_size: world_size.div_elem(Vec2::new(width as f32, height as f32)),
            sampling: source.sampling,
            data: PixelData::encode(source.format, pixels),
            tracked: Vec::new(),
        };
        field.build_index(&source.tracked_values);
        field
    }

    fn build_index(&mut self, values: &[[f32; 4]]) {
        for &value in values {
            let value = self.quantize(value);
            let mut tree = Quadtree::new(self.bounds());
            for y in 0..self.height {
                for x in 0..self.width {
                    if same_value(self.pixel(x, y), value) {
                        tree.insert(self.pixel_center(x, y));
                    }
                }
            }
            tracing::debug!(
                mask = %self.source.display(),
                value = ?value,
                pixels = tree.len(),
                "Indexed tracked mask value"
            );
            self.tracked.push(TrackedIndex { value, tree });
        }
    }

    /// Value as it reads back after storage in this field's format.
    fn quantize(&self, value: [f32; 4]) -> [f32; 4] {
        PixelData::encode(self.format(), iter::once(value)).rgba(0)
    }

    // ========================================================================
    // SAMPLING
    // ========================================================================

    /// Weight of `channel` at world position `pos`, clamped to [0, 1].
    ///
    /// Returns 0 for positions outside the field bounds (including NaN).
    #[must_use]
    pub fn sample(&self, pos: Vec2, channel: Channel) -> f32 {
        if !self.bounds().contains(pos) {
            return 0.0;
        }
        let p = self.to_pixel_space(pos);
        let value = match self.sampling {
            SamplingMode::Nearest => {
                let idx = self.index(clamp_index(p.x, self.width), clamp_index(p.y, self.height));
                self.data.channel(idx, channel)
            }
            SamplingMode::Bilinear => self.sample_bilinear(p, channel),
        };
        value.clamp(0.0, 1.0)
    }

    fn sample_bilinear(&self, p: Vec2, channel: Channel) -> f32 {
        let fx = p.x - 0.5;
        let fy = p.y - 0.5;
        let x0f = fx.floor();
        let y0f = fy.floor();
        let tx = fx - x0f;
        let ty = fy - y0f;

        let x0 = clamp_index(x0f, self.width);
        let x1 = clamp_index(x0f + 1.0, self.width);
        let y0 = clamp_index(y0f, self.height);
        let y1 = clamp_index(y0f + 1.0, self.height);

        let v00 = self.data.channel(self.index(x0, y0), channel);
        let v10 = self.data.channel(self.index(x1, y0), channel);
        let v01 = self.data.channel(self.index(x0, y1), channel);
        let v11 = self.data.channel(self.index(x1, y1), channel);

        let top = v00 + (v10 - v00) * tx;
        let bottom = v01 + (v11 - v01) * tx;
        top + (bottom - top) * ty
    }

    /// All four channels of the pixel containing `pos`, or `None` outside the field.
    #[must_use]
    pub fn value_at(&self, pos: Vec2) -> Option<[f32; 4]> {
        let (x, y) = self.world_to_pixel(pos)?;
        Some(self.pixel(x, y))
    }

    /// Pixel containing `pos`.
    #[must_use]
    pub fn world_to_pixel(&self, pos: Vec2) -> Option<(u32, u32)> {
        if !self.bounds().contains(pos) {
            return None;
        }
        let p = self.to_pixel_space(pos);
        Some((clamp_index(p.x, self.width) as u32, clamp_index(p.y, self.height) as u32))
    }

    /// World position of the centre of pixel `(x, y)`.
    #[must_use]
    pub fn pixel_center(&self, x: u32, y: u32) -> Vec2 {
        self.origin + Vec2::new(x as f32 + 0.5, y as f32 + 0.5).mul_elem(self.cell_size)
    }

    /// Stored RGBA value of pixel `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if the pixel is outside the grid.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.data.rgba(self.index(x as usize, y as usize))
    }

    /// World position of the tracked pixel with `value` closest to `origin`.
    ///
    /// `None` if the value is not tracked by this field or no matching pixel
    /// lies within `max_radius`.
    #[must_use]
    pub fn find_nearest_with_value(&self, origin: Vec2, max_radius: f32, value: [f32; 4]) -> Option<Vec2> {
        let value = self.quantize(value);
        self.tracked
            .iter()
            .find(|t| same_value(t.value, value))
            .and_then(|t| t.tree.find_nearest(origin, max_radius))
    }

    #[inline]
    fn to_pixel_space(&self, pos: Vec2) -> Vec2 {
        (pos - self.origin).div_elem(self.cell_size)
    }

    #[inline]
    fn index(&self, x: usize, y: usize) -> usize {
        y * self.width as usize + x
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Source path this field was decoded from.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Grid width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Grid height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// World position of the grid's lower corner.
    #[must_use]
    pub const fn origin(&self) -> Vec2 {
        self.origin
    }

    /// World size of one pixel.
    #[must_use]
    pub const fn cell_size(&self) -> Vec2 {
        self.cell_size
    }

    /// World rectangle covered by the field.
    #[must_use]
    pub fn bounds(&self) -> Bounds2 {
        let size = self.cell_size.mul_elem(Vec2::new(self.width as f32, self.height as f32));
        Bounds2::from_origin_size(self.origin, size)
    }

    /// Interpolation mode.
    #[must_use]
    pub const fn sampling(&self) -> SamplingMode {
        self.sampling
    }

    /// Storage format.
    #[must_use]
    pub fn format(&self) -> DataFormat {
        self.data.format()
    }

    /// Packed pixel buffer, row-major, ready for upload.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Memory held by the decoded pixels and index.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        let index: usize = self.tracked.iter().map(|t| t.tree.len() * std::mem::size_of::<Vec2>()).sum();
        self.as_bytes().len() + index
    }
}

/// Nearest source index for destination index `i` when resampling `dst` to `src`.
#[inline]
fn resample_index(i: u32, dst: u32, src: u32) -> u32 {
    let scaled = (2 * u64::from(i) + 1) * u64::from(src) / (2 * u64::from(dst));
    scaled.min(u64::from(src - 1)) as u32
}

#[inline]
fn clamp_index(v: f32, len: u32) -> usize {
    v.max(0.0).min((len - 1) as f32) as usize
}

#[inline]
fn same_value(a: [f32; 4], b: [f32; 4]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= f32::EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ResolutionMode;
    use approx::assert_relative_eq;

    /// 10x10 grid over a 100-unit world centred on the origin; left half 0, right half 1.
    fn step_field(sampling: SamplingMode) -> MaskField {
        let grid = PixelGrid::from_fn(10, 10, |x, _| if x < 5 { [0.0; 4] } else { [1.0; 4] });
        let source = MaskSource::new("step.png", Vec2::new(-50.0, -50.0), Vec2::new(100.0, 100.0))
            .with_sampling(sampling);
        MaskField::from_grid(&source, &grid).unwrap()
    }

    #[test]
    fn test_bilinear_between_pixel_centres() {
        let field = step_field(SamplingMode::Bilinear);
        assert_relative_eq!(field.sample(Vec2::new(0.0, 0.0), Channel::R), 0.5);
        assert_relative_eq!(field.sample(Vec2::new(-2.5, 0.0), Channel::R), 0.25);
        assert_relative_eq!(field.sample(Vec2::new(-45.0, 0.0), Channel::R), 0.0);
        assert_relative_eq!(field.sample(Vec2::new(45.0, 0.0), Channel::R), 1.0);
    }

    #[test]
    fn test_nearest_sampling() {
        let field = step_field(SamplingMode::Nearest);
        assert_eq!(field.sample(Vec2::new(-0.1, 0.0), Channel::R), 0.0);
        assert_eq!(field.sample(Vec2::new(0.0, 0.0), Channel::R), 1.0);
    }

    #[test]
    fn test_out_of_bounds_is_zero() {
        let field = step_field(SamplingMode::Bilinear);
        assert_eq!(field.sample(Vec2::new(50.0, 0.0), Channel::R), 0.0);
        assert_eq!(field.sample(Vec2::new(1000.0, -1000.0), Channel::R), 0.0);
        assert_eq!(field.sample(Vec2::new(f32::NAN, 0.0), Channel::R), 0.0);
        assert_eq!(field.value_at(Vec2::new(-51.0, 0.0)), None);
    }

    #[test]
    fn test_edge_clamps_to_edge_pixel() {
        let field = step_field(SamplingMode::Bilinear);
        // Right of the last pixel centre: neighbour is the edge pixel itself.
        assert_relative_eq!(field.sample(Vec2::new(49.9, 49.9), Channel::R), 1.0);
        assert_relative_eq!(field.sample(Vec2::new(-50.0, -50.0), Channel::R), 0.0);
    }

    #[test]
    fn test_single_channel_format_reads_zero_elsewhere() {
        let field = step_field(SamplingMode::Nearest);
        assert_eq!(field.format(), DataFormat::R8);
        assert_eq!(field.sample(Vec2::new(45.0, 0.0), Channel::G), 0.0);
        assert_eq!(field.value_at(Vec2::new(45.0, 0.0)), Some([1.0, 0.0, 0.0, 0.0]));
        assert_eq!(field.as_bytes().len(), 100);
    }

    #[test]
    fn test_absolute_resolution_resamples() {
        let grid = PixelGrid::from_fn(4, 4, |x, y| [(x + 4 * y) as f32 / 15.0, 0.0, 0.0, 1.0]);
        let source = MaskSource::new("r.png", Vec2::ZERO, Vec2::new(8.0, 8.0))
            .with_resolution(ResolutionMode::Absolute { width: 2, height: 2 })
            .with_format(DataFormat::Rgba16F);
        let field = MaskField::from_grid(&source, &grid).unwrap();
        assert_eq!((field.width(), field.height()), (2, 2));
        assert_eq!(field.cell_size(), Vec2::new(4.0, 4.0));
        // Destination pixel (1, 1) picks source pixel (3, 3).
        assert_relative_eq!(field.pixel(1, 1)[0], 1.0);
        assert_eq!(field.as_bytes().len(), 4 * 8);
    }

    #[test]
    fn test_find_nearest_with_value() {
        let grid = PixelGrid::from_fn(8, 8, |x, y| {
            if (x, y) == (1, 1) || (x, y) == (6, 6) {
                [1.0, 0.0, 0.0, 1.0]
            } else {
                [0.0, 0.0, 0.0, 1.0]
            }
        });
        let source = MaskSource::new("t.png", Vec2::ZERO, Vec2::new(80.0, 80.0))
            .with_format(DataFormat::Rgba8)
            .tracking([1.0, 0.0, 0.0, 1.0]);
        let field = MaskField::from_grid(&source, &grid).unwrap();

        let hit = field.find_nearest_with_value(Vec2::new(70.0, 70.0), 50.0, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(hit, Some(Vec2::new(65.0, 65.0)));
        assert_eq!(field.find_nearest_with_value(Vec2::new(40.0, 40.0), 5.0, [1.0, 0.0, 0.0, 1.0]), None);
        // Untracked value never matches.
        assert_eq!(field.find_nearest_with_value(Vec2::new(40.0, 40.0), 500.0, [0.0, 0.0, 0.0, 1.0]), None);
    }

    #[test]
    fn test_default_value_fills_every_pixel() {
        let source = MaskSource::new("humidity", Vec2::ZERO, Vec2::new(100.0, 100.0))
            .with_format(DataFormat::Rgba8)
            .with_resolution(ResolutionMode::Absolute { width: 10, height: 10 })
            .without_image([0.1, 0.2, 0.3, 0.4]);
        let field = MaskField::from_default(&source).unwrap();
        assert_eq!((field.width(), field.height()), (10, 10));

        let expected = [0.1f32, 0.2, 0.3, 0.4].map(|v| (v * 255.0).round() / 255.0);
        for pos in [Vec2::new(5.0, 5.0), Vec2::new(55.0, 35.0), Vec2::new(99.0, 99.0)] {
            let value = field.value_at(pos).unwrap();
            for (got, want) in value.iter().zip(expected) {
                assert_relative_eq!(*got, want, epsilon = 1.0e-6);
            }
        }
        assert_relative_eq!(field.sample(Vec2::new(50.0, 50.0), Channel::B), expected[2], epsilon = 1.0e-6);
    }

    #[test]
    fn test_default_value_native_is_single_pixel() {
        let source = MaskSource::new("flat", Vec2::ZERO, Vec2::new(8.0, 8.0))
            .with_format(DataFormat::R16F)
            .with_color_space(crate::format::ColorSpace::Srgb)
            .without_image([0.5; 4]);
        let field = MaskField::from_default(&source).unwrap();
        assert_eq!((field.width(), field.height()), (1, 1));
        // Stored as authored, no sRGB conversion.
        assert_relative_eq!(field.sample(Vec2::new(7.0, 1.0), Channel::R), 0.5);
    }

    #[test]
    fn test_srgb_linearizes_colour_channels() {
        let grid = PixelGrid::uniform(1, 1, [0.5, 0.5, 0.5, 0.5]);
        let source = MaskSource::new("s.png", Vec2::ZERO, Vec2::ONE)
            .with_format(DataFormat::Rgba16F)
            .with_color_space(crate::format::ColorSpace::Srgb);
        let field = MaskField::from_grid(&source, &grid).unwrap();
        let px = field.pixel(0, 0);
        assert!(px[0] < 0.25);
        assert_relative_eq!(px[3], 0.5);
    }
}
