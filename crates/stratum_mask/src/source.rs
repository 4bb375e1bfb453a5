//! # Mask Sources
//!
//! A [`MaskSource`] is the authored description of a mask: where the image
//! lives, where it sits in the world, and how it is stored once decoded.
//!
//! ```toml
//! [[mask]]
//! path = "masks/biomes.png"
//! origin = [-512.0, -512.0]
//! world_size = [1024.0, 1024.0]
//! format = "rgba8"
//! sampling = "bilinear"
//! resolution = { mode = "cell_size", x = 8.0, y = 8.0 }
//! tracked_values = [[1.0, 0.0, 0.0, 1.0]]
//!
//! # No image: every pixel holds `default_value`.
//! [[mask]]
//! path = "masks/humidity"
//! world_size = [1024.0, 1024.0]
//! resolution = { mode = "absolute", width = 64, height = 64 }
//! blank = true
//! default_value = [0.25, 0.0, 0.0, 0.0]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stratum_shared::constants::MAX_MASK_DIMENSION;
use stratum_shared::{Bounds2, Vec2};

use crate::error::{MaskError, MaskResult};
use crate::format::{ColorSpace, DataFormat, SamplingMode};

/// Grid resolution of a decoded mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Keep the image resolution.
    #[default]
    Native,
    /// Resample to a fixed pixel grid.
    Absolute {
        /// Grid width in pixels.
        width: u32,
        /// Grid height in pixels.
        height: u32,
    },
    /// One pixel per `x` by `y` world units.
    CellSize {
        /// World units per pixel along X.
        x: f32,
        /// World units per pixel along Y.
        y: f32,
    },
}

/// Authored description of a single mask image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskSource {
    /// Image path; also the cache key.
    pub path: PathBuf,
    /// World position of the grid's lower corner.
    #[serde(default)]
    pub origin: [f32; 2],
    /// World extent covered by the whole grid.
    pub world_size: [f32; 2],
    /// Grid resolution after decode.
    #[serde(default)]
    pub resolution: ResolutionMode,
    /// Storage format after decode.
    #[serde(default)]
    pub format: DataFormat,
    /// Interpolation between pixels.
    #[serde(default)]
    pub sampling: SamplingMode,
    /// How to interpret source values.
    #[serde(default)]
    pub color_space: ColorSpace,
    /// RGBA values to index for nearest-pixel lookups.
    #[serde(default)]
    pub tracked_values: Vec<[f32; 4]>,
    /// Value of every pixel when the mask has no image.
    #[serde(default)]
    pub default_value: [f32; 4],
    /// No image is read; the grid is filled with `default_value`.
    #[serde(default)]
    pub blank: bool,
}

impl MaskSource {
    /// Source at `path` covering `world_size` from `origin`, all other settings default.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, origin: Vec2, world_size: Vec2) -> Self {
        Self {
            path: path.into(),
            origin: origin.to_array(),
            world_size: world_size.to_array(),
            resolution: ResolutionMode::Native,
            format: DataFormat::default(),
            sampling: SamplingMode::default(),
            color_space: ColorSpace::default(),
            tracked_values: Vec::new(),
            default_value: [0.0; 4],
            blank: false,
        }
    }

    /// Marks the mask as having no image, every pixel reading `value`.
    #[must_use]
    pub fn without_image(mut self, value: [f32; 4]) -> Self {
        self.default_value = value;
        self.blank = true;
        self
    }

    /// Sets the storage format.
    #[must_use]
    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the sampling mode.
    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingMode) -> Self {
        self.sampling = sampling;
        self
    }

    /// Sets the resolution mode.
    #[must_use]
    pub fn with_resolution(mut self, resolution: ResolutionMode) -> Self {
        self.resolution = resolution;
        self
    }

    /// Sets the colour space.
    #[must_use]
    pub fn with_color_space(mut self, color_space: ColorSpace) -> Self {
        self.color_space = color_space;
        self
    }

    /// Adds a value to the spatial index.
    #[must_use]
    pub fn tracking(mut self, value: [f32; 4]) -> Self {
        self.tracked_values.push(value);
        self
    }

    /// Image path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// World rectangle covered by the mask.
    #[must_use]
    pub fn bounds(&self) -> Bounds2 {
        Bounds2::from_origin_size(Vec2::from_array(self.origin), Vec2::from_array(self.world_size))
    }

    /// Checks the placement can produce a grid at all.
    ///
    /// # Errors
    ///
    /// [`MaskError::InvalidPlacement`] for non-finite origins, non-positive
    /// sizes, or resolution settings that yield an empty or oversized grid.
    pub fn validate(&self) -> MaskResult<()> {
        let origin = Vec2::from_array(self.origin);
        if !origin.x.is_finite() || !origin.y.is_finite() {
            return Err(self.invalid("origin must be finite"));
        }
        if !Vec2::from_array(self.world_size).is_positive() {
            return Err(self.invalid("world size must be positive"));
        }
        match self.resolution {
            ResolutionMode::Native => Ok(()),
            ResolutionMode::Absolute { width, height } => self.check_dimensions(width, height),
            ResolutionMode::CellSize { x, y } => {
                if !Vec2::new(x, y).is_positive() {
                    return Err(self.invalid("cell size must be positive"));
                }
                let (w, h) = self.cell_grid(x, y);
                self.check_dimensions(w, h)
            }
        }
    }

    /// Grid dimensions for an image of `native_width` by `native_height`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`MaskSource::validate`].
    pub fn target_resolution(&self, native_width: u32, native_height: u32) -> MaskResult<(u32, u32)> {
        self.validate()?;
        let (w, h) = match self.resolution {
            ResolutionMode::Native => (native_width, native_height),
            ResolutionMode::Absolute { width, height } => (width, height),
            ResolutionMode::CellSize { x, y } => self.cell_grid(x, y),
        };
        self.check_dimensions(w, h)?;
        Ok((w, h))
    }

    fn cell_grid(&self, x: f32, y: f32) -> (u32, u32) {
        let w = (self.world_size[0] / x).ceil();
        let h = (self.world_size[1] / y).ceil();
        let cap = MAX_MASK_DIMENSION as f32 + 1.0;
        (w.min(cap) as u32, h.min(cap) as u32)
    }

    fn check_dimensions(&self, width: u32, height: u32) -> MaskResult<()> {
        if width == 0 || height == 0 {
            return Err(self.invalid(format!("grid {width}x{height} is empty")));
        }
        if width > MAX_MASK_DIMENSION || height > MAX_MASK_DIMENSION {
            return Err(self.invalid(format!(
                "grid {width}x{height} exceeds {MAX_MASK_DIMENSION} pixels per side"
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> MaskError {
        MaskError::InvalidPlacement {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_size_resolution() {
        let source = MaskSource::new("a.png", Vec2::ZERO, Vec2::new(100.0, 30.0))
            .with_resolution(ResolutionMode::CellSize { x: 10.0, y: 7.0 });
        assert_eq!(source.target_resolution(4, 4).unwrap(), (10, 5));
    }

    #[test]
    fn test_zero_world_size_rejected() {
        let source = MaskSource::new("a.png", Vec2::ZERO, Vec2::new(0.0, 10.0));
        assert!(matches!(source.validate(), Err(MaskError::InvalidPlacement { .. })));
    }

    #[test]
    fn test_empty_absolute_rejected() {
        let source = MaskSource::new("a.png", Vec2::ZERO, Vec2::ONE)
            .with_resolution(ResolutionMode::Absolute { width: 0, height: 4 });
        assert!(source.target_resolution(8, 8).is_err());
    }

    #[test]
    fn test_toml_defaults() {
        let source: MaskSource = toml::from_str(
            r#"
            path = "m.png"
            world_size = [64.0, 64.0]
            resolution = { mode = "absolute", width = 16, height = 8 }
            "#,
        )
        .unwrap();
        assert_eq!(source.origin, [0.0, 0.0]);
        assert_eq!(source.format, DataFormat::R8);
        assert_eq!(source.sampling, SamplingMode::Bilinear);
        assert_eq!(source.resolution, ResolutionMode::Absolute { width: 16, height: 8 });
    }
}
