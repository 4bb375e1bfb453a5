//! # Image Decoding
//!
//! The store never touches codecs directly. It hands raw bytes to an
//! [`ImageDecoder`] and gets back a [`PixelGrid`] of normalised RGBA floats.
//! [`DefaultDecoder`] is backed by the `image` crate; hosts with their own
//! codec stack plug in a different implementation.

use std::io::Cursor;

use image::{ImageError, ImageReader, Limits};
use stratum_shared::constants::MAX_MASK_DIMENSION;

use crate::error::{MaskError, MaskResult};

/// Decoded image: row-major RGBA, every channel normalised to [0, 1].
///
/// Row 0 is the first row stored in the image and maps to the lowest
/// world Y of the mask.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelGrid {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
}

impl PixelGrid {
    /// Wraps a pixel buffer, checking it matches the dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`MaskError::PixelCountMismatch`] if `pixels.len() != width * height`.
    pub fn new(width: u32, height: u32, pixels: Vec<[f32; 4]>) -> MaskResult<Self> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(MaskError::PixelCountMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self { width, height, pixels })
    }

    /// Grid where every pixel has the same value.
    #[must_use]
    pub fn uniform(width: u32, height: u32, value: [f32; 4]) -> Self {
        Self {
            width,
            height,
            pixels: vec![value; width as usize * height as usize],
        }
    }

    /// Grid generated from `f(x, y)`.
    #[must_use]
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> [f32; 4]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self { width, height, pixels }
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Pixel at `(x, y)`. Caller keeps coordinates in range.
    #[inline]
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> [f32; 4] {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// All pixels, row-major.
    #[must_use]
    pub fn pixels(&self) -> &[[f32; 4]] {
        &self.pixels
    }
}

/// Turns encoded image bytes into a pixel grid.
pub trait ImageDecoder: Send + Sync {
    /// Decodes `bytes`.
    ///
    /// # Errors
    ///
    /// [`MaskError::UnsupportedFormat`] if the bytes are not a known format,
    /// [`MaskError::Decode`] if they are corrupt.
    fn decode(&self, bytes: &[u8]) -> MaskResult<PixelGrid>;
}

/// Decoder backed by the `image` crate (PNG).
///
/// Greyscale images expand to `(g, g, g, 1)`, 16-bit images keep their
/// full precision through the float conversion.
///
/// The header is read before any pixel data: images wider or taller than
/// [`MAX_MASK_DIMENSION`] are rejected without being decoded.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDecoder;

impl ImageDecoder for DefaultDecoder {
    fn decode(&self, bytes: &[u8]) -> MaskResult<PixelGrid> {
        let format = image::guess_format(bytes).map_err(|e| MaskError::UnsupportedFormat(e.to_string()))?;

        let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
            .into_dimensions()
            .map_err(image_error)?;
        if width > MAX_MASK_DIMENSION || height > MAX_MASK_DIMENSION {
            return Err(MaskError::ImageTooLarge {
                width,
                height,
                max: MAX_MASK_DIMENSION,
            });
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_MASK_DIMENSION);
        limits.max_image_height = Some(MAX_MASK_DIMENSION);
        let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
        reader.limits(limits);
        let image = reader.decode().map_err(image_error)?;

        let rgba = image.to_rgba32f();
        let (width, height) = rgba.dimensions();
        let pixels = rgba.pixels().map(|p| p.0).collect();
        PixelGrid::new(width, height, pixels)
    }
}

fn image_error(err: ImageError) -> MaskError {
    match err {
        ImageError::Unsupported(u) => MaskError::UnsupportedFormat(u.to_string()),
        other => MaskError::Decode(other.to_string()),
    }
}
