//! # Pixel Formats
//!
//! How decoded pixels are stored inside a [`MaskField`](crate::MaskField).
//!
//! ```text
//! FORMAT    CHANNELS  BYTES/PX  QUANTISATION
//! r8        R         1         n / 255
//! r16f      R         2         IEEE half
//! rgba8     RGBA      4         n / 255
//! rgba16f   RGBA      8         IEEE half
//! ```
//!
//! Single-channel formats read back 0 for G, B and A.

use half::f16;
use serde::{Deserialize, Serialize};

/// Storage format of a decoded mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    /// Single 8-bit channel.
    #[default]
    #[serde(rename = "r8")]
    R8,
    /// Single half-float channel.
    #[serde(rename = "r16f")]
    R16F,
    /// Four 8-bit channels.
    #[serde(rename = "rgba8")]
    Rgba8,
    /// Four half-float channels.
    #[serde(rename = "rgba16f")]
    Rgba16F,
}

impl DataFormat {
    /// Bytes used per pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::R8 => 1,
            Self::R16F => 2,
            Self::Rgba8 => 4,
            Self::Rgba16F => 8,
        }
    }

    /// Number of stored channels.
    #[must_use]
    pub const fn channel_count(self) -> usize {
        match self {
            Self::R8 | Self::R16F => 1,
            Self::Rgba8 | Self::Rgba16F => 4,
        }
    }
}

/// Mask channel a layer reads its weight from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Red (the only channel of single-channel formats).
    #[default]
    R,
    /// Green.
    G,
    /// Blue.
    B,
    /// Alpha.
    A,
}

impl Channel {
    /// Index into an RGBA quadruple.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::R => 0,
            Self::G => 1,
            Self::B => 2,
            Self::A => 3,
        }
    }
}

/// Interpolation used when sampling between pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// Value of the pixel containing the coordinate.
    Nearest,
    /// Interpolate between the four surrounding pixel centres.
    #[default]
    Bilinear,
}

/// How source image values are interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    /// Raw values are weights.
    #[default]
    Linear,
    /// Values are sRGB encoded; colour channels are linearised on decode.
    Srgb,
}

impl ColorSpace {
    /// Converts a decoded RGBA pixel into linear weights. Alpha is never touched.
    #[must_use]
    pub fn linearize(self, px: [f32; 4]) -> [f32; 4] {
        match self {
            Self::Linear => px,
            Self::Srgb => [srgb_to_linear(px[0]), srgb_to_linear(px[1]), srgb_to_linear(px[2]), px[3]],
        }
    }
}

/// Standard sRGB transfer function inverse.
#[must_use]
pub fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.040_45 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

#[inline]
fn to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[inline]
fn from_unorm8(v: u8) -> f32 {
    f32::from(v) / 255.0
}

/// Typed pixel storage. One variant per [`DataFormat`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PixelData {
    R8(Vec<u8>),
    R16F(Vec<f16>),
    Rgba8(Vec<[u8; 4]>),
    Rgba16F(Vec<[f16; 4]>),
}

impl PixelData {
    /// Quantises linear RGBA pixels into `format`.
    pub(crate) fn encode(format: DataFormat, pixels: impl Iterator<Item = [f32; 4]>) -> Self {
        match format {
            DataFormat::R8 => Self::R8(pixels.map(|p| to_unorm8(p[0])).collect()),
            DataFormat::R16F => Self::R16F(pixels.map(|p| f16::from_f32(p[0])).collect()),
            DataFormat::Rgba8 => Self::Rgba8(pixels.map(|p| p.map(to_unorm8)).collect()),
            DataFormat::Rgba16F => Self::Rgba16F(pixels.map(|p| p.map(f16::from_f32)).collect()),
        }
    }

    pub(crate) fn format(&self) -> DataFormat {
        match self {
            Self::R8(_) => DataFormat::R8,
            Self::R16F(_) => DataFormat::R16F,
            Self::Rgba8(_) => DataFormat::Rgba8,
            Self::Rgba16F(_) => DataFormat::Rgba16F,
        }
    }

    /// Full RGBA value of pixel `idx`.
    pub(crate) fn rgba(&self, idx: usize) -> [f32; 4] {
        match self {
            Self::R8(v) => [from_unorm8(v[idx]), 0.0, 0.0, 0.0],
            Self::R16F(v) => [v[idx].to_f32(), 0.0, 0.0, 0.0],
            Self::Rgba8(v) => v[idx].map(from_unorm8),
            Self::Rgba16F(v) => v[idx].map(f16::to_f32),
        }
    }

    /// Single channel of pixel `idx`.
    #[inline]
    pub(crate) fn channel(&self, idx: usize, channel: Channel) -> f32 {
        match (self, channel) {
            (Self::R8(v), Channel::R) => from_unorm8(v[idx]),
            (Self::R16F(v), Channel::R) => v[idx].to_f32(),
            (Self::R8(_) | Self::R16F(_), _) => 0.0,
            (Self::Rgba8(v), c) => from_unorm8(v[idx][c.index()]),
            (Self::Rgba16F(v), c) => v[idx][c.index()].to_f32(),
        }
    }

    /// Packed little-endian pixel buffer.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            Self::R8(v) => v,
            Self::R16F(v) => bytemuck::cast_slice(v),
            Self::Rgba8(v) => bytemuck::cast_slice(v),
            Self::Rgba16F(v) => bytemuck::cast_slice(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_r8_quantisation() {
        let data = PixelData::encode(DataFormat::R8, [[0.5, 0.9, 0.9, 0.9]].into_iter());
        assert_eq!(data.as_bytes(), &[128]);
        assert_eq!(data.channel(0, Channel::G), 0.0);
        assert!((data.channel(0, Channel::R) - 128.0 / 255.0).abs() < 1.0e-6);
    }

    #[test]
    fn test_half_float_storage() {
        let data = PixelData::encode(DataFormat::Rgba16F, [[0.25, 0.5, 0.75, 1.0]].into_iter());
        assert_eq!(data.as_bytes().len(), DataFormat::Rgba16F.bytes_per_pixel());
        assert_eq!(data.rgba(0), [0.25, 0.5, 0.75, 1.0]);
        assert_eq!(data.format(), DataFormat::Rgba16F);
    }

    #[test]
    fn test_srgb_linearize_keeps_alpha() {
        let px = ColorSpace::Srgb.linearize([1.0, 0.0, 0.5, 0.5]);
        assert!((px[0] - 1.0).abs() < 1.0e-6);
        assert_eq!(px[1], 0.0);
        assert!(px[2] < 0.5);
        assert_eq!(px[3], 0.5);
    }

    #[test]
    fn test_format_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            format: DataFormat,
        }
        let w: Wrapper = toml::from_str("format = \"rgba16f\"").unwrap();
        assert_eq!(w.format, DataFormat::Rgba16F);
    }
}
