//! PNG export of decoded fields, for debugging and round-tripping.
//!
//! Single-channel fields are written as grey with opaque alpha so the image
//! is visible in a viewer and re-imports with the same R values.

use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, Rgba, RgbaImage};

use crate::error::{MaskError, MaskResult};
use crate::field::MaskField;

fn to_image(field: &MaskField) -> RgbaImage {
    let single = field.format().channel_count() == 1;
    let mut image = RgbaImage::new(field.width(), field.height());
    for (x, y, px) in image.enumerate_pixels_mut() {
        let v = field.pixel(x, y);
        let v = if single { [v[0], v[0], v[0], 1.0] } else { v };
        *px = Rgba(v.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8));
    }
    image
}

/// Encodes `field` as an RGBA8 PNG in memory.
///
/// # Errors
///
/// [`MaskError::Encode`] if the encoder fails.
pub fn encode_png(field: &MaskField) -> MaskResult<Vec<u8>> {
    let mut bytes = Vec::new();
    to_image(field)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| MaskError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Writes `field` to `path` as an RGBA8 PNG.
///
/// # Errors
///
/// [`MaskError::Encode`] if encoding fails, [`MaskError::Io`] if the file
/// cannot be written.
pub fn export_png(field: &MaskField, path: impl AsRef<Path>) -> MaskResult<()> {
    let path = path.as_ref();
    let bytes = encode_png(field)?;
    std::fs::write(path, bytes).map_err(|e| MaskError::io(path, &e))?;
    tracing::info!(
        mask = %field.source().display(),
        out = %path.display(),
        width = field.width(),
        height = field.height(),
        "Exported mask"
    );
    Ok(())
}
