//! # Mask Error Types
//!
//! All errors that can occur while loading or exporting masks.
//!
//! A failed mask is fatal to that mask only: the store remembers the
//! failure and every layer reading it resolves as inactive until the path
//! is invalidated.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the mask store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskError {
    /// The mask source could not be read.
    #[error("failed to read mask {path:?}: {message}")]
    Io {
        /// Source path.
        path: PathBuf,
        /// Underlying I/O error message.
        message: String,
    },

    /// The bytes are an image, but corrupt or truncated.
    #[error("failed to decode mask: {0}")]
    Decode(String),

    /// The bytes are not in a format the decoder understands.
    #[error("unsupported mask image format: {0}")]
    UnsupportedFormat(String),

    /// Placement or resolution settings cannot produce a grid.
    #[error("invalid mask placement for {path:?}: {reason}")]
    InvalidPlacement {
        /// Source path.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The image header declares more pixels per side than a mask may hold.
    #[error("mask image {width}x{height} exceeds {max} pixels per side")]
    ImageTooLarge {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
        /// Per-side limit.
        max: u32,
    },

    /// No mask spec was registered for this path.
    #[error("mask {0:?} is not registered")]
    NotRegistered(PathBuf),

    /// Pixel buffer does not match the declared dimensions.
    #[error("pixel buffer holds {actual} pixels, expected {expected}")]
    PixelCountMismatch {
        /// Pixels required by width x height.
        expected: usize,
        /// Pixels supplied.
        actual: usize,
    },

    /// Writing a debug image failed.
    #[error("failed to encode mask: {0}")]
    Encode(String),
}

impl MaskError {
    /// Wraps an I/O error with the path that produced it.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Result type for mask operations.
pub type MaskResult<T> = Result<T, MaskError>;
