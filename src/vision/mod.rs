//! Vision Layer
//!
//! Locates rectangular stamp regions in an imported photo. The session only
//! depends on the [`RegionDetector`] trait; [`detection::ContourDetector`] is
//! the built-in edge/contour implementation.

pub mod detection;

pub use detection::ContourDetector;

use image::DynamicImage;
use thiserror::Error;

use crate::geometry::Region;

/// Why a detection run produced no result.
///
/// Finding no rectangles is not an error; it is an empty `Ok`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    #[error("image has no pixels")]
    EmptyImage,
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),
    #[error("detection failed: {0}")]
    Failed(String),
}

/// Finds rectangular regions in a raster image.
///
/// Implementations may take user-perceptible time and are always invoked on a
/// blocking worker, never on the session's control flow. Returned regions are
/// in unit-square coordinates with a bottom-left origin.
pub trait RegionDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Region>, DetectionError>;
}
