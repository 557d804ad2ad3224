//! Region geometry
//!
//! Detected regions live in a device-independent unit square with the origin at
//! the bottom-left corner. This module maps them into pixel space of the source
//! image (top-left origin) and into an arbitrarily sized display surface using
//! aspect-preserving "fit" scaling.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised for sizes that cannot be mapped
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GeometryError {
    #[error("invalid image size {width}x{height}")]
    InvalidImageSize { width: f64, height: f64 },
    #[error("invalid viewport size {width}x{height}")]
    InvalidViewportSize { width: f64, height: f64 },
}

/// A normalized rectangle: unit square, origin bottom-left.
///
/// Values outside the unit square are accepted and mapped best-effort.
/// Equality and hashing compare the exact bit patterns of the fields, so two
/// regions are the same key only when they are bit-identical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Region {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Whether a unit-square point (bottom-left origin) falls inside this region
    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x
            && point.x <= self.x + self.width
            && point.y >= self.y
            && point.y <= self.y + self.height
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// False when any component is NaN or infinite; such regions cannot be persisted
    pub fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
    }

    fn bits(&self) -> [u64; 4] {
        [
            self.x.to_bits(),
            self.y.to_bits(),
            self.width.to_bits(),
            self.height.to_bits(),
        ]
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for Region {}

impl Hash for Region {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

impl From<[f64; 4]> for Region {
    fn from([x, y, width, height]: [f64; 4]) -> Self {
        Self { x, y, width, height }
    }
}

impl From<Region> for [f64; 4] {
    fn from(region: Region) -> Self {
        [region.x, region.y, region.width, region.height]
    }
}

/// Width and height of an image or display surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    fn checked_image(self) -> Result<Self, GeometryError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(GeometryError::InvalidImageSize {
                width: self.width,
                height: self.height,
            })
        }
    }

    fn checked_viewport(self) -> Result<Self, GeometryError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(GeometryError::InvalidViewportSize {
                width: self.width,
                height: self.height,
            })
        }
    }
}

impl From<(u32, u32)> for Size {
    fn from((width, height): (u32, u32)) -> Self {
        Self::new(width as f64, height as f64)
    }
}

/// A point; the coordinate system depends on context
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle with a top-left origin (pixels or display units)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
    }
}

/// Convert a normalized region into pixel coordinates of an image
pub fn to_pixel_rect(region: &Region, image: Size) -> Result<Rect, GeometryError> {
    let image = image.checked_image()?;
    Ok(Rect {
        x: region.x * image.width,
        y: (1.0 - region.y - region.height) * image.height,
        width: region.width * image.width,
        height: region.height * image.height,
    })
}

/// Convert a pixel rectangle back into a normalized region
pub fn to_region(rect: &Rect, image: Size) -> Result<Region, GeometryError> {
    let image = image.checked_image()?;
    let width = rect.width / image.width;
    let height = rect.height / image.height;
    Ok(Region {
        x: rect.x / image.width,
        y: 1.0 - rect.y / image.height - height,
        width,
        height,
    })
}

/// Uniform "fit" mapping of an image into a viewport.
///
/// The image is scaled by `scale` and centered, leaving letterbox or
/// pillarbox bars of `offset_x` / `offset_y` on each side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitTransform {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl FitTransform {
    pub fn new(image: Size, viewport: Size) -> Result<Self, GeometryError> {
        let image = image.checked_image()?;
        let viewport = viewport.checked_viewport()?;

        let scale = (viewport.width / image.width).min(viewport.height / image.height);
        let offset_x = (viewport.width - image.width * scale) / 2.0;
        let offset_y = (viewport.height - image.height * scale) / 2.0;

        Ok(Self {
            scale,
            offset_x,
            offset_y,
        })
    }

    /// Map an image-pixel rectangle into display coordinates
    pub fn to_display(&self, rect: &Rect) -> Rect {
        Rect {
            x: rect.x * self.scale + self.offset_x,
            y: rect.y * self.scale + self.offset_y,
            width: rect.width * self.scale,
            height: rect.height * self.scale,
        }
    }

    /// Map a display point back into image-pixel coordinates
    pub fn to_image(&self, point: Point) -> Point {
        Point {
            x: (point.x - self.offset_x) / self.scale,
            y: (point.y - self.offset_y) / self.scale,
        }
    }
}

/// Map a region onto a display surface with fit semantics.
///
/// Returns the display rectangle and the uniform scale that was applied.
pub fn to_display_rect(
    region: &Region,
    image: Size,
    viewport: Size,
) -> Result<(Rect, f64), GeometryError> {
    let transform = FitTransform::new(image, viewport)?;
    let pixel = to_pixel_rect(region, image)?;
    Ok((transform.to_display(&pixel), transform.scale))
}

/// Map a display point (top-left origin) into the unit square (bottom-left origin)
pub fn display_point_to_unit(
    point: Point,
    image: Size,
    viewport: Size,
) -> Result<Point, GeometryError> {
    let transform = FitTransform::new(image, viewport)?;
    let pixel = transform.to_image(point);
    Ok(Point {
        x: pixel.x / image.width,
        y: 1.0 - pixel.y / image.height,
    })
}

/// Integer crop rectangle `(x, y, width, height)` for a region, clamped to the image.
///
/// Returns `None` when the region does not overlap the image or the image is empty.
pub fn crop_bounds(region: &Region, width_px: u32, height_px: u32) -> Option<(u32, u32, u32, u32)> {
    if width_px == 0 || height_px == 0 {
        return None;
    }
    let rect = to_pixel_rect(region, Size::from((width_px, height_px))).ok()?;
    if !rect.is_finite() {
        return None;
    }

    let min_x = rect.x.min(rect.max_x()).round().clamp(0.0, width_px as f64);
    let max_x = rect.x.max(rect.max_x()).round().clamp(0.0, width_px as f64);
    let min_y = rect.y.min(rect.max_y()).round().clamp(0.0, height_px as f64);
    let max_y = rect.y.max(rect.max_y()).round().clamp(0.0, height_px as f64);

    let width = (max_x - min_x) as u32;
    let height = (max_y - min_y) as u32;
    if width == 0 || height == 0 {
        return None;
    }
    Some((min_x as u32, min_y as u32, width, height))
}
