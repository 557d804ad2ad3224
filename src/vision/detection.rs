//! Contour-based rectangle detection
//!
//! Grayscale, blur, Canny edges, outer contours, then polygon approximation.
//! Quadrilaterals within the configured area and aspect bounds become regions.

use image::{DynamicImage, GrayImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::morphology::dilate;
use imageproc::point::Point;
use std::time::Instant;
use tracing::debug;

use super::{DetectionError, RegionDetector};
use crate::config::DetectionSettings;
use crate::geometry::Region;

/// Candidates overlapping an already accepted one by more than this are dropped
const MAX_OVERLAP: f64 = 0.8;

/// Axis-aligned pixel bounding box of a candidate, top-left origin
#[derive(Debug, Clone, Copy, PartialEq)]
struct PixelBox {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl PixelBox {
    fn from_points(points: &[Point<i32>]) -> Option<Self> {
        let min_x = points.iter().map(|p| p.x).min()?;
        let max_x = points.iter().map(|p| p.x).max()?;
        let min_y = points.iter().map(|p| p.y).min()?;
        let max_y = points.iter().map(|p| p.y).max()?;
        if min_x < 0 || min_y < 0 {
            return None;
        }
        Some(Self {
            x: min_x as u32,
            y: min_y as u32,
            width: (max_x - min_x + 1) as u32,
            height: (max_y - min_y + 1) as u32,
        })
    }

    fn area(&self) -> f64 {
        self.width as f64 * self.height as f64
    }

    fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    /// Intersection area divided by the smaller box's area
    fn overlap(&self, other: &PixelBox) -> f64 {
        let left = self.x.max(other.x) as f64;
        let top = self.y.max(other.y) as f64;
        let right = (self.x + self.width).min(other.x + other.width) as f64;
        let bottom = (self.y + self.height).min(other.y + other.height) as f64;
        if right <= left || bottom <= top {
            return 0.0;
        }
        (right - left) * (bottom - top) / self.area().min(other.area())
    }

    fn to_region(self, image_width: u32, image_height: u32) -> Region {
        let w = image_width as f64;
        let h = image_height as f64;
        Region::new(
            self.x as f64 / w,
            1.0 - (self.y + self.height) as f64 / h,
            self.width as f64 / w,
            self.height as f64 / h,
        )
    }
}

/// Rectangle detector built on imageproc's edge and contour operators
#[derive(Debug, Clone, Default)]
pub struct ContourDetector {
    settings: DetectionSettings,
}

impl ContourDetector {
    pub fn new(settings: DetectionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    /// Canny edge map, dilated by one pixel so corner gaps close
    fn edges(&self, gray: &GrayImage) -> GrayImage {
        let edges = if self.settings.blur_sigma > 0.0 {
            let blurred = gaussian_blur_f32(gray, self.settings.blur_sigma);
            canny(&blurred, self.settings.canny_low, self.settings.canny_high)
        } else {
            canny(gray, self.settings.canny_low, self.settings.canny_high)
        };
        dilate(&edges, Norm::LInf, 1)
    }

    /// Bounding boxes of quadrilateral outer contours passing the filters
    fn candidates(&self, edges: &GrayImage) -> Vec<PixelBox> {
        let contours = find_contours::<i32>(edges);
        let mut boxes = Vec::new();

        for contour in contours
            .iter()
            .filter(|c| c.parent.is_none() && matches!(c.border_type, BorderType::Outer))
        {
            let area = polygon_area(&contour.points);
            if area <= self.settings.min_area || area >= self.settings.max_area {
                continue;
            }

            let perimeter = arc_length(&contour.points, true);
            let epsilon = self.settings.approx_epsilon * perimeter;
            let approx = approximate_polygon_dp(&contour.points, epsilon, true);
            if approx.len() != 4 {
                continue;
            }

            let Some(bounds) = PixelBox::from_points(&approx) else {
                continue;
            };
            let aspect = bounds.aspect_ratio();
            if aspect < self.settings.min_aspect_ratio || aspect > self.settings.max_aspect_ratio {
                continue;
            }
            boxes.push(bounds);
        }

        boxes
    }
}

impl RegionDetector for ContourDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Region>, DetectionError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(DetectionError::EmptyImage);
        }

        let start = Instant::now();
        let gray = image.to_luma8();
        let edges = self.edges(&gray);
        let candidates = self.candidates(&edges);
        let accepted = suppress_overlaps(candidates);

        debug!(
            "Contour detection on {}x{} complete in {:?}: {} regions",
            width,
            height,
            start.elapsed(),
            accepted.len()
        );

        Ok(accepted
            .into_iter()
            .map(|b| b.to_region(width, height))
            .collect())
    }
}

/// Keep the largest of any heavily overlapping boxes, then order them
/// top-to-bottom, left-to-right
fn suppress_overlaps(mut boxes: Vec<PixelBox>) -> Vec<PixelBox> {
    boxes.sort_by(|a, b| b.area().total_cmp(&a.area()));

    let mut kept: Vec<PixelBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| k.overlap(&candidate) <= MAX_OVERLAP) {
            kept.push(candidate);
        }
    }

    kept.sort_by_key(|b| (b.y, b.x));
    kept
}

/// Shoelace area of a closed polygon
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0f64;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        twice_area += p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
    }
    (twice_area / 2.0).abs()
}
