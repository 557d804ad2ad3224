//! Raster file storage
//!
//! Each imported image is stored as a standalone JPEG whose path is derived
//! from the image identifier. Raster files are independent of the collection
//! file; removing one never touches the other.

use std::io::Write;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageError};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use super::images::ImageId;
use crate::geometry::{crop_bounds, Region};

/// Default JPEG quality for stored rasters
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Errors from reading or writing raster files
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode image: {0}")]
    Encode(#[source] ImageError),
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
}

/// Directory of stored raster files
#[derive(Debug, Clone)]
pub struct RasterStore {
    dir: PathBuf,
    quality: u8,
}

impl RasterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_quality(dir, DEFAULT_JPEG_QUALITY)
    }

    pub fn with_quality(dir: impl Into<PathBuf>, quality: u8) -> Self {
        Self {
            dir: dir.into(),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Storage path for an image's raster
    pub fn path_for(&self, id: ImageId) -> PathBuf {
        self.dir.join(format!("{id}.jpg"))
    }

    /// Encode an image as JPEG and write it to the image's storage path
    pub fn write(&self, id: ImageId, image: &DynamicImage) -> Result<PathBuf, RasterError> {
        let path = self.path_for(id);
        let bytes = encode_jpeg(image, self.quality)?;

        let io_err = |source: std::io::Error| RasterError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        info!(
            "Stored raster {}x{} at {:?}",
            image.width(),
            image.height(),
            path
        );
        Ok(path)
    }

    /// Decode a stored raster
    pub fn load(&self, path: &Path) -> Result<DynamicImage, RasterError> {
        load_raster(path)
    }

    /// Remove a stored raster. A file that is already gone counts as removed.
    pub fn delete(&self, path: &Path) -> Result<(), RasterError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed raster {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Raster {:?} was already removed", path);
                Ok(())
            }
            Err(source) => Err(RasterError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Decode an image file from disk
pub fn load_raster(path: &Path) -> Result<DynamicImage, RasterError> {
    image::open(path).map_err(|source| RasterError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Encode an image as baseline JPEG bytes
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, RasterError> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(&rgb)
        .map_err(RasterError::Encode)?;
    Ok(bytes)
}

/// Crop the pixels covered by a region, clamped to the image bounds
pub fn crop_region(image: &DynamicImage, region: &Region) -> Option<DynamicImage> {
    let (x, y, width, height) = crop_bounds(region, image.width(), image.height())?;
    Some(image.crop_imm(x, y, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use tempfile::TempDir;

    fn sample_image() -> DynamicImage {
        let mut img = RgbImage::new(64, 48);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 4) as u8, (y * 5) as u8, 128]);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_path_is_derived_from_id() {
        let store = RasterStore::new("/data/images");
        let id = ImageId::new();

        assert_eq!(store.path_for(id), PathBuf::from(format!("/data/images/{id}.jpg")));
        assert_eq!(store.path_for(id), store.path_for(id));
    }

    #[test]
    fn test_write_and_load_jpeg() {
        let temp = TempDir::new().unwrap();
        let store = RasterStore::new(temp.path().join("images"));
        let id = ImageId::new();

        let path = store.write(id, &sample_image()).unwrap();
        assert_eq!(path, store.path_for(id));

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "stored raster should be JPEG");

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.dimensions(), (64, 48));
    }

    #[test]
    fn test_write_fails_when_directory_is_a_file() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("images");
        std::fs::write(&blocker, b"file").unwrap();
        let store = RasterStore::new(&blocker);

        assert!(matches!(
            store.write(ImageId::new(), &sample_image()),
            Err(RasterError::Io { .. })
        ));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = RasterStore::new(temp.path());
        let path = store.write(ImageId::new(), &sample_image()).unwrap();

        store.delete(&path).unwrap();
        assert!(!path.exists());
        store.delete(&path).unwrap();
    }

    #[test]
    fn test_delete_reports_failure() {
        let temp = TempDir::new().unwrap();
        let store = RasterStore::new(temp.path());
        let dir_path = temp.path().join("not-a-file");
        std::fs::create_dir(&dir_path).unwrap();

        assert!(matches!(store.delete(&dir_path), Err(RasterError::Io { .. })));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        assert!(matches!(load_raster(&path), Err(RasterError::Decode { .. })));
    }

    #[test]
    fn test_crop_region_uses_top_left_pixels() {
        let image = sample_image();
        // Bottom-left quarter in unit space is the lower-left pixels
        let crop = crop_region(&image, &Region::new(0.0, 0.0, 0.5, 0.5)).unwrap();
        assert_eq!(crop.dimensions(), (32, 24));
        assert_eq!(crop.get_pixel(0, 0), image.get_pixel(0, 24));

        assert!(crop_region(&image, &Region::new(2.0, 2.0, 0.1, 0.1)).is_none());
    }
}
