//! Storage Layer
//!
//! Handles persistence of the imported image collection (a single JSON file
//! replaced atomically on every save) and of the raster files it references.

pub mod collection;
pub mod images;
pub mod raster;

pub use collection::AnnotationStore;
pub use images::{ImageId, ImportedImage, RegionList};
pub use raster::{RasterError, RasterStore};

use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading or saving the collection
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode collection {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode collection: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("storage directory unavailable: {0}")]
    DirectoryUnavailable(String),
}

fn project_dirs() -> Result<directories::ProjectDirs, StoreError> {
    directories::ProjectDirs::from("com", "stampannotator", "StampAnnotator").ok_or_else(|| {
        StoreError::DirectoryUnavailable("could not determine home directory".to_string())
    })
}

fn ensure_dir(dir: PathBuf) -> Result<PathBuf, StoreError> {
    std::fs::create_dir_all(&dir).map_err(|e| {
        StoreError::DirectoryUnavailable(format!("{}: {}", dir.display(), e))
    })?;
    Ok(dir)
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf, StoreError> {
    ensure_dir(project_dirs()?.data_dir().to_path_buf())
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf, StoreError> {
    ensure_dir(project_dirs()?.config_dir().to_path_buf())
}

/// Resolve the data directory, preferring an explicit override
pub fn resolve_data_dir(override_dir: Option<&std::path::Path>) -> Result<PathBuf, StoreError> {
    match override_dir {
        Some(dir) => ensure_dir(dir.to_path_buf()),
        None => get_data_dir(),
    }
}
