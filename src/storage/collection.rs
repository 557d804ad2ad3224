//! Durable image collection
//!
//! The whole collection lives in one JSON file. Saves write a sibling temporary
//! file, sync it, and rename it over the previous file, so a crash at any point
//! leaves either the old or the new collection on disk, never a partial one.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::images::{ImageId, ImportedImage, RegionList};
use super::StoreError;
use crate::geometry::Region;

/// Default collection file name inside the data directory
pub const COLLECTION_FILE: &str = "collection.json";

/// On-disk shape of one image record.
///
/// `regions` is omitted entirely for images that were never processed, and
/// written as an empty array for images where detection found nothing.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageRecord {
    id: ImageId,
    name: String,
    storage_path: PathBuf,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regions: Option<Vec<Region>>,
}

impl From<&ImportedImage> for ImageRecord {
    fn from(image: &ImportedImage) -> Self {
        let regions = match image.regions() {
            RegionList::NotProcessed => None,
            RegionList::Processed(regions) => Some(regions.clone()),
        };
        Self {
            id: image.id(),
            name: image.name.clone(),
            storage_path: image.storage_path().clone(),
            timestamp: image.imported_at(),
            regions,
        }
    }
}

impl From<ImageRecord> for ImportedImage {
    fn from(record: ImageRecord) -> Self {
        let regions = match record.regions {
            None => RegionList::NotProcessed,
            Some(regions) => RegionList::Processed(regions),
        };
        ImportedImage::from_parts(
            record.id,
            record.name,
            record.storage_path,
            record.timestamp,
            regions,
        )
    }
}

/// Loads and saves the image collection file
#[derive(Debug)]
pub struct AnnotationStore {
    path: PathBuf,
    /// Serializes saves so only one temp-write/rename is in flight per store
    write_lock: Mutex<()>,
}

impl AnnotationStore {
    /// Create a store backed by the given collection file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a store using the default file name inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(COLLECTION_FILE))
    }

    /// Path of the collection file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full collection.
    ///
    /// A missing file is the first-run state and yields an empty collection.
    pub fn load_all(&self) -> Result<Vec<ImportedImage>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No collection at {:?}, starting empty", self.path);
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let records: Vec<ImageRecord> =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
                path: self.path.clone(),
                source,
            })?;

        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.id) {
                return Err(StoreError::Decode {
                    path: self.path.clone(),
                    source: serde::de::Error::custom(format!("duplicate image id {}", record.id)),
                });
            }
        }

        info!("Loaded {} images from {:?}", records.len(), self.path);
        Ok(records.into_iter().map(ImportedImage::from).collect())
    }

    /// Persist the full collection, atomically replacing the previous file
    pub fn save_all(&self, images: &[ImportedImage]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let staged = self.stage(images)?;
        self.commit(staged)?;
        debug!("Saved {} images to {:?}", images.len(), self.path);
        Ok(())
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Write the encoded collection to a synced temporary file next to the target
    fn stage(&self, images: &[ImportedImage]) -> Result<NamedTempFile, StoreError> {
        // JSON has no NaN or infinity; serde_json would write null and the file
        // would no longer load
        if let Some(image) = images
            .iter()
            .find(|image| image.regions().regions().iter().any(|r| !r.is_finite()))
        {
            return Err(StoreError::Encode(serde::ser::Error::custom(format!(
                "non-finite region in image {}",
                image.id()
            ))));
        }

        let records: Vec<ImageRecord> = images.iter().map(ImageRecord::from).collect();
        let encoded = serde_json::to_vec_pretty(&records).map_err(StoreError::Encode)?;

        let parent = self.parent_dir();
        std::fs::create_dir_all(&parent).map_err(|e| {
            StoreError::DirectoryUnavailable(format!("{}: {}", parent.display(), e))
        })?;

        let io_err = |source: std::io::Error| StoreError::Io {
            path: parent.clone(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(&parent).map_err(io_err)?;
        tmp.write_all(&encoded).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        Ok(tmp)
    }

    /// Swap a staged file into place
    fn commit(&self, staged: NamedTempFile) -> Result<(), StoreError> {
        staged.persist(&self.path).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn image(name: &str, regions: RegionList) -> ImportedImage {
        let id = ImageId::new();
        ImportedImage::from_parts(
            id,
            name.to_string(),
            PathBuf::from(format!("/data/images/{id}.jpg")),
            Utc::now(),
            regions,
        )
    }

    /// One-record collection file with a raw `regions` value
    fn record_json(id: ImageId, regions: &str) -> String {
        let head = format!(r#"{{"id":"{id}","name":"x","storagePath":"/x.jpg""#);
        format!(r#"[{head},"timestamp":"2024-05-01T10:00:00Z","regions":{regions}}}]"#)
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());

        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_empty_collection() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());

        store.save_all(&[]).unwrap();
        assert!(store.path().exists());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_preserves_region_states() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());

        let images = vec![
            image("unprocessed", RegionList::NotProcessed),
            image("nothing found", RegionList::Processed(Vec::new())),
            image(
                "two stamps",
                RegionList::Processed(vec![
                    Region::new(0.1, 0.1, 0.2, 0.2),
                    Region::new(1.0 / 3.0, 0.7, 0.123456789012345, 0.05),
                ]),
            ),
        ];

        store.save_all(&images).unwrap();
        let loaded = store.load_all().unwrap();

        assert_eq!(loaded, images);
        assert_eq!(loaded[0].regions(), &RegionList::NotProcessed);
        assert_eq!(loaded[1].regions(), &RegionList::Processed(Vec::new()));
    }

    #[test]
    fn test_wire_format_distinguishes_absent_and_empty_regions() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());

        let images = vec![
            image("a", RegionList::NotProcessed),
            image("b", RegionList::Processed(Vec::new())),
            image("c", RegionList::Processed(vec![Region::new(0.1, 0.1, 0.2, 0.2)])),
        ];
        store.save_all(&images).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        let records = raw.as_array().unwrap();

        assert!(records[0].get("regions").is_none());
        assert_eq!(records[1]["regions"], serde_json::json!([]));
        assert_eq!(records[2]["regions"], serde_json::json!([[0.1, 0.1, 0.2, 0.2]]));
        assert!(records[0].get("storagePath").is_some());
        assert!(records[0].get("timestamp").is_some());
    }

    #[test]
    fn test_null_regions_decode_as_unprocessed() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());
        let id = ImageId::new();
        let json = record_json(id, "null");
        std::fs::write(store.path(), json).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].regions(), &RegionList::NotProcessed);
    }

    #[test]
    fn test_corrupt_file_is_decode_failure() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());
        std::fs::write(store.path(), b"[{\"id\": ").unwrap();

        assert!(matches!(store.load_all(), Err(StoreError::Decode { .. })));
    }

    #[test]
    fn test_malformed_region_tuple_is_decode_failure() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());
        let id = ImageId::new();
        let json = record_json(id, "[[0.1,0.2,0.3]]");
        std::fs::write(store.path(), json).unwrap();

        assert!(matches!(store.load_all(), Err(StoreError::Decode { .. })));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());
        let first = image("a", RegionList::NotProcessed);
        let duplicate = ImportedImage::from_parts(
            first.id(),
            "b".to_string(),
            PathBuf::from("/b.jpg"),
            Utc::now(),
            RegionList::NotProcessed,
        );
        store.save_all(&[first, duplicate]).unwrap();

        assert!(matches!(store.load_all(), Err(StoreError::Decode { .. })));
    }

    #[test]
    fn test_unreadable_path_is_io_failure() {
        let temp = TempDir::new().unwrap();
        // A directory where the file should be
        let store = AnnotationStore::new(temp.path().to_path_buf());

        assert!(matches!(store.load_all(), Err(StoreError::Io { .. })));
    }

    #[test]
    fn test_interrupted_save_keeps_previous_file() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());
        let regions = RegionList::Processed(vec![Region::new(0.1, 0.1, 0.2, 0.2)]);
        let original = vec![image("original", regions)];
        store.save_all(&original).unwrap();

        // Stage a replacement but never commit it, as if the process died before rename
        let replacement = vec![image("replacement", RegionList::NotProcessed); 3];
        let staged = store.stage(&replacement).unwrap();
        let staged_path = staged.path().to_path_buf();
        assert!(staged_path.exists());
        assert_eq!(store.load_all().unwrap(), original);

        drop(staged);
        assert!(!staged_path.exists());
        assert_eq!(store.load_all().unwrap(), original);
    }

    #[test]
    fn test_non_finite_region_is_rejected_before_writing() {
        let temp = TempDir::new().unwrap();
        let store = AnnotationStore::in_dir(temp.path());
        let original = vec![image("original", RegionList::NotProcessed)];
        store.save_all(&original).unwrap();

        for bad in [
            Region::new(f64::NAN, 0.1, 0.2, 0.2),
            Region::new(0.1, 0.1, f64::INFINITY, 0.2),
        ] {
            let images = vec![image("bad", RegionList::Processed(vec![bad]))];
            assert!(matches!(store.save_all(&images), Err(StoreError::Encode(_))));
            assert_eq!(store.load_all().unwrap(), original);
        }
        let leftovers = std::fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_concurrent_saves_never_corrupt_file() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(AnnotationStore::in_dir(temp.path()));
        store.save_all(&[image("seed", RegionList::NotProcessed)]).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|n| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for round in 0..20 {
                        let images: Vec<_> = (0..(n + round) % 5 + 1)
                            .map(|i| {
                                image(
                                    &format!("w{n}-r{round}-{i}"),
                                    RegionList::Processed(vec![Region::new(0.1, 0.2, 0.3, 0.4); i]),
                                )
                            })
                            .collect();
                        store.save_all(&images).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let loaded = store.load_all().expect("collection must stay parsable");
                    assert!(!loaded.is_empty());
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();

        let final_state = store.load_all().unwrap();
        assert!(!final_state.is_empty());
    }
}
