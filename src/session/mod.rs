//! Annotation Session
//!
//! Owns the image collection and drives detection and lookups. Background work
//! runs on the tokio runtime and reports back over a channel; completions are
//! applied only when the owner pulls them with [`AnnotationSession::next_update`]
//! or [`AnnotationSession::drain_updates`], so all state changes happen on the
//! session itself.

pub mod cache;
pub mod messages;

pub use cache::AnnotationCache;
pub use messages::{
    DeleteReport, DetectionStatus, DisplayRegion, RegionState, SessionUpdate, TapOutcome,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::geometry::{display_point_to_unit, to_display_rect, GeometryError, Point, Region, Size};
use crate::lookup::{self, ImageFragment, InfoLookup, InfoRecord, LookupError, LookupResult};
use crate::storage::raster::{crop_region, encode_jpeg, load_raster};
use crate::storage::{
    AnnotationStore, ImageId, ImportedImage, RasterError, RasterStore, RegionList, StoreError,
};
use crate::vision::{ContourDetector, DetectionError, RegionDetector};
use messages::SessionEvent;

/// Errors returned by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("image {0} not found")]
    ImageNotFound(ImageId),
    #[error("region {region:?} is not part of image {image}")]
    UnknownRegion { image: ImageId, region: Region },
    #[error("detection in progress for image {0}")]
    DetectionInProgress(ImageId),
}

/// Transient per-image state that is never persisted
#[derive(Debug, Default)]
struct ImageRuntime {
    generation: u64,
    detecting: bool,
    last_error: Option<DetectionError>,
    cache: AnnotationCache,
}

/// Single-writer owner of the image collection
pub struct AnnotationSession {
    store: AnnotationStore,
    rasters: RasterStore,
    images: Vec<ImportedImage>,
    runtime: HashMap<ImageId, ImageRuntime>,
    detector: Arc<dyn RegionDetector>,
    lookup: Arc<dyn InfoLookup>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    /// Spawned tasks whose completion has not been received yet
    in_flight: usize,
}

impl AnnotationSession {
    /// Open a session over an existing (or empty) collection
    pub fn open(
        store: AnnotationStore,
        rasters: RasterStore,
        detector: Arc<dyn RegionDetector>,
        lookup: Arc<dyn InfoLookup>,
    ) -> Result<Self, SessionError> {
        let images = store.load_all()?;
        info!(
            "Opened collection {:?} with {} images",
            store.path(),
            images.len()
        );

        let runtime = images
            .iter()
            .map(|image| (image.id(), ImageRuntime::default()))
            .collect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            store,
            rasters,
            images,
            runtime,
            detector,
            lookup,
            events_tx,
            events_rx,
            in_flight: 0,
        })
    }

    /// Open the collection in `data_dir` with the configured detector and lookup
    pub fn from_config(config: &AppConfig, data_dir: &Path) -> Result<Self, SessionError> {
        let store = AnnotationStore::new(data_dir.join(&config.storage.collection_file));
        let rasters = RasterStore::with_quality(
            data_dir.join(&config.storage.images_dir),
            config.storage.jpeg_quality,
        );
        let detector = Arc::new(ContourDetector::new(config.detection.clone()));
        let lookup = lookup::from_settings(&config.lookup)?;
        Self::open(store, rasters, detector, lookup)
    }

    pub fn images(&self) -> &[ImportedImage] {
        &self.images
    }

    pub fn image(&self, id: ImageId) -> Option<&ImportedImage> {
        self.images.iter().find(|image| image.id() == id)
    }

    fn image_index(&self, id: ImageId) -> Result<usize, SessionError> {
        self.images
            .iter()
            .position(|image| image.id() == id)
            .ok_or(SessionError::ImageNotFound(id))
    }

    fn save(&self) -> Result<(), SessionError> {
        self.store.save_all(&self.images)?;
        Ok(())
    }

    /// Persist a new image.
    ///
    /// Nothing is recorded when the raster cannot be written, and the raster is
    /// removed again when the collection cannot be saved.
    pub fn import_image(
        &mut self,
        name: impl Into<String>,
        image: &DynamicImage,
    ) -> Result<ImageId, SessionError> {
        let id = ImageId::new();
        let storage_path = self.rasters.write(id, image)?;
        let record = ImportedImage::new(id, name, storage_path);

        self.images.push(record);
        self.runtime.insert(id, ImageRuntime::default());
        if let Err(e) = self.save() {
            self.runtime.remove(&id);
            if let Some(record) = self.images.pop() {
                if let Err(raster_err) = self.rasters.delete(record.storage_path()) {
                    warn!("Failed to remove raster of unsaved image {}: {}", id, raster_err);
                }
            }
            return Err(e);
        }

        info!("Imported image {}", id);
        Ok(id)
    }

    /// Decode an image file and import it, named after the file when no name is given
    pub fn import_file(
        &mut self,
        path: &Path,
        name: Option<&str>,
    ) -> Result<ImageId, SessionError> {
        let image = load_raster(path)?;
        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Untitled".to_string()),
        };
        self.import_image(name, &image)
    }

    pub fn rename(&mut self, id: ImageId, name: impl Into<String>) -> Result<(), SessionError> {
        let index = self.image_index(id)?;
        let previous = std::mem::replace(&mut self.images[index].name, name.into());
        if let Err(e) = self.save() {
            self.images[index].name = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Remove an image record and its raster.
    ///
    /// When the collection cannot be saved the image stays in place, raster
    /// included. Otherwise the record is removed even when the raster cannot
    /// be; that failure is reported in the returned [`DeleteReport`].
    pub fn delete(&mut self, id: ImageId) -> Result<DeleteReport, SessionError> {
        let index = self.image_index(id)?;
        let record = self.images.remove(index);
        if let Err(e) = self.save() {
            self.images.insert(index, record);
            return Err(e);
        }
        if let Some(mut runtime) = self.runtime.remove(&id) {
            runtime.cache.clear();
        }

        let mut report = DeleteReport::default();
        if let Err(e) = self.rasters.delete(record.storage_path()) {
            warn!("Failed to remove raster for image {}: {}", id, e);
            report.raster_error = Some(e);
        }
        info!("Deleted image {} ({})", record.name, id);
        Ok(report)
    }

    /// Run the detector on an image in the background.
    ///
    /// Any earlier run for the same image is superseded and the image's lookup
    /// cache is cleared. Must be called from within a tokio runtime.
    pub fn start_detection(&mut self, id: ImageId) -> Result<(), SessionError> {
        let index = self.image_index(id)?;
        let path = self.images[index].storage_path().clone();
        let runtime = self.runtime.entry(id).or_default();
        runtime.generation += 1;
        runtime.detecting = true;
        runtime.last_error = None;
        runtime.cache.clear();
        let generation = runtime.generation;

        let detector = Arc::clone(&self.detector);
        let tx = self.events_tx.clone();
        self.in_flight += 1;
        debug!("Starting detection for image {} (generation {})", id, generation);

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                let image = load_raster(&path)
                    .map_err(|e| DetectionError::ImageUnavailable(e.to_string()))?;
                detector.detect(&image)
            })
            .await
            .unwrap_or_else(|e| Err(DetectionError::Failed(e.to_string())));

            let _ = tx.send(SessionEvent::DetectionFinished {
                image: id,
                generation,
                result,
            });
        });

        Ok(())
    }

    pub fn detection_status(&self, id: ImageId) -> Result<DetectionStatus, SessionError> {
        let index = self.image_index(id)?;
        if let Some(runtime) = self.runtime.get(&id) {
            if runtime.detecting {
                return Ok(DetectionStatus::Detecting);
            }
            if let Some(error) = &runtime.last_error {
                return Ok(DetectionStatus::Failed(error.clone()));
            }
        }
        Ok(match self.images[index].regions() {
            RegionList::NotProcessed => DetectionStatus::Unprocessed,
            RegionList::Processed(regions) => DetectionStatus::Detected(regions.clone()),
        })
    }

    fn check_region(&self, id: ImageId, region: &Region) -> Result<usize, SessionError> {
        let index = self.image_index(id)?;
        if !self.images[index].regions().contains(region) {
            return Err(SessionError::UnknownRegion {
                image: id,
                region: *region,
            });
        }
        Ok(index)
    }

    /// Request info for a detected region.
    ///
    /// Cached info is returned directly and a pending lookup is never
    /// duplicated. Must be called from within a tokio runtime.
    pub fn tap_region(&mut self, id: ImageId, region: Region) -> Result<TapOutcome, SessionError> {
        let index = self.check_region(id, &region)?;
        let path = self.images[index].storage_path().clone();
        let quality = self.rasters.quality();

        let runtime = self.runtime.entry(id).or_default();
        if runtime.detecting {
            return Err(SessionError::DetectionInProgress(id));
        }
        match runtime.cache.state(&region) {
            RegionState::Cached(record) => return Ok(TapOutcome::Cached(record)),
            RegionState::Fetching => return Ok(TapOutcome::InFlight),
            RegionState::NotFetched | RegionState::FetchFailed(_) => {}
        }
        let (request, cancel) = runtime.cache.begin_fetch(region);

        let lookup = Arc::clone(&self.lookup);
        let tx = self.events_tx.clone();
        self.in_flight += 1;
        debug!("Looking up region {:?} of image {}", region, id);

        tokio::spawn(async move {
            let outcome = fetch_region_info(lookup, path, region, quality, cancel).await;
            let _ = tx.send(SessionEvent::LookupFinished {
                image: id,
                region,
                request,
                outcome,
            });
        });

        Ok(TapOutcome::Started)
    }

    pub fn region_state(&self, id: ImageId, region: &Region) -> Result<RegionState, SessionError> {
        self.check_region(id, region)?;
        Ok(self
            .runtime
            .get(&id)
            .map(|runtime| runtime.cache.state(region))
            .unwrap_or(RegionState::NotFetched))
    }

    /// Pixel dimensions of an image's stored raster
    pub fn image_size(&self, id: ImageId) -> Result<Size, SessionError> {
        let index = self.image_index(id)?;
        let path = self.images[index].storage_path();
        let dimensions = image::image_dimensions(path).map_err(|source| RasterError::Decode {
            path: path.clone(),
            source,
        })?;
        Ok(Size::from(dimensions))
    }

    /// Display rectangles for every detected region of an image
    pub fn display_regions(
        &self,
        id: ImageId,
        viewport: Size,
    ) -> Result<Vec<DisplayRegion>, SessionError> {
        let index = self.image_index(id)?;
        let image_size = self.image_size(id)?;
        self.images[index]
            .regions()
            .regions()
            .iter()
            .map(|region| -> Result<DisplayRegion, SessionError> {
                let (rect, _) = to_display_rect(region, image_size, viewport)?;
                Ok(DisplayRegion {
                    region: *region,
                    rect,
                })
            })
            .collect()
    }

    /// Region under a display point, if any
    pub fn hit_test(
        &self,
        id: ImageId,
        viewport: Size,
        point: Point,
    ) -> Result<Option<Region>, SessionError> {
        let index = self.image_index(id)?;
        let unit = display_point_to_unit(point, self.image_size(id)?, viewport)?;
        Ok(self.images[index]
            .regions()
            .regions()
            .iter()
            .find(|region| region.contains(unit))
            .copied())
    }

    /// Write each detected region as `<id>_region_<n>.png` in `out_dir`
    pub fn export_region_crops(
        &self,
        id: ImageId,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, SessionError> {
        let index = self.image_index(id)?;
        let record = &self.images[index];
        let image = load_raster(record.storage_path())?;
        std::fs::create_dir_all(out_dir).map_err(|source| RasterError::Io {
            path: out_dir.to_path_buf(),
            source,
        })?;

        let mut written = Vec::new();
        for (n, region) in record.regions().regions().iter().enumerate() {
            let Some(crop) = crop_region(&image, region) else {
                debug!("Region {} of image {} lies outside the raster", n + 1, id);
                continue;
            };
            let path = out_dir.join(format!("{}_region_{}.png", id, n + 1));
            crop.save(&path).map_err(RasterError::Encode)?;
            written.push(path);
        }

        info!("Exported {} region crops of image {} to {:?}", written.len(), id, out_dir);
        Ok(written)
    }

    /// Wait for the next applied update; `None` once no work is pending
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        while self.in_flight > 0 {
            let event = self.events_rx.recv().await?;
            self.in_flight -= 1;
            if let Some(update) = self.apply(event) {
                return Some(update);
            }
        }
        None
    }

    /// Apply every completion that has already arrived
    pub fn drain_updates(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            updates.extend(self.apply(event));
        }
        updates
    }

    /// Whether background work is still outstanding
    pub fn has_pending_work(&self) -> bool {
        self.in_flight > 0
    }

    fn apply(&mut self, event: SessionEvent) -> Option<SessionUpdate> {
        match event {
            SessionEvent::DetectionFinished {
                image,
                generation,
                result,
            } => self.apply_detection(image, generation, result),
            SessionEvent::LookupFinished {
                image,
                region,
                request,
                outcome,
            } => self.apply_lookup(image, region, request, outcome),
        }
    }

    fn apply_detection(
        &mut self,
        id: ImageId,
        generation: u64,
        result: Result<Vec<Region>, DetectionError>,
    ) -> Option<SessionUpdate> {
        let runtime = self.runtime.get_mut(&id)?;
        if runtime.generation != generation {
            debug!("Discarding stale detection for image {} (generation {})", id, generation);
            return None;
        }
        runtime.detecting = false;

        let result = result.and_then(|regions| {
            if regions.iter().all(Region::is_finite) {
                Ok(regions)
            } else {
                Err(DetectionError::Failed(
                    "detector returned a non-finite region".to_string(),
                ))
            }
        });
        match result {
            Ok(regions) => {
                runtime.last_error = None;
                runtime.cache.clear();
                let index = self.images.iter().position(|image| image.id() == id)?;
                self.images[index].set_detected_regions(regions.clone());
                info!("Detected {} regions in image {}", regions.len(), id);

                let persist_error = self.store.save_all(&self.images).err();
                if let Some(e) = &persist_error {
                    warn!("Failed to persist regions for image {}: {}", id, e);
                }
                Some(SessionUpdate::DetectionCompleted {
                    image: id,
                    regions,
                    persist_error,
                })
            }
            Err(error) => {
                warn!("Detection failed for image {}: {}", id, error);
                runtime.last_error = Some(error.clone());
                Some(SessionUpdate::DetectionFailed { image: id, error })
            }
        }
    }

    fn apply_lookup(
        &mut self,
        id: ImageId,
        region: Region,
        request: u64,
        outcome: Option<LookupResult>,
    ) -> Option<SessionUpdate> {
        let runtime = self.runtime.get_mut(&id)?;
        let Some(result) = outcome else {
            runtime.cache.abandon(region, request);
            return None;
        };
        if !runtime.cache.complete(region, request, &result) {
            debug!("Discarding stale lookup for region {:?} of image {}", region, id);
            return None;
        }
        Some(SessionUpdate::RegionInfo {
            image: id,
            region,
            result,
        })
    }

    /// Detect regions and wait for this image's result
    pub async fn detect(&mut self, id: ImageId) -> Result<Vec<Region>, SessionError> {
        self.start_detection(id)?;
        while let Some(update) = self.next_update().await {
            match update {
                SessionUpdate::DetectionCompleted {
                    image,
                    regions,
                    persist_error,
                } if image == id => {
                    return match persist_error {
                        Some(e) => Err(e.into()),
                        None => Ok(regions),
                    };
                }
                SessionUpdate::DetectionFailed { image, error } if image == id => {
                    return Err(error.into());
                }
                _ => {}
            }
        }
        Err(SessionError::ImageNotFound(id))
    }

    /// Tap a region and wait for its info
    pub async fn region_info(
        &mut self,
        id: ImageId,
        region: Region,
    ) -> Result<InfoRecord, SessionError> {
        if let TapOutcome::Cached(record) = self.tap_region(id, region)? {
            return Ok(record);
        }
        while let Some(update) = self.next_update().await {
            if let SessionUpdate::RegionInfo {
                image,
                region: resolved,
                result,
            } = update
            {
                if image == id && resolved == region {
                    return result.map_err(SessionError::from);
                }
            }
        }
        match self.region_state(id, &region)? {
            RegionState::Cached(record) => Ok(record),
            RegionState::FetchFailed(error) => Err(error.into()),
            RegionState::NotFetched | RegionState::Fetching => {
                Err(SessionError::Lookup(LookupError::NoDataFound))
            }
        }
    }
}

/// Crop a region from the stored raster and run the lookup on it.
///
/// Returns `None` when cancelled before the lookup resolved.
async fn fetch_region_info(
    lookup: Arc<dyn InfoLookup>,
    path: PathBuf,
    region: Region,
    quality: u8,
    cancel: CancellationToken,
) -> Option<LookupResult> {
    let fragment = tokio::task::spawn_blocking(move || build_fragment(&path, &region, quality))
        .await
        .map_err(|e| LookupError::Service(e.to_string()))
        .and_then(|built| built.map_err(|e| LookupError::Service(e.to_string())));
    let fragment = match fragment {
        Ok(fragment) => fragment,
        Err(error) => return Some(Err(error)),
    };
    if cancel.is_cancelled() {
        return None;
    }

    let handle = lookup.lookup(fragment);
    let lookup_cancel = handle.cancel_token();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            lookup_cancel.cancel();
            None
        }
        outcome = handle.outcome() => outcome,
    }
}

/// JPEG fragment of a region; empty when the region misses the raster
fn build_fragment(path: &Path, region: &Region, quality: u8) -> Result<ImageFragment, RasterError> {
    let image = load_raster(path)?;
    match crop_region(&image, region) {
        Some(crop) => {
            let bytes = encode_jpeg(&crop, quality)?;
            Ok(ImageFragment::new(bytes, crop.width(), crop.height()))
        }
        None => Ok(ImageFragment::default()),
    }
}
