//! Message and state types exchanged with the annotation session

use crate::geometry::{Rect, Region};
use crate::lookup::{InfoRecord, LookupError, LookupResult};
use crate::storage::{ImageId, RasterError, StoreError};
use crate::vision::DetectionError;

/// Completions sent from background tasks to the session
#[derive(Debug)]
pub(crate) enum SessionEvent {
    DetectionFinished {
        image: ImageId,
        generation: u64,
        result: Result<Vec<Region>, DetectionError>,
    },
    LookupFinished {
        image: ImageId,
        region: Region,
        request: u64,
        /// `None` when the lookup was cancelled
        outcome: Option<LookupResult>,
    },
}

/// Applied state changes reported to the session owner
#[derive(Debug)]
pub enum SessionUpdate {
    /// New regions replaced the previous list
    DetectionCompleted {
        image: ImageId,
        regions: Vec<Region>,
        /// Set when the updated collection could not be written
        persist_error: Option<StoreError>,
    },
    /// Detection failed; the previous region list is untouched
    DetectionFailed {
        image: ImageId,
        error: DetectionError,
    },
    /// A region lookup resolved
    RegionInfo {
        image: ImageId,
        region: Region,
        result: LookupResult,
    },
}

/// Result of tapping a region
#[derive(Debug, Clone, PartialEq)]
pub enum TapOutcome {
    /// Info was already cached; no lookup was issued
    Cached(InfoRecord),
    /// A lookup for this region is already pending
    InFlight,
    /// A new lookup was started
    Started,
}

/// Detection state of one image
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionStatus {
    Unprocessed,
    Detecting,
    Detected(Vec<Region>),
    /// Last run failed; any earlier region list is still attached to the image
    Failed(DetectionError),
}

/// Lookup state of one region
#[derive(Debug, Clone, PartialEq)]
pub enum RegionState {
    NotFetched,
    Fetching,
    Cached(InfoRecord),
    FetchFailed(LookupError),
}

/// Outcome of deleting an image
#[derive(Debug, Default)]
pub struct DeleteReport {
    /// Raster that could not be removed, if any
    pub raster_error: Option<RasterError>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.raster_error.is_none()
    }
}

/// A region together with its rectangle on a display surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayRegion {
    pub region: Region,
    pub rect: Rect,
}
