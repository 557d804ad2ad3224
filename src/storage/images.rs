//! Imported image records

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::Region;

/// Opaque, immutable identifier of an imported image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Uuid);

impl ImageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ImageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Detection state of an image's regions.
///
/// `NotProcessed` and `Processed(vec![])` are different: the first means
/// detection never ran, the second that it ran and found nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegionList {
    #[default]
    NotProcessed,
    Processed(Vec<Region>),
}

impl RegionList {
    pub fn regions(&self) -> &[Region] {
        match self {
            RegionList::NotProcessed => &[],
            RegionList::Processed(regions) => regions,
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, RegionList::Processed(_))
    }

    pub fn contains(&self, region: &Region) -> bool {
        self.regions().contains(region)
    }
}

/// One imported photo and its annotation geometry
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedImage {
    id: ImageId,
    /// Display name
    pub name: String,
    storage_path: PathBuf,
    imported_at: DateTime<Utc>,
    regions: RegionList,
}

impl ImportedImage {
    /// Build a record for a raster that has already been persisted
    pub fn new(id: ImageId, name: impl Into<String>, storage_path: PathBuf) -> Self {
        Self {
            id,
            name: name.into(),
            storage_path,
            imported_at: Utc::now(),
            regions: RegionList::NotProcessed,
        }
    }

    /// Rebuild a record with every field specified (used when decoding)
    pub fn from_parts(
        id: ImageId,
        name: String,
        storage_path: PathBuf,
        imported_at: DateTime<Utc>,
        regions: RegionList,
    ) -> Self {
        Self {
            id,
            name,
            storage_path,
            imported_at,
            regions,
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn storage_path(&self) -> &PathBuf {
        &self.storage_path
    }

    pub fn imported_at(&self) -> DateTime<Utc> {
        self.imported_at
    }

    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    /// Replace the region list with a fresh detection result
    pub fn set_detected_regions(&mut self, regions: Vec<Region>) {
        self.regions = RegionList::Processed(regions);
    }
}
