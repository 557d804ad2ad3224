//! Per-image lookup cache keyed by region

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::messages::RegionState;
use crate::geometry::Region;
use crate::lookup::{InfoRecord, LookupError, LookupResult};

#[derive(Debug)]
enum CacheEntry {
    Fetching {
        request: u64,
        cancel: CancellationToken,
    },
    Cached(InfoRecord),
    Failed(LookupError),
}

/// Lookup results for the regions of one image
///
/// At most one lookup per region is in flight. Request numbers are never
/// reused, so a completion only lands on the fetch that started it.
#[derive(Debug, Default)]
pub struct AnnotationCache {
    entries: HashMap<Region, CacheEntry>,
    next_request: u64,
}

impl AnnotationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, region: &Region) -> RegionState {
        match self.entries.get(region) {
            None => RegionState::NotFetched,
            Some(CacheEntry::Fetching { .. }) => RegionState::Fetching,
            Some(CacheEntry::Cached(record)) => RegionState::Cached(record.clone()),
            Some(CacheEntry::Failed(error)) => RegionState::FetchFailed(error.clone()),
        }
    }

    /// Mark a region as fetching; returns the request number and its cancel token
    pub fn begin_fetch(&mut self, region: Region) -> (u64, CancellationToken) {
        let request = self.next_request;
        self.next_request += 1;
        let cancel = CancellationToken::new();
        if let Some(CacheEntry::Fetching { cancel: previous, .. }) = self.entries.insert(
            region,
            CacheEntry::Fetching {
                request,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel();
        }
        (request, cancel)
    }

    /// Store a completion; returns false when it belongs to a superseded fetch
    pub fn complete(&mut self, region: Region, request: u64, result: &LookupResult) -> bool {
        match self.entries.get(&region) {
            Some(CacheEntry::Fetching { request: current, .. }) if *current == request => {}
            _ => return false,
        }
        let entry = match result {
            Ok(record) => CacheEntry::Cached(record.clone()),
            Err(error) => CacheEntry::Failed(error.clone()),
        };
        self.entries.insert(region, entry);
        true
    }

    /// Forget a fetch that was cancelled before it resolved
    pub fn abandon(&mut self, region: Region, request: u64) {
        if matches!(
            self.entries.get(&region),
            Some(CacheEntry::Fetching { request: current, .. }) if *current == request
        ) {
            self.entries.remove(&region);
        }
    }

    /// Drop every entry, cancelling lookups still in flight
    pub fn clear(&mut self) {
        let mut cancelled = 0;
        for entry in self.entries.values() {
            if let CacheEntry::Fetching { cancel, .. } = entry {
                cancel.cancel();
                cancelled += 1;
            }
        }
        if !self.entries.is_empty() {
            debug!(
                "Cleared {} cached regions ({} lookups cancelled)",
                self.entries.len(),
                cancelled
            );
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
