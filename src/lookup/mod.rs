//! Info Lookup
//!
//! Retrieves descriptive information for a cropped stamp fragment. A lookup
//! resolves asynchronously and exactly once; the returned [`LookupHandle`]
//! can cancel delivery before the result arrives.

pub mod http;
pub mod simulated;

pub use http::HttpInfoLookup;
pub use simulated::SimulatedLookup;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::LookupSettings;

/// Information attached to a region after a successful lookup
///
/// Every field except the title may be missing from a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoRecord {
    pub title: String,
    /// Issuing country or postal administration
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub issue_date: Option<String>,
    /// Rarity class, e.g. "common" or "rare"
    #[serde(default)]
    pub rarity: Option<String>,
    /// Face value as printed
    #[serde(default)]
    pub nominal_value: Option<String>,
    /// Estimated market value, free text
    #[serde(default)]
    pub estimated_value: Option<String>,
    /// Long-form description and history
    #[serde(default)]
    pub narrative: String,
    /// Source URLs in the order they were consulted; not validated
    #[serde(default)]
    pub source_urls: Vec<String>,
}

/// Encoded pixels of one region, sent to the lookup service
#[derive(Debug, Clone, Default)]
pub struct ImageFragment {
    /// JPEG bytes
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ImageFragment {
    pub fn new(bytes: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            bytes,
            width,
            height,
        }
    }

    /// True when there is nothing to identify
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() || self.width == 0 || self.height == 0
    }
}

/// Lookup failure, always retryable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("lookup service error: {0}")]
    Service(String),
    #[error("no data found for this fragment")]
    NoDataFound,
    #[error("lookup timed out")]
    Timeout,
}

pub type LookupResult = Result<InfoRecord, LookupError>;

/// Pending lookup
///
/// Resolves at most once. After [`cancel`](Self::cancel) the outcome is
/// `None` even if the underlying work completes.
#[derive(Debug)]
pub struct LookupHandle {
    cancel: CancellationToken,
    rx: oneshot::Receiver<LookupResult>,
}

impl LookupHandle {
    /// Create a handle and the sending half a lookup task resolves
    pub fn channel() -> (LookupHandle, LookupResolver) {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let resolver = LookupResolver {
            cancel: cancel.clone(),
            tx,
        };
        (LookupHandle { cancel, rx }, resolver)
    }

    /// Suppress delivery of the result
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token shared with the resolving task
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the result; `None` when cancelled or the task went away
    pub async fn outcome(self) -> Option<LookupResult> {
        let LookupHandle { cancel, rx } = self;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = rx => result.ok().filter(|_| !cancel.is_cancelled()),
        }
    }
}

/// Sending half of a [`LookupHandle`]
#[derive(Debug)]
pub struct LookupResolver {
    cancel: CancellationToken,
    tx: oneshot::Sender<LookupResult>,
}

impl LookupResolver {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve once; dropped silently when cancelled
    pub fn resolve(self, result: LookupResult) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.tx.send(result);
    }
}

/// Source of region information
pub trait InfoLookup: Send + Sync {
    /// Start a lookup. Must be called inside a tokio runtime.
    fn lookup(&self, fragment: ImageFragment) -> LookupHandle;
}

/// Build the configured lookup: HTTP when an endpoint is set, simulated otherwise
pub fn from_settings(settings: &LookupSettings) -> Result<Arc<dyn InfoLookup>, LookupError> {
    match &settings.endpoint {
        Some(endpoint) => {
            info!("Using HTTP info lookup at {}", endpoint);
            let lookup =
                HttpInfoLookup::new(endpoint.clone(), Duration::from_millis(settings.timeout_ms))?;
            Ok(Arc::new(lookup))
        }
        None => {
            info!(
                "Using simulated info lookup ({}-{} ms, failure p={})",
                settings.min_latency_ms, settings.max_latency_ms, settings.failure_probability
            );
            Ok(Arc::new(SimulatedLookup::from_settings(settings)))
        }
    }
}
