//! Simulated lookup service
//!
//! Resolves after a random delay with a canned record, or fails with a fixed
//! probability. The generator is seedable so sequences are reproducible.

use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{ImageFragment, InfoLookup, InfoRecord, LookupError, LookupHandle};
use crate::config::LookupSettings;

struct CatalogEntry {
    title: &'static str,
    origin: &'static str,
    issue_date: &'static str,
    rarity: &'static str,
    nominal_value: &'static str,
    estimated_value: &'static str,
    narrative: &'static str,
    source_url: &'static str,
}

impl CatalogEntry {
    fn record(&self) -> InfoRecord {
        InfoRecord {
            title: self.title.to_string(),
            origin: Some(self.origin.to_string()),
            issue_date: Some(self.issue_date.to_string()),
            rarity: Some(self.rarity.to_string()),
            nominal_value: Some(self.nominal_value.to_string()),
            estimated_value: Some(self.estimated_value.to_string()),
            narrative: self.narrative.to_string(),
            source_urls: vec![self.source_url.to_string()],
        }
    }
}

/// Canned payloads
const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        title: "Penny Black",
        origin: "United Kingdom",
        issue_date: "1840-05-06",
        rarity: "common",
        nominal_value: "1d",
        estimated_value: "$50 - $3,000",
        narrative: "The first adhesive postage stamp, bearing a profile of Queen Victoria.",
        source_url: "https://en.wikipedia.org/wiki/Penny_Black",
    },
    CatalogEntry {
        title: "Inverted Jenny",
        origin: "United States",
        issue_date: "1918-05-10",
        rarity: "legendary",
        nominal_value: "24c",
        estimated_value: "$500,000+",
        narrative: "Airmail stamp with the Curtiss JN-4 printed upside down.",
        source_url: "https://en.wikipedia.org/wiki/Inverted_Jenny",
    },
    CatalogEntry {
        title: "Basel Dove",
        origin: "Switzerland",
        issue_date: "1845-07-01",
        rarity: "rare",
        nominal_value: "2½ rappen",
        estimated_value: "$10,000 - $25,000",
        narrative: "Embossed cantonal issue showing a dove carrying a letter.",
        source_url: "https://en.wikipedia.org/wiki/Basel_Dove",
    },
    CatalogEntry {
        title: "Blue Mauritius",
        origin: "Mauritius",
        issue_date: "1847-09-21",
        rarity: "legendary",
        nominal_value: "2d",
        estimated_value: "$1,000,000+",
        narrative: "One of the first stamps issued in a British colony.",
        source_url: "https://en.wikipedia.org/wiki/Mauritius_%22Post_Office%22_stamps",
    },
    CatalogEntry {
        title: "Bull's Eye",
        origin: "Brazil",
        issue_date: "1843-08-01",
        rarity: "rare",
        nominal_value: "30/60/90 réis",
        estimated_value: "$1,000 - $20,000",
        narrative: "The first stamps of the Americas issued by a national government.",
        source_url: "https://en.wikipedia.org/wiki/Bull%27s_Eye_(stamp)",
    },
];

/// Lookup that fabricates results after a simulated delay
#[derive(Debug)]
pub struct SimulatedLookup {
    min_latency: Duration,
    max_latency: Duration,
    failure_probability: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedLookup {
    pub fn new(
        min_latency: Duration,
        max_latency: Duration,
        failure_probability: f64,
        rng: StdRng,
    ) -> Self {
        let (min_latency, max_latency) = if min_latency <= max_latency {
            (min_latency, max_latency)
        } else {
            (max_latency, min_latency)
        };
        Self {
            min_latency,
            max_latency,
            failure_probability: if failure_probability.is_nan() {
                0.0
            } else {
                failure_probability.clamp(0.0, 1.0)
            },
            rng: Mutex::new(rng),
        }
    }

    /// Reproducible service for a given seed
    pub fn seeded(
        min_latency: Duration,
        max_latency: Duration,
        failure_probability: f64,
        seed: u64,
    ) -> Self {
        Self::new(
            min_latency,
            max_latency,
            failure_probability,
            StdRng::seed_from_u64(seed),
        )
    }

    pub fn from_settings(settings: &LookupSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::new(
            Duration::from_millis(settings.min_latency_ms),
            Duration::from_millis(settings.max_latency_ms),
            settings.failure_probability,
            rng,
        )
    }

    /// Draw the latency and outcome of one call
    fn draw(&self, fragment: &ImageFragment) -> (Duration, Result<InfoRecord, LookupError>) {
        let mut rng = self.rng.lock();

        let min = self.min_latency.as_millis() as u64;
        let max = self.max_latency.as_millis() as u64;
        let latency = Duration::from_millis(rng.random_range(min..=max));

        if fragment.is_empty() {
            return (latency, Err(LookupError::NoDataFound));
        }
        if rng.random_bool(self.failure_probability) {
            return (
                latency,
                Err(LookupError::Service("simulated service failure".to_string())),
            );
        }

        let entry = &CATALOG[rng.random_range(0..CATALOG.len())];
        (latency, Ok(entry.record()))
    }
}

impl InfoLookup for SimulatedLookup {
    fn lookup(&self, fragment: ImageFragment) -> LookupHandle {
        let (handle, resolver) = LookupHandle::channel();
        let (latency, result) = self.draw(&fragment);
        debug!(
            "Simulated lookup for {}x{} fragment resolves in {:?} (ok: {})",
            fragment.width,
            fragment.height,
            latency,
            result.is_ok()
        );

        // Cancellation only suppresses delivery; the delay always runs out
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            resolver.resolve(result);
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment() -> ImageFragment {
        ImageFragment::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 32, 32)
    }

    fn instant(failure_probability: f64, seed: u64) -> SimulatedLookup {
        SimulatedLookup::seeded(Duration::ZERO, Duration::ZERO, failure_probability, seed)
    }

    #[tokio::test]
    async fn test_probability_zero_always_succeeds() {
        let service = instant(0.0, 7);
        for _ in 0..50 {
            let outcome = service.lookup(fragment()).outcome().await;
            assert!(matches!(outcome, Some(Ok(_))));
        }
    }

    #[tokio::test]
    async fn test_record_fills_every_field() {
        let service = instant(0.0, 11);
        let record = service.lookup(fragment()).outcome().await.unwrap().unwrap();

        assert!(CATALOG.iter().any(|entry| entry.title == record.title));
        assert!(record.origin.is_some());
        assert!(record.issue_date.is_some());
        assert!(record.rarity.is_some());
        assert!(record.nominal_value.is_some());
        assert!(record.estimated_value.is_some());
        assert!(!record.narrative.is_empty());
        assert!(!record.source_urls.is_empty());
    }

    #[tokio::test]
    async fn test_probability_one_always_fails() {
        let service = instant(1.0, 7);
        for _ in 0..50 {
            let outcome = service.lookup(fragment()).outcome().await;
            assert!(matches!(outcome, Some(Err(LookupError::Service(_)))));
        }
    }

    #[tokio::test]
    async fn test_empty_fragment_has_no_data() {
        let service = instant(0.0, 1);
        let outcome = service.lookup(ImageFragment::default()).outcome().await;
        assert_eq!(outcome, Some(Err(LookupError::NoDataFound)));
    }

    #[tokio::test]
    async fn test_cancel_suppresses_delivery() {
        let service = SimulatedLookup::seeded(
            Duration::from_millis(20),
            Duration::from_millis(40),
            0.0,
            3,
        );
        let handle = service.lookup(fragment());
        handle.cancel();

        assert_eq!(handle.outcome().await, None);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let a = SimulatedLookup::seeded(
            Duration::from_millis(500),
            Duration::from_millis(1500),
            0.5,
            99,
        );
        let b = SimulatedLookup::seeded(
            Duration::from_millis(500),
            Duration::from_millis(1500),
            0.5,
            99,
        );

        for _ in 0..20 {
            let (latency_a, result_a) = a.draw(&fragment());
            let (latency_b, result_b) = b.draw(&fragment());
            assert_eq!(latency_a, latency_b);
            assert_eq!(result_a, result_b);
            assert!(latency_a >= Duration::from_millis(500));
            assert!(latency_a <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_settings_are_normalized() {
        let service = SimulatedLookup::seeded(
            Duration::from_millis(900),
            Duration::from_millis(100),
            4.0,
            0,
        );
        assert_eq!(service.min_latency, Duration::from_millis(100));
        assert_eq!(service.max_latency, Duration::from_millis(900));
        assert!((service.failure_probability - 1.0).abs() < f64::EPSILON);
    }
}
