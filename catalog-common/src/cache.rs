//! Run-scoped geocoding cache with single-flight resolution.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::future::Cache;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EnrichError, FetchError};
use crate::fetcher::Fetcher;
use crate::metrics_consts::{GEOCODE_CACHE_HITS, GEOCODE_CACHE_MISSES, GEOCODE_RESOLUTION_FAILURES};
use crate::record::GeocodeResult;

/// Anything that can geocode an address: the HTTP fetcher in production, fakes in tests.
pub type Geocoder = Arc<dyn Fetcher<Query = String, Output = GeocodeResult>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    /// Lookups that resolved the address remotely. Equals the number of geocoder calls.
    pub misses: u64,
    /// Lookups whose geocoder call failed and were stored as unmatched.
    pub resolution_failures: u64,
}

/// Trim, case-fold and collapse inner whitespace.
pub fn normalize_address(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Maps normalized addresses to their geocoding result for the duration of one run.
///
/// Concurrent lookups of the same key share one in-flight geocoder call. Every completed
/// result is kept, unmatched ones included, so an unresolvable address is never retried.
pub struct GeocodingCache {
    geocoder: Geocoder,
    entries: Cache<String, Arc<GeocodeResult>>,
    hits: AtomicU64,
    misses: AtomicU64,
    resolution_failures: AtomicU64,
}

impl GeocodingCache {
    pub fn new(geocoder: Geocoder) -> Self {
        Self {
            geocoder,
            // Unbounded: entries must live until the end of the run.
            entries: Cache::builder().build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            resolution_failures: AtomicU64::new(0),
        }
    }

    /// Resolve `address`, hitting the geocoder at most once per normalized key.
    ///
    /// A geocoder failure resolves to an unmatched result. Only cancellation is returned as an
    /// error, and in that case nothing is cached for the key.
    pub async fn resolve(&self, address: &str) -> Result<Arc<GeocodeResult>, EnrichError> {
        let key = normalize_address(address);

        let entry = self
            .entries
            .entry(key.clone())
            .or_try_insert_with(self.lookup(key))
            .await
            .map_err(|error| (*error).clone())?;

        if entry.is_fresh() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(GEOCODE_CACHE_MISSES).increment(1);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(GEOCODE_CACHE_HITS).increment(1);
        }

        Ok(entry.into_value())
    }

    async fn lookup(&self, key: String) -> Result<Arc<GeocodeResult>, EnrichError> {
        debug!(address = key.as_str(), "geocoding");

        match self.geocoder.fetch(key.clone()).await {
            Ok(result) => Ok(Arc::new(result)),
            Err(FetchError::Cancelled) => Err(EnrichError::Cancelled),
            Err(error) => {
                warn!(address = key.as_str(), "geocoding failed, storing as unmatched: {}", error);
                self.resolution_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(GEOCODE_RESOLUTION_FAILURES).increment(1);
                Ok(Arc::new(GeocodeResult::unmatched(key)))
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            resolution_failures: self.resolution_failures.load(Ordering::Relaxed),
        }
    }
}
