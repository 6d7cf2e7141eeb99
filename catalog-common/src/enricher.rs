use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{normalize_address, GeocodingCache};
use crate::error::EnrichError;
use crate::record::{CatalogRecord, EnrichedRecord, GeocodeResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EnrichmentStats {
    pub records: usize,
    pub records_with_address: usize,
    pub distinct_addresses: usize,
    /// Distinct addresses left unresolved because of `max_addresses`.
    pub addresses_skipped: usize,
    /// Resolved distinct addresses that matched.
    pub matched_addresses: usize,
    /// `matched_addresses` over resolved distinct addresses.
    pub match_rate: f64,
    /// Mean confidence over matched distinct addresses.
    pub mean_confidence: f64,
}

/// Cross-enriches catalog records with geocoded store locations.
pub struct Enricher<'c> {
    cache: &'c GeocodingCache,
    max_addresses: Option<usize>,
}

impl<'c> Enricher<'c> {
    pub fn new(cache: &'c GeocodingCache) -> Self {
        Self {
            cache,
            max_addresses: None,
        }
    }

    /// Resolve at most `max_addresses` distinct addresses, in first-seen order.
    pub fn with_max_addresses(mut self, max_addresses: Option<usize>) -> Self {
        self.max_addresses = max_addresses;
        self
    }

    /// Geocode every distinct store address once, then merge the results back into the records.
    ///
    /// The output has the same records, in the same order, as the input. Lookups run concurrently
    /// and are paced by the geocoder's rate limiter; merging is by address key, so completion
    /// order does not matter.
    pub async fn enrich(
        &self,
        records: Vec<CatalogRecord>,
    ) -> Result<(Vec<EnrichedRecord>, EnrichmentStats), EnrichError> {
        let keys: Vec<Option<String>> = records
            .iter()
            .map(|record| record.store_address().map(normalize_address))
            .collect();

        let mut seen = HashSet::new();
        let mut distinct: Vec<&str> = Vec::new();
        for key in keys.iter().flatten() {
            if seen.insert(key.as_str()) {
                distinct.push(key.as_str());
            }
        }

        let limit = self.max_addresses.unwrap_or(distinct.len()).min(distinct.len());
        if limit < distinct.len() {
            warn!(
                distinct = distinct.len(),
                limit, "resolving only the first addresses"
            );
        }
        let selected = &distinct[..limit];

        info!(addresses = selected.len(), "geocoding distinct addresses");
        let resolved: HashMap<&str, Arc<GeocodeResult>> =
            try_join_all(selected.iter().map(|&key| async move {
                let result = self.cache.resolve(key).await?;
                Ok::<_, EnrichError>((key, result))
            }))
            .await?
            .into_iter()
            .collect();

        let matched: Vec<&Arc<GeocodeResult>> =
            resolved.values().filter(|result| result.matched).collect();
        let stats = EnrichmentStats {
            records: records.len(),
            records_with_address: keys.iter().flatten().count(),
            distinct_addresses: distinct.len(),
            addresses_skipped: distinct.len() - limit,
            matched_addresses: matched.len(),
            match_rate: ratio(matched.len(), resolved.len()),
            mean_confidence: if matched.is_empty() {
                0.0
            } else {
                matched.iter().map(|result| result.confidence).sum::<f64>() / matched.len() as f64
            },
        };

        let enriched = records
            .into_iter()
            .zip(keys.iter())
            .map(|(record, key)| {
                match key.as_deref().and_then(|key| resolved.get(key)) {
                    Some(result) => EnrichedRecord::merge(record, result),
                    None => EnrichedRecord::unenriched(record),
                }
            })
            .collect();

        info!(
            matched = stats.matched_addresses,
            match_rate = stats.match_rate,
            "enrichment finished"
        );

        Ok((enriched, stats))
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::FetchError;
    use crate::fetcher::Fetcher;

    /// Matches addresses containing "paris" with confidence 0.8, nothing else.
    #[derive(Default)]
    struct ParisOnly {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Fetcher for ParisOnly {
        type Query = String;
        type Output = GeocodeResult;

        async fn fetch(&self, address: String) -> Result<GeocodeResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !address.contains("paris") {
                return Ok(GeocodeResult::unmatched(address));
            }
            Ok(GeocodeResult {
                address,
                matched: true,
                latitude: Some(48.8566),
                longitude: Some(2.3522),
                confidence: 0.8,
                city: Some("Paris".to_owned()),
                postal_code: Some("75015".to_owned()),
                label: Some("Paris".to_owned()),
            })
        }
    }

    /// Cancels the run from inside its `cancel_on`-th lookup, like a shutdown arriving mid-flight.
    struct CancelsMidway {
        cancel: CancellationToken,
        cancel_on: u64,
        calls: AtomicU64,
    }

    #[async_trait]
    impl Fetcher for CancelsMidway {
        type Query = String;
        type Output = GeocodeResult;

        async fn fetch(&self, address: String) -> Result<GeocodeResult, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.cancel_on {
                self.cancel.cancel();
            }
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            Ok(GeocodeResult::unmatched(address))
        }
    }

    fn record(code: &str, stores: Option<&str>) -> CatalogRecord {
        CatalogRecord::from_json(&json!({"code": code, "stores": stores})).unwrap()
    }

    #[tokio::test]
    async fn test_enrich_merges_by_address_and_keeps_order() {
        let geocoder = Arc::new(ParisOnly::default());
        let cache = GeocodingCache::new(geocoder.clone());
        let enricher = Enricher::new(&cache);

        let records = vec![
            record("001", Some("Carrefour Paris, Auchan")),
            record("002", Some("Leclerc Toulouse")),
            record("003", None),
            record("004", Some("carrefour  PARIS")),
        ];

        let (enriched, stats) = enricher.enrich(records).await.unwrap();

        let codes: Vec<_> = enriched.iter().map(|r| r.record.code.as_str()).collect();
        assert_eq!(codes, vec!["001", "002", "003", "004"]);

        assert!(enriched[0].is_geocoded);
        assert_eq!(enriched[0].city.as_deref(), Some("Paris"));
        assert_eq!(enriched[0].geocoding_confidence, Some(0.8));
        assert!(!enriched[1].is_geocoded);
        assert_eq!(enriched[1].latitude, None);
        assert!(!enriched[2].is_geocoded);
        assert!(enriched[3].is_geocoded);

        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.records, 4);
        assert_eq!(stats.records_with_address, 3);
        assert_eq!(stats.distinct_addresses, 2);
        assert_eq!(stats.matched_addresses, 1);
        assert_eq!(stats.match_rate, 0.5);
        assert_eq!(stats.mean_confidence, 0.8);
    }

    #[tokio::test]
    async fn test_enrich_without_addresses() {
        let cache = GeocodingCache::new(Arc::new(ParisOnly::default()));
        let enricher = Enricher::new(&cache);

        let (enriched, stats) = enricher
            .enrich(vec![record("001", None), record("002", Some(""))])
            .await
            .unwrap();

        assert_eq!(enriched.len(), 2);
        assert!(enriched.iter().all(|r| !r.is_geocoded));
        assert_eq!(stats.distinct_addresses, 0);
        assert_eq!(stats.match_rate, 0.0);
        assert_eq!(stats.mean_confidence, 0.0);
    }

    #[tokio::test]
    async fn test_max_addresses_leaves_rest_unenriched() {
        let geocoder = Arc::new(ParisOnly::default());
        let cache = GeocodingCache::new(geocoder.clone());
        let enricher = Enricher::new(&cache).with_max_addresses(Some(1));

        let (enriched, stats) = enricher
            .enrich(vec![
                record("001", Some("Monoprix Lyon")),
                record("002", Some("Carrefour Paris")),
            ])
            .await
            .unwrap();

        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(enriched.len(), 2);
        assert!(!enriched[1].is_geocoded);
        assert_eq!(stats.addresses_skipped, 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_enrichment_fails_it() {
        let cancel = CancellationToken::new();
        let geocoder = Arc::new(CancelsMidway {
            cancel: cancel.clone(),
            cancel_on: 2,
            calls: AtomicU64::new(0),
        });
        let cache = GeocodingCache::new(geocoder.clone());
        let enricher = Enricher::new(&cache);

        let result = enricher
            .enrich(vec![
                record("001", Some("Monoprix Lyon")),
                record("002", Some("Carrefour Paris")),
                record("003", Some("Leclerc Toulouse")),
            ])
            .await;

        assert!(matches!(result, Err(EnrichError::Cancelled)));
        assert!(cancel.is_cancelled());
        assert!(geocoder.calls.load(Ordering::SeqCst) >= 2);

        // The cancelled lookup left nothing behind: asking again goes back to the geocoder.
        let calls = geocoder.calls.load(Ordering::SeqCst);
        assert!(matches!(
            cache.resolve("Carrefour Paris").await,
            Err(EnrichError::Cancelled)
        ));
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), calls + 1);
    }
}
