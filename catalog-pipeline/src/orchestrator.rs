//! Sequences one run: acquire the catalog, enrich it, grade it, persist it.
use std::sync::Arc;
use std::time;

use catalog_common::cache::{CacheStats, GeocodingCache};
use catalog_common::enricher::{EnrichmentStats, Enricher};
use catalog_common::error::FetchError;
use catalog_common::fetcher::{ApiClient, CatalogFetcher, FetchStats, GeocodeFetcher, PartialFetch};
use catalog_common::quality::{Grade, GradingConfig, QualityMetrics, QualityScorer};
use catalog_common::record::{CatalogRecord, EnrichedRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::sink::{Dataset, DatasetSink};

/// Counters of one run, gathered from the components that own them.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub category: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub records: usize,
    pub catalog: FetchStats,
    /// The page-level failure the run continued past, when partial acquisition is allowed.
    pub acquisition_error: Option<String>,
    /// Absent when enrichment was skipped.
    pub geocoder: Option<FetchStats>,
    pub enrichment: Option<EnrichmentStats>,
    pub cache: Option<CacheStats>,
    pub grade: Grade,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub stats: RunStats,
    pub metrics: QualityMetrics,
}

pub struct Pipeline<S> {
    config: Config,
    grading: GradingConfig,
    sink: S,
}

impl<S: DatasetSink> Pipeline<S> {
    pub fn new(config: Config, sink: S) -> Result<Self, PipelineError> {
        let grading = config.grading()?;
        Ok(Self {
            config,
            grading,
            sink,
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run the pipeline once under the configured timeout.
    ///
    /// When the timeout elapses the token is cancelled, so in-flight retries stop, and the run
    /// fails with `TimedOut`. Cancelling `cancel` from outside fails the run with `Cancelled`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, PipelineError> {
        let timeout = self.config.run_timeout_ms.0;

        match tokio::time::timeout(timeout, self.execute(cancel.clone())).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                error!(timeout_ms = timeout.as_millis() as u64, "run timed out");
                Err(PipelineError::TimedOut(timeout))
            }
        }
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<RunReport, PipelineError> {
        let config = &self.config;
        let category = config.category.as_str();
        let started_at = Utc::now();
        let start = Instant::now();

        let limiter = Arc::new(config.rate_limiter());
        let retry_policy = config.retry_policy();

        info!(category, max_items = config.max_items, "starting catalog acquisition");
        let catalog = CatalogFetcher::new(
            ApiClient::new(
                config.catalog_api(),
                limiter.clone(),
                retry_policy,
                cancel.clone(),
            )?,
            config.catalog_page_size,
            config.catalog_max_pages,
        );
        let (records, catalog_stats, acquisition_error) = self.acquire(&catalog, category).await?;

        if records.is_empty() {
            return Err(PipelineError::EmptyAcquisition(category.to_owned()));
        }
        self.sink.write_raw(category, started_at, &records).await?;

        let (enriched, geocoder, enrichment, cache) = if config.skip_enrichment {
            info!("skipping enrichment");
            let enriched: Vec<EnrichedRecord> =
                records.into_iter().map(EnrichedRecord::unenriched).collect();
            (enriched, None, None, None)
        } else {
            let geocoder = Arc::new(GeocodeFetcher::new(ApiClient::new(
                config.geocoder_api(),
                limiter,
                retry_policy,
                cancel.clone(),
            )?));
            let cache = GeocodingCache::new(geocoder.clone());
            let (enriched, enrichment) = Enricher::new(&cache)
                .with_max_addresses(config.max_addresses)
                .enrich(records)
                .await?;

            (
                enriched,
                Some(geocoder.client().stats()),
                Some(enrichment),
                Some(cache.stats()),
            )
        };

        let metrics = QualityScorer::new(self.grading).score(&enriched, config.required_fields());
        info!(
            records = metrics.record_count,
            completeness = metrics.completeness,
            duplicate_ratio = metrics.duplicate_ratio,
            geocoding_ratio = metrics.geocoding_ratio,
            score = metrics.score,
            grade = %metrics.grade,
            "dataset graded"
        );
        if !metrics.is_acceptable() {
            warn!(grade = %metrics.grade, "dataset quality is below acceptable");
        }

        let stats = RunStats {
            category: category.to_owned(),
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            records: enriched.len(),
            catalog: catalog_stats,
            acquisition_error,
            geocoder,
            enrichment,
            cache,
            grade: metrics.grade,
        };

        // A cancelled run must not publish a dataset.
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.sink
            .write_dataset(
                category,
                started_at,
                &Dataset {
                    records: &enriched,
                    metrics: &metrics,
                    stats: &stats,
                },
            )
            .await?;

        Ok(RunReport { stats, metrics })
    }

    /// Fetch the catalog, deciding what a page-level failure means for the run.
    async fn acquire(
        &self,
        catalog: &CatalogFetcher,
        category: &str,
    ) -> Result<(Vec<CatalogRecord>, FetchStats, Option<String>), PipelineError> {
        match catalog.fetch_catalog(category, self.config.max_items).await {
            Ok((records, stats)) => Ok((records, stats, None)),
            Err(PartialFetch {
                source,
                records,
                stats,
            }) => {
                let keep = self.config.allow_partial_acquisition
                    && !records.is_empty()
                    && !matches!(source, FetchError::Cancelled);
                if !keep {
                    return Err(source.into());
                }

                warn!(
                    records = records.len(),
                    "continuing with a partial acquisition: {}", source
                );
                Ok((records, stats, Some(source.to_string())))
            }
        }
    }
}

impl RunReport {
    pub fn duration(&self) -> time::Duration {
        time::Duration::from_millis(self.stats.duration_ms)
    }
}
