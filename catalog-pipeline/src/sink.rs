//! Destinations for the raw acquisition and the finalized dataset.
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use catalog_common::quality::QualityMetrics;
use catalog_common::record::{CatalogRecord, EnrichedRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::orchestrator::RunStats;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize dataset: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The finalized output of a successful run.
#[derive(Debug, Serialize)]
pub struct Dataset<'a> {
    pub records: &'a [EnrichedRecord],
    pub metrics: &'a QualityMetrics,
    pub stats: &'a RunStats,
}

#[async_trait]
pub trait DatasetSink: Send + Sync {
    /// Persist records as acquired, before enrichment.
    async fn write_raw(
        &self,
        category: &str,
        started_at: DateTime<Utc>,
        records: &[CatalogRecord],
    ) -> Result<(), SinkError>;

    async fn write_dataset(
        &self,
        category: &str,
        started_at: DateTime<Utc>,
        dataset: &Dataset<'_>,
    ) -> Result<(), SinkError>;
}

/// Writes pretty-printed JSON files under `raw/` and `processed/` of a base directory.
pub struct JsonFileSink {
    base_dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn raw_path(&self, category: &str, started_at: DateTime<Utc>) -> PathBuf {
        self.base_dir
            .join("raw")
            .join(format!("{category}_raw_{}.json", timestamp(started_at)))
    }

    pub fn dataset_path(&self, category: &str, started_at: DateTime<Utc>) -> PathBuf {
        self.base_dir
            .join("processed")
            .join(format!("{category}_{}.json", timestamp(started_at)))
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_owned();
    name.push(".partial");
    path.with_file_name(name)
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SinkError> {
    let io_error = |source| SinkError::Io {
        path: path.to_owned(),
        source,
    };

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_error)?;
    }
    let body = serde_json::to_vec_pretty(value)?;

    // Readers only ever see a complete file, even if the run is dropped mid-write.
    let partial = partial_path(path);
    tokio::fs::write(&partial, body).await.map_err(io_error)?;
    tokio::fs::rename(&partial, path).await.map_err(io_error)?;

    info!(path = %path.display(), "wrote file");
    Ok(())
}

#[async_trait]
impl DatasetSink for JsonFileSink {
    async fn write_raw(
        &self,
        category: &str,
        started_at: DateTime<Utc>,
        records: &[CatalogRecord],
    ) -> Result<(), SinkError> {
        write_json(&self.raw_path(category, started_at), records).await
    }

    async fn write_dataset(
        &self,
        category: &str,
        started_at: DateTime<Utc>,
        dataset: &Dataset<'_>,
    ) -> Result<(), SinkError> {
        write_json(&self.dataset_path(category, started_at), dataset).await
    }
}

/// Keeps everything in memory as JSON values.
#[derive(Default)]
pub struct MemorySink {
    raw: Mutex<Vec<serde_json::Value>>,
    datasets: Mutex<Vec<serde_json::Value>>,
}

impl MemorySink {
    pub fn raw(&self) -> Vec<serde_json::Value> {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn datasets(&self) -> Vec<serde_json::Value> {
        self.datasets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DatasetSink for MemorySink {
    async fn write_raw(
        &self,
        _category: &str,
        _started_at: DateTime<Utc>,
        records: &[CatalogRecord],
    ) -> Result<(), SinkError> {
        let value = serde_json::to_value(records)?;
        self.raw
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
        Ok(())
    }

    async fn write_dataset(
        &self,
        _category: &str,
        _started_at: DateTime<Utc>,
        dataset: &Dataset<'_>,
    ) -> Result<(), SinkError> {
        let value = serde_json::to_value(dataset)?;
        self.datasets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
        Ok(())
    }
}
