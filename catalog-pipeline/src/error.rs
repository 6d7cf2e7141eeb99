use std::time;

use catalog_common::error::{ConfigError, EnrichError, FetchError};
use thiserror::Error;

use crate::sink::SinkError;

/// Enumeration of the ways a pipeline run fails. A failed run never reports metrics.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("catalog acquisition failed: {0}")]
    Acquisition(#[source] FetchError),
    #[error("no records were acquired for category {0}")]
    EmptyAcquisition(String),
    #[error("run was cancelled")]
    Cancelled,
    #[error("run did not finish within {0:?}")]
    TimedOut(time::Duration),
    #[error("failed to write dataset: {0}")]
    Sink(#[from] SinkError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

impl From<FetchError> for PipelineError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Cancelled => PipelineError::Cancelled,
            error => PipelineError::Acquisition(error),
        }
    }
}

/// Enrichment absorbs geocoding failures, so cancellation is its only error.
impl From<EnrichError> for PipelineError {
    fn from(error: EnrichError) -> Self {
        match error {
            EnrichError::Cancelled => PipelineError::Cancelled,
        }
    }
}
