use std::time;

use http::StatusCode;
use thiserror::Error;

/// Enumeration of failures produced by a remote call against one of the upstream APIs.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("{api} request failed but could be retried: {reason}")]
    Transient {
        api: String,
        status: Option<StatusCode>,
        reason: String,
        retry_after: Option<time::Duration>,
    },
    #[error("{api} request failed and cannot be retried: {reason}")]
    Permanent {
        api: String,
        status: Option<StatusCode>,
        reason: String,
    },
    #[error("{api} returned a malformed response: {reason}")]
    Malformed { api: String, reason: String },
    #[error("request gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
    #[error("request was cancelled before completion")]
    Cancelled,
}

impl FetchError {
    /// Whether retrying the same request later could resolve this failure.
    /// This is the classifier `RetryPolicy` uses unless another one is configured.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    /// The delay requested by the server through a Retry-After header, if any.
    pub fn retry_after(&self) -> Option<time::Duration> {
        match self {
            FetchError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The HTTP status of the underlying failure, looking through `RetryExhausted`.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Transient { status, .. } | FetchError::Permanent { status, .. } => *status,
            FetchError::RetryExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// A single catalog entry that could not be turned into a `CatalogRecord`.
/// These are skipped and counted, never propagated past the page they came from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed record: {0}")]
pub struct MalformedRecord(pub String);

/// Enumeration of failures that abort an enrichment run.
///
/// Geocoding failures are absent on purpose: an address that cannot be resolved is
/// cached as unmatched and counted in `CacheStats::resolution_failures`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrichError {
    #[error("enrichment was cancelled")]
    Cancelled,
}

/// Invalid grading configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("quality weights must be non-negative and sum to a positive value")]
    InvalidWeights,
    #[error("grade thresholds must be within [0, 1] and strictly descending from A to D")]
    InvalidThresholds,
    #[error("minimum confidence must be within [0, 1], got {0}")]
    InvalidMinConfidence(f64),
    #[error("{0} is not a known record field")]
    UnknownField(String),
}
