pub mod cache;
pub mod enricher;
pub mod error;
pub mod fetcher;
pub mod metrics_consts;
pub mod quality;
pub mod rate_limit;
pub mod record;
pub mod retry;
