pub const REQUESTS_TOTAL: &str = "catalog_api_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "catalog_api_request_duration_seconds";
pub const FAILURES_TOTAL: &str = "catalog_api_failures_total";
pub const RETRIES_TOTAL: &str = "catalog_api_retries_total";
pub const RATE_LIMIT_WAIT_SECONDS: &str = "catalog_rate_limit_wait_seconds";

pub const RECORDS_SKIPPED: &str = "catalog_records_skipped_total";
pub const DUPLICATES_DROPPED: &str = "catalog_duplicates_dropped_total";
pub const PAGES_FETCHED: &str = "catalog_pages_fetched_total";

pub const GEOCODE_CACHE_HITS: &str = "geocode_cache_hits_total";
pub const GEOCODE_CACHE_MISSES: &str = "geocode_cache_misses_total";
pub const GEOCODE_RESOLUTION_FAILURES: &str = "geocode_resolution_failures_total";
