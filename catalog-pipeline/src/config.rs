use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use catalog_common::error::ConfigError;
use catalog_common::fetcher::ApiConfig;
use catalog_common::quality::{GradeThresholds, GradingConfig, QualityWeights};
use catalog_common::rate_limit::RateLimiter;
use catalog_common::record::RecordField;
use catalog_common::retry::RetryPolicy;
use envconfig::Envconfig;
use url::Url;

pub const CATALOG_API: &str = "catalog";
pub const GEOCODER_API: &str = "geocoder";

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "https://world.openfoodfacts.org/api/v2")]
    pub catalog_base_url: Url,

    #[envconfig(default = "1500")]
    pub catalog_min_interval_ms: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub catalog_timeout_ms: EnvMsDuration,

    #[envconfig(default = "50")]
    pub catalog_page_size: u32,

    #[envconfig(default = "100")]
    pub catalog_max_pages: u32,

    #[envconfig(default = "https://api-adresse.data.gouv.fr")]
    pub geocoder_base_url: Url,

    #[envconfig(default = "100")]
    pub geocoder_min_interval_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub geocoder_timeout_ms: EnvMsDuration,

    #[envconfig(default = "catalog-pipeline/0.1")]
    pub user_agent: NonEmptyString,

    #[envconfig(default = "chocolats")]
    pub category: NonEmptyString,

    #[envconfig(default = "500")]
    pub max_items: usize,

    #[envconfig(default = "false")]
    pub skip_enrichment: bool,

    /// Resolve only the first N distinct store addresses. Unset resolves them all.
    pub max_addresses: Option<usize>,

    /// Keep the records fetched before a page-level failure instead of failing the run.
    #[envconfig(default = "false")]
    pub allow_partial_acquisition: bool,

    #[envconfig(default = "600000")]
    pub run_timeout_ms: EnvMsDuration,

    #[envconfig(default = "data")]
    pub output_dir: PathBuf,

    #[envconfig(default = "text")]
    pub log_format: LogFormat,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(nested = true)]
    pub quality: QualityConfig,
}

impl Config {
    pub fn catalog_api(&self) -> ApiConfig {
        ApiConfig {
            name: CATALOG_API.to_owned(),
            base_url: self.catalog_base_url.clone(),
            timeout: self.catalog_timeout_ms.0,
            user_agent: self.user_agent.0.clone(),
        }
    }

    pub fn geocoder_api(&self) -> ApiConfig {
        ApiConfig {
            name: GEOCODER_API.to_owned(),
            base_url: self.geocoder_base_url.clone(),
            timeout: self.geocoder_timeout_ms.0,
            user_agent: self.user_agent.0.clone(),
        }
    }

    /// A fresh limiter with one gate per upstream API.
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new()
            .with_interval(CATALOG_API, self.catalog_min_interval_ms.0)
            .with_interval(GEOCODER_API, self.geocoder_min_interval_ms.0)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_policy.retry_max_attempts,
            self.retry_policy.retry_base_delay_ms.0,
            self.retry_policy.retry_max_delay_ms.0,
        )
    }

    pub fn grading(&self) -> Result<GradingConfig, ConfigError> {
        GradingConfig::new(
            QualityWeights {
                completeness: self.quality.quality_weight_completeness,
                uniqueness: self.quality.quality_weight_uniqueness,
                geocoding: self.quality.quality_weight_geocoding,
            },
            self.quality.quality_thresholds.0,
            self.quality.quality_min_confidence,
        )
    }

    pub fn required_fields(&self) -> &[RecordField] {
        &self.quality.quality_required_fields.0
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "3")]
    pub retry_max_attempts: u32,

    #[envconfig(default = "1000")]
    pub retry_base_delay_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub retry_max_delay_ms: EnvMsDuration,
}

#[derive(Envconfig, Clone, Debug)]
pub struct QualityConfig {
    #[envconfig(default = "0.3")]
    pub quality_weight_completeness: f64,

    #[envconfig(default = "0.3")]
    pub quality_weight_uniqueness: f64,

    #[envconfig(default = "0.4")]
    pub quality_weight_geocoding: f64,

    /// Minimum scores for A, B, C and D.
    #[envconfig(default = "0.9,0.75,0.6,0.4")]
    pub quality_thresholds: ThresholdList,

    #[envconfig(default = "product_name,brands,categories,nutriscore_grade")]
    pub quality_required_fields: FieldList,

    pub quality_min_confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Four comma-separated grade thresholds, A first.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdList(pub GradeThresholds);

impl FromStr for ThresholdList {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConfigError::InvalidThresholds)?;

        match values.as_slice() {
            [a, b, c, d] => Ok(ThresholdList(GradeThresholds {
                a: *a,
                b: *b,
                c: *c,
                d: *d,
            })),
            _ => Err(ConfigError::InvalidThresholds),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldList(pub Vec<RecordField>);

impl FromStr for FieldList {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(RecordField::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(FieldList)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownLogFormatError;

impl FromStr for LogFormat {
    type Err = UnknownLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(UnknownLogFormatError),
        }
    }
}
