//! Dataset quality metrics and letter grading.
//!
//! The grade is a pure function of three ratios and a `GradingConfig`:
//!
//! ```text
//! score = (w_completeness * completeness
//!        + w_uniqueness   * (1 - duplicate_ratio)
//!        + w_geocoding    * geocoding_ratio)
//!       / (w_completeness + w_uniqueness + w_geocoding)
//! ```
//!
//! Weights are relative: they are normalized by their sum, so the score always lies in [0, 1]
//! whatever scale they are given in. The score maps to A/B/C/D when it reaches the
//! corresponding threshold, F otherwise. Weights and thresholds are configuration, with
//! defaults of 0.3/0.3/0.4 and 0.9/0.75/0.6/0.4.
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::error::ConfigError;
use crate::record::{EnrichedRecord, RecordField};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    /// Grades that do not need corrective action before the dataset is used.
    pub fn is_acceptable(&self) -> bool {
        matches!(self, Grade::A | Grade::B | Grade::C)
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(letter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityWeights {
    pub completeness: f64,
    pub uniqueness: f64,
    pub geocoding: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            completeness: 0.3,
            uniqueness: 0.3,
            geocoding: 0.4,
        }
    }
}

/// Minimum weighted score for each grade above F.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GradeThresholds {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for GradeThresholds {
    fn default() -> Self {
        Self {
            a: 0.9,
            b: 0.75,
            c: 0.6,
            d: 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GradingConfig {
    pub weights: QualityWeights,
    pub thresholds: GradeThresholds,
    /// When set, a geocoded record only counts toward the geocoding ratio and the mean
    /// confidence if its confidence reaches this value.
    pub min_confidence: Option<f64>,
}

impl GradingConfig {
    pub fn new(
        weights: QualityWeights,
        thresholds: GradeThresholds,
        min_confidence: Option<f64>,
    ) -> Result<Self, ConfigError> {
        let w = [weights.completeness, weights.uniqueness, weights.geocoding];
        if w.iter().any(|w| !w.is_finite() || *w < 0.0) || w.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::InvalidWeights);
        }

        let t = [thresholds.a, thresholds.b, thresholds.c, thresholds.d];
        let in_range = t.iter().all(|t| (0.0..=1.0).contains(t));
        let descending = t.windows(2).all(|pair| pair[0] > pair[1]);
        if !in_range || !descending {
            return Err(ConfigError::InvalidThresholds);
        }

        if let Some(min) = min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(ConfigError::InvalidMinConfidence(min));
            }
        }

        Ok(Self {
            weights,
            thresholds,
            min_confidence,
        })
    }

    /// The normalized weighted score and its grade.
    pub fn grade(&self, completeness: f64, duplicate_ratio: f64, geocoding_ratio: f64) -> (f64, Grade) {
        let w = &self.weights;
        let total = w.completeness + w.uniqueness + w.geocoding;
        let score = (w.completeness * completeness
            + w.uniqueness * (1.0 - duplicate_ratio)
            + w.geocoding * geocoding_ratio)
            / total;

        let t = &self.thresholds;
        let grade = if score >= t.a {
            Grade::A
        } else if score >= t.b {
            Grade::B
        } else if score >= t.c {
            Grade::C
        } else if score >= t.d {
            Grade::D
        } else {
            Grade::F
        };

        (score, grade)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NullCount {
    pub count: usize,
    pub pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityMetrics {
    pub record_count: usize,
    /// Records minus duplicates.
    pub valid_records: usize,
    pub completeness: f64,
    pub duplicate_count: usize,
    pub duplicate_ratio: f64,
    pub geocoding_ratio: f64,
    pub mean_confidence: f64,
    pub score: f64,
    pub grade: Grade,
    /// Missing values per required field.
    pub null_counts: BTreeMap<RecordField, NullCount>,
}

impl QualityMetrics {
    pub fn is_acceptable(&self) -> bool {
        self.grade.is_acceptable()
    }
}

pub struct QualityScorer {
    config: GradingConfig,
}

impl QualityScorer {
    pub fn new(config: GradingConfig) -> Self {
        Self { config }
    }

    /// Compute the metrics of a finalized dataset. An empty dataset has every ratio at 0 and
    /// grade F.
    pub fn score(&self, records: &[EnrichedRecord], required_fields: &[RecordField]) -> QualityMetrics {
        if records.is_empty() {
            return QualityMetrics {
                record_count: 0,
                valid_records: 0,
                completeness: 0.0,
                duplicate_count: 0,
                duplicate_ratio: 0.0,
                geocoding_ratio: 0.0,
                mean_confidence: 0.0,
                score: 0.0,
                grade: Grade::F,
                null_counts: required_fields
                    .iter()
                    .map(|field| (*field, NullCount { count: 0, pct: 0.0 }))
                    .collect(),
            };
        }

        let total = records.len();

        let null_counts: BTreeMap<RecordField, NullCount> = required_fields
            .iter()
            .map(|field| {
                let count = records.iter().filter(|r| !r.has_field(*field)).count();
                let pct = count as f64 / total as f64 * 100.0;
                (*field, NullCount { count, pct })
            })
            .collect();

        let completeness = if required_fields.is_empty() {
            0.0
        } else {
            let cells = total * required_fields.len();
            let missing: usize = null_counts.values().map(|n| n.count).sum();
            (cells - missing) as f64 / cells as f64
        };

        let distinct = records
            .iter()
            .map(|r| r.record.code.as_str())
            .collect::<HashSet<_>>()
            .len();
        let duplicate_count = total - distinct;
        let duplicate_ratio = duplicate_count as f64 / total as f64;

        let min_confidence = self.config.min_confidence.unwrap_or(0.0);
        let confidences: Vec<f64> = records
            .iter()
            .filter(|r| r.is_geocoded)
            .map(|r| r.geocoding_confidence.unwrap_or(0.0))
            .filter(|confidence| *confidence >= min_confidence)
            .collect();
        let geocoding_ratio = confidences.len() as f64 / total as f64;
        let mean_confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };

        let (score, grade) = self
            .config
            .grade(completeness, duplicate_ratio, geocoding_ratio);

        QualityMetrics {
            record_count: total,
            valid_records: distinct,
            completeness,
            duplicate_count,
            duplicate_ratio,
            geocoding_ratio,
            mean_confidence,
            score,
            grade,
            null_counts,
        }
    }
}
