use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::models::{Granularity, Severity};

/// Which report field supplies the event date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DateSource {
    #[default]
    Started,
    Created,
    StartedOrCreated,
}

/// How a report listing several reactions contributes to each label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LabelWeighting {
    /// Each label counts the report once.
    #[default]
    PerLabel,
    /// The report's weight of 1 is split evenly across its labels.
    Fractional,
}

/// Feature encoding for the joint isolation scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureMode {
    Count,
    /// Count divided by the label's mean count.
    #[default]
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub results_key: String,
    pub date_source: DateSource,
    pub dedup_capacity: usize,
    pub max_records: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            results_key: "results".to_string(),
            date_source: DateSource::Started,
            dedup_capacity: 4_000_000,
            max_records: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub granularity: Granularity,
    pub inclusion_threshold: u64,
    pub date_range: Option<DateRange>,
    pub label_weighting: LabelWeighting,
    pub min_severity: Option<Severity>,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Day,
            inclusion_threshold: 5,
            date_range: None,
            label_weighting: LabelWeighting::PerLabel,
            min_severity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    /// Defaults to 28 periods for daily data and 8 for weekly.
    pub rolling_window: Option<usize>,
    /// Defaults to 7 for daily data and 4 for weekly.
    pub seasonal_period: Option<usize>,
    pub zscore_threshold: f64,
    pub residual_threshold: f64,
    /// Lower bound on the rolling standard deviation, in counts.
    pub std_floor: f64,
    pub isolation_threshold: f64,
    pub isolation_trees: usize,
    pub isolation_subsample: usize,
    pub isolation_features: FeatureMode,
    pub seed: u64,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            rolling_window: None,
            seasonal_period: None,
            zscore_threshold: 3.0,
            residual_threshold: 3.0,
            std_floor: 1.0,
            isolation_threshold: 0.65,
            isolation_trees: 100,
            isolation_subsample: 256,
            isolation_features: FeatureMode::Rate,
            seed: 42,
        }
    }
}

impl DetectConfig {
    pub fn rolling_window_for(&self, granularity: Granularity) -> usize {
        self.rolling_window.unwrap_or(match granularity {
            Granularity::Day => 28,
            Granularity::Week => 8,
        })
    }

    pub fn seasonal_period_for(&self, granularity: Granularity) -> usize {
        self.seasonal_period.unwrap_or(match granularity {
            Granularity::Day => 7,
            Granularity::Week => 4,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stream: StreamConfig,
    pub aggregate: AggregateConfig,
    pub detect: DetectConfig,
}

impl PipelineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|err| {
            PipelineError::Configuration(format!("{}: {}", path.display(), err.message()))
        })
    }

    /// Rejects parameter combinations no stage could run with.
    pub fn validate(&self) -> Result<()> {
        let granularity = self.aggregate.granularity;
        let window = self.detect.rolling_window_for(granularity);
        let period = self.detect.seasonal_period_for(granularity);

        if self.stream.results_key.is_empty() {
            return invalid("results_key must not be empty");
        }
        if window == 0 {
            return invalid("rolling_window must be at least 1");
        }
        if period < 2 {
            return invalid("seasonal_period must be at least 2");
        }
        for (name, value) in [
            ("zscore_threshold", self.detect.zscore_threshold),
            ("residual_threshold", self.detect.residual_threshold),
            ("isolation_threshold", self.detect.isolation_threshold),
        ] {
            if !value.is_finite() {
                return invalid(&format!("{name} must be finite"));
            }
        }
        if !(self.detect.std_floor.is_finite() && self.detect.std_floor > 0.0) {
            return invalid("std_floor must be a positive number");
        }
        if self.detect.isolation_trees == 0 {
            return invalid("isolation_trees must be at least 1");
        }
        if self.detect.isolation_subsample < 2 {
            return invalid("isolation_subsample must be at least 2");
        }

        if let Some(range) = self.aggregate.date_range {
            if range.end < range.start {
                return invalid(&format!(
                    "date range ends ({}) before it starts ({})",
                    range.end, range.start
                ));
            }
            let periods =
                (granularity.index_of(range.end) - granularity.index_of(range.start) + 1) as usize;
            if period >= periods {
                return invalid(&format!(
                    "seasonal_period {period} must be shorter than the {periods} periods in the date range"
                ));
            }
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> Result<()> {
    Err(PipelineError::Configuration(reason.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detect.rolling_window_for(Granularity::Day), 28);
        assert_eq!(config.detect.seasonal_period_for(Granularity::Week), 4);
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [aggregate]
            granularity = "week"
            inclusion_threshold = 20
            label_weighting = "fractional"
            min_severity = "serious"

            [detect]
            zscore_threshold = 2.5
            seed = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.aggregate.granularity, Granularity::Week);
        assert_eq!(config.aggregate.inclusion_threshold, 20);
        assert_eq!(config.aggregate.label_weighting, LabelWeighting::Fractional);
        assert_eq!(config.aggregate.min_severity, Some(Severity::Serious));
        assert_eq!(config.detect.zscore_threshold, 2.5);
        assert_eq!(config.detect.seed, 7);
        assert_eq!(config.detect.isolation_trees, 100);
        assert_eq!(config.stream.results_key, "results");
    }

    #[test]
    fn seasonal_period_must_fit_explicit_range() {
        let mut config = PipelineConfig::default();
        config.aggregate.date_range = Some(DateRange {
            start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2020, 1, 5).unwrap(),
        });
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)), "{err}");
    }

    #[test]
    fn rejects_zero_window_and_inverted_range() {
        let mut config = PipelineConfig::default();
        config.detect.rolling_window = Some(0);
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.aggregate.date_range = Some(DateRange {
            start: NaiveDate::from_ymd_opt(2020, 2, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn reports_toml_errors_as_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[detect]\nzscore_threshold = \"high\"\n").unwrap();
        let err = PipelineConfig::from_toml_file(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
