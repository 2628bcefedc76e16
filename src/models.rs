use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monday 1970-01-05; weekly periods start on Mondays.
const PERIOD_ANCHOR: (i32, u32, u32) = (1970, 1, 5);

/// Label used for report entries raised jointly across every series.
pub const ALL_LABELS: &str = "*";

fn anchor() -> NaiveDate {
    let (y, m, d) = PERIOD_ANCHOR;
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}

/// Outcome severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Unknown,
    NonSerious,
    MedicalCare,
    Serious,
    LifeThreatening,
    Death,
}

impl Severity {
    /// Maps one openFDA outcome string onto the severity scale.
    pub fn from_outcome(outcome: &str) -> Severity {
        let outcome = outcome.to_ascii_lowercase();
        if outcome.contains("death") {
            Severity::Death
        } else if outcome.contains("life threatening") {
            Severity::LifeThreatening
        } else if outcome.contains("non-serious") || outcome.trim() == "none" {
            Severity::NonSerious
        } else if ["hospitalization", "disability", "congenital", "serious"]
            .iter()
            .any(|needle| outcome.contains(needle))
        {
            Severity::Serious
        } else if ["emergency room", "health care provider", "required intervention"]
            .iter()
            .any(|needle| outcome.contains(needle))
        {
            Severity::MedicalCare
        } else {
            Severity::Unknown
        }
    }

    /// The most severe of a report's outcomes.
    pub fn worst_of<'a>(outcomes: impl IntoIterator<Item = &'a str>) -> Severity {
        outcomes
            .into_iter()
            .map(Severity::from_outcome)
            .max()
            .unwrap_or(Severity::Unknown)
    }
}

/// One normalized adverse-event report.
#[derive(Debug, Clone)]
pub struct Event {
    pub report_id: String,
    pub date: Option<NaiveDate>,
    pub reactions: BTreeSet<String>,
    pub severity: Severity,
    pub product: Option<String>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Granularity {
    #[default]
    Day,
    Week,
}

impl Granularity {
    pub fn width_days(self) -> i64 {
        match self {
            Granularity::Day => 1,
            Granularity::Week => 7,
        }
    }

    /// Period index of `date`: floor division of its day offset from the anchor.
    pub fn index_of(self, date: NaiveDate) -> i64 {
        (date - anchor()).num_days().div_euclid(self.width_days())
    }

    pub fn period(self, index: i64) -> Period {
        Period {
            index,
            granularity: self,
        }
    }
}

/// A half-open `[start, end)` calendar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    pub index: i64,
    pub granularity: Granularity,
}

impl Period {
    pub fn start(&self) -> NaiveDate {
        anchor() + Duration::days(self.index * self.granularity.width_days())
    }

    pub fn end(&self) -> NaiveDate {
        anchor() + Duration::days((self.index + 1) * self.granularity.width_days())
    }
}

/// Gap-filled count series for one reaction label.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub label: String,
    pub granularity: Granularity,
    pub first: i64,
    pub counts: Vec<f64>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn period(&self, position: usize) -> Period {
        self.granularity.period(self.first + position as i64)
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }
}

/// Per-period output of a single-series detector.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyScore {
    pub label: Arc<str>,
    pub period: Period,
    pub detector: &'static str,
    pub score: f64,
    pub threshold: f64,
    pub verdict: bool,
    pub count: f64,
    pub expected: f64,
    pub low_confidence: bool,
}

/// Per-period output of the joint (all labels) detector.
#[derive(Debug, Clone, PartialEq)]
pub struct JointScore {
    pub period: Period,
    pub detector: &'static str,
    pub score: f64,
    pub threshold: f64,
    pub verdict: bool,
    pub total_count: f64,
    pub expected_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub name: String,
    pub score: f64,
    pub threshold: f64,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub label: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub max_score: f64,
    pub contributing_detectors: Vec<Contribution>,
    pub count: f64,
    pub expected_count: f64,
    /// Set when any contributing score came from a period with a partial
    /// history or an extrapolated trend.
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionSummary {
    pub parsed: u64,
    pub skipped_malformed: u64,
    pub skipped_duplicate: u64,
    pub skipped_no_reactions: u64,
    pub skipped_undated: u64,
    pub skipped_out_of_range: u64,
    pub skipped_below_severity: u64,
    pub labels_included: u64,
    pub labels_dropped_below_threshold: u64,
    pub dedup_probabilistic: bool,
}

/// A published run as stored for the dashboard.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: Uuid,
    pub input: String,
    pub created_at: DateTime<Utc>,
    pub parsed: i64,
    pub labels_included: i64,
    pub anomaly_count: i64,
    pub top_label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekly_periods_start_on_monday() {
        let wednesday = date(2024, 3, 13);
        let period = Granularity::Week.period(Granularity::Week.index_of(wednesday));
        assert_eq!(period.start(), date(2024, 3, 11));
        assert_eq!(period.end(), date(2024, 3, 18));
    }

    #[test]
    fn dates_before_anchor_floor_downward() {
        let sunday = date(1970, 1, 4);
        assert_eq!(Granularity::Week.index_of(sunday), -1);
        assert_eq!(Granularity::Day.index_of(sunday), -1);
        assert_eq!(Granularity::Week.period(-1).start(), date(1969, 12, 29));
    }

    #[test]
    fn daily_period_round_trips_its_date() {
        let day = date(2019, 7, 1);
        let period = Granularity::Day.period(Granularity::Day.index_of(day));
        assert_eq!(period.start(), day);
        assert_eq!(period.end(), date(2019, 7, 2));
    }

    #[test]
    fn severity_maps_openfda_outcomes() {
        assert_eq!(Severity::from_outcome("Death"), Severity::Death);
        assert_eq!(
            Severity::from_outcome("Non-serious Injuries/ Illness"),
            Severity::NonSerious
        );
        assert_eq!(Severity::from_outcome("Hospitalization"), Severity::Serious);
        assert_eq!(
            Severity::from_outcome("Visited Emergency Room"),
            Severity::MedicalCare
        );
        assert_eq!(Severity::from_outcome("Other Outcome"), Severity::Unknown);
        assert_eq!(
            Severity::worst_of(["Visited a Health Care Provider", "Life Threatening"]),
            Severity::LifeThreatening
        );
        assert_eq!(Severity::worst_of([]), Severity::Unknown);
    }
}
