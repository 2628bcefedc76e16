use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;

use serde::Serialize;

use crate::detect::Detections;
use crate::models::{Contribution, Period, ReportEntry, ALL_LABELS};
use crate::pipeline::PipelineOutput;

/// Flagged (label, period) pairs, most anomalous first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnomalyReport {
    pub entries: Vec<ReportEntry>,
}

impl AnomalyReport {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Pending {
    period: Period,
    count: f64,
    expected: f64,
    max_score: f64,
    contributions: Vec<Contribution>,
}

impl Pending {
    fn add(&mut self, name: &str, score: f64, threshold: f64, expected: f64, low_confidence: bool) {
        if self.contributions.is_empty() || score > self.max_score {
            self.max_score = score;
            self.expected = expected;
        }
        self.contributions.push(Contribution {
            name: name.to_string(),
            score,
            threshold,
            low_confidence,
        });
    }
}

/// Merges every true verdict into one entry per (label, period). Entries
/// flagged by several detectors keep every contribution; the entry's score
/// is the largest of them.
pub fn assemble(detections: &Detections) -> AnomalyReport {
    let mut merged: BTreeMap<(String, i64), Pending> = BTreeMap::new();

    for score in detections.scores.iter().filter(|score| score.verdict) {
        merged
            .entry((score.label.to_string(), score.period.index))
            .or_insert_with(|| Pending {
                period: score.period,
                count: score.count,
                expected: score.expected,
                max_score: score.score,
                contributions: Vec::new(),
            })
            .add(
                score.detector,
                score.score,
                score.threshold,
                score.expected,
                score.low_confidence,
            );
    }

    for score in detections.joint.iter().filter(|score| score.verdict) {
        merged
            .entry((ALL_LABELS.to_string(), score.period.index))
            .or_insert_with(|| Pending {
                period: score.period,
                count: score.total_count,
                expected: score.expected_total,
                max_score: score.score,
                contributions: Vec::new(),
            })
            .add(
                score.detector,
                score.score,
                score.threshold,
                score.expected_total,
                false,
            );
    }

    let mut entries: Vec<ReportEntry> = merged
        .into_iter()
        .map(|((label, _), pending)| ReportEntry {
            low_confidence: pending.contributions.iter().any(|c| c.low_confidence),
            label,
            period_start: pending.period.start(),
            period_end: pending.period.end(),
            max_score: pending.max_score,
            contributing_detectors: pending.contributions,
            count: pending.count,
            expected_count: pending.expected,
        })
        .collect();

    entries.sort_by(|a, b| {
        b.max_score
            .total_cmp(&a.max_score)
            .then_with(|| a.period_start.cmp(&b.period_start))
            .then_with(|| a.label.cmp(&b.label))
    });

    AnomalyReport { entries }
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a serde_json::Value>,
    summary: &'a crate::models::IngestionSummary,
    anomalies: &'a [ReportEntry],
}

pub fn to_json(output: &PipelineOutput) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonDocument {
        source: output.metadata.as_ref(),
        summary: &output.summary,
        anomalies: &output.report.entries,
    })
}

/// The corpus `meta.last_updated` stamp, when the input carried one.
pub fn source_last_updated(output: &PipelineOutput) -> Option<&str> {
    output
        .metadata
        .as_ref()
        .and_then(|meta| meta.get("last_updated"))
        .and_then(|value| value.as_str())
}

#[derive(Serialize)]
struct CsvRow<'a> {
    label: &'a str,
    period_start: String,
    period_end: String,
    max_score: f64,
    detectors: String,
    count: f64,
    expected_count: f64,
    low_confidence: bool,
}

pub fn write_csv<W: Write>(report: &AnomalyReport, writer: W) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for entry in &report.entries {
        let detectors = entry
            .contributing_detectors
            .iter()
            .map(|c| format!("{}={:.4}>{}", c.name, c.score, c.threshold))
            .collect::<Vec<_>>()
            .join(";");
        writer.serialize(CsvRow {
            label: &entry.label,
            period_start: entry.period_start.to_string(),
            period_end: entry.period_end.to_string(),
            max_score: entry.max_score,
            detectors,
            count: entry.count,
            expected_count: entry.expected_count,
            low_confidence: entry.low_confidence,
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn build_markdown(output: &PipelineOutput, limit: usize) -> String {
    let mut out = String::new();
    let summary = &output.summary;

    let _ = writeln!(out, "# Adverse Event Anomaly Report");
    if let Some(updated) = source_last_updated(output) {
        let _ = writeln!(out, "Source data last updated {updated}");
    }
    match output.range {
        Some((first, last)) => {
            let _ = writeln!(
                out,
                "Periods {} to {} ({} reports parsed)",
                first.start(),
                last.end(),
                summary.parsed
            );
        }
        None => {
            let _ = writeln!(out, "No dated reports ({} parsed)", summary.parsed);
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "## Ingestion");
    let _ = writeln!(out, "- malformed: {}", summary.skipped_malformed);
    let _ = writeln!(out, "- duplicates: {}", summary.skipped_duplicate);
    let _ = writeln!(out, "- without reactions: {}", summary.skipped_no_reactions);
    let _ = writeln!(out, "- undated: {}", summary.skipped_undated);
    let _ = writeln!(out, "- outside date range: {}", summary.skipped_out_of_range);
    let _ = writeln!(out, "- below severity floor: {}", summary.skipped_below_severity);
    let _ = writeln!(
        out,
        "- labels analyzed: {} (dropped below threshold: {})",
        summary.labels_included, summary.labels_dropped_below_threshold
    );
    if summary.dedup_probabilistic {
        let _ = writeln!(out, "- duplicate detection was probabilistic for this run");
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Top Anomalies");
    if output.report.is_empty() {
        let _ = writeln!(out, "No anomalous periods detected.");
    } else {
        for entry in output.report.entries.iter().take(limit) {
            let detectors = entry
                .contributing_detectors
                .iter()
                .map(|c| format!("{} {:.2}", c.name, c.score))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(
                out,
                "- {} from {}: {} reports vs {:.1} expected (score {:.2}; {}){}",
                entry.label,
                entry.period_start,
                entry.count,
                entry.expected_count,
                entry.max_score,
                detectors,
                if entry.low_confidence { " [low confidence]" } else { "" }
            );
        }
    }

    if !output.dropped.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Labels Below Inclusion Threshold");
        for dropped in output.dropped.iter().take(limit) {
            let _ = writeln!(out, "- {}: {} reports", dropped.label, dropped.total);
        }
        if output.dropped.len() > limit {
            let _ = writeln!(out, "- ...and {} more", output.dropped.len() - limit);
        }
    }

    if !output.skipped.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Detectors Not Applied");
        for skipped in output.skipped.iter().take(limit) {
            let _ = writeln!(
                out,
                "- {} on {}: {}",
                skipped.detector,
                skipped.label.as_deref().unwrap_or("all labels"),
                skipped.reason
            );
        }
    }

    out
}
