use std::io::BufRead;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::aggregate::{aggregate, DroppedLabel};
use crate::config::PipelineConfig;
use crate::detect::{DetectorBank, Skipped};
use crate::error::{PipelineError, Result};
use crate::models::{IngestionSummary, Period};
use crate::report::{assemble, AnomalyReport};
use crate::stream::RecordStream;

/// Everything one run produces for the presentation layer.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub summary: IngestionSummary,
    pub report: AnomalyReport,
    pub dropped: Vec<DroppedLabel>,
    pub skipped: Vec<Skipped>,
    pub range: Option<(Period, Period)>,
    pub metadata: Option<serde_json::Value>,
}

fn checkpoint(cancel: &CancellationToken, stage: &'static str) -> Result<()> {
    if cancel.is_cancelled() {
        tracing::warn!(stage, "run cancelled");
        return Err(PipelineError::CancellationRequested { stage });
    }
    Ok(())
}

pub fn run_file(
    path: &Path,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<PipelineOutput> {
    config.validate()?;
    let stream = RecordStream::open(path, config.stream.clone())?;
    run_stream(stream, config, cancel)
}

pub fn run<R: BufRead>(
    reader: R,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<PipelineOutput> {
    config.validate()?;
    run_stream(RecordStream::new(reader, config.stream.clone()), config, cancel)
}

fn run_stream<R: BufRead>(
    mut stream: RecordStream<R>,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<PipelineOutput> {
    checkpoint(cancel, "startup")?;

    let aggregation = aggregate(stream.by_ref(), &config.aggregate, cancel)?;
    checkpoint(cancel, "aggregation")?;

    let bank = DetectorBank::from_config(&config.detect, config.aggregate.granularity);
    let detections = bank.run(&aggregation.series, cancel)?;

    let report = assemble(&detections);
    checkpoint(cancel, "report")?;

    let stats = stream.stats();
    let summary = IngestionSummary {
        parsed: stats.parsed,
        skipped_malformed: stats.skipped_malformed,
        skipped_duplicate: stats.skipped_duplicate,
        skipped_no_reactions: stats.skipped_no_reactions,
        skipped_undated: aggregation.skipped_undated,
        skipped_out_of_range: aggregation.skipped_out_of_range,
        skipped_below_severity: aggregation.skipped_below_severity,
        labels_included: aggregation.series.len() as u64,
        labels_dropped_below_threshold: aggregation.dropped.len() as u64,
        dedup_probabilistic: stats.dedup_probabilistic,
    };
    tracing::info!(
        anomalies = report.len(),
        labels = summary.labels_included,
        periods = aggregation.period_count(),
        not_applicable = detections.skipped.len(),
        "run complete"
    );

    Ok(PipelineOutput {
        summary,
        report,
        dropped: aggregation.dropped,
        skipped: detections.skipped,
        range: aggregation.range,
        metadata: stream.metadata().cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ALL_LABELS;
    use crate::report::to_json;
    use chrono::{Duration, NaiveDate};
    use std::io::Cursor;

    /// 70 days of steady reports for two labels, a burst of `nausea` on day
    /// 64, and a handful of rare and undated reports.
    fn corpus() -> String {
        let start = NaiveDate::from_ymd_opt(2023, 5, 1).unwrap();
        let mut reports = Vec::new();
        let mut id = 0;
        for day in 0..70 {
            let date = (start + Duration::days(day)).format("%Y%m%d").to_string();
            let nausea = if day == 64 { 40 } else { 3 + day % 2 };
            for _ in 0..nausea {
                id += 1;
                reports.push(serde_json::json!({
                    "report_number": id.to_string(),
                    "date_started": date,
                    "reactions": ["Nausea"],
                    "outcomes": ["Visited Emergency Room"],
                }));
            }
            for _ in 0..(2 + day % 3) {
                id += 1;
                reports.push(serde_json::json!({
                    "report_number": id.to_string(),
                    "date_started": date,
                    "reactions": ["Headache", "nausea "],
                }));
            }
        }
        reports.push(serde_json::json!({
            "report_number": "rare-1",
            "date_started": "20230510",
            "reactions": ["Hiccups"],
        }));
        reports.push(serde_json::json!({
            "report_number": "undated-1",
            "date_started": "not a date",
            "reactions": ["Nausea"],
        }));
        reports.push(serde_json::json!({ "reactions": ["Nausea"] }));
        serde_json::json!({ "meta": { "last_updated": "2023-07-15" }, "results": reports }).to_string()
    }

    fn run_corpus(config: &PipelineConfig) -> PipelineOutput {
        run(Cursor::new(corpus()), config, &CancellationToken::new()).unwrap()
    }

    #[test]
    fn flags_injected_burst() {
        let output = run_corpus(&PipelineConfig::default());
        let burst = NaiveDate::from_ymd_opt(2023, 7, 4).unwrap();

        let top = &output.report.entries[0];
        assert_eq!(top.label, "nausea");
        assert_eq!(top.period_start, burst);
        assert!(top
            .contributing_detectors
            .iter()
            .any(|c| c.name == crate::detect::ROLLING_ZSCORE));
        assert_eq!(
            output.metadata.as_ref().unwrap()["last_updated"],
            "2023-07-15"
        );
    }

    #[test]
    fn summary_accounts_for_every_report() {
        let output = run_corpus(&PipelineConfig::default());
        let summary = &output.summary;

        assert_eq!(summary.skipped_malformed, 1);
        assert_eq!(summary.skipped_undated, 1);
        assert_eq!(summary.labels_included, 2);
        assert_eq!(summary.labels_dropped_below_threshold, 1);
        assert_eq!(output.dropped[0].label, "hiccups");
    }

    #[test]
    fn labels_below_threshold_never_reach_the_report() {
        let output = run_corpus(&PipelineConfig::default());
        assert!(output.report.entries.iter().all(|e| e.label != "hiccups"));
        assert!(output
            .report
            .entries
            .iter()
            .all(|e| e.label == "nausea" || e.label == "headache" || e.label == ALL_LABELS));
    }

    #[test]
    fn corpus_metadata_reaches_rendered_outputs() {
        let output = run_corpus(&PipelineConfig::default());
        let json: serde_json::Value = serde_json::from_str(&to_json(&output).unwrap()).unwrap();
        assert_eq!(json["source"]["last_updated"], "2023-07-15");
        assert!(crate::report::build_markdown(&output, 5)
            .contains("Source data last updated 2023-07-15"));
    }

    #[test]
    fn identical_input_gives_identical_report() {
        let config = PipelineConfig::default();
        let first = to_json(&run_corpus(&config)).unwrap();
        let second = to_json(&run_corpus(&config)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_corpus_completes_with_zero_summary() {
        let output = run(
            Cursor::new("[]".to_string()),
            &PipelineConfig::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(output.report.is_empty());
        assert_eq!(output.summary, IngestionSummary::default());
    }

    #[test]
    fn invalid_configuration_fails_before_reading() {
        let mut config = PipelineConfig::default();
        config.detect.isolation_trees = 0;
        let result = run(Cursor::new("not json".to_string()), &config, &CancellationToken::new());
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn cancelled_run_produces_no_report() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run(Cursor::new(corpus()), &PipelineConfig::default(), &cancel);
        assert!(matches!(
            result,
            Err(PipelineError::CancellationRequested { .. })
        ));
    }
}
