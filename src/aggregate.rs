use std::collections::{BTreeMap, HashMap};

use tokio_util::sync::CancellationToken;

use crate::config::{AggregateConfig, LabelWeighting};
use crate::error::{PipelineError, Result};
use crate::models::{Event, Granularity, Period, Series};

const CANCEL_CHECK_INTERVAL: u64 = 1 << 16;
/// Observed spans wider than this usually mean a mistyped report date.
const PLAUSIBLE_SPAN_DAYS: i64 = 20 * 366;

#[derive(Debug, Clone, PartialEq)]
pub struct DroppedLabel {
    pub label: String,
    pub total: f64,
}

/// Gap-filled series for every included label plus the bookkeeping needed
/// for the ingestion summary.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub series: BTreeMap<String, Series>,
    pub dropped: Vec<DroppedLabel>,
    pub range: Option<(Period, Period)>,
    pub skipped_undated: u64,
    pub skipped_out_of_range: u64,
    pub skipped_below_severity: u64,
}

impl Aggregation {
    pub fn period_count(&self) -> usize {
        self.range
            .map(|(first, last)| (last.index - first.index + 1) as usize)
            .unwrap_or(0)
    }
}

/// Buckets events by (label, period) in a single pass and materializes one
/// contiguous zero-filled series per label across the global range.
pub fn aggregate<I>(
    events: I,
    config: &AggregateConfig,
    cancel: &CancellationToken,
) -> Result<Aggregation>
where
    I: IntoIterator<Item = Result<Event>>,
{
    let granularity = config.granularity;
    let bounds = config.date_range.map(|range| {
        (
            granularity.index_of(range.start),
            granularity.index_of(range.end),
        )
    });

    let mut table: HashMap<String, HashMap<i64, f64>> = HashMap::new();
    let mut observed: Option<(i64, i64)> = None;
    let mut aggregation = Aggregation::default();
    let mut processed = 0u64;

    for event in events {
        let event = event?;
        processed += 1;
        if processed % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(PipelineError::CancellationRequested {
                stage: "aggregation",
            });
        }

        let Some(date) = event.date else {
            aggregation.skipped_undated += 1;
            continue;
        };
        if config.min_severity.is_some_and(|floor| event.severity < floor) {
            aggregation.skipped_below_severity += 1;
            continue;
        }
        let index = granularity.index_of(date);
        if let Some((first, last)) = bounds {
            if index < first || index > last {
                aggregation.skipped_out_of_range += 1;
                continue;
            }
        }

        observed = Some(match observed {
            Some((first, last)) => (first.min(index), last.max(index)),
            None => (index, index),
        });

        let weight = match config.label_weighting {
            LabelWeighting::PerLabel => 1.0,
            LabelWeighting::Fractional => 1.0 / event.reactions.len() as f64,
        };
        for label in event.reactions {
            *table.entry(label).or_default().entry(index).or_insert(0.0) += weight;
        }
    }

    let Some((first, last)) = bounds.or(observed) else {
        tracing::info!(
            undated = aggregation.skipped_undated,
            "no dated events to aggregate"
        );
        return Ok(aggregation);
    };
    aggregation.range = Some((granularity.period(first), granularity.period(last)));
    if bounds.is_none() && implausible_span(first, last, granularity) {
        tracing::warn!(
            first = %granularity.period(first).start(),
            last = %granularity.period(last).start(),
            "observed dates span an implausibly long range; set an explicit date range to bound the series"
        );
    }
    let length = (last - first + 1) as usize;

    let mut labels: Vec<(String, HashMap<i64, f64>)> = table.into_iter().collect();
    labels.sort_by(|a, b| a.0.cmp(&b.0));

    for (label, counts) in labels {
        let total: f64 = counts.values().sum();
        if total < config.inclusion_threshold as f64 {
            aggregation.dropped.push(DroppedLabel { label, total });
            continue;
        }

        let mut series = vec![0.0; length];
        for (index, count) in counts {
            series[(index - first) as usize] = count;
        }
        aggregation.series.insert(
            label.clone(),
            Series {
                label,
                granularity,
                first,
                counts: series,
            },
        );
    }

    if !aggregation.dropped.is_empty() {
        tracing::info!(
            dropped = aggregation.dropped.len(),
            threshold = config.inclusion_threshold,
            "labels below inclusion threshold were not analyzed"
        );
    }
    tracing::info!(
        labels = aggregation.series.len(),
        periods = length,
        undated = aggregation.skipped_undated,
        out_of_range = aggregation.skipped_out_of_range,
        below_severity = aggregation.skipped_below_severity,
        "aggregation complete"
    );

    Ok(aggregation)
}

fn implausible_span(first: i64, last: i64, granularity: Granularity) -> bool {
    (last - first + 1) * granularity.width_days() > PLAUSIBLE_SPAN_DAYS
}
