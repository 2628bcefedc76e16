use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::config::DetectConfig;
use crate::error::{NotApplicable, PipelineError, Result};
use crate::isolation::IsolationScorer;
use crate::models::{AnomalyScore, Granularity, JointScore, Series};

pub const ROLLING_ZSCORE: &str = "rolling-zscore";
pub const SEASONAL_RESIDUAL: &str = "seasonal-residual";

const DEGENERATE_STD: f64 = 1e-9;

/// Z-score of each period against the `window` periods before it.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingZScore {
    pub window: usize,
    pub threshold: f64,
    pub std_floor: f64,
}

impl RollingZScore {
    fn score(&self, series: &Series) -> std::result::Result<Vec<AnomalyScore>, NotApplicable> {
        if series.is_empty() {
            return Err(NotApplicable::InsufficientData {
                required: 1,
                actual: 0,
            });
        }

        let label: Arc<str> = Arc::from(series.label.as_str());
        let counts = &series.counts;
        let scores = (0..counts.len())
            .map(|i| {
                let history = &counts[i.saturating_sub(self.window)..i];
                let (score, expected) = if history.is_empty() {
                    (0.0, counts[i])
                } else {
                    let (mean, std) = mean_and_std(history);
                    ((counts[i] - mean) / std.max(self.std_floor), mean)
                };
                AnomalyScore {
                    label: Arc::clone(&label),
                    period: series.period(i),
                    detector: ROLLING_ZSCORE,
                    score,
                    threshold: self.threshold,
                    verdict: score > self.threshold,
                    count: counts[i],
                    expected,
                    low_confidence: history.len() < self.window,
                }
            })
            .collect();
        Ok(scores)
    }
}

/// Residual of a classical additive decomposition, in residual standard
/// deviations.
#[derive(Debug, Clone, PartialEq)]
pub struct SeasonalResidual {
    pub period: usize,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub trend: Vec<f64>,
    pub seasonal: Vec<f64>,
    pub residual: Vec<f64>,
}

impl SeasonalResidual {
    /// Requires at least two full cycles.
    pub fn decompose(&self, data: &[f64]) -> std::result::Result<Decomposition, NotApplicable> {
        let n = data.len();
        let period = self.period;
        if n < period * 2 {
            return Err(NotApplicable::InsufficientData {
                required: period * 2,
                actual: n,
            });
        }

        // Centered moving average; even periods use the 2xP weighting.
        let half = period / 2;
        let mut trend = vec![0.0; n];
        for i in half..(n - half) {
            trend[i] = if period % 2 == 1 {
                data[i - half..=i + half].iter().sum::<f64>() / period as f64
            } else {
                let inner: f64 = data[i - half + 1..i + half].iter().sum();
                (inner + 0.5 * (data[i - half] + data[i + half])) / period as f64
            };
        }
        let (head, tail) = (trend[half], trend[n - half - 1]);
        trend[..half].fill(head);
        trend[n - half..].fill(tail);

        let mut indices = vec![0.0; period];
        for (phase, index) in indices.iter_mut().enumerate() {
            let values: Vec<f64> = (phase..n).step_by(period).map(|i| data[i] - trend[i]).collect();
            *index = values.iter().sum::<f64>() / values.len() as f64;
        }
        let offset = indices.iter().sum::<f64>() / period as f64;
        let seasonal: Vec<f64> = (0..n).map(|i| indices[i % period] - offset).collect();

        let residual = (0..n).map(|i| data[i] - trend[i] - seasonal[i]).collect();

        Ok(Decomposition {
            trend,
            seasonal,
            residual,
        })
    }

    fn score(&self, series: &Series) -> std::result::Result<Vec<AnomalyScore>, NotApplicable> {
        let parts = self.decompose(&series.counts)?;
        let (_, std) = mean_and_std(&parts.residual);
        if std < DEGENERATE_STD {
            return Err(NotApplicable::DegenerateVariance {
                component: "residual",
            });
        }

        let label: Arc<str> = Arc::from(series.label.as_str());
        let n = series.len();
        let half = self.period / 2;
        let scores = (0..n)
            .map(|i| {
                let score = parts.residual[i].abs() / std;
                AnomalyScore {
                    label: Arc::clone(&label),
                    period: series.period(i),
                    detector: SEASONAL_RESIDUAL,
                    score,
                    threshold: self.threshold,
                    verdict: score > self.threshold,
                    count: series.counts[i],
                    expected: parts.trend[i] + parts.seasonal[i],
                    low_confidence: i < half || i >= n - half,
                }
            })
            .collect();
        Ok(scores)
    }
}

/// A single-series scoring strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Detector {
    RollingZScore(RollingZScore),
    SeasonalResidual(SeasonalResidual),
}

impl Detector {
    pub fn name(&self) -> &'static str {
        match self {
            Detector::RollingZScore(_) => ROLLING_ZSCORE,
            Detector::SeasonalResidual(_) => SEASONAL_RESIDUAL,
        }
    }

    /// One score per period, or the reason this series cannot be scored.
    pub fn score(&self, series: &Series) -> std::result::Result<Vec<AnomalyScore>, NotApplicable> {
        match self {
            Detector::RollingZScore(detector) => detector.score(series),
            Detector::SeasonalResidual(detector) => detector.score(series),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skipped {
    pub label: Option<String>,
    pub detector: &'static str,
    pub reason: NotApplicable,
}

/// Output of a bank run. Per-series scores keep only true verdicts.
#[derive(Debug, Clone, Default)]
pub struct Detections {
    pub scores: Vec<AnomalyScore>,
    pub joint: Vec<JointScore>,
    pub skipped: Vec<Skipped>,
}

pub struct DetectorBank {
    detectors: Vec<Detector>,
    joint: Option<IsolationScorer>,
}

impl DetectorBank {
    pub fn new(detectors: Vec<Detector>, joint: Option<IsolationScorer>) -> Self {
        Self { detectors, joint }
    }

    pub fn from_config(config: &DetectConfig, granularity: Granularity) -> Self {
        let detectors = vec![
            Detector::RollingZScore(RollingZScore {
                window: config.rolling_window_for(granularity),
                threshold: config.zscore_threshold,
                std_floor: config.std_floor,
            }),
            Detector::SeasonalResidual(SeasonalResidual {
                period: config.seasonal_period_for(granularity),
                threshold: config.residual_threshold,
            }),
        ];
        Self::new(detectors, Some(IsolationScorer::from_config(config)))
    }

    /// Runs every detector over every series. A detector that cannot score a
    /// series is recorded in `skipped`; the remaining work continues.
    pub fn run(
        &self,
        series: &BTreeMap<String, Series>,
        cancel: &CancellationToken,
    ) -> Result<Detections> {
        let inputs: Vec<&Series> = series.values().collect();
        let mut detections = Detections::default();

        for detector in &self.detectors {
            let outcomes: Vec<_> = inputs
                .par_iter()
                .map(|series| {
                    let flagged = detector.score(series).map(|scores| {
                        scores
                            .into_iter()
                            .filter(|score| score.verdict)
                            .collect::<Vec<_>>()
                    });
                    (series.label.as_str(), flagged)
                })
                .collect();

            let mut flagged = 0usize;
            for (label, outcome) in outcomes {
                match outcome {
                    Ok(scores) => {
                        flagged += scores.len();
                        detections.scores.extend(scores);
                    }
                    Err(reason) => {
                        tracing::debug!(label, detector = detector.name(), %reason, "detector not applicable");
                        detections.skipped.push(Skipped {
                            label: Some(label.to_string()),
                            detector: detector.name(),
                            reason,
                        });
                    }
                }
            }
            tracing::info!(detector = detector.name(), series = inputs.len(), flagged, "detector finished");

            if cancel.is_cancelled() {
                return Err(PipelineError::CancellationRequested {
                    stage: detector.name(),
                });
            }
        }

        if let Some(joint) = &self.joint {
            match joint.score(series) {
                Ok(scores) => {
                    let flagged = scores.iter().filter(|score| score.verdict).count();
                    tracing::info!(detector = joint.name(), periods = scores.len(), flagged, "detector finished");
                    detections.joint = scores;
                }
                Err(reason) => {
                    tracing::debug!(detector = joint.name(), %reason, "detector not applicable");
                    detections.skipped.push(Skipped {
                        label: None,
                        detector: joint.name(),
                        reason,
                    });
                }
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::CancellationRequested {
                    stage: joint.name(),
                });
            }
        }

        Ok(detections)
    }
}

/// Population mean and standard deviation.
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(label: &str, counts: Vec<f64>) -> Series {
        Series {
            label: label.to_string(),
            granularity: Granularity::Day,
            first: 19_000,
            counts,
        }
    }

    fn zscore() -> RollingZScore {
        RollingZScore {
            window: 28,
            threshold: 3.0,
            std_floor: 1e-6,
        }
    }

    fn seasonal() -> SeasonalResidual {
        SeasonalResidual {
            period: 7,
            threshold: 3.0,
        }
    }

    #[test]
    fn rolling_zscore_flags_only_the_spike() {
        let mut counts = vec![10.0; 60];
        counts.push(200.0);
        let scores = zscore().score(&series("nausea", counts)).unwrap();

        assert_eq!(scores.len(), 61);
        let flagged: Vec<usize> = scores
            .iter()
            .enumerate()
            .filter(|(_, score)| score.verdict)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flagged, vec![60]);
        assert_eq!(scores[60].expected, 10.0);
        assert!(scores[..28].iter().all(|score| score.low_confidence));
        assert!(scores[28..].iter().all(|score| !score.low_confidence));
    }

    #[test]
    fn rolling_zscore_has_no_look_ahead() {
        let base: Vec<f64> = (0..50).map(|i| ((i * 7) % 11) as f64).collect();
        let original = zscore().score(&series("a", base.clone())).unwrap();

        for cut in [1usize, 10, 30, 49] {
            let mut altered = base.clone();
            for value in altered.iter_mut().skip(cut + 1) {
                *value += 1_000.0;
            }
            let rescored = zscore().score(&series("a", altered)).unwrap();
            for i in 0..=cut {
                assert_eq!(original[i].score, rescored[i].score, "period {i} after cut {cut}");
            }
        }
    }

    #[test]
    fn rolling_zscore_rejects_empty_series() {
        assert_eq!(
            zscore().score(&series("a", Vec::new())),
            Err(NotApplicable::InsufficientData {
                required: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn decomposition_recovers_weekly_cycle() {
        let data: Vec<f64> = (0..42)
            .map(|i| 20.0 + if i % 7 == 5 { 7.0 } else { 0.0 })
            .collect();
        let parts = seasonal().decompose(&data).unwrap();

        assert!(parts.trend.iter().all(|t| (t - 21.0).abs() < 1e-9));
        assert!((parts.seasonal[5] - 6.0).abs() < 1e-9);
        assert!((parts.seasonal[0] + 1.0).abs() < 1e-9);
        assert!(parts.residual.iter().all(|r| r.abs() < 1e-9));
    }

    #[test]
    fn even_period_uses_two_by_p_average() {
        let detector = SeasonalResidual {
            period: 4,
            ..seasonal()
        };
        let data: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let parts = detector.decompose(&data).unwrap();
        assert!((parts.trend[5] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn seasonal_residual_flags_off_cycle_spike() {
        let mut data: Vec<f64> = (0..70)
            .map(|i| 10.0 + if i % 7 == 5 { 5.0 } else { 0.0 } + (i % 3) as f64 * 0.5)
            .collect();
        data[40] += 60.0;
        let scores = seasonal().score(&series("rash", data)).unwrap();

        let top = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.score.total_cmp(&b.1.score))
            .map(|(i, _)| i);
        assert_eq!(top, Some(40));
        assert!(scores[40].verdict);
    }

    #[test]
    fn seasonal_residual_needs_two_cycles() {
        assert_eq!(
            seasonal().score(&series("a", vec![1.0; 13])),
            Err(NotApplicable::InsufficientData {
                required: 14,
                actual: 13
            })
        );
    }

    #[test]
    fn seasonal_residual_reports_degenerate_variance() {
        assert_eq!(
            seasonal().score(&series("a", vec![4.0; 30])),
            Err(NotApplicable::DegenerateVariance {
                component: "residual"
            })
        );
    }

    #[test]
    fn bank_continues_past_inapplicable_detectors() {
        let mut map = BTreeMap::new();
        map.insert("short".to_string(), series("short", vec![1.0, 2.0, 3.0]));
        let mut long = vec![10.0; 60];
        long.push(200.0);
        map.insert("long".to_string(), series("long", long));

        let bank = DetectorBank::from_config(&DetectConfig::default(), Granularity::Day);
        let detections = bank.run(&map, &CancellationToken::new()).unwrap();

        assert!(detections
            .skipped
            .iter()
            .any(|s| s.label.as_deref() == Some("short") && s.detector == SEASONAL_RESIDUAL));
        assert!(detections
            .scores
            .iter()
            .any(|s| &*s.label == "long" && s.detector == ROLLING_ZSCORE));
    }

    #[test]
    fn bank_keeps_only_flagged_scores() {
        let mut map = BTreeMap::new();
        let mut counts = vec![10.0; 60];
        counts.push(200.0);
        map.insert("nausea".to_string(), series("nausea", counts));
        map.insert("rash".to_string(), series("rash", vec![5.0; 61]));

        let bank = DetectorBank::from_config(&DetectConfig::default(), Granularity::Day);
        let detections = bank.run(&map, &CancellationToken::new()).unwrap();

        assert!(!detections.scores.is_empty());
        assert!(detections.scores.iter().all(|s| s.verdict));
        assert!(detections.scores.iter().all(|s| &*s.label == "nausea"));
        assert!(detections.scores.len() < 61);
    }

    #[test]
    fn default_config_flags_exactly_the_spike() {
        let mut map = BTreeMap::new();
        let mut counts = vec![10.0; 60];
        counts.push(200.0);
        map.insert("nausea".to_string(), series("nausea", counts));

        let bank = DetectorBank::from_config(&DetectConfig::default(), Granularity::Day);
        let detections = bank.run(&map, &CancellationToken::new()).unwrap();

        let flagged: Vec<i64> = detections
            .scores
            .iter()
            .filter(|s| s.detector == ROLLING_ZSCORE)
            .map(|s| s.period.index - 19_000)
            .collect();
        assert_eq!(flagged, vec![60]);
        assert_eq!(detections.scores[0].expected, 10.0);
    }

    #[test]
    fn bank_stops_when_cancelled() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), series("a", vec![1.0; 20]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let bank = DetectorBank::from_config(&DetectConfig::default(), Granularity::Day);
        assert!(matches!(
            bank.run(&map, &cancel),
            Err(PipelineError::CancellationRequested { .. })
        ));
    }
}
