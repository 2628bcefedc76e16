use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{DetectConfig, FeatureMode};
use crate::detect::mean_and_std;
use crate::error::NotApplicable;
use crate::models::{Granularity, JointScore, Series};

pub const ISOLATION_FOREST: &str = "isolation-forest";

const MIN_PERIODS: usize = 16;
const MAX_FEATURE_DRAWS: usize = 16;
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// Isolation-forest scorer over the joint vector of every label's count in
/// one period. Output is keyed by period only.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolationScorer {
    pub trees: usize,
    pub subsample: usize,
    pub threshold: f64,
    pub seed: u64,
    pub features: FeatureMode,
}

impl IsolationScorer {
    pub fn from_config(config: &DetectConfig) -> Self {
        Self {
            trees: config.isolation_trees,
            subsample: config.isolation_subsample,
            threshold: config.isolation_threshold,
            seed: config.seed,
            features: config.isolation_features,
        }
    }

    pub fn name(&self) -> &'static str {
        ISOLATION_FOREST
    }

    pub fn score(
        &self,
        series: &BTreeMap<String, Series>,
    ) -> Result<Vec<JointScore>, NotApplicable> {
        let Some(matrix) = FeatureMatrix::build(series, self.features) else {
            return Err(NotApplicable::InsufficientData {
                required: MIN_PERIODS,
                actual: 0,
            });
        };
        let n = matrix.rows.len();
        if n < MIN_PERIODS {
            return Err(NotApplicable::InsufficientData {
                required: MIN_PERIODS,
                actual: n,
            });
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let sample_size = self.subsample.min(n);
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let forest: Vec<Node> = (0..self.trees)
            .map(|_| {
                let sample = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
                build_tree(&matrix.rows, sample, 0, height_limit, &mut rng)
            })
            .collect();

        let normalizer = average_path_length(sample_size);
        let (expected_total, _) = mean_and_std(&matrix.totals);
        let scores = matrix
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mean_path = forest
                    .iter()
                    .map(|tree| path_length(tree, row, 0))
                    .sum::<f64>()
                    / forest.len() as f64;
                let score = 2f64.powf(-mean_path / normalizer);
                JointScore {
                    period: matrix.granularity.period(matrix.first + i as i64),
                    detector: ISOLATION_FOREST,
                    score,
                    threshold: self.threshold,
                    verdict: score > self.threshold,
                    total_count: matrix.totals[i],
                    expected_total,
                }
            })
            .collect();
        Ok(scores)
    }
}

/// Period-major feature rows, one column per label.
struct FeatureMatrix {
    granularity: Granularity,
    first: i64,
    rows: Vec<Vec<f64>>,
    totals: Vec<f64>,
}

impl FeatureMatrix {
    fn build(series: &BTreeMap<String, Series>, mode: FeatureMode) -> Option<Self> {
        let granularity = series.values().next()?.granularity;
        let first = series.values().map(|s| s.first).min()?;
        let last = series
            .values()
            .map(|s| s.first + s.len() as i64 - 1)
            .max()?;
        let periods = (last - first + 1).max(0) as usize;

        let mut rows = vec![vec![0.0; series.len()]; periods];
        let mut totals = vec![0.0; periods];
        for (column, s) in series.values().enumerate() {
            let mean = if s.is_empty() { 0.0 } else { s.total() / s.len() as f64 };
            for (offset, &count) in s.counts.iter().enumerate() {
                let row = (s.first - first) as usize + offset;
                totals[row] += count;
                rows[row][column] = match mode {
                    FeatureMode::Count => count,
                    FeatureMode::Rate if mean > 0.0 => count / mean,
                    FeatureMode::Rate => 0.0,
                };
            }
        }

        Some(Self {
            granularity,
            first,
            rows,
            totals,
        })
    }
}

fn build_tree(
    data: &[Vec<f64>],
    rows: Vec<usize>,
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> Node {
    if depth >= height_limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }

    let width = data[rows[0]].len();
    for _ in 0..MAX_FEATURE_DRAWS {
        let feature = rng.gen_range(0..width);
        let (min, max) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
            (lo.min(data[r][feature]), hi.max(data[r][feature]))
        });
        if min >= max {
            continue;
        }

        let value = rng.gen_range(min..max);
        let (left, right): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| data[r][feature] < value);
        return Node::Split {
            feature,
            value,
            left: Box::new(build_tree(data, left, depth + 1, height_limit, rng)),
            right: Box::new(build_tree(data, right, depth + 1, height_limit, rng)),
        };
    }

    Node::Leaf { size: rows.len() }
}

fn path_length(node: &Node, row: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            value,
            left,
            right,
        } => {
            let next = if row[*feature] < *value { left } else { right };
            path_length(next, row, depth + 1)
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` items.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer(seed: u64) -> IsolationScorer {
        IsolationScorer::from_config(&DetectConfig {
            seed,
            ..DetectConfig::default()
        })
    }

    fn corpus(outlier: Option<usize>) -> BTreeMap<String, Series> {
        ["cough", "fever", "rash"]
            .iter()
            .enumerate()
            .map(|(k, label)| {
                let counts = (0..40)
                    .map(|i| {
                        let base = 10.0 + ((i * (k + 1)) % 3) as f64;
                        if Some(i) == outlier {
                            base + 50.0
                        } else {
                            base
                        }
                    })
                    .collect();
                (
                    label.to_string(),
                    Series {
                        label: label.to_string(),
                        granularity: Granularity::Week,
                        first: 2_500,
                        counts,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn joint_outlier_period_scores_highest() {
        let scores = scorer(42).score(&corpus(Some(25))).unwrap();
        assert_eq!(scores.len(), 40);

        let top = scores
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .unwrap();
        assert_eq!(top.period.index, 2_525);
        assert!(top.verdict);
        assert!(top.total_count > 180.0);
        assert!(scores.iter().all(|s| s.score > 0.0 && s.score <= 1.0));
    }

    #[test]
    fn identical_seed_gives_identical_scores() {
        let data = corpus(Some(3));
        assert_eq!(scorer(9).score(&data), scorer(9).score(&data));
    }

    #[test]
    fn too_few_periods_is_not_applicable() {
        let mut data = corpus(None);
        for series in data.values_mut() {
            series.counts.truncate(10);
        }
        assert_eq!(
            scorer(1).score(&data),
            Err(NotApplicable::InsufficientData {
                required: MIN_PERIODS,
                actual: 10
            })
        );
        assert!(scorer(1).score(&BTreeMap::new()).is_err());
    }

    #[test]
    fn average_path_length_matches_reference_values() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!((average_path_length(256) - 10.2447).abs() < 1e-3);
    }
}
