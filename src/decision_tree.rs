//! Decision-tree prediction for unseen targets
//!
//! A CART regressor over a fixed categorical feature set (match type,
//! word count, keyword type, discretized bid) predicting conversion rate
//! or conversion value by feature bucket. Splits maximize variance
//! reduction; the tree persists as nested nodes and prediction is a
//! deterministic walk.

use crate::models::MatchType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    CrPrediction,
    CvPrediction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordType {
    Brand,
    Competitor,
    Generic,
    Product,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeywordFeatures {
    pub match_type: MatchType,
    pub word_count: u32,
    pub keyword_type: KeywordType,
    pub avg_bid: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureId {
    MatchType,
    WordCount,
    KeywordType,
    BidBucket,
}

const ALL_FEATURES: [FeatureId; 4] = [
    FeatureId::MatchType,
    FeatureId::WordCount,
    FeatureId::KeywordType,
    FeatureId::BidBucket,
];

impl KeywordFeatures {
    /// Categorical bucket of one feature. Word counts cap at 4+, bids
    /// discretize into five ranges.
    fn bucket(&self, feature: FeatureId) -> u8 {
        match feature {
            FeatureId::MatchType => match self.match_type {
                MatchType::Broad => 0,
                MatchType::Phrase => 1,
                MatchType::Exact => 2,
            },
            FeatureId::WordCount => self.word_count.min(4) as u8,
            FeatureId::KeywordType => match self.keyword_type {
                KeywordType::Brand => 0,
                KeywordType::Competitor => 1,
                KeywordType::Generic => 2,
                KeywordType::Product => 3,
            },
            FeatureId::BidBucket => {
                if self.avg_bid < 0.5 {
                    0
                } else if self.avg_bid < 1.0 {
                    1
                } else if self.avg_bid < 2.0 {
                    2
                } else if self.avg_bid < 5.0 {
                    3
                } else {
                    4
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub features: KeywordFeatures,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        prediction: f64,
        samples: usize,
    },
    /// Binary split: `left` holds rows where the feature bucket equals
    /// `category`, `right` the rest.
    Split {
        feature: FeatureId,
        category: u8,
        samples: usize,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Ready,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTreeModel {
    pub kind: PredictionKind,
    pub status: ModelStatus,
    pub sample_count: usize,
    pub trained_at: DateTime<Utc>,
    pub root: TreeNode,
}

#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub value: f64,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionTreeConfig {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Below this the model trains anyway but is flagged degraded.
    pub min_training_samples: usize,
}

impl Default for DecisionTreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 6,
            min_samples_leaf: 20,
            min_training_samples: 60,
        }
    }
}

impl DecisionTreeModel {
    pub fn train(
        kind: PredictionKind,
        samples: &[TrainingSample],
        config: DecisionTreeConfig,
    ) -> Self {
        let status = if samples.len() < config.min_training_samples {
            ModelStatus::Degraded
        } else {
            ModelStatus::Ready
        };
        let indices: Vec<usize> = (0..samples.len()).collect();
        let root = build_node(samples, &indices, 0, &config);
        Self {
            kind,
            status,
            sample_count: samples.len(),
            trained_at: Utc::now(),
            root,
        }
    }

    /// Deterministic walk; the same features always land in the same
    /// leaf.
    pub fn predict(&self, features: &KeywordFeatures) -> Prediction {
        let mut node = &self.root;
        loop {
            match node {
                TreeNode::Leaf { prediction, samples } => {
                    return Prediction {
                        value: *prediction,
                        low_confidence: self.status == ModelStatus::Degraded || *samples < 5,
                    };
                }
                TreeNode::Split {
                    feature,
                    category,
                    left,
                    right,
                    ..
                } => {
                    node = if features.bucket(*feature) == *category {
                        left
                    } else {
                        right
                    };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(node: &TreeNode) -> usize {
            match node {
                TreeNode::Leaf { .. } => 0,
                TreeNode::Split { left, right, .. } => 1 + walk(left).max(walk(right)),
            }
        }
        walk(&self.root)
    }
}

fn mean(samples: &[TrainingSample], indices: &[usize]) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    indices.iter().map(|&i| samples[i].value).sum::<f64>() / indices.len() as f64
}

fn sum_squared_error(samples: &[TrainingSample], indices: &[usize]) -> f64 {
    let m = mean(samples, indices);
    indices
        .iter()
        .map(|&i| (samples[i].value - m).powi(2))
        .sum()
}

fn build_node(
    samples: &[TrainingSample],
    indices: &[usize],
    depth: usize,
    config: &DecisionTreeConfig,
) -> TreeNode {
    let leaf = || TreeNode::Leaf {
        prediction: mean(samples, indices),
        samples: indices.len(),
    };

    if depth >= config.max_depth || indices.len() < config.min_samples_leaf * 2 {
        return leaf();
    }

    let parent_sse = sum_squared_error(samples, indices);
    if parent_sse <= f64::EPSILON {
        return leaf();
    }

    // Best (feature, category) binary split by variance reduction,
    // honoring the per-leaf sample floor.
    let mut best: Option<(FeatureId, u8, f64, Vec<usize>, Vec<usize>)> = None;
    for feature in ALL_FEATURES {
        let mut categories: Vec<u8> = indices
            .iter()
            .map(|&i| samples[i].features.bucket(feature))
            .collect();
        categories.sort_unstable();
        categories.dedup();
        if categories.len() < 2 {
            continue;
        }
        for category in categories {
            let (left, right): (Vec<usize>, Vec<usize>) = indices
                .iter()
                .copied()
                .partition(|&i| samples[i].features.bucket(feature) == category);
            if left.len() < config.min_samples_leaf || right.len() < config.min_samples_leaf {
                continue;
            }
            let reduction = parent_sse
                - sum_squared_error(samples, &left)
                - sum_squared_error(samples, &right);
            let improves = match &best {
                Some((_, _, best_reduction, _, _)) => reduction > *best_reduction,
                None => reduction > 1e-12,
            };
            if improves {
                best = Some((feature, category, reduction, left, right));
            }
        }
    }

    match best {
        Some((feature, category, _, left, right)) => TreeNode::Split {
            feature,
            category,
            samples: indices.len(),
            left: Box::new(build_node(samples, &left, depth + 1, config)),
            right: Box::new(build_node(samples, &right, depth + 1, config)),
        },
        None => leaf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(match_type: MatchType, word_count: u32, avg_bid: f64) -> KeywordFeatures {
        KeywordFeatures {
            match_type,
            word_count,
            keyword_type: KeywordType::Generic,
            avg_bid,
        }
    }

    /// Exact-match keywords convert at 0.2, everything else at 0.05.
    fn separable_samples(per_bucket: usize) -> Vec<TrainingSample> {
        let mut samples = Vec::new();
        for i in 0..per_bucket {
            samples.push(TrainingSample {
                features: features(MatchType::Exact, 1 + (i as u32 % 3), 1.0),
                value: 0.2,
            });
            samples.push(TrainingSample {
                features: features(MatchType::Broad, 1 + (i as u32 % 3), 1.0),
                value: 0.05,
            });
        }
        samples
    }

    #[test]
    fn test_learns_separable_split() {
        let samples = separable_samples(40);
        let model = DecisionTreeModel::train(
            PredictionKind::CrPrediction,
            &samples,
            DecisionTreeConfig::default(),
        );
        assert_eq!(model.status, ModelStatus::Ready);

        let exact = model.predict(&features(MatchType::Exact, 2, 1.0));
        let broad = model.predict(&features(MatchType::Broad, 2, 1.0));
        assert!((exact.value - 0.2).abs() < 1e-9);
        assert!((broad.value - 0.05).abs() < 1e-9);
        assert!(!exact.low_confidence);
    }

    #[test]
    fn test_small_sample_trains_degraded() {
        let samples = separable_samples(10); // 20 rows < min_training_samples
        let model = DecisionTreeModel::train(
            PredictionKind::CvPrediction,
            &samples,
            DecisionTreeConfig::default(),
        );
        assert_eq!(model.status, ModelStatus::Degraded);
        let p = model.predict(&features(MatchType::Exact, 1, 1.0));
        assert!(p.low_confidence);
        // Still yields a usable number: the pooled mean.
        assert!((p.value - 0.125).abs() < 1e-9);
    }

    #[test]
    fn test_depth_cap_respected() {
        let mut samples = Vec::new();
        // Noisy data across many buckets pushes the tree to keep
        // splitting; the cap must hold anyway.
        for i in 0..400usize {
            let mt = match i % 3 {
                0 => MatchType::Broad,
                1 => MatchType::Phrase,
                _ => MatchType::Exact,
            };
            samples.push(TrainingSample {
                features: KeywordFeatures {
                    match_type: mt,
                    word_count: (i % 5) as u32 + 1,
                    keyword_type: match i % 4 {
                        0 => KeywordType::Brand,
                        1 => KeywordType::Competitor,
                        2 => KeywordType::Generic,
                        _ => KeywordType::Product,
                    },
                    avg_bid: (i % 7) as f64,
                },
                value: (i % 11) as f64 / 10.0,
            });
        }
        let config = DecisionTreeConfig {
            max_depth: 3,
            min_samples_leaf: 5,
            min_training_samples: 50,
        };
        let model = DecisionTreeModel::train(PredictionKind::CrPrediction, &samples, config);
        assert!(model.depth() <= 3);
    }

    #[test]
    fn test_prediction_is_deterministic() {
        let samples = separable_samples(40);
        let model = DecisionTreeModel::train(
            PredictionKind::CrPrediction,
            &samples,
            DecisionTreeConfig::default(),
        );
        let f = features(MatchType::Phrase, 3, 0.4);
        let a = model.predict(&f).value;
        let b = model.predict(&f).value;
        assert_eq!(a, b);
    }

    #[test]
    fn test_persisted_tree_roundtrip() {
        let samples = separable_samples(40);
        let model = DecisionTreeModel::train(
            PredictionKind::CrPrediction,
            &samples,
            DecisionTreeConfig::default(),
        );
        let json = serde_json::to_string(&model).unwrap();
        let back: DecisionTreeModel = serde_json::from_str(&json).unwrap();
        let f = features(MatchType::Exact, 2, 1.0);
        assert_eq!(model.predict(&f).value, back.predict(&f).value);
    }
}
