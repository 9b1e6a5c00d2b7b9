use crate::types::FeatureVector;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// The prediction capability the pipeline consumes. Implementations are loaded once
/// at startup and only ever read afterwards, so they must be shareable across threads.
pub trait ScoreModel: Send + Sync {
    /// Number of inputs the model was trained on.
    fn feature_count(&self) -> usize;

    fn score(&self, vector: &FeatureVector) -> Result<f64, ModelError>;

    /// Short human-readable identification for logs and error messages.
    fn describe(&self) -> String;

    /// Feature names recorded in the model artifact, if any.
    fn feature_names(&self) -> Option<&[String]> {
        None
    }

    /// Exposes tree structure to attribution methods that need it.
    fn as_tree_ensemble(&self) -> Option<&TreeEnsemble> {
        None
    }
}

/// Custom error type for model loading, saving, and scoring.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Failed to parse JSON model dump: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Tree {tree} is malformed: {reason}")]
    MalformedTree { tree: usize, reason: String },
    #[error("Unsupported model artifact: {0}")]
    Unsupported(String),
    #[error("Model expects {expected} inputs but received {found}.")]
    InputLength { expected: usize, found: usize },
    #[error("Model produced a non-finite output ({0}).")]
    NonFiniteOutput(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TreeNode {
    /// Samples with `x[feature] <= threshold` go to `left`, the rest to `right`.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        cover: f64,
    },
    Leaf { value: f64, cover: f64 },
}

impl TreeNode {
    /// Number of training samples (or summed hessian) that reached this node.
    pub fn cover(&self) -> f64 {
        match self {
            TreeNode::Split { cover, .. } | TreeNode::Leaf { cover, .. } => *cover,
        }
    }
}

/// A binary regression tree stored as a flat node list rooted at index 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegressionTree {
    #[serde(rename = "node")]
    pub nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn new(nodes: Vec<TreeNode>) -> Self {
        Self { nodes }
    }

    pub fn predict(&self, sample: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value, .. } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    idx = if sample[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Cover-weighted mean leaf value: the tree's output with no feature known.
    pub fn expected_value(&self) -> f64 {
        self.expected_value_at(0)
    }

    fn expected_value_at(&self, idx: usize) -> f64 {
        match &self.nodes[idx] {
            TreeNode::Leaf { value, .. } => *value,
            TreeNode::Split { left, right, .. } => {
                let left_cover = self.nodes[*left].cover();
                let right_cover = self.nodes[*right].cover();
                (left_cover * self.expected_value_at(*left)
                    + right_cover * self.expected_value_at(*right))
                    / (left_cover + right_cover)
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.depth_at(0)
    }

    fn depth_at(&self, idx: usize) -> usize {
        match &self.nodes[idx] {
            TreeNode::Leaf { .. } => 0,
            TreeNode::Split { left, right, .. } => 1 + self.depth_at(*left).max(self.depth_at(*right)),
        }
    }

    /// Checks that the node list forms a single tree over `num_features` inputs.
    fn validate(&self, tree: usize, num_features: usize) -> Result<(), ModelError> {
        let malformed = |reason: String| ModelError::MalformedTree { tree, reason };
        if self.nodes.is_empty() {
            return Err(malformed("no nodes".to_string()));
        }
        let mut parent_count = vec![0usize; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            let cover = node.cover();
            if !cover.is_finite() || cover <= 0.0 {
                return Err(malformed(format!("node {idx} has cover {cover}; covers must be positive")));
            }
            match node {
                TreeNode::Leaf { value, .. } => {
                    if !value.is_finite() {
                        return Err(malformed(format!("leaf {idx} has non-finite value {value}")));
                    }
                }
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= num_features {
                        return Err(malformed(format!(
                            "node {idx} splits on feature {feature}, but the model has {num_features} features"
                        )));
                    }
                    if threshold.is_nan() {
                        return Err(malformed(format!("node {idx} has a NaN threshold")));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= self.nodes.len() {
                            return Err(malformed(format!(
                                "node {idx} points to child {child}; children must follow their parent within {} nodes",
                                self.nodes.len()
                            )));
                        }
                        parent_count[child] += 1;
                    }
                }
            }
        }
        if let Some(orphan) = parent_count
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(idx, &count)| (count != 1).then_some(idx))
        {
            return Err(malformed(format!(
                "node {orphan} has {} parents; every non-root node needs exactly one",
                parent_count[orphan]
            )));
        }
        Ok(())
    }
}

/// An additive ensemble of regression trees: `score(x) = base_score + Σ tree(x)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeEnsemble {
    pub num_features: usize,
    #[serde(default)]
    pub base_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_names: Option<Vec<String>>,
    #[serde(rename = "tree", default)]
    pub trees: Vec<RegressionTree>,
}

impl TreeEnsemble {
    pub fn new(
        num_features: usize,
        base_score: f64,
        trees: Vec<RegressionTree>,
    ) -> Result<Self, ModelError> {
        let ensemble = Self {
            num_features,
            base_score,
            feature_names: None,
            trees,
        };
        ensemble.validate()?;
        Ok(ensemble)
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Result<Self, ModelError> {
        self.feature_names = Some(names);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.num_features == 0 {
            return Err(ModelError::Unsupported(
                "ensemble declares zero input features".to_string(),
            ));
        }
        if !self.base_score.is_finite() {
            return Err(ModelError::Unsupported(format!(
                "non-finite base score {}",
                self.base_score
            )));
        }
        if let Some(names) = &self.feature_names {
            if names.len() != self.num_features {
                return Err(ModelError::Unsupported(format!(
                    "{} feature names recorded for {} features",
                    names.len(),
                    self.num_features
                )));
            }
        }
        for (idx, tree) in self.trees.iter().enumerate() {
            tree.validate(idx, self.num_features)?;
        }
        Ok(())
    }

    /// `base_score` plus each tree's cover-weighted expected output.
    pub fn expected_value(&self) -> f64 {
        self.base_score + self.trees.iter().map(RegressionTree::expected_value).sum::<f64>()
    }

    pub fn max_depth(&self) -> usize {
        self.trees.iter().map(RegressionTree::depth).max().unwrap_or(0)
    }

    /// Saves the ensemble in the native, human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads and validates an ensemble from a native TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ModelError> {
        let ensemble: Self = toml::from_str(text)?;
        ensemble.validate()?;
        Ok(ensemble)
    }
}

impl ScoreModel for TreeEnsemble {
    fn feature_count(&self) -> usize {
        self.num_features
    }

    fn score(&self, vector: &FeatureVector) -> Result<f64, ModelError> {
        if vector.len() != self.num_features {
            return Err(ModelError::InputLength {
                expected: self.num_features,
                found: vector.len(),
            });
        }
        let sample = vector.as_slice();
        let score = self.base_score + self.trees.iter().map(|t| t.predict(sample)).sum::<f64>();
        if !score.is_finite() {
            return Err(ModelError::NonFiniteOutput(score));
        }
        Ok(score)
    }

    fn describe(&self) -> String {
        format!(
            "tree ensemble ({} trees, depth <= {}, {} features)",
            self.trees.len(),
            self.max_depth(),
            self.num_features
        )
    }

    fn feature_names(&self) -> Option<&[String]> {
        self.feature_names.as_deref()
    }

    fn as_tree_ensemble(&self) -> Option<&TreeEnsemble> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// x0 <= 5 ? (x1 <= 0.5 ? 1 : 3) : 10, with covers 60/40 and 30/30.
    fn two_level_tree() -> RegressionTree {
        RegressionTree::new(vec![
            TreeNode::Split {
                feature: 0,
                threshold: 5.0,
                left: 1,
                right: 2,
                cover: 100.0,
            },
            TreeNode::Split {
                feature: 1,
                threshold: 0.5,
                left: 3,
                right: 4,
                cover: 60.0,
            },
            TreeNode::Leaf {
                value: 10.0,
                cover: 40.0,
            },
            TreeNode::Leaf {
                value: 1.0,
                cover: 30.0,
            },
            TreeNode::Leaf {
                value: 3.0,
                cover: 30.0,
            },
        ])
    }

    #[test]
    fn predicts_by_walking_thresholds() {
        let tree = two_level_tree();
        assert_eq!(tree.predict(&[5.0, 0.0]), 1.0);
        assert_eq!(tree.predict(&[4.0, 1.0]), 3.0);
        assert_eq!(tree.predict(&[5.1, 0.0]), 10.0);
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn expected_value_is_cover_weighted() {
        let tree = two_level_tree();
        assert_abs_diff_eq!(tree.expected_value(), 0.6 * 2.0 + 0.4 * 10.0, epsilon = 1e-12);
    }

    #[test]
    fn ensemble_adds_base_score() {
        let ensemble = TreeEnsemble::new(2, 0.5, vec![two_level_tree(), two_level_tree()]).unwrap();
        let score = ensemble.score(&FeatureVector::from(vec![6.0, 0.0])).unwrap();
        assert_eq!(score, 20.5);
        let err = ensemble.score(&FeatureVector::from(vec![6.0])).unwrap_err();
        assert!(matches!(err, ModelError::InputLength { expected: 2, found: 1 }));
    }

    #[test]
    fn rejects_malformed_trees() {
        let mut backwards = two_level_tree();
        backwards.nodes[1] = TreeNode::Split {
            feature: 1,
            threshold: 0.5,
            left: 0,
            right: 4,
            cover: 60.0,
        };
        let mut zero_cover = two_level_tree();
        zero_cover.nodes[3] = TreeNode::Leaf {
            value: 1.0,
            cover: 0.0,
        };
        let mut shared_child = two_level_tree();
        shared_child.nodes[1] = TreeNode::Split {
            feature: 1,
            threshold: 0.5,
            left: 2,
            right: 4,
            cover: 60.0,
        };
        for tree in [backwards, zero_cover, shared_child, RegressionTree::new(vec![])] {
            let err = TreeEnsemble::new(2, 0.0, vec![tree]).unwrap_err();
            assert!(matches!(err, ModelError::MalformedTree { tree: 0, .. }), "{err}");
        }
        let err = TreeEnsemble::new(1, 0.0, vec![two_level_tree()]).unwrap_err();
        assert!(err.to_string().contains("splits on feature 1"));
    }

    #[test]
    fn toml_round_trip_preserves_structure() {
        let ensemble = TreeEnsemble::new(2, -1.25, vec![two_level_tree()])
            .unwrap()
            .with_feature_names(vec!["age".into(), "parity".into()])
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        ensemble.save(&path).unwrap();
        let loaded = TreeEnsemble::load(&path).unwrap();
        assert_eq!(loaded, ensemble);
        assert_eq!(loaded.feature_names().unwrap()[1], "parity");
    }
}
