//! Import of LightGBM `Booster.dump_model()` JSON into a native `TreeEnsemble`.
//!
//! Only what the attribution method can reproduce exactly is accepted: single-output
//! regression boosters with identity output, numeric `<=` splits, and leaf/internal
//! sample counts to serve as covers. Everything else is rejected as unsupported rather
//! than approximated.

use crate::ensemble::model::{ModelError, RegressionTree, TreeEnsemble, TreeNode};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Objectives whose raw tree sum is the model output.
const IDENTITY_OBJECTIVES: [&str; 6] = ["regression", "regression_l1", "huber", "fair", "quantile", "mape"];

#[derive(Deserialize)]
struct Dump {
    #[serde(default = "one")]
    num_class: usize,
    #[serde(default = "one")]
    num_tree_per_iteration: usize,
    max_feature_idx: usize,
    #[serde(default)]
    objective: Option<String>,
    #[serde(default)]
    average_output: bool,
    #[serde(default)]
    feature_names: Vec<String>,
    tree_info: Vec<TreeInfo>,
}

fn one() -> usize {
    1
}

#[derive(Deserialize)]
struct TreeInfo {
    tree_index: usize,
    tree_structure: DumpNode,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DumpNode {
    Split(DumpSplit),
    Leaf(DumpLeaf),
}

#[derive(Deserialize)]
struct DumpSplit {
    split_feature: usize,
    threshold: serde_json::Value,
    decision_type: String,
    #[serde(default)]
    missing_type: Option<String>,
    #[serde(default)]
    internal_count: Option<f64>,
    left_child: Box<DumpNode>,
    right_child: Box<DumpNode>,
}

#[derive(Deserialize)]
struct DumpLeaf {
    leaf_value: f64,
    #[serde(default)]
    leaf_count: Option<f64>,
}

pub fn load_dump(path: impl AsRef<Path>) -> Result<TreeEnsemble, ModelError> {
    let text = fs::read_to_string(path)?;
    from_dump_json(&text)
}

pub fn from_dump_json(text: &str) -> Result<TreeEnsemble, ModelError> {
    let dump: Dump = serde_json::from_str(text)?;

    if dump.num_class != 1 || dump.num_tree_per_iteration != 1 {
        return Err(ModelError::Unsupported(format!(
            "multi-output booster ({} classes, {} trees per iteration)",
            dump.num_class, dump.num_tree_per_iteration
        )));
    }
    if dump.average_output {
        return Err(ModelError::Unsupported(
            "averaged (random forest) output".to_string(),
        ));
    }
    if let Some(objective) = &dump.objective {
        let mut words = objective.split_whitespace();
        let name = words.next().unwrap_or_default();
        if !IDENTITY_OBJECTIVES.contains(&name) {
            return Err(ModelError::Unsupported(format!(
                "objective '{name}' transforms the raw score"
            )));
        }
        // `reg_sqrt` boosters are trained on sqrt(label) and square the sum at predict time.
        if words.any(|word| word == "sqrt") {
            return Err(ModelError::Unsupported(format!(
                "objective '{objective}' squares the raw score"
            )));
        }
    }

    let num_features = dump.max_feature_idx + 1;
    let trees = dump
        .tree_info
        .iter()
        .map(|info| {
            let mut nodes = Vec::new();
            flatten(&info.tree_structure, info.tree_index, true, &mut nodes)?;
            Ok(RegressionTree::new(nodes))
        })
        .collect::<Result<Vec<_>, ModelError>>()?;

    log::info!(
        "Imported LightGBM dump: {} trees over {} features",
        trees.len(),
        num_features
    );

    let ensemble = TreeEnsemble::new(num_features, 0.0, trees)?;
    if dump.feature_names.len() == num_features {
        ensemble.with_feature_names(dump.feature_names)
    } else {
        Ok(ensemble)
    }
}

/// Appends `node` and its subtree in pre-order and returns its index, so every child
/// lands after its parent.
fn flatten(
    node: &DumpNode,
    tree: usize,
    is_root: bool,
    nodes: &mut Vec<TreeNode>,
) -> Result<usize, ModelError> {
    let idx = nodes.len();
    match node {
        DumpNode::Leaf(leaf) => {
            let cover = match (leaf.leaf_count, is_root) {
                (Some(count), _) => count,
                // A stump has no split to weigh, so any positive cover is exact.
                (None, true) => 1.0,
                (None, false) => {
                    return Err(ModelError::MalformedTree {
                        tree,
                        reason: format!("leaf at node {idx} has no leaf_count"),
                    });
                }
            };
            nodes.push(TreeNode::Leaf {
                value: leaf.leaf_value,
                cover,
            });
        }
        DumpNode::Split(split) => {
            if split.decision_type != "<=" {
                return Err(ModelError::Unsupported(format!(
                    "tree {tree} uses '{}' (categorical) splits",
                    split.decision_type
                )));
            }
            if split.missing_type.as_deref() == Some("Zero") {
                return Err(ModelError::Unsupported(format!(
                    "tree {tree} treats zero as missing"
                )));
            }
            let threshold = split.threshold.as_f64().ok_or_else(|| {
                ModelError::Unsupported(format!(
                    "tree {tree} has non-numeric threshold {}",
                    split.threshold
                ))
            })?;
            // Placeholder until both children have been placed.
            nodes.push(TreeNode::Leaf {
                value: 0.0,
                cover: 1.0,
            });
            let left = flatten(&split.left_child, tree, false, nodes)?;
            let right = flatten(&split.right_child, tree, false, nodes)?;
            let cover = split
                .internal_count
                .unwrap_or_else(|| nodes[left].cover() + nodes[right].cover());
            nodes[idx] = TreeNode::Split {
                feature: split.split_feature,
                threshold,
                left,
                right,
                cover,
            };
        }
    }
    Ok(idx)
}
