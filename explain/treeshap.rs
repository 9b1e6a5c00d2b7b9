//! # Exact Tree Attribution
//!
//! Path-dependent TreeSHAP for additive tree ensembles. For one sample, every tree is
//! walked once while a "unique path" of the features split on so far is maintained.
//! Each path element records the fraction of training cover that flows through that
//! split when the feature is unknown (`zero_fraction`) and whether the sample itself
//! follows the split (`one_fraction`). The path weights are the Shapley permutation
//! weights for all subsets of the path features; they are grown with `extend` on the
//! way down and a feature's contribution is read off at the leaves with `unwound_sum`.
//!
//! The decomposition is exact: for every tree the contributions sum to the tree's
//! output minus its cover-weighted expected output, so over the ensemble
//! `baseline + Σφ == score` up to rounding.
//!
//! Zero fractions are normalized by the summed cover of the two children, which keeps
//! the decomposition exact even when a node's recorded cover differs slightly from the
//! sum of its children's covers.

use crate::ensemble::model::{RegressionTree, ScoreModel, TreeEnsemble, TreeNode};
use crate::explain::engine::{AttributionError, Attributor, RawAttribution};
use crate::types::FeatureVector;
use rayon::prelude::*;

#[derive(Clone, Copy, Debug)]
struct PathElement {
    /// `None` only for the root sentinel.
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    weight: f64,
}

/// Attribution capability for `TreeEnsemble` models.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeShap;

impl TreeShap {
    pub fn new() -> Self {
        Self
    }

    /// Contributions and baseline for one sample; the ensemble must already match the
    /// sample's length.
    pub fn explain_ensemble(&self, ensemble: &TreeEnsemble, sample: &[f64]) -> RawAttribution {
        let num_features = ensemble.num_features;
        let per_tree: Vec<Vec<f64>> = ensemble
            .trees
            .par_iter()
            .map(|tree| {
                let mut phi = vec![0.0; num_features];
                tree_contributions(tree, sample, &mut phi);
                phi
            })
            .collect();

        // Summed in tree order so the result does not depend on thread scheduling.
        let mut contributions = vec![0.0; num_features];
        for phi in &per_tree {
            for (total, value) in contributions.iter_mut().zip(phi) {
                *total += value;
            }
        }

        RawAttribution {
            baseline: ensemble.expected_value(),
            contributions,
        }
    }
}

impl Attributor for TreeShap {
    fn name(&self) -> &'static str {
        "TreeSHAP"
    }

    fn explain(
        &self,
        model: &dyn ScoreModel,
        vector: &FeatureVector,
    ) -> Result<RawAttribution, AttributionError> {
        let ensemble = model
            .as_tree_ensemble()
            .ok_or_else(|| AttributionError::UnsupportedModel {
                method: self.name(),
                model: model.describe(),
            })?;
        if vector.len() != ensemble.num_features {
            return Err(AttributionError::ShapeMismatch {
                expected: ensemble.num_features,
                found: vector.len(),
            });
        }
        Ok(self.explain_ensemble(ensemble, vector.as_slice()))
    }
}

/// Adds one tree's Shapley contributions for `sample` into `phi`.
pub fn tree_contributions(tree: &RegressionTree, sample: &[f64], phi: &mut [f64]) {
    recurse(tree, sample, phi, 0, &[], 1.0, 1.0, None);
}

#[allow(clippy::too_many_arguments)]
fn recurse(
    tree: &RegressionTree,
    sample: &[f64],
    phi: &mut [f64],
    node: usize,
    parent_path: &[PathElement],
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    let mut path = Vec::with_capacity(parent_path.len() + 1);
    path.extend_from_slice(parent_path);
    extend(&mut path, zero_fraction, one_fraction, feature);

    match &tree.nodes[node] {
        TreeNode::Leaf { value, .. } => {
            for i in 1..path.len() {
                let element = path[i];
                if let Some(f) = element.feature {
                    let weight = unwound_sum(&path, i);
                    phi[f] += weight * (element.one_fraction - element.zero_fraction) * value;
                }
            }
        }
        TreeNode::Split {
            feature: split_feature,
            threshold,
            left,
            right,
            ..
        } => {
            let (hot, cold) = if sample[*split_feature] <= *threshold {
                (*left, *right)
            } else {
                (*right, *left)
            };
            let hot_cover = tree.nodes[hot].cover();
            let cold_cover = tree.nodes[cold].cover();
            let total_cover = hot_cover + cold_cover;

            // A feature already on the path is removed and re-entered with the
            // fractions of both splits combined.
            let mut incoming_zero = 1.0;
            let mut incoming_one = 1.0;
            if let Some(k) = path
                .iter()
                .skip(1)
                .position(|e| e.feature == Some(*split_feature))
                .map(|p| p + 1)
            {
                incoming_zero = path[k].zero_fraction;
                incoming_one = path[k].one_fraction;
                unwind(&mut path, k);
            }

            recurse(
                tree,
                sample,
                phi,
                hot,
                &path,
                incoming_zero * hot_cover / total_cover,
                incoming_one,
                Some(*split_feature),
            );
            recurse(
                tree,
                sample,
                phi,
                cold,
                &path,
                incoming_zero * cold_cover / total_cover,
                0.0,
                Some(*split_feature),
            );
        }
    }
}

fn extend(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let scale = (depth + 1) as f64;
    for i in (0..depth).rev() {
        path[i + 1].weight += one_fraction * path[i].weight * (i + 1) as f64 / scale;
        path[i].weight = zero_fraction * path[i].weight * (depth - i) as f64 / scale;
    }
}

/// Inverse of `extend` for the element at `index`.
fn unwind(path: &mut Vec<PathElement>, index: usize) {
    let last = path.len() - 1;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let scale = (last + 1) as f64;
    let mut next = path[last].weight;

    for j in (0..last).rev() {
        if one_fraction != 0.0 {
            let held = path[j].weight;
            path[j].weight = next * scale / ((j + 1) as f64 * one_fraction);
            next = held - path[j].weight * zero_fraction * (last - j) as f64 / scale;
        } else {
            path[j].weight = path[j].weight * scale / (zero_fraction * (last - j) as f64);
        }
    }

    for j in index..last {
        path[j].feature = path[j + 1].feature;
        path[j].zero_fraction = path[j + 1].zero_fraction;
        path[j].one_fraction = path[j + 1].one_fraction;
    }
    path.pop();
}

/// Total permutation weight of the path with the element at `index` removed, without
/// modifying the path.
fn unwound_sum(path: &[PathElement], index: usize) -> f64 {
    let last = path.len() - 1;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let mut next = path[last].weight;
    let mut total = 0.0;

    if one_fraction != 0.0 {
        for j in (0..last).rev() {
            let portion = next / ((j + 1) as f64 * one_fraction);
            total += portion;
            next = path[j].weight - portion * zero_fraction * (last - j) as f64;
        }
    } else {
        for j in (0..last).rev() {
            total += path[j].weight / (zero_fraction * (last - j) as f64);
        }
    }
    total * (last + 1) as f64
}
