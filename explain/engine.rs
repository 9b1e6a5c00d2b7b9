use crate::ensemble::model::{ModelError, ScoreModel};
use crate::schema::FeatureSchema;
use crate::types::{Attribution, Baseline, Explanation, FeatureVector};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Default relative tolerance for the sum law.
pub const DEFAULT_SUM_TOLERANCE: f64 = 1e-6;

/// Baseline and per-feature contributions as produced by an attribution method,
/// before they are attached to feature names.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAttribution {
    pub baseline: f64,
    /// One value per model input, in model column order.
    pub contributions: Vec<f64>,
}

/// An additive attribution method: a deterministic function of (model, vector) whose
/// baseline and contributions sum to the model's score.
pub trait Attributor: Send + Sync {
    fn name(&self) -> &'static str;

    fn explain(
        &self,
        model: &dyn ScoreModel,
        vector: &FeatureVector,
    ) -> Result<RawAttribution, AttributionError>;
}

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error("{method} cannot explain this model: {model}")]
    UnsupportedModel { method: &'static str, model: String },
    #[error("Attribution expected a vector of {expected} features but received {found}.")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("Attribution returned {found} contributions for {expected} features.")]
    ContributionCount { expected: usize, found: usize },
    #[error("Attribution produced a non-finite value for '{feature}'.")]
    NonFinite { feature: String },
    #[error("Model scoring failed while verifying the attribution: {0}")]
    Model(#[from] ModelError),
    #[error(
        "Sum law violated: baseline plus contributions is {reconstructed}, but the model scored {score} (tolerance {tolerance:e})."
    )]
    SumLawViolation {
        score: f64,
        reconstructed: f64,
        tolerance: f64,
    },
}

impl AttributionError {
    /// True when the error signals a defect in the attribution method itself rather
    /// than a model or shape problem.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, AttributionError::SumLawViolation { .. })
    }
}

/// Verifies `baseline + Σ contributions == score` within `tolerance`, scaled by
/// `|score|` when the score is larger than one.
pub fn check_sum_law(
    baseline: f64,
    contributions: impl IntoIterator<Item = f64>,
    score: f64,
    tolerance: f64,
) -> Result<(), AttributionError> {
    let reconstructed = baseline + contributions.into_iter().sum::<f64>();
    let allowed = tolerance * score.abs().max(1.0);
    if (reconstructed - score).abs() <= allowed {
        Ok(())
    } else {
        Err(AttributionError::SumLawViolation {
            score,
            reconstructed,
            tolerance: allowed,
        })
    }
}

/// Binds an attribution method to the loaded model and the schema it was trained on.
pub struct AttributionEngine {
    schema: Arc<FeatureSchema>,
    model: Arc<dyn ScoreModel>,
    attributor: Box<dyn Attributor>,
    tolerance: f64,
}

impl fmt::Debug for AttributionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributionEngine")
            .field("features", &self.schema.feature_count())
            .field("model", &self.model.describe())
            .field("attributor", &self.attributor.name())
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl AttributionEngine {
    pub fn new(
        schema: Arc<FeatureSchema>,
        model: Arc<dyn ScoreModel>,
        attributor: Box<dyn Attributor>,
        tolerance: f64,
    ) -> Self {
        Self {
            schema,
            model,
            attributor,
            tolerance,
        }
    }

    pub fn method(&self) -> &'static str {
        self.attributor.name()
    }

    /// Explains `vector` against `score`, the model output already computed for it.
    ///
    /// Attributions come back in schema order. The sum law is checked on every call;
    /// a violation is returned as an error and never corrected.
    pub fn explain(
        &self,
        vector: &FeatureVector,
        score: f64,
    ) -> Result<Explanation, AttributionError> {
        let expected = self.schema.feature_count();
        if vector.len() != expected {
            return Err(AttributionError::ShapeMismatch {
                expected,
                found: vector.len(),
            });
        }

        let raw = self.attributor.explain(self.model.as_ref(), vector)?;
        if raw.contributions.len() != expected {
            return Err(AttributionError::ContributionCount {
                expected,
                found: raw.contributions.len(),
            });
        }
        if !raw.baseline.is_finite() {
            return Err(AttributionError::NonFinite {
                feature: "baseline".to_string(),
            });
        }

        let attributions = self
            .schema
            .features()
            .iter()
            .zip(raw.contributions.iter().zip(vector.iter()))
            .enumerate()
            .map(|(schema_index, (feature, (&value, &input_value)))| {
                if !value.is_finite() {
                    return Err(AttributionError::NonFinite {
                        feature: feature.name().to_string(),
                    });
                }
                Ok(Attribution {
                    feature_name: feature.name().to_string(),
                    schema_index,
                    value,
                    input_value,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        check_sum_law(
            raw.baseline,
            attributions.iter().map(|a| a.value),
            score,
            self.tolerance,
        )?;
        log::debug!(
            "{} attribution: baseline {:.6}, score {:.6}",
            self.attributor.name(),
            raw.baseline,
            score
        );

        Ok(Explanation {
            baseline: Baseline(raw.baseline),
            attributions,
        })
    }

    /// Scores `vector` with the bound model and explains it.
    pub fn explain_vector(&self, vector: &FeatureVector) -> Result<Explanation, AttributionError> {
        let score = self.model.score(vector)?;
        self.explain(vector, score)
    }
}
