use crate::ensemble::model::{ModelError, ScoreModel};
use crate::types::{FeatureVector, Prediction};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Feature vector has {found} values, but the model expects {expected}.")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("Model inference failed: {0}")]
    ModelInference(#[from] ModelError),
}

/// Maps validated feature vectors to scores with the model loaded at startup.
pub struct PredictionService {
    model: Arc<dyn ScoreModel>,
}

impl fmt::Debug for PredictionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictionService")
            .field("model", &self.model.describe())
            .finish()
    }
}

impl PredictionService {
    pub fn new(model: Arc<dyn ScoreModel>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &Arc<dyn ScoreModel> {
        &self.model
    }

    pub fn feature_count(&self) -> usize {
        self.model.feature_count()
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<Prediction, PredictionError> {
        let expected = self.model.feature_count();
        if vector.len() != expected {
            return Err(PredictionError::ShapeMismatch {
                expected,
                found: vector.len(),
            });
        }
        let score = self.model.score(vector)?;
        if !score.is_finite() {
            return Err(ModelError::NonFiniteOutput(score).into());
        }
        Ok(Prediction {
            score,
            vector: vector.clone(),
        })
    }
}
