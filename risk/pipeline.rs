//! # Request Pipeline
//!
//! One request flows raw record -> validated vector -> prediction -> attribution ->
//! ranked summary. Everything here is built once at startup and only read afterwards,
//! so a single `RiskPipeline` can serve concurrent requests without locking. Each
//! request's vector, prediction and explanation are local to that request.

use crate::assemble::assemble;
use crate::config::{ConfigError, RunConfig};
use crate::ensemble::{self, ModelError, ScoreModel};
use crate::explain::{
    AttributionEngine, AttributionError, Attributor, ExplanationSummarizer, ExplanationSummary,
    TreeShap,
};
use crate::predict::{PredictionError, PredictionService};
use crate::record::RawRecord;
use crate::schema::{FeatureSchema, SchemaError, ValidationError};
use crate::types::{Explanation, Prediction};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Failures while wiring the pipeline together. All are fatal at startup.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("The schema declares {schema_features} features but the model was trained on {model_features}.")]
    ShapeMismatch {
        schema_features: usize,
        model_features: usize,
    },
}

/// Per-request failures. Validation errors are the caller's to fix; the other two
/// mean the system itself is at fault and are logged before being returned.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
    #[error(transparent)]
    Attribution(#[from] AttributionError),
}

impl PipelineError {
    /// True when re-prompting for different input can resolve the error.
    pub fn is_user_error(&self) -> bool {
        matches!(self, PipelineError::Validation(_))
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, PipelineError::Attribution(e) if e.is_invariant_violation())
    }
}

/// Everything a renderer needs for one subject.
#[derive(Debug, Clone, Serialize)]
pub struct RiskReport {
    pub prediction: Prediction,
    pub explanation: Explanation,
    pub summary: ExplanationSummary,
}

#[derive(Debug)]
pub struct RiskPipeline {
    schema: Arc<FeatureSchema>,
    predictor: PredictionService,
    engine: AttributionEngine,
    summarizer: ExplanationSummarizer,
}

impl RiskPipeline {
    pub fn new(
        schema: Arc<FeatureSchema>,
        model: Arc<dyn ScoreModel>,
        attributor: Box<dyn Attributor>,
        summarizer: ExplanationSummarizer,
        sum_tolerance: f64,
    ) -> Result<Self, SetupError> {
        if model.feature_count() != schema.feature_count() {
            return Err(SetupError::ShapeMismatch {
                schema_features: schema.feature_count(),
                model_features: model.feature_count(),
            });
        }
        if let Some(model_names) = model.feature_names() {
            let mismatched = schema
                .names()
                .zip(model_names)
                .filter(|(schema_name, model_name)| schema_name != model_name)
                .count();
            if mismatched > 0 {
                log::warn!(
                    "{mismatched} model feature names differ from the schema; inputs are aligned by position"
                );
            }
        }
        log::info!(
            "Pipeline ready: {} features, {}, {} attribution, top {}",
            schema.feature_count(),
            model.describe(),
            attributor.name(),
            summarizer.top_k()
        );

        let engine = AttributionEngine::new(schema.clone(), model.clone(), attributor, sum_tolerance);
        Ok(Self {
            schema,
            predictor: PredictionService::new(model),
            engine,
            summarizer,
        })
    }

    /// Loads schema and tree ensemble from the configured paths and explains with
    /// TreeSHAP.
    pub fn from_config(config: &RunConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let schema = Arc::new(FeatureSchema::load(config.schema_path()?)?);
        let model = ensemble::load_model(config.model_path()?, config.model_format)?;
        Self::new(
            schema,
            Arc::new(model),
            Box::new(TreeShap::new()),
            ExplanationSummarizer::new(config.top_k()?)?,
            config.sum_tolerance,
        )
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn run(&self, raw: &RawRecord) -> Result<RiskReport, PipelineError> {
        let vector = assemble(&self.schema, raw)
            .inspect_err(|e| log::info!("Rejected input record: {e}"))?;
        let prediction = self
            .predictor
            .predict(&vector)
            .inspect_err(|e| log::error!("Prediction failed: {e}"))?;
        let explanation = self
            .engine
            .explain(&prediction.vector, prediction.score)
            .inspect_err(|e| log::error!("Attribution failed: {e}"))?;
        let summary = self.summarizer.summarize(&explanation);
        Ok(RiskReport {
            prediction,
            explanation,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{RegressionTree, TreeEnsemble, TreeNode};
    use crate::record::RawValue;
    use crate::schema::{Category, Feature};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn pipeline_is_shareable_across_threads() {
        assert_send_sync::<RiskPipeline>();
    }

    fn pipeline() -> RiskPipeline {
        let schema = FeatureSchema::new(vec![
            Feature::numeric("age", 18.0, 42.0, 18.0).unwrap(),
            Feature::categorical(
                "sleep",
                vec![Category::new(0, "good"), Category::new(1, "poor")],
                None,
            )
            .unwrap(),
        ])
        .unwrap();
        let tree = RegressionTree::new(vec![
            TreeNode::Split {
                feature: 1,
                threshold: 0.5,
                left: 1,
                right: 2,
                cover: 10.0,
            },
            TreeNode::Leaf {
                value: 1.0,
                cover: 7.0,
            },
            TreeNode::Leaf {
                value: 5.0,
                cover: 3.0,
            },
        ]);
        RiskPipeline::new(
            Arc::new(schema),
            Arc::new(TreeEnsemble::new(2, 0.0, vec![tree]).unwrap()),
            Box::new(TreeShap::new()),
            ExplanationSummarizer::new(1).unwrap(),
            1e-6,
        )
        .unwrap()
    }

    #[test]
    fn runs_end_to_end() {
        let pipeline = pipeline();
        let mut raw = pipeline.schema().default_record();
        raw.insert("sleep".into(), RawValue::Text("poor".into()));
        let report = pipeline.run(&raw).unwrap();
        assert_eq!(report.prediction.score, 5.0);
        assert_eq!(report.summary.entries[0].label(), "sleep");
        assert!((report.summary.entries[0].value() - 2.8).abs() < 1e-12);
        assert!((report.summary.reconstructed_score() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn debug_output_names_the_components() {
        let debug = format!("{:?}", pipeline());
        assert!(debug.contains("RiskPipeline"), "{debug}");
        assert!(debug.contains("tree ensemble (1 trees"), "{debug}");
        assert!(debug.contains("TreeSHAP"), "{debug}");
    }

    #[test]
    fn overflowing_model_reports_the_cause() {
        let schema = FeatureSchema::new(vec![Feature::numeric("age", 18.0, 42.0, 18.0).unwrap()]).unwrap();
        let huge = || {
            RegressionTree::new(vec![TreeNode::Leaf {
                value: 1e308,
                cover: 1.0,
            }])
        };
        let pipeline = RiskPipeline::new(
            Arc::new(schema),
            Arc::new(TreeEnsemble::new(1, 0.0, vec![huge(), huge()]).unwrap()),
            Box::new(TreeShap::new()),
            ExplanationSummarizer::default(),
            1e-6,
        )
        .unwrap();
        let err = pipeline.run(&pipeline.schema().default_record()).unwrap_err();
        assert!(!err.is_user_error());
        assert!(err.to_string().contains("non-finite output (inf)"), "{err}");
    }

    #[test]
    fn validation_errors_are_user_errors() {
        let pipeline = pipeline();
        let mut raw = pipeline.schema().default_record();
        raw.insert("age".into(), RawValue::Number(50.0));
        let err = pipeline.run(&raw).unwrap_err();
        assert!(err.is_user_error());
        assert!(!err.is_invariant_violation());
    }

    #[test]
    fn mismatched_model_width_fails_setup() {
        let schema = FeatureSchema::new(vec![Feature::numeric("age", 18.0, 42.0, 18.0).unwrap()]).unwrap();
        let model = TreeEnsemble::new(3, 0.0, vec![RegressionTree::new(vec![TreeNode::Leaf {
            value: 1.0,
            cover: 1.0,
        }])])
        .unwrap();
        let result = RiskPipeline::new(
            Arc::new(schema),
            Arc::new(model),
            Box::new(TreeShap::new()),
            ExplanationSummarizer::default(),
            1e-6,
        );
        assert!(matches!(
            result,
            Err(SetupError::ShapeMismatch {
                schema_features: 1,
                model_features: 3
            })
        ));
    }
}
