use approx::assert_abs_diff_eq;
use std::fs;
use tempfile::tempdir;

use sundial::config::{ConfigError, RunConfig};
use sundial::ensemble::{self, ModelFormat, RegressionTree, ScoreModel, TreeEnsemble, TreeNode};
use sundial::record::{load_record, parse_toml_record, to_toml_string};
use sundial::schema::FeatureSchema;
use sundial::types::FeatureVector;
use sundial::{RiskPipeline, SetupError};

const SCHEMA: &str = r#"
[[feature]]
name = "age"
kind = "numeric"
min = 18
max = 42

[[feature]]
name = "pain"
display_name = "Intrapartum pain"
kind = "numeric"
min = 0
max = 10
default = 2

[[feature]]
name = "sleep_quality"
kind = "categorical"
categories = [
  { code = 0, label = "very good" },
  { code = 1, label = "fairly good" },
  { code = 2, label = "fairly poor" },
  { code = 3, label = "very poor" },
]
"#;

fn small_ensemble() -> TreeEnsemble {
    let tree = RegressionTree::new(vec![
        TreeNode::Split {
            feature: 2,
            threshold: 1.5,
            left: 1,
            right: 2,
            cover: 90.0,
        },
        TreeNode::Split {
            feature: 1,
            threshold: 6.5,
            left: 3,
            right: 4,
            cover: 60.0,
        },
        TreeNode::Leaf {
            value: 9.0,
            cover: 30.0,
        },
        TreeNode::Leaf {
            value: 1.0,
            cover: 45.0,
        },
        TreeNode::Leaf {
            value: 4.0,
            cover: 15.0,
        },
    ]);
    TreeEnsemble::new(3, 10.0, vec![tree])
        .unwrap()
        .with_feature_names(vec!["age".into(), "pain".into(), "sleep_quality".into()])
        .unwrap()
}

#[test]
fn config_file_drives_the_pipeline() {
    let dir = tempdir().unwrap();
    let schema_path = dir.path().join("schema.toml");
    let model_path = dir.path().join("model.toml");
    fs::write(&schema_path, SCHEMA).unwrap();
    small_ensemble().save(&model_path).unwrap();

    let config_path = dir.path().join("run.toml");
    fs::write(
        &config_path,
        format!(
            "schema = {:?}\nmodel = {:?}\ntop_k = 1\n",
            schema_path.to_str().unwrap(),
            model_path.to_str().unwrap()
        ),
    )
    .unwrap();

    let config = RunConfig::load(&config_path).unwrap();
    assert_eq!(config.top_k().unwrap(), 1);
    let pipeline = RiskPipeline::from_config(&config).unwrap();

    let record_path = dir.path().join("subject.tsv");
    fs::write(&record_path, "feature\tvalue\nage\t29\npain\t8\nsleep_quality\tfairly good\n").unwrap();
    let record = load_record(&record_path).unwrap();
    let report = pipeline.run(&record).unwrap();

    assert_eq!(report.prediction.score, 14.0);
    assert_eq!(report.summary.entries.len(), 2);
    assert_eq!(report.summary.entries[0].label(), "sleep_quality");
    assert_abs_diff_eq!(report.summary.reconstructed_score(), 14.0, epsilon = 1e-12);
}

#[test]
fn template_round_trips_through_the_schema() {
    let schema = FeatureSchema::from_toml_str(SCHEMA).unwrap();
    let text = to_toml_string(&schema.default_record()).unwrap();
    let record = parse_toml_record(&text).unwrap();

    let pipeline = RiskPipeline::new(
        std::sync::Arc::new(schema),
        std::sync::Arc::new(small_ensemble()),
        Box::new(sundial::explain::TreeShap::new()),
        sundial::explain::ExplanationSummarizer::default(),
        1e-6,
    )
    .unwrap();
    let report = pipeline.run(&record).unwrap();
    assert_eq!(report.prediction.vector.as_slice(), &[18.0, 2.0, 0.0]);
    assert_eq!(report.prediction.score, 11.0);
}

#[test]
fn missing_paths_and_bad_values_are_configuration_errors() {
    let err = RiskPipeline::from_config(&RunConfig::default()).unwrap_err();
    assert!(matches!(err, SetupError::Config(ConfigError::MissingPath("schema"))));

    let config = RunConfig {
        top_k: 0,
        ..RunConfig::default()
    };
    let err = RiskPipeline::from_config(&config).unwrap_err();
    assert!(matches!(err, SetupError::Config(ConfigError::InvalidTopK(0))));

    assert!(matches!(
        RunConfig::from_toml_str("top_k = 5\nunknown = true\n"),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn model_wider_than_schema_is_fatal_at_startup() {
    let dir = tempdir().unwrap();
    let schema_path = dir.path().join("schema.toml");
    let model_path = dir.path().join("model.toml");
    fs::write(&schema_path, "[[feature]]\nname = \"age\"\nkind = \"numeric\"\nmin = 18\nmax = 42\n")
        .unwrap();
    small_ensemble().save(&model_path).unwrap();

    let config = RunConfig {
        schema: Some(schema_path),
        model: Some(model_path),
        ..RunConfig::default()
    };
    let err = RiskPipeline::from_config(&config).unwrap_err();
    assert!(matches!(
        err,
        SetupError::ShapeMismatch {
            schema_features: 1,
            model_features: 3
        }
    ));
}

#[test]
fn lightgbm_dump_loads_through_the_model_format_switch() {
    let dump = serde_json::json!({
        "name": "tree",
        "version": "v4",
        "num_class": 1,
        "num_tree_per_iteration": 1,
        "label_index": 0,
        "max_feature_idx": 2,
        "objective": "regression",
        "average_output": false,
        "feature_names": ["age", "pain", "sleep_quality"],
        "tree_info": [{
            "tree_index": 0,
            "num_leaves": 2,
            "shrinkage": 1,
            "tree_structure": {
                "split_index": 0,
                "split_feature": 2,
                "threshold": 1.5,
                "decision_type": "<=",
                "default_left": true,
                "missing_type": "None",
                "internal_count": 90,
                "left_child": { "leaf_index": 0, "leaf_value": 12.0, "leaf_count": 60 },
                "right_child": { "leaf_index": 1, "leaf_value": 18.0, "leaf_count": 30 }
            }
        }]
    });
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.json");
    fs::write(&path, serde_json::to_string_pretty(&dump).unwrap()).unwrap();

    let model = ensemble::load_model(&path, ModelFormat::Lightgbm).unwrap();
    assert_eq!(model.feature_count(), 3);
    assert_abs_diff_eq!(model.expected_value(), 14.0, epsilon = 1e-12);
    let score = model.score(&FeatureVector::from(vec![30.0, 5.0, 3.0])).unwrap();
    assert_eq!(score, 18.0);

    // The native loader refuses the same file.
    assert!(ensemble::load_model(&path, ModelFormat::Native).is_err());
}
