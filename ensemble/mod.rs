//! The trained model capability: an additive ensemble of regression trees, its native
//! TOML artifact, and import from LightGBM model dumps.

pub mod lightgbm;
pub mod model;

pub use model::{ModelError, RegressionTree, ScoreModel, TreeEnsemble, TreeNode};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk format of a model artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// The crate's own TOML ensemble format.
    #[default]
    Native,
    /// JSON written by LightGBM's `Booster.dump_model()`.
    Lightgbm,
}

/// Loads and validates a tree ensemble in the given format.
pub fn load_model(path: impl AsRef<Path>, format: ModelFormat) -> Result<TreeEnsemble, ModelError> {
    let path = path.as_ref();
    log::info!("Loading {format:?} model from {}", path.display());
    match format {
        ModelFormat::Native => TreeEnsemble::load(path),
        ModelFormat::Lightgbm => lightgbm::load_dump(path),
    }
}
