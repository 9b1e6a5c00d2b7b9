#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod assemble;
pub mod config;
pub mod pipeline;
pub mod predict;
pub mod record;
pub mod schema;
pub mod types;

#[path = "../ensemble/mod.rs"]
pub mod ensemble;

#[path = "../explain/mod.rs"]
pub mod explain;

pub use pipeline::{PipelineError, RiskPipeline, RiskReport, SetupError};
