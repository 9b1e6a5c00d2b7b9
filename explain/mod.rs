//! Additive attribution of a single prediction and its ranked summary.

pub mod engine;
pub mod summary;
pub mod treeshap;

pub use engine::{
    AttributionEngine, AttributionError, Attributor, DEFAULT_SUM_TOLERANCE, RawAttribution,
    check_sum_law,
};
pub use summary::{DEFAULT_TOP_K, ExplanationSummarizer, ExplanationSummary, SummaryEntry};
pub use treeshap::TreeShap;
