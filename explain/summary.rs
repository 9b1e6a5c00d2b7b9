use crate::config::ConfigError;
use crate::schema::REMAINDER_LABEL;
use crate::types::{Attribution, Baseline, Explanation};
use itertools::Itertools;
use serde::Serialize;
use std::cmp::Ordering;

/// How many features a summary shows before aggregating the rest.
pub const DEFAULT_TOP_K: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryEntry {
    Feature(Attribution),
    /// Signed sum of every attribution that did not make the top-K.
    Remainder { value: f64, feature_count: usize },
}

impl SummaryEntry {
    pub fn label(&self) -> &str {
        match self {
            SummaryEntry::Feature(attribution) => &attribution.feature_name,
            SummaryEntry::Remainder { .. } => REMAINDER_LABEL,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            SummaryEntry::Feature(attribution) => attribution.value,
            SummaryEntry::Remainder { value, .. } => *value,
        }
    }

    pub fn is_remainder(&self) -> bool {
        matches!(self, SummaryEntry::Remainder { .. })
    }
}

/// Ranked, bounded view of an explanation, ready for a waterfall-style renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplanationSummary {
    pub baseline: Baseline,
    /// Top-K attributions by descending magnitude, then the remainder entry if any.
    pub entries: Vec<SummaryEntry>,
}

impl ExplanationSummary {
    pub fn ranked(&self) -> impl Iterator<Item = &Attribution> {
        self.entries.iter().filter_map(|entry| match entry {
            SummaryEntry::Feature(attribution) => Some(attribution),
            SummaryEntry::Remainder { .. } => None,
        })
    }

    pub fn remainder(&self) -> Option<&SummaryEntry> {
        self.entries.last().filter(|entry| entry.is_remainder())
    }

    /// Baseline plus every entry; equal to the explained score.
    pub fn reconstructed_score(&self) -> f64 {
        self.baseline.0 + self.entries.iter().map(SummaryEntry::value).sum::<f64>()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExplanationSummarizer {
    top_k: usize,
}

impl ExplanationSummarizer {
    pub fn new(top_k: usize) -> Result<Self, ConfigError> {
        if top_k == 0 {
            return Err(ConfigError::InvalidTopK(0));
        }
        Ok(Self { top_k })
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn summarize(&self, explanation: &Explanation) -> ExplanationSummary {
        self.summarize_parts(explanation.baseline, &explanation.attributions)
    }

    /// Ranks by `|value|` descending, ties broken by schema position, keeps the first
    /// `top_k` and folds everything else into one trailing remainder entry.
    pub fn summarize_parts(
        &self,
        baseline: Baseline,
        attributions: &[Attribution],
    ) -> ExplanationSummary {
        let ranked = attributions
            .iter()
            .sorted_by(|a, b| by_magnitude_then_position(a, b))
            .collect::<Vec<_>>();

        let kept = ranked.len().min(self.top_k);
        let mut entries: Vec<SummaryEntry> = ranked[..kept]
            .iter()
            .map(|&attribution| SummaryEntry::Feature(attribution.clone()))
            .collect();

        let excluded = &ranked[kept..];
        if !excluded.is_empty() {
            entries.push(SummaryEntry::Remainder {
                value: excluded.iter().map(|a| a.value).sum(),
                feature_count: excluded.len(),
            });
        }

        ExplanationSummary { baseline, entries }
    }
}

impl Default for ExplanationSummarizer {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
        }
    }
}

fn by_magnitude_then_position(a: &Attribution, b: &Attribution) -> Ordering {
    b.value
        .abs()
        .total_cmp(&a.value.abs())
        .then_with(|| a.schema_index.cmp(&b.schema_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribution(index: usize, value: f64) -> Attribution {
        Attribution {
            feature_name: format!("f{index}"),
            schema_index: index,
            value,
            input_value: 0.0,
        }
    }

    fn labels(summary: &ExplanationSummary) -> Vec<&str> {
        summary.entries.iter().map(SummaryEntry::label).collect()
    }

    #[test]
    fn zero_top_k_is_a_configuration_error() {
        assert!(matches!(
            ExplanationSummarizer::new(0),
            Err(ConfigError::InvalidTopK(0))
        ));
    }

    #[test]
    fn keeps_top_k_and_aggregates_the_rest_last() {
        let attributions = vec![
            attribution(0, 0.1),
            attribution(1, -2.0),
            attribution(2, 0.05),
            attribution(3, 1.5),
            attribution(4, -0.3),
        ];
        let summary = ExplanationSummarizer::new(2)
            .unwrap()
            .summarize_parts(Baseline(3.0), &attributions);
        assert_eq!(labels(&summary), ["f1", "f3", REMAINDER_LABEL]);
        match summary.remainder() {
            Some(SummaryEntry::Remainder {
                value,
                feature_count,
            }) => {
                assert!((value - (-0.15)).abs() < 1e-12);
                assert_eq!(*feature_count, 3);
            }
            other => panic!("expected a remainder entry, got {other:?}"),
        }
        let full = 3.0 + attributions.iter().map(|a| a.value).sum::<f64>();
        assert!((summary.reconstructed_score() - full).abs() < 1e-12);
    }

    #[test]
    fn remainder_stays_last_even_when_largest() {
        let attributions: Vec<_> = (0..6).map(|i| attribution(i, 1.0)).collect();
        let summary = ExplanationSummarizer::new(1)
            .unwrap()
            .summarize_parts(Baseline(0.0), &attributions);
        assert_eq!(summary.entries.len(), 2);
        assert_eq!(summary.entries[1].value(), 5.0);
        assert!(summary.entries[1].is_remainder());
    }

    #[test]
    fn ties_follow_schema_order() {
        let attributions = vec![
            attribution(0, 0.5),
            attribution(1, -1.0),
            attribution(2, 1.0),
            attribution(3, -0.5),
        ];
        let summarizer = ExplanationSummarizer::new(10).unwrap();
        for _ in 0..5 {
            let summary = summarizer.summarize_parts(Baseline(0.0), &attributions);
            assert_eq!(labels(&summary), ["f1", "f2", "f0", "f3"]);
        }
    }

    #[test]
    fn large_k_returns_the_full_ranked_list() {
        let attributions: Vec<_> = (0..3).map(|i| attribution(i, i as f64)).collect();
        let summary = ExplanationSummarizer::new(50)
            .unwrap()
            .summarize_parts(Baseline(1.0), &attributions);
        assert!(summary.remainder().is_none());
        assert_eq!(summary.ranked().count(), 3);
        assert_eq!(labels(&summary), ["f2", "f1", "f0"]);
    }
}
