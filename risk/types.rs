use ndarray::{Array1, ArrayView1};
use serde::{Serialize, Serializer};
use std::ops::Deref;

/// The validated numeric encoding of one subject, aligned to schema order.
///
/// Only the assembler builds these from raw input; once built the values are never
/// mutated, so there is no `DerefMut`.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureVector(Array1<f64>);

impl FeatureVector {
    /// Copies non-contiguous or reversed arrays into standard layout, so `as_slice`
    /// always sees every element.
    pub fn new(values: Array1<f64>) -> Self {
        if values.is_standard_layout() {
            Self(values)
        } else {
            Self(values.as_standard_layout().into_owned())
        }
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }

    pub fn as_slice(&self) -> &[f64] {
        // `new` normalizes the layout, so this never falls back.
        self.0.as_slice().unwrap_or(&[])
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }
}

impl Deref for FeatureVector {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<f64>> for FeatureVector {
    fn from(values: Vec<f64>) -> Self {
        Self(Array1::from(values))
    }
}

impl From<Array1<f64>> for FeatureVector {
    fn from(values: Array1<f64>) -> Self {
        Self::new(values)
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

/// A single model output together with the vector it was computed from.
#[derive(Clone, Debug, Serialize)]
pub struct Prediction {
    pub score: f64,
    pub vector: FeatureVector,
}

/// The model's expected output with no feature information.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Baseline(pub f64);

impl Baseline {
    pub fn value(self) -> f64 {
        self.0
    }
}

/// Signed contribution of one feature to one prediction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Attribution {
    pub feature_name: String,
    /// Position of the feature in the schema.
    pub schema_index: usize,
    pub value: f64,
    /// The normalized input value the contribution was computed for.
    pub input_value: f64,
}

/// Baseline plus one attribution per feature, in schema order.
#[derive(Clone, Debug, Serialize)]
pub struct Explanation {
    pub baseline: Baseline,
    pub attributions: Vec<Attribution>,
}

impl Explanation {
    /// `baseline + Σ attribution`; equals the prediction score for an exact method.
    pub fn reconstructed_score(&self) -> f64 {
        self.baseline.0 + self.attributions.iter().map(|a| a.value).sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    #[test]
    fn feature_vector_serializes_as_plain_list() {
        let v = FeatureVector::from(vec![1.0, 2.5]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "[1.0,2.5]");
        assert_eq!(v.as_slice(), &[1.0, 2.5]);
    }

    #[test]
    fn strided_arrays_are_normalized_to_standard_layout() {
        let reversed = Array1::from(vec![0.0, 1.0, 2.0]).slice_move(s![..;-1]);
        assert!(!reversed.is_standard_layout());

        let v = FeatureVector::new(reversed.clone());
        assert_eq!(v.as_slice(), &[2.0, 1.0, 0.0]);
        assert_eq!(FeatureVector::from(reversed).as_slice(), &[2.0, 1.0, 0.0]);

        let every_other = Array1::from(vec![1.0, 9.0, 2.0, 9.0]).slice_move(s![..;2]);
        assert_eq!(FeatureVector::new(every_other).as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn reconstructed_score_adds_baseline() {
        let explanation = Explanation {
            baseline: Baseline(1.0),
            attributions: vec![
                Attribution {
                    feature_name: "a".into(),
                    schema_index: 0,
                    value: 0.5,
                    input_value: 3.0,
                },
                Attribution {
                    feature_name: "b".into(),
                    schema_index: 1,
                    value: -0.25,
                    input_value: 1.0,
                },
            ],
        };
        assert_eq!(explanation.reconstructed_score(), 1.25);
    }
}
