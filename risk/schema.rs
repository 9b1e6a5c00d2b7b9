//! # Feature Schema
//!
//! The declarative description of every model input: its stable name, its kind and
//! the domain its values must come from. The order of features in a schema is the
//! column order the model was trained on and is never re-sorted.
//!
//! A schema is read once at startup from a TOML document of `[[feature]]` tables.
//! Anything malformed in that document is a `SchemaError` and stops startup; after
//! construction the schema is immutable and shared read-only by every request.
//!
//! Categorical features carry an explicit integer `code` per category. That code is
//! the value the model was trained on, and it is what every admissible raw value
//! (the code itself, its decimal text, or the category label) normalizes to.

use crate::record::{RawRecord, RawValue};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Label of the synthetic summary entry aggregating features outside the top-K.
/// No schema feature may use it as a name.
pub const REMAINDER_LABEL: &str = "(other features)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Numeric,
    Categorical,
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureKind::Numeric => write!(f, "numeric"),
            FeatureKind::Categorical => write!(f, "categorical"),
        }
    }
}

/// One admissible categorical value: the model-facing code, its human label, and any
/// other spellings an input record may use for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Category {
    pub code: i64,
    pub label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl Category {
    pub fn new(code: i64, label: impl Into<String>) -> Self {
        Self {
            code,
            label: label.into(),
            aliases: Vec::new(),
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    /// The label followed by every alias.
    pub fn spellings(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.label.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    pub fn answers_to(&self, text: &str) -> bool {
        self.spellings().any(|spelling| spelling == text)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    /// Inclusive range `[min, max]` with `min <= default <= max`.
    Numeric { min: f64, max: f64, default: f64 },
    /// Non-empty ordered set of categories; `default` indexes into `categories`.
    Categorical {
        categories: Vec<Category>,
        default: usize,
    },
}

/// Errors in the static schema configuration. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to read schema file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML schema file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("The schema declares no features.")]
    Empty,
    #[error("Feature #{position} has an empty name.")]
    EmptyName { position: usize },
    #[error("Feature name '{0}' is declared more than once.")]
    DuplicateName(String),
    #[error("Feature name '{0}' is reserved for the aggregated summary entry.")]
    ReservedName(String),
    #[error("Numeric feature '{feature}' is missing its '{bound}' bound.")]
    MissingBound {
        feature: String,
        bound: &'static str,
    },
    #[error("Numeric feature '{feature}' has non-finite bounds [{min}, {max}].")]
    NonFiniteBound { feature: String, min: f64, max: f64 },
    #[error("Numeric feature '{feature}' has min {min} greater than max {max}.")]
    InvalidRange { feature: String, min: f64, max: f64 },
    #[error("Numeric feature '{feature}' has default {default} outside [{min}, {max}].")]
    DefaultOutOfRange {
        feature: String,
        default: f64,
        min: f64,
        max: f64,
    },
    #[error("Feature '{feature}' has an inadmissible default: {reason}")]
    InvalidDefault { feature: String, reason: String },
    #[error("Categorical feature '{feature}' declares no categories.")]
    EmptyCategories { feature: String },
    #[error("Categorical feature '{feature}' declares code {code} more than once.")]
    DuplicateCode { feature: String, code: i64 },
    #[error("Categorical feature '{feature}' declares label '{label}' more than once.")]
    DuplicateLabel { feature: String, label: String },
    #[error("Feature '{feature}' is {kind} but sets '{key}', which only applies to the other kind.")]
    MisplacedKey {
        feature: String,
        kind: FeatureKind,
        key: &'static str,
    },
}

/// A raw value that does not fit its feature. Recoverable by re-prompting for input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Required feature '{feature}' is missing from the input record.")]
    MissingFeature { feature: String },
    #[error("Feature '{feature}' value {value} is outside the admissible range [{min}, {max}].")]
    OutOfRange {
        feature: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Feature '{feature}' expects a finite number in [{min}, {max}], but received '{raw}'.")]
    TypeMismatch {
        feature: String,
        raw: String,
        min: f64,
        max: f64,
    },
    #[error(
        "Feature '{feature}' received '{raw}', which is not an admissible category. Expected one of: {}",
        .admissible.join(", ")
    )]
    InvalidCategory {
        feature: String,
        raw: String,
        admissible: Vec<String>,
    },
}

impl ValidationError {
    /// Name of the offending feature.
    pub fn feature(&self) -> &str {
        match self {
            ValidationError::MissingFeature { feature }
            | ValidationError::OutOfRange { feature, .. }
            | ValidationError::TypeMismatch { feature, .. }
            | ValidationError::InvalidCategory { feature, .. } => feature,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    name: String,
    display_name: Option<String>,
    domain: Domain,
}

impl Feature {
    /// A numeric feature on the inclusive range `[min, max]`.
    pub fn numeric(
        name: impl Into<String>,
        min: f64,
        max: f64,
        default: f64,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        if !min.is_finite() || !max.is_finite() {
            return Err(SchemaError::NonFiniteBound { feature: name, min, max });
        }
        if min > max {
            return Err(SchemaError::InvalidRange { feature: name, min, max });
        }
        if !(min..=max).contains(&default) {
            return Err(SchemaError::DefaultOutOfRange {
                feature: name,
                default,
                min,
                max,
            });
        }
        Ok(Self {
            name,
            display_name: None,
            domain: Domain::Numeric { min, max, default },
        })
    }

    /// A categorical feature. `default` indexes into `categories`; the first category
    /// is the default when none is given.
    pub fn categorical(
        name: impl Into<String>,
        categories: Vec<Category>,
        default: Option<usize>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        if categories.is_empty() {
            return Err(SchemaError::EmptyCategories { feature: name });
        }
        let mut codes = HashSet::with_capacity(categories.len());
        let mut labels = HashSet::with_capacity(categories.len());
        for category in &categories {
            if !codes.insert(category.code) {
                return Err(SchemaError::DuplicateCode {
                    feature: name,
                    code: category.code,
                });
            }
            // Aliases share the label namespace so a spelling resolves to one code.
            if let Some(label) = category.spellings().find(|spelling| !labels.insert(*spelling)) {
                return Err(SchemaError::DuplicateLabel {
                    feature: name,
                    label: label.to_string(),
                });
            }
        }
        let default = default.unwrap_or(0);
        if default >= categories.len() {
            return Err(SchemaError::InvalidDefault {
                feature: name,
                reason: format!(
                    "category index {default} but only {} categories exist",
                    categories.len()
                ),
            });
        }
        Ok(Self {
            name,
            display_name: None,
            domain: Domain::Categorical {
                categories,
                default,
            },
        })
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Presentation label; falls back to the stable name.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn kind(&self) -> FeatureKind {
        match self.domain {
            Domain::Numeric { .. } => FeatureKind::Numeric,
            Domain::Categorical { .. } => FeatureKind::Categorical,
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The raw value an input form would be pre-filled with.
    pub fn default_raw(&self) -> RawValue {
        match &self.domain {
            Domain::Numeric { default, .. } => RawValue::Number(*default),
            Domain::Categorical {
                categories,
                default,
            } => RawValue::Text(categories[*default].label.clone()),
        }
    }

    /// Human-readable description of the domain, e.g. `[18, 42]` or `0 (no), 1 (yes)`.
    pub fn describe_domain(&self) -> String {
        match &self.domain {
            Domain::Numeric { min, max, .. } => format!("[{min}, {max}]"),
            Domain::Categorical { categories, .. } => categories
                .iter()
                .map(Category::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Checks a raw value against this feature's domain and returns the model-facing
    /// number. Pure; the same input always yields the same result.
    pub fn validate(&self, raw: &RawValue) -> Result<f64, ValidationError> {
        match &self.domain {
            Domain::Numeric { min, max, .. } => self.validate_numeric(raw, *min, *max),
            Domain::Categorical { categories, .. } => self.validate_categorical(raw, categories),
        }
    }

    fn validate_numeric(&self, raw: &RawValue, min: f64, max: f64) -> Result<f64, ValidationError> {
        let mismatch = || ValidationError::TypeMismatch {
            feature: self.name.clone(),
            raw: raw.to_string(),
            min,
            max,
        };
        let value = match raw {
            RawValue::Number(value) => *value,
            RawValue::Text(text) => text.trim().parse::<f64>().map_err(|_| mismatch())?,
        };
        if !value.is_finite() {
            return Err(mismatch());
        }
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                feature: self.name.clone(),
                value,
                min,
                max,
            });
        }
        Ok(value)
    }

    fn validate_categorical(
        &self,
        raw: &RawValue,
        categories: &[Category],
    ) -> Result<f64, ValidationError> {
        let matched = match raw {
            RawValue::Number(value) => categories.iter().find(|c| c.code as f64 == *value),
            RawValue::Text(text) => categories.iter().find(|c| c.answers_to(text)).or_else(|| {
                text.trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(|value| categories.iter().find(|c| c.code as f64 == value))
            }),
        };
        matched
            .map(|category| category.code as f64)
            .ok_or_else(|| ValidationError::InvalidCategory {
                feature: self.name.clone(),
                raw: raw.to_string(),
                admissible: categories.iter().map(Category::to_string).collect(),
            })
    }
}

/// The ordered, immutable set of model features.
#[derive(Debug, Clone)]
pub struct FeatureSchema {
    features: Vec<Feature>,
    index: AHashMap<String, usize>,
}

impl FeatureSchema {
    /// Builds a schema from features already in model column order.
    pub fn new(features: Vec<Feature>) -> Result<Self, SchemaError> {
        if features.is_empty() {
            return Err(SchemaError::Empty);
        }
        let mut index = AHashMap::with_capacity(features.len());
        for (position, feature) in features.iter().enumerate() {
            if feature.name.trim().is_empty() {
                return Err(SchemaError::EmptyName { position });
            }
            if feature.name == REMAINDER_LABEL {
                return Err(SchemaError::ReservedName(feature.name.clone()));
            }
            if index.insert(feature.name.clone(), position).is_some() {
                return Err(SchemaError::DuplicateName(feature.name.clone()));
            }
        }
        Ok(Self { features, index })
    }

    /// Reads and validates a TOML schema file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SchemaError> {
        let file: internal::SchemaFile = toml::from_str(text)?;
        let features = file
            .features
            .into_iter()
            .map(internal::FeatureConfig::into_feature)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(features)
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    pub fn feature_at(&self, index: usize) -> Option<&Feature> {
        self.features.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(Feature::name)
    }

    /// Validates `raw` against the named feature. An unknown name is reported as a
    /// missing feature, since no schema entry could accept it.
    pub fn validate(&self, name: &str, raw: &RawValue) -> Result<f64, ValidationError> {
        let feature = self
            .index_of(name)
            .map(|i| &self.features[i])
            .ok_or_else(|| ValidationError::MissingFeature {
                feature: name.to_string(),
            })?;
        feature.validate(raw)
    }

    /// A complete record with every feature at its default.
    pub fn default_record(&self) -> RawRecord {
        self.features
            .iter()
            .map(|f| (f.name.clone(), f.default_raw()))
            .collect()
    }
}

/// Deserialization shapes for the TOML schema file.
mod internal {
    use super::*;

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct SchemaFile {
        #[serde(rename = "feature", default)]
        pub features: Vec<FeatureConfig>,
    }

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct FeatureConfig {
        name: String,
        display_name: Option<String>,
        kind: FeatureKind,
        min: Option<f64>,
        max: Option<f64>,
        default: Option<RawValue>,
        categories: Option<Vec<Category>>,
    }

    impl FeatureConfig {
        pub(super) fn into_feature(self) -> Result<Feature, SchemaError> {
            let feature = match self.kind {
                FeatureKind::Numeric => {
                    if self.categories.is_some() {
                        return Err(self.misplaced("categories"));
                    }
                    let min = self.min.ok_or_else(|| SchemaError::MissingBound {
                        feature: self.name.clone(),
                        bound: "min",
                    })?;
                    let max = self.max.ok_or_else(|| SchemaError::MissingBound {
                        feature: self.name.clone(),
                        bound: "max",
                    })?;
                    let default = match &self.default {
                        None => min,
                        Some(RawValue::Number(value)) => *value,
                        Some(RawValue::Text(text)) => {
                            return Err(SchemaError::InvalidDefault {
                                feature: self.name.clone(),
                                reason: format!("'{text}' is not a number"),
                            });
                        }
                    };
                    Feature::numeric(self.name.clone(), min, max, default)?
                }
                FeatureKind::Categorical => {
                    if self.min.is_some() {
                        return Err(self.misplaced("min"));
                    }
                    if self.max.is_some() {
                        return Err(self.misplaced("max"));
                    }
                    let categories = self.categories.clone().unwrap_or_default();
                    // Resolve the default through a provisional feature so that it obeys
                    // exactly the same admissibility rules as request input.
                    let provisional =
                        Feature::categorical(self.name.clone(), categories.clone(), None)?;
                    let default = match &self.default {
                        None => None,
                        Some(raw) => Some(self.default_position(&provisional, &categories, raw)?),
                    };
                    Feature::categorical(self.name.clone(), categories, default)?
                }
            };
            Ok(match self.display_name {
                Some(display_name) => feature.with_display_name(display_name),
                None => feature,
            })
        }

        fn default_position(
            &self,
            provisional: &Feature,
            categories: &[Category],
            raw: &RawValue,
        ) -> Result<usize, SchemaError> {
            let code = provisional
                .validate(raw)
                .map_err(|e| SchemaError::InvalidDefault {
                    feature: self.name.clone(),
                    reason: e.to_string(),
                })?;
            categories
                .iter()
                .position(|c| c.code as f64 == code)
                .ok_or_else(|| SchemaError::InvalidDefault {
                    feature: self.name.clone(),
                    reason: format!("code {code} does not resolve to a category"),
                })
        }

        fn misplaced(&self, key: &'static str) -> SchemaError {
            SchemaError::MisplacedKey {
                feature: self.name.clone(),
                kind: self.kind,
                key,
            }
        }
    }
}
