use crate::record::RawRecord;
use crate::schema::{FeatureSchema, ValidationError};
use crate::types::FeatureVector;
use ndarray::Array1;

/// Validates a raw record against `schema` and lays the normalized values out in
/// schema order.
///
/// Keys the schema does not know are ignored. The first missing or invalid feature
/// aborts assembly; no partial vector is ever returned.
pub fn assemble(schema: &FeatureSchema, raw: &RawRecord) -> Result<FeatureVector, ValidationError> {
    let mut values = Array1::zeros(schema.feature_count());
    for (position, feature) in schema.features().iter().enumerate() {
        let value = raw
            .get(feature.name())
            .ok_or_else(|| ValidationError::MissingFeature {
                feature: feature.name().to_string(),
            })?;
        values[position] = feature.validate(value)?;
    }

    let ignored = raw
        .keys()
        .filter(|name| schema.index_of(name).is_none())
        .count();
    if ignored > 0 {
        log::debug!("Ignored {ignored} input keys that are not schema features");
    }

    Ok(FeatureVector::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RawValue;
    use crate::schema::{Category, Feature};

    fn schema() -> FeatureSchema {
        FeatureSchema::new(vec![
            Feature::numeric("age", 18.0, 42.0, 18.0).unwrap(),
            Feature::categorical(
                "delivery",
                vec![
                    Category::new(0, "cesarean"),
                    Category::new(1, "converted"),
                    Category::new(2, "vaginal"),
                ],
                None,
            )
            .unwrap(),
            Feature::numeric("pain", 0.0, 10.0, 0.0).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn assembles_in_schema_order() {
        let schema = schema();
        let mut raw = schema.default_record();
        raw.insert("age".into(), RawValue::Number(30.0));
        raw.insert("delivery".into(), RawValue::Text("vaginal".into()));
        let vector = assemble(&schema, &raw).unwrap();
        assert_eq!(vector.as_slice(), &[30.0, 2.0, 0.0]);
    }

    #[test]
    fn extra_keys_are_ignored() {
        let schema = schema();
        let mut raw = schema.default_record();
        raw.insert("shoe_size".into(), RawValue::Number(38.0));
        assert!(assemble(&schema, &raw).is_ok());
    }

    #[test]
    fn each_missing_feature_is_named() {
        let schema = schema();
        for name in schema.names() {
            let mut raw = schema.default_record();
            raw.remove(name);
            assert_eq!(
                assemble(&schema, &raw),
                Err(ValidationError::MissingFeature {
                    feature: name.to_string()
                })
            );
        }
    }

    #[test]
    fn first_invalid_feature_fails_fast() {
        let schema = schema();
        let mut raw = schema.default_record();
        raw.insert("delivery".into(), RawValue::Text("forceps".into()));
        raw.insert("pain".into(), RawValue::Number(11.0));
        let err = assemble(&schema, &raw).unwrap_err();
        assert_eq!(err.feature(), "delivery");
        assert!(matches!(err, ValidationError::InvalidCategory { .. }));
    }
}
