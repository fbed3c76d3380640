use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Most matches a rerank answer may carry
pub const MAX_MATCHES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RerankMatch {
    #[serde(alias = "ItemName", alias = "item_name")]
    pub item_name: String,
    /// 0.0 (unrelated) to 1.0 (same product)
    #[serde(alias = "Similarity")]
    pub similarity: f32,
}

/// An answer without a `matches` list is malformed, only a bare `null`
/// stands for "nothing relevant".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RerankResult {
    #[serde(default, alias = "TargetProduct", alias = "target_product")]
    pub target_product: String,
    #[serde(alias = "found_objects")]
    pub matches: Vec<RerankMatch>,
}

impl RerankResult {
    /// The explicit "nothing relevant" answer.
    pub fn empty(target: &str) -> Self {
        Self {
            target_product: target.to_string(),
            matches: vec![],
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.matches.len() > MAX_MATCHES {
            return Err(format!(
                "{} matches returned, at most {} allowed",
                self.matches.len(),
                MAX_MATCHES
            ));
        }

        for (idx, m) in self.matches.iter().enumerate() {
            if m.item_name.trim().is_empty() {
                return Err(format!("match {} has an empty itemName", idx + 1));
            }
            if !m.similarity.is_finite() || !(0.0..=1.0).contains(&m.similarity) {
                return Err(format!(
                    "match '{}' has similarity {}, expected a number between 0 and 1",
                    m.item_name, m.similarity
                ));
            }
        }

        Ok(())
    }

    /// JSON shape of the answer with each value replaced by its type name,
    /// derived from the serialized form so it always follows the struct.
    pub fn schema() -> Value {
        let sample = RerankResult {
            target_product: String::new(),
            matches: vec![RerankMatch {
                item_name: String::new(),
                similarity: 0.0,
            }],
        };

        // serializing a plain struct of strings and floats cannot fail
        let value = serde_json::to_value(sample).unwrap_or(Value::Null);
        describe(&value)
    }
}

fn describe(value: &Value) -> Value {
    match value {
        Value::Null => Value::from("null"),
        Value::Bool(_) => Value::from("boolean"),
        Value::Number(_) => Value::from("number"),
        Value::String(_) => Value::from("string"),
        Value::Array(items) => Value::Array(items.iter().take(1).map(describe).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), describe(value)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result_with(matches: usize, similarity: f32) -> RerankResult {
        RerankResult {
            target_product: "papel toalha".into(),
            matches: (0..matches)
                .map(|i| RerankMatch {
                    item_name: format!("item {i}"),
                    similarity,
                })
                .collect(),
        }
    }

    #[test]
    fn test_schema_follows_struct() {
        assert_eq!(
            RerankResult::schema(),
            json!({
                "targetProduct": "string",
                "matches": [{ "itemName": "string", "similarity": "number" }]
            })
        );
    }

    #[test]
    fn test_validate_bounds() {
        assert!(result_with(0, 0.5).validate().is_ok());
        assert!(result_with(3, 1.0).validate().is_ok());
        assert!(result_with(4, 0.5).validate().is_err());
        assert!(result_with(1, 1.5).validate().is_err());
        assert!(result_with(1, -0.1).validate().is_err());
        assert!(result_with(1, f32::NAN).validate().is_err());
    }

    #[test]
    fn test_blank_item_name_is_rejected() {
        let mut result = result_with(1, 0.5);
        result.matches[0].item_name = " ".into();
        assert!(result.validate().is_err());
    }

    #[test]
    fn test_accepts_legacy_field_names() {
        let parsed: RerankResult = serde_json::from_value(json!({
            "TargetProduct": "papel",
            "found_objects": [{ "ItemName": "Papel Toalha 200m", "Similarity": 0.9 }]
        }))
        .unwrap();

        assert_eq!(parsed.target_product, "papel");
        assert_eq!(parsed.matches[0].item_name, "Papel Toalha 200m");
    }

    #[test]
    fn test_serializes_camel_case() {
        let value = serde_json::to_value(result_with(1, 0.5)).unwrap();
        assert_eq!(
            value,
            json!({
                "targetProduct": "papel toalha",
                "matches": [{ "itemName": "item 0", "similarity": 0.5 }]
            })
        );
    }
}
