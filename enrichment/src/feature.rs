//! Feature collections as returned by the geodata services.
//!
//! Geometry is passed through untouched. Identifiers live inside `properties`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub geometry: Value,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Map<String, Value>,
    /// `type`, `id` and anything else the service sends along
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Feature {
    /// The textual key stored under `field`, if any.
    pub fn identifier(&self, field: &str) -> Option<String> {
        self.properties.get(field).and_then(key_of)
    }
}

/// Identifiers arrive as strings or numbers depending on the service.
pub fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    /// Reads the `features` array of a decoded body.
    ///
    /// A missing `features` field, or entries that are not features, read as
    /// nothing rather than as an error.
    pub fn from_value(value: &Value) -> Self {
        let features = value
            .get("features")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| match Feature::deserialize(entry) {
                        Ok(feature) => Some(feature),
                        Err(e) => {
                            tracing::debug!("Skipping malformed feature: {e}");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        FeatureCollection { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    /// Identifiers under `field` in collection order, skipping features without one.
    pub fn identifiers(&self, field: &str) -> Vec<String> {
        self.features
            .iter()
            .filter_map(|feature| feature.identifier(field))
            .collect()
    }
}
