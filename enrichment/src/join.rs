//! Attribute joins between feature collections.
//!
//! Address objects reference their building through `pandidentificatie`, which
//! matches the building's own `identificatie`. The index side is keyed by its own
//! identifier; the primary side is read through the cross-reference field.

use crate::config::{AttachMode, MatchPolicy};
use crate::feature::{Feature, FeatureCollection, key_of};
use crate::throttle::{Enrichment, EnrichmentResult};
use serde_json::Value;
use std::collections::HashMap;

/// A feature after joining
pub type MergedRecord = Feature;

/// What a hit copies from the index feature onto the record
#[derive(Debug, Clone, PartialEq)]
pub enum Attach {
    Geometry,
    /// Properties of the matched feature under the given property name
    Properties(String),
}

impl Attach {
    pub fn new(mode: AttachMode, name: &str) -> Self {
        match mode {
            AttachMode::Geometry => Attach::Geometry,
            AttachMode::Properties => Attach::Properties(name.to_string()),
        }
    }
}

/// Maps `key_field` values to their features. Features without the key are
/// skipped and the last feature wins on duplicate keys.
pub fn build_index<'a>(
    collection: &'a FeatureCollection,
    key_field: &str,
) -> HashMap<String, &'a Feature> {
    let mut index = HashMap::with_capacity(collection.len());
    for feature in collection.iter() {
        if let Some(key) = feature.identifier(key_field) {
            index.insert(key, feature);
        }
    }
    index
}

/// Joins `primary` against `index` through `join_field`.
///
/// Returns new records; neither input is modified.
pub fn merge(
    primary: &FeatureCollection,
    index: &HashMap<String, &Feature>,
    join_field: &str,
    attach: &Attach,
    policy: MatchPolicy,
) -> Vec<MergedRecord> {
    primary
        .iter()
        .filter_map(|feature| {
            let matched = feature
                .identifier(join_field)
                .and_then(|key| index.get(&key).copied());

            match (matched, policy) {
                (Some(hit), _) => Some(attach_hit(feature, hit, attach)),
                (None, MatchPolicy::KeepUnmatched) => Some(feature.clone()),
                (None, MatchPolicy::DropUnmatched) => None,
            }
        })
        .collect()
}

fn attach_hit(feature: &Feature, hit: &Feature, attach: &Attach) -> MergedRecord {
    let mut record = feature.clone();
    match attach {
        Attach::Geometry => record.geometry = hit.geometry.clone(),
        Attach::Properties(name) => {
            record
                .properties
                .insert(name.clone(), Value::Object(hit.properties.clone()));
        }
    }
    record
}

/// Maps identifiers to enrichment outcomes, last entry winning.
pub fn index_enrichment(results: &[EnrichmentResult]) -> HashMap<&str, &Enrichment> {
    results
        .iter()
        .map(|result| (result.identifier.as_str(), &result.enrichment))
        .collect()
}

/// Sets `label` on every record to its enrichment data, or null. Failed items
/// also get `<label>_error`.
pub fn attach_enrichment(
    records: &mut [MergedRecord],
    enrichment: &HashMap<&str, &Enrichment>,
    key_field: &str,
    label: &str,
) {
    for record in records.iter_mut() {
        let found = record
            .properties
            .get(key_field)
            .and_then(key_of)
            .and_then(|key| enrichment.get(key.as_str()).copied());

        let (data, error) = match found {
            Some(Enrichment::Data(data)) => (data.clone(), None),
            Some(Enrichment::Error(e)) => (Value::Null, Some(e.clone())),
            None => (Value::Null, None),
        };

        record.properties.insert(label.to_string(), data);
        if let Some(e) = error {
            record
                .properties
                .insert(format!("{label}_error"), Value::String(e));
        }
    }
}
