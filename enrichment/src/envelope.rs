use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

/// One named part of the response: data, or an error marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Section {
    Data(Value),
    Error { error: String },
}

impl Section {
    pub fn error(message: impl Into<String>) -> Self {
        Section::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Section::Error { .. })
    }
}

/// Sections in pipeline order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResponseEnvelope {
    sections: IndexMap<String, Section>,
}

impl ResponseEnvelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, section: Section) {
        self.sections.insert(name.into(), section);
    }

    pub fn get(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    /// Data of `name`, if the section is present and not an error.
    pub fn data(&self, name: &str) -> Option<&Value> {
        match self.sections.get(name) {
            Some(Section::Data(value)) => Some(value),
            _ => None,
        }
    }

    pub fn error_count(&self) -> usize {
        self.sections.values().filter(|s| s.is_error()).count()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }
}
