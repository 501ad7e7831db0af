use crate::client::Params;
use crate::errors::{PipelineError, Result};

/// Caller-supplied identifiers for one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupKey {
    pub address_id: String,
    pub object_id: String,
    /// `x,y` or `x0,y0,x1,y1`
    pub area: String,
}

impl LookupKey {
    /// Fails with `MissingParameter` naming the first absent or blank component.
    pub fn new(
        address_id: Option<&str>,
        object_id: Option<&str>,
        area: Option<&str>,
    ) -> Result<Self> {
        Ok(LookupKey {
            address_id: required("address_id", address_id)?,
            object_id: required("object_id", object_id)?,
            area: required("area", area)?,
        })
    }

    pub fn params(&self) -> Params {
        Params::from([
            ("address_id".to_string(), self.address_id.clone()),
            ("object_id".to_string(), self.object_id.clone()),
            ("area".to_string(), self.area.clone()),
        ])
    }
}

fn required(name: &'static str, value: Option<&str>) -> Result<String> {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(PipelineError::MissingParameter(name)),
    }
}
