//! Extraction of request parameters from caller input and upstream responses.
//!
//! One source's output becomes another source's input: a `POINT(x y)` text in the
//! address lookup becomes the centre of a small bounding box for the parcel lookup.

use crate::client::Params;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeriveError {
    #[error("malformed geometry: {0}")]
    MalformedGeometry(String),

    #[error("malformed bounding box: {0}")]
    MalformedBoundingBox(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Square box of half-width `buffer` centred on `point`.
    pub fn around(point: Point, buffer: f64) -> Self {
        BoundingBox {
            min_x: point.x - buffer,
            min_y: point.y - buffer,
            max_x: point.x + buffer,
            max_y: point.y + buffer,
        }
    }

    pub fn center(&self) -> Point {
        Point {
            x: (self.min_x + self.max_x) / 2.0,
            y: (self.min_y + self.max_y) / 2.0,
        }
    }

    pub fn to_param(&self) -> String {
        format!("{},{},{},{}", self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

/// The caller-supplied area: either `x,y` or `x0,y0,x1,y1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Area {
    Point(Point),
    BoundingBox(BoundingBox),
}

impl Area {
    pub fn center(&self) -> Point {
        match self {
            Area::Point(point) => *point,
            Area::BoundingBox(bbox) => bbox.center(),
        }
    }

    /// The area as a box. A point area becomes a square of half-width `point_buffer`.
    pub fn bounding_box(&self, point_buffer: f64) -> BoundingBox {
        match self {
            Area::Point(point) => BoundingBox::around(*point, point_buffer),
            Area::BoundingBox(bbox) => *bbox,
        }
    }

    /// Template parameters derived from the area.
    pub fn params(&self, point_buffer: f64) -> Params {
        let center = self.center();
        let bbox = self.bounding_box(point_buffer);

        Params::from([
            ("x".to_string(), center.x.to_string()),
            ("y".to_string(), center.y.to_string()),
            ("min_x".to_string(), bbox.min_x.to_string()),
            ("min_y".to_string(), bbox.min_y.to_string()),
            ("max_x".to_string(), bbox.max_x.to_string()),
            ("max_y".to_string(), bbox.max_y.to_string()),
            ("bbox".to_string(), bbox.to_param()),
        ])
    }
}

pub fn parse_area(raw: &str) -> Result<Area, DeriveError> {
    let components = raw
        .split(',')
        .map(|part| {
            let part = part.trim();
            parse_coordinate(part)
                .ok_or_else(|| DeriveError::MalformedBoundingBox(format!("`{part}` is not a number")))
        })
        .collect::<Result<Vec<f64>, _>>()?;

    match components.as_slice() {
        [x, y] => Ok(Area::Point(Point { x: *x, y: *y })),
        [min_x, min_y, max_x, max_y] => Ok(Area::BoundingBox(BoundingBox {
            min_x: *min_x,
            min_y: *min_y,
            max_x: *max_x,
            max_y: *max_y,
        })),
        other => Err(DeriveError::MalformedBoundingBox(format!(
            "expected 2 or 4 components, got {}",
            other.len()
        ))),
    }
}

/// Parses `POINT(<x> <y>)`.
pub fn parse_point(text: &str) -> Result<Point, DeriveError> {
    let malformed = || DeriveError::MalformedGeometry(format!("`{text}` is not a POINT"));

    let inner = text
        .trim()
        .strip_prefix("POINT")
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(malformed)?;

    let mut parts = inner.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(x), Some(y), None) => {
            let x = parse_coordinate(x).ok_or_else(malformed)?;
            let y = parse_coordinate(y).ok_or_else(malformed)?;
            Ok(Point { x, y })
        }
        _ => Err(malformed()),
    }
}

/// Reads the text at `pointer` (a JSON pointer) and parses it as a point.
pub fn point_at(value: &Value, pointer: &str) -> Result<Point, DeriveError> {
    match value.pointer(pointer) {
        Some(Value::String(text)) => parse_point(text),
        Some(_) => Err(DeriveError::MalformedGeometry(format!(
            "field `{pointer}` is not text"
        ))),
        None => Err(DeriveError::MalformedGeometry(format!(
            "field `{pointer}` is absent"
        ))),
    }
}

/// Parameters for a request centred on `point`.
pub fn point_params(point: Point, bbox_buffer: f64) -> Params {
    Params::from([
        ("x".to_string(), point.x.to_string()),
        ("y".to_string(), point.y.to_string()),
        (
            "bbox".to_string(),
            BoundingBox::around(point, bbox_buffer).to_param(),
        ),
    ])
}

fn parse_coordinate(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}
