//! Typed observation values and their wire decoders
//!
//! The declared [`DataType`] selects the decoder applied to the raw JSON
//! payload of an inbound observation.

use crate::error::DecodeError;
use crate::statistics::StatisticsSummary;
use base64::Engine as _;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Data types a template may declare for an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Double,
    String,
    Boolean,
    Position,
    Statistics,
    Binary,
}

impl DataType {
    /// Whether samples of this type can feed running statistics
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Integer | DataType::Double)
    }

    /// Decode a raw wire payload into a typed value
    pub fn decode(self, raw: &serde_json::Value) -> Result<ObservationValue, DecodeError> {
        let fail = |reason: String| DecodeError::Value {
            data_type: self,
            reason,
        };

        match self {
            DataType::Integer => match raw {
                serde_json::Value::Number(n) => n
                    .as_i64()
                    .map(ObservationValue::Integer)
                    .ok_or_else(|| fail(format!("{n} is not an integer"))),
                serde_json::Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(ObservationValue::Integer)
                    .map_err(|e| fail(e.to_string())),
                other => Err(fail(format!("unexpected {other}"))),
            },

            DataType::Double => {
                let x = match raw {
                    serde_json::Value::Number(n) => n
                        .as_f64()
                        .ok_or_else(|| fail(format!("{n} is not a number")))?,
                    serde_json::Value::String(s) => {
                        s.trim().parse::<f64>().map_err(|e| fail(e.to_string()))?
                    }
                    other => return Err(fail(format!("unexpected {other}"))),
                };
                finite(x)
                    .map(ObservationValue::from)
                    .ok_or_else(|| fail(format!("{x} is not finite")))
            }

            DataType::String => match raw {
                serde_json::Value::String(s) => Ok(ObservationValue::String(s.clone())),
                serde_json::Value::Number(n) => Ok(ObservationValue::String(n.to_string())),
                serde_json::Value::Bool(b) => Ok(ObservationValue::String(b.to_string())),
                other => Err(fail(format!("unexpected {other}"))),
            },

            DataType::Boolean => match raw {
                serde_json::Value::Bool(b) => Ok(ObservationValue::Boolean(*b)),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(ObservationValue::Boolean(false)),
                    Some(1) => Ok(ObservationValue::Boolean(true)),
                    _ => Err(fail(format!("{n} is not 0 or 1"))),
                },
                serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(ObservationValue::Boolean(true)),
                    "false" | "0" => Ok(ObservationValue::Boolean(false)),
                    _ => Err(fail(format!("{s:?} is not a boolean"))),
                },
                other => Err(fail(format!("unexpected {other}"))),
            },

            DataType::Position => match raw {
                serde_json::Value::Array(items) if items.len() == 2 || items.len() == 3 => {
                    let coords: Option<Vec<f64>> =
                        items.iter().map(serde_json::Value::as_f64).collect();
                    let coords = coords
                        .filter(|c| c.iter().all(|x| x.is_finite()))
                        .ok_or_else(|| fail("non-numeric coordinate".into()))?;
                    Ok(ObservationValue::Position(Position::new(
                        coords[0],
                        coords[1],
                        coords.get(2).copied(),
                    )))
                }
                serde_json::Value::Object(_) => {
                    let position = serde_json::from_value::<Position>(raw.clone())
                        .map_err(|e| fail(e.to_string()))?;
                    if !position.is_finite() {
                        return Err(fail("non-finite coordinate".into()));
                    }
                    Ok(ObservationValue::Position(position))
                }
                other => Err(fail(format!("unexpected {other}"))),
            },

            DataType::Statistics => serde_json::from_value::<StatisticsSummary>(raw.clone())
                .map(ObservationValue::Statistics)
                .map_err(|e| fail(e.to_string())),

            DataType::Binary => match raw {
                serde_json::Value::String(s) => base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map(ObservationValue::Binary)
                    .map_err(|e| fail(e.to_string())),
                other => Err(fail(format!("unexpected {other}"))),
            },
        }
    }
}

fn finite(x: f64) -> Option<f64> {
    x.is_finite().then_some(x)
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Integer => "Integer",
            DataType::Double => "Double",
            DataType::String => "String",
            DataType::Boolean => "Boolean",
            DataType::Position => "Position",
            DataType::Statistics => "Statistics",
            DataType::Binary => "Binary",
        };
        f.write_str(name)
    }
}

/// Geographic position reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    #[serde(alias = "lat")]
    pub latitude: OrderedFloat<f64>,
    #[serde(alias = "lon", alias = "lng")]
    pub longitude: OrderedFloat<f64>,
    #[serde(default, alias = "alt")]
    pub altitude: Option<OrderedFloat<f64>>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, altitude: Option<f64>) -> Self {
        Self {
            latitude: OrderedFloat(latitude),
            longitude: OrderedFloat(longitude),
            altitude: altitude.map(OrderedFloat),
        }
    }

    fn is_finite(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.altitude.map_or(true, |a| a.is_finite())
    }
}

/// Decoded, strongly-typed observation value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ObservationValue {
    Integer(i64),
    Double(OrderedFloat<f64>),
    String(String),
    Boolean(bool),
    Position(Position),
    Statistics(StatisticsSummary),
    Binary(Vec<u8>),
}

impl ObservationValue {
    /// Numeric view used by aggregation
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ObservationValue::Integer(i) => Some(*i as f64),
            ObservationValue::Double(d) => Some(d.into_inner()),
            _ => None,
        }
    }
}

impl fmt::Display for ObservationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationValue::Integer(i) => write!(f, "{i}"),
            ObservationValue::Double(d) => write!(f, "{d}"),
            ObservationValue::String(s) => write!(f, "{s}"),
            ObservationValue::Boolean(b) => write!(f, "{b}"),
            ObservationValue::Position(p) => match p.altitude {
                Some(alt) => write!(f, "({}, {}, {alt})", p.latitude, p.longitude),
                None => write!(f, "({}, {})", p.latitude, p.longitude),
            },
            ObservationValue::Statistics(s) => write!(
                f,
                "n={} mean={} min={} max={}",
                s.count, s.mean, s.min, s.max
            ),
            ObservationValue::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i32> for ObservationValue {
    fn from(i: i32) -> Self {
        ObservationValue::Integer(i64::from(i))
    }
}

impl From<i64> for ObservationValue {
    fn from(i: i64) -> Self {
        ObservationValue::Integer(i)
    }
}

impl From<f64> for ObservationValue {
    fn from(f: f64) -> Self {
        ObservationValue::Double(OrderedFloat(f))
    }
}

impl From<bool> for ObservationValue {
    fn from(b: bool) -> Self {
        ObservationValue::Boolean(b)
    }
}

impl From<&str> for ObservationValue {
    fn from(s: &str) -> Self {
        ObservationValue::String(s.to_string())
    }
}

impl From<String> for ObservationValue {
    fn from(s: String) -> Self {
        ObservationValue::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_decoding() {
        assert_eq!(
            DataType::Integer.decode(&json!(42)).unwrap(),
            ObservationValue::Integer(42)
        );
        assert_eq!(
            DataType::Integer.decode(&json!(" -7 ")).unwrap(),
            ObservationValue::Integer(-7)
        );
        assert!(DataType::Integer.decode(&json!(4.5)).is_err());
    }

    #[test]
    fn test_double_decoding_rejects_non_finite() {
        assert_eq!(
            DataType::Double.decode(&json!("2.5")).unwrap(),
            ObservationValue::from(2.5)
        );
        for raw in ["NaN", "inf", "-inf", "infinity"] {
            assert!(
                matches!(DataType::Double.decode(&json!(raw)), Err(DecodeError::Value { .. })),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_boolean_decoding() {
        assert_eq!(
            DataType::Boolean.decode(&json!(1)).unwrap(),
            ObservationValue::Boolean(true)
        );
        assert_eq!(
            DataType::Boolean.decode(&json!("FALSE")).unwrap(),
            ObservationValue::Boolean(false)
        );
        assert!(DataType::Boolean.decode(&json!(2)).is_err());
    }

    #[test]
    fn test_position_decoding() {
        let from_array = DataType::Position.decode(&json!([52.5, 13.4])).unwrap();
        let from_object = DataType::Position
            .decode(&json!({"lat": 52.5, "lon": 13.4}))
            .unwrap();
        assert_eq!(from_array, from_object);
        assert!(DataType::Position.decode(&json!([1.0])).is_err());
    }

    #[test]
    fn test_binary_decoding() {
        let value = DataType::Binary.decode(&json!("AQID")).unwrap();
        assert_eq!(value, ObservationValue::Binary(vec![1, 2, 3]));
        assert!(DataType::Binary.decode(&json!("not base64!")).is_err());
    }

    #[test]
    fn test_numeric_view() {
        assert_eq!(ObservationValue::from(3).as_f64(), Some(3.0));
        assert_eq!(ObservationValue::from(2.5).as_f64(), Some(2.5));
        assert_eq!(ObservationValue::from("x").as_f64(), None);
    }
}
