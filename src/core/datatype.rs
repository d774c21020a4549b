//! Parameter datatypes
//!
//! The serde form of [`DataType`] is the datainfo structure sent in
//! `describe` replies, so config files and the wire share one shape.

use crate::core::errors::SecopError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Relative tolerance for float limit checks; values inside it are clamped
const RELATIVE_RESOLUTION: f64 = 1.2e-7;

// 2^63, the first float outside i64
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// Datatype of a parameter value or command argument/result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataType {
    /// Floating point number
    Double {
        /// Lower limit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        /// Upper limit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        /// Physical unit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    /// Integer
    Int {
        /// Lower limit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        /// Upper limit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    /// Boolean
    Bool,
    /// Named integer codes
    Enum {
        /// Member name to code
        members: BTreeMap<String, i64>,
    },
    /// Text
    #[serde(rename = "string")]
    Text {
        /// Minimum number of characters
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minchars: Option<usize>,
        /// Maximum number of characters
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maxchars: Option<usize>,
    },
    /// Homogeneous list
    Array {
        /// Element type
        members: Box<DataType>,
        /// Minimum length
        #[serde(default)]
        minlen: usize,
        /// Maximum length
        maxlen: usize,
    },
    /// Fixed length heterogeneous list
    Tuple {
        /// Element types in order
        members: Vec<DataType>,
    },
    /// Named members
    Struct {
        /// Member types
        members: BTreeMap<String, DataType>,
        /// Members which may be omitted
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        optional: Vec<String>,
    },
}

impl DataType {
    /// Unrestricted double with an optional unit
    pub fn double(unit: Option<&str>) -> Self {
        Self::Double {
            min: None,
            max: None,
            unit: unit.map(str::to_string),
        }
    }

    /// Double restricted to `[min, max]`
    pub fn float_range(min: f64, max: f64) -> Self {
        Self::Double {
            min: Some(min),
            max: Some(max),
            unit: None,
        }
    }

    /// Integer restricted to `[min, max]`
    pub fn int_range(min: i64, max: i64) -> Self {
        Self::Int {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Unrestricted string
    pub fn string() -> Self {
        Self::Text {
            minchars: None,
            maxchars: None,
        }
    }

    /// Enum from `(name, code)` pairs
    pub fn enumeration<'a>(members: impl IntoIterator<Item = (&'a str, i64)>) -> Self {
        Self::Enum {
            members: members.into_iter().map(|(n, c)| (n.to_string(), c)).collect(),
        }
    }

    /// The usual `status` type: tuple of (enum code, text)
    pub fn status() -> Self {
        Self::Tuple {
            members: vec![
                Self::enumeration([
                    ("IDLE", 100),
                    ("WARN", 200),
                    ("BUSY", 300),
                    ("ERROR", 400),
                ]),
                Self::string(),
            ],
        }
    }

    /// Datainfo as sent in `describe`
    pub fn export(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Value used before anything was read or written
    pub fn default_value(&self) -> Value {
        match self {
            Self::Double { min, max, .. } => {
                let (lo, hi) = (min.unwrap_or(f64::MIN), max.unwrap_or(f64::MAX));
                json!(if lo <= 0.0 && 0.0 <= hi { 0.0 } else { lo })
            }
            Self::Int { min, max } => {
                let (lo, hi) = (min.unwrap_or(i64::MIN), max.unwrap_or(i64::MAX));
                json!(if lo <= 0 && 0 <= hi { 0 } else { lo })
            }
            Self::Bool => json!(false),
            Self::Enum { members } => json!(members.values().min().copied().unwrap_or(0)),
            Self::Text { minchars, .. } => json!(" ".repeat(minchars.unwrap_or(0))),
            Self::Array {
                members, minlen, ..
            } => Value::Array(vec![members.default_value(); *minlen]),
            Self::Tuple { members } => Value::Array(members.iter().map(Self::default_value).collect()),
            Self::Struct { members, .. } => Value::Object(
                members
                    .iter()
                    .map(|(k, t)| (k.clone(), t.default_value()))
                    .collect(),
            ),
        }
    }

    /// Check a value and return its canonical wire form
    ///
    /// Enum members may be given by name and come back as their code;
    /// whole floats are accepted for ints.
    pub fn validate(&self, value: &Value) -> Result<Value, SecopError> {
        match self {
            Self::Double { min, max, .. } => {
                let v = match value {
                    Value::Number(n) => n.as_f64().ok_or_else(|| wrong_type(value, "a float"))?,
                    _ => return Err(wrong_type(value, "a float")),
                };
                let (lo, hi) = (min.unwrap_or(f64::MIN), max.unwrap_or(f64::MAX));
                let prec = (v * RELATIVE_RESOLUTION).abs();
                if lo - prec <= v && v <= hi + prec {
                    Ok(json!(v.clamp(lo, hi)))
                } else {
                    Err(SecopError::BadValue(format!(
                        "{v} must be between {lo} and {hi}"
                    )))
                }
            }
            Self::Int { min, max } => {
                let v = match value {
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => i,
                        None => {
                            let f = n.as_f64().unwrap_or(f64::NAN);
                            if f.fract() != 0.0 || !f.is_finite() {
                                return Err(SecopError::BadValue(format!("{value} should be an int")));
                            }
                            if !(-I64_LIMIT..I64_LIMIT).contains(&f) {
                                return Err(SecopError::BadValue(format!("{value} is out of the int range")));
                            }
                            #[allow(clippy::cast_possible_truncation)]
                            let i = f as i64;
                            i
                        }
                    },
                    _ => return Err(wrong_type(value, "an int")),
                };
                let (lo, hi) = (min.unwrap_or(i64::MIN), max.unwrap_or(i64::MAX));
                if lo <= v && v <= hi {
                    Ok(json!(v))
                } else {
                    Err(SecopError::BadValue(format!("{v} must be between {lo} and {hi}")))
                }
            }
            Self::Bool => match value {
                Value::Bool(b) => Ok(json!(b)),
                Value::Number(n) if n.as_i64() == Some(0) => Ok(json!(false)),
                Value::Number(n) if n.as_i64() == Some(1) => Ok(json!(true)),
                _ => Err(SecopError::BadValue(format!("{value} is not a boolean value!"))),
            },
            Self::Enum { members } => {
                let code = match value {
                    Value::String(name) => members.get(name).copied(),
                    Value::Number(n) => n.as_i64().filter(|c| members.values().any(|m| m == c)),
                    _ => {
                        return Err(SecopError::BadValue(format!(
                            "{value} must be either int or str for an enum value"
                        )))
                    }
                };
                code.map(|c| json!(c)).ok_or_else(|| {
                    SecopError::BadValue(format!("{value} is not a member of enum"))
                })
            }
            Self::Text { minchars, maxchars } => {
                let Value::String(s) = value else {
                    return Err(wrong_type(value, "a string"));
                };
                let size = s.chars().count();
                if let Some(lo) = minchars.filter(|lo| size < *lo) {
                    return Err(SecopError::BadValue(format!(
                        "{value} must be at least {lo} chars long!"
                    )));
                }
                if let Some(hi) = maxchars.filter(|hi| size > *hi) {
                    return Err(SecopError::BadValue(format!(
                        "{value} must be at most {hi} chars long!"
                    )));
                }
                if s.contains('\0') {
                    return Err(SecopError::BadValue(
                        "Strings are not allowed to embed a \\0!".to_string(),
                    ));
                }
                Ok(value.clone())
            }
            Self::Array {
                members,
                minlen,
                maxlen,
            } => {
                let Value::Array(items) = value else {
                    return Err(wrong_type(value, "an array"));
                };
                if items.len() < *minlen || items.len() > *maxlen {
                    return Err(SecopError::BadValue(format!(
                        "array must have between {minlen} and {maxlen} elements, got {}",
                        items.len()
                    )));
                }
                items
                    .iter()
                    .map(|item| members.validate(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            Self::Tuple { members } => {
                let Value::Array(items) = value else {
                    return Err(wrong_type(value, "a tuple"));
                };
                if items.len() != members.len() {
                    return Err(SecopError::BadValue(format!(
                        "tuple needs {} elements, got {}",
                        members.len(),
                        items.len()
                    )));
                }
                members
                    .iter()
                    .zip(items)
                    .map(|(t, item)| t.validate(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            Self::Struct { members, optional } => {
                let Value::Object(items) = value else {
                    return Err(wrong_type(value, "a struct"));
                };
                if let Some(extra) = items.keys().find(|k| !members.contains_key(*k)) {
                    return Err(SecopError::BadValue(format!("struct has no member '{extra}'")));
                }
                let mut out = Map::new();
                for (name, t) in members {
                    match items.get(name) {
                        Some(item) => {
                            out.insert(name.clone(), t.validate(item)?);
                        }
                        None if optional.contains(name) => {}
                        None => {
                            return Err(SecopError::BadValue(format!("missing struct member '{name}'")))
                        }
                    }
                }
                Ok(Value::Object(out))
            }
        }
    }
}

fn wrong_type(value: &Value, expected: &str) -> SecopError {
    SecopError::BadValue(format!("can not convert {value} to {expected}"))
}
