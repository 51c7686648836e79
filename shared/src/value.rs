/*!
Process-variable values and their declarations.

A process variable has a fixed [`ValueKind`] and capacity for the life of
the process. [`Value`] carries the current datum, [`Severity`] the alarm
state attached to it.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SharedError};

/// Alarm severity attached to a value, independent of the value itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Severity {
    #[default]
    NoAlarm,
    Minor,
    Major,
    Invalid,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::NoAlarm => "NO_ALARM",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire type of a process variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    /// Index into a fixed list of labels
    Enum,
    Int,
    Float,
    /// Bounded string
    Str,
    /// Bounded character array (NUL-free bytes)
    Char,
    /// Fixed-capacity integer array
    IntArray,
}

/// Current value of a process variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Enum(u16),
    Int(i64),
    Float(f64),
    Str(String),
    Char(Vec<u8>),
    /// Shared so that reading a large image does not copy it
    IntArray(Arc<[i64]>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Enum(_) => ValueKind::Enum,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Char(_) => ValueKind::Char,
            Value::IntArray(_) => ValueKind::IntArray,
        }
    }

    /// Build a char-array value from text
    pub fn chars(text: impl AsRef<str>) -> Self {
        Value::Char(text.as_ref().as_bytes().to_vec())
    }

    pub fn int_array(values: impl Into<Arc<[i64]>>) -> Self {
        Value::IntArray(values.into())
    }

    /// Integer view; enums yield their index and floats are truncated
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Enum(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Enum(v) => Some(f64::from(*v)),
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Enum and integer values are true when non-zero
    pub fn as_bool(&self) -> Option<bool> {
        self.as_i64().map(|v| v != 0)
    }

    /// Text view of strings and char arrays, stopping at the first NUL
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Char(bytes) => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[i64]> {
        match self {
            Value::IntArray(values) => Some(values),
            _ => None,
        }
    }

    /// Render for the text access protocol; arrays are rendered as JSON
    pub fn to_wire_string(&self) -> Result<String> {
        Ok(match self {
            Value::Enum(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(_) | Value::Char(_) => self.as_text().unwrap_or_default(),
            Value::IntArray(values) => serde_json::to_string(&**values)?,
        })
    }
}

/// Declaration of a single process variable
#[derive(Debug, Clone)]
pub struct PvDef {
    pub name: &'static str,
    pub kind: ValueKind,
    /// Maximum element count for strings, char arrays and integer arrays
    pub count: usize,
    pub enums: &'static [&'static str],
    /// Severity per enum state, applied automatically on every set
    pub states: &'static [Severity],
    pub initial: Value,
    /// Only internal components may set this value
    pub read_only: bool,
}

impl PvDef {
    pub fn new(name: &'static str, kind: ValueKind, initial: Value) -> Self {
        Self {
            name,
            kind,
            count: 1,
            enums: &[],
            states: &[],
            initial,
            read_only: false,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_enums(mut self, enums: &'static [&'static str]) -> Self {
        self.enums = enums;
        self
    }

    pub fn with_states(mut self, states: &'static [Severity]) -> Self {
        self.states = states;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Severity implied by an enum state, if the declaration carries one
    pub fn state_severity(&self, value: &Value) -> Option<Severity> {
        match value {
            Value::Enum(index) => self.states.get(usize::from(*index)).copied(),
            _ => None,
        }
    }

    /// Convert client text into this variable's kind
    pub fn parse(&self, text: &str) -> Result<Value> {
        let invalid = |reason: String| SharedError::invalid_value(self.name, reason);
        let trimmed = text.trim();

        match self.kind {
            ValueKind::Enum => {
                if let Some(index) = self.enums.iter().position(|label| *label == trimmed) {
                    return Ok(Value::Enum(index as u16));
                }
                let index: u16 = trimmed
                    .parse()
                    .map_err(|_| invalid(format!("'{}' is not one of {:?}", trimmed, self.enums)))?;
                if usize::from(index) >= self.enums.len() {
                    return Err(invalid(format!("enum index {} out of range", index)));
                }
                Ok(Value::Enum(index))
            }
            ValueKind::Int => trimmed
                .parse()
                .map(Value::Int)
                .map_err(|e| invalid(format!("'{}': {}", trimmed, e))),
            ValueKind::Float => trimmed
                .parse()
                .map(Value::Float)
                .map_err(|e| invalid(format!("'{}': {}", trimmed, e))),
            ValueKind::Str => Ok(Value::Str(text.to_string())),
            ValueKind::Char => Ok(Value::chars(text)),
            ValueKind::IntArray => {
                let values: Vec<i64> = serde_json::from_str(trimmed)
                    .map_err(|e| invalid(format!("expected JSON integer array: {}", e)))?;
                Ok(Value::int_array(values))
            }
        }
    }

    /// Bring a value into this declaration's kind and capacity.
    ///
    /// Numeric kinds convert between each other; text kinds convert between
    /// string and char array. Anything else is a type mismatch.
    pub fn conform(&self, value: Value) -> Result<Value> {
        let mismatch = |value: &Value| {
            SharedError::invalid_value(
                self.name,
                format!("expected {:?}, got {:?}", self.kind, value.kind()),
            )
        };

        let value = match (self.kind, value) {
            (ValueKind::Enum, Value::Enum(v)) => Value::Enum(v),
            (ValueKind::Enum, other) => {
                let index = other.as_i64().ok_or_else(|| mismatch(&other))?;
                if index < 0 || index as usize >= self.enums.len() {
                    return Err(SharedError::invalid_value(
                        self.name,
                        format!("enum index {} out of range", index),
                    ));
                }
                Value::Enum(index as u16)
            }
            (ValueKind::Int, other) => Value::Int(other.as_i64().ok_or_else(|| mismatch(&other))?),
            (ValueKind::Float, other) => {
                Value::Float(other.as_f64().ok_or_else(|| mismatch(&other))?)
            }
            (ValueKind::Str, other) => {
                let text = other.as_text().ok_or_else(|| mismatch(&other))?;
                Value::Str(truncate_str(text, self.count))
            }
            (ValueKind::Char, Value::Char(mut bytes)) => {
                bytes.truncate(self.count);
                Value::Char(bytes)
            }
            (ValueKind::Char, Value::Str(text)) => {
                let mut bytes = text.into_bytes();
                bytes.truncate(self.count);
                Value::Char(bytes)
            }
            (ValueKind::IntArray, Value::IntArray(values)) => {
                if values.len() > self.count {
                    Value::int_array(&values[..self.count])
                } else {
                    Value::IntArray(values)
                }
            }
            (_, other) => return Err(mismatch(&other)),
        };
        Ok(value)
    }
}

/// Truncate to at most `max` bytes without splitting a character
fn truncate_str(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
