// ── RPC value model ──
//
// The typed value exchanged with RPC consumers: paramset contents,
// event payloads, service-message lists. Serializes to plain JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A dynamically typed RPC value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variable {
    #[default]
    Void,
    Bool(bool),
    Integer(i32),
    Integer64(i64),
    Float(f64),
    String(String),
    Array(Vec<Variable>),
    Struct(BTreeMap<String, Variable>),
    Binary(Vec<u8>),
}

impl Variable {
    /// Empty struct, the usual container for paramsets and descriptions.
    pub fn new_struct() -> Self {
        Self::Struct(BTreeMap::new())
    }

    /// Build a struct from `(key, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Variable)>,
        K: Into<String>,
    {
        Self::Struct(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Truthiness as used by boolean parameters and service messages.
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Integer64(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => matches!(s.as_str(), "true" | "1"),
            Self::Binary(b) => b.iter().any(|byte| *byte != 0),
            Self::Void | Self::Array(_) | Self::Struct(_) => false,
        }
    }

    /// Integer view. Floats are truncated, strings are parsed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Bool(b) => Some(i32::from(*b)),
            Self::Integer(i) => Some(*i),
            Self::Integer64(i) => i32::try_from(*i).ok(),
            Self::Float(f) => Some(*f as i32),
            Self::String(s) => parse_number(s),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Integer(i) => Some(f64::from(*i)),
            Self::Integer64(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Variable>> {
        match self {
            Self::Struct(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Variable]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Member lookup on struct values.
    pub fn get(&self, key: &str) -> Option<&Variable> {
        self.as_struct().and_then(|map| map.get(key))
    }

    /// Insert into a struct value. No-op for other variants.
    pub fn insert(&mut self, key: impl Into<String>, value: Variable) {
        if let Self::Struct(map) = self {
            map.insert(key.into(), value);
        }
    }

    /// Append to an array value. No-op for other variants.
    pub fn push(&mut self, value: Variable) {
        if let Self::Array(items) = self {
            items.push(value);
        }
    }
}

/// Parse decimal or `0x`-prefixed hexadecimal integers.
pub fn parse_number(text: &str) -> Option<i32> {
    let text = text.trim();
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        return u32::from_str_radix(hex, 16)
            .ok()
            .map(|v| i32::from_ne_bytes(v.to_ne_bytes()));
    }
    text.parse().ok()
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("(void)"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Integer64(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::Binary(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
            Self::Array(_) | Self::Struct(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

// ── Conversions ─────────────────────────────────────────────────────

impl From<bool> for Variable {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Variable {
    fn from(value: i32) -> Self {
        Self::Integer(value)
    }
}

impl From<u8> for Variable {
    fn from(value: u8) -> Self {
        Self::Integer(i32::from(value))
    }
}

impl From<i64> for Variable {
    fn from(value: i64) -> Self {
        Self::Integer64(value)
    }
}

impl From<u64> for Variable {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::Integer64(i64::MAX), Self::Integer64)
    }
}

impl From<f64> for Variable {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Variable {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Variable {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Variable>> for Variable {
    fn from(value: Vec<Variable>) -> Self {
        Self::Array(value)
    }
}
