use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Dynamically typed value carried in command metadata.
///
/// Command files are free-form JSON, so metadata values arrive untyped; this
/// enum is the closed set of shapes the simulator understands. The untagged
/// serde representation keeps the JSON natural (`"op": "topk_select"`,
/// `"experts": [0, 2]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    Bytes(Vec<u8>),
    Map(BTreeMap<String, MetaValue>),
}

pub type MetaMap = BTreeMap<String, MetaValue>;

impl MetaValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            MetaValue::Float(v) => Some(*v as i64),
            MetaValue::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_int_or(&self, default: i64) -> i64 {
        self.as_int().unwrap_or(default)
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            MetaValue::Float(v) => Some(*v),
            MetaValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_float_or(&self, default: f64) -> f64 {
        self.as_float().unwrap_or(default)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool_or(&self, default: bool) -> bool {
        match self {
            MetaValue::Bool(v) => *v,
            MetaValue::Int(v) => *v != 0,
            _ => default,
        }
    }

    /// Integer list view; scalar ints are promoted to a one-element list so
    /// `"experts": 3` and `"experts": [3]` read the same.
    pub fn as_int_list(&self) -> Vec<i64> {
        match self {
            MetaValue::IntList(v) => v.clone(),
            MetaValue::FloatList(v) => v.iter().map(|f| *f as i64).collect(),
            MetaValue::Int(v) => vec![*v],
            _ => Vec::new(),
        }
    }

    pub fn as_float_list(&self) -> Vec<f64> {
        match self {
            MetaValue::FloatList(v) => v.clone(),
            MetaValue::IntList(v) => v.iter().map(|i| *i as f64).collect(),
            MetaValue::Float(v) => vec![*v],
            MetaValue::Int(v) => vec![*v as f64],
            _ => Vec::new(),
        }
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<u64> for MetaValue {
    fn from(v: u64) -> Self {
        MetaValue::Int(v as i64)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Str(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<Vec<i64>> for MetaValue {
    fn from(v: Vec<i64>) -> Self {
        MetaValue::IntList(v)
    }
}

/// Convenience accessors over a whole metadata map.
pub trait MetaMapExt {
    fn int_or(&self, key: &str, default: i64) -> i64;
    fn float_or(&self, key: &str, default: f64) -> f64;
    fn str_of(&self, key: &str) -> Option<&str>;
    fn int_list(&self, key: &str) -> Vec<i64>;
}

impl MetaMapExt for MetaMap {
    fn int_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).map_or(default, |v| v.as_int_or(default))
    }

    fn float_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).map_or(default, |v| v.as_float_or(default))
    }

    fn str_of(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetaValue::as_str)
    }

    fn int_list(&self, key: &str) -> Vec<i64> {
        self.get(key).map_or_else(Vec::new, MetaValue::as_int_list)
    }
}
