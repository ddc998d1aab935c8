//! Typed op attributes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::{Status, StatusResult};
use crate::tensor::{DType, PartialShape, Tensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    String(String),
    Type(DType),
    Shape(PartialShape),
    Tensor(Tensor),
    /// Name of a function in the context's function library.
    Func(String),
    List(Vec<AttrValue>),
}

impl AttrValue {
    fn kind(&self) -> &'static str {
        match self {
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Bool(_) => "bool",
            AttrValue::String(_) => "string",
            AttrValue::Type(_) => "type",
            AttrValue::Shape(_) => "shape",
            AttrValue::Tensor(_) => "tensor",
            AttrValue::Func(_) => "func",
            AttrValue::List(_) => "list",
        }
    }
}

/// Attributes keyed by name. Ordered so that equal maps serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrMap {
    values: BTreeMap<String, AttrValue>,
}

macro_rules! typed_getter {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(&self, name: &str) -> StatusResult<Option<$ty>> {
            match self.values.get(name) {
                None => Ok(None),
                Some(AttrValue::$variant(value)) => Ok(Some(value.clone())),
                Some(other) => Err(wrong_kind(name, stringify!($variant), other)),
            }
        }
    };
}

fn wrong_kind(name: &str, expected: &str, actual: &AttrValue) -> Status {
    Status::invalid_argument(format!(
        "Attr {name} has value of type {} but {} was expected",
        actual.kind(),
        expected.to_ascii_lowercase()
    ))
}

fn missing(name: &str) -> Status {
    Status::invalid_argument(format!("No attr named '{name}' in NodeDef"))
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: AttrValue) {
        self.values.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    typed_getter!(int, Int, i64);
    typed_getter!(float, Float, f32);
    typed_getter!(bool, Bool, bool);
    typed_getter!(string, String, String);
    typed_getter!(dtype, Type, DType);
    typed_getter!(shape, Shape, PartialShape);
    typed_getter!(tensor, Tensor, Tensor);
    typed_getter!(func, Func, String);

    pub fn bool_or(&self, name: &str, default: bool) -> StatusResult<bool> {
        Ok(self.bool(name)?.unwrap_or(default))
    }

    pub fn string_or(&self, name: &str, default: &str) -> StatusResult<String> {
        Ok(self.string(name)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn required_dtype(&self, name: &str) -> StatusResult<DType> {
        self.dtype(name)?.ok_or_else(|| missing(name))
    }

    pub fn required_tensor(&self, name: &str) -> StatusResult<Tensor> {
        self.tensor(name)?.ok_or_else(|| missing(name))
    }
}

impl FromIterator<(String, AttrValue)> for AttrMap {
    fn from_iter<I: IntoIterator<Item = (String, AttrValue)>>(iter: I) -> Self {
        AttrMap {
            values: iter.into_iter().collect(),
        }
    }
}
