//! Native values stored on persisted objects.

use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use std::cmp::Ordering;

/// The declared type of a scalar attribute.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    #[display(fmt = "boolean")]
    Bool,
    #[display(fmt = "integer")]
    Int,
    #[display(fmt = "float")]
    Float,
    #[display(fmt = "string")]
    Text,
    #[display(fmt = "datetime")]
    DateTime,
}

/// A primitive value supported by the persistence layer.
#[derive(Clone, Debug, Display, PartialEq, From)]
pub enum Value {
    /// The absence of a value.
    #[display(fmt = "null")]
    #[from(ignore)]
    Null,
    #[display(fmt = "{}", _0)]
    Bool(bool),
    #[display(fmt = "{}", _0)]
    Int(i64),
    #[display(fmt = "{}", _0)]
    Float(f64),
    #[display(fmt = "{}", _0)]
    Text(String),
    /// An instant in time. Always stored in UTC.
    #[display(fmt = "{}", _0)]
    DateTime(DateTime<Utc>),
}

impl Value {
    /// The type of this value, or [`None`] for [`Value::Null`].
    pub fn ty(&self) -> Option<ValueType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(ValueType::Bool),
            Self::Int(_) => Some(ValueType::Int),
            Self::Float(_) => Some(ValueType::Float),
            Self::Text(_) => Some(ValueType::Text),
            Self::DateTime(_) => Some(ValueType::DateTime),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Compare two values.
    ///
    /// Integers and floats compare numerically with each other. [`Value::Null`] sorts before
    /// everything else. Values of otherwise unrelated types are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Null, _) => Some(Ordering::Less),
            (_, Self::Null) => Some(Ordering::Greater),
            (Self::Bool(l), Self::Bool(r)) => l.partial_cmp(r),
            (Self::Int(l), Self::Int(r)) => l.partial_cmp(r),
            (Self::Int(l), Self::Float(r)) => (*l as f64).partial_cmp(r),
            (Self::Float(l), Self::Int(r)) => l.partial_cmp(&(*r as f64)),
            (Self::Float(l), Self::Float(r)) => l.partial_cmp(r),
            (Self::Text(l), Self::Text(r)) => l.partial_cmp(r),
            (Self::DateTime(l), Self::DateTime(r)) => l.partial_cmp(r),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.into())
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i.into())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Null)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compare_mixed_numbers() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
        assert_eq!(Value::Float(3.0).compare(&Value::Int(3)), Some(Ordering::Equal));
        assert_eq!(Value::Null.compare(&Value::Int(0)), Some(Ordering::Less));
        assert_eq!(Value::from("a").compare(&Value::Int(0)), None);
    }

    #[test]
    fn test_display_segment() {
        assert_eq!(Value::Int(7).to_string(), "7");
        assert_eq!(Value::from("bob").to_string(), "bob");
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
