use serde::{Serialize, Deserialize};
use std::fmt;
use crate::core::types::{Row, Value};
use crate::schema::schema::IndexDef;

static NULL: Value = Value::Null;

/// Index key: one value for single-column indices, one value per column otherwise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Single(Value),
    Multi(Vec<Value>),
}

impl Key {
    /// Extracts the key an index stores for `row`.
    pub fn from_row(index: &IndexDef, row: &Row) -> Key {
        if index.columns.len() == 1 {
            Key::Single(row.get(&index.columns[0].name).clone())
        } else {
            Key::Multi(index.columns.iter().map(|c| row.get(&c.name).clone()).collect())
        }
    }

    pub fn dimension(&self, i: usize) -> Option<&Value> {
        match self {
            Key::Single(v) if i == 0 => Some(v),
            Key::Single(_) => None,
            Key::Multi(vs) => vs.get(i),
        }
    }

    pub fn first(&self) -> &Value {
        match self {
            Key::Single(v) => v,
            Key::Multi(vs) => vs.first().unwrap_or(&NULL),
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Key::Single(_) => 1,
            Key::Multi(vs) => vs.len(),
        }
    }

    /// True when every component is null.
    pub fn is_null(&self) -> bool {
        match self {
            Key::Single(v) => v.is_null(),
            Key::Multi(vs) => vs.iter().all(Value::is_null),
        }
    }

    pub fn has_null(&self) -> bool {
        match self {
            Key::Single(v) => v.is_null(),
            Key::Multi(vs) => vs.iter().any(Value::is_null),
        }
    }
}

impl From<Value> for Key {
    fn from(v: Value) -> Self {
        Key::Single(v)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Single(Value::Integer(v))
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Single(Value::from(v))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Key::Single(v) => write!(f, "{}", v),
            Key::Multi(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}
