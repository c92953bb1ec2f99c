use serde::{Serialize, Deserialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use chrono::{DateTime, Utc};

pub type RowId = i64;

/// Id carried by synthetic rows (joins, projections) that are never persisted.
pub const DUMMY_ID: RowId = -1;

static NULL: Value = Value::Null;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::DateTime(_) => 4,
            Value::Bytes(_) => 5,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Number(b)) => (*a as f64).total_cmp(b),
            (Value::Number(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "'{}'", s),
            Value::DateTime(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub payload: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(id: RowId, payload: BTreeMap<String, Value>) -> Self {
        Row { id, payload }
    }

    /// A row that has not been assigned an id yet.
    pub fn dummy(payload: BTreeMap<String, Value>) -> Self {
        Row { id: DUMMY_ID, payload }
    }

    /// Missing columns read as `Null`.
    pub fn get(&self, column: &str) -> &Value {
        self.payload.get(column).unwrap_or(&NULL)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.payload.insert(column.into(), value.into());
    }

    pub fn with_id(mut self, id: RowId) -> Self {
        self.id = id;
        self
    }
}

/// Builds a row payload from `(column, value)` pairs.
#[macro_export]
macro_rules! row {
    ($($col:expr => $val:expr),* $(,)?) => {{
        let mut payload = ::std::collections::BTreeMap::new();
        $( payload.insert($col.to_string(), $crate::core::types::Value::from($val)); )*
        $crate::core::types::Row::dummy(payload)
    }};
}

/// Monotonic row-id source shared by every table of one database.
#[derive(Debug)]
pub struct RowIdGenerator {
    next: AtomicI64,
}

impl RowIdGenerator {
    pub fn new() -> Self {
        RowIdGenerator { next: AtomicI64::new(1) }
    }

    pub fn next_id(&self) -> RowId {
        self.next.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Ensures future ids are strictly greater than `max_seen`.
    pub fn seed_past(&self, max_seen: RowId) {
        self.next.fetch_max(max_seen + 1, AtomicOrdering::SeqCst);
    }

    pub fn peek(&self) -> RowId {
        self.next.load(AtomicOrdering::SeqCst)
    }
}

impl Default for RowIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
