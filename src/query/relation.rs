use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use crate::core::types::{Row, RowId, Value};

static NULL: Value = Value::Null;

/// Column of a named table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnRef {
    pub table: String,
    pub name: String,
}

pub fn col(table: &str, name: &str) -> ColumnRef {
    ColumnRef {
        table: table.to_string(),
        name: name.to_string(),
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Number of distinct non-null values.
    Distinct,
    /// Sample standard deviation.
    Stddev,
    Geomean,
}

impl AggregateFn {
    fn label(&self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
            AggregateFn::Distinct => "DISTINCT",
            AggregateFn::Stddev => "STDDEV",
            AggregateFn::Geomean => "GEOMEAN",
        }
    }
}

/// An aggregate over a column; `column` is `None` only for `COUNT(*)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub func: AggregateFn,
    pub column: Option<ColumnRef>,
}

impl Aggregate {
    pub fn name(&self) -> String {
        match &self.column {
            Some(c) => format!("{}({})", self.func.label(), c),
            None => format!("{}(*)", self.func.label()),
        }
    }

    pub fn is_count_star(&self) -> bool {
        self.func == AggregateFn::Count && self.column.is_none()
    }

    /// Evaluates the aggregate over every entry of `relation`. Empty input
    /// yields 0 for counts and `Null` otherwise.
    pub fn evaluate(&self, relation: &Relation) -> Value {
        let Some(column) = &self.column else {
            return Value::Integer(relation.entries.len() as i64);
        };
        let values: Vec<&Value> = relation
            .entries
            .iter()
            .map(|e| e.get(column))
            .filter(|v| !v.is_null())
            .collect();

        match self.func {
            AggregateFn::Count => Value::Integer(values.len() as i64),
            AggregateFn::Distinct => {
                let distinct: BTreeSet<&Value> = values.into_iter().collect();
                Value::Integer(distinct.len() as i64)
            }
            AggregateFn::Min => values.into_iter().min().cloned().unwrap_or(Value::Null),
            AggregateFn::Max => values.into_iter().max().cloned().unwrap_or(Value::Null),
            AggregateFn::Sum => sum(&values),
            AggregateFn::Avg => {
                let nums = numbers(&values);
                if nums.is_empty() {
                    return Value::Null;
                }
                Value::Number(nums.iter().sum::<f64>() / nums.len() as f64)
            }
            AggregateFn::Stddev => {
                let nums = numbers(&values);
                if nums.len() < 2 {
                    return Value::Null;
                }
                let mean = nums.iter().sum::<f64>() / nums.len() as f64;
                let var = nums.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (nums.len() - 1) as f64;
                Value::Number(var.sqrt())
            }
            AggregateFn::Geomean => {
                let nums = numbers(&values);
                if nums.is_empty() || nums.iter().any(|x| *x < 0.0) {
                    return Value::Null;
                }
                if nums.iter().any(|x| *x == 0.0) {
                    return Value::Number(0.0);
                }
                let log_mean = nums.iter().map(|x| x.ln()).sum::<f64>() / nums.len() as f64;
                Value::Number(log_mean.exp())
            }
        }
    }
}

fn numbers(values: &[&Value]) -> Vec<f64> {
    values.iter().filter_map(|v| v.as_f64()).collect()
}

/// Integer sums stay integral until they overflow or meet a float.
fn sum(values: &[&Value]) -> Value {
    let mut int_sum: Option<i64> = Some(0);
    let mut float_sum = 0.0;
    let mut seen = false;
    for v in values {
        match v {
            Value::Integer(i) => {
                int_sum = int_sum.and_then(|s| s.checked_add(*i));
                float_sum += *i as f64;
                seen = true;
            }
            Value::Number(n) => {
                int_sum = None;
                float_sum += n;
                seen = true;
            }
            _ => {}
        }
    }
    match (seen, int_sum) {
        (false, _) => Value::Null,
        (true, Some(s)) => Value::Integer(s),
        (true, None) => Value::Number(float_sum),
    }
}

/// What a select returns per output row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Column { column: ColumnRef, alias: Option<String> },
    Aggregate { aggregate: Aggregate, alias: Option<String> },
}

impl Projection {
    pub fn alias(self, alias: &str) -> Projection {
        match self {
            Projection::Column { column, .. } => Projection::Column {
                column,
                alias: Some(alias.to_string()),
            },
            Projection::Aggregate { aggregate, .. } => Projection::Aggregate {
                aggregate,
                alias: Some(alias.to_string()),
            },
        }
    }

    /// Column this projection reads, if any.
    pub fn column(&self) -> Option<&ColumnRef> {
        match self {
            Projection::Column { column, .. } => Some(column),
            Projection::Aggregate { aggregate, .. } => aggregate.column.as_ref(),
        }
    }

    pub fn aggregate(&self) -> Option<&Aggregate> {
        match self {
            Projection::Aggregate { aggregate, .. } => Some(aggregate),
            Projection::Column { .. } => None,
        }
    }

    /// Output key. Plain columns are unqualified when the query reads one table.
    pub fn output_name(&self, single_table: bool) -> String {
        match self {
            Projection::Column { alias: Some(a), .. } | Projection::Aggregate { alias: Some(a), .. } => a.clone(),
            Projection::Column { column, alias: None } if single_table => column.name.clone(),
            Projection::Column { column, alias: None } => column.to_string(),
            Projection::Aggregate { aggregate, alias: None } => aggregate.name(),
        }
    }
}

impl From<ColumnRef> for Projection {
    fn from(column: ColumnRef) -> Self {
        Projection::Column { column, alias: None }
    }
}

fn aggregate(func: AggregateFn, column: ColumnRef) -> Projection {
    Projection::Aggregate {
        aggregate: Aggregate { func, column: Some(column) },
        alias: None,
    }
}

pub fn count_star() -> Projection {
    Projection::Aggregate {
        aggregate: Aggregate { func: AggregateFn::Count, column: None },
        alias: None,
    }
}

pub fn count(column: ColumnRef) -> Projection {
    aggregate(AggregateFn::Count, column)
}

pub fn sum_of(column: ColumnRef) -> Projection {
    aggregate(AggregateFn::Sum, column)
}

pub fn avg(column: ColumnRef) -> Projection {
    aggregate(AggregateFn::Avg, column)
}

pub fn min(column: ColumnRef) -> Projection {
    aggregate(AggregateFn::Min, column)
}

pub fn max(column: ColumnRef) -> Projection {
    aggregate(AggregateFn::Max, column)
}

pub fn distinct(column: ColumnRef) -> Projection {
    aggregate(AggregateFn::Distinct, column)
}

pub fn stddev(column: ColumnRef) -> Projection {
    aggregate(AggregateFn::Stddev, column)
}

pub fn geomean(column: ColumnRef) -> Projection {
    aggregate(AggregateFn::Geomean, column)
}

/// One tuple: a row per participating table. A table missing from `rows`
/// is the null-padded side of an outer join.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationEntry {
    rows: BTreeMap<String, Row>,
}

impl RelationEntry {
    pub fn from_row(table: &str, row: Row) -> Self {
        let mut rows = BTreeMap::new();
        rows.insert(table.to_string(), row);
        RelationEntry { rows }
    }

    pub fn get(&self, column: &ColumnRef) -> &Value {
        self.rows.get(&column.table).map_or(&NULL, |r| r.get(&column.name))
    }

    pub fn row(&self, table: &str) -> Option<&Row> {
        self.rows.get(table)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&String, &Row)> {
        self.rows.iter()
    }

    pub fn into_row(mut self, table: &str) -> Option<Row> {
        self.rows.remove(table)
    }

    pub fn combine(left: &RelationEntry, right: &RelationEntry) -> RelationEntry {
        let mut rows = left.rows.clone();
        rows.extend(right.rows.iter().map(|(t, r)| (t.clone(), r.clone())));
        RelationEntry { rows }
    }
}

/// Intermediate result flowing between physical steps.
#[derive(Debug, Clone, Default)]
pub struct Relation {
    pub entries: Vec<RelationEntry>,
    pub tables: BTreeSet<String>,
    /// Aggregate results by `Aggregate::name`.
    pub aggregates: BTreeMap<String, Value>,
    /// Set once the relation stands for a single output row: a group, or the
    /// whole input of an aggregation.
    pub grouped: bool,
}

impl Relation {
    pub fn from_rows(table: &str, rows: Vec<Row>) -> Self {
        Relation {
            entries: rows.into_iter().map(|r| RelationEntry::from_row(table, r)).collect(),
            tables: BTreeSet::from([table.to_string()]),
            ..Default::default()
        }
    }

    pub fn with_entries(tables: BTreeSet<String>, entries: Vec<RelationEntry>) -> Self {
        Relation {
            entries,
            tables,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn row_ids(&self, table: &str) -> Vec<RowId> {
        self.entries.iter().filter_map(|e| e.row(table)).map(|r| r.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    fn relation(values: &[Value]) -> Relation {
        let rows = values
            .iter()
            .enumerate()
            .map(|(i, v)| row!("x" => v.clone()).with_id(i as RowId + 1))
            .collect();
        Relation::from_rows("t", rows)
    }

    fn eval(func: AggregateFn, rel: &Relation) -> Value {
        Aggregate { func, column: Some(col("t", "x")) }.evaluate(rel)
    }

    #[test]
    fn test_aggregates_skip_nulls() {
        let rel = relation(&[Value::Integer(2), Value::Null, Value::Integer(8), Value::Integer(2)]);
        assert_eq!(eval(AggregateFn::Count, &rel), Value::Integer(3));
        assert_eq!(count_star().aggregate().unwrap().evaluate(&rel), Value::Integer(4));
        assert_eq!(eval(AggregateFn::Sum, &rel), Value::Integer(12));
        assert_eq!(eval(AggregateFn::Avg, &rel), Value::Number(4.0));
        assert_eq!(eval(AggregateFn::Min, &rel), Value::Integer(2));
        assert_eq!(eval(AggregateFn::Max, &rel), Value::Integer(8));
        assert_eq!(eval(AggregateFn::Distinct, &rel), Value::Integer(2));
        match eval(AggregateFn::Geomean, &rel) {
            Value::Number(g) => assert!((g - 32f64.cbrt()).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_input() {
        let rel = relation(&[]);
        assert_eq!(eval(AggregateFn::Count, &rel), Value::Integer(0));
        assert_eq!(eval(AggregateFn::Sum, &rel), Value::Null);
        assert_eq!(eval(AggregateFn::Max, &rel), Value::Null);
        assert_eq!(eval(AggregateFn::Stddev, &rel), Value::Null);
    }

    #[test]
    fn test_sample_stddev() {
        let rel = relation(&[Value::Integer(2), Value::Integer(4), Value::Integer(4), Value::Integer(6)]);
        match eval(AggregateFn::Stddev, &rel) {
            Value::Number(s) => assert!((s - (8.0f64 / 3.0).sqrt()).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_output_names() {
        let c: Projection = col("emp", "name").into();
        assert_eq!(c.output_name(true), "name");
        assert_eq!(c.output_name(false), "emp.name");
        assert_eq!(count(col("emp", "id")).output_name(true), "COUNT(emp.id)");
        assert_eq!(max(col("emp", "id")).alias("top").output_name(false), "top");
    }
}
