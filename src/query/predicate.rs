use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use regex::Regex;
use crate::core::error::{Error, Result};
use crate::core::types::Value;
use crate::index::key_range::{KeyRangeSet, SingleKeyRange};
use crate::query::relation::{ColumnRef, Relation, RelationEntry};

pub type PredicateId = u64;

static NEXT_PREDICATE_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> PredicateId {
    NEXT_PREDICATE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalType {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Between,
    In,
    Like,
    Match,
    IsNull,
    IsNotNull,
}

impl EvalType {
    fn symbol(&self) -> &'static str {
        match self {
            EvalType::Eq => "=",
            EvalType::Neq => "!=",
            EvalType::Lt => "<",
            EvalType::Lte => "<=",
            EvalType::Gt => ">",
            EvalType::Gte => ">=",
            EvalType::Between => "between",
            EvalType::In => "in",
            EvalType::Like => "like",
            EvalType::Match => "match",
            EvalType::IsNull => "is null",
            EvalType::IsNotNull => "is not null",
        }
    }

    /// Evaluator with the operands swapped: `a < b` iff `b > a`.
    fn flipped(self) -> EvalType {
        match self {
            EvalType::Lt => EvalType::Gt,
            EvalType::Lte => EvalType::Gte,
            EvalType::Gt => EvalType::Lt,
            EvalType::Gte => EvalType::Lte,
            other => other,
        }
    }

    fn inverse(self) -> EvalType {
        match self {
            EvalType::Eq => EvalType::Neq,
            EvalType::Neq => EvalType::Eq,
            EvalType::Lt => EvalType::Gte,
            EvalType::Gte => EvalType::Lt,
            EvalType::Lte => EvalType::Gt,
            EvalType::Gt => EvalType::Lte,
            EvalType::IsNull => EvalType::IsNotNull,
            EvalType::IsNotNull => EvalType::IsNull,
            other => other,
        }
    }

    fn compare(self, a: &Value, b: &Value) -> bool {
        match self {
            EvalType::Eq => a == b,
            EvalType::Neq => a != b,
            EvalType::Lt => a < b,
            EvalType::Lte => a <= b,
            EvalType::Gt => a > b,
            EvalType::Gte => a >= b,
            _ => false,
        }
    }
}

/// Operand value, or a placeholder filled in by `bind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bindable {
    Value(Value),
    Param(usize),
}

impl Bindable {
    pub fn bound(&self) -> Option<&Value> {
        match self {
            Bindable::Value(v) => Some(v),
            Bindable::Param(_) => None,
        }
    }

    pub fn bind(&self, params: &[Value]) -> Result<Bindable> {
        match self {
            Bindable::Value(v) => Ok(Bindable::Value(v.clone())),
            Bindable::Param(i) => params
                .get(*i)
                .map(|v| Bindable::Value(v.clone()))
                .ok_or_else(|| Error::invalid_argument(format!("no value bound for parameter {}", i))),
        }
    }
}

impl fmt::Display for Bindable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Bindable::Value(v) => write!(f, "{}", v),
            Bindable::Param(i) => write!(f, "?{}", i),
        }
    }
}

/// Placeholder for the `i`-th bound value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param(pub usize);

pub fn param(index: usize) -> Param {
    Param(index)
}

pub trait IntoBindable {
    fn into_bindable(self) -> Bindable;
}

impl IntoBindable for Param {
    fn into_bindable(self) -> Bindable {
        Bindable::Param(self.0)
    }
}

impl IntoBindable for Bindable {
    fn into_bindable(self) -> Bindable {
        self
    }
}

macro_rules! bindable_value {
    ($($t:ty),*) => {
        $(impl IntoBindable for $t {
            fn into_bindable(self) -> Bindable {
                Bindable::Value(Value::from(self))
            }
        })*
    };
}

bindable_value!(Value, i64, i32, f64, bool, &str, String, DateTime<Utc>);

#[derive(Debug, Clone)]
pub enum Operand {
    None,
    Single(Bindable),
    Pair(Bindable, Bindable),
    List(Vec<Bindable>),
}

impl Operand {
    fn values(&self) -> Vec<&Bindable> {
        match self {
            Operand::None => Vec::new(),
            Operand::Single(b) => vec![b],
            Operand::Pair(a, b) => vec![a, b],
            Operand::List(bs) => bs.iter().collect(),
        }
    }

    fn bind(&self, params: &[Value]) -> Result<Operand> {
        Ok(match self {
            Operand::None => Operand::None,
            Operand::Single(b) => Operand::Single(b.bind(params)?),
            Operand::Pair(a, b) => Operand::Pair(a.bind(params)?, b.bind(params)?),
            Operand::List(bs) => Operand::List(bs.iter().map(|b| b.bind(params)).collect::<Result<_>>()?),
        })
    }
}

/// Column compared against literal operands.
#[derive(Debug, Clone)]
pub struct ValuePredicate {
    pub id: PredicateId,
    pub column: ColumnRef,
    pub eval: EvalType,
    pub operand: Operand,
    /// Only `Between`, `In`, `Like` and `Match` carry a negation flag; the
    /// comparison evaluators are inverted in place.
    pub negated: bool,
    pattern: Option<Regex>,
}

fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}

impl ValuePredicate {
    fn new(column: ColumnRef, eval: EvalType, operand: Operand) -> Self {
        let mut pred = ValuePredicate {
            id: next_id(),
            column,
            eval,
            operand,
            negated: false,
            pattern: None,
        };
        pred.pattern = pred.compile_pattern().ok().flatten();
        pred
    }

    fn compile_pattern(&self) -> Result<Option<Regex>> {
        let text = match (&self.eval, &self.operand) {
            (EvalType::Like, Operand::Single(Bindable::Value(Value::String(s)))) => like_to_regex(s),
            (EvalType::Match, Operand::Single(Bindable::Value(Value::String(s)))) => s.clone(),
            (EvalType::Like | EvalType::Match, Operand::Single(Bindable::Value(v))) => {
                return Err(Error::invalid_argument(format!(
                    "{} on {} needs a string pattern, got {}",
                    self.eval.symbol(),
                    self.column,
                    v
                )));
            }
            _ => return Ok(None),
        };
        Regex::new(&text)
            .map(Some)
            .map_err(|e| Error::invalid_argument(format!("bad pattern for {}: {}", self.column, e)))
    }

    /// Fails when a pattern operand does not compile.
    pub fn validate(&self) -> Result<()> {
        if self.is_bound() {
            self.compile_pattern()?;
        }
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.operand.values().iter().all(|b| b.bound().is_some())
    }

    pub fn bind(&self, params: &[Value]) -> Result<ValuePredicate> {
        let mut bound = ValuePredicate {
            operand: self.operand.bind(params)?,
            pattern: None,
            ..self.clone()
        };
        bound.pattern = bound.compile_pattern()?;
        Ok(bound)
    }

    fn not(mut self) -> Self {
        match self.eval {
            EvalType::Between | EvalType::In | EvalType::Like | EvalType::Match => self.negated = !self.negated,
            other => self.eval = other.inverse(),
        }
        self
    }

    /// Null column values never satisfy a comparison, negated or not.
    pub fn eval_value(&self, value: &Value) -> bool {
        let hit = match self.eval {
            EvalType::IsNull => return value.is_null(),
            EvalType::IsNotNull => return !value.is_null(),
            _ if value.is_null() => return false,
            EvalType::Between => match &self.operand {
                Operand::Pair(Bindable::Value(lo), Bindable::Value(hi)) if !lo.is_null() && !hi.is_null() => {
                    lo <= value && value <= hi
                }
                _ => return false,
            },
            EvalType::In => match &self.operand {
                Operand::List(items) => items.iter().filter_map(|b| b.bound()).any(|v| !v.is_null() && v == value),
                _ => return false,
            },
            EvalType::Like | EvalType::Match => match (&self.pattern, value.as_str()) {
                (Some(re), Some(s)) => re.is_match(s),
                _ => return false,
            },
            eval => match &self.operand {
                Operand::Single(Bindable::Value(operand)) if !operand.is_null() => eval.compare(value, operand),
                _ => return false,
            },
        };
        hit != self.negated
    }

    pub fn is_key_range_compatible(&self) -> bool {
        let operands = self.operand.values();
        matches!(
            self.eval,
            EvalType::Eq | EvalType::Lt | EvalType::Lte | EvalType::Gt | EvalType::Gte | EvalType::Between | EvalType::In
        ) && !operands.is_empty()
            && operands.iter().all(|b| b.bound().is_some_and(|v| !v.is_null()))
    }

    /// Key ranges selecting exactly the non-null values this predicate accepts.
    pub fn key_range_set(&self) -> Option<KeyRangeSet> {
        if !self.is_key_range_compatible() {
            return None;
        }
        let single = |b: &Bindable| b.bound().cloned().unwrap_or(Value::Null);
        let set = match (&self.eval, &self.operand) {
            (EvalType::Eq, Operand::Single(v)) => KeyRangeSet::new(vec![SingleKeyRange::only(single(v))]),
            (EvalType::Lt, Operand::Single(v)) => KeyRangeSet::new(vec![SingleKeyRange::upper_bound(single(v), true)]),
            (EvalType::Lte, Operand::Single(v)) => KeyRangeSet::new(vec![SingleKeyRange::upper_bound(single(v), false)]),
            (EvalType::Gt, Operand::Single(v)) => KeyRangeSet::new(vec![SingleKeyRange::lower_bound(single(v), true)]),
            (EvalType::Gte, Operand::Single(v)) => KeyRangeSet::new(vec![SingleKeyRange::lower_bound(single(v), false)]),
            (EvalType::Between, Operand::Pair(lo, hi)) => {
                KeyRangeSet::new(vec![SingleKeyRange::new(Some(single(lo)), Some(single(hi)), false, false)])
            }
            (EvalType::In, Operand::List(items)) => {
                KeyRangeSet::new(items.iter().map(|b| SingleKeyRange::only(single(b))).collect())
            }
            _ => return None,
        };
        Some(if self.negated { set.complement() } else { set })
    }
}

/// Comparison between columns of two tables.
#[derive(Debug, Clone)]
pub struct JoinPredicate {
    pub id: PredicateId,
    pub left: ColumnRef,
    pub right: ColumnRef,
    pub eval: EvalType,
}

impl JoinPredicate {
    /// Same predicate with the columns swapped.
    pub fn reversed(&self) -> JoinPredicate {
        JoinPredicate {
            id: self.id,
            left: self.right.clone(),
            right: self.left.clone(),
            eval: self.eval.flipped(),
        }
    }

    pub fn eval_values(&self, left: &Value, right: &Value) -> bool {
        !left.is_null() && !right.is_null() && self.eval.compare(left, right)
    }

    /// Orients the predicate so `left` reads from `tables`.
    pub fn oriented(&self, tables: &BTreeSet<String>) -> JoinPredicate {
        if tables.contains(&self.left.table) {
            self.clone()
        } else {
            self.reversed()
        }
    }

    /// Joins two relations. With `outer` set, left entries without a match
    /// are kept with the right side padded with nulls.
    pub fn join(&self, left: &Relation, right: &Relation, outer: bool) -> Relation {
        let pred = self.oriented(&left.tables);
        let mut entries = Vec::new();

        if pred.eval == EvalType::Eq {
            let mut by_value: BTreeMap<&Value, Vec<&RelationEntry>> = BTreeMap::new();
            for entry in &right.entries {
                let v = entry.get(&pred.right);
                if !v.is_null() {
                    by_value.entry(v).or_default().push(entry);
                }
            }
            for l in &left.entries {
                let v = l.get(&pred.left);
                match by_value.get(v).filter(|_| !v.is_null()) {
                    Some(matches) => entries.extend(matches.iter().map(|r| RelationEntry::combine(l, r))),
                    None if outer => entries.push(l.clone()),
                    None => {}
                }
            }
        } else {
            for l in &left.entries {
                let before = entries.len();
                for r in &right.entries {
                    if pred.eval_values(l.get(&pred.left), r.get(&pred.right)) {
                        entries.push(RelationEntry::combine(l, r));
                    }
                }
                if outer && entries.len() == before {
                    entries.push(l.clone());
                }
            }
        }

        let tables = left.tables.union(&right.tables).cloned().collect();
        Relation::with_entries(tables, entries)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinedOp {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub struct CombinedPredicate {
    pub id: PredicateId,
    pub op: CombinedOp,
    pub children: Vec<Predicate>,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Value(ValuePredicate),
    Join(JoinPredicate),
    Combined(CombinedPredicate),
}

impl Predicate {
    pub fn id(&self) -> PredicateId {
        match self {
            Predicate::Value(p) => p.id,
            Predicate::Join(p) => p.id,
            Predicate::Combined(p) => p.id,
        }
    }

    pub fn columns(&self) -> Vec<&ColumnRef> {
        match self {
            Predicate::Value(p) => vec![&p.column],
            Predicate::Join(p) => vec![&p.left, &p.right],
            Predicate::Combined(p) => p.children.iter().flat_map(|c| c.columns()).collect(),
        }
    }

    pub fn tables(&self) -> BTreeSet<String> {
        self.columns().into_iter().map(|c| c.table.clone()).collect()
    }

    /// Negation, pushed down to the leaves.
    pub fn not(self) -> Predicate {
        match self {
            Predicate::Value(p) => Predicate::Value(p.not()),
            Predicate::Join(mut p) => {
                p.eval = p.eval.inverse();
                Predicate::Join(p)
            }
            Predicate::Combined(p) => Predicate::Combined(CombinedPredicate {
                id: p.id,
                op: match p.op {
                    CombinedOp::And => CombinedOp::Or,
                    CombinedOp::Or => CombinedOp::And,
                },
                children: p.children.into_iter().map(Predicate::not).collect(),
            }),
        }
    }

    pub fn eval_entry(&self, entry: &RelationEntry) -> bool {
        match self {
            Predicate::Value(p) => p.eval_value(entry.get(&p.column)),
            Predicate::Join(p) => p.eval_values(entry.get(&p.left), entry.get(&p.right)),
            Predicate::Combined(p) => match p.op {
                CombinedOp::And => p.children.iter().all(|c| c.eval_entry(entry)),
                CombinedOp::Or => p.children.iter().any(|c| c.eval_entry(entry)),
            },
        }
    }

    pub fn filter(&self, relation: Relation) -> Relation {
        let Relation {
            entries,
            tables,
            aggregates,
            grouped,
        } = relation;
        Relation {
            entries: entries.into_iter().filter(|e| self.eval_entry(e)).collect(),
            tables,
            aggregates,
            grouped,
        }
    }

    pub fn bind(&self, params: &[Value]) -> Result<Predicate> {
        Ok(match self {
            Predicate::Value(p) => Predicate::Value(p.bind(params)?),
            Predicate::Join(p) => Predicate::Join(p.clone()),
            Predicate::Combined(p) => Predicate::Combined(CombinedPredicate {
                id: p.id,
                op: p.op,
                children: p.children.iter().map(|c| c.bind(params)).collect::<Result<_>>()?,
            }),
        })
    }

    pub fn is_bound(&self) -> bool {
        match self {
            Predicate::Value(p) => p.is_bound(),
            Predicate::Join(_) => true,
            Predicate::Combined(p) => p.children.iter().all(Predicate::is_bound),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Predicate::Value(p) => p.validate(),
            Predicate::Join(p) => match p.eval {
                EvalType::Eq | EvalType::Neq | EvalType::Lt | EvalType::Lte | EvalType::Gt | EvalType::Gte => Ok(()),
                other => Err(Error::invalid_argument(format!(
                    "join predicate {} cannot use {}",
                    p.id,
                    other.symbol()
                ))),
            },
            Predicate::Combined(p) if p.children.is_empty() => {
                Err(Error::invalid_argument("combined predicate needs at least one child"))
            }
            Predicate::Combined(p) => p.children.iter().try_for_each(Predicate::validate),
        }
    }

    /// Splits nested conjunctions into their terms.
    pub fn into_conjuncts(self) -> Vec<Predicate> {
        match self {
            Predicate::Combined(p) if p.op == CombinedOp::And => {
                p.children.into_iter().flat_map(Predicate::into_conjuncts).collect()
            }
            other => vec![other],
        }
    }

    /// The one column a key-range compatible predicate constrains.
    pub fn range_column(&self) -> Option<&ColumnRef> {
        match self {
            Predicate::Value(p) if p.is_key_range_compatible() => Some(&p.column),
            Predicate::Combined(p) if p.op == CombinedOp::Or => {
                let first = p.children.first()?.range_column()?;
                p.children
                    .iter()
                    .all(|c| c.range_column() == Some(first))
                    .then_some(first)
            }
            _ => None,
        }
    }

    pub fn is_key_range_compatible(&self) -> bool {
        self.range_column().is_some()
    }

    pub fn key_range_set(&self) -> Option<KeyRangeSet> {
        self.range_column()?;
        match self {
            Predicate::Value(p) => p.key_range_set(),
            Predicate::Combined(p) => p
                .children
                .iter()
                .map(Predicate::key_range_set)
                .try_fold(KeyRangeSet::empty(), |acc, set| set.map(|s| acc.union(&s))),
            Predicate::Join(_) => None,
        }
    }

    pub fn as_join(&self) -> Option<&JoinPredicate> {
        match self {
            Predicate::Join(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Predicate::Value(p) => {
                if p.negated {
                    write!(f, "not ")?;
                }
                match &p.operand {
                    Operand::None => write!(f, "{} {}", p.column, p.eval.symbol()),
                    Operand::Single(v) => write!(f, "{} {} {}", p.column, p.eval.symbol(), v),
                    Operand::Pair(a, b) => write!(f, "{} between [{}, {}]", p.column, a, b),
                    Operand::List(items) => {
                        let items: Vec<String> = items.iter().map(|b| b.to_string()).collect();
                        write!(f, "{} in ({})", p.column, items.join(", "))
                    }
                }
            }
            Predicate::Join(p) => write!(f, "{} {} {}", p.left, p.eval.symbol(), p.right),
            Predicate::Combined(p) => {
                let sep = match p.op {
                    CombinedOp::And => " and ",
                    CombinedOp::Or => " or ",
                };
                let parts: Vec<String> = p.children.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(sep))
            }
        }
    }
}

fn value_pred(column: &ColumnRef, eval: EvalType, operand: Operand) -> Predicate {
    Predicate::Value(ValuePredicate::new(column.clone(), eval, operand))
}

fn join_pred(left: &ColumnRef, right: ColumnRef, eval: EvalType) -> Predicate {
    Predicate::Join(JoinPredicate {
        id: next_id(),
        left: left.clone(),
        right,
        eval,
    })
}

impl ColumnRef {
    pub fn eq(&self, v: impl IntoBindable) -> Predicate {
        value_pred(self, EvalType::Eq, Operand::Single(v.into_bindable()))
    }

    pub fn neq(&self, v: impl IntoBindable) -> Predicate {
        value_pred(self, EvalType::Neq, Operand::Single(v.into_bindable()))
    }

    pub fn lt(&self, v: impl IntoBindable) -> Predicate {
        value_pred(self, EvalType::Lt, Operand::Single(v.into_bindable()))
    }

    pub fn lte(&self, v: impl IntoBindable) -> Predicate {
        value_pred(self, EvalType::Lte, Operand::Single(v.into_bindable()))
    }

    pub fn gt(&self, v: impl IntoBindable) -> Predicate {
        value_pred(self, EvalType::Gt, Operand::Single(v.into_bindable()))
    }

    pub fn gte(&self, v: impl IntoBindable) -> Predicate {
        value_pred(self, EvalType::Gte, Operand::Single(v.into_bindable()))
    }

    /// Inclusive on both ends.
    pub fn between(&self, lo: impl IntoBindable, hi: impl IntoBindable) -> Predicate {
        value_pred(self, EvalType::Between, Operand::Pair(lo.into_bindable(), hi.into_bindable()))
    }

    pub fn in_list<T: IntoBindable>(&self, items: Vec<T>) -> Predicate {
        let items = items.into_iter().map(IntoBindable::into_bindable).collect();
        value_pred(self, EvalType::In, Operand::List(items))
    }

    /// SQL pattern: `%` matches any run of characters, `_` exactly one.
    pub fn like(&self, pattern: impl IntoBindable) -> Predicate {
        value_pred(self, EvalType::Like, Operand::Single(pattern.into_bindable()))
    }

    pub fn matches(&self, regex: impl IntoBindable) -> Predicate {
        value_pred(self, EvalType::Match, Operand::Single(regex.into_bindable()))
    }

    pub fn is_null(&self) -> Predicate {
        value_pred(self, EvalType::IsNull, Operand::None)
    }

    pub fn is_not_null(&self) -> Predicate {
        value_pred(self, EvalType::IsNotNull, Operand::None)
    }

    pub fn eq_col(&self, other: ColumnRef) -> Predicate {
        join_pred(self, other, EvalType::Eq)
    }

    pub fn neq_col(&self, other: ColumnRef) -> Predicate {
        join_pred(self, other, EvalType::Neq)
    }

    pub fn lt_col(&self, other: ColumnRef) -> Predicate {
        join_pred(self, other, EvalType::Lt)
    }

    pub fn lte_col(&self, other: ColumnRef) -> Predicate {
        join_pred(self, other, EvalType::Lte)
    }

    pub fn gt_col(&self, other: ColumnRef) -> Predicate {
        join_pred(self, other, EvalType::Gt)
    }

    pub fn gte_col(&self, other: ColumnRef) -> Predicate {
        join_pred(self, other, EvalType::Gte)
    }
}

pub fn and(children: Vec<Predicate>) -> Predicate {
    Predicate::Combined(CombinedPredicate {
        id: next_id(),
        op: CombinedOp::And,
        children,
    })
}

pub fn or(children: Vec<Predicate>) -> Predicate {
    Predicate::Combined(CombinedPredicate {
        id: next_id(),
        op: CombinedOp::Or,
        children,
    })
}

pub fn not(predicate: Predicate) -> Predicate {
    predicate.not()
}
