use serde::{Serialize, Deserialize};
use std::cmp::Ordering;
use crate::core::types::Value;
use crate::index::key::Key;
use crate::index::key_range::{KeyRange, SingleKeyRange};
use crate::schema::schema::{IndexDef, Order};

/// Defines the order of keys inside a tree.
///
/// Multi-dimension comparators compare dimension by dimension and stop at the
/// first non-tie. Range scans locate their start position through the first
/// dimension only, then filter the remaining dimensions per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Simple(Order),
    Multi(Vec<Order>),
    /// Multi-column keys where some columns may hold null.
    MultiNullable(Vec<Order>),
}

fn directed(order: Order, a: &Value, b: &Value) -> Ordering {
    match order {
        Order::Asc => a.cmp(b),
        Order::Desc => b.cmp(a),
    }
}

impl Comparator {
    pub fn for_index(def: &IndexDef) -> Self {
        let orders: Vec<Order> = def.columns.iter().map(|c| c.order).collect();
        if orders.len() == 1 {
            Comparator::Simple(orders[0])
        } else if def.nullable {
            Comparator::MultiNullable(orders)
        } else {
            Comparator::Multi(orders)
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Comparator::Simple(_) => 1,
            Comparator::Multi(o) | Comparator::MultiNullable(o) => o.len(),
        }
    }

    pub fn orders(&self) -> Vec<Order> {
        match self {
            Comparator::Simple(o) => vec![*o],
            Comparator::Multi(o) | Comparator::MultiNullable(o) => o.clone(),
        }
    }

    pub fn first_order(&self) -> Order {
        match self {
            Comparator::Simple(o) => *o,
            Comparator::Multi(o) | Comparator::MultiNullable(o) => o.first().copied().unwrap_or(Order::Asc),
        }
    }

    /// Whether a key of this shape may be stored. Only the nullable
    /// multi-column comparator tolerates null components.
    pub fn accepts(&self, key: &Key) -> bool {
        match (self, key) {
            (Comparator::Simple(_), Key::Single(_)) => true,
            (Comparator::Multi(o), Key::Multi(vs)) => o.len() == vs.len() && !key.has_null(),
            (Comparator::MultiNullable(o), Key::Multi(vs)) => o.len() == vs.len(),
            _ => false,
        }
    }

    /// Total order of keys in the tree.
    pub fn compare(&self, a: &Key, b: &Key) -> Ordering {
        match (self, a, b) {
            (Comparator::Simple(o), Key::Single(x), Key::Single(y)) => directed(*o, x, y),
            (Comparator::Multi(orders), Key::Multi(xs), Key::Multi(ys))
            | (Comparator::MultiNullable(orders), Key::Multi(xs), Key::Multi(ys)) => {
                for ((o, x), y) in orders.iter().zip(xs).zip(ys) {
                    let ord = directed(*o, x, y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                xs.len().cmp(&ys.len())
            }
            _ => a.cmp(b),
        }
    }

    /// Compares the first dimension of `key` against `bound` in tree order.
    pub fn compare_first(&self, key: &Key, bound: &Value) -> Ordering {
        directed(self.first_order(), key.first(), bound)
    }

    pub fn is_in_range(&self, key: &Key, range: &KeyRange) -> bool {
        range
            .iter()
            .enumerate()
            .all(|(i, r)| key.dimension(i).map_or(false, |v| r.contains(v)))
    }

    /// First-dimension bound where a scan in tree order begins, `None` when left open.
    pub fn range_start<'a>(&self, range: &'a KeyRange) -> Option<&'a Value> {
        let first = range.first()?;
        match self.first_order() {
            Order::Asc => first.from.as_ref(),
            Order::Desc => first.to.as_ref(),
        }
    }

    pub fn is_left_open(&self, range: &KeyRange) -> bool {
        self.range_start(range).is_none()
    }

    /// True once `key` lies beyond the range's first dimension in tree order.
    /// No later key can match.
    pub fn past_end(&self, key: &Key, range: &KeyRange) -> bool {
        let Some(first) = range.first() else {
            return false;
        };
        let (bound, exclusive) = match self.first_order() {
            Order::Asc => (&first.to, first.exclude_upper),
            Order::Desc => (&first.from, first.exclude_lower),
        };
        match bound {
            None => false,
            Some(b) => match self.compare_first(key, b) {
                Ordering::Greater => true,
                Ordering::Equal => exclusive,
                Ordering::Less => false,
            },
        }
    }

    /// Sorts ranges by where a tree-order scan starts for each of them.
    pub fn sort_ranges(&self, ranges: &mut [KeyRange]) {
        let order = self.first_order();
        ranges.sort_by(|a, b| {
            let ra = a.first().cloned().unwrap_or_else(SingleKeyRange::all);
            let rb = b.first().cloned().unwrap_or_else(SingleKeyRange::all);
            match order {
                Order::Asc => ra.cmp_lower(&rb),
                Order::Desc => match (&ra.to, &rb.to) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (Some(x), Some(y)) => y.cmp(x).then(ra.exclude_upper.cmp(&rb.exclude_upper)),
                },
            }
        });
    }
}
