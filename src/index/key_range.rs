use serde::{Serialize, Deserialize};
use std::cmp::Ordering;
use std::fmt;
use crate::core::types::Value;

/// Interval over one index dimension. A missing bound is unbounded.
///
/// Bounds are always expressed in ascending value order; descending indices
/// read the same range starting from `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleKeyRange {
    pub from: Option<Value>,
    pub to: Option<Value>,
    pub exclude_lower: bool,
    pub exclude_upper: bool,
}

/// One `SingleKeyRange` per index dimension.
pub type KeyRange = Vec<SingleKeyRange>;

impl SingleKeyRange {
    pub fn new(from: Option<Value>, to: Option<Value>, exclude_lower: bool, exclude_upper: bool) -> Self {
        SingleKeyRange {
            exclude_lower: from.is_some() && exclude_lower,
            exclude_upper: to.is_some() && exclude_upper,
            from,
            to,
        }
    }

    pub fn all() -> Self {
        SingleKeyRange::new(None, None, false, false)
    }

    pub fn only(value: Value) -> Self {
        SingleKeyRange::new(Some(value.clone()), Some(value), false, false)
    }

    pub fn lower_bound(value: Value, exclusive: bool) -> Self {
        SingleKeyRange::new(Some(value), None, exclusive, false)
    }

    pub fn upper_bound(value: Value, exclusive: bool) -> Self {
        SingleKeyRange::new(None, Some(value), false, exclusive)
    }

    pub fn is_all(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    pub fn is_only(&self) -> bool {
        match (&self.from, &self.to) {
            (Some(a), Some(b)) => a == b && !self.exclude_lower && !self.exclude_upper,
            _ => false,
        }
    }

    /// False for empty intervals such as `(5, 5)` or `[7, 3]`.
    pub fn is_valid(&self) -> bool {
        match (&self.from, &self.to) {
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Less => true,
                Ordering::Equal => !self.exclude_lower && !self.exclude_upper,
                Ordering::Greater => false,
            },
            _ => true,
        }
    }

    /// Null is only covered by the unbounded range.
    pub fn contains(&self, value: &Value) -> bool {
        if value.is_null() {
            return self.is_all();
        }
        let above_lower = match &self.from {
            None => true,
            Some(from) => match value.cmp(from) {
                Ordering::Greater => true,
                Ordering::Equal => !self.exclude_lower,
                Ordering::Less => false,
            },
        };
        let below_upper = match &self.to {
            None => true,
            Some(to) => match value.cmp(to) {
                Ordering::Less => true,
                Ordering::Equal => !self.exclude_upper,
                Ordering::Greater => false,
            },
        };
        above_lower && below_upper
    }

    /// Ranges covering every non-null value outside `self`, in ascending order.
    pub fn complement(&self) -> Vec<SingleKeyRange> {
        if self.is_all() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(2);
        if let Some(from) = &self.from {
            out.push(SingleKeyRange::upper_bound(from.clone(), !self.exclude_lower));
        }
        if let Some(to) = &self.to {
            out.push(SingleKeyRange::lower_bound(to.clone(), !self.exclude_upper));
        }
        out
    }

    /// Intersection of two ranges, `None` when they do not overlap.
    pub fn and(a: &SingleKeyRange, b: &SingleKeyRange) -> Option<SingleKeyRange> {
        let (from, exclude_lower) = tighter_lower(a, b);
        let (to, exclude_upper) = tighter_upper(a, b);
        let range = SingleKeyRange::new(from, to, exclude_lower, exclude_upper);
        if range.is_valid() { Some(range) } else { None }
    }

    pub fn overlaps(&self, other: &SingleKeyRange) -> bool {
        SingleKeyRange::and(self, other).is_some()
    }

    /// Orders ranges by lower bound; an unbounded lower bound sorts first and
    /// an inclusive bound sorts before an exclusive one on the same value.
    pub fn cmp_lower(&self, other: &SingleKeyRange) -> Ordering {
        match (&self.from, &other.from) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b).then(self.exclude_lower.cmp(&other.exclude_lower)),
        }
    }

    /// True when `next`, which starts at or after `self`, overlaps or touches it.
    fn joins(&self, next: &SingleKeyRange) -> bool {
        match (&self.to, &next.from) {
            (None, _) | (_, None) => true,
            (Some(to), Some(from)) => match to.cmp(from) {
                Ordering::Greater => true,
                Ordering::Equal => !(self.exclude_upper && next.exclude_lower),
                Ordering::Less => false,
            },
        }
    }

    fn extend_upper(&mut self, other: &SingleKeyRange) {
        match (&self.to, &other.to) {
            (None, _) => {}
            (_, None) => {
                self.to = None;
                self.exclude_upper = false;
            }
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Less => {
                    self.to = other.to.clone();
                    self.exclude_upper = other.exclude_upper;
                }
                Ordering::Equal => self.exclude_upper &= other.exclude_upper,
                Ordering::Greater => {}
            },
        }
    }
}

fn tighter_lower(a: &SingleKeyRange, b: &SingleKeyRange) -> (Option<Value>, bool) {
    match (&a.from, &b.from) {
        (None, None) => (None, false),
        (Some(v), None) => (Some(v.clone()), a.exclude_lower),
        (None, Some(v)) => (Some(v.clone()), b.exclude_lower),
        (Some(x), Some(y)) => match x.cmp(y) {
            Ordering::Greater => (Some(x.clone()), a.exclude_lower),
            Ordering::Less => (Some(y.clone()), b.exclude_lower),
            Ordering::Equal => (Some(x.clone()), a.exclude_lower || b.exclude_lower),
        },
    }
}

fn tighter_upper(a: &SingleKeyRange, b: &SingleKeyRange) -> (Option<Value>, bool) {
    match (&a.to, &b.to) {
        (None, None) => (None, false),
        (Some(v), None) => (Some(v.clone()), a.exclude_upper),
        (None, Some(v)) => (Some(v.clone()), b.exclude_upper),
        (Some(x), Some(y)) => match x.cmp(y) {
            Ordering::Less => (Some(x.clone()), a.exclude_upper),
            Ordering::Greater => (Some(y.clone()), b.exclude_upper),
            Ordering::Equal => (Some(x.clone()), a.exclude_upper || b.exclude_upper),
        },
    }
}

impl fmt::Display for SingleKeyRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let open = if self.exclude_lower { "(" } else { "[" };
        let close = if self.exclude_upper { ")" } else { "]" };
        let from = self.from.as_ref().map_or("unbound".to_string(), |v| v.to_string());
        let to = self.to.as_ref().map_or("unbound".to_string(), |v| v.to_string());
        write!(f, "{}{}, {}{}", open, from, to, close)
    }
}

/// Sorted, disjoint, merged set of ranges over one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRangeSet {
    ranges: Vec<SingleKeyRange>,
}

impl KeyRangeSet {
    pub fn new(ranges: Vec<SingleKeyRange>) -> Self {
        let mut ranges: Vec<SingleKeyRange> = ranges.into_iter().filter(|r| r.is_valid()).collect();
        ranges.sort_by(|a, b| a.cmp_lower(b));

        let mut merged: Vec<SingleKeyRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.joins(&range) => last.extend_upper(&range),
                _ => merged.push(range),
            }
        }
        KeyRangeSet { ranges: merged }
    }

    pub fn all() -> Self {
        KeyRangeSet { ranges: vec![SingleKeyRange::all()] }
    }

    pub fn empty() -> Self {
        KeyRangeSet { ranges: Vec::new() }
    }

    pub fn ranges(&self) -> &[SingleKeyRange] {
        &self.ranges
    }

    pub fn into_ranges(self) -> Vec<SingleKeyRange> {
        self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_all(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].is_all()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.ranges.iter().any(|r| r.contains(value))
    }

    /// Gaps between the ranges, plus the unbounded ends.
    pub fn complement(&self) -> KeyRangeSet {
        if self.ranges.is_empty() {
            return KeyRangeSet::all();
        }
        let mut gaps = Vec::new();
        let mut lower: Option<(Value, bool)> = None;
        let mut open_low = true;

        for range in &self.ranges {
            if let Some(from) = &range.from {
                let (gap_from, gap_excl) = match (&lower, open_low) {
                    (_, true) => (None, false),
                    (Some((v, e)), false) => (Some(v.clone()), *e),
                    (None, false) => (None, false),
                };
                gaps.push(SingleKeyRange::new(gap_from, Some(from.clone()), gap_excl, !range.exclude_lower));
            }
            open_low = false;
            match &range.to {
                Some(to) => lower = Some((to.clone(), !range.exclude_upper)),
                None => return KeyRangeSet::new(gaps),
            }
        }
        if let Some((v, excl)) = lower {
            gaps.push(SingleKeyRange::lower_bound(v, excl));
        }
        KeyRangeSet::new(gaps)
    }

    pub fn intersect(&self, other: &KeyRangeSet) -> KeyRangeSet {
        let mut out = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                if let Some(r) = SingleKeyRange::and(a, b) {
                    out.push(r);
                }
            }
        }
        KeyRangeSet::new(out)
    }

    pub fn union(&self, other: &KeyRangeSet) -> KeyRangeSet {
        let mut all = self.ranges.clone();
        all.extend(other.ranges.iter().cloned());
        KeyRangeSet::new(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn int(v: i64) -> Value {
        Value::Integer(v)
    }

    #[test]
    fn test_contains_bounds() {
        let r = SingleKeyRange::new(Some(int(1)), Some(int(5)), true, false);
        assert!(!r.contains(&int(1)));
        assert!(r.contains(&int(5)));
        assert!(!r.contains(&Value::Null));
        assert!(SingleKeyRange::all().contains(&Value::Null));
    }

    #[test]
    fn test_complement_of_only() {
        let c = SingleKeyRange::only(int(3)).complement();
        assert_eq!(c.len(), 2);
        assert!(c[0].contains(&int(2)) && !c[0].contains(&int(3)));
        assert!(c[1].contains(&int(4)) && !c[1].contains(&int(3)));
        assert!(SingleKeyRange::all().complement().is_empty());
    }

    #[test]
    fn test_merge_touching_ranges() {
        let set = KeyRangeSet::new(vec![
            SingleKeyRange::new(Some(int(2)), Some(int(3)), false, false),
            SingleKeyRange::new(Some(int(1)), Some(int(2)), false, true),
            SingleKeyRange::new(Some(int(7)), Some(int(9)), true, true),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.ranges()[0], SingleKeyRange::new(Some(int(1)), Some(int(3)), false, false));

        let apart = KeyRangeSet::new(vec![
            SingleKeyRange::new(Some(int(1)), Some(int(2)), false, true),
            SingleKeyRange::new(Some(int(2)), Some(int(3)), true, false),
        ]);
        assert_eq!(apart.len(), 2);
    }

    #[test]
    fn test_intersect_sets() {
        let a = KeyRangeSet::new(vec![SingleKeyRange::lower_bound(int(5), false)]);
        let b = KeyRangeSet::new(vec![
            SingleKeyRange::only(int(3)),
            SingleKeyRange::only(int(6)),
            SingleKeyRange::only(int(8)),
        ]);
        let both = a.intersect(&b);
        assert_eq!(both.len(), 2);
        assert!(both.contains(&int(6)) && both.contains(&int(8)) && !both.contains(&int(3)));
    }

    fn arb_range() -> impl Strategy<Value = SingleKeyRange> {
        (
            proptest::option::of(-20i64..20),
            proptest::option::of(-20i64..20),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(a, b, el, eu)| {
                let (from, to) = match (a, b) {
                    (Some(x), Some(y)) if x > y => (Some(y), Some(x)),
                    other => other,
                };
                SingleKeyRange::new(from.map(Value::Integer), to.map(Value::Integer), el, eu)
            })
            .prop_filter("non-empty", |r| r.is_valid())
    }

    proptest! {
        #[test]
        fn prop_complement_never_overlaps(r in arb_range()) {
            for c in r.complement() {
                prop_assert!(!c.overlaps(&r));
            }
        }

        #[test]
        fn prop_and_empty_iff_disjoint(a in arb_range(), b in arb_range()) {
            // Half steps catch open intervals between adjacent integers.
            let shared = (-42i64..=42)
                .map(|v| Value::Number(v as f64 / 2.0))
                .any(|v| a.contains(&v) && b.contains(&v));
            prop_assert_eq!(SingleKeyRange::and(&a, &b).is_some(), shared);
        }

        #[test]
        fn prop_double_complement(ranges in proptest::collection::vec(arb_range(), 0..5)) {
            let set = KeyRangeSet::new(ranges);
            prop_assert_eq!(set.complement().complement(), set);
        }

        #[test]
        fn prop_set_membership_matches_parts(ranges in proptest::collection::vec(arb_range(), 0..5), v in -21i64..=21) {
            let expected = ranges.iter().any(|r| r.contains(&int(v)));
            let set = KeyRangeSet::new(ranges);
            prop_assert_eq!(set.contains(&int(v)), expected);
            prop_assert_eq!(set.complement().contains(&int(v)), !expected);
        }
    }
}
