use std::collections::BTreeSet;
use crate::index::key_range::{KeyRange, KeyRangeSet};
use crate::index::runtime::RuntimeIndex;
use crate::query::predicate::{Predicate, PredicateId};
use crate::schema::schema::{IndexDef, Table};
use crate::storage::state::InMemoryState;

#[derive(Debug, Clone)]
struct BoundColumn {
    set: KeyRangeSet,
    predicates: Vec<PredicateId>,
}

/// How one index could serve a set of key-range compatible predicates.
#[derive(Debug, Clone)]
pub struct IndexRangeCandidate<'a> {
    pub def: &'a IndexDef,
    /// Per indexed column, the intersected ranges of the predicates on it.
    dims: Vec<Option<BoundColumn>>,
}

impl<'a> IndexRangeCandidate<'a> {
    pub fn new(def: &'a IndexDef, predicates: &[&Predicate]) -> Self {
        let dims = def
            .columns
            .iter()
            .map(|indexed| {
                let mut bound: Option<BoundColumn> = None;
                for p in predicates {
                    let on_column = p
                        .range_column()
                        .is_some_and(|c| c.table == def.table && c.name == indexed.name);
                    if !on_column {
                        continue;
                    }
                    let Some(set) = p.key_range_set() else { continue };
                    bound = Some(match bound {
                        None => BoundColumn {
                            set,
                            predicates: vec![p.id()],
                        },
                        Some(mut b) => {
                            b.set = b.set.intersect(&set);
                            b.predicates.push(p.id());
                            b
                        }
                    });
                }
                // A column constrained to everything is no constraint: the
                // index would hand back null keys the predicates reject.
                bound.filter(|b| !b.set.is_all())
            })
            .collect();
        IndexRangeCandidate { def, dims }
    }

    /// Bound columns must form a non-empty prefix of the index.
    pub fn is_usable(&self) -> bool {
        let mut gap = false;
        let mut any = false;
        for dim in &self.dims {
            match dim {
                Some(_) if gap => return false,
                Some(_) => any = true,
                None => gap = true,
            }
        }
        any
    }

    fn bound(&self) -> impl Iterator<Item = &BoundColumn> {
        self.dims.iter().map_while(Option::as_ref)
    }

    /// Cartesian product of the per-column ranges over the bound prefix.
    pub fn key_ranges(&self) -> Vec<KeyRange> {
        let mut out: Vec<KeyRange> = vec![Vec::new()];
        for dim in self.bound() {
            let mut next = Vec::with_capacity(out.len() * dim.set.len());
            for prefix in &out {
                for range in dim.set.ranges() {
                    let mut key = prefix.clone();
                    key.push(range.clone());
                    next.push(key);
                }
            }
            out = next;
        }
        out
    }

    /// Predicates fully answered by the key ranges.
    pub fn consumed(&self) -> BTreeSet<PredicateId> {
        self.bound().flat_map(|b| b.predicates.iter().copied()).collect()
    }

    pub fn cost(&self, index: &dyn RuntimeIndex) -> usize {
        self.cost_within(index, usize::MAX)
    }

    /// Stops counting once the total reaches `budget`.
    pub fn cost_within(&self, index: &dyn RuntimeIndex, budget: usize) -> usize {
        let mut total = 0usize;
        for range in self.key_ranges() {
            total = total.saturating_add(index.cost_within(Some(&range), budget - total));
            if total >= budget {
                break;
            }
        }
        total
    }
}

/// Picks the cheapest usable index of `table` for `predicates`. Ties keep
/// the earlier index, primary key first.
pub fn choose_index<'a>(
    state: &InMemoryState,
    table: &'a Table,
    predicates: &[&Predicate],
) -> Option<IndexRangeCandidate<'a>> {
    let mut candidates: Vec<IndexRangeCandidate<'a>> = table
        .all_indices()
        .map(|def| IndexRangeCandidate::new(def, predicates))
        .filter(IndexRangeCandidate::is_usable)
        .collect();
    if candidates.len() <= 1 {
        return candidates.pop();
    }

    let mut best: Option<(usize, IndexRangeCandidate<'a>)> = None;
    for candidate in candidates {
        let Ok(index) = state.index(&candidate.def.normalized_name()) else {
            continue;
        };
        let budget = best.as_ref().map_or(usize::MAX, |(lowest, _)| *lowest);
        let cost = candidate.cost_within(index, budget);
        if best.as_ref().is_none_or(|(lowest, _)| cost < *lowest) {
            best = Some((cost, candidate));
        }
    }
    best.map(|(_, c)| c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Value;
    use crate::query::relation::col;
    use crate::row;
    use crate::schema::schema::{DataType, Order, Schema, SchemaBuilder, TableBuilder};
    use std::sync::Arc;

    fn schema() -> Schema {
        SchemaBuilder::new("s", 1)
            .table(
                TableBuilder::new("t")
                    .add_column("id", DataType::Integer)
                    .add_column("a", DataType::Integer)
                    .add_column("b", DataType::Integer)
                    .add_column("c", DataType::Integer)
                    .add_primary_key(&["id"])
                    .add_index("idx_ab", &[("a", Order::Asc), ("b", Order::Asc)], false)
                    .add_index("idx_c", &[("c", Order::Asc)], false),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_prefix_rules() {
        let s = schema();
        let t = s.table("t").unwrap();
        let def = t.index("t.idx_ab").unwrap();

        let on_b = col("t", "b").eq(1);
        assert!(!IndexRangeCandidate::new(def, &[&on_b]).is_usable());

        let on_a = col("t", "a").gt(1);
        let c = IndexRangeCandidate::new(def, &[&on_a, &on_b]);
        assert!(c.is_usable());
        assert_eq!(c.consumed().len(), 2);
        assert_eq!(c.key_ranges().len(), 1);
        assert_eq!(c.key_ranges()[0].len(), 2);
    }

    #[test]
    fn test_cartesian_product_of_ranges() {
        let s = schema();
        let def = s.table("t").unwrap().index("t.idx_ab").unwrap();
        let a = col("t", "a").in_list(vec![1, 2]);
        let b = col("t", "b").in_list(vec![5, 6, 7]);
        assert_eq!(IndexRangeCandidate::new(def, &[&a, &b]).key_ranges().len(), 6);
    }

    #[test]
    fn test_cheapest_index_wins() {
        let s = Arc::new(schema());
        let mut state = InMemoryState::new(Arc::clone(&s), 8);
        let rows = (1..=20)
            .map(|i| row!("id" => i, "a" => i % 2, "b" => 0, "c" => i).with_id(i))
            .collect();
        state.load_table("t", rows).unwrap();

        let t = s.table("t").unwrap();
        let on_a = col("t", "a").eq(1);
        let on_c = col("t", "c").eq(Value::Integer(3));
        let chosen = choose_index(&state, t, &[&on_a, &on_c]).unwrap();
        assert_eq!(chosen.def.name, "idx_c");
    }

    #[test]
    fn test_cost_within_gives_up_past_budget() {
        let s = Arc::new(schema());
        let mut state = InMemoryState::new(Arc::clone(&s), 8);
        let rows = (1..=20)
            .map(|i| row!("id" => i, "a" => i % 2, "b" => 0, "c" => i).with_id(i))
            .collect();
        state.load_table("t", rows).unwrap();

        let def = s.table("t").unwrap().index("t.idx_ab").unwrap();
        let index = state.index("t.idx_ab").unwrap();
        let on_a = col("t", "a").in_list(vec![0, 1]);
        let candidate = IndexRangeCandidate::new(def, &[&on_a]);
        assert_eq!(candidate.cost(index), 20);
        assert_eq!(candidate.cost_within(index, 21), 20);
        let capped = candidate.cost_within(index, 5);
        assert!((5..20).contains(&capped), "{}", capped);
    }
}
