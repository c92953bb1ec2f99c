use serde::{Serialize, Deserialize};
use std::collections::BTreeSet;
use crate::core::error::Result;
use crate::core::types::RowId;
use crate::index::btree::BTree;
use crate::index::comparator::Comparator;
use crate::index::key::Key;
use crate::index::key_range::KeyRange;
use crate::index::runtime::{IndexStats, RuntimeIndex};
use crate::schema::schema::Order;

#[derive(Serialize, Deserialize)]
struct SerializedNullable {
    tree: Vec<u8>,
    nulls: Vec<RowId>,
}

/// Single-column index over a nullable column. Null keys live in a side set;
/// everything else goes to the inner tree.
#[derive(Debug, Clone)]
pub struct NullableIndex {
    inner: BTree,
    nulls: BTreeSet<RowId>,
}

impl NullableIndex {
    pub fn new(inner: BTree) -> Self {
        NullableIndex {
            inner,
            nulls: BTreeSet::new(),
        }
    }

    pub fn deserialize(name: &str, bytes: &[u8]) -> Result<Self> {
        let data: SerializedNullable = bincode::deserialize(bytes)?;
        Ok(NullableIndex {
            inner: BTree::deserialize(name, &data.tree)?,
            nulls: data.nulls.into_iter().collect(),
        })
    }

    /// Null only falls inside an unbounded range.
    fn covers_null(ranges: Option<&[KeyRange]>) -> bool {
        match ranges {
            None => true,
            Some(ranges) => ranges
                .iter()
                .any(|r| r.first().is_none_or(|first| first.is_all())),
        }
    }
}

impl RuntimeIndex for NullableIndex {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn add(&mut self, key: Key, value: RowId) -> Result<()> {
        if key.is_null() {
            self.nulls.insert(value);
            Ok(())
        } else {
            self.inner.add(key, value)
        }
    }

    /// Null keys never collide, so setting one only adds `value`.
    fn set(&mut self, key: Key, value: RowId) -> Result<()> {
        if key.is_null() {
            self.nulls.insert(value);
            Ok(())
        } else {
            self.inner.set(key, value)
        }
    }

    fn remove(&mut self, key: &Key, value: Option<RowId>) -> Result<()> {
        if !key.is_null() {
            return self.inner.remove(key, value);
        }
        match value {
            Some(v) => {
                self.nulls.remove(&v);
            }
            None => self.nulls.clear(),
        }
        Ok(())
    }

    fn get(&self, key: &Key) -> Vec<RowId> {
        if key.is_null() {
            self.nulls.iter().copied().collect()
        } else {
            self.inner.get(key)
        }
    }

    fn contains_key(&self, key: &Key) -> bool {
        if key.is_null() {
            !self.nulls.is_empty()
        } else {
            self.inner.contains_key(key)
        }
    }

    fn min(&self) -> Option<(Key, Vec<RowId>)> {
        self.inner.min()
    }

    fn max(&self) -> Option<(Key, Vec<RowId>)> {
        self.inner.max()
    }

    fn get_range(
        &self,
        ranges: Option<&[KeyRange]>,
        reverse: bool,
        limit: Option<usize>,
        skip: Option<usize>,
    ) -> Vec<RowId> {
        if !NullableIndex::covers_null(ranges) || self.nulls.is_empty() {
            return self.inner.get_range(ranges, reverse, limit, skip);
        }
        // Null sorts first in ascending order.
        let nulls_first = (self.inner.comparator().first_order() == Order::Asc) != reverse;
        let tree = self.inner.get_range(ranges, reverse, None, None);
        let nulls = self.nulls.iter().copied();
        let combined: Vec<RowId> = if nulls_first {
            nulls.chain(tree).collect()
        } else {
            tree.into_iter().chain(nulls).collect()
        };
        combined
            .into_iter()
            .skip(skip.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    fn cost(&self, range: Option<&KeyRange>) -> usize {
        self.cost_within(range, usize::MAX)
    }

    fn cost_within(&self, range: Option<&KeyRange>, budget: usize) -> usize {
        let nulls = match range {
            None => self.nulls.len(),
            Some(r) if NullableIndex::covers_null(Some(std::slice::from_ref(r))) => self.nulls.len(),
            Some(_) => 0,
        };
        nulls + self.inner.cost_within(range, budget.saturating_sub(nulls))
    }

    fn is_unique_key(&self) -> bool {
        self.inner.is_unique_key()
    }

    fn comparator(&self) -> &Comparator {
        self.inner.comparator()
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            total_rows: self.inner.stats().total_rows + self.nulls.len(),
        }
    }

    fn clear(&mut self) {
        self.inner.clear();
        self.nulls.clear();
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let data = SerializedNullable {
            tree: self.inner.serialize()?,
            nulls: self.nulls.iter().copied().collect(),
        };
        Ok(bincode::serialize(&data)?)
    }
}
