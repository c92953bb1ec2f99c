use std::fmt;
use crate::core::error::Result;
use crate::core::types::RowId;
use crate::index::comparator::Comparator;
use crate::index::key::Key;
use crate::index::key_range::KeyRange;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub total_rows: usize,
}

/// Ordered key to row-id mapping kept in memory for one index.
pub trait RuntimeIndex: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Fails with `DuplicateKey` when a unique index already holds `key`.
    fn add(&mut self, key: Key, value: RowId) -> Result<()>;

    /// Replaces whatever `key` maps to.
    fn set(&mut self, key: Key, value: RowId) -> Result<()>;

    /// Removes one row id, or the whole key when `value` is `None`.
    fn remove(&mut self, key: &Key, value: Option<RowId>) -> Result<()>;

    fn get(&self, key: &Key) -> Vec<RowId>;

    fn contains_key(&self, key: &Key) -> bool;

    fn min(&self) -> Option<(Key, Vec<RowId>)>;

    fn max(&self) -> Option<(Key, Vec<RowId>)>;

    /// Row ids for keys covered by any of `ranges` (all keys when `None`), in
    /// index order or reversed, after skipping `skip` and keeping `limit`.
    fn get_range(
        &self,
        ranges: Option<&[KeyRange]>,
        reverse: bool,
        limit: Option<usize>,
        skip: Option<usize>,
    ) -> Vec<RowId>;

    /// Number of row ids `range` would return, without materializing them.
    fn cost(&self, range: Option<&KeyRange>) -> usize;

    /// Like `cost`, but may stop counting at `budget`. Exact below `budget`,
    /// otherwise some value of at least `budget`.
    fn cost_within(&self, range: Option<&KeyRange>, _budget: usize) -> usize {
        self.cost(range)
    }

    fn is_unique_key(&self) -> bool;

    fn comparator(&self) -> &Comparator;

    fn stats(&self) -> IndexStats;

    fn clear(&mut self);

    fn serialize(&self) -> Result<Vec<u8>>;
}
