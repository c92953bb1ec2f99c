use std::collections::{BTreeMap, HashMap};
use roaring::RoaringTreemap;
use crate::core::types::{Row, RowId};

/// Materialized table state: row id to row, plus the row-id set of each table.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    rows: HashMap<RowId, Row>,
    tables: BTreeMap<String, RoaringTreemap>,
}

impl Cache {
    pub fn new() -> Self {
        Cache::default()
    }

    pub fn set(&mut self, table: &str, row: Row) {
        debug_assert!(row.id >= 0, "synthetic rows are never cached");
        self.tables.entry(table.to_string()).or_default().insert(row.id as u64);
        self.rows.insert(row.id, row);
    }

    pub fn set_many(&mut self, table: &str, rows: impl IntoIterator<Item = Row>) {
        for row in rows {
            self.set(table, row);
        }
    }

    pub fn get(&self, id: RowId) -> Option<&Row> {
        self.rows.get(&id)
    }

    /// Ids without a cached row are skipped.
    pub fn get_many(&self, ids: &[RowId]) -> Vec<Row> {
        ids.iter().filter_map(|id| self.rows.get(id)).cloned().collect()
    }

    pub fn remove(&mut self, table: &str, id: RowId) -> Option<Row> {
        if let Some(ids) = self.tables.get_mut(table) {
            ids.remove(id as u64);
        }
        self.rows.remove(&id)
    }

    pub fn row_ids(&self, table: &str) -> Vec<RowId> {
        self.tables
            .get(table)
            .map(|ids| ids.iter().map(|id| id as RowId).collect())
            .unwrap_or_default()
    }

    /// Every row of `table`, ordered by row id.
    pub fn table_rows(&self, table: &str) -> Vec<Row> {
        self.get_many(&self.row_ids(table))
    }

    pub fn count(&self, table: &str) -> u64 {
        self.tables.get(table).map_or(0, |ids| ids.len())
    }

    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn clear_table(&mut self, table: &str) {
        for id in self.row_ids(table) {
            self.rows.remove(&id);
        }
        self.tables.remove(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    #[test]
    fn test_cache_tracks_table_membership() {
        let mut cache = Cache::new();
        cache.set("a", row!("x" => 1).with_id(2));
        cache.set("a", row!("x" => 2).with_id(1));
        cache.set("b", row!("y" => 3).with_id(3));
        assert_eq!(cache.row_ids("a"), vec![1, 2]);
        assert_eq!(cache.count("b"), 1);
        assert_eq!(cache.get_many(&[3, 99]).len(), 1);
        cache.remove("a", 2);
        assert_eq!(cache.table_rows("a")[0].id, 1);
        cache.clear_table("a");
        assert_eq!(cache.total_rows(), 1);
    }
}
