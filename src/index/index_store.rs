use std::collections::BTreeMap;
use crate::core::error::{Error, Result};
use crate::index::btree::BTree;
use crate::index::comparator::Comparator;
use crate::index::nullable::NullableIndex;
use crate::index::row_id::RowIdIndex;
use crate::index::runtime::RuntimeIndex;
use crate::schema::schema::{IndexDef, Schema, Table};

/// Every runtime index of a database, keyed by normalized name.
#[derive(Debug, Default)]
pub struct IndexStore {
    indices: BTreeMap<String, Box<dyn RuntimeIndex>>,
    by_table: BTreeMap<String, Vec<String>>,
}

impl IndexStore {
    pub fn new() -> Self {
        IndexStore::default()
    }

    pub fn from_schema(schema: &Schema, max_node_size: usize) -> Self {
        let mut store = IndexStore::new();
        for table in schema.tables() {
            store.add_table(table, max_node_size);
        }
        store
    }

    fn add_table(&mut self, table: &Table, max_node_size: usize) {
        let mut names = Vec::new();

        let row_id_name = table.row_id_index_name();
        self.indices.insert(row_id_name.clone(), Box::new(RowIdIndex::new(&row_id_name)));
        names.push(row_id_name);

        for def in table.all_indices() {
            let name = def.normalized_name();
            self.indices.insert(name.clone(), build_index(def, max_node_size));
            names.push(name);
        }
        self.by_table.insert(table.name.clone(), names);
    }

    pub fn get(&self, name: &str) -> Option<&dyn RuntimeIndex> {
        self.indices.get(name).map(|i| i.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Box<dyn RuntimeIndex>> {
        self.indices
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("index {} does not exist", name)))
    }

    /// Row-id index first, then the primary key and declared indices.
    pub fn table_indices(&self, table: &str) -> Vec<&dyn RuntimeIndex> {
        self.by_table
            .get(table)
            .map(|names| names.iter().filter_map(|n| self.get(n)).collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.indices.keys()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn clear(&mut self) {
        for index in self.indices.values_mut() {
            index.clear();
        }
    }
}

/// Single-column indices over a nullable column get the null side set;
/// multi-column ones use the null-tolerant comparator instead.
pub fn build_index(def: &IndexDef, max_node_size: usize) -> Box<dyn RuntimeIndex> {
    let name = def.normalized_name();
    let tree = BTree::with_fanout(&name, Comparator::for_index(def), def.unique, max_node_size);
    if def.columns.len() == 1 && def.nullable {
        Box::new(NullableIndex::new(tree))
    } else {
        Box::new(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::schema::{DataType, Order, SchemaBuilder, TableBuilder};

    #[test]
    fn test_indices_per_table() {
        let schema = SchemaBuilder::new("s", 1)
            .table(
                TableBuilder::new("item")
                    .add_column("id", DataType::Integer)
                    .add_nullable_column("tag", DataType::String)
                    .add_primary_key(&["id"])
                    .add_index("idx_tag", &[("tag", Order::Desc)], false),
            )
            .build()
            .unwrap();
        let store = IndexStore::from_schema(&schema, 8);
        let names: Vec<&str> = store.table_indices("item").iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["item.#", "item.pkitem", "item.idx_tag"]);
        assert!(store.get("item.pkitem").unwrap().is_unique_key());
        assert!(store.table_indices("missing").is_empty());
    }
}
