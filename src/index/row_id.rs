use roaring::RoaringTreemap;
use crate::core::error::{Error, Result};
use crate::core::types::{RowId, Value};
use crate::index::comparator::Comparator;
use crate::index::key::Key;
use crate::index::key_range::KeyRange;
use crate::index::runtime::{IndexStats, RuntimeIndex};
use crate::schema::schema::Order;

/// Implicit primary key of every table: the set of row ids it holds.
#[derive(Debug, Clone)]
pub struct RowIdIndex {
    name: String,
    ids: RoaringTreemap,
    comparator: Comparator,
}

fn to_row_id(key: &Key) -> Option<RowId> {
    match key {
        Key::Single(Value::Integer(id)) => Some(*id),
        _ => None,
    }
}

fn slot(id: RowId) -> Result<u64> {
    u64::try_from(id).map_err(|_| Error::invalid_argument(format!("row id {} cannot be indexed", id)))
}

impl RowIdIndex {
    pub fn new(name: &str) -> Self {
        RowIdIndex {
            name: name.to_string(),
            ids: RoaringTreemap::new(),
            comparator: Comparator::Simple(Order::Asc),
        }
    }

    pub fn deserialize(name: &str, bytes: &[u8]) -> Result<Self> {
        let ids = RoaringTreemap::deserialize_from(bytes)?;
        Ok(RowIdIndex {
            name: name.to_string(),
            ids,
            comparator: Comparator::Simple(Order::Asc),
        })
    }

    fn key_of(&self, key: &Key) -> Result<u64> {
        let id = to_row_id(key)
            .ok_or_else(|| Error::invalid_argument(format!("index {}: {} is not a row id", self.name, key)))?;
        slot(id)
    }
}

impl RuntimeIndex for RowIdIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&mut self, key: Key, value: RowId) -> Result<()> {
        let id = self.key_of(&key)?;
        if !self.ids.insert(id) {
            return Err(Error::duplicate_key(&self.name, value));
        }
        Ok(())
    }

    fn set(&mut self, key: Key, _value: RowId) -> Result<()> {
        let id = self.key_of(&key)?;
        self.ids.insert(id);
        Ok(())
    }

    fn remove(&mut self, key: &Key, _value: Option<RowId>) -> Result<()> {
        let id = self.key_of(key)?;
        self.ids.remove(id);
        Ok(())
    }

    fn get(&self, key: &Key) -> Vec<RowId> {
        match to_row_id(key) {
            Some(id) if id >= 0 && self.ids.contains(id as u64) => vec![id],
            _ => Vec::new(),
        }
    }

    fn contains_key(&self, key: &Key) -> bool {
        !self.get(key).is_empty()
    }

    fn min(&self) -> Option<(Key, Vec<RowId>)> {
        self.ids.min().map(|id| (Key::from(id as RowId), vec![id as RowId]))
    }

    fn max(&self) -> Option<(Key, Vec<RowId>)> {
        self.ids.max().map(|id| (Key::from(id as RowId), vec![id as RowId]))
    }

    fn get_range(
        &self,
        ranges: Option<&[KeyRange]>,
        reverse: bool,
        limit: Option<usize>,
        skip: Option<usize>,
    ) -> Vec<RowId> {
        let matches = |id: &RowId| match ranges {
            None => true,
            Some(ranges) => ranges
                .iter()
                .any(|r| r.first().is_none_or(|first| first.contains(&Value::Integer(*id)))),
        };
        let mut ids: Vec<RowId> = self.ids.iter().map(|id| id as RowId).filter(matches).collect();
        if reverse {
            ids.reverse();
        }
        ids.into_iter()
            .skip(skip.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    fn cost(&self, range: Option<&KeyRange>) -> usize {
        match range {
            None => self.ids.len() as usize,
            Some(r) => self.get_range(Some(std::slice::from_ref(r)), false, None, None).len(),
        }
    }

    fn is_unique_key(&self) -> bool {
        true
    }

    fn comparator(&self) -> &Comparator {
        &self.comparator
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            total_rows: self.ids.len() as usize,
        }
    }

    fn clear(&mut self) {
        self.ids.clear();
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.ids.serialize_into(&mut bytes)?;
        Ok(bytes)
    }
}
