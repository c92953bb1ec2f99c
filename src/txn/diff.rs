use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use crate::core::error::{Error, Result};
use crate::core::types::{Row, RowId};

/// Added, modified and deleted rows of one table relative to the state when
/// the transaction started. A row id appears in at most one of the three maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDiff {
    name: String,
    added: BTreeMap<RowId, Row>,
    /// `(before, after)` images.
    modified: BTreeMap<RowId, (Row, Row)>,
    deleted: BTreeMap<RowId, Row>,
}

/// One row-level change: `(None, Some)` insert, `(Some, Some)` update, `(Some, None)` delete.
pub type Modification = (Option<Row>, Option<Row>);

impl TableDiff {
    pub fn new(name: &str) -> Self {
        TableDiff {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn added(&self) -> &BTreeMap<RowId, Row> {
        &self.added
    }

    pub fn modified(&self) -> &BTreeMap<RowId, (Row, Row)> {
        &self.modified
    }

    pub fn deleted(&self) -> &BTreeMap<RowId, Row> {
        &self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Re-adding a deleted row turns into a modification of it.
    pub fn add(&mut self, row: Row) {
        match self.deleted.remove(&row.id) {
            Some(before) => {
                self.modified.insert(row.id, (before, row));
            }
            None => {
                self.added.insert(row.id, row);
            }
        }
    }

    pub fn modify(&mut self, before: Row, after: Row) -> Result<()> {
        if before.id != after.id {
            return Err(Error::invalid_argument(format!(
                "table {}: modification changes row id {} to {}",
                self.name, before.id, after.id
            )));
        }
        let id = after.id;
        if let Some(added) = self.added.get_mut(&id) {
            *added = after;
        } else if let Some(entry) = self.modified.get_mut(&id) {
            entry.1 = after;
        } else {
            self.modified.insert(id, (before, after));
        }
        Ok(())
    }

    /// Deleting an added row cancels it; deleting a modified row records the original image.
    pub fn delete(&mut self, row: Row) {
        let id = row.id;
        if self.added.remove(&id).is_some() {
            return;
        }
        match self.modified.remove(&id) {
            Some((before, _)) => {
                self.deleted.insert(id, before);
            }
            None => {
                self.deleted.insert(id, row);
            }
        }
    }

    /// Folds `other`, which happened after `self`, into this diff.
    pub fn merge(&mut self, other: &TableDiff) -> Result<()> {
        for row in other.added.values() {
            self.add(row.clone());
        }
        for (before, after) in other.modified.values() {
            self.modify(before.clone(), after.clone())?;
        }
        for row in other.deleted.values() {
            self.delete(row.clone());
        }
        Ok(())
    }

    /// The diff that undoes this one.
    pub fn reverse(&self) -> TableDiff {
        TableDiff {
            name: self.name.clone(),
            added: self.deleted.clone(),
            modified: self
                .modified
                .iter()
                .map(|(id, (before, after))| (*id, (after.clone(), before.clone())))
                .collect(),
            deleted: self.added.clone(),
        }
    }

    pub fn modifications(&self) -> Vec<Modification> {
        let mut out = Vec::with_capacity(self.added.len() + self.modified.len() + self.deleted.len());
        out.extend(self.added.values().map(|r| (None, Some(r.clone()))));
        out.extend(self.modified.values().map(|(b, a)| (Some(b.clone()), Some(a.clone()))));
        out.extend(self.deleted.values().map(|r| (Some(r.clone()), None)));
        out
    }

    /// Rows whose current image is visible after this diff: added and modified afters.
    pub fn current_rows(&self) -> impl Iterator<Item = &Row> {
        self.added.values().chain(self.modified.values().map(|(_, after)| after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::row;

    fn r(id: RowId, v: i64) -> Row {
        row!("v" => v).with_id(id)
    }

    #[test]
    fn test_readd_deleted_becomes_modification() {
        let mut diff = TableDiff::new("t");
        diff.delete(r(1, 10));
        diff.add(r(1, 11));
        assert!(diff.deleted().is_empty());
        assert_eq!(diff.modified()[&1], (r(1, 10), r(1, 11)));
    }

    #[test]
    fn test_delete_added_cancels() {
        let mut diff = TableDiff::new("t");
        diff.add(r(2, 1));
        diff.modify(r(2, 1), r(2, 2)).unwrap();
        assert_eq!(diff.added()[&2], r(2, 2));
        diff.delete(r(2, 2));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_delete_modified_keeps_original() {
        let mut diff = TableDiff::new("t");
        diff.modify(r(3, 1), r(3, 2)).unwrap();
        diff.modify(r(3, 2), r(3, 3)).unwrap();
        assert_eq!(diff.modified()[&3], (r(3, 1), r(3, 3)));
        diff.delete(r(3, 3));
        assert_eq!(diff.deleted()[&3], r(3, 1));
        assert!(diff.modified().is_empty());
    }

    #[test]
    fn test_mismatched_ids_rejected() {
        let mut diff = TableDiff::new("t");
        assert_eq!(diff.modify(r(1, 1), r(2, 1)).unwrap_err().kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_reverse_and_merge() {
        let mut diff = TableDiff::new("t");
        diff.add(r(1, 1));
        diff.modify(r(2, 1), r(2, 2)).unwrap();
        diff.delete(r(3, 3));
        let mut undone = diff.clone();
        undone.merge(&diff.reverse()).unwrap();
        // Add then delete cancels; modify then reverse-modify keeps a no-op image.
        assert!(undone.added().is_empty());
        assert!(undone.deleted().is_empty());
        assert_eq!(undone.modified()[&3], (r(3, 3), r(3, 3)));
        assert_eq!(undone.modified()[&2], (r(2, 1), r(2, 1)));
    }
}
