use serde::{Serialize, Deserialize};
use crate::txn::diff::TableDiff;

/// Outcome of a finished task, exposed after commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStats {
    pub success: bool,
    pub inserted_rows: usize,
    pub updated_rows: usize,
    pub deleted_rows: usize,
    pub changed_tables: usize,
}

impl TransactionStats {
    pub fn from_diffs<'a>(diffs: impl IntoIterator<Item = &'a TableDiff>) -> Self {
        let mut stats = TransactionStats {
            success: true,
            ..Default::default()
        };
        for diff in diffs {
            if diff.is_empty() {
                continue;
            }
            stats.inserted_rows += diff.added().len();
            stats.updated_rows += diff.modified().len();
            stats.deleted_rows += diff.deleted().len();
            stats.changed_tables += 1;
        }
        stats
    }

    pub fn failed() -> Self {
        TransactionStats::default()
    }
}

/// Point-in-time counters for a whole database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub table_count: usize,
    pub total_rows: u64,
    pub index_count: usize,
    pub pending_tasks: usize,
}
