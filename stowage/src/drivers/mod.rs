//! Bundled storage backends.

pub mod memory;
pub mod redb_store;

use crate::commitment::{Commitment, PreparedWrite};
use crate::header::Lifecycle;
use crate::{error, warn};
use crate::pk::Document;
use std::time::Duration;

pub(crate) enum RowChange {
    Put(Document),
    Remove,
    Skip,
}

/// Effect of `write` on the stored row `existing`. Updates of missing rows are skipped.
pub(crate) fn row_change(table: &str, existing: Option<Document>, write: &PreparedWrite) -> RowChange {
    match write.lifecycle {
        Lifecycle::New => RowChange::Put(write.data.clone()),
        Lifecycle::Normal => {
            let Some(mut row) = existing else {
                warn!("{} skipping update of missing row {}", table, write.key);
                return RowChange::Skip;
            };
            for (field, value) in &write.data {
                row.insert(field.clone(), value.clone());
            }
            RowChange::Put(row)
        }
        Lifecycle::Deleted => RowChange::Remove,
        Lifecycle::Unavailable => RowChange::Skip,
    }
}

/// Prepares every commitment, logging and skipping the ones that cannot be encoded.
pub(crate) fn prepare_all(table: &str, commitments: &[Box<dyn Commitment>]) -> Vec<PreparedWrite> {
    commitments
        .iter()
        .filter_map(|c| match c.prepare_write() {
            Ok(write) => Some(write),
            Err(e) => {
                error!("{} dropping commitment of {}: {}", table, c.pk(), e);
                None
            }
        })
        .collect()
}

/// Warns when a save took longer than `write_timeout`. True when it did.
pub(crate) fn report_overrun(table: &str, rows: usize, elapsed: Duration, write_timeout: Duration) -> bool {
    if elapsed <= write_timeout {
        return false;
    }
    warn!("{} save of {} rows took {} ms, over the {} ms write timeout", table, rows, elapsed.as_millis(), write_timeout.as_millis());
    true
}

pub(crate) fn matches(row: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, value)| row.get(field) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{created, level_up, removed};
    use serde_json::json;

    #[test]
    fn updates_merge_into_existing_row() {
        let RowChange::Put(row) = row_change("heroes", None, &created(1, "ann").prepare_write().unwrap()) else { panic!("expected put") };
        assert_eq!(row.get("name"), Some(&json!("ann")));

        let RowChange::Put(updated) = row_change("heroes", Some(row), &level_up(1, 8).prepare_write().unwrap()) else { panic!("expected put") };
        assert_eq!(updated.get("name"), Some(&json!("ann")));
        assert_eq!(updated.get("level"), Some(&json!(8)));

        assert!(matches!(row_change("heroes", Some(updated), &removed(1).prepare_write().unwrap()), RowChange::Remove));
    }

    #[test]
    fn updates_of_missing_rows_are_skipped() {
        assert!(matches!(row_change("heroes", None, &level_up(1, 8).prepare_write().unwrap()), RowChange::Skip));
    }

    #[test]
    fn overruns_are_reported_past_the_write_timeout() {
        let timeout = Duration::from_millis(50);
        assert!(!report_overrun("heroes", 3, Duration::from_millis(50), timeout));
        assert!(report_overrun("heroes", 3, Duration::from_millis(51), timeout));
    }

    #[test]
    fn filter_matching() {
        let row = created(4, "dee").prepare_write().unwrap().data;
        let mut filter = Document::new();
        assert!(matches(&row, &filter));
        filter.insert("name".into(), json!("dee"));
        assert!(matches(&row, &filter));
        filter.insert("level".into(), json!(2));
        assert!(!matches(&row, &filter));
    }
}
