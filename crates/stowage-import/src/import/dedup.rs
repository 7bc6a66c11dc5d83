//! Duplicate detection on the table's unique key

use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use super::validate::FieldValue;
use crate::catalog::TableSpec;

/// Joins key parts; cannot appear in trimmed field text from a CSV cell
/// in practice and matches the store-side `chr(31)`.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Composite key of a row, or `None` when the table has no unique key or
/// any key part is empty.
pub fn composite_key(table: &TableSpec, values: &[FieldValue]) -> Option<String> {
    if !table.has_unique_key() {
        return None;
    }

    let mut key = String::new();
    for (n, index) in table.unique_key_indices().into_iter().enumerate() {
        let part = values.get(index)?.key_text()?;
        if n > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&part);
    }
    Some(key)
}

/// Printable form of a key for reports
pub fn display_key(key: &str) -> String {
    key.replace(KEY_SEPARATOR, " | ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    New,
    Duplicate { first_line: u64 },
}

/// First-seen map over one file
#[derive(Debug, Default)]
pub struct Deduplicator {
    first_seen: HashMap<String, u64>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` at `line`; later lines with the same key are duplicates
    /// of the first.
    pub fn observe(&mut self, key: &str, line: u64) -> Seen {
        match self.first_seen.get(key) {
            Some(&first_line) => Seen::Duplicate { first_line },
            None => {
                self.first_seen.insert(key.to_string(), line);
                Seen::New
            }
        }
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }
}

/// Budget for store-side existence checks within one upload.
///
/// Past the limit, checks stop and rows are treated as new; a real
/// conflict is then caught by the store's unique constraint.
#[derive(Debug)]
pub struct ExistenceChecker {
    limit: Option<usize>,
    checked: usize,
    exhausted: bool,
}

impl ExistenceChecker {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            checked: 0,
            exhausted: false,
        }
    }

    /// Whether `count` more keys may be checked; consumes the budget.
    pub fn allow(&mut self, upload_id: Uuid, count: usize) -> bool {
        if self.exhausted {
            return false;
        }
        if let Some(limit) = self.limit {
            if self.checked + count > limit {
                self.exhausted = true;
                warn!(
                    upload_id = %upload_id,
                    checked = self.checked,
                    limit,
                    "Existence check limit reached, remaining rows are not checked against the table"
                );
                return false;
            }
        }
        self.checked += count;
        true
    }

    pub fn checked(&self) -> usize {
        self.checked
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::{FieldSpec, FieldType};

    fn table() -> TableSpec {
        TableSpec::new("orders", "orders")
            .field(FieldSpec::new("order_no", FieldType::Text))
            .field(FieldSpec::new("note", FieldType::Text))
            .field(FieldSpec::new("region", FieldType::Text))
            .with_unique_key(["order_no", "region"])
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(if s.is_empty() { None } else { Some(s.to_string()) })
    }

    #[test]
    fn test_composite_key() {
        let key = composite_key(&table(), &[text(" A-1 "), text("x"), text("eu")]).unwrap();
        assert_eq!(key, "A-1\u{1f}eu");
        assert_eq!(display_key(&key), "A-1 | eu");
    }

    #[test]
    fn test_empty_key_part_means_no_key() {
        assert_eq!(composite_key(&table(), &[text("A-1"), text("x"), text("")]), None);

        let keyless = TableSpec::new("t", "t").field(FieldSpec::new("a", FieldType::Text));
        assert_eq!(composite_key(&keyless, &[text("a")]), None);
    }

    #[test]
    fn test_first_occurrence_wins() {
        let mut dedup = Deduplicator::new();
        assert_eq!(dedup.observe("k", 3), Seen::New);
        assert_eq!(dedup.observe("other", 4), Seen::New);
        assert_eq!(dedup.observe("k", 7), Seen::Duplicate { first_line: 3 });
        assert_eq!(dedup.observe("k", 12), Seen::Duplicate { first_line: 3 });
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_existence_checker_fails_open_past_limit() {
        let id = Uuid::new_v4();
        let mut checker = ExistenceChecker::new(Some(10));
        assert!(checker.allow(id, 6));
        assert!(!checker.allow(id, 6));
        assert!(!checker.allow(id, 1));
        assert_eq!(checker.checked(), 6);

        let mut unlimited = ExistenceChecker::new(None);
        assert!(unlimited.allow(id, usize::MAX / 2));
    }
}
