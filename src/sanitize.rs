//! Batch deduplication and structural validation.
//!
//! Invalid records are collected into `rejected` rather than failing the
//! whole call. Among valid duplicates the resolver's winner is kept, in the
//! position where the identifier first appeared.

use std::collections::{HashMap, HashSet};

use crate::resolve::{pick, Winner};
use crate::types::{
    validate_item, validate_list, ItemRecord, ListRecord, Record, RecordKind, ValidationIssue,
    ValidationReason, Versioned,
};

/// Output of a sanitize pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized<T> {
    pub records: Vec<T>,
    pub rejected: Vec<ValidationIssue>,
}

impl<T> Default for Sanitized<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl<T> Sanitized<T> {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Keep one version per identifier, preferring later timestamps and, on a
/// tie, the later occurrence in the batch.
pub fn dedupe<T: Versioned>(records: Vec<T>) -> Vec<T> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<T> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(record.id()) {
            Some(&pos) => {
                if pick(&out[pos], &record) == Winner::Incoming {
                    out[pos] = record;
                }
            }
            None => {
                index.insert(record.id().to_string(), out.len());
                out.push(record);
            }
        }
    }
    out
}

pub fn sanitize_lists(lists: Vec<ListRecord>) -> Sanitized<ListRecord> {
    let mut rejected = Vec::new();
    let valid = lists
        .into_iter()
        .filter(|list| match validate_list(list) {
            Ok(()) => true,
            Err(issue) => {
                rejected.push(issue);
                false
            }
        })
        .collect();
    Sanitized {
        records: dedupe(valid),
        rejected,
    }
}

/// Validate items against a set of known list identifiers.
pub fn sanitize_items(items: Vec<ItemRecord>, known_lists: &HashSet<String>) -> Sanitized<ItemRecord> {
    let mut rejected = Vec::new();
    let valid = items
        .into_iter()
        .filter(|item| {
            let result = validate_item(item).and_then(|()| {
                if known_lists.contains(&item.list_id) {
                    Ok(())
                } else {
                    Err(ValidationIssue {
                        kind: RecordKind::Item,
                        id: item.id.clone(),
                        reason: ValidationReason::DanglingList(item.list_id.clone()),
                    })
                }
            });
            match result {
                Ok(()) => true,
                Err(issue) => {
                    rejected.push(issue);
                    false
                }
            }
        })
        .collect();
    Sanitized {
        records: dedupe(valid),
        rejected,
    }
}

/// Sanitize a mixed batch. Items must reference a list present in the batch.
pub fn sanitize_records(records: Vec<Record>) -> (Sanitized<ListRecord>, Sanitized<ItemRecord>) {
    let (mut lists, mut items) = (Vec::new(), Vec::new());
    for record in records {
        match record {
            Record::List(l) => lists.push(l),
            Record::Item(i) => items.push(i),
        }
    }
    let lists = sanitize_lists(lists);
    let known: HashSet<String> = lists.records.iter().map(|l| l.id.clone()).collect();
    let items = sanitize_items(items, &known);
    (lists, items)
}
