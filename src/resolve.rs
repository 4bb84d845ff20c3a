//! Latest-timestamp-wins conflict resolution.
//!
//! When two versions share a timestamp the incoming one wins. Callers decide
//! which side is "incoming": the side being merged into the target store.

use std::collections::BTreeMap;

use crate::types::Versioned;

/// Which side of a conflict survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// The version already stored in the target.
    Resident,
    /// The version being merged in.
    Incoming,
}

/// Pick the winner between two versions of the same record.
///
/// Ties go to `incoming`.
pub fn pick<T: Versioned>(resident: &T, incoming: &T) -> Winner {
    if resident.version_timestamp() > incoming.version_timestamp() {
        Winner::Resident
    } else {
        Winner::Incoming
    }
}

/// Owned form of [`pick`].
pub fn resolve_conflict<T: Versioned>(resident: T, incoming: T) -> T {
    debug_assert_eq!(resident.id(), incoming.id());
    match pick(&resident, &incoming) {
        Winner::Resident => resident,
        Winner::Incoming => incoming,
    }
}

/// Result of merging one identifier across two snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeEntry<T> {
    pub winner: T,
    /// The resident side is missing this record or holds a different version.
    pub write_resident: bool,
    /// The incoming side is missing this record or holds a different version.
    pub write_incoming: bool,
    /// Both sides held a version and they differed.
    pub conflicted: bool,
}

/// Pairwise union of two deduplicated snapshots, ordered by identifier.
pub fn merge_by_id<T>(resident: Vec<T>, incoming: Vec<T>) -> Vec<MergeEntry<T>>
where
    T: Versioned + Clone + PartialEq,
{
    let mut pairs: BTreeMap<String, (Option<T>, Option<T>)> = BTreeMap::new();
    for record in resident {
        let key = record.id().to_string();
        pairs.entry(key).or_default().0 = Some(record);
    }
    for record in incoming {
        let key = record.id().to_string();
        pairs.entry(key).or_default().1 = Some(record);
    }

    pairs
        .into_values()
        .filter_map(|pair| match pair {
            (Some(r), None) => Some(MergeEntry {
                winner: r,
                write_resident: false,
                write_incoming: true,
                conflicted: false,
            }),
            (None, Some(i)) => Some(MergeEntry {
                winner: i,
                write_resident: true,
                write_incoming: false,
                conflicted: false,
            }),
            (Some(r), Some(i)) => {
                if r == i {
                    return Some(MergeEntry {
                        winner: r,
                        write_resident: false,
                        write_incoming: false,
                        conflicted: false,
                    });
                }
                let entry = match pick(&r, &i) {
                    Winner::Resident => MergeEntry {
                        winner: r,
                        write_resident: false,
                        write_incoming: true,
                        conflicted: true,
                    },
                    Winner::Incoming => MergeEntry {
                        winner: i,
                        write_resident: true,
                        write_incoming: false,
                        conflicted: true,
                    },
                };
                Some(entry)
            }
            (None, None) => None,
        })
        .collect()
}
