//! Reconciliation of discovered rows against stored objects.
//!
//! The item pass runs first and records which stored item serves each
//! (row, prototype) pair; the graph pass consumes that linkage to resolve
//! its prototype item references. Both passes share the lost-object
//! lifecycle: objects missing from a poll are marked lost with a deletion
//! deadline derived from the rule's lifetime, restored if they reappear,
//! and deleted once the deadline passes.

pub mod graph;
pub mod item;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::audit::AuditSink;
use crate::entry::Entry;
use crate::lifetime::Lifetime;
use crate::macros::MacroExpander;
use crate::regexp::NamedExpressionProvider;
use crate::store::{DiscoveryStatus, DiscoveryStore, ItemId};

/// Shared handles for the synchronization passes.
#[derive(Clone, Copy)]
pub struct SyncContext<'a> {
    /// Persistence backend.
    pub store: &'a dyn DiscoveryStore,
    /// Change trail.
    pub audit: &'a dyn AuditSink,
    /// Template renderer.
    pub expander: &'a dyn MacroExpander,
    /// Named pattern registry for override matching.
    pub expressions: &'a dyn NamedExpressionProvider,
}

/// A row that passed the rule filter, with the overrides selected for it.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredRow {
    /// Normalized row.
    pub entry: Entry,
    /// Indexes into the rule's step-ordered override list.
    pub overrides: Vec<usize>,
}

impl FilteredRow {
    /// Wraps an entry with no overrides selected.
    #[must_use]
    pub fn new(entry: Entry) -> Self {
        Self {
            entry,
            overrides: Vec::new(),
        }
    }

    /// Sets the selected override indexes.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Vec<usize>) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Change counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Objects created.
    pub created: usize,
    /// Objects updated in place.
    pub updated: usize,
    /// Objects deleted, cascaded deletions included.
    pub deleted: usize,
}

impl SyncStats {
    /// Folds another batch's counters into this one.
    pub fn merge(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }

    /// True when the pass wrote nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Map from (row, item prototype) to the stored item serving that row.
///
/// Populated by the item pass for every discovered row, consumed by the
/// graph pass to turn prototype item references into concrete item ids.
#[derive(Debug, Default)]
pub struct ItemLinkage {
    links: HashMap<(usize, ItemId), ItemId>,
}

impl ItemLinkage {
    /// Creates an empty linkage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `prototype` instantiated as `item` for the given row.
    pub fn insert(&mut self, row: usize, prototype: ItemId, item: ItemId) {
        self.links.insert((row, prototype), item);
    }

    /// The stored item serving `prototype` on the given row.
    #[must_use]
    pub fn resolve(&self, row: usize, prototype: ItemId) -> Option<ItemId> {
        self.links.get(&(row, prototype)).copied()
    }

    /// Number of recorded links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// True when no links were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// What the lost pass should do with an object missing from this poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostAction {
    /// Record it as lost with the given deletion deadline.
    Mark {
        /// Deadline to store; `None` keeps the object indefinitely.
        ts_delete: Option<DateTime<Utc>>,
    },
    /// Retention expired or deletion is immediate: drop it now.
    Delete,
    /// Already marked with the right deadline; nothing to write.
    Keep,
}

/// Decides the lost pass action for one undiscovered object.
///
/// The deadline is recomputed from the stored last-seen time on every
/// pass, so changing the rule's lifetime re-schedules objects that are
/// already lost.
#[must_use]
pub fn lost_action(
    discovery: DiscoveryStatus,
    lastcheck: Option<DateTime<Utc>>,
    ts_delete: Option<DateTime<Utc>>,
    lifetime: Lifetime,
    now: DateTime<Utc>,
) -> LostAction {
    if matches!(lifetime, Lifetime::Immediately) {
        return LostAction::Delete;
    }

    let due = lifetime.deadline(lastcheck.unwrap_or(now));
    if let Some(deadline) = due {
        if deadline <= now {
            return LostAction::Delete;
        }
    }

    if discovery.is_lost() && ts_delete == due {
        return LostAction::Keep;
    }
    LostAction::Mark { ts_delete: due }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_stats_merge() {
        let mut total = SyncStats::default();
        assert!(total.is_noop());

        total.merge(SyncStats {
            created: 2,
            updated: 0,
            deleted: 1,
        });
        total.merge(SyncStats {
            created: 0,
            updated: 3,
            deleted: 0,
        });

        assert_eq!(total.created, 2);
        assert_eq!(total.updated, 3);
        assert_eq!(total.deleted, 1);
        assert!(!total.is_noop());
    }

    #[test]
    fn test_linkage_resolution_is_per_row() {
        let mut linkage = ItemLinkage::new();
        linkage.insert(0, ItemId(10), ItemId(101));
        linkage.insert(1, ItemId(10), ItemId(102));

        assert_eq!(linkage.resolve(0, ItemId(10)), Some(ItemId(101)));
        assert_eq!(linkage.resolve(1, ItemId(10)), Some(ItemId(102)));
        assert_eq!(linkage.resolve(2, ItemId(10)), None);
        assert_eq!(linkage.len(), 2);
    }

    #[test]
    fn test_lost_action_immediate() {
        let now = Utc::now();
        let action = lost_action(
            DiscoveryStatus::Normal,
            Some(now),
            None,
            Lifetime::Immediately,
            now,
        );
        assert_eq!(action, LostAction::Delete);
    }

    #[test]
    fn test_lost_action_marks_with_deadline() {
        let now = Utc::now();
        let seen = now - Duration::hours(1);
        let action = lost_action(
            DiscoveryStatus::Normal,
            Some(seen),
            None,
            Lifetime::days(7),
            now,
        );
        assert_eq!(
            action,
            LostAction::Mark {
                ts_delete: Some(seen + Duration::days(7))
            }
        );
    }

    #[test]
    fn test_lost_action_deletes_when_overdue() {
        let now = Utc::now();
        let seen = now - Duration::days(8);
        let action = lost_action(
            DiscoveryStatus::Lost,
            Some(seen),
            Some(seen + Duration::days(7)),
            Lifetime::days(7),
            now,
        );
        assert_eq!(action, LostAction::Delete);
    }

    #[test]
    fn test_lost_action_keeps_settled_objects() {
        let now = Utc::now();
        let seen = now - Duration::hours(2);
        let deadline = seen + Duration::days(7);
        let action = lost_action(
            DiscoveryStatus::Lost,
            Some(seen),
            Some(deadline),
            Lifetime::days(7),
            now,
        );
        assert_eq!(action, LostAction::Keep);
    }

    #[test]
    fn test_lost_action_reschedules_on_lifetime_change() {
        let now = Utc::now();
        let seen = now - Duration::hours(2);
        // Stored deadline came from an older 7 day lifetime.
        let action = lost_action(
            DiscoveryStatus::Lost,
            Some(seen),
            Some(seen + Duration::days(7)),
            Lifetime::days(30),
            now,
        );
        assert_eq!(
            action,
            LostAction::Mark {
                ts_delete: Some(seen + Duration::days(30))
            }
        );
    }

    #[test]
    fn test_lost_action_forever() {
        let now = Utc::now();
        let marked = lost_action(
            DiscoveryStatus::Normal,
            Some(now),
            None,
            Lifetime::Forever,
            now,
        );
        assert_eq!(marked, LostAction::Mark { ts_delete: None });

        let settled = lost_action(
            DiscoveryStatus::Lost,
            Some(now),
            None,
            Lifetime::Forever,
            now,
        );
        assert_eq!(settled, LostAction::Keep);
    }
}
