//! Discovery engine: orchestration of one poll cycle per rule.
//!
//! [`DiscoveryEngine`] owns the seams all passes share (store, audit sink,
//! macro expander, named-expression provider, formula evaluator) plus a
//! per-rule snapshot of the previous poll's entry set. [`DiscoveryEngine::process`]
//! runs the full cycle for one payload: parse, normalize, skip when nothing
//! changed, filter, reconcile items then graphs, and age lost objects.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::entry::{Entry, EntrySet};
use crate::error::{ConfigError, DiscoveryError, DiscoveryResult};
use crate::expression::{BasicEvaluator, ExpressionEvaluator};
use crate::filter::ConditionOperator;
use crate::lifetime::Lifetime;
use crate::macros::{EntryExpander, MacroExpander};
use crate::overrides::{select_overrides, PatternOperator};
use crate::reconcile::graph::sync_graphs;
use crate::reconcile::item::sync_items;
use crate::reconcile::{FilteredRow, SyncContext, SyncStats};
use crate::regexp::NamedExpressionProvider;
use crate::row::parse_payload;
use crate::rule::{DiscoveryRule, RuleId};
use crate::store::DiscoveryStore;

/// Summary of one processed discovery payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// Objects created across the item and graph passes.
    pub created: usize,
    /// Objects updated in place.
    pub updated: usize,
    /// Objects deleted, cascaded deletions included.
    pub deleted: usize,
    /// Non-fatal notices: filter macros without values, suppressed rows,
    /// duplicate names, lifetime fallbacks, abandoned batches.
    pub warnings: Vec<String>,
    /// True when the payload matched the previous poll and the pass was
    /// skipped without touching the store.
    pub unchanged: bool,
    /// Stable fingerprint of the normalized entry set, independent of row
    /// order. Callers can persist it to carry change detection across
    /// restarts.
    pub fingerprint: String,
}

impl DiscoveryOutcome {
    /// True when the pass wrote nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Discovery reconciliation engine.
///
/// Cloning is cheap and clones share the snapshot cache, so one engine can
/// serve concurrent rule runs; runs that touch the same host serialize on
/// the store's advisory locks.
#[derive(Clone)]
pub struct DiscoveryEngine {
    store: Arc<dyn DiscoveryStore>,
    audit: Arc<dyn AuditSink>,
    expander: Arc<dyn MacroExpander>,
    expressions: Arc<dyn NamedExpressionProvider>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    snapshots: Arc<RwLock<HashMap<RuleId, EntrySet>>>,
}

impl DiscoveryEngine {
    /// Creates an engine over the given store, audit sink and global
    /// expression provider, with the default macro expander and formula
    /// evaluator.
    #[must_use]
    pub fn new(
        store: Arc<dyn DiscoveryStore>,
        audit: Arc<dyn AuditSink>,
        expressions: Arc<dyn NamedExpressionProvider>,
    ) -> Self {
        Self {
            store,
            audit,
            expander: Arc::new(EntryExpander::new()),
            expressions,
            evaluator: Arc::new(BasicEvaluator::new()),
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replaces the macro expander.
    #[must_use]
    pub fn with_expander(mut self, expander: Arc<dyn MacroExpander>) -> Self {
        self.expander = expander;
        self
    }

    /// Replaces the custom-formula evaluator.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// The persistence backend.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DiscoveryStore> {
        &self.store
    }

    /// The audit sink.
    #[must_use]
    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Loads the rule and processes one discovery payload against it.
    ///
    /// Object-scoped problems (bad names, duplicates, tree violations,
    /// undiscovered constituents) never error; they surface in
    /// [`DiscoveryOutcome::warnings`] while sibling objects proceed.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::RuleNotFound`] for an unknown rule id,
    /// [`DiscoveryError::MalformedInput`] for an unparseable payload, a
    /// configuration error for dangling named-expression references or an
    /// unevaluable custom formula, and a storage error when persistence
    /// fails outside a recoverable batch.
    pub fn process(&self, rule: RuleId, payload: &str) -> DiscoveryResult<DiscoveryOutcome> {
        self.process_at(rule, payload, Utc::now())
    }

    /// Same as [`Self::process`] with an explicit clock, for schedulers
    /// that batch polls and for replaying recorded ones.
    ///
    /// # Errors
    ///
    /// See [`Self::process`].
    pub fn process_at(
        &self,
        rule: RuleId,
        payload: &str,
        now: DateTime<Utc>,
    ) -> DiscoveryResult<DiscoveryOutcome> {
        let rule = self
            .store
            .rule(rule)?
            .ok_or(DiscoveryError::RuleNotFound { rule })?;
        self.run_rule(&rule, payload, now)
    }

    /// Drops the cached entry snapshot for a rule, forcing the next poll
    /// to run a full pass. Call it when a rule is deleted or rewired to a
    /// different host.
    ///
    /// # Errors
    ///
    /// Fails only when the snapshot cache lock is poisoned.
    pub fn forget(&self, rule: RuleId) -> DiscoveryResult<()> {
        let mut guard = self
            .snapshots
            .write()
            .map_err(|_| DiscoveryError::internal("snapshot cache lock poisoned"))?;
        guard.remove(&rule);
        Ok(())
    }

    /// Fingerprint of the cached entry snapshot for a rule, if one exists.
    ///
    /// # Errors
    ///
    /// Fails only when the snapshot cache lock is poisoned.
    pub fn snapshot_fingerprint(&self, rule: RuleId) -> DiscoveryResult<Option<String>> {
        let guard = self
            .snapshots
            .read()
            .map_err(|_| DiscoveryError::internal("snapshot cache lock poisoned"))?;
        Ok(guard.get(&rule).map(EntrySet::fingerprint))
    }

    fn run_rule(
        &self,
        rule: &DiscoveryRule,
        payload: &str,
        now: DateTime<Utc>,
    ) -> DiscoveryResult<DiscoveryOutcome> {
        // A dangling @reference would fail row after row inside the filter
        // pass; checking up front turns it into one configuration error
        // before anything is parsed or written.
        self.check_expressions(rule)?;

        let rows = parse_payload(payload)?;
        let mut entries: Vec<Entry> = Vec::with_capacity(rows.len());
        for row in &rows {
            let entry = Entry::build(row, &rule.macro_paths);
            // Identical rows collapse; the first occurrence wins.
            if entries.contains(&entry) {
                debug!(rule = %rule.id, row = %entry, "dropping duplicate row");
                continue;
            }
            entries.push(entry);
        }
        let current = EntrySet::new(entries);
        let fingerprint = current.fingerprint();

        if self.snapshot_matches(rule.id, &current)? {
            debug!(rule = %rule.id, rows = current.len(), "entry set unchanged since last poll");
            return Ok(DiscoveryOutcome {
                created: 0,
                updated: 0,
                deleted: 0,
                warnings: Vec::new(),
                unchanged: true,
                fingerprint,
            });
        }

        let mut warnings = Vec::new();
        let lifetime = Lifetime::parse_lenient(&rule.lifetime, &mut warnings);

        let mut filtered = Vec::new();
        for entry in current.entries() {
            if !rule.filter.evaluate(
                entry,
                self.expressions.as_ref(),
                self.evaluator.as_ref(),
                &mut warnings,
            )? {
                continue;
            }
            let selected = select_overrides(
                rule.overrides(),
                entry,
                self.expressions.as_ref(),
                self.evaluator.as_ref(),
                &mut warnings,
            )?;
            filtered.push(FilteredRow::new(entry.clone()).with_overrides(selected));
        }
        debug!(
            rule = %rule.id,
            rows = current.len(),
            matched = filtered.len(),
            "filter pass done"
        );

        let ctx = SyncContext {
            store: self.store.as_ref(),
            audit: self.audit.as_ref(),
            expander: self.expander.as_ref(),
            expressions: self.expressions.as_ref(),
        };

        let mut stats = SyncStats::default();
        let items = sync_items(&ctx, rule, &filtered, lifetime, now, &mut warnings)?;
        let aborted = items.aborted;
        let linkage = items.linkage;
        stats.merge(items.stats);
        if aborted {
            debug!(rule = %rule.id, "item pass abandoned, graphs skipped");
        } else {
            stats.merge(sync_graphs(
                &ctx,
                rule,
                &filtered,
                &linkage,
                lifetime,
                now,
                &mut warnings,
            )?);
        }

        for warning in &warnings {
            warn!(rule = %rule.id, "{warning}");
        }
        info!(
            rule = %rule.id,
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            warnings = warnings.len(),
            "discovery pass complete"
        );

        self.store_snapshot(rule.id, current)?;

        Ok(DiscoveryOutcome {
            created: stats.created,
            updated: stats.updated,
            deleted: stats.deleted,
            warnings,
            unchanged: false,
            fingerprint,
        })
    }

    /// Fails fast on `@name` patterns the provider cannot resolve, in the
    /// rule filter, in override filters and in override operation patterns.
    fn check_expressions(&self, rule: &DiscoveryRule) -> Result<(), ConfigError> {
        for condition in rule.filter.conditions() {
            if regexp_operator(condition.operator) {
                self.check_pattern(&condition.pattern)?;
            }
        }
        for ov in rule.overrides() {
            for condition in ov.filter.conditions() {
                if regexp_operator(condition.operator) {
                    self.check_pattern(&condition.pattern)?;
                }
            }
            for op in &ov.operations {
                if matches!(
                    op.operator,
                    PatternOperator::Matches | PatternOperator::NotMatches
                ) {
                    self.check_pattern(&op.pattern)?;
                }
            }
        }
        Ok(())
    }

    fn check_pattern(&self, pattern: &str) -> Result<(), ConfigError> {
        if let Some(name) = pattern.strip_prefix('@') {
            if self.expressions.resolve(name).is_none() {
                return Err(ConfigError::UnknownNamedExpression {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn snapshot_matches(&self, rule: RuleId, current: &EntrySet) -> DiscoveryResult<bool> {
        let guard = self
            .snapshots
            .read()
            .map_err(|_| DiscoveryError::internal("snapshot cache lock poisoned"))?;
        Ok(guard.get(&rule).is_some_and(|prev| prev.same_as(current)))
    }

    fn store_snapshot(&self, rule: RuleId, set: EntrySet) -> DiscoveryResult<()> {
        let mut guard = self
            .snapshots
            .write()
            .map_err(|_| DiscoveryError::internal("snapshot cache lock poisoned"))?;
        guard.insert(rule, set);
        Ok(())
    }
}

fn regexp_operator(op: ConditionOperator) -> bool {
    matches!(
        op,
        ConditionOperator::Matches | ConditionOperator::NotMatches
    )
}
