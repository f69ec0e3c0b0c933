//! Item synchronization.
//!
//! Renders the rule's item prototypes against every filtered row, matches
//! the results to stored items by key, applies override patches, validates
//! fields and dependency links, and writes the outcome in one transaction
//! guarded by advisory locks on the host and the prototypes.
//!
//! Identity is the rendered key. Stored items are matched by rendering the
//! prototype's current key template for each row, then every historical
//! template recorded on the stored items, so a prototype key change moves
//! items to the new key instead of recreating them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::{AuditEntity, AuditRecord, AuditSink, FieldDiff};
use crate::deptree::{DependencyForest, ItemRef, LinkChange, TreeViolation};
use crate::error::DiscoveryResult;
use crate::lifetime::Lifetime;
use crate::macros::MacroExpander;
use crate::overrides::{DiscoverMode, ItemPatch, Override, PrototypeStatus, Tag};
use crate::reconcile::{lost_action, FilteredRow, ItemLinkage, LostAction, SyncContext, SyncStats};
use crate::rule::DiscoveryRule;
use crate::store::{
    DiscoveryStatus, DiscoveryStore, IdDomain, ItemId, ItemRecord, ItemUpdate, StorageError,
    ValueType,
};

/// Hard caps of the persisted item schema, in characters.
const MAX_NAME_LEN: usize = 255;
const MAX_KEY_LEN: usize = 2048;
const MAX_DELAY_LEN: usize = 1024;
const MAX_HISTORY_LEN: usize = 255;
const MAX_TRENDS_LEN: usize = 255;
const MAX_UNITS_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 65535;

bitflags::bitflags! {
    /// Fields of an existing item that differ from the rendered candidate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ItemFields: u32 {
        const NAME = 1;
        const KEY = 1 << 1;
        const VALUE_TYPE = 1 << 2;
        const DELAY = 1 << 3;
        const HISTORY = 1 << 4;
        const TRENDS = 1 << 5;
        const UNITS = 1 << 6;
        const DESCRIPTION = 1 << 7;
        const TAGS = 1 << 8;
        const MASTER = 1 << 9;
    }
}

/// Blueprint for the items a rule discovers.
///
/// Name, key, delay, history, trends, units, description and tags are
/// templates; `{#MACRO}` tokens in them are rendered per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPrototype {
    /// Prototype id; discovered items record it as their parent.
    pub id: ItemId,
    /// Name template.
    pub name: String,
    /// Key template, the identity of discovered items.
    pub key: String,
    /// Kind of collected values.
    #[serde(default)]
    pub value_type: ValueType,
    /// Update interval template.
    #[serde(default = "default_delay")]
    pub delay: String,
    /// History retention template.
    #[serde(default = "default_history")]
    pub history: String,
    /// Trends retention template.
    #[serde(default = "default_trends")]
    pub trends: String,
    /// Units template.
    #[serde(default)]
    pub units: String,
    /// Description template.
    #[serde(default)]
    pub description: String,
    /// Status given to newly created items. Never overwrites the status of
    /// an existing item.
    #[serde(default)]
    pub status: PrototypeStatus,
    /// Whether matched rows produce items at all.
    #[serde(default)]
    pub discover: DiscoverMode,
    /// Tag templates.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Master the discovered items depend on: another prototype of the
    /// same rule, resolved per row, or a concrete item passed through.
    #[serde(default)]
    pub master: Option<ItemId>,
}

fn default_delay() -> String {
    "1m".to_string()
}

fn default_history() -> String {
    "90d".to_string()
}

fn default_trends() -> String {
    "365d".to_string()
}

impl ItemPrototype {
    /// Creates a prototype with default attributes.
    #[must_use]
    pub fn new(id: ItemId, name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            key: key.into(),
            value_type: ValueType::default(),
            delay: default_delay(),
            history: default_history(),
            trends: default_trends(),
            units: String::new(),
            description: String::new(),
            status: PrototypeStatus::default(),
            discover: DiscoverMode::default(),
            tags: Vec::new(),
            master: None,
        }
    }

    /// Sets the value kind.
    #[must_use]
    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Sets the update interval template.
    #[must_use]
    pub fn with_delay(mut self, delay: impl Into<String>) -> Self {
        self.delay = delay.into();
        self
    }

    /// Sets the units template.
    #[must_use]
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// Sets the creation status.
    #[must_use]
    pub fn with_status(mut self, status: PrototypeStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the discover mode.
    #[must_use]
    pub fn with_discover(mut self, discover: DiscoverMode) -> Self {
        self.discover = discover;
        self
    }

    /// Adds a tag template.
    #[must_use]
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Sets the master reference.
    #[must_use]
    pub fn with_master(mut self, master: ItemId) -> Self {
        self.master = Some(master);
        self
    }
}

/// Result of the item pass.
#[derive(Debug, Default)]
pub struct ItemSyncOutcome {
    /// Write counters.
    pub stats: SyncStats,
    /// (row, prototype) to stored item mapping for the graph pass.
    pub linkage: ItemLinkage,
    /// True when the host or a prototype vanished mid-flight and the pass
    /// was abandoned; the graph pass must be skipped.
    pub aborted: bool,
}

/// One prototype rendered against one row, staged for writing.
#[derive(Debug)]
struct Candidate {
    row: usize,
    proto: usize,
    existing: Option<ItemRecord>,
    new_id: Option<ItemId>,
    name: String,
    key: String,
    value_type: ValueType,
    delay: String,
    history: String,
    trends: String,
    units: String,
    description: String,
    status: PrototypeStatus,
    tags: Vec<Tag>,
    master: Option<ItemRef>,
    fields: ItemFields,
    discovered: bool,
}

/// Synchronizes the rule's item prototypes against the filtered rows.
///
/// Warnings collect non-fatal problems: dropped candidates, rolled-back
/// fields, dependency violations and an abandoned pass. Fatal errors are
/// storage failures and malformed override configuration.
pub fn sync_items(
    ctx: &SyncContext<'_>,
    rule: &DiscoveryRule,
    rows: &[FilteredRow],
    lifetime: Lifetime,
    now: DateTime<Utc>,
    warnings: &mut Vec<String>,
) -> DiscoveryResult<ItemSyncOutcome> {
    if rule.item_prototypes.is_empty() {
        return Ok(ItemSyncOutcome::default());
    }

    let mut pass = ItemPass {
        ctx,
        rule,
        rows,
        lifetime,
        now,
        proto_of: rule
            .item_prototypes
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, i))
            .collect(),
        candidates: Vec::new(),
        unbound: Vec::new(),
        names: HashMap::new(),
    };

    pass.make_candidates()?;
    pass.resolve_masters(warnings);
    pass.validate_fields(warnings);
    pass.validate_keys(warnings)?;
    pass.validate_links(warnings)?;
    pass.save(warnings)
}

struct ItemPass<'a> {
    ctx: &'a SyncContext<'a>,
    rule: &'a DiscoveryRule,
    rows: &'a [FilteredRow],
    lifetime: Lifetime,
    now: DateTime<Utc>,
    proto_of: HashMap<ItemId, usize>,
    candidates: Vec<Candidate>,
    unbound: Vec<ItemRecord>,
    names: HashMap<ItemId, String>,
}

impl ItemPass<'_> {
    /// Loads stored items, binds them to rows by rendered key and stages
    /// one candidate per (prototype, row) pair.
    fn make_candidates(&mut self) -> DiscoveryResult<()> {
        let protos = &self.rule.item_prototypes;
        let ids: Vec<ItemId> = protos.iter().map(|p| p.id).collect();
        let stored = self.ctx.store.items_by_prototypes(&ids)?;

        self.names = stored.iter().map(|r| (r.id, r.name.clone())).collect();

        // Key templates to try per prototype: the current one first, then
        // every distinct template stored items were rendered from.
        let mut templates: Vec<Vec<String>> =
            protos.iter().map(|p| vec![p.key.clone()]).collect();
        for record in &stored {
            let Some(&p) = record.prototype.as_ref().and_then(|id| self.proto_of.get(id)) else {
                continue;
            };
            if !record.key_proto.is_empty() && !templates[p].contains(&record.key_proto) {
                templates[p].push(record.key_proto.clone());
            }
        }

        let mut by_key: HashMap<String, usize> = HashMap::new();
        for (j, record) in stored.iter().enumerate() {
            by_key.entry(record.key.clone()).or_insert(j);
        }
        let mut slots: Vec<Option<ItemRecord>> = stored.into_iter().map(Some).collect();

        for (r, row) in self.rows.iter().enumerate() {
            let selected: Vec<&Override> = row
                .overrides
                .iter()
                .filter_map(|&i| self.rule.overrides().get(i))
                .collect();

            for (p, proto) in protos.iter().enumerate() {
                let mut existing = None;
                for template in &templates[p] {
                    let rendered = self.ctx.expander.expand(template, &row.entry);
                    if let Some(&j) = by_key.get(&rendered) {
                        let same_proto = slots[j]
                            .as_ref()
                            .is_some_and(|rec| rec.prototype == Some(proto.id));
                        if same_proto {
                            existing = slots[j].take();
                            break;
                        }
                    }
                }

                if let Some(candidate) = self.render(p, proto, r, row, existing, &selected)? {
                    self.candidates.push(candidate);
                }
            }
        }

        self.unbound = slots.into_iter().flatten().collect();
        Ok(())
    }

    /// Renders one candidate: macro substitution, override patch, diff
    /// against the bound stored item. Returns `None` for a new candidate
    /// suppressed by `NO_DISCOVER`.
    fn render(
        &self,
        proto_pos: usize,
        proto: &ItemPrototype,
        row_pos: usize,
        row: &FilteredRow,
        existing: Option<ItemRecord>,
        selected: &[&Override],
    ) -> DiscoveryResult<Option<Candidate>> {
        let entry = &row.entry;
        let expand = |template: &str| self.ctx.expander.expand(template, entry);

        let name = expand(&proto.name).trim().to_string();
        let key = expand(&proto.key);
        let mut delay = expand(&proto.delay).trim().to_string();
        let mut history = expand(&proto.history).trim().to_string();
        let mut trends = expand(&proto.trends).trim().to_string();
        let units = expand(&proto.units);
        let description = expand(&proto.description);
        let mut tags: Vec<Tag> = proto
            .tags
            .iter()
            .map(|t| Tag::new(expand(&t.tag).trim(), expand(&t.value).trim()))
            .collect();

        let patch = ItemPatch::resolve(selected.iter().copied(), &name, self.ctx.expressions)?;
        if let Some(value) = patch.delay {
            delay = value;
        }
        if let Some(value) = patch.history {
            history = value;
        }
        if let Some(value) = patch.trends {
            trends = value;
        }
        for tag in patch.tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        let discover = patch.discover.unwrap_or(proto.discover);
        let status = patch.status.unwrap_or(proto.status);

        // A suppressed new candidate is dropped outright; a suppressed
        // existing item stays staged so the lost pass can see it.
        if discover == DiscoverMode::NoDiscover && existing.is_none() {
            return Ok(None);
        }
        let discovered = discover == DiscoverMode::Discover;

        let mut fields = ItemFields::empty();
        if let Some(record) = &existing {
            if record.name != name {
                fields |= ItemFields::NAME;
            }
            if record.key != key {
                fields |= ItemFields::KEY;
            }
            if record.value_type != proto.value_type {
                fields |= ItemFields::VALUE_TYPE;
            }
            if record.delay != delay {
                fields |= ItemFields::DELAY;
            }
            if record.history != history {
                fields |= ItemFields::HISTORY;
            }
            if record.trends != trends {
                fields |= ItemFields::TRENDS;
            }
            if record.units != units {
                fields |= ItemFields::UNITS;
            }
            if record.description != description {
                fields |= ItemFields::DESCRIPTION;
            }
            if record.tags != tags {
                fields |= ItemFields::TAGS;
            }
        }

        Ok(Some(Candidate {
            row: row_pos,
            proto: proto_pos,
            existing,
            new_id: None,
            name,
            key,
            value_type: proto.value_type,
            delay,
            history,
            trends,
            units,
            description,
            status,
            tags,
            master: None,
            fields,
            discovered,
        }))
    }

    /// Resolves each candidate's master reference. A reference to a sibling
    /// prototype resolves to that prototype's same-row candidate; anything
    /// else passes through as a concrete item id.
    fn resolve_masters(&mut self, warnings: &mut Vec<String>) {
        let by_slot: HashMap<(usize, usize), usize> = self
            .candidates
            .iter()
            .enumerate()
            .map(|(i, c)| ((c.proto, c.row), i))
            .collect();

        for i in 0..self.candidates.len() {
            if !self.candidates[i].discovered {
                continue;
            }
            let row = self.candidates[i].row;
            let master_id = self.rule.item_prototypes[self.candidates[i].proto].master;

            let mut unresolved = false;
            let mut master = None;
            if let Some(id) = master_id {
                if let Some(&mp) = self.proto_of.get(&id) {
                    match by_slot.get(&(mp, row)) {
                        Some(&j) if self.candidates[j].discovered => {
                            master = Some(match &self.candidates[j].existing {
                                Some(record) => ItemRef::Saved(record.id),
                                None => ItemRef::Staged(j),
                            });
                        }
                        _ => unresolved = true,
                    }
                } else {
                    master = Some(ItemRef::Saved(id));
                }
            }

            if unresolved {
                let candidate = &mut self.candidates[i];
                candidate.discovered = false;
                warnings.push(format!(
                    "cannot discover item \"{}\": master item is not discovered",
                    candidate.name
                ));
                continue;
            }

            let changed = match (&self.candidates[i].existing, master) {
                (None, _) => false,
                (Some(record), None) => record.master.is_some(),
                (Some(record), Some(ItemRef::Saved(id))) => record.master != Some(id),
                (Some(_), Some(ItemRef::Staged(_))) => true,
            };
            let candidate = &mut self.candidates[i];
            candidate.master = master;
            if changed {
                candidate.fields |= ItemFields::MASTER;
            }
        }
    }

    fn validate_fields(&mut self, warnings: &mut Vec<String>) {
        for candidate in &mut self.candidates {
            if !candidate.discovered {
                continue;
            }
            let Candidate {
                discovered,
                fields,
                existing,
                name,
                key,
                delay,
                history,
                trends,
                units,
                description,
                ..
            } = candidate;
            let stored = existing.as_ref();

            check_text(
                discovered,
                fields,
                ItemFields::NAME,
                name,
                stored.map(|r| r.name.as_str()),
                "name",
                MAX_NAME_LEN,
                true,
                warnings,
            );
            check_text(
                discovered,
                fields,
                ItemFields::KEY,
                key,
                stored.map(|r| r.key.as_str()),
                "key",
                MAX_KEY_LEN,
                true,
                warnings,
            );
            check_text(
                discovered,
                fields,
                ItemFields::DELAY,
                delay,
                stored.map(|r| r.delay.as_str()),
                "delay",
                MAX_DELAY_LEN,
                false,
                warnings,
            );
            check_text(
                discovered,
                fields,
                ItemFields::HISTORY,
                history,
                stored.map(|r| r.history.as_str()),
                "history",
                MAX_HISTORY_LEN,
                false,
                warnings,
            );
            check_text(
                discovered,
                fields,
                ItemFields::TRENDS,
                trends,
                stored.map(|r| r.trends.as_str()),
                "trends",
                MAX_TRENDS_LEN,
                false,
                warnings,
            );
            check_text(
                discovered,
                fields,
                ItemFields::UNITS,
                units,
                stored.map(|r| r.units.as_str()),
                "units",
                MAX_UNITS_LEN,
                false,
                warnings,
            );
            check_text(
                discovered,
                fields,
                ItemFields::DESCRIPTION,
                description,
                stored.map(|r| r.description.as_str()),
                "description",
                MAX_DESCRIPTION_LEN,
                false,
                warnings,
            );
        }
    }

    /// Duplicate key detection, first inside the batch, then one store
    /// query against items outside it. Unrenamed items hold their keys;
    /// renamed and new candidates are checked in row order.
    fn validate_keys(&mut self, warnings: &mut Vec<String>) -> DiscoveryResult<()> {
        let mut seen: HashSet<String> = HashSet::new();
        for candidate in &self.candidates {
            if let Some(record) = &candidate.existing {
                if !candidate.discovered || !candidate.fields.contains(ItemFields::KEY) {
                    seen.insert(record.key.clone());
                }
            }
        }
        for record in &self.unbound {
            seen.insert(record.key.clone());
        }

        for candidate in &mut self.candidates {
            if !candidate.discovered {
                continue;
            }
            let fresh = candidate.existing.is_none();
            if !fresh && !candidate.fields.contains(ItemFields::KEY) {
                continue;
            }
            if seen.contains(&candidate.key) {
                if let Some(record) = &candidate.existing {
                    warnings.push(format!(
                        "cannot update item: item with the same key \"{}\" already exists",
                        candidate.key
                    ));
                    candidate.key = record.key.clone();
                    candidate.fields.remove(ItemFields::KEY);
                    seen.insert(candidate.key.clone());
                } else {
                    warnings.push(format!(
                        "cannot create item: item with the same key \"{}\" already exists",
                        candidate.key
                    ));
                    candidate.discovered = false;
                }
            } else {
                seen.insert(candidate.key.clone());
            }
        }

        let changed: Vec<String> = self
            .candidates
            .iter()
            .filter(|c| {
                c.discovered && (c.existing.is_none() || c.fields.contains(ItemFields::KEY))
            })
            .map(|c| c.key.clone())
            .collect();
        if changed.is_empty() {
            return Ok(());
        }

        let batch: Vec<ItemId> = self
            .candidates
            .iter()
            .filter_map(|c| c.existing.as_ref().map(|r| r.id))
            .chain(self.unbound.iter().map(|r| r.id))
            .collect();
        let taken: HashSet<String> = self
            .ctx
            .store
            .item_keys_on_host(self.rule.host, &changed, &batch)?
            .into_iter()
            .collect();
        if taken.is_empty() {
            return Ok(());
        }

        for candidate in &mut self.candidates {
            if !candidate.discovered || !taken.contains(&candidate.key) {
                continue;
            }
            let fresh = candidate.existing.is_none();
            if !fresh && !candidate.fields.contains(ItemFields::KEY) {
                continue;
            }
            if let Some(record) = &candidate.existing {
                warnings.push(format!(
                    "cannot update item: item with the same key \"{}\" already exists",
                    candidate.key
                ));
                candidate.key = record.key.clone();
                candidate.fields.remove(ItemFields::KEY);
            } else {
                warnings.push(format!(
                    "cannot create item: item with the same key \"{}\" already exists",
                    candidate.key
                ));
                candidate.discovered = false;
            }
        }
        Ok(())
    }

    /// Validates master-link changes against the dependency limits and
    /// excludes violating candidates together with their subtrees.
    fn validate_links(&mut self, warnings: &mut Vec<String>) -> DiscoveryResult<()> {
        let touches_links = self.candidates.iter().any(|c| {
            c.discovered
                && (c.master.is_some() || c.existing.as_ref().is_some_and(|r| r.master.is_some()))
        });
        if !touches_links {
            return Ok(());
        }

        let links = self.ctx.store.item_links_on_host(self.rule.host)?;
        let mut forest = DependencyForest::from_links(&links);
        for (i, candidate) in self.candidates.iter().enumerate() {
            if candidate.discovered && candidate.existing.is_none() {
                forest.insert_staged(ItemRef::Staged(i));
            }
        }

        let mut changes = Vec::new();
        for (i, candidate) in self.candidates.iter().enumerate() {
            if !candidate.discovered {
                continue;
            }
            match (&candidate.existing, candidate.master) {
                (None, Some(parent)) => changes.push(LinkChange::Fresh {
                    node: ItemRef::Staged(i),
                    parent,
                }),
                (None, None) => {}
                (Some(record), master) => {
                    if !candidate.fields.contains(ItemFields::MASTER) {
                        continue;
                    }
                    let node = ItemRef::Saved(record.id);
                    match master {
                        None => changes.push(LinkChange::Unlink { node }),
                        Some(parent) if record.master.is_some() => {
                            changes.push(LinkChange::Move { node, parent });
                        }
                        Some(parent) => changes.push(LinkChange::Link { node, parent }),
                    }
                }
            }
        }
        if changes.is_empty() {
            return Ok(());
        }

        let report = forest.validate(changes);
        if report.violations.is_empty() && report.excluded.is_empty() {
            return Ok(());
        }

        let by_id: HashMap<ItemId, usize> = self
            .candidates
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.existing.as_ref().map(|r| (r.id, i)))
            .collect();

        for violation in &report.violations {
            warnings.push(self.link_warning(violation, &by_id));
        }
        for node in &report.excluded {
            let slot = match node {
                ItemRef::Staged(i) => Some(*i),
                ItemRef::Saved(id) => by_id.get(id).copied(),
            };
            if let Some(i) = slot {
                let candidate = &mut self.candidates[i];
                candidate.discovered = false;
                candidate.fields.remove(ItemFields::MASTER);
            }
        }
        Ok(())
    }

    fn ref_name(&self, node: ItemRef, by_id: &HashMap<ItemId, usize>) -> String {
        match node {
            ItemRef::Staged(i) => self
                .candidates
                .get(i)
                .map_or_else(|| format!("item #{i}"), |c| c.name.clone()),
            ItemRef::Saved(id) => by_id
                .get(&id)
                .and_then(|&i| self.candidates.get(i))
                .map(|c| c.name.clone())
                .or_else(|| self.names.get(&id).cloned())
                .unwrap_or_else(|| format!("item {id}")),
        }
    }

    fn link_warning(&self, violation: &TreeViolation, by_id: &HashMap<ItemId, usize>) -> String {
        let name = self.ref_name(violation.node(), by_id);
        match violation {
            TreeViolation::DepthExceeded { .. } => {
                format!("cannot discover item \"{name}\": dependency chain is too deep")
            }
            TreeViolation::SizeExceeded { .. } => {
                format!("cannot discover item \"{name}\": dependency tree is too large")
            }
            TreeViolation::SelfReference { .. } => {
                format!("cannot discover item \"{name}\": item cannot depend on itself")
            }
            TreeViolation::UnresolvedParent { .. } => {
                format!("cannot discover item \"{name}\": master item is missing")
            }
            TreeViolation::ParentExcluded { .. } => {
                format!("cannot discover item \"{name}\": master item was not discovered")
            }
        }
    }

    /// Commits the batch: advisory locks, id reservation, masters before
    /// dependents, then the lost pass. A refused lock abandons the pass
    /// with a warning instead of failing the poll.
    fn save(&mut self, warnings: &mut Vec<String>) -> DiscoveryResult<ItemSyncOutcome> {
        let creates: Vec<usize> = self
            .candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.discovered && c.existing.is_none())
            .map(|(i, _)| i)
            .collect();
        let updates: Vec<usize> = self
            .candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.discovered && c.existing.is_some())
            .map(|(i, _)| i)
            .collect();

        let mut lost: Vec<(ItemRecord, LostAction)> = Vec::new();
        for record in std::mem::take(&mut self.unbound) {
            let action = lost_action(
                record.discovery,
                record.lastcheck,
                record.ts_delete,
                self.lifetime,
                self.now,
            );
            lost.push((record, action));
        }
        for candidate in &self.candidates {
            if candidate.discovered {
                continue;
            }
            if let Some(record) = &candidate.existing {
                let action = lost_action(
                    record.discovery,
                    record.lastcheck,
                    record.ts_delete,
                    self.lifetime,
                    self.now,
                );
                lost.push((record.clone(), action));
            }
        }

        debug!(
            rule = %self.rule.id,
            creates = creates.len(),
            updates = updates.len(),
            lost = lost.len(),
            "item pass staged"
        );

        let lost_work = lost.iter().any(|(_, action)| !matches!(action, LostAction::Keep));
        if creates.is_empty() && updates.is_empty() && !lost_work {
            return Ok(ItemSyncOutcome {
                stats: SyncStats::default(),
                linkage: self.linkage(),
                aborted: false,
            });
        }

        self.ctx.store.begin()?;
        if let Err(error) = self.lock_rule() {
            self.ctx.store.rollback()?;
            if matches!(error, StorageError::LockUnavailable { .. }) {
                warnings.push(format!(
                    "cannot process discovery rule \"{}\": host or item prototype was removed",
                    self.rule.name
                ));
                return Ok(ItemSyncOutcome {
                    aborted: true,
                    ..ItemSyncOutcome::default()
                });
            }
            return Err(error.into());
        }

        match self.write(&creates, &updates, lost) {
            Ok(stats) => {
                self.ctx.store.commit()?;
                Ok(ItemSyncOutcome {
                    stats,
                    linkage: self.linkage(),
                    aborted: false,
                })
            }
            Err(error) => {
                self.ctx.store.rollback()?;
                Err(error.into())
            }
        }
    }

    fn lock_rule(&self) -> Result<(), StorageError> {
        self.ctx.store.lock_host(self.rule.host)?;
        for proto in &self.rule.item_prototypes {
            self.ctx.store.lock_item_prototype(proto.id)?;
        }
        Ok(())
    }

    fn write(
        &mut self,
        creates: &[usize],
        updates: &[usize],
        lost: Vec<(ItemRecord, LostAction)>,
    ) -> Result<SyncStats, StorageError> {
        let mut stats = SyncStats::default();

        if !creates.is_empty() {
            let first = self
                .ctx
                .store
                .reserve_ids(IdDomain::Item, creates.len() as u64)?;
            for (offset, &i) in creates.iter().enumerate() {
                self.candidates[i].new_id = Some(ItemId(first + offset as u64));
            }
        }

        for &i in &creation_order(&self.candidates, creates) {
            let candidate = &self.candidates[i];
            let Some(id) = candidate.new_id else { continue };
            let master = match candidate.master {
                None => None,
                Some(ItemRef::Saved(master)) => Some(master),
                Some(ItemRef::Staged(j)) => self.candidates.get(j).and_then(|c| c.new_id),
            };
            let proto = &self.rule.item_prototypes[candidate.proto];
            let record = ItemRecord {
                id,
                host: self.rule.host,
                prototype: Some(proto.id),
                name: candidate.name.clone(),
                key: candidate.key.clone(),
                key_proto: proto.key.clone(),
                value_type: candidate.value_type,
                delay: candidate.delay.clone(),
                history: candidate.history.clone(),
                trends: candidate.trends.clone(),
                units: candidate.units.clone(),
                description: candidate.description.clone(),
                status: candidate.status,
                master,
                tags: candidate.tags.clone(),
                discovery: DiscoveryStatus::Normal,
                lastcheck: Some(self.now),
                ts_delete: None,
            };
            self.ctx.store.insert_item(&record)?;
            self.ctx
                .audit
                .record(AuditRecord::create(AuditEntity::Item, id.0, record.name.as_str()));
            stats.created += 1;
        }

        for &i in updates {
            let candidate = &self.candidates[i];
            let Some(record) = &candidate.existing else { continue };
            let proto = &self.rule.item_prototypes[candidate.proto];
            let mut update = ItemUpdate::default();
            let mut diffs = Vec::new();

            if candidate.fields.contains(ItemFields::NAME) {
                update.name = Some(candidate.name.clone());
                diffs.push(FieldDiff::new("name", record.name.as_str(), candidate.name.as_str()));
            }
            if candidate.fields.contains(ItemFields::KEY) {
                update.key = Some(candidate.key.clone());
                update.key_proto = Some(proto.key.clone());
                diffs.push(FieldDiff::new("key", record.key.as_str(), candidate.key.as_str()));
            }
            if candidate.fields.contains(ItemFields::VALUE_TYPE) {
                update.value_type = Some(candidate.value_type);
                diffs.push(FieldDiff::new(
                    "value_type",
                    format!("{:?}", record.value_type),
                    format!("{:?}", candidate.value_type),
                ));
            }
            if candidate.fields.contains(ItemFields::DELAY) {
                update.delay = Some(candidate.delay.clone());
                diffs.push(FieldDiff::new(
                    "delay",
                    record.delay.as_str(),
                    candidate.delay.as_str(),
                ));
            }
            if candidate.fields.contains(ItemFields::HISTORY) {
                update.history = Some(candidate.history.clone());
                diffs.push(FieldDiff::new(
                    "history",
                    record.history.as_str(),
                    candidate.history.as_str(),
                ));
            }
            if candidate.fields.contains(ItemFields::TRENDS) {
                update.trends = Some(candidate.trends.clone());
                diffs.push(FieldDiff::new(
                    "trends",
                    record.trends.as_str(),
                    candidate.trends.as_str(),
                ));
            }
            if candidate.fields.contains(ItemFields::UNITS) {
                update.units = Some(candidate.units.clone());
                diffs.push(FieldDiff::new(
                    "units",
                    record.units.as_str(),
                    candidate.units.as_str(),
                ));
            }
            if candidate.fields.contains(ItemFields::DESCRIPTION) {
                update.description = Some(candidate.description.clone());
                diffs.push(FieldDiff::new(
                    "description",
                    record.description.as_str(),
                    candidate.description.as_str(),
                ));
            }
            if candidate.fields.contains(ItemFields::TAGS) {
                update.tags = Some(candidate.tags.clone());
                diffs.push(FieldDiff::new(
                    "tags",
                    tags_text(&record.tags),
                    tags_text(&candidate.tags),
                ));
            }
            if candidate.fields.contains(ItemFields::MASTER) {
                let master = match candidate.master {
                    None => None,
                    Some(ItemRef::Saved(m)) => Some(m),
                    Some(ItemRef::Staged(j)) => self.candidates.get(j).and_then(|c| c.new_id),
                };
                update.master = Some(master);
                diffs.push(FieldDiff::new(
                    "master",
                    master_text(record.master),
                    master_text(master),
                ));
            }
            if record.discovery.is_lost() {
                update.discovery = Some(DiscoveryStatus::Normal);
                update.ts_delete = Some(None);
                diffs.push(FieldDiff::new("discovery", "lost", "normal"));
            }
            update.lastcheck = Some(self.now);

            self.ctx.store.update_item(record.id, &update)?;
            if !diffs.is_empty() {
                self.ctx.audit.record(AuditRecord::update(
                    AuditEntity::Item,
                    record.id.0,
                    record.name.as_str(),
                    diffs,
                ));
                stats.updated += 1;
            }
        }

        let mut doomed = Vec::new();
        for (record, action) in lost {
            match action {
                LostAction::Keep => {}
                LostAction::Delete => doomed.push(record.id),
                LostAction::Mark { ts_delete } => {
                    let update = ItemUpdate {
                        discovery: Some(DiscoveryStatus::Lost),
                        ts_delete: Some(ts_delete),
                        ..ItemUpdate::default()
                    };
                    self.ctx.store.update_item(record.id, &update)?;
                    if !record.discovery.is_lost() {
                        self.ctx.audit.record(AuditRecord::update(
                            AuditEntity::Item,
                            record.id.0,
                            record.name.as_str(),
                            vec![FieldDiff::new("discovery", "normal", "lost")],
                        ));
                    }
                }
            }
        }
        if !doomed.is_empty() {
            let removed = self.ctx.store.delete_items(&doomed)?;
            for id in &removed {
                let name = self.names.get(id).cloned().unwrap_or_default();
                self.ctx
                    .audit
                    .record(AuditRecord::delete(AuditEntity::Item, id.0, name));
            }
            stats.deleted += removed.len();
        }

        Ok(stats)
    }

    fn linkage(&self) -> ItemLinkage {
        let mut linkage = ItemLinkage::new();
        for candidate in &self.candidates {
            if !candidate.discovered {
                continue;
            }
            let id = candidate.existing.as_ref().map(|r| r.id).or(candidate.new_id);
            if let Some(id) = id {
                linkage.insert(
                    candidate.row,
                    self.rule.item_prototypes[candidate.proto].id,
                    id,
                );
            }
        }
        linkage
    }
}

/// Insertion order with masters ahead of their staged dependents.
fn creation_order(candidates: &[Candidate], creates: &[usize]) -> Vec<usize> {
    let mut order = Vec::with_capacity(creates.len());
    let mut pending: Vec<usize> = creates.to_vec();
    while !pending.is_empty() {
        let waiting: HashSet<usize> = pending.iter().copied().collect();
        let mut next = Vec::new();
        for &i in &pending {
            let blocked = matches!(
                candidates[i].master,
                Some(ItemRef::Staged(j)) if j != i && waiting.contains(&j)
            );
            if blocked {
                next.push(i);
            } else {
                order.push(i);
            }
        }
        if next.len() == pending.len() {
            // Link validation rejects staged cycles, so this cannot recur;
            // keep a stable order regardless.
            order.extend(next);
            break;
        }
        pending = next;
    }
    order
}

/// Oversized or empty rendered values discard a new candidate entirely and
/// roll a changed field of an existing item back to its stored value.
#[allow(clippy::too_many_arguments)]
fn check_text(
    discovered: &mut bool,
    fields: &mut ItemFields,
    bit: ItemFields,
    value: &mut String,
    stored: Option<&str>,
    label: &'static str,
    cap: usize,
    deny_empty: bool,
    warnings: &mut Vec<String>,
) {
    if !*discovered {
        return;
    }
    let fresh = stored.is_none();
    if !fresh && !fields.contains(bit) {
        return;
    }
    let problem = if deny_empty && value.is_empty() {
        "is empty"
    } else if value.chars().count() > cap {
        "is too long"
    } else {
        return;
    };
    match stored {
        Some(original) => {
            *value = original.to_string();
            fields.remove(bit);
            warnings.push(format!("cannot update item: {label} {problem}"));
        }
        None => {
            *discovered = false;
            warnings.push(format!("cannot create item: {label} {problem}"));
        }
    }
}

fn tags_text(tags: &[Tag]) -> String {
    let parts: Vec<String> = tags.iter().map(|t| format!("{}:{}", t.tag, t.value)).collect();
    parts.join(", ")
}

fn master_text(master: Option<ItemId>) -> String {
    match master {
        Some(id) => id.to_string(),
        None => "none".to_string(),
    }
}
