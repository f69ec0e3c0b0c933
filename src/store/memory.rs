//! In-memory discovery store.
//!
//! This module provides a thread-safe in-memory implementation of the storage
//! trait. It is intended for embedded usage, tests, and as a reference
//! implementation. Transactions are snapshot based: `begin` clones the live
//! state and `rollback` puts the clone back.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::rule::{DiscoveryRule, HostId, RuleId};
use crate::store::{
    DiscoveryStore, GitemId, GitemRecord, GitemUpdate, GraphId, GraphRecord, GraphUpdate,
    IdDomain, ItemId, ItemRecord, ItemUpdate, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default, Clone)]
struct StoreState {
    rules: HashMap<RuleId, DiscoveryRule>,
    hosts: HashSet<HostId>,
    items: HashMap<ItemId, ItemRecord>,
    graphs: HashMap<GraphId, GraphRecord>,
    gitems: HashMap<GitemId, GitemRecord>,
}

/// Counters live outside the transactional state: ids handed out inside a
/// rolled-back transaction are not reused, matching sequence behavior of
/// real backends.
#[derive(Debug, Clone)]
struct IdCounters {
    item: u64,
    graph: u64,
    gitem: u64,
}

impl Default for IdCounters {
    fn default() -> Self {
        Self {
            item: 1,
            graph: 1,
            gitem: 1,
        }
    }
}

fn bump(counter: &mut u64, used: u64) {
    if used >= *counter {
        *counter = used + 1;
    }
}

fn apply_item_update(record: &mut ItemRecord, update: &ItemUpdate) {
    if let Some(name) = &update.name {
        record.name = name.clone();
    }
    if let Some(key) = &update.key {
        record.key = key.clone();
    }
    if let Some(key_proto) = &update.key_proto {
        record.key_proto = key_proto.clone();
    }
    if let Some(value_type) = update.value_type {
        record.value_type = value_type;
    }
    if let Some(delay) = &update.delay {
        record.delay = delay.clone();
    }
    if let Some(history) = &update.history {
        record.history = history.clone();
    }
    if let Some(trends) = &update.trends {
        record.trends = trends.clone();
    }
    if let Some(units) = &update.units {
        record.units = units.clone();
    }
    if let Some(description) = &update.description {
        record.description = description.clone();
    }
    if let Some(master) = update.master {
        record.master = master;
    }
    if let Some(tags) = &update.tags {
        record.tags = tags.clone();
    }
    if let Some(discovery) = update.discovery {
        record.discovery = discovery;
    }
    if let Some(lastcheck) = update.lastcheck {
        record.lastcheck = Some(lastcheck);
    }
    if let Some(ts_delete) = update.ts_delete {
        record.ts_delete = ts_delete;
    }
}

fn apply_graph_update(record: &mut GraphRecord, update: &GraphUpdate) {
    if let Some(name) = &update.name {
        record.name = name.clone();
    }
    if let Some(width) = update.width {
        record.width = width;
    }
    if let Some(height) = update.height {
        record.height = height;
    }
    if let Some(yaxismin) = update.yaxismin {
        record.yaxismin = yaxismin;
    }
    if let Some(yaxismax) = update.yaxismax {
        record.yaxismax = yaxismax;
    }
    if let Some(show_work_period) = update.show_work_period {
        record.show_work_period = show_work_period;
    }
    if let Some(show_triggers) = update.show_triggers {
        record.show_triggers = show_triggers;
    }
    if let Some(graph_type) = update.graph_type {
        record.graph_type = graph_type;
    }
    if let Some(show_legend) = update.show_legend {
        record.show_legend = show_legend;
    }
    if let Some(show_3d) = update.show_3d {
        record.show_3d = show_3d;
    }
    if let Some(percent_left) = update.percent_left {
        record.percent_left = percent_left;
    }
    if let Some(percent_right) = update.percent_right {
        record.percent_right = percent_right;
    }
    if let Some(ymin_type) = update.ymin_type {
        record.ymin_type = ymin_type;
    }
    if let Some(ymax_type) = update.ymax_type {
        record.ymax_type = ymax_type;
    }
    if let Some(ymin_item) = update.ymin_item {
        record.ymin_item = ymin_item;
    }
    if let Some(ymax_item) = update.ymax_item {
        record.ymax_item = ymax_item;
    }
    if let Some(discovery) = update.discovery {
        record.discovery = discovery;
    }
    if let Some(lastcheck) = update.lastcheck {
        record.lastcheck = Some(lastcheck);
    }
    if let Some(ts_delete) = update.ts_delete {
        record.ts_delete = ts_delete;
    }
}

fn apply_gitem_update(record: &mut GitemRecord, update: &GitemUpdate) {
    if let Some(item) = update.item {
        record.item = item;
    }
    if let Some(draw_style) = update.draw_style {
        record.draw_style = draw_style;
    }
    if let Some(sort_order) = update.sort_order {
        record.sort_order = sort_order;
    }
    if let Some(color) = &update.color {
        record.color = color.clone();
    }
    if let Some(y_axis_side) = update.y_axis_side {
        record.y_axis_side = y_axis_side;
    }
    if let Some(calc_function) = update.calc_function {
        record.calc_function = calc_function;
    }
    if let Some(kind) = update.kind {
        record.kind = kind;
    }
}

/// Thread-safe in-memory discovery store.
#[derive(Debug, Default)]
pub struct InMemoryDiscoveryStore {
    state: RwLock<StoreState>,
    snapshot: RwLock<Option<StoreState>>,
    ids: RwLock<IdCounters>,
}

impl InMemoryDiscoveryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live host. Host advisory locks succeed only for
    /// registered hosts.
    pub fn register_host(&self, host: HostId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("host.register"))?;
        state.hosts.insert(host);
        Ok(())
    }

    /// Drop a host registration, as happens when an operator removes the
    /// host while discovery is in flight.
    pub fn remove_host(&self, host: HostId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("host.remove"))?;
        state.hosts.remove(&host);
        Ok(())
    }
}

impl DiscoveryStore for InMemoryDiscoveryStore {
    fn rule(&self, id: RuleId) -> Result<Option<DiscoveryRule>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("rule.get"))?;
        Ok(state.rules.get(&id).cloned())
    }

    fn put_rule(&self, rule: &DiscoveryRule) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("rule.put"))?;
        let mut ids = self.ids.write().map_err(|_| lock_err("rule.put"))?;
        for proto in &rule.item_prototypes {
            bump(&mut ids.item, proto.id.0);
        }
        for proto in &rule.graph_prototypes {
            bump(&mut ids.graph, proto.id.0);
        }
        drop(ids);
        state.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    fn items_by_prototypes(&self, prototypes: &[ItemId]) -> Result<Vec<ItemRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("item.by_prototypes"))?;
        let wanted: HashSet<ItemId> = prototypes.iter().copied().collect();
        let mut out: Vec<ItemRecord> = state
            .items
            .values()
            .filter(|r| r.prototype.is_some_and(|p| wanted.contains(&p)))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    fn item(&self, id: ItemId) -> Result<Option<ItemRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("item.get"))?;
        Ok(state.items.get(&id).cloned())
    }

    fn insert_item(&self, record: &ItemRecord) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("item.insert"))?;
        if state.items.contains_key(&record.id) {
            return Err(StorageError::AlreadyExists {
                entity: "item",
                id: record.id.0,
            });
        }
        let mut ids = self.ids.write().map_err(|_| lock_err("item.insert"))?;
        bump(&mut ids.item, record.id.0);
        drop(ids);
        state.items.insert(record.id, record.clone());
        Ok(())
    }

    fn update_item(&self, id: ItemId, update: &ItemUpdate) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("item.update"))?;
        let record = state
            .items
            .get_mut(&id)
            .ok_or(StorageError::RowNotFound {
                entity: "item",
                id: id.0,
            })?;
        apply_item_update(record, update);
        Ok(())
    }

    fn delete_items(&self, ids: &[ItemId]) -> Result<Vec<ItemId>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("item.delete"))?;
        let mut doomed: HashSet<ItemId> = ids
            .iter()
            .copied()
            .filter(|id| state.items.contains_key(id))
            .collect();

        // Pull dependent chains down with their masters.
        loop {
            let mut grew = false;
            for record in state.items.values() {
                if doomed.contains(&record.id) {
                    continue;
                }
                if record.master.is_some_and(|m| doomed.contains(&m)) {
                    doomed.insert(record.id);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        for id in &doomed {
            state.items.remove(id);
        }
        state.gitems.retain(|_, g| !doomed.contains(&g.item));

        let mut out: Vec<ItemId> = doomed.into_iter().collect();
        out.sort_unstable();
        Ok(out)
    }

    fn item_keys_on_host(
        &self,
        host: HostId,
        keys: &[String],
        exclude: &[ItemId],
    ) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("item.keys_on_host"))?;
        let wanted: HashSet<&String> = keys.iter().collect();
        let excluded: HashSet<ItemId> = exclude.iter().copied().collect();
        let mut taken: Vec<String> = state
            .items
            .values()
            .filter(|r| r.host == host && !excluded.contains(&r.id) && wanted.contains(&r.key))
            .map(|r| r.key.clone())
            .collect::<HashSet<String>>()
            .into_iter()
            .collect();
        taken.sort_unstable();
        Ok(taken)
    }

    fn item_links_on_host(
        &self,
        host: HostId,
    ) -> Result<Vec<(ItemId, Option<ItemId>)>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("item.links_on_host"))?;
        let mut out: Vec<(ItemId, Option<ItemId>)> = state
            .items
            .values()
            .filter(|r| r.host == host)
            .map(|r| (r.id, r.master))
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    fn graphs_by_prototypes(
        &self,
        prototypes: &[GraphId],
    ) -> Result<Vec<GraphRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("graph.by_prototypes"))?;
        let wanted: HashSet<GraphId> = prototypes.iter().copied().collect();
        let mut out: Vec<GraphRecord> = state
            .graphs
            .values()
            .filter(|r| r.prototype.is_some_and(|p| wanted.contains(&p)))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    fn insert_graph(&self, record: &GraphRecord) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("graph.insert"))?;
        if state.graphs.contains_key(&record.id) {
            return Err(StorageError::AlreadyExists {
                entity: "graph",
                id: record.id.0,
            });
        }
        let mut ids = self.ids.write().map_err(|_| lock_err("graph.insert"))?;
        bump(&mut ids.graph, record.id.0);
        drop(ids);
        state.graphs.insert(record.id, record.clone());
        Ok(())
    }

    fn update_graph(&self, id: GraphId, update: &GraphUpdate) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("graph.update"))?;
        let record = state
            .graphs
            .get_mut(&id)
            .ok_or(StorageError::RowNotFound {
                entity: "graph",
                id: id.0,
            })?;
        apply_graph_update(record, update);
        Ok(())
    }

    fn delete_graphs(&self, ids: &[GraphId]) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("graph.delete"))?;
        let doomed: HashSet<GraphId> = ids.iter().copied().collect();
        for id in &doomed {
            state.graphs.remove(id);
        }
        state.gitems.retain(|_, g| !doomed.contains(&g.graph));
        Ok(())
    }

    fn graph_names_on_host(
        &self,
        host: HostId,
        names: &[String],
        exclude: &[GraphId],
    ) -> Result<Vec<String>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("graph.names_on_host"))?;
        let wanted: HashSet<&String> = names.iter().collect();
        let excluded: HashSet<GraphId> = exclude.iter().copied().collect();
        let mut taken: Vec<String> = state
            .graphs
            .values()
            .filter(|r| r.host == host && !excluded.contains(&r.id) && wanted.contains(&r.name))
            .map(|r| r.name.clone())
            .collect::<HashSet<String>>()
            .into_iter()
            .collect();
        taken.sort_unstable();
        Ok(taken)
    }

    fn gitems_by_graphs(&self, graphs: &[GraphId]) -> Result<Vec<GitemRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("gitem.by_graphs"))?;
        let wanted: HashSet<GraphId> = graphs.iter().copied().collect();
        let mut out: Vec<GitemRecord> = state
            .gitems
            .values()
            .filter(|r| wanted.contains(&r.graph))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    fn insert_gitem(&self, record: &GitemRecord) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("gitem.insert"))?;
        if state.gitems.contains_key(&record.id) {
            return Err(StorageError::AlreadyExists {
                entity: "series",
                id: record.id.0,
            });
        }
        let mut ids = self.ids.write().map_err(|_| lock_err("gitem.insert"))?;
        bump(&mut ids.gitem, record.id.0);
        drop(ids);
        state.gitems.insert(record.id, record.clone());
        Ok(())
    }

    fn update_gitem(&self, id: GitemId, update: &GitemUpdate) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("gitem.update"))?;
        let record = state
            .gitems
            .get_mut(&id)
            .ok_or(StorageError::RowNotFound {
                entity: "series",
                id: id.0,
            })?;
        apply_gitem_update(record, update);
        Ok(())
    }

    fn delete_gitems(&self, ids: &[GitemId]) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("gitem.delete"))?;
        for id in ids {
            state.gitems.remove(id);
        }
        Ok(())
    }

    fn reserve_ids(&self, domain: IdDomain, count: u64) -> Result<u64, StorageError> {
        let mut ids = self.ids.write().map_err(|_| lock_err("ids.reserve"))?;
        let counter = match domain {
            IdDomain::Item => &mut ids.item,
            IdDomain::Graph => &mut ids.graph,
            IdDomain::Gitem => &mut ids.gitem,
        };
        let first = *counter;
        *counter += count;
        Ok(first)
    }

    fn lock_host(&self, host: HostId) -> Result<(), StorageError> {
        let state = self.state.read().map_err(|_| lock_err("host.lock"))?;
        if state.hosts.contains(&host) {
            Ok(())
        } else {
            Err(StorageError::LockUnavailable {
                entity: "host",
                id: host.0,
            })
        }
    }

    fn lock_item_prototype(&self, id: ItemId) -> Result<(), StorageError> {
        let state = self.state.read().map_err(|_| lock_err("item.lock_prototype"))?;
        let live = state
            .rules
            .values()
            .any(|r| r.item_prototypes.iter().any(|p| p.id == id));
        if live {
            Ok(())
        } else {
            Err(StorageError::LockUnavailable {
                entity: "item prototype",
                id: id.0,
            })
        }
    }

    fn lock_graph_prototype(&self, id: GraphId) -> Result<(), StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("graph.lock_prototype"))?;
        let live = state
            .rules
            .values()
            .any(|r| r.graph_prototypes.iter().any(|p| p.id == id));
        if live {
            Ok(())
        } else {
            Err(StorageError::LockUnavailable {
                entity: "graph prototype",
                id: id.0,
            })
        }
    }

    fn begin(&self) -> Result<(), StorageError> {
        let state = self.state.read().map_err(|_| lock_err("txn.begin"))?;
        let mut snapshot = self.snapshot.write().map_err(|_| lock_err("txn.begin"))?;
        if snapshot.is_some() {
            return Err(StorageError::NestedTransaction);
        }
        *snapshot = Some(state.clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        let mut snapshot = self.snapshot.write().map_err(|_| lock_err("txn.commit"))?;
        if snapshot.take().is_none() {
            return Err(StorageError::NoTransaction);
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), StorageError> {
        let mut snapshot = self.snapshot.write().map_err(|_| lock_err("txn.rollback"))?;
        let Some(saved) = snapshot.take() else {
            return Err(StorageError::NoTransaction);
        };
        drop(snapshot);
        let mut state = self.state.write().map_err(|_| lock_err("txn.rollback"))?;
        *state = saved;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::item::ItemPrototype;

    fn store_with_host(host: HostId) -> InMemoryDiscoveryStore {
        let store = InMemoryDiscoveryStore::new();
        store.register_host(host).unwrap();
        store
    }

    #[test]
    fn test_insert_and_get_item() {
        let store = store_with_host(HostId(1));
        let record = ItemRecord::new(ItemId(7), HostId(1), "CPU load", "cpu.load");
        store.insert_item(&record).unwrap();

        let loaded = store.item(ItemId(7)).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.item(ItemId(8)).unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_id_rejected() {
        let store = store_with_host(HostId(1));
        let record = ItemRecord::new(ItemId(7), HostId(1), "CPU load", "cpu.load");
        store.insert_item(&record).unwrap();

        let err = store.insert_item(&record).unwrap_err();
        assert!(matches!(
            err,
            StorageError::AlreadyExists { entity: "item", id: 7 }
        ));
    }

    #[test]
    fn test_update_missing_row() {
        let store = InMemoryDiscoveryStore::new();
        let err = store
            .update_item(ItemId(99), &ItemUpdate::default())
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::RowNotFound { entity: "item", id: 99 }
        ));
    }

    #[test]
    fn test_update_item_applies_only_set_fields() {
        let store = store_with_host(HostId(1));
        let mut record = ItemRecord::new(ItemId(7), HostId(1), "CPU load", "cpu.load");
        record.delay = "1m".to_string();
        store.insert_item(&record).unwrap();

        let update = ItemUpdate {
            name: Some("CPU utilization".to_string()),
            master: Some(Some(ItemId(3))),
            ..ItemUpdate::default()
        };
        store.update_item(ItemId(7), &update).unwrap();

        let loaded = store.item(ItemId(7)).unwrap().unwrap();
        assert_eq!(loaded.name, "CPU utilization");
        assert_eq!(loaded.master, Some(ItemId(3)));
        assert_eq!(loaded.delay, "1m");
        assert_eq!(loaded.key, "cpu.load");
    }

    #[test]
    fn test_delete_items_cascades_dependents_and_series() {
        let store = store_with_host(HostId(1));
        let master = ItemRecord::new(ItemId(1), HostId(1), "raw", "raw");
        let child = ItemRecord::new(ItemId(2), HostId(1), "parsed", "parsed").with_master(ItemId(1));
        let grandchild =
            ItemRecord::new(ItemId(3), HostId(1), "rate", "rate").with_master(ItemId(2));
        let unrelated = ItemRecord::new(ItemId(4), HostId(1), "other", "other");
        for record in [&master, &child, &grandchild, &unrelated] {
            store.insert_item(record).unwrap();
        }
        store
            .insert_graph(&GraphRecord::new(GraphId(1), HostId(1), "Rates"))
            .unwrap();
        store
            .insert_gitem(&GitemRecord::new(GitemId(1), GraphId(1), ItemId(3)))
            .unwrap();
        store
            .insert_gitem(&GitemRecord::new(GitemId(2), GraphId(1), ItemId(4)))
            .unwrap();

        let deleted = store.delete_items(&[ItemId(1)]).unwrap();
        assert_eq!(deleted, vec![ItemId(1), ItemId(2), ItemId(3)]);
        assert!(store.item(ItemId(4)).unwrap().is_some());

        let series = store.gitems_by_graphs(&[GraphId(1)]).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].item, ItemId(4));
    }

    #[test]
    fn test_reserved_ids_skip_seeded_rows() {
        let store = store_with_host(HostId(1));
        store
            .insert_item(&ItemRecord::new(ItemId(100), HostId(1), "seed", "seed"))
            .unwrap();

        let first = store.reserve_ids(IdDomain::Item, 2).unwrap();
        assert_eq!(first, 101);
        let next = store.reserve_ids(IdDomain::Item, 1).unwrap();
        assert_eq!(next, 103);
    }

    #[test]
    fn test_rollback_restores_state_but_not_sequences() {
        let store = store_with_host(HostId(1));
        store
            .insert_item(&ItemRecord::new(ItemId(1), HostId(1), "keep", "keep"))
            .unwrap();

        store.begin().unwrap();
        let reserved = store.reserve_ids(IdDomain::Item, 5).unwrap();
        store
            .insert_item(&ItemRecord::new(ItemId(reserved), HostId(1), "tmp", "tmp"))
            .unwrap();
        store
            .update_item(
                ItemId(1),
                &ItemUpdate {
                    name: Some("renamed".to_string()),
                    ..ItemUpdate::default()
                },
            )
            .unwrap();
        store.rollback().unwrap();

        assert!(store.item(ItemId(reserved)).unwrap().is_none());
        assert_eq!(store.item(ItemId(1)).unwrap().unwrap().name, "keep");
        // The reserved range is burned.
        let after = store.reserve_ids(IdDomain::Item, 1).unwrap();
        assert!(after > reserved);
    }

    #[test]
    fn test_commit_keeps_writes() {
        let store = store_with_host(HostId(1));
        store.begin().unwrap();
        store
            .insert_item(&ItemRecord::new(ItemId(1), HostId(1), "a", "a"))
            .unwrap();
        store.commit().unwrap();
        assert!(store.item(ItemId(1)).unwrap().is_some());
    }

    #[test]
    fn test_transaction_nesting_rejected() {
        let store = InMemoryDiscoveryStore::new();
        store.begin().unwrap();
        assert!(matches!(
            store.begin().unwrap_err(),
            StorageError::NestedTransaction
        ));
        store.rollback().unwrap();

        assert!(matches!(
            store.commit().unwrap_err(),
            StorageError::NoTransaction
        ));
        assert!(matches!(
            store.rollback().unwrap_err(),
            StorageError::NoTransaction
        ));
    }

    #[test]
    fn test_host_lock_requires_registration() {
        let store = InMemoryDiscoveryStore::new();
        assert!(matches!(
            store.lock_host(HostId(5)).unwrap_err(),
            StorageError::LockUnavailable { entity: "host", id: 5 }
        ));

        store.register_host(HostId(5)).unwrap();
        store.lock_host(HostId(5)).unwrap();

        store.remove_host(HostId(5)).unwrap();
        assert!(store.lock_host(HostId(5)).is_err());
    }

    #[test]
    fn test_prototype_lock_tracks_rules() {
        let store = InMemoryDiscoveryStore::new();
        assert!(store.lock_item_prototype(ItemId(10)).is_err());

        let rule = DiscoveryRule::new(RuleId(1), HostId(1), "Disks", "disk.discovery")
            .with_item_prototype(ItemPrototype::new(ItemId(10), "{#DEV} util", "util[{#DEV}]"));
        store.put_rule(&rule).unwrap();
        store.lock_item_prototype(ItemId(10)).unwrap();
        assert!(store.lock_item_prototype(ItemId(11)).is_err());

        // Prototype ids seeded through rules are skipped by the sequence.
        assert!(store.reserve_ids(IdDomain::Item, 1).unwrap() > 10);
    }

    #[test]
    fn test_item_keys_on_host_excludes_given_items() {
        let store = store_with_host(HostId(1));
        store
            .insert_item(&ItemRecord::new(ItemId(1), HostId(1), "a", "net[eth0]"))
            .unwrap();
        store
            .insert_item(&ItemRecord::new(ItemId(2), HostId(1), "b", "net[eth1]"))
            .unwrap();
        store
            .insert_item(&ItemRecord::new(ItemId(3), HostId(2), "c", "net[eth2]"))
            .unwrap();

        let keys = vec![
            "net[eth0]".to_string(),
            "net[eth1]".to_string(),
            "net[eth2]".to_string(),
        ];
        let taken = store.item_keys_on_host(HostId(1), &keys, &[ItemId(2)]).unwrap();
        // eth1 is excluded, eth2 lives on another host.
        assert_eq!(taken, vec!["net[eth0]".to_string()]);
    }
}
