use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use toposync::store::memory::InMemoryDiscoveryStore;
use toposync::store::{AxisScale, GraphId, ItemId};
use toposync::{
    DiscoverMode, DiscoveryEngine, DiscoveryRule, DiscoveryStore, GitemPrototype, GraphPrototype,
    HostId, InMemoryExpressions, ItemPrototype, NoopAudit, ObjectClass, Override, OverrideAction,
    OverrideOperation, PatternOperator, RuleId,
};

fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn seeded_store(rule: &DiscoveryRule) -> Arc<InMemoryDiscoveryStore> {
    let store = Arc::new(InMemoryDiscoveryStore::new());
    store.register_host(rule.host).unwrap();
    store.put_rule(rule).unwrap();
    store
}

fn fresh_engine(store: &Arc<InMemoryDiscoveryStore>) -> DiscoveryEngine {
    DiscoveryEngine::new(
        Arc::clone(store) as Arc<dyn DiscoveryStore>,
        Arc::new(NoopAudit),
        Arc::new(InMemoryExpressions::new()),
    )
}

fn disk_rule(graph: GraphPrototype) -> DiscoveryRule {
    DiscoveryRule::new(RuleId(1), HostId(1), "Disks", "disk.discovery")
        .with_item_prototype(ItemPrototype::new(
            ItemId(100),
            "{#DEV} read rate",
            "disk.read[{#DEV}]",
        ))
        .with_item_prototype(ItemPrototype::new(
            ItemId(101),
            "{#DEV} write rate",
            "disk.write[{#DEV}]",
        ))
        .with_graph_prototype(graph)
}

fn throughput_graph() -> GraphPrototype {
    GraphPrototype::new(GraphId(500), "{#DEV} throughput")
        .with_gitem(GitemPrototype::new(ItemId(100)))
        .with_gitem(GitemPrototype::new(ItemId(101)).with_sort_order(1))
}

#[test]
fn macro_rename_updates_graph_in_place() {
    let rule = disk_rule(
        GraphPrototype::new(GraphId(500), "{#ALIAS} throughput")
            .with_gitem(GitemPrototype::new(ItemId(100)))
            .with_gitem(GitemPrototype::new(ItemId(101)).with_sort_order(1)),
    );
    let store = seeded_store(&rule);
    let engine = fresh_engine(&store);

    let first = engine
        .process_at(
            rule.id,
            r#"[{"{#DEV}": "sda", "{#ALIAS}": "system disk"}]"#,
            at(0),
        )
        .unwrap();
    assert_eq!(first.created, 3);
    let before = store.graphs_by_prototypes(&[GraphId(500)]).unwrap();
    assert_eq!(before[0].name, "system disk throughput");

    // The items keep their keys, so the graph plotting them is the same
    // graph and only its name moves.
    let second = engine
        .process_at(
            rule.id,
            r#"[{"{#DEV}": "sda", "{#ALIAS}": "boot disk"}]"#,
            at(5),
        )
        .unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 1);
    assert_eq!(second.deleted, 0);

    let after = store.graphs_by_prototypes(&[GraphId(500)]).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].name, "boot disk throughput");
}

#[test]
fn axis_references_follow_each_row() {
    let rule = disk_rule(throughput_graph().with_ymax_item(ItemId(101)));
    let store = seeded_store(&rule);

    let outcome = fresh_engine(&store)
        .process_at(rule.id, r#"[{"{#DEV}": "sda"}, {"{#DEV}": "sdb"}]"#, at(0))
        .unwrap();
    assert_eq!(outcome.created, 6);

    let items = store
        .items_by_prototypes(&[ItemId(100), ItemId(101)])
        .unwrap();
    let graphs = store.graphs_by_prototypes(&[GraphId(500)]).unwrap();
    assert_eq!(graphs.len(), 2);

    // Each graph's axis must point at the write item of its own row, not
    // at a shared one.
    for graph in &graphs {
        let gitems = store.gitems_by_graphs(&[graph.id]).unwrap();
        let read = items
            .iter()
            .find(|r| gitems.iter().any(|g| g.item == r.id) && r.key.starts_with("disk.read["))
            .unwrap();
        let dev = read
            .key
            .trim_start_matches("disk.read[")
            .trim_end_matches(']');
        let write = items
            .iter()
            .find(|r| r.key == format!("disk.write[{dev}]"))
            .unwrap();

        assert_eq!(graph.ymax_type, AxisScale::Item);
        assert_eq!(graph.ymax_item, Some(write.id));
    }
}

#[test]
fn prototype_resize_propagates() {
    let rule = disk_rule(throughput_graph());
    let store = seeded_store(&rule);
    let payload = r#"[{"{#DEV}": "sda"}, {"{#DEV}": "sdb"}]"#;

    fresh_engine(&store).process_at(rule.id, payload, at(0)).unwrap();

    let resized = disk_rule(throughput_graph().with_size(1200, 400));
    store.put_rule(&resized).unwrap();

    let outcome = fresh_engine(&store)
        .process_at(rule.id, payload, at(5))
        .unwrap();
    assert_eq!(outcome.created, 0);
    assert_eq!(outcome.updated, 2);

    let graphs = store.graphs_by_prototypes(&[GraphId(500)]).unwrap();
    assert_eq!(graphs.len(), 2);
    assert!(graphs.iter().all(|g| g.width == 1200 && g.height == 400));
}

#[test]
fn suppressed_constituents_block_graphs() {
    let hide_items = Override::new("skip items", 1).with_operation(
        OverrideOperation::new(ObjectClass::Item, PatternOperator::Contains, "").with_action(
            OverrideAction::Discover {
                discover: DiscoverMode::NoDiscover,
            },
        ),
    );
    let rule = disk_rule(throughput_graph()).with_override(hide_items);
    let store = seeded_store(&rule);

    let outcome = fresh_engine(&store)
        .process_at(rule.id, r#"[{"{#DEV}": "sda"}]"#, at(0))
        .unwrap();

    // New items vanish quietly, but the graph that needed them says why
    // it could not be assembled.
    assert_eq!(outcome.created, 0);
    assert_eq!(
        outcome.warnings,
        vec!["cannot discover graph \"sda throughput\": constituent item is not discovered"]
    );
    assert!(store.graphs_by_prototypes(&[GraphId(500)]).unwrap().is_empty());
}
