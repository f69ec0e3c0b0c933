use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use toposync::store::memory::InMemoryDiscoveryStore;
use toposync::store::{DiscoveryStatus, GraphId, ItemId};
use toposync::{
    ConditionOperator, DiscoverMode, DiscoveryEngine, DiscoveryError, DiscoveryRule,
    DiscoveryStore, Filter, FilterCondition, FilterLogic, GitemPrototype, GraphPrototype, HostId,
    InMemoryExpressions, ItemPrototype, NoopAudit, ObjectClass, Override, OverrideAction,
    OverrideOperation, PatternOperator, PrototypeStatus, RuleId, Tag,
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

/// Two item prototypes and a graph plotting both, the shape a disk
/// discovery rule usually takes.
fn disk_rule() -> DiscoveryRule {
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
        .with_graph_prototype(
            GraphPrototype::new(GraphId(500), "{#DEV} throughput")
                .with_gitem(GitemPrototype::new(ItemId(100)))
                .with_gitem(GitemPrototype::new(ItemId(101)).with_sort_order(1)),
        )
}

#[test]
fn identical_polls_are_idempotent() {
    let rule = disk_rule();
    let store = seeded_store(&rule);
    let payload = r#"[{"{#DEV}": "sda"}, {"{#DEV}": "sdb"}]"#;

    let first = fresh_engine(&store)
        .process_at(rule.id, payload, at(0))
        .unwrap();
    assert_eq!(first.created, 6); // four items, two graphs
    assert!(!first.unchanged);
    assert!(first.warnings.is_empty());

    // A fresh engine holds no snapshot, so the full diff pass runs and
    // still finds nothing to write.
    let second = fresh_engine(&store)
        .process_at(rule.id, payload, at(5))
        .unwrap();
    assert!(!second.unchanged);
    assert!(second.is_noop());

    // The same engine short-circuits on the cached entry set.
    let engine = fresh_engine(&store);
    engine.process_at(rule.id, payload, at(10)).unwrap();
    let third = engine.process_at(rule.id, payload, at(15)).unwrap();
    assert!(third.unchanged);
    assert_eq!(third.fingerprint, first.fingerprint);
}

#[test]
fn renaming_macro_updates_objects_in_place() {
    let rule = DiscoveryRule::new(RuleId(1), HostId(1), "Disks", "disk.discovery")
        .with_item_prototype(ItemPrototype::new(
            ItemId(100),
            "Read rate on {#ALIAS}",
            "disk.read[{#DEV}]",
        ));
    let store = seeded_store(&rule);
    let engine = fresh_engine(&store);

    let first = engine
        .process_at(
            rule.id,
            r#"[{"{#DEV}": "sda", "{#ALIAS}": "system disk"}]"#,
            at(0),
        )
        .unwrap();
    assert_eq!(first.created, 1);
    let before = store.items_by_prototypes(&[ItemId(100)]).unwrap();
    assert_eq!(before[0].name, "Read rate on system disk");

    // The key is unchanged, so the row still maps to the same item.
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

    let after = store.items_by_prototypes(&[ItemId(100)]).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].name, "Read rate on boot disk");
}

#[test]
fn lost_objects_age_out_and_delete() {
    let rule = disk_rule().with_lifetime("1h");
    let store = seeded_store(&rule);
    let engine = fresh_engine(&store);

    let both = r#"[{"{#DEV}": "sda"}, {"{#DEV}": "sdb"}]"#;
    let only_sda = r#"[{"{#DEV}": "sda"}]"#;

    let first = engine.process_at(rule.id, both, at(0)).unwrap();
    assert_eq!(first.created, 6);

    // sdb disappears: its items and graph are marked lost with a deadline
    // one lifetime after they were last seen.
    let second = engine.process_at(rule.id, only_sda, at(30)).unwrap();
    assert_eq!(second.deleted, 0);
    let lost: Vec<_> = store
        .items_by_prototypes(&[ItemId(100), ItemId(101)])
        .unwrap()
        .into_iter()
        .filter(|r| r.discovery == DiscoveryStatus::Lost)
        .collect();
    assert_eq!(lost.len(), 2);
    assert!(lost.iter().all(|r| r.ts_delete == Some(at(60))));

    // Past the deadline everything lost is dropped: two items plus the
    // graph assembled from them.
    let third = engine.process_at(rule.id, only_sda, at(120)).unwrap();
    assert_eq!(third.deleted, 3);
    assert_eq!(
        store
            .items_by_prototypes(&[ItemId(100), ItemId(101)])
            .unwrap()
            .len(),
        2
    );
    assert_eq!(store.graphs_by_prototypes(&[GraphId(500)]).unwrap().len(), 1);
}

#[test]
fn reappearing_row_restores_lost_objects() {
    let rule = disk_rule().with_lifetime("1h");
    let store = seeded_store(&rule);
    let engine = fresh_engine(&store);

    let both = r#"[{"{#DEV}": "sda"}, {"{#DEV}": "sdb"}]"#;
    engine.process_at(rule.id, both, at(0)).unwrap();
    engine
        .process_at(rule.id, r#"[{"{#DEV}": "sda"}]"#, at(30))
        .unwrap();

    let outcome = engine.process_at(rule.id, both, at(45)).unwrap();
    assert_eq!(outcome.created, 0);
    assert_eq!(outcome.deleted, 0);

    let records = store
        .items_by_prototypes(&[ItemId(100), ItemId(101)])
        .unwrap();
    assert_eq!(records.len(), 4);
    assert!(records
        .iter()
        .all(|r| r.discovery == DiscoveryStatus::Normal && r.ts_delete.is_none()));
}

#[test]
fn duplicate_names_yield_one_object_and_a_warning() {
    let rule = DiscoveryRule::new(RuleId(1), HostId(1), "Disks", "disk.discovery")
        .with_item_prototype(ItemPrototype::new(
            ItemId(100),
            "{#DEV} read rate",
            "disk.read[{#DEV}]",
        ))
        .with_graph_prototype(
            GraphPrototype::new(GraphId(500), "Throughput on {#GROUP}")
                .with_gitem(GitemPrototype::new(ItemId(100))),
        );
    let store = seeded_store(&rule);
    let engine = fresh_engine(&store);

    let payload = r#"[
        {"{#DEV}": "sda", "{#GROUP}": "local"},
        {"{#DEV}": "sdb", "{#GROUP}": "local"}
    ]"#;
    let outcome = engine.process_at(rule.id, payload, at(0)).unwrap();

    // Two items, but only the first row gets the colliding graph name.
    assert_eq!(outcome.created, 3);
    assert_eq!(store.graphs_by_prototypes(&[GraphId(500)]).unwrap().len(), 1);
    assert_eq!(
        outcome
            .warnings
            .iter()
            .filter(|w| w.contains(
                "cannot create graph: graph with the same name \"Throughput on local\" already exists"
            ))
            .count(),
        1
    );
}

#[test]
fn override_stop_limits_later_steps_per_row() {
    let ssd_filter = Filter::new(
        FilterLogic::And,
        vec![FilterCondition::new("A", "{#TYPE}", "ssd", ConditionOperator::Equals).unwrap()],
        None,
    )
    .unwrap();
    let disable_ssd = Override::new("disable ssd items", 1)
        .with_filter(ssd_filter)
        .with_stop(true)
        .with_operation(
            OverrideOperation::new(ObjectClass::Item, PatternOperator::Contains, "").with_action(
                OverrideAction::Status {
                    status: PrototypeStatus::Disabled,
                },
            ),
        );
    let tag_everything = Override::new("tag discovered items", 2).with_operation(
        OverrideOperation::new(ObjectClass::Item, PatternOperator::Contains, "").with_action(
            OverrideAction::Tag {
                tag: Tag::new("discovered", "yes"),
            },
        ),
    );

    let rule = DiscoveryRule::new(RuleId(1), HostId(1), "Disks", "disk.discovery")
        .with_item_prototype(ItemPrototype::new(
            ItemId(100),
            "{#DEV} read rate",
            "disk.read[{#DEV}]",
        ))
        .with_override(disable_ssd)
        .with_override(tag_everything);
    let store = seeded_store(&rule);
    let engine = fresh_engine(&store);

    let payload = r#"[
        {"{#DEV}": "sda", "{#TYPE}": "ssd"},
        {"{#DEV}": "sdb", "{#TYPE}": "hdd"}
    ]"#;
    let outcome = engine.process_at(rule.id, payload, at(0)).unwrap();
    assert_eq!(outcome.created, 2);

    let items = store.items_by_prototypes(&[ItemId(100)]).unwrap();
    let sda = items.iter().find(|r| r.key == "disk.read[sda]").unwrap();
    let sdb = items.iter().find(|r| r.key == "disk.read[sdb]").unwrap();

    // The stop on step 1 kept step 2 away from the ssd row only.
    assert_eq!(sda.status, PrototypeStatus::Disabled);
    assert!(sda.tags.is_empty());
    assert_eq!(sdb.status, PrototypeStatus::Enabled);
    assert_eq!(sdb.tags, vec![Tag::new("discovered", "yes")]);
}

#[test]
fn no_discover_override_suppresses_objects() {
    let hide_graphs = Override::new("skip graphs", 1).with_operation(
        OverrideOperation::new(ObjectClass::Graph, PatternOperator::Contains, "").with_action(
            OverrideAction::Discover {
                discover: DiscoverMode::NoDiscover,
            },
        ),
    );
    let rule = disk_rule().with_override(hide_graphs);
    let store = seeded_store(&rule);
    let engine = fresh_engine(&store);

    let outcome = engine
        .process_at(rule.id, r#"[{"{#DEV}": "sda"}]"#, at(0))
        .unwrap();

    // Items come through, the graph is silently suppressed.
    assert_eq!(outcome.created, 2);
    assert!(outcome.warnings.is_empty());
    assert!(store.graphs_by_prototypes(&[GraphId(500)]).unwrap().is_empty());
}

#[test]
fn dangling_named_expression_in_override_is_fatal() {
    let tag_matching = Override::new("tag fast disks", 1).with_operation(
        OverrideOperation::new(ObjectClass::Item, PatternOperator::Matches, "@Fast disks")
            .with_action(OverrideAction::Tag {
                tag: Tag::new("fast", ""),
            }),
    );
    let rule = disk_rule().with_override(tag_matching);
    let store = seeded_store(&rule);
    let engine = fresh_engine(&store);

    let err = engine
        .process_at(rule.id, r#"[{"{#DEV}": "sda"}]"#, at(0))
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Config(_)));
    assert!(err.to_string().contains("unknown global expression '@Fast disks'"));
    assert!(store
        .items_by_prototypes(&[ItemId(100), ItemId(101)])
        .unwrap()
        .is_empty());
}

#[test]
fn payload_shapes_are_validated() {
    let rule = disk_rule();
    let store = seeded_store(&rule);
    let engine = fresh_engine(&store);

    // The wrapped form works the same as a bare array.
    let wrapped = r#"{"data": [{"{#DEV}": "sda"}]}"#;
    let outcome = engine.process_at(rule.id, wrapped, at(0)).unwrap();
    assert_eq!(outcome.created, 3);

    let err = engine
        .process_at(rule.id, r#"{"devices": []}"#, at(5))
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::MalformedInput { .. }));

    let err = engine
        .process_at(rule.id, r#"[1, 2, 3]"#, at(10))
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::MalformedInput { .. }));
}
