//! # toposync - Low-level discovery reconciliation
//!
//! toposync turns JSON topology snapshots reported by monitored hosts into
//! synchronized monitoring objects: items instantiated from prototypes,
//! graphs assembled from those items, and dependent-item trees kept within
//! depth and size limits. Object identity survives renames, objects that
//! stop being reported age through a lost lifecycle before deletion, and
//! every change is counted and audited.
//!
//! ## Core Concepts
//!
//! - **Discovery rule**: per-host configuration naming the prototypes, the
//!   row filter, the overrides and the lost-object lifetime
//! - **Entry**: one normalized discovery row, macro name to value
//! - **Prototype**: a template whose `{#MACRO}` placeholders are rendered
//!   once per discovered row
//! - **Reconciliation**: diffing rendered candidates against stored objects
//!   so unchanged objects are untouched and renames update in place
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use toposync::store::memory::InMemoryDiscoveryStore;
//! use toposync::store::ItemId;
//! use toposync::{
//!     DiscoveryEngine, DiscoveryRule, HostId, InMemoryExpressions, ItemPrototype, NoopAudit,
//!     RuleId,
//! };
//!
//! let store = Arc::new(InMemoryDiscoveryStore::new());
//! store.register_host(HostId(1))?;
//!
//! let rule = DiscoveryRule::new(RuleId(1), HostId(1), "Disks", "disk.discovery")
//!     .with_item_prototype(ItemPrototype::new(
//!         ItemId(100),
//!         "{#DEV} read rate",
//!         "disk.read[{#DEV}]",
//!     ));
//! store.put_rule(&rule)?;
//!
//! let engine = DiscoveryEngine::new(
//!     store,
//!     Arc::new(NoopAudit),
//!     Arc::new(InMemoryExpressions::new()),
//! );
//! let outcome = engine.process(RuleId(1), r#"[{"{#DEV}": "sda"}]"#)?;
//! assert_eq!(outcome.created, 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Input model and rule configuration
pub mod entry;
pub mod error;
pub mod filter;
pub mod lifetime;
pub mod macros;
pub mod overrides;
pub mod regexp;
pub mod row;
pub mod rule;

// Reconciliation passes and their seams
pub mod audit;
pub mod deptree;
pub mod engine;
pub mod expression;
pub mod reconcile;
pub mod store;

// Re-export primary types at crate root for convenience
pub use audit::{AuditEntity, AuditOp, AuditRecord, AuditSink, FieldDiff, MemoryAudit, NoopAudit};
pub use deptree::{DependencyForest, ItemRef, TreeViolation};
pub use engine::{DiscoveryEngine, DiscoveryOutcome};
pub use entry::{is_discovery_macro, Entry, EntrySet, MacroPath};
pub use error::{ConfigError, DiscoveryError, DiscoveryResult};
pub use expression::{BasicEvaluator, ExpressionEvaluator};
pub use filter::{ConditionOperator, Filter, FilterCondition, FilterLogic};
pub use lifetime::Lifetime;
pub use macros::{EntryExpander, MacroExpander};
pub use overrides::{
    select_overrides, DiscoverMode, ObjectClass, Override, OverrideAction, OverrideOperation,
    PatternOperator, PrototypeStatus, Tag,
};
pub use reconcile::graph::{sync_graphs, GitemPrototype, GraphPrototype};
pub use reconcile::item::{sync_items, ItemPrototype, ItemSyncOutcome};
pub use reconcile::{FilteredRow, ItemLinkage, SyncContext, SyncStats};
pub use regexp::{ExpressionKind, InMemoryExpressions, NamedExpression, NamedExpressionProvider};
pub use row::{parse_payload, DiscoveryRow};
pub use rule::{DiscoveryRule, HostId, RuleId};
pub use store::{DiscoveryStore, GitemId, GraphId, ItemId, StorageError};
