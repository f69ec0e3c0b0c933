//! Audit trail of reconciliation writes.
//!
//! Every create, update and delete performed by a reconciler is reported to
//! an [`AuditSink`] with the field-level changes that motivated it. Sinks
//! are infallible: a sink that cannot keep a record drops it, the pass
//! itself never fails over auditing.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One field change captured on an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    /// Field name.
    pub field: String,
    /// Stored value before the write.
    pub from: String,
    /// Value after the write.
    pub to: String,
}

impl FieldDiff {
    /// Creates a field diff.
    #[must_use]
    pub fn new(field: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Kind of write recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    /// Object created.
    Create,
    /// Object fields changed.
    Update,
    /// Object deleted.
    Delete,
}

/// Entity kind an audit record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntity {
    /// A stored item.
    Item,
    /// A stored graph.
    Graph,
    /// A plotted series.
    Gitem,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record id.
    pub id: Uuid,
    /// When the write happened.
    pub at: DateTime<Utc>,
    /// Entity kind.
    pub entity: AuditEntity,
    /// Entity id in its own namespace.
    pub entity_id: u64,
    /// Kind of write.
    pub op: AuditOp,
    /// Object name at the time of the write.
    pub name: String,
    /// Field changes; empty for creates and deletes.
    pub diffs: Vec<FieldDiff>,
}

impl AuditRecord {
    fn record(
        entity: AuditEntity,
        entity_id: u64,
        op: AuditOp,
        name: impl Into<String>,
        diffs: Vec<FieldDiff>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            entity,
            entity_id,
            op,
            name: name.into(),
            diffs,
        }
    }

    /// Record for a created object.
    #[must_use]
    pub fn create(entity: AuditEntity, entity_id: u64, name: impl Into<String>) -> Self {
        Self::record(entity, entity_id, AuditOp::Create, name, Vec::new())
    }

    /// Record for an updated object with its field changes.
    #[must_use]
    pub fn update(
        entity: AuditEntity,
        entity_id: u64,
        name: impl Into<String>,
        diffs: Vec<FieldDiff>,
    ) -> Self {
        Self::record(entity, entity_id, AuditOp::Update, name, diffs)
    }

    /// Record for a deleted object.
    #[must_use]
    pub fn delete(entity: AuditEntity, entity_id: u64, name: impl Into<String>) -> Self {
        Self::record(entity, entity_id, AuditOp::Delete, name, Vec::new())
    }
}

/// Sink receiving audit records.
pub trait AuditSink: Send + Sync {
    /// Accepts one record.
    fn record(&self, record: AuditRecord);
}

/// Sink that discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _record: AuditRecord) {}
}

/// Sink that keeps records in memory, newest last.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAudit {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records for one entity kind.
    #[must_use]
    pub fn for_entity(&self, entity: AuditEntity) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.entity == entity)
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.write() {
            records.push(record);
        }
    }
}
