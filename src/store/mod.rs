//! Persisted discovery state.
//!
//! Records model the stored shape of items, graphs and plotted series; the
//! [`DiscoveryStore`] trait is the contract the reconcilers drive. Keeping
//! the contract a trait allows:
//! - In-memory backends for testing and embedded use
//! - Database backends for production
//!
//! Mutating calls between `begin` and `commit` belong to one prototype
//! batch; `rollback` discards them. Advisory locks (`lock_host`,
//! `lock_item_prototype`, `lock_graph_prototype`) fail when the underlying
//! object has been deleted since the batch was planned, which is the signal
//! to abandon the batch.

pub mod memory;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::overrides::{PrototypeStatus, Tag};
use crate::rule::{DiscoveryRule, HostId, RuleId};

/// Identifier of a stored item or an item prototype.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a stored graph or a graph prototype.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GraphId(pub u64);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one plotted series inside a graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GitemId(pub u64);

impl fmt::Display for GitemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id namespace for [`DiscoveryStore::reserve_ids`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdDomain {
    /// Item ids.
    Item,
    /// Graph ids.
    Graph,
    /// Plotted-series ids.
    Gitem,
}

/// Discovery lifecycle state of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    /// Present in the latest poll.
    #[default]
    Normal,
    /// Absent from the latest poll; scheduled for deletion when its
    /// retention deadline passes.
    Lost,
}

impl DiscoveryStatus {
    /// True for objects no longer reported by discovery.
    #[must_use]
    pub const fn is_lost(self) -> bool {
        matches!(self, Self::Lost)
    }
}

/// Kind of values an item collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Floating-point numeric.
    Float,
    /// Single-line text.
    Character,
    /// Log lines.
    Log,
    /// Unsigned numeric.
    #[default]
    Unsigned,
    /// Multi-line text.
    Text,
}

/// Graph rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphType {
    /// Overlaid line series.
    #[default]
    Normal,
    /// Stacked series.
    Stacked,
    /// Pie chart.
    Pie,
    /// Exploded pie chart.
    Exploded,
}

/// How a Y-axis boundary is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisScale {
    /// Computed from the plotted data.
    #[default]
    Calculated,
    /// Fixed numeric boundary.
    Fixed,
    /// Boundary tracks the last value of a designated item.
    Item,
}

/// Which Y axis a series is plotted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YAxisSide {
    /// Left axis.
    #[default]
    Left,
    /// Right axis.
    Right,
}

/// Aggregation drawn for a series when points outnumber pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcFunction {
    /// Minimum.
    Min,
    /// Average.
    #[default]
    Avg,
    /// Maximum.
    Max,
    /// Min, average and max together.
    All,
    /// Last value.
    Last,
}

/// Line style of a plotted series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawStyle {
    /// Plain line.
    #[default]
    Line,
    /// Filled region under the line.
    FilledRegion,
    /// Bold line.
    BoldLine,
    /// Dots.
    Dot,
    /// Dashed line.
    DashedLine,
    /// Gradient fill.
    Gradient,
}

/// Role of a series within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitemKind {
    /// Ordinary plotted series.
    #[default]
    Simple,
    /// Series summed into a pie sector total.
    GraphSum,
}

/// A stored item: a discovered instance, or an operator-created item
/// referenced from graphs or master chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Item id.
    pub id: ItemId,
    /// Owning host.
    pub host: HostId,
    /// Prototype this item was discovered from; `None` for items created
    /// directly by operators.
    pub prototype: Option<ItemId>,
    /// Resolved display name.
    pub name: String,
    /// Resolved collection key, unique per host.
    pub key: String,
    /// Key template the item was last rendered from. Keeps identity across
    /// prototype key changes: stored items can still be matched through the
    /// template they were created with.
    pub key_proto: String,
    /// Kind of collected values.
    pub value_type: ValueType,
    /// Update interval.
    pub delay: String,
    /// History retention.
    pub history: String,
    /// Trends retention.
    pub trends: String,
    /// Value units.
    pub units: String,
    /// Free-form description.
    pub description: String,
    /// Administrative status.
    pub status: PrototypeStatus,
    /// Master item this one derives its values from.
    pub master: Option<ItemId>,
    /// Attached tags.
    pub tags: Vec<Tag>,
    /// Discovery lifecycle state.
    pub discovery: DiscoveryStatus,
    /// Last poll that reported this item.
    pub lastcheck: Option<DateTime<Utc>>,
    /// Scheduled deletion time while lost.
    pub ts_delete: Option<DateTime<Utc>>,
}

impl ItemRecord {
    /// Creates an item with default attributes.
    #[must_use]
    pub fn new(id: ItemId, host: HostId, name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id,
            host,
            prototype: None,
            name: name.into(),
            key: key.into(),
            key_proto: String::new(),
            value_type: ValueType::default(),
            delay: String::new(),
            history: String::new(),
            trends: String::new(),
            units: String::new(),
            description: String::new(),
            status: PrototypeStatus::default(),
            master: None,
            tags: Vec::new(),
            discovery: DiscoveryStatus::default(),
            lastcheck: None,
            ts_delete: None,
        }
    }

    /// Sets the originating prototype.
    #[must_use]
    pub const fn with_prototype(mut self, prototype: ItemId) -> Self {
        self.prototype = Some(prototype);
        self
    }

    /// Sets the master item.
    #[must_use]
    pub const fn with_master(mut self, master: ItemId) -> Self {
        self.master = Some(master);
        self
    }
}

/// A stored graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    /// Graph id.
    pub id: GraphId,
    /// Owning host.
    pub host: HostId,
    /// Prototype this graph was discovered from.
    pub prototype: Option<GraphId>,
    /// Graph name, unique per host.
    pub name: String,
    /// Canvas width in pixels.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
    /// Fixed lower Y boundary, used when `ymin_type` is fixed.
    pub yaxismin: f64,
    /// Fixed upper Y boundary, used when `ymax_type` is fixed.
    pub yaxismax: f64,
    /// Shade non-working hours.
    pub show_work_period: bool,
    /// Draw trigger lines.
    pub show_triggers: bool,
    /// Rendering mode.
    pub graph_type: GraphType,
    /// Draw the legend.
    pub show_legend: bool,
    /// Render pies in 3D.
    pub show_3d: bool,
    /// Left percentile line, 0 disables.
    pub percent_left: f64,
    /// Right percentile line, 0 disables.
    pub percent_right: f64,
    /// Lower Y boundary mode.
    pub ymin_type: AxisScale,
    /// Upper Y boundary mode.
    pub ymax_type: AxisScale,
    /// Item driving the lower boundary when `ymin_type` is item-tracking.
    pub ymin_item: Option<ItemId>,
    /// Item driving the upper boundary when `ymax_type` is item-tracking.
    pub ymax_item: Option<ItemId>,
    /// Discovery lifecycle state.
    pub discovery: DiscoveryStatus,
    /// Last poll that reported this graph.
    pub lastcheck: Option<DateTime<Utc>>,
    /// Scheduled deletion time while lost.
    pub ts_delete: Option<DateTime<Utc>>,
}

impl GraphRecord {
    /// Creates a graph with default attributes.
    #[must_use]
    pub fn new(id: GraphId, host: HostId, name: impl Into<String>) -> Self {
        Self {
            id,
            host,
            prototype: None,
            name: name.into(),
            width: 900,
            height: 200,
            yaxismin: 0.0,
            yaxismax: 100.0,
            show_work_period: true,
            show_triggers: true,
            graph_type: GraphType::default(),
            show_legend: true,
            show_3d: false,
            percent_left: 0.0,
            percent_right: 0.0,
            ymin_type: AxisScale::default(),
            ymax_type: AxisScale::default(),
            ymin_item: None,
            ymax_item: None,
            discovery: DiscoveryStatus::default(),
            lastcheck: None,
            ts_delete: None,
        }
    }

    /// Sets the originating prototype.
    #[must_use]
    pub const fn with_prototype(mut self, prototype: GraphId) -> Self {
        self.prototype = Some(prototype);
        self
    }
}

/// One plotted series of a stored graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitemRecord {
    /// Series id.
    pub id: GitemId,
    /// Owning graph.
    pub graph: GraphId,
    /// Plotted item.
    pub item: ItemId,
    /// Line style.
    pub draw_style: DrawStyle,
    /// Position within the graph.
    pub sort_order: u32,
    /// Series color as an RGB hex string.
    pub color: String,
    /// Axis side.
    pub y_axis_side: YAxisSide,
    /// Aggregation function.
    pub calc_function: CalcFunction,
    /// Series role.
    pub kind: GitemKind,
}

impl GitemRecord {
    /// Creates a series with default attributes.
    #[must_use]
    pub fn new(id: GitemId, graph: GraphId, item: ItemId) -> Self {
        Self {
            id,
            graph,
            item,
            draw_style: DrawStyle::default(),
            sort_order: 0,
            color: "1A7C11".to_string(),
            y_axis_side: YAxisSide::default(),
            calc_function: CalcFunction::default(),
            kind: GitemKind::default(),
        }
    }
}

/// Field-wise item patch. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    /// New name.
    pub name: Option<String>,
    /// New key.
    pub key: Option<String>,
    /// New key template.
    pub key_proto: Option<String>,
    /// New value kind.
    pub value_type: Option<ValueType>,
    /// New update interval.
    pub delay: Option<String>,
    /// New history retention.
    pub history: Option<String>,
    /// New trends retention.
    pub trends: Option<String>,
    /// New units.
    pub units: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New master link; `Some(None)` clears it.
    pub master: Option<Option<ItemId>>,
    /// Replacement tag list.
    pub tags: Option<Vec<Tag>>,
    /// New discovery state.
    pub discovery: Option<DiscoveryStatus>,
    /// New last-seen time.
    pub lastcheck: Option<DateTime<Utc>>,
    /// New scheduled deletion; `Some(None)` clears it.
    pub ts_delete: Option<Option<DateTime<Utc>>>,
}

impl ItemUpdate {
    /// True when the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Field-wise graph patch. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphUpdate {
    /// New name.
    pub name: Option<String>,
    /// New canvas width.
    pub width: Option<u32>,
    /// New canvas height.
    pub height: Option<u32>,
    /// New fixed lower Y boundary.
    pub yaxismin: Option<f64>,
    /// New fixed upper Y boundary.
    pub yaxismax: Option<f64>,
    /// New work-period flag.
    pub show_work_period: Option<bool>,
    /// New trigger-lines flag.
    pub show_triggers: Option<bool>,
    /// New rendering mode.
    pub graph_type: Option<GraphType>,
    /// New legend flag.
    pub show_legend: Option<bool>,
    /// New 3D flag.
    pub show_3d: Option<bool>,
    /// New left percentile.
    pub percent_left: Option<f64>,
    /// New right percentile.
    pub percent_right: Option<f64>,
    /// New lower boundary mode.
    pub ymin_type: Option<AxisScale>,
    /// New upper boundary mode.
    pub ymax_type: Option<AxisScale>,
    /// New lower boundary item; `Some(None)` clears it.
    pub ymin_item: Option<Option<ItemId>>,
    /// New upper boundary item; `Some(None)` clears it.
    pub ymax_item: Option<Option<ItemId>>,
    /// New discovery state.
    pub discovery: Option<DiscoveryStatus>,
    /// New last-seen time.
    pub lastcheck: Option<DateTime<Utc>>,
    /// New scheduled deletion; `Some(None)` clears it.
    pub ts_delete: Option<Option<DateTime<Utc>>>,
}

impl GraphUpdate {
    /// True when the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Field-wise series patch. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GitemUpdate {
    /// New plotted item.
    pub item: Option<ItemId>,
    /// New line style.
    pub draw_style: Option<DrawStyle>,
    /// New position.
    pub sort_order: Option<u32>,
    /// New color.
    pub color: Option<String>,
    /// New axis side.
    pub y_axis_side: Option<YAxisSide>,
    /// New aggregation function.
    pub calc_function: Option<CalcFunction>,
    /// New series role.
    pub kind: Option<GitemKind>,
}

impl GitemUpdate {
    /// True when the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Row not found.
    #[error("{entity} not found: {id}")]
    RowNotFound {
        /// Entity kind.
        entity: &'static str,
        /// Missing id.
        id: u64,
    },

    /// Insert with an id that is already taken.
    #[error("{entity} {id} already exists")]
    AlreadyExists {
        /// Entity kind.
        entity: &'static str,
        /// Conflicting id.
        id: u64,
    },

    /// Advisory lock refused; the object was deleted or claimed elsewhere.
    #[error("cannot take lock on {entity} {id}")]
    LockUnavailable {
        /// Entity kind.
        entity: &'static str,
        /// Locked id.
        id: u64,
    },

    /// `begin` while a transaction is already open.
    #[error("a transaction is already open")]
    NestedTransaction,

    /// `commit` or `rollback` without an open transaction.
    #[error("no open transaction")]
    NoTransaction,

    /// Backend error.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True when retrying the whole pass later could succeed.
    ///
    /// A refused advisory lock means the underlying object is gone; that
    /// will not change on retry. Backend trouble may clear up.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Storage contract the reconcilers drive.
///
/// All mutations between `begin` and `commit` form one batch; `rollback`
/// discards them. Implementations must be safe for concurrent readers, but
/// only one transaction is open at a time per store handle.
pub trait DiscoveryStore: Send + Sync {
    /// Load a discovery rule.
    fn rule(&self, id: RuleId) -> Result<Option<DiscoveryRule>, StorageError>;

    /// Insert or replace a discovery rule.
    fn put_rule(&self, rule: &DiscoveryRule) -> Result<(), StorageError>;

    /// Load items discovered from any of the given prototypes.
    fn items_by_prototypes(&self, prototypes: &[ItemId]) -> Result<Vec<ItemRecord>, StorageError>;

    /// Get an item by id.
    fn item(&self, id: ItemId) -> Result<Option<ItemRecord>, StorageError>;

    /// Insert a new item. Returns an error if the id already exists.
    fn insert_item(&self, record: &ItemRecord) -> Result<(), StorageError>;

    /// Patch an existing item.
    fn update_item(&self, id: ItemId, update: &ItemUpdate) -> Result<(), StorageError>;

    /// Delete items, cascading over dependent-item chains and removing
    /// plotted series that reference the deleted items. Missing ids are
    /// ignored. Returns every deleted item id, cascaded ones included.
    fn delete_items(&self, ids: &[ItemId]) -> Result<Vec<ItemId>, StorageError>;

    /// Of the given keys, those already taken on the host by items other
    /// than the excluded ones.
    fn item_keys_on_host(
        &self,
        host: HostId,
        keys: &[String],
        exclude: &[ItemId],
    ) -> Result<Vec<String>, StorageError>;

    /// Master links of every item on the host, for dependency validation.
    fn item_links_on_host(
        &self,
        host: HostId,
    ) -> Result<Vec<(ItemId, Option<ItemId>)>, StorageError>;

    /// Load graphs discovered from any of the given prototypes.
    fn graphs_by_prototypes(&self, prototypes: &[GraphId])
        -> Result<Vec<GraphRecord>, StorageError>;

    /// Insert a new graph. Returns an error if the id already exists.
    fn insert_graph(&self, record: &GraphRecord) -> Result<(), StorageError>;

    /// Patch an existing graph.
    fn update_graph(&self, id: GraphId, update: &GraphUpdate) -> Result<(), StorageError>;

    /// Delete graphs and their plotted series. Missing ids are ignored.
    fn delete_graphs(&self, ids: &[GraphId]) -> Result<(), StorageError>;

    /// Of the given names, those already taken on the host by graphs other
    /// than the excluded ones.
    fn graph_names_on_host(
        &self,
        host: HostId,
        names: &[String],
        exclude: &[GraphId],
    ) -> Result<Vec<String>, StorageError>;

    /// Plotted series of the given graphs.
    fn gitems_by_graphs(&self, graphs: &[GraphId]) -> Result<Vec<GitemRecord>, StorageError>;

    /// Insert a new series. Returns an error if the id already exists.
    fn insert_gitem(&self, record: &GitemRecord) -> Result<(), StorageError>;

    /// Patch an existing series.
    fn update_gitem(&self, id: GitemId, update: &GitemUpdate) -> Result<(), StorageError>;

    /// Delete series. Missing ids are ignored.
    fn delete_gitems(&self, ids: &[GitemId]) -> Result<(), StorageError>;

    /// Reserve `count` contiguous ids in a namespace; returns the first.
    fn reserve_ids(&self, domain: IdDomain, count: u64) -> Result<u64, StorageError>;

    /// Take the host advisory lock for the open transaction.
    fn lock_host(&self, host: HostId) -> Result<(), StorageError>;

    /// Take an item-prototype advisory lock.
    fn lock_item_prototype(&self, id: ItemId) -> Result<(), StorageError>;

    /// Take a graph-prototype advisory lock.
    fn lock_graph_prototype(&self, id: GraphId) -> Result<(), StorageError>;

    /// Open a transaction.
    fn begin(&self) -> Result<(), StorageError>;

    /// Commit the open transaction.
    fn commit(&self) -> Result<(), StorageError>;

    /// Discard the open transaction's writes.
    fn rollback(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: the store trait stays object-safe.
    fn _assert_store_object_safe(_: &dyn DiscoveryStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::RowNotFound {
            entity: "item",
            id: 11,
        };
        assert!(err.to_string().contains("item not found: 11"));

        let err = StorageError::Backend("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Backend("io".to_string()).is_transient());
        assert!(!StorageError::LockUnavailable {
            entity: "host",
            id: 1
        }
        .is_transient());
        assert!(!StorageError::NoTransaction.is_transient());
    }

    #[test]
    fn test_empty_updates() {
        assert!(ItemUpdate::default().is_empty());
        assert!(GraphUpdate::default().is_empty());
        assert!(GitemUpdate::default().is_empty());

        let up = ItemUpdate {
            name: Some("cpu".to_string()),
            ..ItemUpdate::default()
        };
        assert!(!up.is_empty());

        // Explicitly clearing a link is a change even though it writes None.
        let up = ItemUpdate {
            master: Some(None),
            ..ItemUpdate::default()
        };
        assert!(!up.is_empty());
    }

    #[test]
    fn test_record_defaults() {
        let item = ItemRecord::new(ItemId(1), HostId(2), "CPU load", "system.cpu.load");
        assert_eq!(item.value_type, ValueType::Unsigned);
        assert_eq!(item.discovery, DiscoveryStatus::Normal);
        assert_eq!(item.master, None);

        let graph = GraphRecord::new(GraphId(3), HostId(2), "CPU usage");
        assert_eq!(graph.graph_type, GraphType::Normal);
        assert_eq!(graph.ymin_type, AxisScale::Calculated);
        assert!(graph.show_legend);

        let gitem = GitemRecord::new(GitemId(4), GraphId(3), ItemId(1));
        assert_eq!(gitem.calc_function, CalcFunction::Avg);
        assert_eq!(gitem.y_axis_side, YAxisSide::Left);
    }

    #[test]
    fn test_record_serde_round_trip() {
        let mut item = ItemRecord::new(ItemId(7), HostId(1), "Free space /", "vfs.fs.size[/]")
            .with_prototype(ItemId(5))
            .with_master(ItemId(6));
        item.discovery = DiscoveryStatus::Lost;

        let json = serde_json::to_string(&item).unwrap();
        let back: ItemRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
        assert!(back.discovery.is_lost());
    }
}
