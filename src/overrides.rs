//! Discovery overrides.
//!
//! Overrides conditionally adjust prototype-derived objects. Each override
//! carries its own filter; per row, overrides are walked in step order and
//! the matching ones attach to the row. A matching override with `stop`
//! set ends the walk for that row only.
//!
//! Application is class-typed: an operation names the object class it
//! targets (item, trigger, graph, host) and a pattern the resolved object
//! name must match. Scalar attributes resolve last-match-wins; list
//! attributes (tags, templates) accumulate as a union.

use serde::{Deserialize, Serialize};

use crate::entry::Entry;
use crate::error::ConfigError;
use crate::expression::ExpressionEvaluator;
use crate::filter::Filter;
use crate::regexp::{pattern_matches, NamedExpressionProvider};

/// Identifier of a template linkable to discovered hosts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TemplateId(pub u64);

/// Administrative status applied to created objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrototypeStatus {
    /// Object is created enabled.
    #[default]
    Enabled,
    /// Object is created disabled.
    Disabled,
}

/// Whether a prototype instantiates for a row at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverMode {
    /// Instantiate normally.
    #[default]
    Discover,
    /// Skip this cycle: existing instances go un-discovered, new
    /// candidates are dropped.
    NoDiscover,
}

/// A name/value tag attached to items and triggers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name.
    pub tag: String,
    /// Tag value, possibly empty.
    #[serde(default)]
    pub value: String,
}

impl Tag {
    /// Creates a tag.
    #[must_use]
    pub fn new(tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            value: value.into(),
        }
    }
}

/// Host inventory population mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryMode {
    /// Inventory disabled.
    Disabled,
    /// Manually maintained inventory.
    Manual,
    /// Inventory populated from item values.
    Automatic,
}

/// Object class an override operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    /// Item prototypes.
    Item,
    /// Trigger prototypes.
    Trigger,
    /// Graph prototypes.
    Graph,
    /// Host prototypes.
    Host,
}

/// Operator matching the resolved object name against an operation pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternOperator {
    /// Name equals the pattern.
    Equals,
    /// Name differs from the pattern.
    NotEquals,
    /// Name contains the pattern.
    Contains,
    /// Name does not contain the pattern.
    NotContains,
    /// Pattern (literal regexp or `@name`) matches the name.
    Matches,
    /// Pattern does not match the name.
    NotMatches,
}

impl PatternOperator {
    /// Evaluates the operator.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unresolvable `@name` sets or bad
    /// patterns on the regexp operators.
    pub fn matches(
        self,
        name: &str,
        pattern: &str,
        provider: &dyn NamedExpressionProvider,
    ) -> Result<bool, ConfigError> {
        match self {
            Self::Equals => Ok(name == pattern),
            Self::NotEquals => Ok(name != pattern),
            Self::Contains => Ok(name.contains(pattern)),
            Self::NotContains => Ok(!name.contains(pattern)),
            Self::Matches => pattern_matches(name, pattern, provider),
            Self::NotMatches => pattern_matches(name, pattern, provider).map(|m| !m),
        }
    }
}

/// One attribute mutation carried by an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverrideAction {
    /// Set the created object's status.
    Status {
        /// New status.
        status: PrototypeStatus,
    },
    /// Control whether the object is discovered at all.
    Discover {
        /// New discover mode.
        discover: DiscoverMode,
    },
    /// Replace the item update interval.
    Delay {
        /// Interval string.
        delay: String,
    },
    /// Replace the item history retention.
    History {
        /// Retention string.
        history: String,
    },
    /// Replace the item trends retention.
    Trends {
        /// Retention string.
        trends: String,
    },
    /// Set the trigger severity.
    Severity {
        /// Severity rank, 0 (not classified) to 5 (disaster).
        severity: u8,
    },
    /// Add a tag to the object.
    Tag {
        /// Tag to add.
        tag: Tag,
    },
    /// Link a template to the discovered host.
    Template {
        /// Template to link.
        template: TemplateId,
    },
    /// Set the host inventory mode.
    Inventory {
        /// New inventory mode.
        mode: InventoryMode,
    },
}

/// One override operation: target class, name pattern, attribute actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideOperation {
    /// Object class the operation applies to.
    pub class: ObjectClass,
    /// Name-match operator.
    pub operator: PatternOperator,
    /// Name-match pattern.
    pub pattern: String,
    /// Attribute mutations, applied in order.
    pub actions: Vec<OverrideAction>,
}

impl OverrideOperation {
    /// Creates an operation with no actions.
    #[must_use]
    pub fn new(class: ObjectClass, operator: PatternOperator, pattern: impl Into<String>) -> Self {
        Self {
            class,
            operator,
            pattern: pattern.into(),
            actions: Vec::new(),
        }
    }

    /// Adds an action.
    #[must_use]
    pub fn with_action(mut self, action: OverrideAction) -> Self {
        self.actions.push(action);
        self
    }

    fn applies_to(
        &self,
        class: ObjectClass,
        name: &str,
        provider: &dyn NamedExpressionProvider,
    ) -> Result<bool, ConfigError> {
        if self.class != class {
            return Ok(false);
        }
        self.operator.matches(name, &self.pattern, provider)
    }
}

/// One override: step-ordered, self-filtered, optionally stopping the walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    /// Human-readable override name, used in warnings.
    pub name: String,
    /// Evaluation order; lower steps run first.
    pub step: u32,
    /// The override's own row filter.
    #[serde(default = "Filter::pass_all")]
    pub filter: Filter,
    /// Stop walking later-step overrides for a row this override matched.
    #[serde(default)]
    pub stop: bool,
    /// Operations applied to matching objects.
    #[serde(default)]
    pub operations: Vec<OverrideOperation>,
}

impl Override {
    /// Creates an override matching every row, with no operations.
    #[must_use]
    pub fn new(name: impl Into<String>, step: u32) -> Self {
        Self {
            name: name.into(),
            step,
            filter: Filter::pass_all(),
            stop: false,
            operations: Vec::new(),
        }
    }

    /// Sets the override's filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the stop flag.
    #[must_use]
    pub fn with_stop(mut self, stop: bool) -> Self {
        self.stop = stop;
        self
    }

    /// Adds an operation.
    #[must_use]
    pub fn with_operation(mut self, operation: OverrideOperation) -> Self {
        self.operations.push(operation);
        self
    }
}

/// Selects the overrides applicable to one row.
///
/// `overrides` must already be in step order (the rule constructor sorts).
/// Returns indexes into `overrides`. A matching override with `stop` ends
/// the walk; overrides whose filter does not match never consult `stop`.
///
/// # Errors
///
/// Propagates [`ConfigError`] from filter evaluation.
pub fn select_overrides(
    overrides: &[Override],
    entry: &Entry,
    provider: &dyn NamedExpressionProvider,
    evaluator: &dyn ExpressionEvaluator,
    warnings: &mut Vec<String>,
) -> Result<Vec<usize>, ConfigError> {
    let mut selected = Vec::new();
    for (i, ov) in overrides.iter().enumerate() {
        if !ov.filter.evaluate(entry, provider, evaluator, warnings)? {
            continue;
        }
        selected.push(i);
        if ov.stop {
            break;
        }
    }
    Ok(selected)
}

fn push_tag_union(tags: &mut Vec<Tag>, tag: &Tag) {
    if !tags.contains(tag) {
        tags.push(tag.clone());
    }
}

/// Attribute mutations resolved for one item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    /// Replacement update interval.
    pub delay: Option<String>,
    /// Replacement history retention.
    pub history: Option<String>,
    /// Replacement trends retention.
    pub trends: Option<String>,
    /// Replacement creation status.
    pub status: Option<PrototypeStatus>,
    /// Replacement discover mode.
    pub discover: Option<DiscoverMode>,
    /// Tags to add.
    pub tags: Vec<Tag>,
}

impl ItemPatch {
    /// Folds the selected overrides for an item with the given resolved
    /// name. Scalars last-match-wins, tags union.
    ///
    /// # Errors
    ///
    /// Propagates [`ConfigError`] from name-pattern matching.
    pub fn resolve<'a>(
        selected: impl IntoIterator<Item = &'a Override>,
        name: &str,
        provider: &dyn NamedExpressionProvider,
    ) -> Result<Self, ConfigError> {
        let mut patch = Self::default();
        for ov in selected {
            for op in &ov.operations {
                if !op.applies_to(ObjectClass::Item, name, provider)? {
                    continue;
                }
                for action in &op.actions {
                    match action {
                        OverrideAction::Status { status } => patch.status = Some(*status),
                        OverrideAction::Discover { discover } => patch.discover = Some(*discover),
                        OverrideAction::Delay { delay } => patch.delay = Some(delay.clone()),
                        OverrideAction::History { history } => {
                            patch.history = Some(history.clone());
                        }
                        OverrideAction::Trends { trends } => patch.trends = Some(trends.clone()),
                        OverrideAction::Tag { tag } => push_tag_union(&mut patch.tags, tag),
                        _ => {}
                    }
                }
            }
        }
        Ok(patch)
    }
}

/// Attribute mutations resolved for one trigger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerPatch {
    /// Replacement creation status.
    pub status: Option<PrototypeStatus>,
    /// Replacement discover mode.
    pub discover: Option<DiscoverMode>,
    /// Replacement severity.
    pub severity: Option<u8>,
    /// Tags to add.
    pub tags: Vec<Tag>,
}

impl TriggerPatch {
    /// Folds the selected overrides for a trigger with the given resolved
    /// name.
    ///
    /// # Errors
    ///
    /// Propagates [`ConfigError`] from name-pattern matching.
    pub fn resolve<'a>(
        selected: impl IntoIterator<Item = &'a Override>,
        name: &str,
        provider: &dyn NamedExpressionProvider,
    ) -> Result<Self, ConfigError> {
        let mut patch = Self::default();
        for ov in selected {
            for op in &ov.operations {
                if !op.applies_to(ObjectClass::Trigger, name, provider)? {
                    continue;
                }
                for action in &op.actions {
                    match action {
                        OverrideAction::Status { status } => patch.status = Some(*status),
                        OverrideAction::Discover { discover } => patch.discover = Some(*discover),
                        OverrideAction::Severity { severity } => {
                            patch.severity = Some(*severity);
                        }
                        OverrideAction::Tag { tag } => push_tag_union(&mut patch.tags, tag),
                        _ => {}
                    }
                }
            }
        }
        Ok(patch)
    }
}

/// Attribute mutations resolved for one graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphPatch {
    /// Replacement discover mode.
    pub discover: Option<DiscoverMode>,
}

impl GraphPatch {
    /// Folds the selected overrides for a graph with the given resolved
    /// name.
    ///
    /// # Errors
    ///
    /// Propagates [`ConfigError`] from name-pattern matching.
    pub fn resolve<'a>(
        selected: impl IntoIterator<Item = &'a Override>,
        name: &str,
        provider: &dyn NamedExpressionProvider,
    ) -> Result<Self, ConfigError> {
        let mut patch = Self::default();
        for ov in selected {
            for op in &ov.operations {
                if !op.applies_to(ObjectClass::Graph, name, provider)? {
                    continue;
                }
                for action in &op.actions {
                    if let OverrideAction::Discover { discover } = action {
                        patch.discover = Some(*discover);
                    }
                }
            }
        }
        Ok(patch)
    }
}

/// Attribute mutations resolved for one host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostPatch {
    /// Replacement creation status.
    pub status: Option<PrototypeStatus>,
    /// Replacement discover mode.
    pub discover: Option<DiscoverMode>,
    /// Replacement inventory mode.
    pub inventory: Option<InventoryMode>,
    /// Templates to link.
    pub templates: Vec<TemplateId>,
}

impl HostPatch {
    /// Folds the selected overrides for a host with the given resolved
    /// name.
    ///
    /// # Errors
    ///
    /// Propagates [`ConfigError`] from name-pattern matching.
    pub fn resolve<'a>(
        selected: impl IntoIterator<Item = &'a Override>,
        name: &str,
        provider: &dyn NamedExpressionProvider,
    ) -> Result<Self, ConfigError> {
        let mut patch = Self::default();
        for ov in selected {
            for op in &ov.operations {
                if !op.applies_to(ObjectClass::Host, name, provider)? {
                    continue;
                }
                for action in &op.actions {
                    match action {
                        OverrideAction::Status { status } => patch.status = Some(*status),
                        OverrideAction::Discover { discover } => patch.discover = Some(*discover),
                        OverrideAction::Inventory { mode } => patch.inventory = Some(*mode),
                        OverrideAction::Template { template } => {
                            if !patch.templates.contains(template) {
                                patch.templates.push(*template);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::BasicEvaluator;
    use crate::filter::{ConditionOperator, FilterCondition, FilterLogic};
    use crate::regexp::InMemoryExpressions;

    fn entry(pairs: &[(&str, &str)]) -> Entry {
        Entry::from_pairs(pairs.iter().copied())
    }

    fn matching_filter(mac: &str, pattern: &str) -> Filter {
        Filter::new(
            FilterLogic::And,
            vec![FilterCondition::new("A", mac, pattern, ConditionOperator::Matches).unwrap()],
            None,
        )
        .unwrap()
    }

    fn select(
        overrides: &[Override],
        e: &Entry,
    ) -> Vec<usize> {
        let provider = InMemoryExpressions::new();
        let mut warnings = Vec::new();
        select_overrides(overrides, e, &provider, &BasicEvaluator::new(), &mut warnings).unwrap()
    }

    #[test]
    fn test_selection_honors_filters() {
        let overrides = vec![
            Override::new("ssd tweaks", 1).with_filter(matching_filter("{#TYPE}", "^ssd$")),
            Override::new("all disks", 2),
        ];

        assert_eq!(select(&overrides, &entry(&[("{#TYPE}", "ssd")])), vec![0, 1]);
        assert_eq!(select(&overrides, &entry(&[("{#TYPE}", "hdd")])), vec![1]);
    }

    #[test]
    fn test_stop_halts_later_steps_for_matching_rows_only() {
        let overrides = vec![
            Override::new("first", 1)
                .with_filter(matching_filter("{#TYPE}", "^ssd$"))
                .with_stop(true),
            Override::new("second", 2),
        ];

        // Matching row: walk stops after the first override.
        assert_eq!(select(&overrides, &entry(&[("{#TYPE}", "ssd")])), vec![0]);
        // Non-matching row: the stop flag of an unmatched override is inert.
        assert_eq!(select(&overrides, &entry(&[("{#TYPE}", "hdd")])), vec![1]);
    }

    #[test]
    fn test_item_patch_scalars_last_match_wins() {
        let provider = InMemoryExpressions::new();
        let overrides = vec![
            Override::new("slow down", 1).with_operation(
                OverrideOperation::new(ObjectClass::Item, PatternOperator::Contains, "space")
                    .with_action(OverrideAction::Delay {
                        delay: "5m".to_string(),
                    })
                    .with_action(OverrideAction::Tag {
                        tag: Tag::new("class", "fs"),
                    }),
            ),
            Override::new("slow down more", 2).with_operation(
                OverrideOperation::new(ObjectClass::Item, PatternOperator::Contains, "space")
                    .with_action(OverrideAction::Delay {
                        delay: "1h".to_string(),
                    })
                    .with_action(OverrideAction::Tag {
                        tag: Tag::new("tier", "cold"),
                    })
                    .with_action(OverrideAction::Tag {
                        tag: Tag::new("class", "fs"),
                    }),
            ),
        ];
        let selected: Vec<&Override> = overrides.iter().collect();

        let patch = ItemPatch::resolve(selected, "Free space on /var", &provider).unwrap();
        assert_eq!(patch.delay.as_deref(), Some("1h"));
        // Union, not accumulation: the duplicate tag appears once.
        assert_eq!(
            patch.tags,
            vec![Tag::new("class", "fs"), Tag::new("tier", "cold")]
        );
        assert_eq!(patch.status, None);
    }

    #[test]
    fn test_patch_ignores_other_classes_and_names() {
        let provider = InMemoryExpressions::new();
        let overrides = vec![Override::new("graphs only", 1).with_operation(
            OverrideOperation::new(ObjectClass::Graph, PatternOperator::Contains, "usage")
                .with_action(OverrideAction::Discover {
                    discover: DiscoverMode::NoDiscover,
                }),
        )];
        let selected: Vec<&Override> = overrides.iter().collect();

        let item = ItemPatch::resolve(selected.clone(), "Disk usage", &provider).unwrap();
        assert_eq!(item, ItemPatch::default());

        let graph = GraphPatch::resolve(selected.clone(), "Disk usage", &provider).unwrap();
        assert_eq!(graph.discover, Some(DiscoverMode::NoDiscover));

        let other = GraphPatch::resolve(selected, "Disk iops", &provider).unwrap();
        assert_eq!(other.discover, None);
    }

    #[test]
    fn test_trigger_patch_severity() {
        let provider = InMemoryExpressions::new();
        let overrides = vec![Override::new("escalate", 1).with_operation(
            OverrideOperation::new(ObjectClass::Trigger, PatternOperator::Matches, "^Low space")
                .with_action(OverrideAction::Severity { severity: 4 })
                .with_action(OverrideAction::Status {
                    status: PrototypeStatus::Disabled,
                }),
        )];
        let selected: Vec<&Override> = overrides.iter().collect();

        let patch = TriggerPatch::resolve(selected, "Low space on /", &provider).unwrap();
        assert_eq!(patch.severity, Some(4));
        assert_eq!(patch.status, Some(PrototypeStatus::Disabled));
    }

    #[test]
    fn test_host_patch_templates_union() {
        let provider = InMemoryExpressions::new();
        let overrides = vec![
            Override::new("base", 1).with_operation(
                OverrideOperation::new(ObjectClass::Host, PatternOperator::Contains, "")
                    .with_action(OverrideAction::Template {
                        template: TemplateId(10),
                    })
                    .with_action(OverrideAction::Inventory {
                        mode: InventoryMode::Automatic,
                    }),
            ),
            Override::new("extra", 2).with_operation(
                OverrideOperation::new(ObjectClass::Host, PatternOperator::Contains, "")
                    .with_action(OverrideAction::Template {
                        template: TemplateId(10),
                    })
                    .with_action(OverrideAction::Template {
                        template: TemplateId(11),
                    }),
            ),
        ];
        let selected: Vec<&Override> = overrides.iter().collect();

        let patch = HostPatch::resolve(selected, "vm-042", &provider).unwrap();
        assert_eq!(patch.templates, vec![TemplateId(10), TemplateId(11)]);
        assert_eq!(patch.inventory, Some(InventoryMode::Automatic));
    }

    #[test]
    fn test_pattern_operators() {
        let provider = InMemoryExpressions::new();
        let cases = [
            (PatternOperator::Equals, "eth0", "eth0", true),
            (PatternOperator::Equals, "eth0", "eth1", false),
            (PatternOperator::NotEquals, "eth0", "eth1", true),
            (PatternOperator::Contains, "Free space on /", "space", true),
            (PatternOperator::NotContains, "Free space", "inode", true),
            (PatternOperator::Matches, "eth12", "^eth[0-9]+$", true),
            (PatternOperator::NotMatches, "veth1", "^eth[0-9]+$", true),
        ];
        for (op, name, pattern, expected) in cases {
            assert_eq!(
                op.matches(name, pattern, &provider).unwrap(),
                expected,
                "{op:?} {name} {pattern}"
            );
        }
    }
}
