//! Discovery rule configuration.
//!
//! A [`DiscoveryRule`] bundles everything one rule needs to turn a payload
//! into synchronized objects: the row filter, step-ordered overrides, macro
//! paths for entry normalization, the retention period for lost objects and
//! the item/graph prototypes. Rules deserialize through a shape that
//! restores the construction invariants, so a rule loaded from JSON behaves
//! exactly like one built programmatically.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::{is_discovery_macro, MacroPath};
use crate::error::ConfigError;
use crate::filter::Filter;
use crate::overrides::Override;
use crate::reconcile::graph::GraphPrototype;
use crate::reconcile::item::ItemPrototype;

/// Identifier of a discovery rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a monitored host.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_lifetime() -> String {
    "30d".to_string()
}

/// Serialized rule shape; [`DiscoveryRule`] construction restores
/// invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleConfig {
    id: RuleId,
    host: HostId,
    name: String,
    #[serde(default)]
    key: String,
    #[serde(default = "default_lifetime")]
    lifetime: String,
    #[serde(default = "Filter::pass_all")]
    filter: Filter,
    #[serde(default)]
    macro_paths: Vec<MacroPath>,
    #[serde(default)]
    overrides: Vec<Override>,
    #[serde(default)]
    item_prototypes: Vec<ItemPrototype>,
    #[serde(default)]
    graph_prototypes: Vec<GraphPrototype>,
}

/// One discovery rule.
///
/// The override list is kept sorted by step; [`DiscoveryRule::overrides`]
/// always returns them in evaluation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RuleConfig", into = "RuleConfig")]
pub struct DiscoveryRule {
    /// Rule id.
    pub id: RuleId,
    /// Host the rule belongs to.
    pub host: HostId,
    /// Rule name, used in diagnostics.
    pub name: String,
    /// Rule key.
    pub key: String,
    /// Retention period for lost objects, as configured
    /// (`"30d"`, `"2w"`, `"never"`, `"immediately"`, ...).
    pub lifetime: String,
    /// Row filter.
    pub filter: Filter,
    /// Macro paths for entry normalization.
    pub macro_paths: Vec<MacroPath>,
    /// Item prototypes.
    pub item_prototypes: Vec<ItemPrototype>,
    /// Graph prototypes.
    pub graph_prototypes: Vec<GraphPrototype>,
    overrides: Vec<Override>,
}

impl DiscoveryRule {
    /// Creates a rule with a pass-all filter, the default 30 day retention
    /// and no prototypes.
    #[must_use]
    pub fn new(id: RuleId, host: HostId, name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id,
            host,
            name: name.into(),
            key: key.into(),
            lifetime: default_lifetime(),
            filter: Filter::pass_all(),
            macro_paths: Vec::new(),
            item_prototypes: Vec::new(),
            graph_prototypes: Vec::new(),
            overrides: Vec::new(),
        }
    }

    /// Sets the lost-object retention period.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: impl Into<String>) -> Self {
        self.lifetime = lifetime.into();
        self
    }

    /// Sets the row filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Adds a macro path.
    #[must_use]
    pub fn with_macro_path(mut self, path: MacroPath) -> Self {
        self.macro_paths.push(path);
        self
    }

    /// Adds an override, keeping the list sorted by step. The sort is
    /// stable, so overrides sharing a step keep their insertion order.
    #[must_use]
    pub fn with_override(mut self, ov: Override) -> Self {
        self.overrides.push(ov);
        self.overrides.sort_by_key(|o| o.step);
        self
    }

    /// Adds an item prototype.
    #[must_use]
    pub fn with_item_prototype(mut self, prototype: ItemPrototype) -> Self {
        self.item_prototypes.push(prototype);
        self
    }

    /// Adds a graph prototype.
    #[must_use]
    pub fn with_graph_prototype(mut self, prototype: GraphPrototype) -> Self {
        self.graph_prototypes.push(prototype);
        self
    }

    /// Overrides in step order.
    #[must_use]
    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }
}

impl TryFrom<RuleConfig> for DiscoveryRule {
    type Error = ConfigError;

    fn try_from(config: RuleConfig) -> Result<Self, Self::Error> {
        // MacroPath deserializes structurally; the name syntax is checked
        // here so a malformed rule fails at load, not mid-pass.
        for mp in &config.macro_paths {
            if !is_discovery_macro(&mp.name) {
                return Err(ConfigError::InvalidMacroName {
                    name: mp.name.clone(),
                });
            }
        }

        let mut overrides = config.overrides;
        overrides.sort_by_key(|o| o.step);

        Ok(Self {
            id: config.id,
            host: config.host,
            name: config.name,
            key: config.key,
            lifetime: config.lifetime,
            filter: config.filter,
            macro_paths: config.macro_paths,
            item_prototypes: config.item_prototypes,
            graph_prototypes: config.graph_prototypes,
            overrides,
        })
    }
}

impl From<DiscoveryRule> for RuleConfig {
    fn from(rule: DiscoveryRule) -> Self {
        Self {
            id: rule.id,
            host: rule.host,
            name: rule.name,
            key: rule.key,
            lifetime: rule.lifetime,
            filter: rule.filter,
            macro_paths: rule.macro_paths,
            overrides: rule.overrides,
            item_prototypes: rule.item_prototypes,
            graph_prototypes: rule.graph_prototypes,
        }
    }
}
