//! Dependent-item tree validation.
//!
//! Items may derive their values from a master item, forming trees. Two
//! limits hold at all times: a chain may span at most [`MAX_LEVELS`]
//! levels, and a whole tree may hold at most [`MAX_TREE_SIZE`] items.
//!
//! The reconciler stages its master-link changes as [`LinkChange`] values
//! and validates the whole batch at once against a [`DependencyForest`]
//! built from the stored links plus the staged items. The forest is an
//! id-keyed arena; parents are stored as keys, never references, and every
//! upward walk is hop-limited so corrupt stored links cannot loop.
//!
//! Each node tracks `descendants[i]`, the count of descendants `i + 1`
//! levels below it. Link and unlink operations keep these counts current
//! for up to three ancestors, which makes depth and size checks O(chain)
//! instead of O(tree).

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::store::ItemId;

/// Maximum levels a dependency chain may span, the root included.
pub const MAX_LEVELS: usize = 3;

/// Maximum items in one dependency tree, the root included.
pub const MAX_TREE_SIZE: usize = 30000;

/// Reference to an item participating in validation: stored rows by id,
/// staged candidates by their batch index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemRef {
    /// An item already persisted.
    Saved(ItemId),
    /// A staged candidate, not yet persisted, identified by batch index.
    Staged(usize),
}

/// One staged master-link change.
///
/// The variants double as processing ranks: all unlinks run first, then
/// moves, then newly linked existing items, then brand-new items. Removals
/// preceding additions lets a node vacating a tree free capacity that
/// later changes in the same batch can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChange {
    /// Clear the node's master link.
    Unlink {
        /// Node losing its master.
        node: ItemRef,
    },
    /// Move the node under a different master.
    Move {
        /// Node being moved.
        node: ItemRef,
        /// New master.
        parent: ItemRef,
    },
    /// Attach a previously standalone existing node.
    Link {
        /// Node being attached.
        node: ItemRef,
        /// New master.
        parent: ItemRef,
    },
    /// Attach a staged new node.
    Fresh {
        /// Staged node.
        node: ItemRef,
        /// Its master.
        parent: ItemRef,
    },
}

impl LinkChange {
    const fn rank(self) -> u8 {
        match self {
            Self::Unlink { .. } => 0,
            Self::Move { .. } => 1,
            Self::Link { .. } => 2,
            Self::Fresh { .. } => 3,
        }
    }

    /// The node the change applies to.
    #[must_use]
    pub const fn node(self) -> ItemRef {
        match self {
            Self::Unlink { node }
            | Self::Move { node, .. }
            | Self::Link { node, .. }
            | Self::Fresh { node, .. } => node,
        }
    }

    const fn parent(self) -> Option<ItemRef> {
        match self {
            Self::Unlink { .. } => None,
            Self::Move { parent, .. } | Self::Link { parent, .. } | Self::Fresh { parent, .. } => {
                Some(parent)
            }
        }
    }
}

/// A limit violation found while validating a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeViolation {
    /// Linking would make the chain deeper than [`MAX_LEVELS`].
    DepthExceeded {
        /// Node that was excluded.
        node: ItemRef,
        /// Intended master.
        parent: ItemRef,
        /// Level the deepest descendant would have reached.
        level: usize,
    },
    /// Linking would make the tree larger than [`MAX_TREE_SIZE`].
    SizeExceeded {
        /// Node that was excluded.
        node: ItemRef,
        /// Intended master.
        parent: ItemRef,
        /// Combined size that was rejected.
        size: usize,
    },
    /// A node naming itself as master.
    SelfReference {
        /// The offending node.
        node: ItemRef,
    },
    /// The intended master is absent from the forest or its own link never
    /// resolved (staged cycle or corrupt stored chain).
    UnresolvedParent {
        /// Node that was excluded.
        node: ItemRef,
        /// The unresolvable master.
        parent: ItemRef,
    },
    /// The intended master was itself excluded earlier in the batch.
    ParentExcluded {
        /// Node that was excluded.
        node: ItemRef,
        /// The excluded master.
        parent: ItemRef,
    },
}

impl TreeViolation {
    /// The node the violation excluded.
    #[must_use]
    pub const fn node(&self) -> ItemRef {
        match self {
            Self::DepthExceeded { node, .. }
            | Self::SizeExceeded { node, .. }
            | Self::SelfReference { node }
            | Self::UnresolvedParent { node, .. }
            | Self::ParentExcluded { node, .. } => *node,
        }
    }
}

/// Outcome of validating one batch of link changes.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Nodes excluded from this cycle: every violating node plus all of its
    /// dependent descendants.
    pub excluded: BTreeSet<ItemRef>,
    /// The violations, in processing order.
    pub violations: Vec<TreeViolation>,
}

#[derive(Debug, Default)]
struct ItemNode {
    parent: Option<ItemRef>,
    /// `descendants[i]` counts descendants `i + 1` levels below.
    descendants: [u32; 3],
}

/// Forest of master-item links with per-node descendant counts.
#[derive(Debug, Default)]
pub struct DependencyForest {
    nodes: HashMap<ItemRef, ItemNode>,
    children: HashMap<ItemRef, Vec<ItemRef>>,
}

impl DependencyForest {
    /// Creates an empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a forest from stored `(item, master)` links.
    ///
    /// The stored state is taken as-is, without limit checks; descendant
    /// counts are derived bottom-up afterwards. Links deeper than the
    /// tracked three levels simply stop contributing to ancestor counts.
    #[must_use]
    pub fn from_links(links: &[(ItemId, Option<ItemId>)]) -> Self {
        let mut forest = Self::new();
        for &(item, master) in links {
            let node = ItemRef::Saved(item);
            forest.nodes.entry(node).or_default();
            if let Some(master) = master {
                let parent = ItemRef::Saved(master);
                forest.nodes.entry(parent).or_default();
                if let Some(n) = forest.nodes.get_mut(&node) {
                    n.parent = Some(parent);
                }
                forest.children.entry(parent).or_default().push(node);
            }
        }
        forest.recount();
        forest
    }

    /// Adds a staged node with no parent yet.
    pub fn insert_staged(&mut self, node: ItemRef) {
        self.nodes.entry(node).or_default();
    }

    /// The node's current parent.
    #[must_use]
    pub fn parent(&self, node: ItemRef) -> Option<ItemRef> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }

    /// True when the node participates in the forest.
    #[must_use]
    pub fn contains(&self, node: ItemRef) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Recomputes every node's descendant counts bottom-up.
    fn recount(&mut self) {
        let roots: Vec<ItemRef> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(r, _)| *r)
            .collect();
        for root in roots {
            self.recount_subtree(root, &mut BTreeSet::new());
        }
    }

    /// Post-order recount of one subtree. Returns the subtree's own
    /// `descendants` row. `seen` breaks corrupt parent cycles.
    fn recount_subtree(&mut self, node: ItemRef, seen: &mut BTreeSet<ItemRef>) -> [u32; 3] {
        if !seen.insert(node) {
            return [0; 3];
        }
        let children = self.children.get(&node).cloned().unwrap_or_default();
        let mut counts = [0u32; 3];
        for child in children {
            let below = self.recount_subtree(child, seen);
            counts[0] += 1;
            counts[1] += below[0];
            counts[2] += below[1];
        }
        if let Some(n) = self.nodes.get_mut(&node) {
            n.descendants = counts;
        }
        counts
    }

    /// 1-based distance from the node to its root. `None` when the parent
    /// chain does not terminate.
    fn level(&self, node: ItemRef) -> Option<usize> {
        let limit = self.nodes.len() + 1;
        let mut level = 1;
        let mut current = node;
        for _ in 0..limit {
            match self.nodes.get(&current).and_then(|n| n.parent) {
                Some(parent) => {
                    level += 1;
                    current = parent;
                }
                None => return Some(level),
            }
        }
        None
    }

    /// Levels spanned by the node and its descendants; a leaf spans 1.
    fn depth(&self, node: ItemRef) -> usize {
        let Some(n) = self.nodes.get(&node) else {
            return 1;
        };
        let deepest = n
            .descendants
            .iter()
            .rposition(|&count| count > 0)
            .map_or(0, |i| i + 1);
        deepest + 1
    }

    /// Size of the whole tree containing the node. `None` when the parent
    /// chain does not terminate.
    fn tree_size(&self, node: ItemRef) -> Option<usize> {
        let limit = self.nodes.len() + 1;
        let mut current = node;
        for _ in 0..limit {
            let n = self.nodes.get(&current)?;
            match n.parent {
                Some(parent) => current = parent,
                None => {
                    let below: u32 = n.descendants.iter().sum();
                    return Some(1 + below as usize);
                }
            }
        }
        None
    }

    /// Applies a delta row to up to `levels` ancestors starting at `from`.
    /// Each ancestor absorbs the delta one level deeper than the previous
    /// one received it.
    fn update_parent_stats(&mut self, from: Option<ItemRef>, mut delta: [i64; 3], levels: usize) {
        let mut current = from;
        for _ in 0..levels {
            let Some(r) = current else { break };
            let Some(node) = self.nodes.get_mut(&r) else {
                break;
            };
            for (slot, d) in node.descendants.iter_mut().zip(delta) {
                let updated = i64::from(*slot) + d;
                *slot = u32::try_from(updated.max(0)).unwrap_or(u32::MAX);
            }
            current = node.parent;
            delta = [0, delta[0], delta[1]];
        }
    }

    /// Links `node` under `parent`, propagating stats. The caller has
    /// already verified both limits.
    fn add_parent(&mut self, node: ItemRef, parent: ItemRef) {
        let below = self.nodes.get(&node).map_or([0; 3], |n| n.descendants);
        let delta = [1, i64::from(below[0]), i64::from(below[1])];
        self.update_parent_stats(Some(parent), delta, MAX_LEVELS);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.parent = Some(parent);
        }
        self.children.entry(parent).or_default().push(node);
    }

    /// Unlinks `node` from its current parent, reversing the stats the
    /// link contributed.
    fn remove_parent(&mut self, node: ItemRef) {
        let Some(parent) = self.nodes.get(&node).and_then(|n| n.parent) else {
            return;
        };
        let below = self.nodes.get(&node).map_or([0; 3], |n| n.descendants);
        let delta = [-1, -i64::from(below[0]), -i64::from(below[1])];
        self.update_parent_stats(Some(parent), delta, MAX_LEVELS);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.parent = None;
        }
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|&c| c != node);
        }
    }

    /// Collects `node` and all of its current descendants into `excluded`.
    fn exclude_subtree(&self, node: ItemRef, excluded: &mut BTreeSet<ItemRef>) {
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if !excluded.insert(current) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().copied());
            }
        }
    }

    /// Validates and applies a batch of link changes.
    ///
    /// Changes are processed by rank (unlink, move, link, fresh). A change
    /// whose intended master is a staged node that has not been placed yet
    /// is deferred until the master's own change applies; changes left
    /// unresolvable after that are excluded. A failed check excludes the
    /// node and its whole dependent subtree from the cycle but leaves the
    /// forest's links for it untouched.
    #[must_use]
    pub fn validate(&mut self, mut changes: Vec<LinkChange>) -> ValidationReport {
        changes.sort_by_key(|c| c.rank());

        let mut report = ValidationReport::default();
        // Staged nodes whose own placement is still pending; links under
        // them must wait so level checks see the final position.
        let mut pending: BTreeSet<ItemRef> = changes
            .iter()
            .filter(|c| matches!(c, LinkChange::Fresh { .. }))
            .map(|c| c.node())
            .collect();

        for change in &changes {
            self.nodes.entry(change.node()).or_default();
        }

        let mut queue: VecDeque<LinkChange> = changes.into();
        loop {
            let mut progressed = false;
            let mut deferred = VecDeque::new();

            while let Some(change) = queue.pop_front() {
                let node = change.node();

                if let LinkChange::Unlink { .. } = change {
                    self.remove_parent(node);
                    progressed = true;
                    continue;
                }

                let Some(parent) = change.parent() else {
                    continue;
                };

                if report.excluded.contains(&node) {
                    pending.remove(&node);
                    progressed = true;
                    continue;
                }
                if node == parent {
                    report.violations.push(TreeViolation::SelfReference { node });
                    self.exclude_subtree(node, &mut report.excluded);
                    pending.remove(&node);
                    progressed = true;
                    continue;
                }
                if report.excluded.contains(&parent) {
                    report
                        .violations
                        .push(TreeViolation::ParentExcluded { node, parent });
                    self.exclude_subtree(node, &mut report.excluded);
                    pending.remove(&node);
                    progressed = true;
                    continue;
                }
                if !self.contains(parent) || pending.contains(&parent) {
                    deferred.push_back(change);
                    continue;
                }

                self.apply_link(change, node, parent, &mut report);
                pending.remove(&node);
                progressed = true;
            }

            if deferred.is_empty() {
                break;
            }
            if !progressed {
                // Remaining changes chase masters that will never resolve.
                for change in deferred {
                    let node = change.node();
                    if let Some(parent) = change.parent() {
                        report
                            .violations
                            .push(TreeViolation::UnresolvedParent { node, parent });
                    }
                    self.exclude_subtree(node, &mut report.excluded);
                }
                break;
            }
            queue = deferred;
        }

        report
    }

    /// Runs both limit checks for one link and applies it when they pass.
    fn apply_link(
        &mut self,
        change: LinkChange,
        node: ItemRef,
        parent: ItemRef,
        report: &mut ValidationReport,
    ) {
        let Some(parent_level) = self.level(parent) else {
            report
                .violations
                .push(TreeViolation::UnresolvedParent { node, parent });
            self.exclude_subtree(node, &mut report.excluded);
            return;
        };

        let reach = parent_level + self.depth(node);
        if reach > MAX_LEVELS {
            report.violations.push(TreeViolation::DepthExceeded {
                node,
                parent,
                level: reach,
            });
            self.exclude_subtree(node, &mut report.excluded);
            return;
        }

        let (Some(node_size), Some(parent_size)) =
            (self.tree_size(node), self.tree_size(parent))
        else {
            report
                .violations
                .push(TreeViolation::UnresolvedParent { node, parent });
            self.exclude_subtree(node, &mut report.excluded);
            return;
        };
        let combined = node_size + parent_size;
        if combined > MAX_TREE_SIZE {
            report.violations.push(TreeViolation::SizeExceeded {
                node,
                parent,
                size: combined,
            });
            self.exclude_subtree(node, &mut report.excluded);
            return;
        }

        if matches!(change, LinkChange::Move { .. }) {
            self.remove_parent(node);
        }
        self.add_parent(node, parent);
    }
}
