use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("inconsistent input: {0}")]
    InconsistentInput(String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DomainOfInfluenceId(pub Ulid);

impl DomainOfInfluenceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DomainOfInfluenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DomainOfInfluenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CountingCircleId(pub Ulid);

impl CountingCircleId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CountingCircleId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CountingCircleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListId(pub Ulid);

impl ListId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ListId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ListId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListUnionId(pub Ulid);

impl ListUnionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ListUnionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ListUnionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canton classification of an administrative unit. Opaque to the
/// projection algorithms; carried for reporting and ordering only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DomainOfInfluenceKind {
    Ch,
    Ct,
    Bz,
    Mu,
    Sc,
    Ki,
    An,
}

impl DomainOfInfluenceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ch => "ch",
            Self::Ct => "ct",
            Self::Bz => "bz",
            Self::Mu => "mu",
            Self::Sc => "sc",
            Self::Ki => "ki",
            Self::An => "an",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ch" => Some(Self::Ch),
            "ct" => Some(Self::Ct),
            "bz" => Some(Self::Bz),
            "mu" => Some(Self::Mu),
            "sc" => Some(Self::Sc),
            "ki" => Some(Self::Ki),
            "an" => Some(Self::An),
            _ => None,
        }
    }
}

/// One administrative unit in the hierarchy. The parent pointer is the
/// source of truth; every transitive view is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DomainOfInfluence {
    pub id: DomainOfInfluenceId,
    pub parent_id: Option<DomainOfInfluenceId>,
    pub tenant_id: String,
    pub name: String,
    pub short_name: String,
    pub kind: DomainOfInfluenceKind,
    pub sort_number: u32,
}

impl DomainOfInfluence {
    /// Validate one administrative unit against master-data invariants.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when required identity fields are blank
    /// or the node names itself as its own parent.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation(
                "domain of influence name MUST be provided".to_string(),
            ));
        }

        if self.tenant_id.trim().is_empty() {
            return Err(CoreError::Validation(
                "domain of influence tenant_id MUST be provided".to_string(),
            ));
        }

        if self.parent_id == Some(self.id) {
            return Err(CoreError::Validation(
                "domain of influence MUST NOT be its own parent".to_string(),
            ));
        }

        Ok(())
    }
}

/// The smallest unit at which votes are physically counted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CountingCircle {
    pub id: CountingCircleId,
    pub name: String,
    pub bfs_number: String,
    pub tenant_id: String,
}

impl CountingCircle {
    /// Validate one counting circle against master-data invariants.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the name or tenant is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation("counting circle name MUST be provided".to_string()));
        }

        if self.tenant_id.trim().is_empty() {
            return Err(CoreError::Validation(
                "counting circle tenant_id MUST be provided".to_string(),
            ));
        }

        Ok(())
    }
}

/// A materialized counting-circle-to-node link. `source_domain_of_influence_id`
/// records the node at which the assignment was directly made; retraction is
/// keyed on it so one ancestor's removal never deletes another ancestor's rows.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct CountingCircleAssignment {
    pub domain_of_influence_id: DomainOfInfluenceId,
    pub counting_circle_id: CountingCircleId,
    pub inherited: bool,
    pub source_domain_of_influence_id: DomainOfInfluenceId,
}

impl CountingCircleAssignment {
    #[must_use]
    pub fn direct(
        domain_of_influence_id: DomainOfInfluenceId,
        counting_circle_id: CountingCircleId,
    ) -> Self {
        Self {
            domain_of_influence_id,
            counting_circle_id,
            inherited: false,
            source_domain_of_influence_id: domain_of_influence_id,
        }
    }

    /// Identity triple: (target, circle, source). At most one row may exist per triple.
    #[must_use]
    pub fn key(&self) -> (DomainOfInfluenceId, CountingCircleId, DomainOfInfluenceId) {
        (self.domain_of_influence_id, self.counting_circle_id, self.source_domain_of_influence_id)
    }
}

/// A candidate list in a proportional election. Both `*_union_description`
/// fields are derived by the description builder and never user-edited.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct List {
    pub id: ListId,
    pub order_number: u32,
    pub short_description: String,
    pub list_union_description: String,
    pub sub_list_union_description: String,
}

impl List {
    /// Validate one list against master-data invariants.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the short description is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.short_description.trim().is_empty() {
            return Err(CoreError::Validation(
                "list short_description MUST be provided".to_string(),
            ));
        }

        Ok(())
    }
}

/// A grouping of lists for vote apportionment. A union with `root_id` set is a
/// sub-union nested one level below its root union.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ListUnion {
    pub id: ListUnionId,
    pub description: String,
    pub main_list_id: Option<ListId>,
    pub root_id: Option<ListUnionId>,
}

impl ListUnion {
    /// Validate one list union against master-data invariants.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the description is blank or the
    /// union names itself as its own root.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.description.trim().is_empty() {
            return Err(CoreError::Validation("list union description MUST be provided".to_string()));
        }

        if self.root_id == Some(self.id) {
            return Err(CoreError::Validation(
                "list union MUST NOT be its own root".to_string(),
            ));
        }

        Ok(())
    }
}

/// Membership of one list in one union, in persistent entry order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct ListUnionEntry {
    pub list_union_id: ListUnionId,
    pub list_id: ListId,
}

/// Validate a proposed member set for a union before its entries are replaced.
///
/// Sub-union members must be a subset of the root union's members; only one
/// nesting level is allowed, so a sub-union's members are checked against the
/// root members the caller resolved.
///
/// # Errors
/// Returns [`CoreError::InconsistentInput`] when a sub-union is validated
/// without its root member set, or when a proposed member is not available to
/// the root union.
pub fn validate_union_entries(
    union: &ListUnion,
    proposed_member_ids: &[ListId],
    root_member_ids: Option<&BTreeSet<ListId>>,
) -> Result<(), CoreError> {
    if union.root_id.is_none() {
        return Ok(());
    }

    let Some(root_members) = root_member_ids else {
        return Err(CoreError::InconsistentInput(format!(
            "sub union {} validated without its root union member set",
            union.id
        )));
    };

    for list_id in proposed_member_ids {
        if !root_members.contains(list_id) {
            return Err(CoreError::InconsistentInput(format!(
                "list {list_id} is not available to the root union of sub union {}",
                union.id
            )));
        }
    }

    Ok(())
}

/// In-memory forest over a flat node collection. Nodes are kept in an
/// id-keyed arena; parent and child links are ids resolved through lookups,
/// never embedded references.
#[derive(Debug, Clone)]
pub struct DomainOfInfluenceTree {
    nodes: BTreeMap<DomainOfInfluenceId, DomainOfInfluence>,
    children: BTreeMap<DomainOfInfluenceId, Vec<DomainOfInfluenceId>>,
    roots: Vec<DomainOfInfluenceId>,
    order: Vec<DomainOfInfluenceId>,
}

impl DomainOfInfluenceTree {
    #[must_use]
    pub fn get(&self, id: DomainOfInfluenceId) -> Option<&DomainOfInfluence> {
        self.nodes.get(&id)
    }

    /// The node's parent, or `None` for roots and nodes whose parent id is
    /// absent from the input collection.
    #[must_use]
    pub fn parent_of(&self, id: DomainOfInfluenceId) -> Option<&DomainOfInfluence> {
        let node = self.nodes.get(&id)?;
        let parent_id = node.parent_id?;
        self.nodes.get(&parent_id)
    }

    /// Direct children in input order.
    #[must_use]
    pub fn children_of(&self, id: DomainOfInfluenceId) -> &[DomainOfInfluenceId] {
        self.children.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Root ids in input order. A node whose parent id is not present in the
    /// input collection counts as a root, so partial (pre-filtered) views
    /// still build a usable forest.
    #[must_use]
    pub fn roots(&self) -> &[DomainOfInfluenceId] {
        &self.roots
    }

    /// All node ids in input order.
    #[must_use]
    pub fn ids(&self) -> &[DomainOfInfluenceId] {
        &self.order
    }

    /// Ancestor ids of a node, nearest-first. Self is excluded.
    #[must_use]
    pub fn ancestor_ids(&self, id: DomainOfInfluenceId) -> Vec<DomainOfInfluenceId> {
        let mut ancestors = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            ancestors.push(parent.id);
            current = parent.id;
        }
        ancestors
    }

    /// Descendant ids of a node at every depth, pre-order. Self is excluded.
    #[must_use]
    pub fn descendant_ids(&self, id: DomainOfInfluenceId) -> Vec<DomainOfInfluenceId> {
        let mut descendants = Vec::new();
        self.collect_descendants(id, &mut descendants);
        descendants
    }

    fn collect_descendants(
        &self,
        id: DomainOfInfluenceId,
        into: &mut Vec<DomainOfInfluenceId>,
    ) {
        for &child_id in self.children_of(id) {
            into.push(child_id);
            self.collect_descendants(child_id, into);
        }
    }
}

/// Link a flat node collection into a forest. Pure; no persistence.
#[must_use]
pub fn build_tree(nodes: &[DomainOfInfluence]) -> DomainOfInfluenceTree {
    let mut arena: BTreeMap<DomainOfInfluenceId, DomainOfInfluence> = BTreeMap::new();
    let mut order = Vec::with_capacity(nodes.len());
    for node in nodes {
        order.push(node.id);
        arena.insert(node.id, node.clone());
    }

    let mut children: BTreeMap<DomainOfInfluenceId, Vec<DomainOfInfluenceId>> = BTreeMap::new();
    let mut roots = Vec::new();
    for node in nodes {
        match node.parent_id {
            Some(parent_id) if arena.contains_key(&parent_id) && parent_id != node.id => {
                children.entry(parent_id).or_default().push(node.id);
            }
            _ => roots.push(node.id),
        }
    }

    DomainOfInfluenceTree { nodes: arena, children, roots, order }
}

/// One materialized closure record per node: all ancestors (nearest-first)
/// and all descendants (pre-order, every depth). Self is excluded from both.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HierarchyEntry {
    pub domain_of_influence_id: DomainOfInfluenceId,
    pub tenant_id: String,
    pub ancestor_ids: Vec<DomainOfInfluenceId>,
    pub descendant_ids: Vec<DomainOfInfluenceId>,
}

/// Build the hierarchy closure for the complete node collection. Partial
/// input produces a closure for the partial view only; callers rebuilding
/// persisted state must pass every node system-wide.
#[must_use]
pub fn build_hierarchy(nodes: &[DomainOfInfluence]) -> Vec<HierarchyEntry> {
    let tree = build_tree(nodes);
    tree.ids()
        .iter()
        .filter_map(|id| {
            let node = tree.get(*id)?;
            Some(HierarchyEntry {
                domain_of_influence_id: *id,
                tenant_id: node.tenant_id.clone(),
                ancestor_ids: tree.ancestor_ids(*id),
                descendant_ids: tree.descendant_ids(*id),
            })
        })
        .collect()
}

/// One materialized permission record per reachable (tenant, node) pair.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PermissionEntry {
    pub tenant_id: String,
    pub domain_of_influence_id: DomainOfInfluenceId,
    pub counting_circle_ids: BTreeSet<CountingCircleId>,
    pub is_parent: bool,
}

/// Build the tenant-to-counting-circle reachability view for the complete
/// tree and assignment snapshot. Total rebuild; deterministic for a fixed
/// input (BTree ordering throughout); idempotent.
///
/// For every node N owned by tenant T, the (T, N) entry carries the circles
/// assigned anywhere in N's subtree. Every strict ancestor of N additionally
/// yields a (T, ancestor) entry flagged `is_parent`, carrying the circles
/// reachable from T's nodes below it.
#[must_use]
pub fn build_permission_tree(
    nodes: &[DomainOfInfluence],
    assignments: &[CountingCircleAssignment],
) -> Vec<PermissionEntry> {
    let tree = build_tree(nodes);

    let mut circles_by_node: BTreeMap<DomainOfInfluenceId, BTreeSet<CountingCircleId>> =
        BTreeMap::new();
    for assignment in assignments {
        circles_by_node
            .entry(assignment.domain_of_influence_id)
            .or_default()
            .insert(assignment.counting_circle_id);
    }

    let subtree_circles = |id: DomainOfInfluenceId| -> BTreeSet<CountingCircleId> {
        let mut circles = circles_by_node.get(&id).cloned().unwrap_or_default();
        for descendant_id in tree.descendant_ids(id) {
            if let Some(more) = circles_by_node.get(&descendant_id) {
                circles.extend(more.iter().copied());
            }
        }
        circles
    };

    let mut entries: BTreeMap<(String, DomainOfInfluenceId), PermissionEntry> = BTreeMap::new();
    for id in tree.ids() {
        let Some(node) = tree.get(*id) else {
            continue;
        };

        let reachable = subtree_circles(*id);
        let owned = entries
            .entry((node.tenant_id.clone(), *id))
            .or_insert_with(|| PermissionEntry {
                tenant_id: node.tenant_id.clone(),
                domain_of_influence_id: *id,
                counting_circle_ids: BTreeSet::new(),
                is_parent: false,
            });
        owned.counting_circle_ids.extend(reachable.iter().copied());

        for ancestor_id in tree.ancestor_ids(*id) {
            let ancestor = entries
                .entry((node.tenant_id.clone(), ancestor_id))
                .or_insert_with(|| PermissionEntry {
                    tenant_id: node.tenant_id.clone(),
                    domain_of_influence_id: ancestor_id,
                    counting_circle_ids: BTreeSet::new(),
                    is_parent: true,
                });
            ancestor.is_parent = true;
            ancestor.counting_circle_ids.extend(reachable.iter().copied());
        }
    }

    entries.into_values().collect()
}

/// The row-level effect of one direct assignment change, computed by the
/// inheritance planner and applied verbatim by the store.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct InheritanceDiff {
    pub creates: Vec<CountingCircleAssignment>,
    pub deletes: Vec<CountingCircleAssignment>,
}

impl InheritanceDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }
}

/// Translate one direct assignment change at `origin` into the assignment
/// rows to create and delete across the orchestrator-supplied scope.
///
/// The add phase is a set difference against existing rows with
/// `source == origin`, so re-running identical inputs is a no-op. The remove
/// phase deletes only rows whose source is `origin`; rows the same circle
/// owes to a different ancestor survive. An empty scope yields an empty diff.
#[must_use]
pub fn plan_counting_circle_inheritance(
    origin: DomainOfInfluenceId,
    scope_ids: &[DomainOfInfluenceId],
    existing: &[CountingCircleAssignment],
    to_add: &[CountingCircleId],
    to_remove: &[CountingCircleId],
) -> InheritanceDiff {
    let scope: BTreeSet<DomainOfInfluenceId> = scope_ids.iter().copied().collect();
    let add_set: BTreeSet<CountingCircleId> = to_add.iter().copied().collect();
    let remove_set: BTreeSet<CountingCircleId> = to_remove.iter().copied().collect();

    let existing_from_origin: BTreeSet<(DomainOfInfluenceId, CountingCircleId)> = existing
        .iter()
        .filter(|row| row.source_domain_of_influence_id == origin)
        .map(|row| (row.domain_of_influence_id, row.counting_circle_id))
        .collect();

    let mut creates = Vec::new();
    for target_id in &scope {
        for circle_id in &add_set {
            if existing_from_origin.contains(&(*target_id, *circle_id)) {
                continue;
            }
            creates.push(CountingCircleAssignment {
                domain_of_influence_id: *target_id,
                counting_circle_id: *circle_id,
                inherited: *target_id != origin,
                source_domain_of_influence_id: origin,
            });
        }
    }

    let mut deletes: Vec<CountingCircleAssignment> = existing
        .iter()
        .filter(|row| {
            row.source_domain_of_influence_id == origin
                && scope.contains(&row.domain_of_influence_id)
                && remove_set.contains(&row.counting_circle_id)
        })
        .cloned()
        .collect();
    deletes.sort();
    deletes.dedup();

    InheritanceDiff { creates, deletes }
}

/// Every list sharing at least one union with the given list, including the
/// list itself. Used for transitive invalidation: when a list's own short
/// description changes, every co-member quotes it and must recompute.
#[must_use]
pub fn lists_sharing_union(list_id: ListId, entries: &[ListUnionEntry]) -> BTreeSet<ListId> {
    let unions: BTreeSet<ListUnionId> = entries
        .iter()
        .filter(|entry| entry.list_id == list_id)
        .map(|entry| entry.list_union_id)
        .collect();

    let mut lists = BTreeSet::new();
    lists.insert(list_id);
    for entry in entries {
        if unions.contains(&entry.list_union_id) {
            lists.insert(entry.list_id);
        }
    }
    lists
}

/// Format one derived union description for `target_list_id`: the short
/// descriptions of the other member lists, in entry order, comma-separated.
/// The same function serves the union and sub-union variants; the caller
/// passes whichever union's ordered member ids apply. A list with no
/// co-members formats to an empty string.
///
/// # Errors
/// Returns [`CoreError::InconsistentInput`] when a member list id has no
/// short description in the lookup; this is an invariant violation, not a
/// retryable condition.
pub fn build_list_union_description(
    target_list_id: ListId,
    ordered_member_ids: &[ListId],
    short_descriptions: &BTreeMap<ListId, String>,
) -> Result<String, CoreError> {
    let mut parts = Vec::new();
    for member_id in ordered_member_ids {
        if *member_id == target_list_id {
            continue;
        }
        let description = short_descriptions.get(member_id).ok_or_else(|| {
            CoreError::InconsistentInput(format!(
                "no short description loaded for union member list {member_id}"
            ))
        })?;
        parts.push(description.as_str());
    }

    Ok(parts.join(", "))
}

/// One domain event in arrival order. The orchestrator dispatches these with
/// a single exhaustive match and runs each inside one storage transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum MasterDataEvent {
    DomainOfInfluenceCreated {
        domain_of_influence: DomainOfInfluence,
    },
    DomainOfInfluenceUpdated {
        domain_of_influence: DomainOfInfluence,
    },
    DomainOfInfluenceMoved {
        id: DomainOfInfluenceId,
        new_parent_id: Option<DomainOfInfluenceId>,
    },
    DomainOfInfluenceDeleted {
        id: DomainOfInfluenceId,
    },
    CountingCircleCreated {
        counting_circle: CountingCircle,
    },
    CountingCircleUpdated {
        counting_circle: CountingCircle,
    },
    CountingCircleDeleted {
        id: CountingCircleId,
    },
    CountingCirclesReassigned {
        id: DomainOfInfluenceId,
        counting_circle_ids: Vec<CountingCircleId>,
        #[serde(with = "time::serde::rfc3339")]
        event_at: OffsetDateTime,
    },
    ListCreated {
        list: List,
    },
    ListUpdated {
        list: List,
    },
    ListDeleted {
        id: ListId,
    },
    ListUnionCreated {
        list_union: ListUnion,
    },
    ListUnionUpdated {
        list_union: ListUnion,
    },
    ListUnionDeleted {
        id: ListUnionId,
    },
    ListUnionEntriesReplaced {
        id: ListUnionId,
        list_ids: Vec<ListId>,
    },
    ListUnionMainListChanged {
        id: ListUnionId,
        main_list_id: Option<ListId>,
    },
}

impl MasterDataEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DomainOfInfluenceCreated { .. } => "domain_of_influence_created",
            Self::DomainOfInfluenceUpdated { .. } => "domain_of_influence_updated",
            Self::DomainOfInfluenceMoved { .. } => "domain_of_influence_moved",
            Self::DomainOfInfluenceDeleted { .. } => "domain_of_influence_deleted",
            Self::CountingCircleCreated { .. } => "counting_circle_created",
            Self::CountingCircleUpdated { .. } => "counting_circle_updated",
            Self::CountingCircleDeleted { .. } => "counting_circle_deleted",
            Self::CountingCirclesReassigned { .. } => "counting_circles_reassigned",
            Self::ListCreated { .. } => "list_created",
            Self::ListUpdated { .. } => "list_updated",
            Self::ListDeleted { .. } => "list_deleted",
            Self::ListUnionCreated { .. } => "list_union_created",
            Self::ListUnionUpdated { .. } => "list_union_updated",
            Self::ListUnionDeleted { .. } => "list_union_deleted",
            Self::ListUnionEntriesReplaced { .. } => "list_union_entries_replaced",
            Self::ListUnionMainListChanged { .. } => "list_union_main_list_changed",
        }
    }
}

/// The orchestrator-visible result of processing one event. Known
/// concurrent-delete races downgrade to `Skipped` instead of failing the
/// stream; everything else propagates as an error.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    Skipped { reason: String },
}

impl EventOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}
