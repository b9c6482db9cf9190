//! Module implement custom edge fields.
//!
//! Edge fields are named typed arcs between nodes, governed by
//! referential constraints. Every destination node keeps a reverse
//! index, `origins`, keyed by source node id, so refcounting and
//! teardown stay O(1) in the number of referring nodes and no owning
//! cycle is ever constructed.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    hierarchy::{Node, SelvaHierarchy},
    object::SelvaObject,
    subscriptions,
    svector::SVector,
    types::{NodeId, NodeType},
    Result,
};

/// Well-known constraint ids.
pub const CONSTRAINT_ID_DEFAULT: u32 = 0;
pub const CONSTRAINT_ID_SINGLE_REF: u32 = 1;
pub const CONSTRAINT_ID_DYNAMIC: u32 = 2;

/// Constraint behaviour flags.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct ConstraintFlags(pub u8);

impl ConstraintFlags {
    /// Single reference edge; adding an arc replaces the previous one.
    pub const SINGLE_REF: ConstraintFlags = ConstraintFlags(0x01);
    /// Deleting one side deletes the other side too.
    pub const BIDIRECTIONAL: ConstraintFlags = ConstraintFlags(0x02);
    /// Looked up from the dynamic table by node type and field name.
    pub const DYNAMIC: ConstraintFlags = ConstraintFlags(0x04);

    pub fn contains(&self, other: ConstraintFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ConstraintFlags {
    type Output = ConstraintFlags;

    fn bitor(self, rhs: ConstraintFlags) -> ConstraintFlags {
        ConstraintFlags(self.0 | rhs.0)
    }
}

/// An edge constraint. Constraints control how an edge field behaves on
/// arc insertion and deletion and on node deletion.
#[derive(Clone, Debug)]
pub struct EdgeConstraint {
    pub constraint_id: u32,
    pub flags: ConstraintFlags,
    /// Source node type, set for dynamic constraints.
    pub src_node_type: Option<NodeType>,
    /// Forward traversing field name; empty for the hard constraints,
    /// which apply to any field.
    pub fwd_field: String,
    /// Field of the backwards traversing edge, required by
    /// BIDIRECTIONAL.
    pub bck_field: Option<String>,
}

/// Parameters for registering a dynamic constraint.
pub struct DynConstraintParams {
    pub flags: ConstraintFlags,
    pub src_node_type: NodeType,
    pub fwd_field: String,
    pub bck_field: Option<String>,
}

/// The per-hierarchy constraint table. The two hard constraints always
/// exist; dynamic constraints are append-only and keyed by
/// `(source type, field name)`.
pub struct EdgeConstraints {
    dynamic: BTreeMap<(NodeType, String), EdgeConstraint>,
}

impl EdgeConstraints {
    pub fn new() -> EdgeConstraints {
        EdgeConstraints { dynamic: BTreeMap::new() }
    }

    /// Register a dynamic constraint. Re-registering the same key is an
    /// update, constraints are never removed.
    pub fn new_dyn_constraint(&mut self, params: DynConstraintParams) -> Result<()> {
        if params.flags.contains(ConstraintFlags::BIDIRECTIONAL) && params.bck_field.is_none() {
            return err_at!(InvalidInput, msg: "bidirectional constraint without bck_field");
        }
        let key = (params.src_node_type, params.fwd_field.clone());
        let constraint = EdgeConstraint {
            constraint_id: CONSTRAINT_ID_DYNAMIC,
            flags: params.flags | ConstraintFlags::DYNAMIC,
            src_node_type: Some(params.src_node_type),
            fwd_field: params.fwd_field,
            bck_field: params.bck_field,
        };
        self.dynamic.insert(key, constraint);
        Ok(())
    }

    /// Resolve a constraint id for a field on a node type.
    pub fn get(
        &self,
        constraint_id: u32,
        node_type: NodeType,
        field: &str,
    ) -> Result<EdgeConstraint> {
        match constraint_id {
            CONSTRAINT_ID_DEFAULT => Ok(EdgeConstraint {
                constraint_id,
                flags: ConstraintFlags::default(),
                src_node_type: None,
                fwd_field: String::new(),
                bck_field: None,
            }),
            CONSTRAINT_ID_SINGLE_REF => Ok(EdgeConstraint {
                constraint_id,
                flags: ConstraintFlags::SINGLE_REF,
                src_node_type: None,
                fwd_field: String::new(),
                bck_field: None,
            }),
            CONSTRAINT_ID_DYNAMIC => {
                match self.dynamic.get(&(node_type, field.to_string())) {
                    Some(constraint) => Ok(constraint.clone()),
                    None => {
                        err_at!(NotFound, msg: "dyn constraint ({}, {:?})", node_type, field)
                    }
                }
            }
            _ => err_at!(InvalidInput, msg: "constraint id {}", constraint_id),
        }
    }

    pub fn dyn_constraints(&self) -> impl Iterator<Item = &EdgeConstraint> {
        self.dynamic.values()
    }
}

impl Default for EdgeConstraints {
    fn default() -> EdgeConstraints {
        EdgeConstraints::new()
    }
}

/// An edge field: the arcs from one source node under one field name.
pub struct EdgeField {
    pub constraint_id: u32,
    pub flags: ConstraintFlags,
    pub bck_field: Option<String>,
    pub arcs: SVector<NodeId>,
    /// Per-destination metadata, keyed by destination node id.
    pub metadata: Option<SelvaObject>,
}

impl EdgeField {
    fn new(constraint: &EdgeConstraint) -> EdgeField {
        EdgeField {
            constraint_id: constraint.constraint_id,
            flags: constraint.flags,
            bck_field: constraint.bck_field.clone(),
            arcs: SVector::new(1, Some(|a: &NodeId, b: &NodeId| a.cmp(b))),
            metadata: None,
        }
    }

    pub fn len(&self) -> usize {
        self.arcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arcs.is_empty()
    }

    pub fn has(&self, dst: &NodeId) -> bool {
        self.arcs.contains(dst)
    }

    /// Dereference a single-ref edge field.
    pub fn deref_single_ref(&self) -> Result<NodeId> {
        if !self.flags.contains(ConstraintFlags::SINGLE_REF) {
            return err_at!(TypeMismatch, msg: "not a single-ref field");
        }
        match self.arcs.get(0) {
            Some(dst) => Ok(*dst),
            None => err_at!(NotFound, msg: "empty single-ref field"),
        }
    }

    /// Metadata object of one destination, created on demand.
    pub fn edge_metadata(&mut self, dst: &NodeId, create: bool) -> Result<&mut SelvaObject> {
        if self.metadata.is_none() {
            if !create {
                return err_at!(NotFound, msg: "no edge metadata");
            }
            self.metadata = Some(SelvaObject::new());
        }
        let metadata = self.metadata.as_mut().unwrap();
        let key = dst.to_string();
        if !metadata.exists(&key) {
            if !create {
                return err_at!(NotFound, msg: "no edge metadata for {}", dst);
            }
            metadata.set_object(&key, SelvaObject::new())?;
        }
        metadata.get_object_mut(&key)
    }

    /// Delete all per-destination metadata.
    pub fn delete_metadata(&mut self) {
        self.metadata = None;
    }
}

/// Per-node container for edge fields and their reverse index.
#[derive(Default)]
pub struct EdgeFieldContainer {
    /// Field name to edge field, `A.field -> B`.
    pub edges: BTreeMap<String, EdgeField>,
    /// Reverse index, `A.field <- B`: source node id to the field names
    /// in that source pointing at this node.
    pub origins: BTreeMap<NodeId, BTreeSet<String>>,
}

/// Get an edge field of a node.
pub fn edge_get<'a>(node: &'a Node, field: &str) -> Option<&'a EdgeField> {
    node.edges()?.edges.get(field)
}

/// Number of distinct source nodes with an edge into `id`; not the
/// number of edges.
pub fn edge_refcount(h: &SelvaHierarchy, id: &NodeId) -> usize {
    match h.node(id).and_then(|node| node.edges()) {
        Some(container) => container.origins.len(),
        None => 0,
    }
}

/// Edge feature usage of a node: bit 0 = has edge fields, bit 1 = other
/// nodes point at it.
pub fn edge_usage(node: &Node) -> u8 {
    match node.edges() {
        Some(container) => {
            let mut usage = 0;
            if !container.edges.is_empty() {
                usage |= 1;
            }
            if !container.origins.is_empty() {
                usage |= 2;
            }
            usage
        }
        None => 0,
    }
}

/// Add a new edge `src.field -> dst`. The field is created on demand
/// with the given constraint; on an existing field the constraint id
/// must match. Respects the single-ref and bidirectional constraint
/// flags.
pub fn edge_add(
    h: &mut SelvaHierarchy,
    constraint_id: u32,
    field: &str,
    src: &NodeId,
    dst: &NodeId,
) -> Result<()> {
    edge_add_inner(h, constraint_id, field, src, dst, true)
}

fn edge_add_inner(
    h: &mut SelvaHierarchy,
    constraint_id: u32,
    field: &str,
    src: &NodeId,
    dst: &NodeId,
    origin_side: bool,
) -> Result<()> {
    if h.node(src).is_none() {
        return err_at!(NotFound, msg: "src {}", src);
    } else if h.node(dst).is_none() {
        return err_at!(NotFound, msg: "dst {}", dst);
    }
    let src_type = src.node_type();
    let constraint = h.constraints.get(constraint_id, src_type, field)?;

    {
        let container = h.node_mut(src).unwrap().edges_mut();
        match container.edges.get(field) {
            Some(existing) if existing.constraint_id != constraint_id => {
                return err_at!(
                    InvalidInput,
                    msg: "constraint mismatch {} != {}", existing.constraint_id, constraint_id
                );
            }
            Some(_) => (),
            None => {
                container.edges.insert(field.to_string(), EdgeField::new(&constraint));
            }
        }
    }

    // single-ref fields hold at most one arc
    if constraint.flags.contains(ConstraintFlags::SINGLE_REF) {
        let old = {
            let container = h.node_mut(src).unwrap().edges_mut();
            let edge_field = container.edges.get_mut(field).unwrap();
            edge_field.arcs.to_vec()
        };
        for old_dst in old {
            if old_dst != *dst {
                edge_delete(h, src, field, &old_dst)?;
            }
        }
    }

    {
        let container = h.node_mut(src).unwrap().edges_mut();
        let edge_field = container.edges.get_mut(field).unwrap();
        if edge_field.has(dst) {
            return err_at!(Exists, msg: "{}.{} -> {}", src, field, dst);
        }
        edge_field.arcs.insert_fast(*dst)?;
    }
    {
        let container = h.node_mut(dst).unwrap().edges_mut();
        container.origins.entry(*src).or_insert_with(BTreeSet::new).insert(field.to_string());
    }

    // mirror arc of a bidirectional constraint
    if origin_side && constraint.flags.contains(ConstraintFlags::BIDIRECTIONAL) {
        let bck_field = constraint.bck_field.clone().unwrap_or_default();
        if !bck_field.is_empty() {
            let already = h
                .node(dst)
                .and_then(|node| edge_get(node, &bck_field))
                .map(|f| f.has(src))
                .unwrap_or(false);
            if !already {
                edge_add_inner(h, CONSTRAINT_ID_DYNAMIC, &bck_field, dst, src, false)?;
            }
        }
    }

    subscriptions::inherit_edge(h, src, dst, field);
    subscriptions::defer_field_change_events(h, src, field);
    Ok(())
}

/// Delete the edge `src.field -> dst`. Bidirectional constraints delete
/// the mirror arc too.
pub fn edge_delete(h: &mut SelvaHierarchy, src: &NodeId, field: &str, dst: &NodeId) -> Result<()> {
    edge_delete_inner(h, src, field, dst, true)
}

fn edge_delete_inner(
    h: &mut SelvaHierarchy,
    src: &NodeId,
    field: &str,
    dst: &NodeId,
    origin_side: bool,
) -> Result<()> {
    let (flags, bck_field) = {
        let node = match h.node(src) {
            Some(node) => node,
            None => return err_at!(NotFound, msg: "src {}", src),
        };
        let edge_field = match edge_get(node, field) {
            Some(edge_field) => edge_field,
            None => return err_at!(NotFound, msg: "field {:?} on {}", field, src),
        };
        if !edge_field.has(dst) {
            return err_at!(NotFound, msg: "{}.{} -> {}", src, field, dst);
        }
        (edge_field.flags, edge_field.bck_field.clone())
    };

    {
        let container = h.node_mut(src).unwrap().edges_mut();
        let edge_field = container.edges.get_mut(field).unwrap();
        edge_field.arcs.remove(dst);
        if let Some(metadata) = edge_field.metadata.as_mut() {
            metadata.del_key(&dst.to_string()).ok();
        }
    }
    if let Some(node) = h.node_mut(dst) {
        let container = node.edges_mut();
        if let Some(fields) = container.origins.get_mut(src) {
            fields.remove(field);
            if fields.is_empty() {
                container.origins.remove(src);
            }
        }
    }

    if origin_side && flags.contains(ConstraintFlags::BIDIRECTIONAL) {
        if let Some(bck_field) = bck_field {
            edge_delete_inner(h, dst, &bck_field, src, false).ok();
        }
    }

    subscriptions::defer_field_change_events(h, src, field);
    Ok(())
}

/// Remove all arcs of a field, returning the number removed.
pub fn edge_clear_field(h: &mut SelvaHierarchy, src: &NodeId, field: &str) -> Result<usize> {
    let arcs = match h.node(src).and_then(|node| edge_get(node, field)) {
        Some(edge_field) => edge_field.arcs.to_vec(),
        None => return err_at!(NotFound, msg: "field {:?} on {}", field, src),
    };
    let count = arcs.len();
    for dst in arcs {
        edge_delete(h, src, field, &dst)?;
    }
    Ok(count)
}

/// Remove a field and all of its arcs.
pub fn edge_delete_field(h: &mut SelvaHierarchy, src: &NodeId, field: &str) -> Result<()> {
    edge_clear_field(h, src, field)?;
    let container = h.node_mut(src).unwrap().edges_mut();
    container.edges.remove(field);
    Ok(())
}

// Remove every incoming and outgoing edge of a node ahead of its
// deletion.
pub(crate) fn purge_node_edges(h: &mut SelvaHierarchy, id: &NodeId) -> Result<()> {
    let fields: Vec<String> = match h.node(id).and_then(|node| node.edges()) {
        Some(container) => container.edges.keys().cloned().collect(),
        None => return Ok(()),
    };
    for field in fields {
        edge_delete_field(h, id, &field)?;
    }

    // incoming arcs recorded in the reverse index
    let origins: Vec<(NodeId, Vec<String>)> = match h.node(id).and_then(|node| node.edges()) {
        Some(container) => container
            .origins
            .iter()
            .map(|(src, fields)| (*src, fields.iter().cloned().collect()))
            .collect(),
        None => vec![],
    };
    for (src, fields) in origins {
        for field in fields {
            edge_delete(h, &src, &field, id).ok();
        }
    }
    if let Some(node) = h.node_mut(id) {
        node.take_edges();
    }
    Ok(())
}

#[cfg(test)]
#[path = "edge_test.rs"]
mod edge_test;
