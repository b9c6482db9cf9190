//! Traversal kernel of the hierarchy.
//!
//! A traversal visits each reachable node at most once per call. The
//! visited set is a per-node epoch compared against a per-hierarchy
//! transaction counter, so no allocation happens per call.

use std::collections::VecDeque;

use crate::{
    edge,
    hierarchy::SelvaHierarchy,
    object::{ObjArray, ValueView},
    rpn::{self, RpnCtx, RpnExpression},
    set::{SelvaSet, SetValue},
    types::{NodeId, ANCESTORS_FIELD, CHILDREN_FIELD, DESCENDANTS_FIELD, PARENTS_FIELD},
    Result,
};

/// Hierarchy traversal order. The bit values are stable, they appear in
/// index control block names and marker serialization.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraversalDir {
    None,
    /// Visit just the given node.
    Node,
    /// Traverse an array field.
    Array,
    /// Traverse a set field.
    Set,
    /// Visit nodes pointed by a string ref field.
    Ref,
    /// Visit nodes pointed by an edge field.
    EdgeField,
    Children,
    Parents,
    BfsAncestors,
    BfsDescendants,
    DfsAncestors,
    DfsDescendants,
    /// Full DFS of the whole hierarchy, starting from the heads.
    DfsFull,
    /// BFS over an edge field, following the same field on every level.
    BfsEdgeField,
    /// BFS with an expression returning a set of field names.
    BfsExpression,
    /// Single step of BfsExpression.
    Expression,
}

impl TraversalDir {
    pub fn bits(&self) -> u16 {
        match self {
            TraversalDir::None => 0x0000,
            TraversalDir::Node => 0x0001,
            TraversalDir::Array => 0x0002,
            TraversalDir::Set => 0x0004,
            TraversalDir::Ref => 0x0008,
            TraversalDir::EdgeField => 0x0010,
            TraversalDir::Children => 0x0020,
            TraversalDir::Parents => 0x0040,
            TraversalDir::BfsAncestors => 0x0080,
            TraversalDir::BfsDescendants => 0x0100,
            TraversalDir::DfsAncestors => 0x0200,
            TraversalDir::DfsDescendants => 0x0400,
            TraversalDir::DfsFull => 0x0800,
            TraversalDir::BfsEdgeField => 0x1000,
            TraversalDir::BfsExpression => 0x2000,
            TraversalDir::Expression => 0x4000,
        }
    }

    pub fn from_bits(bits: u16) -> Result<TraversalDir> {
        let dir = match bits {
            0x0000 => TraversalDir::None,
            0x0001 => TraversalDir::Node,
            0x0002 => TraversalDir::Array,
            0x0004 => TraversalDir::Set,
            0x0008 => TraversalDir::Ref,
            0x0010 => TraversalDir::EdgeField,
            0x0020 => TraversalDir::Children,
            0x0040 => TraversalDir::Parents,
            0x0080 => TraversalDir::BfsAncestors,
            0x0100 => TraversalDir::BfsDescendants,
            0x0200 => TraversalDir::DfsAncestors,
            0x0400 => TraversalDir::DfsDescendants,
            0x0800 => TraversalDir::DfsFull,
            0x1000 => TraversalDir::BfsEdgeField,
            0x2000 => TraversalDir::BfsExpression,
            0x4000 => TraversalDir::Expression,
            _ => return err_at!(InvalidInput, msg: "traversal bits {:#06x}", bits),
        };
        Ok(dir)
    }

    pub fn from_token(token: &str) -> Result<TraversalDir> {
        let dir = match token {
            "none" => TraversalDir::None,
            "node" => TraversalDir::Node,
            "array" => TraversalDir::Array,
            "set" => TraversalDir::Set,
            "ref" => TraversalDir::Ref,
            "edge_field" => TraversalDir::EdgeField,
            "children" => TraversalDir::Children,
            "parents" => TraversalDir::Parents,
            "bfs_ancestors" | "ancestors" => TraversalDir::BfsAncestors,
            "bfs_descendants" | "descendants" => TraversalDir::BfsDescendants,
            "dfs_ancestors" => TraversalDir::DfsAncestors,
            "dfs_descendants" => TraversalDir::DfsDescendants,
            "dfs_full" => TraversalDir::DfsFull,
            "bfs_edge_field" => TraversalDir::BfsEdgeField,
            "bfs_expression" => TraversalDir::BfsExpression,
            "expression" => TraversalDir::Expression,
            _ => return err_at!(InvalidInput, msg: "traversal direction {:?}", token),
        };
        Ok(dir)
    }

    pub fn to_token(&self) -> &'static str {
        match self {
            TraversalDir::None => "none",
            TraversalDir::Node => "node",
            TraversalDir::Array => "array",
            TraversalDir::Set => "set",
            TraversalDir::Ref => "ref",
            TraversalDir::EdgeField => "edge_field",
            TraversalDir::Children => "children",
            TraversalDir::Parents => "parents",
            TraversalDir::BfsAncestors => "bfs_ancestors",
            TraversalDir::BfsDescendants => "bfs_descendants",
            TraversalDir::DfsAncestors => "dfs_ancestors",
            TraversalDir::DfsDescendants => "dfs_descendants",
            TraversalDir::DfsFull => "dfs_full",
            TraversalDir::BfsEdgeField => "bfs_edge_field",
            TraversalDir::BfsExpression => "bfs_expression",
            TraversalDir::Expression => "expression",
        }
    }

    /// The traversal needs a field name argument.
    pub fn needs_field(&self) -> bool {
        matches!(
            self,
            TraversalDir::Array
                | TraversalDir::Set
                | TraversalDir::Ref
                | TraversalDir::EdgeField
                | TraversalDir::BfsEdgeField
        )
    }

    /// The traversal needs a compiled expression argument.
    pub fn needs_expression(&self) -> bool {
        matches!(self, TraversalDir::BfsExpression | TraversalDir::Expression)
    }

    /// Hierarchy traversals whose result by convention excludes the
    /// starting node itself.
    pub fn skips_self(&self) -> bool {
        matches!(
            self,
            TraversalDir::BfsAncestors
                | TraversalDir::BfsDescendants
                | TraversalDir::DfsAncestors
                | TraversalDir::DfsDescendants
        )
    }

    /// Traversal kinds where the starting node is reported through
    /// head_cb instead of node_cb.
    fn head_only_start(&self) -> bool {
        matches!(
            self,
            TraversalDir::Ref
                | TraversalDir::EdgeField
                | TraversalDir::Children
                | TraversalDir::Parents
                | TraversalDir::BfsEdgeField
                | TraversalDir::Expression
        )
    }
}

/// Traversal metadata passed to the child callback for every adjacency
/// taken.
pub struct TraversalMeta<'a> {
    pub origin: NodeId,
    pub origin_field: &'a str,
}

/// Callback descriptor for traversals.
///
/// `head_cb` runs exactly once for the starting node in traversal kinds
/// that would otherwise skip it. A `node_cb` returning true
/// short-circuits the traversal. `child_cb` runs for every adjacency
/// taken.
#[derive(Default)]
pub struct TraversalCallback<'a> {
    pub head_cb: Option<&'a mut dyn FnMut(&mut SelvaHierarchy, &NodeId) -> Result<()>>,
    pub node_cb: Option<&'a mut dyn FnMut(&mut SelvaHierarchy, &NodeId) -> Result<bool>>,
    pub child_cb:
        Option<&'a mut dyn FnMut(&mut SelvaHierarchy, &TraversalMeta, &NodeId) -> Result<()>>,
}

impl<'a> TraversalCallback<'a> {
    fn call_head(&mut self, h: &mut SelvaHierarchy, id: &NodeId) -> Result<()> {
        match self.head_cb.as_mut() {
            Some(cb) => cb(h, id),
            None => Ok(()),
        }
    }

    fn call_node(&mut self, h: &mut SelvaHierarchy, id: &NodeId) -> Result<bool> {
        match self.node_cb.as_mut() {
            Some(cb) => cb(h, id),
            None => Ok(false),
        }
    }

    fn call_child(
        &mut self,
        h: &mut SelvaHierarchy,
        meta: &TraversalMeta,
        id: &NodeId,
    ) -> Result<()> {
        match self.child_cb.as_mut() {
            Some(cb) => cb(h, meta, id),
            None => Ok(()),
        }
    }
}

// Adjacency selector for the generic BFS/DFS drivers.
#[derive(Clone, Copy)]
enum Adj<'a> {
    Parents,
    Children,
    EdgeField(&'a str),
    Expr(&'a RpnExpression, Option<&'a RpnExpression>),
}

// Resolve the adjacency of `id` as (origin_field, target) pairs, in
// SVector order.
fn adjacency(h: &SelvaHierarchy, id: &NodeId, adj: Adj) -> Result<Vec<(String, NodeId)>> {
    let node = match h.node(id) {
        Some(node) => node,
        None => return Ok(vec![]),
    };
    let out = match adj {
        Adj::Parents => {
            node.parents().iter().map(|p| (PARENTS_FIELD.to_string(), *p)).collect()
        }
        Adj::Children => {
            node.children().iter().map(|c| (CHILDREN_FIELD.to_string(), *c)).collect()
        }
        Adj::EdgeField(field) => match edge::edge_get(node, field) {
            Some(edge_field) => {
                edge_field.arcs.iter().map(|dst| (field.to_string(), *dst)).collect()
            }
            None => vec![],
        },
        Adj::Expr(expr, edge_filter) => {
            let mut ctx = RpnCtx::new(1);
            let fields = match rpn::rpn_selvaset(h, &mut ctx, expr, Some(id)) {
                Ok(fields) => fields,
                // expression errors degrade to an empty adjacency
                Err(_) => return Ok(vec![]),
            };
            let mut out = vec![];
            for field in fields {
                let field = String::from_utf8_lossy(&field).to_string();
                for (_, target) in field_targets(h, id, &field)? {
                    let take = match edge_filter {
                        Some(filter) => {
                            let mut fctx = RpnCtx::new(1);
                            rpn::rpn_bool(h, &mut fctx, filter, Some(&target)).unwrap_or(false)
                        }
                        None => true,
                    };
                    if take {
                        out.push((field.clone(), target));
                    }
                }
            }
            out
        }
    };
    Ok(out)
}

// Targets of a named field: hierarchy fields or an edge field.
fn field_targets(h: &SelvaHierarchy, id: &NodeId, field: &str) -> Result<Vec<(String, NodeId)>> {
    match field {
        PARENTS_FIELD => adjacency(h, id, Adj::Parents),
        CHILDREN_FIELD => adjacency(h, id, Adj::Children),
        _ => adjacency(h, id, Adj::EdgeField(field)),
    }
}

// Node ids referenced by a string ref field: a node id set, a string
// set/array of ids, or a single string.
fn ref_field_targets(h: &SelvaHierarchy, id: &NodeId, field: &str) -> Vec<NodeId> {
    let node = match h.node(id) {
        Some(node) => node,
        None => return vec![],
    };
    match node.obj().get_any(field) {
        Ok(ValueView::Set(SelvaSet::NodeId(ids))) => ids.iter().cloned().collect(),
        Ok(ValueView::Set(SelvaSet::Str(strs))) => {
            strs.iter().map(|s| NodeId::new(s.as_bytes())).collect()
        }
        Ok(ValueView::Array(ObjArray::Str(strs))) => {
            strs.iter().map(|s| NodeId::new(s.as_bytes())).collect()
        }
        Ok(ValueView::Str(s)) => vec![NodeId::new(s.as_bytes())],
        _ => vec![],
    }
}

fn bfs(
    h: &mut SelvaHierarchy,
    start: &NodeId,
    adj: Adj,
    cb: &mut TraversalCallback,
) -> Result<()> {
    let trx = h.next_trx();
    match h.node(start) {
        Some(node) => node.mark_visited(trx),
        None => return err_at!(NotFound, msg: "node {}", start),
    }
    let mut queue = VecDeque::new();
    queue.push_back(*start);
    while let Some(cur) = queue.pop_front() {
        if cb.call_node(h, &cur)? {
            return Ok(());
        }
        for (field, target) in adjacency(h, &cur, adj)? {
            let meta = TraversalMeta { origin: cur, origin_field: &field };
            cb.call_child(h, &meta, &target)?;
            if let Some(node) = h.node(&target) {
                if !node.visited(trx) {
                    node.mark_visited(trx);
                    queue.push_back(target);
                }
            }
        }
    }
    Ok(())
}

fn dfs_with_trx(
    h: &mut SelvaHierarchy,
    start: &NodeId,
    adj: Adj,
    cb: &mut TraversalCallback,
    trx: u64,
) -> Result<bool> {
    if h.node(start).is_none() {
        return err_at!(NotFound, msg: "node {}", start);
    }
    let mut stack = vec![*start];
    while let Some(cur) = stack.pop() {
        match h.node(&cur) {
            Some(node) if !node.visited(trx) => node.mark_visited(trx),
            _ => continue,
        }
        if cb.call_node(h, &cur)? {
            return Ok(true);
        }
        let targets = adjacency(h, &cur, adj)?;
        // push in reverse so the first adjacency is visited first
        for (field, target) in targets.into_iter().rev() {
            let meta = TraversalMeta { origin: cur, origin_field: &field };
            cb.call_child(h, &meta, &target)?;
            stack.push(target);
        }
    }
    Ok(false)
}

fn dfs(h: &mut SelvaHierarchy, start: &NodeId, adj: Adj, cb: &mut TraversalCallback) -> Result<()> {
    let trx = h.next_trx();
    dfs_with_trx(h, start, adj, cb, trx).map(|_| ())
}

/// Run a traversal from `start` in direction `dir`, invoking the
/// callback descriptor.
pub fn traverse(
    h: &mut SelvaHierarchy,
    start: &NodeId,
    dir: TraversalDir,
    field: Option<&str>,
    expr: Option<&RpnExpression>,
    edge_filter: Option<&RpnExpression>,
    cb: &mut TraversalCallback,
) -> Result<()> {
    if dir.needs_field() && field.is_none() {
        return err_at!(InvalidInput, msg: "{} needs a field", dir.to_token());
    } else if dir.needs_expression() && expr.is_none() {
        return err_at!(InvalidInput, msg: "{} needs an expression", dir.to_token());
    }
    if dir != TraversalDir::DfsFull && h.node(start).is_none() {
        return err_at!(NotFound, msg: "node {}", start);
    }
    if dir.head_only_start() {
        cb.call_head(h, start)?;
    }

    match dir {
        TraversalDir::None => Ok(()),
        TraversalDir::Node => {
            cb.call_node(h, start)?;
            Ok(())
        }
        TraversalDir::Children | TraversalDir::Parents => {
            let adj =
                if dir == TraversalDir::Children { Adj::Children } else { Adj::Parents };
            for (origin_field, target) in adjacency(h, start, adj)? {
                let meta = TraversalMeta { origin: *start, origin_field: &origin_field };
                cb.call_child(h, &meta, &target)?;
                if cb.call_node(h, &target)? {
                    return Ok(());
                }
            }
            Ok(())
        }
        TraversalDir::Ref => {
            let field = field.unwrap();
            for target in ref_field_targets(h, start, field) {
                if h.node(&target).is_none() {
                    continue;
                }
                let meta = TraversalMeta { origin: *start, origin_field: field };
                cb.call_child(h, &meta, &target)?;
                if cb.call_node(h, &target)? {
                    return Ok(());
                }
            }
            Ok(())
        }
        TraversalDir::EdgeField => {
            let field = field.unwrap();
            for (origin_field, target) in adjacency(h, start, Adj::EdgeField(field))? {
                let meta = TraversalMeta { origin: *start, origin_field: &origin_field };
                cb.call_child(h, &meta, &target)?;
                if cb.call_node(h, &target)? {
                    return Ok(());
                }
            }
            Ok(())
        }
        TraversalDir::BfsAncestors => bfs(h, start, Adj::Parents, cb),
        TraversalDir::BfsDescendants => bfs(h, start, Adj::Children, cb),
        TraversalDir::DfsAncestors => dfs(h, start, Adj::Parents, cb),
        TraversalDir::DfsDescendants => dfs(h, start, Adj::Children, cb),
        TraversalDir::DfsFull => {
            let trx = h.next_trx();
            for head in h.heads() {
                cb.call_head(h, &head)?;
                if dfs_with_trx(h, &head, Adj::Children, cb, trx)? {
                    return Ok(());
                }
            }
            Ok(())
        }
        TraversalDir::BfsEdgeField => bfs(h, start, Adj::EdgeField(field.unwrap()), cb),
        TraversalDir::BfsExpression => bfs(h, start, Adj::Expr(expr.unwrap(), edge_filter), cb),
        TraversalDir::Expression => {
            for (origin_field, target) in
                adjacency(h, start, Adj::Expr(expr.unwrap(), edge_filter))?
            {
                let meta = TraversalMeta { origin: *start, origin_field: &origin_field };
                cb.call_child(h, &meta, &target)?;
                if cb.call_node(h, &target)? {
                    return Ok(());
                }
            }
            Ok(())
        }
        TraversalDir::Array | TraversalDir::Set => {
            err_at!(NotSupported, msg: "{} is an object traversal", dir.to_token())
        }
    }
}

/// Convenience wrapper traversing the children of one node.
pub fn traverse_children(
    h: &mut SelvaHierarchy,
    start: &NodeId,
    cb: &mut TraversalCallback,
) -> Result<()> {
    traverse(h, start, TraversalDir::Children, None, None, None, cb)
}

/// Convenience wrapper traversing the parents of one node.
pub fn traverse_parents(
    h: &mut SelvaHierarchy,
    start: &NodeId,
    cb: &mut TraversalCallback,
) -> Result<()> {
    traverse(h, start, TraversalDir::Parents, None, None, None, cb)
}

/// Read-only reachability check over child edges; `start` itself does
/// not count.
pub fn descendants_contain(h: &SelvaHierarchy, start: &NodeId, target: &NodeId) -> bool {
    let trx = h.next_trx();
    let start_node = match h.node(start) {
        Some(node) => node,
        None => return false,
    };
    start_node.mark_visited(trx);
    let mut queue = VecDeque::new();
    queue.push_back(*start);
    while let Some(cur) = queue.pop_front() {
        let children = match h.node(&cur) {
            Some(node) => node.children().to_vec(),
            None => continue,
        };
        for c in children {
            if c == *target {
                return true;
            }
            if let Some(node) = h.node(&c) {
                if !node.visited(trx) {
                    node.mark_visited(trx);
                    queue.push_back(c);
                }
            }
        }
    }
    false
}

/// Read-only BFS collecting the reachable ids, excluding `start`.
/// Supports ancestors and descendants directions.
pub fn collect_ids(h: &SelvaHierarchy, start: &NodeId, dir: TraversalDir) -> Vec<NodeId> {
    let up = match dir {
        TraversalDir::BfsAncestors | TraversalDir::DfsAncestors | TraversalDir::Parents => true,
        TraversalDir::BfsDescendants
        | TraversalDir::DfsDescendants
        | TraversalDir::Children => false,
        _ => return vec![],
    };
    let one_hop = matches!(dir, TraversalDir::Parents | TraversalDir::Children);
    let trx = h.next_trx();
    let start_node = match h.node(start) {
        Some(node) => node,
        None => return vec![],
    };
    start_node.mark_visited(trx);
    let mut out = vec![];
    let mut queue = VecDeque::new();
    queue.push_back(*start);
    while let Some(cur) = queue.pop_front() {
        let adj = match h.node(&cur) {
            Some(node) => {
                if up {
                    node.parents().to_vec()
                } else {
                    node.children().to_vec()
                }
            }
            None => continue,
        };
        for next in adj {
            if let Some(node) = h.node(&next) {
                if !node.visited(trx) {
                    node.mark_visited(trx);
                    out.push(next);
                    if !one_hop {
                        queue.push_back(next);
                    }
                }
            }
        }
        if one_hop {
            break;
        }
    }
    out
}

/// One value of a set-like field, yielded by [foreach_in_field].
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Id(NodeId),
    Str(Vec<u8>),
    Double(f64),
    LongLong(i64),
}

/// Foreach over a set-like field: parents, children, ancestors,
/// descendants, set fields and array fields.
pub fn foreach_in_field(
    h: &SelvaHierarchy,
    id: &NodeId,
    field: &str,
    cb: &mut dyn FnMut(FieldValue) -> Result<()>,
) -> Result<()> {
    match field {
        PARENTS_FIELD | CHILDREN_FIELD => {
            let dir = if field == PARENTS_FIELD {
                TraversalDir::Parents
            } else {
                TraversalDir::Children
            };
            for target in collect_ids(h, id, dir) {
                cb(FieldValue::Id(target))?;
            }
            Ok(())
        }
        ANCESTORS_FIELD | DESCENDANTS_FIELD => {
            let dir = if field == ANCESTORS_FIELD {
                TraversalDir::BfsAncestors
            } else {
                TraversalDir::BfsDescendants
            };
            for target in collect_ids(h, id, dir) {
                cb(FieldValue::Id(target))?;
            }
            Ok(())
        }
        _ => {
            let node = match h.node(id) {
                Some(node) => node,
                None => return err_at!(NotFound, msg: "node {}", id),
            };
            match node.obj().get_any(field) {
                Ok(ValueView::Set(set)) => {
                    for v in set.iter() {
                        cb(match v {
                            SetValue::Str(s) => FieldValue::Str(s.as_bytes().to_vec()),
                            SetValue::Double(d) => FieldValue::Double(d),
                            SetValue::LongLong(v) => FieldValue::LongLong(v),
                            SetValue::NodeId(id) => FieldValue::Id(*id),
                        })?;
                    }
                    Ok(())
                }
                Ok(ValueView::Array(arr)) => {
                    match arr {
                        ObjArray::Double(v) => {
                            for x in v {
                                cb(FieldValue::Double(*x))?;
                            }
                        }
                        ObjArray::LongLong(v) => {
                            for x in v {
                                cb(FieldValue::LongLong(*x))?;
                            }
                        }
                        ObjArray::Str(v) => {
                            for x in v {
                                cb(FieldValue::Str(x.as_bytes().to_vec()))?;
                            }
                        }
                        _ => return err_at!(TypeMismatch, msg: "array field {:?}", field),
                    }
                    Ok(())
                }
                _ => err_at!(NotFound, msg: "field {:?} on {}", field, id),
            }
        }
    }
}

/// Does the node have a non-empty set-like field of this name.
pub fn is_non_empty_field(h: &SelvaHierarchy, id: &NodeId, field: &str) -> bool {
    let node = match h.node(id) {
        Some(node) => node,
        None => return false,
    };
    match field {
        PARENTS_FIELD => !node.parents().is_empty(),
        CHILDREN_FIELD => !node.children().is_empty(),
        ANCESTORS_FIELD => !node.parents().is_empty(),
        DESCENDANTS_FIELD => !node.children().is_empty(),
        _ => match node.obj().get_any(field) {
            Ok(ValueView::Set(set)) => !set.is_empty(),
            Ok(ValueView::Array(arr)) => !arr.is_empty(),
            _ => match edge::edge_get(node, field) {
                Some(edge_field) => !edge_field.arcs.is_empty(),
                None => false,
            },
        },
    }
}

#[cfg(test)]
#[path = "traversal_test.rs"]
mod traversal_test;
