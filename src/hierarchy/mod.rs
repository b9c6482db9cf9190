//! Module implement the hierarchy, a directed acyclic parent/child graph
//! of typed nodes.
//!
//! The hierarchy owns everything with a process-wide lifecycle: the node
//! index, the orphan head set, the alias and type tables, the string
//! intern pool, the edge constraint table, the subscription engine state
//! and the find index cache. All of it is reachable from [SelvaHierarchy]
//! instead of living in globals.

use std::{cell::Cell, cmp::Ordering, collections::BTreeMap};

use crate::{
    config::Config,
    edge::{self, EdgeFieldContainer},
    find_index::DynIndex,
    object::SelvaObject,
    set::SelvaSet,
    sstring::{InternPool, SelvaString},
    subscriptions::{self, MarkerSet, SubscriptionState},
    svector::SVector,
    types::{NodeId, NodeType, TriggerType, ALIASES_FIELD},
    Result,
};

pub mod detached;
pub mod order;
pub mod traversal;

use crate::edge::EdgeConstraints;

use detached::DetachedIndex;

fn node_id_cmp(a: &NodeId, b: &NodeId) -> Ordering {
    a.cmp(b)
}

/// One node of the hierarchy.
pub struct Node {
    id: NodeId,
    implicit: bool,
    obj: SelvaObject,
    parents: SVector<NodeId>,
    children: SVector<NodeId>,
    edges: Option<Box<EdgeFieldContainer>>,
    pub(crate) markers: MarkerSet,
    visit: Cell<u64>,
}

impl Node {
    pub(crate) fn new(id: NodeId, implicit: bool) -> Node {
        Node {
            id,
            implicit,
            obj: SelvaObject::new(),
            parents: SVector::new(0, Some(node_id_cmp)),
            children: SVector::new(0, Some(node_id_cmp)),
            edges: None,
            markers: MarkerSet::new(),
            visit: Cell::new(0),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.id.node_type()
    }

    pub fn obj(&self) -> &SelvaObject {
        &self.obj
    }

    pub fn obj_mut(&mut self) -> &mut SelvaObject {
        &mut self.obj
    }

    pub fn parents(&self) -> &SVector<NodeId> {
        &self.parents
    }

    pub fn children(&self) -> &SVector<NodeId> {
        &self.children
    }

    pub fn has_parent(&self, id: &NodeId) -> bool {
        self.parents.contains(id)
    }

    pub fn has_child(&self, id: &NodeId) -> bool {
        self.children.contains(id)
    }

    /// Node was created implicitly by being mentioned from another
    /// operation.
    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub(crate) fn clear_implicit(&mut self) {
        self.implicit = false;
    }

    pub fn edges(&self) -> Option<&EdgeFieldContainer> {
        self.edges.as_deref()
    }

    pub(crate) fn edges_mut(&mut self) -> &mut EdgeFieldContainer {
        if self.edges.is_none() {
            self.edges = Some(Box::new(EdgeFieldContainer::default()));
        }
        self.edges.as_deref_mut().unwrap()
    }

    pub(crate) fn take_edges(&mut self) -> Option<Box<EdgeFieldContainer>> {
        self.edges.take()
    }

    pub(crate) fn visited(&self, trx: u64) -> bool {
        self.visit.get() == trx
    }

    pub(crate) fn mark_visited(&self, trx: u64) {
        self.visit.set(trx);
    }
}

/// Flags for [SelvaHierarchy::del_node].
#[derive(Clone, Copy, Default)]
pub struct DelNodeFlags {
    /// Delete children regardless of remaining parents, ignore external
    /// edge references.
    pub force: bool,
    /// Write the subtree to the detached index before deleting it.
    pub detach: bool,
    /// Collect the deleted ids for the reply.
    pub reply_ids: bool,
}

/// The hierarchy.
pub struct SelvaHierarchy {
    config: Config,
    trx: Cell<u64>,
    session_nonce: u32,
    pub(crate) index: BTreeMap<NodeId, Node>,
    pub(crate) heads: SVector<NodeId>,
    pub(crate) types: SelvaObject,
    pub(crate) aliases: SelvaObject,
    pub(crate) intern: InternPool,
    pub(crate) constraints: EdgeConstraints,
    pub(crate) subs: SubscriptionState,
    pub(crate) dyn_index: DynIndex,
    pub(crate) detached: DetachedIndex,
}

impl SelvaHierarchy {
    /// Create a hierarchy with a root node.
    pub fn new(config: Config) -> SelvaHierarchy {
        let dyn_index = DynIndex::new(&config);
        let mut h = SelvaHierarchy {
            config,
            trx: Cell::new(0),
            session_nonce: rand::random(),
            index: BTreeMap::new(),
            heads: SVector::new(1, Some(node_id_cmp)),
            types: SelvaObject::new(),
            aliases: SelvaObject::new(),
            intern: InternPool::new(),
            constraints: EdgeConstraints::new(),
            subs: SubscriptionState::new(),
            dyn_index,
            detached: DetachedIndex::new(),
        };
        let root = NodeId::root();
        h.index.insert(root, Node::new(root, false));
        h.heads.insert(root);
        h
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub(crate) fn session_nonce(&self) -> u32 {
        self.session_nonce
    }

    /// Begin a new traversal transaction; nodes whose visit epoch equals
    /// the returned value count as visited.
    pub(crate) fn next_trx(&self) -> u64 {
        self.trx.set(self.trx.get() + 1);
        self.trx.get()
    }

    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.index.get_mut(id)
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id)
    }

    pub fn node_exists(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Ids of all nodes, in id order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.index.keys().cloned().collect()
    }

    /// Orphan head nodes, in id order.
    pub fn heads(&self) -> Vec<NodeId> {
        self.heads.to_vec()
    }

    /// Create the node if it is missing. Returns true when a node was
    /// created. Restores a matching detached subtree instead of creating
    /// a duplicate.
    pub fn upsert_node(&mut self, id: &NodeId, implicit: bool) -> Result<bool> {
        if id.is_empty() {
            return err_at!(InvalidInput, msg: "empty node id");
        }
        if self.index.contains_key(id) {
            if !implicit {
                // an explicit upsert settles a lazily created node
                self.node_mut(id).unwrap().clear_implicit();
            }
            return Ok(false);
        }
        if self.detached.contains(id) {
            detached::restore_subtree(self, id)?;
            return Ok(false);
        }
        self.index.insert(*id, Node::new(*id, implicit));
        self.heads.insert_fast(*id).ok();
        let id_str = id.to_string();
        subscriptions::defer_missing_accessor_events(self, &id_str);
        subscriptions::defer_trigger_events(self, id, TriggerType::Created);
        Ok(true)
    }

    // Would inserting the edge parent -> child close a cycle, i.e. is
    // parent reachable from child over child edges.
    fn would_cycle(&self, parent: &NodeId, child: &NodeId) -> bool {
        if parent == child {
            return true;
        }
        traversal::descendants_contain(self, child, parent)
    }

    // Insert the edge parent -> child maintaining symmetry, the head set
    // and marker propagation. `Exists` flags an already present edge and
    // is not an error for most callers.
    pub(crate) fn link(&mut self, parent_id: &NodeId, child_id: &NodeId) -> Result<()> {
        if !self.index.contains_key(parent_id) {
            return err_at!(NotFound, msg: "parent {}", parent_id);
        } else if !self.index.contains_key(child_id) {
            return err_at!(NotFound, msg: "child {}", child_id);
        } else if self.node(child_id).unwrap().has_parent(parent_id) {
            return err_at!(Exists, msg: "edge {} -> {}", parent_id, child_id);
        } else if self.would_cycle(parent_id, child_id) {
            return err_at!(InvalidInput, msg: "cycle {} -> {}", parent_id, child_id);
        }

        self.node_mut(parent_id).unwrap().children.insert_fast(*child_id)?;
        self.node_mut(child_id).unwrap().parents.insert_fast(*parent_id)?;
        self.heads.remove(child_id);

        subscriptions::inherit_parent(self, parent_id, child_id);
        subscriptions::inherit_child(self, parent_id, child_id);
        subscriptions::defer_hierarchy_events(self, parent_id, true);
        subscriptions::defer_hierarchy_events(self, child_id, true);
        Ok(())
    }

    // Remove the edge parent -> child. The last parent of a non-root
    // node going away turns the node into an orphan head.
    pub(crate) fn unlink(&mut self, parent_id: &NodeId, child_id: &NodeId) -> bool {
        let removed = match self.node_mut(parent_id) {
            Some(parent) => parent.children.remove(child_id).is_some(),
            None => false,
        };
        let mut orphan = false;
        if let Some(child) = self.node_mut(child_id) {
            child.parents.remove(parent_id);
            orphan = child.parents.is_empty();
        }
        if orphan {
            self.heads.insert_fast(*child_id).ok();
        }
        if removed {
            subscriptions::defer_hierarchy_events(self, parent_id, false);
            subscriptions::defer_hierarchy_events(self, child_id, false);
        }
        removed
    }

    /// Add relationships, keeping existing edges. Mentioned relatives
    /// are created lazily. Re-adding an existing edge is a no-op.
    pub fn add_hierarchy(
        &mut self,
        id: &NodeId,
        parents: &[NodeId],
        children: &[NodeId],
    ) -> Result<bool> {
        let created = self.upsert_node(id, false)?;
        for p in parents {
            self.upsert_node(p, true)?;
            match self.link(p, id) {
                Ok(()) => (),
                Err(err) if err.is_exists() => (),
                Err(err) => return Err(err),
            }
        }
        for c in children {
            self.upsert_node(c, true)?;
            match self.link(id, c) {
                Ok(()) => (),
                Err(err) if err.is_exists() => (),
                Err(err) => return Err(err),
            }
        }
        Ok(created)
    }

    /// Remove the listed relationships. Empty sides are no-ops.
    pub fn del_hierarchy(
        &mut self,
        id: &NodeId,
        parents: &[NodeId],
        children: &[NodeId],
    ) -> Result<()> {
        if !self.index.contains_key(id) {
            return err_at!(NotFound, msg: "node {}", id);
        }
        for p in parents {
            self.unlink(p, id);
        }
        for c in children {
            self.unlink(id, c);
        }
        Ok(())
    }

    /// Atomically replace both the parent and the child set.
    pub fn set_hierarchy(
        &mut self,
        id: &NodeId,
        parents: &[NodeId],
        children: &[NodeId],
    ) -> Result<bool> {
        let created = self.upsert_node(id, false)?;
        self.replace_parents(id, parents)?;
        self.replace_children(id, children)?;
        Ok(created)
    }

    /// Replace the parent set of an existing node.
    pub fn set_parents(&mut self, id: &NodeId, parents: &[NodeId]) -> Result<()> {
        if !self.index.contains_key(id) {
            return err_at!(NotFound, msg: "node {}", id);
        }
        self.replace_parents(id, parents)
    }

    /// Replace the child set of an existing node.
    pub fn set_children(&mut self, id: &NodeId, children: &[NodeId]) -> Result<()> {
        if !self.index.contains_key(id) {
            return err_at!(NotFound, msg: "node {}", id);
        }
        self.replace_children(id, children)
    }

    fn replace_parents(&mut self, id: &NodeId, parents: &[NodeId]) -> Result<()> {
        let old = self.node(id).unwrap().parents.to_vec();
        for p in old.iter().filter(|p| !parents.contains(p)) {
            self.unlink(p, id);
        }
        for p in parents {
            self.upsert_node(p, true)?;
            match self.link(p, id) {
                Ok(()) => (),
                Err(err) if err.is_exists() => (),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn replace_children(&mut self, id: &NodeId, children: &[NodeId]) -> Result<()> {
        let old = self.node(id).unwrap().children.to_vec();
        for c in old.iter().filter(|c| !children.contains(c)) {
            self.unlink(id, c);
        }
        for c in children {
            self.upsert_node(c, true)?;
            match self.link(id, c) {
                Ok(()) => (),
                Err(err) if err.is_exists() => (),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Delete all parent edges of a node.
    pub fn del_parents(&mut self, id: &NodeId) -> Result<()> {
        if !self.index.contains_key(id) {
            return err_at!(NotFound, msg: "node {}", id);
        }
        self.replace_parents(id, &[])
    }

    /// Delete all child edges of a node.
    pub fn del_children(&mut self, id: &NodeId) -> Result<()> {
        if !self.index.contains_key(id) {
            return err_at!(NotFound, msg: "node {}", id);
        }
        self.replace_children(id, &[])
    }

    /// Delete a node. Without `force`, children keeping other parents
    /// survive and external edge references block the deletion. Returns
    /// the number of deleted nodes and, with `reply_ids`, their ids.
    pub fn del_node(&mut self, id: &NodeId, flags: DelNodeFlags) -> Result<(usize, Vec<NodeId>)> {
        if !self.index.contains_key(id) {
            return err_at!(NotFound, msg: "node {}", id);
        }
        if !flags.force && edge::edge_refcount(self, id) > 0 {
            return err_at!(Exists, msg: "external references into {}", id);
        }

        let mut snapshots = vec![];
        let mut deleted = vec![];
        let mut stack = vec![*id];
        while let Some(cur) = stack.pop() {
            if !self.index.contains_key(&cur) {
                continue;
            }
            subscriptions::defer_hierarchy_deletion_events(self, &cur);
            subscriptions::defer_trigger_events(self, &cur, TriggerType::Deleted);
            subscriptions::clear_node_markers(self, &cur);
            edge::purge_node_edges(self, &cur)?;

            // aliases die with their node
            if let Some(set) = self.node(&cur).and_then(|n| n.obj.get_set(ALIASES_FIELD)).cloned()
            {
                self.delete_aliases(&set)?;
            }

            if flags.detach {
                // capture links before they are torn down
                snapshots.push(crate::snapshot::snapshot_node(self.node(&cur).unwrap()));
            }

            let parents = self.node(&cur).unwrap().parents.to_vec();
            for p in parents.iter() {
                self.unlink(p, &cur);
            }
            let children = self.node(&cur).unwrap().children.to_vec();
            for c in children.iter() {
                self.unlink(&cur, c);
                let orphan = self.node(c).map(|n| n.parents.is_empty()).unwrap_or(false);
                if flags.force || orphan {
                    stack.push(*c);
                }
            }

            self.heads.remove(&cur);
            self.index.remove(&cur);
            deleted.push(cur);
        }

        if flags.detach {
            detached::store_subtree(self, id, &deleted, snapshots)?;
        }

        let count = deleted.len();
        let ids = if flags.reply_ids { deleted } else { vec![] };
        Ok((count, ids))
    }

    /// Intern a string in the hierarchy's process-wide pool. Repeated
    /// values, set members in particular, share one frozen copy.
    pub fn intern_string(&mut self, src: &[u8]) -> Result<std::rc::Rc<SelvaString>> {
        self.intern.intern(src)
    }

    // Re-insert an edge without events or cycle checks; used when
    // rebuilding from a snapshot or a detached subtree.
    pub(crate) fn link_raw(&mut self, parent_id: &NodeId, child_id: &NodeId) {
        if let Some(p) = self.node_mut(parent_id) {
            p.children.insert_fast(*child_id).ok();
        }
        if let Some(c) = self.node_mut(child_id) {
            c.parents.insert_fast(*parent_id).ok();
        }
        self.heads.remove(child_id);
    }

    /// Clear all user fields of a node object.
    pub fn clear_node_fields(&mut self, id: &NodeId) -> Result<()> {
        match self.node_mut(id) {
            Some(node) => {
                node.obj.clear(&[ALIASES_FIELD]);
                Ok(())
            }
            None => err_at!(NotFound, msg: "node {}", id),
        }
    }

    //
    // Aliases.
    //

    /// Resolve an alias to a node id.
    pub fn get_alias(&self, name: &str) -> Option<NodeId> {
        let s = self.aliases.get_str(name).ok()?;
        Some(NodeId::new(s.as_bytes()))
    }

    /// Point `name` at `node_id`, moving it if it exists. Alias markers
    /// fire and the missing accessor index is probed.
    pub fn update_alias(&mut self, name: &str, node_id: &NodeId) -> Result<()> {
        if !self.index.contains_key(node_id) {
            return err_at!(NotFound, msg: "node {}", node_id);
        }
        if let Some(old) = self.get_alias(name) {
            if old == *node_id {
                return Ok(());
            }
            subscriptions::defer_alias_change_events(self, name);
            if let Some(node) = self.node_mut(&old) {
                node.obj.rem_set_str(ALIASES_FIELD, &SelvaString::from(name)).ok();
            }
        }
        self.aliases.set_str(name, SelvaString::from_bytes(node_id.trimmed()))?;
        let node = self.node_mut(node_id).unwrap();
        node.obj.add_set_str(ALIASES_FIELD, SelvaString::from(name)).ok();
        subscriptions::defer_missing_accessor_events(self, name);
        Ok(())
    }

    /// Remove one alias.
    pub fn delete_alias(&mut self, name: &str) -> Result<()> {
        match self.get_alias(name) {
            Some(node_id) => {
                subscriptions::defer_alias_change_events(self, name);
                self.aliases.del_key(name)?;
                if let Some(node) = self.node_mut(&node_id) {
                    node.obj.rem_set_str(ALIASES_FIELD, &SelvaString::from(name)).ok();
                }
                Ok(())
            }
            None => err_at!(NotFound, msg: "alias {:?}", name),
        }
    }

    /// Remove all aliases listed in a string set.
    pub fn delete_aliases(&mut self, set: &SelvaSet) -> Result<()> {
        if let SelvaSet::Str(aliases) = set {
            let names: Vec<String> = aliases.iter().map(|s| s.to_string()).collect();
            for name in names {
                self.delete_alias(&name).ok();
            }
        }
        Ok(())
    }

    /// All aliases as `(name, node id)` pairs.
    pub fn aliases(&self) -> Vec<(String, NodeId)> {
        self.aliases
            .iter_keys()
            .filter_map(|k| match k.value() {
                crate::object::Value::Str(s) => {
                    Some((k.name().to_string(), NodeId::new(s.as_bytes())))
                }
                _ => None,
            })
            .collect()
    }

    //
    // Node type names.
    //

    pub fn set_type_name(&mut self, t: NodeType, name: &str) -> Result<()> {
        self.types.set_str(&t.to_string(), SelvaString::from(name))
    }

    pub fn type_name(&self, t: NodeType) -> Option<String> {
        self.types.get_str(&t.to_string()).ok().map(|s| s.to_string())
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
