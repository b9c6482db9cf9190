//! Module implement the subscription engine.
//!
//! A subscription is a set of markers sharing a 32 byte id. A marker is
//! an installed query shape: refreshing it walks its traversal and
//! leaves the marker on every visited node, so mutation hot paths only
//! need to look at the markers present on the touched node. Each marker
//! set carries the OR of its member matcher flags, letting those hot
//! paths skip whole sets with one test.
//!
//! Events are deferred into two deduplicating queues and published on
//! the pub/sub channel after the owning command finished building its
//! reply.

use log::trace;

use std::{
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
    sync::mpsc,
};

use crate::{
    hierarchy::{
        traversal::{self, TraversalCallback, TraversalDir},
        SelvaHierarchy,
    },
    rpn::{self, RpnCtx, RpnExpression, RpnValue},
    svector::SVector,
    types::{MarkerId, NodeId, SubscriptionId, TriggerType},
    Result,
};

/// Matcher flags; type information for event matching.
pub const FLAG_CL_HIERARCHY: u16 = 0x0001;
pub const FLAG_CH_HIERARCHY: u16 = 0x0002;
pub const FLAG_CH_FIELD: u16 = 0x0004;
pub const FLAG_CH_ALIAS: u16 = 0x0008;
pub const FLAG_REFRESH: u16 = 0x0020;
/// Modifier flags; never part of a set's flags filter.
pub const FLAG_REF: u16 = 0x0100;
pub const FLAG_DETACH: u16 = 0x0200;
/// Trigger markers carry one matcher bit and one modifier bit.
pub const FLAG_TRIGGER: u16 = 0x0410;

pub const MATCHER_FLAGS_MASK: u16 = 0x00ff;

// Internal event bit marking the start of a refresh pass.
pub(crate) const EVENT_REFRESH_BEGIN: u16 = 0x8000;

/// Identifies one marker across the whole hierarchy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct MarkerKey {
    pub sub_id: SubscriptionId,
    pub marker_id: MarkerId,
}

/// What happens when a marker matches an event.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum MarkerAction {
    /// Deduplicate into the deferred event queues.
    DeferEvent,
    /// Route into the find index cache; `action_ctx` holds the ICB name.
    FindIndex,
}

/// Subscription marker.
pub struct Marker {
    pub key: MarkerKey,
    pub flags: u16,
    /// Starting node; unused for trigger markers.
    pub node_id: NodeId,
    /// Trigger event kind for trigger markers.
    pub event_type: Option<TriggerType>,
    pub dir: TraversalDir,
    /// Traversal field for field directed traversals.
    pub ref_field: Option<String>,
    /// Compiled traversal expression for expression traversals.
    pub traversal_expr: Option<Rc<RpnExpression>>,
    pub filter: Option<Rc<RpnExpression>>,
    /// Register assignments applied before every filter evaluation.
    pub filter_regs: Vec<(usize, RpnValue)>,
    /// Newline separated field-name allowlist; None matches any field.
    pub fields: Option<String>,
    /// Alias name for alias markers.
    pub alias: Option<String>,
    pub action: MarkerAction,
    /// Owner context of the action; the ICB name for FindIndex.
    pub action_ctx: Vec<u8>,
    // filter result snapshot between precheck and the mutation
    filter_history: (NodeId, bool),
    pub(crate) last_trigger_node: NodeId,
}

impl Marker {
    fn is_detached(&self) -> bool {
        (self.flags & FLAG_DETACH) != 0 || (self.flags & FLAG_TRIGGER) == FLAG_TRIGGER
    }
}

fn marker_key_cmp(a: &MarkerKey, b: &MarkerKey) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Marker set attached to a node, or the hierarchy level detached set.
pub struct MarkerSet {
    /// OR of the member matcher flags, the fast-path filter.
    pub flags_filter: u16,
    vec: SVector<MarkerKey>,
}

impl MarkerSet {
    pub fn new() -> MarkerSet {
        MarkerSet { flags_filter: 0, vec: SVector::new(0, Some(marker_key_cmp)) }
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    pub fn contains(&self, key: &MarkerKey) -> bool {
        self.vec.contains(key)
    }

    pub fn keys(&self) -> Vec<MarkerKey> {
        self.vec.to_vec()
    }

    /// Does the fast-path filter admit any of `mask`.
    pub fn has_flags(&self, mask: u16) -> bool {
        (self.flags_filter & mask) != 0
    }

    fn add(&mut self, key: MarkerKey, flags: u16) -> bool {
        match self.vec.insert_fast(key) {
            Ok(()) => {
                self.flags_filter |= flags & MATCHER_FLAGS_MASK;
                true
            }
            Err(_) => false,
        }
    }

    fn remove(&mut self, key: &MarkerKey) -> bool {
        self.vec.remove(key).is_some()
    }

    fn clear(&mut self) {
        self.vec.clear();
        self.flags_filter = 0;
    }

    fn recompute_flags<F>(&mut self, flags_of: F)
    where
        F: Fn(&MarkerKey) -> u16,
    {
        self.flags_filter = 0;
        for key in self.vec.iter() {
            self.flags_filter |= flags_of(key) & MATCHER_FLAGS_MASK;
        }
    }
}

impl Default for MarkerSet {
    fn default() -> MarkerSet {
        MarkerSet::new()
    }
}

/// Pub/sub event kinds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PubsubEventKind {
    Update = 1,
    Trigger = 2,
}

/// Message published for a flushed deferred event.
#[derive(Clone, PartialEq, Debug)]
pub struct PubsubMessage {
    pub kind: PubsubEventKind,
    pub sub_id: SubscriptionId,
    pub node_id: Option<NodeId>,
}

/// In-process pub/sub channel carrying subscription messages to the
/// connection layer.
pub struct Pubsub {
    txs: Vec<mpsc::Sender<PubsubMessage>>,
}

impl Pubsub {
    pub fn new() -> Pubsub {
        Pubsub { txs: vec![] }
    }

    /// Subscribe to the channel. Dropping the receiver unsubscribes.
    pub fn subscribe(&mut self) -> mpsc::Receiver<PubsubMessage> {
        let (tx, rx) = mpsc::channel();
        self.txs.push(tx);
        rx
    }

    pub fn publish(&mut self, msg: PubsubMessage) {
        self.txs.retain(|tx| tx.send(msg.clone()).is_ok());
    }
}

impl Default for Pubsub {
    fn default() -> Pubsub {
        Pubsub::new()
    }
}

/// One subscription: the markers sharing one subscription id.
pub struct Subscription {
    pub id: SubscriptionId,
    pub markers: BTreeSet<MarkerId>,
}

/// All subscription state of a hierarchy.
pub struct SubscriptionState {
    pub(crate) subs: BTreeMap<SubscriptionId, Subscription>,
    pub(crate) markers: BTreeMap<MarkerKey, Marker>,
    /// Markers that do not live on nodes: triggers and manually detached
    /// markers.
    pub(crate) detached: MarkerSet,
    /// Missing accessor index: node id or alias, then subscription ids.
    missing: BTreeMap<String, BTreeSet<SubscriptionId>>,
    deferred_updates: BTreeSet<SubscriptionId>,
    deferred_triggers: BTreeSet<MarkerKey>,
    pub pubsub: Pubsub,
}

impl SubscriptionState {
    pub fn new() -> SubscriptionState {
        SubscriptionState {
            subs: BTreeMap::new(),
            markers: BTreeMap::new(),
            detached: MarkerSet::new(),
            missing: BTreeMap::new(),
            deferred_updates: BTreeSet::new(),
            deferred_triggers: BTreeSet::new(),
            pubsub: Pubsub::new(),
        }
    }

    pub fn subscription(&self, sub_id: &SubscriptionId) -> Option<&Subscription> {
        self.subs.get(sub_id)
    }

    pub fn marker(&self, key: &MarkerKey) -> Option<&Marker> {
        self.markers.get(key)
    }

    /// Missing accessor entries as `(accessor, subscriptions)` pairs.
    pub fn missing_entries(&self) -> Vec<(String, Vec<SubscriptionId>)> {
        self.missing
            .iter()
            .map(|(k, subs)| (k.clone(), subs.iter().cloned().collect()))
            .collect()
    }

    /// Count of queued deferred events, updates then triggers.
    pub fn deferred_counts(&self) -> (usize, usize) {
        (self.deferred_updates.len(), self.deferred_triggers.len())
    }
}

impl Default for SubscriptionState {
    fn default() -> SubscriptionState {
        SubscriptionState::new()
    }
}

/// Generate a subscription marker id by hashing a descriptor string.
/// The MSB is set so server generated ids can never collide with client
/// generated ones.
pub fn gen_marker_id(prev: MarkerId, s: &str) -> MarkerId {
    let hash = (cityhash_rs::cityhash_110_128(s.as_bytes()) as u64) ^ (prev as u64);
    (hash | 0x8000_0000_0000_0000) as i64
}

/// Everything needed to create a marker.
pub struct MarkerSpec {
    pub sub_id: SubscriptionId,
    pub marker_id: MarkerId,
    pub flags: u16,
    pub node_id: NodeId,
    pub event_type: Option<TriggerType>,
    pub dir: TraversalDir,
    pub ref_field: Option<String>,
    pub dir_expression: Option<String>,
    pub filter: Option<String>,
    pub filter_regs: Vec<(usize, RpnValue)>,
    pub fields: Option<String>,
    pub alias: Option<String>,
    pub action: MarkerAction,
    pub action_ctx: Vec<u8>,
}

impl MarkerSpec {
    /// A plain subscription marker over a hierarchy traversal.
    pub fn generic(
        sub_id: SubscriptionId,
        marker_id: MarkerId,
        node_id: NodeId,
        dir: TraversalDir,
    ) -> MarkerSpec {
        MarkerSpec {
            sub_id,
            marker_id,
            flags: FLAG_CH_HIERARCHY | FLAG_CH_FIELD,
            node_id,
            event_type: None,
            dir,
            ref_field: None,
            dir_expression: None,
            filter: None,
            filter_regs: vec![],
            fields: None,
            alias: None,
            action: MarkerAction::DeferEvent,
            action_ctx: vec![],
        }
    }

    /// An alias marker: "this alias points to this node".
    pub fn alias(
        sub_id: SubscriptionId,
        marker_id: MarkerId,
        alias: &str,
        node_id: NodeId,
    ) -> MarkerSpec {
        MarkerSpec {
            sub_id,
            marker_id,
            flags: FLAG_CH_ALIAS,
            node_id,
            event_type: None,
            dir: TraversalDir::Node,
            ref_field: None,
            dir_expression: None,
            filter: None,
            filter_regs: vec![],
            fields: None,
            alias: Some(alias.to_string()),
            action: MarkerAction::DeferEvent,
            action_ctx: vec![],
        }
    }

    /// A trigger marker keyed by an event kind.
    pub fn trigger(
        sub_id: SubscriptionId,
        marker_id: MarkerId,
        event_type: TriggerType,
    ) -> MarkerSpec {
        MarkerSpec {
            sub_id,
            marker_id,
            flags: FLAG_TRIGGER,
            node_id: NodeId::empty(),
            event_type: Some(event_type),
            dir: TraversalDir::None,
            ref_field: None,
            dir_expression: None,
            filter: None,
            filter_regs: vec![],
            fields: None,
            alias: None,
            action: MarkerAction::DeferEvent,
            action_ctx: vec![],
        }
    }

    /// An internal callback marker, used by the find index cache.
    pub fn callback(
        sub_id: SubscriptionId,
        marker_id: MarkerId,
        node_id: NodeId,
        dir: TraversalDir,
        action_ctx: Vec<u8>,
    ) -> MarkerSpec {
        MarkerSpec {
            sub_id,
            marker_id,
            flags: FLAG_CL_HIERARCHY | FLAG_CH_HIERARCHY | FLAG_CH_FIELD | FLAG_REFRESH,
            node_id,
            event_type: None,
            dir,
            ref_field: None,
            dir_expression: None,
            filter: None,
            filter_regs: vec![],
            fields: None,
            alias: None,
            action: MarkerAction::FindIndex,
            action_ctx,
        }
    }
}

/// Create a marker from a spec. The marker is not attached to any node
/// until it is refreshed.
pub fn add_marker(h: &mut SelvaHierarchy, spec: MarkerSpec) -> Result<()> {
    let key = MarkerKey { sub_id: spec.sub_id, marker_id: spec.marker_id };
    if h.subs.markers.contains_key(&key) {
        return err_at!(Exists, msg: "marker {} exists", spec.marker_id);
    }
    let traversal_expr = match &spec.dir_expression {
        Some(src) => Some(Rc::new(RpnExpression::compile(src)?)),
        None => None,
    };
    let filter = match &spec.filter {
        Some(src) => Some(Rc::new(RpnExpression::compile(src)?)),
        None => None,
    };
    let sub_id = spec.sub_id;
    let marker_id = spec.marker_id;
    let marker = Marker {
        key,
        flags: spec.flags,
        node_id: spec.node_id,
        event_type: spec.event_type,
        dir: spec.dir,
        ref_field: spec.ref_field,
        traversal_expr,
        filter,
        filter_regs: spec.filter_regs,
        fields: spec.fields,
        alias: spec.alias,
        action: spec.action,
        action_ctx: spec.action_ctx,
        filter_history: (NodeId::empty(), false),
        last_trigger_node: NodeId::empty(),
    };
    h.subs.markers.insert(key, marker);
    h.subs
        .subs
        .entry(sub_id)
        .or_insert_with(|| Subscription { id: sub_id, markers: BTreeSet::new() })
        .markers
        .insert(marker_id);
    Ok(())
}

/// Register a missing accessor watcher for a node id or alias.
pub fn add_missing(h: &mut SelvaHierarchy, sub_id: SubscriptionId, accessor: &str) {
    h.subs.missing.entry(accessor.to_string()).or_insert_with(BTreeSet::new).insert(sub_id);
    h.subs
        .subs
        .entry(sub_id)
        .or_insert_with(|| Subscription { id: sub_id, markers: BTreeSet::new() });
}

// Snapshot of the marker fields needed while holding no borrow on the
// registry.
struct MarkerView {
    flags: u16,
    node_id: NodeId,
    event_type: Option<TriggerType>,
    dir: TraversalDir,
    ref_field: Option<String>,
    traversal_expr: Option<Rc<RpnExpression>>,
    filter: Option<Rc<RpnExpression>>,
    filter_regs: Vec<(usize, RpnValue)>,
    fields: Option<String>,
    filter_history: (NodeId, bool),
    detached: bool,
}

fn marker_view(h: &SelvaHierarchy, key: &MarkerKey) -> Option<MarkerView> {
    let m = h.subs.markers.get(key)?;
    Some(MarkerView {
        flags: m.flags,
        node_id: m.node_id,
        event_type: m.event_type,
        dir: m.dir,
        ref_field: m.ref_field.clone(),
        traversal_expr: m.traversal_expr.clone(),
        filter: m.filter.clone(),
        filter_regs: m.filter_regs.clone(),
        fields: m.fields.clone(),
        filter_history: m.filter_history,
        detached: m.is_detached(),
    })
}

impl MarkerView {
    fn field_list_match(&self, field: &str) -> bool {
        match &self.fields {
            None => true,
            Some(list) => list.split('\n').any(|f| f == field),
        }
    }

    fn filter_match(&self, h: &SelvaHierarchy, node_id: &NodeId) -> bool {
        eval_filter(h, &self.filter, &self.filter_regs, node_id)
    }
}

fn eval_filter(
    h: &SelvaHierarchy,
    filter: &Option<Rc<RpnExpression>>,
    regs: &[(usize, RpnValue)],
    node_id: &NodeId,
) -> bool {
    match filter {
        None => true,
        Some(expr) => {
            let mut ctx = RpnCtx::new(1);
            for (i, v) in regs {
                ctx.set_reg(*i, v.clone());
            }
            // an evaluation error means "filter did not match"
            rpn::rpn_bool(h, &mut ctx, expr, Some(node_id)).unwrap_or(false)
        }
    }
}

/// Test if the RPN filter defined in a marker matches a node. Useful for
/// callback marker owners, which run their filter outside the engine.
pub fn filter_match(h: &SelvaHierarchy, key: &MarkerKey, node_id: &NodeId) -> bool {
    match marker_view(h, key) {
        Some(view) => view.filter_match(h, node_id),
        None => false,
    }
}

// Dispatch a matched marker: normal markers deduplicate into the
// deferred queues, index markers route into the find index cache.
fn run_marker_action(
    h: &mut SelvaHierarchy,
    key: &MarkerKey,
    event_flags: u16,
    field: Option<&str>,
    node_id: Option<&NodeId>,
) {
    let (action, action_ctx, flags) = match h.subs.markers.get(key) {
        Some(m) => (m.action, m.action_ctx.clone(), m.flags),
        None => return,
    };
    match action {
        MarkerAction::DeferEvent => {
            if (flags & FLAG_TRIGGER) == FLAG_TRIGGER {
                h.subs.deferred_triggers.insert(*key);
            } else {
                h.subs.deferred_updates.insert(key.sub_id);
            }
        }
        MarkerAction::FindIndex => {
            crate::find_index::on_marker_event(h, &action_ctx, event_flags, field, node_id);
        }
    }
}

/// Attach a marker to every node its traversal reaches, or to the
/// hierarchy level detached set for detached and trigger markers. A
/// marker with the refresh flag also runs its action for every node
/// walked.
pub fn refresh_marker(h: &mut SelvaHierarchy, key: &MarkerKey) -> Result<()> {
    let view = match marker_view(h, key) {
        Some(view) => view,
        None => return err_at!(NotFound, msg: "marker {}", key.marker_id),
    };

    if view.detached {
        let flags = view.flags;
        h.subs.detached.add(*key, flags);
        return Ok(());
    }

    if (view.flags & FLAG_REFRESH) != 0 {
        run_marker_action(h, key, EVENT_REFRESH_BEGIN, None, None);
    }

    let marker_key = *key;
    let refresh = (view.flags & FLAG_REFRESH) != 0;
    let flags = view.flags;
    let mut visited: Vec<NodeId> = vec![];
    {
        let mut node_cb = |h: &mut SelvaHierarchy, id: &NodeId| -> Result<bool> {
            if let Some(node) = h.node_mut(id) {
                node.markers.add(marker_key, flags);
            }
            visited.push(*id);
            Ok(false)
        };
        let mut head_cb = |h: &mut SelvaHierarchy, id: &NodeId| -> Result<()> {
            if let Some(node) = h.node_mut(id) {
                node.markers.add(marker_key, flags);
            }
            Ok(())
        };
        let mut cb = TraversalCallback {
            head_cb: Some(&mut head_cb),
            node_cb: Some(&mut node_cb),
            child_cb: None,
        };
        traversal::traverse(
            h,
            &view.node_id,
            view.dir,
            view.ref_field.as_deref(),
            view.traversal_expr.as_deref(),
            None,
            &mut cb,
        )?;
    }
    if refresh {
        for id in visited {
            run_marker_action(h, key, FLAG_REFRESH, None, Some(&id));
        }
    }
    trace!(target: "selva", "refreshed marker {} of {:?}", key.marker_id, &key.sub_id[..4]);
    Ok(())
}

/// Refresh every marker of a subscription.
pub fn refresh_subscription(h: &mut SelvaHierarchy, sub_id: &SubscriptionId) -> Result<()> {
    let marker_ids: Vec<MarkerId> = match h.subs.subs.get(sub_id) {
        Some(sub) => sub.markers.iter().cloned().collect(),
        None => return err_at!(NotFound, msg: "no such subscription"),
    };
    for marker_id in marker_ids {
        refresh_marker(h, &MarkerKey { sub_id: *sub_id, marker_id })?;
    }
    Ok(())
}

// Remove a marker from every node its traversal reaches. Staleness is
// tolerated: markers left on nodes that the traversal no longer covers
// are skipped lazily by the event paths.
fn remove_marker_from_nodes(h: &mut SelvaHierarchy, key: &MarkerKey) {
    let view = match marker_view(h, key) {
        Some(view) => view,
        None => return,
    };
    if view.detached {
        h.subs.detached.remove(key);
        let registry: Vec<(MarkerKey, u16)> =
            h.subs.markers.iter().map(|(k, m)| (*k, m.flags)).collect();
        h.subs
            .detached
            .recompute_flags(|k| registry.iter().find(|(rk, _)| rk == k).map(|(_, f)| *f).unwrap_or(0));
        return;
    }

    let marker_key = *key;
    let mut node_cb = |h: &mut SelvaHierarchy, id: &NodeId| -> Result<bool> {
        detach_marker_from_node(h, id, &marker_key);
        Ok(false)
    };
    let mut head_cb = |h: &mut SelvaHierarchy, id: &NodeId| -> Result<()> {
        detach_marker_from_node(h, id, &marker_key);
        Ok(())
    };
    let mut cb = TraversalCallback {
        head_cb: Some(&mut head_cb),
        node_cb: Some(&mut node_cb),
        child_cb: None,
    };
    traversal::traverse(
        h,
        &view.node_id,
        view.dir,
        view.ref_field.as_deref(),
        view.traversal_expr.as_deref(),
        None,
        &mut cb,
    )
    .ok();
}

fn detach_marker_from_node(h: &mut SelvaHierarchy, id: &NodeId, key: &MarkerKey) {
    let registry: Vec<(MarkerKey, u16)> = h
        .subs
        .markers
        .iter()
        .map(|(k, m)| (*k, m.flags))
        .collect();
    if let Some(node) = h.node_mut(id) {
        if node.markers.remove(key) {
            node.markers.recompute_flags(|k| {
                registry.iter().find(|(rk, _)| rk == k).map(|(_, f)| *f).unwrap_or(0)
            });
        }
    }
}

/// Delete one marker: detach it everywhere and drop it from the
/// registry. The owning subscription is dropped with its last marker.
pub fn delete_marker(h: &mut SelvaHierarchy, key: &MarkerKey) -> Result<()> {
    if !h.subs.markers.contains_key(key) {
        return err_at!(NotFound, msg: "marker {}", key.marker_id);
    }
    remove_marker_from_nodes(h, key);
    h.subs.markers.remove(key);
    h.subs.deferred_triggers.remove(key);
    let drop_sub = match h.subs.subs.get_mut(&key.sub_id) {
        Some(sub) => {
            sub.markers.remove(&key.marker_id);
            sub.markers.is_empty()
        }
        None => false,
    };
    // a subscription lives on while any missing accessor still names it
    let has_missing = h.subs.missing.values().any(|subs| subs.contains(&key.sub_id));
    if drop_sub && !has_missing {
        h.subs.subs.remove(&key.sub_id);
    }
    Ok(())
}

/// Delete a subscription: all markers, missing accessor entries and the
/// registry entry.
pub fn delete_subscription(h: &mut SelvaHierarchy, sub_id: &SubscriptionId) -> Result<()> {
    let marker_ids: Vec<MarkerId> = match h.subs.subs.get(sub_id) {
        Some(sub) => sub.markers.iter().cloned().collect(),
        None => return err_at!(NotFound, msg: "no such subscription"),
    };
    for marker_id in marker_ids {
        delete_marker(h, &MarkerKey { sub_id: *sub_id, marker_id }).ok();
    }
    h.subs.missing.retain(|_, subs| {
        subs.remove(sub_id);
        !subs.is_empty()
    });
    h.subs.subs.remove(sub_id);
    h.subs.deferred_updates.remove(sub_id);
    Ok(())
}

/// Clear all markers from one node, deferring an update for every
/// subscription that lost a marker here.
pub fn clear_node_markers(h: &mut SelvaHierarchy, node_id: &NodeId) {
    let keys = match h.node(node_id) {
        Some(node) => node.markers.keys(),
        None => return,
    };
    for key in keys.iter() {
        // internal callback markers have no client to notify
        if let Some(m) = h.subs.markers.get(key) {
            if m.action == MarkerAction::DeferEvent {
                h.subs.deferred_updates.insert(key.sub_id);
            }
        }
    }
    if let Some(node) = h.node_mut(node_id) {
        node.markers.clear();
    }
}

//
// Marker propagation on structural changes.
//

/// Copy descendant-class markers of the parent onto a freshly attached
/// child.
pub fn inherit_parent(h: &mut SelvaHierarchy, parent_id: &NodeId, child_id: &NodeId) {
    let keys = match h.node(parent_id) {
        Some(node) => node.markers.keys(),
        None => return,
    };
    for key in keys {
        let (dir, flags) = match h.subs.markers.get(&key) {
            Some(m) => (m.dir, m.flags),
            None => continue,
        };
        if matches!(
            dir,
            TraversalDir::BfsDescendants | TraversalDir::DfsDescendants | TraversalDir::DfsFull
        ) {
            if let Some(node) = h.node_mut(child_id) {
                node.markers.add(key, flags);
            }
        }
    }
}

/// Copy ancestor-class markers of the child onto a freshly attached
/// parent.
pub fn inherit_child(h: &mut SelvaHierarchy, parent_id: &NodeId, child_id: &NodeId) {
    let keys = match h.node(child_id) {
        Some(node) => node.markers.keys(),
        None => return,
    };
    for key in keys {
        let (dir, flags) = match h.subs.markers.get(&key) {
            Some(m) => (m.dir, m.flags),
            None => continue,
        };
        if matches!(dir, TraversalDir::BfsAncestors | TraversalDir::DfsAncestors) {
            if let Some(node) = h.node_mut(parent_id) {
                node.markers.add(key, flags);
            }
        }
    }
}

/// Copy edge traversing markers over a freshly created edge. If any
/// marker propagated, an event is deferred so the client can re-refresh
/// and catch new interior paths.
pub fn inherit_edge(h: &mut SelvaHierarchy, src: &NodeId, dst: &NodeId, field: &str) {
    let keys = match h.node(src) {
        Some(node) => node.markers.keys(),
        None => return,
    };
    for key in keys {
        let (dir, flags, ref_field) = match h.subs.markers.get(&key) {
            Some(m) => (m.dir, m.flags, m.ref_field.clone()),
            None => continue,
        };
        if dir == TraversalDir::BfsEdgeField && ref_field.as_deref() == Some(field) {
            let added = match h.node_mut(dst) {
                Some(node) => node.markers.add(key, flags),
                None => false,
            };
            if added {
                run_marker_action(h, &key, FLAG_CH_HIERARCHY, None, Some(dst));
            }
        }
    }
}

//
// Change classification.
//

// Applicable marker keys for an event on a node: the node's own set and
// the detached set, each behind its fast-path flags filter.
fn applicable_markers(h: &SelvaHierarchy, node_id: &NodeId, mask: u16) -> Vec<MarkerKey> {
    let mut keys = vec![];
    if let Some(node) = h.node(node_id) {
        if node.markers.has_flags(mask) {
            keys.extend(node.markers.keys());
        }
    }
    if h.subs.detached.has_flags(mask) {
        keys.extend(h.subs.detached.keys());
    }
    keys
}

/// Defer an update for every hierarchy marker matching a structural
/// change on `node_id`. `added` tells whether the change was additive;
/// removals surface to index markers as clear events.
pub fn defer_hierarchy_events(h: &mut SelvaHierarchy, node_id: &NodeId, added: bool) {
    let event = if added { FLAG_CH_HIERARCHY } else { FLAG_CL_HIERARCHY };
    for key in applicable_markers(h, node_id, FLAG_CH_HIERARCHY | FLAG_CL_HIERARCHY) {
        let view = match marker_view(h, &key) {
            Some(view) => view,
            None => continue,
        };
        if (view.flags & (FLAG_CH_HIERARCHY | FLAG_CL_HIERARCHY)) == 0 {
            continue;
        }
        if (view.flags & FLAG_REF) != 0 && view.node_id == *node_id {
            continue;
        }
        if !view.filter_match(h, node_id) {
            continue;
        }
        run_marker_action(h, &key, event, None, Some(node_id));
    }
}

/// Defer every hierarchy marker unconditionally; deletion notifications
/// must never be filtered away.
pub fn defer_hierarchy_deletion_events(h: &mut SelvaHierarchy, node_id: &NodeId) {
    for key in applicable_markers(h, node_id, FLAG_CH_HIERARCHY | FLAG_CL_HIERARCHY) {
        let flags = match h.subs.markers.get(&key) {
            Some(m) => m.flags,
            None => continue,
        };
        if (flags & (FLAG_CH_HIERARCHY | FLAG_CL_HIERARCHY)) == 0 {
            continue;
        }
        run_marker_action(h, &key, FLAG_CL_HIERARCHY, None, Some(node_id));
    }
}

/// Snapshot the filter result of every field marker on `node_id` ahead
/// of a mutation, for edge-crossing detection.
pub fn field_change_precheck(h: &mut SelvaHierarchy, node_id: &NodeId) {
    for key in applicable_markers(h, node_id, FLAG_CH_FIELD) {
        let view = match marker_view(h, &key) {
            Some(view) => view,
            None => continue,
        };
        if (view.flags & FLAG_CH_FIELD) == 0 {
            continue;
        }
        let res = view.filter_match(h, node_id);
        if let Some(marker) = h.subs.markers.get_mut(&key) {
            marker.filter_history = (*node_id, res);
        }
    }
}

/// Defer an update for every field marker matching a change of `field`
/// on `node_id`. An event fires when the snapshot and the post-change
/// filter both match and the field list admits the field, or when the
/// filter result crossed an edge.
pub fn defer_field_change_events(h: &mut SelvaHierarchy, node_id: &NodeId, field: &str) {
    for key in applicable_markers(h, node_id, FLAG_CH_FIELD) {
        let view = match marker_view(h, &key) {
            Some(view) => view,
            None => continue,
        };
        if (view.flags & FLAG_CH_FIELD) == 0 {
            continue;
        }
        if (view.flags & FLAG_REF) != 0 && view.node_id == *node_id {
            continue;
        }
        let now = view.filter_match(h, node_id);
        let field_match = view.field_list_match(field);
        let (hist_node, hist_res) = view.filter_history;
        let fire = if hist_node == *node_id {
            (hist_res && now && field_match) || (hist_res != now)
        } else {
            // no precheck for this node; the snapshot is undefined
            now && field_match
        };
        if fire {
            run_marker_action(h, &key, FLAG_CH_FIELD, Some(field), Some(node_id));
        }
    }
}

/// Defer an update for every alias marker watching `alias`, then clear
/// the markers of those subscriptions: alias markers are one-shot.
pub fn defer_alias_change_events(h: &mut SelvaHierarchy, alias: &str) {
    let keys: Vec<MarkerKey> = h
        .subs
        .markers
        .iter()
        .filter(|(_, m)| {
            (m.flags & FLAG_CH_ALIAS) != 0 && m.alias.as_deref() == Some(alias)
        })
        .map(|(k, _)| *k)
        .collect();
    let mut fired_subs: BTreeSet<SubscriptionId> = BTreeSet::new();
    for key in keys {
        run_marker_action(h, &key, FLAG_CH_ALIAS, None, None);
        fired_subs.insert(key.sub_id);
    }
    for sub_id in fired_subs {
        trace!(target: "selva", "alias {:?} fired, clearing subscription markers", alias);
        let marker_ids: Vec<MarkerId> = match h.subs.subs.get(&sub_id) {
            Some(sub) => sub.markers.iter().cloned().collect(),
            None => continue,
        };
        for marker_id in marker_ids {
            delete_marker(h, &MarkerKey { sub_id, marker_id }).ok();
        }
    }
}

/// Defer matching trigger markers for an event of kind `ev` on
/// `node_id`. The fired marker remembers the node for delivery.
pub fn defer_trigger_events(h: &mut SelvaHierarchy, node_id: &NodeId, ev: TriggerType) {
    if !h.subs.detached.has_flags(FLAG_TRIGGER & MATCHER_FLAGS_MASK) {
        return;
    }
    for key in h.subs.detached.keys() {
        let view = match marker_view(h, &key) {
            Some(view) => view,
            None => continue,
        };
        if (view.flags & FLAG_TRIGGER) != FLAG_TRIGGER || view.event_type != Some(ev) {
            continue;
        }
        if !view.filter_match(h, node_id) {
            continue;
        }
        if let Some(marker) = h.subs.markers.get_mut(&key) {
            marker.last_trigger_node = *node_id;
        }
        run_marker_action(h, &key, FLAG_TRIGGER, None, Some(node_id));
    }
}

/// Probe the missing accessor index for `accessor` (a node id or an
/// alias), converting matches into update events and dropping the key.
pub fn defer_missing_accessor_events(h: &mut SelvaHierarchy, accessor: &str) {
    if let Some(subs) = h.subs.missing.remove(accessor) {
        for sub_id in subs {
            trace!(target: "selva", "missing accessor {:?} arrived", accessor);
            h.subs.deferred_updates.insert(sub_id);
        }
    }
}

/// Publish all deferred events on the pub/sub channel and clear the
/// queues. Called after every mutating command framed its reply.
pub fn send_deferred_events(h: &mut SelvaHierarchy) {
    let updates: Vec<SubscriptionId> = h.subs.deferred_updates.iter().cloned().collect();
    h.subs.deferred_updates.clear();
    let triggers: Vec<MarkerKey> = h.subs.deferred_triggers.iter().cloned().collect();
    h.subs.deferred_triggers.clear();

    for sub_id in updates {
        let msg = PubsubMessage { kind: PubsubEventKind::Update, sub_id, node_id: None };
        h.subs.pubsub.publish(msg);
    }
    for key in triggers {
        let node_id = h.subs.markers.get(&key).map(|m| m.last_trigger_node);
        let msg = PubsubMessage {
            kind: PubsubEventKind::Trigger,
            sub_id: key.sub_id,
            node_id,
        };
        h.subs.pubsub.publish(msg);
    }
}

/// Drop all deferred events without publishing.
pub fn destroy_deferred_events(h: &mut SelvaHierarchy) {
    h.subs.deferred_updates.clear();
    h.subs.deferred_triggers.clear();
}

/// Does the node hold any markers.
pub fn has_active_markers(node: &crate::hierarchy::Node) -> bool {
    !node.markers.is_empty()
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
