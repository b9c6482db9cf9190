//! Module implement the find index cache.
//!
//! Frequently repeated `(start node, direction, filter, order)` query
//! shapes are tracked in index control blocks (ICBs). A per-ICB timer
//! rolls a low-pass filtered popularity average, a global timer runs a
//! top-K selector over the scores, and the winners get materialized into
//! result sets kept coherent by a callback subscription marker.

use log::{debug, trace};

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    config::Config,
    hierarchy::{
        order::{self, OrderItem, ResultOrder},
        traversal::TraversalDir,
        SelvaHierarchy,
    },
    subscriptions::{self, MarkerKey, MarkerSpec},
    types::{MarkerId, NodeId, SubscriptionId},
    Result,
};

pub mod poptop;

use poptop::PopTop;

/// Subscription id owning every index callback marker; the MSB pattern
/// cannot collide with client subscription ids generated from hashes.
pub const INDEX_SUB_ID: SubscriptionId = [0xff; 32];

/// An ICB discarded by the selector keeps its control block when its
/// popularity average is still above this.
const POP_DISCARD_LIMIT: f32 = 0.1;

// Traversal kinds a query shape must use to be indexable.
fn dir_indexable(dir: TraversalDir) -> bool {
    matches!(
        dir,
        TraversalDir::Children
            | TraversalDir::Parents
            | TraversalDir::BfsAncestors
            | TraversalDir::BfsDescendants
            | TraversalDir::DfsAncestors
            | TraversalDir::DfsDescendants
            | TraversalDir::DfsFull
            | TraversalDir::BfsExpression
    )
}

/// Descriptor of one tracked query shape.
#[derive(Clone, Debug)]
pub struct IcbDescriptor {
    pub node_id: NodeId,
    pub dir: TraversalDir,
    pub dir_expression: Option<String>,
    pub sort: Option<(ResultOrder, String)>,
    pub filter: Option<String>,
}

const B64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

// Unpadded base64, used to keep expression text safe inside ICB names.
fn b64(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let v = ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32);
        out.push(B64_ALPHABET[(v >> 18) as usize & 0x3f]);
        out.push(B64_ALPHABET[(v >> 12) as usize & 0x3f]);
        if chunk.len() > 1 {
            out.push(B64_ALPHABET[(v >> 6) as usize & 0x3f]);
        }
        if chunk.len() > 2 {
            out.push(B64_ALPHABET[v as usize & 0x3f]);
        }
    }
    out
}

impl IcbDescriptor {
    /// Deterministic byte name addressing this shape:
    /// `node_id.D[.b64(expr)][.O.b64(order_field)][.b64(filter)]`.
    pub fn build_name(&self) -> Vec<u8> {
        let mut name = Vec::with_capacity(64);
        name.extend_from_slice(self.node_id.trimmed());
        name.push(b'.');
        name.push(b'A' + self.dir.bits().trailing_zeros() as u8 + 1);
        if let Some(expr) = &self.dir_expression {
            if !expr.is_empty() {
                name.push(b'.');
                name.extend_from_slice(&b64(expr.as_bytes()));
            }
        }
        if let Some((order, order_field)) = &self.sort {
            if *order != ResultOrder::None {
                name.push(b'.');
                name.push(b'A' + (*order as u8));
                name.push(b'.');
                name.extend_from_slice(&b64(order_field.as_bytes()));
            }
        }
        if let Some(filter) = &self.filter {
            if !filter.is_empty() {
                name.push(b'.');
                name.extend_from_slice(&b64(filter.as_bytes()));
            }
        }
        name
    }
}

// Materialized result of an active ICB.
enum IcbRes {
    None,
    Unordered(BTreeSet<NodeId>),
    Ordered(Vec<OrderItem>),
}

impl IcbRes {
    fn len(&self) -> usize {
        match self {
            IcbRes::None => 0,
            IcbRes::Unordered(set) => set.len(),
            IcbRes::Ordered(items) => items.len(),
        }
    }
}

/// Index control block: bookkeeping for one tracked query shape.
pub struct Icb {
    name: Vec<u8>,
    desc: IcbDescriptor,
    marker_id: Option<MarkerId>,
    res: IcbRes,
    // popularity accounting, current value plus low-pass average
    pop_count_cur: u32,
    pop_count_ave: f32,
    take_max: f32,
    take_max_ave: f32,
    tot_max: f32,
    tot_max_ave: f32,
    ind_take_max: f32,
    ind_take_max_ave: f32,
    /// Served-from-index counter, visible through `index.list`.
    hits: u64,
    active: bool,
    valid: bool,
    permanent: bool,
}

impl Icb {
    fn ordered(&self) -> bool {
        matches!(self.desc.sort, Some((order, _)) if order != ResultOrder::None)
    }

    fn score(&self) -> f32 {
        let take = if self.valid { self.ind_take_max_ave } else { self.take_max_ave };
        self.pop_count_ave * take
    }
}

/// Snapshot of one ICB for the `index.list` and `index.info` replies.
pub struct IcbInfo {
    pub name: Vec<u8>,
    pub active: bool,
    pub valid: bool,
    pub ordered: bool,
    pub permanent: bool,
    pub pop_count_ave: f32,
    pub take_max_ave: f32,
    pub tot_max_ave: f32,
    pub ind_take_max_ave: f32,
    pub card: usize,
    pub hits: u64,
}

// Subscription marker id allocator of capped size.
struct Ida {
    free: Vec<MarkerId>,
    next: MarkerId,
    max: MarkerId,
}

impl Ida {
    fn new(max: usize) -> Ida {
        Ida { free: vec![], next: 0, max: max as MarkerId }
    }

    fn alloc(&mut self) -> Option<MarkerId> {
        if let Some(id) = self.free.pop() {
            return Some(id);
        }
        if self.next < self.max {
            self.next += 1;
            Some(self.next - 1)
        } else {
            None
        }
    }

    fn release(&mut self, id: MarkerId) {
        self.free.push(id);
    }
}

/// Dynamic index state of a hierarchy.
pub struct DynIndex {
    icbs: BTreeMap<Vec<u8>, Icb>,
    top: PopTop,
    ida: Ida,
    nr_indices: usize,
    lpf_a: f32,
    max_icbs: usize,
    find_indices_max: usize,
    threshold: f32,
}

impl DynIndex {
    pub fn new(config: &Config) -> DynIndex {
        let period = config.find_indexing_popularity_ave_period as f32;
        let interval = (config.find_indexing_icb_update_interval as f32).max(1.0);
        let lpf_a = ((period - interval) / period).clamp(0.0, 0.999_9);
        DynIndex {
            icbs: BTreeMap::new(),
            // always keep more tracked than promotable so there is
            // something to choose from
            top: PopTop::new((2 * config.find_indices_max).max(4)),
            ida: Ida::new(config.find_indices_max_hints_find),
            nr_indices: 0,
            lpf_a,
            max_icbs: 2 * config.find_indices_max_hints_find,
            find_indices_max: config.find_indices_max,
            threshold: config.find_indexing_threshold,
        }
    }

    pub fn nr_indices(&self) -> usize {
        self.nr_indices
    }

    pub fn icb_count(&self) -> usize {
        self.icbs.len()
    }
}

fn lpf_calc_next(a: f32, ave: f32, sample: f32) -> f32 {
    a * ave + (1.0 - a) * sample
}

/// Track the hints of one find invocation: get or lazily create an ICB
/// per hint and count the lookups. Returns the ICB names.
pub fn auto_multi(h: &mut SelvaHierarchy, desc_per_hint: Vec<IcbDescriptor>) -> Vec<Vec<u8>> {
    let mut names = vec![];
    for desc in desc_per_hint {
        if !dir_indexable(desc.dir) || h.config().find_indices_max == 0 {
            continue;
        }
        let name = desc.build_name();
        if !h.dyn_index.icbs.contains_key(&name) {
            if h.dyn_index.icbs.len() >= h.dyn_index.max_icbs {
                debug!(target: "selva", "FIND_INDICES_MAX_HINTS reached, not tracking");
                continue;
            }
            // a fresh hint starts with a warm average so it is not
            // immediately dropped by the selector
            let lpf_a = h.dyn_index.lpf_a;
            let init_ave = 2.0
                * (h.config().find_indexing_interval as f32
                    / (h.config().find_indexing_icb_update_interval as f32).max(1.0))
                * (1.0 / lpf_a.max(0.001));
            let icb = Icb {
                name: name.clone(),
                desc: desc.clone(),
                marker_id: None,
                res: IcbRes::None,
                pop_count_cur: 0,
                pop_count_ave: init_ave,
                take_max: 0.0,
                take_max_ave: 0.0,
                tot_max: 0.0,
                tot_max_ave: 0.0,
                ind_take_max: 0.0,
                ind_take_max_ave: 0.0,
                hits: 0,
                active: false,
                valid: false,
                permanent: false,
            };
            h.dyn_index.icbs.insert(name.clone(), icb);
            trace!(target: "selva", "tracking hint {:?}", String::from_utf8_lossy(&name));
        }
        let icb = h.dyn_index.icbs.get_mut(&name).unwrap();
        icb.pop_count_cur = icb.pop_count_cur.saturating_add(1);
        names.push(name);
    }

    // an active but invalidated ICB is rebuilt on first use
    for name in names.iter() {
        let rebuild = {
            let icb = h.dyn_index.icbs.get(name).unwrap();
            icb.active && !icb.valid
        };
        if rebuild {
            refresh_icb(h, name).ok();
        }
    }
    names
}

/// Pick the smallest valid ICB of the candidates whose order is
/// compatible with the request. Returns the name and whether the result
/// is ordered.
pub fn select_icb(
    h: &SelvaHierarchy,
    names: &[Vec<u8>],
    want_sort: Option<(ResultOrder, &str)>,
) -> Option<(Vec<u8>, bool)> {
    let mut best: Option<(&Icb, bool)> = None;
    for name in names {
        let icb = match h.dyn_index.icbs.get(name) {
            Some(icb) => icb,
            None => continue,
        };
        if !icb.active || !icb.valid {
            continue;
        }
        let order_compatible = match (&icb.desc.sort, &want_sort) {
            (Some((io, ifield)), Some((wo, wfield))) => io == wo && ifield.as_str() == *wfield,
            (None, Some(_)) => false,
            (_, None) => true,
        };
        if icb.ordered() && want_sort.is_some() && !order_compatible {
            continue;
        }
        let better = match best {
            Some((cur, _)) => icb.res.len() < cur.res.len(),
            None => true,
        };
        if better {
            best = Some((icb, icb.ordered() && order_compatible));
        }
    }
    best.map(|(icb, ordered)| (icb.name.clone(), ordered))
}

/// Result ids of a valid ICB, in result order.
pub fn indexed_result(h: &mut SelvaHierarchy, name: &[u8]) -> Option<Vec<NodeId>> {
    let icb = h.dyn_index.icbs.get_mut(name)?;
    if !icb.active || !icb.valid {
        return None;
    }
    icb.hits += 1;
    match &icb.res {
        IcbRes::None => None,
        IcbRes::Unordered(set) => Some(set.iter().cloned().collect()),
        IcbRes::Ordered(items) => Some(items.iter().map(|item| item.node_id).collect()),
    }
}

/// Update the find accounting of every hint after a search. The
/// selected ICB records the real take; the others record that they
/// would not have helped.
pub fn acc_update(
    h: &mut SelvaHierarchy,
    names: &[Vec<u8>],
    selected: Option<&[u8]>,
    acc_take: usize,
    acc_tot: usize,
    from_index: bool,
) {
    for name in names {
        let icb = match h.dyn_index.icbs.get_mut(name) {
            Some(icb) => icb,
            None => continue,
        };
        let is_selected = selected.map(|s| s == name.as_slice()).unwrap_or(false);
        if is_selected {
            if from_index {
                icb.ind_take_max = icb.ind_take_max.max(acc_take as f32);
            } else {
                icb.take_max = icb.take_max.max(acc_take as f32);
            }
        }
        icb.tot_max = icb.tot_max.max(acc_tot as f32);
    }
}

/// Roll the popularity counter of every ICB into its average and propose
/// hot shapes to the selector. Driven by the `icb_update_interval`
/// timer.
pub fn icb_tick_all(h: &mut SelvaHierarchy) {
    let a = h.dyn_index.lpf_a;
    let threshold = h.dyn_index.threshold;
    let mut proposals = vec![];
    for (name, icb) in h.dyn_index.icbs.iter_mut() {
        icb.pop_count_ave = lpf_calc_next(a, icb.pop_count_ave, icb.pop_count_cur as f32);
        icb.pop_count_cur = 0;
        if icb.valid {
            icb.ind_take_max_ave = lpf_calc_next(a, icb.ind_take_max_ave, icb.ind_take_max);
        } else {
            icb.take_max_ave = lpf_calc_next(a, icb.take_max_ave, icb.take_max);
            icb.tot_max_ave = lpf_calc_next(a, icb.tot_max_ave, icb.tot_max);
        }
        icb.take_max = 0.0;
        icb.tot_max = 0.0;
        icb.ind_take_max = 0.0;

        if icb.permanent || icb.tot_max_ave >= threshold || icb.valid {
            proposals.push((icb.score(), name.clone()));
        }
    }
    for (score, name) in proposals {
        h.dyn_index.top.maybe_add(score, &name);
        trace!(
            target: "selva",
            "proposed {:?} with score {}", String::from_utf8_lossy(&name), score
        );
    }
}

/// Run the global selector: drop or destroy cold shapes, promote the
/// top ones into materialized indices. Driven by the
/// `find_indexing_interval` timer.
pub fn selector_tick(h: &mut SelvaHierarchy) -> Result<()> {
    let dropped = h.dyn_index.top.maintenance();
    for name in dropped {
        let keep = match h.dyn_index.icbs.get(&name) {
            Some(icb) => icb.permanent || icb.pop_count_ave > POP_DISCARD_LIMIT,
            None => continue,
        };
        if keep {
            // popular recently but now cold: drop only the materialized
            // result and keep the control block in the running, so a
            // later sweep can still destroy it
            discard_icb_result(h, &name);
            let score = h.dyn_index.icbs.get(&name).unwrap().score();
            h.dyn_index.top.insert(score, &name);
        } else {
            destroy_icb(h, &name)?;
        }
    }

    let candidates: Vec<Vec<u8>> =
        h.dyn_index.top.iter().map(|(_, name)| name.to_vec()).collect();
    for name in candidates {
        if h.dyn_index.nr_indices >= h.dyn_index.find_indices_max {
            break;
        }
        let promote = match h.dyn_index.icbs.get(&name) {
            Some(icb) => !icb.active,
            None => false,
        };
        if promote {
            activate_icb(h, &name)?;
        }
    }
    Ok(())
}

// Convert a tracked ICB into an index: install the callback marker and
// populate the result through a refresh.
fn activate_icb(h: &mut SelvaHierarchy, name: &[u8]) -> Result<()> {
    let (desc, already) = match h.dyn_index.icbs.get(name) {
        Some(icb) => (icb.desc.clone(), icb.active),
        None => return err_at!(NotFound, msg: "no such icb"),
    };
    if already {
        return Ok(());
    }
    let marker_id = match h.dyn_index.ida.alloc() {
        Some(id) => id,
        None => {
            debug!(target: "selva", "out of index marker ids");
            return Ok(());
        }
    };
    let mut spec =
        MarkerSpec::callback(INDEX_SUB_ID, marker_id, desc.node_id, desc.dir, name.to_vec());
    spec.dir_expression = desc.dir_expression.clone();
    spec.filter = desc.filter.clone();
    subscriptions::add_marker(h, spec)?;
    {
        let icb = h.dyn_index.icbs.get_mut(name).unwrap();
        icb.marker_id = Some(marker_id);
        icb.active = true;
        icb.valid = false;
    }
    h.dyn_index.nr_indices += 1;
    debug!(target: "selva", "activating index {:?}", String::from_utf8_lossy(name));
    refresh_icb(h, name)
}

/// Walk the shape again, repopulating the result; the marker's refresh
/// events fill it in and the ICB turns valid.
pub fn refresh_icb(h: &mut SelvaHierarchy, name: &[u8]) -> Result<()> {
    let marker_id = match h.dyn_index.icbs.get(name) {
        Some(icb) if icb.active => icb.marker_id.unwrap(),
        Some(_) => return err_at!(InvalidInput, msg: "icb not active"),
        None => return err_at!(NotFound, msg: "no such icb"),
    };
    subscriptions::refresh_marker(h, &MarkerKey { sub_id: INDEX_SUB_ID, marker_id })?;
    if let Some(icb) = h.dyn_index.icbs.get_mut(name) {
        icb.valid = true;
    }
    Ok(())
}

// Drop the materialized result but keep tracking the shape.
fn discard_icb_result(h: &mut SelvaHierarchy, name: &[u8]) {
    if let Some(icb) = h.dyn_index.icbs.get_mut(name) {
        icb.res = IcbRes::None;
        icb.valid = false;
        trace!(target: "selva", "discarded result of {:?}", String::from_utf8_lossy(name));
    }
}

/// Destroy an ICB: remove the marker, release its id and forget the
/// shape.
pub fn destroy_icb(h: &mut SelvaHierarchy, name: &[u8]) -> Result<()> {
    let marker_id = match h.dyn_index.icbs.get(name) {
        Some(icb) => icb.marker_id,
        None => return err_at!(NotFound, msg: "no such icb"),
    };
    if let Some(marker_id) = marker_id {
        subscriptions::delete_marker(h, &MarkerKey { sub_id: INDEX_SUB_ID, marker_id }).ok();
        h.dyn_index.ida.release(marker_id);
        h.dyn_index.nr_indices = h.dyn_index.nr_indices.saturating_sub(1);
    }
    h.dyn_index.top.remove(name);
    h.dyn_index.icbs.remove(name);
    Ok(())
}

/// Create a pinned index for a shape and materialize it right away.
/// Used by the `index.new` command.
pub fn create_permanent(h: &mut SelvaHierarchy, desc: IcbDescriptor) -> Result<Vec<u8>> {
    if !dir_indexable(desc.dir) {
        return err_at!(NotSupported, msg: "direction {}", desc.dir.to_token());
    }
    let name = desc.build_name();
    if !h.dyn_index.icbs.contains_key(&name) {
        let icb = Icb {
            name: name.clone(),
            desc,
            marker_id: None,
            res: IcbRes::None,
            pop_count_cur: 0,
            pop_count_ave: 1.0,
            take_max: 0.0,
            take_max_ave: 0.0,
            tot_max: 0.0,
            tot_max_ave: 0.0,
            ind_take_max: 0.0,
            ind_take_max_ave: 0.0,
            hits: 0,
            active: false,
            valid: false,
            permanent: true,
        };
        h.dyn_index.icbs.insert(name.clone(), icb);
    }
    h.dyn_index.icbs.get_mut(&name).unwrap().permanent = true;
    activate_icb(h, &name)?;
    Ok(name)
}

/// List every tracked ICB.
pub fn list(h: &SelvaHierarchy) -> Vec<IcbInfo> {
    h.dyn_index
        .icbs
        .values()
        .map(|icb| IcbInfo {
            name: icb.name.clone(),
            active: icb.active,
            valid: icb.valid,
            ordered: icb.ordered(),
            permanent: icb.permanent,
            pop_count_ave: icb.pop_count_ave,
            take_max_ave: icb.take_max_ave,
            tot_max_ave: icb.tot_max_ave,
            ind_take_max_ave: icb.ind_take_max_ave,
            card: icb.res.len(),
            hits: icb.hits,
        })
        .collect()
}

pub fn info(h: &SelvaHierarchy, name: &[u8]) -> Option<IcbInfo> {
    list(h).into_iter().find(|info| info.name == name)
}

// Marker action entry point; `name` is the action context recorded on
// the callback marker.
pub(crate) fn on_marker_event(
    h: &mut SelvaHierarchy,
    name: &[u8],
    event_flags: u16,
    field: Option<&str>,
    node_id: Option<&NodeId>,
) {
    if !h.dyn_index.icbs.contains_key(name) {
        return;
    }

    if (event_flags & subscriptions::EVENT_REFRESH_BEGIN) != 0 {
        // first step of a refresh pass: initialize the result
        let icb = h.dyn_index.icbs.get_mut(name).unwrap();
        icb.res = if icb.ordered() {
            IcbRes::Ordered(vec![])
        } else {
            IcbRes::Unordered(BTreeSet::new())
        };
        icb.valid = false;
        return;
    }

    if (event_flags & subscriptions::FLAG_REFRESH) != 0 {
        if let Some(node_id) = node_id {
            add_if_match(h, name, node_id);
        }
        return;
    }

    if (event_flags & subscriptions::FLAG_CL_HIERARCHY) != 0 {
        // a node went away under the traversal; the next find rebuilds
        discard_icb_result(h, name);
        return;
    }

    if (event_flags & (subscriptions::FLAG_CH_HIERARCHY | subscriptions::FLAG_CH_FIELD)) != 0 {
        let (valid, ordered, order_field) = {
            let icb = h.dyn_index.icbs.get(name).unwrap();
            let order_field = icb.desc.sort.as_ref().map(|(_, f)| f.clone());
            (icb.valid, icb.ordered(), order_field)
        };
        if !valid {
            return;
        }
        if ordered {
            // in-place reordering is not performed
            if let (Some(field), Some(order_field)) = (field, order_field) {
                if field == order_field {
                    discard_icb_result(h, name);
                    return;
                }
            }
        }
        if let Some(node_id) = node_id {
            add_if_match(h, name, node_id);
        }
    }
}

// Re-test the filter for a touched node and keep the result coherent:
// matching nodes are added, nodes that stopped matching are removed (or
// the ordered result is invalidated).
fn add_if_match(h: &mut SelvaHierarchy, name: &[u8], node_id: &NodeId) {
    let (marker_id, skip, ordered, sort) = {
        let icb = h.dyn_index.icbs.get(name).unwrap();
        let skip = icb.desc.dir.skips_self() && icb.desc.node_id == *node_id;
        (icb.marker_id, skip, icb.ordered(), icb.desc.sort.clone())
    };
    if skip {
        return;
    }
    let matches = match marker_id {
        Some(marker_id) => {
            let key = MarkerKey { sub_id: INDEX_SUB_ID, marker_id };
            let no_filter = h
                .subs
                .marker(&key)
                .map(|m| m.filter.is_none())
                .unwrap_or(false);
            no_filter || subscriptions::filter_match(h, &key, node_id)
        }
        None => false,
    };

    let item = if ordered {
        let order_field = sort.as_ref().map(|(_, f)| f.clone()).unwrap_or_default();
        Some(order::node_order_item(h, node_id, &order_field, &[]))
    } else {
        None
    };

    let icb = h.dyn_index.icbs.get_mut(name).unwrap();
    let stale_ordered = match (&icb.res, matches) {
        (IcbRes::Ordered(items), false) => items.iter().any(|i| i.node_id == *node_id),
        _ => false,
    };
    if stale_ordered {
        // a node left an ordered result; in-place repair is not done
        icb.res = IcbRes::None;
        icb.valid = false;
        return;
    }
    match (&mut icb.res, matches) {
        (IcbRes::Unordered(set), true) => {
            set.insert(*node_id);
        }
        (IcbRes::Unordered(set), false) => {
            set.remove(node_id);
        }
        (IcbRes::Ordered(items), true) => {
            if !items.iter().any(|i| i.node_id == *node_id) {
                let item = item.unwrap();
                let (order, _) = sort.unwrap();
                let pos = items
                    .binary_search_by(|probe| {
                        let c = order::cmp_items(probe, &item);
                        if order == ResultOrder::Desc {
                            c.reverse()
                        } else {
                            c
                        }
                    })
                    .unwrap_or_else(|pos| pos);
                items.insert(pos, item);
            }
        }
        _ => (),
    }
}
