//! The `hierarchy.find` command.

use std::collections::BTreeSet;

use crate::{
    find_index::{self, IcbDescriptor},
    hierarchy::{
        order::{self, ResultOrder},
        traversal::{self, TraversalCallback},
        SelvaHierarchy,
    },
    object::{ObjArray, SelvaObject, ValueView},
    proto::Value,
    rpn::{self, RpnCtx},
    set::SetValue,
    types::{
        NodeId, ANCESTORS_FIELD, CHILDREN_FIELD, DESCENDANTS_FIELD, ID_FIELD, PARENTS_FIELD,
        TYPE_FIELD,
    },
    Result,
};

use super::{ArgCursor, MergeStrategy, QueryOpts};

pub fn cmd_find(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let opts = super::parse_query_opts(&mut cursor, true)?;
    run_find(h, &opts)
}

fn eval_main_filter(h: &SelvaHierarchy, opts: &QueryOpts, id: &NodeId) -> bool {
    match &opts.filter {
        None => true,
        Some((expr, _)) => {
            let mut ctx = RpnCtx::new(1);
            for (i, v) in opts.filter_regs.iter() {
                ctx.set_reg(*i, v.clone());
            }
            rpn::rpn_bool(h, &mut ctx, expr, Some(id)).unwrap_or(false)
        }
    }
}

// Matched node ids of one starting node, in visit order.
struct Matched {
    ids: Vec<NodeId>,
    ordered_by_index: bool,
}

fn collect_matches(
    h: &mut SelvaHierarchy,
    opts: &QueryOpts,
    start: &NodeId,
    stop_at: Option<usize>,
) -> Result<Matched> {
    // consult the index cache when the query carries hints
    let mut names = vec![];
    if !opts.index_hints.is_empty() {
        let descs: Vec<IcbDescriptor> = opts
            .index_hints
            .iter()
            .map(|hint| IcbDescriptor {
                node_id: *start,
                dir: opts.dir,
                dir_expression: opts.dir_expression.as_ref().map(|(_, src)| src.clone()),
                sort: opts.order_field.as_ref().map(|f| (opts.order, f.clone())),
                filter: Some(hint.clone()),
            })
            .collect();
        names = find_index::auto_multi(h, descs);
    }
    let want_sort = opts.order_field.as_ref().map(|f| (opts.order, f.as_str()));
    let mut selected = find_index::select_icb(h, &names, want_sort);
    // iterating an index changes which nodes a bare limit would pick
    // relative to the unindexed traversal order
    if opts.limit.is_some() && opts.order == ResultOrder::None {
        selected = None;
    }

    if let Some((name, order_ok)) = selected {
        // the traversal is replaced by iterating the materialized result
        let indexed = find_index::indexed_result(h, &name).unwrap_or_default();
        let mut ids = vec![];
        let mut acc_tot = 0;
        for id in indexed {
            acc_tot += 1;
            if eval_main_filter(h, opts, &id) {
                ids.push(id);
            }
        }
        let take = ids.len();
        find_index::acc_update(h, &names, Some(name.as_slice()), take, acc_tot, true);
        return Ok(Matched { ids, ordered_by_index: order_ok });
    }

    let mut ids: Vec<NodeId> = Vec::with_capacity(h.config().hierarchy_expected_resp_len);
    let mut acc_tot = 0_usize;
    let skip_self = opts.dir.skips_self();
    let mut first = true;
    {
        let mut node_cb = |h: &mut SelvaHierarchy, id: &NodeId| -> Result<bool> {
            if skip_self && first {
                first = false;
                return Ok(false);
            }
            first = false;
            acc_tot += 1;
            if eval_main_filter(h, opts, id) {
                ids.push(*id);
                if let Some(stop_at) = stop_at {
                    if ids.len() >= stop_at {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        };
        let mut cb =
            TraversalCallback { head_cb: None, node_cb: Some(&mut node_cb), child_cb: None };
        traversal::traverse(
            h,
            start,
            opts.dir,
            opts.ref_field.as_deref(),
            opts.dir_expression.as_ref().map(|(expr, _)| expr),
            opts.edge_filter.as_ref(),
            &mut cb,
        )?;
    }
    let take = ids.len();
    find_index::acc_update(h, &names, None, take, acc_tot, false);
    Ok(Matched { ids, ordered_by_index: false })
}

/// Matched ids across all starting nodes, ordered and windowed to
/// `[offset, offset+limit)`.
pub(crate) fn matched_ids(h: &mut SelvaHierarchy, opts: &QueryOpts) -> Result<Vec<NodeId>> {
    let needs_sort = opts.order != ResultOrder::None && opts.order_field.is_some();
    // short-circuit is only sound for plain unsorted single-start finds
    let stop_at = match (&opts.limit, needs_sort, opts.node_ids.len()) {
        (Some(limit), false, 1) => Some(opts.offset + limit),
        _ => None,
    };

    let mut all: Vec<NodeId> = vec![];
    let mut seen: BTreeSet<NodeId> = BTreeSet::new();
    let mut sorted_by_index = needs_sort;
    for start in opts.node_ids.iter() {
        let matched = match collect_matches(h, opts, start, stop_at) {
            Ok(matched) => matched,
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        };
        if needs_sort && !matched.ordered_by_index {
            sorted_by_index = false;
        }
        for id in matched.ids {
            if seen.insert(id) {
                all.push(id);
            }
        }
    }

    if needs_sort && !(sorted_by_index && opts.node_ids.len() == 1) {
        let order_field = opts.order_field.as_deref().unwrap();
        let langs = opts.langs();
        let mut items: Vec<order::OrderItem> = all
            .iter()
            .map(|id| order::node_order_item(h, id, order_field, &langs))
            .collect();
        order::sort_items(&mut items, opts.order);
        all = items.into_iter().map(|item| item.node_id).collect();
    }

    let end = match opts.limit {
        Some(limit) => (opts.offset + limit).min(all.len()),
        None => all.len(),
    };
    let start = opts.offset.min(end);
    Ok(all[start..end].to_vec())
}

fn run_find(h: &mut SelvaHierarchy, opts: &QueryOpts) -> Result<Vec<Value>> {
    use crate::hierarchy::traversal::TraversalDir;

    if matches!(opts.dir, TraversalDir::Array | TraversalDir::Set) {
        return Ok(vec![object_results(h, opts)?]);
    }

    let ids = matched_ids(h, opts)?;
    let langs = opts.langs();

    if opts.merge != MergeStrategy::None {
        let merged = merged_reply(h, &ids, opts, &langs)?;
        return Ok(vec![merged]);
    }

    let mut out = vec![];
    for id in ids {
        if let Some(fields) = &opts.fields {
            out.push(node_fields_reply(h, &id, fields, &langs, &opts.inherit));
        } else if let Some(expr) = &opts.fields_expression {
            let mut ctx = RpnCtx::new(1);
            let set = rpn::rpn_selvaset(h, &mut ctx, expr, Some(&id)).unwrap_or_default();
            let fields: Vec<String> =
                set.iter().map(|f| String::from_utf8_lossy(f).to_string()).collect();
            out.push(node_fields_reply(h, &id, &fields, &langs, &opts.inherit));
        } else {
            out.push(Value::str(&id.to_string()));
        }
    }
    Ok(vec![Value::Array(out)])
}

// Result of an array or set field traversal: the field's values
// rendered directly, windowed to `[offset, offset+limit)`.
fn object_results(h: &SelvaHierarchy, opts: &QueryOpts) -> Result<Value> {
    let field = match &opts.ref_field {
        Some(field) => field,
        None => return err_at!(InvalidInput, msg: "{} needs a field", opts.dir.to_token()),
    };
    let langs = opts.langs();
    let mut out = vec![];
    for start in opts.node_ids.iter() {
        let node = match h.node(start) {
            Some(node) => node,
            None => continue,
        };
        match node.obj().get_any_lang(field, &langs) {
            Ok(view @ ValueView::Array(_)) | Ok(view @ ValueView::Set(_)) => {
                match view_to_value(&view, &langs) {
                    Value::Array(values) => out.extend(values),
                    value => out.push(value),
                }
            }
            _ => (),
        }
    }
    let end = match opts.limit {
        Some(limit) => (opts.offset + limit).min(out.len()),
        None => out.len(),
    };
    let start = opts.offset.min(end);
    Ok(Value::Array(out[start..end].to_vec()))
}

// One `[id, [[name, value], ...]]` node reply.
fn node_fields_reply(
    h: &SelvaHierarchy,
    id: &NodeId,
    fields: &[String],
    langs: &[&str],
    inherit: &[String],
) -> Value {
    let mut pairs = vec![];
    let mut emit = |name: &str, value: Value| {
        pairs.push(Value::Array(vec![Value::str(name), value]));
    };
    for field in fields {
        if field == "*" {
            if let Some(node) = h.node(id) {
                for key in node.obj().iter_keys() {
                    let name = key.name().to_string();
                    if let Some(value) = field_value(h, id, &name, langs) {
                        emit(&name, value);
                    }
                }
            }
            continue;
        }
        match field_value(h, id, field, langs) {
            Some(value) => emit(field, value),
            None if inherit.iter().any(|f| f == field) => {
                if let Some(value) = inherited_value(h, id, field, langs) {
                    emit(field, value);
                }
            }
            None => (),
        }
    }
    Value::Array(vec![Value::str(&id.to_string()), Value::Array(pairs)])
}

// Inherit a missing field from the nearest ancestor carrying it.
fn inherited_value(h: &SelvaHierarchy, id: &NodeId, field: &str, langs: &[&str]) -> Option<Value> {
    for ancestor in
        traversal::collect_ids(h, id, crate::hierarchy::traversal::TraversalDir::BfsAncestors)
    {
        if let Some(value) = field_value(h, &ancestor, field, langs) {
            return Some(value);
        }
    }
    None
}

/// Value of one node field as a reply value; hierarchy fields resolve
/// to id arrays.
pub(crate) fn field_value(
    h: &SelvaHierarchy,
    id: &NodeId,
    field: &str,
    langs: &[&str],
) -> Option<Value> {
    match field {
        ID_FIELD => return Some(Value::str(&id.to_string())),
        TYPE_FIELD => return Some(Value::str(&id.node_type().to_string())),
        PARENTS_FIELD | CHILDREN_FIELD | ANCESTORS_FIELD | DESCENDANTS_FIELD => {
            let dir = match field {
                PARENTS_FIELD => crate::hierarchy::traversal::TraversalDir::Parents,
                CHILDREN_FIELD => crate::hierarchy::traversal::TraversalDir::Children,
                ANCESTORS_FIELD => crate::hierarchy::traversal::TraversalDir::BfsAncestors,
                _ => crate::hierarchy::traversal::TraversalDir::BfsDescendants,
            };
            let ids: Vec<Value> = traversal::collect_ids(h, id, dir)
                .iter()
                .map(|id| Value::str(&id.to_string()))
                .collect();
            return Some(Value::Array(ids));
        }
        // `aliases` and everything else reads from the node object
        _ => (),
    }
    let node = h.node(id)?;
    let view = node.obj().get_any_lang(field, langs).ok()?;
    Some(view_to_value(&view, langs))
}

/// Render an object value view as a reply value.
pub(crate) fn view_to_value(view: &ValueView, langs: &[&str]) -> Value {
    match view {
        ValueView::Null => Value::Null,
        ValueView::Double(v) => Value::Double(*v),
        ValueView::LongLong(v) => Value::LongLong(*v),
        ValueView::Str(s) => Value::bytes(s.as_bytes()),
        ValueView::Object(o) => obj_to_pairs(o, langs),
        ValueView::Set(set) => {
            let values: Vec<Value> = set
                .iter()
                .map(|v| match v {
                    SetValue::Str(s) => Value::bytes(s.as_bytes()),
                    SetValue::Double(d) => Value::Double(d),
                    SetValue::LongLong(v) => Value::LongLong(v),
                    SetValue::NodeId(id) => Value::str(&id.to_string()),
                })
                .collect();
            Value::Array(values)
        }
        ValueView::Array(arr) => {
            let values: Vec<Value> = match arr {
                ObjArray::Double(v) => v.iter().map(|x| Value::Double(*x)).collect(),
                ObjArray::LongLong(v) => v.iter().map(|x| Value::LongLong(*x)).collect(),
                ObjArray::Str(v) => v.iter().map(|x| Value::bytes(x.as_bytes())).collect(),
                ObjArray::Object(v) => v.iter().map(|o| obj_to_pairs(o, langs)).collect(),
                ObjArray::Hll(v) => {
                    v.iter().map(|x| Value::LongLong(x.count() as i64)).collect()
                }
                ObjArray::Pointer(_) => vec![],
            };
            Value::Array(values)
        }
        // hll fields reply with their cardinality
        ValueView::Hll(hll) => Value::LongLong(hll.count() as i64),
        // pointers reply only through their reply hook
        ValueView::Pointer(p) => p.reply(),
    }
}

/// Render a whole object as `[[name, value], ...]`.
pub(crate) fn obj_to_pairs(obj: &SelvaObject, langs: &[&str]) -> Value {
    let mut pairs = vec![];
    for key in obj.iter_keys() {
        if let Ok(view) = obj.get_any_lang(key.name(), langs) {
            pairs.push(Value::Array(vec![
                Value::str(key.name()),
                view_to_value(&view, langs),
            ]));
        }
    }
    Value::Array(pairs)
}

// Merge the objects of the result nodes into one reply object.
fn merged_reply(
    h: &SelvaHierarchy,
    ids: &[NodeId],
    opts: &QueryOpts,
    langs: &[&str],
) -> Result<Value> {
    let path = opts.merge_path.as_deref().unwrap_or("");
    let mut out = SelvaObject::new();
    for id in ids {
        let node = match h.node(id) {
            Some(node) => node,
            None => continue,
        };
        let src: &SelvaObject = if path.is_empty() {
            node.obj()
        } else {
            match node.obj().get_object(path) {
                Ok(obj) => obj,
                Err(_) => continue,
            }
        };
        match opts.merge {
            MergeStrategy::All => merge_flat(&mut out, src, None),
            MergeStrategy::Named => {
                merge_flat(&mut out, src, opts.fields.as_deref())
            }
            MergeStrategy::Deep => merge_deep(&mut out, src),
            MergeStrategy::None => (),
        }
    }
    Ok(obj_to_pairs(&out, langs))
}

// First node wins on conflicting keys.
fn merge_flat(dst: &mut SelvaObject, src: &SelvaObject, fields: Option<&[String]>) {
    for key in src.iter_keys() {
        if let Some(fields) = fields {
            if !fields.iter().any(|f| f == key.name()) {
                continue;
            }
        }
        if !dst.exists(key.name()) {
            dst.insert_key_raw(key.name().to_string(), key.meta(), key.value().clone());
        }
    }
}

fn merge_deep(dst: &mut SelvaObject, src: &SelvaObject) {
    for key in src.iter_keys() {
        match (dst.get_object_mut(key.name()), key.value()) {
            (Ok(dst_obj), crate::object::Value::Object(src_obj)) => {
                merge_deep(dst_obj, src_obj);
            }
            _ => {
                if !dst.exists(key.name()) {
                    dst.insert_key_raw(key.name().to_string(), key.meta(), key.value().clone());
                }
            }
        }
    }
}
