//! The `update` and `hierarchy.del` commands.

use crate::{
    hierarchy::{DelNodeFlags, SelvaHierarchy},
    proto::Value,
    sstring::SelvaString,
    subscriptions,
    types::{self, NodeId, TriggerType},
    Result,
};

use super::{find, ArgCursor, QueryOpts};

// One parsed update operation.
#[derive(Clone, Debug)]
enum UpdateOp {
    /// Add a string to a string set field.
    Set { field: String, value: Vec<u8> },
    IncrementI64 { field: String, incr: i64 },
    IncrementF64 { field: String, incr: f64 },
    Str { field: String, value: Vec<u8> },
    I64 { field: String, value: i64 },
    F64 { field: String, value: f64 },
    DefaultStr { field: String, value: Vec<u8> },
    DefaultI64 { field: String, value: i64 },
    DefaultF64 { field: String, value: f64 },
    Del { field: String },
    ObjMeta { field: String, meta: u32 },
    ArrayRemove { field: String, index: isize },
}

impl UpdateOp {
    fn field(&self) -> &str {
        match self {
            UpdateOp::Set { field, .. }
            | UpdateOp::IncrementI64 { field, .. }
            | UpdateOp::IncrementF64 { field, .. }
            | UpdateOp::Str { field, .. }
            | UpdateOp::I64 { field, .. }
            | UpdateOp::F64 { field, .. }
            | UpdateOp::DefaultStr { field, .. }
            | UpdateOp::DefaultI64 { field, .. }
            | UpdateOp::DefaultF64 { field, .. }
            | UpdateOp::Del { field }
            | UpdateOp::ObjMeta { field, .. }
            | UpdateOp::ArrayRemove { field, .. } => field,
        }
    }
}

fn parse_ops(cursor: &mut ArgCursor) -> Result<Vec<UpdateOp>> {
    let nr_ops = cursor.next_ll()?;
    if nr_ops < 0 {
        return err_at!(InvalidInput, msg: "nr_ops {}", nr_ops);
    }
    let mut ops = vec![];
    for _ in 0..nr_ops {
        let op_code = cursor.next_str()?.to_string();
        let field = cursor.next_str()?.to_string();
        let op = match op_code.as_str() {
            "set" => UpdateOp::Set { field, value: cursor.next_data()? },
            "increment_i64" => UpdateOp::IncrementI64 { field, incr: cursor.next_ll()? },
            "increment_f64" => {
                UpdateOp::IncrementF64 { field, incr: cursor.next()?.to_double()? }
            }
            "string" => UpdateOp::Str { field, value: cursor.next_data()? },
            "i64" => UpdateOp::I64 { field, value: cursor.next_ll()? },
            "f64" => UpdateOp::F64 { field, value: cursor.next()?.to_double()? },
            "default_string" => UpdateOp::DefaultStr { field, value: cursor.next_data()? },
            "default_i64" => UpdateOp::DefaultI64 { field, value: cursor.next_ll()? },
            "default_f64" => UpdateOp::DefaultF64 { field, value: cursor.next()?.to_double()? },
            "del" => UpdateOp::Del { field },
            "obj_meta" => UpdateOp::ObjMeta { field, meta: cursor.next_ll()? as u32 },
            "array_remove" => {
                UpdateOp::ArrayRemove { field, index: cursor.next_ll()? as isize }
            }
            code => return err_at!(InvalidInput, msg: "update op {:?}", code),
        };
        ops.push(op);
    }
    Ok(ops)
}

// Apply one op to a node object; Ok(true) means the field changed.
fn apply_op(h: &mut SelvaHierarchy, id: &NodeId, op: &UpdateOp) -> Result<bool> {
    // set members repeat a lot across nodes, share one interned copy
    let interned = match op {
        UpdateOp::Set { value, .. } => Some(h.intern_string(value)?),
        _ => None,
    };
    let obj = match h.node_mut(id) {
        Some(node) => node.obj_mut(),
        None => return err_at!(NotFound, msg: "node {}", id),
    };
    let changed = match op {
        UpdateOp::Set { field, .. } => {
            match obj.add_set_str(field, (*interned.unwrap()).clone()) {
                Ok(()) => true,
                Err(err) if err.is_exists() => false,
                Err(err) => return Err(err),
            }
        }
        UpdateOp::IncrementI64 { field, incr } => {
            obj.increment_long_long(field, 0, *incr)?;
            true
        }
        UpdateOp::IncrementF64 { field, incr } => {
            obj.increment_double(field, 0.0, *incr)?;
            true
        }
        UpdateOp::Str { field, value } => {
            match obj.update_str(field, SelvaString::from_bytes(value)) {
                Ok(()) => true,
                Err(err) if err.is_exists() => false,
                Err(err) => return Err(err),
            }
        }
        UpdateOp::I64 { field, value } => match obj.update_long_long(field, *value) {
            Ok(()) => true,
            Err(err) if err.is_exists() => false,
            Err(err) => return Err(err),
        },
        UpdateOp::F64 { field, value } => match obj.update_double(field, *value) {
            Ok(()) => true,
            Err(err) if err.is_exists() => false,
            Err(err) => return Err(err),
        },
        UpdateOp::DefaultStr { field, value } => {
            let missing = !obj.exists(field);
            if missing {
                obj.set_str_default(field, SelvaString::from_bytes(value))?;
            }
            missing
        }
        UpdateOp::DefaultI64 { field, value } => {
            let missing = !obj.exists(field);
            if missing {
                obj.set_long_long_default(field, *value)?;
            }
            missing
        }
        UpdateOp::DefaultF64 { field, value } => {
            let missing = !obj.exists(field);
            if missing {
                obj.set_double_default(field, *value)?;
            }
            missing
        }
        UpdateOp::Del { field } => match obj.del_key(field) {
            Ok(()) => true,
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(err),
        },
        UpdateOp::ObjMeta { field, meta } => {
            let old = obj.set_user_meta(field, *meta)?;
            old != *meta
        }
        UpdateOp::ArrayRemove { field, index } => match obj.remove_array_index(field, *index) {
            Ok(()) => true,
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(err),
        },
    };
    Ok(changed)
}

/// `update dir [ref_field|expr] [edge_filter e] nr_ops (op field value)*
/// node_ids [filter_expr args...]`: apply the ops to every matched node.
/// Replies with the number of updated nodes.
pub fn cmd_update(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);

    // re-use the query grammar without the response shaping clauses
    let dir = crate::hierarchy::traversal::TraversalDir::from_token(cursor.next_str()?)?;
    let mut opts = QueryOpts {
        lang: String::new(),
        dir,
        ref_field: None,
        dir_expression: None,
        edge_filter: None,
        index_hints: vec![],
        order: crate::hierarchy::order::ResultOrder::None,
        order_field: None,
        offset: 0,
        limit: None,
        merge: super::MergeStrategy::None,
        merge_path: None,
        fields: None,
        fields_expression: None,
        inherit: vec![],
        node_ids: vec![],
        filter: None,
        filter_regs: vec![],
    };
    if dir.needs_field() {
        opts.ref_field = Some(cursor.next_str()?.to_string());
    } else if dir.needs_expression() {
        let src = cursor.next_str()?.to_string();
        opts.dir_expression = Some((crate::rpn::RpnExpression::compile(&src)?, src));
    }
    if cursor.accept("edge_filter") {
        opts.edge_filter = Some(crate::rpn::RpnExpression::compile(cursor.next_str()?)?);
    }

    let ops = parse_ops(&mut cursor)?;
    opts.node_ids = types::node_ids_from_arg(&cursor.next_data()?)?;
    if !cursor.is_done() {
        let src = cursor.next_str()?.to_string();
        opts.filter = Some((crate::rpn::RpnExpression::compile(&src)?, src));
        let mut reg = 1;
        while !cursor.is_done() {
            let value = match cursor.next()? {
                Value::LongLong(v) => crate::rpn::RpnValue::Num(*v as f64),
                Value::Double(v) => crate::rpn::RpnValue::Num(*v),
                v => crate::rpn::RpnValue::Str(v.to_data()?),
            };
            opts.filter_regs.push((reg, value));
            reg += 1;
        }
    }

    let ids = find::matched_ids(h, &opts)?;
    let mut updated = 0_i64;
    for id in ids {
        subscriptions::field_change_precheck(h, &id);
        let mut node_changed = false;
        for op in ops.iter() {
            let changed = apply_op(h, &id, op)?;
            if changed {
                node_changed = true;
                subscriptions::defer_field_change_events(h, &id, op.field());
            }
        }
        if node_changed {
            subscriptions::defer_trigger_events(h, &id, TriggerType::Updated);
            updated += 1;
        }
    }
    Ok(vec![Value::LongLong(updated)])
}

/// `hierarchy.del [force] [detach] [reply_ids] node_ids`: delete nodes,
/// optionally recursing and detaching. Replies with the deleted count
/// and, when asked, the deleted ids.
pub fn cmd_del_node(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let mut flags = DelNodeFlags::default();
    loop {
        if cursor.accept("force") {
            flags.force = true;
        } else if cursor.accept("detach") {
            flags.detach = true;
        } else if cursor.accept("reply_ids") {
            flags.reply_ids = true;
        } else {
            break;
        }
    }
    let node_ids = types::node_ids_from_arg(&cursor.next_data()?)?;

    let mut total = 0_i64;
    let mut all_ids = vec![];
    for id in node_ids {
        match h.del_node(&id, flags) {
            Ok((count, ids)) => {
                total += count as i64;
                all_ids.extend(ids);
            }
            Err(err) if err.is_not_found() => (),
            Err(err) => return Err(err),
        }
    }
    let mut reply = vec![Value::LongLong(total)];
    if flags.reply_ids {
        reply.push(Value::Array(
            all_ids.iter().map(|id| Value::str(&id.to_string())).collect(),
        ));
    }
    Ok(reply)
}
