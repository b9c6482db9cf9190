//! The `subscriptions.*` commands.

use crate::{
    hierarchy::{traversal::TraversalDir, SelvaHierarchy},
    proto::Value,
    rpn::RpnValue,
    subscriptions::{self, MarkerKey, MarkerSpec},
    types::{self, sub_id_from_hex, sub_id_to_hex, NodeId, TriggerType},
    Result,
};

use super::ArgCursor;

fn ok_reply() -> Vec<Value> {
    vec![Value::LongLong(1)]
}

// Trailing `[ "fields" list ] [ "filter" expr args... ]` clauses shared
// by the marker creating commands.
fn parse_marker_tail(cursor: &mut ArgCursor, spec: &mut MarkerSpec) -> Result<()> {
    if cursor.accept("fields") {
        spec.fields = Some(cursor.next_str()?.to_string());
    }
    if cursor.accept("filter") {
        spec.filter = Some(cursor.next_str()?.to_string());
        let mut reg = 1;
        while !cursor.is_done() {
            let value = match cursor.next()? {
                Value::LongLong(v) => RpnValue::Num(*v as f64),
                Value::Double(v) => RpnValue::Num(*v),
                v => RpnValue::Str(v.to_data()?),
            };
            spec.filter_regs.push((reg, value));
            reg += 1;
        }
    }
    Ok(())
}

/// `subscriptions.add sub_id marker_id dir [field|expr] node_id
/// [fields list] [filter expr args...]`.
pub fn cmd_add(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let sub_id = sub_id_from_hex(cursor.next_str()?)?;
    let marker_id = cursor.next_ll()?;
    let dir = TraversalDir::from_token(cursor.next_str()?)?;

    let mut spec = MarkerSpec::generic(sub_id, marker_id, NodeId::empty(), dir);
    if dir.needs_field() {
        spec.ref_field = Some(cursor.next_str()?.to_string());
    } else if dir.needs_expression() {
        spec.dir_expression = Some(cursor.next_str()?.to_string());
    }
    spec.node_id = NodeId::new(&cursor.next_data()?);
    parse_marker_tail(&mut cursor, &mut spec)?;

    subscriptions::add_marker(h, spec)?;
    subscriptions::refresh_marker(h, &MarkerKey { sub_id, marker_id })?;
    Ok(ok_reply())
}

/// `subscriptions.addAlias sub_id marker_id alias`: marker that fires
/// once when the alias moves or dies.
pub fn cmd_add_alias(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let sub_id = sub_id_from_hex(cursor.next_str()?)?;
    let marker_id = cursor.next_ll()?;
    let alias = cursor.next_str()?;

    let node_id = match h.get_alias(alias) {
        Some(node_id) => node_id,
        None => return err_at!(NotFound, msg: "alias {:?}", alias),
    };
    let spec = MarkerSpec::alias(sub_id, marker_id, alias, node_id);
    subscriptions::add_marker(h, spec)?;
    subscriptions::refresh_marker(h, &MarkerKey { sub_id, marker_id })?;
    Ok(ok_reply())
}

/// `subscriptions.addMissing sub_id accessor...`: fire when a node id or
/// alias springs into existence.
pub fn cmd_add_missing(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let sub_id = sub_id_from_hex(cursor.next_str()?)?;
    if cursor.is_done() {
        return err_at!(InvalidInput, msg: "no accessors");
    }
    while !cursor.is_done() {
        let accessor = cursor.next_str()?;
        subscriptions::add_missing(h, sub_id, accessor);
    }
    Ok(ok_reply())
}

/// `subscriptions.addTrigger sub_id marker_id event_type [filter ...]`.
pub fn cmd_add_trigger(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let sub_id = sub_id_from_hex(cursor.next_str()?)?;
    let marker_id = cursor.next_ll()?;
    let event_type = match cursor.next_str()? {
        "created" => TriggerType::Created,
        "updated" => TriggerType::Updated,
        "deleted" => TriggerType::Deleted,
        token => return err_at!(InvalidInput, msg: "trigger type {:?}", token),
    };

    let mut spec = MarkerSpec::trigger(sub_id, marker_id, event_type);
    parse_marker_tail(&mut cursor, &mut spec)?;
    subscriptions::add_marker(h, spec)?;
    subscriptions::refresh_marker(h, &MarkerKey { sub_id, marker_id })?;
    Ok(ok_reply())
}

/// `subscriptions.refresh sub_id`.
pub fn cmd_refresh(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let sub_id = sub_id_from_hex(cursor.next_str()?)?;
    subscriptions::refresh_subscription(h, &sub_id)?;
    Ok(ok_reply())
}

/// `subscriptions.list`: subscription ids in hex.
pub fn cmd_list(h: &mut SelvaHierarchy, _args: &[Value]) -> Result<Vec<Value>> {
    let subs: Vec<Value> =
        h.subs.subs.keys().map(|sub_id| Value::str(&sub_id_to_hex(sub_id))).collect();
    Ok(vec![Value::Array(subs)])
}

/// `subscriptions.listMissing`: `[accessor, [sub_id...]]` pairs.
pub fn cmd_list_missing(h: &mut SelvaHierarchy, _args: &[Value]) -> Result<Vec<Value>> {
    let entries: Vec<Value> = h
        .subs
        .missing_entries()
        .into_iter()
        .map(|(accessor, subs)| {
            let subs: Vec<Value> =
                subs.iter().map(|sub_id| Value::str(&sub_id_to_hex(sub_id))).collect();
            Value::Array(vec![Value::str(&accessor), Value::Array(subs)])
        })
        .collect();
    Ok(vec![Value::Array(entries)])
}

/// `subscriptions.debug sub_id`: marker descriptions.
pub fn cmd_debug(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let sub_id = sub_id_from_hex(cursor.next_str()?)?;
    let marker_ids: Vec<types::MarkerId> = match h.subs.subscription(&sub_id) {
        Some(sub) => sub.markers.iter().cloned().collect(),
        None => return err_at!(NotFound, msg: "no such subscription"),
    };
    let mut out = vec![];
    for marker_id in marker_ids {
        if let Some(m) = h.subs.marker(&MarkerKey { sub_id, marker_id }) {
            out.push(Value::str(&format!(
                "marker_id:{} flags:{:#06x} node_id:{} dir:{} filter:{}",
                marker_id,
                m.flags,
                m.node_id,
                m.dir.to_token(),
                m.filter.as_ref().map(|f| f.source()).unwrap_or("none"),
            )));
        }
    }
    Ok(vec![Value::Array(out)])
}

/// `subscriptions.del sub_id`.
pub fn cmd_del(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let sub_id = sub_id_from_hex(cursor.next_str()?)?;
    subscriptions::delete_subscription(h, &sub_id)?;
    Ok(ok_reply())
}

/// `subscriptions.delMarker sub_id marker_id`.
pub fn cmd_del_marker(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let sub_id = sub_id_from_hex(cursor.next_str()?)?;
    let marker_id = cursor.next_ll()?;
    subscriptions::delete_marker(h, &MarkerKey { sub_id, marker_id })?;
    Ok(ok_reply())
}
