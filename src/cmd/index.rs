//! The `index.*` commands.

use crate::{
    find_index::{self, IcbDescriptor},
    hierarchy::{order::ResultOrder, traversal::TraversalDir, SelvaHierarchy},
    proto::Value,
    types::NodeId,
    Result,
};

use super::ArgCursor;

fn info_reply(info: &find_index::IcbInfo) -> Value {
    Value::Array(vec![
        Value::bytes(&info.name),
        Value::LongLong(info.active as i64),
        Value::LongLong(info.valid as i64),
        Value::LongLong(info.ordered as i64),
        Value::LongLong(info.permanent as i64),
        Value::LongLong(info.card as i64),
        Value::LongLong(info.hits as i64),
        Value::Double(info.pop_count_ave as f64),
        Value::Double(info.take_max_ave as f64),
        Value::Double(info.tot_max_ave as f64),
        Value::Double(info.ind_take_max_ave as f64),
    ])
}

/// `index.list`: one row per tracked ICB.
pub fn cmd_list(h: &mut SelvaHierarchy, _args: &[Value]) -> Result<Vec<Value>> {
    let rows: Vec<Value> = find_index::list(h).iter().map(info_reply).collect();
    Ok(vec![Value::Array(rows)])
}

/// `index.new dir [expression] [order field ord] node_id filter`: pin a
/// permanent index for the given shape.
pub fn cmd_new(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let dir = TraversalDir::from_token(cursor.next_str()?)?;
    let dir_expression = if dir.needs_expression() {
        Some(cursor.next_str()?.to_string())
    } else {
        None
    };
    let mut sort = None;
    if cursor.accept("order") {
        let field = cursor.next_str()?.to_string();
        let order = ResultOrder::from_token(cursor.next_str()?)?;
        if order != ResultOrder::None {
            sort = Some((order, field));
        }
    }
    let node_id = NodeId::new(&cursor.next_data()?);
    let filter = cursor.next_str()?.to_string();

    let desc = IcbDescriptor { node_id, dir, dir_expression, sort, filter: Some(filter) };
    let name = find_index::create_permanent(h, desc)?;
    Ok(vec![Value::bytes(&name)])
}

/// `index.del name`.
pub fn cmd_del(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let name = cursor.next_data()?;
    find_index::destroy_icb(h, &name)?;
    Ok(vec![Value::LongLong(1)])
}

/// `index.debug name`: the list row of one ICB.
pub fn cmd_debug(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let name = cursor.next_data()?;
    match find_index::info(h, &name) {
        Some(info) => Ok(vec![info_reply(&info)]),
        None => err_at!(NotFound, msg: "no such index"),
    }
}

/// `index.info`: tracked and active counts.
pub fn cmd_info(h: &mut SelvaHierarchy, _args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![Value::Array(vec![
        Value::LongLong(h.dyn_index.icb_count() as i64),
        Value::LongLong(h.dyn_index.nr_indices() as i64),
    ])])
}
