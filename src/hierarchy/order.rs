//! Result ordering for traversals.
//!
//! Sorted commands collect [OrderItem]s carrying a pre-computed
//! collation key: a case-folded byte transform for text, the double
//! value for numbers. Ties break on the node id.

use std::cmp::Ordering;

use crate::{
    hierarchy::SelvaHierarchy,
    object::ValueView,
    types::NodeId,
    Result,
};

/// Traversal result order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResultOrder {
    None,
    Asc,
    Desc,
}

impl ResultOrder {
    pub fn from_token(token: &str) -> Result<ResultOrder> {
        match token {
            "none" => Ok(ResultOrder::None),
            "asc" => Ok(ResultOrder::Asc),
            "desc" => Ok(ResultOrder::Desc),
            _ => err_at!(InvalidInput, msg: "order {:?}", token),
        }
    }

    pub fn to_token(&self) -> &'static str {
        match self {
            ResultOrder::None => "none",
            ResultOrder::Asc => "asc",
            ResultOrder::Desc => "desc",
        }
    }
}

/// Sort key of one ordered item.
#[derive(Clone, Debug, PartialEq)]
pub enum OrderKey {
    /// The order field was missing on the node; empties sort first.
    Empty,
    Double(f64),
    Text(Vec<u8>),
}

impl OrderKey {
    fn rank(&self) -> u8 {
        match self {
            OrderKey::Empty => 0,
            OrderKey::Text(_) => 1,
            OrderKey::Double(_) => 2,
        }
    }
}

/// One ordered result carrying an opaque payload; nodes use `()`,
/// object results an index into a side table.
#[derive(Clone, Debug)]
pub struct OrderItem<P = ()> {
    pub key: OrderKey,
    pub node_id: NodeId,
    pub payload: P,
}

/// Ascending comparison of two items; type rank first, then value, node
/// id as the tie break.
pub fn cmp_items<A, B>(a: &OrderItem<A>, b: &OrderItem<B>) -> Ordering {
    let by_key = match (&a.key, &b.key) {
        (OrderKey::Double(x), OrderKey::Double(y)) => x.total_cmp(y),
        (OrderKey::Text(x), OrderKey::Text(y)) => x.cmp(y),
        (x, y) => x.rank().cmp(&y.rank()),
    };
    by_key.then_with(|| a.node_id.cmp(&b.node_id))
}

/// Sort items into the requested order.
pub fn sort_items<P>(items: &mut [OrderItem<P>], order: ResultOrder) {
    match order {
        ResultOrder::None => (),
        ResultOrder::Asc => items.sort_by(|a, b| cmp_items(a, b)),
        ResultOrder::Desc => items.sort_by(|a, b| cmp_items(b, a)),
    }
}

// Case-folded collation transform for text keys. This stands in for the
// locale transform of the lang table, which lives outside the core.
fn text_key(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b.to_ascii_lowercase()).collect()
}

/// Order key from a value view.
pub fn key_for_view(view: Option<ValueView>) -> OrderKey {
    match view {
        Some(ValueView::Double(v)) => OrderKey::Double(v),
        Some(ValueView::LongLong(v)) => OrderKey::Double(v as f64),
        Some(ValueView::Str(s)) => OrderKey::Text(text_key(s.as_bytes())),
        _ => OrderKey::Empty,
    }
}

/// Create an order item for a node, reading `order_field` through the
/// language preference list.
pub fn node_order_item(
    h: &SelvaHierarchy,
    id: &NodeId,
    order_field: &str,
    langs: &[&str],
) -> OrderItem {
    let key = match h.node(id) {
        Some(node) => key_for_view(node.obj().get_any_lang(order_field, langs).ok()),
        None => OrderKey::Empty,
    };
    OrderItem { key, node_id: *id, payload: () }
}

/// Create an order item for a standalone object with an opaque payload.
pub fn obj_order_item<P>(
    obj: &crate::object::SelvaObject,
    order_field: &str,
    langs: &[&str],
    node_id: NodeId,
    payload: P,
) -> OrderItem<P> {
    let key = key_for_view(obj.get_any_lang(order_field, langs).ok());
    OrderItem { key, node_id, payload }
}

#[cfg(test)]
#[path = "order_test.rs"]
mod order_test;
