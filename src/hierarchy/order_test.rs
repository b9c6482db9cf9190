use super::*;

use crate::{hierarchy::SelvaHierarchy, sstring::SelvaString, Config};

fn id(s: &str) -> NodeId {
    NodeId::new(s.as_bytes())
}

#[test]
fn test_order_tokens() {
    assert_eq!(ResultOrder::from_token("none").unwrap(), ResultOrder::None);
    assert_eq!(ResultOrder::from_token("asc").unwrap(), ResultOrder::Asc);
    assert_eq!(ResultOrder::from_token("desc").unwrap(), ResultOrder::Desc);
    assert!(ResultOrder::from_token("upwards").is_err());
    assert_eq!(ResultOrder::Asc.to_token(), "asc");
}

#[test]
fn test_sort_numbers_with_tie_break() {
    let mut items = vec![
        OrderItem { key: OrderKey::Double(2.0), node_id: id("b"), payload: () },
        OrderItem { key: OrderKey::Double(1.0), node_id: id("c"), payload: () },
        OrderItem { key: OrderKey::Double(2.0), node_id: id("a"), payload: () },
    ];
    sort_items(&mut items, ResultOrder::Asc);
    let ids: Vec<NodeId> = items.iter().map(|i| i.node_id).collect();
    // ties break on node id
    assert_eq!(ids, vec![id("c"), id("a"), id("b")]);

    sort_items(&mut items, ResultOrder::Desc);
    let ids: Vec<NodeId> = items.iter().map(|i| i.node_id).collect();
    assert_eq!(ids, vec![id("b"), id("a"), id("c")]);
}

#[test]
fn test_sort_mixed_types() {
    let mut items = vec![
        OrderItem { key: OrderKey::Double(1.0), node_id: id("a"), payload: () },
        OrderItem { key: OrderKey::Empty, node_id: id("b"), payload: () },
        OrderItem { key: OrderKey::Text(b"zz".to_vec()), node_id: id("c"), payload: () },
    ];
    sort_items(&mut items, ResultOrder::Asc);
    let keys: Vec<u8> = items.iter().map(|i| i.key.rank()).collect();
    // empty < text < double
    assert_eq!(keys, vec![0, 1, 2]);
}

#[test]
fn test_text_collation_case_fold() {
    let mut items = vec![
        OrderItem { key: OrderKey::Text(text_key(b"Banana")), node_id: id("a"), payload: () },
        OrderItem { key: OrderKey::Text(text_key(b"apple")), node_id: id("b"), payload: () },
        OrderItem { key: OrderKey::Text(text_key(b"Cherry")), node_id: id("c"), payload: () },
    ];
    sort_items(&mut items, ResultOrder::Asc);
    let ids: Vec<NodeId> = items.iter().map(|i| i.node_id).collect();
    assert_eq!(ids, vec![id("b"), id("a"), id("c")]);
}

#[test]
fn test_node_order_item() {
    let mut h = SelvaHierarchy::new(Config::default());
    let a = id("oa");
    h.upsert_node(&a, false).unwrap();
    let obj = h.node_mut(&a).unwrap().obj_mut();
    obj.set_double("score", 4.5).unwrap();
    obj.set_long_long("count", 2).unwrap();
    obj.set_str("name", SelvaString::from_bytes(b"Ada")).unwrap();

    assert_eq!(node_order_item(&h, &a, "score", &[]).key, OrderKey::Double(4.5));
    // integers sort as doubles
    assert_eq!(node_order_item(&h, &a, "count", &[]).key, OrderKey::Double(2.0));
    assert_eq!(node_order_item(&h, &a, "name", &[]).key, OrderKey::Text(b"ada".to_vec()));
    assert_eq!(node_order_item(&h, &a, "missing", &[]).key, OrderKey::Empty);
    assert_eq!(node_order_item(&h, &id("zz"), "score", &[]).key, OrderKey::Empty);
}

#[test]
fn test_obj_order_item() {
    let mut obj = crate::object::SelvaObject::new();
    obj.set_double("v", 1.25).unwrap();
    let item = obj_order_item(&obj, "v", &[], id("x"), 7_usize);
    assert_eq!(item.key, OrderKey::Double(1.25));
    assert_eq!(item.payload, 7);
}
