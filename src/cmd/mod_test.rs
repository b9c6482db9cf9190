use super::*;

use crate::{find_index, proto::Value, Config, SelvaHierarchy};

fn id(s: &str) -> NodeId {
    NodeId::new(s.as_bytes())
}

fn ids_arg(ids: &[NodeId]) -> Value {
    let mut buf = vec![];
    for id in ids {
        buf.extend_from_slice(id.as_bytes());
    }
    Value::bytes(&buf)
}

fn reply_ids(reply: &[Value]) -> Vec<String> {
    match &reply[0] {
        Value::Array(values) => values
            .iter()
            .map(|v| match v {
                Value::String { data, .. } => String::from_utf8_lossy(data).to_string(),
                Value::Array(pair) => match &pair[0] {
                    Value::String { data, .. } => String::from_utf8_lossy(data).to_string(),
                    v => panic!("unexpected id value {:?}", v),
                },
                v => panic!("unexpected reply value {:?}", v),
            })
            .collect(),
        v => panic!("unexpected reply {:?}", v),
    }
}

fn build() -> SelvaHierarchy {
    let mut h = SelvaHierarchy::new(Config::default());
    h.add_hierarchy(&id("ma0000000000001"), &[NodeId::root()], &[]).unwrap();
    h.add_hierarchy(&id("ma0000000000002"), &[NodeId::root()], &[]).unwrap();
    h
}

#[test]
fn test_admin_commands() {
    let mut h = build();

    let reply = dispatch(&mut h, CMD_PING, &[]);
    assert_eq!(reply, vec![Value::str("pong")]);

    let args = vec![Value::str("hello"), Value::LongLong(3)];
    assert_eq!(dispatch(&mut h, CMD_ECHO, &args), args);

    let reply = dispatch(&mut h, CMD_LSCMD, &[]);
    match &reply[0] {
        Value::Array(rows) => {
            assert_eq!(rows.len(), command_table().len());
            assert!(rows.iter().any(|row| match row {
                Value::Array(pair) => pair[1] == Value::str("hierarchy.find"),
                _ => false,
            }));
        }
        v => panic!("unexpected reply {:?}", v),
    }

    // config get and set round trip
    let reply = dispatch(&mut h, CMD_CONFIG, &[Value::str("FIND_INDICES_MAX")]);
    assert_eq!(reply, vec![Value::str("0")]);
    dispatch(&mut h, CMD_CONFIG, &[Value::str("FIND_INDICES_MAX"), Value::str("8")]);
    assert_eq!(h.config().find_indices_max, 8);
    let reply = dispatch(&mut h, CMD_CONFIG, &[Value::str("NO_SUCH")]);
    assert!(matches!(reply[0], Value::Error { .. }));

    let reply = dispatch(&mut h, CMD_LOGLEVEL, &[Value::LongLong(2)]);
    assert_eq!(reply, vec![Value::LongLong(1)]);
    assert!(matches!(
        dispatch(&mut h, CMD_LOGLEVEL, &[Value::LongLong(9)])[0],
        Value::Error { .. }
    ));

    // unknown commands frame an error
    assert!(matches!(dispatch(&mut h, 255, &[])[0], Value::Error { .. }));
}

#[test]
fn test_find_basic_traversal() {
    // scenario: bfs_descendants from root returns the children in
    // insertion order, the start node excluded
    let mut h = build();
    let args = vec![
        Value::str(""),
        Value::str("bfs_descendants"),
        ids_arg(&[NodeId::root()]),
    ];
    let reply = dispatch(&mut h, CMD_FIND, &args);
    assert_eq!(reply_ids(&reply), vec!["ma0000000000001", "ma0000000000002"]);
}

#[test]
fn test_find_filter_rpn() {
    // scenario: priority in {1, 5, 10}, filter "priority > $1" with
    // register 1 = 4 keeps exactly two nodes
    let mut h = build();
    h.add_hierarchy(&id("ma0000000000003"), &[NodeId::root()], &[]).unwrap();
    for (n, priority) in [("ma0000000000001", 1), ("ma0000000000002", 5), ("ma0000000000003", 10)]
    {
        h.node_mut(&id(n)).unwrap().obj_mut().set_long_long("priority", priority).unwrap();
    }
    let args = vec![
        Value::str(""),
        Value::str("bfs_descendants"),
        Value::str("limit"),
        Value::LongLong(10),
        ids_arg(&[NodeId::root()]),
        Value::str("\"priority\" f $1 gt"),
        Value::LongLong(4),
    ];
    let reply = dispatch(&mut h, CMD_FIND, &args);
    assert_eq!(reply_ids(&reply), vec!["ma0000000000002", "ma0000000000003"]);
}

#[test]
fn test_find_order_offset_limit() {
    let mut h = SelvaHierarchy::new(Config::default());
    for (i, score) in [3, 1, 4, 1, 5].iter().enumerate() {
        let node = id(&format!("ma000000000000{}", i + 1));
        h.add_hierarchy(&node, &[NodeId::root()], &[]).unwrap();
        h.node_mut(&node).unwrap().obj_mut().set_long_long("score", *score).unwrap();
    }
    let args = vec![
        Value::str(""),
        Value::str("bfs_descendants"),
        Value::str("order"),
        Value::str("score"),
        Value::str("asc"),
        Value::str("offset"),
        Value::LongLong(1),
        Value::str("limit"),
        Value::LongLong(2),
        ids_arg(&[NodeId::root()]),
    ];
    let reply = dispatch(&mut h, CMD_FIND, &args);
    // scores asc: 1(ma2) 1(ma4) 3(ma1) 4(ma3) 5(ma5); window [1, 3)
    assert_eq!(reply_ids(&reply), vec!["ma0000000000004", "ma0000000000001"]);
}

#[test]
fn test_find_fields_and_inherit() {
    let mut h = build();
    h.add_hierarchy(&id("ma0000000000003"), &[id("ma0000000000001")], &[]).unwrap();
    h.node_mut(&id("ma0000000000001"))
        .unwrap()
        .obj_mut()
        .set_str("color", crate::sstring::SelvaString::from_bytes(b"red"))
        .unwrap();
    h.node_mut(&id("ma0000000000003"))
        .unwrap()
        .obj_mut()
        .set_long_long("priority", 7)
        .unwrap();

    let args = vec![
        Value::str(""),
        Value::str("node"),
        Value::str("fields"),
        Value::str("id\npriority\ncolor"),
        Value::str("inherit"),
        Value::str("color"),
        ids_arg(&[id("ma0000000000003")]),
    ];
    let reply = dispatch(&mut h, CMD_FIND, &args);
    match &reply[0] {
        Value::Array(nodes) => match &nodes[0] {
            Value::Array(node) => {
                assert_eq!(node[0], Value::str("ma0000000000003"));
                match &node[1] {
                    Value::Array(pairs) => {
                        let rendered: Vec<String> =
                            pairs.iter().map(|p| format!("{:?}", p)).collect();
                        assert!(rendered.iter().any(|p| p.contains("priority")));
                        // color is missing on the node and inherited
                        // from the parent
                        assert!(rendered.iter().any(|p| p.contains("red")));
                    }
                    v => panic!("unexpected pairs {:?}", v),
                }
            }
            v => panic!("unexpected node {:?}", v),
        },
        v => panic!("unexpected reply {:?}", v),
    }
}

#[test]
fn test_find_merge() {
    let mut h = build();
    let obj1 = h.node_mut(&id("ma0000000000001")).unwrap().obj_mut();
    obj1.set_long_long("a", 1).unwrap();
    obj1.set_long_long("shared", 10).unwrap();
    let obj2 = h.node_mut(&id("ma0000000000002")).unwrap().obj_mut();
    obj2.set_long_long("b", 2).unwrap();
    obj2.set_long_long("shared", 20).unwrap();

    let args = vec![
        Value::str(""),
        Value::str("bfs_descendants"),
        Value::str("merge"),
        Value::str(""),
        ids_arg(&[NodeId::root()]),
    ];
    let reply = dispatch(&mut h, CMD_FIND, &args);
    match &reply[0] {
        Value::Array(pairs) => {
            let text = format!("{:?}", pairs);
            assert!(text.contains('a') && text.contains('b'));
            // first node wins on conflicts
            assert!(text.contains("10") && !text.contains("20"));
        }
        v => panic!("unexpected reply {:?}", v),
    }
}

#[test]
fn test_aggregate() {
    // scenario: scores {3,1,4,1,5}, sum over asc window of three = 5.0
    let mut h = SelvaHierarchy::new(Config::default());
    for (i, score) in [3, 1, 4, 1, 5].iter().enumerate() {
        let node = id(&format!("ma000000000000{}", i + 1));
        h.add_hierarchy(&node, &[NodeId::root()], &[]).unwrap();
        h.node_mut(&node).unwrap().obj_mut().set_long_long("score", *score).unwrap();
    }
    let mut args = vec![
        Value::str(""),
        Value::str("bfs_descendants"),
        Value::str("order"),
        Value::str("score"),
        Value::str("asc"),
        Value::str("offset"),
        Value::LongLong(0),
        Value::str("limit"),
        Value::LongLong(3),
        Value::str("fields"),
        Value::str("0=score"),
        Value::LongLong(2),
        ids_arg(&[NodeId::root()]),
    ];
    let reply = dispatch(&mut h, CMD_AGGREGATE, &args);
    assert_eq!(reply, vec![Value::Double(5.0)]);

    // count nodes
    args[11] = Value::LongLong(0);
    let reply = dispatch(&mut h, CMD_AGGREGATE, &args);
    assert_eq!(reply, vec![Value::LongLong(3)]);

    // min / max / avg over the full set
    let base = vec![
        Value::str(""),
        Value::str("bfs_descendants"),
        Value::str("fields"),
        Value::str("0=score"),
    ];
    for (agg, expected) in [(4_i64, 1.0_f64), (5, 5.0), (3, 2.8)] {
        let mut args = base.clone();
        args.push(Value::LongLong(agg));
        args.push(ids_arg(&[NodeId::root()]));
        let reply = dispatch(&mut h, CMD_AGGREGATE, &args);
        assert_eq!(reply, vec![Value::Double(expected)], "agg {}", agg);
    }

    // count unique field values
    let mut args = base.clone();
    args[3] = Value::str("0=score");
    args.push(Value::LongLong(1));
    args.push(ids_arg(&[NodeId::root()]));
    let reply = dispatch(&mut h, CMD_AGGREGATE, &args);
    assert_eq!(reply, vec![Value::LongLong(4)]);
}

#[test]
fn test_find_array_and_set_fields() {
    let mut h = build();
    let target = id("ma0000000000001");
    {
        let obj = h.node_mut(&target).unwrap().obj_mut();
        for v in [10, 20, 30].iter() {
            obj.insert_array("nums", crate::object::ArrayItem::LongLong(*v)).unwrap();
        }
        obj.add_set_double("weights", 0.5).unwrap();
        obj.add_set_double("weights", 1.5).unwrap();
    }

    // array traversal replies the element values
    let args = vec![
        Value::str(""),
        Value::str("array"),
        Value::str("nums"),
        Value::str("limit"),
        Value::LongLong(2),
        ids_arg(&[target]),
    ];
    let reply = dispatch(&mut h, CMD_FIND, &args);
    assert_eq!(
        reply,
        vec![Value::Array(vec![Value::LongLong(10), Value::LongLong(20)])]
    );

    // aggregate sums a set field directly
    let args = vec![
        Value::str(""),
        Value::str("set"),
        Value::str("weights"),
        Value::LongLong(2),
        ids_arg(&[target]),
    ];
    let reply = dispatch(&mut h, CMD_AGGREGATE, &args);
    assert_eq!(reply, vec![Value::Double(2.0)]);
}

#[test]
fn test_update_and_events() {
    let mut h = build();
    let rx = h.subs.pubsub.subscribe();
    let target = id("ma0000000000001");

    // scenario: a marker over bfs_descendants watching `name`
    let sub_hex = "11".repeat(32);
    let args = vec![
        Value::str(&sub_hex),
        Value::LongLong(1),
        Value::str("bfs_descendants"),
        ids_arg(&[NodeId::root()]),
        Value::str("fields"),
        Value::str("name"),
    ];
    let reply = dispatch(&mut h, CMD_SUB_ADD, &args);
    assert_eq!(reply, vec![Value::LongLong(1)]);
    while rx.try_recv().is_ok() {}

    // one update command with a duplicated op: events deduplicate to one
    let args = vec![
        Value::str("node"),
        Value::LongLong(2),
        Value::str("string"),
        Value::str("name"),
        Value::str("selva"),
        Value::str("string"),
        Value::str("name"),
        Value::str("selva"),
        ids_arg(&[target]),
    ];
    let reply = dispatch(&mut h, CMD_UPDATE, &args);
    assert_eq!(reply, vec![Value::LongLong(1)]);
    assert_eq!(
        h.node(&target).unwrap().obj().get_str("name").unwrap().as_bytes(),
        b"selva"
    );
    let mut msgs = vec![];
    while let Ok(msg) = rx.try_recv() {
        msgs.push(msg);
    }
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].kind, crate::subscriptions::PubsubEventKind::Update);
    assert_eq!(msgs[0].sub_id.as_slice(), &[0x11; 32]);

    // an update that changes nothing publishes nothing
    let args = vec![
        Value::str("node"),
        Value::LongLong(1),
        Value::str("string"),
        Value::str("name"),
        Value::str("selva"),
        ids_arg(&[target]),
    ];
    let reply = dispatch(&mut h, CMD_UPDATE, &args);
    assert_eq!(reply, vec![Value::LongLong(0)]);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_update_ops() {
    let mut h = build();
    let target = id("ma0000000000001");

    let args = vec![
        Value::str("node"),
        Value::LongLong(6),
        Value::str("i64"), Value::str("n"), Value::LongLong(5),
        Value::str("increment_i64"), Value::str("n"), Value::LongLong(3),
        Value::str("f64"), Value::str("d"), Value::Double(0.5),
        Value::str("increment_f64"), Value::str("d"), Value::Double(0.25),
        Value::str("set"), Value::str("tags"), Value::str("red"),
        Value::str("default_i64"), Value::str("n"), Value::LongLong(99),
        ids_arg(&[target]),
    ];
    dispatch(&mut h, CMD_UPDATE, &args);
    let obj = h.node(&target).unwrap().obj();
    assert_eq!(obj.get_long_long("n").unwrap(), 8);
    assert_eq!(obj.get_double("d").unwrap(), 0.75);
    assert!(obj.get_set("tags").unwrap().has_str(&crate::sstring::SelvaString::from_bytes(b"red")));

    // del and obj_meta
    let args = vec![
        Value::str("node"),
        Value::LongLong(2),
        Value::str("obj_meta"), Value::str("tags"), Value::LongLong(1),
        Value::str("del"), Value::str("d"),
        ids_arg(&[target]),
    ];
    dispatch(&mut h, CMD_UPDATE, &args);
    let obj = h.node(&target).unwrap().obj();
    assert!(!obj.exists("d"));
    assert_eq!(obj.get_user_meta("tags").unwrap(), 1);

    // filtered update only touches matching nodes
    let args = vec![
        Value::str("bfs_descendants"),
        Value::LongLong(1),
        Value::str("i64"), Value::str("seen"), Value::LongLong(1),
        ids_arg(&[NodeId::root()]),
        Value::str("\"n\" f $1 gt"),
        Value::LongLong(4),
    ];
    let reply = dispatch(&mut h, CMD_UPDATE, &args);
    assert_eq!(reply, vec![Value::LongLong(1)]);
    assert!(h.node(&target).unwrap().obj().exists("seen"));
    assert!(!h.node(&id("ma0000000000002")).unwrap().obj().exists("seen"));
}

#[test]
fn test_alias_one_shot_via_commands() {
    let mut h = build();
    let rx = h.subs.pubsub.subscribe();
    let pa3 = id("pa0000000000003");
    let pa4 = id("pa0000000000004");
    h.add_hierarchy(&pa3, &[NodeId::root()], &[]).unwrap();
    h.add_hierarchy(&pa4, &[NodeId::root()], &[]).unwrap();
    h.update_alias("homepage", &pa3).unwrap();
    crate::subscriptions::destroy_deferred_events(&mut h);

    let sub_hex = "22".repeat(32);
    let args = vec![Value::str(&sub_hex), Value::LongLong(1), Value::str("homepage")];
    let reply = dispatch(&mut h, CMD_SUB_ADD_ALIAS, &args);
    assert_eq!(reply, vec![Value::LongLong(1)]);
    while rx.try_recv().is_ok() {}

    // moving the alias publishes exactly one update and clears the
    // subscription's markers
    h.update_alias("homepage", &pa4).unwrap();
    crate::subscriptions::send_deferred_events(&mut h);
    let mut msgs = vec![];
    while let Ok(msg) = rx.try_recv() {
        msgs.push(msg);
    }
    assert_eq!(msgs.len(), 1);
    let sub_id: crate::types::SubscriptionId = [0x22; 32];
    assert_eq!(msgs[0].sub_id, sub_id);
    assert!(h.subs.subscription(&sub_id).is_none());
}

#[test]
fn test_subscription_commands() {
    let mut h = build();
    let sub_hex = "33".repeat(32);

    let args = vec![
        Value::str(&sub_hex),
        Value::LongLong(1),
        Value::str("bfs_descendants"),
        ids_arg(&[NodeId::root()]),
    ];
    dispatch(&mut h, CMD_SUB_ADD, &args);

    let reply = dispatch(&mut h, CMD_SUB_LIST, &[]);
    match &reply[0] {
        Value::Array(subs) => assert_eq!(subs, &vec![Value::str(&sub_hex)]),
        v => panic!("unexpected reply {:?}", v),
    }

    let reply = dispatch(&mut h, CMD_SUB_DEBUG, &[Value::str(&sub_hex)]);
    match &reply[0] {
        Value::Array(rows) => assert_eq!(rows.len(), 1),
        v => panic!("unexpected reply {:?}", v),
    }

    dispatch(&mut h, CMD_SUB_ADD_MISSING, &[Value::str(&sub_hex), Value::str("later")]);
    let reply = dispatch(&mut h, CMD_SUB_LIST_MISSING, &[]);
    match &reply[0] {
        Value::Array(rows) => assert_eq!(rows.len(), 1),
        v => panic!("unexpected reply {:?}", v),
    }

    assert_eq!(
        dispatch(&mut h, CMD_SUB_REFRESH, &[Value::str(&sub_hex)]),
        vec![Value::LongLong(1)]
    );
    assert_eq!(
        dispatch(&mut h, CMD_SUB_DEL_MARKER, &[Value::str(&sub_hex), Value::LongLong(1)]),
        vec![Value::LongLong(1)]
    );
    assert_eq!(
        dispatch(&mut h, CMD_SUB_DEL, &[Value::str(&sub_hex)]),
        vec![Value::LongLong(1)]
    );
    assert!(matches!(
        dispatch(&mut h, CMD_SUB_DEL, &[Value::str(&sub_hex)])[0],
        Value::Error { .. }
    ));
}

#[test]
fn test_trigger_via_commands() {
    let mut h = build();
    let rx = h.subs.pubsub.subscribe();
    let sub_hex = "44".repeat(32);
    let args =
        vec![Value::str(&sub_hex), Value::LongLong(1), Value::str("created")];
    dispatch(&mut h, CMD_SUB_ADD_TRIGGER, &args);

    h.upsert_node(&id("ma0000000000009"), false).unwrap();
    crate::subscriptions::send_deferred_events(&mut h);
    let msg = rx.try_recv().unwrap();
    assert_eq!(msg.kind, crate::subscriptions::PubsubEventKind::Trigger);
    assert_eq!(msg.node_id, Some(id("ma0000000000009")));
}

#[test]
fn test_del_node_command() {
    let mut h = build();
    let args = vec![
        Value::str("reply_ids"),
        ids_arg(&[id("ma0000000000001")]),
    ];
    let reply = dispatch(&mut h, CMD_HIERARCHY_DEL, &args);
    assert_eq!(reply[0], Value::LongLong(1));
    match &reply[1] {
        Value::Array(ids) => assert_eq!(ids, &vec![Value::str("ma0000000000001")]),
        v => panic!("unexpected reply {:?}", v),
    }
    assert!(!h.node_exists(&id("ma0000000000001")));
}

#[test]
fn test_index_promotion_through_find() {
    // scenario: a repeated find with an index hint gets promoted and
    // the 1001st query is served from the index with identical results
    let mut config = Config::default();
    config.find_indices_max = 4;
    config.find_indexing_threshold = 0.1;
    let mut h = SelvaHierarchy::new(config);
    for i in 1..=5 {
        let node = id(&format!("ma000000000000{}", i));
        h.add_hierarchy(&node, &[NodeId::root()], &[]).unwrap();
        h.node_mut(&node).unwrap().obj_mut().set_long_long("priority", i as i64).unwrap();
    }

    let filter = "\"priority\" f #2 gt";
    let args = vec![
        Value::str(""),
        Value::str("bfs_descendants"),
        Value::str("index"),
        Value::str(filter),
        ids_arg(&[NodeId::root()]),
        Value::str(filter),
    ];

    let mut before = vec![];
    for _ in 0..1000 {
        before = dispatch(&mut h, CMD_FIND, &args);
        assert!(!matches!(before[0], Value::Error { .. }));
    }
    // the timers fire between the queries
    find_index::icb_tick_all(&mut h);
    find_index::selector_tick(&mut h).unwrap();

    let after = dispatch(&mut h, CMD_FIND, &args);
    assert_eq!(after, before);
    assert_eq!(reply_ids(&after), vec![
        "ma0000000000003",
        "ma0000000000004",
        "ma0000000000005",
    ]);

    // served from the index, observable through index.list
    let reply = dispatch(&mut h, CMD_INDEX_LIST, &[]);
    match &reply[0] {
        Value::Array(rows) => {
            assert_eq!(rows.len(), 1);
            match &rows[0] {
                Value::Array(cols) => {
                    assert_eq!(cols[1], Value::LongLong(1), "active");
                    assert_eq!(cols[2], Value::LongLong(1), "valid");
                    assert_eq!(cols[6], Value::LongLong(1), "hits");
                }
                v => panic!("unexpected row {:?}", v),
            }
        }
        v => panic!("unexpected reply {:?}", v),
    }
}

#[test]
fn test_index_commands() {
    let mut config = Config::default();
    config.find_indices_max = 4;
    let mut h = SelvaHierarchy::new(config);
    h.add_hierarchy(&id("ma0000000000001"), &[NodeId::root()], &[]).unwrap();
    h.node_mut(&id("ma0000000000001"))
        .unwrap()
        .obj_mut()
        .set_long_long("priority", 5)
        .unwrap();

    let args = vec![
        Value::str("bfs_descendants"),
        ids_arg(&[NodeId::root()]),
        Value::str("\"priority\" f #1 gt"),
    ];
    let reply = dispatch(&mut h, CMD_INDEX_NEW, &args);
    let name = match &reply[0] {
        Value::String { data, .. } => data.clone(),
        v => panic!("unexpected reply {:?}", v),
    };

    let reply = dispatch(&mut h, CMD_INDEX_INFO, &[]);
    match &reply[0] {
        Value::Array(cols) => {
            assert_eq!(cols[0], Value::LongLong(1));
            assert_eq!(cols[1], Value::LongLong(1));
        }
        v => panic!("unexpected reply {:?}", v),
    }

    let reply = dispatch(&mut h, CMD_INDEX_DEBUG, &[Value::bytes(&name)]);
    assert!(matches!(reply[0], Value::Array(_)));

    assert_eq!(
        dispatch(&mut h, CMD_INDEX_DEL, &[Value::bytes(&name)]),
        vec![Value::LongLong(1)]
    );
    assert!(matches!(
        dispatch(&mut h, CMD_INDEX_DEBUG, &[Value::bytes(&name)])[0],
        Value::Error { .. }
    ));
}
