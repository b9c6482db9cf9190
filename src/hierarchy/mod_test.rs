use super::*;

fn id(s: &str) -> NodeId {
    NodeId::new(s.as_bytes())
}

// every edge must be recorded symmetrically on both sides
fn check_symmetry(h: &SelvaHierarchy) {
    for node_id in h.node_ids() {
        let node = h.node(&node_id).unwrap();
        for p in node.parents().iter() {
            assert!(h.node(p).unwrap().has_child(&node_id), "{} -> {}", p, node_id);
        }
        for c in node.children().iter() {
            assert!(h.node(c).unwrap().has_parent(&node_id), "{} -> {}", node_id, c);
        }
    }
}

// the head set must equal the set of parentless nodes
fn check_heads(h: &SelvaHierarchy) {
    let expected: Vec<NodeId> = h
        .node_ids()
        .into_iter()
        .filter(|id| h.node(id).unwrap().parents().is_empty())
        .collect();
    assert_eq!(h.heads(), expected);
}

#[test]
fn test_new_hierarchy() {
    let h = SelvaHierarchy::new(Config::default());
    assert_eq!(h.node_count(), 1);
    assert!(h.node_exists(&NodeId::root()));
    assert_eq!(h.heads(), vec![NodeId::root()]);
    check_symmetry(&h);
    check_heads(&h);
}

#[test]
fn test_upsert() {
    let mut h = SelvaHierarchy::new(Config::default());
    let ma1 = id("ma0000000000001");

    assert!(h.upsert_node(&ma1, false).unwrap());
    // second upsert returns the existing node
    assert!(!h.upsert_node(&ma1, false).unwrap());
    assert_eq!(h.node_count(), 2);
    // no parents yet: an orphan head; heads keep id order
    assert_eq!(h.heads(), vec![ma1, NodeId::root()]);

    assert!(h.upsert_node(&NodeId::empty(), false).is_err());
    check_symmetry(&h);
    check_heads(&h);
}

#[test]
fn test_add_del_hierarchy() {
    let mut h = SelvaHierarchy::new(Config::default());
    let ma1 = id("ma0000000000001");
    let ma2 = id("ma0000000000002");

    h.add_hierarchy(&ma1, &[NodeId::root()], &[]).unwrap();
    h.add_hierarchy(&ma2, &[NodeId::root()], &[]).unwrap();
    assert!(h.node(&ma1).unwrap().has_parent(&NodeId::root()));
    assert_eq!(h.heads(), vec![NodeId::root()]);
    check_symmetry(&h);
    check_heads(&h);

    // re-adding the same edge is a no-op, not an error
    h.add_hierarchy(&ma1, &[NodeId::root()], &[]).unwrap();
    assert_eq!(h.node(&ma1).unwrap().parents().len(), 1);

    // add/add/del/has-parent law
    h.add_hierarchy(&ma2, &[ma1], &[]).unwrap();
    h.add_hierarchy(&ma2, &[ma1], &[]).unwrap();
    h.del_hierarchy(&ma2, &[ma1], &[]).unwrap();
    assert!(!h.node(&ma2).unwrap().has_parent(&ma1));
    check_symmetry(&h);
    check_heads(&h);

    // empty sides are no-ops
    h.del_hierarchy(&ma2, &[], &[]).unwrap();
    assert!(h.del_hierarchy(&id("xx9"), &[], &[]).is_err());

    // deleting the last parent of a non-root node makes it a head
    h.del_hierarchy(&ma2, &[NodeId::root()], &[]).unwrap();
    assert!(h.heads().contains(&ma2));
    check_heads(&h);
}

#[test]
fn test_lazy_relative_creation() {
    let mut h = SelvaHierarchy::new(Config::default());
    let ma1 = id("ma0000000000001");
    let ma2 = id("ma0000000000002");

    // relatives mentioned by an operation are created implicitly
    h.add_hierarchy(&ma1, &[], &[ma2]).unwrap();
    assert!(h.node_exists(&ma2));
    assert!(h.node(&ma2).unwrap().is_implicit());
    assert!(!h.node(&ma1).unwrap().is_implicit());
    check_symmetry(&h);
    check_heads(&h);
}

#[test]
fn test_acyclicity() {
    let mut h = SelvaHierarchy::new(Config::default());
    let a = id("ma000000000000a");
    let b = id("ma000000000000b");
    let c = id("ma000000000000c");

    h.add_hierarchy(&a, &[NodeId::root()], &[b]).unwrap();
    h.add_hierarchy(&b, &[], &[c]).unwrap();

    // a self edge and a back edge both close a cycle
    assert!(h.add_hierarchy(&a, &[a], &[]).is_err());
    assert!(h.add_hierarchy(&a, &[c], &[]).is_err());
    assert!(h.add_hierarchy(&c, &[], &[a]).is_err());
    // the failed attempts left no partial state behind
    check_symmetry(&h);
    check_heads(&h);
}

#[test]
fn test_set_hierarchy() {
    let mut h = SelvaHierarchy::new(Config::default());
    let a = id("ma000000000000a");
    let b = id("ma000000000000b");
    let c = id("ma000000000000c");
    let d = id("ma000000000000d");

    h.set_hierarchy(&a, &[NodeId::root()], &[b, c]).unwrap();
    assert_eq!(h.node(&a).unwrap().children().to_vec(), vec![b, c]);
    check_symmetry(&h);

    // replacement drops b, keeps c, adds d
    h.set_children(&a, &[c, d]).unwrap();
    assert_eq!(h.node(&a).unwrap().children().to_vec(), vec![c, d]);
    assert!(!h.node(&b).unwrap().has_parent(&a));
    assert!(h.heads().contains(&b));
    check_symmetry(&h);
    check_heads(&h);

    h.set_parents(&d, &[NodeId::root()]).unwrap();
    assert!(!h.node(&a).unwrap().has_child(&d));
    check_symmetry(&h);
    check_heads(&h);

    assert!(h.set_parents(&id("zz1"), &[]).is_err());

    h.del_children(&a).unwrap();
    assert!(h.node(&a).unwrap().children().is_empty());
    h.del_parents(&a).unwrap();
    assert!(h.heads().contains(&a));
    check_symmetry(&h);
    check_heads(&h);
}

#[test]
fn test_del_node() {
    let mut h = SelvaHierarchy::new(Config::default());
    let a = id("ma000000000000a");
    let b = id("ma000000000000b");
    let c = id("ma000000000000c");
    let shared = id("ma000000000000s");

    h.set_hierarchy(&a, &[NodeId::root()], &[b]).unwrap();
    h.set_hierarchy(&b, &[a], &[c]).unwrap();
    h.add_hierarchy(&shared, &[b, NodeId::root()], &[]).unwrap();

    // orphaned children die with the parent, shared ones survive
    let (count, ids) =
        h.del_node(&a, DelNodeFlags { reply_ids: true, ..DelNodeFlags::default() }).unwrap();
    assert_eq!(count, 3);
    assert_eq!(ids, vec![a, b, c]);
    assert!(h.node_exists(&shared));
    check_symmetry(&h);
    check_heads(&h);

    assert!(h.del_node(&a, DelNodeFlags::default()).is_err());
}

#[test]
fn test_del_node_force() {
    let mut h = SelvaHierarchy::new(Config::default());
    let a = id("ma000000000000a");
    let b = id("ma000000000000b");
    let shared = id("ma000000000000s");

    h.set_hierarchy(&a, &[NodeId::root()], &[b]).unwrap();
    h.add_hierarchy(&shared, &[b, NodeId::root()], &[]).unwrap();

    // force recurses into children that still have other parents
    let (count, _) =
        h.del_node(&a, DelNodeFlags { force: true, ..DelNodeFlags::default() }).unwrap();
    assert_eq!(count, 3);
    assert!(!h.node_exists(&shared));
    check_symmetry(&h);
    check_heads(&h);
}

#[test]
fn test_aliases() {
    let mut h = SelvaHierarchy::new(Config::default());
    let pa3 = id("pa0000000000003");
    let pa4 = id("pa0000000000004");
    h.add_hierarchy(&pa3, &[NodeId::root()], &[]).unwrap();
    h.add_hierarchy(&pa4, &[NodeId::root()], &[]).unwrap();

    assert!(h.update_alias("homepage", &id("zz0")).is_err());

    h.update_alias("homepage", &pa3).unwrap();
    assert_eq!(h.get_alias("homepage"), Some(pa3));
    let set = h.node(&pa3).unwrap().obj().get_set("aliases").unwrap();
    assert!(set.has_str(&crate::sstring::SelvaString::from_bytes(b"homepage")));

    // moving the alias updates both nodes
    h.update_alias("homepage", &pa4).unwrap();
    assert_eq!(h.get_alias("homepage"), Some(pa4));
    let set = h.node(&pa3).unwrap().obj().get_set("aliases").unwrap();
    assert!(!set.has_str(&crate::sstring::SelvaString::from_bytes(b"homepage")));

    assert_eq!(h.aliases(), vec![("homepage".to_string(), pa4)]);

    h.delete_alias("homepage").unwrap();
    assert_eq!(h.get_alias("homepage"), None);
    assert!(h.delete_alias("homepage").is_err());

    // aliases die with their node
    h.update_alias("front", &pa4).unwrap();
    h.del_node(&pa4, DelNodeFlags::default()).unwrap();
    assert_eq!(h.get_alias("front"), None);
}

#[test]
fn test_type_names() {
    let mut h = SelvaHierarchy::new(Config::default());
    h.set_type_name(NodeType(*b"ma"), "match").unwrap();
    assert_eq!(h.type_name(NodeType(*b"ma")), Some("match".to_string()));
    assert_eq!(h.type_name(NodeType(*b"zz")), None);
}

#[test]
fn test_clear_node_fields() {
    let mut h = SelvaHierarchy::new(Config::default());
    let a = id("ma000000000000a");
    h.upsert_node(&a, false).unwrap();
    {
        let obj = h.node_mut(&a).unwrap().obj_mut();
        obj.set_long_long("x", 1).unwrap();
        obj.add_set_str("aliases", crate::sstring::SelvaString::from_bytes(b"k")).unwrap();
    }
    h.clear_node_fields(&a).unwrap();
    let obj = h.node(&a).unwrap().obj();
    assert!(!obj.exists("x"));
    // the aliases bookkeeping survives a field wipe
    assert!(obj.exists("aliases"));
}
