use super::*;

use std::sync::mpsc::Receiver;

use crate::{hierarchy::DelNodeFlags, sstring::SelvaString, Config, SelvaHierarchy};

fn id(s: &str) -> NodeId {
    NodeId::new(s.as_bytes())
}

fn sub(n: u8) -> SubscriptionId {
    [n; 32]
}

fn build() -> (SelvaHierarchy, Receiver<PubsubMessage>) {
    let mut h = SelvaHierarchy::new(Config::default());
    let rx = h.subs.pubsub.subscribe();
    h.add_hierarchy(&id("ma0000000000001"), &[NodeId::root()], &[]).unwrap();
    h.add_hierarchy(&id("ma0000000000002"), &[NodeId::root()], &[]).unwrap();
    // creation noise is not under test here
    destroy_deferred_events(&mut h);
    (h, rx)
}

fn drain(rx: &Receiver<PubsubMessage>) -> Vec<PubsubMessage> {
    let mut out = vec![];
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn add_descendants_marker(h: &mut SelvaHierarchy, sub_id: SubscriptionId, fields: Option<&str>) {
    let mut spec = MarkerSpec::generic(
        sub_id,
        1,
        NodeId::root(),
        crate::hierarchy::traversal::TraversalDir::BfsDescendants,
    );
    spec.fields = fields.map(|f| f.to_string());
    add_marker(h, spec).unwrap();
    refresh_marker(h, &MarkerKey { sub_id, marker_id: 1 }).unwrap();
}

#[test]
fn test_marker_refresh_attaches() {
    let (mut h, _rx) = build();
    let sub_id = sub(1);
    add_descendants_marker(&mut h, sub_id, None);

    let key = MarkerKey { sub_id, marker_id: 1 };
    for n in [NodeId::root(), id("ma0000000000001"), id("ma0000000000002")].iter() {
        let node = h.node(n).unwrap();
        assert!(node.markers.contains(&key), "missing on {}", n);
        // the fast-path filter admits the marker's matcher flags
        assert!(node.markers.has_flags(FLAG_CH_FIELD));
        assert!(node.markers.has_flags(FLAG_CH_HIERARCHY));
        assert!(!node.markers.has_flags(FLAG_CH_ALIAS));
        assert!(has_active_markers(node));
    }

    // duplicate marker ids are rejected
    let spec = MarkerSpec::generic(
        sub_id,
        1,
        NodeId::root(),
        crate::hierarchy::traversal::TraversalDir::BfsDescendants,
    );
    assert!(add_marker(&mut h, spec).unwrap_err().is_exists());
}

#[test]
fn test_field_change_event_dedup() {
    let (mut h, rx) = build();
    let sub_id = sub(2);
    add_descendants_marker(&mut h, sub_id, Some("name"));
    let target = id("ma0000000000001");

    // scenario: one update, one message after the flush
    field_change_precheck(&mut h, &target);
    h.node_mut(&target)
        .unwrap()
        .obj_mut()
        .set_str("name", SelvaString::from_bytes(b"x"))
        .unwrap();
    defer_field_change_events(&mut h, &target, "name");
    // a second identical change in the same command deduplicates
    defer_field_change_events(&mut h, &target, "name");

    assert_eq!(h.subs.deferred_counts(), (1, 0));
    send_deferred_events(&mut h);
    let msgs = drain(&rx);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].kind, PubsubEventKind::Update);
    assert_eq!(msgs[0].sub_id, sub_id);
    assert_eq!(msgs[0].node_id, None);

    // the queues are drained by the flush
    send_deferred_events(&mut h);
    assert!(drain(&rx).is_empty());
}

#[test]
fn test_field_allowlist() {
    let (mut h, rx) = build();
    add_descendants_marker(&mut h, sub(3), Some("name\ntitle"));
    let target = id("ma0000000000001");

    field_change_precheck(&mut h, &target);
    defer_field_change_events(&mut h, &target, "other");
    send_deferred_events(&mut h);
    assert!(drain(&rx).is_empty());

    defer_field_change_events(&mut h, &target, "title");
    send_deferred_events(&mut h);
    assert_eq!(drain(&rx).len(), 1);
}

#[test]
fn test_filter_edge_crossing() {
    let (mut h, rx) = build();
    let sub_id = sub(4);
    let target = id("ma0000000000001");

    let mut spec = MarkerSpec::generic(
        sub_id,
        1,
        NodeId::root(),
        crate::hierarchy::traversal::TraversalDir::BfsDescendants,
    );
    spec.fields = Some("other".to_string());
    spec.filter = Some("\"status\" f #1 eq".to_string());
    add_marker(&mut h, spec).unwrap();
    refresh_marker(&mut h, &MarkerKey { sub_id, marker_id: 1 }).unwrap();

    // status flips 0 -> 1: the filter result crosses an edge, so the
    // event fires even though `status` is not in the field list
    h.node_mut(&target).unwrap().obj_mut().set_long_long("status", 0).unwrap();
    field_change_precheck(&mut h, &target);
    h.node_mut(&target).unwrap().obj_mut().set_long_long("status", 1).unwrap();
    defer_field_change_events(&mut h, &target, "status");
    send_deferred_events(&mut h);
    assert_eq!(drain(&rx).len(), 1);

    // no crossing, field not listed: no event
    field_change_precheck(&mut h, &target);
    h.node_mut(&target).unwrap().obj_mut().set_long_long("unrelated", 5).unwrap();
    defer_field_change_events(&mut h, &target, "unrelated");
    send_deferred_events(&mut h);
    assert!(drain(&rx).is_empty());

    // still matching and the listed field changed: event
    field_change_precheck(&mut h, &target);
    defer_field_change_events(&mut h, &target, "other");
    send_deferred_events(&mut h);
    assert_eq!(drain(&rx).len(), 1);
}

#[test]
fn test_fast_path_soundness() {
    let (mut h, rx) = build();
    add_descendants_marker(&mut h, sub(5), None);
    let outside = id("xx0000000000009");
    h.upsert_node(&outside, false).unwrap();
    destroy_deferred_events(&mut h);

    // a node the marker is not attached to produces nothing
    field_change_precheck(&mut h, &outside);
    defer_field_change_events(&mut h, &outside, "name");
    send_deferred_events(&mut h);
    assert!(drain(&rx).is_empty());
}

#[test]
fn test_hierarchy_events_and_deletion() {
    let (mut h, rx) = build();
    add_descendants_marker(&mut h, sub(6), None);
    let child = id("ma0000000000003");

    h.add_hierarchy(&child, &[id("ma0000000000001")], &[]).unwrap();
    send_deferred_events(&mut h);
    let msgs = drain(&rx);
    assert!(!msgs.is_empty());

    // descendant markers propagate onto freshly attached children
    let key = MarkerKey { sub_id: sub(6), marker_id: 1 };
    assert!(h.node(&child).unwrap().markers.contains(&key));

    // deletion defers unconditionally
    h.del_node(&child, DelNodeFlags::default()).unwrap();
    send_deferred_events(&mut h);
    assert!(!drain(&rx).is_empty());
}

#[test]
fn test_ancestor_marker_propagation() {
    let (mut h, _rx) = build();
    let sub_id = sub(7);
    let leaf = id("ma0000000000002");
    let spec = MarkerSpec::generic(
        sub_id,
        1,
        leaf,
        crate::hierarchy::traversal::TraversalDir::BfsAncestors,
    );
    add_marker(&mut h, spec).unwrap();
    refresh_marker(&mut h, &MarkerKey { sub_id, marker_id: 1 }).unwrap();

    // a new parent of the watched node inherits the ancestor marker
    let parent = id("pa0000000000001");
    h.upsert_node(&parent, false).unwrap();
    h.add_hierarchy(&leaf, &[parent], &[]).unwrap();
    let key = MarkerKey { sub_id, marker_id: 1 };
    assert!(h.node(&parent).unwrap().markers.contains(&key));
}

#[test]
fn test_alias_one_shot() {
    let (mut h, rx) = build();
    let sub_id = sub(8);
    let pa3 = id("pa0000000000003");
    let pa4 = id("pa0000000000004");
    h.add_hierarchy(&pa3, &[NodeId::root()], &[]).unwrap();
    h.add_hierarchy(&pa4, &[NodeId::root()], &[]).unwrap();
    h.update_alias("homepage", &pa3).unwrap();
    destroy_deferred_events(&mut h);

    let spec = MarkerSpec::alias(sub_id, 1, "homepage", pa3);
    add_marker(&mut h, spec).unwrap();
    refresh_marker(&mut h, &MarkerKey { sub_id, marker_id: 1 }).ok();
    assert!(h.subs.subscription(&sub_id).is_some());

    // moving the alias publishes one update and clears the
    // subscription's markers
    h.update_alias("homepage", &pa4).unwrap();
    send_deferred_events(&mut h);
    let msgs = drain(&rx);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].kind, PubsubEventKind::Update);
    assert_eq!(msgs[0].sub_id, sub_id);
    assert!(h.subs.subscription(&sub_id).is_none());
    assert!(h.subs.marker(&MarkerKey { sub_id, marker_id: 1 }).is_none());
}

#[test]
fn test_triggers() {
    let (mut h, rx) = build();
    let sub_id = sub(9);
    let spec = MarkerSpec::trigger(sub_id, 1, TriggerType::Created);
    add_marker(&mut h, spec).unwrap();
    refresh_marker(&mut h, &MarkerKey { sub_id, marker_id: 1 }).unwrap();
    // trigger markers live on the detached list, not on nodes
    assert!(h.subs.detached.contains(&MarkerKey { sub_id, marker_id: 1 }));

    let fresh = id("ma0000000000007");
    h.upsert_node(&fresh, false).unwrap();
    send_deferred_events(&mut h);
    let msgs = drain(&rx);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].kind, PubsubEventKind::Trigger);
    // triggers deliver the node id that fired them
    assert_eq!(msgs[0].node_id, Some(fresh));

    // a deleted-trigger does not fire on create
    let spec = MarkerSpec::trigger(sub(10), 2, TriggerType::Deleted);
    add_marker(&mut h, spec).unwrap();
    refresh_marker(&mut h, &MarkerKey { sub_id: sub(10), marker_id: 2 }).unwrap();
    h.upsert_node(&id("ma0000000000008"), false).unwrap();
    send_deferred_events(&mut h);
    let msgs = drain(&rx);
    assert!(msgs.iter().all(|m| m.sub_id != sub(10)));

    h.del_node(&id("ma0000000000008"), DelNodeFlags::default()).unwrap();
    send_deferred_events(&mut h);
    let msgs = drain(&rx);
    assert!(msgs.iter().any(|m| m.sub_id == sub(10) && m.kind == PubsubEventKind::Trigger));
}

#[test]
fn test_missing_accessor() {
    let (mut h, rx) = build();
    let sub_id = sub(11);
    add_missing(&mut h, sub_id, "ma0000000000042");
    add_missing(&mut h, sub_id, "shortcut");
    assert_eq!(h.subs.missing_entries().len(), 2);

    // an unrelated create leaves the index alone
    h.upsert_node(&id("ma0000000000041"), false).unwrap();
    destroy_deferred_events(&mut h);
    assert_eq!(h.subs.missing_entries().len(), 2);

    // the watched id arrives: one update and the key is dropped
    h.upsert_node(&id("ma0000000000042"), false).unwrap();
    send_deferred_events(&mut h);
    let msgs = drain(&rx);
    assert!(msgs.iter().any(|m| m.sub_id == sub_id));
    assert_eq!(h.subs.missing_entries().len(), 1);

    // same for an alias arriving
    h.update_alias("shortcut", &id("ma0000000000042")).unwrap();
    send_deferred_events(&mut h);
    assert!(drain(&rx).iter().any(|m| m.sub_id == sub_id));
    assert!(h.subs.missing_entries().is_empty());
}

#[test]
fn test_delete_marker_and_subscription() {
    let (mut h, _rx) = build();
    let sub_id = sub(12);
    add_descendants_marker(&mut h, sub_id, None);
    add_missing(&mut h, sub_id, "later");

    let key = MarkerKey { sub_id, marker_id: 1 };
    assert!(h.node(&NodeId::root()).unwrap().markers.contains(&key));

    delete_subscription(&mut h, &sub_id).unwrap();
    assert!(h.subs.subscription(&sub_id).is_none());
    assert!(h.subs.marker(&key).is_none());
    assert!(h.subs.missing_entries().is_empty());
    // teardown removed the marker from every node it was attached to
    assert!(!h.node(&NodeId::root()).unwrap().markers.contains(&key));
    assert!(!h.node(&id("ma0000000000001")).unwrap().markers.contains(&key));

    assert!(delete_subscription(&mut h, &sub_id).is_err());
    assert!(delete_marker(&mut h, &key).is_err());
}

#[test]
fn test_gen_marker_id() {
    let a = gen_marker_id(0, "shape-a");
    let b = gen_marker_id(0, "shape-b");
    let chained = gen_marker_id(a, "shape-b");
    // server generated ids always carry the MSB
    assert!(a < 0 && b < 0 && chained < 0);
    assert_ne!(a, b);
    assert_ne!(b, chained);
    assert_eq!(gen_marker_id(0, "shape-a"), a);
}
