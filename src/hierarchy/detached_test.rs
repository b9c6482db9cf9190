use super::*;

use crate::{
    hierarchy::{DelNodeFlags, SelvaHierarchy},
    sstring::SelvaString,
    Config,
};

fn id(s: &str) -> NodeId {
    NodeId::new(s.as_bytes())
}

fn build() -> SelvaHierarchy {
    let mut h = SelvaHierarchy::new(Config::default());
    let (a, b, c) = (id("da"), id("db"), id("dc"));
    h.set_hierarchy(&a, &[NodeId::root()], &[b]).unwrap();
    h.set_hierarchy(&b, &[a], &[c]).unwrap();
    h.node_mut(&b).unwrap().obj_mut().set_str("name", SelvaString::from_bytes(b"bee")).unwrap();
    h.node_mut(&c).unwrap().obj_mut().set_long_long("depth", 3).unwrap();
    h
}

#[test]
fn test_detach_and_restore() {
    let mut h = build();
    let (a, b, c) = (id("da"), id("db"), id("dc"));

    let (count, _) =
        h.del_node(&a, DelNodeFlags { detach: true, ..DelNodeFlags::default() }).unwrap();
    assert_eq!(count, 3);
    assert!(!h.node_exists(&a));
    assert!(!h.node_exists(&c));

    // the whole subtree is addressable by any of its former ids
    assert!(h.detached.contains(&a));
    assert!(h.detached.contains(&b));
    assert!(h.detached.contains(&c));
    assert_eq!(h.detached.len(), 3);

    let restored = restore_subtree(&mut h, &b).unwrap();
    assert_eq!(restored, 3);
    assert!(h.detached.is_empty());

    // nodes, fields and interior links came back
    assert!(h.node_exists(&a) && h.node_exists(&b) && h.node_exists(&c));
    assert_eq!(
        h.node(&b).unwrap().obj().get_str("name").unwrap().as_bytes(),
        b"bee"
    );
    assert_eq!(h.node(&c).unwrap().obj().get_long_long("depth").unwrap(), 3);
    assert!(h.node(&b).unwrap().has_child(&c));
    // the exterior link to the surviving parent is reinstated
    assert!(h.node(&a).unwrap().has_parent(&NodeId::root()));

    assert!(restore_subtree(&mut h, &b).is_err());
}

#[test]
fn test_upsert_restores_detached() {
    let mut h = build();
    let (a, c) = (id("da"), id("dc"));
    h.del_node(&a, DelNodeFlags { detach: true, ..DelNodeFlags::default() }).unwrap();

    // mentioning a detached id rehydrates instead of creating a shadow
    assert!(!h.upsert_node(&c, false).unwrap());
    assert!(h.node_exists(&a));
    assert_eq!(h.node(&c).unwrap().obj().get_long_long("depth").unwrap(), 3);
    assert!(h.detached.is_empty());
}

#[test]
fn test_on_disk_blob() {
    let mut h = build();
    let (a, b) = (id("da"), id("db"));
    h.del_node(&a, DelNodeFlags { detach: true, ..DelNodeFlags::default() }).unwrap();

    // force the blob out to its dump file and restore from there
    let path = spill_to_disk(&mut h, &a).unwrap();
    assert!(path.to_string_lossy().ends_with(".z"));
    assert!(path.exists());
    match h.detached.get(&b) {
        Some(DetachedStore::OnDisk(_)) => (),
        _ => panic!("expected an on-disk store"),
    }

    let restored = restore_subtree(&mut h, &b).unwrap();
    assert_eq!(restored, 3);
    assert!(h.node_exists(&a));
    // the dump file is gone after rehydration
    assert!(!path.exists());
}
