use super::*;

#[test]
fn test_scalar_round_trip() {
    let mut obj = SelvaObject::new();

    obj.set_double("score", 1.5).unwrap();
    obj.set_long_long("count", 42).unwrap();
    obj.set_str("name", SelvaString::from_bytes(b"selva")).unwrap();

    assert_eq!(obj.get_double("score").unwrap(), 1.5);
    assert_eq!(obj.get_long_long("count").unwrap(), 42);
    assert_eq!(obj.get_str("name").unwrap().as_bytes(), b"selva");
    assert_eq!(obj.key_count(), 3);

    assert_eq!(obj.get_type("score"), ValueType::Double);
    assert_eq!(obj.get_type("missing"), ValueType::Null);
    assert!(obj.exists("count"));
    assert!(!obj.exists("missing"));

    // getter type errors
    assert!(matches!(obj.get_double("name"), Err(crate::Error::TypeMismatch(_, _))));
    assert!(matches!(obj.get_double("missing"), Err(crate::Error::NotFound(_, _))));

    // set/del round trip
    obj.del_key("score").unwrap();
    assert!(!obj.exists("score"));
    assert!(obj.del_key("score").is_err());
}

#[test]
fn test_nested_paths() {
    let mut obj = SelvaObject::new();

    // CREATE mode materializes intermediate objects
    obj.set_long_long("a.b.c", 7).unwrap();
    assert_eq!(obj.get_long_long("a.b.c").unwrap(), 7);
    assert_eq!(obj.get_type("a"), ValueType::Object);
    assert_eq!(obj.get_type("a.b"), ValueType::Object);
    assert!(obj.exists_top_level("a.zzz"));
    assert!(!obj.exists_top_level("b.zzz"));

    // descending through a non-object fails
    assert!(obj.set_double("a.b.c.d", 1.0).is_err());

    let o = obj.get_object("a.b").unwrap();
    assert_eq!(o.key_count(), 1);

    // destructive replace drops the whole subtree
    obj.set_long_long("a", 1).unwrap();
    assert_eq!(obj.get_type("a"), ValueType::LongLong);
    assert!(!obj.exists("a.b.c"));
}

#[test]
fn test_default_and_update() {
    let mut obj = SelvaObject::new();

    obj.set_long_long_default("n", 5).unwrap();
    assert_eq!(obj.get_long_long("n").unwrap(), 5);
    // default only sets when absent
    obj.set_long_long_default("n", 9).unwrap();
    assert_eq!(obj.get_long_long("n").unwrap(), 5);

    obj.set_double_default("d", 0.5).unwrap();
    obj.set_double_default("d", 9.9).unwrap();
    assert_eq!(obj.get_double("d").unwrap(), 0.5);

    obj.set_str_default("s", SelvaString::from_bytes(b"x")).unwrap();
    obj.set_str_default("s", SelvaString::from_bytes(b"y")).unwrap();
    assert_eq!(obj.get_str("s").unwrap().as_bytes(), b"x");

    // update returns Exists on no-op so callers can skip change events
    assert!(obj.update_long_long("n", 5).unwrap_err().is_exists());
    obj.update_long_long("n", 6).unwrap();
    assert_eq!(obj.get_long_long("n").unwrap(), 6);

    assert!(obj.update_double("d", 0.5).unwrap_err().is_exists());
    obj.update_double("d", 0.75).unwrap();

    assert!(obj
        .update_str("s", SelvaString::from_bytes(b"x"))
        .unwrap_err()
        .is_exists());
    obj.update_str("s", SelvaString::from_bytes(b"z")).unwrap();
}

#[test]
fn test_increment() {
    let mut obj = SelvaObject::new();

    // absent key takes the default without applying incr
    assert_eq!(obj.increment_long_long("n", 10, 3).unwrap(), 10);
    assert_eq!(obj.increment_long_long("n", 10, 3).unwrap(), 13);

    assert_eq!(obj.increment_double("d", 0.5, 0.25).unwrap(), 0.5);
    assert_eq!(obj.increment_double("d", 0.5, 0.25).unwrap(), 0.75);

    obj.set_str("s", SelvaString::from_bytes(b"x")).unwrap();
    assert!(obj.increment_long_long("s", 0, 1).is_err());
}

#[test]
fn test_increment_array_slot() {
    let mut obj = SelvaObject::new();

    // an absent slot initializes from the array default fill, then the
    // increment applies
    assert_eq!(obj.increment_double("a[2]", 9.0, 1.5).unwrap(), 1.5);
    assert_eq!(obj.get_array_len("a"), 3);
    assert_eq!(obj.get_double("a[0]").unwrap(), 0.0);
    assert_eq!(obj.get_double("a[2]").unwrap(), 1.5);

    // existing slot increments in place, negative index counts from the
    // end
    assert_eq!(obj.increment_double("a[-1]", 9.0, 1.5).unwrap(), 3.0);
    assert_eq!(obj.increment_long_long("b[0]", 7, 2).unwrap(), 2);

    // a negative index cannot address a slot before the first element
    assert!(obj.increment_double("c[-1]", 0.0, 1.0).is_err());
}

#[test]
fn test_arrays() {
    let mut obj = SelvaObject::new();

    obj.insert_array("arr", ArrayItem::LongLong(1)).unwrap();
    obj.insert_array("arr", ArrayItem::LongLong(2)).unwrap();
    obj.insert_array("arr", ArrayItem::LongLong(3)).unwrap();
    assert_eq!(obj.get_array_len("arr"), 3);
    assert_eq!(obj.get_array("arr").unwrap().subtype(), ValueType::LongLong);

    // the sub-type is fixed at first insert
    assert!(obj.insert_array("arr", ArrayItem::Double(1.0)).is_err());

    // negative index addresses from the end
    assert_eq!(obj.get_long_long("arr[-1]").unwrap(), 3);
    assert_eq!(obj.get_long_long("arr[2]").unwrap(), 3);
    assert!(obj.get_long_long("arr[3]").is_err());
    assert!(obj.get_long_long("arr[-4]").is_err());

    obj.assign_array_index("arr", 1, ArrayItem::LongLong(20)).unwrap();
    assert_eq!(obj.get_long_long("arr[1]").unwrap(), 20);

    obj.insert_array_index("arr", 0, ArrayItem::LongLong(0)).unwrap();
    assert_eq!(obj.get_array_len("arr"), 4);
    assert_eq!(obj.get_long_long("arr[0]").unwrap(), 0);

    // removal shrinks by one
    obj.remove_array_index("arr", 0).unwrap();
    assert_eq!(obj.get_array_len("arr"), 3);
    assert!(obj.remove_array_index("arr", 10).is_err());

    // assign past the end grows with default fill
    obj.assign_array_index("arr", 5, ArrayItem::LongLong(9)).unwrap();
    assert_eq!(obj.get_array_len("arr"), 6);
    assert_eq!(obj.get_long_long("arr[4]").unwrap(), 0);

    // array of nested objects, indexed mid-path
    obj.set_str("objs[0].name", SelvaString::from_bytes(b"first")).unwrap();
    obj.set_str("objs[1].name", SelvaString::from_bytes(b"second")).unwrap();
    assert_eq!(obj.get_str("objs[1].name").unwrap().as_bytes(), b"second");
    assert_eq!(obj.get_array_len("objs"), 2);
}

#[test]
fn test_sets_in_object() {
    let mut obj = SelvaObject::new();

    obj.add_set_long_long("tags", 1).unwrap();
    obj.add_set_long_long("tags", 2).unwrap();
    assert!(obj.add_set_long_long("tags", 2).unwrap_err().is_exists());

    // element type fixed at first insert
    assert!(matches!(
        obj.add_set_double("tags", 0.5),
        Err(crate::Error::TypeMismatch(_, _))
    ));

    let set = obj.get_set("tags").unwrap();
    assert_eq!(set.size(), 2);

    obj.rem_set_long_long("tags", 1).unwrap();
    assert!(obj.rem_set_long_long("tags", 1).is_err());
    assert_eq!(obj.get_set("tags").unwrap().size(), 1);

    obj.add_set_str("names", SelvaString::from_bytes(b"a")).unwrap();
    obj.rem_set_str("names", &SelvaString::from_bytes(b"a")).unwrap();

    obj.add_set_node_id("ids", NodeId::new(b"ma1")).unwrap();
    assert!(obj.get_set("ids").unwrap().has_node_id(&NodeId::new(b"ma1")));
    obj.rem_set_node_id("ids", &NodeId::new(b"ma1")).unwrap();
}

#[test]
fn test_hll_field() {
    let mut obj = SelvaObject::new();
    assert!(obj.add_hll("visitors", b"alice").unwrap());
    assert!(!obj.add_hll("visitors", b"alice").unwrap());
    assert!(obj.add_hll("visitors", b"bob").unwrap());
    assert_eq!(obj.get_type("visitors"), ValueType::Hll);
    assert_eq!(obj.len_of("visitors").unwrap(), 2);

    obj.set_long_long("n", 1).unwrap();
    assert!(obj.add_hll("n", b"x").is_err());
}

#[test]
fn test_pointer_field() {
    let mut obj = SelvaObject::new();
    let p = SelvaPointer::new(0, Rc::new(42_u32));
    obj.set_pointer("ptr", p).unwrap();
    assert_eq!(obj.get_type("ptr"), ValueType::Pointer);
    let got = obj.get_pointer("ptr").unwrap();
    assert_eq!(got.value.downcast_ref::<u32>(), Some(&42));
    assert_eq!(got.len(), 0);
    // without hooks the pointer replies null
    assert_eq!(got.reply(), crate::proto::Value::Null);

    let mut hooked = SelvaPointer::new(1, Rc::new(7_u32));
    hooked.len_cb = Some(|_| 1);
    hooked.reply_cb =
        Some(|v| crate::proto::Value::LongLong(*v.downcast_ref::<u32>().unwrap() as i64));
    assert_eq!(hooked.len(), 1);
    assert_eq!(hooked.reply(), crate::proto::Value::LongLong(7));
}

#[test]
fn test_user_meta_and_text() {
    let mut obj = SelvaObject::new();
    obj.set_str("title.en", SelvaString::from_bytes(b"Home")).unwrap();
    obj.set_str("title.fi", SelvaString::from_bytes(b"Koti")).unwrap();
    obj.set_user_meta("title", META_SUBTYPE_TEXT).unwrap();
    assert_eq!(obj.get_user_meta("title").unwrap(), META_SUBTYPE_TEXT);

    // text objects dereference through the language preference list
    match obj.get_any_lang("title", &["fi", "en"]).unwrap() {
        ValueView::Str(s) => assert_eq!(s.as_bytes(), b"Koti"),
        v => panic!("unexpected {:?}", v),
    }
    match obj.get_any_lang("title", &["de", "en"]).unwrap() {
        ValueView::Str(s) => assert_eq!(s.as_bytes(), b"Home"),
        v => panic!("unexpected {:?}", v),
    }
    // unknown languages fall back to the first translation
    match obj.get_any_lang("title", &["xx"]).unwrap() {
        ValueView::Str(s) => assert_eq!(s.as_bytes(), b"Home"),
        v => panic!("unexpected {:?}", v),
    }

    assert!(obj.get_user_meta("missing").is_err());
    assert!(obj.set_user_meta("missing", 1).is_err());
}

#[test]
fn test_clear_and_len() {
    let mut obj = SelvaObject::new();
    obj.set_long_long("a", 1).unwrap();
    obj.set_long_long("b", 2).unwrap();
    obj.set_str("c", SelvaString::from_bytes(b"xyz")).unwrap();

    assert_eq!(obj.len_of("").unwrap(), 3);
    assert_eq!(obj.len_of("c").unwrap(), 3);
    assert_eq!(obj.len_of("a").unwrap(), 1);

    obj.clear(&["b"]);
    assert_eq!(obj.key_count(), 1);
    assert!(obj.exists("b"));
}

#[test]
fn test_wildcard() {
    let mut obj = SelvaObject::new();
    obj.set_long_long("a.x.v", 1).unwrap();
    obj.set_long_long("a.y.v", 2).unwrap();
    obj.set_long_long("a.z.other", 3).unwrap();

    let mut paths = obj.wildcard_paths("a.*.v");
    paths.sort();
    assert_eq!(paths, vec!["a.x.v".to_string(), "a.y.v".to_string()]);

    let paths = obj.wildcard_paths("*.z.other");
    assert_eq!(paths, vec!["a.z.other".to_string()]);

    assert!(obj.wildcard_paths("a.*.missing").is_empty());
}

#[test]
fn test_key_name_limits() {
    let mut obj = SelvaObject::new();
    assert!(obj.set_long_long("", 1).is_err());
    assert!(obj.set_long_long("a..b", 1).is_err());
    let long = "k".repeat(KEY_NAME_MAX + 1);
    assert!(matches!(
        obj.set_long_long(&long, 1),
        Err(crate::Error::NameTooLong(_, _))
    ));

    // inline header keys spill transparently past the inline capacity
    for i in 0..16 {
        obj.set_long_long(&format!("key{:02}", i), i as i64).unwrap();
    }
    assert_eq!(obj.key_count(), 16);
    for i in 0..16 {
        assert_eq!(obj.get_long_long(&format!("key{:02}", i)).unwrap(), i as i64);
    }
}
