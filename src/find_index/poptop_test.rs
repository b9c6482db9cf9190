use super::*;

#[test]
fn test_maybe_add_and_rescore() {
    let mut top = PopTop::new(4);
    assert!(top.is_empty());
    assert!(top.maybe_add(1.0, b"a"));
    assert!(top.maybe_add(2.0, b"b"));
    assert!(top.contains(b"a"));
    assert_eq!(top.len(), 2);

    // re-adding re-scores in place
    assert!(top.maybe_add(5.0, b"a"));
    assert_eq!(top.len(), 2);

    top.remove(b"a");
    assert!(!top.contains(b"a"));
}

#[test]
fn test_maintenance_drops_half() {
    let mut top = PopTop::new(16);
    for i in 0..8_u32 {
        top.maybe_add(i as f32, format!("p{}", i).as_bytes());
    }
    let dropped = top.maintenance();
    assert_eq!(dropped.len(), 4);
    assert_eq!(top.len(), 4);
    // the dropped ones are the low scorers
    for p in dropped.iter() {
        let s = String::from_utf8_lossy(p);
        let i: u32 = s[1..].parse().unwrap();
        assert!(i < 4, "{}", s);
    }
    // the cut limit rose to the weakest kept score
    assert_eq!(top.cut_limit(), 4.0);

    // entries below the cut are rejected now
    assert!(!top.maybe_add(0.5, b"weak"));
    assert!(top.maybe_add(9.0, b"strong"));
}

#[test]
fn test_maintenance_respects_max() {
    let mut top = PopTop::new(3);
    for i in 0..10_u32 {
        top.maybe_add(i as f32, format!("p{}", i).as_bytes());
    }
    top.maintenance();
    assert!(top.len() <= 3);
    let best: Vec<f32> = top.iter().map(|(s, _)| s).collect();
    assert_eq!(best, vec![9.0, 8.0, 7.0]);
}
