use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::collections::BTreeSet;

use super::*;

#[test]
fn test_sorted_insert() {
    let seed: u128 = random();
    println!("test_sorted_insert seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed as u64);

    let mut vec: SVector<i64> = SVector::new(4, Some(|a: &i64, b: &i64| a.cmp(b)));
    let mut reference = BTreeSet::new();

    for _ in 0..1000 {
        let v: i64 = rng.gen_range(-500..500);
        match vec.insert_fast(v) {
            Ok(()) => assert!(reference.insert(v)),
            Err(err) => {
                assert!(err.is_exists(), "{}", err);
                assert!(reference.contains(&v));
            }
        }
    }

    let collected: Vec<i64> = vec.iter().cloned().collect();
    let expected: Vec<i64> = reference.iter().cloned().collect();
    assert_eq!(collected, expected);

    for v in reference.iter() {
        assert_eq!(vec.search(v), Some(v));
        assert!(vec.contains(v));
    }
    assert_eq!(vec.search(&1000), None);

    // removals keep the order
    let victims: Vec<i64> = reference.iter().cloned().take(100).collect();
    for v in victims {
        assert_eq!(vec.remove(&v), Some(v));
        reference.remove(&v);
        assert_eq!(vec.remove(&v), None);
    }
    let collected: Vec<i64> = vec.iter().cloned().collect();
    let expected: Vec<i64> = reference.iter().cloned().collect();
    assert_eq!(collected, expected);
}

#[test]
fn test_sorted_insert_duplicates() {
    let mut vec: SVector<i64> = SVector::new(0, Some(|a: &i64, b: &i64| a.cmp(b)));
    vec.insert(5);
    vec.insert(5);
    vec.insert(1);
    assert_eq!(vec.as_slice(), &[1, 5, 5]);
    assert_eq!(vec.len(), 3);
}

#[test]
fn test_stack_mode() {
    let mut vec: SVector<&str> = SVector::new(2, None);
    vec.insert("a");
    vec.insert("b");
    vec.insert("c");
    assert_eq!(vec.as_slice(), &["a", "b", "c"]);

    assert_eq!(vec.get(1), Some(&"b"));
    assert_eq!(vec.get(3), None);
    assert_eq!(vec.set(1, "B").unwrap(), "b");
    assert!(vec.set(5, "x").is_err());
    vec.insert_index(0, "z").unwrap();
    assert_eq!(vec.as_slice(), &["z", "a", "B", "c"]);
    assert_eq!(vec.remove_index(2).unwrap(), "B");
    assert!(vec.remove_index(9).is_err());
    assert_eq!(vec.pop(), Some("c"));

    // search/remove are comparator-only
    assert_eq!(vec.search(&"a"), None);
    assert_eq!(vec.remove(&"a"), None);
    assert!(vec.insert_fast("q").is_err());

    vec.clear();
    assert!(vec.is_empty());
}

#[test]
fn test_clone() {
    let mut vec: SVector<i64> = SVector::new(0, Some(|a: &i64, b: &i64| a.cmp(b)));
    for v in [3, 1, 2].iter() {
        vec.insert(*v);
    }
    let dup = vec.clone();
    assert_eq!(dup.as_slice(), &[1, 2, 3]);
    assert_eq!(dup.to_vec(), vec![1, 2, 3]);
}
