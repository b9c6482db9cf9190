use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_hll_empty() {
    let hll = HyperLogLog::new();
    assert!(hll.is_empty());
    assert_eq!(hll.count(), 0);
}

#[test]
fn test_hll_add() {
    let mut hll = HyperLogLog::new();
    assert!(hll.add(b"one"));
    // re-adding the same element never changes the sketch
    assert!(!hll.add(b"one"));
    assert!(!hll.is_empty());
    assert_eq!(hll.count(), 1);

    hll.add(b"two");
    hll.add(b"three");
    assert_eq!(hll.count(), 3);
}

#[test]
fn test_hll_estimate() {
    let seed: u128 = random();
    println!("test_hll_estimate seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed as u64);

    let mut hll = HyperLogLog::new();
    let n = 50_000_u64;
    for _ in 0..n {
        let v: u64 = rng.gen();
        hll.add(&v.to_le_bytes());
    }
    let est = hll.count() as f64;
    let err = (est - n as f64).abs() / n as f64;
    // 4096 registers give ~1.6% standard error; 10% is a safe bound
    assert!(err < 0.1, "estimate {} for {}", est, n);
}

#[test]
fn test_hll_serialize() {
    let mut hll = HyperLogLog::new();
    for i in 0..100_u32 {
        hll.add(&i.to_le_bytes());
    }
    let bytes = hll.to_bytes();
    let back = HyperLogLog::from_bytes(&bytes).unwrap();
    assert_eq!(back, hll);
    assert_eq!(back.count(), hll.count());

    assert!(HyperLogLog::from_bytes(b"short").is_err());
}
