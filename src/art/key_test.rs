use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_key_u64_roundtrip() {
    let seed: u128 = random();
    println!("test_key_u64_roundtrip seed:{}", seed);
    let mut rng = SmallRng::from_seed({
        let mut s = [0u8; 32];
        s[..16].copy_from_slice(&seed.to_le_bytes());
        s
    });

    for _ in 0..1000 {
        let n: u64 = rng.gen();
        let key = ArtKey::from(n);
        assert_eq!(key.len(), 8);
        assert_eq!(key.to_u64(), Some(n));
    }
}

#[test]
fn test_key_order() {
    let seed: u128 = random();
    println!("test_key_order seed:{}", seed);
    let mut rng = SmallRng::from_seed({
        let mut s = [0u8; 32];
        s[..16].copy_from_slice(&seed.to_le_bytes());
        s
    });

    for _ in 0..1000 {
        let (a, b): (u64, u64) = (rng.gen(), rng.gen());
        let (ka, kb) = (ArtKey::from(a), ArtKey::from(b));
        assert_eq!(ka.cmp(&kb), a.cmp(&b), "{} {}", a, b);
    }

    // big-endian keeps numeric order under byte-wise comparison.
    assert!(ArtKey::from(0x0100_u64) > ArtKey::from(0x00FF_u64));
    assert!(ArtKey::from(1_u64) < ArtKey::from(0x0100_0000_0000_0000_u64));
}

#[test]
fn test_key_inline_heap() {
    let inline = vec![0xAB_u8; INLINE_KEY_LEN];
    let heap = vec![0xAB_u8; INLINE_KEY_LEN + 1];

    let ki = ArtKey::from(inline.as_slice());
    let kh = ArtKey::from(heap.as_slice());
    assert_eq!(ki.len(), INLINE_KEY_LEN);
    assert_eq!(kh.len(), INLINE_KEY_LEN + 1);
    assert_eq!(ki.as_bytes(), inline.as_slice());
    assert_eq!(kh.as_bytes(), heap.as_slice());
    assert!(ki < kh);

    // moves transfer the heap buffer.
    let km = kh;
    assert_eq!(km.as_bytes(), heap.as_slice());

    let mut k = ArtKey::default();
    assert!(k.is_empty());
    k.set(&heap);
    k.set(&inline);
    assert_eq!(k.as_bytes(), inline.as_slice());
}

#[test]
fn test_key_composite() {
    let key = ArtKey::from_composite(&[&1_u64.to_be_bytes(), &2_u32.to_be_bytes()]);
    assert_eq!(key.len(), 12);
    assert_eq!(&key.as_bytes()[..8], &1_u64.to_be_bytes());
    assert_eq!(&key.as_bytes()[8..], &2_u32.to_be_bytes());
    assert_eq!(key[7], 1);
    assert_eq!(key.to_u64(), None);
}

#[test]
fn test_key_eq() {
    let (a, b) = (ArtKey::from(42_u64), ArtKey::from(42_u64));
    assert_eq!(a, b);
    assert_ne!(a, ArtKey::from(43_u64));
    assert_ne!(a, ArtKey::from(&b"*"[..]));
}
