#![feature(test)]
extern crate test;

use test::Bencher;

use cart::{Art, ArtKey};

#[bench]
fn bench_art_insert(b: &mut Bencher) {
    let index = Art::new("bench_art_insert", |tid, key: &mut ArtKey| key.set_u64(tid));
    let ti = index.thread_info();
    let mut n = 0_u64;
    b.iter(|| {
        n += 1;
        index.insert(&ArtKey::from(n), n, &ti)
    });
}

#[bench]
fn bench_art_lookup(b: &mut Bencher) {
    let index = Art::new("bench_art_lookup", |tid, key: &mut ArtKey| key.set_u64(tid));
    let ti = index.thread_info();
    for n in 0..100_000_u64 {
        index.insert(&ArtKey::from(n), n, &ti);
    }
    let mut n = 0_u64;
    b.iter(|| {
        n = (n + 1) % 100_000;
        index.lookup(&ArtKey::from(n), &ti)
    });
}

#[bench]
fn bench_art_range(b: &mut Bencher) {
    let index = Art::new("bench_art_range", |tid, key: &mut ArtKey| key.set_u64(tid));
    let ti = index.thread_info();
    for n in 0..100_000_u64 {
        index.insert(&ArtKey::from(n), n, &ti);
    }
    let mut n = 0_u64;
    b.iter(|| {
        n = (n + 1) % 90_000;
        index.lookup_range(&ArtKey::from(n), &ArtKey::from(n + 100), 128, &ti)
    });
}

#[bench]
fn bench_key_encode(b: &mut Bencher) {
    let mut n = 0_u64;
    b.iter(|| {
        n += 1;
        ArtKey::from(n)
    });
}
