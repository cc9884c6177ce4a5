//! Microbenchmarks of BpTreeMap against std's BTreeMap.
//!
//! Invoke with
//! ```
//!     cargo +nightly bench [partial_test_name] --test benchmarks \
//!         --features bench
//! ```
//!
//! The "bench" feature gates when this code is built, because `#[bench]`
//! requires `#![feature(test)]` which requires nightly.
//!
//! If "partial_test_name" is excluded, all benchmarks are run.  If given, any
//! test name that contains partial_test_name will run.
#![cfg(feature = "bench")]
#![feature(test)]

extern crate test;

// An xmacro that invokes the passed macro once per map type under test,
// using submodules to keep the short function names apart.
macro_rules! for_each_map_type {
    ( $macro_name:ident ) => {
        mod $macro_name {
            mod std_btreemap {
                use std::collections::BTreeMap;
                use test::Bencher;

                $macro_name!(BTreeMap);
            }

            mod bptree_default {
                use test::Bencher;

                type BpMap<K, V> = lazy_bptree::BpTreeMap<K, V>;

                $macro_name!(BpMap);
            }
        }
    };
}

// a simple pseudo-random stream so all maps see the same workload
fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x
}

trait Bench {
    fn b_insert(&mut self, k: u64, v: u64);
    fn b_get(&self, k: &u64) -> Option<&u64>;
}

impl Bench for std::collections::BTreeMap<u64, u64> {
    fn b_insert(&mut self, k: u64, v: u64) {
        self.insert(k, v);
    }

    fn b_get(&self, k: &u64) -> Option<&u64> {
        self.get(k)
    }
}

impl Bench for lazy_bptree::BpTreeMap<u64, u64> {
    fn b_insert(&mut self, k: u64, v: u64) {
        self.insert(k, v).unwrap();
    }

    fn b_get(&self, k: &u64) -> Option<&u64> {
        self.get(k)
    }
}

macro_rules! bench_insert_1k {
    ( $map_t:ident ) => {
        #[bench]
        fn f(b: &mut Bencher) {
            b.iter(|| {
                let mut m = $map_t::default();
                for i in 0..1000u64 {
                    crate::Bench::b_insert(&mut m, crate::mix(i), i);
                }
                m
            });
        }
    };
}

macro_rules! bench_get_hit {
    ( $map_t:ident ) => {
        #[bench]
        fn f(b: &mut Bencher) {
            let mut m = $map_t::default();
            for i in 0..1000u64 {
                crate::Bench::b_insert(&mut m, crate::mix(i), i);
            }
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % 1000;
                crate::Bench::b_get(&m, &crate::mix(i))
            });
        }
    };
}

for_each_map_type!(bench_insert_1k);
for_each_map_type!(bench_get_hit);

mod clone_heavy {
    use test::Bencher;

    // the point of the structure: snapshot, touch a little, repeat
    #[bench]
    fn bptree_clone_then_edit(b: &mut Bencher) {
        let mut base = lazy_bptree::BpTreeMap::new();
        for i in 0..10_000u64 {
            base.insert(crate::mix(i), i).unwrap();
        }

        b.iter(|| {
            let mut snap = base.clone();
            snap.insert(crate::mix(3), 0).unwrap();
            snap.remove(&crate::mix(7)).unwrap();
            snap
        });
    }

    #[bench]
    fn std_clone_then_edit(b: &mut Bencher) {
        let mut base = std::collections::BTreeMap::new();
        for i in 0..10_000u64 {
            base.insert(crate::mix(i), i);
        }

        b.iter(|| {
            let mut snap = base.clone();
            snap.insert(crate::mix(3), 0);
            snap.remove(&crate::mix(7));
            snap
        });
    }
}
