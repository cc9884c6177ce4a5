//! Lockstep crosschecks of the map at several node widths against
//! `std::collections::BTreeMap`.

use lazy_bptree::{BpTreeMap, Edit};
use proptest::prelude::*;
use std::collections::BTreeMap as StdMap;
use std::ops::ControlFlow;

mod common;
use common::*;

#[derive(Clone)]
struct Maps<K, V> {
    narrow: BpTreeMap<K, V>, // smallest allowed nodes: every split path gets exercised
    mid: BpTreeMap<K, V>,    // a small power of two
    dflt: BpTreeMap<K, V>,   // the default width
    wide: BpTreeMap<K, V>,   // the clamp ceiling
    std_map: StdMap<K, V>,
}

impl<K, V> Maps<K, V>
where
    K: Clone + Ord + std::fmt::Debug + Eq,
    V: Clone + std::fmt::Debug + Eq,
{
    fn sizes() -> [usize; 4] {
        [4, 8, 32, 256]
    }

    fn new(v: Vec<(K, V)>) -> Maps<K, V> {
        let [a, b, c, d] = Self::sizes();
        let mut maps = Maps {
            narrow: BpTreeMap::with_max_node_size(a),
            mid: BpTreeMap::with_max_node_size(b),
            dflt: BpTreeMap::with_max_node_size(c),
            wide: BpTreeMap::with_max_node_size(d),
            std_map: StdMap::new(),
        };
        maps.insert_all(v);
        maps
    }

    fn insert_all(&mut self, v: Vec<(K, V)>) {
        self.narrow.insert_all(v.clone()).unwrap();
        self.mid.insert_all(v.clone()).unwrap();
        self.dflt.insert_all(v.clone()).unwrap();
        self.wide.insert_all(v.clone()).unwrap();
        self.std_map.extend(v);
    }

    fn new_overlapping(u: Vec<(K, V)>, v: Vec<(K, V)>) -> (Maps<K, V>, Maps<K, V>) {
        let m1 = Self::new(u);
        let mut m2 = m1.clone();
        m2.insert_all(v);
        (m1, m2)
    }

    fn each_tree(&mut self, mut f: impl FnMut(&mut BpTreeMap<K, V>)) {
        f(&mut self.narrow);
        f(&mut self.mid);
        f(&mut self.dflt);
        f(&mut self.wide);
    }

    fn chk(&self) {
        for m in [&self.narrow, &self.mid, &self.dflt, &self.wide] {
            m.check_valid().unwrap();
            assert_eq!(m.len(), self.std_map.len());
            assert_same_entries(m.iter(), self.std_map.iter());
        }
    }
}

fn check_insert(v: PairBatch) {
    let maps = Maps::new(v);
    maps.chk();

    for (m, max) in [&maps.narrow, &maps.mid, &maps.dflt, &maps.wide]
        .into_iter()
        .zip(Maps::<u16, u16>::sizes())
    {
        assert_eq!(m.max_node_size(), max);
        assert!(m.height() <= height_bound(m.len(), max) || m.is_empty());
        assert_eq!(m.min_key(), maps.std_map.keys().next());
        assert_eq!(m.max_key(), maps.std_map.keys().next_back());
    }
}

fn check_get(v: PairBatch) {
    let maps = Maps::new(v);

    for k in (0u16..1024).step_by(7) {
        assert_eq!(maps.narrow.get(&k), maps.std_map.get(&k));
        assert_eq!(maps.wide.get(&k), maps.std_map.get(&k));
        assert_eq!(maps.narrow.contains_key(&k), maps.std_map.contains_key(&k));
    }
}

fn maps_remove(maps: &mut Maps<u16, u16>, k: u16) {
    let expect = maps.std_map.remove(&k);
    maps.each_tree(|m| assert_eq!(m.remove(&k).unwrap(), expect));
}

fn check_remove(v: PairBatch, doomed: Vec<u16>) {
    let mut maps = Maps::new(v);

    for k in doomed {
        maps_remove(&mut maps, k);
    }
    maps.chk();
}

fn check_clone_divergence(u: PairBatch, v: PairBatch, doomed: Vec<u16>) {
    let (m1, mut m2) = Maps::new_overlapping(u.clone(), v);
    let n1: StdMap<u16, u16> = u.into_iter().collect();

    for k in doomed {
        maps_remove(&mut m2, k);
    }

    // edits through the clone never show through the original
    m1.chk();
    assert_same_entries(m1.narrow.iter(), n1.iter());
    m2.chk();
}

fn check_iter_bounds(v: PairBatch, lo: u16, skip: bool) {
    let maps = Maps::new(v);

    assert_same_entries(maps.narrow.iter_from(&lo), maps.std_map.range(lo..));
    assert_same_entries(maps.wide.iter_from(&lo), maps.std_map.range(lo..));

    let rev = maps
        .std_map
        .range(..=lo)
        .rev()
        .skip_while(|e| skip && *e.0 == lo);
    assert_same_entries(maps.narrow.iter_rev_from(&lo, skip), rev);

    assert_same_entries(maps.narrow.iter_rev(), maps.std_map.iter().rev());
}

fn check_get_range(v: PairBatch, (lo, hi, inc): (u16, u16, bool)) {
    let maps = Maps::new(v);

    let expect: Vec<(u16, u16)> = maps
        .std_map
        .iter()
        .filter(|(k, _)| **k >= lo && (**k < hi || (inc && **k == hi)))
        .map(|(k, v)| (*k, *v))
        .collect();

    assert_eq!(maps.narrow.get_range(&lo, &hi, inc, None), expect);
    assert_eq!(maps.wide.get_range(&lo, &hi, inc, None), expect);

    let capped = maps.narrow.get_range(&lo, &hi, inc, Some(5));
    assert_eq!(capped.len(), expect.len().min(5));
    assert_eq!(capped[..], expect[..capped.len()]);
}

fn check_for_range_counter(v: PairBatch, (lo, hi, inc): (u16, u16, bool)) {
    let maps = Maps::new(v);

    let expect = maps
        .std_map
        .iter()
        .filter(|(k, _)| **k >= lo && (**k < hi || (inc && **k == hi)))
        .count();

    let mut seen = 0;
    let res = maps.narrow.for_range::<(), _>(&lo, &hi, inc, 7, |_, _, c| {
        assert_eq!(c, 7 + seen);
        seen += 1;
        ControlFlow::Continue(())
    });
    assert_eq!(res, ControlFlow::Continue(7 + expect));
    assert_eq!(seen, expect);
}

fn check_remove_range(v: PairBatch, (lo, hi, inc): (u16, u16, bool)) {
    let mut maps = Maps::new(v);

    let before = maps.std_map.len();
    maps.std_map
        .retain(|k, _| *k < lo || *k > hi || (*k == hi && !inc));
    let expect = before - maps.std_map.len();

    maps.each_tree(|m| assert_eq!(m.remove_range(&lo, &hi, inc).unwrap(), expect));
    maps.chk();
}

fn check_edit_range(v: PairBatch, (lo, hi, inc): (u16, u16, bool)) {
    let mut maps = Maps::new(v);

    let in_range = |k: u16| k >= lo && (k < hi || (inc && k == hi));
    maps.each_tree(|m| {
        m.edit_range::<(), _>(&lo, &hi, inc, 0, |k, v, _| {
            if k % 3 == 0 {
                Edit::Delete
            } else {
                Edit::Update(v.wrapping_add(1))
            }
        })
        .unwrap();
    });

    maps.std_map = maps
        .std_map
        .iter()
        .filter_map(|(k, v)| match (in_range(*k), k % 3 == 0) {
            (true, true) => None,
            (true, false) => Some((*k, v.wrapping_add(1))),
            (false, _) => Some((*k, *v)),
        })
        .collect();
    maps.chk();
}

fn check_edit_range_on_clone(u: PairBatch, (lo, hi, inc): (u16, u16, bool)) {
    let m1 = Maps::new(u);
    let mut m2 = m1.clone();

    m2.each_tree(|m| {
        m.edit_range::<(), _>(&lo, &hi, inc, 0, |_, _, _| Edit::Delete)
            .unwrap();
    });
    m2.std_map
        .retain(|k, _| *k < lo || *k > hi || (*k == hi && !inc));

    // un-sharing must stop at the edited paths
    m1.chk();
    m2.chk();
}

proptest! {
    #[test]
    fn qc_insert(v in pair_batches()) {
        check_insert(v);
    }

    #[test]
    fn qc_get(v in pair_batches()) {
        check_get(v);
    }

    #[test]
    fn qc_remove(
        v in pair_batches(),
        doomed in prop::collection::vec(0u16..1024, 0..256),
    ) {
        check_remove(v, doomed);
    }

    #[test]
    fn qc_clone_divergence(
        u in pair_batches(),
        v in pair_batches(),
        doomed in prop::collection::vec(0u16..1024, 0..256),
    ) {
        check_clone_divergence(u, v, doomed);
    }

    #[test]
    fn qc_iter_bounds(v in pair_batches(), lo in 0u16..1024, skip in any::<bool>()) {
        check_iter_bounds(v, lo, skip);
    }

    #[test]
    fn qc_get_range(v in pair_batches(), r in range_args_1k()) {
        check_get_range(v, r);
    }

    #[test]
    fn qc_for_range_counter(v in pair_batches(), r in range_args_1k()) {
        check_for_range_counter(v, r);
    }

    #[test]
    fn qc_remove_range(v in pair_batches(), r in range_args_1k()) {
        check_remove_range(v, r);
    }

    #[test]
    fn qc_edit_range(v in pair_batches(), r in range_args_1k()) {
        check_edit_range(v, r);
    }

    #[test]
    fn qc_edit_range_on_clone(v in pair_batches(), r in range_args_1k()) {
        check_edit_range_on_clone(v, r);
    }
}
