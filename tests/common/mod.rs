use proptest::prelude::*;

// materialise both sides so a mismatch shows the whole sequence, not just
// the first differing pair
#[allow(dead_code)]
pub(super) fn assert_same_entries<I, J>(actual: I, expected: J)
where
    I: Iterator,
    J: Iterator<Item = I::Item>,
    I::Item: std::fmt::Debug + PartialEq,
{
    let actual: Vec<_> = actual.collect();
    let expected: Vec<_> = expected.collect();
    assert_eq!(actual, expected);
}

pub(super) type PairBatch = Vec<(u16, u16)>;

// keys drawn from a small space so overwrites and collisions are common
pub(super) fn pair_batches() -> impl Strategy<Value = PairBatch> {
    prop::collection::vec((0u16..1024, any::<u16>()), 0..512)
}

// (lo, hi, include_high) with lo <= hi, spanning the same key space
#[allow(dead_code)]
pub(super) fn range_args_1k() -> impl Strategy<Value = (u16, u16, bool)> {
    (0u16..1024, 0u16..1024, any::<bool>())
        .prop_map(|(a, b, inc)| if a <= b { (a, b, inc) } else { (b, a, inc) })
}

// smallest occupancy h levels can reach, for the height bound
#[allow(dead_code)]
pub(super) fn height_bound(entries: usize, max_node_size: usize) -> usize {
    let min = (max_node_size + 1) / 2;
    let mut bound = 0;
    let mut reach = 1u128;
    while reach < (entries + 1) as u128 {
        reach *= min as u128;
        bound += 1;
    }
    bound.max(1)
}
