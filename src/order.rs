//! The ordering contract for tree keys.
//!
//! A tree is built over a [`Comparator`], a total order that must stay
//! consistent for the tree's whole lifetime.  The default, [`NaturalOrder`],
//! delegates to [`Ord`] and therefore covers integers, strings, lexicographic
//! `Vec`s and slices, `SystemTime`, and so on.  Floating-point keys are not
//! `Ord`; wrap [`total_f64`] or [`total_f32`] in a [`FnComparator`] to order
//! them totally, with NaN placed consistently at the extremes.

use std::cmp::Ordering;

/// A total order over `K`.
///
/// The order must be deterministic across the lifetime of any tree using it;
/// trees do not guard against a comparator that changes its mind.  Two keys
/// comparing `Equal` denote the same entry.
pub trait Comparator<K> {
    fn cmp(&self, a: &K, b: &K) -> Ordering;
}

/// The default order, delegating to `Ord`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    #[inline]
    fn cmp(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Adapts a comparison function into a [`Comparator`].
///
/// # Examples
/// ```
/// use lazy_bptree::{BpTreeMap, FnComparator};
///
/// let mut m = BpTreeMap::with_comparator(FnComparator(lazy_bptree::total_f64));
/// m.insert(1.5, "a").unwrap();
/// m.insert(f64::NAN, "nan").unwrap();
/// assert_eq!(m.max_key().map(|k| k.is_nan()), Some(true));
/// ```
#[derive(Clone, Copy, Debug)]
pub struct FnComparator<F>(pub F);

impl<K, F> Comparator<K> for FnComparator<F>
where
    F: Fn(&K, &K) -> Ordering,
{
    #[inline]
    fn cmp(&self, a: &K, b: &K) -> Ordering {
        (self.0)(a, b)
    }
}

/// Total order over `f64`, NaN included.
#[inline]
pub fn total_f64(a: &f64, b: &f64) -> Ordering {
    a.total_cmp(b)
}

/// Total order over `f32`, NaN included.
#[inline]
pub fn total_f32(a: &f32, b: &f32) -> Ordering {
    a.total_cmp(b)
}
