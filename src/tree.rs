//! The copy-on-write B+ tree behind [`BpTreeMap`].
//!
//! All entries live in leaves; internal nodes route lookups through
//! per-child max keys.  Nodes are held through [`Arc`], so cloning a map is
//! one pointer copy and a write that reaches a node with other holders
//! clones just that node's path.

use std::cmp::Ordering::*;
use std::mem::replace;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::error::{TreeError, TreeResult};
use crate::order::{Comparator, NaturalOrder};

pub mod cursor;

pub use cursor::{Iter, RevIter};

/// Smallest accepted node size; smaller requests are clamped up.
pub const MIN_NODE_SIZE: usize = 4;
/// Largest accepted node size; larger requests are clamped down.
pub const MAX_NODE_SIZE: usize = 256;
/// Node size used when none is given.
pub const DEFAULT_NODE_SIZE: usize = 32;

// lower occupancy bound for non-root nodes after a completed point delete
const fn min_fill(max: usize) -> usize {
    (max + 1) / 2
}

type NodePtr<K, V> = Arc<Node<K, V>>;

#[derive(Clone)]
enum Node<K, V> {
    Leaf(Leaf<K, V>),
    Branch(Branch<K, V>),
}

#[derive(Clone)]
struct Leaf<K, V> {
    keys: Vec<K>,
    vals: Vec<V>,
}

#[derive(Clone)]
struct Branch<K, V> {
    // maxes[i] is the greatest key anywhere under kids[i]
    maxes: Vec<K>,
    kids: Vec<NodePtr<K, V>>,
}

// we implement our own default to avoid Default constraints on K and V
impl<K, V> Default for Leaf<K, V> {
    fn default() -> Self {
        Leaf {
            keys: Vec::new(),
            vals: Vec::new(),
        }
    }
}

enum Ins<K, V> {
    Added,
    // self kept the lower half; the parent adopts the new right sibling
    AddedSplit(NodePtr<K, V>),
    Replaced(V),
    Ignored,
}

struct Underfull(bool);

// binary search for an exact match; Err holds the insertion point
fn bsearch<K, C: Comparator<K>>(keys: &[K], key: &K, order: &C) -> Result<usize, usize> {
    let mut lo = 0;
    let mut hi = keys.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match order.cmp(key, &keys[mid]) {
            Less => hi = mid,
            Equal => return Ok(mid),
            Greater => lo = mid + 1,
        }
    }
    Err(lo)
}

// index of the first key >= the target, possibly keys.len()
fn lower_bound<K, C: Comparator<K>>(keys: &[K], key: &K, order: &C) -> usize {
    let mut lo = 0;
    let mut hi = keys.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if order.cmp(&keys[mid], key) == Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

// index of the first key > the target, possibly keys.len()
fn upper_bound<K, C: Comparator<K>>(keys: &[K], key: &K, order: &C) -> usize {
    let mut lo = 0;
    let mut hi = keys.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if order.cmp(&keys[mid], key) == Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

impl<K, V> Node<K, V> {
    fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.keys.len(),
            Node::Branch(b) => b.kids.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn max_key(&self) -> &K {
        match self {
            Node::Leaf(leaf) => leaf.keys.last().expect("max_key of an empty node"),
            Node::Branch(b) => b.maxes.last().expect("max_key of an empty node"),
        }
    }
}

impl<K: Clone, V: Clone> Node<K, V> {
    fn set<C: Comparator<K>>(
        &mut self,
        key: K,
        val: V,
        overwrite: bool,
        max: usize,
        order: &C,
    ) -> Ins<K, V> {
        match self {
            Node::Leaf(leaf) => leaf.set(key, val, overwrite, max, order),
            Node::Branch(b) => b.set(key, val, overwrite, max, order),
        }
    }

    fn remove<C: Comparator<K>>(&mut self, key: &K, max: usize, order: &C) -> Option<(V, Underfull)> {
        match self {
            Node::Leaf(leaf) => {
                let i = bsearch(&leaf.keys, key, order).ok()?;
                leaf.keys.remove(i);
                let val = leaf.vals.remove(i);
                Some((val, Underfull(leaf.keys.len() < min_fill(max))))
            }
            Node::Branch(b) => b.remove(key, max, order),
        }
    }

    fn get_mut<C: Comparator<K>>(&mut self, key: &K, order: &C) -> Option<&mut V> {
        match self {
            Node::Leaf(leaf) => {
                let i = bsearch(&leaf.keys, key, order).ok()?;
                Some(&mut leaf.vals[i])
            }
            Node::Branch(b) => {
                let i = lower_bound(&b.maxes, key, order);
                let rc = b.kids.get_mut(i)?;
                Arc::make_mut(rc).get_mut(key, order)
            }
        }
    }
}

impl<K: Clone, V: Clone> Leaf<K, V> {
    fn set<C: Comparator<K>>(
        &mut self,
        key: K,
        val: V,
        overwrite: bool,
        max: usize,
        order: &C,
    ) -> Ins<K, V> {
        match bsearch(&self.keys, &key, order) {
            Ok(i) => {
                if overwrite {
                    // the key slot is replaced too; equal keys may carry
                    // payload the ordering does not see
                    self.keys[i] = key;
                    Ins::Replaced(replace(&mut self.vals[i], val))
                } else {
                    Ins::Ignored
                }
            }

            Err(i) => {
                if self.keys.len() < max {
                    self.keys.insert(i, key);
                    self.vals.insert(i, val);
                    return Ins::Added;
                }

                // full: keep the lower half, hand the rest to a new right
                // sibling, and drop the new entry into whichever side covers it
                let half = min_fill(max);
                let mut right = Leaf {
                    keys: self.keys.split_off(half),
                    vals: self.vals.split_off(half),
                };

                if i < half {
                    self.keys.insert(i, key);
                    self.vals.insert(i, val);
                } else {
                    right.keys.insert(i - half, key);
                    right.vals.insert(i - half, val);
                }

                Ins::AddedSplit(Arc::new(Node::Leaf(right)))
            }
        }
    }
}

impl<K: Clone, V: Clone> Branch<K, V> {
    fn set<C: Comparator<K>>(
        &mut self,
        key: K,
        val: V,
        overwrite: bool,
        max: usize,
        order: &C,
    ) -> Ins<K, V> {
        let mut i = lower_bound(&self.maxes, &key, order);
        if i == self.kids.len() {
            // past every max: the last child absorbs the new greatest key
            i -= 1;
        }

        match Arc::make_mut(&mut self.kids[i]).set(key, val, overwrite, max, order) {
            Ins::Added => {
                self.refresh_max(i, order);
                Ins::Added
            }

            Ins::AddedSplit(right) => {
                self.refresh_max(i, order);
                self.maxes.insert(i + 1, right.max_key().clone());
                self.kids.insert(i + 1, right);

                if self.kids.len() <= max {
                    Ins::Added
                } else {
                    self.split(max)
                }
            }

            done => done,
        }
    }

    // split this overcrowded node
    fn split(&mut self, max: usize) -> Ins<K, V> {
        let half = min_fill(max);
        let right = Branch {
            maxes: self.maxes.split_off(half),
            kids: self.kids.split_off(half),
        };
        Ins::AddedSplit(Arc::new(Node::Branch(right)))
    }

    fn remove<C: Comparator<K>>(&mut self, key: &K, max: usize, order: &C) -> Option<(V, Underfull)> {
        let i = lower_bound(&self.maxes, key, order);
        if i == self.kids.len() {
            // greater than everything in this subtree
            return None;
        }

        let (val, under) = Arc::make_mut(&mut self.kids[i]).remove(key, max, order)?;

        if self.kids[i].is_empty() {
            // a leaf left thin by a deferred range delete just ran dry
            self.kids.remove(i);
            self.maxes.remove(i);
            return Some((val, Underfull(self.kids.len() < min_fill(max))));
        }

        self.refresh_max(i, order);
        let under = if under.0 {
            self.rebal(i, max, order)
        } else {
            Underfull(false)
        };
        Some((val, under))
    }

    // re-clone the stored max for kids[i] if its subtree max moved
    fn refresh_max<C: Comparator<K>>(&mut self, i: usize, order: &C) {
        let m = self.kids[i].max_key();
        if order.cmp(m, &self.maxes[i]) != Equal {
            let m = m.clone();
            self.maxes[i] = m;
        }
    }

    // rebalance when kids[at] is underpopulated
    fn rebal<C: Comparator<K>>(&mut self, at: usize, max: usize, order: &C) -> Underfull {
        let min = min_fill(max);
        if self.kids.len() < 2 {
            return Underfull(self.kids.len() < min);
        }

        if at > 0 {
            if self.kids[at - 1].len() > min {
                self.shift_right(at - 1, order);
            } else {
                self.merge_kids(at - 1);
            }
        } else if self.kids[at + 1].len() > min {
            self.shift_left(at, order);
        } else {
            self.merge_kids(at);
        }

        Underfull(self.kids.len() < min)
    }

    fn kid_pair(&mut self, j: usize) -> (&mut Node<K, V>, &mut Node<K, V>) {
        let (a, b) = self.kids.split_at_mut(j + 1);
        (Arc::make_mut(&mut a[j]), Arc::make_mut(&mut b[0]))
    }

    // donate the greatest entry of kids[j] to the front of kids[j + 1]
    fn shift_right<C: Comparator<K>>(&mut self, j: usize, order: &C) {
        match self.kid_pair(j) {
            (Node::Leaf(lf), Node::Leaf(rt)) => {
                let k = lf.keys.pop().expect("shift_right from an empty leaf");
                let v = lf.vals.pop().expect("shift_right from an empty leaf");
                rt.keys.insert(0, k);
                rt.vals.insert(0, v);
            }

            (Node::Branch(lf), Node::Branch(rt)) => {
                let m = lf.maxes.pop().expect("shift_right from an empty branch");
                let c = lf.kids.pop().expect("shift_right from an empty branch");
                rt.maxes.insert(0, m);
                rt.kids.insert(0, c);
            }

            _ => unreachable!("siblings always share a kind"),
        }

        self.refresh_max(j, order);
    }

    // donate the least entry of kids[j + 1] to the back of kids[j]
    fn shift_left<C: Comparator<K>>(&mut self, j: usize, order: &C) {
        match self.kid_pair(j) {
            (Node::Leaf(lf), Node::Leaf(rt)) => {
                lf.keys.push(rt.keys.remove(0));
                lf.vals.push(rt.vals.remove(0));
            }

            (Node::Branch(lf), Node::Branch(rt)) => {
                lf.maxes.push(rt.maxes.remove(0));
                lf.kids.push(rt.kids.remove(0));
            }

            _ => unreachable!("siblings always share a kind"),
        }

        self.refresh_max(j, order);
    }

    // fold kids[j + 1] into kids[j]
    fn merge_kids(&mut self, j: usize) {
        let rt_rc = self.kids.remove(j + 1);
        let rt_max = self.maxes.remove(j + 1);
        let rt = match Arc::try_unwrap(rt_rc) {
            Ok(n) => n,
            Err(rc) => (*rc).clone(),
        };

        match (Arc::make_mut(&mut self.kids[j]), rt) {
            (Node::Leaf(lf), Node::Leaf(mut rt)) => {
                lf.keys.append(&mut rt.keys);
                lf.vals.append(&mut rt.vals);
            }

            (Node::Branch(lf), Node::Branch(mut rt)) => {
                lf.maxes.append(&mut rt.maxes);
                lf.kids.append(&mut rt.kids);
            }

            _ => unreachable!("siblings always share a kind"),
        }

        // the merged child now ends where the right sibling did
        self.maxes[j] = rt_max;
    }
}

/// What an [`edit_range`](BpTreeMap::edit_range) callback asks the engine to
/// do with the pair it was just shown.  Update and delete may be combined
/// with a break; directives are applied before the break returns.
#[derive(Debug)]
pub enum Edit<V, R> {
    /// Leave the pair alone.
    Keep,
    /// Replace the value in place.
    Update(V),
    /// Remove the pair.
    Delete,
    /// Stop the scan and hand `R` back to the caller.
    Break(R),
    /// Replace the value, then stop.
    UpdateBreak(V, R),
    /// Remove the pair, then stop.
    DeleteBreak(R),
}

// one leaf's worth of collected edit directives
struct LeafScan<K, V, R> {
    // key of the first patched entry, used to re-find the leaf when applying
    anchor: Option<K>,
    // last visited key; the next scan resumes strictly after it
    resume: Option<K>,
    updates: Vec<(usize, V)>,
    deletes: Vec<usize>,
    brk: Option<R>,
    done: bool,
}

impl<K: Clone, V, R> LeafScan<K, V, R> {
    fn fresh() -> Self {
        LeafScan {
            anchor: None,
            resume: None,
            updates: Vec::new(),
            deletes: Vec::new(),
            brk: None,
            done: false,
        }
    }

    fn exhausted() -> Self {
        LeafScan {
            done: true,
            ..Self::fresh()
        }
    }

    fn note(&mut self, key: &K) {
        if self.anchor.is_none() {
            self.anchor = Some(key.clone());
        }
    }
}

// re-descend to the leaf holding `anchor`, un-sharing the path, and apply
// one leaf's collected edits; true means the subtree lost its last entry
fn apply_patch<K, V, C>(
    rc: &mut NodePtr<K, V>,
    anchor: &K,
    updates: Vec<(usize, V)>,
    deletes: Vec<usize>,
    order: &C,
) -> bool
where
    K: Clone,
    V: Clone,
    C: Comparator<K>,
{
    match Arc::make_mut(rc) {
        Node::Leaf(leaf) => {
            for (j, v) in updates {
                leaf.vals[j] = v;
            }
            // deletes were collected ascending; splice from the back
            for &j in deletes.iter().rev() {
                leaf.keys.remove(j);
                leaf.vals.remove(j);
            }
            leaf.keys.is_empty()
        }

        Node::Branch(b) => {
            let i = lower_bound(&b.maxes, anchor, order);
            debug_assert!(i < b.kids.len(), "anchor key vanished before apply");
            let emptied = apply_patch(&mut b.kids[i], anchor, updates, deletes, order);
            if emptied {
                b.kids.remove(i);
                b.maxes.remove(i);
            } else {
                b.refresh_max(i, order);
            }
            b.kids.is_empty()
        }
    }
}

/// An ordered map on a copy-on-write B+ tree.
///
/// `clone` is O(1): the two maps share every node until one of them writes,
/// and a write clones only the nodes on its own path.  The ordering comes
/// from a [`Comparator`] fixed at construction ([`NaturalOrder`], i.e.
/// `Ord`, by default), and node width is configurable within
/// [`MIN_NODE_SIZE`]..=[`MAX_NODE_SIZE`].
///
/// # Examples
/// ```
/// use lazy_bptree::BpTreeMap;
///
/// let mut m = BpTreeMap::new();
/// m.insert(3, "c").unwrap();
/// m.insert(1, "a").unwrap();
/// let snap = m.clone();
/// m.remove(&1).unwrap();
/// assert_eq!(m.len(), 1);
/// assert_eq!(snap.len(), 2);
/// assert_eq!(snap.get(&1), Some(&"a"));
/// ```
pub struct BpTreeMap<K, V, C = NaturalOrder> {
    root: NodePtr<K, V>,
    len: usize,
    max_node_size: usize,
    order: C,
    frozen: bool,
}

impl<K, V> BpTreeMap<K, V> {
    /// An empty map ordered by `Ord` with the default node size.
    pub fn new() -> Self {
        Self::with_comparator(NaturalOrder)
    }

    /// An empty map ordered by `Ord`; `max` is clamped to
    /// [`MIN_NODE_SIZE`]..=[`MAX_NODE_SIZE`].
    pub fn with_max_node_size(max: usize) -> Self {
        Self::with_comparator_and_node_size(NaturalOrder, max)
    }
}

impl<K, V, C> BpTreeMap<K, V, C> {
    /// An empty map over a caller-supplied total order.
    ///
    /// The order must not change for the lifetime of the map (or of any of
    /// its clones); the map does not defend against one that does.
    pub fn with_comparator(order: C) -> Self {
        Self::with_comparator_and_node_size(order, DEFAULT_NODE_SIZE)
    }

    /// An empty map with both the order and the node size chosen.
    pub fn with_comparator_and_node_size(order: C, max: usize) -> Self {
        BpTreeMap {
            root: Arc::new(Node::Leaf(Leaf::default())),
            len: 0,
            max_node_size: max.clamp(MIN_NODE_SIZE, MAX_NODE_SIZE),
            order,
            frozen: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The clamped node-width ceiling this map was built with.
    pub fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    /// Number of node levels; 0 when empty, 1 for a lone leaf.
    pub fn height(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        let mut h = 1;
        let mut curr = self.root.as_ref();
        while let Node::Branch(b) = curr {
            h += 1;
            curr = b.kids[0].as_ref();
        }
        h
    }

    pub fn min_key(&self) -> Option<&K> {
        let mut curr = self.root.as_ref();
        loop {
            match curr {
                Node::Leaf(leaf) => return leaf.keys.first(),
                Node::Branch(b) => curr = b.kids.first()?.as_ref(),
            }
        }
    }

    pub fn max_key(&self) -> Option<&K> {
        match self.root.as_ref() {
            Node::Leaf(leaf) => leaf.keys.last(),
            Node::Branch(b) => b.maxes.last(),
        }
    }

    /// Reject every mutator until [`unfreeze`](Self::unfreeze).
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn ensure_unfrozen(&self) -> TreeResult<()> {
        if self.frozen {
            Err(TreeError::Frozen)
        } else {
            Ok(())
        }
    }

    // *********
    //   Reads
    // *********

    /// Retrieves the value for `key`, if there is one.
    ///
    /// # Examples
    /// ```
    /// use lazy_bptree::BpTreeMap;
    ///
    /// let mut m = BpTreeMap::new();
    /// m.insert(0, 1).unwrap();
    /// assert_eq!(m.get(&0), Some(&1));
    /// assert_eq!(m.get(&1), None);
    /// ```
    pub fn get(&self, key: &K) -> Option<&V>
    where
        C: Comparator<K>,
    {
        let mut curr = self.root.as_ref();
        loop {
            match curr {
                Node::Leaf(leaf) => {
                    let i = bsearch(&leaf.keys, key, &self.order).ok()?;
                    return Some(&leaf.vals[i]);
                }
                Node::Branch(b) => {
                    let i = lower_bound(&b.maxes, key, &self.order);
                    curr = b.kids.get(i)?.as_ref();
                }
            }
        }
    }

    /// `get` with a fallback for absent keys.
    pub fn get_or<'a>(&'a self, key: &K, default: &'a V) -> &'a V
    where
        C: Comparator<K>,
    {
        self.get(key).unwrap_or(default)
    }

    pub fn contains_key(&self, key: &K) -> bool
    where
        C: Comparator<K>,
    {
        self.get(key).is_some()
    }

    /// Mutable access to the value for `key`.  Un-shares the path to its
    /// leaf, so other clones are unaffected by whatever the caller writes.
    pub fn get_mut(&mut self, key: &K) -> TreeResult<Option<&mut V>>
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        self.ensure_unfrozen()?;

        // probe first so a miss never clones shared nodes
        if !self.contains_key(key) {
            return Ok(None);
        }

        Ok(Arc::make_mut(&mut self.root).get_mut(key, &self.order))
    }

    // ************
    //   Mutators
    // ************

    /// Associates `val` with `key`, returning the value it displaced.
    /// `None` means the entry is new.  An existing entry has its key slot
    /// overwritten as well, for keys carrying payload outside the ordering.
    ///
    /// # Examples
    /// ```
    /// use lazy_bptree::BpTreeMap;
    ///
    /// let mut m = BpTreeMap::new();
    /// assert_eq!(m.insert(0, 1).unwrap(), None);
    /// assert_eq!(m.insert(0, 0).unwrap(), Some(1));
    /// ```
    pub fn insert(&mut self, key: K, val: V) -> TreeResult<Option<V>>
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        self.ensure_unfrozen()?;
        match self.root_set(key, val, true) {
            Ins::Replaced(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// Inserts only when `key` is absent; true means a new entry was added.
    pub fn insert_if_absent(&mut self, key: K, val: V) -> TreeResult<bool>
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        self.ensure_unfrozen()?;
        match self.root_set(key, val, false) {
            Ins::Ignored => Ok(false),
            _ => Ok(true),
        }
    }

    /// Replaces the value only when `key` is present, returning the old
    /// value.  An absent key leaves the map (and its clones) untouched.
    pub fn replace_if_present(&mut self, key: &K, val: V) -> TreeResult<Option<V>>
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        match self.get_mut(key)? {
            Some(slot) => Ok(Some(replace(slot, val))),
            None => Ok(None),
        }
    }

    /// Applies `insert` over `pairs`; later duplicates win.  Returns the
    /// number of entries that were new.
    pub fn insert_all<I>(&mut self, pairs: I) -> TreeResult<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        self.ensure_unfrozen()?;
        let mut added = 0;
        for (k, v) in pairs {
            match self.root_set(k, v, true) {
                Ins::Replaced(_) => (),
                _ => added += 1,
            }
        }
        Ok(added)
    }

    fn root_set(&mut self, key: K, val: V, overwrite: bool) -> Ins<K, V>
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        let max = self.max_node_size;
        let res = Arc::make_mut(&mut self.root).set(key, val, overwrite, max, &self.order);

        match res {
            Ins::Added => {
                self.len += 1;
                Ins::Added
            }

            Ins::AddedSplit(right) => {
                self.len += 1;
                let left = Arc::clone(&self.root);
                let maxes = vec![left.max_key().clone(), right.max_key().clone()];
                self.root = Arc::new(Node::Branch(Branch {
                    maxes,
                    kids: vec![left, right],
                }));
                Ins::Added
            }

            done => done,
        }
    }

    /// Removes and returns the value for `key`, if it exists.
    ///
    /// # Examples
    /// ```
    /// use lazy_bptree::BpTreeMap;
    ///
    /// let mut m = BpTreeMap::new();
    /// m.insert(0, 'a').unwrap();
    /// assert_eq!(m.remove(&0).unwrap(), Some('a'));
    /// assert_eq!(m.remove(&0).unwrap(), None);
    /// assert!(m.is_empty());
    /// ```
    pub fn remove(&mut self, key: &K) -> TreeResult<Option<V>>
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        self.ensure_unfrozen()?;

        // probe first so a miss never clones shared nodes
        if !self.contains_key(key) {
            return Ok(None);
        }

        let max = self.max_node_size;
        let res = Arc::make_mut(&mut self.root).remove(key, max, &self.order);
        let Some((val, _)) = res else {
            return Ok(None);
        };

        self.len -= 1;
        self.collapse_root();
        Ok(Some(val))
    }

    /// Drops every entry, leaving the comparator and node size in place.
    pub fn clear(&mut self) -> TreeResult<()> {
        self.ensure_unfrozen()?;
        self.root = Arc::new(Node::Leaf(Leaf::default()));
        self.len = 0;
        Ok(())
    }

    // a root branch left with one child (or none) gives up its level
    fn collapse_root(&mut self) {
        loop {
            let next = match self.root.as_ref() {
                Node::Branch(b) if b.kids.len() == 1 => Some(Arc::clone(&b.kids[0])),
                Node::Branch(b) if b.kids.is_empty() => None,
                _ => return,
            };
            match next {
                Some(n) => self.root = n,
                None => {
                    self.root = Arc::new(Node::Leaf(Leaf::default()));
                    return;
                }
            }
        }
    }

    // *************
    //   Iteration
    // *************

    /// Ascending iteration over all pairs.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(self.root.as_ref())
    }

    /// Ascending iteration starting at the smallest key `>= lowest`.
    pub fn iter_from(&self, lowest: &K) -> Iter<'_, K, V>
    where
        C: Comparator<K>,
    {
        Iter::with_lower_bound(self.root.as_ref(), lowest, &self.order)
    }

    /// Descending iteration over all pairs.
    pub fn iter_rev(&self) -> RevIter<'_, K, V> {
        RevIter::new(self.root.as_ref())
    }

    /// Descending iteration starting at the largest key `<= highest`.  When
    /// `skip_highest` is set and `highest` itself is present, iteration
    /// starts one step lower; an absent `highest` always starts at the next
    /// lower key.
    pub fn iter_rev_from(&self, highest: &K, skip_highest: bool) -> RevIter<'_, K, V>
    where
        C: Comparator<K>,
    {
        RevIter::with_upper_bound(self.root.as_ref(), highest, skip_highest, &self.order)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|e| e.0)
    }

    pub fn keys_from(&self, lowest: &K) -> impl Iterator<Item = &K>
    where
        C: Comparator<K>,
    {
        self.iter_from(lowest).map(|e| e.0)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|e| e.1)
    }

    pub fn values_from(&self, lowest: &K) -> impl Iterator<Item = &V>
    where
        C: Comparator<K>,
    {
        self.iter_from(lowest).map(|e| e.1)
    }

    /// Calls `f` on every pair in ascending order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        for (k, v) in self.iter() {
            f(k, v);
        }
    }

    /// Calls `f(key, value, counter)` on every pair in ascending order; the
    /// counter starts at `c0` and increments per call.  `Break(r)` stops the
    /// walk and hands `r` back; otherwise the final counter is returned.
    pub fn for_each_pair<R, F>(&self, c0: usize, mut f: F) -> ControlFlow<R, usize>
    where
        F: FnMut(&K, &V, usize) -> ControlFlow<R>,
    {
        let mut counter = c0;
        for (k, v) in self.iter() {
            if let ControlFlow::Break(r) = f(k, v, counter) {
                return ControlFlow::Break(r);
            }
            counter += 1;
        }
        ControlFlow::Continue(counter)
    }

    // *****************
    //   Range queries
    // *****************

    /// Walks pairs with `lo <= key < hi` (`<= hi` when `include_high`) in
    /// ascending order under the same callback contract as
    /// [`for_each_pair`](Self::for_each_pair).  Read-only: shared nodes stay
    /// shared.
    pub fn for_range<R, F>(
        &self,
        lo: &K,
        hi: &K,
        include_high: bool,
        c0: usize,
        mut f: F,
    ) -> ControlFlow<R, usize>
    where
        C: Comparator<K>,
        F: FnMut(&K, &V, usize) -> ControlFlow<R>,
    {
        let mut counter = c0;
        for (k, v) in self.iter_from(lo) {
            match self.order.cmp(k, hi) {
                Greater => break,
                Equal if !include_high => break,
                _ => (),
            }
            if let ControlFlow::Break(r) = f(k, v, counter) {
                return ControlFlow::Break(r);
            }
            counter += 1;
        }
        ControlFlow::Continue(counter)
    }

    /// Clones the contiguous run of pairs with `lo <= key < hi` (`<= hi`
    /// when `include_high`), stopping early at `limit` entries.
    pub fn get_range(&self, lo: &K, hi: &K, include_high: bool, limit: Option<usize>) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        let mut out = Vec::new();
        for (k, v) in self.iter_from(lo) {
            if limit.map_or(false, |n| out.len() >= n) {
                break;
            }
            match self.order.cmp(k, hi) {
                Greater => break,
                Equal if !include_high => break,
                _ => (),
            }
            out.push((k.clone(), v.clone()));
        }
        out
    }

    /// Walks the range like [`for_range`](Self::for_range), applying the
    /// [`Edit`] directive the callback returns for each pair.
    ///
    /// Mutation is copy-on-write at leaf granularity: a leaf is scanned
    /// while still shared, and only a leaf that collected an update or
    /// delete gets its path to the root un-shared before the batch is
    /// applied.  A range walked with only `Keep` directives leaves every
    /// shared node shared.  Rebalancing of thinned leaves is deferred to
    /// later point operations; the structural audit stays clean either way.
    ///
    /// # Examples
    /// ```
    /// use lazy_bptree::{BpTreeMap, Edit};
    ///
    /// let mut m: BpTreeMap<i32, i32> = (1..=10).map(|k| (k, k)).collect();
    /// m.edit_range::<(), _>(&1, &10, true, 0, |k, v, _| {
    ///     if k % 2 == 0 {
    ///         Edit::Delete
    ///     } else {
    ///         Edit::Update(-v)
    ///     }
    /// })
    /// .unwrap();
    /// assert_eq!(m.to_vec(), vec![(1, -1), (3, -3), (5, -5), (7, -7), (9, -9)]);
    /// ```
    pub fn edit_range<R, F>(
        &mut self,
        lo: &K,
        hi: &K,
        include_high: bool,
        c0: usize,
        mut f: F,
    ) -> TreeResult<ControlFlow<R, usize>>
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
        F: FnMut(&K, &V, usize) -> Edit<V, R>,
    {
        self.ensure_unfrozen()?;

        let mut counter = c0;
        let mut resume: Option<K> = None;
        loop {
            let scan = match resume.take() {
                Some(k) => self.scan_leaf(&k, true, hi, include_high, &mut counter, &mut f),
                None => self.scan_leaf(lo, false, hi, include_high, &mut counter, &mut f),
            };

            let LeafScan {
                anchor,
                resume: next,
                updates,
                deletes,
                brk,
                done,
            } = scan;

            if let Some(anchor) = anchor {
                self.len -= deletes.len();
                self.apply_leaf_patch(&anchor, updates, deletes);
            }

            if let Some(r) = brk {
                return Ok(ControlFlow::Break(r));
            }
            if done || next.is_none() {
                return Ok(ControlFlow::Continue(counter));
            }
            resume = next;
        }
    }

    /// Deletes every pair with `lo <= key < hi` (`<= hi` when
    /// `include_high`); returns how many were removed.
    pub fn remove_range(&mut self, lo: &K, hi: &K, include_high: bool) -> TreeResult<usize>
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        let before = self.len;
        self.edit_range::<(), _>(lo, hi, include_high, 0, |_, _, _| Edit::Delete)?;
        Ok(before - self.len)
    }

    // run the callback over one leaf's in-range entries without touching
    // shared nodes, collecting whatever it asks for
    fn scan_leaf<R, F>(
        &self,
        start: &K,
        exclusive: bool,
        hi: &K,
        include_high: bool,
        counter: &mut usize,
        f: &mut F,
    ) -> LeafScan<K, V, R>
    where
        K: Clone,
        C: Comparator<K>,
        F: FnMut(&K, &V, usize) -> Edit<V, R>,
    {
        let mut node = self.root.as_ref();
        let (leaf, mut j) = loop {
            match node {
                Node::Branch(b) => {
                    let i = if exclusive {
                        upper_bound(&b.maxes, start, &self.order)
                    } else {
                        lower_bound(&b.maxes, start, &self.order)
                    };
                    match b.kids.get(i) {
                        Some(kid) => node = kid.as_ref(),
                        None => return LeafScan::exhausted(),
                    }
                }

                Node::Leaf(leaf) => {
                    let j = match bsearch(&leaf.keys, start, &self.order) {
                        Ok(i) if exclusive => i + 1,
                        Ok(i) => i,
                        Err(i) => i,
                    };
                    if j >= leaf.keys.len() {
                        return LeafScan::exhausted();
                    }
                    break (leaf, j);
                }
            }
        };

        let mut scan = LeafScan::fresh();
        let mut last = None;
        while j < leaf.keys.len() {
            let key = &leaf.keys[j];
            match self.order.cmp(key, hi) {
                Greater => {
                    scan.done = true;
                    break;
                }
                Equal if !include_high => {
                    scan.done = true;
                    break;
                }
                _ => (),
            }

            let edit = f(key, &leaf.vals[j], *counter);
            *counter += 1;
            last = Some(j);

            let stop = match edit {
                Edit::Keep => false,
                Edit::Update(v) => {
                    scan.note(key);
                    scan.updates.push((j, v));
                    false
                }
                Edit::Delete => {
                    scan.note(key);
                    scan.deletes.push(j);
                    false
                }
                Edit::Break(r) => {
                    scan.brk = Some(r);
                    true
                }
                Edit::UpdateBreak(v, r) => {
                    scan.note(key);
                    scan.updates.push((j, v));
                    scan.brk = Some(r);
                    true
                }
                Edit::DeleteBreak(r) => {
                    scan.note(key);
                    scan.deletes.push(j);
                    scan.brk = Some(r);
                    true
                }
            };
            if stop {
                break;
            }
            j += 1;
        }

        if !scan.done && scan.brk.is_none() {
            scan.resume = last.map(|i| leaf.keys[i].clone());
        }
        scan
    }

    fn apply_leaf_patch(&mut self, anchor: &K, updates: Vec<(usize, V)>, deletes: Vec<usize>)
    where
        K: Clone,
        V: Clone,
        C: Comparator<K>,
    {
        let emptied = apply_patch(&mut self.root, anchor, updates, deletes, &self.order);
        if emptied {
            self.root = Arc::new(Node::Leaf(Leaf::default()));
        } else {
            self.collapse_root();
        }
    }

    // *******************
    //   Materialisation
    // *******************

    /// All pairs in ascending order.
    pub fn to_vec(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// The first `max` pairs in ascending order.
    pub fn to_vec_capped(&self, max: usize) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.iter()
            .take(max)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn keys_vec(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.keys().cloned().collect()
    }

    pub fn values_vec(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.values().cloned().collect()
    }

    // *********
    //   Audit
    // *********

    /// Structural audit: key ordering, per-child max agreement, uniform
    /// leaf depth, parallel-array agreement, the node-size ceiling, and the
    /// recorded entry count.  Returns the first violation found.
    pub fn check_valid(&self) -> TreeResult<()>
    where
        C: Comparator<K>,
    {
        let mut counted = 0;
        self.audit(self.root.as_ref(), 0, None, &mut counted)?;
        if counted != self.len {
            return Err(TreeError::SizeMismatch {
                recorded: self.len,
                counted,
            });
        }
        Ok(())
    }

    // returns the subtree height and the greatest key seen so far
    fn audit<'a>(
        &'a self,
        n: &'a Node<K, V>,
        depth: usize,
        prev: Option<&'a K>,
        counted: &mut usize,
    ) -> TreeResult<(usize, Option<&'a K>)>
    where
        C: Comparator<K>,
    {
        match n {
            Node::Leaf(leaf) => {
                if leaf.keys.len() != leaf.vals.len() {
                    return Err(TreeError::SkewedLeaf {
                        keys: leaf.keys.len(),
                        vals: leaf.vals.len(),
                    });
                }
                if leaf.keys.len() > self.max_node_size {
                    return Err(TreeError::Overfull {
                        depth,
                        len: leaf.keys.len(),
                        max: self.max_node_size,
                    });
                }
                if depth > 0 && leaf.keys.is_empty() {
                    return Err(TreeError::EmptyNode { depth });
                }

                let mut prev = prev;
                for k in &leaf.keys {
                    if let Some(p) = prev {
                        if self.order.cmp(p, k) != Less {
                            return Err(TreeError::UnorderedKeys { depth });
                        }
                    }
                    prev = Some(k);
                }
                *counted += leaf.keys.len();
                Ok((1, prev))
            }

            Node::Branch(b) => {
                if b.kids.is_empty() {
                    return Err(TreeError::EmptyNode { depth });
                }
                if b.kids.len() != b.maxes.len() {
                    return Err(TreeError::SkewedBranch {
                        maxes: b.maxes.len(),
                        kids: b.kids.len(),
                    });
                }
                if b.kids.len() > self.max_node_size {
                    return Err(TreeError::Overfull {
                        depth,
                        len: b.kids.len(),
                        max: self.max_node_size,
                    });
                }

                let mut ht = 0;
                let mut prev = prev;
                for (i, kid) in b.kids.iter().enumerate() {
                    let (h, p) = self.audit(kid.as_ref(), depth + 1, prev, counted)?;
                    if i == 0 {
                        ht = h;
                    } else if h != ht {
                        return Err(TreeError::UnevenDepth {
                            expected: ht,
                            found: h,
                        });
                    }

                    let sub_max = p.ok_or(TreeError::EmptyNode { depth: depth + 1 })?;
                    if self.order.cmp(sub_max, &b.maxes[i]) != Equal {
                        return Err(TreeError::StaleMaxKey { depth, child: i });
                    }
                    prev = p;
                }
                Ok((ht + 1, prev))
            }
        }
    }
}

/// A clone is O(1): it shares every node with `self` and the two diverge
/// lazily as either side writes.  The comparator and node size carry over;
/// the clone starts unfrozen.
impl<K, V, C: Clone> Clone for BpTreeMap<K, V, C> {
    fn clone(&self) -> Self {
        BpTreeMap {
            root: Arc::clone(&self.root),
            len: self.len,
            max_node_size: self.max_node_size,
            order: self.order.clone(),
            frozen: false,
        }
    }
}

// our own impl to avoid Default constraints on K and V
impl<K, V, C: Default> Default for BpTreeMap<K, V, C> {
    fn default() -> Self {
        Self::with_comparator_and_node_size(C::default(), DEFAULT_NODE_SIZE)
    }
}

impl<K, V, C> std::fmt::Debug for BpTreeMap<K, V, C>
where
    K: std::fmt::Debug,
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: PartialEq, V: PartialEq, C> PartialEq for BpTreeMap<K, V, C> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(x, y)| x == y)
    }
}

impl<K: Eq, V: Eq, C> Eq for BpTreeMap<K, V, C> {}

impl<K: Clone + Ord, V: Clone> FromIterator<(K, V)> for BpTreeMap<K, V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut m = BpTreeMap::new();
        for (k, v) in iter {
            m.root_set(k, v, true);
        }
        m
    }
}

impl<K: Clone + Ord, V: Clone, const N: usize> From<[(K, V); N]> for BpTreeMap<K, V> {
    fn from(pairs: [(K, V); N]) -> Self {
        BpTreeMap::from_iter(pairs)
    }
}

impl<'a, K, V, C> IntoIterator for &'a BpTreeMap<K, V, C> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(feature = "serde")]
impl<K, V, C> serde::ser::Serialize for BpTreeMap<K, V, C>
where
    K: serde::ser::Serialize,
    V: serde::ser::Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::de::Deserialize<'de> for BpTreeMap<K, V>
where
    K: Clone + serde::de::Deserialize<'de> + Ord,
    V: Clone + serde::de::Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct MapVisitor<K, V> {
            marker: std::marker::PhantomData<BpTreeMap<K, V>>,
        }

        impl<'de, K, V> serde::de::Visitor<'de> for MapVisitor<K, V>
        where
            K: Clone + serde::de::Deserialize<'de> + Ord,
            V: Clone + serde::de::Deserialize<'de>,
        {
            type Value = BpTreeMap<K, V>;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut m = BpTreeMap::new();
                while let Some((k, v)) = access.next_entry()? {
                    m.root_set(k, v, true);
                }
                Ok(m)
            }
        }

        deserializer.deserialize_map(MapVisitor {
            marker: std::marker::PhantomData,
        })
    }
}
