//! Bidirectional map with an ordered right-hand side
//!
//! Both directions are updated by the same call, so a name always maps to
//! exactly one number and that number maps back to the same name.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::ops::Bound;

/// One-to-one mapping between `L` values and ordered `R` values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiMap<L, R>
where
    L: Eq + Hash + Clone,
    R: Ord + Clone,
{
    forward: HashMap<L, R>,
    reverse: BTreeMap<R, L>,
}

impl<L, R> Default for BiMap<L, R>
where
    L: Eq + Hash + Clone,
    R: Ord + Clone,
{
    fn default() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: BTreeMap::new(),
        }
    }
}

impl<L, R> BiMap<L, R>
where
    L: Eq + Hash + Clone,
    R: Ord + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair, evicting any pair that shared either side.
    ///
    /// Returns the pairs that were displaced.
    pub fn insert(&mut self, left: L, right: R) -> Vec<(L, R)> {
        let mut displaced = Vec::new();
        if let Some(old_right) = self.forward.remove(&left) {
            self.reverse.remove(&old_right);
            displaced.push((left.clone(), old_right));
        }
        if let Some(old_left) = self.reverse.remove(&right) {
            self.forward.remove(&old_left);
            displaced.push((old_left, right.clone()));
        }
        self.forward.insert(left.clone(), right.clone());
        self.reverse.insert(right, left);
        displaced
    }

    pub fn get_by_left(&self, left: &L) -> Option<&R> {
        self.forward.get(left)
    }

    pub fn get_by_right(&self, right: &R) -> Option<&L> {
        self.reverse.get(right)
    }

    pub fn contains_left(&self, left: &L) -> bool {
        self.forward.contains_key(left)
    }

    /// Greatest right-hand value strictly below `right`
    pub fn nearest_below(&self, right: &R) -> Option<(&R, &L)> {
        self.reverse
            .range((Bound::Unbounded, Bound::Excluded(right)))
            .next_back()
    }

    /// Pairs in ascending right-hand order
    pub fn iter(&self) -> impl Iterator<Item = (&L, &R)> {
        self.reverse.iter().map(|(r, l)| (l, r))
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Check that both directions describe the same set of pairs
    pub fn is_consistent(&self) -> bool {
        self.forward.len() == self.reverse.len()
            && self
                .forward
                .iter()
                .all(|(l, r)| self.reverse.get(r) == Some(l))
    }
}

impl<L, R> FromIterator<(L, R)> for BiMap<L, R>
where
    L: Eq + Hash + Clone,
    R: Ord + Clone,
{
    fn from_iter<I: IntoIterator<Item = (L, R)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (l, r) in iter {
            map.insert(l, r);
        }
        map
    }
}
