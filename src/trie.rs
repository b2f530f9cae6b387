//! An approximate nearest neighbor index over short keys in `[0, 1]`.
//!
//! Every key component picks one of `B` bins on successive tree levels, so a
//! key of length `L` addresses a leaf at depth `L`. Values with keys that land
//! in the same bins share a leaf. Once all values are inserted,
//! [`TrieBuilder::link`] orders the leaves depth first and joins them into a
//! ring. A query descends to the leaf closest to its key and then scans a
//! fixed number of leaves on either side of it around the ring. Keys that
//! share their leading components are adjacent in the ring, so this finds the
//! true nearest neighbor most of the time while touching only a few leaves.
//!
//! The two phases are separate types: values can only be inserted into a
//! [`TrieBuilder`] and only a linked [`Trie`] can be queried.

/// Metric used to rank the values stored in a [`Trie`].
pub trait Distance {
    fn distance(&self, other: &Self) -> f32;
}

impl<T: Distance + ?Sized> Distance for &T {
    fn distance(&self, other: &Self) -> f32 {
        (**self).distance(*other)
    }
}

impl Distance for Vec<f32> {
    fn distance(&self, other: &Self) -> f32 {
        crate::vector::distance(self, other)
    }
}

/// A value found by [`Trie::nearest`] and its distance to the query.
#[derive(Debug)]
pub struct Neighbor<'a, T> {
    pub value: &'a T,
    pub distance: f32,
}

impl<T> Clone for Neighbor<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Neighbor<'_, T> {}

#[derive(Debug, Clone)]
struct Node {
    /// Index of the child node, or of the leaf on the last level.
    children: Vec<Option<usize>>,
}

impl Node {
    fn new(branching: usize) -> Self {
        Self {
            children: vec![None; branching],
        }
    }
}

fn bin(component: f32, branching: usize) -> usize {
    (component.clamp(0.0, 1.0) * (branching - 1) as f32).round() as usize
}

/// The insertion phase of a [`Trie`].
#[derive(Debug, Clone)]
pub struct TrieBuilder<T> {
    branching: usize,
    key_length: usize,
    nodes: Vec<Node>,
    leaves: Vec<Vec<T>>,
    len: usize,
}

impl<T> TrieBuilder<T> {
    /// Create an empty trie with `branching` bins per level and keys of
    /// `key_length` components.
    pub fn new(branching: usize, key_length: usize) -> Self {
        assert!(branching >= 2, "a trie needs at least two bins per level");
        assert!(key_length > 0, "keys must have at least one component");
        Self {
            branching,
            key_length,
            nodes: vec![Node::new(branching)],
            leaves: vec![],
            len: 0,
        }
    }

    /// Store `value` under `key`.
    ///
    /// Components are clamped to `[0, 1]`. Panics if the key does not have
    /// the configured length.
    pub fn insert(&mut self, key: &[f32], value: T) {
        assert_eq!(key.len(), self.key_length, "key has the wrong length");
        let mut node = 0;
        for (level, &component) in key.iter().enumerate() {
            let bin = bin(component, self.branching);
            let last = level + 1 == self.key_length;
            let child = match self.nodes[node].children[bin] {
                Some(child) => child,
                None => {
                    let child = if last {
                        self.leaves.push(vec![]);
                        self.leaves.len() - 1
                    } else {
                        self.nodes.push(Node::new(self.branching));
                        self.nodes.len() - 1
                    };
                    self.nodes[node].children[bin] = Some(child);
                    child
                }
            };
            if last {
                self.leaves[child].push(value);
                self.len += 1;
                return;
            }
            node = child;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish insertion and join the leaves into a ring in depth first,
    /// lowest bin first order.
    pub fn link(self) -> Trie<T> {
        let TrieBuilder {
            branching,
            key_length,
            mut nodes,
            leaves,
            len,
        } = self;
        let mut unlinked: Vec<Option<Vec<T>>> = leaves.into_iter().map(Some).collect();
        let mut ring = Vec::with_capacity(unlinked.len());
        let mut stack = vec![(0, 0)];
        while let Some((node, depth)) = stack.pop() {
            if depth + 1 == key_length {
                for slot in nodes[node].children.iter_mut() {
                    if let Some(leaf) = slot {
                        if let Some(values) = unlinked[*leaf].take() {
                            ring.push(values);
                        }
                        *slot = Some(ring.len() - 1);
                    }
                }
            } else {
                stack.extend(
                    nodes[node]
                        .children
                        .iter()
                        .rev()
                        .flatten()
                        .map(|&child| (child, depth + 1)),
                );
            }
        }
        Trie {
            branching,
            key_length,
            nodes,
            leaves: ring,
            len,
        }
    }
}

/// A linked, read-only trie. See the [module documentation](self).
#[derive(Debug, Clone)]
pub struct Trie<T> {
    branching: usize,
    key_length: usize,
    nodes: Vec<Node>,
    /// Leaves in ring order. Leaf `i` neighbors `i - 1` and `i + 1`, wrapping.
    leaves: Vec<Vec<T>>,
    len: usize,
}

impl<T> Trie<T> {
    pub fn branching_factor(&self) -> usize {
        self.branching
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Values stored in the leaf at ring position `leaf`.
    pub fn leaf(&self, leaf: usize) -> &[T] {
        &self.leaves[leaf]
    }

    /// Ring position left of `leaf`.
    pub fn left(&self, leaf: usize) -> usize {
        (leaf + self.leaves.len() - 1) % self.leaves.len()
    }

    /// Ring position right of `leaf`.
    pub fn right(&self, leaf: usize) -> usize {
        (leaf + 1) % self.leaves.len()
    }

    /// Whether a value was inserted with a key mapping to exactly the same bins.
    pub fn contains(&self, key: &[f32]) -> bool {
        assert_eq!(key.len(), self.key_length, "key has the wrong length");
        if self.leaves.is_empty() {
            return false;
        }
        let mut node = 0;
        for (level, &component) in key.iter().enumerate() {
            match self.nodes[node].children[bin(component, self.branching)] {
                Some(child) if level + 1 < self.key_length => node = child,
                Some(_) => return true,
                None => return false,
            }
        }
        false
    }

    /// Ring position of the leaf reached by descending along `key`.
    ///
    /// Where the exact bin has no child, the present child with the nearest
    /// bin index is taken instead (lower bin on ties).
    fn locate(&self, key: &[f32]) -> Option<usize> {
        let mut node = 0;
        for (level, &component) in key.iter().enumerate() {
            let bin = bin(component, self.branching);
            let children = &self.nodes[node].children;
            let child = children[bin].or_else(|| {
                children
                    .iter()
                    .enumerate()
                    .filter_map(|(j, child)| child.map(|child| (j.abs_diff(bin), child)))
                    .min_by_key(|&(distance, _)| distance)
                    .map(|(_, child)| child)
            })?;
            if level + 1 == self.key_length {
                return Some(child);
            }
            node = child;
        }
        None
    }

    /// Find up to `k` values closest to `query`, sorted by ascending distance.
    ///
    /// The leaf addressed by `key` is scanned along with `radius` leaves to
    /// each side of it. Each leaf is scanned at most once even when the ring
    /// is shorter than `2 * radius + 1`.
    pub fn nearest(&self, key: &[f32], query: &T, radius: usize, k: usize) -> Vec<Neighbor<'_, T>>
    where
        T: Distance,
    {
        assert_eq!(key.len(), self.key_length, "key has the wrong length");
        let leaf_count = self.leaves.len();
        if k == 0 || leaf_count == 0 {
            return vec![];
        }
        let Some(start) = self.locate(key) else {
            return vec![];
        };
        let left = radius.min(leaf_count - 1);
        let right = radius.min(leaf_count - 1 - left);
        let ring = (0..=left)
            .map(|step| (start + leaf_count - step) % leaf_count)
            .chain((1..=right).map(|step| (start + step) % leaf_count));

        let mut best: Vec<Neighbor<'_, T>> = Vec::with_capacity(k + 1);
        for leaf in ring {
            for value in &self.leaves[leaf] {
                let distance = query.distance(value);
                let position = best.partition_point(|neighbor| neighbor.distance <= distance);
                if position < k {
                    best.insert(position, Neighbor { value, distance });
                    best.truncate(k);
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn random_keys(count: usize, length: usize) -> Vec<Vec<f32>> {
        let mut rng = Pcg64::from_seed([5; 32]);
        (0..count)
            .map(|_| (0..length).map(|_| rng.gen()).collect())
            .collect()
    }

    fn one_dimensional(keys: &[f32]) -> Trie<Vec<f32>> {
        let mut builder = TrieBuilder::new(8, 1);
        for &key in keys {
            builder.insert(&[key], vec![key]);
        }
        builder.link()
    }

    #[test]
    fn every_key_finds_itself() {
        let keys = random_keys(500, 16);
        let mut builder = TrieBuilder::new(8, 16);
        for key in &keys {
            builder.insert(key, key.clone());
        }
        assert_eq!(builder.len(), 500);
        let trie = builder.link();
        for key in &keys {
            let neighbors = trie.nearest(key, key, 0, 1);
            assert_eq!(neighbors.len(), 1);
            assert_eq!(neighbors[0].value, key);
            assert_eq!(neighbors[0].distance, 0.0);
            assert!(trie.contains(key));
        }
    }

    #[test]
    fn ring_is_one_cycle() {
        let keys = random_keys(200, 4);
        let mut builder = TrieBuilder::new(4, 4);
        for key in &keys {
            builder.insert(key, key.clone());
        }
        let trie = builder.link();
        let n = trie.leaf_count();
        assert!(n > 1);
        let mut seen = vec![false; n];
        let mut leaf = 0;
        for _ in 0..n {
            assert!(!seen[leaf]);
            seen[leaf] = true;
            assert_eq!(trie.left(trie.right(leaf)), leaf);
            leaf = trie.right(leaf);
        }
        assert_eq!(leaf, 0);
        assert!(seen.into_iter().all(|s| s));
        assert_eq!((0..n).map(|i| trie.leaf(i).len()).sum::<usize>(), 200);
    }

    #[test]
    fn leaves_follow_bin_order() {
        let trie = one_dimensional(&[1.0, 0.0, 0.5]);
        assert_eq!(trie.leaf_count(), 3);
        assert_eq!(trie.leaf(0), [vec![0.0f32]].as_slice());
        assert_eq!(trie.leaf(1), [vec![0.5f32]].as_slice());
        assert_eq!(trie.leaf(2), [vec![1.0f32]].as_slice());
    }

    #[test]
    fn missing_bins_resolve_to_the_nearest_sibling() {
        let trie = one_dimensional(&[0.0, 1.0]);
        // 0.3 maps to bin 2, nearest present bin is 0.
        assert_eq!(trie.nearest(&[0.3], &vec![0.3], 0, 1)[0].value, &vec![0.0]);
        // 0.6 maps to bin 4, bin 7 is closer than bin 0.
        assert_eq!(trie.nearest(&[0.6], &vec![0.6], 0, 1)[0].value, &vec![1.0]);
        assert!(!trie.contains(&[0.3]));

        // Bins 1 and 5 are equally far from bin 3: take the lower one.
        let trie = one_dimensional(&[1.0 / 7.0, 5.0 / 7.0]);
        let found = trie.nearest(&[3.0 / 7.0], &vec![3.0 / 7.0], 0, 1);
        assert_eq!(found[0].value, &vec![1.0 / 7.0]);
    }

    #[test]
    fn radius_scans_neighboring_leaves() {
        let keys: Vec<f32> = (0..8).map(|i| i as f32 / 7.0).collect();
        let trie = one_dimensional(&keys);
        let query = vec![3.0 / 7.0];
        let found = trie.nearest(&query, &query, 1, 3);
        let values: Vec<f32> = found.iter().map(|n| n.value[0]).collect();
        assert_eq!(values, vec![3.0 / 7.0, 2.0 / 7.0, 4.0 / 7.0]);
        assert!(found.windows(2).all(|w| w[0].distance <= w[1].distance));

        // Radius 0 only sees its own leaf.
        assert_eq!(trie.nearest(&query, &query, 0, 3).len(), 1);

        // The ring wraps: leaf 0's left neighbor is the last leaf.
        let query = vec![0.0];
        let found = trie.nearest(&query, &query, 1, 3);
        let mut values: Vec<f32> = found.iter().map(|n| n.value[0]).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(values, vec![0.0, 1.0 / 7.0, 1.0]);
    }

    #[test]
    fn large_radius_visits_each_leaf_once() {
        let trie = one_dimensional(&[0.0, 0.5, 1.0]);
        let query = vec![0.5];
        let found = trie.nearest(&query, &query, 10, 10);
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn empty_trie_finds_nothing() {
        let trie: Trie<Vec<f32>> = TrieBuilder::new(8, 2).link();
        assert!(trie.is_empty());
        assert!(trie.nearest(&[0.1, 0.2], &vec![0.1, 0.2], 5, 2).is_empty());
        assert!(!trie.contains(&[0.1, 0.2]));
    }

    #[test]
    #[should_panic]
    fn wrong_key_length_panics() {
        let mut builder = TrieBuilder::new(8, 3);
        builder.insert(&[0.5, 0.5], vec![0.5]);
    }

    #[test]
    fn concurrent_queries() {
        let keys = random_keys(100, 8);
        let mut builder = TrieBuilder::new(8, 8);
        for key in &keys {
            builder.insert(key, key.clone());
        }
        let trie = builder.link();
        std::thread::scope(|scope| {
            for chunk in keys.chunks(25) {
                let trie = &trie;
                scope.spawn(move || {
                    for key in chunk {
                        assert_eq!(trie.nearest(key, key, 0, 1)[0].distance, 0.0);
                    }
                });
            }
        });
    }
}
