//! # Kademlia-style Routing Table
//!
//! A binary trie of k-buckets over 64-bit node identifiers with the XOR
//! distance metric. The table is a standalone library component: the ring
//! protocol routes along Chord successors at runtime, while this structure
//! serves lookups keyed by numeric identifier.
//!
//! ## Bucket Invariants
//!
//! - Bucket ranges partition the identifier space and are always halved at
//!   the midpoint when a bucket splits.
//! - A leaf splits only when it is full AND the owner's identifier lies
//!   within its range; a full bucket far from the owner rejects inserts.
//! - After a split, entries are redistributed by range and the pending
//!   insert retries in the matching child.
//!
//! This gives the classic Kademlia shape: fine-grained buckets near the
//! owner, coarse buckets far away.

use rand::seq::SliceRandom;

/// 64-bit node identifier. The XOR of two identifiers is their distance.
pub type NodeId = u64;

/// One routing table entry: an identifier and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub id: NodeId,
    pub addr: String,
}

/// A routing table owned by one node identifier.
pub struct RoutingTable {
    root: Bucket,
}

impl RoutingTable {
    /// Create a table of buckets holding up to `k` entries each, covering
    /// the identifier range `[0, max]`.
    pub fn new(k: usize, owner: NodeId, max: NodeId) -> Self {
        Self {
            root: Bucket {
                k,
                low: 0,
                high: max,
                owner,
                entries: Vec::new(),
                children: None,
            },
        }
    }

    /// Insert an entry, returning whether it was accepted.
    ///
    /// # Panics
    ///
    /// Panics if the identifier lies outside the table's range; that is a
    /// caller bug, not a routing decision.
    pub fn insert(&mut self, entry: RoutingEntry) -> bool {
        assert!(
            self.root.within_range(entry.id),
            "node id {} is outside of the identifier space [0, {}]",
            entry.id,
            self.root.high,
        );
        self.root.insert(entry)
    }

    /// Up to `n` entries closest to `target`, ordered by ascending XOR
    /// distance. The sort is stable, so equal distances keep their
    /// traversal order.
    pub fn find_node(&self, target: NodeId, n: usize) -> Vec<RoutingEntry> {
        let mut candidates = self.nodes();
        candidates.sort_by_key(|entry| entry.id ^ target);
        candidates.truncate(n);
        candidates
    }

    /// Up to `n` entries sampled uniformly from the half of the identifier
    /// space that does not hold the owner. Before the first split there is
    /// only one bucket to sample from.
    pub fn distant_nodes(&self, n: usize) -> Vec<RoutingEntry> {
        let mut nodes = match &self.root.children {
            Some(children) => {
                let (left, right) = children.as_ref();
                if left.within_range(self.root.owner) {
                    right.all_nodes()
                } else {
                    left.all_nodes()
                }
            }
            None => self.root.entries.clone(),
        };

        if nodes.len() < n {
            return nodes;
        }
        nodes.shuffle(&mut rand::thread_rng());
        nodes.truncate(n);
        nodes
    }

    /// Whether an entry with this identifier exists in the table.
    pub fn contains(&self, id: NodeId) -> bool {
        self.root.contains(id)
    }

    /// All entries, in trie order.
    pub fn nodes(&self) -> Vec<RoutingEntry> {
        self.root.all_nodes()
    }
}

/// One k-bucket: a leaf holding entries, or an interior node with two
/// children covering the halves of its range.
struct Bucket {
    k: usize,
    low: NodeId,
    high: NodeId,
    owner: NodeId,
    entries: Vec<RoutingEntry>,
    children: Option<Box<(Bucket, Bucket)>>,
}

impl Bucket {
    fn within_range(&self, id: NodeId) -> bool {
        id >= self.low && id <= self.high
    }

    fn insert(&mut self, entry: RoutingEntry) -> bool {
        if let Some(children) = &mut self.children {
            let (left, right) = children.as_mut();
            if left.within_range(entry.id) {
                return left.insert(entry);
            }
            return right.insert(entry);
        }

        if self.entries.len() < self.k {
            self.entries.push(entry);
            return true;
        }

        if !self.within_range(self.owner) {
            return false;
        }

        self.split();
        let children = self
            .children
            .as_mut()
            .expect("split always produces children");
        let (left, right) = children.as_mut();
        for existing in self.entries.drain(..) {
            if left.within_range(existing.id) {
                left.entries.push(existing);
            } else {
                right.entries.push(existing);
            }
        }
        if left.within_range(entry.id) {
            left.insert(entry)
        } else {
            right.insert(entry)
        }
    }

    fn split(&mut self) {
        let mid = self.low + (self.high - self.low) / 2;
        self.children = Some(Box::new((
            Bucket {
                k: self.k,
                low: self.low,
                high: mid,
                owner: self.owner,
                entries: Vec::new(),
                children: None,
            },
            Bucket {
                k: self.k,
                low: mid + 1,
                high: self.high,
                owner: self.owner,
                entries: Vec::new(),
                children: None,
            },
        )));
    }

    fn contains(&self, id: NodeId) -> bool {
        if let Some(children) = &self.children {
            let (left, right) = children.as_ref();
            if left.within_range(id) {
                return left.contains(id);
            }
            return right.contains(id);
        }
        self.entries.iter().any(|entry| entry.id == id)
    }

    fn all_nodes(&self) -> Vec<RoutingEntry> {
        match &self.children {
            Some(children) => {
                let (left, right) = children.as_ref();
                let mut nodes = left.all_nodes();
                nodes.extend(right.all_nodes());
                nodes
            }
            None => self.entries.clone(),
        }
    }
}
