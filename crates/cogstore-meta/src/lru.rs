//! O(1) recency tracking over block ids.
//!
//! A doubly linked sequence realized as a node map: each id maps to its
//! neighbors, so touch/remove/pop are constant-time without the iterator
//! pinning a pointer-based list would need.

use cogstore_types::BlockId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Node {
    prev: Option<BlockId>,
    next: Option<BlockId>,
}

/// Recency list with most-recently-used at the head.
#[derive(Debug, Default)]
pub struct LruIndex {
    nodes: HashMap<BlockId, Node>,
    head: Option<BlockId>,
    tail: Option<BlockId>,
}

impl LruIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Least-recently-used id, if any.
    #[must_use]
    pub fn tail(&self) -> Option<BlockId> {
        self.tail
    }

    /// Move `id` to the most-recent position, inserting it if absent.
    pub fn touch(&mut self, id: BlockId) {
        self.unlink(id);
        self.push_front(id);
    }

    /// Append `id` as the least-recent entry. Used when rebuilding the list
    /// in serialized (MRU-first) order.
    pub fn push_back(&mut self, id: BlockId) {
        self.unlink(id);
        let node = Node {
            prev: self.tail,
            next: None,
        };
        if let Some(old_tail) = self.tail {
            if let Some(t) = self.nodes.get_mut(&old_tail) {
                t.next = Some(id);
            }
        } else {
            self.head = Some(id);
        }
        self.tail = Some(id);
        self.nodes.insert(id, node);
    }

    /// Remove `id` if present. Returns whether it was tracked.
    pub fn remove(&mut self, id: BlockId) -> bool {
        self.unlink(id)
    }

    /// Remove and return the least-recent id.
    pub fn pop_back(&mut self) -> Option<BlockId> {
        let id = self.tail?;
        self.unlink(id);
        Some(id)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    /// Ids from most-recent to least-recent.
    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        std::iter::successors(self.head, move |id| {
            self.nodes.get(id).and_then(|node| node.next)
        })
    }

    fn push_front(&mut self, id: BlockId) {
        let node = Node {
            prev: None,
            next: self.head,
        };
        if let Some(old_head) = self.head {
            if let Some(h) = self.nodes.get_mut(&old_head) {
                h.prev = Some(id);
            }
        } else {
            self.tail = Some(id);
        }
        self.head = Some(id);
        self.nodes.insert(id, node);
    }

    fn unlink(&mut self, id: BlockId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        match node.prev {
            Some(prev) => {
                if let Some(p) = self.nodes.get_mut(&prev) {
                    p.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = self.nodes.get_mut(&next) {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i64) -> BlockId {
        BlockId::new(raw)
    }

    fn order(lru: &LruIndex) -> Vec<i64> {
        lru.iter().map(BlockId::get).collect()
    }

    #[test]
    fn touch_moves_to_front() {
        let mut lru = LruIndex::new();
        for raw in 0..4 {
            lru.touch(id(raw));
        }
        assert_eq!(order(&lru), vec![3, 2, 1, 0]);

        lru.touch(id(1));
        assert_eq!(order(&lru), vec![1, 3, 2, 0]);
        assert_eq!(lru.tail(), Some(id(0)));
    }

    #[test]
    fn pop_back_is_least_recent() {
        let mut lru = LruIndex::new();
        for raw in 0..3 {
            lru.touch(id(raw));
        }
        assert_eq!(lru.pop_back(), Some(id(0)));
        assert_eq!(lru.pop_back(), Some(id(1)));
        assert_eq!(lru.pop_back(), Some(id(2)));
        assert_eq!(lru.pop_back(), None);
        assert!(lru.is_empty());
    }

    #[test]
    fn remove_mid_list_keeps_links() {
        let mut lru = LruIndex::new();
        for raw in 0..5 {
            lru.touch(id(raw));
        }
        assert!(lru.remove(id(2)));
        assert!(!lru.remove(id(2)));
        assert_eq!(order(&lru), vec![4, 3, 1, 0]);

        assert!(lru.remove(id(4))); // head
        assert!(lru.remove(id(0))); // tail
        assert_eq!(order(&lru), vec![3, 1]);
        assert_eq!(lru.tail(), Some(id(1)));
    }

    #[test]
    fn push_back_rebuilds_serialized_order() {
        let mut lru = LruIndex::new();
        for raw in [4, 3, 1, 2, 0] {
            lru.push_back(id(raw));
        }
        assert_eq!(order(&lru), vec![4, 3, 1, 2, 0]);
        assert_eq!(lru.pop_back(), Some(id(0)));
    }

    #[test]
    fn touch_single_entry_is_stable() {
        let mut lru = LruIndex::new();
        lru.touch(id(9));
        lru.touch(id(9));
        assert_eq!(order(&lru), vec![9]);
        assert_eq!(lru.tail(), Some(id(9)));
    }
}
