//! LRU (Least Recently Used) ordering of buffer slots.

/// Recency list over a fixed range of slot indices
///
/// Nodes live in an arena indexed by slot number, so touching, unlinking
/// and finding the oldest slot are all O(1) per step.
pub struct LruList {
    /// One node per slot
    nodes: Vec<LruNode>,
    /// Most recently used slot
    head: Option<usize>,
    /// Least recently used slot
    tail: Option<usize>,
    /// Number of linked slots
    len: usize,
}

#[derive(Clone, Copy, Default)]
struct LruNode {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

impl LruList {
    /// Create a list able to track slots `0..capacity`
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: vec![LruNode::default(); capacity],
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Mark a slot as most recently used
    pub fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        if self.nodes[slot].linked {
            self.unlink(slot);
        }

        self.nodes[slot] = LruNode {
            prev: None,
            next: self.head,
            linked: true,
        };
        if let Some(old_head) = self.head {
            self.nodes[old_head].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
        self.len += 1;
    }

    /// Stop tracking a slot
    pub fn remove(&mut self, slot: usize) {
        if self.nodes[slot].linked {
            self.unlink(slot);
        }
    }

    /// Slots from least to most recently used
    pub fn iter_oldest(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.tail, move |&slot| self.nodes[slot].prev)
    }

    /// Number of tracked slots
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no slot is tracked
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn unlink(&mut self, slot: usize) {
        let node = self.nodes[slot];

        if let Some(prev) = node.prev {
            self.nodes[prev].next = node.next;
        } else {
            self.head = node.next;
        }

        if let Some(next) = node.next {
            self.nodes[next].prev = node.prev;
        } else {
            self.tail = node.prev;
        }

        self.nodes[slot] = LruNode::default();
        self.len -= 1;
    }
}
