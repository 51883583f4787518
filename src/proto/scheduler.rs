use slab::Slab;

use crate::frame::StreamId;

/// Slots in the recently-closed ring. A dependency naming a stream that
/// closed within the last few requests still resolves to that stream's spot
/// in the tree instead of the default priority.
pub const RECENTLY_CLOSED_SLOTS: usize = 10;

/// One "round" of service. A child of weight `w` advances its virtual time
/// by `SERVICE_UNIT / w` per visit, so heavier children are visited
/// proportionally more often.
const SERVICE_UNIT: u64 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeKey(usize);

/// The weighted dependency tree of RFC 7540 section 5.3.
///
/// Parents own their children; a child holds a non-owning index back to its
/// parent. A node is visited only when no ancestor has work of its own:
/// descent stops at the first active node, and among the queued children of
/// a node the one with the smallest virtual time is taken.
#[derive(Debug)]
pub struct Scheduler {
    nodes: Slab<Node>,
    root: usize,
    ring: ClosedRing,
}

#[derive(Debug)]
struct Node {
    parent: Option<usize>,
    children: Vec<usize>,
    weight: u16,
    stream_id: StreamId,

    /// The node itself has work.
    active: bool,

    /// The node participates in its parent's selection (it or some
    /// descendant is active).
    queued: bool,

    /// Number of queued children.
    pending: usize,

    vtime: u64,
    vclock: u64,
}

#[derive(Debug)]
struct ClosedRing {
    slots: [Option<(StreamId, usize)>; RECENTLY_CLOSED_SLOTS],
    next: usize,
}

impl Node {
    fn new(parent: Option<usize>, weight: u16, stream_id: StreamId) -> Node {
        Node {
            parent,
            children: Vec::new(),
            weight,
            stream_id,
            active: false,
            queued: false,
            pending: 0,
            vtime: 0,
            vclock: 0,
        }
    }
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let mut nodes = Slab::new();
        let root = nodes.insert(Node::new(None, 0, StreamId::ZERO));
        Scheduler {
            nodes,
            root,
            ring: ClosedRing {
                slots: Default::default(),
                next: 0,
            },
        }
    }

    pub fn root(&self) -> NodeKey {
        NodeKey(self.root)
    }

    pub fn is_root(&self, key: NodeKey) -> bool {
        key.0 == self.root
    }

    pub fn weight(&self, key: NodeKey) -> u16 {
        self.nodes[key.0].weight
    }

    pub fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.nodes[key.0].parent.map(NodeKey)
    }

    /// Any stream anywhere in the tree waiting to emit?
    pub fn is_active(&self) -> bool {
        self.nodes[self.root].pending > 0
    }

    /// Insert a new node under `parent`.
    pub fn open(
        &mut self,
        parent: NodeKey,
        weight: u16,
        exclusive: bool,
        stream_id: StreamId,
    ) -> NodeKey {
        let key = self.nodes.insert(Node::new(Some(parent.0), weight, stream_id));
        self.nodes[parent.0].children.push(key);

        if exclusive {
            self.adopt_siblings(key);
        }

        NodeKey(key)
    }

    /// Move an existing node to a new position, updating its weight.
    pub fn rebind(&mut self, key: NodeKey, parent: NodeKey, weight: u16, exclusive: bool) {
        if key == parent {
            return;
        }

        // Moving a node below one of its own descendants would create a
        // cycle; the descendant is first moved up to the node's old spot,
        // retaining its weight (RFC 7540 section 5.3.3).
        if self.is_descendant(parent.0, key.0) {
            let old_parent = self.nodes[key.0].parent.expect("rebinding the root");
            self.detach(parent.0);
            self.attach(parent.0, old_parent);
        }

        self.detach(key.0);
        self.nodes[key.0].weight = weight;
        self.attach(key.0, parent.0);

        if exclusive {
            self.adopt_siblings(key.0);
        }
    }

    /// Mark the node as having work. Idempotent.
    pub fn activate(&mut self, key: NodeKey) {
        if !self.nodes[key.0].active {
            self.nodes[key.0].active = true;
            self.refresh(key.0);
        }
    }

    /// Remove the node from the active traversal without touching the tree.
    pub fn deactivate(&mut self, key: NodeKey) {
        if self.nodes[key.0].active {
            self.nodes[key.0].active = false;
            self.refresh(key.0);
        }
    }

    /// Detach the node from the tree. Children are reparented to the node's
    /// parent with weights scaled proportionally to their share of the
    /// closed node's weight (RFC 7540 section 5.3.4).
    pub fn close(&mut self, key: NodeKey) {
        let key = key.0;
        debug_assert!(key != self.root, "cannot close the root node");

        let parent = self.nodes[key].parent.expect("closing the root");
        self.detach(key);
        let node = self.nodes.remove(key);

        let total: u64 = node
            .children
            .iter()
            .map(|&c| self.nodes[c].weight as u64)
            .sum();

        for c in node.children {
            let scaled = (self.nodes[c].weight as u64 * node.weight as u64) / total.max(1);
            self.nodes[c].weight = scaled.max(1).min(256) as u16;
            self.nodes[c].queued = false;
            self.attach(c, parent);
        }
    }

    /// Retire a closed stream's node into the ring, deactivated but still in
    /// the tree so late dependencies keep resolving to it. The displaced
    /// oldest slot is closed for real.
    pub fn retire(&mut self, key: NodeKey, stream_id: StreamId) {
        self.deactivate(key);

        let slot = self.ring.next;
        self.ring.next = (slot + 1) % RECENTLY_CLOSED_SLOTS;

        if let Some((_, old)) = self.ring.slots[slot].take() {
            self.close(NodeKey(old));
        }
        self.ring.slots[slot] = Some((stream_id, key.0));
    }

    pub fn ring_find(&self, stream_id: StreamId) -> Option<NodeKey> {
        self.ring
            .slots
            .iter()
            .filter_map(|s| *s)
            .find(|&(id, _)| id == stream_id)
            .map(|(_, key)| NodeKey(key))
    }

    /// Walk the heaviest-child chain from the root while it outweighs
    /// `weight`; the last such node is where a stream of that weight would
    /// sit in a browser-style chain of exclusive dependencies.
    pub fn find_parent_by_weight(&self, weight: u16) -> NodeKey {
        let mut node = self.root;
        loop {
            let next = self.nodes[node]
                .children
                .iter()
                .cloned()
                .max_by_key(|&c| self.nodes[c].weight);
            match next {
                Some(c) if self.nodes[c].weight > weight => node = c,
                _ => return NodeKey(node),
            }
        }
    }

    /// Weighted round-robin over the active streams.
    ///
    /// The callback returns `(still_active, keep_going)`: whether the served
    /// stream stays in the rotation, and whether the run continues at all.
    pub fn run<F: FnMut(StreamId) -> (bool, bool)>(&mut self, mut cb: F) {
        loop {
            let mut path: Vec<usize> = Vec::new();
            let mut node = self.root;

            loop {
                if node != self.root && self.nodes[node].active {
                    break;
                }
                let next = self.nodes[node]
                    .children
                    .iter()
                    .cloned()
                    .filter(|&c| self.nodes[c].queued)
                    .min_by_key(|&c| self.nodes[c].vtime);
                match next {
                    Some(c) => {
                        path.push(c);
                        node = c;
                    }
                    None => return,
                }
            }

            // Charge the service along the descent path.
            for &c in &path {
                let p = self.nodes[c].parent.expect("path node without parent");
                let vt = self.nodes[c].vtime;
                self.nodes[p].vclock = vt;
                let w = self.nodes[c].weight.max(1) as u64;
                self.nodes[c].vtime = vt + SERVICE_UNIT / w;
            }

            let id = self.nodes[node].stream_id;
            let (still_active, keep_going) = cb(id);

            if !still_active {
                self.deactivate(NodeKey(node));
            }
            if !keep_going {
                return;
            }
        }
    }

    // ===== tree plumbing =====

    fn is_descendant(&self, node: usize, ancestor: usize) -> bool {
        let mut cur = self.nodes[node].parent;
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.nodes[p].parent;
        }
        false
    }

    /// Move every sibling of `key` beneath it, weights retained.
    fn adopt_siblings(&mut self, key: usize) {
        let parent = self.nodes[key].parent.expect("exclusive insert at root");
        let siblings: Vec<usize> = self.nodes[parent]
            .children
            .iter()
            .cloned()
            .filter(|&c| c != key)
            .collect();

        for c in siblings {
            self.detach(c);
            self.attach(c, key);
        }
    }

    fn detach(&mut self, key: usize) {
        let parent = self.nodes[key].parent.expect("detaching the root");

        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == key)
            .expect("child not registered with parent");
        self.nodes[parent].children.swap_remove(pos);

        if self.nodes[key].queued {
            self.nodes[key].queued = false;
            self.nodes[parent].pending -= 1;
            self.refresh(parent);
        }
        self.nodes[key].parent = None;
    }

    fn attach(&mut self, key: usize, parent: usize) {
        debug_assert!(self.nodes[key].parent.is_none());
        self.nodes[key].parent = Some(parent);
        self.nodes[parent].children.push(key);
        self.refresh(key);
    }

    /// Re-derive the `queued` flag from `key` upward after an activation
    /// change somewhere in its subtree.
    fn refresh(&mut self, mut key: usize) {
        while key != self.root {
            let should = {
                let n = &self.nodes[key];
                n.active || n.pending > 0
            };
            if should == self.nodes[key].queued {
                return;
            }

            let parent = self.nodes[key].parent.expect("non-root node without parent");
            self.nodes[key].queued = should;
            if should {
                let base = self.nodes[parent].vclock;
                let w = self.nodes[key].weight.max(1) as u64;
                self.nodes[key].vtime = base + SERVICE_UNIT / w;
                self.nodes[parent].pending += 1;
            } else {
                self.nodes[parent].pending -= 1;
            }

            key = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> StreamId {
        StreamId::from(n)
    }

    /// Run until every stream was served `rounds` times, recording the
    /// service order.
    fn serve(sched: &mut Scheduler, rounds: usize) -> Vec<StreamId> {
        let mut order = Vec::new();
        let mut served = std::collections::HashMap::new();
        sched.run(|stream| {
            order.push(stream);
            let count = served.entry(stream).or_insert(0usize);
            *count += 1;
            (*count < rounds, order.len() < rounds * 16)
        });
        order
    }

    #[test]
    fn service_is_proportional_to_weight() {
        let mut sched = Scheduler::new();
        let root = sched.root();
        let a = sched.open(root, 32, false, id(1));
        let b = sched.open(root, 8, false, id(3));
        sched.activate(a);
        sched.activate(b);

        let mut counts = (0usize, 0usize);
        let mut total = 0usize;
        sched.run(|stream| {
            if stream == id(1) {
                counts.0 += 1;
            } else {
                counts.1 += 1;
            }
            total += 1;
            (true, total < 100)
        });

        // 32:8 -- stream 1 should get roughly four times the service.
        assert!(counts.0 > counts.1 * 3, "counts={:?}", counts);
        assert!(counts.1 > 0);
    }

    #[test]
    fn parent_is_served_before_children() {
        let mut sched = Scheduler::new();
        let root = sched.root();
        let parent = sched.open(root, 16, false, id(1));
        let child = sched.open(parent, 16, false, id(3));
        sched.activate(parent);
        sched.activate(child);

        let order = serve(&mut sched, 1);
        assert_eq!(order, vec![id(1), id(3)]);
    }

    #[test]
    fn exclusive_open_adopts_siblings() {
        let mut sched = Scheduler::new();
        let root = sched.root();
        let a = sched.open(root, 16, false, id(1));
        let b = sched.open(root, 16, false, id(3));
        let c = sched.open(root, 16, true, id(5));

        assert_eq!(sched.parent(a), Some(c));
        assert_eq!(sched.parent(b), Some(c));
        assert_eq!(sched.parent(c), Some(root));
    }

    #[test]
    fn close_reparents_with_scaled_weights() {
        let mut sched = Scheduler::new();
        let root = sched.root();
        let parent = sched.open(root, 16, false, id(1));
        let a = sched.open(parent, 8, false, id(3));
        let b = sched.open(parent, 24, false, id(5));

        sched.close(parent);

        assert_eq!(sched.parent(a), Some(root));
        assert_eq!(sched.parent(b), Some(root));
        // 8/32 and 24/32 of the closed node's 16.
        assert_eq!(sched.weight(a), 4);
        assert_eq!(sched.weight(b), 12);
    }

    #[test]
    fn rebind_below_descendant_lifts_the_descendant_first() {
        let mut sched = Scheduler::new();
        let root = sched.root();
        let a = sched.open(root, 16, false, id(1));
        let b = sched.open(a, 16, false, id(3));

        sched.rebind(a, b, 12, false);

        assert_eq!(sched.parent(b), Some(root));
        assert_eq!(sched.parent(a), Some(b));
        assert_eq!(sched.weight(a), 12);
    }

    #[test]
    fn activation_propagates_through_inactive_interior_nodes() {
        let mut sched = Scheduler::new();
        let root = sched.root();
        let interior = sched.open(root, 16, false, id(1));
        let leaf = sched.open(interior, 16, false, id(3));

        assert!(!sched.is_active());
        sched.activate(leaf);
        assert!(sched.is_active());

        let order = serve(&mut sched, 1);
        assert_eq!(order, vec![id(3)]);
        assert!(!sched.is_active());
    }

    #[test]
    fn ring_keeps_at_most_k_entries_and_evicts_the_oldest() {
        let mut sched = Scheduler::new();
        let root = sched.root();

        let keys: Vec<_> = (0..=RECENTLY_CLOSED_SLOTS as u32)
            .map(|i| sched.open(root, 16, false, id(1 + 2 * i)))
            .collect();

        for (i, key) in keys.iter().enumerate() {
            sched.retire(*key, id(1 + 2 * i as u32));
        }

        // The first retired stream was displaced by the eleventh.
        assert!(sched.ring_find(id(1)).is_none());
        for i in 1..=RECENTLY_CLOSED_SLOTS as u32 {
            assert!(sched.ring_find(id(1 + 2 * i)).is_some());
        }
    }

    #[test]
    fn dependency_on_ring_node_still_schedules() {
        let mut sched = Scheduler::new();
        let root = sched.root();
        let closed = sched.open(root, 16, false, id(1));
        sched.retire(closed, id(1));

        // A later stream depends on the retired one.
        let ring_parent = sched.ring_find(id(1)).unwrap();
        let child = sched.open(ring_parent, 16, false, id(3));
        sched.activate(child);

        let order = serve(&mut sched, 1);
        assert_eq!(order, vec![id(3)]);
    }

    #[test]
    fn find_parent_by_weight_walks_the_heavy_chain() {
        let mut sched = Scheduler::new();
        let root = sched.root();
        let a = sched.open(root, 256, false, id(1));
        let b = sched.open(a, 183, false, id(3));
        let _c = sched.open(b, 110, false, id(5));

        assert_eq!(sched.find_parent_by_weight(147), b);
        assert_eq!(sched.find_parent_by_weight(220), a);
        assert_eq!(sched.find_parent_by_weight(256), root);
    }
}
