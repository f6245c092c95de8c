//! Tree pieces: the partition workers. Each owns one contiguous key
//! range of particles, builds the local octree under a synthetic root
//! spanning all partitions, hosts traversals and applies forces.

use std::collections::{BTreeSet, HashSet, VecDeque};

use crate::cache::{CacheManager, WireKind, WireNode};
use crate::constants::{BRANCH_FACTOR, BUCKET_TOLERANCE, MAX_DEPTH, ROOT_KEY};
use crate::error::{TreecodeError, TreecodeResult};
use crate::node::{CentroidData, Node, NodeType};
use crate::resumer::Resumer;
use crate::types::morton::{
    binary_search_ge, child, is_prefix, parent, remove_leading_zeros, Key,
};
use crate::types::point::{Particle, Real};
use crate::types::splitter::{owner_of_subtree, Splitter};
use crate::visitors::centroid::CentroidVisitor;
use crate::visitors::{SourceNode, TargetLeaf, TraversalMode, Visitor, VisitorSpec};

/// Outbound effect of a tree piece operation, translated into messages
/// by the owning branch.
#[derive(Clone, Debug, PartialEq)]
pub enum TpSend {
    /// Fetch a key from the tree element that aggregates it.
    RequestTe { key: Key },
    /// Fetch a key from the tree piece that owns it.
    RequestTp { key: Key, owner: usize },
    /// Post the local aggregate to the tree element at `key`.
    Contribute { key: Key, data: CentroidData },
    /// Every leaf traversal of this piece has finished.
    Done,
}

/// Resolution of a key against the local tree, the cache and the
/// splitter table.
enum Resolved {
    /// A consumable node snapshot.
    Node(SourceNode),
    /// A cell known to hold nothing; no interaction, no fetch.
    Skip,
    /// Must be fetched from its owning tree piece.
    FetchTp { owner: usize },
    /// Must be fetched via its tree element.
    FetchTe,
}

#[derive(Debug, Default)]
pub struct TreePiece {
    pub index: usize,
    tp_key: Key,
    n_expected: usize,
    bucket_capacity: usize,
    particles: Vec<Particle>,
    /// Arena of local nodes; the synthetic root is index 0.
    nodes: Vec<Node>,
    /// Arena indices of the local buckets.
    leaves: Vec<usize>,
    /// Per-leaf frontier of keys still to be traversed.
    curr_nodes: Vec<HashSet<Key>>,
    /// Per-leaf top of the explored region; ascends as branches drain.
    trav_tops: Vec<Key>,
    num_done: usize,
    done_signaled: bool,
}

impl TreePiece {
    pub fn new(index: usize, splitter: &Splitter, max_particles_per_leaf: usize) -> Self {
        TreePiece {
            index,
            tp_key: splitter.tp_key,
            n_expected: splitter.n_particles,
            bucket_capacity: (BUCKET_TOLERANCE * max_particles_per_leaf as f64).ceil() as usize,
            ..TreePiece::default()
        }
    }

    pub fn tp_key(&self) -> Key {
        self.tp_key
    }

    pub fn n_leaves(&self) -> usize {
        self.leaves.len()
    }

    /// Particles arrive in one or more batches from the readers.
    pub fn receive(&mut self, mut particles: Vec<Particle>) {
        self.particles.append(&mut particles);
    }

    /// After quiescence the delivered count must match the splitter.
    pub fn check(&self) -> TreecodeResult<()> {
        if self.particles.len() != self.n_expected {
            return Err(TreecodeError::DeliveryMismatch {
                tp: self.index,
                got: self.particles.len(),
                expected: self.n_expected,
            });
        }
        Ok(())
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Return all particles to the reader for a rebuild.
    pub fn take_particles(&mut self) -> Vec<Particle> {
        self.nodes.clear();
        self.leaves.clear();
        std::mem::take(&mut self.particles)
    }

    /// Sort the received particles and build the local octree under the
    /// synthetic root with key 1, so that boundary cells above the
    /// piece's own key exist and are routable.
    pub fn build(&mut self, splitters: &[Splitter]) -> TreecodeResult<()> {
        self.particles.sort_unstable();
        self.nodes.clear();
        self.leaves.clear();

        self.nodes
            .push(Node::new(ROOT_KEY, 0, 0, self.particles.len(), None));
        self.build_recursive(0, false, splitters);

        let local_root = self.find_node(self.tp_key).ok_or_else(|| {
            TreecodeError::invariant(self.index as i64, "piece root missing after build")
        })?;
        match self.nodes[local_root].node_type {
            NodeType::Internal | NodeType::Leaf | NodeType::EmptyLeaf => Ok(()),
            other => Err(TreecodeError::invariant(
                self.index as i64,
                format!("piece root has type {:?}", other),
            )),
        }
    }

    /// Returns whether the subtree at `node_idx` is entirely local.
    fn build_recursive(&mut self, node_idx: usize, mut saw_tp_key: bool, splitters: &[Splitter]) -> bool {
        let (key, node_depth, first, n) = {
            let node = &self.nodes[node_idx];
            (node.key, node.depth, node.first_particle, node.n_particles)
        };

        if !saw_tp_key {
            saw_tp_key = key == self.tp_key;
        }

        if saw_tp_key {
            // Under the piece's key we stop as soon as the bucket is
            // light; duplicate keys force a stop at maximum depth.
            let is_light = n <= self.bucket_capacity;
            if is_light || node_depth == MAX_DEPTH {
                if n == 0 {
                    self.nodes[node_idx].node_type = NodeType::EmptyLeaf;
                } else {
                    self.nodes[node_idx].node_type = NodeType::Leaf;
                    self.leaves.push(node_idx);
                }
                return true;
            }
        } else if !is_prefix(key, self.tp_key) && !is_prefix(self.tp_key, key) {
            // Diverged from the path to the piece's subtree.
            self.classify_divergent(node_idx, splitters);
            return false;
        }

        // All other cases go deeper: create the eight children, each
        // taking the particle subrange up to its sibling's first key.
        let finish = first + n;
        let mut start = first;
        let mut non_local_children = 0;
        for octant in 0..BRANCH_FACTOR {
            let child_key = child(key, octant);
            let first_ge_idx = if octant < BRANCH_FACTOR - 1 {
                let sibling_splitter = remove_leading_zeros(child_key + 1);
                binary_search_ge(sibling_splitter, &self.particles, start, finish)
            } else {
                finish
            };

            let child_idx = self.nodes.len();
            self.nodes.push(Node::new(
                child_key,
                node_depth + 1,
                start,
                first_ge_idx - start,
                Some(node_idx),
            ));
            self.nodes[node_idx].children.push(child_idx);

            if !self.build_recursive(child_idx, saw_tp_key, splitters) {
                non_local_children += 1;
            }
            start = first_ge_idx;
        }

        self.nodes[node_idx].node_type = if non_local_children == 0 {
            NodeType::Internal
        } else {
            NodeType::Boundary
        };
        non_local_children == 0
    }

    /// Type a cell that diverged from the path to the piece's key.
    /// With a single owning partition the splitter table already tells
    /// whether the remote cell is empty or a single bucket.
    fn classify_divergent(&mut self, node_idx: usize, splitters: &[Splitter]) {
        let key = self.nodes[node_idx].key;
        match owner_of_subtree(splitters, key) {
            Some(owner) => {
                let assigned = splitters[owner].n_particles;
                self.nodes[node_idx].owner_tp = owner as i64;
                self.nodes[node_idx].node_type = if assigned == 0 {
                    NodeType::RemoteEmptyLeaf
                } else if splitters[owner].tp_key == key && assigned <= self.bucket_capacity {
                    NodeType::RemoteLeaf
                } else {
                    NodeType::Remote
                };
            }
            None => {
                // Above partition granularity: spans several owners and
                // is reachable only through its tree element.
                self.nodes[node_idx].node_type = NodeType::RemoteAboveTpKey;
            }
        }
    }

    /// Walk the octal digits of `key` down the arena from the synthetic
    /// root. `None` when the path leaves the materialized tree.
    pub fn find_node(&self, key: Key) -> Option<usize> {
        let mut digits = Vec::new();
        let mut k = key;
        while k > ROOT_KEY {
            digits.push((k & 0x7) as usize);
            k >>= 3;
        }

        let mut idx = 0;
        for &digit in digits.iter().rev() {
            if self.nodes[idx].children.is_empty() {
                return None;
            }
            idx = self.nodes[idx].children[digit];
        }
        Some(idx)
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Upward centroid pass. A down queue walks the local tree to the
    /// buckets, counting the locally-aggregated children of each cell;
    /// an up queue folds completed cells into their parents. The whole
    /// local aggregate is posted at the piece's key; a piece with no
    /// buckets still posts an empty contribution so the global
    /// aggregation cannot stall.
    pub fn up_only(&mut self, out: &mut Vec<TpSend>) {
        let mut down: VecDeque<usize> = VecDeque::new();
        let mut up: VecDeque<usize> = VecDeque::new();

        down.push_back(0);
        while let Some(idx) = down.pop_front() {
            self.nodes[idx].wait_count = 0;
            self.nodes[idx].data = CentroidData::default();

            let children = self.nodes[idx].children.clone();
            for child_idx in children {
                match self.nodes[child_idx].node_type {
                    NodeType::Internal | NodeType::Boundary | NodeType::Leaf => {
                        down.push_back(child_idx);
                        self.nodes[idx].wait_count += 1;
                    }
                    _ => {}
                }
            }

            if self.nodes[idx].node_type == NodeType::Leaf {
                let range = self.nodes[idx].particle_range();
                self.nodes[idx].data = CentroidVisitor::leaf(&self.particles[range]);
                up.push_back(idx);
            }
        }

        if up.is_empty() {
            out.push(TpSend::Contribute {
                key: self.tp_key,
                data: CentroidData::default(),
            });
        }

        while let Some(idx) = up.pop_front() {
            if self.nodes[idx].key == self.tp_key {
                out.push(TpSend::Contribute {
                    key: self.tp_key,
                    data: self.nodes[idx].data,
                });
            }
            if let Some(parent_idx) = self.nodes[idx].parent {
                let child_data = self.nodes[idx].data;
                let parent_node = &mut self.nodes[parent_idx];
                CentroidVisitor::node(&mut parent_node.data, &child_data);
                parent_node.wait_count -= 1;
                if parent_node.wait_count == 0 {
                    up.push_back(parent_idx);
                }
            }
        }
    }

    /// Seed the per-leaf traversal state and return the keys to start
    /// descending from.
    pub fn start_traversal(&mut self, spec: &VisitorSpec) -> Vec<Key> {
        self.num_done = 0;
        self.done_signaled = false;
        self.curr_nodes = vec![HashSet::new(); self.leaves.len()];

        match spec {
            VisitorSpec::Gravity { .. } => {
                for p in &mut self.particles {
                    p.force = crate::types::vector::Vec3::ZERO;
                }
            }
            VisitorSpec::Density { .. } => {
                for p in &mut self.particles {
                    p.density = 0.0;
                }
            }
            _ => {}
        }

        match spec.mode() {
            TraversalMode::TopDown => {
                self.trav_tops = vec![ROOT_KEY; self.leaves.len()];
                for frontier in &mut self.curr_nodes {
                    frontier.insert(ROOT_KEY);
                }
                vec![ROOT_KEY]
            }
            TraversalMode::UpAndDown => {
                let mut keys = Vec::with_capacity(self.leaves.len());
                self.trav_tops = Vec::with_capacity(self.leaves.len());
                for (i, &leaf_idx) in self.leaves.iter().enumerate() {
                    let key = self.nodes[leaf_idx].key;
                    self.curr_nodes[i].insert(key);
                    self.trav_tops.push(key);
                    keys.push(key);
                }
                keys
            }
        }
    }

    /// Process `start_key` for every leaf whose frontier holds it,
    /// descending with the visitor until each branch either drains or
    /// suspends on a remote fetch. Newly opened sibling branches are
    /// accumulated on a worklist instead of recursing.
    pub fn go_down<V: Visitor>(
        &mut self,
        start_key: Key,
        v: &mut V,
        cache: &mut CacheManager,
        resumer: &mut Resumer,
        splitters: &[Splitter],
        out: &mut Vec<TpSend>,
    ) {
        let mut worklist = vec![start_key];
        while let Some(new_key) = worklist.pop() {
            let mut to_go_down: BTreeSet<Key> = BTreeSet::new();

            for i in 0..self.leaves.len() {
                if !self.curr_nodes[i].remove(&new_key) {
                    continue;
                }
                let leaf_idx = self.leaves[i];

                let mut stack = vec![new_key];
                while let Some(key) = stack.pop() {
                    // A fetch already in flight: latch on instead of
                    // re-issuing, and suspend this branch.
                    if cache.is_waiting(key) {
                        self.curr_nodes[i].insert(key);
                        cache.add_waiter(key, self.index);
                        resumer.note_blocked(key, self.index);
                        continue;
                    }

                    match self.resolve(key, cache, splitters) {
                        Resolved::Node(source) => {
                            let (first, n, leaf_key, leaf_data) = {
                                let leaf = &self.nodes[leaf_idx];
                                (
                                    leaf.first_particle,
                                    leaf.n_particles,
                                    leaf.key,
                                    leaf.data,
                                )
                            };
                            let mut target = TargetLeaf {
                                key: leaf_key,
                                data: leaf_data,
                                particles: &mut self.particles[first..first + n],
                            };
                            match source.node_type {
                                NodeType::Internal
                                | NodeType::CachedRemote
                                | NodeType::CachedBoundary => {
                                    if v.node(&source, &mut target) {
                                        for octant in 0..BRANCH_FACTOR {
                                            stack.push(child(key, octant));
                                        }
                                    }
                                }
                                NodeType::Leaf | NodeType::CachedRemoteLeaf => {
                                    v.leaf(&source, &mut target);
                                }
                                _ => {}
                            }
                        }
                        Resolved::Skip => {}
                        Resolved::FetchTp { owner } => {
                            self.curr_nodes[i].insert(key);
                            resumer.note_blocked(key, self.index);
                            cache.insert_waiting(key, self.index);
                            out.push(TpSend::RequestTp { key, owner });
                        }
                        Resolved::FetchTe => {
                            self.curr_nodes[i].insert(key);
                            resumer.note_blocked(key, self.index);
                            cache.insert_waiting(key, self.index);
                            out.push(TpSend::RequestTe { key });
                        }
                    }
                }

                // Branch drained: widen by ascending, or finish.
                if self.curr_nodes[i].is_empty() {
                    if self.trav_tops[i] == ROOT_KEY {
                        self.num_done += 1;
                    } else {
                        let up_key = parent(self.trav_tops[i]);
                        for octant in 0..BRANCH_FACTOR {
                            let sibling = child(up_key, octant);
                            if sibling != self.trav_tops[i] {
                                self.curr_nodes[i].insert(sibling);
                                to_go_down.insert(sibling);
                            }
                        }
                        self.trav_tops[i] = up_key;
                    }
                }
            }

            worklist.extend(to_go_down);
        }

        if self.num_done == self.leaves.len() && !self.done_signaled {
            self.done_signaled = true;
            out.push(TpSend::Done);
        }
    }

    /// Resolve a key for the downward traversal. The local arena is
    /// authoritative under the piece's key; elsewhere the cache is
    /// consulted first, then the local divergence ring, then the
    /// splitter table.
    fn resolve(&self, key: Key, cache: &CacheManager, splitters: &[Splitter]) -> Resolved {
        if is_prefix(self.tp_key, key) {
            let idx = match self.find_node(key) {
                Some(idx) => idx,
                None => {
                    debug_assert!(false, "traversal descended below a local bucket");
                    return Resolved::Skip;
                }
            };
            return match self.nodes[idx].node_type {
                NodeType::EmptyLeaf => Resolved::Skip,
                _ => Resolved::Node(self.snapshot(idx)),
            };
        }

        if let Some(cached) = cache.get(key) {
            return match cached.node_type {
                NodeType::Remote => Resolved::FetchTp {
                    owner: cached.owner_tp as usize,
                },
                NodeType::RemoteEmptyLeaf => Resolved::Skip,
                _ => Resolved::Node(SourceNode {
                    key,
                    node_type: cached.node_type,
                    data: cached.data,
                    particles: cached.particles.clone(),
                }),
            };
        }

        if let Some(idx) = self.find_node(key) {
            return match self.nodes[idx].node_type {
                NodeType::Boundary | NodeType::RemoteAboveTpKey => Resolved::FetchTe,
                NodeType::Remote | NodeType::RemoteLeaf => Resolved::FetchTp {
                    owner: self.nodes[idx].owner_tp as usize,
                },
                NodeType::RemoteEmptyLeaf => Resolved::Skip,
                _ => Resolved::Node(self.snapshot(idx)),
            };
        }

        match owner_of_subtree(splitters, key) {
            Some(owner) => Resolved::FetchTp { owner },
            None => Resolved::FetchTe,
        }
    }

    fn snapshot(&self, idx: usize) -> SourceNode {
        let node = &self.nodes[idx];
        let particles = if node.node_type == NodeType::Leaf {
            self.particles[node.particle_range()].to_vec()
        } else {
            Vec::new()
        };
        SourceNode {
            key: node.key,
            node_type: node.node_type,
            data: node.data,
            particles,
        }
    }

    /// Serve a remote fetch: the node at `key`, its children and its
    /// grandchildren, with bucket particles attached for any leaf in
    /// the slab. The depth-2 slab saves round trips; nodes whose
    /// children stay behind are shipped as remote stubs.
    pub fn request_nodes(&self, key: Key) -> TreecodeResult<Vec<WireNode>> {
        let node_idx = self.find_node(key).ok_or_else(|| {
            TreecodeError::invariant(
                self.index as i64,
                format!("served a fetch for unknown key {:o}", key),
            )
        })?;

        let mut nodes = Vec::new();
        let mut queue: VecDeque<(usize, u32)> = VecDeque::new();
        queue.push_back((node_idx, 0));
        while let Some((idx, level)) = queue.pop_front() {
            let node = &self.nodes[idx];
            let include_children = level < 2 && !node.children.is_empty();
            let kind = match node.node_type {
                NodeType::Leaf => WireKind::Leaf,
                NodeType::EmptyLeaf => WireKind::EmptyLeaf,
                _ if include_children => WireKind::Internal,
                _ => WireKind::Remote,
            };
            let particles = if kind == WireKind::Leaf {
                self.particles[node.particle_range()].to_vec()
            } else {
                Vec::new()
            };
            nodes.push(WireNode {
                key: node.key,
                kind,
                data: node.data,
                owner_tp: self.index as i64,
                particles,
            });
            if include_children {
                for &child_idx in &node.children {
                    queue.push_back((child_idx, level + 1));
                }
            }
        }
        Ok(nodes)
    }

    /// Dump the built local tree as a Graphviz digraph.
    pub fn write_dot<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        crate::node::write_dot(out, &format!("tree_piece_{}", self.index), &self.nodes)
    }

    /// Apply each bucket's accumulated forces to its particles:
    /// `v += (f/m)·dt`, then `x += v·dt`, clearing the accumulators.
    pub fn perturb(&mut self, dt: Real) {
        for &leaf_idx in &self.leaves {
            let range = self.nodes[leaf_idx].particle_range();
            for p in &mut self.particles[range] {
                p.perturb(dt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GRAV_CONST;
    use crate::types::domain::BoundingBox;
    use crate::types::morton::encode_point;
    use crate::types::vector::Vec3;
    use crate::visitors::gravity::GravityVisitor;

    use rand::prelude::*;
    use rand::SeedableRng;

    fn cloud(npoints: usize, seed: u64) -> Vec<Particle> {
        let mut range = StdRng::seed_from_u64(seed);
        let between = rand::distributions::Uniform::from(0.0..1.0);
        (0..npoints)
            .map(|id| Particle {
                id,
                position: Vec3::new(
                    between.sample(&mut range),
                    between.sample(&mut range),
                    between.sample(&mut range),
                ),
                mass: 1.0,
                ..Particle::default()
            })
            .collect()
    }

    /// A single piece spanning the whole key space.
    fn single_piece(particles: Vec<Particle>, max_per_leaf: usize) -> (TreePiece, Vec<Splitter>) {
        let mut particles = particles;
        let universe = BoundingBox::from_particles(&particles);
        let origin = universe.origin();
        let diameter = universe.diameter();
        for p in &mut particles {
            p.key = encode_point(&p.position, &origin, &diameter);
        }

        let splitters = vec![Splitter::new(1, !0, particles.len())];
        let mut tp = TreePiece::new(0, &splitters[0], max_per_leaf);
        tp.receive(particles);
        tp.check().unwrap();
        tp.build(&splitters).unwrap();
        (tp, splitters)
    }

    #[test]
    fn test_build_invariants() {
        let (tp, _) = single_piece(cloud(300, 0), 8);
        let capacity = (BUCKET_TOLERANCE * 8.0).ceil() as usize;

        let mut leaf_particles = 0;
        for node in tp.nodes() {
            match node.node_type {
                NodeType::Leaf => {
                    assert!(node.n_particles > 0);
                    assert!(node.n_particles <= capacity);
                    leaf_particles += node.n_particles;
                }
                NodeType::EmptyLeaf => assert_eq!(node.n_particles, 0),
                NodeType::Internal => {
                    let sum: usize = node
                        .children
                        .iter()
                        .map(|&c| tp.node(c).n_particles)
                        .sum();
                    assert_eq!(node.n_particles, sum);
                    // Child keys are the eight contiguous octants.
                    for (octant, &c) in node.children.iter().enumerate() {
                        assert_eq!(tp.node(c).key, child(node.key, octant));
                    }
                }
                other => panic!("single partition built a {:?} node", other),
            }
        }
        assert_eq!(leaf_particles, 300);
        // The whole tree is local, so the root is internal.
        assert_eq!(tp.node(0).node_type, NodeType::Internal);
    }

    #[test]
    fn test_build_survives_duplicate_keys() {
        // Every particle in the same spot: recursion must cap at the
        // maximum key depth and emit one overfull bucket.
        let particles: Vec<Particle> = (0..50)
            .map(|id| Particle {
                id,
                position: Vec3::new(0.25, 0.25, 0.25),
                mass: 1.0,
                ..Particle::default()
            })
            .collect();

        let (tp, _) = single_piece(particles, 4);
        assert_eq!(tp.n_leaves(), 1);
        let leaf = tp
            .nodes()
            .iter()
            .find(|n| n.node_type == NodeType::Leaf)
            .unwrap();
        assert_eq!(leaf.n_particles, 50);
        assert_eq!(leaf.depth, MAX_DEPTH);
    }

    #[test]
    fn test_boundary_chain_above_piece_key() {
        // Give the piece a depth-2 key; the path above it must be
        // boundary cells, the ring beside it remote.
        let mut particles = cloud(40, 7);
        let universe = BoundingBox::from_particles(&particles);
        let origin = universe.origin();
        let diameter = universe.diameter();
        for p in &mut particles {
            p.key = encode_point(&p.position, &origin, &diameter);
        }

        // Depth-2 splitters under octants 0 and 7, octant-sized
        // splitters in between.
        let mut splitters = Vec::new();
        for c in 0..8u64 {
            splitters.push(Splitter::new(0o100 + c, 0o100 + c + 1, 0));
        }
        for c in 1..7u64 {
            splitters.push(Splitter::new(0o10 + c, 0o10 + c + 1, 0));
        }
        for c in 0..8u64 {
            let to = if c == 7 { !0 } else { 0o170 + c + 1 };
            splitters.push(Splitter::new(0o170 + c, to, 0));
        }
        splitters.sort();

        let tp_key = 0o103;
        let mine: Vec<Particle> = particles
            .iter()
            .filter(|p| is_prefix(tp_key, p.key >> (3 * (MAX_DEPTH - 2))))
            .cloned()
            .collect();
        let idx = splitters
            .iter()
            .position(|s| s.tp_key == tp_key)
            .unwrap();
        splitters[idx] = Splitter::new(0o103, 0o104, mine.len());

        let mut tp = TreePiece::new(idx, &splitters[idx], 8);
        tp.receive(mine);
        tp.check().unwrap();
        tp.build(&splitters).unwrap();

        assert_eq!(tp.node(0).node_type, NodeType::Boundary);
        let mid = tp.find_node(0o10).unwrap();
        assert_eq!(tp.node(mid).node_type, NodeType::Boundary);

        let local_root = tp.find_node(tp_key).unwrap();
        assert!(matches!(
            tp.node(local_root).node_type,
            NodeType::Internal | NodeType::Leaf | NodeType::EmptyLeaf
        ));

        // Siblings of the local root are exactly other partitions.
        for octant in 0..8 {
            let sibling = child(0o10, octant);
            if sibling == tp_key {
                continue;
            }
            let sidx = tp.find_node(sibling).unwrap();
            assert!(matches!(
                tp.node(sidx).node_type,
                NodeType::Remote | NodeType::RemoteLeaf | NodeType::RemoteEmptyLeaf
            ));
        }

        // Depth-1 siblings with exactly one owning partition resolve to
        // remote cells; the one split over several partitions can only
        // be reached through its tree element.
        for octant in 1..7 {
            let sidx = tp.find_node(child(ROOT_KEY, octant)).unwrap();
            assert!(matches!(
                tp.node(sidx).node_type,
                NodeType::Remote | NodeType::RemoteLeaf | NodeType::RemoteEmptyLeaf
            ));
        }
        let sidx = tp.find_node(child(ROOT_KEY, 7)).unwrap();
        assert_eq!(tp.node(sidx).node_type, NodeType::RemoteAboveTpKey);
    }

    #[test]
    fn test_up_only_aggregates_and_posts_at_piece_key() {
        let (mut tp, _) = single_piece(cloud(120, 3), 8);
        let mut out = Vec::new();
        tp.up_only(&mut out);

        assert_eq!(out.len(), 1);
        match &out[0] {
            TpSend::Contribute { key, data } => {
                assert_eq!(*key, ROOT_KEY);
                assert_eq!(data.count, 120);
                assert!((data.total_mass - 120.0).abs() < 1e-9);
            }
            other => panic!("unexpected send {:?}", other),
        }

        // Every interior cell equals the fold of its children.
        for node in tp.nodes() {
            if node.node_type == NodeType::Internal {
                let mut folded = CentroidData::default();
                for &c in &node.children {
                    folded += tp.node(c).data;
                }
                assert_eq!(folded.count, node.data.count);
                assert!((folded.total_mass - node.data.total_mass).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_local_gravity_traversal_matches_direct_sum() {
        let particles = cloud(96, 11);
        let mut direct = particles.clone();
        for i in 0..direct.len() {
            let mut force = Vec3::ZERO;
            for j in 0..direct.len() {
                if i == j {
                    continue;
                }
                let dr = direct[j].position - direct[i].position;
                let rsq = dr.length_squared();
                force += dr * (GRAV_CONST * direct[j].mass * direct[i].mass / (rsq * rsq.sqrt()));
            }
            direct[i].force = force;
        }

        let (mut tp, splitters) = single_piece(particles, 8);
        let mut out = Vec::new();
        tp.up_only(&mut out);

        let spec = VisitorSpec::Gravity { theta: 0.0 };
        let mut cache = CacheManager::default();
        let mut resumer = Resumer::default();
        let mut v = GravityVisitor { theta: 0.0 };
        let mut sends = Vec::new();

        for key in tp.start_traversal(&spec) {
            tp.go_down(key, &mut v, &mut cache, &mut resumer, &splitters, &mut sends);
        }

        // The whole tree is local: no fetches, traversal completes in
        // one shot.
        assert_eq!(sends, vec![TpSend::Done]);

        let mut got: Vec<Particle> = tp.particles().to_vec();
        got.sort_by_key(|p| p.id);
        let mut want = direct;
        want.sort_by_key(|p| p.id);
        for (g, w) in got.iter().zip(&want) {
            let err = (g.force - w.force).length();
            assert!(err < 1e-9 * (1.0 + w.force.length()));
        }
    }

    #[test]
    fn test_dot_dump_lists_every_node() {
        let (tp, _) = single_piece(cloud(64, 2), 8);

        let mut out = Vec::new();
        tp.write_dot(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("digraph tree_piece_0 {"));
        assert!(text.trim_end().ends_with('}'));
        // One label line per node and one edge line per child link.
        let labels = text.lines().filter(|l| l.contains("label=")).count();
        let edges = text.lines().filter(|l| l.contains("->")).count();
        assert_eq!(labels, tp.nodes().len());
        assert_eq!(
            edges,
            tp.nodes().iter().map(|n| n.children.len()).sum::<usize>()
        );
    }

    #[test]
    fn test_delivery_mismatch_is_fatal() {
        let splitters = vec![Splitter::new(1, !0, 10)];
        let mut tp = TreePiece::new(0, &splitters[0], 8);
        tp.receive(cloud(4, 1));

        match tp.check() {
            Err(TreecodeError::DeliveryMismatch { tp: 0, got: 4, expected: 10 }) => {}
            other => panic!("expected a delivery mismatch, got {:?}", other),
        }
    }
}
