//! Octree nodes and the centroid payload aggregated through the tree.

use std::io::{self, Write};
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::types::domain::Box3;
use crate::types::point::{Particle, Real};
use crate::types::vector::Vec3;

/// Classification of a node relative to the partition that built it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    /// Whole subtree lives inside this partition.
    Internal,
    /// Local bucket of particles; admits leaf interaction.
    Leaf,
    /// Local cell with no particles.
    EmptyLeaf,
    /// Has local descendants but some subtrees belong to other
    /// partitions; aggregated through a tree element.
    Boundary,
    /// Entirely owned by another partition; fetched via its tree piece.
    Remote,
    /// Remote bucket of particles.
    RemoteLeaf,
    /// Remote cell known to be empty.
    RemoteEmptyLeaf,
    /// At or above partition granularity; fetched via its tree element.
    RemoteAboveTpKey,
    /// Aggregate of a boundary-chain cell, materialized in the cache.
    CachedBoundary,
    /// Remote internal node materialized in the cache.
    CachedRemote,
    /// Remote bucket materialized in the cache, particles attached.
    CachedRemoteLeaf,
}

impl NodeType {
    /// Whether a downward traversal can consume the node without a
    /// remote fetch.
    pub fn is_resident(&self) -> bool {
        !matches!(
            self,
            NodeType::Remote
                | NodeType::RemoteLeaf
                | NodeType::Boundary
                | NodeType::RemoteAboveTpKey
        )
    }
}

/// Mass moments of a subtree: bounding box, total mass, mass-weighted
/// position sum and particle count. The additive identity is the empty
/// cell, so partial aggregates combine in any order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CentroidData {
    pub bounds: Box3,
    pub moment: Vec3,
    pub total_mass: Real,
    pub count: usize,
}

impl CentroidData {
    pub fn from_particles(particles: &[Particle]) -> Self {
        let mut data = CentroidData::default();
        for p in particles {
            data.bounds.grow(&p.position);
            data.moment += p.position * p.mass;
            data.total_mass += p.mass;
            data.count += 1;
        }
        data
    }

    /// Mass-weighted centroid; the box center for massless cells.
    pub fn centroid(&self) -> Vec3 {
        if self.total_mass > 0.0 {
            self.moment / self.total_mass
        } else {
            self.bounds.center()
        }
    }
}

impl AddAssign for CentroidData {
    fn add_assign(&mut self, other: CentroidData) {
        self.bounds = self.bounds.union(&other.bounds);
        self.moment += other.moment;
        self.total_mass += other.total_mass;
        self.count += other.count;
    }
}

/// One octree node inside a tree piece. Nodes live in the arena owned
/// by the piece that built them; `children` and `parent` are arena
/// indices, never owning references.
#[derive(Clone, Debug)]
pub struct Node {
    pub key: u64,
    pub depth: u32,
    pub node_type: NodeType,
    /// Start of the particle subrange within the owning piece.
    pub first_particle: usize,
    pub n_particles: usize,
    /// Owning tree piece for remote nodes, `-1` when not applicable.
    pub owner_tp: i64,
    pub children: Vec<usize>,
    pub parent: Option<usize>,
    pub data: CentroidData,
    /// Outstanding child contributions during the upward pass.
    pub wait_count: usize,
}

impl Node {
    pub fn new(
        key: u64,
        depth: u32,
        first_particle: usize,
        n_particles: usize,
        parent: Option<usize>,
    ) -> Self {
        Node {
            key,
            depth,
            node_type: NodeType::Remote,
            first_particle,
            n_particles,
            owner_tp: -1,
            children: Vec::new(),
            parent,
            data: CentroidData::default(),
            wait_count: 0,
        }
    }

    pub fn particle_range(&self) -> std::ops::Range<usize> {
        self.first_particle..self.first_particle + self.n_particles
    }
}

/// Dump an arena-backed tree as a Graphviz digraph, one line per edge.
pub fn write_dot<W: Write>(out: &mut W, name: &str, nodes: &[Node]) -> io::Result<()> {
    writeln!(out, "digraph {} {{", name)?;
    for node in nodes {
        writeln!(
            out,
            "  n{:o} [label=\"{:o}\\n{:?} ({})\"];",
            node.key, node.key, node.node_type, node.n_particles
        )?;
        for &child in &node.children {
            writeln!(out, "  n{:o} -> n{:o};", node.key, nodes[child].key)?;
        }
    }
    writeln!(out, "}}")
}
