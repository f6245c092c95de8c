//! Pluggable traversal visitors.
//!
//! A visitor decides admissibility and performs interactions: `node`
//! returning true means "descend into the source's children against
//! this target leaf"; `leaf` interacts a source bucket with the target
//! bucket. Admissibility predicates are pure functions of node data so
//! traversals stay deterministic.

pub mod centroid;
pub mod count;
pub mod density;
pub mod gravity;
pub mod pressure;
pub mod sph;

use crate::node::{CentroidData, NodeType};
use crate::types::morton::Key;
use crate::types::point::{Particle, Real};

/// Snapshot of a source node handed to visitors. Bucket particles are
/// attached for leaves; the snapshot is decoupled from the arena or
/// cache that owns the node.
#[derive(Clone, Debug)]
pub struct SourceNode {
    pub key: Key,
    pub node_type: NodeType,
    pub data: CentroidData,
    pub particles: Vec<Particle>,
}

/// Mutable view of the target leaf a traversal works for.
pub struct TargetLeaf<'a> {
    pub key: Key,
    pub data: CentroidData,
    pub particles: &'a mut [Particle],
}

pub trait Visitor {
    /// Admissibility: descend into `source`'s children for this target?
    fn node(&mut self, source: &SourceNode, target: &mut TargetLeaf<'_>) -> bool;

    /// Interact a source bucket with the target bucket.
    fn leaf(&mut self, source: &SourceNode, target: &mut TargetLeaf<'_>);
}

/// Which downward traversal to run, with its parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VisitorSpec {
    Gravity { theta: Real },
    Density { radius: Real },
    Pressure { radius: Real },
    Count,
}

/// Seeding of the per-leaf traversal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraversalMode {
    /// Every leaf starts at the global root.
    TopDown,
    /// Every leaf starts at itself and widens by ascending.
    UpAndDown,
}

impl VisitorSpec {
    pub fn mode(&self) -> TraversalMode {
        match self {
            VisitorSpec::Gravity { .. } | VisitorSpec::Count => TraversalMode::TopDown,
            VisitorSpec::Density { .. } | VisitorSpec::Pressure { .. } => TraversalMode::UpAndDown,
        }
    }
}
