//! Upward centroid visitor: the reduction run by the upward pass.

use crate::node::CentroidData;
use crate::types::point::Particle;

/// Mass-weighted position aggregation. Leaves seed the reduction from
/// their bucket; interior nodes fold completed children into their
/// parent, and a node whose parent is a boundary cell publishes the
/// partial aggregate to the keyed tree element instead.
pub struct CentroidVisitor;

impl CentroidVisitor {
    /// Seed a leaf's payload from its particle bucket.
    pub fn leaf(particles: &[Particle]) -> CentroidData {
        CentroidData::from_particles(particles)
    }

    /// Fold a completed child into its parent; returns true so the
    /// ascent continues (the centroid reduction never stops early).
    pub fn node(parent: &mut CentroidData, child: &CentroidData) -> bool {
        *parent += *child;
        true
    }
}
