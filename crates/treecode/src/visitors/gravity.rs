//! Barnes-Hut gravity visitor.

use crate::constants::GRAV_CONST;
use crate::types::morton::is_prefix;
use crate::types::point::{Particle, Real};
use crate::types::vector::Vec3;
use crate::visitors::{SourceNode, TargetLeaf, Visitor};

/// Opening-angle admissibility: a source cell is admitted as a single
/// monopole when its extent over the distance to the target stays
/// below `theta`; otherwise the traversal descends.
pub struct GravityVisitor {
    pub theta: Real,
}

fn accumulate_newton(p: &mut Particle, at: &Vec3, mass: Real) {
    let dr = *at - p.position;
    let rsq = dr.length_squared();
    if rsq > 0.0 {
        p.force += dr * (GRAV_CONST * mass * p.mass / (rsq * rsq.sqrt()));
    }
}

impl Visitor for GravityVisitor {
    fn node(&mut self, source: &SourceNode, target: &mut TargetLeaf<'_>) -> bool {
        if source.data.count == 0 {
            return false;
        }
        // A cell containing the target leaf must always open, or the
        // monopole would include the target's own mass.
        if is_prefix(source.key, target.key) {
            return true;
        }

        let size = source.data.bounds.longest_side();
        let centroid = source.data.centroid();
        let dsq = target.data.bounds.distance_squared_to(&centroid);
        if dsq == 0.0 || size * size > self.theta * self.theta * dsq {
            return true;
        }

        for p in target.particles.iter_mut() {
            accumulate_newton(p, &centroid, source.data.total_mass);
        }
        false
    }

    fn leaf(&mut self, source: &SourceNode, target: &mut TargetLeaf<'_>) {
        for p in target.particles.iter_mut() {
            for s in &source.particles {
                if s.id == p.id {
                    continue;
                }
                accumulate_newton(p, &s.position, s.mass);
            }
        }
    }
}
