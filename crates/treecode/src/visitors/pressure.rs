//! SPH pressure-gradient visitor.

use crate::types::point::Real;
use crate::visitors::sph::SplineKernel;
use crate::visitors::{SourceNode, TargetLeaf, Visitor};

/// Accumulates the symmetrized pressure force on each target particle
/// from neighbours within the smoothing radius. Requires densities from
/// a prior density traversal.
pub struct PressureVisitor {
    pub radius: Real,
    pub kernel: SplineKernel,
    /// Equation-of-state reference density of the simulated substance.
    pub rest_density: Real,
    /// Equation-of-state stiffness, temperature dependent.
    pub gas_constant: Real,
}

impl PressureVisitor {
    pub fn new(radius: Real) -> Self {
        PressureVisitor {
            radius,
            kernel: SplineKernel,
            rest_density: 1000.0,
            gas_constant: 2000.0,
        }
    }
}

impl Visitor for PressureVisitor {
    fn node(&mut self, source: &SourceNode, target: &mut TargetLeaf<'_>) -> bool {
        source.data.count > 0
            && source
                .data
                .bounds
                .distance_squared_to_box(&target.data.bounds)
                <= self.radius * self.radius
    }

    fn leaf(&mut self, source: &SourceNode, target: &mut TargetLeaf<'_>) {
        let rsq = self.radius * self.radius;
        for p in target.particles.iter_mut() {
            let pi = self.gas_constant * (p.density - self.rest_density);
            for s in &source.particles {
                if s.id == p.id || s.density <= 0.0 {
                    continue;
                }
                let diff = p.position - s.position;
                let dsq = diff.length_squared();
                if dsq == 0.0 || dsq >= rsq {
                    continue;
                }
                let r = dsq.sqrt();
                let pj = self.gas_constant * (s.density - self.rest_density);
                let gradient = self.kernel.gradient(r, self.radius);
                // dW/dr is negative; the force points down the pressure
                // gradient, away from an over-dense neighbour.
                let magnitude = -s.mass * (pi + pj) / (2.0 * s.density) * gradient;
                p.force += diff * (magnitude / r);
            }
        }
    }
}
