//! SPH density visitor.

use crate::types::point::Real;
use crate::visitors::sph::SplineKernel;
use crate::visitors::{SourceNode, TargetLeaf, Visitor};

/// Gathers kernel-weighted mass from every source bucket within the
/// smoothing radius of the target bucket. Admissibility is sphere-box
/// overlap: descend while the source box comes within `radius` of the
/// target box.
pub struct DensityVisitor {
    pub radius: Real,
    pub kernel: SplineKernel,
}

impl DensityVisitor {
    pub fn new(radius: Real) -> Self {
        DensityVisitor {
            radius,
            kernel: SplineKernel,
        }
    }
}

impl Visitor for DensityVisitor {
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
            let mut density = 0.0;
            for s in &source.particles {
                let diff = s.position - p.position;
                if diff.length_squared() <= rsq {
                    density += s.mass * self.kernel.evaluate(diff.length(), self.radius);
                }
            }
            p.density += density;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{CentroidData, NodeType};
    use crate::types::point::Particle;
    use crate::types::vector::Vec3;

    #[test]
    fn test_self_contribution_is_included() {
        let particles = vec![Particle {
            id: 0,
            position: Vec3::ZERO,
            mass: 2.0,
            ..Particle::default()
        }];
        let source = SourceNode {
            key: 0o10,
            node_type: NodeType::Leaf,
            data: CentroidData::from_particles(&particles),
            particles: particles.clone(),
        };

        let mut target_particles = particles;
        let data = source.data;
        let mut target = TargetLeaf {
            key: 0o10,
            data,
            particles: &mut target_particles,
        };

        let mut v = DensityVisitor::new(10.0);
        v.leaf(&source, &mut target);

        let expected = 2.0 * SplineKernel.evaluate(0.0, 10.0);
        assert!((target.particles[0].density - expected).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range_bucket_is_pruned() {
        let near = vec![Particle {
            position: Vec3::ZERO,
            mass: 1.0,
            ..Particle::default()
        }];
        let far = vec![Particle {
            position: Vec3::new(50.0, 0.0, 0.0),
            mass: 1.0,
            ..Particle::default()
        }];

        let source = SourceNode {
            key: 0o17,
            node_type: NodeType::Leaf,
            data: CentroidData::from_particles(&far),
            particles: far,
        };
        let mut target_particles = near.clone();
        let mut target = TargetLeaf {
            key: 0o10,
            data: CentroidData::from_particles(&near),
            particles: &mut target_particles,
        };

        let mut v = DensityVisitor::new(1.0);
        assert!(!v.node(&source, &mut target));

        v.leaf(&source, &mut target);
        assert_eq!(target.particles[0].density, 0.0);
    }
}
