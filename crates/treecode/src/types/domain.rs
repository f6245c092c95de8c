//! Axis-aligned boxes and the reducible universe bounding box.

use serde::{Deserialize, Serialize};

use crate::types::point::{Particle, Real};
use crate::types::vector::Vec3;

/// Axis-aligned box. The empty box is the identity of [`Box3::union`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Box3 {
    pub lesser_corner: Vec3,
    pub greater_corner: Vec3,
}

impl Default for Box3 {
    fn default() -> Self {
        Box3::empty()
    }
}

impl Box3 {
    pub fn empty() -> Self {
        Box3 {
            lesser_corner: Vec3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            greater_corner: Vec3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lesser_corner.x > self.greater_corner.x
    }

    /// Grow the box to contain a point.
    pub fn grow(&mut self, point: &Vec3) {
        self.lesser_corner = self.lesser_corner.min(point);
        self.greater_corner = self.greater_corner.max(point);
    }

    pub fn union(&self, other: &Box3) -> Box3 {
        Box3 {
            lesser_corner: self.lesser_corner.min(&other.lesser_corner),
            greater_corner: self.greater_corner.max(&other.greater_corner),
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.lesser_corner + self.greater_corner) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            self.greater_corner - self.lesser_corner
        }
    }

    /// Longest edge of the box.
    pub fn longest_side(&self) -> Real {
        let s = self.size();
        s.x.max(s.y).max(s.z)
    }

    /// Half the diagonal; bounds the distance from the center to any
    /// contained point.
    pub fn radius(&self) -> Real {
        self.size().length() * 0.5
    }

    /// Squared distance from a point to the nearest point of the box;
    /// zero if the point is inside.
    pub fn distance_squared_to(&self, point: &Vec3) -> Real {
        let mut dsq = 0.0;
        for (lo, hi, p) in [
            (self.lesser_corner.x, self.greater_corner.x, point.x),
            (self.lesser_corner.y, self.greater_corner.y, point.y),
            (self.lesser_corner.z, self.greater_corner.z, point.z),
        ] {
            let delta = if p < lo {
                lo - p
            } else if p > hi {
                p - hi
            } else {
                0.0
            };
            dsq += delta * delta;
        }
        dsq
    }

    /// Squared distance between the nearest points of two boxes; zero if
    /// they intersect.
    pub fn distance_squared_to_box(&self, other: &Box3) -> Real {
        let mut dsq = 0.0;
        for (alo, ahi, blo, bhi) in [
            (
                self.lesser_corner.x,
                self.greater_corner.x,
                other.lesser_corner.x,
                other.greater_corner.x,
            ),
            (
                self.lesser_corner.y,
                self.greater_corner.y,
                other.lesser_corner.y,
                other.greater_corner.y,
            ),
            (
                self.lesser_corner.z,
                self.greater_corner.z,
                other.lesser_corner.z,
                other.greater_corner.z,
            ),
        ] {
            let delta = if ahi < blo {
                blo - ahi
            } else if bhi < alo {
                alo - bhi
            } else {
                0.0
            };
            dsq += delta * delta;
        }
        dsq
    }
}

/// Universe bounds plus particle count and mass. Reducible: the union
/// of two bounding boxes covers both and sums their tallies.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub bounds: Box3,
    pub n_particles: usize,
    pub total_mass: Real,
}

impl BoundingBox {
    pub fn from_particles(particles: &[Particle]) -> Self {
        let mut bb = BoundingBox::default();
        for p in particles {
            bb.bounds.grow(&p.position);
            bb.n_particles += 1;
            bb.total_mass += p.mass;
        }
        bb
    }

    /// Associative commutative combiner used by the reader reduction.
    pub fn reduce(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            bounds: self.bounds.union(&other.bounds),
            n_particles: self.n_particles + other.n_particles,
            total_mass: self.total_mass + other.total_mass,
        }
    }

    pub fn origin(&self) -> Vec3 {
        self.bounds.lesser_corner
    }

    pub fn diameter(&self) -> Vec3 {
        self.bounds.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_and_empty() {
        let mut a = Box3::empty();
        assert!(a.is_empty());

        a.grow(&Vec3::new(0.0, 0.0, 0.0));
        a.grow(&Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(a.size(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(a.longest_side(), 3.0);

        let b = Box3 {
            lesser_corner: Vec3::new(-1.0, 0.0, 0.0),
            greater_corner: Vec3::new(0.5, 0.5, 0.5),
        };
        let u = a.union(&b);
        assert_eq!(u.lesser_corner, Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(u.greater_corner, Vec3::new(1.0, 2.0, 3.0));

        // Empty is the identity.
        assert_eq!(a.union(&Box3::empty()), a);
    }

    #[test]
    fn test_distances() {
        let a = Box3 {
            lesser_corner: Vec3::ZERO,
            greater_corner: Vec3::new(1.0, 1.0, 1.0),
        };

        assert_eq!(a.distance_squared_to(&Vec3::new(0.5, 0.5, 0.5)), 0.0);
        assert_eq!(a.distance_squared_to(&Vec3::new(2.0, 0.5, 0.5)), 1.0);

        let b = Box3 {
            lesser_corner: Vec3::new(3.0, 0.0, 0.0),
            greater_corner: Vec3::new(4.0, 1.0, 1.0),
        };
        assert_eq!(a.distance_squared_to_box(&b), 4.0);
        assert_eq!(a.distance_squared_to_box(&a), 0.0);
    }

    #[test]
    fn test_reduce_sums_tallies() {
        let p = |x: f64, m: f64| Particle {
            position: Vec3::new(x, 0.0, 0.0),
            mass: m,
            ..Particle::default()
        };

        let a = BoundingBox::from_particles(&[p(0.0, 1.0), p(1.0, 2.0)]);
        let b = BoundingBox::from_particles(&[p(-2.0, 3.0)]);
        let r = a.reduce(&b);

        assert_eq!(r.n_particles, 3);
        assert_eq!(r.total_mass, 6.0);
        assert_eq!(r.bounds.lesser_corner.x, -2.0);
        assert_eq!(r.bounds.greater_corner.x, 1.0);
    }
}
