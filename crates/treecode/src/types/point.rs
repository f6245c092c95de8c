//! Data structures and methods for particles in 3D.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::types::morton::Key;
use crate::types::vector::Vec3;

pub type PointType = f64;
pub type Real = f64;

/// A point mass, described by its phase-space coordinates, the Morton
/// key of the deepest octree cell it lies in, and per-iteration scratch
/// fields filled by traversals. The ordering of particles is determined
/// by their Morton key.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Particle {
    /// Stable identity across redistributions.
    #[serde(default)]
    pub id: usize,
    pub position: Vec3,
    #[serde(default)]
    pub velocity: Vec3,
    pub mass: Real,
    /// Scratch: SPH density accumulated by the density traversal.
    #[serde(default)]
    pub density: Real,
    /// Scratch: force accumulated by the gravity and pressure traversals.
    #[serde(default)]
    pub force: Vec3,
    #[serde(default)]
    pub key: Key,
}

/// Vector of particles.
pub type Particles = Vec<Particle>;

impl Particle {
    /// Apply the accumulated force over one timestep and clear it.
    pub fn perturb(&mut self, dt: Real) {
        if self.mass > 0.0 {
            self.velocity += self.force * (dt / self.mass);
        }
        self.position += self.velocity * dt;
        self.force = Vec3::ZERO;
    }
}

impl PartialEq for Particle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Particle {}

impl Ord for Particle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for Particle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Particle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}
