//! Particle i/o and synthetic input clouds.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use rand::prelude::*;
use rand::SeedableRng;

use crate::error::TreecodeResult;
use crate::types::point::{Particle, Particles};
use crate::types::vector::Vec3;

/// Read a JSON particle file. Records need only position and mass;
/// identities are reassigned so they are unique and stable for the
/// whole run.
pub fn read_particles<P: AsRef<Path>>(path: P) -> TreecodeResult<Particles> {
    let file = File::open(path)?;
    let mut particles: Particles = serde_json::from_reader(BufReader::new(file))?;
    for (id, p) in particles.iter_mut().enumerate() {
        p.id = id;
    }
    Ok(particles)
}

pub fn write_particles<P: AsRef<Path>>(path: P, particles: &[Particle]) -> TreecodeResult<()> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), particles)?;
    Ok(())
}

/// Uniform random cloud of unit-mass particles in the unit cube.
pub fn random_cloud(npoints: usize, seed: u64) -> Particles {
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
