//! Reader pool: holds the raw particle slice of one branch, assigns
//! Morton keys, histograms candidate splitter ranges and flushes
//! particles to their owning tree pieces.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::types::domain::BoundingBox;
use crate::types::morton::{binary_search_ge, encode_point, remove_leading_zeros, Key};
use crate::types::point::Particle;
use crate::types::splitter::{owner_of, Splitter};

#[derive(Debug, Default)]
pub struct Reader {
    particles: Vec<Particle>,
}

impl Reader {
    /// Inbound path, used both for the initial load and when tree
    /// pieces return particles for a rebuild.
    pub fn receive(&mut self, mut particles: Vec<Particle>) {
        self.particles.append(&mut particles);
    }

    pub fn n_particles(&self) -> usize {
        self.particles.len()
    }

    /// Local contribution to the universe bounding-box reduction.
    pub fn local_bounding_box(&self) -> BoundingBox {
        BoundingBox::from_particles(&self.particles)
    }

    /// Assign each particle the Morton key of its deepest-level cell
    /// inside the universe, then sort the local slice by key.
    pub fn assign_keys(&mut self, universe: &BoundingBox) {
        let origin = universe.origin();
        let diameter = universe.diameter();
        self.particles
            .par_iter_mut()
            .for_each(|p| p.key = encode_point(&p.position, &origin, &diameter));
        self.particles.par_sort_unstable();
    }

    /// Count locally-held particles in each `[from, to)` candidate
    /// range. Range bounds arrive in truncated path form and are
    /// normalized here for comparison against particle keys; the open
    /// top bound `!0` is treated as inclusive-infinite.
    pub fn count_oct(&self, ranges: &[(Key, Key)]) -> Vec<usize> {
        let n = self.particles.len();
        ranges
            .iter()
            .map(|&(from, to)| {
                let lo = binary_search_ge(remove_leading_zeros(from), &self.particles, 0, n);
                let hi = if to == !0 {
                    n
                } else {
                    binary_search_ge(remove_leading_zeros(to), &self.particles, 0, n)
                };
                hi.saturating_sub(lo)
            })
            .collect()
    }

    /// Hand every particle to its owning tree piece, determined by
    /// binary search over the splitters. Empties the reader.
    pub fn flush(&mut self, splitters: &[Splitter]) -> HashMap<usize, Vec<Particle>> {
        let mut batches: HashMap<usize, Vec<Particle>> = HashMap::new();
        for p in self.particles.drain(..) {
            batches.entry(owner_of(splitters, p.key)).or_default().push(p);
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::vector::Vec3;

    use rand::prelude::*;
    use rand::SeedableRng;

    fn reader_fixture(npoints: usize) -> (Reader, BoundingBox) {
        let mut range = StdRng::seed_from_u64(0);
        let between = rand::distributions::Uniform::from(0.0..1.0);

        let mut reader = Reader::default();
        let particles: Vec<Particle> = (0..npoints)
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
            .collect();
        reader.receive(particles);

        let universe = reader.local_bounding_box();
        (reader, universe)
    }

    #[test]
    fn test_assign_keys_sorts_locally() {
        let (mut reader, universe) = reader_fixture(500);
        reader.assign_keys(&universe);

        assert!(reader.particles.windows(2).all(|w| w[0].key <= w[1].key));
        assert!(reader.particles.iter().all(|p| p.key >= 1 << 63));
    }

    #[test]
    fn test_count_oct_partitions_the_universe() {
        let (mut reader, universe) = reader_fixture(500);
        reader.assign_keys(&universe);

        // The eight root octants cover every particle.
        let ranges: Vec<(Key, Key)> = (0..8)
            .map(|c| (0o10 + c, if c == 7 { !0 } else { 0o10 + c + 1 }))
            .collect();
        let counts = reader.count_oct(&ranges);
        assert_eq!(counts.iter().sum::<usize>(), 500);

        // And the full range counts everything at once.
        assert_eq!(reader.count_oct(&[(1, !0)]), vec![500]);
    }

    #[test]
    fn test_flush_respects_splitter_ownership() {
        let (mut reader, universe) = reader_fixture(200);
        reader.assign_keys(&universe);

        let mut splitters: Vec<Splitter> = (0..8)
            .map(|c| {
                let from = 0o10 + c;
                let to = if c == 7 { !0 } else { 0o10 + c + 1 };
                Splitter::new(from, to, 0)
            })
            .collect();
        splitters.sort();

        let batches = reader.flush(&splitters);
        assert_eq!(reader.n_particles(), 0);

        let mut total = 0;
        for (&tp, batch) in &batches {
            for p in batch {
                assert!(splitters[tp].contains(p.key));
            }
            total += batch.len();
        }
        assert_eq!(total, 200);
    }
}
