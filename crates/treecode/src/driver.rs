//! The driver: computes universe bounds, runs the histogram splitter
//! search, creates tree pieces and sequences the per-iteration phases,
//! with quiescence as the barrier between them.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::cache::CacheStats;
use crate::config::Config;
use crate::constants::MAX_DEPTH;
use crate::error::{TreecodeError, TreecodeResult};
use crate::node::CentroidData;
use crate::runtime::{Msg, Reply, Runtime};
use crate::types::domain::BoundingBox;
use crate::types::morton::{depth, Key};
use crate::types::point::{Particle, Real};
use crate::types::splitter::Splitter;
use crate::visitors::VisitorSpec;

pub struct Driver {
    config: Config,
    runtime: Runtime,
    universe: BoundingBox,
    splitters: Arc<Vec<Splitter>>,
    n_treepieces: usize,
    /// Completed tree-element aggregates, the source of the starter
    /// pack.
    storage: Vec<(Key, CentroidData)>,
    tree_ready: bool,
}

impl Driver {
    pub fn new(config: Config) -> TreecodeResult<Driver> {
        config.validate()?;
        let runtime = Runtime::spawn(config.n_readers, Arc::new(config.clone()));
        Ok(Driver {
            config,
            runtime,
            universe: BoundingBox::default(),
            splitters: Arc::new(Vec::new()),
            n_treepieces: 0,
            storage: Vec::new(),
            tree_ready: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn universe(&self) -> &BoundingBox {
        &self.universe
    }

    pub fn splitters(&self) -> &[Splitter] {
        &self.splitters
    }

    pub fn n_treepieces(&self) -> usize {
        self.n_treepieces
    }

    /// Broadcast one phase message and wait for quiescence.
    fn phase(&self, msg: Msg) -> TreecodeResult<()> {
        self.runtime.broadcast(msg);
        self.runtime.wait_quiescence()
    }

    /// Scatter particles over the readers and run the first
    /// decomposition.
    pub fn load(&mut self, particles: Vec<Particle>) -> TreecodeResult<()> {
        let n_branches = self.config.n_readers;
        let mut slices: Vec<Vec<Particle>> = vec![Vec::new(); n_branches];
        for (i, p) in particles.into_iter().enumerate() {
            slices[i % n_branches].push(p);
        }
        for (branch, slice) in slices.into_iter().enumerate() {
            self.runtime.comm().send(branch, Msg::ReaderReceive(slice));
        }
        self.runtime.wait_quiescence()?;
        self.make_new_tree()
    }

    /// Recompute bounds, assign keys, find splitters and deal the
    /// particles out to their tree pieces.
    fn make_new_tree(&mut self) -> TreecodeResult<()> {
        let start = Instant::now();

        self.universe = self.reduce_bounds()?;
        if self.universe.n_particles == 0 {
            return Err(TreecodeError::Config("no particles loaded".into()));
        }
        debug!(
            "universe: {} particles, mass {}; {:?} decomposition over an {:?} tree",
            self.universe.n_particles,
            self.universe.total_mass,
            self.config.decomp_type,
            self.config.tree_type
        );

        self.phase(Msg::AssignKeys(self.universe))?;

        let splitters = self.find_oct_splitters()?;
        self.n_treepieces = splitters.len();
        if self.n_treepieces > self.config.num_total_treepieces {
            return Err(TreecodeError::CapacityOverflow {
                n_treepieces: self.n_treepieces,
                limit: self.config.num_total_treepieces,
            });
        }
        self.splitters = Arc::new(splitters);

        self.phase(Msg::SetSplitters(self.splitters.clone()))?;
        self.phase(Msg::CreateTreePieces {
            n_treepieces: self.n_treepieces,
        })?;
        self.phase(Msg::FlushParticles)?;
        self.phase(Msg::CheckDelivery)?;

        self.tree_ready = false;
        info!(
            "decomposed {} particles into {} tree pieces in {:.1?}",
            self.universe.n_particles,
            self.n_treepieces,
            start.elapsed()
        );
        Ok(())
    }

    fn reduce_bounds(&mut self) -> TreecodeResult<BoundingBox> {
        self.phase(Msg::ComputeBounds)?;
        let mut universe = BoundingBox::default();
        for reply in self.runtime.drain_replies() {
            if let Reply::Bounds(bounds) = reply {
                universe = universe.reduce(&bounds);
            }
        }
        Ok(universe)
    }

    /// Histogram splitter search: refine candidate key ranges against
    /// reader-side counts until every range holds at most
    /// `decomp_tolerance * max_particles_per_tp` particles. A range at
    /// the particle-key depth becomes a splitter regardless of count,
    /// so degenerate clusters cannot loop the search forever.
    fn find_oct_splitters(&mut self) -> TreecodeResult<Vec<Splitter>> {
        let threshold = self.config.decomp_tolerance * self.config.max_particles_per_tp as f64;
        let mut candidates: Vec<(Key, Key)> = vec![(1, !0)];
        let mut splitters: Vec<Splitter> = Vec::new();
        let mut decomp_particle_sum = 0usize;
        let mut round = 0;

        while !candidates.is_empty() {
            self.phase(Msg::CountOct(Arc::new(candidates.clone())))?;
            let mut counts = vec![0usize; candidates.len()];
            for reply in self.runtime.drain_replies() {
                if let Reply::Counts(local) = reply {
                    for (total, n) in counts.iter_mut().zip(local) {
                        *total += n;
                    }
                }
            }

            let mut refined: Vec<(Key, Key)> = Vec::new();
            for (&(from, to), &n_particles) in candidates.iter().zip(&counts) {
                if n_particles as f64 > threshold && depth(from) < MAX_DEPTH {
                    // One level deeper: eight child ranges, keeping the
                    // open end of the top range.
                    for octant in 0..8 {
                        let child_from = (from << 3) + octant;
                        let child_to = if octant < 7 {
                            (from << 3) + octant + 1
                        } else if to == !0 {
                            !0
                        } else {
                            to << 3
                        };
                        refined.push((child_from, child_to));
                    }
                } else {
                    splitters.push(Splitter::new(from, to, n_particles));
                    decomp_particle_sum += n_particles;
                }
            }

            debug!(
                "decomposition round {}: {} candidates, {} splitters so far",
                round,
                candidates.len(),
                splitters.len()
            );
            candidates = refined;
            round += 1;
        }

        if decomp_particle_sum != self.universe.n_particles {
            return Err(TreecodeError::DecompositionMismatch {
                decomposed: decomp_particle_sum,
                expected: self.universe.n_particles,
            });
        }

        splitters.sort();
        Ok(splitters)
    }

    /// Build local trees, run the upward pass and broadcast the
    /// starter pack. Idempotent until the next perturbation or
    /// rebuild.
    fn prepare_tree(&mut self) -> TreecodeResult<()> {
        if self.tree_ready {
            return Ok(());
        }
        let start = Instant::now();

        self.phase(Msg::BuildTrees)?;

        self.storage.clear();
        self.phase(Msg::UpwardPass)?;
        for reply in self.runtime.drain_replies() {
            if let Reply::TeStorage(key, data) = reply {
                self.storage.push((key, data));
            }
        }

        self.load_cache()?;
        self.tree_ready = true;
        debug!("tree build and upward pass in {:.1?}", start.elapsed());
        Ok(())
    }

    /// Broadcast the top `num_share_levels` of the aggregated global
    /// tree into every cache.
    fn load_cache(&mut self) -> TreecodeResult<()> {
        self.storage.sort_by_key(|&(key, _)| key);
        let send_size = if self.config.num_share_levels >= 0 {
            let bound: Key = 1 << (3 * self.config.num_share_levels as u32);
            self.storage.partition_point(|&(key, _)| key < bound)
        } else {
            self.storage.len()
        };
        debug!(
            "broadcasting top {} levels to caches ({} of {} cells)",
            self.config.num_share_levels,
            send_size,
            self.storage.len()
        );
        let pack = Arc::new(self.storage[..send_size].to_vec());
        self.phase(Msg::RecvStarterPack(pack))
    }

    /// Run one downward traversal to completion. Suspended traversals
    /// resume as node replies land; quiescence means every piece
    /// either finished or stalled, and a stall is fatal.
    fn traverse(&mut self, spec: VisitorSpec) -> TreecodeResult<()> {
        self.prepare_tree()?;
        self.phase(Msg::StartTraversal(spec))?;

        let done = self
            .runtime
            .drain_replies()
            .iter()
            .filter(|reply| matches!(reply, Reply::TraversalDone { .. }))
            .count();
        if done != self.n_treepieces {
            return Err(TreecodeError::invariant(
                -1,
                format!(
                    "{} of {} piece traversals completed",
                    done, self.n_treepieces
                ),
            ));
        }
        Ok(())
    }

    /// Barnes-Hut gravity with the configured opening angle.
    pub fn step_gravity(&mut self) -> TreecodeResult<()> {
        self.traverse(VisitorSpec::Gravity {
            theta: self.config.theta,
        })
    }

    /// SPH density estimate over the given smoothing radius.
    pub fn step_density(&mut self, radius: Real) -> TreecodeResult<()> {
        self.traverse(VisitorSpec::Density { radius })
    }

    /// SPH pressure forces; run a density step first.
    pub fn step_pressure(&mut self, radius: Real) -> TreecodeResult<()> {
        self.traverse(VisitorSpec::Pressure { radius })
    }

    /// Histogram of all ordered pair distances over `[min, max)`.
    pub fn pair_count(
        &mut self,
        n_bins: usize,
        min: Real,
        max: Real,
    ) -> TreecodeResult<Vec<u64>> {
        self.phase(Msg::ConfigureBins { n_bins, min, max })?;
        self.traverse(VisitorSpec::Count)?;
        self.phase(Msg::CollectBins)?;

        let mut bins = vec![0u64; n_bins];
        for reply in self.runtime.drain_replies() {
            if let Reply::Bins(local) = reply {
                for (total, n) in bins.iter_mut().zip(local) {
                    *total += n;
                }
            }
        }
        Ok(bins)
    }

    /// Apply accumulated forces, drop the iteration's caches, and
    /// optionally send everything back through a full redecomposition.
    pub fn advance(&mut self, dt: Real, rebuild: bool) -> TreecodeResult<()> {
        self.phase(Msg::Perturb { dt, rebuild })?;
        self.phase(Msg::DestroyCaches { keep_starter: true })?;
        self.storage.clear();
        self.tree_ready = false;
        if rebuild {
            self.make_new_tree()?;
        }
        Ok(())
    }

    /// The configured iteration loop: gravity, perturbation, periodic
    /// rebuild.
    pub fn run(&mut self) -> TreecodeResult<()> {
        for it in 0..self.config.num_iterations {
            let start = Instant::now();
            self.step_gravity()?;

            let rebuild = (it + 1) % self.config.flush_period == 0;
            if self.config.lb_period > 0 && (it + 1) % self.config.lb_period == 0 {
                debug!("load balancing window at iteration {}", it);
            }
            self.advance(self.config.dt, rebuild)?;

            let (cache, resumptions) = self.cache_stats()?;
            info!(
                "[iteration {}] {:.1?}: {} fetches, {} coalesced waits, {} nodes and {} particles cached, {} resumptions",
                it,
                start.elapsed(),
                cache.requests_issued,
                cache.coalesced_waits,
                cache.nodes_installed,
                cache.particles_installed,
                resumptions
            );
        }
        Ok(())
    }

    /// Gather every particle back from the tree pieces, ordered by id.
    pub fn particles(&mut self) -> TreecodeResult<Vec<Particle>> {
        self.phase(Msg::CollectParticles)?;
        let mut all = Vec::new();
        for reply in self.runtime.drain_replies() {
            if let Reply::Particles(mut batch) = reply {
                all.append(&mut batch);
            }
        }
        all.sort_by_key(|p| p.id);
        Ok(all)
    }

    /// Cache and resumer counters accumulated since the last call.
    pub fn cache_stats(&mut self) -> TreecodeResult<(CacheStats, u64)> {
        self.phase(Msg::CollectCacheStats)?;
        let mut cache = CacheStats::default();
        let mut resumptions = 0;
        for reply in self.runtime.drain_replies() {
            if let Reply::Stats {
                cache: local,
                resumptions: r,
            } = reply
            {
                cache.merge(&local);
                resumptions += r;
            }
        }
        Ok((cache, resumptions))
    }
}
