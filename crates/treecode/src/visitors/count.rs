//! Pair-count visitor: histogram of inter-particle distances.

use crate::count::{BinClass, CountManager};
use crate::node::CentroidData;
use crate::types::point::Real;
use crate::visitors::{SourceNode, TargetLeaf, Visitor};

/// Histograms every ordered particle pair exactly once. Whole cell
/// pairs are counted in bulk when every distance the pair of cells can
/// realize falls into a single bin, which makes the totals independent
/// of how the tree is partitioned.
pub struct CountVisitor<'a> {
    pub manager: &'a mut CountManager,
}

fn pair_distance_bounds(from: &CentroidData, on: &CentroidData) -> (Real, Real) {
    let d = (from.bounds.center() - on.bounds.center()).length();
    let r1 = from.bounds.radius();
    let r2 = on.bounds.radius();
    (d - r1 - r2, d + r1 + r2)
}

impl Visitor for CountVisitor<'_> {
    fn node(&mut self, source: &SourceNode, target: &mut TargetLeaf<'_>) -> bool {
        if source.data.count == 0 || target.data.count == 0 {
            return false;
        }
        let (lo, hi) = pair_distance_bounds(&source.data, &target.data);
        match self.manager.find_bin(lo, hi) {
            BinClass::One(bin) => {
                self.manager
                    .add(bin, (source.data.count * target.data.count) as u64);
                false
            }
            BinClass::Straddle => true,
            BinClass::Outside => false,
        }
    }

    fn leaf(&mut self, source: &SourceNode, target: &mut TargetLeaf<'_>) {
        let (lo, hi) = pair_distance_bounds(&source.data, &target.data);
        match self.manager.find_bin(lo, hi) {
            BinClass::One(bin) => {
                self.manager
                    .add(bin, (source.particles.len() * target.particles.len()) as u64);
            }
            _ => {
                for s in &source.particles {
                    for p in target.particles.iter() {
                        self.manager.count((s.position - p.position).length());
                    }
                }
            }
        }
    }
}
