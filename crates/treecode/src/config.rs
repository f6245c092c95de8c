//! Run configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{TreecodeError, TreecodeResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecompType {
    Oct,
    Sfc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TreeType {
    Oct,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Particle file; a synthetic cloud is generated when absent.
    pub input_file: Option<PathBuf>,
    /// Reader pool size; also the number of worker branches.
    pub n_readers: usize,
    /// Imbalance slack of the decomposition, at least 1.
    pub decomp_tolerance: f64,
    /// Target particle count per tree piece.
    pub max_particles_per_tp: usize,
    /// Bucket size for the local tree build.
    pub max_particles_per_leaf: usize,
    pub decomp_type: DecompType,
    pub tree_type: TreeType,
    pub num_iterations: usize,
    /// Full redecomposition every this many iterations.
    pub flush_period: usize,
    /// Load-balancing periodicity; acted on only as a log line.
    pub lb_period: usize,
    /// Upper bound on the number of partitions.
    pub num_total_treepieces: usize,
    /// Depth of the starter pack broadcast into every cache; -1 shares
    /// every aggregated cell.
    pub num_share_levels: i32,
    /// Synthetic cloud size when no input file is given.
    pub n_particles: usize,
    pub seed: u64,
    pub dt: f64,
    /// Barnes-Hut opening angle.
    pub theta: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input_file: None,
            n_readers: 4,
            decomp_tolerance: 1.2,
            max_particles_per_tp: 500,
            max_particles_per_leaf: 12,
            decomp_type: DecompType::Oct,
            tree_type: TreeType::Oct,
            num_iterations: 3,
            flush_period: 5,
            lb_period: 5,
            num_total_treepieces: 4096,
            num_share_levels: 3,
            n_particles: 1000,
            seed: 0,
            dt: 0.1,
            theta: 0.5,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> TreecodeResult<Config> {
        let file = File::open(path)?;
        let config: Config = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    pub fn validate(&self) -> TreecodeResult<()> {
        if self.n_readers == 0 {
            return Err(TreecodeError::Config("n_readers must be positive".into()));
        }
        if self.decomp_tolerance < 1.0 {
            return Err(TreecodeError::Config(
                "decomp_tolerance must be at least 1".into(),
            ));
        }
        if self.max_particles_per_tp == 0 || self.max_particles_per_leaf == 0 {
            return Err(TreecodeError::Config(
                "particle bounds must be positive".into(),
            ));
        }
        if self.flush_period == 0 {
            return Err(TreecodeError::Config("flush_period must be positive".into()));
        }
        if self.num_total_treepieces == 0 {
            return Err(TreecodeError::Config(
                "num_total_treepieces must be positive".into(),
            ));
        }
        if self.decomp_type == DecompType::Sfc {
            return Err(TreecodeError::Config(
                "SFC decomposition is not implemented; use OCT".into(),
            ));
        }
        Ok(())
    }
}
