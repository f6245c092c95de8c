//! Crate wide constants.

use crate::types::morton::{Key, KeyType};

/// Key of the synthetic root spanning all partitions.
pub const ROOT_KEY: Key = 1;

/// Octree branching.
pub const BRANCH_FACTOR: usize = 8;
pub const LOG_BRANCH_FACTOR: u32 = 3;

/// Deepest refinement level a 64-bit path key can hold: one marker bit
/// plus 21 octal digits.
pub const MAX_DEPTH: u32 = 21;

/// Number of cells per axis on the deepest level.
pub const LEVEL_SIZE: KeyType = 1 << MAX_DEPTH;

/// Slack applied to `max_particles_per_leaf` before a bucket is split.
pub const BUCKET_TOLERANCE: f64 = 1.2;

/// Gravitational constant in simulation units.
pub const GRAV_CONST: f64 = 1.0;
