//! Splitters: the key-range partition produced by the decomposition.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::morton::{is_prefix, remove_leading_zeros, Key};

/// One partition of the particle key space.
///
/// `from` and `to` are full-width particle-key bounds, `[from, to)`,
/// with the top range closed by `!0`. `tp_key` is the truncated path
/// key of the octree cell the range covers; it is a prefix of every
/// particle key assigned to the partition.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Splitter {
    pub from: Key,
    pub to: Key,
    pub tp_key: Key,
    pub n_particles: usize,
}

impl Splitter {
    pub fn new(range_from: Key, range_to: Key, n_particles: usize) -> Self {
        Splitter {
            from: remove_leading_zeros(range_from),
            to: if range_to == !0 {
                !0
            } else {
                remove_leading_zeros(range_to)
            },
            tp_key: range_from,
            n_particles,
        }
    }

    /// Whether a full-width particle key falls inside this partition.
    /// The top range is closed so the particle at the far domain corner
    /// is not dropped.
    pub fn contains(&self, key: Key) -> bool {
        key >= self.from && (self.to == !0 || key < self.to)
    }
}

impl PartialEq for Splitter {
    fn eq(&self, other: &Self) -> bool {
        self.from == other.from
    }
}

impl Eq for Splitter {}

impl Ord for Splitter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.from.cmp(&other.from)
    }
}

impl PartialOrd for Splitter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Index of the splitter owning a full-width particle key. Splitters
/// must be sorted and cover the key space.
pub fn owner_of(splitters: &[Splitter], key: Key) -> usize {
    debug_assert!(!splitters.is_empty());
    let idx = splitters.partition_point(|s| s.from <= key);
    debug_assert!(idx > 0, "key below the first splitter");
    idx - 1
}

/// Index of the splitter whose `tp_key` is a prefix of the given
/// truncated path key, if the key lies at or below partition
/// granularity.
pub fn owner_of_subtree(splitters: &[Splitter], key: Key) -> Option<usize> {
    let full = remove_leading_zeros(key);
    let idx = owner_of(splitters, full);
    if is_prefix(splitters[idx].tp_key, key) {
        Some(idx)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Vec<Splitter> {
        // Depth-1 split of the key space into the eight root octants.
        let mut splitters: Vec<Splitter> = (0..8)
            .map(|c| {
                let from = 0o10 + c;
                let to = if c == 7 { !0 } else { 0o10 + c + 1 };
                Splitter::new(from, to, 0)
            })
            .collect();
        splitters.sort();
        splitters
    }

    #[test]
    fn test_bounds_are_normalized() {
        let splitters = fixture();

        assert_eq!(splitters[0].from, remove_leading_zeros(0o10));
        assert_eq!(splitters[0].to, remove_leading_zeros(0o11));
        assert_eq!(splitters[7].to, !0);
        assert_eq!(splitters[3].tp_key, 0o13);

        // Contiguous cover: each range starts where the previous ended.
        for pair in splitters.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
    }

    #[test]
    fn test_owner_lookup() {
        let splitters = fixture();

        assert_eq!(owner_of(&splitters, remove_leading_zeros(0o10)), 0);
        assert_eq!(owner_of(&splitters, remove_leading_zeros(0o14321)), 4);
        // The far corner belongs to the closed top range.
        assert_eq!(owner_of(&splitters, !0), 7);

        assert_eq!(owner_of_subtree(&splitters, 0o152), Some(5));
        assert_eq!(owner_of_subtree(&splitters, 0o15), Some(5));
        // The root is above partition granularity.
        assert_eq!(owner_of_subtree(&splitters, 1), None);
    }
}
