//! Resumption dispatch for traversals blocked on remote keys.
//!
//! Kept apart from the cache so batching, prioritisation or migrating
//! a blocked traversal to where its data landed can be added without
//! touching the fetch path.

use std::collections::HashMap;
use std::collections::HashSet;

use crate::types::morton::Key;

#[derive(Debug, Default)]
pub struct Resumer {
    blocked: HashMap<Key, HashSet<usize>>,
    pub resumptions: u64,
}

impl Resumer {
    /// Note that a tree piece suspended a traversal on a key.
    pub fn note_blocked(&mut self, key: Key, tp: usize) {
        self.blocked.entry(key).or_default().insert(tp);
    }

    /// A key resolved: hand back the pieces to re-enter, each exactly
    /// once per resolution.
    pub fn resolve(&mut self, key: Key, waiters: Vec<usize>) -> Vec<usize> {
        let mut recorded = self.blocked.remove(&key).unwrap_or_default();
        for &tp in &waiters {
            debug_assert!(
                recorded.remove(&tp),
                "resuming a traversal that never blocked"
            );
        }
        self.resumptions += waiters.len() as u64;
        waiters
    }

    /// Forget all suspension records between iterations.
    pub fn destroy(&mut self) {
        self.blocked.clear();
    }

    pub fn take_resumptions(&mut self) -> u64 {
        std::mem::take(&mut self.resumptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_waiter_resumed_once() {
        let mut resumer = Resumer::default();
        resumer.note_blocked(0o14, 2);
        resumer.note_blocked(0o14, 7);
        resumer.note_blocked(0o15, 2);

        let resumed = resumer.resolve(0o14, vec![2, 7]);
        assert_eq!(resumed, vec![2, 7]);
        assert_eq!(resumer.resumptions, 2);

        // The record for the other key is untouched.
        let resumed = resumer.resolve(0o15, vec![2]);
        assert_eq!(resumed, vec![2]);
    }
}
