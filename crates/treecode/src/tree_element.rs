//! Key-addressed aggregation endpoints for the global top tree.
//!
//! One element exists per boundary-chain key. A tree piece posts its
//! whole local aggregate at its `tp_key` (one contribution); interior
//! elements collect one contribution per child octant (eight). A
//! completed element pushes its total one level up and records it for
//! the driver's starter pack.

use crate::node::CentroidData;

/// What the caller must do after feeding a contribution in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TeAction {
    /// Contributions outstanding; nothing to send.
    Pending,
    /// The element completed with this total: publish it to the parent
    /// element and to the driver.
    Complete(CentroidData),
}

#[derive(Clone, Debug)]
pub struct TreeElement {
    data: CentroidData,
    /// Outstanding contributions; `-1` until the first one arrives.
    wait_count: i32,
    /// Tree piece that first reported here, `-1` for aggregator-fed
    /// elements. Kept so a fetch for this key can name its owner.
    tp_index: i64,
}

impl Default for TreeElement {
    fn default() -> Self {
        TreeElement {
            data: CentroidData::default(),
            wait_count: -1,
            tp_index: -1,
        }
    }
}

impl TreeElement {
    /// Fold in a contribution. `tp_index >= 0` marks a tree piece
    /// posting at its own key, which is the element's only
    /// contribution; aggregator-side posts arrive once per child
    /// octant.
    pub fn receive_data(&mut self, data: CentroidData, tp_index: i64) -> TeAction {
        if self.wait_count < 0 {
            self.wait_count = if tp_index >= 0 { 1 } else { 8 };
        }
        if tp_index >= 0 && self.tp_index < 0 {
            self.tp_index = tp_index;
        }
        self.data += data;
        self.wait_count -= 1;
        if self.wait_count == 0 {
            TeAction::Complete(self.data)
        } else {
            TeAction::Pending
        }
    }

    /// Serve the aggregate to a requesting cache; `None` while
    /// contributions are still outstanding.
    pub fn request_data(&self) -> Option<CentroidData> {
        (self.wait_count == 0).then_some(self.data)
    }

    pub fn tp_index(&self) -> i64 {
        self.tp_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CentroidData;
    use crate::types::point::Particle;
    use crate::types::vector::Vec3;

    fn contribution(x: f64, mass: f64) -> CentroidData {
        CentroidData::from_particles(&[Particle {
            position: Vec3::new(x, 0.0, 0.0),
            mass,
            ..Particle::default()
        }])
    }

    #[test]
    fn test_tree_piece_contribution_completes_immediately() {
        let mut te = TreeElement::default();
        assert_eq!(te.request_data(), None);

        let action = te.receive_data(contribution(1.0, 2.0), 4);
        match action {
            TeAction::Complete(total) => {
                assert_eq!(total.total_mass, 2.0);
                assert_eq!(total.count, 1);
            }
            TeAction::Pending => panic!("tp-key element should need one contribution"),
        }
        assert_eq!(te.tp_index(), 4);
        assert!(te.request_data().is_some());
    }

    #[test]
    fn test_aggregator_side_waits_for_eight() {
        let mut te = TreeElement::default();

        for octant in 0..7 {
            assert_eq!(
                te.receive_data(contribution(octant as f64, 1.0), -1),
                TeAction::Pending
            );
        }
        match te.receive_data(contribution(7.0, 1.0), -1) {
            TeAction::Complete(total) => {
                assert_eq!(total.count, 8);
                assert_eq!(total.total_mass, 8.0);
            }
            TeAction::Pending => panic!("eighth contribution should complete"),
        }
    }
}
