//! Distributed parallel octree code for N-body and SPH particle interactions.
//!
//! The crate builds a spatial octree partitioned across a set of workers
//! ("tree pieces"), each owning one contiguous Morton key range. Per
//! iteration it decomposes the particle set with a histogram splitter
//! search, builds local trees, aggregates centroids upward through
//! key-addressed tree elements, runs visitor-driven downward traversals
//! against local subtrees and a per-worker cache of remote nodes, and
//! finally advances particles with the accumulated forces.
//!
//! Workers are message-driven objects: each processes one message at a
//! time, all cross-worker interaction is asynchronous, and quiescence
//! (no messages in flight) is the barrier between phases.

pub mod cache;
pub mod config;
pub mod constants;
pub mod count;
pub mod data;
pub mod driver;
pub mod error;
pub mod node;
pub mod reader;
pub mod resumer;
pub mod runtime;
pub mod tree_element;
pub mod treepiece;
pub mod types;
pub mod visitors;

pub use config::Config;
pub use driver::Driver;
pub use error::TreecodeError;
