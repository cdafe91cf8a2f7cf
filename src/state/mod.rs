//! Pure state logic over cascade trees.
//!
//! This module contains the functional core the maintainer builds on: an
//! arena view of one tree's persisted operations and the rules for
//! aggregating failures upward. No I/O happens here.

pub mod aggregate;
pub mod tree;

pub use aggregate::{first_child_failure, merged_child_failures, own_failure};
pub use tree::{CascadeTree, TreeError};
