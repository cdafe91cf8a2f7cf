//! Cascade creation.
//!
//! Deleting a tenant, platform or broker must delete everything that depends
//! on it. This module turns one root deletion into a persisted tree of
//! operations:
//!
//! - [`resolver`] discovers the children of a resource through selection
//!   criteria
//! - [`builder`] validates the root, expands the tree, marks duplicates and
//!   inserts it atomically
//!
//! Nothing here executes a deletion; the maintainer drives the stored tree.

pub mod builder;
pub mod resolver;

pub use builder::{BuildError, BuildOutcome, CascadeOptions, TreeBuilder};
pub use resolver::{
    CascadeResource, ChildSelectors, Children, ResolveError, ResolverContext, children_of,
    resolve_children,
};
