//! Broker Cascade - cascading deletion for a service-broker control plane.
//!
//! Deleting a tenant, platform, service broker or service instance deletes
//! everything that depends on it. The [`cascade`] module stores the whole
//! deletion as a tree of operations; the [`maintainer`] executes that tree
//! bottom-up against the [`store`] and the service [`broker`]s, aggregates
//! failures to the root, and cleans up finished trees.

pub mod broker;
pub mod cascade;
pub mod config;
pub mod maintainer;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_utils;
