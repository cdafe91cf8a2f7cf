//! Asynchronous execution of stored cascade trees.
//!
//! The maintainer owns everything that happens after a tree is stored:
//!
//! - Operations are executed bottom-up. A parent starts only after all of
//!   its children are settled.
//! - Broker deletions that are accepted asynchronously are polled until the
//!   broker reports an outcome.
//! - Failures are classified as transient (retried), ambiguous (orphan
//!   mitigation) or permanent (settled as FAILED and aggregated upward).
//! - Duplicates mirror their primary operation.
//! - Finished trees are cleaned up after their lifespan by the [`reaper`].
//!
//! # Module Structure
//!
//! - [`actions`]: per-kind deletion actions and broker error handling
//! - [`poll`]: timestamp arithmetic for retries, polls and deadlines
//! - [`reaper`]: retention of finished trees

pub mod actions;
mod maintainer;
pub mod poll;
pub mod reaper;

pub use actions::{ActionOutcome, ActionRunner, FailureKind};
pub use maintainer::{Maintainer, MaintainerError, PassReport};
pub use reaper::{CleanupReport, Reaper};

#[cfg(test)]
mod tests;
