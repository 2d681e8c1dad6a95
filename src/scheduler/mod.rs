//! Job registry and work queue.
//!
//! The [`JobRegistry`] owns every [`Job`](crate::job::Job) this node knows
//! about. Worker tasks pull job ids from it with
//! [`JobRegistry::claim_unfinished`] and hand them back with
//! [`JobRegistry::mark_finished`].

pub mod queue;
pub mod registry;

pub use queue::WorkQueue;
pub use registry::JobRegistry;
