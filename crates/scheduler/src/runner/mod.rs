//! The scheduler front end.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructors, lock handling and accessors
//! - `api`: calls made by workers and the transport layer
//! - `maintenance`: pruning, snapshots and the background sweeper

mod api;
mod core;
mod maintenance;
#[cfg(test)]
mod tests;

pub use self::core::Scheduler;
