//! Delivery worker pool with penalty-driven retry.
//!
//! A [`WorkerTeam`] pulls jobs from a shared queue and runs them on a fixed
//! set of workers. A failed job is handed to the team's penalty function,
//! which decides whether and when it goes back on the queue.

mod context;
mod policy;
mod team;

pub use context::dedicated_context;
pub use policy::{PenaltyInfo, RetryPolicy};
pub use team::{
    JobContext, JobError, JobEvent, JobFailure, JobOutcome, TeamLayout, TeamState, WorkerTeam,
};
