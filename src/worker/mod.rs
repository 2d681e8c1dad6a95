//! Worker tasks that replicate and execute jobs.
//!
//! # Components
//!
//! - [`pool`]: fixed set of worker tasks pulling job ids from the registry
//! - [`JobWorker`]: drives a single job through its phases
//! - [`JobExecutor`]: runs a job's executable in its directory
//! - [`PeerRotation`](retry::PeerRotation): which peer to ask next
//! - [`IdleAdvertiser`](idle::IdleAdvertiser): rate limits `idle` announcements
//!
//! # Worker Loop
//!
//! 1. Sleep a random startup jitter
//! 2. Claim an unfinished job, or announce `idle` and poll again
//! 3. Withdraw `idle` when the last free slot was just taken
//! 4. Run the job and mark it finished, whatever the outcome

pub mod executor;
pub mod idle;
pub mod orchestrator;
pub mod pool;
pub mod retry;

pub use executor::JobExecutor;
pub use orchestrator::JobWorker;
pub use pool::spawn_workers;
